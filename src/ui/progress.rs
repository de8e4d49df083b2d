use crate::ui::icons::{BRANCH, CHECK, CLOCK, CROSS, FORK, LINK, ROCKET, SKIP, SPARKLE, WARN};
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use preview_common::{ReadyState, StepStatus, WorkflowEvent, WorkflowStep};
use std::time::Duration;

/// Terminal UI for one workflow run, driven by [`WorkflowEvent`]s.
///
/// Two bars are stacked vertically:
/// - Progress bar: the run's `progress` percentage and current step
/// - Step spinner: live detail for the current step (poll attempt, app name)
pub struct WorkflowUI {
    multi: MultiProgress,
    progress_bar: ProgressBar,
    step_bar: ProgressBar,
    verbose: bool,
}

/// Short label shown next to the progress bar.
pub fn step_label(step: WorkflowStep) -> &'static str {
    match step {
        WorkflowStep::Initialize => "Preparing",
        WorkflowStep::ForkStart => "Forking",
        WorkflowStep::ForkComplete => "Forked",
        WorkflowStep::BranchCreate => "Branching",
        WorkflowStep::BranchReady => "Branch ready",
        WorkflowStep::DeployStart => "Deploying",
        WorkflowStep::DeploySubmitted => "Submitted",
        WorkflowStep::Polling => "Starting dev server",
        WorkflowStep::Deployed => "Deployed",
        WorkflowStep::Error => "Failed",
    }
}

/// Standalone spinner for single long-running operations.
pub fn spinner(prefix: &str, message: impl Into<String>) -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg} {elapsed:.dim}")
            .expect("progress bar template is a valid static string"),
    );
    bar.set_prefix(prefix.to_string());
    bar.set_message(message.into());
    bar.enable_steady_tick(Duration::from_millis(100));
    bar
}

impl WorkflowUI {
    pub fn new(verbose: bool) -> Self {
        let multi = MultiProgress::new();

        let progress_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");

        let progress_bar = multi.add(ProgressBar::new(100));
        progress_bar.set_style(progress_style);
        progress_bar.set_prefix("Preview");

        let step_style = ProgressStyle::default_spinner()
            .template("{prefix:.bold.dim} {spinner} {msg}")
            .expect("progress bar template is a valid static string");

        let step_bar = multi.add(ProgressBar::new_spinner());
        step_bar.set_style(step_style);
        step_bar.set_prefix("   Step");
        step_bar.enable_steady_tick(Duration::from_millis(100));

        Self {
            multi,
            progress_bar,
            step_bar,
            verbose,
        }
    }

    /// Print a line above the bars, falling back to `eprintln!` if the rich
    /// UI fails.
    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    pub fn handle_event(&self, event: &WorkflowEvent) {
        self.progress_bar.set_position(u64::from(event.progress));
        self.progress_bar
            .set_message(style(step_label(event.step)).yellow().to_string());

        match (event.step, event.status) {
            (WorkflowStep::Error, _) | (_, StepStatus::Error) => {
                self.step_bar.finish_and_clear();
                self.progress_bar.abandon();
                self.print_line(format!("{} {}", CROSS, style(&event.message).red()));
                if let Some(hint) = event.details.get("hint").and_then(|h| h.as_str()) {
                    self.print_line(format!("   {}", style(hint).dim()));
                }
            }
            (WorkflowStep::Deployed, _) => self.finish_deployed(event),
            (_, StepStatus::Skipped) => {
                self.print_line(format!("{} {}", SKIP, style(&event.message).dim()));
            }
            (step, StepStatus::Completed) => {
                let icon = match step {
                    WorkflowStep::ForkComplete => &FORK,
                    WorkflowStep::BranchReady => &BRANCH,
                    WorkflowStep::DeploySubmitted => &ROCKET,
                    _ => &CHECK,
                };
                self.print_line(format!("{} {}", icon, event.message));
            }
            (WorkflowStep::Polling, _) => {
                self.step_bar
                    .set_message(format!("{} {}", CLOCK, style(&event.message).dim()));
            }
            (_, StepStatus::InProgress) => {
                self.step_bar.set_message(event.message.clone());
                if self.verbose {
                    self.print_line(format!("    {} {}", style("→").dim(), style(&event.message).dim()));
                }
            }
        }
    }

    fn finish_deployed(&self, event: &WorkflowEvent) {
        self.step_bar.finish_and_clear();
        self.progress_bar.finish();

        let assumed = event
            .details
            .get("readyState")
            .and_then(|v| serde_json::from_value::<ReadyState>(v.clone()).ok())
            == Some(ReadyState::Assumed);
        let icon = if assumed { &WARN } else { &SPARKLE };
        self.print_line(format!("\n{} {}", icon, style(&event.message).green().bold()));
        if let Some(url) = event.details.get("previewUrl").and_then(|u| u.as_str()) {
            self.print_line(format!("{} {}", LINK, style(url).cyan().underlined()));
        }
        if let Some(port) = event.details.get("port").and_then(|p| p.as_u64()) {
            self.print_line(format!("   dev server port {}", style(port).cyan()));
        }
    }

    /// Clear the bars without a final message (e.g. on Ctrl-C).
    pub fn abandon(&self) {
        self.step_bar.finish_and_clear();
        self.progress_bar.abandon();
    }
}
