//! Standalone dev-server bring-up (`preview bring-up`).

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use preview::config::PreviewConfig;
use preview::errors::ProvisionError;
use preview::naming::{derive_app_name, slugify};
use preview::provision::{self, BringUpOptions, RuntimeHints, SandboxSpec, bring_up, ensure_sandbox};
use preview::retry::RetryPolicy;
use preview::ui::icons::{CHECK, CROSS, LINK};
use preview::ui::spinner;

use crate::Cli;

pub struct BringUpArgs {
    pub repo_url: String,
    pub branch: String,
    pub script: Option<String>,
    pub package_manager: Option<String>,
    pub timeout_secs: Option<u64>,
    pub name: Option<String>,
    pub keep_sandbox: bool,
}

pub async fn cmd_bring_up(cli: &Cli, project_dir: &Path, args: BringUpArgs) -> Result<()> {
    let config = PreviewConfig::with_cli_args(project_dir.to_path_buf(), cli.verbose, None)?;
    let naming = &config.toml.naming;

    let name = match &args.name {
        Some(name) => slugify(name, naming.max_len),
        None => derive_app_name(&naming.prefix, naming.max_len, "local", &args.repo_url, None),
    };
    if name.is_empty() {
        bail!("Sandbox name '{}' has no usable characters", args.name.unwrap_or_default());
    }

    let mut hints = RuntimeHints::default();
    if let Some(pm) = &args.package_manager {
        hints.package_manager = pm.parse()?;
    }
    if let Some(script) = &args.script {
        hints.start_script = script.clone();
    }
    let mut options = BringUpOptions::from_config(&config.toml.bringup, &hints);
    if let Some(secs) = args.timeout_secs {
        options.timeout = std::time::Duration::from_secs(secs);
    }
    options.vcs_token = config.github_token().cloned();
    options.env = config.toml.sandbox.env.clone();

    let sandbox = provision::sandbox_from_config(&config)?;
    let spec = SandboxSpec::from_config(&name, &config.toml.sandbox.default_region, &config.toml.sandbox);
    let cancel = CancellationToken::new();

    let bar = spinner("Sandbox", format!("Preparing {}", name));
    let handle = ensure_sandbox(sandbox.as_ref(), &spec, &RetryPolicy::from(&config.toml.retry), &cancel).await;
    let handle = match handle {
        Ok(handle) => handle,
        Err(e) => {
            bar.abandon_with_message(format!("{} {}", CROSS, e));
            return Err(e.into());
        }
    };

    bar.set_prefix("Bring-up");
    bar.set_message(format!(
        "Cloning {} and running {}",
        args.repo_url,
        style(options.package_manager.run_command(&options.script_name)).bold()
    ));

    let outcome = tokio::select! {
        result = bring_up(sandbox.as_ref(), &handle, &args.repo_url, &args.branch, &options, &cancel) => result,
        _ = tokio::signal::ctrl_c() => {
            cancel.cancel();
            Err(ProvisionError::Cancelled("interrupted".into()))
        }
    };

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            bar.abandon_with_message(format!("{} {}", CROSS, style("Bring-up failed").red()));
            report_failure(&e);
            if !args.keep_sandbox {
                sandbox.destroy(&name).await?;
            }
            return Err(e.into());
        }
    };

    bar.finish_with_message(format!(
        "{} Dev server listening on port {} after {:.1}s",
        CHECK,
        style(outcome.port).cyan(),
        outcome.elapsed.as_secs_f64()
    ));
    println!(
        "{} {}",
        LINK,
        style(config.toml.sandbox.preview_url(&name, &config.toml.sandbox.default_region)).cyan().underlined()
    );
    println!("   matched: {}", style(outcome.matched.matched_text.trim()).dim());
    println!("{}", style("Press Ctrl-C to stop.").dim());

    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    outcome.session.kill();
    if !args.keep_sandbox {
        sandbox.destroy(&name).await?;
    }
    println!("{} Stopped {}", CHECK, style(&name).bold());
    Ok(())
}

fn report_failure(err: &ProvisionError) {
    eprintln!("{} {}", CROSS, style(err).red());
    if let ProvisionError::RemoteExecution {
        diagnostics: Some(tail),
        ..
    } = err
    {
        eprintln!("\n{}", style("Recent output:").bold());
        for line in tail.lines() {
            eprintln!("  {}", style(line).dim());
        }
    }
    if let Some(hint) = err.hint() {
        eprintln!("   {}", style(hint).dim());
    }
}
