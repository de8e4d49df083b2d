use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod cmd;

const DEFAULT_LOG_FILTER: &str = "preview=info";

#[derive(Parser)]
#[command(name = "preview")]
#[command(version, about = "Provision live preview environments for GitHub repositories")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Write logs to `<dir>/preview.log` instead of stderr
    #[arg(long, global = true, env = "PREVIEW_LOG_DIR")]
    pub log_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Fork a repository, deploy it to a sandbox, and wait for its dev server
    Start {
        /// Source repository as owner/repo
        repo: String,

        /// Branch to deploy (defaults to the fork's default branch)
        #[arg(short, long)]
        branch: Option<String>,

        #[arg(long)]
        region: Option<String>,

        /// GitHub token (overrides GITHUB_TOKEN)
        #[arg(long)]
        token: Option<String>,

        /// User id used for app naming (defaults to the GitHub login)
        #[arg(long)]
        user: Option<String>,

        /// Exit once deployed instead of serving until Ctrl-C
        #[arg(long)]
        detach: bool,
    },
    /// Clone a repository into a sandbox and start its dev server
    BringUp {
        /// Clone URL of the repository
        repo_url: String,

        #[arg(short, long, default_value = "main")]
        branch: String,

        /// Package.json script to run
        #[arg(short, long)]
        script: Option<String>,

        /// npm, pnpm, yarn or bun
        #[arg(long)]
        package_manager: Option<String>,

        #[arg(long)]
        timeout_secs: Option<u64>,

        /// Sandbox name (derived from the URL when omitted)
        #[arg(long)]
        name: Option<String>,

        /// Leave the sandbox in place after Ctrl-C
        #[arg(long)]
        keep_sandbox: bool,
    },
    /// Print the app name derived for a user and project
    Name {
        user: String,
        /// Project key, e.g. owner/repo or owner/repo@branch
        project: String,

        /// Salt with the current time for a one-off name
        #[arg(long)]
        fresh: bool,
    },
    /// Destroy a preview's sandbox
    Teardown { app: String },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default preview.toml file
    Init,
}

/// Install the global subscriber. The returned guard flushes file logs and
/// must live until exit.
fn init_tracing(
    verbose: bool,
    json: bool,
    log_dir: Option<&Path>,
) -> Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let default = if verbose { "preview=debug" } else { DEFAULT_LOG_FILTER };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    let Some(dir) = log_dir else {
        if json {
            builder.json().with_writer(std::io::stderr).init();
        } else {
            builder.with_writer(std::io::stderr).init();
        }
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let file_appender = tracing_appender::rolling::never(dir, "preview.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
    if json {
        builder.json().with_writer(non_blocking).with_ansi(false).init();
    } else {
        builder.with_writer(non_blocking).with_ansi(false).init();
    }
    Ok(Some(guard))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _guard = init_tracing(cli.verbose, cli.log_json, cli.log_dir.as_deref())?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Start {
            repo,
            branch,
            region,
            token,
            user,
            detach,
        } => {
            cmd::cmd_start(
                &cli,
                &project_dir,
                cmd::StartArgs {
                    repo: repo.clone(),
                    branch: branch.clone(),
                    region: region.clone(),
                    token: token.clone(),
                    user: user.clone(),
                    detach: *detach,
                },
            )
            .await?
        }
        Commands::BringUp {
            repo_url,
            branch,
            script,
            package_manager,
            timeout_secs,
            name,
            keep_sandbox,
        } => {
            cmd::cmd_bring_up(
                &cli,
                &project_dir,
                cmd::BringUpArgs {
                    repo_url: repo_url.clone(),
                    branch: branch.clone(),
                    script: script.clone(),
                    package_manager: package_manager.clone(),
                    timeout_secs: *timeout_secs,
                    name: name.clone(),
                    keep_sandbox: *keep_sandbox,
                },
            )
            .await?
        }
        Commands::Name { user, project, fresh } => cmd::cmd_name(&project_dir, user, project, *fresh)?,
        Commands::Teardown { app } => cmd::cmd_teardown(&project_dir, app).await?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
