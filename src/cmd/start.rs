//! Fork-and-deploy workflow (`preview start`).

use anyhow::{Context, Result, bail};
use console::style;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use preview::config::PreviewConfig;
use preview::provision::github::is_valid_github_token;
use preview::provision::{
    self, GitHubClient, Orchestrator, OrchestratorSettings, SandboxDeployer, VcsClient,
    WorkflowRequest, parse_repo_slug,
};
use preview::retry::RetryPolicy;
use preview::ui::WorkflowUI;
use preview::ui::icons::{CHECK, WARN};
use preview_common::TerminalState;

use crate::Cli;

pub struct StartArgs {
    pub repo: String,
    pub branch: Option<String>,
    pub region: Option<String>,
    pub token: Option<String>,
    pub user: Option<String>,
    pub detach: bool,
}

pub async fn cmd_start(cli: &Cli, project_dir: &Path, args: StartArgs) -> Result<()> {
    let (source_owner, source_repo) = parse_repo_slug(&args.repo)
        .with_context(|| format!("Invalid repository '{}': expected owner/repo", args.repo))?;

    let config = PreviewConfig::with_cli_args(project_dir.to_path_buf(), cli.verbose, args.token)?;
    for warning in config.validate() {
        eprintln!("{} {}", WARN, style(warning).yellow());
    }
    let Some(token) = config.github_token().cloned() else {
        bail!("A GitHub token is required: set GITHUB_TOKEN or pass --token");
    };
    if !is_valid_github_token(token.expose()) {
        eprintln!("{} {}", WARN, style("GitHub token has an unrecognized format").yellow());
    }

    let vcs = Arc::new(GitHubClient::new(&config.toml.github, token.clone())?);
    let user_id = match args.user {
        Some(user) => user,
        None => vcs
            .authenticated_identity()
            .await
            .context("Failed to resolve the GitHub login; pass --user to skip")?,
    };

    let sandbox = provision::sandbox_from_config(&config)?;
    let deployer = Arc::new(SandboxDeployer::new(
        sandbox,
        config.toml.sandbox.clone(),
        config.toml.bringup.clone(),
        RetryPolicy::from(&config.toml.retry),
    ));
    let orchestrator = Orchestrator::new(vcs, deployer, OrchestratorSettings::from_config(&config.toml));

    let mut events = orchestrator.subscribe();
    let workflow_id = orchestrator
        .spawn_workflow(WorkflowRequest {
            user_id,
            source_owner,
            source_repo,
            branch: args.branch,
            region: args.region,
            vcs_token: Some(token),
        })
        .await;
    tracing::info!(workflow_id = %workflow_id, "Workflow started");

    let ui = WorkflowUI::new(cli.verbose);
    let mut interrupted = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c(), if !interrupted => {
                interrupted = true;
                orchestrator.cancel_workflow(&workflow_id).await;
            }
            event = events.recv() => match event {
                Ok(event) if event.workflow_id == workflow_id => {
                    ui.handle_event(&event);
                    if event.is_terminal() {
                        break;
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress display fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    }

    let Some(run) = orchestrator.get_workflow_status(&workflow_id).await else {
        bail!("workflow {} is no longer tracked", workflow_id);
    };
    if run.terminal_state != TerminalState::Succeeded {
        ui.abandon();
        if let Some(deployment) = &run.deployment
            && let Err(e) = orchestrator.teardown(&deployment.app_name).await
        {
            tracing::warn!(app_name = %deployment.app_name, error = %e, "Cleanup after failure failed");
        }
        bail!(
            "{}",
            run.last_error.unwrap_or_else(|| "workflow did not complete".to_string())
        );
    }
    let Some(deployment) = run.deployment else {
        bail!("workflow finished without a deployment");
    };

    if args.detach {
        println!(
            "{} Detached. Remove it later with {}",
            CHECK,
            style(format!("preview teardown {}", deployment.app_name)).bold()
        );
        return Ok(());
    }

    println!("{}", style("Serving preview. Press Ctrl-C to stop.").dim());
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    orchestrator.teardown(&deployment.app_name).await?;
    println!("{} Stopped {}", CHECK, style(&deployment.app_name).bold());
    Ok(())
}
