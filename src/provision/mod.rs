//! Preview provisioning: VCS fork/branch, sandbox lifecycle, dev-server
//! bring-up, deployment, and the workflow that ties them together.
//!
//! | Module         | Purpose                                                    |
//! |----------------|------------------------------------------------------------|
//! | `vcs`          | `VcsClient` contract and repository types                  |
//! | `github`       | GitHub REST implementation of `VcsClient`                  |
//! | `sandbox`      | `RemoteSandbox` contract, sessions, `ensure_sandbox`       |
//! | `local`        | Directory + child process sandboxes                        |
//! | `docker`       | Container sandboxes (feature `docker`)                     |
//! | `classify`     | Package manager and start script detection                 |
//! | `bringup`      | Clone/install/start session and port detection             |
//! | `deploy`       | `DeploymentClient` contract and `SandboxDeployer`          |
//! | `registry`     | In-memory workflow run registry                            |
//! | `events`       | Progress event broadcast                                   |
//! | `orchestrator` | Fork-and-deploy state machine                              |

pub mod bringup;
pub mod classify;
pub mod deploy;
#[cfg(feature = "docker")]
pub mod docker;
pub mod events;
pub mod github;
pub mod local;
pub mod orchestrator;
pub mod registry;
pub mod sandbox;
pub mod vcs;

use std::sync::Arc;

pub use bringup::{BringUpOptions, BringUpOutcome, BringUpSession, bring_up};
pub use classify::{ManifestClassifier, PackageManager, ProjectClassifier, RuntimeHints};
pub use deploy::{DeployReceipt, DeployRequest, DeploymentClient, DeploymentStatus, SandboxDeployer};
pub use events::EventBus;
pub use github::GitHubClient;
pub use local::LocalSandbox;
pub use orchestrator::{Orchestrator, OrchestratorSettings, WorkflowOutcome, WorkflowRequest};
pub use registry::WorkflowRegistry;
pub use sandbox::{RemoteSandbox, RemoteSession, SandboxHandle, SandboxSpec, ensure_sandbox};
pub use vcs::{RepoInfo, VcsClient, parse_repo_slug};

use crate::config::{PreviewConfig, SandboxBackend};
use crate::errors::Result;

/// Build the sandbox backend selected in configuration.
pub fn sandbox_from_config(config: &PreviewConfig) -> Result<Arc<dyn RemoteSandbox>> {
    match config.toml.sandbox.backend {
        SandboxBackend::Local => Ok(Arc::new(LocalSandbox::new(config.sandbox_root()))),
        #[cfg(feature = "docker")]
        SandboxBackend::Docker => Ok(Arc::new(docker::DockerSandbox::connect()?)),
        #[cfg(not(feature = "docker"))]
        SandboxBackend::Docker => Err(crate::errors::ProvisionError::Configuration(
            "sandbox backend 'docker' requires building with --features docker".into(),
        )),
    }
}
