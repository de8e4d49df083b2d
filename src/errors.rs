//! Typed error taxonomy for preview provisioning.
//!
//! `ProvisionError` is returned by every collaborator trait and by the
//! orchestrator. `ErrorKind` is the coarse classification used by the retry
//! policy and by user-facing hints.

use std::time::Duration;

use thiserror::Error;

/// Errors from provisioning sub-operations and the workflow itself.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// Missing credentials or an unconfigured platform.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("{what} not found")]
    NotFound { what: String },

    /// The resource already exists. Callers creating idempotently treat this
    /// as success.
    #[error("{what} already exists")]
    Conflict { what: String },

    /// Network or timeout class failure that may succeed on retry.
    #[error("Transient failure: {0}")]
    Transient(String),

    /// The remote process exited or misbehaved before a port was found.
    #[error("{message}")]
    RemoteExecution {
        message: String,
        exit_code: Option<i32>,
        diagnostics: Option<String>,
    },

    #[error("Timed out after {}s: {message}", .elapsed.as_secs())]
    Timeout { elapsed: Duration, message: String },

    #[error("Cancelled: {0}")]
    Cancelled(String),

    /// Non-transient provider failure.
    #[error("Remote API error ({status}): {message}")]
    Remote { status: u16, message: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Configuration,
    NotFound,
    Conflict,
    Transient,
    RemoteExecution,
    Timeout,
    Cancelled,
    Remote,
    Other,
}

impl ProvisionError {
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn conflict(what: impl Into<String>) -> Self {
        Self::Conflict { what: what.into() }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Configuration(_) => ErrorKind::Configuration,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Conflict { .. } => ErrorKind::Conflict,
            Self::Transient(_) => ErrorKind::Transient,
            Self::RemoteExecution { .. } => ErrorKind::RemoteExecution,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Cancelled(_) => ErrorKind::Cancelled,
            Self::Remote { .. } => ErrorKind::Remote,
            Self::Other(_) => ErrorKind::Other,
        }
    }

    pub fn is_conflict(&self) -> bool {
        self.kind() == ErrorKind::Conflict
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Short suggestion shown to users alongside the error message.
    pub fn hint(&self) -> Option<&'static str> {
        match self.kind() {
            ErrorKind::Configuration => Some("Check credentials and the [sandbox] section of .preview/preview.toml"),
            ErrorKind::NotFound => Some("Check the repository owner, name and branch"),
            ErrorKind::Transient => Some("The provider was unreachable; try again shortly"),
            ErrorKind::RemoteExecution => Some("Check the repository's dependencies and start script"),
            ErrorKind::Timeout => Some("Try a longer-running configuration (bringup.timeout_secs)"),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ProvisionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() || err.is_request() {
            return Self::Transient(err.to_string());
        }
        match err.status() {
            Some(status) if status.is_server_error() => Self::Transient(err.to_string()),
            Some(status) if status.as_u16() == 404 => Self::NotFound {
                what: err.url().map(|u| u.path().to_string()).unwrap_or_else(|| "resource".into()),
            },
            Some(status) => Self::Remote {
                status: status.as_u16(),
                message: err.to_string(),
            },
            None => Self::Other(err.into()),
        }
    }
}

pub type Result<T, E = ProvisionError> = std::result::Result<T, E>;
