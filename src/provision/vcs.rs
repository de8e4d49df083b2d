use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::Result;

/// A repository as seen by the VCS provider (subset of fields we care about).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoInfo {
    pub owner: String,
    pub name: String,
    pub html_url: String,
    pub clone_url: String,
    pub default_branch: String,
    #[serde(default)]
    pub fork: bool,
}

impl RepoInfo {
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// VCS provider operations used by the orchestrator.
///
/// Lookups report absence as `ProvisionError::NotFound`; ref creation reports
/// an existing ref as `ProvisionError::Conflict`.
#[async_trait]
pub trait VcsClient: Send + Sync {
    /// Login of the identity owning the token.
    async fn authenticated_identity(&self) -> Result<String>;

    async fn get_repo(&self, owner: &str, repo: &str) -> Result<RepoInfo>;

    /// Request a fork under the authenticated identity. The fork may not be
    /// queryable for a few seconds after this returns.
    async fn create_fork(&self, owner: &str, repo: &str) -> Result<RepoInfo>;

    /// Commit SHA at the head of `branch`.
    async fn get_branch_ref(&self, owner: &str, repo: &str, branch: &str) -> Result<String>;

    async fn create_branch_ref(&self, owner: &str, repo: &str, branch: &str, sha: &str)
    -> Result<()>;

    /// File names at the repository root on `branch`.
    async fn list_root_files(&self, owner: &str, repo: &str, branch: &str) -> Result<Vec<String>>;

    /// Contents of `path` on `branch`, `None` when absent.
    async fn read_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>>;
}

/// Split `owner/repo` (an optional `.git` suffix is ignored).
pub fn parse_repo_slug(slug: &str) -> Option<(String, String)> {
    let slug = slug.trim().trim_end_matches('/');
    let slug = slug.strip_suffix(".git").unwrap_or(slug);
    let (owner, repo) = slug.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}
