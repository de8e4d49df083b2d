//! GitHub REST v3 implementation of [`VcsClient`].

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::vcs::{RepoInfo, VcsClient};
use crate::config::{GithubConfig, Secret};
use crate::errors::{ProvisionError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const ACCEPT_JSON: &str = "application/vnd.github+json";
const ACCEPT_RAW: &str = "application/vnd.github.raw+json";
const API_VERSION: &str = "2022-11-28";

/// Known GitHub token prefixes.
const GITHUB_TOKEN_PREFIXES: &[&str] = &["ghp_", "github_pat_", "gho_", "ghu_", "ghs_", "ghr_"];

/// Format check only; it does not verify the token is active.
pub fn is_valid_github_token(token: &str) -> bool {
    !token.is_empty()
        && GITHUB_TOKEN_PREFIXES
            .iter()
            .any(|prefix| token.starts_with(prefix))
}

#[derive(Debug, Deserialize)]
struct GitHubUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct GitHubRepo {
    name: String,
    owner: GitHubUser,
    html_url: String,
    clone_url: String,
    default_branch: String,
    #[serde(default)]
    fork: bool,
}

impl From<GitHubRepo> for RepoInfo {
    fn from(repo: GitHubRepo) -> Self {
        Self {
            owner: repo.owner.login,
            name: repo.name,
            html_url: repo.html_url,
            clone_url: repo.clone_url,
            default_branch: repo.default_branch,
            fork: repo.fork,
        }
    }
}

#[derive(Debug, Deserialize)]
struct GitRef {
    object: GitObject,
}

#[derive(Debug, Deserialize)]
struct GitObject {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct ContentEntry {
    name: String,
}

/// Translate a non-success status into the provisioning error taxonomy.
pub fn map_status(status: u16, body: &str, what: &str) -> ProvisionError {
    match status {
        401 => ProvisionError::Configuration(
            "GitHub rejected the token. Set GITHUB_TOKEN to a token with repo scope".to_string(),
        ),
        404 => ProvisionError::not_found(what),
        422 if body.to_lowercase().contains("already exists") => ProvisionError::conflict(what),
        429 | 500..=599 => ProvisionError::Transient(format!("GitHub returned {} for {}", status, what)),
        _ => ProvisionError::Remote {
            status,
            message: format!("{}: {}", what, truncate(body, 200)),
        },
    }
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        s
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        &s[..end]
    }
}

pub struct GitHubClient {
    client: reqwest::Client,
    api_url: String,
    user_agent: String,
    token: Secret,
}

impl GitHubClient {
    pub fn new(config: &GithubConfig, token: Secret) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ProvisionError::Configuration(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            user_agent: config.user_agent.clone(),
            token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_url, path)
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.request_accepting(method, path, ACCEPT_JSON)
    }

    fn request_accepting(
        &self,
        method: reqwest::Method,
        path: &str,
        accept: &str,
    ) -> reqwest::RequestBuilder {
        self.client
            .request(method, self.url(path))
            .header("Authorization", format!("Bearer {}", self.token.expose()))
            .header("User-Agent", &self.user_agent)
            .header("Accept", accept)
            .header("X-GitHub-Api-Version", API_VERSION)
    }

    async fn send(&self, builder: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), what, "GitHub request failed");
        Err(map_status(status.as_u16(), &body, what))
    }
}

#[async_trait]
impl VcsClient for GitHubClient {
    async fn authenticated_identity(&self) -> Result<String> {
        let user: GitHubUser = self
            .send(self.request(reqwest::Method::GET, "/user"), "authenticated user")
            .await?
            .json()
            .await?;
        Ok(user.login)
    }

    async fn get_repo(&self, owner: &str, repo: &str) -> Result<RepoInfo> {
        let what = format!("{}/{}", owner, repo);
        let repo: GitHubRepo = self
            .send(
                self.request(reqwest::Method::GET, &format!("/repos/{}/{}", owner, repo)),
                &what,
            )
            .await?
            .json()
            .await?;
        Ok(repo.into())
    }

    async fn create_fork(&self, owner: &str, repo: &str) -> Result<RepoInfo> {
        let what = format!("fork of {}/{}", owner, repo);
        let repo: GitHubRepo = self
            .send(
                self.request(reqwest::Method::POST, &format!("/repos/{}/{}/forks", owner, repo))
                    .json(&serde_json::json!({ "default_branch_only": false })),
                &what,
            )
            .await?
            .json()
            .await?;
        Ok(repo.into())
    }

    async fn get_branch_ref(&self, owner: &str, repo: &str, branch: &str) -> Result<String> {
        let what = format!("branch {} of {}/{}", branch, owner, repo);
        let git_ref: GitRef = self
            .send(
                self.request(
                    reqwest::Method::GET,
                    &format!("/repos/{}/{}/git/ref/heads/{}", owner, repo, branch),
                ),
                &what,
            )
            .await?
            .json()
            .await?;
        Ok(git_ref.object.sha)
    }

    async fn create_branch_ref(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        sha: &str,
    ) -> Result<()> {
        let what = format!("branch {} of {}/{}", branch, owner, repo);
        self.send(
            self.request(reqwest::Method::POST, &format!("/repos/{}/{}/git/refs", owner, repo))
                .json(&serde_json::json!({
                    "ref": format!("refs/heads/{}", branch),
                    "sha": sha,
                })),
            &what,
        )
        .await?;
        Ok(())
    }

    async fn list_root_files(&self, owner: &str, repo: &str, branch: &str) -> Result<Vec<String>> {
        let what = format!("contents of {}/{}", owner, repo);
        let entries: Vec<ContentEntry> = self
            .send(
                self.request(reqwest::Method::GET, &format!("/repos/{}/{}/contents", owner, repo))
                    .query(&[("ref", branch)]),
                &what,
            )
            .await?
            .json()
            .await?;
        Ok(entries.into_iter().map(|e| e.name).collect())
    }

    async fn read_file(
        &self,
        owner: &str,
        repo: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<String>> {
        let what = format!("{} in {}/{}", path, owner, repo);
        let result = self
            .send(
                self.request_accepting(
                    reqwest::Method::GET,
                    &format!("/repos/{}/{}/contents/{}", owner, repo, path),
                    ACCEPT_RAW,
                )
                .query(&[("ref", branch)]),
                &what,
            )
            .await;
        match result {
            Ok(resp) => Ok(Some(resp.text().await?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}
