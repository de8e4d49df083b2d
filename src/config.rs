//! Layered configuration for preview provisioning.
//!
//! Settings are read from `.preview/preview.toml`, then overridden by
//! environment variables (a project `.env` is loaded first through
//! `dotenvy`), then by CLI flags.
//!
//! ```toml
//! [github]
//! api_url = "https://api.github.com"
//!
//! [naming]
//! prefix = "preview"
//! max_len = 63
//!
//! [orchestrator]
//! fork_poll_attempts = 10
//! fork_poll_delay_ms = 2000
//! status_poll_interval_secs = 5
//! status_poll_max_attempts = 120
//! total_deadline_secs = 1200
//! retention_secs = 3600
//! fresh_names = false
//!
//! [bringup]
//! timeout_secs = 300
//! working_directory = "/workspace"
//! tail_lines = 50
//! port_patterns = ['listening on port (\d+)']
//!
//! [retry]
//! max_attempts = 3
//! base_delay_ms = 1000
//!
//! [sandbox]
//! backend = "local"
//! url_template = "https://{app}.preview.local"
//! default_region = "local"
//!
//! [sandbox.env]
//! NODE_ENV = "development"
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::signals::PortPatterns;

pub const CONFIG_DIR: &str = ".preview";
pub const CONFIG_FILE: &str = "preview.toml";

/// A credential that never shows up in `Debug` output or logs.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubConfig {
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_api_url() -> String {
    "https://api.github.com".to_string()
}

fn default_user_agent() -> String {
    format!("preview/{}", env!("CARGO_PKG_VERSION"))
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_url: default_api_url(),
            user_agent: default_user_agent(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamingConfig {
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Provider limit on app name length.
    #[serde(default = "default_max_len")]
    pub max_len: usize,
}

fn default_prefix() -> String {
    "preview".to_string()
}

fn default_max_len() -> usize {
    63
}

impl Default for NamingConfig {
    fn default() -> Self {
        Self {
            prefix: default_prefix(),
            max_len: default_max_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default = "default_fork_poll_attempts")]
    pub fork_poll_attempts: u32,
    #[serde(default = "default_fork_poll_delay_ms")]
    pub fork_poll_delay_ms: u64,
    #[serde(default = "default_status_poll_interval_secs")]
    pub status_poll_interval_secs: u64,
    #[serde(default = "default_status_poll_max_attempts")]
    pub status_poll_max_attempts: u32,
    /// End-to-end budget for one workflow run.
    #[serde(default = "default_total_deadline_secs")]
    pub total_deadline_secs: u64,
    /// How long terminal runs stay queryable.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
    /// Salt app names with a timestamp so every run gets a new sandbox.
    #[serde(default)]
    pub fresh_names: bool,
}

fn default_fork_poll_attempts() -> u32 {
    10
}
fn default_fork_poll_delay_ms() -> u64 {
    2000
}
fn default_status_poll_interval_secs() -> u64 {
    5
}
fn default_status_poll_max_attempts() -> u32 {
    120
}
fn default_total_deadline_secs() -> u64 {
    1200
}
fn default_retention_secs() -> u64 {
    3600
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            fork_poll_attempts: default_fork_poll_attempts(),
            fork_poll_delay_ms: default_fork_poll_delay_ms(),
            status_poll_interval_secs: default_status_poll_interval_secs(),
            status_poll_max_attempts: default_status_poll_max_attempts(),
            total_deadline_secs: default_total_deadline_secs(),
            retention_secs: default_retention_secs(),
            fresh_names: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn fork_poll_delay(&self) -> Duration {
        Duration::from_millis(self.fork_poll_delay_ms)
    }

    pub fn status_poll_interval(&self) -> Duration {
        Duration::from_secs(self.status_poll_interval_secs)
    }

    pub fn total_deadline(&self) -> Duration {
        Duration::from_secs(self.total_deadline_secs)
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BringupConfig {
    #[serde(default = "default_bringup_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_working_directory")]
    pub working_directory: String,
    /// Lines of recent output kept for error diagnostics.
    #[serde(default = "default_tail_lines")]
    pub tail_lines: usize,
    /// Ordered port patterns; the built-in set is used when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port_patterns: Option<Vec<String>>,
}

fn default_bringup_timeout_secs() -> u64 {
    300
}
fn default_working_directory() -> String {
    "/workspace".to_string()
}
fn default_tail_lines() -> usize {
    50
}

impl Default for BringupConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_bringup_timeout_secs(),
            working_directory: default_working_directory(),
            tail_lines: default_tail_lines(),
            port_patterns: None,
        }
    }
}

impl BringupConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn patterns(&self) -> PortPatterns {
        match &self.port_patterns {
            Some(custom) => PortPatterns::compile(custom),
            None => PortPatterns::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxBackend {
    /// Directories on this machine, sessions are local `sh` processes.
    #[default]
    Local,
    /// Long-lived containers (requires the `docker` feature).
    Docker,
}

impl fmt::Display for SandboxBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SandboxBackend::Local => write!(f, "local"),
            SandboxBackend::Docker => write!(f, "docker"),
        }
    }
}

impl std::str::FromStr for SandboxBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "local" => Ok(SandboxBackend::Local),
            "docker" => Ok(SandboxBackend::Docker),
            _ => anyhow::bail!("Invalid sandbox backend '{}'. Valid values: local, docker", s),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default)]
    pub backend: SandboxBackend,
    /// Directory holding local sandboxes (default: `.preview/sandboxes`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
    #[serde(default = "default_image")]
    pub image: String,
    #[serde(default = "default_memory")]
    pub memory: String,
    #[serde(default = "default_cpus")]
    pub cpus: f64,
    /// Preview URL template. `{app}` and `{region}` are substituted.
    #[serde(default = "default_url_template")]
    pub url_template: String,
    #[serde(default = "default_region")]
    pub default_region: String,
    /// Extra environment passed to every bring-up session.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_image() -> String {
    "node:20-bookworm".to_string()
}
fn default_memory() -> String {
    "2g".to_string()
}
fn default_cpus() -> f64 {
    2.0
}
fn default_url_template() -> String {
    "https://{app}.preview.local".to_string()
}
fn default_region() -> String {
    "local".to_string()
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::default(),
            root: None,
            image: default_image(),
            memory: default_memory(),
            cpus: default_cpus(),
            url_template: default_url_template(),
            default_region: default_region(),
            env: BTreeMap::new(),
        }
    }
}

impl SandboxConfig {
    pub fn preview_url(&self, app_name: &str, region: &str) -> String {
        self.url_template
            .replace("{app}", app_name)
            .replace("{region}", region)
    }
}

/// Root structure of `.preview/preview.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreviewToml {
    #[serde(default)]
    pub github: GithubConfig,
    #[serde(default)]
    pub naming: NamingConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub bringup: BringupConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub sandbox: SandboxConfig,
}

impl PreviewToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse preview.toml")
    }

    /// Load `preview.toml` from `preview_dir`, or defaults when it is absent.
    pub fn load_or_default(preview_dir: &Path) -> Result<Self> {
        let config_path = preview_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).context("Failed to serialize preview.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply `PREVIEW_*` overrides. `lookup` is `std::env::var` outside tests.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("PREVIEW_GITHUB_API_URL") {
            self.github.api_url = url;
        }
        if let Some(backend) = lookup("PREVIEW_SANDBOX_BACKEND")
            && let Ok(backend) = backend.parse()
        {
            self.sandbox.backend = backend;
        }
        if let Some(root) = lookup("PREVIEW_SANDBOX_ROOT") {
            self.sandbox.root = Some(PathBuf::from(root));
        }
        if let Some(region) = lookup("PREVIEW_REGION") {
            self.sandbox.default_region = region;
        }
        if let Some(secs) = lookup("PREVIEW_BRINGUP_TIMEOUT_SECS")
            && let Ok(secs) = secs.parse()
        {
            self.bringup.timeout_secs = secs;
        }
        if let Some(fresh) = lookup("PREVIEW_FRESH_NAMES") {
            self.orchestrator.fresh_names = fresh == "1" || fresh.eq_ignore_ascii_case("true");
        }
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if self.naming.max_len < 16 {
            warnings.push(format!(
                "naming.max_len {} is too small; names will be reduced to a bare hash",
                self.naming.max_len
            ));
        }

        if let Some(patterns) = &self.bringup.port_patterns {
            let compiled = PortPatterns::compile(patterns);
            for rejected in compiled.rejected() {
                warnings.push(format!("Invalid port pattern '{}' will be skipped", rejected));
            }
            if compiled.is_empty() {
                warnings.push("No usable port patterns; bring-up can never detect a port".to_string());
            }
        }

        if self.bringup.timeout_secs == 0 {
            warnings.push("bringup.timeout_secs is 0; every bring-up will time out".to_string());
        }

        if self.orchestrator.status_poll_interval_secs == 0 {
            warnings.push("orchestrator.status_poll_interval_secs is 0".to_string());
        }

        if !self.sandbox.url_template.contains("{app}") {
            warnings.push(format!(
                "sandbox.url_template '{}' has no {{app}} placeholder; all previews share one URL",
                self.sandbox.url_template
            ));
        }

        if self.sandbox.backend == SandboxBackend::Docker && !cfg!(feature = "docker") {
            warnings.push("sandbox.backend = \"docker\" requires building with --features docker".to_string());
        }

        warnings
    }
}

/// Resolved configuration for one invocation.
#[derive(Debug, Clone)]
pub struct PreviewConfig {
    pub project_dir: PathBuf,
    pub preview_dir: PathBuf,
    pub toml: PreviewToml,
    pub verbose: bool,
    github_token: Option<Secret>,
}

impl PreviewConfig {
    /// Load file and environment layers for `project_dir`.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let env_file = project_dir.join(".env");
        if env_file.exists() {
            dotenvy::from_path(&env_file)
                .with_context(|| format!("Failed to load {}", env_file.display()))?;
        }

        let preview_dir = project_dir.join(CONFIG_DIR);
        let mut toml = PreviewToml::load_or_default(&preview_dir)?;
        toml.apply_env(|key| std::env::var(key).ok());

        let github_token = std::env::var("GITHUB_TOKEN")
            .or_else(|_| std::env::var("PREVIEW_GITHUB_TOKEN"))
            .ok()
            .filter(|t| !t.is_empty())
            .map(Secret::new);

        Ok(Self {
            project_dir,
            preview_dir,
            toml,
            verbose: false,
            github_token,
        })
    }

    /// Apply CLI flags on top of file and environment.
    pub fn with_cli_args(project_dir: PathBuf, verbose: bool, token: Option<String>) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.verbose = verbose;
        if let Some(token) = token.filter(|t| !t.is_empty()) {
            config.github_token = Some(Secret::new(token));
        }
        Ok(config)
    }

    pub fn config_file(&self) -> PathBuf {
        self.preview_dir.join(CONFIG_FILE)
    }

    pub fn github_token(&self) -> Option<&Secret> {
        self.github_token.as_ref()
    }

    pub fn sandbox_root(&self) -> PathBuf {
        self.toml
            .sandbox
            .root
            .clone()
            .unwrap_or_else(|| self.preview_dir.join("sandboxes"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.preview_dir.join("logs")
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let toml = PreviewToml::default();
        assert_eq!(toml.github.api_url, "https://api.github.com");
        assert_eq!(toml.naming.prefix, "preview");
        assert_eq!(toml.naming.max_len, 63);
        assert_eq!(toml.orchestrator.fork_poll_attempts, 10);
        assert_eq!(toml.orchestrator.status_poll_interval(), Duration::from_secs(5));
        assert_eq!(toml.orchestrator.status_poll_max_attempts, 120);
        assert_eq!(toml.bringup.timeout(), Duration::from_secs(300));
        assert_eq!(toml.retry.max_attempts, 3);
        assert_eq!(toml.sandbox.backend, SandboxBackend::Local);
        assert!(!toml.orchestrator.fresh_names);
    }

    #[test]
    fn test_parse_partial_keeps_defaults() {
        let toml = PreviewToml::parse(
            r#"
[bringup]
timeout_secs = 60

[sandbox]
backend = "docker"
image = "node:22"
"#,
        )
        .unwrap();
        assert_eq!(toml.bringup.timeout_secs, 60);
        assert_eq!(toml.bringup.working_directory, "/workspace");
        assert_eq!(toml.sandbox.backend, SandboxBackend::Docker);
        assert_eq!(toml.sandbox.image, "node:22");
        assert_eq!(toml.sandbox.default_region, "local");
    }

    #[test]
    fn test_parse_invalid_toml() {
        assert!(PreviewToml::parse("[bringup\ntimeout_secs = ").is_err());
        assert!(PreviewToml::parse("[sandbox]\nbackend = \"vm\"").is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempdir().unwrap();
        let toml = PreviewToml::load_or_default(dir.path()).unwrap();
        assert_eq!(toml.naming.prefix, "preview");
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut toml = PreviewToml::default();
        toml.naming.prefix = "pr".into();
        toml.sandbox.env.insert("NODE_ENV".into(), "development".into());
        toml.save(&path).unwrap();

        let loaded = PreviewToml::load(&path).unwrap();
        assert_eq!(loaded.naming.prefix, "pr");
        assert_eq!(loaded.sandbox.env["NODE_ENV"], "development");
    }

    #[test]
    fn test_env_overrides_file() {
        let mut toml = PreviewToml::default();
        let env: HashMap<&str, &str> = [
            ("PREVIEW_SANDBOX_BACKEND", "docker"),
            ("PREVIEW_REGION", "eu-west"),
            ("PREVIEW_BRINGUP_TIMEOUT_SECS", "42"),
            ("PREVIEW_FRESH_NAMES", "true"),
        ]
        .into_iter()
        .collect();
        toml.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(toml.sandbox.backend, SandboxBackend::Docker);
        assert_eq!(toml.sandbox.default_region, "eu-west");
        assert_eq!(toml.bringup.timeout_secs, 42);
        assert!(toml.orchestrator.fresh_names);
    }

    #[test]
    fn test_env_ignores_unparseable_values() {
        let mut toml = PreviewToml::default();
        toml.apply_env(|k| match k {
            "PREVIEW_SANDBOX_BACKEND" => Some("kvm".into()),
            "PREVIEW_BRINGUP_TIMEOUT_SECS" => Some("soon".into()),
            _ => None,
        });
        assert_eq!(toml.sandbox.backend, SandboxBackend::Local);
        assert_eq!(toml.bringup.timeout_secs, 300);
    }

    #[test]
    fn test_validate_default_is_clean_for_local() {
        assert!(PreviewToml::default().validate().is_empty());
    }

    #[test]
    fn test_validate_reports_bad_patterns_and_template() {
        let mut toml = PreviewToml::default();
        toml.bringup.port_patterns = Some(vec!["port (\\d+".into(), "on (\\d+)".into()]);
        toml.sandbox.url_template = "https://static.example.com".into();
        let warnings = toml.validate();
        assert!(warnings.iter().any(|w| w.contains("port (\\d+")));
        assert!(warnings.iter().any(|w| w.contains("{app}")));
    }

    #[test]
    fn test_preview_url_template() {
        let sandbox = SandboxConfig {
            url_template: "https://{app}.{region}.example.dev".into(),
            ..Default::default()
        };
        assert_eq!(
            sandbox.preview_url("preview-a-1234abcd", "eu"),
            "https://preview-a-1234abcd.eu.example.dev"
        );
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::new("ghp_abcdef");
        assert_eq!(format!("{:?}", secret), "Secret(***)");
        assert_eq!(secret.expose(), "ghp_abcdef");
    }

    #[test]
    fn test_preview_config_paths() {
        let dir = tempdir().unwrap();
        let config = PreviewConfig::with_cli_args(dir.path().to_path_buf(), true, Some("tok".into()))
            .unwrap();
        assert!(config.verbose);
        assert!(config.preview_dir.ends_with(".preview"));
        assert!(config.config_file().ends_with(".preview/preview.toml"));
        assert_eq!(config.github_token().map(|s| s.expose()), Some("tok"));
        assert!(config.log_dir().ends_with(".preview/logs"));
    }
}
