//! Package manager and start script detection.
//!
//! The orchestrator only consumes the result; detection is a pure lookup
//! over the repository's root file names and its `package.json`.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    #[default]
    Npm,
    Pnpm,
    Yarn,
    Bun,
}

impl PackageManager {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Npm => "npm",
            Self::Pnpm => "pnpm",
            Self::Yarn => "yarn",
            Self::Bun => "bun",
        }
    }

    pub fn install_command(&self) -> &'static str {
        match self {
            Self::Npm => "npm install",
            Self::Pnpm => "pnpm install",
            Self::Yarn => "yarn install",
            Self::Bun => "bun install",
        }
    }

    pub fn run_command(&self, script: &str) -> String {
        format!("{} run {}", self.as_str(), script)
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PackageManager {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "npm" => Ok(Self::Npm),
            "pnpm" => Ok(Self::Pnpm),
            "yarn" => Ok(Self::Yarn),
            "bun" => Ok(Self::Bun),
            _ => anyhow::bail!(
                "Invalid package manager '{}'. Valid values: npm, pnpm, yarn, bun",
                s
            ),
        }
    }
}

/// What the bring-up engine needs to know about a project.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeHints {
    pub package_manager: PackageManager,
    pub start_script: String,
}

impl Default for RuntimeHints {
    fn default() -> Self {
        Self {
            package_manager: PackageManager::Npm,
            start_script: DEFAULT_SCRIPT.to_string(),
        }
    }
}

const DEFAULT_SCRIPT: &str = "dev";
const SCRIPT_PREFERENCE: &[&str] = &["dev", "start", "serve"];

pub trait ProjectClassifier: Send + Sync {
    fn detect_package_manager(&self, root_files: &[String]) -> PackageManager;

    /// `manifest` is the raw `package.json`, if present.
    fn detect_start_script(&self, manifest: Option<&str>) -> String;

    fn classify(&self, root_files: &[String], manifest: Option<&str>) -> RuntimeHints {
        RuntimeHints {
            package_manager: self.detect_package_manager(root_files),
            start_script: self.detect_start_script(manifest),
        }
    }
}

/// Lockfile and `package.json` scripts based classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ManifestClassifier;

impl ProjectClassifier for ManifestClassifier {
    fn detect_package_manager(&self, root_files: &[String]) -> PackageManager {
        let has = |name: &str| root_files.iter().any(|f| f == name);
        if has("pnpm-lock.yaml") {
            PackageManager::Pnpm
        } else if has("yarn.lock") {
            PackageManager::Yarn
        } else if has("bun.lockb") || has("bun.lock") {
            PackageManager::Bun
        } else {
            PackageManager::Npm
        }
    }

    fn detect_start_script(&self, manifest: Option<&str>) -> String {
        let scripts = manifest
            .and_then(|raw| serde_json::from_str::<serde_json::Value>(raw).ok())
            .and_then(|json| json.get("scripts").cloned())
            .and_then(|s| s.as_object().cloned());

        if let Some(scripts) = scripts {
            for candidate in SCRIPT_PREFERENCE {
                if scripts.contains_key(*candidate) {
                    return candidate.to_string();
                }
            }
        }
        DEFAULT_SCRIPT.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_lockfile_detection() {
        let c = ManifestClassifier;
        assert_eq!(c.detect_package_manager(&files(&["pnpm-lock.yaml", "package.json"])), PackageManager::Pnpm);
        assert_eq!(c.detect_package_manager(&files(&["yarn.lock"])), PackageManager::Yarn);
        assert_eq!(c.detect_package_manager(&files(&["bun.lockb"])), PackageManager::Bun);
        assert_eq!(c.detect_package_manager(&files(&["bun.lock"])), PackageManager::Bun);
        assert_eq!(c.detect_package_manager(&files(&["package-lock.json"])), PackageManager::Npm);
        assert_eq!(c.detect_package_manager(&[]), PackageManager::Npm);
    }

    #[test]
    fn test_script_preference() {
        let c = ManifestClassifier;
        assert_eq!(
            c.detect_start_script(Some(r#"{"scripts":{"start":"node s.js","dev":"vite"}}"#)),
            "dev"
        );
        assert_eq!(
            c.detect_start_script(Some(r#"{"scripts":{"start":"node s.js","build":"tsc"}}"#)),
            "start"
        );
        assert_eq!(c.detect_start_script(Some(r#"{"scripts":{"serve":"http-server"}}"#)), "serve");
    }

    #[test]
    fn test_script_fallback() {
        let c = ManifestClassifier;
        assert_eq!(c.detect_start_script(None), "dev");
        assert_eq!(c.detect_start_script(Some("not json")), "dev");
        assert_eq!(c.detect_start_script(Some(r#"{"name":"x"}"#)), "dev");
        assert_eq!(c.detect_start_script(Some(r#"{"scripts":{"build":"tsc"}}"#)), "dev");
    }

    #[test]
    fn test_classify_combines_both() {
        let hints = ManifestClassifier.classify(&files(&["yarn.lock"]), Some(r#"{"scripts":{"start":"x"}}"#));
        assert_eq!(hints.package_manager, PackageManager::Yarn);
        assert_eq!(hints.start_script, "start");
    }

    #[test]
    fn test_commands() {
        assert_eq!(PackageManager::Pnpm.install_command(), "pnpm install");
        assert_eq!(PackageManager::Bun.run_command("dev"), "bun run dev");
        assert_eq!("YARN".parse::<PackageManager>().unwrap(), PackageManager::Yarn);
        assert!("cargo".parse::<PackageManager>().is_err());
    }
}
