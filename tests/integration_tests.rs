//! Integration tests for the preview CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a preview Command isolated from the caller's environment
fn preview() -> Command {
    let mut cmd = cargo_bin_cmd!("preview");
    for var in [
        "GITHUB_TOKEN",
        "PREVIEW_GITHUB_TOKEN",
        "PREVIEW_SANDBOX_BACKEND",
        "PREVIEW_SANDBOX_ROOT",
        "PREVIEW_LOG_DIR",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn run_name(args: &[&str]) -> String {
    let dir = create_temp_project();
    let output = preview()
        .current_dir(dir.path())
        .arg("name")
        .args(args)
        .output()
        .unwrap();
    assert!(output.status.success());
    String::from_utf8(output.stdout).unwrap().trim().to_string()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_preview_help() {
        preview()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("start"))
            .stdout(predicate::str::contains("bring-up"));
    }

    #[test]
    fn test_preview_version() {
        preview().arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_command_fails() {
        preview().arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Naming
// =============================================================================

mod naming {
    use super::*;

    #[test]
    fn test_name_is_deterministic() {
        let a = run_name(&["user-1", "acme/web"]);
        let b = run_name(&["user-1", "acme/web"]);
        assert_eq!(a, b);
        assert!(a.starts_with("preview-"));
        assert!(a.len() <= 63);
        assert!(a.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
    }

    #[test]
    fn test_name_differs_per_user() {
        assert_ne!(run_name(&["user-1", "acme/web"]), run_name(&["user-2", "acme/web"]));
    }

    #[test]
    fn test_fresh_names_differ() {
        let a = run_name(&["user-1", "acme/web", "--fresh"]);
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = run_name(&["user-1", "acme/web", "--fresh"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_name_respects_configured_prefix() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".preview")).unwrap();
        fs::write(
            dir.path().join(".preview/preview.toml"),
            "[naming]\nprefix = \"pr\"\nmax_len = 30\n",
        )
        .unwrap();

        let output = preview()
            .current_dir(dir.path())
            .args(["name", "user-1", "acme/a-very-long-repository-name@feature"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let name = String::from_utf8(output.stdout).unwrap().trim().to_string();
        assert!(name.starts_with("pr-"), "{}", name);
        assert!(name.len() <= 30, "{}", name);
    }
}

// =============================================================================
// Configuration
// =============================================================================

mod config {
    use super::*;

    #[test]
    fn test_validate_without_file_uses_defaults() {
        let dir = create_temp_project();
        preview()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults (valid)"));
    }

    #[test]
    fn test_init_creates_file_once() {
        let dir = create_temp_project();
        preview()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created preview.toml"));

        let content = fs::read_to_string(dir.path().join(".preview/preview.toml")).unwrap();
        assert!(content.contains("[bringup]"));
        assert!(content.contains("url_template"));

        preview()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_init_then_validate_is_clean() {
        let dir = create_temp_project();
        preview().current_dir(dir.path()).args(["config", "init"]).assert().success();
        preview()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Configuration is valid."));
    }

    #[test]
    fn test_validate_reports_bad_port_pattern() {
        let dir = create_temp_project();
        fs::create_dir_all(dir.path().join(".preview")).unwrap();
        fs::write(
            dir.path().join(".preview/preview.toml"),
            "[bringup]\nport_patterns = [\"(unclosed\"]\n",
        )
        .unwrap();

        preview()
            .current_dir(dir.path())
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Invalid port pattern"));
    }

    #[test]
    fn test_show_reports_missing_token() {
        let dir = create_temp_project();
        preview()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("github token = not set"))
            .stdout(predicate::str::contains("preview config init"));
    }
}

// =============================================================================
// Provisioning commands
// =============================================================================

mod provisioning {
    use super::*;

    #[test]
    fn test_start_rejects_malformed_repo() {
        let dir = create_temp_project();
        preview()
            .current_dir(dir.path())
            .args(["start", "not-a-slug"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("expected owner/repo"));
    }

    #[test]
    fn test_start_requires_token() {
        let dir = create_temp_project();
        preview()
            .current_dir(dir.path())
            .args(["start", "acme/web"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("GitHub token is required"));
    }

    #[test]
    fn test_teardown_of_missing_sandbox_succeeds() {
        let dir = create_temp_project();
        preview()
            .current_dir(dir.path())
            .args(["teardown", "preview-nothing-here"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Destroyed"));
    }

    #[test]
    fn test_log_dir_receives_log_file() {
        let dir = create_temp_project();
        let logs = dir.path().join("logs");
        preview()
            .current_dir(dir.path())
            .arg("--log-dir")
            .arg(&logs)
            .args(["teardown", "preview-nothing-here"])
            .assert()
            .success();
        assert!(logs.join("preview.log").exists());
    }
}
