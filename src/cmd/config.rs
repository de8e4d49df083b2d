//! Configuration view and validation commands (`preview config`).

use anyhow::{Context, Result};
use std::path::Path;

use preview::config::{CONFIG_DIR, CONFIG_FILE, PreviewConfig, PreviewToml};

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let preview_dir = project_dir.join(CONFIG_DIR);
    let config_path = preview_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Preview Configuration");
            println!("=====================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                PreviewToml::load(&config_path)?
            } else {
                println!("No preview.toml found at {}", config_path.display());
                println!("Using default configuration:");
                PreviewToml::default()
            };
            println!();
            let rendered = toml::to_string_pretty(&toml).context("Failed to render configuration")?;
            for line in rendered.lines() {
                println!("  {}", line);
            }
            println!();

            // Effective values include .env and PREVIEW_* overrides.
            let config = PreviewConfig::new(project_dir.to_path_buf())?;
            println!("Effective values (with env overrides):");
            println!("  sandbox.backend = \"{}\"", config.toml.sandbox.backend);
            println!("  sandbox.root = \"{}\"", config.sandbox_root().display());
            println!("  sandbox.default_region = \"{}\"", config.toml.sandbox.default_region);
            println!("  bringup.timeout_secs = {}", config.toml.bringup.timeout_secs);
            println!(
                "  github token = {}",
                if config.github_token().is_some() { "set" } else { "not set" }
            );
            println!();
            if !config_path.exists() {
                println!("Run 'preview config init' to create a preview.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No preview.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = PreviewToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("preview.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            std::fs::create_dir_all(&preview_dir)
                .with_context(|| format!("Failed to create {}", preview_dir.display()))?;
            PreviewToml::default().save(&config_path)?;

            println!("Created preview.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [github] api_url");
            println!("  - [naming] prefix, max_len");
            println!("  - [bringup] timeout_secs, working_directory, port_patterns");
            println!("  - [sandbox] backend, image, url_template, env");
            println!();
        }
    }

    Ok(())
}
