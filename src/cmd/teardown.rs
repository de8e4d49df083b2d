//! Sandbox teardown (`preview teardown`).

use anyhow::Result;
use console::style;
use std::path::Path;

use preview::config::PreviewConfig;
use preview::provision;
use preview::ui::icons::CHECK;

pub async fn cmd_teardown(project_dir: &Path, app: &str) -> Result<()> {
    let config = PreviewConfig::new(project_dir.to_path_buf())?;
    let sandbox = provision::sandbox_from_config(&config)?;
    sandbox.destroy(app).await?;
    println!("{} Destroyed {}", CHECK, style(app).bold());
    Ok(())
}
