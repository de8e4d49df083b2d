//! App name derivation (`preview name`).

use anyhow::Result;
use std::path::Path;

use preview::config::{CONFIG_DIR, PreviewToml};
use preview::naming::{derive_app_name, timestamp_salt};

pub fn cmd_name(project_dir: &Path, user: &str, project: &str, fresh: bool) -> Result<()> {
    let toml = PreviewToml::load_or_default(&project_dir.join(CONFIG_DIR))?;
    let salt = fresh.then(timestamp_salt);
    let name = derive_app_name(
        &toml.naming.prefix,
        toml.naming.max_len,
        user,
        project,
        salt.as_deref(),
    );
    println!("{}", name);
    Ok(())
}
