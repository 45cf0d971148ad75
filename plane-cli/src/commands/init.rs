//! Init command - write a default configuration file.

use anyhow::{Context, Result};
use plane_link::Config;
use std::path::Path;

/// Run the init command.
pub fn run(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context("Failed to create config directory")?;
    }

    let contents = Config::default().to_toml()?;
    std::fs::write(path, contents).context("Failed to write config file")?;

    println!("Wrote {}", path.display());
    Ok(())
}
