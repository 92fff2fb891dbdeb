//! Jupyter notebook install.

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cmd::Cmd;
use crate::workspace::{IdeConfig, SetupResult};

pub fn install(setup_result: &SetupResult, ide: &IdeConfig) -> Result<()> {
    if which::which("jupyter").is_ok() {
        debug!("jupyter already installed");
        return Ok(());
    }

    let pip = which::which("pip3")
        .or_else(|_| which::which("pip"))
        .context("neither pip3 nor pip found")?;
    let pip = pip.display().to_string();
    let package = ide.option("PACKAGE").unwrap_or("notebook");

    info!(
        package,
        workspace = setup_result.workspace_folder(),
        "installing jupyter"
    );
    Cmd::new(&pip)
        .arg("install")
        .arg(package)
        .run()
        .context("install jupyter notebook")?;
    Ok(())
}
