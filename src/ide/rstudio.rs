//! RStudio server startup. Failures here are logged and swallowed by the
//! dispatcher instead of aborting the run.

use anyhow::{Context, Result};
use tracing::info;

use crate::cmd::Cmd;
use crate::workspace::{IdeConfig, SetupResult};

pub fn install(setup_result: &SetupResult, ide: &IdeConfig) -> Result<()> {
    let rserver = which::which("rserver").context("rstudio server not found in image")?;
    let rserver = rserver.display().to_string();
    let port = ide.option("PORT").unwrap_or("8787");

    info!(
        port,
        workspace = setup_result.workspace_folder(),
        "starting rstudio server"
    );
    Cmd::new(&rserver)
        .args(&["--www-port", port, "--server-daemonize=1"])
        .run()
        .context("start rstudio server")?;
    Ok(())
}
