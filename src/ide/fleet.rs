//! Fleet launcher install.

use std::fs;
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::workspace::{IdeConfig, SetupResult};

use super::download_file;

const DOWNLOAD_URL: &str =
    "https://download.jetbrains.com/product?code=FLL&release.type=release&platform=linux_x64";

pub fn install(setup_result: &SetupResult, ide: &IdeConfig, home: &Path) -> Result<()> {
    let launcher = home.join(".fleet").join("bin").join("fleet");
    if launcher.exists() {
        debug!("fleet launcher already installed");
        return Ok(());
    }

    let url = ide.option("DOWNLOAD_URL").unwrap_or(DOWNLOAD_URL);
    download_file(url, &launcher)?;
    let mut perms = fs::metadata(&launcher)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&launcher, perms).context("mark fleet launcher executable")?;

    info!(
        workspace = setup_result.workspace_folder(),
        "fleet launcher installed"
    );
    Ok(())
}
