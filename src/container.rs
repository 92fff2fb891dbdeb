//! Final container preparation: remote environment and workspace ownership.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nix::unistd::{self, Gid, Uid, User};
use tracing::{debug, warn};

use crate::envfile;
use crate::paths;
use crate::workspace::{SetupResult, WorkspaceInfo};

pub fn setup(
    setup_result: &SetupResult,
    workspace: &WorkspaceInfo,
    chown_workspace: bool,
) -> Result<()> {
    envfile::merge_and_apply(&combined_env(setup_result, workspace));

    if chown_workspace {
        chown_workspace_once(setup_result)?;
    }
    Ok(())
}

/// The merged remote env plus the per-run workspace entries. CLI entries win
/// over the devcontainer configuration.
fn combined_env(
    setup_result: &SetupResult,
    workspace: &WorkspaceInfo,
) -> BTreeMap<String, String> {
    let mut env = setup_result.merged_config.remote_env.clone();
    for entry in &workspace.cli_options.workspace_env {
        if let Some((key, value)) = entry.split_once('=') {
            env.insert(key.to_string(), value.to_string());
        }
    }
    env
}

/// Hands the workspace folder to the remote user, once per container.
fn chown_workspace_once(setup_result: &SetupResult) -> Result<()> {
    let folder = Path::new(setup_result.workspace_folder());
    if !folder.exists() {
        debug!(folder = %folder.display(), "workspace folder missing, skipping chown");
        return Ok(());
    }

    let marker = paths::state_dir()?.join(".workspace-chowned");
    if marker.exists() {
        debug!("workspace ownership already adjusted");
        return Ok(());
    }

    let user = setup_result.remote_user();
    let Some(account) = User::from_name(user).context("resolve remote user")? else {
        warn!(user, "remote user not found, skipping workspace chown");
        return Ok(());
    };

    debug!(user, folder = %folder.display(), "chowning workspace");
    chown_recursive(folder, account.uid, account.gid)?;
    fs::write(&marker, b"").context("write chown marker")?;
    Ok(())
}

pub(crate) fn chown_recursive(path: &Path, uid: Uid, gid: Gid) -> Result<()> {
    // symlinks are not followed
    if path.is_symlink() {
        return Ok(());
    }
    unistd::chown(path, Some(uid), Some(gid))
        .with_context(|| format!("chown {}", path.display()))?;
    if path.is_dir() {
        for entry in fs::read_dir(path)? {
            chown_recursive(&entry?.path(), uid, gid)?;
        }
    }
    Ok(())
}
