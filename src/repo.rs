//! Boundary over git mechanics for workspace clones.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::cmd::Cmd;
use crate::workspace::{AgentConfig, Source};

/// True when the folder already contains a version-control marker.
pub fn is_checked_out(folder: &Path) -> bool {
    folder.join(".git").exists()
}

pub fn clone_workspace(source: &Source, agent: &AgentConfig, folder: &Path) -> Result<()> {
    if source.git_repository.is_empty() {
        debug!("workspace source is not a git repository, skipping clone");
        return Ok(());
    }

    fs::create_dir_all(folder)
        .with_context(|| format!("create workspace folder {}", folder.display()))?;

    info!(
        repository = %source.git_repository,
        folder = %folder.display(),
        "cloning workspace repository"
    );

    let mut args: Vec<String> = vec!["clone".to_string()];
    args.extend(clone_strategy_args(&agent.git_clone_strategy));
    if !source.git_branch.is_empty() {
        args.push("--branch".to_string());
        args.push(source.git_branch.clone());
    }
    args.push(source.git_repository.clone());
    args.push(folder.display().to_string());

    let borrowed: Vec<&str> = args.iter().map(String::as_str).collect();
    Cmd::new("git")
        .args(&borrowed)
        .run()
        .context("clone workspace repository")?;

    if !source.git_commit.is_empty() {
        Cmd::new("git")
            .workdir(folder)
            .args(&["checkout", &source.git_commit])
            .run()
            .with_context(|| format!("checkout commit {}", source.git_commit))?;
    }

    Ok(())
}

/// Extra clone flags for the configured strategy. Unknown strategies fall
/// back to a full clone.
pub fn clone_strategy_args(strategy: &str) -> Vec<String> {
    match strategy.trim() {
        "shallow" => vec!["--depth=1".to_string()],
        "blobless" => vec!["--filter=blob:none".to_string()],
        "treeless" => vec!["--filter=tree:0".to_string()],
        _ => Vec::new(),
    }
}
