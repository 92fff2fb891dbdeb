//! Well-known agent directories inside the container.
//!
//! Both directories can be overridden through environment variables so tests
//! and unprivileged runs can redirect them.

use std::env;
use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};

pub const STATE_DIR_ENV: &str = "STAGEHAND_STATE_DIR";
pub const RUNTIME_DIR_ENV: &str = "STAGEHAND_RUNTIME_DIR";

/// Durable agent state: the persisted env file, markers, the log file.
pub fn state_dir() -> Result<PathBuf> {
    resolve(STATE_DIR_ENV, "/var/lib/stagehand")
}

/// Short-lived runtime state: pid files for background tasks.
pub fn runtime_dir() -> Result<PathBuf> {
    resolve(RUNTIME_DIR_ENV, "/var/run/stagehand")
}

fn resolve(var: &str, default: &str) -> Result<PathBuf> {
    if let Ok(value) = env::var(var)
        && !value.is_empty()
    {
        let dir = PathBuf::from(value);
        fs::create_dir_all(&dir)
            .with_context(|| format!("create agent directory {}", dir.display()))?;
        return Ok(dir);
    }

    let dir = PathBuf::from(default);
    if fs::create_dir_all(&dir).is_ok() {
        return Ok(dir);
    }

    // Unprivileged fallback (the agent normally runs as root in the container)
    let fallback = env::temp_dir().join("stagehand");
    fs::create_dir_all(&fallback)
        .with_context(|| format!("create agent directory {}", fallback.display()))?;
    Ok(fallback)
}
