//! Container inactivity daemon.
//!
//! Spawned through the single-instance guard at the end of setup. Polls an
//! activity marker and shuts the container down once the idle window exceeds
//! the configured timeout. Every agent invocation refreshes the marker, so
//! interactive use keeps the container alive.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result, bail};
use tracing::{debug, info};

use crate::paths;

const POLL_INTERVAL: Duration = Duration::from_secs(60);

pub fn run(timeout: &str) -> Result<()> {
    let timeout = parse_duration(timeout)?;
    let marker = activity_marker()?;
    if !marker.exists() {
        note_activity()?;
    }
    info!(
        timeout = ?timeout,
        marker = %marker.display(),
        "inactivity daemon started"
    );

    loop {
        if idle_longer_than(&marker, timeout)? {
            info!("inactivity timeout reached, shutting down container");
            shutdown();
            return Ok(());
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Refreshes the activity marker. Called on every agent invocation.
pub fn note_activity() -> Result<()> {
    let marker = activity_marker()?;
    fs::write(&marker, b"").with_context(|| format!("touch {}", marker.display()))?;
    Ok(())
}

fn activity_marker() -> Result<PathBuf> {
    Ok(paths::runtime_dir()?.join("activity"))
}

fn idle_longer_than(marker: &Path, timeout: Duration) -> Result<bool> {
    let modified = fs::metadata(marker)
        .and_then(|meta| meta.modified())
        .with_context(|| format!("read activity marker {}", marker.display()))?;
    let idle = SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default();
    debug!(idle = ?idle, "activity check");
    Ok(idle > timeout)
}

fn shutdown() {
    // pid 1 owns the container; terminating it stops the workspace
    unsafe {
        libc::kill(1, libc::SIGTERM);
    }
}

/// Accepts `90`, `90s`, `15m` or `2h`.
pub fn parse_duration(raw: &str) -> Result<Duration> {
    let raw = raw.trim();
    if raw.is_empty() {
        bail!("empty duration");
    }
    let split = raw
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(raw.len());
    let (digits, unit) = raw.split_at(split);
    let value: u64 = digits
        .parse()
        .with_context(|| format!("invalid duration: {raw}"))?;
    let seconds = match unit {
        "" | "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => bail!("invalid duration unit: {other}"),
    };
    Ok(Duration::from_secs(seconds))
}
