//! Streams configured bind-mount contents from the host into the container.
//!
//! Mounts are processed strictly in listed order. A target that already has
//! entries is skipped unless the run is a full reset, which makes re-entry
//! idempotent. The bytes come either from the platform download endpoint
//! (managed platform) or from the tunnel, and are unpacked in place.

use std::fs;
use std::io::Read;
use std::path::Path;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use tracing::{debug, info};

use crate::extract;
use crate::tunnel::TunnelClient;
use crate::workspace::{Mount, PlatformOptions, SetupResult, WorkspaceInfo};

const PROGRESS_INTERVAL: Duration = Duration::from_secs(4);

pub fn stream_all(
    workspace: &WorkspaceInfo,
    setup: &SetupResult,
    tunnel: &TunnelClient,
) -> Result<()> {
    let mounts = setup.mounts();
    debug!(count = mounts.len(), "syncing mounts");
    for mount in mounts {
        // a full reset always re-streams
        if !workspace.cli_options.reset && target_populated(mount) {
            debug!(mount = %mount, "skipping mount stream, target not empty");
            continue;
        }
        stream_mount(workspace, mount, tunnel)?;
    }
    Ok(())
}

pub fn target_populated(mount: &Mount) -> bool {
    match fs::read_dir(&mount.target) {
        Ok(mut entries) => entries.next().is_some(),
        Err(_) => false,
    }
}

fn stream_mount(workspace: &WorkspaceInfo, mount: &Mount, tunnel: &TunnelClient) -> Result<()> {
    let platform = &workspace.cli_options.platform;
    if platform.enabled {
        info!(source = %mount.source, target = %mount.target, "downloading mount from platform");
        let reader = open_platform_download(platform, mount)?;
        extract::unpack(ProgressReader::new(reader), Path::new(&mount.target))
            .with_context(|| format!("stream mount {mount}"))?;
        return Ok(());
    }

    info!(source = %mount.source, target = %mount.target, "copying mount into container");
    let stream = tunnel
        .stream_mount(mount)
        .with_context(|| format!("open mount stream {mount}"))?;
    extract::unpack(ProgressReader::new(stream), Path::new(&mount.target))
        .with_context(|| format!("stream mount {mount}"))?;
    Ok(())
}

pub fn download_url(platform: &PlatformOptions, mount: &Mount) -> String {
    format!(
        "https://{}/kubernetes/management/apis/management.loft.sh/v1/namespaces/{}/devpodworkspaceinstances/{}/download?path={}",
        strip_protocol(&platform.platform_host),
        platform.instance_namespace,
        platform.instance_name,
        utf8_percent_encode(&mount.source, NON_ALPHANUMERIC)
    )
}

fn open_platform_download(
    platform: &PlatformOptions,
    mount: &Mount,
) -> Result<Box<dyn Read + Send>> {
    let url = download_url(platform, mount);
    let request = ureq::get(&url).set(
        "Authorization",
        &format!("Bearer {}", platform.access_key),
    );
    match request.call() {
        Ok(response) => Ok(Box::new(response.into_reader())),
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            bail!("download mount {mount}: body = {body}, status = {code}")
        }
        Err(e) => Err(e).with_context(|| format!("download mount {mount}")),
    }
}

pub fn strip_protocol(host: &str) -> &str {
    host.trim_start_matches("https://").trim_start_matches("http://")
}

/// Reader wrapper logging cumulative transfer progress at a fixed cadence.
pub struct ProgressReader<R> {
    inner: R,
    bytes_read: u64,
    last_report: Instant,
}

impl<R: Read> ProgressReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            bytes_read: 0,
            last_report: Instant::now(),
        }
    }
}

impl<R: Read> Read for ProgressReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes_read += n as u64;
        if self.last_report.elapsed() > PROGRESS_INTERVAL {
            info!(
                "transferred {:.2} MB",
                self.bytes_read as f64 / 1024.0 / 1024.0
            );
            self.last_report = Instant::now();
        }
        Ok(n)
    }
}
