//! OpenVSCode server: the web-based editor is downloaded into the remote
//! user's home, extensions install in the background, and the server process
//! itself is started at the end of the install step.

use std::env;
use std::fs;
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::single;
use crate::workspace::{IdeConfig, SetupResult};

use super::vscode;
use super::{InstallContext, download_and_unpack};

pub const DEFAULT_PORT: u16 = 10800;
const DEFAULT_VERSION: &str = "1.86.2";

pub fn setup(setup_result: &SetupResult, ide: &IdeConfig, ctx: &InstallContext) -> Result<()> {
    debug!("setting up openvscode");
    let customization = setup_result.vscode_customization();
    let settings = if customization.settings.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&customization.settings)?
    };

    let server = Server {
        inner: vscode::Server {
            extensions: &customization.extensions,
            settings: &settings,
            user: setup_result.remote_user(),
            options: &ide.options,
            flavor: &vscode::OPENVSCODE,
        },
        host: ide.option("BIND_ADDRESS").unwrap_or("0.0.0.0").to_string(),
        port: ide
            .option("PORT")
            .and_then(|port| port.parse().ok())
            .unwrap_or(DEFAULT_PORT),
        version: ide
            .option("VERSION")
            .unwrap_or(DEFAULT_VERSION)
            .to_string(),
    };

    server.install(&ctx.home_dir)?;

    if !customization.extensions.is_empty() {
        info!(
            extensions = %customization.extensions.join(","),
            "installing extensions in the background"
        );
        single::launch_in(&ctx.runtime_dir, ctx.liveness, "openvscode-async.pid", || {
            ctx.invoke.command(&[
                "extensions",
                "--setup-info",
                ctx.setup_payload,
                "--flavor",
                vscode::OPENVSCODE.id,
            ])
        })?;
    }

    // the server itself starts in the foreground path, not through the guard
    server.start(&ctx.home_dir)
}

struct Server<'a> {
    inner: vscode::Server<'a>,
    host: String,
    port: u16,
    version: String,
}

impl Server<'_> {
    fn install(&self, home: &Path) -> Result<()> {
        let target = home.join(vscode::OPENVSCODE.server_dir);
        if !target.join("bin").exists() {
            let arch = if env::consts::ARCH == "aarch64" {
                "arm64"
            } else {
                "x64"
            };
            let dirname = format!("openvscode-server-v{}-linux-{arch}", self.version);
            let url = format!(
                "https://github.com/gitpod-io/openvscode-server/releases/download/openvscode-server-v{}/{dirname}.tar.gz",
                self.version
            );
            download_and_unpack(&url, home)?;
            fs::rename(home.join(&dirname), &target)
                .context("move openvscode server into place")?;
        }

        self.inner.install(home)
    }

    /// Spawns the server as a detached child and returns; the setup run does
    /// not wait on it.
    fn start(&self, home: &Path) -> Result<()> {
        let binary = home
            .join(vscode::OPENVSCODE.server_dir)
            .join("bin")
            .join("openvscode-server");
        info!(host = %self.host, port = self.port, "starting openvscode server");
        Command::new(&binary)
            .args([
                "--host",
                &self.host,
                "--port",
                &self.port.to_string(),
                "--without-connection-token",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()
            .with_context(|| format!("start openvscode server {}", binary.display()))?;
        Ok(())
    }
}
