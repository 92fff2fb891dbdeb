//! Ephemeral credential bridge between container-local tooling and the host.
//!
//! A loopback TCP server forwards credential requests over the tunnel; git
//! and docker are pointed at it through a re-invocation of the agent binary.
//! Teardown is guaranteed-release: [`CredentialsGuard`] undoes the helper
//! configuration when dropped, on every exit path of the owning operation.

use std::fs;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use crate::cmd::Cmd;
use crate::selfexec::SelfInvoke;
use crate::tunnel::TunnelClient;

pub const PORT_ENV: &str = "STAGEHAND_CREDENTIALS_PORT";
pub const DOCKER_CONFIG_ENV: &str = "DOCKER_CONFIG";
const DOCKER_HELPER_NAME: &str = "docker-credential-stagehand";

/// One request line from a helper process to the local server.
#[derive(Debug, Serialize, Deserialize)]
struct HelperRequest {
    payload: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct HelperResponse {
    payload: String,
}

// ── Local server ────────────────────────────────────────────────────────

/// Loopback server relaying helper requests through the tunnel.
pub struct CredentialServer {
    port: u16,
    stop: Arc<AtomicBool>,
}

impl CredentialServer {
    pub fn start(tunnel: TunnelClient) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").context("bind credential server")?;
        let port = listener.local_addr()?.port();
        let stop = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&stop);
        thread::spawn(move || {
            for stream in listener.incoming() {
                if flag.load(Ordering::SeqCst) {
                    break;
                }
                match stream {
                    Ok(stream) => {
                        let tunnel = tunnel.clone();
                        thread::spawn(move || {
                            if let Err(e) = handle_connection(stream, &tunnel) {
                                debug!(error = %e, "credential connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        debug!(error = %e, "credential accept error, shutting down");
                        break;
                    }
                }
            }
        });
        debug!(port, "credential server listening");
        Ok(Self { port, stop })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    fn shutdown(&self) {
        self.stop.store(true, Ordering::SeqCst);
        // unblock the accept loop
        let _ = TcpStream::connect(("127.0.0.1", self.port));
    }
}

fn handle_connection(stream: TcpStream, tunnel: &TunnelClient) -> Result<()> {
    let mut reader = BufReader::new(&stream);
    let mut writer = &stream;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if line.trim().is_empty() {
            continue;
        }
        let request: HelperRequest =
            serde_json::from_str(line.trim()).context("parse credential request")?;
        let payload = tunnel
            .credentials(&request.payload)
            .context("forward credential request to host")?;
        let mut response = serde_json::to_string(&HelperResponse { payload })?;
        response.push('\n');
        writer.write_all(response.as_bytes())?;
        writer.flush()?;
    }
}

// ── Guard ───────────────────────────────────────────────────────────────

/// Scoped credential-helper session. Dropping the guard tears the helper
/// configuration down and stops the local server, exactly once.
pub struct CredentialsGuard {
    port: u16,
    server: Option<CredentialServer>,
    cleanup: Option<Box<dyn FnOnce() + Send>>,
}

impl CredentialsGuard {
    fn new(server: CredentialServer, cleanup: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            port: server.port(),
            server: Some(server),
            cleanup: Some(cleanup),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl Drop for CredentialsGuard {
    fn drop(&mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup();
        }
        if let Some(server) = self.server.take() {
            server.shutdown();
        }
    }
}

// ── Git variant ─────────────────────────────────────────────────────────

/// Points the system git configuration at the bridge. The port is also
/// exported so child processes can find the server.
pub fn configure_git(tunnel: &TunnelClient, invoke: &dyn SelfInvoke) -> Result<CredentialsGuard> {
    if which::which("git").is_err() {
        bail!("git not found");
    }

    let server = CredentialServer::start(tunnel.clone())?;
    let binary = invoke.binary_path()?;
    let helper = format!("!'{}' credentials --port {}", binary.display(), server.port());
    unsafe { std::env::set_var(PORT_ENV, server.port().to_string()) };

    Cmd::new("git")
        .args(&["config", "--system", "--add", "credential.helper", &helper])
        .run()
        .context("add git credential helper")?;

    Ok(CredentialsGuard::new(
        server,
        Box::new(|| {
            debug!("removing system git credential helper");
            if let Err(e) = Cmd::new("git")
                .args(&["config", "--system", "--unset", "credential.helper"])
                .run()
            {
                error!(error = %e, "failed to unset git credential helper");
            }
        }),
    ))
}

// ── Docker variant ──────────────────────────────────────────────────────

/// Writes a docker client configuration pointing its credential store at the
/// bridge and exports its location. Teardown removes the directory again.
pub fn configure_docker(
    tunnel: &TunnelClient,
    invoke: &dyn SelfInvoke,
    config_dir: &Path,
) -> Result<CredentialsGuard> {
    let server = CredentialServer::start(tunnel.clone())?;
    let binary = invoke.binary_path()?;
    write_docker_config(config_dir, &binary, server.port())?;
    unsafe { std::env::set_var(DOCKER_CONFIG_ENV, config_dir) };

    let dir = config_dir.to_path_buf();
    Ok(CredentialsGuard::new(
        server,
        Box::new(move || {
            debug!(dir = %dir.display(), "removing docker credential configuration");
            unsafe { std::env::remove_var(DOCKER_CONFIG_ENV) };
            let _ = fs::remove_dir_all(&dir);
        }),
    ))
}

fn write_docker_config(config_dir: &Path, binary: &Path, port: u16) -> Result<()> {
    fs::create_dir_all(config_dir)
        .with_context(|| format!("create docker config dir {}", config_dir.display()))?;
    fs::write(
        config_dir.join("config.json"),
        "{\n  \"auths\": {},\n  \"credsStore\": \"stagehand\"\n}\n",
    )
    .context("write docker config")?;

    // docker resolves docker-credential-<store> via PATH; the shim lives in
    // the config dir and callers prepend that dir for the build subprocess
    let shim = config_dir.join(DOCKER_HELPER_NAME);
    let script = format!(
        "#!/bin/sh\nexec '{}' credentials --docker --port {} \"$@\"\n",
        binary.display(),
        port
    );
    fs::write(&shim, script).context("write docker credential helper")?;
    let mut perms = fs::metadata(&shim)?.permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&shim, perms).context("mark docker credential helper executable")?;
    Ok(())
}

// ── Helper subcommand ───────────────────────────────────────────────────

/// Body of `stagehand credentials`, the process git/docker re-invoke.
/// Bridges a single `get` request to the local server; other actions are
/// accepted and ignored.
pub fn run_helper(port: u16, docker: bool, action: &str) -> Result<()> {
    if action != "get" {
        return Ok(());
    }

    let mut input = String::new();
    io::stdin()
        .read_to_string(&mut input)
        .context("read credential request from stdin")?;

    let kind = if docker { "docker" } else { "git" };
    let payload = serde_json::json!({ "kind": kind, "input": input.trim() }).to_string();
    let response = request(port, &payload)?;
    print!("{response}");
    io::stdout().flush()?;
    Ok(())
}

/// One request/response exchange with the local credential server.
fn request(port: u16, payload: &str) -> Result<String> {
    let stream = TcpStream::connect(("127.0.0.1", port))
        .with_context(|| format!("connect to credential server on port {port}"))?;
    let mut reader = BufReader::new(&stream);
    let mut writer = &stream;

    let mut line = serde_json::to_string(&HelperRequest {
        payload: payload.to_string(),
    })?;
    line.push('\n');
    writer.write_all(line.as_bytes())?;
    writer.flush()?;

    let mut response = String::new();
    if reader.read_line(&mut response)? == 0 {
        bail!("credential server closed the connection");
    }
    let response: HelperResponse =
        serde_json::from_str(response.trim()).context("parse credential response")?;
    Ok(response.payload)
}
