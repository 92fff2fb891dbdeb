//! The sequential setup workflow driven from the host.
//!
//! Every step is fatal on failure and unwinds the whole run; nothing is
//! retried and no partial success is ever reported. The single exception is
//! git credential injection, which degrades to unauthenticated operation.

use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, error, info};

use crate::selfexec::{CurrentExe, SelfInvoke};
use crate::single::{Liveness, ProcessLiveness};
use crate::tunnel::TunnelClient;
use crate::workspace::{self, WorkspaceInfo};
use crate::{builder, container, credentials, ide, mounts, paths, repo, single};

pub struct SetupOptions {
    pub stream_mounts: bool,
    pub chown_workspace: bool,
    pub inject_git_credentials: bool,
    pub workspace_info: String,
    pub setup_info: String,
    pub access_key: String,
    pub platform_host: String,
    pub workspace_host: String,
    pub debug: bool,
}

pub fn run(options: &SetupOptions, tunnel: &TunnelClient) -> Result<()> {
    run_with(options, tunnel, &CurrentExe, &ProcessLiveness)
}

pub fn run_with(
    options: &SetupOptions,
    tunnel: &TunnelClient,
    invoke: &dyn SelfInvoke,
    liveness: &dyn Liveness,
) -> Result<()> {
    // the first exchange doubles as a liveness check for the host
    tunnel.ping().context("ping host")?;
    debug!("starting container setup");

    let mut workspace_info =
        WorkspaceInfo::decode(&options.workspace_info).context("decode workspace info")?;
    apply_platform_overrides(&mut workspace_info, options);
    let mut setup_result =
        workspace::SetupResult::decode(&options.setup_info).context("decode setup info")?;

    if options.stream_mounts {
        mounts::stream_all(&workspace_info, &setup_result, tunnel)?;
    }

    builder::run(
        &setup_result,
        &workspace_info.dockerless,
        tunnel,
        invoke,
        options.debug,
    )
    .context("dockerless build")?;

    workspace::merge_remote_env(&mut setup_result);

    // held until the run ends so clones stay authenticated; dropping the
    // guard tears the helper down on every exit path
    let mut _git_credentials = None;
    if options.inject_git_credentials {
        match credentials::configure_git(tunnel, invoke) {
            Ok(guard) => {
                debug!(port = guard.port(), "git credentials configured");
                _git_credentials = Some(guard);
            }
            Err(e) => error!(error = ?e, "configuring git credentials failed"),
        }
    }

    if workspace_info.pulls_from_inside() {
        let folder = Path::new(setup_result.workspace_folder());
        if repo::is_checked_out(folder) && !workspace_info.cli_options.recreate {
            debug!(
                folder = %folder.display(),
                "workspace repository already checked out, skipping clone"
            );
        } else {
            repo::clone_workspace(&workspace_info.source, &workspace_info.agent, folder)?;
        }
    }

    container::setup(&setup_result, &workspace_info, options.chown_workspace)?;

    let ctx = ide::InstallContext {
        invoke,
        liveness,
        runtime_dir: paths::runtime_dir()?,
        home_dir: ide::user_home(setup_result.remote_user()),
        setup_payload: &options.setup_info,
    };
    ide::install(&setup_result, &workspace_info.ide, &ctx)?;

    if should_start_daemon(&workspace_info) {
        let timeout = workspace_info.container_timeout.clone();
        single::launch_in(&ctx.runtime_dir, liveness, "daemon.pid", || {
            info!(timeout = %timeout, "starting inactivity daemon");
            invoke.command(&["daemon", "--timeout", &timeout])
        })?;
    }

    let payload = serde_json::to_string(&setup_result).context("serialize setup result")?;
    tunnel.send_result(&payload).context("send result")?;
    info!("container setup finished");
    Ok(())
}

/// Per-run connection flags override the decoded platform options.
fn apply_platform_overrides(workspace_info: &mut WorkspaceInfo, options: &SetupOptions) {
    let platform = &mut workspace_info.cli_options.platform;
    if !options.access_key.is_empty() {
        platform.access_key = options.access_key.clone();
    }
    if !options.platform_host.is_empty() {
        platform.platform_host = options.platform_host.clone();
    }
    if !options.workspace_host.is_empty() {
        debug!(host = %options.workspace_host, "workspace host override");
    }
}

fn should_start_daemon(workspace_info: &WorkspaceInfo) -> bool {
    !workspace_info.cli_options.platform.enabled
        && !workspace_info.cli_options.disable_daemon
        && !workspace_info.container_timeout.is_empty()
}
