//! Shared installer for the VS Code family of editors.
//!
//! The family differs only in metadata: every flavor gets its merged machine
//! settings written into the server state directory, and extension installs
//! are handed to a background re-invocation of the agent so a slow
//! marketplace never blocks the setup run.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use nix::unistd::User;
use tracing::{debug, info, warn};

use crate::cmd::Cmd;
use crate::container;
use crate::single;
use crate::workspace::{IdeConfig, OptionValue, SetupResult};

use super::InstallContext;

/// Release metadata distinguishing the editors that share this installer.
/// Flavors are data, not types.
pub struct Flavor {
    pub id: &'static str,
    pub display_name: &'static str,
    /// Directory under the remote user's home holding server state.
    pub server_dir: &'static str,
    /// Candidate remote CLI binaries used for extension installs.
    pub remote_cli: &'static [&'static str],
}

pub const STABLE: Flavor = Flavor {
    id: "vscode",
    display_name: "VS Code",
    server_dir: ".vscode-server",
    remote_cli: &["code-server", "code"],
};

pub const INSIDERS: Flavor = Flavor {
    id: "vscode-insiders",
    display_name: "VS Code Insiders",
    server_dir: ".vscode-server-insiders",
    remote_cli: &["code-server-insiders", "code-insiders"],
};

pub const CURSOR: Flavor = Flavor {
    id: "cursor",
    display_name: "Cursor",
    server_dir: ".cursor-server",
    remote_cli: &["cursor-server", "cursor"],
};

pub const POSITRON: Flavor = Flavor {
    id: "positron",
    display_name: "Positron",
    server_dir: ".positron-server",
    remote_cli: &["positron-server"],
};

pub const CODIUM: Flavor = Flavor {
    id: "codium",
    display_name: "VSCodium",
    server_dir: ".vscodium-server",
    remote_cli: &["codium-server", "codium"],
};

pub const WINDSURF: Flavor = Flavor {
    id: "windsurf",
    display_name: "Windsurf",
    server_dir: ".windsurf-server",
    remote_cli: &["windsurf-server"],
};

/// The web-based server shares the settings layout and the async extension
/// path with the desktop flavors.
pub const OPENVSCODE: Flavor = Flavor {
    id: "openvscode",
    display_name: "OpenVSCode",
    server_dir: ".openvscode-server",
    remote_cli: &["openvscode-server"],
};

const ALL: [&Flavor; 7] = [
    &STABLE, &INSIDERS, &CURSOR, &POSITRON, &CODIUM, &WINDSURF, &OPENVSCODE,
];

pub fn flavor_by_id(id: &str) -> Option<&'static Flavor> {
    ALL.into_iter().find(|flavor| flavor.id == id)
}

pub fn setup(
    setup_result: &SetupResult,
    ide: &IdeConfig,
    flavor: &'static Flavor,
    ctx: &InstallContext,
) -> Result<()> {
    debug!(flavor = flavor.display_name, "setting up editor");
    let customization = setup_result.vscode_customization();
    let settings = if customization.settings.is_empty() {
        String::new()
    } else {
        serde_json::to_string(&customization.settings)?
    };

    let server = Server {
        extensions: &customization.extensions,
        settings: &settings,
        user: setup_result.remote_user(),
        options: &ide.options,
        flavor,
    };
    server.install(&ctx.home_dir)?;

    // nothing to configure at all
    if customization.settings.is_empty() && customization.extensions.is_empty() {
        return Ok(());
    }
    // settings-only configurations do not spawn the async installer
    if customization.extensions.is_empty() {
        return Ok(());
    }

    info!(
        extensions = %customization.extensions.join(","),
        flavor = flavor.display_name,
        "installing extensions in the background"
    );
    let lock_name = format!("{}-async.pid", flavor.id);
    single::launch_in(&ctx.runtime_dir, ctx.liveness, &lock_name, || {
        ctx.invoke.command(&[
            "extensions",
            "--setup-info",
            ctx.setup_payload,
            "--flavor",
            flavor.id,
        ])
    })
}

/// One editor server of a given flavor.
pub struct Server<'a> {
    pub extensions: &'a [String],
    pub settings: &'a str,
    pub user: &'a str,
    pub options: &'a BTreeMap<String, OptionValue>,
    pub flavor: &'a Flavor,
}

impl Server<'_> {
    /// Prepares the server state directory and writes machine settings.
    pub fn install(&self, home: &Path) -> Result<()> {
        let machine_dir = home
            .join(self.flavor.server_dir)
            .join("data")
            .join("Machine");
        fs::create_dir_all(&machine_dir)
            .with_context(|| format!("create {}", machine_dir.display()))?;

        if !self.settings.is_empty() {
            fs::write(machine_dir.join("settings.json"), self.settings)
                .context("write machine settings")?;
            debug!(flavor = self.flavor.display_name, "wrote machine settings");
        }

        if !self.extensions.is_empty() {
            debug!(
                flavor = self.flavor.display_name,
                count = self.extensions.len(),
                "extension install deferred to the async task"
            );
        }

        self.adjust_ownership(home);
        Ok(())
    }

    /// The server state must belong to the remote user, not the agent.
    fn adjust_ownership(&self, home: &Path) {
        let Ok(Some(account)) = User::from_name(self.user) else {
            return;
        };
        let dir = home.join(self.flavor.server_dir);
        if let Err(e) = container::chown_recursive(&dir, account.uid, account.gid) {
            debug!(error = %e, user = self.user, "could not chown editor state");
        }
    }
}

/// Installs the extensions through the flavor's remote CLI. Per-extension
/// failures are logged, not fatal: one broken extension must not block the
/// remaining ones.
pub fn install_extensions(extensions: &[String], flavor: &Flavor, home: &Path) -> Result<()> {
    install_extensions_with(extensions, flavor, home, &BTreeMap::new())
}

pub fn install_extensions_with(
    extensions: &[String],
    flavor: &Flavor,
    home: &Path,
    options: &BTreeMap<String, OptionValue>,
) -> Result<()> {
    let Some(cli) = find_remote_cli(flavor, home, options) else {
        warn!(
            flavor = flavor.display_name,
            "no remote CLI found, skipping extension install"
        );
        return Ok(());
    };

    for extension in extensions {
        info!(extension, "installing extension");
        if let Err(e) = Cmd::new(&cli)
            .args(&["--install-extension", extension, "--force"])
            .run()
        {
            warn!(extension, error = %e, "extension install failed");
        }
    }
    Ok(())
}

fn find_remote_cli(
    flavor: &Flavor,
    home: &Path,
    options: &BTreeMap<String, OptionValue>,
) -> Option<String> {
    if let Some(cli) = options.get("REMOTE_CLI")
        && !cli.value.is_empty()
    {
        return Some(cli.value.clone());
    }
    for candidate in flavor.remote_cli {
        if let Ok(path) = which::which(candidate) {
            return Some(path.display().to_string());
        }
        let local = home.join(flavor.server_dir).join("bin").join(candidate);
        if local.exists() {
            return Some(local.display().to_string());
        }
    }
    None
}
