//! IDE installer dispatch.
//!
//! A closed set of IDE kinds maps to installer variants over the capability
//! set {install, optionally start}. Which failures abort the run is explicit
//! per kind: RStudio logs and continues, everything else propagates.

pub mod fleet;
pub mod jetbrains;
pub mod jupyter;
pub mod openvscode;
pub mod rstudio;
pub mod vscode;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use nix::unistd::User;
use tracing::{debug, error, info};

use crate::extract;
use crate::selfexec::SelfInvoke;
use crate::single::Liveness;
use crate::workspace::{IdeConfig, SetupResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdeKind {
    None,
    VsCode,
    VsCodeInsiders,
    Cursor,
    Positron,
    Codium,
    Windsurf,
    OpenVsCode,
    Goland,
    RustRover,
    PyCharm,
    PhpStorm,
    IntelliJ,
    CLion,
    Rider,
    RubyMine,
    WebStorm,
    DataSpell,
    Fleet,
    JupyterNotebook,
    RStudio,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown ide: {0}")]
pub struct UnknownIde(String);

impl IdeKind {
    pub fn from_name(name: &str) -> Result<Self, UnknownIde> {
        Ok(match name.trim() {
            "" | "none" => Self::None,
            "vscode" => Self::VsCode,
            "vscode-insiders" => Self::VsCodeInsiders,
            "cursor" => Self::Cursor,
            "positron" => Self::Positron,
            "codium" => Self::Codium,
            "windsurf" => Self::Windsurf,
            "openvscode" => Self::OpenVsCode,
            "goland" => Self::Goland,
            "rustrover" => Self::RustRover,
            "pycharm" => Self::PyCharm,
            "phpstorm" => Self::PhpStorm,
            "intellij" => Self::IntelliJ,
            "clion" => Self::CLion,
            "rider" => Self::Rider,
            "rubymine" => Self::RubyMine,
            "webstorm" => Self::WebStorm,
            "dataspell" => Self::DataSpell,
            "fleet" => Self::Fleet,
            "jupyternotebook" => Self::JupyterNotebook,
            "rstudio" => Self::RStudio,
            other => return Err(UnknownIde(other.to_string())),
        })
    }

    /// Whether an install failure aborts the setup run.
    pub fn error_policy(self) -> ErrorPolicy {
        match self {
            Self::RStudio => ErrorPolicy::LogAndContinue,
            _ => ErrorPolicy::Propagate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorPolicy {
    Propagate,
    LogAndContinue,
}

/// Everything installers need besides the decoded setup result.
pub struct InstallContext<'a> {
    pub invoke: &'a dyn SelfInvoke,
    pub liveness: &'a dyn Liveness,
    /// Directory holding the background-task pid files.
    pub runtime_dir: PathBuf,
    /// Home of the remote user, where editor servers are placed.
    pub home_dir: PathBuf,
    /// Raw compressed setup payload, passed through to re-invocations.
    pub setup_payload: &'a str,
}

pub fn install(setup_result: &SetupResult, ide: &IdeConfig, ctx: &InstallContext) -> Result<()> {
    let kind = IdeKind::from_name(&ide.name)?;
    debug!(kind = ?kind, "installing ide");
    match (dispatch(kind, setup_result, ide, ctx), kind.error_policy()) {
        (Err(e), ErrorPolicy::LogAndContinue) => {
            error!(kind = ?kind, error = ?e, "ide install failed, continuing");
            Ok(())
        }
        (result, _) => result,
    }
}

fn dispatch(
    kind: IdeKind,
    setup_result: &SetupResult,
    ide: &IdeConfig,
    ctx: &InstallContext,
) -> Result<()> {
    match kind {
        IdeKind::None => Ok(()),
        IdeKind::VsCode => vscode::setup(setup_result, ide, &vscode::STABLE, ctx),
        IdeKind::VsCodeInsiders => vscode::setup(setup_result, ide, &vscode::INSIDERS, ctx),
        IdeKind::Cursor => vscode::setup(setup_result, ide, &vscode::CURSOR, ctx),
        IdeKind::Positron => vscode::setup(setup_result, ide, &vscode::POSITRON, ctx),
        IdeKind::Codium => vscode::setup(setup_result, ide, &vscode::CODIUM, ctx),
        IdeKind::Windsurf => vscode::setup(setup_result, ide, &vscode::WINDSURF, ctx),
        IdeKind::OpenVsCode => openvscode::setup(setup_result, ide, ctx),
        IdeKind::Goland => jetbrains::setup(ide, &jetbrains::GOLAND, &ctx.home_dir),
        IdeKind::RustRover => jetbrains::setup(ide, &jetbrains::RUSTROVER, &ctx.home_dir),
        IdeKind::PyCharm => jetbrains::setup(ide, &jetbrains::PYCHARM, &ctx.home_dir),
        IdeKind::PhpStorm => jetbrains::setup(ide, &jetbrains::PHPSTORM, &ctx.home_dir),
        IdeKind::IntelliJ => jetbrains::setup(ide, &jetbrains::INTELLIJ, &ctx.home_dir),
        IdeKind::CLion => jetbrains::setup(ide, &jetbrains::CLION, &ctx.home_dir),
        IdeKind::Rider => jetbrains::setup(ide, &jetbrains::RIDER, &ctx.home_dir),
        IdeKind::RubyMine => jetbrains::setup(ide, &jetbrains::RUBYMINE, &ctx.home_dir),
        IdeKind::WebStorm => jetbrains::setup(ide, &jetbrains::WEBSTORM, &ctx.home_dir),
        IdeKind::DataSpell => jetbrains::setup(ide, &jetbrains::DATASPELL, &ctx.home_dir),
        IdeKind::Fleet => fleet::install(setup_result, ide, &ctx.home_dir),
        IdeKind::JupyterNotebook => jupyter::install(setup_result, ide),
        IdeKind::RStudio => rstudio::install(setup_result, ide),
    }
}

/// Body of `stagehand extensions`: the background re-invocation installing
/// editor extensions for one flavor.
pub fn run_async_install(setup_payload: &str, flavor_id: &str) -> Result<()> {
    let setup_result = SetupResult::decode(setup_payload).context("decode setup info")?;
    let Some(flavor) = vscode::flavor_by_id(flavor_id) else {
        bail!("unknown editor flavor: {flavor_id}");
    };
    let customization = setup_result.vscode_customization();
    let home = user_home(setup_result.remote_user());
    info!(
        flavor = flavor.display_name,
        count = customization.extensions.len(),
        "installing extensions asynchronously"
    );
    vscode::install_extensions(&customization.extensions, flavor, &home)
}

/// Home directory of the remote user; the agent usually runs as root, so
/// resolution cannot rely on $HOME.
pub(crate) fn user_home(user: &str) -> PathBuf {
    if user.is_empty() || user == "root" {
        return PathBuf::from("/root");
    }
    match User::from_name(user) {
        Ok(Some(account)) => account.dir,
        _ => PathBuf::from("/home").join(user),
    }
}

pub(crate) fn download_and_unpack(url: &str, target: &Path) -> Result<()> {
    info!(url, "downloading archive");
    match ureq::get(url).call() {
        Ok(response) => extract::unpack(response.into_reader(), target),
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            bail!("download {url}: body = {body}, status = {code}")
        }
        Err(e) => Err(e).with_context(|| format!("download {url}")),
    }
}

pub(crate) fn download_file(url: &str, target: &Path) -> Result<()> {
    info!(url, "downloading file");
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)?;
    }
    match ureq::get(url).call() {
        Ok(response) => {
            let mut file = fs::File::create(target)
                .with_context(|| format!("create {}", target.display()))?;
            io::copy(&mut response.into_reader(), &mut file)
                .with_context(|| format!("write {}", target.display()))?;
            Ok(())
        }
        Err(ureq::Error::Status(code, response)) => {
            let body = response.into_string().unwrap_or_default();
            bail!("download {url}: body = {body}, status = {code}")
        }
        Err(e) => Err(e).with_context(|| format!("download {url}")),
    }
}
