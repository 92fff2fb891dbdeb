use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing::{debug, info};

use crate::setup::SetupOptions;
use crate::tunnel::TunnelClient;
use crate::{credentials, daemon, ide, logger, setup};

#[derive(Parser)]
#[command(
    name = "stagehand",
    about = "In-container setup agent for development workspaces",
    version
)]
struct Cli {
    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Set up the container on behalf of the host process
    Setup(SetupArgs),
    /// Watch for inactivity and shut the container down
    Daemon {
        /// Inactivity timeout, e.g. "15m"
        #[arg(long)]
        timeout: String,
    },
    /// Bridge a git/docker credential request to the local credential server
    Credentials {
        /// Port of the credential server started by the setup run
        #[arg(long)]
        port: u16,
        /// Speak the docker credential-helper protocol instead of git's
        #[arg(long)]
        docker: bool,
        /// Helper action; only "get" is served
        action: Option<String>,
    },
    /// Install editor extensions (re-invoked in the background)
    Extensions {
        /// Compressed setup descriptor
        #[arg(long)]
        setup_info: String,
        /// Editor flavor to install for
        #[arg(long)]
        flavor: String,
    },
}

#[derive(Args)]
struct SetupArgs {
    /// Stream the configured bind mounts from the host
    #[arg(long)]
    stream_mounts: bool,
    /// Chown the workspace folder to the remote user
    #[arg(long)]
    chown_workspace: bool,
    /// Configure git credentials during setup
    #[arg(long)]
    inject_git_credentials: bool,
    /// Compressed workspace descriptor
    #[arg(long, default_value = "")]
    workspace_info: String,
    /// Compressed setup descriptor
    #[arg(long)]
    setup_info: String,
    /// Platform access key
    #[arg(long, default_value = "")]
    access_key: String,
    /// Platform host
    #[arg(long, default_value = "")]
    platform_host: String,
    /// Workspace hostname
    #[arg(long, default_value = "")]
    workspace_host: String,
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    logger::init(cli.debug)?;
    info!(args = ?std::env::args().collect::<Vec<_>>(), "stagehand start");

    // any agent invocation counts as container activity
    if let Err(e) = daemon::note_activity() {
        debug!(error = %e, "could not record activity");
    }

    match cli.command {
        Command::Setup(args) => {
            let tunnel = TunnelClient::over_stdio();
            let options = SetupOptions {
                stream_mounts: args.stream_mounts,
                chown_workspace: args.chown_workspace,
                inject_git_credentials: args.inject_git_credentials,
                workspace_info: args.workspace_info,
                setup_info: args.setup_info,
                access_key: args.access_key,
                platform_host: args.platform_host,
                workspace_host: args.workspace_host,
                debug: cli.debug,
            };
            setup::run(&options, &tunnel)
        }
        Command::Daemon { timeout } => daemon::run(&timeout),
        Command::Credentials {
            port,
            docker,
            action,
        } => credentials::run_helper(port, docker, action.as_deref().unwrap_or("get")),
        Command::Extensions { setup_info, flavor } => {
            ide::run_async_install(&setup_info, &flavor)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_requires_setup_info() {
        let result = Cli::try_parse_from(["stagehand", "setup"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_setup_accepts_full_flag_surface() {
        let cli = Cli::try_parse_from([
            "stagehand",
            "setup",
            "--stream-mounts",
            "--chown-workspace",
            "--inject-git-credentials",
            "--workspace-info",
            "abc",
            "--setup-info",
            "def",
            "--access-key",
            "key",
            "--platform-host",
            "host",
            "--workspace-host",
            "ws",
            "--debug",
        ])
        .unwrap();
        assert!(cli.debug);
        match cli.command {
            Command::Setup(args) => {
                assert!(args.stream_mounts);
                assert!(args.chown_workspace);
                assert!(args.inject_git_credentials);
                assert_eq!(args.workspace_info, "abc");
                assert_eq!(args.setup_info, "def");
                assert_eq!(args.access_key, "key");
                assert_eq!(args.platform_host, "host");
                assert_eq!(args.workspace_host, "ws");
            }
            _ => panic!("expected setup subcommand"),
        }
    }

    #[test]
    fn test_setup_rejects_positional_args() {
        let result = Cli::try_parse_from(["stagehand", "setup", "--setup-info", "x", "stray"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_daemon_and_helper_subcommands_parse() {
        let cli = Cli::try_parse_from(["stagehand", "daemon", "--timeout", "15m"]).unwrap();
        assert!(matches!(cli.command, Command::Daemon { .. }));

        let cli =
            Cli::try_parse_from(["stagehand", "credentials", "--port", "4321", "get"]).unwrap();
        match cli.command {
            Command::Credentials {
                port,
                docker,
                action,
            } => {
                assert_eq!(port, 4321);
                assert!(!docker);
                assert_eq!(action.as_deref(), Some("get"));
            }
            _ => panic!("expected credentials subcommand"),
        }

        let cli = Cli::try_parse_from([
            "stagehand",
            "extensions",
            "--setup-info",
            "abc",
            "--flavor",
            "vscode",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Extensions { .. }));
    }
}
