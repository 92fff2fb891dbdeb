mod builder;
mod cli;
mod cmd;
mod container;
mod credentials;
mod daemon;
mod envfile;
mod extract;
mod ide;
mod logger;
mod mounts;
mod paths;
mod payload;
mod repo;
mod selfexec;
mod setup;
mod single;
mod tunnel;
mod workspace;

use anyhow::Result;
use tracing::{error, info};

fn main() -> Result<()> {
    match cli::run() {
        Ok(result) => {
            info!("stagehand finished successfully");
            Ok(result)
        }
        Err(err) => {
            error!(error = ?err, "stagehand failed");
            Err(err)
        }
    }
}
