//! Re-invocation of the running agent binary.
//!
//! Background tasks (async extension installs, the inactivity daemon) and
//! credential helpers re-enter the agent with their own subcommands. The
//! capability is a trait so tests can substitute a harmless binary.

use std::env;
use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result};

pub trait SelfInvoke {
    /// Absolute path of the binary to re-enter.
    fn binary_path(&self) -> Result<PathBuf>;

    /// A command re-entering the program with the given arguments.
    fn command(&self, args: &[&str]) -> Result<Command> {
        let mut command = Command::new(self.binary_path()?);
        command.args(args);
        Ok(command)
    }
}

/// Production impl: the currently running executable.
pub struct CurrentExe;

impl SelfInvoke for CurrentExe {
    fn binary_path(&self) -> Result<PathBuf> {
        env::current_exe().context("locate running agent binary")
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_carries_args() {
        let invoke = testutil::FixedBinary(PathBuf::from("/bin/true"));
        let command = invoke.command(&["daemon", "--timeout", "15m"]).unwrap();
        let args: Vec<_> = command.get_args().map(|a| a.to_string_lossy()).collect();
        assert_eq!(args, ["daemon", "--timeout", "15m"]);
        assert_eq!(command.get_program(), "/bin/true");
    }
}
