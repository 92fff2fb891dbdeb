use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::process::{Command, Output};
use tracing::{debug, trace};

/// A builder for executing shell commands with unified error handling
pub struct Cmd<'a> {
    command: &'a str,
    args: Vec<&'a str>,
    workdir: Option<&'a Path>,
    env: Vec<(&'a str, &'a str)>,
}

impl<'a> Cmd<'a> {
    /// Create a new command builder
    pub fn new(command: &'a str) -> Self {
        Self {
            command,
            args: Vec::new(),
            workdir: None,
            env: Vec::new(),
        }
    }

    /// Add a single argument
    pub fn arg(mut self, arg: &'a str) -> Self {
        self.args.push(arg);
        self
    }

    /// Add multiple arguments
    pub fn args(mut self, args: &[&'a str]) -> Self {
        self.args.extend_from_slice(args);
        self
    }

    /// Set the working directory for the command
    pub fn workdir(mut self, path: &'a Path) -> Self {
        self.workdir = Some(path);
        self
    }

    /// Set an environment variable for the child process
    pub fn env(mut self, key: &'a str, value: &'a str) -> Self {
        self.env.push((key, value));
        self
    }

    fn build(&self) -> Command {
        let mut cmd = Command::new(self.command);
        if let Some(dir) = self.workdir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.args(&self.args);
        cmd
    }

    /// Execute the command and return the output
    /// Returns an error if the command fails (non-zero exit code)
    pub fn run(self) -> Result<Output> {
        let workdir_display = self.workdir.map(|p| p.display().to_string());
        trace!(command = self.command, args = ?self.args, workdir = ?workdir_display, "cmd:run start");

        let output = self.build().output().with_context(|| {
            format!(
                "Failed to execute command: {} {}",
                self.command,
                self.args.join(" ")
            )
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            debug!(
                command = self.command,
                args = ?self.args,
                status = ?output.status.code(),
                stderr = %stderr.trim(),
                "cmd:run failure"
            );
            return Err(anyhow!(
                "Command failed: {} {}\n{}",
                self.command,
                self.args.join(" "),
                stderr.trim()
            ));
        }
        trace!(command = self.command, "cmd:run success");
        Ok(output)
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_captures_stdout() {
        let output = Cmd::new("echo").arg("hello").run().unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "hello");
    }

    #[test]
    fn test_run_fails_on_nonzero_exit() {
        let result = Cmd::new("false").run();
        assert!(result.is_err());
    }

    #[test]
    fn test_workdir_applies() {
        let td = tempfile::tempdir().unwrap();
        let output = Cmd::new("pwd").workdir(td.path()).run().unwrap();
        let reported = String::from_utf8_lossy(&output.stdout);
        let canonical = std::fs::canonicalize(td.path()).unwrap();
        assert_eq!(reported.trim(), canonical.display().to_string());
    }

    #[test]
    fn test_env_reaches_child() {
        let output = Cmd::new("sh")
            .args(&["-c", "printf %s \"$STAGEHAND_CMD_TEST\""])
            .env("STAGEHAND_CMD_TEST", "wired")
            .run()
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "wired");
    }
}
