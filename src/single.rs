//! Single-instance guard for detached background tasks.
//!
//! Each task name owns a pid file under the runtime directory. A name whose
//! recorded process is still alive is busy; a dead pid is a stale claim and
//! is silently reclaimed by the next caller. The spawned command is detached
//! into its own process group so the foreground run never waits on it.

use std::fs::{self, OpenOptions};
use std::io::{self, Write as _};
use std::os::unix::process::CommandExt as _;
use std::path::Path;
use std::process::{Command, Stdio};

use anyhow::{Context, Result, bail};
use tracing::debug;

/// Probes whether a recorded process is still alive.
pub trait Liveness {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Real probe: checks signal delivery without sending one.
pub struct ProcessLiveness;

impl Liveness for ProcessLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 {
            return false;
        }
        unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
    }
}

/// Ensures at most one live instance of the named task, spawning the
/// factory's command when the name is free. The factory is not invoked when
/// a live instance already holds the name.
pub fn launch_in<F>(dir: &Path, liveness: &dyn Liveness, name: &str, factory: F) -> Result<()>
where
    F: FnOnce() -> Result<Command>,
{
    let pid_path = dir.join(name);
    for _ in 0..2 {
        match OpenOptions::new().write(true).create_new(true).open(&pid_path) {
            Ok(mut file) => {
                let mut command = match factory() {
                    Ok(command) => command,
                    Err(e) => {
                        let _ = fs::remove_file(&pid_path);
                        return Err(e);
                    }
                };
                command
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .process_group(0);
                let child = match command.spawn() {
                    Ok(child) => child,
                    Err(e) => {
                        let _ = fs::remove_file(&pid_path);
                        return Err(e).with_context(|| format!("spawn background task {name}"));
                    }
                };
                file.write_all(child.id().to_string().as_bytes())
                    .with_context(|| format!("record pid for {name}"))?;
                debug!(name, pid = child.id(), "background task started");
                return Ok(());
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                if let Some(pid) = read_pid(&pid_path)
                    && liveness.is_alive(pid)
                {
                    debug!(name, pid, "background task already running");
                    return Ok(());
                }
                debug!(name, "reclaiming stale background task lock");
                let _ = fs::remove_file(&pid_path);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("claim background task lock {name}"));
            }
        }
    }
    bail!("could not claim background task lock {name}")
}

fn read_pid(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    struct FakeLiveness {
        alive: bool,
    }

    impl Liveness for FakeLiveness {
        fn is_alive(&self, _pid: u32) -> bool {
            self.alive
        }
    }

    fn counting_factory(counter: &Cell<u32>) -> impl FnOnce() -> Result<Command> + '_ {
        move || {
            counter.set(counter.get() + 1);
            Ok(Command::new("true"))
        }
    }

    #[test]
    fn test_launch_spawns_and_records_pid() {
        let td = tempfile::tempdir().unwrap();
        let spawned = Cell::new(0);
        launch_in(
            td.path(),
            &FakeLiveness { alive: true },
            "task.pid",
            counting_factory(&spawned),
        )
        .unwrap();
        assert_eq!(spawned.get(), 1);
        let pid: u32 = fs::read_to_string(td.path().join("task.pid"))
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert!(pid > 0);
    }

    #[test]
    fn test_second_launch_is_a_no_op_while_alive() {
        let td = tempfile::tempdir().unwrap();
        let liveness = FakeLiveness { alive: true };
        let spawned = Cell::new(0);
        launch_in(td.path(), &liveness, "task.pid", counting_factory(&spawned)).unwrap();
        launch_in(td.path(), &liveness, "task.pid", counting_factory(&spawned)).unwrap();
        assert_eq!(spawned.get(), 1, "factory must not run for a live task");
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("task.pid"), "999999").unwrap();
        let spawned = Cell::new(0);
        launch_in(
            td.path(),
            &FakeLiveness { alive: false },
            "task.pid",
            counting_factory(&spawned),
        )
        .unwrap();
        assert_eq!(spawned.get(), 1);
        let recorded = fs::read_to_string(td.path().join("task.pid")).unwrap();
        assert_ne!(recorded.trim(), "999999");
    }

    #[test]
    fn test_unreadable_pid_counts_as_stale() {
        let td = tempfile::tempdir().unwrap();
        fs::write(td.path().join("task.pid"), "not-a-pid").unwrap();
        let spawned = Cell::new(0);
        launch_in(
            td.path(),
            &FakeLiveness { alive: true },
            "task.pid",
            counting_factory(&spawned),
        )
        .unwrap();
        assert_eq!(spawned.get(), 1);
    }

    #[test]
    fn test_factory_failure_releases_the_claim() {
        let td = tempfile::tempdir().unwrap();
        let result = launch_in(
            td.path(),
            &FakeLiveness { alive: false },
            "task.pid",
            || bail!("no command"),
        );
        assert!(result.is_err());
        assert!(!td.path().join("task.pid").exists());
    }
}
