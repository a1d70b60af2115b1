//! Single-instance lock files.
//!
//! Exactly one watcher and one worker may run against a database. The lock
//! is a pid file created exclusively; a lock whose pid is no longer alive
//! is reclaimed so crashes do not wedge the deployment.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Write;
use std::path::PathBuf;
use tracing::{info, warn};

#[derive(Debug)]
pub struct InstanceLock {
    path: PathBuf,
}

fn pid_is_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from(format!("/proc/{pid}")).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        // Without a portable liveness probe, assume the holder is alive.
        let _ = pid;
        true
    }
}

impl InstanceLock {
    /// Acquire `<db_path>.<component>.lock`. Fails when another live process
    /// holds it.
    pub fn acquire(db_path: &str, component: &str) -> Result<Self> {
        let path = PathBuf::from(format!("{db_path}.{component}.lock"));

        if let Ok(contents) = fs::read_to_string(&path) {
            match contents.trim().parse::<u32>() {
                Ok(pid) if pid != std::process::id() && pid_is_alive(pid) => {
                    bail!(
                        "{component} already running (pid {pid}, lock {})",
                        path.display()
                    );
                }
                _ => {
                    warn!(lock = %path.display(), "reclaiming stale lock file");
                    fs::remove_file(&path).ok();
                }
            }
        }

        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .with_context(|| format!("create lock file {}", path.display()))?;
        write!(file, "{}", std::process::id())?;
        info!(lock = %path.display(), "instance lock acquired");
        Ok(Self { path })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        fs::remove_file(&self.path).ok();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("copybot.db");
        let db_path = db_path.to_str().unwrap();

        let lock = InstanceLock::acquire(db_path, "worker").unwrap();
        let err = InstanceLock::acquire(db_path, "worker").unwrap_err();
        assert!(err.to_string().contains("already running"));

        // A different component locks independently.
        let _watcher = InstanceLock::acquire(db_path, "watcher").unwrap();

        drop(lock);
        let _relocked = InstanceLock::acquire(db_path, "worker").unwrap();
    }

    #[test]
    fn dead_pid_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("copybot.db");
        let db_path = db_path.to_str().unwrap();

        // No live process should have this pid on Linux.
        fs::write(format!("{db_path}.worker.lock"), "4194304").unwrap();
        let _lock = InstanceLock::acquire(db_path, "worker").unwrap();
    }

    #[test]
    fn garbage_lock_contents_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("copybot.db");
        let db_path = db_path.to_str().unwrap();

        fs::write(format!("{db_path}.worker.lock"), "not-a-pid").unwrap();
        let _lock = InstanceLock::acquire(db_path, "worker").unwrap();
    }
}
