//! Exclusive single-instance lock over a project.
//!
//! Cooperative file lock at `.evonest/.lock` holding the owner's process
//! identity. Acquisition is open-create-exclusive; when the file already
//! exists the recorded pid is probed, and a dead owner's lock is reclaimed
//! so a crashed engine never deadlocks the project. Released on drop.

use std::io::Write;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{EngineError, EngineResult};
use crate::state::ProjectState;

/// Identity of the process that holds a lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

impl LockInfo {
    fn current() -> Self {
        Self {
            pid: std::process::id(),
            hostname: std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string()),
            acquired_at: Utc::now(),
        }
    }
}

/// Held lock. Dropping it removes the lock file.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    /// Acquire the project lock, reclaiming it from a dead owner.
    ///
    /// The lock file is materialized by hard-linking a fully-written temp
    /// file into place, so competitors can never observe a half-written
    /// owner record and mistake a live lock for a corrupt one.
    pub fn acquire(state: &ProjectState) -> EngineResult<Self> {
        let path = state.lock_path();
        let info = LockInfo::current();
        let body = serde_json::to_string_pretty(&info)
            .map_err(|e| EngineError::corrupt(&path, e.to_string()))?;
        // Unique per acquire attempt: threads within one process may race
        // for the same lock.
        static STAGING_SEQ: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let seq = STAGING_SEQ.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let staging = path.with_file_name(format!(".lock.{}-{seq}.tmp", info.pid));
        {
            let mut file = std::fs::File::create(&staging)?;
            file.write_all(body.as_bytes())?;
        }

        // Two attempts: the second runs after a stale lock was cleared.
        for attempt in 0..2 {
            match std::fs::hard_link(&staging, &path) {
                Ok(()) => {
                    remove_quiet(&staging);
                    debug!(pid = info.pid, path = %path.display(), "lock acquired");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists && attempt == 0 => {
                    if let Err(held) = Self::clear_if_stale(state) {
                        remove_quiet(&staging);
                        return Err(held);
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    // Raced another instance between clear and re-link.
                    remove_quiet(&staging);
                    let pid = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|body| serde_json::from_str::<LockInfo>(&body).ok())
                        .map(|other| other.pid)
                        .unwrap_or(0);
                    return Err(EngineError::LockHeld { pid });
                }
                Err(e) => {
                    remove_quiet(&staging);
                    return Err(e.into());
                }
            }
        }
        unreachable!("lock acquisition loop always returns");
    }

    /// Remove the lock file when its recorded owner is no longer alive.
    /// Errors with `LockHeld` when the owner is still running.
    fn clear_if_stale(state: &ProjectState) -> EngineResult<()> {
        let path = state.lock_path();
        let info = match std::fs::read_to_string(&path) {
            Ok(body) => serde_json::from_str::<LockInfo>(&body).ok(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        match info {
            Some(info) if process_alive(info.pid) => {
                Err(EngineError::LockHeld { pid: info.pid })
            }
            Some(info) => {
                warn!(
                    stale_pid = info.pid,
                    acquired_at = %info.acquired_at,
                    "reclaiming lock from dead process"
                );
                remove_quiet(&path);
                Ok(())
            }
            None => {
                // Unreadable lock file: the previous owner crashed mid-write.
                warn!(path = %path.display(), "reclaiming corrupt lock file");
                remove_quiet(&path);
                Ok(())
            }
        }
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        remove_quiet(&self.path);
        debug!(path = %self.path.display(), "lock released");
    }
}

fn remove_quiet(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to remove lock file");
        }
    }
}

/// Probe whether a pid refers to a live process.
///
/// The current process counts as alive: a lock recorded under our own pid
/// means a double acquisition, which must refuse rather than reclaim.
#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    if pid == 0 {
        return false;
    }
    if pid == std::process::id() {
        return true;
    }
    // kill(pid, 0) probes existence without signaling; EPERM still proves
    // the process exists.
    let rc = unsafe { libc::kill(pid as libc::pid_t, 0) };
    rc == 0 || std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    // No cheap probe available; refuse to reclaim rather than risk two
    // writers.
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn fresh() -> (tempfile::TempDir, ProjectState) {
        let dir = tempdir().unwrap();
        let state = ProjectState::init_project(dir.path()).unwrap();
        (dir, state)
    }

    #[test]
    fn acquire_release_cycle() {
        let (_dir, state) = fresh();
        let guard = LockGuard::acquire(&state).unwrap();
        assert!(state.lock_path().exists());
        guard.release();
        assert!(!state.lock_path().exists());

        // Reacquirable after release.
        let _guard = LockGuard::acquire(&state).unwrap();
    }

    #[test]
    fn second_acquire_refuses_while_held() {
        let (_dir, state) = fresh();
        let _guard = LockGuard::acquire(&state).unwrap();
        let err = LockGuard::acquire(&state).unwrap_err();
        assert!(matches!(err, EngineError::LockHeld { .. }));
        assert_eq!(err.exit_code(), 2);
    }

    #[cfg(unix)]
    #[test]
    fn stale_lock_is_reclaimed() {
        let (_dir, state) = fresh();
        let dead = LockInfo {
            // Far above any default pid_max.
            pid: 0x7fff_fff0,
            hostname: "gone".into(),
            acquired_at: Utc::now(),
        };
        std::fs::write(
            state.lock_path(),
            serde_json::to_string(&dead).unwrap(),
        )
        .unwrap();

        let guard = LockGuard::acquire(&state).unwrap();
        let body = std::fs::read_to_string(state.lock_path()).unwrap();
        let info: LockInfo = serde_json::from_str(&body).unwrap();
        assert_eq!(info.pid, std::process::id());
        drop(guard);
    }

    #[test]
    fn corrupt_lock_is_reclaimed() {
        let (_dir, state) = fresh();
        std::fs::write(state.lock_path(), "garbage").unwrap();
        let _guard = LockGuard::acquire(&state).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn live_foreign_process_refuses() {
        let (_dir, state) = fresh();
        let mut child = std::process::Command::new("sleep")
            .arg("30")
            .spawn()
            .unwrap();
        let live = LockInfo {
            pid: child.id(),
            hostname: "here".into(),
            acquired_at: Utc::now(),
        };
        std::fs::write(state.lock_path(), serde_json::to_string(&live).unwrap()).unwrap();

        let err = LockGuard::acquire(&state).unwrap_err();
        assert!(matches!(err, EngineError::LockHeld { pid } if pid == live.pid));

        child.kill().unwrap();
        child.wait().unwrap();
    }
}
