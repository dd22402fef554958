//! Per-chat advisory locking.
//!
//! Each chat directory carries a `lock` file holding the owner PID as
//! ASCII. Only one process may mutate a chat at a time; stale locks (dead
//! PID or corrupt contents) are reaped silently so a crashed backend never
//! wedges a chat.

use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;

use tracing::debug;
use tracing::warn;

use crate::error::Bb7Err;
use crate::error::Result;

const LOCK_FILENAME: &str = "lock";

fn lock_path(chat_dir: &Path) -> PathBuf {
    chat_dir.join(LOCK_FILENAME)
}

/// Signal-0 existence probe.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // kill(pid, 0) succeeds (or fails with EPERM) iff the process exists.
    let ret = unsafe { libc::kill(pid as libc::pid_t, 0) };
    if ret == 0 {
        return true;
    }
    std::io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // No cheap liveness probe available; treat foreign locks as stale.
    false
}

/// The PID recorded in a lock file, when it parses.
fn read_owner(chat_dir: &Path) -> Option<u32> {
    let raw = std::fs::read_to_string(lock_path(chat_dir)).ok()?;
    raw.trim().parse::<u32>().ok()
}

/// Tracks the lock this process currently holds so it can be released on
/// chat switch and at process exit.
#[derive(Default)]
pub struct LockManager {
    held: Mutex<Option<PathBuf>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the chat directory for this process. Fails with `ChatLocked`
    /// only when the recorded PID belongs to a live foreign process;
    /// corrupt or stale lock files are overwritten.
    pub fn acquire(&self, chat_dir: &Path) -> Result<()> {
        let own_pid = std::process::id();
        if let Some(pid) = read_owner(chat_dir)
            && pid != own_pid
            && pid_alive(pid)
        {
            return Err(Bb7Err::ChatLocked(pid));
        }

        std::fs::write(lock_path(chat_dir), format!("{own_pid}\n"))?;
        #[allow(clippy::unwrap_used)] // poisoned lock state is unrecoverable
        let mut held = self.held.lock().unwrap();
        *held = Some(chat_dir.to_path_buf());
        Ok(())
    }

    /// Best-effort release. Only removes the file when this process owns
    /// it.
    pub fn release(&self, chat_dir: &Path) {
        let own_pid = std::process::id();
        match read_owner(chat_dir) {
            Some(pid) if pid == own_pid => {
                if let Err(e) = std::fs::remove_file(lock_path(chat_dir)) {
                    warn!("failed to release chat lock: {e}");
                }
            }
            Some(pid) => debug!("not releasing lock owned by pid {pid}"),
            None => {}
        }
        #[allow(clippy::unwrap_used)]
        let mut held = self.held.lock().unwrap();
        if held.as_deref() == Some(chat_dir) {
            *held = None;
        }
    }

    /// Release whatever lock is still held. Called once on process exit.
    pub fn cleanup(&self) {
        let dir = {
            #[allow(clippy::unwrap_used)]
            let mut held = self.held.lock().unwrap();
            held.take()
        };
        if let Some(dir) = dir {
            self.release(&dir);
        }
    }

    /// True when a *live foreign* process holds the lock. Stale locks are
    /// reaped as a side effect; self-owned locks never report as locked.
    pub fn is_locked(&self, chat_dir: &Path) -> bool {
        let path = lock_path(chat_dir);
        if !path.exists() {
            return false;
        }
        match read_owner(chat_dir) {
            Some(pid) if pid == std::process::id() => false,
            Some(pid) if pid_alive(pid) => true,
            _ => {
                // Dead owner or corrupt contents.
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!("failed to reap stale lock: {e}");
                }
                false
            }
        }
    }

    /// Unconditional removal, exposed as `chat_force_unlock`.
    pub fn force_unlock(chat_dir: &Path) -> Result<()> {
        match std::fs::remove_file(lock_path(chat_dir)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn acquire_and_release_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = LockManager::new();
        mgr.acquire(tmp.path()).unwrap();
        assert!(tmp.path().join("lock").exists());
        assert!(!mgr.is_locked(tmp.path()), "own lock must not report locked");

        mgr.release(tmp.path());
        assert!(!tmp.path().join("lock").exists());
    }

    #[test]
    fn corrupt_lock_is_reaped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("lock"), "not-a-pid").unwrap();
        let mgr = LockManager::new();
        assert!(!mgr.is_locked(tmp.path()));
        assert!(!tmp.path().join("lock").exists());
    }

    #[test]
    fn stale_pid_is_overwritten_on_acquire() {
        let tmp = tempfile::tempdir().unwrap();
        // PIDs wrap well below this value on every supported platform.
        std::fs::write(tmp.path().join("lock"), "999999999").unwrap();
        let mgr = LockManager::new();
        mgr.acquire(tmp.path()).unwrap();
        let owner = std::fs::read_to_string(tmp.path().join("lock")).unwrap();
        assert_eq!(owner.trim(), std::process::id().to_string());
    }

    #[test]
    fn live_foreign_pid_blocks_acquire() {
        let tmp = tempfile::tempdir().unwrap();
        // PID 1 is always alive on unix.
        #[cfg(unix)]
        {
            std::fs::write(tmp.path().join("lock"), "1").unwrap();
            let mgr = LockManager::new();
            assert!(matches!(
                mgr.acquire(tmp.path()),
                Err(Bb7Err::ChatLocked(1))
            ));
            assert!(mgr.is_locked(tmp.path()));
        }
    }

    #[test]
    fn cleanup_releases_held_lock() {
        let tmp = tempfile::tempdir().unwrap();
        let mgr = LockManager::new();
        mgr.acquire(tmp.path()).unwrap();
        mgr.cleanup();
        assert!(!tmp.path().join("lock").exists());
    }
}
