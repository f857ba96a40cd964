//! Deployment locking.
//!
//! Whole-deployment workflows (deploy, destroy, rollback) hold an exclusive
//! lock keyed by deployment id. The lock is taken in two places: a
//! process-wide registry, so two workflows in one process cannot overlap, and
//! a lock file next to the state, so two processes on the same host cannot.
//! Nothing protects against the provider changing out-of-band; `check()`
//! handles that.

use std::collections::HashSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::{Result, StateError};

/// Lock expiry in seconds; a lock older than this is considered stale.
pub const LOCK_EXPIRY_SECS: i64 = 6 * 60 * 60;

/// Deployments locked by this process.
static HELD: LazyLock<Mutex<HashSet<String>>> = LazyLock::new(|| Mutex::new(HashSet::new()));

/// Information stored in a lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique lock identifier.
    pub lock_id: String,
    /// Locked deployment.
    pub deployment: String,
    /// Who holds the lock.
    pub holder: String,
    /// When the lock was acquired.
    pub acquired_at: DateTime<Utc>,
    /// When the lock expires.
    pub expires_at: DateTime<Utc>,
}

impl LockInfo {
    /// Creates lock info for `deployment`, held by this process.
    #[must_use]
    pub fn new(deployment: &str) -> Self {
        let now = Utc::now();
        Self {
            lock_id: Uuid::new_v4().to_string(),
            deployment: deployment.to_string(),
            holder: generate_holder_id(),
            acquired_at: now,
            expires_at: now + chrono::Duration::seconds(LOCK_EXPIRY_SECS),
        }
    }

    /// Checks if the lock has expired.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }

    /// Returns the remaining time until expiry in seconds.
    #[must_use]
    pub fn remaining_secs(&self) -> i64 {
        let remaining = self.expires_at - Utc::now();
        remaining.num_seconds().max(0)
    }
}

/// Exclusive lock on one deployment, released on drop.
#[derive(Debug)]
pub struct DeploymentLock {
    info: LockInfo,
    /// Lock file, when locking across processes.
    path: Option<PathBuf>,
    released: bool,
}

impl DeploymentLock {
    /// Acquires the lock for `deployment`.
    ///
    /// With `dir` set, a lock file `<dir>/<deployment>.lock` is created as
    /// well; an expired lock file left by a crashed process is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::LockedByOther`] if the deployment is already
    /// locked, or [`StateError::LockFailed`] if the lock file cannot be
    /// written.
    pub fn acquire(dir: Option<&Path>, deployment: &str) -> Result<Self> {
        if !HELD.lock().insert(deployment.to_string()) {
            return Err(StateError::LockedByOther {
                holder: String::from("this process"),
                since: String::from("an operation still running"),
            }
            .into());
        }

        let info = LockInfo::new(deployment);
        let path = dir.map(|dir| lock_path(dir, deployment));

        if let Some(path) = &path {
            if let Err(err) = create_lock_file(path, &info) {
                HELD.lock().remove(deployment);
                return Err(err);
            }
        }

        debug!(deployment, holder = %info.holder, "Deployment lock acquired");
        Ok(Self {
            info,
            path,
            released: false,
        })
    }

    /// Lock info.
    #[must_use]
    pub const fn info(&self) -> &LockInfo {
        &self.info
    }

    /// Releases the lock.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be removed.
    pub fn release(mut self) -> Result<()> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        HELD.lock().remove(&self.info.deployment);

        if let Some(path) = &self.path {
            // Only remove the file if it is still ours.
            match read_lock_file(path)? {
                Some(current) if current.lock_id == self.info.lock_id => {
                    fs::remove_file(path).map_err(|e| StateError::LockFailed {
                        message: format!("Failed to remove lock file: {e}"),
                    })?;
                }
                Some(current) => {
                    warn!(
                        "Lock file {} now belongs to {}; leaving it in place",
                        path.display(),
                        current.holder
                    );
                }
                None => {}
            }
        }
        debug!(deployment = %self.info.deployment, "Deployment lock released");
        Ok(())
    }

    /// Reads the lock file for `deployment`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file exists but cannot be read.
    pub fn current(dir: &Path, deployment: &str) -> Result<Option<LockInfo>> {
        read_lock_file(&lock_path(dir, deployment))
    }

    /// Removes the lock file for `deployment` regardless of its holder.
    ///
    /// Returns whether a lock file was removed.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be removed.
    pub fn force_unlock(dir: &Path, deployment: &str) -> Result<bool> {
        let path = lock_path(dir, deployment);
        match fs::remove_file(&path) {
            Ok(()) => {
                warn!("Removed lock file {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StateError::LockFailed {
                message: format!("Failed to remove lock file: {e}"),
            }
            .into()),
        }
    }
}

impl Drop for DeploymentLock {
    fn drop(&mut self) {
        if let Err(err) = self.release_inner() {
            warn!("Failed to release deployment lock: {err}");
        }
    }
}

fn lock_path(dir: &Path, deployment: &str) -> PathBuf {
    dir.join(format!("{deployment}.lock"))
}

fn create_lock_file(path: &Path, info: &LockInfo) -> Result<()> {
    let lock_failed = |e: &dyn std::fmt::Display| StateError::LockFailed {
        message: format!("{}: {e}", path.display()),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| lock_failed(&e))?;
    }
    let content = serde_json::to_string_pretty(info).map_err(|e| lock_failed(&e))?;

    // One retry after clearing a stale lock.
    for _ in 0..2 {
        match fs::OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                file.write_all(content.as_bytes())
                    .map_err(|e| lock_failed(&e))?;
                return Ok(());
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match read_lock_file(path)? {
                    Some(existing) if !existing.is_expired() => {
                        return Err(StateError::LockedByOther {
                            holder: existing.holder,
                            since: existing.acquired_at.to_rfc3339(),
                        }
                        .into());
                    }
                    Some(existing) => {
                        warn!(
                            "Replacing expired lock held by {} since {}",
                            existing.holder, existing.acquired_at
                        );
                        fs::remove_file(path).map_err(|e| lock_failed(&e))?;
                    }
                    None => {}
                }
            }
            Err(e) => return Err(lock_failed(&e).into()),
        }
    }

    Err(StateError::LockFailed {
        message: format!("{}: lock file keeps reappearing", path.display()),
    }
    .into())
}

fn read_lock_file(path: &Path) -> Result<Option<LockInfo>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(StateError::LockFailed {
                message: format!("Failed to read lock file {}: {e}", path.display()),
            }
            .into());
        }
    };
    let info = serde_json::from_str(&content).map_err(|e| {
        StateError::corrupted(format!("Invalid lock file {}: {e}", path.display()))
    })?;
    Ok(Some(info))
}

/// Generates a unique holder identifier for the current process.
#[must_use]
pub fn generate_holder_id() -> String {
    let hostname = hostname::get().map_or_else(
        |_| String::from("unknown"),
        |h| h.to_string_lossy().to_string(),
    );

    let pid = std::process::id();
    let uuid = Uuid::new_v4().simple().to_string();

    format!("{hostname}-{pid}-{}", &uuid[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeployError;
    use tempfile::TempDir;

    fn is_locked_by_other(result: Result<DeploymentLock>) -> bool {
        matches!(
            result,
            Err(DeployError::State(StateError::LockedByOther { .. }))
        )
    }

    #[test]
    fn test_lock_is_exclusive_within_process() {
        let lock = DeploymentLock::acquire(None, "dep-exclusive").expect("first acquire");
        assert!(is_locked_by_other(DeploymentLock::acquire(
            None,
            "dep-exclusive"
        )));
        assert!(!lock.info().is_expired());

        lock.release().expect("release");
        let again = DeploymentLock::acquire(None, "dep-exclusive").expect("re-acquire");
        drop(again);
    }

    #[test]
    fn test_lock_file_blocks_other_processes() {
        let temp = TempDir::new().expect("temp dir");
        let lock = DeploymentLock::acquire(Some(temp.path()), "dep-file").expect("acquire");
        let current = DeploymentLock::current(temp.path(), "dep-file")
            .expect("read")
            .expect("lock file exists");
        assert_eq!(current.lock_id, lock.info().lock_id);

        // Simulate another process: the registry is free but the file remains.
        HELD.lock().remove("dep-file");
        assert!(is_locked_by_other(DeploymentLock::acquire(
            Some(temp.path()),
            "dep-file"
        )));

        HELD.lock().insert(String::from("dep-file"));
        drop(lock);
        assert!(
            DeploymentLock::current(temp.path(), "dep-file")
                .expect("read")
                .is_none()
        );
    }

    #[test]
    fn test_expired_lock_is_replaced() {
        let temp = TempDir::new().expect("temp dir");
        let mut stale = LockInfo::new("dep-stale");
        stale.expires_at = Utc::now() - chrono::Duration::seconds(1);
        fs::write(
            lock_path(temp.path(), "dep-stale"),
            serde_json::to_string(&stale).expect("encode"),
        )
        .expect("write stale lock");

        let lock = DeploymentLock::acquire(Some(temp.path()), "dep-stale").expect("acquire");
        assert_ne!(lock.info().lock_id, stale.lock_id);
    }

    #[test]
    fn test_force_unlock() {
        let temp = TempDir::new().expect("temp dir");
        let lock = DeploymentLock::acquire(Some(temp.path()), "dep-force").expect("acquire");
        assert!(DeploymentLock::force_unlock(temp.path(), "dep-force").expect("unlock"));
        assert!(!DeploymentLock::force_unlock(temp.path(), "dep-force").expect("unlock"));
        lock.release().expect("release tolerates a missing file");
    }

    #[test]
    fn test_holder_id_generation() {
        let id1 = generate_holder_id();
        let id2 = generate_holder_id();

        assert_ne!(id1, id2);
        assert!(id1.contains(&std::process::id().to_string()));
    }
}
