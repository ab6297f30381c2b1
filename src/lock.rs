//! File-based mutual exclusion between coordinating processes.
//!
//! One JSON lock record per resource under the control locks directory.
//! Acquisition is non-blocking and atomic (`create_new`, O_EXCL on unix);
//! staleness is decided by record age against a TTL, never by guessing at
//! holder liveness.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::LockError;

/// On-disk lock record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub resource: String,
    pub owner: Uuid,
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Manages lock files for one process. Each manager holds a unique owner
/// token; only the manager that wrote a lock can release it or prove
/// ownership.
pub struct LockManager {
    locks_dir: PathBuf,
    owner: Uuid,
    ttl_secs: i64,
}

impl LockManager {
    pub fn new(locks_dir: PathBuf, ttl_secs: i64) -> Self {
        Self {
            locks_dir,
            owner: Uuid::new_v4(),
            ttl_secs,
        }
    }

    pub fn owner(&self) -> Uuid {
        self.owner
    }

    fn lock_path(&self, resource: &str) -> PathBuf {
        self.locks_dir.join(format!("{resource}.lock"))
    }

    /// Try to acquire `resource`. Returns `Ok(false)` when another live
    /// owner holds it; a stale or unreadable record is removed and the
    /// acquisition retried once.
    pub fn acquire_lock(&self, resource: &str) -> Result<bool, LockError> {
        std::fs::create_dir_all(&self.locks_dir)?;
        match self.try_create(resource) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let path = self.lock_path(resource);
                match read_lock_info(&path) {
                    Ok(info) if !self.is_stale(&info) => {
                        debug!(resource, holder_pid = info.pid, "lock held by live owner");
                        Ok(false)
                    }
                    Ok(info) => {
                        warn!(resource, holder_pid = info.pid, "removing stale lock");
                        std::fs::remove_file(&path).map_err(|source| LockError::ReleaseFailed {
                            path: path.clone(),
                            source,
                        })?;
                        self.try_create(resource)
                            .map(|()| true)
                            .or_else(io_exists_to_false(&path))
                    }
                    Err(err) => {
                        // An unreadable record cannot prove a live holder, so
                        // it is treated like a stale one.
                        warn!(resource, error = %err, "removing corrupted lock");
                        std::fs::remove_file(&path).map_err(|source| LockError::ReleaseFailed {
                            path: path.clone(),
                            source,
                        })?;
                        self.try_create(resource)
                            .map(|()| true)
                            .or_else(io_exists_to_false(&path))
                    }
                }
            }
            Err(source) => Err(LockError::WriteFailed {
                path: self.lock_path(resource),
                source,
            }),
        }
    }

    fn try_create(&self, resource: &str) -> std::io::Result<()> {
        use std::io::Write;
        let path = self.lock_path(resource);
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)?;
        let info = LockInfo {
            resource: resource.to_string(),
            owner: self.owner,
            pid: std::process::id(),
            acquired_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&info)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        Ok(())
    }

    /// Release `resource` if this manager owns it. Returns whether a lock
    /// was actually removed; another owner's lock is left untouched.
    pub fn release_lock(&self, resource: &str) -> Result<bool, LockError> {
        let path = self.lock_path(resource);
        if !path.exists() {
            return Ok(false);
        }
        match read_lock_info(&path) {
            Ok(info) if info.owner == self.owner => {
                std::fs::remove_file(&path).map_err(|source| LockError::ReleaseFailed {
                    path: path.clone(),
                    source,
                })?;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(err) => {
                warn!(resource, error = %err, "refusing to release unreadable lock");
                Ok(false)
            }
        }
    }

    /// The current lock record for `resource`, if one is readable.
    pub fn holder(&self, resource: &str) -> Option<LockInfo> {
        read_lock_info(&self.lock_path(resource)).ok()
    }

    /// Whether this manager currently holds a valid lock on `resource`.
    pub fn is_lock_owner(&self, resource: &str) -> bool {
        read_lock_info(&self.lock_path(resource))
            .map(|info| info.owner == self.owner)
            .unwrap_or(false)
    }

    /// Remove every lock record older than the TTL. Returns the count
    /// removed. Unreadable records count as stale.
    pub fn cleanup_stale_locks(&self) -> usize {
        let Ok(entries) = std::fs::read_dir(&self.locks_dir) else {
            return 0;
        };
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("lock") {
                continue;
            }
            let stale = match read_lock_info(&path) {
                Ok(info) => self.is_stale(&info),
                Err(_) => true,
            };
            if stale && std::fs::remove_file(&path).is_ok() {
                debug!(path = %path.display(), "removed stale lock");
                removed += 1;
            }
        }
        removed
    }

    fn is_stale(&self, info: &LockInfo) -> bool {
        let age = Utc::now().signed_duration_since(info.acquired_at);
        age.num_seconds() > self.ttl_secs
    }
}

fn read_lock_info(path: &Path) -> Result<LockInfo, LockError> {
    let raw = std::fs::read_to_string(path)?;
    serde_json::from_str(&raw).map_err(|e| LockError::Corrupted {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

// Lost the retry race to another process: that is an ordinary "held" answer.
fn io_exists_to_false(path: &Path) -> impl FnOnce(std::io::Error) -> Result<bool, LockError> + '_ {
    move |e| {
        if e.kind() == std::io::ErrorKind::AlreadyExists {
            Ok(false)
        } else {
            Err(LockError::WriteFailed {
                path: path.to_path_buf(),
                source: e,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const RESOURCE: &str = "orchestration";

    fn manager(dir: &Path) -> LockManager {
        LockManager::new(dir.join("locks"), 3600)
    }

    #[test]
    fn acquire_then_second_acquire_fails_until_release() {
        let dir = tempdir().unwrap();
        let first = manager(dir.path());
        let second = manager(dir.path());

        assert!(first.acquire_lock(RESOURCE).unwrap());
        assert!(!second.acquire_lock(RESOURCE).unwrap());

        assert!(first.release_lock(RESOURCE).unwrap());
        assert!(second.acquire_lock(RESOURCE).unwrap());
    }

    #[test]
    fn ownership_tracks_the_acquiring_manager() {
        let dir = tempdir().unwrap();
        let owner = manager(dir.path());
        let other = manager(dir.path());

        assert!(owner.acquire_lock(RESOURCE).unwrap());
        assert!(owner.is_lock_owner(RESOURCE));
        assert!(!other.is_lock_owner(RESOURCE));
    }

    #[test]
    fn release_by_non_owner_leaves_lock_in_place() {
        let dir = tempdir().unwrap();
        let owner = manager(dir.path());
        let other = manager(dir.path());

        assert!(owner.acquire_lock(RESOURCE).unwrap());
        assert!(!other.release_lock(RESOURCE).unwrap());
        assert!(owner.is_lock_owner(RESOURCE));
    }

    #[test]
    fn stale_lock_is_reclaimed_on_acquire() {
        let dir = tempdir().unwrap();
        let locks_dir = dir.path().join("locks");
        std::fs::create_dir_all(&locks_dir).unwrap();
        let stale = LockInfo {
            resource: RESOURCE.to_string(),
            owner: Uuid::new_v4(),
            pid: 99999,
            acquired_at: Utc::now() - chrono::Duration::seconds(7200),
        };
        std::fs::write(
            locks_dir.join(format!("{RESOURCE}.lock")),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let mgr = LockManager::new(locks_dir, 3600);
        assert!(mgr.acquire_lock(RESOURCE).unwrap());
        assert!(mgr.is_lock_owner(RESOURCE));
    }

    #[test]
    fn corrupted_lock_is_reclaimed_on_acquire() {
        let dir = tempdir().unwrap();
        let locks_dir = dir.path().join("locks");
        std::fs::create_dir_all(&locks_dir).unwrap();
        std::fs::write(locks_dir.join(format!("{RESOURCE}.lock")), "not json").unwrap();

        let mgr = LockManager::new(locks_dir, 3600);
        assert!(mgr.acquire_lock(RESOURCE).unwrap());
    }

    #[test]
    fn cleanup_removes_only_stale_records() {
        let dir = tempdir().unwrap();
        let locks_dir = dir.path().join("locks");
        std::fs::create_dir_all(&locks_dir).unwrap();

        let fresh = manager(dir.path());
        assert!(fresh.acquire_lock("fresh-resource").unwrap());

        let stale = LockInfo {
            resource: "old-resource".to_string(),
            owner: Uuid::new_v4(),
            pid: 1,
            acquired_at: Utc::now() - chrono::Duration::seconds(7200),
        };
        std::fs::write(
            locks_dir.join("old-resource.lock"),
            serde_json::to_string(&stale).unwrap(),
        )
        .unwrap();

        let removed = fresh.cleanup_stale_locks();
        assert_eq!(removed, 1);
        assert!(fresh.is_lock_owner("fresh-resource"));
        assert!(!locks_dir.join("old-resource.lock").exists());
    }

    #[test]
    fn release_of_missing_lock_is_false_not_error() {
        let dir = tempdir().unwrap();
        let mgr = manager(dir.path());
        assert!(!mgr.release_lock("never-acquired").unwrap());
    }
}
