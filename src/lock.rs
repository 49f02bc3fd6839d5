//! Migration Lock
//!
//! One migration at a time, enforced by an exclusively-created lock file
//! under the user-data root. The guard releases the lock on drop, which
//! covers both normal exits and panic unwinds.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{MigrationError, MigrationErrorKind, MigrationResult};

#[derive(Debug)]
pub struct MigrationLock {
    path: PathBuf,
}

impl MigrationLock {
    /// Acquire the lock, reclaiming stale ones left behind by crashed runs.
    pub fn acquire(path: PathBuf, stale_after: Duration) -> MigrationResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                MigrationError::new(
                    MigrationErrorKind::PermissionDenied,
                    "lock:acquire",
                    e.to_string(),
                )
            })?;
        }

        match Self::try_create(&path) {
            Ok(lock) => Ok(lock),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                if Self::is_stale(&path, stale_after) {
                    tracing::warn!(
                        "reclaiming stale migration lock {} (older than {:?})",
                        path.display(),
                        stale_after
                    );
                    let _ = fs::remove_file(&path);
                    Self::try_create(&path).map_err(|e| {
                        MigrationError::new(
                            MigrationErrorKind::ConnectionFailed,
                            "lock:acquire",
                            e.to_string(),
                        )
                    })
                } else {
                    Err(MigrationError::new(
                        MigrationErrorKind::ConnectionFailed,
                        "lock:acquire",
                        format!("migration lock {} is held by another run", path.display()),
                    )
                    .with_user_message(
                        "Another migration appears to be running. Wait for it to finish and retry."
                            .to_string(),
                    ))
                }
            }
            Err(e) => Err(MigrationError::new(
                MigrationErrorKind::PermissionDenied,
                "lock:acquire",
                e.to_string(),
            )),
        }
    }

    fn try_create(path: &PathBuf) -> std::io::Result<Self> {
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)?;
        writeln!(
            file,
            "pid={} acquired_at={}",
            std::process::id(),
            chrono::Utc::now().to_rfc3339()
        )?;
        Ok(Self { path: path.clone() })
    }

    fn is_stale(path: &PathBuf, stale_after: Duration) -> bool {
        fs::metadata(path)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|t| t.elapsed().ok())
            .map(|age| age > stale_after)
            .unwrap_or(false)
    }
}

impl Drop for MigrationLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::warn!("failed to release migration lock {}: {}", self.path.display(), e);
        } else {
            tracing::debug!("released migration lock {}", self.path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_is_exclusive_and_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".migration.lock");

        let lock = MigrationLock::acquire(path.clone(), Duration::from_secs(3600)).unwrap();
        let second = MigrationLock::acquire(path.clone(), Duration::from_secs(3600));
        assert!(second.is_err());
        assert_eq!(
            second.unwrap_err().kind,
            MigrationErrorKind::ConnectionFailed
        );

        drop(lock);
        assert!(!path.exists());
        let third = MigrationLock::acquire(path.clone(), Duration::from_secs(3600));
        assert!(third.is_ok());
    }

    #[test]
    fn stale_locks_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".migration.lock");
        fs::write(&path, b"pid=0 acquired_at=long-ago").unwrap();

        // Zero tolerance makes the fresh file count as stale immediately.
        let lock = MigrationLock::acquire(path.clone(), Duration::from_secs(0));
        assert!(lock.is_ok());
    }

    #[test]
    fn lock_survives_panic_unwind() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".migration.lock");
        let path_clone = path.clone();

        let result = std::panic::catch_unwind(move || {
            let _lock =
                MigrationLock::acquire(path_clone, Duration::from_secs(3600)).unwrap();
            panic!("simulated crash");
        });
        assert!(result.is_err());
        // The unwind dropped the guard and released the lock.
        assert!(!path.exists());
    }
}
