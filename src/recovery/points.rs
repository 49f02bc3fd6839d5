//! Recovery Points
//!
//! A capped, newest-first list of named restore anchors persisted as JSON
//! under the user-data root. The file is always rewritten through a temp
//! file and a rename so a crash never leaves it half-written.

use std::fs;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::backup::Backup;
use crate::error::{MigrationError, MigrationResult};
use crate::progress::MigrationPhase;
use crate::recovery::state::SystemState;

/// Maximum number of recovery points kept on disk.
pub const MAX_RECOVERY_POINTS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub id: String,
    /// Milliseconds since the epoch.
    pub timestamp: i64,
    pub description: String,
    pub system_state: SystemState,
    pub backups: Vec<Backup>,
    pub migration_phase: MigrationPhase,
    pub can_restore: bool,
}

pub struct RecoveryPointStore {
    path: PathBuf,
}

impl RecoveryPointStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load all points, newest first. An unreadable file is treated as
    /// empty rather than fatal.
    pub fn load(&self) -> Vec<RecoveryPoint> {
        match fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str::<Vec<RecoveryPoint>>(&content) {
                Ok(points) => points,
                Err(e) => {
                    tracing::warn!(
                        "recovery point list {} is unreadable: {}",
                        self.path.display(),
                        e
                    );
                    Vec::new()
                }
            },
            Err(_) => Vec::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<RecoveryPoint> {
        self.load().into_iter().find(|p| p.id == id)
    }

    /// Append a new point, trim to the newest ten, rewrite atomically.
    /// A point without backups is recorded but can never be restored.
    pub fn create(
        &self,
        description: &str,
        system_state: SystemState,
        backups: Vec<Backup>,
        migration_phase: MigrationPhase,
    ) -> MigrationResult<String> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let id = format!("rp_{}_{:08x}", timestamp, rand::random::<u32>());

        let point = RecoveryPoint {
            id: id.clone(),
            timestamp,
            description: description.to_string(),
            system_state,
            can_restore: !backups.is_empty(),
            backups,
            migration_phase,
        };

        let mut points = self.load();
        points.insert(0, point);
        points.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        points.truncate(MAX_RECOVERY_POINTS);

        self.write_atomic(&points)?;
        tracing::info!("created recovery point {} ({})", id, description);
        Ok(id)
    }

    fn write_atomic(&self, points: &[RecoveryPoint]) -> MigrationResult<()> {
        let json = serde_json::to_string_pretty(points)
            .map_err(|e| MigrationError::rollback("recovery_points", e.to_string()))?;

        let temp = self.path.with_extension("json.tmp");
        let result = (|| -> std::io::Result<()> {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&temp, &json)?;
            let handle = fs::File::open(&temp)?;
            handle.sync_all()?;
            fs::rename(&temp, &self.path)?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp);
            return Err(MigrationError::rollback("recovery_points", e.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_state() -> SystemState {
        SystemState {
            timestamp: 0,
            database_files: Vec::new(),
            config_files: Vec::new(),
            app_version: crate::VERSION.to_string(),
            is_consistent: true,
            validation_errors: Vec::new(),
        }
    }

    #[test]
    fn points_are_capped_and_sorted_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecoveryPointStore::new(dir.path().join("recovery_points.json"));

        for i in 0..13 {
            store
                .create(&format!("point {}", i), empty_state(), Vec::new(), MigrationPhase::Backup)
                .unwrap();
        }

        let points = store.load();
        assert_eq!(points.len(), MAX_RECOVERY_POINTS);
        for pair in points.windows(2) {
            assert!(pair[0].timestamp >= pair[1].timestamp);
        }
        // The oldest points were pruned.
        assert!(points.iter().all(|p| p.description != "point 0"));
    }

    #[test]
    fn zero_backup_points_cannot_restore() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecoveryPointStore::new(dir.path().join("recovery_points.json"));
        let id = store
            .create("empty", empty_state(), Vec::new(), MigrationPhase::Rollback)
            .unwrap();

        let point = store.get(&id).unwrap();
        assert!(!point.can_restore);
    }

    #[test]
    fn ids_are_unique_and_prefixed() {
        let dir = tempfile::tempdir().unwrap();
        let store = RecoveryPointStore::new(dir.path().join("recovery_points.json"));
        let a = store
            .create("one", empty_state(), Vec::new(), MigrationPhase::Backup)
            .unwrap();
        let b = store
            .create("two", empty_state(), Vec::new(), MigrationPhase::Backup)
            .unwrap();

        assert!(a.starts_with("rp_"));
        assert!(b.starts_with("rp_"));
        assert_ne!(a, b);
    }

    #[test]
    fn corrupt_list_is_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("recovery_points.json");
        fs::write(&path, b"{ not json").unwrap();

        let store = RecoveryPointStore::new(&path);
        assert!(store.load().is_empty());
        store
            .create("fresh", empty_state(), Vec::new(), MigrationPhase::Backup)
            .unwrap();
        assert_eq!(store.load().len(), 1);
    }
}
