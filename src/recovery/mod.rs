//! Rollback Engine
//!
//! Restores the pre-migration disk state from verified backups in five
//! phases: validation, snapshot, restoration, verification, cleanup. Also
//! manages named recovery points for partial recovery.

use std::fs;
use std::path::Path;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::backup::{Backup, BackupManager};
use crate::error::{MigrationError, MigrationResult};
use crate::progress::{MigrationPhase, ProgressReporter};
use crate::settings::MigratorConfig;

pub mod points;
pub mod state;

pub use points::{RecoveryPoint, RecoveryPointStore, MAX_RECOVERY_POINTS};
pub use state::{ConfigFileInfo, DatabaseFileInfo, StateInspector, SystemState};

/// Recovery points older than this draw a warning before restoration.
const STALE_POINT_DAYS: i64 = 30;

#[derive(Debug, Clone)]
pub struct RollbackOptions {
    /// Keep restoring remaining files after one restoration fails.
    pub continue_on_error: bool,
    /// Capture a snapshot and record a "pre-rollback" recovery point.
    pub create_recovery_point: bool,
    /// Delete the consumed backup set after a fully successful restore.
    pub remove_backups_on_success: bool,
}

impl Default for RollbackOptions {
    fn default() -> Self {
        Self {
            continue_on_error: false,
            create_recovery_point: true,
            remove_backups_on_success: true,
        }
    }
}

/// Result envelope for a rollback run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackResult {
    pub success: bool,
    pub files_restored: usize,
    pub system_state_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
}

pub struct RollbackEngine<'a> {
    config: &'a MigratorConfig,
    backups: &'a BackupManager,
}

impl<'a> RollbackEngine<'a> {
    pub fn new(config: &'a MigratorConfig, backups: &'a BackupManager) -> Self {
        Self { config, backups }
    }

    /// Restore every backup. Cancellation is deliberately ignored here;
    /// stopping a half-finished restore can only make things worse.
    pub async fn execute_rollback(
        &self,
        backups: &[Backup],
        options: &RollbackOptions,
        reporter: &mut ProgressReporter,
    ) -> MigrationResult<RollbackResult> {
        let started = Instant::now();
        let mut result = RollbackResult {
            success: false,
            files_restored: 0,
            system_state_valid: false,
            errors: Vec::new(),
            warnings: Vec::new(),
            duration_ms: 0,
        };

        // Phase 1: validation.
        reporter.emit("validating backups", 0.0);
        self.validate_backups(backups, &mut result.warnings)?;

        // Phase 2: pre-rollback snapshot.
        if options.create_recovery_point {
            reporter.emit("capturing pre-rollback state", 20.0);
            let snapshot = StateInspector::new(self.config.clone()).capture().await;
            let store = RecoveryPointStore::new(self.config.recovery_points_path());
            if let Err(e) = store.create(
                "pre-rollback",
                snapshot,
                backups.to_vec(),
                MigrationPhase::Rollback,
            ) {
                // Snapshot failure is not worth halting a rescue over.
                tracing::warn!("could not record pre-rollback point: {}", e);
                result.warnings.push(format!("pre-rollback point not recorded: {}", e.raw));
            }
        }

        // Phase 3: restoration.
        for (index, backup) in backups.iter().enumerate() {
            let percentage = 30.0 + (index as f32 / backups.len().max(1) as f32) * 40.0;
            reporter.emit(
                format!("restoring {}", backup.original_path.display()),
                percentage,
            );

            match self.backups.restore(backup, None) {
                Ok(()) => {
                    result.files_restored += 1;
                    tracing::info!("restored {}", backup.original_path.display());
                }
                Err(e) if options.continue_on_error => {
                    tracing::error!("restore failed, continuing: {}", e);
                    result.errors.push(e.user_message.clone());
                }
                Err(e) => {
                    result.errors.push(e.user_message.clone());
                    result.duration_ms = started.elapsed().as_millis() as u64;
                    return Err(e);
                }
            }
        }

        // Phase 4: verification. The success criterion is the pre-migration
        // state: every backup restored byte-identical, no breakage among
        // files the backups do not cover, and each data domain served
        // exactly as it was (a faithfully restored file counts even if it
        // was already unreadable before migration).
        reporter.emit("verifying restored state", 75.0);
        let state = StateInspector::new(self.config.clone()).capture().await;
        let mut verification_errors = Vec::new();

        for backup in backups {
            match crate::backup::hash_file(&backup.original_path) {
                Ok(on_disk) if on_disk == backup.checksum => {}
                Ok(_) => verification_errors.push(format!(
                    "{} does not match its backup after restore",
                    backup.original_path.display()
                )),
                Err(e) => verification_errors.push(format!(
                    "{} is unreadable after restore: {}",
                    backup.original_path.display(),
                    e
                )),
            }
        }

        let covered = |path: &Path| backups.iter().any(|b| b.original_path == path);
        for file in state.database_files.iter().filter(|f| f.exists && !f.is_valid) {
            if covered(&file.path) {
                result.warnings.push(format!(
                    "{} was restored byte-identical but does not open as a database",
                    file.path.display()
                ));
            } else if file.kind == crate::store::StoreKind::Unified {
                // The transient target is removed in cleanup below.
            } else {
                verification_errors.push(format!(
                    "{} is broken and not covered by any backup",
                    file.path.display()
                ));
            }
        }

        let domain_served = |kind: crate::store::StoreKind| {
            state.has_valid(kind)
                || state.has_valid(crate::store::StoreKind::Unified)
                || backups.iter().any(|b| b.kind == kind)
        };
        if !domain_served(crate::store::StoreKind::RowStore) {
            verification_errors.push("no store serves conversation data".to_string());
        }
        if !domain_served(crate::store::StoreKind::VectorStore) {
            verification_errors.push("no store serves knowledge data".to_string());
        }

        result.system_state_valid = verification_errors.is_empty();
        if !result.system_state_valid {
            result.errors.extend(verification_errors.iter().cloned());
            result.duration_ms = started.elapsed().as_millis() as u64;
            return Err(MigrationError::rollback(
                "rollback:verification",
                format!(
                    "restored state is inconsistent: {}",
                    verification_errors.join("; ")
                ),
            ));
        }

        // Phase 5: cleanup.
        reporter.emit("cleaning up", 90.0);
        self.cleanup(&mut result.warnings);
        if options.remove_backups_on_success && result.errors.is_empty() {
            if let Err(e) = self.backups.remove_set(backups) {
                result
                    .warnings
                    .push(format!("consumed backup set not removed: {}", e));
            }
        }

        result.success = result.errors.is_empty();
        result.duration_ms = started.elapsed().as_millis() as u64;
        reporter.emit("rollback complete", 100.0);
        Ok(result)
    }

    /// Restore from a named recovery point.
    pub async fn recover_partial(
        &self,
        recovery_point_id: &str,
        options: &RollbackOptions,
        reporter: &mut ProgressReporter,
    ) -> MigrationResult<RollbackResult> {
        let store = RecoveryPointStore::new(self.config.recovery_points_path());
        let point = store.get(recovery_point_id).ok_or_else(|| {
            MigrationError::rollback(
                "recover_partial",
                format!("recovery point {} not found", recovery_point_id),
            )
        })?;

        if !point.can_restore || point.backups.is_empty() {
            return Err(MigrationError::rollback(
                "recover_partial",
                format!("recovery point {} has no restorable backups", point.id),
            ));
        }

        let age_days = (chrono::Utc::now().timestamp_millis() - point.timestamp) / 86_400_000;
        if age_days > STALE_POINT_DAYS {
            tracing::warn!(
                "recovery point {} is {} days old; files may have diverged",
                point.id,
                age_days
            );
            reporter.record_warning(format!(
                "recovery point is {} days old; restored data may be stale",
                age_days
            ));
        }

        for backup in &point.backups {
            if !backup.backup_path.is_file() {
                return Err(MigrationError::rollback(
                    "recover_partial",
                    format!("backup file {} is missing", backup.backup_path.display()),
                ));
            }
        }

        self.execute_rollback(&point.backups, options, reporter).await
    }

    /// Create a named recovery point for the current state.
    pub async fn create_recovery_point(
        &self,
        description: &str,
        backups: Vec<Backup>,
        phase: MigrationPhase,
    ) -> MigrationResult<String> {
        let snapshot = StateInspector::new(self.config.clone()).capture().await;
        RecoveryPointStore::new(self.config.recovery_points_path()).create(
            description,
            snapshot,
            backups,
            phase,
        )
    }

    fn validate_backups(
        &self,
        backups: &[Backup],
        warnings: &mut Vec<String>,
    ) -> MigrationResult<()> {
        if backups.is_empty() {
            return Err(MigrationError::rollback(
                "rollback:validation",
                "no backups available to restore from",
            ));
        }

        let mut total_size: u64 = 0;
        for backup in backups {
            if !backup.backup_path.is_file() {
                return Err(MigrationError::rollback(
                    "rollback:validation",
                    format!("backup file {} is missing", backup.backup_path.display()),
                ));
            }
            if !self.backups.verify(backup) {
                return Err(MigrationError::rollback(
                    "rollback:validation",
                    format!(
                        "backup {} failed checksum verification",
                        backup.backup_path.display()
                    ),
                ));
            }
            total_size += backup.size;

            let parent = backup
                .original_path
                .parent()
                .unwrap_or(&self.config.user_data_root);
            if let Err(e) = ensure_writable(parent) {
                return Err(MigrationError::rollback(
                    "rollback:validation",
                    format!("target directory {} is not writable: {}", parent.display(), e),
                ));
            }
        }

        // Restores need headroom: 1.5x the total backup size.
        match free_space(&self.config.user_data_root) {
            Some(free) => {
                let required = total_size + total_size / 2;
                if free < required {
                    return Err(MigrationError::rollback(
                        "rollback:validation",
                        format!(
                            "only {} bytes free, need {} to restore safely",
                            free, required
                        ),
                    ));
                }
            }
            None => {
                tracing::warn!("could not determine free disk space; skipping the check");
                warnings.push("free disk space could not be determined".to_string());
            }
        }

        Ok(())
    }

    fn cleanup(&self, warnings: &mut Vec<String>) {
        // The partially-built unified target is a transient artifact of the
        // failed run; pre-migration state has no unified store.
        for path in [
            self.config.unified_path(),
            scratch_target_path(self.config),
        ] {
            if path.is_file() {
                if let Err(e) = fs::remove_file(&path) {
                    warnings.push(format!("could not remove {}: {}", path.display(), e));
                } else {
                    tracing::info!("removed transient target {}", path.display());
                }
            }
            let wal = path.with_extension("duckdb.wal");
            if wal.is_file() {
                let _ = fs::remove_file(&wal);
            }
        }

        remove_partials(&self.config.backup_root(), warnings);
    }
}

/// Scratch target used by dry runs; deleted on completion and rollback.
pub fn scratch_target_path(config: &MigratorConfig) -> std::path::PathBuf {
    config.user_data_root.join("unified.scratch.duckdb")
}

fn remove_partials(root: &Path, warnings: &mut Vec<String>) {
    if let Ok(entries) = fs::read_dir(root) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                remove_partials(&path, warnings);
            } else if path.extension().map(|e| e == "partial").unwrap_or(false) {
                if let Err(e) = fs::remove_file(&path) {
                    warnings.push(format!("could not remove {}: {}", path.display(), e));
                }
            }
        }
    }
}

fn ensure_writable(dir: &Path) -> std::io::Result<()> {
    fs::create_dir_all(dir)?;
    let probe = dir.join(".write_probe");
    fs::write(&probe, b"probe")?;
    fs::remove_file(&probe)
}

/// Available bytes on the filesystem holding `path`, when resolvable.
pub(crate) fn free_space(path: &Path) -> Option<u64> {
    use sysinfo::{DiskExt, System, SystemExt};

    let canonical = path.canonicalize().ok()?;
    let mut system = System::new();
    system.refresh_disks_list();

    system
        .disks()
        .iter()
        .filter(|disk| canonical.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backup::BackupOptions;
    use crate::detect::LegacyFile;
    use crate::store::{StoreDriver, StoreKind};

    fn seed_legacy(config: &MigratorConfig, contents: &[u8]) -> LegacyFile {
        let path = config.row_store_dir().join("chat.db");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, contents).unwrap();
        LegacyFile {
            path,
            kind: StoreKind::RowStore,
            size: contents.len() as u64,
            last_modified: 0,
            magic_ok: true,
        }
    }

    async fn seed_valid_stores(config: &MigratorConfig) -> LegacyFile {
        let db_path = config.row_store_dir().join("chat.db");
        fs::create_dir_all(db_path.parent().unwrap()).unwrap();
        let store = crate::store::SqliteStore::open(&db_path, StoreKind::RowStore, false)
            .await
            .unwrap();
        store.exec("CREATE TABLE t (id INTEGER)").await.unwrap();
        store.close().await.unwrap();

        let k_path = config.vector_store_dir().join("k.duckdb");
        fs::create_dir_all(k_path.parent().unwrap()).unwrap();
        let vstore = crate::store::DuckStore::open(&k_path, StoreKind::VectorStore, false).unwrap();
        vstore.exec("CREATE TABLE t (id INTEGER)").await.unwrap();
        vstore.close().await.unwrap();

        LegacyFile {
            path: db_path.clone(),
            kind: StoreKind::RowStore,
            size: fs::metadata(&db_path).unwrap().len(),
            last_modified: 0,
            magic_ok: true,
        }
    }

    #[tokio::test]
    async fn rollback_restores_clobbered_files() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigratorConfig::new(dir.path());
        let manager = BackupManager::new(config.backup_root(), config.backup_retention);

        let file = seed_valid_stores(&config).await;
        let pristine = fs::read(&file.path).unwrap();
        let backups = manager
            .create_backups(&[file.clone()], &BackupOptions::default())
            .unwrap();

        fs::write(&file.path, b"ruined by a failed migration").unwrap();

        let engine = RollbackEngine::new(&config, &manager);
        let options = RollbackOptions {
            create_recovery_point: false,
            ..Default::default()
        };
        let result = engine
            .execute_rollback(&backups, &options, &mut ProgressReporter::sink())
            .await
            .unwrap();

        assert!(result.success, "errors: {:?}", result.errors);
        assert_eq!(result.files_restored, 1);
        assert_eq!(fs::read(&file.path).unwrap(), pristine);
        // Consumed backups were deleted.
        assert!(!backups[0].backup_path.exists());
    }

    #[tokio::test]
    async fn verification_requires_consistency() {
        // A restored state that no store can serve must fail verification.
        let dir = tempfile::tempdir().unwrap();
        let config = MigratorConfig::new(dir.path());
        let manager = BackupManager::new(config.backup_root(), config.backup_retention);

        // Junk bytes restore fine but never open as a database.
        let file = seed_legacy(&config, b"junk bytes, not sqlite");
        let backups = manager
            .create_backups(&[file], &BackupOptions::default())
            .unwrap();

        let engine = RollbackEngine::new(&config, &manager);
        let options = RollbackOptions {
            create_recovery_point: false,
            ..Default::default()
        };
        let err = engine
            .execute_rollback(&backups, &options, &mut ProgressReporter::sink())
            .await
            .unwrap_err();
        assert_eq!(err.kind, crate::error::MigrationErrorKind::RollbackFailed);
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn missing_backup_fails_validation_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigratorConfig::new(dir.path());
        let manager = BackupManager::new(config.backup_root(), config.backup_retention);

        let ghost = Backup {
            id: "nope".to_string(),
            kind: StoreKind::RowStore,
            original_path: dir.path().join("app_db/chat.db"),
            backup_path: dir.path().join("backups/none/row/chat.db"),
            size: 10,
            created_at: 0,
            checksum: "00".repeat(32),
            valid: true,
        };

        let engine = RollbackEngine::new(&config, &manager);
        let err = engine
            .execute_rollback(
                &[ghost],
                &RollbackOptions::default(),
                &mut ProgressReporter::sink(),
            )
            .await
            .unwrap_err();
        assert!(err.raw.contains("missing"));
    }

    #[tokio::test]
    async fn recover_partial_refuses_empty_points() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigratorConfig::new(dir.path());
        let manager = BackupManager::new(config.backup_root(), config.backup_retention);
        let engine = RollbackEngine::new(&config, &manager);

        let id = engine
            .create_recovery_point("debug aid", Vec::new(), MigrationPhase::Backup)
            .await
            .unwrap();

        let err = engine
            .recover_partial(&id, &RollbackOptions::default(), &mut ProgressReporter::sink())
            .await
            .unwrap_err();
        assert!(err.raw.contains("no restorable backups"));
    }

    #[tokio::test]
    async fn cleanup_removes_scratch_and_partials() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigratorConfig::new(dir.path());
        let manager = BackupManager::new(config.backup_root(), config.backup_retention);

        let file = seed_valid_stores(&config).await;
        let backups = manager
            .create_backups(&[file], &BackupOptions::default())
            .unwrap();

        let scratch = scratch_target_path(&config);
        fs::write(&scratch, b"scratch").unwrap();
        let partial = config.backup_root().join("stray.partial");
        fs::write(&partial, b"partial").unwrap();

        let engine = RollbackEngine::new(&config, &manager);
        let options = RollbackOptions {
            create_recovery_point: false,
            ..Default::default()
        };
        let result = engine
            .execute_rollback(&backups, &options, &mut ProgressReporter::sink())
            .await
            .unwrap();

        assert!(result.success, "errors: {:?}", result.errors);
        assert!(!scratch.exists());
        assert!(!partial.exists());
    }

}
