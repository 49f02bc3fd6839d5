//! Migration Orchestrator
//!
//! The top-level state machine: DETECT, PREFLIGHT, BACKUP, SCHEMA, COPY,
//! VALIDATE, FINALIZE, with ROLLBACK on any rollback directive and ABORTED
//! on fatal failures. Composes every other component and owns retry
//! accounting, cancellation, and the migration lock.

use std::path::PathBuf;
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::backup::{Backup, BackupManager, BackupOptions};
use crate::classify::{directive, ErrorContext, RecoveryDirective};
use crate::copy::{CopyEngine, CopyOutcome};
use crate::detect::{DetectionResult, Detector, LegacyFile};
use crate::error::{MigrationError, MigrationErrorKind, MigrationResult};
use crate::lock::MigrationLock;
use crate::progress::{CancelToken, MigrationPhase, ProgressCallback, ProgressReporter};
use crate::recovery::{
    free_space, scratch_target_path, RollbackEngine, RollbackOptions,
};
use crate::schema::SchemaManager;
use crate::settings::MigratorConfig;
use crate::store::{open_store, SqlValue, StoreDriver, StoreKind};
use crate::validate::{ValidationOutcome, Validator};

/// Result envelope returned to the caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigrationReport {
    pub success: bool,
    pub phase: MigrationPhase,
    pub duration_ms: u64,
    pub requires_migration: bool,
    pub rows_copied: u64,
    /// User-facing error messages, in occurrence order.
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub backup_paths: Option<Vec<PathBuf>>,
    pub files_restored: Option<usize>,
    pub system_state_valid: Option<bool>,
}

impl MigrationReport {
    fn starting() -> Self {
        Self {
            success: false,
            phase: MigrationPhase::Init,
            duration_ms: 0,
            requires_migration: false,
            rows_copied: 0,
            errors: Vec::new(),
            warnings: Vec::new(),
            backup_paths: None,
            files_restored: None,
            system_state_valid: None,
        }
    }
}

pub struct MigrationOrchestrator {
    config: MigratorConfig,
    cancel: CancelToken,
}

impl MigrationOrchestrator {
    pub fn new(config: MigratorConfig) -> Self {
        Self {
            config,
            cancel: CancelToken::new(),
        }
    }

    /// Token the caller can use to request cooperative cancellation.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run the full migration. Returns `Err` only for a failed rollback,
    /// which leaves the system possibly inconsistent and must be surfaced
    /// loudly; everything else is reported in the envelope.
    pub async fn run(&self, callback: ProgressCallback) -> MigrationResult<MigrationReport> {
        let started = Instant::now();
        let mut reporter = ProgressReporter::new(callback);
        let mut report = MigrationReport::starting();

        // INIT: workspace and mutual exclusion.
        reporter.enter_phase(MigrationPhase::Init);
        if let Err(e) = std::fs::create_dir_all(&self.config.user_data_root) {
            return Ok(self.abort(report, started, &mut reporter, MigrationError::new(
                MigrationErrorKind::PermissionDenied,
                "init",
                e.to_string(),
            )));
        }
        let _lock = match MigrationLock::acquire(
            self.config.lock_path(),
            std::time::Duration::from_secs(self.config.lock_stale_secs),
        ) {
            Ok(lock) => lock,
            Err(e) => return Ok(self.abort(report, started, &mut reporter, e)),
        };

        // DETECT.
        reporter.enter_phase(MigrationPhase::Detect);
        let detector = Detector::new(self.config.clone());
        let detection = match detector.detect() {
            Ok(d) => d,
            Err(e) => {
                return Ok(self.abort(report, started, &mut reporter, MigrationError::new(
                    MigrationErrorKind::ConnectionFailed,
                    "detect",
                    e.to_string(),
                )))
            }
        };
        report.requires_migration = detection.requires_migration;
        if !detection.requires_migration {
            tracing::info!("no legacy stores require migration");
            report.success = true;
            report.phase = MigrationPhase::Done;
            report.duration_ms = started.elapsed().as_millis() as u64;
            reporter.emit("nothing to migrate", 100.0);
            return Ok(report);
        }

        // PREFLIGHT.
        reporter.enter_phase(MigrationPhase::Preflight);
        let files = detection.migratable_files();
        let compat = detector.check_compatibility(&files);
        for warning in &compat.warnings {
            report.warnings.push(warning.clone());
            reporter.record_warning(warning.clone());
        }
        if !compat.compatible {
            let err = MigrationError::corrupted("preflight", compat.issues.join("; "))
                .with_user_message(
                    "The existing database files failed pre-migration checks; nothing was changed."
                        .to_string(),
                );
            return Ok(self.abort(report, started, &mut reporter, err));
        }
        // Room for the unified copy plus the backup set.
        let required = detection.total_size.saturating_mul(2);
        if let Some(free) = free_space(&self.config.user_data_root) {
            if free < required {
                let mut ctx = ErrorContext::new(MigrationPhase::Preflight, "preflight:disk");
                ctx.required_bytes = Some(required - free);
                let err = crate::classify::classify("disk full", &ctx);
                return Ok(self.abort(report, started, &mut reporter, err));
            }
        }

        // BACKUP. A verified manifest from an interrupted run is reused.
        reporter.enter_phase(MigrationPhase::Backup);
        let manager = BackupManager::new(self.config.backup_root(), self.config.backup_retention);
        let backups = match self.backup_phase(&manager, &files, &mut reporter).await {
            Ok(backups) => backups,
            Err(e) => return Ok(self.abort(report, started, &mut reporter, e)),
        };
        report.backup_paths = Some(backups.iter().map(|b| b.backup_path.clone()).collect());

        // SCHEMA.
        reporter.enter_phase(MigrationPhase::Schema);
        let target_path = if self.config.dry_run {
            scratch_target_path(&self.config)
        } else {
            self.config.unified_path()
        };
        let target = match self.open_target(&target_path).await {
            Ok(target) => target,
            Err(e) => return Ok(self.abort(report, started, &mut reporter, e)),
        };
        let schema = SchemaManager::new(self.config.vector_dimension);
        match schema.create_schema(target.as_ref()).await {
            Ok(warnings) => {
                for warning in warnings {
                    report.warnings.push(warning.clone());
                    reporter.record_warning(warning);
                }
            }
            Err(e) => {
                // DDL rejection aborts; the half-created target is left for
                // inspection and the legacy stores remain authoritative.
                let _ = target.close().await;
                return Ok(self.abort(report, started, &mut reporter, e));
            }
        }
        self.checkpoint(target.as_ref(), MigrationPhase::Schema).await;

        // COPY.
        reporter.enter_phase(MigrationPhase::Copy);
        let copy_result = self
            .copy_phase(&detection, target.as_ref(), &mut reporter)
            .await;
        let outcome = match copy_result {
            Ok(outcome) => outcome,
            Err(e) => {
                return self
                    .resolve_failure(e, report, started, &manager, &backups, target, &mut reporter)
                    .await;
            }
        };
        match outcome {
            CopyOutcome::Completed(stats) => {
                report.rows_copied = stats.total_copied();
                if stats.total_skipped() > 0 {
                    report
                        .warnings
                        .push(format!("{} rows were skipped and logged", stats.total_skipped()));
                }
            }
            CopyOutcome::Cancelled(_) => {
                return self
                    .rollback_after(
                        "Migration was cancelled; your original data has been restored.",
                        report,
                        started,
                        &manager,
                        &backups,
                        Some(target),
                        &mut reporter,
                    )
                    .await;
            }
        }
        self.checkpoint(target.as_ref(), MigrationPhase::Copy).await;

        // VALIDATE.
        reporter.enter_phase(MigrationPhase::Validate);
        let validation = self.validate_phase(target.as_ref(), &mut reporter).await;
        match validation {
            Ok(ValidationOutcome::Completed(validation_report)) => {
                if !validation_report.passed {
                    let failures: Vec<String> = validation_report
                        .failures()
                        .map(|f| f.message.clone())
                        .collect();
                    let scope = validation_report.first_failure_scope();
                    let mut err = MigrationError::validation(
                        "validate",
                        format!("validation failed: {}", failures.join("; ")),
                    );
                    let mut ctx = ErrorContext::new(MigrationPhase::Validate, "validate");
                    if let Some(scope) = scope {
                        ctx = ctx.with_scope(scope);
                        err.raw = format!("[{:?}] {}", scope, err.raw);
                    }
                    match directive(&err, &ctx) {
                        RecoveryDirective::Skip => {
                            report.warnings.extend(failures);
                        }
                        _ => {
                            return self
                                .resolve_failure(
                                    err, report, started, &manager, &backups, target, &mut reporter,
                                )
                                .await;
                        }
                    }
                }
            }
            Ok(ValidationOutcome::Cancelled) => {
                return self
                    .rollback_after(
                        "Migration was cancelled; your original data has been restored.",
                        report,
                        started,
                        &manager,
                        &backups,
                        Some(target),
                        &mut reporter,
                    )
                    .await;
            }
            Err(e) => {
                return self
                    .resolve_failure(e, report, started, &manager, &backups, target, &mut reporter)
                    .await;
            }
        }
        self.checkpoint(target.as_ref(), MigrationPhase::Validate).await;

        // FINALIZE.
        reporter.enter_phase(MigrationPhase::Finalize);
        if self.config.dry_run {
            let _ = target.close().await;
            if let Err(e) = std::fs::remove_file(&target_path) {
                report
                    .warnings
                    .push(format!("scratch target not removed: {}", e));
            }
            report.warnings.push("dry run: legacy files were left in place".to_string());
        } else {
            self.checkpoint(target.as_ref(), MigrationPhase::Done).await;
            let _ = target.close().await;
            for backup in &backups {
                match manager.archive_original(backup) {
                    Ok(dest) => {
                        tracing::info!(
                            "archived {} to {}",
                            backup.original_path.display(),
                            dest.display()
                        );
                    }
                    Err(e) => {
                        // The unified store is live either way; a leftover
                        // legacy file is only noise.
                        report
                            .warnings
                            .push(format!("legacy file not archived: {}", e.raw));
                    }
                }
            }
        }

        report.success = true;
        report.phase = MigrationPhase::Done;
        report.duration_ms = started.elapsed().as_millis() as u64;
        reporter.emit("migration complete", 100.0);
        tracing::info!(
            "migration finished: {} rows in {} ms",
            report.rows_copied,
            report.duration_ms
        );
        Ok(report)
    }

    async fn backup_phase(
        &self,
        manager: &BackupManager,
        files: &[LegacyFile],
        reporter: &mut ProgressReporter,
    ) -> MigrationResult<Vec<Backup>> {
        // Reuse a verified set covering every file (interrupted-run resume).
        let existing = manager.list();
        let covered: Vec<Backup> = files
            .iter()
            .filter_map(|file| {
                existing
                    .iter()
                    .find(|b| b.original_path == file.path && manager.verify(b))
                    .cloned()
            })
            .collect();
        if covered.len() == files.len() && !files.is_empty() {
            tracing::info!("reusing {} verified backups from a previous run", covered.len());
            reporter.emit("reusing verified backups", 100.0);
            return Ok(covered);
        }

        let ctx = ErrorContext::new(MigrationPhase::Backup, "backup");
        let mut attempts: u32 = 0;
        loop {
            reporter.emit(format!("backing up {} file(s)", files.len()), 10.0);
            match manager.create_backups(files, &BackupOptions::default()) {
                Ok(backups) => return Ok(backups),
                Err(e) => match directive(&e, &ctx) {
                    RecoveryDirective::Retry(policy) if attempts < policy.max_attempts => {
                        let delay = policy.delay_for(attempts);
                        tracing::warn!("backup failed, retrying in {:?}: {}", delay, e.raw);
                        reporter.record_warning(format!("backup retry: {}", e.raw));
                        tokio::time::sleep(delay).await;
                        attempts += 1;
                    }
                    _ => return Err(e),
                },
            }
        }
    }

    async fn open_target(&self, path: &std::path::Path) -> MigrationResult<Box<dyn StoreDriver>> {
        let ctx = ErrorContext::new(MigrationPhase::Schema, "schema:open");
        let mut attempts: u32 = 0;
        loop {
            match open_store(StoreKind::Unified, path, false).await {
                Ok(target) => return Ok(target),
                Err(e) => {
                    let err = crate::classify::classify(&e.to_string(), &ctx);
                    match directive(&err, &ctx) {
                        RecoveryDirective::Retry(policy) if attempts < policy.max_attempts => {
                            tokio::time::sleep(policy.delay_for(attempts)).await;
                            attempts += 1;
                        }
                        _ => return Err(err),
                    }
                }
            }
        }
    }

    async fn copy_phase(
        &self,
        detection: &DetectionResult,
        target: &dyn StoreDriver,
        reporter: &mut ProgressReporter,
    ) -> MigrationResult<CopyOutcome> {
        let row_file = pick_source(&detection.row_files, reporter);
        let vector_file = pick_source(&detection.vector_files, reporter);

        let row_source = match &row_file {
            Some(file) => Some(self.open_source(StoreKind::RowStore, file).await?),
            None => None,
        };
        let vector_source = match &vector_file {
            Some(file) => Some(self.open_source(StoreKind::VectorStore, file).await?),
            None => None,
        };

        let ctx = ErrorContext::new(MigrationPhase::Copy, "copy");
        let mut attempts: u32 = 0;
        let result = loop {
            // Each retry attempt gets a fresh soft deadline.
            let engine = CopyEngine::new(&self.config, target, self.cancel.clone())
                .with_deadline(Instant::now(), self.config.copy_timeout());
            let attempt = engine
                .copy_all(
                    row_source.as_deref(),
                    vector_source.as_deref(),
                    reporter,
                )
                .await;
            match attempt {
                Ok(outcome) => break Ok(outcome),
                Err(e) => match directive(&e, &ctx) {
                    RecoveryDirective::Retry(policy) if attempts < policy.max_attempts => {
                        let delay = policy.delay_for(attempts);
                        tracing::warn!("copy failed, retrying in {:?}: {}", delay, e.raw);
                        reporter.record_warning(format!("copy retry: {}", e.raw));
                        tokio::time::sleep(delay).await;
                        attempts += 1;
                    }
                    _ => break Err(e),
                },
            }
        };

        if let Some(source) = row_source {
            let _ = source.close().await;
        }
        if let Some(source) = vector_source {
            let _ = source.close().await;
        }
        result
    }

    async fn open_source(
        &self,
        kind: StoreKind,
        file: &LegacyFile,
    ) -> MigrationResult<Box<dyn StoreDriver>> {
        let ctx = ErrorContext::new(MigrationPhase::Copy, format!("open:{}", kind.as_str()));
        open_store(kind, &file.path, true)
            .await
            .map_err(|e| crate::classify::classify(&e.to_string(), &ctx))
    }

    async fn validate_phase(
        &self,
        target: &dyn StoreDriver,
        reporter: &mut ProgressReporter,
    ) -> MigrationResult<ValidationOutcome> {
        let ctx = ErrorContext::new(MigrationPhase::Validate, "validate");
        let mut attempts: u32 = 0;
        loop {
            let validator = Validator::new(target, self.config.vector_dimension, self.cancel.clone())
                .with_deadline(Instant::now(), self.config.validate_timeout());
            match validator.run(reporter).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => match directive(&e, &ctx) {
                    RecoveryDirective::Retry(policy) if attempts < policy.max_attempts => {
                        tokio::time::sleep(policy.delay_for(attempts)).await;
                        attempts += 1;
                    }
                    _ => return Err(e),
                },
            }
        }
    }

    /// Route a phase failure through its recovery directive.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_failure(
        &self,
        err: MigrationError,
        report: MigrationReport,
        started: Instant,
        manager: &BackupManager,
        backups: &[Backup],
        target: Box<dyn StoreDriver>,
        reporter: &mut ProgressReporter,
    ) -> MigrationResult<MigrationReport> {
        let ctx = ErrorContext::new(reporter.phase(), err.context.clone());
        match directive(&err, &ctx) {
            RecoveryDirective::Rollback => {
                let message = err.user_message.clone();
                tracing::error!("{} triggers rollback: {}", err.kind.as_str(), err.raw);
                self.rollback_after(
                    &message,
                    report,
                    started,
                    manager,
                    backups,
                    Some(target),
                    reporter,
                )
                .await
            }
            _ => {
                let _ = target.close().await;
                Ok(self.abort(report, started, reporter, err))
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn rollback_after(
        &self,
        reason: &str,
        mut report: MigrationReport,
        started: Instant,
        manager: &BackupManager,
        backups: &[Backup],
        target: Option<Box<dyn StoreDriver>>,
        reporter: &mut ProgressReporter,
    ) -> MigrationResult<MigrationReport> {
        reporter.enter_phase(MigrationPhase::Rollback);
        report.errors.push(reason.to_string());
        reporter.record_error(reason.to_string());

        if let Some(target) = target {
            let _ = target.close().await;
        }

        let engine = RollbackEngine::new(&self.config, manager);
        match engine
            .execute_rollback(backups, &RollbackOptions::default(), reporter)
            .await
        {
            Ok(result) => {
                report.phase = MigrationPhase::Rollback;
                report.success = false;
                report.files_restored = Some(result.files_restored);
                report.system_state_valid = Some(result.system_state_valid);
                report.warnings.extend(result.warnings);
                report.errors.extend(result.errors);
                report.duration_ms = started.elapsed().as_millis() as u64;
                tracing::info!(
                    "rollback restored {} file(s); system consistent: {}",
                    result.files_restored,
                    result.system_state_valid
                );
                Ok(report)
            }
            Err(fatal) => {
                // The lock guard is released by drop on return; the fatal
                // error is re-thrown with full context for the caller.
                report.phase = MigrationPhase::Aborted;
                report.errors.push(fatal.user_message.clone());
                tracing::error!("rollback failed, system may be inconsistent: {}", fatal.raw);
                Err(fatal)
            }
        }
    }

    fn abort(
        &self,
        mut report: MigrationReport,
        started: Instant,
        reporter: &mut ProgressReporter,
        err: MigrationError,
    ) -> MigrationReport {
        tracing::error!("migration aborted in {}: {}", err.context, err.raw);
        reporter.record_error(err.user_message.clone());
        reporter.emit("aborted", 100.0);
        report.phase = MigrationPhase::Aborted;
        report.success = false;
        report.errors.push(err.user_message);
        report.duration_ms = started.elapsed().as_millis() as u64;
        report
    }

    /// Durable phase checkpoint; best-effort once the target exists.
    async fn checkpoint(&self, target: &dyn StoreDriver, phase: MigrationPhase) {
        let result = target
            .execute(
                "INSERT OR REPLACE INTO migration_metadata (key, value, created_at) VALUES ('phase', ?, ?)",
                &[
                    SqlValue::Text(phase.as_str().to_string()),
                    SqlValue::Integer(chrono::Utc::now().timestamp_millis()),
                ],
            )
            .await;
        if let Err(e) = result {
            tracing::warn!("phase checkpoint not recorded: {}", e);
        }
    }
}

/// Choose the source file for a kind: the largest file with valid magic.
fn pick_source(files: &[LegacyFile], reporter: &mut ProgressReporter) -> Option<LegacyFile> {
    let mut valid: Vec<&LegacyFile> = files.iter().filter(|f| f.magic_ok).collect();
    if valid.len() > 1 {
        reporter.record_warning(format!(
            "{} candidate files found for {}; migrating the largest",
            valid.len(),
            valid[0].kind.as_str()
        ));
    }
    valid.sort_by_key(|f| f.size);
    valid.last().map(|f| (*f).clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn zero_legacy_files_complete_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigratorConfig::new(dir.path());
        let orchestrator = MigrationOrchestrator::new(config.clone());

        let report = orchestrator.run(Arc::new(|_| {})).await.unwrap();
        assert!(report.success);
        assert_eq!(report.phase, MigrationPhase::Done);
        assert!(!report.requires_migration);
        assert!(report.backup_paths.is_none());
        // No target was created.
        assert!(!config.unified_path().exists());
        // The lock was released.
        assert!(!config.lock_path().exists());
    }

    #[tokio::test]
    async fn orchestrators_exclude_each_other() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigratorConfig::new(dir.path());

        let _held = MigrationLock::acquire(
            config.lock_path(),
            std::time::Duration::from_secs(3600),
        )
        .unwrap();

        let orchestrator = MigrationOrchestrator::new(config);
        let report = orchestrator.run(Arc::new(|_| {})).await.unwrap();
        assert!(!report.success);
        assert_eq!(report.phase, MigrationPhase::Aborted);
        assert!(report.errors.iter().any(|e| e.contains("Another migration")));
    }

    #[test]
    fn pick_source_prefers_largest_valid_file() {
        let mut reporter = ProgressReporter::sink();
        let files = vec![
            LegacyFile {
                path: PathBuf::from("/a/small.db"),
                kind: StoreKind::RowStore,
                size: 10,
                last_modified: 0,
                magic_ok: true,
            },
            LegacyFile {
                path: PathBuf::from("/a/big.db"),
                kind: StoreKind::RowStore,
                size: 100,
                last_modified: 0,
                magic_ok: true,
            },
            LegacyFile {
                path: PathBuf::from("/a/bogus.db"),
                kind: StoreKind::RowStore,
                size: 1000,
                last_modified: 0,
                magic_ok: false,
            },
        ];

        let chosen = pick_source(&files, &mut reporter).unwrap();
        assert_eq!(chosen.path, PathBuf::from("/a/big.db"));
    }
}
