//! Error Classification
//!
//! Maps raw failure text plus call-site context onto the migration error
//! taxonomy and a recovery directive. Both functions are pure: same inputs,
//! same outputs. Retry attempt accounting lives in the orchestrator.

use std::time::Duration;

use crate::error::{
    default_user_message, ErrorSeverity, MigrationError, MigrationErrorKind, MigrationResult,
};
use crate::progress::MigrationPhase;

/// What the orchestrator should do about a classified error.
#[derive(Debug, Clone, PartialEq)]
pub enum RecoveryDirective {
    Retry(RetryPolicy),
    Skip,
    Manual,
    Rollback,
    Abort,
}

/// Exponential backoff budget for a retryable error.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub max_attempts: u32,
}

impl RetryPolicy {
    /// Policy for transient open/connection failures.
    pub fn connection() -> Self {
        Self {
            initial: Duration::from_millis(200),
            factor: 2.0,
            cap: Duration::from_secs(5),
            max_attempts: 5,
        }
    }

    /// Policy for soft-deadline overruns.
    pub fn timeout() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 1.5,
            cap: Duration::from_secs(30),
            max_attempts: 3,
        }
    }

    /// Backup creation gets a single second chance.
    pub fn backup_once() -> Self {
        Self {
            initial: Duration::from_millis(500),
            factor: 1.0,
            cap: Duration::from_millis(500),
            max_attempts: 1,
        }
    }

    /// Delay before the given retry attempt (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let scaled = self.initial.as_millis() as f64 * self.factor.powi(attempt as i32);
        Duration::from_millis(scaled as u64).min(self.cap)
    }
}

/// Where in the validator a failure originated; drives rollback-vs-skip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationScope {
    Structure,
    Data,
    Relationships,
    Performance,
}

/// Call-site context fed to the classifier.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    pub phase: MigrationPhase,
    pub operation: String,
    pub validation_scope: Option<ValidationScope>,
    /// The failure is confined to a single source row.
    pub single_row: bool,
    /// Configuration: skip individually bad rows instead of rolling back.
    pub skip_bad_rows: bool,
    /// Bytes the failed operation still needed, when known.
    pub required_bytes: Option<u64>,
}

impl ErrorContext {
    pub fn new(phase: MigrationPhase, operation: impl Into<String>) -> Self {
        Self {
            phase,
            operation: operation.into(),
            validation_scope: None,
            single_row: false,
            skip_bad_rows: false,
            required_bytes: None,
        }
    }

    pub fn with_scope(mut self, scope: ValidationScope) -> Self {
        self.validation_scope = Some(scope);
        self
    }

    pub fn single_row(mut self, skip_bad_rows: bool) -> Self {
        self.single_row = true;
        self.skip_bad_rows = skip_bad_rows;
        self
    }
}

/// Classify a raw failure into the migration taxonomy. First match wins.
pub fn classify(raw: &str, ctx: &ErrorContext) -> MigrationError {
    let lower = raw.to_lowercase();

    let kind = if lower.contains("enospc")
        || lower.contains("disk full")
        || lower.contains("no space left")
    {
        MigrationErrorKind::InsufficientDiskSpace
    } else if lower.contains("eacces")
        || lower.contains("eperm")
        || lower.contains("permission denied")
        || lower.contains("read-only file system")
    {
        MigrationErrorKind::PermissionDenied
    } else if lower.contains("malformed")
        || lower.contains("corrupt")
        || lower.contains("not a database")
        || lower.contains("checksum mismatch")
    {
        MigrationErrorKind::CorruptedSourceData
    } else if lower.contains("connection")
        || lower.contains("reset by peer")
        || lower.contains("eagain")
        || lower.contains("resource temporarily unavailable")
    {
        MigrationErrorKind::ConnectionFailed
    } else if lower.contains("no such column")
        || lower.contains("no such table")
        || lower.contains("does not exist")
        || lower.contains("syntax error")
        || lower.contains("catalog error")
    {
        MigrationErrorKind::SchemaMismatch
    } else if lower.contains("deadline") || lower.contains("timed out") || lower.contains("timeout")
    {
        MigrationErrorKind::Timeout
    } else {
        // Unclassified failures abort; see `directive` below.
        MigrationErrorKind::SchemaMismatch
    };

    let mut err = MigrationError::new(kind, ctx.operation.clone(), raw);
    if kind == MigrationErrorKind::InsufficientDiskSpace {
        if let Some(required) = ctx.required_bytes {
            let mb = required / (1024 * 1024) + 1;
            err = err.with_user_message(format!(
                "Not enough disk space to complete migration. Free at least {} MB and retry.",
                mb
            ));
        }
    }
    err
}

/// Decide the recovery action for an already-classified error.
pub fn directive(err: &MigrationError, ctx: &ErrorContext) -> RecoveryDirective {
    match err.kind {
        MigrationErrorKind::InsufficientDiskSpace => RecoveryDirective::Manual,
        MigrationErrorKind::PermissionDenied => RecoveryDirective::Manual,
        MigrationErrorKind::CorruptedSourceData => RecoveryDirective::Rollback,
        MigrationErrorKind::ConnectionFailed => {
            RecoveryDirective::Retry(RetryPolicy::connection())
        }
        MigrationErrorKind::SchemaMismatch => RecoveryDirective::Abort,
        MigrationErrorKind::Timeout => RecoveryDirective::Retry(RetryPolicy::timeout()),
        MigrationErrorKind::ValidationFailed => match ctx.validation_scope {
            Some(ValidationScope::Relationships) | Some(ValidationScope::Structure) => {
                RecoveryDirective::Rollback
            }
            _ if ctx.single_row && ctx.skip_bad_rows => RecoveryDirective::Skip,
            _ => RecoveryDirective::Rollback,
        },
        MigrationErrorKind::BackupFailed => {
            RecoveryDirective::Retry(RetryPolicy::backup_once())
        }
        // Fatal; the orchestrator surfaces it loudly and stops.
        MigrationErrorKind::RollbackFailed => RecoveryDirective::Abort,
    }
}

/// Convenience: classify and return both halves at once.
pub fn classify_with_directive(raw: &str, ctx: &ErrorContext) -> (MigrationError, RecoveryDirective) {
    let err = classify(raw, ctx);
    let dir = directive(&err, ctx);
    (err, dir)
}

/// Wrap a raw error result into a classified one.
pub fn wrap<T, E: std::fmt::Display>(
    result: Result<T, E>,
    ctx: &ErrorContext,
) -> MigrationResult<T> {
    result.map_err(|e| classify(&e.to_string(), ctx))
}

/// A validation-rule failure escalated to an error.
pub fn validation_error(
    scope: ValidationScope,
    operation: &str,
    message: impl Into<String>,
) -> MigrationError {
    let raw = message.into();
    MigrationError {
        kind: MigrationErrorKind::ValidationFailed,
        severity: ErrorSeverity::Error,
        context: operation.to_string(),
        user_message: default_user_message(MigrationErrorKind::ValidationFailed),
        raw: format!("[{:?}] {}", scope, raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(op: &str) -> ErrorContext {
        ErrorContext::new(MigrationPhase::Copy, op)
    }

    #[test]
    fn disk_full_is_manual() {
        let (err, dir) = classify_with_directive("write failed: ENOSPC (os error 28)", &ctx("copy"));
        assert_eq!(err.kind, MigrationErrorKind::InsufficientDiskSpace);
        assert_eq!(dir, RecoveryDirective::Manual);
    }

    #[test]
    fn disk_full_user_message_names_required_space() {
        let mut context = ctx("copy");
        context.required_bytes = Some(50 * 1024 * 1024);
        let err = classify("disk full", &context);
        assert!(err.user_message.contains("51 MB") || err.user_message.contains("50 MB"));
    }

    #[test]
    fn corruption_rolls_back() {
        let (err, dir) =
            classify_with_directive("database disk image is malformed", &ctx("copy:conversations"));
        assert_eq!(err.kind, MigrationErrorKind::CorruptedSourceData);
        assert_eq!(dir, RecoveryDirective::Rollback);
    }

    #[test]
    fn truncated_sqlite_file_is_corruption() {
        let (err, _) = classify_with_directive("file is not a database", &ctx("copy"));
        assert_eq!(err.kind, MigrationErrorKind::CorruptedSourceData);
    }

    #[test]
    fn connection_failures_retry_with_exponential_backoff() {
        let (_, dir) = classify_with_directive("connection reset by peer", &ctx("open"));
        match dir {
            RecoveryDirective::Retry(policy) => {
                assert_eq!(policy.max_attempts, 5);
                assert_eq!(policy.delay_for(0), Duration::from_millis(200));
                assert_eq!(policy.delay_for(1), Duration::from_millis(400));
                assert_eq!(policy.delay_for(10), Duration::from_secs(5));
            }
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn ddl_rejection_aborts() {
        let (err, dir) =
            classify_with_directive("no such column: settings", &ctx("schema:create"));
        assert_eq!(err.kind, MigrationErrorKind::SchemaMismatch);
        assert_eq!(dir, RecoveryDirective::Abort);
    }

    #[test]
    fn timeout_retries_three_times() {
        let (_, dir) = classify_with_directive("operation exceeded its deadline", &ctx("validate"));
        match dir {
            RecoveryDirective::Retry(policy) => assert_eq!(policy.max_attempts, 3),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn relationship_validation_failures_roll_back() {
        let err = validation_error(ValidationScope::Relationships, "validate", "orphaned messages");
        let context = ctx("validate").with_scope(ValidationScope::Relationships);
        assert_eq!(directive(&err, &context), RecoveryDirective::Rollback);
    }

    #[test]
    fn single_bad_row_can_be_skipped_when_configured() {
        let err = validation_error(ValidationScope::Data, "copy:messages", "bad role");
        let context = ctx("copy:messages")
            .with_scope(ValidationScope::Data)
            .single_row(true);
        assert_eq!(directive(&err, &context), RecoveryDirective::Skip);

        let strict = ctx("copy:messages")
            .with_scope(ValidationScope::Data)
            .single_row(false);
        assert_eq!(directive(&err, &strict), RecoveryDirective::Rollback);
    }

    #[test]
    fn backup_failures_retry_once() {
        let err = MigrationError::backup("backup", "copy interrupted");
        match directive(&err, &ctx("backup")) {
            RecoveryDirective::Retry(policy) => assert_eq!(policy.max_attempts, 1),
            other => panic!("expected retry, got {:?}", other),
        }
    }

    #[test]
    fn classify_is_pure() {
        let context = ctx("copy");
        let a = classify("disk full", &context);
        let b = classify("disk full", &context);
        assert_eq!(a.kind, b.kind);
        assert_eq!(a.user_message, b.user_message);
        assert_eq!(directive(&a, &context), directive(&b, &context));
    }
}
