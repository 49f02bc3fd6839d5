//! Migration Error Taxonomy
//!
//! Every failure the migrator surfaces is one of the nine kinds below. Raw
//! driver and I/O errors are wrapped by the classifier before they reach the
//! orchestrator; nothing else escapes the crate boundary.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The closed set of error kinds surfaced by the migrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MigrationErrorKind {
    InsufficientDiskSpace,
    PermissionDenied,
    CorruptedSourceData,
    ConnectionFailed,
    SchemaMismatch,
    Timeout,
    ValidationFailed,
    BackupFailed,
    RollbackFailed,
}

impl MigrationErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationErrorKind::InsufficientDiskSpace => "insufficient_disk_space",
            MigrationErrorKind::PermissionDenied => "permission_denied",
            MigrationErrorKind::CorruptedSourceData => "corrupted_source_data",
            MigrationErrorKind::ConnectionFailed => "connection_failed",
            MigrationErrorKind::SchemaMismatch => "schema_mismatch",
            MigrationErrorKind::Timeout => "timeout",
            MigrationErrorKind::ValidationFailed => "validation_failed",
            MigrationErrorKind::BackupFailed => "backup_failed",
            MigrationErrorKind::RollbackFailed => "rollback_failed",
        }
    }
}

/// How loudly an error must be surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ErrorSeverity {
    Warning,
    Error,
    Fatal,
}

/// A classified migration error.
///
/// `user_message` is suitable for an end user: no file descriptors, no SQL
/// fragments. `raw` keeps the original failure text for logs and reports.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{} in {context}: {raw}", .kind.as_str())]
pub struct MigrationError {
    pub kind: MigrationErrorKind,
    pub severity: ErrorSeverity,
    pub context: String,
    pub user_message: String,
    pub raw: String,
}

impl MigrationError {
    /// Build an error with the kind's default severity and user message.
    pub fn new(kind: MigrationErrorKind, context: impl Into<String>, raw: impl Into<String>) -> Self {
        let context = context.into();
        let raw = raw.into();
        Self {
            severity: default_severity(kind),
            user_message: default_user_message(kind),
            kind,
            context,
            raw,
        }
    }

    /// Replace the generated user message with a more specific one.
    pub fn with_user_message(mut self, message: impl Into<String>) -> Self {
        self.user_message = message.into();
        self
    }

    pub fn with_severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    pub fn validation(context: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::new(MigrationErrorKind::ValidationFailed, context, raw)
    }

    pub fn corrupted(context: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::new(MigrationErrorKind::CorruptedSourceData, context, raw)
    }

    pub fn backup(context: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::new(MigrationErrorKind::BackupFailed, context, raw)
    }

    pub fn rollback(context: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::new(MigrationErrorKind::RollbackFailed, context, raw)
    }

    pub fn timeout(context: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::new(MigrationErrorKind::Timeout, context, raw)
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == ErrorSeverity::Fatal
    }
}

pub(crate) fn default_severity(kind: MigrationErrorKind) -> ErrorSeverity {
    match kind {
        MigrationErrorKind::RollbackFailed => ErrorSeverity::Fatal,
        _ => ErrorSeverity::Error,
    }
}

pub(crate) fn default_user_message(kind: MigrationErrorKind) -> String {
    match kind {
        MigrationErrorKind::InsufficientDiskSpace => {
            "Not enough disk space to complete migration. Free some space and retry.".to_string()
        }
        MigrationErrorKind::PermissionDenied => {
            "The application lacks permission to modify its database folder.".to_string()
        }
        MigrationErrorKind::CorruptedSourceData => {
            "A source database file appears damaged; your data is still safe in the backup."
                .to_string()
        }
        MigrationErrorKind::ConnectionFailed => {
            "A database could not be opened. The migration will retry automatically.".to_string()
        }
        MigrationErrorKind::SchemaMismatch => {
            "The database layout does not match what this version expects. Migration was stopped."
                .to_string()
        }
        MigrationErrorKind::Timeout => {
            "A migration step took longer than expected and will be retried.".to_string()
        }
        MigrationErrorKind::ValidationFailed => {
            "The migrated data failed an integrity check; the original files are being restored."
                .to_string()
        }
        MigrationErrorKind::BackupFailed => {
            "Creating a safety backup of your data failed. Nothing was changed.".to_string()
        }
        MigrationErrorKind::RollbackFailed => {
            "Restoring the original data failed. Please contact support before restarting."
                .to_string()
        }
    }
}

/// Result type used across the migrator.
pub type MigrationResult<T> = Result<T, MigrationError>;
