//! Unified Store Migrator
//!
//! One-shot migration of an application's two legacy embedded databases
//! (a SQLite row store and a DuckDB vector store) into a single unified
//! DuckDB store with native vector support. A run either finishes with the
//! unified store active and the legacy files archived, or leaves the legacy
//! files intact; it never ends half-migrated.

pub mod backup;
pub mod classify;
pub mod copy;
pub mod detect;
pub mod error;
pub mod lock;
pub mod orchestrator;
pub mod progress;
pub mod recovery;
pub mod schema;
pub mod settings;
pub mod store;
pub mod validate;

// Re-export the types callers actually touch.
pub use backup::{Backup, BackupManager, BackupOptions};
pub use classify::{classify, directive, ErrorContext, RecoveryDirective, RetryPolicy};
pub use copy::{CopyEngine, CopyOutcome, CopyStats};
pub use detect::{CompatibilityReport, DetectionResult, Detector, LegacyFile};
pub use error::{ErrorSeverity, MigrationError, MigrationErrorKind, MigrationResult};
pub use orchestrator::{MigrationOrchestrator, MigrationReport};
pub use progress::{CancelToken, MigrationPhase, MigrationProgress, ProgressCallback};
pub use recovery::{
    RecoveryPoint, RecoveryPointStore, RollbackEngine, RollbackOptions, RollbackResult,
    StateInspector, SystemState,
};
pub use schema::{SchemaManager, SchemaReport, SchemaVersion};
pub use settings::{load_config, save_config, MigratorConfig};
pub use store::{open_store, SqlValue, StoreDriver, StoreKind};
pub use validate::{ValidationOutcome, ValidationReport, Validator};

/// Crate version, recorded in system state snapshots.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
