//! Migrator Configuration
//!
//! Settings are stored as JSON next to the user data, with defaults matching
//! the shipped layout. Only paths derived from `user_data_root` are ever
//! touched by the migrator.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Subdirectory of the user-data root holding legacy row-store files.
pub const ROW_STORE_DIR: &str = "app_db";
/// Subdirectory of the user-data root holding legacy vector-store files.
pub const VECTOR_STORE_DIR: &str = "knowledge";
/// Backup sets live under this subdirectory.
pub const BACKUP_DIR: &str = "backups";
/// File name of the unified target store.
pub const UNIFIED_FILE: &str = "unified.duckdb";
/// Recovery point list, rewritten atomically.
pub const RECOVERY_POINTS_FILE: &str = "recovery_points.json";
/// Lock file guarding against concurrent migrations.
pub const LOCK_FILE: &str = ".migration.lock";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MigratorConfig {
    pub user_data_root: PathBuf,
    /// Rows copied per target transaction.
    pub batch_size: usize,
    /// Embedding dimension of the unified store.
    pub vector_dimension: usize,
    /// Hard ceiling on a single legacy file; larger files fail preflight.
    pub max_source_file_size: u64,
    /// Files above this size produce a preflight warning.
    pub soft_size_warning: u64,
    /// Skip individually bad rows instead of rolling the run back.
    pub skip_bad_rows: bool,
    /// Run against a scratch target that is deleted afterwards.
    pub dry_run: bool,
    /// Backup sets kept on disk beyond the active one.
    pub backup_retention: usize,
    /// Soft deadline for the backup phase, in seconds.
    pub backup_timeout_secs: u64,
    /// Soft deadline for the copy phase, in seconds.
    pub copy_timeout_secs: u64,
    /// Soft deadline for the validate phase, in seconds.
    pub validate_timeout_secs: u64,
    /// Locks older than this are considered stale and reclaimed.
    pub lock_stale_secs: u64,
}

impl Default for MigratorConfig {
    fn default() -> Self {
        Self {
            user_data_root: PathBuf::from("."),
            batch_size: 1000,
            vector_dimension: 1536,
            max_source_file_size: 4 * 1024 * 1024 * 1024,
            soft_size_warning: 512 * 1024 * 1024,
            skip_bad_rows: false,
            dry_run: false,
            backup_retention: 5,
            backup_timeout_secs: 10 * 60,
            copy_timeout_secs: 30 * 60,
            validate_timeout_secs: 10 * 60,
            lock_stale_secs: 2 * 60 * 60,
        }
    }
}

impl MigratorConfig {
    pub fn new(user_data_root: impl Into<PathBuf>) -> Self {
        Self {
            user_data_root: user_data_root.into(),
            ..Self::default()
        }
    }

    pub fn row_store_dir(&self) -> PathBuf {
        self.user_data_root.join(ROW_STORE_DIR)
    }

    pub fn vector_store_dir(&self) -> PathBuf {
        self.user_data_root.join(VECTOR_STORE_DIR)
    }

    pub fn backup_root(&self) -> PathBuf {
        self.user_data_root.join(BACKUP_DIR)
    }

    pub fn unified_path(&self) -> PathBuf {
        self.user_data_root.join(UNIFIED_FILE)
    }

    pub fn recovery_points_path(&self) -> PathBuf {
        self.user_data_root.join(RECOVERY_POINTS_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.user_data_root.join(LOCK_FILE)
    }

    pub fn backup_timeout(&self) -> Duration {
        Duration::from_secs(self.backup_timeout_secs)
    }

    pub fn copy_timeout(&self) -> Duration {
        Duration::from_secs(self.copy_timeout_secs)
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_secs(self.validate_timeout_secs)
    }
}

/// Load configuration from a JSON file, falling back to defaults rooted at
/// the file's directory when missing or unreadable.
pub fn load_config(path: &Path) -> MigratorConfig {
    match std::fs::read_to_string(path) {
        Ok(content) => match serde_json::from_str::<MigratorConfig>(&content) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("failed to parse migrator config {}: {}", path.display(), e);
                default_rooted_at(path)
            }
        },
        Err(_) => default_rooted_at(path),
    }
}

/// Save configuration as pretty-printed JSON.
pub fn save_config(config: &MigratorConfig, path: &Path) -> Result<(), String> {
    let json = serde_json::to_string_pretty(config)
        .map_err(|e| format!("Failed to serialize migrator config: {}", e))?;
    std::fs::write(path, json).map_err(|e| format!("Failed to write migrator config: {}", e))
}

fn default_rooted_at(path: &Path) -> MigratorConfig {
    let root = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    MigratorConfig::new(root)
}
