//! System State Capture
//!
//! A point-in-time snapshot of every database file the migrator cares
//! about, taken before and after potentially destructive operations.
//! Validity means the file opens with its own driver and answers a trivial
//! query.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backup::hash_file;
use crate::settings::MigratorConfig;
use crate::store::{open_store, StoreKind};

/// One database file observed on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseFileInfo {
    pub path: PathBuf,
    pub kind: StoreKind,
    pub size: u64,
    /// Milliseconds since the epoch.
    pub last_modified: i64,
    pub checksum: Option<String>,
    pub exists: bool,
    pub is_valid: bool,
}

/// A configuration file observed on disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigFileInfo {
    pub path: PathBuf,
    pub size: u64,
    pub last_modified: i64,
}

/// Snapshot of the disk state relevant to migration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemState {
    /// Milliseconds since the epoch when the snapshot was taken.
    pub timestamp: i64,
    pub database_files: Vec<DatabaseFileInfo>,
    pub config_files: Vec<ConfigFileInfo>,
    pub app_version: String,
    pub is_consistent: bool,
    pub validation_errors: Vec<String>,
}

impl SystemState {
    pub fn has_valid(&self, kind: StoreKind) -> bool {
        self.database_files
            .iter()
            .any(|f| f.kind == kind && f.exists && f.is_valid)
    }
}

pub struct StateInspector {
    config: MigratorConfig,
}

impl StateInspector {
    pub fn new(config: MigratorConfig) -> Self {
        Self { config }
    }

    /// Capture the current state. Never fails; problems surface as
    /// `validation_errors` and the consistency flag.
    pub async fn capture(&self) -> SystemState {
        let mut database_files = Vec::new();
        let mut validation_errors = Vec::new();

        for path in list_files(&self.config.row_store_dir()) {
            database_files.push(self.inspect(&path, StoreKind::RowStore).await);
        }
        for path in list_files(&self.config.vector_store_dir()) {
            database_files.push(self.inspect(&path, StoreKind::VectorStore).await);
        }
        // The unified target is recorded even when absent.
        database_files.push(self.inspect(&self.config.unified_path(), StoreKind::Unified).await);

        let config_files = list_files(&self.config.user_data_root)
            .into_iter()
            .filter(|p| p.extension().map(|e| e == "json").unwrap_or(false))
            .filter_map(|path| {
                let metadata = fs::metadata(&path).ok()?;
                Some(ConfigFileInfo {
                    size: metadata.len(),
                    last_modified: modified_ms(&metadata),
                    path,
                })
            })
            .collect();

        for file in database_files.iter().filter(|f| f.exists && !f.is_valid) {
            validation_errors.push(format!(
                "{} exists but does not open as a {} file",
                file.path.display(),
                file.kind.as_str()
            ));
        }

        let mut state = SystemState {
            timestamp: chrono::Utc::now().timestamp_millis(),
            database_files,
            config_files,
            app_version: crate::VERSION.to_string(),
            is_consistent: false,
            validation_errors,
        };

        // Consistent iff each data domain is served by some valid store and
        // nothing on disk is present-but-broken.
        let row_served = state.has_valid(StoreKind::RowStore) || state.has_valid(StoreKind::Unified);
        let vector_served =
            state.has_valid(StoreKind::VectorStore) || state.has_valid(StoreKind::Unified);
        let nothing_broken = state.validation_errors.is_empty();
        state.is_consistent = row_served && vector_served && nothing_broken;

        if !row_served {
            state
                .validation_errors
                .push("no valid store serves conversation data".to_string());
        }
        if !vector_served {
            state
                .validation_errors
                .push("no valid store serves knowledge data".to_string());
        }

        state
    }

    async fn inspect(&self, path: &Path, kind: StoreKind) -> DatabaseFileInfo {
        let metadata = fs::metadata(path).ok();
        let exists = metadata.is_some();
        let (size, last_modified) = metadata
            .as_ref()
            .map(|m| (m.len(), modified_ms(m)))
            .unwrap_or((0, 0));

        let checksum = if exists { hash_file(path).ok() } else { None };

        let is_valid = if exists {
            match open_store(kind, path, true).await {
                Ok(store) => {
                    let ok = store.ping().await.is_ok();
                    let _ = store.close().await;
                    ok
                }
                Err(_) => false,
            }
        } else {
            false
        };

        DatabaseFileInfo {
            path: path.to_path_buf(),
            kind,
            size,
            last_modified,
            checksum,
            exists,
            is_valid,
        }
    }
}

fn modified_ms(metadata: &fs::Metadata) -> i64 {
    metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

fn list_files(dir: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
    }
    files.sort();
    files
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{DuckStore, SqliteStore, StoreDriver};

    #[tokio::test]
    async fn consistent_when_unified_serves_both_domains() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigratorConfig::new(dir.path());

        let unified = DuckStore::open(&config.unified_path(), StoreKind::Unified, false).unwrap();
        unified.exec("CREATE TABLE t (id INTEGER)").await.unwrap();
        unified.close().await.unwrap();

        let state = StateInspector::new(config).capture().await;
        assert!(state.is_consistent, "errors: {:?}", state.validation_errors);
        let unified_info = state
            .database_files
            .iter()
            .find(|f| f.kind == StoreKind::Unified)
            .unwrap();
        assert!(unified_info.exists);
        assert!(unified_info.is_valid);
        assert!(unified_info.checksum.is_some());
    }

    #[tokio::test]
    async fn consistent_when_both_legacy_stores_are_valid() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigratorConfig::new(dir.path());
        std::fs::create_dir_all(config.row_store_dir()).unwrap();
        std::fs::create_dir_all(config.vector_store_dir()).unwrap();

        let row = SqliteStore::open(
            &config.row_store_dir().join("chat.db"),
            StoreKind::RowStore,
            false,
        )
        .await
        .unwrap();
        row.exec("CREATE TABLE t (id INTEGER)").await.unwrap();
        row.close().await.unwrap();

        let vector = DuckStore::open(
            &config.vector_store_dir().join("k.duckdb"),
            StoreKind::VectorStore,
            false,
        )
        .unwrap();
        vector.exec("CREATE TABLE t (id INTEGER)").await.unwrap();
        vector.close().await.unwrap();

        let state = StateInspector::new(config).capture().await;
        assert!(state.is_consistent, "errors: {:?}", state.validation_errors);
    }

    #[tokio::test]
    async fn broken_file_breaks_consistency() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigratorConfig::new(dir.path());
        std::fs::create_dir_all(config.row_store_dir()).unwrap();
        std::fs::write(config.row_store_dir().join("broken.db"), b"not a database").unwrap();

        let state = StateInspector::new(config).capture().await;
        assert!(!state.is_consistent);
        assert!(!state.validation_errors.is_empty());
    }
}
