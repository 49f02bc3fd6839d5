//! Legacy Store Detection
//!
//! Scans the well-known subdirectories under the user-data root, classifies
//! files by magic bytes, and decides whether a migration is required at all.

use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::settings::MigratorConfig;
use crate::store::{StoreKind, DUCKDB_MAGIC, SQLITE_MAGIC};

/// A legacy database file discovered on disk. Immutable for the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyFile {
    pub path: PathBuf,
    pub kind: StoreKind,
    pub size: u64,
    /// Milliseconds since the epoch.
    pub last_modified: i64,
    pub magic_ok: bool,
}

/// Outcome of a detection scan.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    pub has_legacy: bool,
    pub row_files: Vec<LegacyFile>,
    pub vector_files: Vec<LegacyFile>,
    pub total_size: u64,
    pub requires_migration: bool,
}

impl DetectionResult {
    pub fn all_files(&self) -> impl Iterator<Item = &LegacyFile> {
        self.row_files.iter().chain(self.vector_files.iter())
    }

    /// Files with verified magic, the ones migration will actually read.
    pub fn migratable_files(&self) -> Vec<LegacyFile> {
        self.all_files().filter(|f| f.magic_ok).cloned().collect()
    }
}

/// Pre-migration sanity findings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompatibilityReport {
    pub compatible: bool,
    pub issues: Vec<String>,
    pub warnings: Vec<String>,
}

pub struct Detector {
    config: MigratorConfig,
}

impl Detector {
    pub fn new(config: MigratorConfig) -> Self {
        Self { config }
    }

    /// Scan the row-store and vector-store directories.
    pub fn detect(&self) -> std::io::Result<DetectionResult> {
        let row_files = self.scan_dir(&self.config.row_store_dir(), StoreKind::RowStore)?;
        let vector_files = self.scan_dir(&self.config.vector_store_dir(), StoreKind::VectorStore)?;

        let total_size = row_files
            .iter()
            .chain(vector_files.iter())
            .map(|f| f.size)
            .sum();
        let requires_migration = row_files.iter().any(|f| f.magic_ok)
            || vector_files.iter().any(|f| f.magic_ok);
        let has_legacy = !row_files.is_empty() || !vector_files.is_empty();

        tracing::info!(
            "detected {} row file(s), {} vector file(s), {} bytes total",
            row_files.len(),
            vector_files.len(),
            total_size
        );

        Ok(DetectionResult {
            has_legacy,
            row_files,
            vector_files,
            total_size,
            requires_migration,
        })
    }

    /// Pre-migration sanity: readable, non-empty, within the size ceiling.
    pub fn check_compatibility(&self, files: &[LegacyFile]) -> CompatibilityReport {
        let mut report = CompatibilityReport {
            compatible: true,
            ..Default::default()
        };

        for file in files {
            let name = file.path.display();
            match fs::File::open(&file.path) {
                Ok(mut handle) => {
                    let mut probe = [0u8; 1];
                    if handle.read(&mut probe).is_err() {
                        report.issues.push(format!("{} is not readable", name));
                        report.compatible = false;
                    }
                }
                Err(e) => {
                    report.issues.push(format!("{} cannot be opened: {}", name, e));
                    report.compatible = false;
                }
            }

            if file.size == 0 {
                report.issues.push(format!("{} is empty", name));
                report.compatible = false;
            } else if file.size > self.config.max_source_file_size {
                report.issues.push(format!(
                    "{} exceeds the {} byte limit",
                    name, self.config.max_source_file_size
                ));
                report.compatible = false;
            } else if file.size > self.config.soft_size_warning {
                report.warnings.push(format!(
                    "{} is large ({} bytes); migration may take a while",
                    name, file.size
                ));
            }
        }

        report
    }

    fn scan_dir(&self, dir: &Path, kind: StoreKind) -> std::io::Result<Vec<LegacyFile>> {
        let mut files = Vec::new();
        if !dir.is_dir() {
            return Ok(files);
        }

        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let metadata = entry.metadata()?;
            if !metadata.is_file() {
                continue;
            }

            let magic_ok = match read_header(&path) {
                Ok(header) => matches_magic(kind, &header),
                Err(_) => false,
            };
            if !magic_ok {
                tracing::warn!("{} does not match the {} format", path.display(), kind.as_str());
            }

            let last_modified = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0);

            files.push(LegacyFile {
                path,
                kind,
                size: metadata.len(),
                last_modified,
                magic_ok,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }
}

fn read_header(path: &Path) -> std::io::Result<[u8; 16]> {
    let mut header = [0u8; 16];
    let mut file = fs::File::open(path)?;
    // Short files leave the tail zeroed; magic comparison still applies.
    let mut read = 0;
    while read < header.len() {
        let n = file.read(&mut header[read..])?;
        if n == 0 {
            break;
        }
        read += n;
    }
    Ok(header)
}

fn matches_magic(kind: StoreKind, header: &[u8; 16]) -> bool {
    match kind {
        StoreKind::RowStore => header[..] == SQLITE_MAGIC[..],
        // DuckDB writes its tag after an 8-byte checksum field.
        StoreKind::VectorStore | StoreKind::Unified => {
            header[8..12] == DUCKDB_MAGIC[..] || header[0..4] == DUCKDB_MAGIC[..]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_file(path: &Path, bytes: &[u8]) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, bytes).unwrap();
    }

    fn sqlite_header() -> Vec<u8> {
        let mut bytes = SQLITE_MAGIC.to_vec();
        bytes.extend_from_slice(&[0u8; 84]);
        bytes
    }

    fn duckdb_header() -> Vec<u8> {
        let mut bytes = vec![0u8; 8];
        bytes.extend_from_slice(DUCKDB_MAGIC);
        bytes.extend_from_slice(&[0u8; 52]);
        bytes
    }

    #[test]
    fn classifies_files_by_magic() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigratorConfig::new(dir.path());
        write_file(&config.row_store_dir().join("chat.db"), &sqlite_header());
        write_file(
            &config.vector_store_dir().join("knowledge.duckdb"),
            &duckdb_header(),
        );
        write_file(&config.row_store_dir().join("junk.db"), b"not a database");

        let result = Detector::new(config).detect().unwrap();
        assert!(result.has_legacy);
        assert!(result.requires_migration);
        assert_eq!(result.row_files.len(), 2);
        assert_eq!(result.vector_files.len(), 1);

        let junk = result
            .row_files
            .iter()
            .find(|f| f.path.ends_with("junk.db"))
            .unwrap();
        assert!(!junk.magic_ok);
        assert_eq!(result.migratable_files().len(), 2);
    }

    #[test]
    fn bad_magic_alone_does_not_require_migration() {
        let dir = tempfile::tempdir().unwrap();
        let config = MigratorConfig::new(dir.path());
        write_file(&config.row_store_dir().join("junk.db"), b"garbage");

        let result = Detector::new(config).detect().unwrap();
        assert!(result.has_legacy);
        assert!(!result.requires_migration);
    }

    #[test]
    fn empty_directories_mean_no_legacy() {
        let dir = tempfile::tempdir().unwrap();
        let result = Detector::new(MigratorConfig::new(dir.path()))
            .detect()
            .unwrap();
        assert!(!result.has_legacy);
        assert!(!result.requires_migration);
        assert_eq!(result.total_size, 0);
    }

    #[test]
    fn compatibility_flags_empty_and_oversized_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = MigratorConfig::new(dir.path());
        config.max_source_file_size = 100;
        config.soft_size_warning = 40;

        let empty = config.row_store_dir().join("empty.db");
        write_file(&empty, b"");
        let large = config.row_store_dir().join("large.db");
        write_file(&large, &vec![0u8; 60]);

        let detector = Detector::new(config);
        let files = vec![
            LegacyFile {
                path: empty,
                kind: StoreKind::RowStore,
                size: 0,
                last_modified: 0,
                magic_ok: true,
            },
            LegacyFile {
                path: large,
                kind: StoreKind::RowStore,
                size: 60,
                last_modified: 0,
                magic_ok: true,
            },
        ];

        let report = detector.check_compatibility(&files);
        assert!(!report.compatible);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.warnings.len(), 1);
    }
}
