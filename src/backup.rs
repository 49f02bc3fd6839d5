//! Backup Manager
//!
//! Creates verified copies of legacy files under the backup root, one
//! timestamped set per run, with a `manifest.json` describing the set.
//! Restores go through a sibling temp file and an atomic rename, so a
//! destination is never left partially written.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::detect::LegacyFile;
use crate::error::{MigrationError, MigrationResult};
use crate::store::StoreKind;

pub const MANIFEST_FILE: &str = "manifest.json";
const ARCHIVE_DIR: &str = "archived";

/// A verified copy of one legacy file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Backup {
    pub id: String,
    pub kind: StoreKind,
    pub original_path: PathBuf,
    pub backup_path: PathBuf,
    pub size: u64,
    /// Milliseconds since the epoch.
    pub created_at: i64,
    /// Hex-encoded SHA-256 of the backup file.
    pub checksum: String,
    pub valid: bool,
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Re-hash every copy after writing and fail the set on any mismatch.
    pub verify: bool,
    /// Name the set directory after the current UTC time.
    pub include_timestamp: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            verify: true,
            include_timestamp: true,
        }
    }
}

pub struct BackupManager {
    backup_root: PathBuf,
    retention: usize,
}

impl BackupManager {
    pub fn new(backup_root: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            backup_root: backup_root.into(),
            retention,
        }
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    /// Copy every legacy file into a fresh backup set and write its
    /// manifest. Per-file failures remove the partial copy and fail the
    /// whole call.
    pub fn create_backups(
        &self,
        files: &[LegacyFile],
        options: &BackupOptions,
    ) -> MigrationResult<Vec<Backup>> {
        let set_dir = self.backup_root.join(set_name(options.include_timestamp));
        let mut backups = Vec::with_capacity(files.len());

        for file in files {
            let backup = self
                .backup_one(file, &set_dir, options.verify)
                .map_err(|e| {
                    MigrationError::backup(
                        format!("backup:{}", file.path.display()),
                        e.to_string(),
                    )
                })?;
            tracing::info!(
                "backed up {} ({} bytes) to {}",
                file.path.display(),
                backup.size,
                backup.backup_path.display()
            );
            backups.push(backup);
        }

        self.write_manifest(&set_dir, &backups)?;
        self.prune_old_sets();
        Ok(backups)
    }

    /// Re-hash a backup file and compare against the recorded checksum.
    pub fn verify(&self, backup: &Backup) -> bool {
        match hash_file(&backup.backup_path) {
            Ok(checksum) => checksum == backup.checksum,
            Err(_) => false,
        }
    }

    /// Restore a backup to its original path (or an explicit target).
    /// The write goes to a sibling temp file, is fsync'd, then renamed.
    pub fn restore(&self, backup: &Backup, target: Option<&Path>) -> MigrationResult<()> {
        let target = target.unwrap_or(&backup.original_path);
        let context = format!("restore:{}", target.display());

        if !backup.backup_path.is_file() {
            return Err(MigrationError::rollback(
                context,
                format!("backup file {} is missing", backup.backup_path.display()),
            ));
        }

        let actual = hash_file(&backup.backup_path)
            .map_err(|e| MigrationError::rollback(context.clone(), e.to_string()))?;
        if actual != backup.checksum {
            return Err(MigrationError::rollback(
                context,
                format!(
                    "checksum mismatch for {}: expected {}, got {}",
                    backup.backup_path.display(),
                    backup.checksum,
                    actual
                ),
            ));
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| MigrationError::rollback(context.clone(), e.to_string()))?;
        }

        let temp = sibling_temp(target);
        let result = (|| -> std::io::Result<()> {
            fs::copy(&backup.backup_path, &temp)?;
            let handle = fs::File::open(&temp)?;
            handle.sync_all()?;
            fs::rename(&temp, target)?;
            Ok(())
        })();

        if let Err(e) = result {
            let _ = fs::remove_file(&temp);
            return Err(MigrationError::rollback(context, e.to_string()));
        }
        Ok(())
    }

    /// Reconstruct backups from every manifest under the backup root,
    /// newest set first.
    pub fn list(&self) -> Vec<Backup> {
        let mut backups = Vec::new();
        for set_dir in self.set_dirs() {
            let manifest = set_dir.join(MANIFEST_FILE);
            match fs::read_to_string(&manifest) {
                Ok(content) => match serde_json::from_str::<Vec<Backup>>(&content) {
                    Ok(mut set) => backups.append(&mut set),
                    Err(e) => {
                        tracing::warn!("unreadable manifest {}: {}", manifest.display(), e)
                    }
                },
                Err(_) => continue,
            }
        }
        backups
    }

    /// Delete a consumed backup set after a successful rollback.
    pub fn remove_set(&self, backups: &[Backup]) -> std::io::Result<()> {
        let mut dirs: Vec<PathBuf> = backups
            .iter()
            .filter_map(|b| b.backup_path.parent().and_then(Path::parent))
            .map(Path::to_path_buf)
            .collect();
        dirs.sort();
        dirs.dedup();
        for dir in dirs {
            if dir.starts_with(&self.backup_root) && dir.is_dir() {
                fs::remove_dir_all(&dir)?;
            }
        }
        Ok(())
    }

    /// Move a legacy original into the set's archive subtree (FINALIZE).
    pub fn archive_original(&self, backup: &Backup) -> MigrationResult<PathBuf> {
        let context = format!("archive:{}", backup.original_path.display());
        let set_dir = backup
            .backup_path
            .parent()
            .and_then(Path::parent)
            .ok_or_else(|| {
                MigrationError::backup(context.clone(), "backup set directory not found")
            })?;

        let dest_dir = set_dir.join(ARCHIVE_DIR).join(backup.kind.backup_subdir());
        fs::create_dir_all(&dest_dir)
            .map_err(|e| MigrationError::backup(context.clone(), e.to_string()))?;

        let file_name = backup.original_path.file_name().ok_or_else(|| {
            MigrationError::backup(context.clone(), "original path has no file name")
        })?;
        let dest = dest_dir.join(file_name);

        match fs::rename(&backup.original_path, &dest) {
            Ok(()) => Ok(dest),
            // Cross-device moves fall back to copy-then-remove.
            Err(_) => {
                fs::copy(&backup.original_path, &dest)
                    .and_then(|_| fs::remove_file(&backup.original_path))
                    .map_err(|e| MigrationError::backup(context, e.to_string()))?;
                Ok(dest)
            }
        }
    }

    fn backup_one(
        &self,
        file: &LegacyFile,
        set_dir: &Path,
        verify: bool,
    ) -> std::io::Result<Backup> {
        let dest_dir = set_dir.join(file.kind.backup_subdir());
        fs::create_dir_all(&dest_dir)?;

        let file_name = file.path.file_name().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "path has no file name")
        })?;
        let dest = dest_dir.join(file_name);
        let partial = dest.with_extension("partial");

        let copy_result = copy_and_hash(&file.path, &partial);
        let checksum = match copy_result {
            Ok(checksum) => checksum,
            Err(e) => {
                let _ = fs::remove_file(&partial);
                return Err(e);
            }
        };

        if let Err(e) = fs::rename(&partial, &dest) {
            let _ = fs::remove_file(&partial);
            return Err(e);
        }

        if verify {
            let reread = hash_file(&dest)?;
            if reread != checksum {
                let _ = fs::remove_file(&dest);
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!(
                        "checksum mismatch after copy of {}: expected {}, got {}",
                        file.path.display(),
                        checksum,
                        reread
                    ),
                ));
            }
        }

        let size = fs::metadata(&dest)?.len();
        Ok(Backup {
            id: Uuid::new_v4().to_string(),
            kind: file.kind,
            original_path: file.path.clone(),
            backup_path: dest,
            size,
            created_at: chrono::Utc::now().timestamp_millis(),
            checksum,
            valid: true,
        })
    }

    fn write_manifest(&self, set_dir: &Path, backups: &[Backup]) -> MigrationResult<()> {
        let manifest = set_dir.join(MANIFEST_FILE);
        let json = serde_json::to_string_pretty(backups)
            .map_err(|e| MigrationError::backup("backup:manifest", e.to_string()))?;
        fs::write(&manifest, json)
            .map_err(|e| MigrationError::backup("backup:manifest", e.to_string()))
    }

    fn set_dirs(&self) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        if let Ok(entries) = fs::read_dir(&self.backup_root) {
            for entry in entries.flatten() {
                if entry.path().is_dir() {
                    dirs.push(entry.path());
                }
            }
        }
        // Set names are timestamp-sortable.
        dirs.sort_by(|a, b| b.cmp(a));
        dirs
    }

    fn prune_old_sets(&self) {
        let removable: Vec<PathBuf> = self
            .set_dirs()
            .into_iter()
            .filter(|dir| !dir.join(ARCHIVE_DIR).is_dir())
            .collect();
        for dir in removable.iter().skip(self.retention.max(1)) {
            if let Err(e) = fs::remove_dir_all(dir) {
                tracing::warn!("failed to prune backup set {}: {}", dir.display(), e);
            } else {
                tracing::info!("pruned old backup set {}", dir.display());
            }
        }
    }
}

fn set_name(include_timestamp: bool) -> String {
    if include_timestamp {
        chrono::Utc::now().format("%Y-%m-%dT%H%M%S").to_string()
    } else {
        "current".to_string()
    }
}

fn sibling_temp(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "restore".to_string());
    target.with_file_name(format!(".{}.tmp", name))
}

/// Copy `source` to `dest`, hashing the bytes as they stream through.
fn copy_and_hash(source: &Path, dest: &Path) -> std::io::Result<String> {
    let mut reader = fs::File::open(source)?;
    let mut writer = fs::File::create(dest)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
        writer.write_all(&buffer[..n])?;
    }
    writer.sync_all()?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Hex-encoded SHA-256 of a file.
pub fn hash_file(path: &Path) -> std::io::Result<String> {
    let mut reader = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
