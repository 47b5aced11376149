//! Crash-safe storage for the catalogue file.
//!
//! Every write goes to a temp file in the same directory, is synced and read
//! back, and is only then published with a rename. Readers see either the old
//! file or the new one.

use crate::catalogue::{
    Catalogue, IntegrityViolation, MutationBatch, NodeId, RepairReport, SharedCatalogue,
    CATALOGUE_SCHEMA_VERSION,
};
use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use uuid::Uuid;

pub const DEFAULT_MAX_BACKUPS: usize = 5;

#[derive(Debug, Error)]
pub enum CorruptionError {
    #[error("catalogue at {} could not be read: {reason}", .path.display())]
    Unreadable { path: PathBuf, reason: String },

    #[error("catalogue at {} is not valid JSON: {reason}", .path.display())]
    Unparsable { path: PathBuf, reason: String },

    #[error("catalogue at {} uses schema {found}, newest supported is {supported}", .path.display())]
    UnsupportedSchema {
        path: PathBuf,
        found: u32,
        supported: u32,
    },

    #[error("catalogue at {} failed {} integrity check(s), first: {}", .path.display(), .violations.len(), first_violation(.violations))]
    Structural {
        path: PathBuf,
        violations: Vec<IntegrityViolation>,
    },
}

fn first_violation(violations: &[IntegrityViolation]) -> String {
    violations
        .first()
        .map(|v| v.to_string())
        .unwrap_or_default()
}

#[derive(Debug, Clone, Serialize)]
pub struct IntegrityReport {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: u64,
    pub node_count: usize,
    pub root_count: usize,
    pub options_set_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    Fresh,
    Live,
    Backup(PathBuf),
}

#[derive(Debug)]
pub struct PersistenceGuard {
    paths: AppPaths,
    max_backups: usize,
    writer: Mutex<()>,
}

impl PersistenceGuard {
    pub fn new(paths: AppPaths, max_backups: usize) -> Self {
        Self {
            paths,
            max_backups,
            writer: Mutex::new(()),
        }
    }

    pub fn catalogue_path(&self) -> PathBuf {
        self.paths.catalogue_path()
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        self.writer.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Applies `batch` at the serialization point and writes the result.
    ///
    /// The in-memory catalogue keeps the batch even when the write fails, so
    /// the caller can retry with [`PersistenceGuard::persist`].
    pub fn commit(
        &self,
        catalogue: &SharedCatalogue,
        batch: &MutationBatch,
    ) -> (Vec<NodeId>, Result<String>) {
        let _writer = self.lock_writer();
        let (touched, snapshot) = catalogue.mutate(|cat| {
            let touched = cat.apply_batch(batch);
            (touched, cat.clone())
        });
        tracing::debug!(
            mutations = batch.len(),
            touched = touched.len(),
            "catalogue batch applied"
        );
        let written = self.write_snapshot_locked(&snapshot);
        (touched, written)
    }

    /// Writes the current in-memory state without applying anything.
    pub fn persist(&self, catalogue: &SharedCatalogue) -> Result<String> {
        let _writer = self.lock_writer();
        let snapshot = catalogue.snapshot();
        self.write_snapshot_locked(&snapshot)
    }

    pub fn write_snapshot(&self, catalogue: &Catalogue) -> Result<String> {
        let _writer = self.lock_writer();
        self.write_snapshot_locked(catalogue)
    }

    fn write_snapshot_locked(&self, catalogue: &Catalogue) -> Result<String> {
        let path = self.catalogue_path();
        let fail = |reason: String| EngineError::PersistenceFailed {
            path: path.clone(),
            reason,
        };

        let json = serde_json::to_string_pretty(catalogue)?;
        let bytes = format!("{json}\n").into_bytes();
        let digest = hex::encode(Sha256::digest(&bytes));

        let dir = match path.parent() {
            Some(dir) => dir.to_path_buf(),
            None => return Err(fail("catalogue path has no parent directory".to_string())),
        };
        std::fs::create_dir_all(&dir).map_err(|e| fail(format!("create dir: {e}")))?;

        let temp = dir.join(format!(".catalogue.{}.tmp", Uuid::new_v4()));
        if let Err(err) = write_and_verify(&temp, &bytes, &digest) {
            let _ = std::fs::remove_file(&temp);
            return Err(fail(err));
        }

        if path.exists() {
            if let Err(err) = self.rotate_backups(&path) {
                let _ = std::fs::remove_file(&temp);
                return Err(fail(format!("rotate backups: {err}")));
            }
        }

        if let Err(err) = std::fs::rename(&temp, &path) {
            let _ = std::fs::remove_file(&temp);
            return Err(fail(format!("publish: {err}")));
        }
        sync_dir(&dir);

        tracing::info!(
            path = %path.display(),
            sha256 = %digest,
            nodes = catalogue.len(),
            "catalogue written"
        );
        Ok(digest)
    }

    fn backup_path(&self, index: usize) -> PathBuf {
        self.paths
            .backups_dir()
            .join(format!("catalogue.json.{index}"))
    }

    /// Backup files, newest first.
    pub fn backups(&self) -> Vec<PathBuf> {
        (1..=self.max_backups)
            .map(|i| self.backup_path(i))
            .filter(|p| p.exists())
            .collect()
    }

    fn rotate_backups(&self, live: &Path) -> std::io::Result<()> {
        if self.max_backups == 0 {
            return Ok(());
        }
        std::fs::create_dir_all(self.paths.backups_dir())?;
        for i in (2..=self.max_backups).rev() {
            let src = self.backup_path(i - 1);
            if !src.exists() {
                continue;
            }
            let dst = self.backup_path(i);
            if dst.exists() {
                let _ = std::fs::remove_file(&dst);
            }
            std::fs::rename(src, dst)?;
        }
        // Copy rather than move: the live file must stay in place until the rename.
        std::fs::copy(live, self.backup_path(1))?;
        Ok(())
    }

    /// Reads the live file; an absent file yields an empty catalogue.
    pub fn load(&self) -> Result<Catalogue> {
        let path = self.catalogue_path();
        if !path.exists() {
            return Ok(Catalogue::new());
        }
        Ok(read_catalogue(&path)?)
    }

    /// Like [`PersistenceGuard::load`], falling back to the newest readable backup.
    pub fn load_or_recover(&self) -> Result<(Catalogue, LoadSource)> {
        let path = self.catalogue_path();
        if !path.exists() {
            return Ok((Catalogue::new(), LoadSource::Fresh));
        }
        let live_err = match read_catalogue(&path) {
            Ok(cat) => return Ok((cat, LoadSource::Live)),
            Err(err) => err,
        };
        tracing::warn!(error = %live_err, "live catalogue unreadable, trying backups");

        for backup in self.backups() {
            match read_catalogue(&backup) {
                Ok(cat) => {
                    tracing::warn!(backup = %backup.display(), "recovered catalogue from backup");
                    return Ok((cat, LoadSource::Backup(backup)));
                }
                Err(err) => {
                    tracing::warn!(backup = %backup.display(), error = %err, "backup unreadable");
                }
            }
        }
        Err(live_err.into())
    }

    /// Read-only structural validation of the file on disk.
    pub fn check_integrity(&self) -> std::result::Result<IntegrityReport, CorruptionError> {
        let path = self.catalogue_path();
        let bytes = std::fs::read(&path).map_err(|e| CorruptionError::Unreadable {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        let catalogue = parse_catalogue(&path, &bytes)?;
        let violations = catalogue.integrity_violations();
        if !violations.is_empty() {
            return Err(CorruptionError::Structural { path, violations });
        }
        Ok(IntegrityReport {
            sha256: hex::encode(Sha256::digest(&bytes)),
            bytes: bytes.len() as u64,
            node_count: catalogue.len(),
            root_count: catalogue.roots().len(),
            options_set_count: catalogue.options_set_count(),
            path,
        })
    }

    /// Repairs the in-memory tree and writes the result.
    pub fn repair(&self, catalogue: &SharedCatalogue) -> Result<RepairReport> {
        let _writer = self.lock_writer();
        let (report, snapshot) = catalogue.mutate(|cat| {
            let report = cat.repair();
            (report, cat.clone())
        });
        if !report.fixed.is_empty() {
            self.write_snapshot_locked(&snapshot)?;
        }
        tracing::info!(
            fixed = report.fixed.len(),
            remaining = report.remaining.len(),
            "catalogue repair finished"
        );
        Ok(report)
    }
}

fn write_and_verify(temp: &Path, bytes: &[u8], digest: &str) -> std::result::Result<(), String> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(temp)
        .map_err(|e| format!("create temp file: {e}"))?;
    file.write_all(bytes)
        .map_err(|e| format!("write temp file: {e}"))?;
    file.sync_all().map_err(|e| format!("sync temp file: {e}"))?;
    drop(file);

    let read_back = std::fs::read(temp).map_err(|e| format!("read back: {e}"))?;
    let read_digest = hex::encode(Sha256::digest(&read_back));
    if read_digest != digest {
        return Err(format!(
            "read-back checksum mismatch (expected {digest}, got {read_digest})"
        ));
    }
    serde_json::from_slice::<Catalogue>(&read_back)
        .map_err(|e| format!("read-back parse: {e}"))?;
    Ok(())
}

fn sync_dir(dir: &Path) {
    // Directories cannot be opened for sync on every platform.
    if let Ok(handle) = File::open(dir) {
        let _ = handle.sync_all();
    }
}

fn read_catalogue(path: &Path) -> std::result::Result<Catalogue, CorruptionError> {
    let bytes = std::fs::read(path).map_err(|e| CorruptionError::Unreadable {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    let mut catalogue = parse_catalogue(path, &bytes)?;
    catalogue.ensure_default_options();
    Ok(catalogue)
}

fn parse_catalogue(path: &Path, bytes: &[u8]) -> std::result::Result<Catalogue, CorruptionError> {
    let catalogue: Catalogue =
        serde_json::from_slice(bytes).map_err(|e| CorruptionError::Unparsable {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
    if catalogue.schema_version > CATALOGUE_SCHEMA_VERSION {
        return Err(CorruptionError::UnsupportedSchema {
            path: path.to_path_buf(),
            found: catalogue.schema_version,
            supported: CATALOGUE_SCHEMA_VERSION,
        });
    }
    Ok(catalogue)
}
