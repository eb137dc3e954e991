//! Per-file metadata records and the checksum update/validate operations.
//!
//! A [`FileRecord`] belongs to exactly one directory store and is identified
//! by its `(directory, name)` pair. The `directory` back-reference is set on
//! load and never serialized; engines that index records by value route any
//! write-back through the owning store.

use crate::fingerprint::{FingerprintError, FingerprintService};
use crate::shutdown::Shutdown;
use std::collections::{BTreeMap, BTreeSet};
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

#[derive(Debug, thiserror::Error)]
pub enum ChecksumError {
    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),
    /// Validation found the content drifted from the stored checksum. The new
    /// value has already been stored; callers treat this as non-fatal.
    #[error("checksum recalculated for {path}: content changed since last fingerprint")]
    Recalced { path: PathBuf },
}

impl ChecksumError {
    /// True for the non-fatal drift signal.
    pub fn is_recalced(&self) -> bool {
        matches!(self, ChecksumError::Recalced { .. })
    }
}

/// The cross-directory equality class used by backup and duplicate detection.
/// Two records with equal key and a non-empty checksum are treated as
/// identical content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackupKey {
    pub size: u64,
    pub checksum: String,
}

/// Metadata for one file in one directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// File name within the owning directory. Non-empty, no path separator.
    pub name: String,
    /// Size in bytes at last stat.
    pub size: u64,
    /// Modification time in seconds since the Unix epoch.
    pub mtime: i64,
    /// Unpadded base64 MD5 of the content; empty until computed.
    pub checksum: String,
    /// Free-form annotations.
    pub tags: BTreeSet<String>,
    /// Labels of volumes known to hold this content.
    pub backup_dests: BTreeSet<String>,
    /// Unknown sidecar attributes, preserved verbatim on round-trip.
    pub extra: BTreeMap<String, String>,
    /// Owning directory. In-memory routing only; never serialized.
    pub(crate) directory: PathBuf,
}

impl FileRecord {
    /// Create a fresh record from a stat result. The checksum starts empty.
    pub fn from_stat(name: &str, directory: &Path, meta: &Metadata) -> Self {
        FileRecord {
            name: name.to_string(),
            size: meta.len(),
            mtime: mtime_seconds(meta),
            checksum: String::new(),
            tags: BTreeSet::new(),
            backup_dests: BTreeSet::new(),
            extra: BTreeMap::new(),
            directory: directory.to_path_buf(),
        }
    }

    /// Absolute path of the underlying file.
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }

    /// The owning directory this record routes through.
    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// True iff stored size or mtime differs from the given stat.
    pub fn changed(&self, meta: &Metadata) -> bool {
        self.size != meta.len() || self.mtime != mtime_seconds(meta)
    }

    /// Refresh size and mtime from a stat result. When they differ from the
    /// stored values the checksum is cleared: the old fingerprint no longer
    /// describes the content on disk.
    pub fn refresh_stat(&mut self, meta: &Metadata) -> bool {
        if !self.changed(meta) {
            return false;
        }
        self.size = meta.len();
        self.mtime = mtime_seconds(meta);
        self.checksum.clear();
        self.backup_dests.clear();
        true
    }

    /// Assign a checksum. A genuinely new value clears `backup_dests`: old
    /// backups cannot vouch for new content. Assigning the current value is
    /// a no-op.
    pub fn set_checksum(&mut self, checksum: String) -> bool {
        if self.checksum == checksum {
            return false;
        }
        self.checksum = checksum;
        self.backup_dests.clear();
        true
    }

    /// The cross-directory content identity, if the checksum is computed.
    pub fn backup_key(&self) -> Option<BackupKey> {
        if self.checksum.is_empty() {
            return None;
        }
        Some(BackupKey {
            size: self.size,
            checksum: self.checksum.clone(),
        })
    }

    /// True if the given volume label is recorded as holding this content.
    pub fn has_backup_dest(&self, label: &str) -> bool {
        self.backup_dests.contains(label)
    }

    /// Record the given volume label as holding this content.
    pub fn add_backup_dest(&mut self, label: &str) -> bool {
        self.backup_dests.insert(label.to_string())
    }
}

/// Seconds since the Unix epoch for a stat result. Pre-epoch mtimes are
/// reported as negative seconds.
pub fn mtime_seconds(meta: &Metadata) -> i64 {
    match meta.modified() {
        Ok(mtime) => match mtime.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            Err(e) => -(e.duration().as_secs() as i64),
        },
        Err(_) => 0,
    }
}

/// Ensure the record carries a checksum.
///
/// With `force == false` an existing checksum is left alone. Otherwise the
/// fingerprint is recomputed; an unchanged value mutates nothing, a new value
/// overwrites the old and clears `backup_dests`. Returns whether the record
/// was mutated.
pub fn update_checksum(
    record: &mut FileRecord,
    service: &FingerprintService,
    shutdown: &Shutdown,
    force: bool,
) -> Result<bool, FingerprintError> {
    if !force && !record.checksum.is_empty() {
        return Ok(false);
    }
    let checksum = service.compute(&record.path(), shutdown)?;
    Ok(record.set_checksum(checksum))
}

/// Recompute the fingerprint and compare against the stored value.
///
/// On drift the new value is stored, `backup_dests` is cleared, and the
/// distinguished [`ChecksumError::Recalced`] signal is returned; callers
/// treat it as non-fatal. A record with no stored checksum is simply
/// fingerprinted.
pub fn validate_checksum(
    record: &mut FileRecord,
    service: &FingerprintService,
    shutdown: &Shutdown,
) -> Result<(), ChecksumError> {
    let path = record.path();
    let checksum = service.compute(&path, shutdown)?;
    let had_checksum = !record.checksum.is_empty();
    if !record.set_checksum(checksum) {
        return Ok(());
    }
    if had_checksum {
        return Err(ChecksumError::Recalced { path });
    }
    Ok(())
}
