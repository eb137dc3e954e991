//! In-memory per-directory record store backed by the XML sidecar.
//!
//! One store owns every [`FileRecord`] of one directory. A single
//! readers-writer lock serializes mutation; persistence is only ever invoked
//! when the walker has drained in-flight visits, so it may run under the same
//! lock without racing a mutator. Distinct directories' stores operate fully
//! in parallel.

use crate::record::FileRecord;
use crate::sidecar::{self, SIDECAR_NAME, SidecarError};
use crate::tokens::TokenPool;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::warn;

/// Process-wide cap on concurrent sidecar writes.
pub const SIDECAR_WRITE_TOKENS: usize = 4;

static WRITE_TOKENS: LazyLock<TokenPool> =
    LazyLock::new(|| TokenPool::new(SIDECAR_WRITE_TOKENS));

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Sidecar error: {0}")]
    Sidecar(#[from] SidecarError),
    #[error("record has an empty name")]
    EmptyName,
    #[error("self-check failed for {directory}: record {name:?} is misrouted")]
    SelfCheck { directory: PathBuf, name: String },
}

/// Directive returned by a [`DirectoryStore::range_mutate`] callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitOutcome {
    /// The record was mutated; keep it and mark the store dirty.
    Keep,
    /// The record was not touched.
    Ignore,
    /// Remove the record from the store. Removal is deferred to a second
    /// pass inside the same critical section; the file on disk is not
    /// touched.
    Delete,
}

struct Inner {
    records: BTreeMap<String, FileRecord>,
    dirty: bool,
}

/// The record map for one directory, plus its sidecar I/O.
pub struct DirectoryStore {
    directory: PathBuf,
    inner: RwLock<Inner>,
}

impl DirectoryStore {
    /// Load the store for `dir`. A missing sidecar is not an error and
    /// yields an empty store. A sidecar that fails to parse with a
    /// recoverable syntax error is logged and treated as empty.
    pub fn load(dir: &Path) -> Result<Self, StoreError> {
        let sidecar_path = dir.join(SIDECAR_NAME);

        let records = match std::fs::read(&sidecar_path) {
            Ok(content) => match sidecar::parse_dir_sidecar(&content, dir) {
                Ok(records) => records,
                Err(SidecarError::Syntax(msg)) => {
                    warn!(
                        "ignoring malformed sidecar {}: {}",
                        sidecar_path.display(),
                        msg
                    );
                    BTreeMap::new()
                }
                Err(e) => return Err(e.into()),
            },
            Err(e) if e.kind() == ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(StoreError::Io(e)),
        };

        Ok(DirectoryStore {
            directory: dir.to_path_buf(),
            inner: RwLock::new(Inner {
                records,
                dirty: false,
            }),
        })
    }

    /// An empty, clean store for `dir` without touching the filesystem.
    pub fn empty(dir: &Path) -> Self {
        DirectoryStore {
            directory: dir.to_path_buf(),
            inner: RwLock::new(Inner {
                records: BTreeMap::new(),
                dirty: false,
            }),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn sidecar_path(&self) -> PathBuf {
        self.directory.join(SIDECAR_NAME)
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.read().dirty
    }

    /// Copy out the record for `name`, if present.
    pub fn get(&self, name: &str) -> Option<FileRecord> {
        self.inner.read().records.get(name).cloned()
    }

    /// Names of all records, in map order.
    pub fn names(&self) -> Vec<String> {
        self.inner.read().records.keys().cloned().collect()
    }

    /// Upsert a record. The back-reference is rewritten to this store's
    /// directory: a record routed here is owned here.
    pub fn put(&self, mut record: FileRecord) -> Result<(), StoreError> {
        if record.name.is_empty() {
            return Err(StoreError::EmptyName);
        }
        record.directory = self.directory.clone();

        let mut inner = self.inner.write();
        inner.records.insert(record.name.clone(), record);
        inner.dirty = true;
        Ok(())
    }

    /// Mutate the record for `name` in place under the write lock. Returns
    /// false if no such record exists.
    pub fn update_record<F>(&self, name: &str, f: F) -> bool
    where
        F: FnOnce(&mut FileRecord),
    {
        let mut inner = self.inner.write();
        match inner.records.get_mut(name) {
            Some(record) => {
                f(record);
                inner.dirty = true;
                true
            }
            None => false,
        }
    }

    /// Remove the record for `name` and delete the underlying file on disk.
    /// A file already gone from disk is not an error.
    pub fn remove(&self, name: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write();
        let existed = inner.records.remove(name).is_some();
        if existed {
            inner.dirty = true;
        }

        match std::fs::remove_file(self.directory.join(name)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }

        Ok(existed)
    }

    /// Rename a record and the underlying file. The record keeps its
    /// checksum and backup destinations: content is unchanged.
    pub fn rename(&self, old_name: &str, new_name: &str) -> Result<(), StoreError> {
        if new_name.is_empty() {
            return Err(StoreError::EmptyName);
        }

        let mut inner = self.inner.write();
        let Some(mut record) = inner.records.remove(old_name) else {
            return Err(StoreError::Io(std::io::Error::new(
                ErrorKind::NotFound,
                format!("no record named {old_name:?}"),
            )));
        };

        std::fs::rename(
            self.directory.join(old_name),
            self.directory.join(new_name),
        )
        .inspect_err(|_| {
            // Disk rename failed; keep the map consistent with disk.
            inner.records.insert(record.name.clone(), record.clone());
        })?;

        record.name = new_name.to_string();
        inner.records.insert(record.name.clone(), record);
        inner.dirty = true;
        Ok(())
    }

    /// Iterate all records under the exclusive lock. Deletions requested by
    /// the callback are applied in a second pass inside the same critical
    /// section, so the callback observes a stable map.
    pub fn range_mutate<F>(&self, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&mut FileRecord) -> Result<VisitOutcome, StoreError>,
    {
        let mut inner = self.inner.write();

        let mut doomed = Vec::new();
        let mut mutated = false;
        for (name, record) in inner.records.iter_mut() {
            match f(record)? {
                VisitOutcome::Keep => mutated = true,
                VisitOutcome::Ignore => {}
                VisitOutcome::Delete => doomed.push(name.clone()),
            }
        }

        for name in &doomed {
            inner.records.remove(name);
        }
        if mutated || !doomed.is_empty() {
            inner.dirty = true;
        }

        Ok(())
    }

    /// Re-iterate records without re-reading the sidecar; the second pass of
    /// the inline two-pass algorithms.
    pub fn revisit<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnMut(&mut FileRecord) -> Result<VisitOutcome, StoreError>,
    {
        self.range_mutate(f)
    }

    /// Drop records whose file no longer exists on disk. The files
    /// themselves are not touched.
    pub fn delete_missing(&self) -> Result<(), StoreError> {
        self.range_mutate(|record| {
            if record.path().symlink_metadata().is_err() {
                Ok(VisitOutcome::Delete)
            } else {
                Ok(VisitOutcome::Ignore)
            }
        })
    }

    /// Write the sidecar if the store is dirty. An empty store persists by
    /// removing the sidecar rather than writing an empty one. Concurrent
    /// sidecar writes across all stores are capped by a process-wide token
    /// pool.
    pub fn persist(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();

        if !inner.dirty {
            return Ok(());
        }

        for (name, record) in &inner.records {
            if record.name != *name || record.directory != self.directory {
                return Err(StoreError::SelfCheck {
                    directory: self.directory.clone(),
                    name: name.clone(),
                });
            }
        }

        let sidecar_path = self.sidecar_path();
        if inner.records.is_empty() {
            match std::fs::remove_file(&sidecar_path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io(e)),
            }
        } else {
            let content = sidecar::render_dir_sidecar(&self.directory, inner.records.values())?;
            // Persistence must complete even during shutdown unwinding.
            let _token = WRITE_TOKENS.acquire_blocking();
            sidecar::write_atomic(&sidecar_path, &content)?;
        }

        inner.dirty = false;
        Ok(())
    }
}
