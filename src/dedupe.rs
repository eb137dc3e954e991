//! Duplicate detection across trees.
//!
//! The engine indexes records by [`BackupKey`] and reports every key held by
//! more than one location, whether the copies share a directory or not. A
//! checksum seen with two different sizes is a fingerprint collision: those
//! are warned about and never merged.

use crate::autofix;
use crate::fingerprint::FingerprintService;
use crate::record::{BackupKey, FileRecord};
use crate::shutdown::Shutdown;
use crate::store::{DirectoryStore, VisitOutcome};
use crate::walker::{ChecksumVisitor, DirectoryTracker, WalkError, WalkOptions};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

/// Where one copy of some content lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordLoc {
    pub directory: PathBuf,
    pub name: String,
}

impl RecordLoc {
    pub fn path(&self) -> PathBuf {
        self.directory.join(&self.name)
    }

    fn of(record: &FileRecord) -> Self {
        RecordLoc {
            directory: record.directory().to_path_buf(),
            name: record.name.clone(),
        }
    }
}

/// A newly discovered duplicate: `existing` was indexed first, `duplicate`
/// carries the same key.
#[derive(Debug, Clone)]
pub struct DuplicatePair {
    pub key: BackupKey,
    pub existing: RecordLoc,
    pub duplicate: RecordLoc,
}

/// Content index: BackupKey to every known location.
#[derive(Default)]
pub struct DuplicateIndex {
    by_key: HashMap<BackupKey, Vec<RecordLoc>>,
    /// First-seen size per checksum, for collision detection.
    sizes: HashMap<String, u64>,
    collisions: usize,
}

impl DuplicateIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Index a record. Returns the duplicate pair when this is not the first
    /// location holding the key. Records without a checksum are ignored.
    pub fn add(&mut self, record: &FileRecord) -> Option<DuplicatePair> {
        let key = record.backup_key()?;
        let loc = RecordLoc::of(record);

        match self.sizes.get(&key.checksum) {
            Some(&size) if size != key.size => {
                self.collisions += 1;
                warn!(
                    "fingerprint collision: checksum {} seen with sizes {} and {} ({})",
                    key.checksum,
                    size,
                    key.size,
                    loc.path().display()
                );
            }
            Some(_) => {}
            None => {
                self.sizes.insert(key.checksum.clone(), key.size);
            }
        }

        let locations = self.by_key.entry(key.clone()).or_default();
        let pair = locations.first().map(|existing| DuplicatePair {
            key: key.clone(),
            existing: existing.clone(),
            duplicate: loc.clone(),
        });
        locations.push(loc);
        pair
    }

    /// Every key held by more than one location, with all its locations.
    pub fn duplicate_groups(&self) -> Vec<(&BackupKey, &[RecordLoc])> {
        let mut groups: Vec<(&BackupKey, &[RecordLoc])> = self
            .by_key
            .iter()
            .filter(|(_, locations)| locations.len() > 1)
            .map(|(key, locations)| (key, locations.as_slice()))
            .collect();
        groups.sort_by_key(|(key, _)| (*key).clone());
        groups
    }

    /// Fingerprint collisions observed while indexing.
    pub fn collisions(&self) -> usize {
        self.collisions
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }
}

/// Walk `roots` keeping checksums current, then index every record. Stores
/// are held live across the walk so indexing re-reads nothing from disk.
pub fn scan_trees(
    roots: &[PathBuf],
    walk: &WalkOptions,
    service: &FingerprintService,
    shutdown: &Shutdown,
) -> Result<DuplicateIndex, WalkError> {
    let mut index = DuplicateIndex::new();

    for root in roots {
        let tracker = DirectoryTracker::new(WalkOptions {
            preserve_structs: true,
            ..walk.clone()
        });
        let visitor = ChecksumVisitor::new(service.clone());
        let report = tracker.walk(root, &visitor, shutdown)?;
        if !report.errors.is_empty() {
            warn!(
                "{} errors while scanning {}",
                report.errors.len(),
                root.display()
            );
        }

        tracker.revisit_all(|_store, record| {
            index.add(record);
            Ok(VisitOutcome::Ignore)
        })?;
        tracker.finish()?;
    }

    Ok(index)
}

/// Outcome of pruning one duplicate group.
#[derive(Debug)]
pub struct PruneAction {
    pub kept: RecordLoc,
    pub removed: Vec<RecordLoc>,
}

/// For every duplicate group, keep the highest-scoring location and delete
/// the rest through their owning stores. Ties keep the earlier location.
pub fn prune_duplicates(
    index: &DuplicateIndex,
    shutdown: &Shutdown,
) -> Result<Vec<PruneAction>, WalkError> {
    let mut actions = Vec::new();

    for (_key, locations) in index.duplicate_groups() {
        if shutdown.is_shutdown() {
            return Err(WalkError::Shutdown);
        }

        let mut keeper = 0;
        for candidate in 1..locations.len() {
            if autofix::prefer_second(&locations[keeper].path(), &locations[candidate].path()) {
                keeper = candidate;
            }
        }

        let mut removed = Vec::new();
        for (i, loser) in locations.iter().enumerate() {
            if i == keeper {
                continue;
            }
            let store = DirectoryStore::load(&loser.directory)?;
            store.remove(&loser.name)?;
            store.persist()?;
            removed.push(loser.clone());
        }

        actions.push(PruneAction {
            kept: locations[keeper].clone(),
            removed,
        });
    }

    Ok(actions)
}

/// Convenience for reporting: scan and return the groups as owned data.
pub fn report_duplicates(index: &DuplicateIndex) -> Vec<(BackupKey, Vec<PathBuf>)> {
    index
        .duplicate_groups()
        .into_iter()
        .map(|(key, locations)| {
            (
                key.clone(),
                locations.iter().map(RecordLoc::path).collect(),
            )
        })
        .collect()
}
