//! Post-hoc discovery that content already lives on a backup volume.
//!
//! Backups made by hand leave the source records untagged even though the
//! content is safely on a labeled volume. Discovery walks the volume tree,
//! indexes its sidecars by content key, and tags every source record whose
//! key the volume holds. It never mints labels and never copies: a volume
//! without a label is an error, not an invitation.

use crate::backup::{BackupError, index_destination};
use crate::fingerprint::FingerprintService;
use crate::shutdown::Shutdown;
use crate::store::DirectoryStore;
use crate::volume;
use crate::walker::{ChecksumVisitor, DirectoryTracker, Visitor, WalkError, WalkOptions};
use crate::record::BackupKey;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{info, warn};

#[derive(Debug)]
pub struct DiscoverySummary {
    pub label: String,
    /// Source records newly tagged with the volume's label.
    pub tagged: usize,
}

/// Tag records under `sources` whose content exists on the volume holding
/// `volume_path`.
pub fn run_discovery(
    sources: &[PathBuf],
    volume_path: &Path,
    walk: &WalkOptions,
    service: &FingerprintService,
    shutdown: &Shutdown,
) -> Result<DiscoverySummary, BackupError> {
    let label = volume::require_label(volume_path)?;

    let (present, _disk) = index_destination(volume_path, walk, shutdown)?;
    info!(
        "volume {} holds {} distinct content keys",
        label,
        present.len()
    );

    let visitor = DiscoveryVisitor {
        inner: ChecksumVisitor::new(service.clone()),
        present: Mutex::new(present),
        label: label.clone(),
        tagged: AtomicUsize::new(0),
    };

    for source in sources {
        let source_root = source.canonicalize().map_err(BackupError::Io)?;
        let tracker = DirectoryTracker::new(walk.clone());
        let report = tracker.walk(&source_root, &visitor, shutdown)?;
        if !report.errors.is_empty() {
            warn!(
                "{} errors while discovering under {}",
                report.errors.len(),
                source_root.display()
            );
        }
    }

    Ok(DiscoverySummary {
        label,
        tagged: visitor.tagged.load(Ordering::SeqCst),
    })
}

struct DiscoveryVisitor {
    inner: ChecksumVisitor,
    present: Mutex<HashMap<BackupKey, BTreeSet<PathBuf>>>,
    label: String,
    tagged: AtomicUsize,
}

impl Visitor for DiscoveryVisitor {
    fn visit_file(
        &self,
        store: &Arc<DirectoryStore>,
        name: &str,
        metadata: &std::fs::Metadata,
        shutdown: &Shutdown,
    ) -> Result<(), WalkError> {
        self.inner.visit_file(store, name, metadata, shutdown)?;

        let Some(record) = store.get(name) else {
            return Ok(());
        };
        let Some(key) = record.backup_key() else {
            return Ok(());
        };
        if record.has_backup_dest(&self.label) {
            return Ok(());
        }

        if self.present.lock().contains_key(&key) {
            store.update_record(name, |record| {
                record.add_backup_dest(&self.label);
            });
            self.tagged.fetch_add(1, Ordering::SeqCst);
        }

        Ok(())
    }

    fn directory_done(&self, store: &DirectoryStore) -> Result<(), WalkError> {
        self.inner.directory_done(store)
    }
}
