//! Bounded-concurrency directory walker driving the per-directory stores.
//!
//! The tracker walks a tree with two task families: a counting pre-pass that
//! sizes the walk for progress reporting, and the visit pass that opens one
//! [`DirectoryStore`] per directory and dispatches file visits to a bounded
//! worker pool. Visits inside one directory run in parallel; the store's lock
//! serializes conflicting mutations. When the walk leaves a directory's
//! subtree the store drains its in-flight visits and persists.
//!
//! Unit-of-work errors flow through a bounded channel with non-blocking
//! sends: when nobody drains fast enough, errors are dropped and summarized
//! rather than deadlocking the walk.

use crate::dir_list::{self, DirListError, FsEntry};
use crate::dirlock::DirLocks;
use crate::fingerprint::{FingerprintError, FingerprintService};
use crate::record::{self, ChecksumError, FileRecord};
use crate::shutdown::Shutdown;
use crate::store::{DirectoryStore, StoreError, VisitOutcome};
use crate::tokens::{TokenError, TokenGuard, TokenPool};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, warn};

/// Default number of concurrent file visits per tracker.
pub const DEFAULT_VISIT_TOKENS: usize = 4;
/// Default error-channel capacity.
pub const DEFAULT_ERROR_CAPACITY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum WalkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Directory listing error: {0}")]
    DirList(#[from] DirListError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Checksum error: {0}")]
    Checksum(#[from] ChecksumError),
    #[error("Fingerprint error: {0}")]
    Fingerprint(#[from] FingerprintError),
    #[error("directory entered twice in one walk: {0}")]
    Reentered(PathBuf),
    #[error("shutdown requested")]
    Shutdown,
}

impl From<TokenError> for WalkError {
    fn from(_: TokenError) -> Self {
        WalkError::Shutdown
    }
}

impl WalkError {
    /// True for cooperative-cancellation errors, which the operation layer
    /// filters out before user-visible reporting.
    pub fn is_shutdown(&self) -> bool {
        match self {
            WalkError::Shutdown => true,
            WalkError::Fingerprint(FingerprintError::Shutdown) => true,
            WalkError::Checksum(ChecksumError::Fingerprint(FingerprintError::Shutdown)) => true,
            _ => false,
        }
    }
}

/// Receives a file visit on a walker worker thread.
///
/// Implementations mutate records through the owning store; the tracker
/// guarantees the store outlives the visit and that persistence happens
/// after every accepted visit completed.
pub trait Visitor: Sync {
    fn visit_file(
        &self,
        store: &Arc<DirectoryStore>,
        name: &str,
        metadata: &std::fs::Metadata,
        shutdown: &Shutdown,
    ) -> Result<(), WalkError>;

    /// Called once per directory after its visits drained, before the store
    /// persists.
    fn directory_done(&self, _store: &DirectoryStore) -> Result<(), WalkError> {
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct WalkOptions {
    /// Concurrent file visits.
    pub visit_tokens: usize,
    /// Keep stores live after the walk for a revisit pass instead of
    /// closing them as the walk leaves scope.
    pub preserve_structs: bool,
    /// Error-channel capacity; senders never block on a full channel.
    pub error_capacity: usize,
}

impl Default for WalkOptions {
    fn default() -> Self {
        WalkOptions {
            visit_tokens: DEFAULT_VISIT_TOKENS,
            preserve_structs: false,
            error_capacity: DEFAULT_ERROR_CAPACITY,
        }
    }
}

/// Outcome of one walk.
#[derive(Debug)]
pub struct WalkReport {
    pub files_visited: usize,
    pub dirs_counted: usize,
    pub dirs_visited: usize,
    /// Visit-level errors, shutdown filtered out.
    pub errors: Vec<WalkError>,
    /// Errors dropped because the channel was full.
    pub errors_dropped: usize,
    /// The count pass and the visit pass disagreed: the tree changed under
    /// the walker.
    pub tree_changed: bool,
}

#[derive(Clone)]
struct ErrorSink {
    tx: Sender<WalkError>,
    dropped: Arc<AtomicUsize>,
}

impl ErrorSink {
    fn send(&self, error: WalkError) {
        match self.tx.try_send(error) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Tracks visits still in flight for one store.
#[derive(Default)]
struct Gate {
    count: Mutex<usize>,
    drained: Condvar,
}

impl Gate {
    fn enter(self: &Arc<Self>) -> GateGuard {
        *self.count.lock() += 1;
        GateGuard(Arc::clone(self))
    }

    fn wait_drained(&self) {
        let mut count = self.count.lock();
        while *count != 0 {
            self.drained.wait(&mut count);
        }
    }
}

struct GateGuard(Arc<Gate>);

impl Drop for GateGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock();
        *count -= 1;
        if *count == 0 {
            self.0.drained.notify_all();
        }
    }
}

struct ActiveDir {
    store: Arc<DirectoryStore>,
    gate: Arc<Gate>,
}

struct VisitJob<'a> {
    store: Arc<DirectoryStore>,
    name: String,
    metadata: std::fs::Metadata,
    visitor: &'a dyn Visitor,
    shutdown: Shutdown,
    _token: TokenGuard,
    _gate: GateGuard,
}

impl VisitJob<'_> {
    fn run(self, sink: &ErrorSink) {
        if let Err(e) = self
            .visitor
            .visit_file(&self.store, &self.name, &self.metadata, &self.shutdown)
        {
            sink.send(e);
        }
        // Token and gate release on drop, covering every exit path.
    }
}

/// Walks trees, owning the active stores and their lifecycle.
pub struct DirectoryTracker {
    options: WalkOptions,
    visit_tokens: TokenPool,
    active: Mutex<BTreeMap<PathBuf, ActiveDir>>,
    closed: Mutex<HashSet<PathBuf>>,
    last_entered: Mutex<Option<PathBuf>>,
    dir_locks: Arc<DirLocks>,
    dirs_counted: AtomicUsize,
    dirs_visited: AtomicUsize,
    files_visited: AtomicUsize,
}

impl DirectoryTracker {
    pub fn new(options: WalkOptions) -> Self {
        let visit_tokens = TokenPool::new(options.visit_tokens);
        DirectoryTracker {
            options,
            visit_tokens,
            active: Mutex::new(BTreeMap::new()),
            closed: Mutex::new(HashSet::new()),
            last_entered: Mutex::new(None),
            dir_locks: Arc::new(DirLocks::new()),
            dirs_counted: AtomicUsize::new(0),
            dirs_visited: AtomicUsize::new(0),
            files_visited: AtomicUsize::new(0),
        }
    }

    /// The per-directory mutex map shared with engines that read-modify-write
    /// sidecars outside the walk.
    pub fn dir_locks(&self) -> Arc<DirLocks> {
        Arc::clone(&self.dir_locks)
    }

    /// Progress denominator: directories found by the counting pre-pass.
    pub fn total(&self) -> usize {
        self.dirs_counted.load(Ordering::Relaxed)
    }

    /// Progress numerator: directories entered by the visit pass.
    pub fn value(&self) -> usize {
        self.dirs_visited.load(Ordering::Relaxed)
    }

    /// Walk `root`, dispatching every non-hidden regular file to `visitor`.
    pub fn walk(
        &self,
        root: &Path,
        visitor: &dyn Visitor,
        shutdown: &Shutdown,
    ) -> Result<WalkReport, WalkError> {
        let root = root.canonicalize()?;

        self.dirs_counted.store(0, Ordering::Relaxed);
        self.dirs_visited.store(0, Ordering::Relaxed);
        self.files_visited.store(0, Ordering::Relaxed);
        self.last_entered.lock().take();
        self.closed.lock().clear();

        let (err_tx, err_rx) = bounded::<WalkError>(self.options.error_capacity);
        let dropped = Arc::new(AtomicUsize::new(0));
        let sink = ErrorSink {
            tx: err_tx,
            dropped: Arc::clone(&dropped),
        };

        let walk_result = thread::scope(|scope| {
            let counter = {
                let root = root.clone();
                let counted = &self.dirs_counted;
                let count_sink = sink.clone();
                scope.spawn(move || count_directories(&root, counted, &count_sink))
            };

            let (job_tx, job_rx) = bounded::<VisitJob<'_>>(self.options.visit_tokens);
            let workers: Vec<_> = (0..self.options.visit_tokens)
                .map(|_| {
                    let job_rx: Receiver<VisitJob<'_>> = job_rx.clone();
                    let worker_sink = sink.clone();
                    scope.spawn(move || {
                        for job in job_rx.iter() {
                            job.run(&worker_sink);
                        }
                    })
                })
                .collect();
            drop(job_rx);

            let result = self.walk_dir(&root, visitor, shutdown, &job_tx, &sink);

            drop(job_tx);
            for worker in workers {
                let _ = worker.join();
            }
            let _ = counter.join();

            result
        });

        // Whatever happened, leave no store un-persisted unless a preserve
        // walk completed cleanly and a revisit pass is coming.
        let keep_open = self.options.preserve_structs && walk_result.is_ok();
        if !keep_open {
            self.close_all(Some(visitor), &sink)?;
        }

        drop(sink);
        walk_result?;

        let mut errors: Vec<WalkError> = err_rx.try_iter().collect();
        let shutdown_errors = errors.iter().filter(|e| e.is_shutdown()).count();
        if shutdown_errors > 0 {
            debug!("filtered {shutdown_errors} shutdown signals from the error channel");
        }
        errors.retain(|e| !e.is_shutdown());

        let report = WalkReport {
            files_visited: self.files_visited.load(Ordering::Relaxed),
            dirs_counted: self.dirs_counted.load(Ordering::Relaxed),
            dirs_visited: self.dirs_visited.load(Ordering::Relaxed),
            errors,
            errors_dropped: dropped.load(Ordering::Relaxed),
            tree_changed: self.dirs_counted.load(Ordering::Relaxed)
                != self.dirs_visited.load(Ordering::Relaxed),
        };

        if report.errors_dropped > 0 {
            warn!("{} walk errors were dropped", report.errors_dropped);
        }
        if report.tree_changed {
            warn!(
                "directory count changed during walk ({} counted, {} visited); \
                 the filesystem is being modified underneath",
                report.dirs_counted, report.dirs_visited
            );
        }

        Ok(report)
    }

    fn walk_dir<'a>(
        &self,
        dir: &Path,
        visitor: &'a dyn Visitor,
        shutdown: &Shutdown,
        job_tx: &Sender<VisitJob<'a>>,
        sink: &ErrorSink,
    ) -> Result<(), WalkError> {
        if shutdown.is_shutdown() {
            return Err(WalkError::Shutdown);
        }
        if dir.join(crate::sidecar::SKIP_SENTINEL).symlink_metadata().is_ok() {
            debug!("skipping {} (skip sentinel present)", dir.display());
            return Ok(());
        }

        let active = self.enter_directory(dir, visitor, sink)?;
        self.dirs_visited.fetch_add(1, Ordering::Relaxed);

        let entries = match dir_list::list_directory(dir) {
            Ok(entries) => entries,
            Err(e) => {
                // A listing failure loses this subtree, not the walk.
                sink.send(e.into());
                return Ok(());
            }
        };

        let mut subdirs = Vec::new();
        for (name, entry) in &entries {
            if name.starts_with('.') {
                continue;
            }
            match entry {
                FsEntry::File { metadata } => {
                    let token = self.visit_tokens.acquire(shutdown)?;
                    let job = VisitJob {
                        store: Arc::clone(&active.store),
                        name: name.clone(),
                        metadata: metadata.clone(),
                        visitor,
                        shutdown: shutdown.clone(),
                        _token: token,
                        _gate: active.gate.enter(),
                    };
                    if job_tx.send(job).is_err() {
                        // Worker pool is gone; nothing more can be visited.
                        return Err(WalkError::Shutdown);
                    }
                    self.files_visited.fetch_add(1, Ordering::Relaxed);
                }
                FsEntry::Dir => subdirs.push(name.clone()),
                FsEntry::Other => {
                    debug!("skipping non-regular file {}", dir.join(name).display());
                }
            }
        }

        for name in subdirs {
            self.walk_dir(&dir.join(name), visitor, shutdown, job_tx, sink)?;
        }

        Ok(())
    }

    /// Open the store for `dir`, closing every active store that is not an
    /// ancestor-or-self of it.
    fn enter_directory(
        &self,
        dir: &Path,
        visitor: &dyn Visitor,
        sink: &ErrorSink,
    ) -> Result<ActiveEntry, WalkError> {
        if self.closed.lock().contains(dir) {
            return Err(WalkError::Reentered(dir.to_path_buf()));
        }

        if !self.options.preserve_structs {
            let unrelated: Vec<PathBuf> = {
                let active = self.active.lock();
                active
                    .keys()
                    .filter(|open| !dir.starts_with(open))
                    .cloned()
                    .collect()
            };
            for open in unrelated {
                self.close_dir(&open, Some(visitor), sink)?;
            }
        }

        let store = Arc::new(DirectoryStore::load(dir)?);
        let gate = Arc::new(Gate::default());
        self.active.lock().insert(
            dir.to_path_buf(),
            ActiveDir {
                store: Arc::clone(&store),
                gate: Arc::clone(&gate),
            },
        );
        *self.last_entered.lock() = Some(dir.to_path_buf());

        Ok(ActiveEntry { store, gate })
    }

    fn close_dir(
        &self,
        dir: &Path,
        visitor: Option<&dyn Visitor>,
        sink: &ErrorSink,
    ) -> Result<(), WalkError> {
        let Some(entry) = self.active.lock().remove(dir) else {
            return Ok(());
        };

        entry.gate.wait_drained();

        if let Some(visitor) = visitor
            && let Err(e) = visitor.directory_done(&entry.store)
        {
            sink.send(e);
        }

        entry.store.persist()?;
        self.dir_locks.purge(dir);
        self.closed.lock().insert(dir.to_path_buf());
        Ok(())
    }

    fn close_all(
        &self,
        visitor: Option<&dyn Visitor>,
        sink: &ErrorSink,
    ) -> Result<(), WalkError> {
        let dirs: Vec<PathBuf> = self.active.lock().keys().cloned().collect();
        let mut first_error = None;
        for dir in dirs {
            if let Err(e) = self.close_dir(&dir, visitor, sink)
                && first_error.is_none()
            {
                first_error = Some(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stores kept live by a preserve-mode walk, in path order.
    pub fn live_stores(&self) -> Vec<Arc<DirectoryStore>> {
        self.active
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.store))
            .collect()
    }

    /// Second pass of the inline two-pass algorithms: iterate every record
    /// of every live store without re-reading sidecars.
    pub fn revisit_all<F>(&self, mut f: F) -> Result<(), StoreError>
    where
        F: FnMut(&Arc<DirectoryStore>, &mut FileRecord) -> Result<VisitOutcome, StoreError>,
    {
        for store in self.live_stores() {
            store.revisit(|record| f(&store, record))?;
        }
        Ok(())
    }

    /// Persist and release every live store. Ends a preserve-mode walk.
    pub fn finish(&self) -> Result<(), WalkError> {
        let (tx, _rx) = bounded(1);
        let sink = ErrorSink {
            tx,
            dropped: Arc::new(AtomicUsize::new(0)),
        };
        self.close_all(None, &sink)
    }
}

struct ActiveEntry {
    store: Arc<DirectoryStore>,
    gate: Arc<Gate>,
}

/// Counting pre-pass: applies the same skip rules as the visit pass.
fn count_directories(dir: &Path, counted: &AtomicUsize, sink: &ErrorSink) {
    if dir.join(crate::sidecar::SKIP_SENTINEL).symlink_metadata().is_ok() {
        return;
    }

    counted.fetch_add(1, Ordering::Relaxed);

    let entries = match dir_list::list_directory(dir) {
        Ok(entries) => entries,
        Err(e) => {
            sink.send(e.into());
            return;
        }
    };

    for (name, entry) in &entries {
        if name.starts_with('.') {
            continue;
        }
        if matches!(entry, FsEntry::Dir) {
            count_directories(&dir.join(name), counted, sink);
        }
    }
}

/// Stock visitor keeping records in sync with the filesystem: stats files
/// into their stores and computes or validates fingerprints.
pub struct ChecksumVisitor {
    service: FingerprintService,
    /// Always recompute and compare, surfacing drift as Recalced.
    validate: bool,
    /// Drop records for files gone from disk when a directory closes.
    prune_missing: bool,
}

impl ChecksumVisitor {
    pub fn new(service: FingerprintService) -> Self {
        ChecksumVisitor {
            service,
            validate: false,
            prune_missing: true,
        }
    }

    pub fn validating(service: FingerprintService) -> Self {
        ChecksumVisitor {
            service,
            validate: true,
            prune_missing: true,
        }
    }
}

impl Visitor for ChecksumVisitor {
    fn visit_file(
        &self,
        store: &Arc<DirectoryStore>,
        name: &str,
        metadata: &std::fs::Metadata,
        shutdown: &Shutdown,
    ) -> Result<(), WalkError> {
        let (mut record, mut mutated) = match store.get(name) {
            Some(mut record) => {
                let refreshed = record.refresh_stat(metadata);
                (record, refreshed)
            }
            None => (
                FileRecord::from_stat(name, store.directory(), metadata),
                true,
            ),
        };

        if self.validate {
            let before = record.checksum.clone();
            match record::validate_checksum(&mut record, &self.service, shutdown) {
                Ok(()) => {
                    if mutated || record.checksum != before {
                        store.put(record)?;
                    }
                    Ok(())
                }
                Err(e @ ChecksumError::Recalced { .. }) => {
                    // Drift: the new value is already in the record. Store it
                    // and surface the non-fatal signal.
                    store.put(record)?;
                    Err(e.into())
                }
                Err(e) => Err(e.into()),
            }
        } else {
            mutated |= record::update_checksum(&mut record, &self.service, shutdown, false)?;
            if mutated {
                store.put(record)?;
            }
            Ok(())
        }
    }

    fn directory_done(&self, store: &DirectoryStore) -> Result<(), WalkError> {
        if self.prune_missing {
            store.delete_missing()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sidecar::{SIDECAR_NAME, SKIP_SENTINEL};
    use std::fs;
    use std::sync::atomic::AtomicUsize;
    use tempfile::TempDir;

    /// Counts visits; never mutates stores.
    struct CountingVisitor {
        files: AtomicUsize,
        dirs_done: AtomicUsize,
    }

    impl CountingVisitor {
        fn new() -> Self {
            CountingVisitor {
                files: AtomicUsize::new(0),
                dirs_done: AtomicUsize::new(0),
            }
        }
    }

    impl Visitor for CountingVisitor {
        fn visit_file(
            &self,
            _store: &Arc<DirectoryStore>,
            _name: &str,
            _metadata: &std::fs::Metadata,
            _shutdown: &Shutdown,
        ) -> Result<(), WalkError> {
            self.files.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn directory_done(&self, _store: &DirectoryStore) -> Result<(), WalkError> {
            self.dirs_done.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn build_tree(root: &Path) {
        fs::write(root.join("a.txt"), "a").unwrap();
        fs::write(root.join("b.txt"), "b").unwrap();
        fs::create_dir(root.join("sub")).unwrap();
        fs::write(root.join("sub/c.txt"), "c").unwrap();
        fs::create_dir(root.join("sub/deeper")).unwrap();
        fs::write(root.join("sub/deeper/d.txt"), "d").unwrap();
        fs::create_dir(root.join("other")).unwrap();
        fs::write(root.join("other/e.txt"), "e").unwrap();
    }

    #[test]
    fn test_walk_visits_every_file() {
        let temp = TempDir::new().unwrap();
        build_tree(temp.path());

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = CountingVisitor::new();
        let report = tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        assert_eq!(visitor.files.load(Ordering::SeqCst), 5);
        assert_eq!(report.files_visited, 5);
        assert_eq!(report.dirs_visited, 4);
        assert!(!report.tree_changed);
        assert!(report.errors.is_empty());
    }

    #[test]
    fn test_count_pass_agrees_with_visit_pass() {
        let temp = TempDir::new().unwrap();
        build_tree(temp.path());

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = CountingVisitor::new();
        let report = tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        assert_eq!(report.dirs_counted, report.dirs_visited);
        assert_eq!(tracker.total(), tracker.value());
    }

    #[test]
    fn test_hidden_directories_skipped() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("visible.txt"), "x").unwrap();
        fs::create_dir(temp.path().join(".hidden")).unwrap();
        fs::write(temp.path().join(".hidden/secret.txt"), "x").unwrap();
        fs::create_dir(temp.path().join(".hidden/nested")).unwrap();
        fs::write(temp.path().join(".hidden/nested/deep.txt"), "x").unwrap();

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = CountingVisitor::new();
        tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        assert_eq!(visitor.files.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_hidden_files_skipped() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("visible.txt"), "x").unwrap();
        fs::write(temp.path().join(".hidden.txt"), "x").unwrap();

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = CountingVisitor::new();
        tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        assert_eq!(visitor.files.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_skip_sentinel_excludes_subtree() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("kept.txt"), "x").unwrap();
        fs::create_dir(temp.path().join("skipped")).unwrap();
        fs::write(temp.path().join("skipped").join(SKIP_SENTINEL), "").unwrap();
        fs::write(temp.path().join("skipped/a.txt"), "x").unwrap();
        fs::create_dir(temp.path().join("skipped/nested")).unwrap();
        fs::write(temp.path().join("skipped/nested/b.txt"), "x").unwrap();

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = CountingVisitor::new();
        let report = tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        assert_eq!(visitor.files.load(Ordering::SeqCst), 1);
        // The count pass applies the same rule, so the passes agree.
        assert!(!report.tree_changed);
    }

    #[test]
    fn test_directory_done_runs_per_directory() {
        let temp = TempDir::new().unwrap();
        build_tree(temp.path());

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = CountingVisitor::new();
        tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        assert_eq!(visitor.dirs_done.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_checksum_visitor_populates_sidecars() {
        let temp = TempDir::new().unwrap();
        build_tree(temp.path());

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = ChecksumVisitor::new(FingerprintService::default());
        tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        assert!(temp.path().join(SIDECAR_NAME).exists());
        assert!(temp.path().join("sub").join(SIDECAR_NAME).exists());

        let store = DirectoryStore::load(temp.path()).unwrap();
        let record = store.get("a.txt").unwrap();
        assert_eq!(record.checksum.len(), crate::fingerprint::CHECKSUM_LEN);
    }

    #[test]
    fn test_checksum_visitor_skips_unchanged_files() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "content").unwrap();

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = ChecksumVisitor::new(FingerprintService::default());
        tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        let sidecar_mtime = fs::metadata(temp.path().join(SIDECAR_NAME))
            .unwrap()
            .modified()
            .unwrap();

        // A second walk over an unchanged tree must not rewrite the sidecar.
        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = ChecksumVisitor::new(FingerprintService::default());
        tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        let sidecar_mtime_after = fs::metadata(temp.path().join(SIDECAR_NAME))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(sidecar_mtime, sidecar_mtime_after);
    }

    #[test]
    fn test_checksum_visitor_detects_content_change() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "original").unwrap();

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = ChecksumVisitor::new(FingerprintService::default());
        tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();
        let before = DirectoryStore::load(temp.path())
            .unwrap()
            .get("a.txt")
            .unwrap();

        fs::write(temp.path().join("a.txt"), "rewritten").unwrap();
        filetime::set_file_mtime(
            temp.path().join("a.txt"),
            filetime::FileTime::from_unix_time(before.mtime + 5, 0),
        )
        .unwrap();

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = ChecksumVisitor::new(FingerprintService::default());
        tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        let after = DirectoryStore::load(temp.path())
            .unwrap()
            .get("a.txt")
            .unwrap();
        assert_ne!(before.checksum, after.checksum);
    }

    #[test]
    fn test_validating_visitor_reports_drift() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "original").unwrap();

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = ChecksumVisitor::new(FingerprintService::default());
        tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        // Rewrite the content but keep size and mtime, simulating silent
        // corruption that metadata comparison cannot see.
        let meta = fs::metadata(temp.path().join("a.txt")).unwrap();
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        fs::write(temp.path().join("a.txt"), "0riginal").unwrap();
        filetime::set_file_mtime(temp.path().join("a.txt"), mtime).unwrap();

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = ChecksumVisitor::validating(FingerprintService::default());
        let report = tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        assert_eq!(report.errors.len(), 1);
        assert!(matches!(
            report.errors[0],
            WalkError::Checksum(ChecksumError::Recalced { .. })
        ));
    }

    #[test]
    fn test_checksum_visitor_prunes_missing_records() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("kept.txt"), "x").unwrap();
        fs::write(temp.path().join("gone.txt"), "x").unwrap();

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = ChecksumVisitor::new(FingerprintService::default());
        tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        fs::remove_file(temp.path().join("gone.txt")).unwrap();

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = ChecksumVisitor::new(FingerprintService::default());
        tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        let store = DirectoryStore::load(temp.path()).unwrap();
        assert!(store.get("kept.txt").is_some());
        assert!(store.get("gone.txt").is_none());
    }

    #[test]
    fn test_preserve_mode_keeps_stores_live() {
        let temp = TempDir::new().unwrap();
        build_tree(temp.path());

        let tracker = DirectoryTracker::new(WalkOptions {
            preserve_structs: true,
            ..WalkOptions::default()
        });
        let visitor = ChecksumVisitor::new(FingerprintService::default());
        tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        assert_eq!(tracker.live_stores().len(), 4);

        let mut records = 0;
        tracker
            .revisit_all(|_store, _record| {
                records += 1;
                Ok(VisitOutcome::Ignore)
            })
            .unwrap();
        assert_eq!(records, 5);

        tracker.finish().unwrap();
        assert!(tracker.live_stores().is_empty());
        assert!(temp.path().join(SIDECAR_NAME).exists());
    }

    #[test]
    fn test_shutdown_aborts_walk_but_persists() {
        let temp = TempDir::new().unwrap();
        build_tree(temp.path());

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = ChecksumVisitor::new(FingerprintService::default());

        let (handle, signal) = crate::shutdown::shutdown_pair();
        handle.request();

        let result = tracker.walk(temp.path(), &visitor, &signal);
        assert!(matches!(result, Err(WalkError::Shutdown)));
    }

    #[test]
    fn test_walk_empty_directory() {
        let temp = TempDir::new().unwrap();

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let visitor = CountingVisitor::new();
        let report = tracker
            .walk(temp.path(), &visitor, &Shutdown::never())
            .unwrap();

        assert_eq!(report.files_visited, 0);
        assert_eq!(report.dirs_visited, 1);
    }

    #[test]
    fn test_visit_errors_reach_the_report() {
        struct FailingVisitor;
        impl Visitor for FailingVisitor {
            fn visit_file(
                &self,
                _store: &Arc<DirectoryStore>,
                name: &str,
                _metadata: &std::fs::Metadata,
                _shutdown: &Shutdown,
            ) -> Result<(), WalkError> {
                Err(WalkError::Io(std::io::Error::other(format!(
                    "visit failed for {name}"
                ))))
            }
        }

        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "x").unwrap();
        fs::write(temp.path().join("b.txt"), "x").unwrap();

        let tracker = DirectoryTracker::new(WalkOptions::default());
        let report = tracker
            .walk(temp.path(), &FailingVisitor, &Shutdown::never())
            .unwrap();

        assert_eq!(report.errors.len() + report.errors_dropped, 2);
    }

    #[test]
    fn test_error_channel_drops_instead_of_blocking() {
        struct FailingVisitor;
        impl Visitor for FailingVisitor {
            fn visit_file(
                &self,
                _store: &Arc<DirectoryStore>,
                _name: &str,
                _metadata: &std::fs::Metadata,
                _shutdown: &Shutdown,
            ) -> Result<(), WalkError> {
                Err(WalkError::Io(std::io::Error::other("boom")))
            }
        }

        let temp = TempDir::new().unwrap();
        for i in 0..50 {
            fs::write(temp.path().join(format!("f{i:02}.txt")), "x").unwrap();
        }

        let tracker = DirectoryTracker::new(WalkOptions {
            error_capacity: 4,
            ..WalkOptions::default()
        });
        // Completes rather than deadlocking on the full error channel.
        let report = tracker
            .walk(temp.path(), &FailingVisitor, &Shutdown::never())
            .unwrap();

        assert_eq!(report.errors.len() + report.errors_dropped, 50);
        assert!(report.errors_dropped > 0);
    }
}
