//! Replication of source trees onto labeled destination volumes.
//!
//! A backup runs in phases: resolve the destination's volume label, index
//! the destination (what content its sidecars claim, what paths its disk
//! actually holds), plan the sources (tag records whose content is already
//! present, enqueue copy jobs for the rest), execute the copies on a bounded
//! worker pool, and finally hand every unexplained destination path to the
//! orphan handler.
//!
//! Copy completions update sidecars from multiple worker threads. Every such
//! read-modify-write takes the per-directory mutex first and re-reads the
//! sidecar fresh inside the critical section; without that, two copies into
//! one directory interleave load/save and the second save silently drops the
//! first record.

use crate::config::GlobalConfig;
use crate::dirlock::DirLocks;
use crate::fingerprint::FingerprintService;
use crate::record::{BackupKey, FileRecord};
use crate::shutdown::Shutdown;
use crate::store::{DirectoryStore, StoreError, VisitOutcome};
use crate::volume::{self, VolumeError};
use crate::walker::{
    ChecksumVisitor, DirectoryTracker, Visitor, WalkError, WalkOptions,
};
use crossbeam_channel::bounded;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use tracing::{debug, info, warn};

/// Default degree of copy parallelism.
pub const DEFAULT_COPY_WORKERS: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    #[error("Walk error: {0}")]
    Walk(#[from] WalkError),
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("Volume error: {0}")]
    Volume(#[from] VolumeError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("backup incomplete: {completed} of {planned} copies executed")]
    Incomplete { completed: usize, planned: usize },
    #[error("shutdown requested")]
    Shutdown,
}

impl BackupError {
    pub fn is_shutdown(&self) -> bool {
        match self {
            BackupError::Shutdown => true,
            BackupError::Walk(e) => e.is_shutdown(),
            _ => false,
        }
    }
}

/// Copies one file; overwrites the destination if it exists.
pub type CopyFn = dyn Fn(&Path, &Path) -> std::io::Result<()> + Send + Sync;

/// Handles one orphaned destination path. Returns whether the path was
/// removed from disk, so the engine can drop its sidecar record too.
pub type OrphanFn = dyn Fn(&Path) -> std::io::Result<bool> + Send + Sync;

/// Hard-link the source into place; stream a copy when linking is not
/// possible (cross-device, existing destination, unsupported filesystem).
pub fn default_copy(src: &Path, dest: &Path) -> std::io::Result<()> {
    match std::fs::hard_link(src, dest) {
        Ok(()) => Ok(()),
        Err(_) => {
            std::fs::copy(src, dest)?;
            Ok(())
        }
    }
}

/// Orphan handler that only reports.
pub fn report_orphan(path: &Path) -> std::io::Result<bool> {
    info!("orphan on destination: {}", path.display());
    Ok(false)
}

/// Orphan handler that deletes.
pub fn delete_orphan(path: &Path) -> std::io::Result<bool> {
    info!("deleting orphan: {}", path.display());
    std::fs::remove_file(path)?;
    Ok(true)
}

#[derive(Clone)]
pub struct BackupOptions {
    pub copy_workers: usize,
    pub walk: WalkOptions,
}

impl Default for BackupOptions {
    fn default() -> Self {
        BackupOptions {
            copy_workers: DEFAULT_COPY_WORKERS,
            walk: WalkOptions::default(),
        }
    }
}

#[derive(Debug)]
pub struct BackupSummary {
    pub label: String,
    /// Files physically copied to the destination.
    pub copied: usize,
    /// Source records tagged because their content was already present.
    pub already_present: usize,
    /// Destination paths handed to the orphan handler.
    pub orphans: usize,
}

/// One planned replication. Identical-content records found while planning
/// attach themselves as beneficiaries instead of copying again; all of them
/// receive the destination label once the single copy lands.
struct CopyJob {
    key: BackupKey,
    name: String,
    src_path: PathBuf,
    dest_path: PathBuf,
    beneficiaries: Vec<(PathBuf, String)>,
}

struct PlanState {
    /// BackupKey -> destination paths claimed by destination sidecars.
    present: HashMap<BackupKey, BTreeSet<PathBuf>>,
    /// Destination paths explained by some source record.
    expected: HashSet<PathBuf>,
    /// Destination relative targets claimed by an earlier source.
    claimed: HashMap<PathBuf, BackupKey>,
    planned_keys: HashMap<BackupKey, usize>,
    jobs: Vec<CopyJob>,
    already_present: usize,
}

pub struct BackupEngine {
    service: FingerprintService,
    copy: Box<CopyFn>,
    orphan: Box<OrphanFn>,
    options: BackupOptions,
}

impl BackupEngine {
    pub fn new(service: FingerprintService) -> Self {
        BackupEngine {
            service,
            copy: Box::new(default_copy),
            orphan: Box::new(report_orphan),
            options: BackupOptions::default(),
        }
    }

    pub fn with_copy(mut self, copy: Box<CopyFn>) -> Self {
        self.copy = copy;
        self
    }

    pub fn with_orphan_handler(mut self, orphan: Box<OrphanFn>) -> Self {
        self.orphan = orphan;
        self
    }

    pub fn with_options(mut self, options: BackupOptions) -> Self {
        self.options = options;
        self
    }

    /// Replicate `sources` (in argument order) onto `dest`. The orphan pass
    /// runs once at the end over the union of expectations, so a file
    /// present on any source is never orphaned.
    pub fn run(
        &self,
        sources: &[PathBuf],
        dest: &Path,
        config: &mut GlobalConfig,
        shutdown: &Shutdown,
    ) -> Result<BackupSummary, BackupError> {
        let label = volume::ensure_label(dest, config)?;
        let dest_root = dest.canonicalize()?;

        let (present, disk) =
            index_destination(&dest_root, &self.options.walk, shutdown)?;
        debug!(
            "destination index: {} content keys, {} files on disk",
            present.len(),
            disk.len()
        );

        let state = Mutex::new(PlanState {
            present,
            expected: HashSet::new(),
            claimed: HashMap::new(),
            planned_keys: HashMap::new(),
            jobs: Vec::new(),
            already_present: 0,
        });

        for source in sources {
            if shutdown.is_shutdown() {
                return Err(BackupError::Shutdown);
            }
            let source_root = source.canonicalize()?;
            let tracker = DirectoryTracker::new(self.options.walk.clone());
            let visitor = PlanVisitor {
                inner: ChecksumVisitor::new(self.service.clone()),
                source_root: source_root.clone(),
                dest_root: dest_root.clone(),
                label: label.clone(),
                state: &state,
            };
            let report = tracker.walk(&source_root, &visitor, shutdown)?;
            if !report.errors.is_empty() {
                warn!(
                    "{} errors while planning {}",
                    report.errors.len(),
                    source_root.display()
                );
            }
        }

        let state = state.into_inner();
        let planned = state.jobs.len();
        info!(
            "backup plan: {} copies, {} already present",
            planned, state.already_present
        );

        let locks = DirLocks::new();
        let completed = self.execute_jobs(state.jobs, &label, &locks, shutdown)?;

        let orphans = self.handle_orphans(&disk, &state.expected, &locks, shutdown)?;

        Ok(BackupSummary {
            label,
            copied: completed,
            already_present: state.already_present,
            orphans,
        })
    }

    /// Execute up to `copy_workers` jobs in parallel. The first failure
    /// aborts the remaining plan.
    fn execute_jobs(
        &self,
        jobs: Vec<CopyJob>,
        label: &str,
        locks: &DirLocks,
        shutdown: &Shutdown,
    ) -> Result<usize, BackupError> {
        let planned = jobs.len();
        if planned == 0 {
            return Ok(0);
        }

        let completed = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let (job_tx, job_rx) = bounded::<CopyJob>(self.options.copy_workers);

        let first_error: Mutex<Option<BackupError>> = Mutex::new(None);

        thread::scope(|scope| {
            let workers: Vec<_> = (0..self.options.copy_workers)
                .map(|_| {
                    let job_rx = job_rx.clone();
                    let completed = &completed;
                    let failed = &failed;
                    let first_error = &first_error;
                    scope.spawn(move || {
                        for job in job_rx.iter() {
                            if failed.load(Ordering::SeqCst) {
                                return;
                            }
                            match self.run_job(&job, label, locks) {
                                Ok(()) => {
                                    completed.fetch_add(1, Ordering::SeqCst);
                                }
                                Err(e) => {
                                    failed.store(true, Ordering::SeqCst);
                                    first_error.lock().get_or_insert(e);
                                    return;
                                }
                            }
                            // Finish the current file, then stop.
                            if shutdown.is_shutdown() {
                                return;
                            }
                        }
                    })
                })
                .collect();
            drop(job_rx);

            for job in jobs {
                if failed.load(Ordering::SeqCst) || shutdown.is_shutdown() {
                    break;
                }
                if job_tx.send(job).is_err() {
                    break;
                }
            }
            drop(job_tx);

            for worker in workers {
                let _ = worker.join();
            }
        });

        if let Some(e) = first_error.into_inner() {
            warn!("copy failed: {e}");
            if e.is_shutdown() {
                return Err(BackupError::Shutdown);
            }
            return Err(BackupError::Incomplete {
                completed: completed.load(Ordering::SeqCst),
                planned,
            });
        }

        let completed = completed.load(Ordering::SeqCst);
        if completed < planned {
            if shutdown.is_shutdown() {
                return Err(BackupError::Shutdown);
            }
            return Err(BackupError::Incomplete { completed, planned });
        }

        Ok(completed)
    }

    /// One copy, then the two sidecar updates, each under its directory's
    /// mutex with a fresh read inside the critical section.
    fn run_job(
        &self,
        job: &CopyJob,
        label: &str,
        locks: &DirLocks,
    ) -> Result<(), BackupError> {
        let dest_dir = job
            .dest_path
            .parent()
            .unwrap_or(Path::new("."))
            .to_path_buf();
        std::fs::create_dir_all(&dest_dir)?;

        (self.copy)(&job.src_path, &job.dest_path)?;
        debug!(
            "copied {} -> {}",
            job.src_path.display(),
            job.dest_path.display()
        );

        {
            let lock = locks.for_dir(&dest_dir);
            let _guard = lock.lock();
            let store = DirectoryStore::load(&dest_dir)?;
            let meta = std::fs::metadata(&job.dest_path)?;
            let mut record = FileRecord::from_stat(&job.name, &dest_dir, &meta);
            record.checksum = job.key.checksum.clone();
            store.put(record)?;
            store.persist()?;
        }

        for (src_dir, name) in &job.beneficiaries {
            let lock = locks.for_dir(src_dir);
            let _guard = lock.lock();
            let store = DirectoryStore::load(src_dir)?;
            if store.update_record(name, |record| {
                record.add_backup_dest(label);
            }) {
                store.persist()?;
            } else {
                warn!(
                    "source record {} vanished from {} before label write-back",
                    name,
                    src_dir.display()
                );
            }
        }

        Ok(())
    }

    /// Hand every unexplained destination path to the orphan handler, once
    /// each. Handler failures are logged; the pass continues.
    fn handle_orphans(
        &self,
        disk: &HashSet<PathBuf>,
        expected: &HashSet<PathBuf>,
        locks: &DirLocks,
        shutdown: &Shutdown,
    ) -> Result<usize, BackupError> {
        let mut orphans: Vec<&PathBuf> = disk.difference(expected).collect();
        orphans.sort();

        let mut handled = 0;
        for path in orphans {
            if shutdown.is_shutdown() {
                return Err(BackupError::Shutdown);
            }
            handled += 1;
            match (self.orphan)(path) {
                Ok(true) => self.forget_record(path, locks)?,
                Ok(false) => {}
                Err(e) => warn!("orphan handler failed for {}: {e}", path.display()),
            }
        }
        Ok(handled)
    }

    /// Drop the sidecar record for a deleted orphan, leaving the disk alone.
    fn forget_record(&self, path: &Path, locks: &DirLocks) -> Result<(), BackupError> {
        let Some(dir) = path.parent() else {
            return Ok(());
        };
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return Ok(());
        };

        let lock = locks.for_dir(dir);
        let _guard = lock.lock();
        let store = DirectoryStore::load(dir)?;
        store.range_mutate(|record| {
            if record.name == name {
                Ok(VisitOutcome::Delete)
            } else {
                Ok(VisitOutcome::Ignore)
            }
        })?;
        store.persist()?;
        Ok(())
    }
}

/// Walk a labeled tree, building the content index from its sidecars and
/// the set of file paths actually on disk. Sidecar claims for paths that no
/// longer exist on disk are excluded from the index.
pub(crate) fn index_destination(
    root: &Path,
    walk: &WalkOptions,
    shutdown: &Shutdown,
) -> Result<(HashMap<BackupKey, BTreeSet<PathBuf>>, HashSet<PathBuf>), BackupError> {
    let tracker = DirectoryTracker::new(WalkOptions {
        preserve_structs: true,
        ..walk.clone()
    });
    let visitor = DiskSetVisitor {
        disk: Mutex::new(HashSet::new()),
    };
    tracker.walk(root, &visitor, shutdown)?;

    let disk = visitor.disk.into_inner();
    let mut present: HashMap<BackupKey, BTreeSet<PathBuf>> = HashMap::new();
    tracker.revisit_all(|store, record| {
        if let Some(key) = record.backup_key() {
            let path = store.directory().join(&record.name);
            if disk.contains(&path) {
                present.entry(key).or_default().insert(path);
            }
        }
        Ok(VisitOutcome::Ignore)
    })?;
    tracker.finish()?;

    Ok((present, disk))
}

/// Collects the paths reachable on disk; never touches the stores.
struct DiskSetVisitor {
    disk: Mutex<HashSet<PathBuf>>,
}

impl Visitor for DiskSetVisitor {
    fn visit_file(
        &self,
        store: &Arc<DirectoryStore>,
        name: &str,
        _metadata: &std::fs::Metadata,
        _shutdown: &Shutdown,
    ) -> Result<(), WalkError> {
        self.disk.lock().insert(store.directory().join(name));
        Ok(())
    }
}

/// Source-side planning visitor: keeps records fingerprinted (via the stock
/// checksum visitor), then decides per record whether the destination
/// already holds the content, an in-flight job covers it, or a new copy job
/// is needed.
struct PlanVisitor<'a> {
    inner: ChecksumVisitor,
    source_root: PathBuf,
    dest_root: PathBuf,
    label: String,
    state: &'a Mutex<PlanState>,
}

impl Visitor for PlanVisitor<'_> {
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

        let mut state = self.state.lock();

        // Everything the destination holds for this content is explained by
        // this record, whether or not the record is tagged yet.
        let present_paths: Vec<PathBuf> = state
            .present
            .get(&key)
            .map(|paths| paths.iter().cloned().collect())
            .unwrap_or_default();
        for path in present_paths {
            state.expected.insert(path);
        }

        if record.has_backup_dest(&self.label) {
            return Ok(());
        }

        if state.present.contains_key(&key) {
            let label = self.label.clone();
            store.update_record(name, |record| {
                record.add_backup_dest(&label);
            });
            state.already_present += 1;
            return Ok(());
        }

        if let Some(&idx) = state.planned_keys.get(&key) {
            state.jobs[idx]
                .beneficiaries
                .push((store.directory().to_path_buf(), name.to_string()));
            return Ok(());
        }

        let rel_dir = store
            .directory()
            .strip_prefix(&self.source_root)
            .unwrap_or(Path::new(""));
        let dest_path = self.dest_root.join(rel_dir).join(name);

        if let Some(existing) = state.claimed.get(&dest_path) {
            // An earlier source claimed this relative path with different
            // content; first source wins, silently.
            if *existing != key {
                debug!(
                    "skipping {} for {}: target claimed by an earlier source",
                    store.directory().join(name).display(),
                    dest_path.display()
                );
            }
            return Ok(());
        }

        state.claimed.insert(dest_path.clone(), key.clone());
        state.expected.insert(dest_path.clone());
        let idx = state.jobs.len();
        state.planned_keys.insert(key.clone(), idx);
        state.jobs.push(CopyJob {
            key,
            name: name.to_string(),
            src_path: store.directory().join(name),
            dest_path,
            beneficiaries: vec![(store.directory().to_path_buf(), name.to_string())],
        });

        Ok(())
    }

    fn directory_done(&self, store: &DirectoryStore) -> Result<(), WalkError> {
        self.inner.directory_done(store)
    }
}
