//! Per-directory mutexes serializing sidecar read-modify-write cycles.
//!
//! Two concurrent copy completions targeting the same destination directory
//! must not each load, modify, and save the sidecar: the second save would
//! silently drop the first update. Every sidecar read-modify-write therefore
//! acquires the mutex for that directory first. The map is pruned as
//! directories fall out of use so a long backup over many directories does
//! not grow it without bound.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A map from directory path to its serialization mutex.
#[derive(Default)]
pub struct DirLocks {
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl DirLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mutex for `dir`, created on first use. Callers lock the returned
    /// handle around the whole load/modify/persist cycle.
    pub fn for_dir(&self, dir: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock();
        Arc::clone(
            locks
                .entry(dir.to_path_buf())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drop the entry for `dir` if nobody holds its mutex. Called when the
    /// directory's store closes.
    pub fn purge(&self, dir: &Path) {
        let mut locks = self.locks.lock();
        if let Some(lock) = locks.get(dir)
            && Arc::strong_count(lock) == 1
        {
            locks.remove(dir);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().len()
    }
}
