//! Free-form tag maintenance on file records.
//!
//! Tags are opaque strings carried in the sidecar; nothing in the engine
//! interprets them. Tagging a file that has no record yet creates one from a
//! stat, leaving the checksum for the next check run.

use crate::record::FileRecord;
use crate::store::{DirectoryStore, StoreError};
use std::path::Path;

#[derive(Debug, thiserror::Error)]
pub enum TagError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
    #[error("no such file: {0}")]
    NoSuchFile(String),
    #[error("empty tag")]
    EmptyTag,
}

#[derive(Debug, Default)]
pub struct TagUpdate {
    pub add: Vec<String>,
    pub remove: Vec<String>,
}

impl TagUpdate {
    fn validate(&self) -> Result<(), TagError> {
        if self.add.iter().chain(self.remove.iter()).any(|tag| tag.is_empty()) {
            return Err(TagError::EmptyTag);
        }
        Ok(())
    }
}

/// Apply a tag update to the named files of one directory. Files that exist
/// on disk but have no record yet get one; names that exist neither in the
/// store nor on disk are an error.
pub fn apply_tags(
    dir: &Path,
    files: &[String],
    update: &TagUpdate,
) -> Result<usize, TagError> {
    update.validate()?;

    let store = DirectoryStore::load(dir)?;
    let mut touched = 0;

    for name in files {
        if store.get(name).is_none() {
            let path = dir.join(name);
            let meta = path
                .metadata()
                .map_err(|_| TagError::NoSuchFile(name.clone()))?;
            if !meta.is_file() {
                return Err(TagError::NoSuchFile(name.clone()));
            }
            store.put(FileRecord::from_stat(name, dir, &meta))?;
        }

        store.update_record(name, |record| {
            for tag in &update.add {
                record.tags.insert(tag.clone());
            }
            for tag in &update.remove {
                record.tags.remove(tag);
            }
        });
        touched += 1;
    }

    store.persist()?;
    Ok(touched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn update(add: &[&str], remove: &[&str]) -> TagUpdate {
        TagUpdate {
            add: add.iter().map(|s| s.to_string()).collect(),
            remove: remove.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_tagging_creates_record_for_untracked_file() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("clip.mp4"), "content").unwrap();

        let touched = apply_tags(
            temp.path(),
            &["clip.mp4".to_string()],
            &update(&["holiday"], &[]),
        )
        .unwrap();

        assert_eq!(touched, 1);
        let store = DirectoryStore::load(temp.path()).unwrap();
        let record = store.get("clip.mp4").unwrap();
        assert!(record.tags.contains("holiday"));
        assert!(record.checksum.is_empty());
    }

    #[test]
    fn test_tags_survive_round_trip() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("clip.mp4"), "content").unwrap();

        apply_tags(
            temp.path(),
            &["clip.mp4".to_string()],
            &update(&["a", "b"], &[]),
        )
        .unwrap();
        apply_tags(
            temp.path(),
            &["clip.mp4".to_string()],
            &update(&["c"], &["a"]),
        )
        .unwrap();

        let store = DirectoryStore::load(temp.path()).unwrap();
        let record = store.get("clip.mp4").unwrap();
        assert!(!record.tags.contains("a"));
        assert!(record.tags.contains("b"));
        assert!(record.tags.contains("c"));
    }

    #[test]
    fn test_tagging_missing_file_fails() {
        let temp = TempDir::new().unwrap();

        let result = apply_tags(
            temp.path(),
            &["ghost.mp4".to_string()],
            &update(&["x"], &[]),
        );

        assert!(matches!(result, Err(TagError::NoSuchFile(_))));
    }

    #[test]
    fn test_empty_tag_rejected() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("clip.mp4"), "content").unwrap();

        let result = apply_tags(
            temp.path(),
            &["clip.mp4".to_string()],
            &update(&[""], &[]),
        );

        assert!(matches!(result, Err(TagError::EmptyTag)));
    }

    #[test]
    fn test_removing_absent_tag_is_harmless() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("clip.mp4"), "content").unwrap();

        apply_tags(
            temp.path(),
            &["clip.mp4".to_string()],
            &update(&[], &["never-there"]),
        )
        .unwrap();

        let store = DirectoryStore::load(temp.path()).unwrap();
        assert!(store.get("clip.mp4").unwrap().tags.is_empty());
    }
}
