//! Destination-volume identity.
//!
//! Every backup destination volume carries a `.mdbackup.xml` at its root
//! holding a stable random label. Source records name volumes by label, so
//! the label must survive remounts and path changes; looking it up walks
//! upward from any path on the volume. Labels are minted on first use and
//! uniqueness-tested against the global config's append-only history.

use crate::config::GlobalConfig;
use crate::sidecar::{self, VOLUME_SIDECAR_NAME};
use quick_xml::{DeError, SeError};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::info;

/// Length of a volume label.
pub const VOLUME_LABEL_LEN: usize = 8;

const LABEL_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";

#[derive(Debug, thiserror::Error)]
pub enum VolumeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("volume sidecar parse error in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: DeError,
    },
    #[error("volume sidecar serialize error: {0}")]
    Serialize(#[from] SeError),
    #[error("bad volume label {label:?} in {path}")]
    BadLabel { path: PathBuf, label: String },
    #[error("no volume label found at or above {0}")]
    NoLabel(PathBuf),
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename = "vol")]
struct VolumeDoc {
    label: String,
}

/// True for an 8-character `[A-Za-z]` label.
pub fn is_valid_label(label: &str) -> bool {
    label.len() == VOLUME_LABEL_LEN && label.bytes().all(|b| b.is_ascii_alphabetic())
}

/// Mint a label not present in the config's history.
pub fn mint_label(config: &GlobalConfig) -> String {
    let mut rng = rand::rng();
    loop {
        let label: String = (0..VOLUME_LABEL_LEN)
            .map(|_| LABEL_ALPHABET[rng.random_range(0..LABEL_ALPHABET.len())] as char)
            .collect();
        if !config.has_label(&label) {
            return label;
        }
    }
}

/// Read the label stored at exactly `dir`, if a volume sidecar is present.
pub fn read_label(dir: &Path) -> Result<Option<String>, VolumeError> {
    let path = dir.join(VOLUME_SIDECAR_NAME);
    let content = match std::fs::read_to_string(&path) {
        Ok(content) => content,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(VolumeError::Io(e)),
    };

    let doc: VolumeDoc =
        quick_xml::de::from_str(&content).map_err(|source| VolumeError::Parse {
            path: path.clone(),
            source,
        })?;

    if !is_valid_label(&doc.label) {
        return Err(VolumeError::BadLabel {
            path,
            label: doc.label,
        });
    }

    Ok(Some(doc.label))
}

/// Walk upward from `path` looking for a volume sidecar. Returns the volume
/// root and its label.
pub fn find_volume(path: &Path) -> Result<Option<(PathBuf, String)>, VolumeError> {
    let start = path.canonicalize()?;
    let mut dir: &Path = &start;
    loop {
        if let Some(label) = read_label(dir)? {
            return Ok(Some((dir.to_path_buf(), label)));
        }
        match dir.parent() {
            Some(parent) => dir = parent,
            None => return Ok(None),
        }
    }
}

/// The label for `path`'s volume, erroring when none exists. Used by
/// operations that must not mint, such as discovery.
pub fn require_label(path: &Path) -> Result<String, VolumeError> {
    match find_volume(path)? {
        Some((_, label)) => Ok(label),
        None => Err(VolumeError::NoLabel(path.to_path_buf())),
    }
}

/// The label for the destination rooted at `dest`: discovered by upward
/// walk, or minted, written to `dest`, and registered in the config.
pub fn ensure_label(dest: &Path, config: &mut GlobalConfig) -> Result<String, VolumeError> {
    if let Some((root, label)) = find_volume(dest)? {
        // Known volumes may predate this config; keep the history complete.
        config.register_label(&label);
        if root != dest.canonicalize()? {
            info!(
                "destination {} is on volume {} rooted at {}",
                dest.display(),
                label,
                root.display()
            );
        }
        return Ok(label);
    }

    let label = mint_label(config);
    write_label(dest, &label)?;
    config.register_label(&label);
    info!("minted volume label {} for {}", label, dest.display());
    Ok(label)
}

/// Write the volume sidecar at exactly `dir`.
pub fn write_label(dir: &Path, label: &str) -> Result<(), VolumeError> {
    let doc = VolumeDoc {
        label: label.to_string(),
    };
    let body = quick_xml::se::to_string(&doc)?;
    sidecar::write_atomic(&dir.join(VOLUME_SIDECAR_NAME), body.as_bytes())?;
    Ok(())
}
