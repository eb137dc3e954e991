//! Process-wide registry: known volume labels, source aliases, restore
//! destinations, and autofix rename rules.
//!
//! The registry lives in a single `xc` XML document under the user's home
//! directory unless an explicit path is supplied. Volume-label history is
//! append-only: a label, once registered, is never removed, so freshly
//! minted labels can be uniqueness-tested against the full history of the
//! config.

use quick_xml::{DeError, SeError};
use serde::{Deserialize, Serialize};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Config filename under the home directory.
pub const CONFIG_FILENAME: &str = ".medorg_config.xml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] DeError),
    #[error("config serialize error: {0}")]
    Serialize(#[from] SeError),
    #[error("no config path: neither an explicit path nor a home directory is available")]
    NoHome,
    #[error("source alias already registered: {0:?}")]
    DuplicateAlias(String),
}

/// A source directory registered under a short alias.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAlias {
    #[serde(rename = "@path")]
    pub path: String,
    #[serde(rename = "@alias")]
    pub alias: String,
}

/// Where an alias restores to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreDest {
    #[serde(rename = "@alias")]
    pub alias: String,
    #[serde(rename = "@path")]
    pub path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename = "xc", default)]
pub struct GlobalConfig {
    /// Append-only history of every volume label ever minted.
    #[serde(rename = "vl", default)]
    pub volume_labels: Vec<String>,
    #[serde(rename = "src", default)]
    pub sources: Vec<SourceAlias>,
    #[serde(rename = "restore", default)]
    pub restores: Vec<RestoreDest>,
    /// Autofix regex rules, applied in order.
    #[serde(rename = "af", default)]
    pub autofix_rules: Vec<String>,

    #[serde(skip)]
    path: Option<PathBuf>,
    #[serde(skip)]
    existed: bool,
}

impl GlobalConfig {
    /// Resolve the config path: (1) the caller-supplied path, (2) the
    /// environment-provided home, (3) nothing.
    pub fn resolve_path(explicit: Option<&Path>) -> Result<PathBuf, ConfigError> {
        if let Some(path) = explicit {
            return Ok(path.to_path_buf());
        }
        match std::env::var_os("HOME") {
            Some(home) if !home.is_empty() => Ok(PathBuf::from(home).join(CONFIG_FILENAME)),
            _ => Err(ConfigError::NoHome),
        }
    }

    /// Load the config, resolving the path per [`resolve_path`]. A missing
    /// file yields a fresh empty config anchored to that path.
    ///
    /// [`resolve_path`]: Self::resolve_path
    pub fn load(explicit: Option<&Path>) -> Result<Self, ConfigError> {
        let path = Self::resolve_path(explicit)?;
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let mut config = GlobalConfig::default();
                config.path = Some(path.to_path_buf());
                return Ok(config);
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        let mut config: GlobalConfig = quick_xml::de::from_str(&content)?;
        config.path = Some(path.to_path_buf());
        config.existed = true;
        Ok(config)
    }

    /// Whether the config was read from an existing file.
    pub fn existed_on_disk(&self) -> bool {
        self.existed
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Write the config back to the path it was loaded from.
    pub fn save(&self) -> Result<(), ConfigError> {
        let path = self.path.as_ref().ok_or(ConfigError::NoHome)?;
        let body = quick_xml::se::to_string(self)?;
        crate::sidecar::write_atomic(path, body.as_bytes())?;
        Ok(())
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.volume_labels.iter().any(|known| known == label)
    }

    /// Append a label to the history. Labels are never removed.
    pub fn register_label(&mut self, label: &str) {
        if !self.has_label(label) {
            self.volume_labels.push(label.to_string());
        }
    }

    pub fn add_source(&mut self, path: &str, alias: &str) -> Result<(), ConfigError> {
        if self.sources.iter().any(|s| s.alias == alias) {
            return Err(ConfigError::DuplicateAlias(alias.to_string()));
        }
        self.sources.push(SourceAlias {
            path: path.to_string(),
            alias: alias.to_string(),
        });
        Ok(())
    }

    pub fn source_path(&self, alias: &str) -> Option<&str> {
        self.sources
            .iter()
            .find(|s| s.alias == alias)
            .map(|s| s.path.as_str())
    }

    pub fn restore_path(&self, alias: &str) -> Option<&str> {
        self.restores
            .iter()
            .find(|r| r.alias == alias)
            .map(|r| r.path.as_str())
    }
}
