//! Filename rewrite rules and duplicate scoring.
//!
//! The rename pipeline normalizes media filenames: configured regex rules
//! rewrite the base name (one or two capture groups, concatenated), known
//! double extensions and `(n)` copy counters are stripped, and runs of dots
//! and spaces collapse. Only filenames whose extension is in the recognized
//! set are touched.
//!
//! Scoring decides which of two duplicate paths survives an autofix prune.
//! The heuristic is deterministic and intentionally blunt; ties keep the
//! first path.

use crate::shutdown::Shutdown;
use crate::store::{DirectoryStore, StoreError};
use crate::walker::{DirectoryTracker, Visitor, WalkError, WalkOptions};
use crate::record::FileRecord;
use parking_lot::Mutex;
use regex::Regex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Extensions the rename pipeline is willing to touch.
pub const DEFAULT_EXTENSIONS: &[&str] = &[
    "avi", "flv", "jpeg", "jpg", "m4v", "mkv", "mov", "mp3", "mp4", "mpg", "png", "wmv",
];

#[derive(Debug, thiserror::Error)]
pub enum AutofixError {
    #[error("bad autofix rule {rule:?}: {source}")]
    Rule {
        rule: String,
        #[source]
        source: regex::Error,
    },
    #[error("autofix rule {rule:?} must have one or two capture groups, has {groups}")]
    RuleGroups { rule: String, groups: usize },
    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Directory-length, "to", filename-length, and "favs" scores for a pair of
/// duplicate paths.
pub fn score_pair(a: &Path, b: &Path) -> (i32, i32) {
    let mut score_a = 0;
    let mut score_b = 0;

    let dir_len = |p: &Path| p.parent().map_or(0, |d| d.as_os_str().len());
    match dir_len(a).cmp(&dir_len(b)) {
        std::cmp::Ordering::Greater => score_a += 2,
        std::cmp::Ordering::Less => score_b += 2,
        std::cmp::Ordering::Equal => {}
    }

    let has_dir_component = |p: &Path, wanted: &str| {
        p.parent()
            .map_or(false, |d| d.components().any(|c| c.as_os_str() == wanted))
    };
    if has_dir_component(a, "to") {
        score_a -= 2;
    }
    if has_dir_component(b, "to") {
        score_b -= 2;
    }

    let name_len = |p: &Path| p.file_name().map_or(0, |n| n.len());
    match name_len(a).cmp(&name_len(b)) {
        std::cmp::Ordering::Greater => score_a -= 1,
        std::cmp::Ordering::Less => score_b -= 1,
        std::cmp::Ordering::Equal => {}
    }

    if has_dir_component(a, "favs") {
        score_a += 2;
    }
    if has_dir_component(b, "favs") {
        score_b += 2;
    }

    (score_a, score_b)
}

/// True when `second` strictly outscores `first`; ties keep the first.
pub fn prefer_second(first: &Path, second: &Path) -> bool {
    let (a, b) = score_pair(first, second);
    b > a
}

/// Compiled rename pipeline.
pub struct RenameRules {
    rules: Vec<Regex>,
    extensions: HashSet<String>,
    counter: Regex,
}

impl RenameRules {
    /// Compile `rule_strings` with the default extension set. Each rule must
    /// carry one or two capture groups; on match the groups concatenate into
    /// the new base name.
    pub fn new(rule_strings: &[String]) -> Result<Self, AutofixError> {
        Self::with_extensions(rule_strings, DEFAULT_EXTENSIONS)
    }

    pub fn with_extensions(
        rule_strings: &[String],
        extensions: &[&str],
    ) -> Result<Self, AutofixError> {
        let mut rules = Vec::with_capacity(rule_strings.len());
        for rule in rule_strings {
            let compiled = Regex::new(rule).map_err(|source| AutofixError::Rule {
                rule: rule.clone(),
                source,
            })?;
            let groups = compiled.captures_len() - 1;
            if !(1..=2).contains(&groups) {
                return Err(AutofixError::RuleGroups {
                    rule: rule.clone(),
                    groups,
                });
            }
            rules.push(compiled);
        }

        Ok(RenameRules {
            rules,
            extensions: extensions.iter().map(|e| e.to_ascii_lowercase()).collect(),
            counter: Regex::new(r"^(.*)\((\d+)\)$").expect("counter pattern is static"),
        })
    }

    fn known_extension(&self, ext: &str) -> bool {
        self.extensions.contains(&ext.to_ascii_lowercase())
    }

    /// The pipeline's verdict for one filename: `Some(new_name)` when a
    /// rename is wanted, `None` when the name is already clean or the
    /// extension is not recognized.
    pub fn rewrite(&self, filename: &str) -> Option<String> {
        let (stem, ext) = filename.rsplit_once('.')?;
        if !self.known_extension(ext) || stem.is_empty() {
            return None;
        }

        let mut base = stem.to_string();
        loop {
            let before = base.clone();

            while let Some((head, tail)) = base.rsplit_once('.') {
                if !head.is_empty() && self.known_extension(tail) {
                    base = head.to_string();
                } else {
                    break;
                }
            }

            if let Some(caps) = self.counter.captures(&base) {
                base = caps[1].to_string();
            }

            for rule in &self.rules {
                if let Some(caps) = rule.captures(&base) {
                    let mut rewritten = String::new();
                    for i in 1..caps.len() {
                        if let Some(group) = caps.get(i) {
                            rewritten.push_str(group.as_str());
                        }
                    }
                    base = rewritten;
                }
            }

            base = collapse_runs(&base);
            base = base.trim_end_matches(['.', ' ']).to_string();

            if base == before {
                break;
            }
        }

        if base.is_empty() {
            return None;
        }

        let candidate = format!("{base}.{ext}");
        if candidate == filename {
            None
        } else {
            Some(candidate)
        }
    }

    /// Rename every matching record in one store. Collisions resolve to the
    /// smallest free `(i)` suffix; a rename whose only free target is the
    /// original name is abandoned.
    pub fn apply_to_store(
        &self,
        store: &DirectoryStore,
    ) -> Result<Vec<RenameOutcome>, AutofixError> {
        let mut outcomes = Vec::new();
        for name in store.names() {
            let Some(desired) = self.rewrite(&name) else {
                continue;
            };
            let Some(target) = resolve_collision(store.directory(), &name, &desired) else {
                debug!("not renaming {name:?}: every candidate name is taken");
                continue;
            };
            store.rename(&name, &target)?;
            info!(
                "renamed {} -> {} in {}",
                name,
                target,
                store.directory().display()
            );
            outcomes.push(RenameOutcome {
                from: name,
                to: target,
            });
        }
        Ok(outcomes)
    }
}

/// Collapse runs of identical `.` or space characters.
fn collapse_runs(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut previous: Option<char> = None;
    for c in input.chars() {
        if (c == '.' || c == ' ') && previous == Some(c) {
            continue;
        }
        out.push(c);
        previous = Some(c);
    }
    out
}

/// Pick a free name for `desired` in `dir`: the name itself, else the
/// smallest `(i)` insertion. Returns `None` when renaming is pointless
/// because the only free candidate is the original name.
fn resolve_collision(dir: &Path, original: &str, desired: &str) -> Option<String> {
    if desired == original {
        return None;
    }
    if !dir.join(desired).exists() {
        return Some(desired.to_string());
    }

    let split = desired.rsplit_once('.');
    for i in 1..=9999u32 {
        let candidate = match split {
            Some((stem, ext)) => format!("{stem}({i}).{ext}"),
            None => format!("{desired}({i})"),
        };
        if candidate == original {
            return None;
        }
        if !dir.join(&candidate).exists() {
            return Some(candidate);
        }
    }
    None
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameOutcome {
    pub from: String,
    pub to: String,
}

/// Walk `roots` applying the rename pipeline to every directory.
pub fn run_autofix(
    roots: &[PathBuf],
    rules: &RenameRules,
    walk: &WalkOptions,
    shutdown: &Shutdown,
) -> Result<Vec<(PathBuf, RenameOutcome)>, WalkError> {
    let visitor = RenameVisitor {
        rules,
        outcomes: Mutex::new(Vec::new()),
    };

    for root in roots {
        let tracker = DirectoryTracker::new(walk.clone());
        tracker.walk(root, &visitor, shutdown)?;
    }

    Ok(visitor.outcomes.into_inner())
}

struct RenameVisitor<'a> {
    rules: &'a RenameRules,
    outcomes: Mutex<Vec<(PathBuf, RenameOutcome)>>,
}

impl Visitor for RenameVisitor<'_> {
    fn visit_file(
        &self,
        store: &Arc<DirectoryStore>,
        name: &str,
        metadata: &std::fs::Metadata,
        _shutdown: &Shutdown,
    ) -> Result<(), WalkError> {
        // Make sure every file has a record so renames carry metadata along.
        match store.get(name) {
            Some(mut record) => {
                if record.refresh_stat(metadata) {
                    store.put(record)?;
                }
            }
            None => {
                store.put(FileRecord::from_stat(name, store.directory(), metadata))?;
            }
        }
        Ok(())
    }

    fn directory_done(&self, store: &DirectoryStore) -> Result<(), WalkError> {
        store.delete_missing()?;
        let renamed = self
            .rules
            .apply_to_store(store)
            .map_err(|e| match e {
                AutofixError::Store(e) => WalkError::Store(e),
                other => WalkError::Io(std::io::Error::other(other.to_string())),
            })?;
        let mut outcomes = self.outcomes.lock();
        for outcome in renamed {
            outcomes.push((store.directory().to_path_buf(), outcome));
        }
        Ok(())
    }
}
