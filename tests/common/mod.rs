use assert_cmd::{Command, cargo::cargo_bin_cmd};
use std::path::Path;

/// A medorg invocation with HOME pointed at a test-owned directory so the
/// global config never leaks into (or out of) the developer's environment.
pub fn medorg_cmd(home: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("medorg");
    cmd.env("HOME", home);
    cmd
}

// Each integration test file is compiled as its own crate; not all of them
// read sidecars back, so this helper is intentionally unused in some.
#[allow(dead_code)]
pub fn record_of(
    dir: &Path,
    name: &str,
) -> Option<medorg::record::FileRecord> {
    medorg::store::DirectoryStore::load(dir).unwrap().get(name)
}
