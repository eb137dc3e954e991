mod common;

use common::{medorg_cmd, record_of};
use medorg::sidecar::VOLUME_SIDECAR_NAME;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn volume_label(dest: &Path) -> String {
    medorg::volume::read_label(dest).unwrap().expect("label")
}

/// Single-source single-file backup: bytes land on the destination, the
/// source record is tagged with the volume label, and the destination
/// sidecar describes the new file.
#[test]
fn backup_single_file() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    fs::create_dir_all(&source).unwrap();
    fs::create_dir_all(&dest).unwrap();
    fs::write(source.join("test.txt"), "test content for backup").unwrap();

    medorg_cmd(temp.path())
        .arg("backup")
        .arg(&source)
        .arg(&dest)
        .assert()
        .success();

    assert_eq!(
        fs::read(dest.join("test.txt")).unwrap(),
        b"test content for backup"
    );
    assert!(dest.join(VOLUME_SIDECAR_NAME).exists());

    let label = volume_label(&dest);
    let source_record = record_of(&source, "test.txt").unwrap();
    assert!(source_record.has_backup_dest(&label));

    let dest_record = record_of(&dest, "test.txt").unwrap();
    assert!(!dest_record.checksum.is_empty());
    assert_eq!(dest_record.checksum, source_record.checksum);
}

#[test]
fn backup_preserves_tree_structure() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    fs::create_dir_all(source.join("albums/summer")).unwrap();
    fs::create_dir_all(&dest).unwrap();
    fs::write(source.join("top.txt"), "top").unwrap();
    fs::write(source.join("albums/summer/beach.txt"), "beach").unwrap();

    medorg_cmd(temp.path())
        .arg("backup")
        .arg(&source)
        .arg(&dest)
        .assert()
        .success();

    assert!(dest.join("top.txt").exists());
    assert!(dest.join("albums/summer/beach.txt").exists());
}

#[test]
fn backup_second_run_copies_nothing_new() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    fs::create_dir_all(&source).unwrap();
    fs::create_dir_all(&dest).unwrap();
    fs::write(source.join("a.txt"), "stable content").unwrap();

    for _ in 0..2 {
        medorg_cmd(temp.path())
            .arg("backup")
            .arg(&source)
            .arg(&dest)
            .assert()
            .success();
    }

    let label = volume_label(&dest);
    assert!(record_of(&source, "a.txt").unwrap().has_backup_dest(&label));
    assert_eq!(fs::read(dest.join("a.txt")).unwrap(), b"stable content");
}

/// Content already on the destination under another name is recognized by
/// fingerprint: the source record gets tagged without any copy.
#[test]
fn backup_recognizes_content_present_under_other_name() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    fs::create_dir_all(&source).unwrap();
    fs::create_dir_all(&dest).unwrap();
    fs::write(source.join("new_name.txt"), "identical payload").unwrap();
    fs::write(dest.join("old_name.txt"), "identical payload").unwrap();

    // Give the destination a sidecar so its content is indexable.
    medorg_cmd(temp.path())
        .arg("check")
        .arg(&dest)
        .assert()
        .success();

    medorg_cmd(temp.path())
        .arg("backup")
        .arg(&source)
        .arg(&dest)
        .assert()
        .success();

    let label = volume_label(&dest);
    assert!(
        record_of(&source, "new_name.txt")
            .unwrap()
            .has_backup_dest(&label)
    );
    // No copy happened: the source's name never appeared on the destination.
    assert!(!dest.join("new_name.txt").exists());
}

/// Multi-source with an overlapping filename and differing content: exactly
/// one version lands, and the run succeeds.
#[test]
fn backup_multi_source_overlapping_filename() {
    let temp = TempDir::new().unwrap();
    let source1 = temp.path().join("source1");
    let source2 = temp.path().join("source2");
    let dest = temp.path().join("dest");
    fs::create_dir_all(&source1).unwrap();
    fs::create_dir_all(&source2).unwrap();
    fs::create_dir_all(&dest).unwrap();
    fs::write(source1.join("shared.txt"), "from source 1").unwrap();
    fs::write(source2.join("shared.txt"), "from source 2").unwrap();

    medorg_cmd(temp.path())
        .arg("backup")
        .arg(&source1)
        .arg(&source2)
        .arg(&dest)
        .assert()
        .success();

    let landed = fs::read(dest.join("shared.txt")).unwrap();
    assert!(landed == b"from source 1" || landed == b"from source 2");
}

/// Delete-mode orphan handling with nesting: exactly the orphan paths are
/// removed, every source-matching file survives.
#[test]
fn backup_delete_mode_removes_nested_orphans() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    fs::create_dir_all(source.join("keep/deep")).unwrap();
    fs::create_dir_all(&dest).unwrap();
    fs::write(source.join("root.txt"), "root file").unwrap();
    fs::write(source.join("keep/mid.txt"), "mid file").unwrap();
    fs::write(source.join("keep/deep/leaf.txt"), "leaf file").unwrap();

    medorg_cmd(temp.path())
        .arg("backup")
        .arg(&source)
        .arg(&dest)
        .assert()
        .success();

    // Seed orphans at the root and at two depths.
    fs::create_dir_all(dest.join("keep/deep")).unwrap();
    fs::write(dest.join("orphan_root.txt"), "o1").unwrap();
    fs::write(dest.join("keep/orphan_mid.txt"), "o2").unwrap();
    fs::write(dest.join("keep/deep/orphan_leaf.txt"), "o3").unwrap();

    medorg_cmd(temp.path())
        .arg("backup")
        .arg("--delete-orphans")
        .arg(&source)
        .arg(&dest)
        .assert()
        .success();

    assert!(!dest.join("orphan_root.txt").exists());
    assert!(!dest.join("keep/orphan_mid.txt").exists());
    assert!(!dest.join("keep/deep/orphan_leaf.txt").exists());

    assert!(dest.join("root.txt").exists());
    assert!(dest.join("keep/mid.txt").exists());
    assert!(dest.join("keep/deep/leaf.txt").exists());
}

/// A file present on any source is never orphaned, even when another source
/// does not have it.
#[test]
fn backup_multi_source_orphan_conservation() {
    let temp = TempDir::new().unwrap();
    let source1 = temp.path().join("source1");
    let source2 = temp.path().join("source2");
    let dest = temp.path().join("dest");
    fs::create_dir_all(&source1).unwrap();
    fs::create_dir_all(&source2).unwrap();
    fs::create_dir_all(&dest).unwrap();
    fs::write(source1.join("only_in_1.txt"), "first").unwrap();
    fs::write(source2.join("only_in_2.txt"), "second").unwrap();

    medorg_cmd(temp.path())
        .arg("backup")
        .arg(&source1)
        .arg(&source2)
        .arg(&dest)
        .assert()
        .success();

    // Re-run in delete mode; both files are explained by some source.
    medorg_cmd(temp.path())
        .arg("backup")
        .arg("--delete-orphans")
        .arg(&source1)
        .arg(&source2)
        .arg(&dest)
        .assert()
        .success();

    assert!(dest.join("only_in_1.txt").exists());
    assert!(dest.join("only_in_2.txt").exists());
}

/// Ten empty files are one content class: a single file lands on the
/// destination and every source record is tagged.
#[test]
fn backup_dedups_empty_files() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    fs::create_dir_all(&source).unwrap();
    fs::create_dir_all(&dest).unwrap();
    for i in 0..10 {
        fs::write(source.join(format!("empty{i}.bin")), b"").unwrap();
    }

    medorg_cmd(temp.path())
        .arg("backup")
        .arg(&source)
        .arg(&dest)
        .assert()
        .success();

    let landed: Vec<_> = fs::read_dir(&dest)
        .unwrap()
        .filter_map(|e| {
            let e = e.unwrap();
            let name = e.file_name().to_string_lossy().into_owned();
            (e.file_type().unwrap().is_file() && !name.starts_with('.')).then_some(name)
        })
        .collect();
    assert_eq!(landed.len(), 1, "expected one physical file, got {landed:?}");

    let label = volume_label(&dest);
    for i in 0..10 {
        let record = record_of(&source, &format!("empty{i}.bin")).unwrap();
        assert!(
            record.has_backup_dest(&label),
            "empty{i}.bin missing the volume label"
        );
    }
}

#[test]
fn backup_with_single_path_exits_too_few() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    fs::create_dir_all(&source).unwrap();

    medorg_cmd(temp.path())
        .arg("backup")
        .arg(&source)
        .assert()
        .code(12);
}

#[test]
fn backup_registers_label_in_global_config() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    let dest = temp.path().join("dest");
    fs::create_dir_all(&source).unwrap();
    fs::create_dir_all(&dest).unwrap();
    fs::write(source.join("a.txt"), "content").unwrap();

    medorg_cmd(temp.path())
        .arg("backup")
        .arg(&source)
        .arg(&dest)
        .assert()
        .success();

    let label = volume_label(&dest);
    let config = medorg::config::GlobalConfig::load_from(
        &temp.path().join(medorg::config::CONFIG_FILENAME),
    )
    .unwrap();
    assert!(config.has_label(&label));
}
