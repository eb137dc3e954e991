mod common;

use common::{medorg_cmd, record_of};
use std::fs;
use tempfile::TempDir;

#[test]
fn discover_tags_content_already_on_volume() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    let vol = temp.path().join("vol");
    fs::create_dir_all(&source).unwrap();
    fs::create_dir_all(&vol).unwrap();
    fs::write(source.join("kept.txt"), "shared content").unwrap();
    fs::write(source.join("local.txt"), "only at home").unwrap();
    fs::write(vol.join("archived.txt"), "shared content").unwrap();

    medorg::volume::write_label(&vol, "AbCdEfGh").unwrap();

    // Fingerprint the volume first so its sidecars are indexable.
    medorg_cmd(temp.path())
        .arg("check")
        .arg(&vol)
        .assert()
        .success();

    medorg_cmd(temp.path())
        .arg("discover")
        .arg("--volume")
        .arg(&vol)
        .arg(&source)
        .assert()
        .success();

    assert!(
        record_of(&source, "kept.txt")
            .unwrap()
            .has_backup_dest("AbCdEfGh")
    );
    assert!(
        !record_of(&source, "local.txt")
            .unwrap()
            .has_backup_dest("AbCdEfGh")
    );
}

#[test]
fn discover_unlabeled_volume_exits_bad_volume() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    let vol = temp.path().join("vol");
    fs::create_dir_all(&source).unwrap();
    fs::create_dir_all(&vol).unwrap();

    medorg_cmd(temp.path())
        .arg("discover")
        .arg("--volume")
        .arg(&vol)
        .arg(&source)
        .assert()
        .code(20);
}

#[test]
fn discover_without_sources_exits_too_few() {
    let temp = TempDir::new().unwrap();
    let vol = temp.path().join("vol");
    fs::create_dir_all(&vol).unwrap();

    medorg_cmd(temp.path())
        .arg("discover")
        .arg("--volume")
        .arg(&vol)
        .assert()
        .code(12);
}

/// Discovery followed by a backup: discovered content is not copied again.
#[test]
fn discover_then_backup_copies_nothing_extra() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("source");
    let vol = temp.path().join("vol");
    fs::create_dir_all(&source).unwrap();
    fs::create_dir_all(&vol).unwrap();
    fs::write(source.join("a.txt"), "manually copied earlier").unwrap();
    fs::write(vol.join("a.txt"), "manually copied earlier").unwrap();

    medorg::volume::write_label(&vol, "QrStUvWx").unwrap();

    medorg_cmd(temp.path())
        .arg("check")
        .arg(&vol)
        .assert()
        .success();

    medorg_cmd(temp.path())
        .arg("discover")
        .arg("--volume")
        .arg(&vol)
        .arg(&source)
        .assert()
        .success();

    let before = fs::metadata(vol.join("a.txt")).unwrap().modified().unwrap();

    medorg_cmd(temp.path())
        .arg("backup")
        .arg(&source)
        .arg(&vol)
        .assert()
        .success();

    let after = fs::metadata(vol.join("a.txt")).unwrap().modified().unwrap();
    assert_eq!(before, after, "the file should not have been recopied");
}
