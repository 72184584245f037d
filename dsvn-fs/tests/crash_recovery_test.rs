//! Recovery from interrupted commits and interrupted packing
//!
//! Each test leaves the store in a state a crash could produce and checks
//! that readers are unaffected and the next writer cleans up.

use dsvn_fs::{svn_props, FsError, FsStore, PackOutcome, PropertySet, StoreConfig};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn store_with_revisions(tmp: &TempDir, shard_size: u64, count: u64) -> FsStore {
    let store = FsStore::create(tmp.path(), StoreConfig::default().with_shard_size(shard_size)).unwrap();
    for n in 1..=count {
        let mut txn = store.begin_txn().unwrap();
        txn.put_file(&format!("f{}", n), format!("text {}", n)).unwrap();
        store.commit_revision(txn, PropertySet::new()).unwrap();
    }
    store
}

fn copy_dir(from: &Path, to: &Path) {
    fs::create_dir_all(to).unwrap();
    for entry in fs::read_dir(from).unwrap() {
        let entry = entry.unwrap();
        fs::copy(entry.path(), to.join(entry.file_name())).unwrap();
    }
}

#[test]
fn test_revision_written_but_not_published() {
    let tmp = TempDir::new().unwrap();
    let store = store_with_revisions(&tmp, 4, 1);

    // Crash after the revision file landed but before `current` moved
    fs::write(tmp.path().join("revs/0/2"), b"half-written revision").unwrap();
    fs::write(tmp.path().join("txns/.current.0a0b.tmp"), b"2\n").unwrap();
    assert_eq!(store.youngest().unwrap(), 1);
    assert!(matches!(store.revision_root(2), Err(FsError::NoSuchRevision(2))));

    let mut txn = store.begin_txn().unwrap();
    txn.put_file("after-crash", "fine").unwrap();
    assert_eq!(store.commit_revision(txn, PropertySet::new()).unwrap(), 2);
    assert_eq!(store.read_file(2, "after-crash").unwrap(), b"fine");
    assert_eq!(fs::read_dir(tmp.path().join("txns")).unwrap().count(), 0);
    store.verify(0..=2).unwrap();
}

#[test]
fn test_pack_temporaries_left_behind() {
    let tmp = TempDir::new().unwrap();
    let store = store_with_revisions(&tmp, 4, 4);

    // Crash while the pack was being written: no manifest yet
    let pack_dir = tmp.path().join("revs/0.pack");
    fs::create_dir_all(&pack_dir).unwrap();
    fs::write(pack_dir.join("pack.tmp"), b"partial pack").unwrap();
    fs::write(pack_dir.join("manifest.tmp"), b"0\n").unwrap();

    assert_eq!(store.read_file(3, "f3").unwrap(), b"text 3");
    assert_eq!(store.pack_shard(0).unwrap(), PackOutcome::Packed);
    assert!(!pack_dir.join("pack.tmp").exists());
    assert!(!pack_dir.join("manifest.tmp").exists());
    assert_eq!(store.read_file(3, "f3").unwrap(), b"text 3");
}

#[test]
fn test_loose_files_left_after_pack_published() {
    let tmp = TempDir::new().unwrap();
    let store = store_with_revisions(&tmp, 4, 4);
    let loose = tmp.path().join("revs/0");
    let saved = tmp.path().join("saved-shard");
    copy_dir(&loose, &saved);

    assert_eq!(store.pack_shard(0).unwrap(), PackOutcome::Packed);

    // Crash between publishing the manifest and removing the loose shard
    copy_dir(&saved, &loose);
    let reopened = FsStore::open(tmp.path()).unwrap();
    assert_eq!(reopened.read_file(2, "f2").unwrap(), b"text 2");

    assert_eq!(reopened.pack_shard(0).unwrap(), PackOutcome::AlreadyPacked);
    assert!(!loose.exists());
    assert_eq!(reopened.read_file(4, "f1").unwrap(), b"text 1");
    assert_eq!(reopened.pack_shard(0).unwrap(), PackOutcome::AlreadyPacked);
}

#[test]
fn test_corrupt_loose_revision_aborts_pack() {
    let tmp = TempDir::new().unwrap();
    let store = store_with_revisions(&tmp, 4, 4);

    let victim = tmp.path().join("revs/0/2");
    let mut bytes = fs::read(&victim).unwrap();
    bytes[0] ^= 0xff;
    fs::write(&victim, &bytes).unwrap();

    assert!(matches!(
        store.pack_shard(0),
        Err(FsError::ChecksumMismatch { .. })
    ));
    assert!(!tmp.path().join("revs/0.pack/manifest").exists());
    assert!(!tmp.path().join("revs/0.pack/pack.tmp").exists());
    assert!(tmp.path().join("revs/0/1").exists());
    assert!(store.verify(2..=2).is_err());
    store.verify(3..=4).unwrap();
}

#[test]
fn test_pack_until_past_deadline_leaves_shard_loose() {
    let tmp = TempDir::new().unwrap();
    let store = store_with_revisions(&tmp, 2, 3);

    let summary = store.pack_until(std::time::Instant::now()).unwrap();
    assert_eq!(summary.aborted, Some(0));
    assert!(summary.is_empty());
    assert!(tmp.path().join("revs/0/0").exists());
    assert!(!tmp.path().join("revs/0.pack/manifest").exists());

    let summary = store.pack().unwrap();
    assert_eq!(summary.content_shards, vec![0, 1]);
    assert_eq!(summary.aborted, None);
    assert_eq!(store.read_file(3, "f2").unwrap(), b"text 2");
}

fn store_with_packed_revprops(tmp: &TempDir) -> FsStore {
    let config = StoreConfig::default()
        .with_shard_size(4)
        .with_compressed_revprops(true);
    let store = FsStore::create(tmp.path(), config).unwrap();
    for n in 1..=4 {
        let txn = store.begin_txn().unwrap();
        let mut props = PropertySet::new();
        props.set(svn_props::LOG, format!("log {}", n));
        store.commit_revision(txn, props).unwrap();
    }
    assert_eq!(store.pack_revprops_shard(0).unwrap(), PackOutcome::Packed);
    store
}

#[test]
fn test_revprop_rewrite_interrupted_before_marker() {
    let tmp = TempDir::new().unwrap();
    let store = store_with_packed_revprops(&tmp);
    let marker = tmp.path().join("revprops/0.pack/manifest");
    let old_marker = fs::read(&marker).unwrap();

    let long = "l".repeat(500);
    store
        .write_revision_property(1, svn_props::LOG, Some(long.as_bytes()))
        .unwrap();

    // Whatever the marker says, offsets come from the pack that was published
    fs::write(&marker, &old_marker).unwrap();
    fs::write(tmp.path().join("revprops/0.pack/.pack.0a0b.tmp"), b"ZSTD half").unwrap();
    let reopened = FsStore::open(tmp.path()).unwrap();
    assert_eq!(
        reopened.read_revision_property(1, svn_props::LOG).unwrap(),
        Some(long.into_bytes())
    );
    assert_eq!(
        reopened.read_all_properties(2).unwrap().get_str(svn_props::LOG),
        Some("log 2")
    );
    reopened
        .write_revision_property(3, svn_props::AUTHOR, Some(b"sally"))
        .unwrap();
    assert_eq!(
        reopened.read_revision_property(3, svn_props::AUTHOR).unwrap(),
        Some(b"sally".to_vec())
    );
    reopened.verify(0..=4).unwrap();
}

#[test]
fn test_revprop_rewrite_interrupted_before_rename() {
    let tmp = TempDir::new().unwrap();
    let store = store_with_packed_revprops(&tmp);
    let pack_dir = tmp.path().join("revprops/0.pack");
    let pack_before = fs::read(pack_dir.join("pack")).unwrap();

    // A synced temporary that never got renamed over the pack
    fs::write(pack_dir.join(".pack.0c0d.tmp"), b"PLAIN 0 garbage\n").unwrap();
    let reopened = FsStore::open(tmp.path()).unwrap();
    assert_eq!(fs::read(pack_dir.join("pack")).unwrap(), pack_before);
    for n in 1..=3 {
        assert_eq!(
            reopened.read_revision_property(n, svn_props::LOG).unwrap(),
            Some(format!("log {}", n).into_bytes())
        );
    }
}
