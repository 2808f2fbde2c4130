//! End-to-end scenarios S1-S6, exercised directly against the backup store
//! engine and manifest (no manifest-lock lifecycle or RSA key pair — that
//! plumbing is covered separately in `manifest::lifecycle`'s own tests).

use backuppy_core::backend::LocalBackend;
use backuppy_core::config::StoreOptions;
use backuppy_core::error::BackupError;
use backuppy_core::io::StreamHandle;
use backuppy_core::manifest::Manifest;
use backuppy_core::orchestrator;
use backuppy_core::store::BackupStoreEngine;

fn write(path: &std::path::Path, content: &[u8]) {
    std::fs::write(path, content).unwrap();
}

fn read_back(engine: &BackupStoreEngine<'_>, manifest: &Manifest, path: &str) -> Vec<u8> {
    let entry = manifest.get_entry(path, None).unwrap().unwrap();
    let out = StreamHandle::anonymous();
    engine.restore_entry(&entry, &out).unwrap();
    let scope = out.open().unwrap();
    scope.reader(None, true).unwrap().collect::<backuppy_core::Result<Vec<_>>>().unwrap().into_iter().flatten().collect()
}

fn blob_count(backend: &LocalBackend) -> usize {
    backend.query("").unwrap().len()
}

#[test]
fn s1_initial_backup_produces_three_blobs_and_restores_byte_for_byte() {
    let store_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(store_dir.path());
    let engine = BackupStoreEngine::new(&backend, StoreOptions::default());
    let mut manifest = Manifest::open_in_memory().unwrap();

    std::fs::create_dir_all(data_dir.path().join("baz")).unwrap();
    write(&data_dir.path().join("foo"), b"asdf");
    write(&data_dir.path().join("bar"), b"hjkl");
    write(&data_dir.path().join("baz/buz"), b"qwerty");

    orchestrator::backup_directory(&engine, &mut manifest, data_dir.path(), &[], false, false, Some(1)).unwrap();

    assert_eq!(blob_count(&backend), 3);
    assert_eq!(read_back(&engine, &manifest, &data_dir.path().join("foo").to_string_lossy()), b"asdf");
    assert_eq!(read_back(&engine, &manifest, &data_dir.path().join("bar").to_string_lossy()), b"hjkl");
    assert_eq!(read_back(&engine, &manifest, &data_dir.path().join("baz/buz").to_string_lossy()), b"qwerty");
}

#[test]
fn s2_content_change_becomes_a_diff() {
    let store_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(store_dir.path());
    let engine = BackupStoreEngine::new(&backend, StoreOptions::default());
    let mut manifest = Manifest::open_in_memory().unwrap();

    let foo = data_dir.path().join("foo");
    write(&foo, b"asdf");
    write(&data_dir.path().join("bar"), b"hjkl");
    std::fs::create_dir_all(data_dir.path().join("baz")).unwrap();
    write(&data_dir.path().join("baz/buz"), b"qwerty");
    orchestrator::backup_directory(&engine, &mut manifest, data_dir.path(), &[], false, false, Some(1)).unwrap();

    write(&foo, b"adz foobar");
    orchestrator::backup_directory(&engine, &mut manifest, data_dir.path(), &[], false, false, Some(1)).unwrap();

    let entry = manifest.get_entry(&foo.to_string_lossy(), None).unwrap().unwrap();
    assert_eq!(entry.state.sha().unwrap(), backuppy_core::diff::sha256_hex(b"adz foobar"));
    assert_eq!(entry.state.base_sha().unwrap(), backuppy_core::diff::sha256_hex(b"asdf"));
    assert_eq!(blob_count(&backend), 4);
    assert_eq!(read_back(&engine, &manifest, &foo.to_string_lossy()), b"adz foobar");
}

#[test]
fn s3_delete_then_restore_dedups_against_existing_blob() {
    let store_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(store_dir.path());
    let engine = BackupStoreEngine::new(&backend, StoreOptions::default());
    let mut manifest = Manifest::open_in_memory().unwrap();

    let foo = data_dir.path().join("foo");
    write(&foo, b"asdf");
    orchestrator::backup_directory(&engine, &mut manifest, data_dir.path(), &[], false, false, Some(1)).unwrap();
    let blobs_after_create = blob_count(&backend);

    std::fs::remove_file(&foo).unwrap();
    orchestrator::backup_directory(&engine, &mut manifest, data_dir.path(), &[], false, false, Some(1)).unwrap();
    assert!(!manifest.files(None).unwrap().contains(&foo.to_string_lossy().to_string()));

    write(&foo, b"asdf");
    orchestrator::backup_directory(&engine, &mut manifest, data_dir.path(), &[], false, false, Some(1)).unwrap();

    assert_eq!(blob_count(&backend), blobs_after_create);
    assert!(manifest.files(None).unwrap().contains(&foo.to_string_lossy().to_string()));
}

#[test]
fn s4_diff_too_large_falls_back_to_a_full_copy() {
    let store_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(store_dir.path());
    let options = StoreOptions { discard_diff_percentage: Some(0.5), ..StoreOptions::default() };
    let engine = BackupStoreEngine::new(&backend, options);
    let mut manifest = Manifest::open_in_memory().unwrap();

    let foo = data_dir.path().join("foo");
    write(&foo, b"asdf");
    orchestrator::backup_directory(&engine, &mut manifest, data_dir.path(), &[], false, false, Some(1)).unwrap();
    let blobs_before = blob_count(&backend);

    write(&foo, b"adfoo blah blah blah blah blah");
    orchestrator::backup_directory(&engine, &mut manifest, data_dir.path(), &[], false, false, Some(1)).unwrap();

    let entry = manifest.get_entry(&foo.to_string_lossy(), None).unwrap().unwrap();
    assert!(entry.state.base_sha().is_none());
    assert_eq!(blob_count(&backend), blobs_before + 1);
}

#[test]
fn s5_orphan_blob_from_an_aborted_run_is_deduped_on_retry() {
    let store_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(store_dir.path());
    let engine = BackupStoreEngine::new(&backend, StoreOptions::default());

    let new_file = data_dir.path().join("new");
    write(&new_file, b"1234");

    // Simulate "abort after the blob is uploaded but before the manifest row
    // is committed": upload the blob directly, bypassing save_if_new, and
    // never touch the manifest.
    let sha = backuppy_core::diff::sha256_hex(b"1234");
    let key_pair = backuppy_core::crypto::generate_key_pair(&StoreOptions::default());
    let staged = StreamHandle::for_path(&new_file);
    engine.save(&staged, &sha, &key_pair).unwrap();
    let blobs_after_abort = blob_count(&backend);

    let mut manifest = Manifest::open_in_memory().unwrap();
    assert!(manifest.get_entry(&new_file.to_string_lossy(), None).unwrap().is_none());

    orchestrator::backup_directory(&engine, &mut manifest, data_dir.path(), &[], false, false, Some(1)).unwrap();

    assert!(manifest.get_entry(&new_file.to_string_lossy(), None).unwrap().is_some());
    assert_eq!(blob_count(&backend), blobs_after_abort, "retry should reuse the orphan blob, not upload a second copy");
}

#[test]
fn s6_a_flipped_byte_in_a_stored_blob_is_caught_by_verify_and_restore() {
    let store_dir = tempfile::tempdir().unwrap();
    let data_dir = tempfile::tempdir().unwrap();
    let backend = LocalBackend::new(store_dir.path());
    let engine = BackupStoreEngine::new(&backend, StoreOptions::default());
    let mut manifest = Manifest::open_in_memory().unwrap();

    let foo = data_dir.path().join("foo");
    write(&foo, b"asdf");
    orchestrator::backup_directory(&engine, &mut manifest, data_dir.path(), &[], false, false, Some(1)).unwrap();

    let entry = manifest.get_entry(&foo.to_string_lossy(), None).unwrap().unwrap();
    let sha = entry.state.sha().unwrap().to_string();
    let blob_path = store_dir.path().join(backuppy_core::util::sha_to_path(&sha));
    let mut bytes = std::fs::read(&blob_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&blob_path, bytes).unwrap();

    let findings = orchestrator::verify(&engine, &manifest).unwrap();
    assert!(findings
        .iter()
        .any(|f| matches!(f, orchestrator::VerifyFinding::BlobUnreadable { abs_file_name, .. } if *abs_file_name == foo.to_string_lossy())));

    let out = StreamHandle::anonymous();
    let err = engine.restore_entry(&entry, &out).unwrap_err();
    assert!(matches!(err, BackupError::BackupCorrupted(_)));
}
