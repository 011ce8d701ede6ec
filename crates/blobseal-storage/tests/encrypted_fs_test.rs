//! Encrypted store over the filesystem store: password-derived keys, on-disk
//! layout, tampering and the orphan sweep.

use std::fs;
use std::io::Read;
use std::sync::Arc;

use blobseal_crypto::{
    derive_repository_key, encrypted_length, repository_salt, CryptoError, KdfParams,
};
use blobseal_storage::{
    BlobContainer, BlobPath, BlobStore, EncryptedBlobStore, FsBlobStore, MemoryBlobStore,
    StorageError,
};
use proptest::prelude::*;
use secrecy::SecretString;

const PREFIX: &str = "encryption-metadata";

fn fast_params() -> KdfParams {
    KdfParams {
        mem_cost_kib: 1024,
        time_cost: 1,
        parallelism: 1,
    }
}

fn open_store(root: &std::path::Path, password: &str, packet_length: u32) -> EncryptedBlobStore {
    let password = SecretString::from(password.to_string());
    let key = derive_repository_key(&password, &repository_salt("test-repo"), &fast_params())
        .expect("key derivation");
    EncryptedBlobStore::new(Arc::new(FsBlobStore::new(root)), &key, packet_length, PREFIX)
        .expect("store setup")
}

fn make_data(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i * 13 + 7) as u8).collect()
}

fn write(container: &dyn BlobContainer, name: &str, data: &[u8]) {
    container
        .write_blob(name, &mut &data[..], data.len() as u64, true)
        .expect("write should succeed");
}

fn read(container: &dyn BlobContainer, name: &str) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    container.read_blob(name)?.read_to_end(&mut out)?;
    Ok(out)
}

#[test]
fn fs_roundtrip_and_layout() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), "correct horse", 4096);
    let container = store.blob_container(&BlobPath::parse("indices/0").unwrap());
    let data = make_data(10_000);
    write(container.as_ref(), "segment", &data);

    assert_eq!(read(container.as_ref(), "segment").unwrap(), data);

    let on_disk = fs::read(dir.path().join("indices/0/segment")).unwrap();
    assert_eq!(on_disk.len() as u64, encrypted_length(10_000, 4096));
    assert!(dir.path().join(PREFIX).join("indices/0/segment").is_file());
}

#[test]
fn reopening_with_same_password_reads_back() {
    let dir = tempfile::tempdir().unwrap();
    let data = make_data(777);
    {
        let store = open_store(dir.path(), "hunter2", 256);
        write(store.blob_container(&BlobPath::root()).as_ref(), "blob", &data);
    }
    // The packet length is recorded per blob, so a different setting still reads.
    let store = open_store(dir.path(), "hunter2", 1024);
    assert_eq!(read(store.blob_container(&BlobPath::root()).as_ref(), "blob").unwrap(), data);
}

#[test]
fn wrong_password_is_reported_as_metadata_failure() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), "right", 256);
    write(store.blob_container(&BlobPath::root()).as_ref(), "blob", b"payload");

    let wrong = open_store(dir.path(), "wrong", 256);
    let err = wrong
        .blob_container(&BlobPath::root())
        .read_blob("blob")
        .err()
        .expect("wrong password must fail");
    assert!(matches!(
        err,
        StorageError::Crypto { source: CryptoError::MetadataAuthentication, .. }
    ));
}

#[test]
fn tampered_metadata_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), "pw", 256);
    write(store.blob_container(&BlobPath::root()).as_ref(), "blob", b"payload");

    let meta = dir.path().join(PREFIX).join("blob");
    let mut sealed = fs::read(&meta).unwrap();
    sealed[30] ^= 0x80;
    fs::write(&meta, &sealed).unwrap();

    let err = store
        .blob_container(&BlobPath::root())
        .read_blob("blob")
        .err()
        .expect("tampered metadata must fail");
    assert!(matches!(
        err,
        StorageError::Crypto { source: CryptoError::MetadataAuthentication, .. }
    ));
}

#[test]
fn truncated_ciphertext_is_detected() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), "pw", 100);
    let container = store.blob_container(&BlobPath::root());
    write(container.as_ref(), "blob", &make_data(350));

    let path = dir.path().join("blob");
    let ciphertext = fs::read(&path).unwrap();
    fs::write(&path, &ciphertext[..ciphertext.len() - 20]).unwrap();

    let err = read(container.as_ref(), "blob").unwrap_err();
    let storage = StorageError::from_io(&err).expect("typed storage error");
    assert!(storage.crypto().is_some_and(CryptoError::is_integrity));
}

#[test]
fn cleanup_sweeps_metadata_left_by_interrupted_writes() {
    let dir = tempfile::tempdir().unwrap();
    let store = open_store(dir.path(), "pw", 256);
    let root = store.container(&BlobPath::root());
    write(&root, "live", b"still here");
    write(store.blob_container(&BlobPath::parse("a/b").unwrap()).as_ref(), "dead", b"x");

    // Simulate a crash between the metadata write and the data write.
    fs::remove_file(dir.path().join("a/b/dead")).unwrap();

    let summary = root.cleanup_orphaned_metadata().unwrap();
    assert_eq!(summary.deleted_blobs, 1);
    assert_eq!(summary.failures, 0);
    assert!(!dir.path().join(PREFIX).join("a/b/dead").exists());
    assert_eq!(read(&root, "live").unwrap(), b"still here");
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn memory_store_roundtrip(len in 0usize..4000, packet_length in 1u32..600) {
        let key = blobseal_crypto::RepositoryKey::from_bytes([7; 32]);
        let store = EncryptedBlobStore::new(
            Arc::new(MemoryBlobStore::new()),
            &key,
            packet_length,
            PREFIX,
        ).unwrap();
        let container = store.blob_container(&BlobPath::root());
        let data = make_data(len);
        write(container.as_ref(), "blob", &data);

        prop_assert_eq!(read(container.as_ref(), "blob").unwrap(), data);
        let listed = container.list_blobs().unwrap();
        prop_assert_eq!(listed["blob"].length, encrypted_length(len as u64, packet_length));
    }
}
