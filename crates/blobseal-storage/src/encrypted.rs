//! Encrypting decorator over any [`BlobStore`]
//!
//! Every data blob `a/b/name` is stored as packet ciphertext under a fresh
//! per-blob key. The key, nonce and packet length travel in a sealed
//! metadata blob at `<metadata_prefix>/a/b/name` in the same delegate store.
//!
//! Writes put the metadata first, so a data blob never exists without its
//! metadata. An interrupted write can leave metadata with no data;
//! [`EncryptedBlobContainer::cleanup_orphaned_metadata`] sweeps those up.

use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::Arc;

use blobseal_crypto::keys::SEALED_METADATA_LENGTH;
use blobseal_crypto::packet::validate_packet_length;
use blobseal_crypto::{
    decrypted_length, decryption_stream, derive_metadata_key, encrypted_length,
    encryption_stream, open_metadata, seal_metadata, BlobEncryptionMetadata, CryptoError,
    DecryptionPacketsStream, InputStream, MetadataKey, ReadStream, RepositoryKey,
};

use crate::blob::{
    validate_name, BlobContainer, BlobMetadata, BlobPath, BlobStore, BlobStream, DeleteResult,
};
use crate::error::{StorageError, StorageResult};

pub const DEFAULT_METADATA_PREFIX: &str = "encryption-metadata";

struct Shared {
    delegate: Arc<dyn BlobStore>,
    metadata_key: MetadataKey,
    packet_length: u32,
    metadata_prefix: String,
}

/// Blob store that encrypts everything written through it.
#[derive(Clone)]
pub struct EncryptedBlobStore {
    shared: Arc<Shared>,
}

impl EncryptedBlobStore {
    pub fn new(
        delegate: Arc<dyn BlobStore>,
        repository_key: &RepositoryKey,
        packet_length: u32,
        metadata_prefix: impl Into<String>,
    ) -> StorageResult<Self> {
        let metadata_prefix = metadata_prefix.into();
        validate_name(&metadata_prefix)?;
        validate_packet_length(packet_length).map_err(StorageError::Setup)?;
        let metadata_key = derive_metadata_key(repository_key).map_err(StorageError::Setup)?;
        Ok(Self {
            shared: Arc::new(Shared {
                delegate,
                metadata_key,
                packet_length,
                metadata_prefix,
            }),
        })
    }

    pub fn packet_length(&self) -> u32 {
        self.shared.packet_length
    }

    pub fn metadata_prefix(&self) -> &str {
        &self.shared.metadata_prefix
    }

    /// The encrypted container at `path`, with the cleanup operations that
    /// the [`BlobContainer`] trait does not carry.
    pub fn container(&self, path: &BlobPath) -> EncryptedBlobContainer {
        EncryptedBlobContainer::new(self.shared.clone(), path.clone())
    }
}

impl BlobStore for EncryptedBlobStore {
    fn blob_container(&self, path: &BlobPath) -> Arc<dyn BlobContainer> {
        Arc::new(self.container(path))
    }
}

impl std::fmt::Debug for EncryptedBlobStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedBlobStore")
            .field("packet_length", &self.shared.packet_length)
            .field("metadata_prefix", &self.shared.metadata_prefix)
            .finish_non_exhaustive()
    }
}

/// Outcome of an orphaned-metadata sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupSummary {
    /// Metadata blobs removed, including those inside removed containers
    pub deleted_blobs: u64,
    /// Metadata containers removed because no data container matched
    pub deleted_containers: u64,
    /// Deletions or listings that failed and were skipped
    pub failures: u64,
}

impl CleanupSummary {
    fn merge(self, other: CleanupSummary) -> Self {
        Self {
            deleted_blobs: self.deleted_blobs + other.deleted_blobs,
            deleted_containers: self.deleted_containers + other.deleted_containers,
            failures: self.failures + other.failures,
        }
    }
}

pub struct EncryptedBlobContainer {
    path: BlobPath,
    data: Arc<dyn BlobContainer>,
    metadata: Arc<dyn BlobContainer>,
    shared: Arc<Shared>,
}

impl EncryptedBlobContainer {
    fn new(shared: Arc<Shared>, path: BlobPath) -> Self {
        let data = shared.delegate.blob_container(&path);
        let metadata = shared
            .delegate
            .blob_container(&path.under(&shared.metadata_prefix));
        Self {
            path,
            data,
            metadata,
            shared,
        }
    }

    fn child(&self, name: &str) -> StorageResult<Self> {
        Ok(Self::new(self.shared.clone(), self.path.add(name)?))
    }

    fn display(&self, name: &str) -> String {
        self.path.blob_name(name)
    }

    fn is_reserved(&self, name: &str) -> bool {
        let prefix = self.shared.metadata_prefix.as_str();
        match self.path.parts().first() {
            Some(first) => first == prefix,
            None => name == prefix,
        }
    }

    /// Raw sealed metadata of blob `name`, or `None` if there is none.
    ///
    /// Reads at most one byte past the sealed length; anything longer is
    /// rejected as malformed when opened.
    fn read_sealed_metadata(&self, name: &str) -> StorageResult<Option<Vec<u8>>> {
        let mut stream = match self.metadata.read_blob(name) {
            Ok(stream) => stream,
            Err(StorageError::NotFound(_)) => return Ok(None),
            Err(e) => return Err(e),
        };
        let mut sealed = Vec::with_capacity(SEALED_METADATA_LENGTH);
        (&mut stream)
            .take(SEALED_METADATA_LENGTH as u64 + 1)
            .read_to_end(&mut sealed)?;
        stream.close()?;
        Ok(Some(sealed))
    }

    /// Read and open the sealed metadata of blob `name`.
    fn read_metadata(&self, name: &str) -> StorageResult<BlobEncryptionMetadata> {
        let sealed = self
            .read_sealed_metadata(name)?
            .ok_or_else(|| StorageError::MissingMetadata(self.display(name)))?;
        open_metadata(&self.shared.metadata_key, &sealed).map_err(|source| StorageError::Crypto {
            name: self.display(name),
            source,
        })
    }

    /// Put back the metadata that a failed write replaced, or remove the
    /// metadata it added. Failures are logged; the write error wins.
    fn restore_metadata(&self, name: &str, previous: Option<&[u8]>) {
        let restored = match previous {
            Some(sealed) => self
                .metadata
                .write_blob(name, &mut &sealed[..], sealed.len() as u64, false),
            None => self
                .metadata
                .delete_blobs_ignoring_if_not_exists(&[name.to_string()]),
        };
        if let Err(e) = restored {
            tracing::warn!(
                path = %self.path,
                blob = %name,
                error = %e,
                "failed to restore encryption metadata after a failed write"
            );
        }
    }

    /// Delete metadata blobs with no data blob, and metadata containers with
    /// no data container, in this container and below.
    ///
    /// Individual failures are logged and counted; the sweep carries on.
    pub fn cleanup_orphaned_metadata(&self) -> StorageResult<CleanupSummary> {
        let mut summary = CleanupSummary::default();

        let data_blobs = self.data.list_blobs()?;
        let orphans: Vec<String> = self
            .metadata
            .list_blobs()?
            .into_keys()
            .filter(|name| !data_blobs.contains_key(name))
            .collect();
        for name in orphans {
            match self
                .metadata
                .delete_blobs_ignoring_if_not_exists(std::slice::from_ref(&name))
            {
                Ok(()) => {
                    tracing::debug!(path = %self.path, blob = %name, "deleted orphaned metadata");
                    summary.deleted_blobs += 1;
                }
                Err(e) => {
                    tracing::warn!(
                        path = %self.path,
                        blob = %name,
                        error = %e,
                        "failed to delete orphaned metadata"
                    );
                    summary.failures += 1;
                }
            }
        }

        let data_children = self.data_children()?;
        for (name, metadata_child) in self.metadata.children()? {
            let swept = if data_children.contains_key(&name) {
                self.child(&name)
                    .and_then(|child| child.cleanup_orphaned_metadata())
            } else {
                metadata_child.delete().map(|deleted| {
                    tracing::debug!(
                        path = %self.path,
                        container = %name,
                        blobs = deleted.blobs_deleted,
                        "deleted orphaned metadata container"
                    );
                    CleanupSummary {
                        deleted_blobs: deleted.blobs_deleted,
                        deleted_containers: 1,
                        failures: 0,
                    }
                })
            };
            match swept {
                Ok(child_summary) => summary = summary.merge(child_summary),
                Err(e) => {
                    tracing::warn!(
                        path = %self.path,
                        container = %name,
                        error = %e,
                        "failed to clean up metadata container"
                    );
                    summary.failures += 1;
                }
            }
        }

        Ok(summary)
    }

    /// Data sub-containers, without the metadata tree at the root.
    fn data_children(&self) -> StorageResult<BTreeMap<String, Arc<dyn BlobContainer>>> {
        let mut children = self.data.children()?;
        if self.path.is_root() {
            children.remove(&self.shared.metadata_prefix);
        }
        Ok(children)
    }
}

impl BlobContainer for EncryptedBlobContainer {
    fn path(&self) -> &BlobPath {
        &self.path
    }

    fn read_blob(&self, name: &str) -> StorageResult<BlobStream> {
        let metadata = self.read_metadata(name)?;
        let ciphertext = self.data.read_blob(name)?;
        tracing::debug!(
            path = %self.path,
            blob = %name,
            packet_length = metadata.packet_length(),
            "opening encrypted blob"
        );
        Ok(Box::new(DecryptedBlob {
            name: self.display(name),
            inner: decryption_stream(ciphertext, &metadata),
        }))
    }

    /// `declared_length` is the plaintext length; the delegate is asked for
    /// the matching ciphertext length.
    fn write_blob(
        &self,
        name: &str,
        input: &mut dyn Read,
        declared_length: u64,
        fail_if_exists: bool,
    ) -> StorageResult<()> {
        validate_name(name)?;
        if self.is_reserved(name) {
            return Err(StorageError::InvalidName(self.display(name)));
        }
        // Checked up front: the metadata write below would clobber the
        // existing blob's key.
        if fail_if_exists && self.data.blob_exists(name)? {
            return Err(StorageError::AlreadyExists(self.display(name)));
        }

        let crypto_err = |source| StorageError::Crypto {
            name: self.display(name),
            source,
        };
        let packet_length = self.shared.packet_length;
        let metadata = BlobEncryptionMetadata::generate(packet_length).map_err(crypto_err)?;
        let sealed = seal_metadata(&self.shared.metadata_key, &metadata).map_err(crypto_err)?;

        // The existing data blob stays readable only under its own metadata,
        // so keep a copy until the new data has landed.
        let previous = self.read_sealed_metadata(name)?;
        self.metadata
            .write_blob(name, &mut &sealed[..], sealed.len() as u64, false)?;

        let mut encrypted = encryption_stream(ReadStream::new(input), &metadata);
        let written = self
            .data
            .write_blob(
                name,
                &mut encrypted,
                encrypted_length(declared_length, packet_length),
                fail_if_exists,
            )
            .and_then(|()| Ok(encrypted.close()?));

        match written {
            Ok(()) => {
                tracing::debug!(
                    path = %self.path,
                    blob = %name,
                    length = declared_length,
                    packets = encrypted.elements().packets(),
                    "wrote encrypted blob"
                );
                Ok(())
            }
            Err(e) => {
                self.restore_metadata(name, previous.as_deref());
                match e {
                    StorageError::LengthMismatch { actual, .. } => {
                        Err(StorageError::LengthMismatch {
                            name: self.display(name),
                            declared: declared_length,
                            actual: decrypted_length(actual, packet_length).unwrap_or(actual),
                        })
                    }
                    e => Err(e),
                }
            }
        }
    }

    fn blob_exists(&self, name: &str) -> StorageResult<bool> {
        self.data.blob_exists(name)
    }

    /// Lengths are the stored (ciphertext) lengths.
    fn list_blobs(&self) -> StorageResult<BTreeMap<String, BlobMetadata>> {
        self.data.list_blobs()
    }

    fn children(&self) -> StorageResult<BTreeMap<String, Arc<dyn BlobContainer>>> {
        let mut children: BTreeMap<String, Arc<dyn BlobContainer>> = BTreeMap::new();
        for name in self.data_children()?.into_keys() {
            let child = self.child(&name)?;
            children.insert(name, Arc::new(child));
        }
        Ok(children)
    }

    fn delete_blobs_ignoring_if_not_exists(&self, names: &[String]) -> StorageResult<()> {
        self.data.delete_blobs_ignoring_if_not_exists(names)?;
        self.metadata.delete_blobs_ignoring_if_not_exists(names)
    }

    fn delete(&self) -> StorageResult<DeleteResult> {
        let deleted = self.data.delete()?;
        let metadata_deleted = self.metadata.delete()?;
        tracing::debug!(
            path = %self.path,
            blobs = deleted.blobs_deleted,
            metadata_blobs = metadata_deleted.blobs_deleted,
            "deleted encrypted container"
        );
        Ok(deleted.add(metadata_deleted))
    }
}

/// Plaintext view of a stored blob. Crypto failures come out as
/// [`StorageError::Crypto`] naming the blob, wrapped in the `io::Error`.
struct DecryptedBlob {
    name: String,
    inner: DecryptionPacketsStream<BlobStream>,
}

impl DecryptedBlob {
    fn annotate(&self, err: io::Error) -> io::Error {
        match CryptoError::from_io(&err) {
            Some(_) => StorageError::from_stream(&self.name, err).into(),
            None => err,
        }
    }
}

impl Read for DecryptedBlob {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf).map_err(|e| self.annotate(e))
    }
}

impl InputStream for DecryptedBlob {
    fn skip(&mut self, n: u64) -> io::Result<u64> {
        self.inner.skip(n).map_err(|e| self.annotate(e))
    }

    fn available(&self) -> io::Result<u64> {
        self.inner.available()
    }

    fn mark_supported(&self) -> bool {
        self.inner.mark_supported()
    }

    fn mark(&mut self, read_limit: usize) {
        self.inner.mark(read_limit)
    }

    fn reset(&mut self) -> io::Result<()> {
        self.inner.reset().map_err(|e| self.annotate(e))
    }

    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}
