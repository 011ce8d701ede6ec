//! blobseal-storage: blob containers and the encrypting store decorator
//!
//! A [`BlobStore`] hands out [`BlobContainer`]s addressed by [`BlobPath`].
//! [`EncryptedBlobStore`] wraps any store: data blobs are written as packet
//! ciphertext and each one gets a sealed metadata blob under a sibling
//! prefix tree.

pub mod blob;
pub mod encrypted;
pub mod error;
pub mod fs;
pub mod memory;

pub use blob::{BlobContainer, BlobMetadata, BlobPath, BlobStore, BlobStream, DeleteResult};
pub use encrypted::{
    CleanupSummary, EncryptedBlobContainer, EncryptedBlobStore, DEFAULT_METADATA_PREFIX,
};
pub use error::{StorageError, StorageResult};
pub use fs::FsBlobStore;
pub use memory::MemoryBlobStore;
