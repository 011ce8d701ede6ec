//! blobseal-crypto: streaming packetized encryption for stored blobs
//!
//! Pipeline: plaintext → fixed-size packets → AES-256-GCM per packet → ciphertext stream
//!
//! Key hierarchy:
//! ```text
//! Repository Key (256-bit, Argon2id from the repository password)
//!   └── Metadata Key (HKDF from repository key, domain="blobseal-metadata")
//!       └── sealed BlobEncryptionMetadata (XChaCha20-Poly1305), one per blob:
//!           └── Data Key (per-blob, 256-bit random) + nonce + packet length
//!               └── Packet AEAD: AES-256-GCM (IV = nonce || counter)
//! ```
//!
//! Streams are pull-based and synchronous: every `read` does bounded work on
//! the underlying source and holds at most one packet in memory.

pub mod chain;
pub mod decrypt;
pub mod encrypt;
pub mod error;
pub mod kdf;
pub mod keys;
pub mod metadata;
pub mod packet;
pub mod stream;

pub use chain::{ChainElements, ChainingInputStream};
pub use decrypt::{decryption_stream, DecryptionPacketsStream};
pub use encrypt::{encryption_stream, EncryptionPacketsStream};
pub use error::{CryptoError, CryptoResult};
pub use kdf::{derive_repository_key, repository_salt, KdfParams, RepositoryKey, SALT_SIZE};
pub use keys::{derive_metadata_key, open_metadata, seal_metadata, MetadataKey};
pub use metadata::BlobEncryptionMetadata;
pub use packet::{decrypted_length, encrypted_length, DEFAULT_PACKET_LENGTH, TAG_LENGTH};
pub use stream::{BytesStream, InputStream, ReadStream};

/// Size of a symmetric key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

