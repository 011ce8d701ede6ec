//! Key hierarchy: repository key → metadata key, metadata sealing
//!
//! Sealed metadata format (binary):
//! ```text
//! [24 bytes: random nonce][record ciphertext][16 bytes: Poly1305 tag]
//! ```

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    XChaCha20Poly1305, XNonce,
};
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::kdf::RepositoryKey;
use crate::metadata::{BlobEncryptionMetadata, METADATA_RECORD_LENGTH};
use crate::{KEY_SIZE, NONCE_SIZE};

const POLY1305_TAG_SIZE: usize = 16;

/// Length of a sealed metadata blob.
pub const SEALED_METADATA_LENGTH: usize =
    NONCE_SIZE + METADATA_RECORD_LENGTH + POLY1305_TAG_SIZE;

/// Key that seals blob encryption metadata. Zeroized on drop.
#[derive(Clone)]
pub struct MetadataKey {
    bytes: [u8; KEY_SIZE],
}

impl MetadataKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MetadataKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MetadataKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Derive the metadata key from the repository key via HKDF-SHA256.
pub fn derive_metadata_key(repository: &RepositoryKey) -> CryptoResult<MetadataKey> {
    hkdf_derive(repository.as_bytes(), b"blobseal-metadata").map(MetadataKey::from_bytes)
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> CryptoResult<[u8; KEY_SIZE]> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CryptoError::Kdf(format!("HKDF expand failed: {e}")))?;
    Ok(okm)
}

/// Seal a metadata record with XChaCha20-Poly1305 under a random nonce.
pub fn seal_metadata(key: &MetadataKey, metadata: &BlobEncryptionMetadata) -> CryptoResult<Vec<u8>> {
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);
    let nonce = XNonce::from_slice(&nonce_bytes);

    let mut record = metadata.to_bytes();
    let sealed = cipher.encrypt(nonce, record.as_ref());
    record.zeroize();
    let ciphertext =
        sealed.map_err(|_| CryptoError::MalformedMetadata("metadata sealing failed".into()))?;

    let mut result = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
    result.extend_from_slice(&nonce_bytes);
    result.extend_from_slice(&ciphertext);
    Ok(result)
}

/// Open sealed metadata (output of [`seal_metadata`]).
///
/// A tag mismatch means the metadata was sealed under another key, which in
/// practice means a different repository password.
pub fn open_metadata(key: &MetadataKey, sealed: &[u8]) -> CryptoResult<BlobEncryptionMetadata> {
    if sealed.len() != SEALED_METADATA_LENGTH {
        return Err(CryptoError::MalformedMetadata(format!(
            "sealed metadata is {} bytes, expected {SEALED_METADATA_LENGTH}",
            sealed.len()
        )));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_SIZE);
    let nonce = XNonce::from_slice(nonce_bytes);
    let cipher = XChaCha20Poly1305::new(key.as_bytes().into());

    let mut record = cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| CryptoError::MetadataAuthentication)?;
    let metadata = BlobEncryptionMetadata::from_bytes(&record);
    record.zeroize();
    metadata
}
