//! Blob encryption metadata record
//!
//! One record per stored blob, holding what the packet streams need:
//!
//! ```text
//! [4 bytes: key length, BE u32][key bytes][4 bytes: nonce, BE i32][4 bytes: packet length, BE u32]
//! ```
//!
//! The record is stored sealed (see [`crate::keys::seal_metadata`]) in a blob
//! next to the data blob.

use bytes::{Buf, BufMut};
use rand::RngCore;
use zeroize::Zeroize;

use crate::error::{CryptoError, CryptoResult};
use crate::packet::validate_packet_length;
use crate::KEY_SIZE;

/// Length of a serialized record.
pub const METADATA_RECORD_LENGTH: usize = 4 + KEY_SIZE + 4 + 4;

pub struct BlobEncryptionMetadata {
    data_encryption_key: [u8; KEY_SIZE],
    nonce: i32,
    packet_length: u32,
}

impl BlobEncryptionMetadata {
    /// Draw a fresh data key and nonce for a new blob.
    pub fn generate(packet_length: u32) -> CryptoResult<Self> {
        validate_packet_length(packet_length)?;
        let mut rng = rand::rngs::OsRng;
        let mut data_encryption_key = [0u8; KEY_SIZE];
        rng.fill_bytes(&mut data_encryption_key);
        Ok(Self {
            data_encryption_key,
            nonce: rng.next_u32() as i32,
            packet_length,
        })
    }

    /// Rebuild metadata from known parts (e.g. test vectors).
    pub fn from_parts(
        data_encryption_key: [u8; KEY_SIZE],
        nonce: i32,
        packet_length: u32,
    ) -> CryptoResult<Self> {
        validate_packet_length(packet_length)?;
        Ok(Self {
            data_encryption_key,
            nonce,
            packet_length,
        })
    }

    pub fn data_encryption_key(&self) -> &[u8; KEY_SIZE] {
        &self.data_encryption_key
    }

    pub fn nonce(&self) -> i32 {
        self.nonce
    }

    pub fn packet_length(&self) -> u32 {
        self.packet_length
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(METADATA_RECORD_LENGTH);
        out.put_u32(KEY_SIZE as u32);
        out.put_slice(&self.data_encryption_key);
        out.put_i32(self.nonce);
        out.put_u32(self.packet_length);
        out
    }

    pub fn from_bytes(data: &[u8]) -> CryptoResult<Self> {
        let mut buf = data;
        if buf.remaining() < 4 {
            return Err(malformed("record too short"));
        }
        let key_length = buf.get_u32() as usize;
        if key_length != KEY_SIZE {
            return Err(malformed(format!(
                "key length {key_length}, expected {KEY_SIZE}"
            )));
        }
        if buf.remaining() != KEY_SIZE + 8 {
            return Err(malformed(format!(
                "record is {} bytes, expected {METADATA_RECORD_LENGTH}",
                data.len()
            )));
        }
        let mut data_encryption_key = [0u8; KEY_SIZE];
        buf.copy_to_slice(&mut data_encryption_key);
        let nonce = buf.get_i32();
        let packet_length = buf.get_u32();
        if validate_packet_length(packet_length).is_err() {
            data_encryption_key.zeroize();
            return Err(malformed(format!("packet length {packet_length}")));
        }

        Ok(Self {
            data_encryption_key,
            nonce,
            packet_length,
        })
    }
}

fn malformed(reason: impl Into<String>) -> CryptoError {
    CryptoError::MalformedMetadata(reason.into())
}

impl Drop for BlobEncryptionMetadata {
    fn drop(&mut self) {
        self.data_encryption_key.zeroize();
    }
}

impl std::fmt::Debug for BlobEncryptionMetadata {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobEncryptionMetadata")
            .field("data_encryption_key", &"[REDACTED]")
            .field("nonce", &self.nonce)
            .field("packet_length", &self.packet_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_layout() {
        let metadata = BlobEncryptionMetadata::from_parts([0xAB; KEY_SIZE], -2, 65_536).unwrap();
        let bytes = metadata.to_bytes();

        assert_eq!(bytes.len(), METADATA_RECORD_LENGTH);
        assert_eq!(&bytes[..4], &[0, 0, 0, 32]);
        assert_eq!(&bytes[4..36], &[0xAB; 32]);
        assert_eq!(&bytes[36..40], &[0xFF, 0xFF, 0xFF, 0xFE]);
        assert_eq!(&bytes[40..], &[0, 1, 0, 0]);

        let restored = BlobEncryptionMetadata::from_bytes(&bytes).unwrap();
        assert_eq!(restored.data_encryption_key(), metadata.data_encryption_key());
        assert_eq!(restored.nonce(), -2);
        assert_eq!(restored.packet_length(), 65_536);
        assert_eq!(restored.to_bytes(), bytes);
    }

    #[test]
    fn test_generate_is_fresh() {
        let a = BlobEncryptionMetadata::generate(1024).unwrap();
        let b = BlobEncryptionMetadata::generate(1024).unwrap();
        assert_ne!(a.data_encryption_key(), b.data_encryption_key());
        assert_eq!(a.packet_length(), 1024);
    }

    #[test]
    fn test_generate_rejects_zero_packet_length() {
        assert!(matches!(
            BlobEncryptionMetadata::generate(0),
            Err(CryptoError::InvalidPacketLength(0))
        ));
    }

    #[test]
    fn test_from_bytes_rejects_malformed() {
        let good = BlobEncryptionMetadata::from_parts([1; KEY_SIZE], 5, 64)
            .unwrap()
            .to_bytes();

        assert!(BlobEncryptionMetadata::from_bytes(&[]).is_err());
        assert!(BlobEncryptionMetadata::from_bytes(&good[..good.len() - 1]).is_err());

        let mut trailing = good.clone();
        trailing.push(0);
        assert!(BlobEncryptionMetadata::from_bytes(&trailing).is_err());

        let mut wrong_key_len = good.clone();
        wrong_key_len[3] = 16;
        assert!(BlobEncryptionMetadata::from_bytes(&wrong_key_len).is_err());

        let mut zero_packet = good;
        zero_packet[40..].copy_from_slice(&[0; 4]);
        assert!(matches!(
            BlobEncryptionMetadata::from_bytes(&zero_packet),
            Err(CryptoError::MalformedMetadata(_))
        ));
    }

    #[test]
    fn test_debug_redacts_key() {
        let metadata = BlobEncryptionMetadata::from_parts([0x5A; KEY_SIZE], 1, 64).unwrap();
        let debug = format!("{metadata:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("90"), "key byte 0x5A must not appear");
    }
}
