//! Per-packet AES-256-GCM
//!
//! Packet format (binary):
//! ```text
//! [N bytes: ciphertext][16 bytes: GCM tag]      N <= packet_length
//! IV = nonce (4 bytes, big-endian) || counter (8 bytes, big-endian, signed)
//! counter = PACKET_START_COUNTER + packet_index
//! ```
//!
//! The IV depends only on the blob's nonce and the packet index, so any packet
//! can be verified on its own given its position.

use std::io;

use aes_gcm::{
    aead::{AeadInPlace, KeyInit},
    Aes256Gcm, Nonce,
};

use crate::error::{CryptoError, CryptoResult, Latched};
use crate::metadata::BlobEncryptionMetadata;
use crate::stream::{read_fully, InputStream};

/// Size of a GCM authentication tag
pub const TAG_LENGTH: usize = 16;

/// Size of a GCM IV
pub const IV_LENGTH: usize = 12;

/// Counter value of the first packet of every blob.
pub const PACKET_START_COUNTER: i64 = i64::MIN;

/// Default plaintext packet length: 64 KiB
pub const DEFAULT_PACKET_LENGTH: u32 = 64 * 1024;

/// Upper bound on the packet length; a packet is held in memory whole.
pub const MAX_PACKET_LENGTH: u32 = 8 * 1024 * 1024;

/// Check a packet length and return it as a buffer size.
pub fn validate_packet_length(packet_length: u32) -> CryptoResult<usize> {
    if packet_length == 0 || packet_length > MAX_PACKET_LENGTH {
        return Err(CryptoError::InvalidPacketLength(packet_length));
    }
    Ok(packet_length as usize)
}

/// Derive the IV of packet `index` from the blob nonce.
pub fn packet_iv(nonce: i32, index: u64) -> CryptoResult<[u8; IV_LENGTH]> {
    let counter = i64::try_from(index)
        .ok()
        .and_then(|index| PACKET_START_COUNTER.checked_add(index))
        .ok_or(CryptoError::CounterExhausted)?;

    let mut iv = [0u8; IV_LENGTH];
    iv[..4].copy_from_slice(&nonce.to_be_bytes());
    iv[4..].copy_from_slice(&counter.to_be_bytes());
    Ok(iv)
}

/// Ciphertext size of a `plaintext_len` byte blob split into packets.
///
/// An empty blob still produces one (tag-only) packet.
pub fn encrypted_length(plaintext_len: u64, packet_length: u32) -> u64 {
    let packet_length = u64::from(packet_length.max(1));
    let full = plaintext_len / packet_length;
    let remainder = plaintext_len % packet_length;
    let tail = if remainder > 0 || plaintext_len == 0 {
        remainder + TAG_LENGTH as u64
    } else {
        0
    };
    full * (packet_length + TAG_LENGTH as u64) + tail
}

/// Plaintext size of a `ciphertext_len` byte blob; the inverse of [`encrypted_length`].
pub fn decrypted_length(ciphertext_len: u64, packet_length: u32) -> CryptoResult<u64> {
    validate_packet_length(packet_length)?;
    let tag = TAG_LENGTH as u64;
    let encrypted_packet = u64::from(packet_length) + tag;
    let full = ciphertext_len / encrypted_packet;
    let remainder = ciphertext_len % encrypted_packet;

    if ciphertext_len == 0 || (remainder > 0 && remainder < tag) {
        return Err(CryptoError::TruncatedPacket {
            packet: full,
            length: remainder as usize,
        });
    }
    if remainder == tag && full > 0 {
        // Only an empty blob ends with a tag-only packet.
        return Err(CryptoError::TruncatedPacket {
            packet: full,
            length: remainder as usize,
        });
    }
    Ok(full * u64::from(packet_length) + remainder.saturating_sub(tag))
}

/// AES-256-GCM keyed with a blob's data key and bound to its nonce.
pub struct PacketCipher {
    cipher: Aes256Gcm,
    nonce: i32,
}

impl PacketCipher {
    pub fn new(metadata: &BlobEncryptionMetadata) -> Self {
        Self {
            cipher: Aes256Gcm::new(metadata.data_encryption_key().into()),
            nonce: metadata.nonce(),
        }
    }

    /// Encrypt packet `index` in place: `buffer` holds the plaintext and
    /// ends up holding `ciphertext || tag`.
    pub fn seal(&self, index: u64, buffer: &mut Vec<u8>) -> CryptoResult<()> {
        let iv = packet_iv(self.nonce, index)?;
        self.cipher
            .encrypt_in_place(Nonce::from_slice(&iv), b"", buffer)
            .map_err(|_| CryptoError::Encryption { packet: index })
    }

    /// Verify and decrypt packet `index` in place. On failure the buffer
    /// content is unspecified and must not be used.
    pub fn open(&self, index: u64, buffer: &mut Vec<u8>) -> CryptoResult<()> {
        if buffer.len() < TAG_LENGTH {
            return Err(CryptoError::TruncatedPacket {
                packet: index,
                length: buffer.len(),
            });
        }
        let iv = packet_iv(self.nonce, index)?;
        self.cipher
            .decrypt_in_place(Nonce::from_slice(&iv), b"", buffer)
            .map_err(|_| CryptoError::Integrity { packet: index })
    }
}

impl std::fmt::Debug for PacketCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PacketCipher")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Source side shared by the packet generators: reads whole packets, tracks
/// the packet index across mark/reset, and remembers the first failure.
pub(crate) struct PacketSource<S> {
    source: S,
    next_index: u64,
    marked_index: u64,
    failure: Option<Latched>,
}

impl<S: InputStream> PacketSource<S> {
    pub(crate) fn new(source: S) -> Self {
        Self {
            source,
            next_index: 0,
            marked_index: 0,
            failure: None,
        }
    }

    pub(crate) fn next_index(&self) -> u64 {
        self.next_index
    }

    /// Run `produce` for the next packet. Once a packet failed, every later
    /// call fails the same way until the source is reset.
    pub(crate) fn produce<T>(
        &mut self,
        produce: impl FnOnce(&mut S, u64) -> io::Result<Option<T>>,
    ) -> io::Result<Option<T>> {
        if let Some(failure) = &self.failure {
            return Err(failure.to_io());
        }
        match produce(&mut self.source, self.next_index) {
            Ok(Some(packet)) => {
                self.next_index += 1;
                Ok(Some(packet))
            }
            Ok(None) => Ok(None),
            Err(e) => {
                self.failure = Some(Latched::capture(&e));
                Err(e)
            }
        }
    }

    pub(crate) fn mark_supported(&self) -> bool {
        self.source.mark_supported()
    }

    /// Mark the source at the current packet boundary. The chain may read
    /// ahead by one packet, hence `packet_length` extra.
    pub(crate) fn mark(&mut self, read_limit: usize, packet_length: usize) {
        self.source.mark(read_limit.saturating_add(packet_length));
        self.marked_index = self.next_index;
    }

    pub(crate) fn reset(&mut self) -> io::Result<()> {
        self.source.reset()?;
        self.next_index = self.marked_index;
        self.failure = None;
        Ok(())
    }

    pub(crate) fn close(&mut self) -> io::Result<()> {
        self.source.close()
    }
}

/// Read up to `length` bytes from `source` into a buffer with room for a tag.
pub(crate) fn read_packet<S: InputStream + ?Sized>(source: &mut S, length: usize) -> io::Result<Vec<u8>> {
    let mut buffer = vec![0u8; length];
    let n = read_fully(source, &mut buffer)?;
    buffer.truncate(n);
    buffer.reserve_exact(TAG_LENGTH);
    Ok(buffer)
}
