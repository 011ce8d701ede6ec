//! Decryption stream: ciphertext packets in, verified plaintext out
//!
//! Each packet is read whole and its tag verified before any of its plaintext
//! is handed out. A failed packet surfaces as [`CryptoError::Integrity`]
//! (inside the `io::Error`) and the stream keeps failing afterwards.

use std::io;

use crate::chain::{ChainElements, ChainingInputStream};
use crate::error::CryptoError;
use crate::metadata::BlobEncryptionMetadata;
use crate::packet::{read_packet, PacketCipher, PacketSource, TAG_LENGTH};
use crate::stream::{BytesStream, InputStream};

/// Plaintext stream over a ciphertext source.
pub type DecryptionPacketsStream<S> = ChainingInputStream<DecryptionPackets<S>>;

/// Decrypt `source` (produced by [`crate::encrypt::encryption_stream`]) under `metadata`.
pub fn decryption_stream<S: InputStream>(
    source: S,
    metadata: &BlobEncryptionMetadata,
) -> DecryptionPacketsStream<S> {
    ChainingInputStream::new(DecryptionPackets::new(source, metadata))
}

/// Generates one verified plaintext packet per ciphertext packet.
pub struct DecryptionPackets<S> {
    source: PacketSource<S>,
    cipher: PacketCipher,
    packet_length: usize,
}

impl<S: InputStream> DecryptionPackets<S> {
    pub fn new(source: S, metadata: &BlobEncryptionMetadata) -> Self {
        Self {
            source: PacketSource::new(source),
            cipher: PacketCipher::new(metadata),
            packet_length: metadata.packet_length() as usize,
        }
    }

    /// Number of packets verified so far.
    pub fn packets(&self) -> u64 {
        self.source.next_index()
    }
}

impl<S: InputStream> ChainElements for DecryptionPackets<S> {
    type Element = BytesStream<Vec<u8>>;

    const DRAIN_ON_CLOSE: bool = false;

    fn next_element(
        &mut self,
        previous: Option<&Self::Element>,
    ) -> io::Result<Option<Self::Element>> {
        let first = previous.is_none();
        let cipher = &self.cipher;
        let encrypted_packet_length = self.packet_length + TAG_LENGTH;
        self.source.produce(|source, index| {
            let mut packet = read_packet(source, encrypted_packet_length)?;
            if packet.is_empty() && !first {
                return Ok(None);
            }
            if packet.len() < TAG_LENGTH {
                return Err(CryptoError::TruncatedPacket {
                    packet: index,
                    length: packet.len(),
                }
                .into());
            }
            cipher.open(index, &mut packet)?;
            Ok(Some(BytesStream::new(packet)))
        })
    }

    fn mark_supported(&self) -> bool {
        self.source.mark_supported()
    }

    fn on_mark(&mut self, read_limit: usize) {
        self.source
            .mark(read_limit, self.packet_length + TAG_LENGTH);
    }

    fn on_reset(&mut self) -> io::Result<()> {
        self.source.reset()
    }

    fn on_close(&mut self) -> io::Result<()> {
        self.source.close()
    }
}
