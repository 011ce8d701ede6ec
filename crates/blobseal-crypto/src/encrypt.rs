//! Encryption stream: plaintext in, authenticated ciphertext packets out
//!
//! The plaintext source is cut into `packet_length` byte packets, each sealed
//! with its own IV (see [`crate::packet`]). Only one packet is held in memory
//! at a time. The output length is known up front via
//! [`crate::packet::encrypted_length`].

use std::io;

use crate::chain::{ChainElements, ChainingInputStream};
use crate::metadata::BlobEncryptionMetadata;
use crate::packet::{read_packet, PacketCipher, PacketSource};
use crate::stream::{BytesStream, InputStream};

/// Ciphertext stream over a plaintext source.
pub type EncryptionPacketsStream<S> = ChainingInputStream<EncryptionPackets<S>>;

/// Encrypt `source` under `metadata`.
///
/// Mark/reset is supported when `source` supports it.
pub fn encryption_stream<S: InputStream>(
    source: S,
    metadata: &BlobEncryptionMetadata,
) -> EncryptionPacketsStream<S> {
    ChainingInputStream::new(EncryptionPackets::new(source, metadata))
}

/// Generates one sealed packet per `packet_length` bytes of plaintext.
pub struct EncryptionPackets<S> {
    source: PacketSource<S>,
    cipher: PacketCipher,
    packet_length: usize,
}

impl<S: InputStream> EncryptionPackets<S> {
    pub fn new(source: S, metadata: &BlobEncryptionMetadata) -> Self {
        Self {
            source: PacketSource::new(source),
            cipher: PacketCipher::new(metadata),
            packet_length: metadata.packet_length() as usize,
        }
    }

    /// Number of packets produced so far.
    pub fn packets(&self) -> u64 {
        self.source.next_index()
    }
}

impl<S: InputStream> ChainElements for EncryptionPackets<S> {
    type Element = BytesStream<Vec<u8>>;

    const DRAIN_ON_CLOSE: bool = false;

    fn next_element(
        &mut self,
        previous: Option<&Self::Element>,
    ) -> io::Result<Option<Self::Element>> {
        let first = previous.is_none();
        let cipher = &self.cipher;
        let packet_length = self.packet_length;
        self.source.produce(|source, index| {
            let mut packet = read_packet(source, packet_length)?;
            if packet.is_empty() && !first {
                return Ok(None);
            }
            cipher.seal(index, &mut packet)?;
            Ok(Some(BytesStream::new(packet)))
        })
    }

    fn mark_supported(&self) -> bool {
        self.source.mark_supported()
    }

    fn on_mark(&mut self, read_limit: usize) {
        self.source.mark(read_limit, self.packet_length);
    }

    fn on_reset(&mut self) -> io::Result<()> {
        self.source.reset()
    }

    fn on_close(&mut self) -> io::Result<()> {
        self.source.close()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Read;

    use super::*;
    use crate::packet::{encrypted_length, TAG_LENGTH};
    use crate::stream::ReadStream;

    fn test_metadata(packet_length: u32) -> BlobEncryptionMetadata {
        BlobEncryptionMetadata::from_parts([0x11; 32], 1234, packet_length).unwrap()
    }

    fn encrypt(data: &[u8], packet_length: u32) -> Vec<u8> {
        let metadata = test_metadata(packet_length);
        let mut stream = encryption_stream(BytesStream::new(data), &metadata);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_empty_plaintext_is_one_tag() {
        assert_eq!(encrypt(b"", 32).len(), TAG_LENGTH);
    }

    #[test]
    fn test_output_matches_length_formula() {
        for len in [1usize, 31, 32, 33, 64, 100] {
            let data = vec![0x42u8; len];
            assert_eq!(
                encrypt(&data, 32).len() as u64,
                encrypted_length(len as u64, 32),
                "plaintext length {len}"
            );
        }
    }

    #[test]
    fn test_deterministic_for_fixed_metadata() {
        let data = vec![7u8; 100];
        assert_eq!(encrypt(&data, 32), encrypt(&data, 32));
    }

    #[test]
    fn test_packet_count() {
        let metadata = test_metadata(10);
        let mut stream = encryption_stream(BytesStream::new(vec![1u8; 35]), &metadata);
        let mut out = Vec::new();
        stream.read_to_end(&mut out).unwrap();
        assert_eq!(stream.elements().packets(), 4);
    }

    #[test]
    fn test_mark_reset_reproduces_ciphertext() {
        let data: Vec<u8> = (0..200u8).collect();
        let expected = encrypt(&data, 16);

        let metadata = test_metadata(16);
        let mut stream = encryption_stream(BytesStream::new(data), &metadata);
        assert!(stream.mark_supported());

        let mut head = vec![0u8; 45];
        stream.read_exact(&mut head).unwrap();
        stream.mark(100);
        let mut first = vec![0u8; 70];
        stream.read_exact(&mut first).unwrap();
        stream.reset().unwrap();
        let mut second = vec![0u8; 70];
        stream.read_exact(&mut second).unwrap();
        assert_eq!(first, second);

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        let mut all = head;
        all.extend_from_slice(&second);
        all.extend_from_slice(&rest);
        assert_eq!(all, expected);
    }

    #[test]
    fn test_reader_source_has_no_mark() {
        let metadata = test_metadata(16);
        let stream = encryption_stream(ReadStream::new(&b"plaintext"[..]), &metadata);
        assert!(!stream.mark_supported());
    }

    #[test]
    fn test_source_error_is_sticky() {
        struct Failing;
        impl Read for Failing {
            fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset by peer"))
            }
        }
        impl InputStream for Failing {}

        let metadata = test_metadata(16);
        let mut stream = encryption_stream(Failing, &metadata);
        let mut buf = [0u8; 8];
        assert_eq!(
            stream.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
        assert_eq!(
            stream.read(&mut buf).unwrap_err().kind(),
            io::ErrorKind::ConnectionReset
        );
    }

    #[test]
    fn test_close_closes_source() {
        let metadata = test_metadata(16);
        let mut stream = encryption_stream(ReadStream::new(&b"plaintext"[..]), &metadata);
        stream.close().unwrap();
        assert!(stream.is_closed());
        assert!(stream.read(&mut [0u8; 4]).is_err());
    }
}
