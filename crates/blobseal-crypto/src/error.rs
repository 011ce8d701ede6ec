use std::io;

use thiserror::Error;

pub type CryptoResult<T> = Result<T, CryptoError>;

/// Errors raised by the packet codec, the packet streams and the metadata envelope.
///
/// Stream implementations report these through `std::io::Error` (kind
/// `InvalidData` for integrity failures, `Other` otherwise); use
/// [`CryptoError::from_io`] to recover the typed error.
#[derive(Debug, Clone, Error)]
pub enum CryptoError {
    #[error("packet {packet} failed authentication: ciphertext corrupted, or wrong key, nonce or packet length")]
    Integrity { packet: u64 },

    #[error("packet {packet} is truncated: {length} bytes is shorter than the authentication tag")]
    TruncatedPacket { packet: u64, length: usize },

    #[error("failed to decrypt blob encryption metadata: the repository password is likely wrong")]
    MetadataAuthentication,

    #[error("malformed blob encryption metadata: {0}")]
    MalformedMetadata(String),

    #[error("invalid packet length: {0}")]
    InvalidPacketLength(u32),

    #[error("packet counter exhausted")]
    CounterExhausted,

    #[error("packet {packet} encryption failed")]
    Encryption { packet: u64 },

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error("stream closed")]
    StreamClosed,
}

impl CryptoError {
    /// True for failures that mean the stored ciphertext cannot be trusted.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. } | Self::TruncatedPacket { .. })
    }

    /// Recover a `CryptoError` carried inside an `io::Error`.
    pub fn from_io(err: &io::Error) -> Option<&CryptoError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<CryptoError>())
    }
}

impl From<CryptoError> for io::Error {
    fn from(err: CryptoError) -> Self {
        let kind = if err.is_integrity() {
            io::ErrorKind::InvalidData
        } else {
            io::ErrorKind::Other
        };
        io::Error::new(kind, err)
    }
}

/// A failure remembered by a packet generator so that retries keep failing
/// instead of resuming at a misaligned position.
#[derive(Debug, Clone)]
pub(crate) enum Latched {
    Crypto(CryptoError),
    Io(io::ErrorKind, String),
}

impl Latched {
    pub(crate) fn capture(err: &io::Error) -> Self {
        match CryptoError::from_io(err) {
            Some(crypto) => Self::Crypto(crypto.clone()),
            None => Self::Io(err.kind(), err.to_string()),
        }
    }

    pub(crate) fn to_io(&self) -> io::Error {
        match self {
            Self::Crypto(err) => err.clone().into(),
            Self::Io(kind, message) => io::Error::new(*kind, message.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_roundtrip_keeps_variant() {
        let io_err: io::Error = CryptoError::Integrity { packet: 7 }.into();
        assert_eq!(io_err.kind(), io::ErrorKind::InvalidData);
        assert!(matches!(
            CryptoError::from_io(&io_err),
            Some(CryptoError::Integrity { packet: 7 })
        ));
    }

    #[test]
    fn test_latched_failure_replays() {
        let latched = Latched::capture(&CryptoError::Integrity { packet: 3 }.into());
        assert!(matches!(
            CryptoError::from_io(&latched.to_io()),
            Some(CryptoError::Integrity { packet: 3 })
        ));

        let latched = Latched::capture(&io::Error::new(io::ErrorKind::TimedOut, "timeout"));
        assert_eq!(latched.to_io().kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_plain_io_error_is_not_crypto() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "socket timeout");
        assert!(CryptoError::from_io(&io_err).is_none());
    }
}
