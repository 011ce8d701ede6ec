use std::io;

use blobseal_crypto::CryptoError;
use thiserror::Error;

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("blob not found: {0}")]
    NotFound(String),

    #[error("blob already exists: {0}")]
    AlreadyExists(String),

    #[error("blob {name}: declared length {declared} but the input held {actual} bytes")]
    LengthMismatch {
        name: String,
        declared: u64,
        actual: u64,
    },

    #[error("encryption metadata missing for blob {0}")]
    MissingMetadata(String),

    #[error("blob {name}: {source}")]
    Crypto { name: String, source: CryptoError },

    #[error("encrypted store setup failed: {0}")]
    Setup(#[source] CryptoError),

    #[error("invalid blob name: {0:?}")]
    InvalidName(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl StorageError {
    /// Attach `name` to a stream failure, keeping crypto failures typed.
    pub fn from_stream(name: &str, err: io::Error) -> Self {
        match CryptoError::from_io(&err) {
            Some(crypto) => Self::Crypto {
                name: name.to_string(),
                source: crypto.clone(),
            },
            None => Self::Io(err),
        }
    }

    /// Recover a `StorageError` carried inside an `io::Error`.
    pub fn from_io(err: &io::Error) -> Option<&StorageError> {
        err.get_ref().and_then(|inner| inner.downcast_ref::<StorageError>())
    }

    /// The crypto failure behind this error, if any.
    pub fn crypto(&self) -> Option<&CryptoError> {
        match self {
            Self::Crypto { source, .. } | Self::Setup(source) => Some(source),
            Self::Io(err) => CryptoError::from_io(err),
            _ => None,
        }
    }
}

impl From<StorageError> for io::Error {
    fn from(err: StorageError) -> Self {
        if let StorageError::Io(err) = err {
            return err;
        }
        let kind = match &err {
            StorageError::NotFound(_) => io::ErrorKind::NotFound,
            StorageError::AlreadyExists(_) => io::ErrorKind::AlreadyExists,
            StorageError::Crypto { source, .. } if source.is_integrity() => {
                io::ErrorKind::InvalidData
            }
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_stream_keeps_crypto_error() {
        let io_err: io::Error = CryptoError::Integrity { packet: 7 }.into();
        let err = StorageError::from_stream("snap-1", io_err);
        assert!(matches!(
            &err,
            StorageError::Crypto { name, source: CryptoError::Integrity { packet: 7 } } if name == "snap-1"
        ));
        assert!(err.to_string().contains("snap-1"));
    }

    #[test]
    fn test_from_stream_plain_io() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        let err = StorageError::from_stream("snap-1", io_err);
        assert!(matches!(err, StorageError::Io(ref e) if e.kind() == io::ErrorKind::BrokenPipe));
        assert!(err.crypto().is_none());
    }

    #[test]
    fn test_into_io_error_kinds() {
        let err: io::Error = StorageError::Crypto {
            name: "a".into(),
            source: CryptoError::TruncatedPacket { packet: 0, length: 3 },
        }
        .into();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err: io::Error = StorageError::NotFound("a".into()).into();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
