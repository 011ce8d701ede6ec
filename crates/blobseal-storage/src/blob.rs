//! Blob store abstraction: containers of named byte blobs addressed by path

use std::collections::BTreeMap;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use blobseal_crypto::InputStream;

use crate::error::{StorageError, StorageResult};

/// Stream returned by [`BlobContainer::read_blob`].
pub type BlobStream = Box<dyn InputStream + Send>;

/// Path of a container inside a store, as a list of segments.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlobPath {
    parts: Vec<String>,
}

impl BlobPath {
    pub fn root() -> Self {
        Self::default()
    }

    /// Parse a `/`-separated path. Empty segments are ignored.
    pub fn parse(path: &str) -> StorageResult<Self> {
        let mut parsed = Self::root();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            parsed = parsed.add(segment)?;
        }
        Ok(parsed)
    }

    /// Child path with one more segment.
    pub fn add(&self, segment: &str) -> StorageResult<Self> {
        validate_name(segment)?;
        let mut parts = self.parts.clone();
        parts.push(segment.to_string());
        Ok(Self { parts })
    }

    /// This path re-rooted under `prefix`.
    pub fn prepend(&self, prefix: &str) -> StorageResult<Self> {
        validate_name(prefix)?;
        Ok(self.under(prefix))
    }

    /// `prepend` for a prefix that has already been validated.
    pub(crate) fn under(&self, prefix: &str) -> Self {
        let mut parts = Vec::with_capacity(self.parts.len() + 1);
        parts.push(prefix.to_string());
        parts.extend(self.parts.iter().cloned());
        Self { parts }
    }

    pub fn parts(&self) -> &[String] {
        &self.parts
    }

    pub fn is_root(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn starts_with(&self, other: &BlobPath) -> bool {
        self.parts.starts_with(&other.parts)
    }

    /// Full display name of blob `name` inside this container.
    pub fn blob_name(&self, name: &str) -> String {
        if self.is_root() {
            format!("/{name}")
        } else {
            format!("{self}/{name}")
        }
    }
}

impl fmt::Display for BlobPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.parts.join("/"))
    }
}

/// Reject names that cannot be a single path segment.
pub fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains(['/', '\\', '\0']) {
        return Err(StorageError::InvalidName(name.to_string()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobMetadata {
    pub name: String,
    /// Stored length in bytes
    pub length: u64,
}

/// Totals reported by a recursive delete.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteResult {
    pub blobs_deleted: u64,
    pub bytes_deleted: u64,
}

impl DeleteResult {
    pub fn add(self, other: DeleteResult) -> Self {
        Self {
            blobs_deleted: self.blobs_deleted + other.blobs_deleted,
            bytes_deleted: self.bytes_deleted + other.bytes_deleted,
        }
    }
}

/// A directory-like collection of blobs.
pub trait BlobContainer: Send + Sync {
    fn path(&self) -> &BlobPath;

    /// Open a blob for streaming. Missing blobs give [`StorageError::NotFound`].
    fn read_blob(&self, name: &str) -> StorageResult<BlobStream>;

    /// Store `input` as blob `name`.
    ///
    /// `input` must yield exactly `declared_length` bytes, otherwise the write
    /// fails with [`StorageError::LengthMismatch`] and nothing is stored.
    fn write_blob(
        &self,
        name: &str,
        input: &mut dyn Read,
        declared_length: u64,
        fail_if_exists: bool,
    ) -> StorageResult<()>;

    fn blob_exists(&self, name: &str) -> StorageResult<bool>;

    /// Blobs directly inside this container, keyed by name.
    fn list_blobs(&self) -> StorageResult<BTreeMap<String, BlobMetadata>>;

    /// Non-empty sub-containers, keyed by segment name.
    fn children(&self) -> StorageResult<BTreeMap<String, Arc<dyn BlobContainer>>>;

    fn delete_blobs_ignoring_if_not_exists(&self, names: &[String]) -> StorageResult<()>;

    /// Delete this container and everything below it.
    fn delete(&self) -> StorageResult<DeleteResult>;
}

pub trait BlobStore: Send + Sync {
    fn blob_container(&self, path: &BlobPath) -> Arc<dyn BlobContainer>;
}

/// Copy `input` into memory, enforcing `declared_length`.
pub(crate) fn read_declared(
    name: &str,
    input: &mut dyn Read,
    declared_length: u64,
) -> StorageResult<Vec<u8>> {
    let mut data = Vec::with_capacity(declared_length.min(1 << 20) as usize);
    input
        .read_to_end(&mut data)
        .map_err(|e| StorageError::from_stream(name, e))?;
    check_length(name, declared_length, data.len() as u64)?;
    Ok(data)
}

pub(crate) fn check_length(name: &str, declared: u64, actual: u64) -> StorageResult<()> {
    if declared != actual {
        return Err(StorageError::LengthMismatch {
            name: name.to_string(),
            declared,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let path = BlobPath::parse("/indices//abc/0/").unwrap();
        assert_eq!(path.parts(), ["indices", "abc", "0"]);
        assert_eq!(path.to_string(), "/indices/abc/0");
        assert!(BlobPath::parse("").unwrap().is_root());
        assert_eq!(path.blob_name("b"), "/indices/abc/0/b");
        assert_eq!(BlobPath::root().blob_name("b"), "/b");
    }

    #[test]
    fn test_prepend() {
        let path = BlobPath::parse("a/b").unwrap();
        let meta = path.prepend("encryption-metadata").unwrap();
        assert_eq!(meta.parts(), ["encryption-metadata", "a", "b"]);
        assert!(meta.starts_with(&BlobPath::parse("encryption-metadata").unwrap()));
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", ".", "..", "a/b", "a\\b"] {
            assert!(
                matches!(validate_name(name), Err(StorageError::InvalidName(_))),
                "{name:?} should be rejected"
            );
        }
        assert!(validate_name("snap-0.dat").is_ok());
    }

    #[test]
    fn test_read_declared_length() {
        let data = b"hello world".to_vec();
        assert_eq!(read_declared("x", &mut &data[..], 11).unwrap(), data);

        let err = read_declared("x", &mut &data[..], 5).unwrap_err();
        assert!(matches!(err, StorageError::LengthMismatch { declared: 5, actual: 11, .. }));

        let err = read_declared("x", &mut &data[..], 20).unwrap_err();
        assert!(matches!(err, StorageError::LengthMismatch { declared: 20, actual: 11, .. }));
    }
}
