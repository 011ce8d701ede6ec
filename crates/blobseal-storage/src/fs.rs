//! Filesystem blob store: containers are directories, blobs are files.
//!
//! Writes go to a temporary file in the target directory and are renamed
//! into place once the declared length has been checked, so readers never
//! see a partial blob.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use blobseal_crypto::ReadStream;

use crate::blob::{
    check_length, validate_name, BlobContainer, BlobMetadata, BlobPath, BlobStore, BlobStream,
    DeleteResult,
};
use crate::error::{StorageError, StorageResult};

/// Prefix of in-flight temporary files; hidden from listings.
const TEMP_PREFIX: &str = ".blobseal-tmp-";

#[derive(Debug, Clone)]
pub struct FsBlobStore {
    root: PathBuf,
}

impl FsBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl BlobStore for FsBlobStore {
    fn blob_container(&self, path: &BlobPath) -> Arc<dyn BlobContainer> {
        let dir = path.parts().iter().fold(self.root.clone(), |dir, part| dir.join(part));
        Arc::new(FsBlobContainer {
            path: path.clone(),
            dir,
        })
    }
}

#[derive(Debug)]
struct FsBlobContainer {
    path: BlobPath,
    dir: PathBuf,
}

impl FsBlobContainer {
    fn blob_path(&self, name: &str) -> StorageResult<PathBuf> {
        validate_name(name)?;
        Ok(self.dir.join(name))
    }

    fn display(&self, name: &str) -> String {
        self.path.blob_name(name)
    }

    /// Directory entries, or nothing if the directory does not exist.
    fn entries(&self) -> StorageResult<Vec<fs::DirEntry>> {
        match fs::read_dir(&self.dir) {
            Ok(entries) => Ok(entries.collect::<io::Result<Vec<_>>>()?),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }
}

fn is_hidden(name: &str) -> bool {
    name.starts_with(TEMP_PREFIX)
}

impl BlobContainer for FsBlobContainer {
    fn path(&self) -> &BlobPath {
        &self.path
    }

    fn read_blob(&self, name: &str) -> StorageResult<BlobStream> {
        let file = match File::open(self.blob_path(name)?) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StorageError::NotFound(self.display(name)))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(Box::new(ReadStream::new(BufReader::new(file))))
    }

    fn write_blob(
        &self,
        name: &str,
        input: &mut dyn Read,
        declared_length: u64,
        fail_if_exists: bool,
    ) -> StorageResult<()> {
        let target = self.blob_path(name)?;
        if fail_if_exists && target.exists() {
            return Err(StorageError::AlreadyExists(self.display(name)));
        }
        fs::create_dir_all(&self.dir)?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(&self.dir)?;
        let written =
            io::copy(input, temp.as_file_mut()).map_err(|e| StorageError::from_stream(name, e))?;
        check_length(name, declared_length, written)?;
        temp.as_file().sync_all()?;

        let persisted = if fail_if_exists {
            temp.persist_noclobber(&target)
        } else {
            temp.persist(&target)
        };
        match persisted {
            Ok(_) => Ok(()),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                Err(StorageError::AlreadyExists(self.display(name)))
            }
            Err(e) => Err(e.error.into()),
        }
    }

    fn blob_exists(&self, name: &str) -> StorageResult<bool> {
        Ok(self.blob_path(name)?.is_file())
    }

    fn list_blobs(&self) -> StorageResult<BTreeMap<String, BlobMetadata>> {
        let mut blobs = BTreeMap::new();
        for entry in self.entries()? {
            let metadata = entry.metadata()?;
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !metadata.is_file() || is_hidden(&name) {
                continue;
            }
            let length = metadata.len();
            blobs.insert(name.clone(), BlobMetadata { name, length });
        }
        Ok(blobs)
    }

    fn children(&self) -> StorageResult<BTreeMap<String, Arc<dyn BlobContainer>>> {
        let mut children: BTreeMap<String, Arc<dyn BlobContainer>> = BTreeMap::new();
        for entry in self.entries()? {
            let Ok(name) = entry.file_name().into_string() else {
                continue;
            };
            if !entry.file_type()?.is_dir() || validate_name(&name).is_err() {
                continue;
            }
            let child = FsBlobContainer {
                path: self.path.add(&name)?,
                dir: entry.path(),
            };
            children.insert(name, Arc::new(child));
        }
        Ok(children)
    }

    fn delete_blobs_ignoring_if_not_exists(&self, names: &[String]) -> StorageResult<()> {
        for name in names {
            match fs::remove_file(self.blob_path(name)?) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn delete(&self) -> StorageResult<DeleteResult> {
        if !self.dir.exists() {
            return Ok(DeleteResult::default());
        }
        let result = tally(&self.dir)?;
        fs::remove_dir_all(&self.dir)?;
        tracing::debug!(
            path = %self.path,
            blobs = result.blobs_deleted,
            bytes = result.bytes_deleted,
            "deleted container"
        );
        Ok(result)
    }
}

fn tally(dir: &Path) -> io::Result<DeleteResult> {
    let mut result = DeleteResult::default();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            result = result.add(tally(&entry.path())?);
        } else if file_type.is_file() {
            result.blobs_deleted += 1;
            result.bytes_deleted += entry.metadata()?.len();
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, FsBlobStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsBlobStore::new(dir.path());
        (dir, store)
    }

    #[test]
    fn test_write_creates_directories() {
        let (dir, store) = store();
        let container = store.blob_container(&BlobPath::parse("a/b").unwrap());
        container
            .write_blob("blob", &mut &b"payload"[..], 7, true)
            .unwrap();

        assert_eq!(fs::read(dir.path().join("a/b/blob")).unwrap(), b"payload");
        let mut out = Vec::new();
        container.read_blob("blob").unwrap().read_to_end(&mut out).unwrap();
        assert_eq!(out, b"payload");
    }

    #[test]
    fn test_length_mismatch_leaves_no_file() {
        let (dir, store) = store();
        let container = store.blob_container(&BlobPath::root());
        let err = container
            .write_blob("blob", &mut &b"payload"[..], 8, false)
            .unwrap_err();
        assert!(matches!(err, StorageError::LengthMismatch { declared: 8, actual: 7, .. }));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0, "temp file cleaned up");
    }

    #[test]
    fn test_fail_if_exists() {
        let (_dir, store) = store();
        let container = store.blob_container(&BlobPath::root());
        container.write_blob("blob", &mut &b"v1"[..], 2, true).unwrap();
        let err = container.write_blob("blob", &mut &b"v2"[..], 2, true).unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists(_)));
        container.write_blob("blob", &mut &b"v3"[..], 2, false).unwrap();
        assert_eq!(container.list_blobs().unwrap()["blob"].length, 2);
    }

    #[test]
    fn test_missing_container_is_empty() {
        let (_dir, store) = store();
        let container = store.blob_container(&BlobPath::parse("never/written").unwrap());
        assert!(container.list_blobs().unwrap().is_empty());
        assert!(container.children().unwrap().is_empty());
        assert_eq!(container.delete().unwrap(), DeleteResult::default());
        assert!(matches!(container.read_blob("x"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn test_children_and_recursive_delete() {
        let (dir, store) = store();
        for (path, name, data) in [("x", "a", &b"123"[..]), ("x/y", "b", &b"4567"[..]), ("z", "c", &b"8"[..])] {
            store
                .blob_container(&BlobPath::parse(path).unwrap())
                .write_blob(name, &mut &data[..], data.len() as u64, true)
                .unwrap();
        }
        let root = store.blob_container(&BlobPath::root());
        let children = root.children().unwrap();
        assert_eq!(children.keys().collect::<Vec<_>>(), ["x", "z"]);
        assert_eq!(children["x"].path(), &BlobPath::parse("x").unwrap());

        let result = children["x"].delete().unwrap();
        assert_eq!(result, DeleteResult { blobs_deleted: 2, bytes_deleted: 7 });
        assert!(!dir.path().join("x").exists());
    }

    #[test]
    fn test_delete_blobs_ignoring_missing() {
        let (_dir, store) = store();
        let container = store.blob_container(&BlobPath::root());
        container.write_blob("a", &mut &b"1"[..], 1, true).unwrap();
        container
            .delete_blobs_ignoring_if_not_exists(&["a".into(), "b".into()])
            .unwrap();
        assert!(!container.blob_exists("a").unwrap());
    }
}
