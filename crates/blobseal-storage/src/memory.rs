//! In-memory blob store, used by tests and dry runs.

use std::collections::BTreeMap;
use std::io::Read;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use blobseal_crypto::BytesStream;

use crate::blob::{
    read_declared, validate_name, BlobContainer, BlobMetadata, BlobPath, BlobStore, BlobStream,
    DeleteResult,
};
use crate::error::{StorageError, StorageResult};

type Blobs = BTreeMap<BlobPath, BTreeMap<String, Arc<[u8]>>>;

/// Blob store keeping every container in one shared map.
///
/// Containers exist implicitly: a container with no blobs anywhere below it
/// is not listed as a child.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlobStore {
    blobs: Arc<RwLock<Blobs>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blobs across all containers.
    pub fn blob_count(&self) -> usize {
        read_lock(&self.blobs).values().map(BTreeMap::len).sum()
    }
}

impl BlobStore for MemoryBlobStore {
    fn blob_container(&self, path: &BlobPath) -> Arc<dyn BlobContainer> {
        Arc::new(MemoryBlobContainer {
            path: path.clone(),
            blobs: self.blobs.clone(),
        })
    }
}

// A panic while holding the lock cannot leave the map half-updated: every
// mutation is a single insert or remove.
fn read_lock(blobs: &RwLock<Blobs>) -> RwLockReadGuard<'_, Blobs> {
    blobs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write_lock(blobs: &RwLock<Blobs>) -> RwLockWriteGuard<'_, Blobs> {
    blobs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct MemoryBlobContainer {
    path: BlobPath,
    blobs: Arc<RwLock<Blobs>>,
}

impl BlobContainer for MemoryBlobContainer {
    fn path(&self) -> &BlobPath {
        &self.path
    }

    fn read_blob(&self, name: &str) -> StorageResult<BlobStream> {
        let blobs = read_lock(&self.blobs);
        let data = blobs
            .get(&self.path)
            .and_then(|container| container.get(name))
            .ok_or_else(|| StorageError::NotFound(self.path.blob_name(name)))?;
        Ok(Box::new(BytesStream::new(data.clone())))
    }

    fn write_blob(
        &self,
        name: &str,
        input: &mut dyn Read,
        declared_length: u64,
        fail_if_exists: bool,
    ) -> StorageResult<()> {
        validate_name(name)?;
        if fail_if_exists && self.blob_exists(name)? {
            return Err(StorageError::AlreadyExists(self.path.blob_name(name)));
        }
        // Read outside the lock; the input may be an arbitrarily slow stream.
        let data = read_declared(name, input, declared_length)?;

        let mut blobs = write_lock(&self.blobs);
        let container = blobs.entry(self.path.clone()).or_default();
        if fail_if_exists && container.contains_key(name) {
            return Err(StorageError::AlreadyExists(self.path.blob_name(name)));
        }
        container.insert(name.to_string(), Arc::from(data));
        Ok(())
    }

    fn blob_exists(&self, name: &str) -> StorageResult<bool> {
        Ok(read_lock(&self.blobs)
            .get(&self.path)
            .is_some_and(|container| container.contains_key(name)))
    }

    fn list_blobs(&self) -> StorageResult<BTreeMap<String, BlobMetadata>> {
        let blobs = read_lock(&self.blobs);
        let listed = blobs
            .get(&self.path)
            .map(|container| {
                container
                    .iter()
                    .map(|(name, data)| {
                        let metadata = BlobMetadata {
                            name: name.clone(),
                            length: data.len() as u64,
                        };
                        (name.clone(), metadata)
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(listed)
    }

    fn children(&self) -> StorageResult<BTreeMap<String, Arc<dyn BlobContainer>>> {
        let blobs = read_lock(&self.blobs);
        let depth = self.path.parts().len();
        let mut children: BTreeMap<String, Arc<dyn BlobContainer>> = BTreeMap::new();
        for (path, container) in blobs.iter() {
            if container.is_empty() || path.parts().len() <= depth || !path.starts_with(&self.path)
            {
                continue;
            }
            let segment = &path.parts()[depth];
            if children.contains_key(segment) {
                continue;
            }
            let child: Arc<dyn BlobContainer> = Arc::new(MemoryBlobContainer {
                path: self.path.add(segment)?,
                blobs: self.blobs.clone(),
            });
            children.insert(segment.clone(), child);
        }
        Ok(children)
    }

    fn delete_blobs_ignoring_if_not_exists(&self, names: &[String]) -> StorageResult<()> {
        let mut blobs = write_lock(&self.blobs);
        if let Some(container) = blobs.get_mut(&self.path) {
            for name in names {
                container.remove(name);
            }
            if container.is_empty() {
                blobs.remove(&self.path);
            }
        }
        Ok(())
    }

    fn delete(&self) -> StorageResult<DeleteResult> {
        let mut blobs = write_lock(&self.blobs);
        let mut result = DeleteResult::default();
        blobs.retain(|path, container| {
            if !path.starts_with(&self.path) {
                return true;
            }
            result.blobs_deleted += container.len() as u64;
            result.bytes_deleted += container.values().map(|d| d.len() as u64).sum::<u64>();
            false
        });
        Ok(result)
    }
}
