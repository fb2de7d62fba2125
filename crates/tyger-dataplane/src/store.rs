//! `ObjectStore`: the seam between the Data-Plane Client and the real
//! object store (out of scope, spec §2's Non-goal). Two in-workspace
//! implementations back it — in-memory (tests) and local filesystem
//! (spec §6's single-box developer mode).

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use tyger_types::{ErrorKind, TygerError};

/// Outcome of a conditional-create write (spec §4.7's idempotence rule).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    /// The blob already existed with a matching MD5 — treated as success.
    AlreadyExists,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Conditional-create write: if `blob_name` already exists, succeeds
    /// only when its stored MD5 matches `content_md5` (idempotent retry of
    /// the same block); otherwise fails with `ErrorKind::Conflict`.
    async fn put_block(
        &self,
        container: &str,
        blob_name: &str,
        data: Bytes,
        content_md5: [u8; 16],
    ) -> Result<PutOutcome, TygerError>;

    async fn get_block(&self, container: &str, blob_name: &str) -> Result<(Bytes, [u8; 16]), TygerError>;

    /// Blob names directly under `container` starting with `prefix`, used
    /// to probe for the `_end_<N>` terminator.
    async fn list_blob_names(&self, container: &str, prefix: &str) -> Result<Vec<String>, TygerError>;
}

#[derive(Default)]
pub struct InMemoryObjectStore {
    containers: parking_lot::Mutex<HashMap<String, HashMap<String, (Bytes, [u8; 16])>>>,
}

#[async_trait]
impl ObjectStore for InMemoryObjectStore {
    async fn put_block(
        &self,
        container: &str,
        blob_name: &str,
        data: Bytes,
        content_md5: [u8; 16],
    ) -> Result<PutOutcome, TygerError> {
        let mut containers = self.containers.lock();
        let blobs = containers.entry(container.to_string()).or_default();
        match blobs.get(blob_name) {
            Some((_, existing_md5)) if *existing_md5 == content_md5 => Ok(PutOutcome::AlreadyExists),
            Some(_) => Err(TygerError::new(
                ErrorKind::Conflict,
                format!("blob `{blob_name}` already exists with a different hash"),
            )),
            None => {
                blobs.insert(blob_name.to_string(), (data, content_md5));
                Ok(PutOutcome::Created)
            }
        }
    }

    async fn get_block(&self, container: &str, blob_name: &str) -> Result<(Bytes, [u8; 16]), TygerError> {
        let containers = self.containers.lock();
        containers
            .get(container)
            .and_then(|blobs| blobs.get(blob_name))
            .cloned()
            .ok_or_else(|| TygerError::not_found(format!("blob `{container}/{blob_name}`")))
    }

    async fn list_blob_names(&self, container: &str, prefix: &str) -> Result<Vec<String>, TygerError> {
        let containers = self.containers.lock();
        Ok(containers
            .get(container)
            .map(|blobs| {
                blobs
                    .keys()
                    .filter(|name| name.starts_with(prefix))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

#[async_trait]
impl tyger_buffers::BufferStore for InMemoryObjectStore {
    async fn delete_buffers(&self, ids: &[String]) -> Result<(), TygerError> {
        let mut containers = self.containers.lock();
        for id in ids {
            containers.remove(id);
        }
        Ok(())
    }
}

/// Local-filesystem object store: one directory per container, one file
/// per blob, content-MD5 recorded in a sibling `.md5` file.
pub struct LocalFilesystemObjectStore {
    base_dir: PathBuf,
}

impl LocalFilesystemObjectStore {
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
        }
    }

    fn container_dir(&self, container: &str) -> PathBuf {
        self.base_dir.join(container)
    }

    fn blob_path(&self, container: &str, blob_name: &str) -> PathBuf {
        self.container_dir(container).join(blob_name)
    }

    fn md5_path(&self, container: &str, blob_name: &str) -> PathBuf {
        self.container_dir(container).join(format!("{blob_name}.md5"))
    }
}

#[async_trait]
impl ObjectStore for LocalFilesystemObjectStore {
    async fn put_block(
        &self,
        container: &str,
        blob_name: &str,
        data: Bytes,
        content_md5: [u8; 16],
    ) -> Result<PutOutcome, TygerError> {
        let dir = self.container_dir(container);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| TygerError::transient(format!("create container dir: {e}")))?;
        let blob_path = self.blob_path(container, blob_name);
        if tokio::fs::try_exists(&blob_path)
            .await
            .map_err(|e| TygerError::transient(format!("stat blob: {e}")))?
        {
            let existing_md5 = tokio::fs::read(self.md5_path(container, blob_name))
                .await
                .map_err(|e| TygerError::transient(format!("read md5 sidecar: {e}")))?;
            if existing_md5 == content_md5 {
                return Ok(PutOutcome::AlreadyExists);
            }
            return Err(TygerError::new(
                ErrorKind::Conflict,
                format!("blob `{blob_name}` already exists with a different hash"),
            ));
        }
        tokio::fs::write(&blob_path, &data)
            .await
            .map_err(|e| TygerError::transient(format!("write blob: {e}")))?;
        tokio::fs::write(self.md5_path(container, blob_name), content_md5)
            .await
            .map_err(|e| TygerError::transient(format!("write md5 sidecar: {e}")))?;
        Ok(PutOutcome::Created)
    }

    async fn get_block(&self, container: &str, blob_name: &str) -> Result<(Bytes, [u8; 16]), TygerError> {
        let data = tokio::fs::read(self.blob_path(container, blob_name))
            .await
            .map_err(|_| TygerError::not_found(format!("blob `{container}/{blob_name}`")))?;
        let md5_bytes = tokio::fs::read(self.md5_path(container, blob_name))
            .await
            .map_err(|e| TygerError::transient(format!("read md5 sidecar: {e}")))?;
        let md5: [u8; 16] = md5_bytes
            .try_into()
            .map_err(|_| TygerError::transient("corrupt md5 sidecar"))?;
        Ok((Bytes::from(data), md5))
    }

    async fn list_blob_names(&self, container: &str, prefix: &str) -> Result<Vec<String>, TygerError> {
        let dir = self.container_dir(container);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| TygerError::transient(format!("read container dir: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| TygerError::transient(format!("read dir entry: {e}")))?
        {
            if let Some(name) = entry.file_name().to_str() {
                if name.starts_with(prefix) && !name.ends_with(".md5") {
                    names.push(name.to_string());
                }
            }
        }
        Ok(names)
    }
}

#[async_trait]
impl tyger_buffers::BufferStore for LocalFilesystemObjectStore {
    async fn delete_buffers(&self, ids: &[String]) -> Result<(), TygerError> {
        for id in ids {
            let dir = self.container_dir(id);
            if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
                tokio::fs::remove_dir_all(&dir)
                    .await
                    .map_err(|e| TygerError::transient(format!("remove container dir: {e}")))?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn duplicate_block_with_same_hash_is_idempotent() {
        let store = InMemoryObjectStore::default();
        let data = Bytes::from_static(b"hello");
        let md5 = md5_of(&data);
        assert_eq!(
            store.put_block("c1", "0", data.clone(), md5).await.unwrap(),
            PutOutcome::Created
        );
        assert_eq!(
            store.put_block("c1", "0", data, md5).await.unwrap(),
            PutOutcome::AlreadyExists
        );
    }

    #[tokio::test]
    async fn duplicate_block_with_different_hash_conflicts() {
        let store = InMemoryObjectStore::default();
        let first = Bytes::from_static(b"hello");
        store.put_block("c1", "0", first.clone(), md5_of(&first)).await.unwrap();
        let second = Bytes::from_static(b"world");
        let err = store
            .put_block("c1", "0", second.clone(), md5_of(&second))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
    }

    fn md5_of(data: &Bytes) -> [u8; 16] {
        use md5::Digest;
        md5::Md5::digest(data).into()
    }
}
