//! The object-store collaborator Buffer Manager deletes through (spec
//! §4.2's `BufferProvider.DeleteBuffers`). Out of scope per spec §1 is the
//! *implementation* of a real object store — only this semantic contract
//! is consumed; `tyger-dataplane` provides the real local-filesystem and
//! in-memory backends that satisfy it.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use tyger_types::TygerError;

#[async_trait]
pub trait BufferStore: Send + Sync {
    async fn delete_buffers(&self, ids: &[String]) -> Result<(), TygerError>;
}

#[derive(Default)]
pub struct InMemoryBufferStore {
    deleted: Mutex<HashSet<String>>,
}

impl InMemoryBufferStore {
    pub fn deleted_ids(&self) -> Vec<String> {
        self.deleted.lock().iter().cloned().collect()
    }
}

#[async_trait]
impl BufferStore for InMemoryBufferStore {
    async fn delete_buffers(&self, ids: &[String]) -> Result<(), TygerError> {
        let mut deleted = self.deleted.lock();
        for id in ids {
            deleted.insert(id.clone());
        }
        Ok(())
    }
}
