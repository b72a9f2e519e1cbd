//! Storage collaborator contract.
//!
//! Key storage, audit logging and model storage all sit behind the same
//! opaque-blob interface; the core never looks inside what it persists.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::BTreeMap;

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn store(&self, id: &str, blob: Vec<u8>) -> anyhow::Result<()>;
    async fn retrieve(&self, id: &str) -> anyhow::Result<Option<Vec<u8>>>;
    async fn list(&self) -> anyhow::Result<Vec<String>>;
    async fn delete(&self, id: &str) -> anyhow::Result<()>;
}

#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<BTreeMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn store(&self, id: &str, blob: Vec<u8>) -> anyhow::Result<()> {
        self.blobs.write().insert(id.to_string(), blob);
        Ok(())
    }

    async fn retrieve(&self, id: &str) -> anyhow::Result<Option<Vec<u8>>> {
        Ok(self.blobs.read().get(id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        Ok(self.blobs.read().keys().cloned().collect())
    }

    async fn delete(&self, id: &str) -> anyhow::Result<()> {
        self.blobs.write().remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_list_delete() {
        let store = InMemoryBlobStore::new();
        store.store("round/1", b"a".to_vec()).await.unwrap();
        store.store("round/2", b"b".to_vec()).await.unwrap();
        assert_eq!(store.list().await.unwrap(), vec!["round/1".to_string(), "round/2".to_string()]);
        assert_eq!(store.retrieve("round/2").await.unwrap(), Some(b"b".to_vec()));
        store.delete("round/1").await.unwrap();
        assert!(store.retrieve("round/1").await.unwrap().is_none());
    }
}
