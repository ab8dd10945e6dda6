//! 内存中的加密文档存储
//!
//! 每个文档 ID 对应一个 [`EncryptedPayload`]。`get` 时通过
//! [`KeyLifecycleManager`] 解密，`put` 时用当前 `Active` 密钥加密。
//! 它既是最简单的“加密服务”，也是轮换扫描的参考协作方。
use std::sync::Arc;

use dashmap::DashMap;

use crate::common::types::EncryptedPayload;
use crate::error::Error;
use crate::lifecycle::KeyLifecycleManager;
use crate::rotation::DocumentStore;

pub struct EncryptedDocumentStore {
    manager: Arc<KeyLifecycleManager>,
    documents: DashMap<String, EncryptedPayload>,
}

impl EncryptedDocumentStore {
    pub fn new(manager: Arc<KeyLifecycleManager>) -> Self {
        Self {
            manager,
            documents: DashMap::new(),
        }
    }

    /// Encrypts `plaintext` under the Active key and stores it as `id`.
    pub fn insert(&self, id: &str, plaintext: &[u8]) -> Result<EncryptedPayload, Error> {
        let payload = self.manager.encrypt(plaintext)?;
        self.documents.insert(id.to_string(), payload.clone());
        Ok(payload)
    }

    /// Stores an already-encrypted payload as is, e.g. one read back from a sidecar.
    pub fn import(&self, id: &str, payload: EncryptedPayload) {
        self.documents.insert(id.to_string(), payload);
    }

    /// The encrypted form currently held for `id`.
    pub fn payload(&self, id: &str) -> Option<EncryptedPayload> {
        self.documents.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &str) -> Option<EncryptedPayload> {
        self.documents.remove(id).map(|(_, payload)| payload)
    }

    /// Document ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.documents.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

impl DocumentStore for EncryptedDocumentStore {
    type Document = Vec<u8>;
    type Error = Error;

    fn get(&self, id: &str) -> Result<Vec<u8>, Error> {
        let payload = self
            .payload(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        self.manager.decrypt(&payload)
    }

    fn put(&self, id: &str, document: Vec<u8>) -> Result<(), Error> {
        self.insert(id, &document).map(|_| ())
    }
}

/// AES-GCM work runs on the blocking pool so large documents do not stall the runtime.
#[cfg(feature = "async")]
#[async_trait::async_trait]
impl crate::rotation::AsyncDocumentStore for EncryptedDocumentStore {
    type Document = Vec<u8>;
    type Error = Error;

    async fn get(&self, id: &str) -> Result<Vec<u8>, Error> {
        let payload = self
            .payload(id)
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || manager.decrypt(&payload)).await?
    }

    async fn put(&self, id: &str, document: Vec<u8>) -> Result<(), Error> {
        let manager = Arc::clone(&self.manager);
        let payload = tokio::task::spawn_blocking(move || manager.encrypt(&document)).await??;
        self.documents.insert(id.to_string(), payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::config::{ConfigFile, KdfConfig};
    use crate::common::traits::KeyStorage;
    use crate::storage::FileKeyStore;
    use secrecy::{SecretBox, SecretString};
    use tempfile::tempdir;

    fn manager(dir: &std::path::Path) -> Arc<KeyLifecycleManager> {
        let mut config = ConfigFile::default();
        config.storage.storage_dir = dir.join("keys");
        config.kdf = KdfConfig {
            iterations: 1,
            memory_cost_kib: 8,
            parallelism: 1,
        };
        let store: Arc<dyn KeyStorage> = Arc::new(
            FileKeyStore::open(
                config.storage.clone(),
                SecretBox::new(Box::from(&b"storage-secret"[..])),
            )
            .unwrap(),
        );
        Arc::new(
            KeyLifecycleManager::new(&config, SecretString::from("master"), store).unwrap(),
        )
    }

    #[test]
    fn put_then_get_roundtrips_through_the_manager() -> Result<(), Error> {
        let dir = tempdir().unwrap();
        let store = EncryptedDocumentStore::new(manager(dir.path()));

        DocumentStore::put(&store, "doc-1", b"hello".to_vec())?;
        assert_eq!(DocumentStore::get(&store, "doc-1")?, b"hello");

        let payload = store.payload("doc-1").unwrap();
        assert_ne!(payload.ciphertext, b"hello");
        assert_eq!(store.ids(), vec!["doc-1"]);
        Ok(())
    }

    #[test]
    fn missing_document_is_not_found() {
        let dir = tempdir().unwrap();
        let store = EncryptedDocumentStore::new(manager(dir.path()));
        assert!(matches!(
            DocumentStore::get(&store, "nope"),
            Err(Error::NotFound(id)) if id == "nope"
        ));
    }

    #[test]
    fn put_uses_the_current_active_key() -> Result<(), Error> {
        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        let store = EncryptedDocumentStore::new(Arc::clone(&manager));

        let before = store.insert("doc-1", b"body")?;
        let rotation = manager.rotate_keys()?;
        let document = DocumentStore::get(&store, "doc-1")?;
        DocumentStore::put(&store, "doc-1", document)?;

        let after = store.payload("doc-1").unwrap();
        assert_ne!(after.key_id, before.key_id);
        assert_eq!(after.key_id, rotation.new_active);
        assert!(after.version > before.version);
        Ok(())
    }

    #[cfg(feature = "async")]
    #[tokio::test]
    async fn async_put_then_get_roundtrips() -> Result<(), Error> {
        use crate::rotation::AsyncDocumentStore;

        let dir = tempdir().unwrap();
        let manager = manager(dir.path());
        let store = EncryptedDocumentStore::new(Arc::clone(&manager));

        AsyncDocumentStore::put(&store, "doc-1", b"async body".to_vec()).await?;
        assert_eq!(AsyncDocumentStore::get(&store, "doc-1").await?, b"async body");
        assert_eq!(
            store.payload("doc-1").unwrap().key_id,
            manager.active_key()?.unwrap().id
        );
        assert!(matches!(
            AsyncDocumentStore::get(&store, "nope").await,
            Err(Error::NotFound(id)) if id == "nope"
        ));
        Ok(())
    }
}
