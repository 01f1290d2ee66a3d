use crate::*;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::Mutex;

/// A device-bound encrypted key-value store
///
/// Encryption and device binding are the store's business. The session only
/// needs read, write and delete by key.
#[async_trait]
pub trait SecureStorage: Send + Sync {
    async fn read(&self, key: &str) -> Result<Option<String>, SessionError>;

    async fn write(&self, key: &str, value: &str) -> Result<(), SessionError>;

    /// Deleting a missing key is not an error
    async fn delete(&self, key: &str) -> Result<(), SessionError>;
}

/// A simple store that uses an in-memory BTreeMap
#[derive(Default)]
pub struct MemoryStorage {
    inner: Mutex<BTreeMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys
    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}

#[async_trait]
impl SecureStorage for MemoryStorage {
    async fn read(&self, key: &str) -> Result<Option<String>, SessionError> {
        Ok(self.inner.lock().await.get(key).cloned())
    }

    async fn write(&self, key: &str, value: &str) -> Result<(), SessionError> {
        self.inner
            .lock()
            .await
            .insert(key.to_owned(), value.to_owned());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), SessionError> {
        self.inner.lock().await.remove(key);
        Ok(())
    }
}
