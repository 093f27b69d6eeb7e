//! Key-value persistence seam.
//!
//! The relay persists two whole documents (the subscription mapping and the
//! last presence snapshot) under fixed keys. Backends only need whole-value
//! `get` and `set`; there are no transactions.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

/// Persistence errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend failed to read or write.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A stored value could not be decoded.
    #[error("Malformed value under key {key}: {source}")]
    Malformed {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A value could not be encoded.
    #[error("Failed to encode value: {0}")]
    Encode(#[source] serde_json::Error),
}

/// An async key-value store holding JSON values.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read the value under `key`, `None` if absent.
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;

    /// Replace the value under `key`.
    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError>;

    /// Backend name for logs.
    fn name(&self) -> &'static str;
}

/// Read and decode the document under `key`. Missing keys and JSON `null`
/// decode to `T::default()`.
pub(crate) async fn load_or_default<T>(
    store: &dyn KeyValueStore,
    key: &str,
) -> Result<T, StoreError>
where
    T: DeserializeOwned + Default,
{
    match store.get(key).await? {
        None | Some(Value::Null) => Ok(T::default()),
        Some(value) => serde_json::from_value(value).map_err(|source| StoreError::Malformed {
            key: key.to_string(),
            source,
        }),
    }
}

/// Encode and store `document` under `key`.
pub(crate) async fn save<T: Serialize>(
    store: &dyn KeyValueStore,
    key: &str,
    document: &T,
) -> Result<(), StoreError> {
    let value = serde_json::to_value(document).map_err(StoreError::Encode)?;
    store.set(key, value).await
}

/// In-process store. Contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
        self.entries.write().await.insert(key.to_string(), value);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(feature = "sled")]
pub use self::sled_backend::SledStore;

#[cfg(feature = "sled")]
mod sled_backend {
    use super::{KeyValueStore, StoreError};
    use async_trait::async_trait;
    use serde_json::Value;
    use std::path::Path;
    use tracing::info;

    /// Store backed by a `sled` database. Values are JSON encoded and the
    /// database is flushed after every write.
    #[derive(Clone)]
    pub struct SledStore {
        db: sled::Db,
    }

    impl SledStore {
        /// Open or create a database at `path`.
        ///
        /// # Errors
        ///
        /// Returns an error if the database cannot be opened.
        pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
            let path = path.as_ref();
            let db = sled::open(path).map_err(|e| StoreError::Backend(e.to_string()))?;
            info!(path = %path.display(), "Opened sled store");
            Ok(Self { db })
        }
    }

    #[async_trait]
    impl KeyValueStore for SledStore {
        async fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
            let Some(bytes) = self
                .db
                .get(key)
                .map_err(|e| StoreError::Backend(e.to_string()))?
            else {
                return Ok(None);
            };

            serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|source| StoreError::Malformed {
                    key: key.to_string(),
                    source,
                })
        }

        async fn set(&self, key: &str, value: Value) -> Result<(), StoreError> {
            let bytes = serde_json::to_vec(&value).map_err(StoreError::Encode)?;
            self.db
                .insert(key, bytes)
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            self.db
                .flush_async()
                .await
                .map_err(|e| StoreError::Backend(e.to_string()))?;
            Ok(())
        }

        fn name(&self) -> &'static str {
            "sled"
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// A store whose every operation fails.
    #[derive(Debug, Default)]
    pub struct FailingStore;

    #[async_trait]
    impl KeyValueStore for FailingStore {
        async fn get(&self, _key: &str) -> Result<Option<Value>, StoreError> {
            Err(StoreError::Backend("unavailable".into()))
        }

        async fn set(&self, _key: &str, _value: Value) -> Result<(), StoreError> {
            Err(StoreError::Backend("unavailable".into()))
        }

        fn name(&self) -> &'static str {
            "failing"
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_memory_store_get_set() {
        let store = MemoryStore::new();
        assert!(store.get("missing").await.unwrap().is_none());

        store.set("key", json!({"a": 1})).await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_load_or_default() {
        let store = MemoryStore::new();

        let empty: BTreeMap<String, usize> = load_or_default(&store, "counts").await.unwrap();
        assert!(empty.is_empty());

        store.set("counts", Value::Null).await.unwrap();
        let null: BTreeMap<String, usize> = load_or_default(&store, "counts").await.unwrap();
        assert!(null.is_empty());

        store.set("counts", json!("nope")).await.unwrap();
        let malformed = load_or_default::<BTreeMap<String, usize>>(&store, "counts").await;
        assert!(matches!(malformed, Err(StoreError::Malformed { .. })));
    }

    #[cfg(feature = "sled")]
    #[tokio::test]
    async fn test_sled_store_get_set() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledStore::open(dir.path()).unwrap();

        assert!(store.get("key").await.unwrap().is_none());
        store.set("key", json!({"x": true})).await.unwrap();
        store.set("key", json!({"x": false})).await.unwrap();
        assert_eq!(store.get("key").await.unwrap(), Some(json!({"x": false})));
    }
}
