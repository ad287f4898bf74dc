//! The storage backend contract. One `Store` (see `crate::store`) wraps an
//! `Arc<dyn StorageBackend>`, the same shape as
//! `ethrex_storage::store::Store`'s `backend: Arc<dyn StorageBackend>`
//! field, so a durable engine (sled, rocksdb) can be substituted without
//! touching any caller.

use crate::error::StoreError;

/// Raw, durable key-value operations. Implementors need not know about
/// cranks or savepoints — that bookkeeping lives in `Store` and is layered
/// on top via an in-memory overlay.
pub trait StorageBackend: std::fmt::Debug + Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &[u8]) -> Result<(), StoreError>;
    /// Keys with the given prefix, in ascending byte order.
    fn enumerate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

pub mod in_memory {
    use std::collections::BTreeMap;

    use parking_lot::RwLock;

    use super::StorageBackend;
    use crate::error::StoreError;

    /// A `BTreeMap` guarded by an `RwLock`, enough to run the whole kernel
    /// and its test suite without an external database. Keys sort as raw
    /// bytes, which is sufficient since every persisted key in §6 is ASCII
    /// and prefix-enumerable.
    #[derive(Debug, Default)]
    pub struct InMemoryBackend {
        map: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    }

    impl InMemoryBackend {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl StorageBackend for InMemoryBackend {
        fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
            Ok(self.map.read().get(key).cloned())
        }

        fn set(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
            self.map.write().insert(key.to_vec(), value.to_vec());
            Ok(())
        }

        fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
            self.map.write().remove(key);
            Ok(())
        }

        fn enumerate(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
            Ok(self
                .map
                .read()
                .range(prefix.to_vec()..)
                .take_while(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect())
        }
    }

}
