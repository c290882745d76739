use crate::{StoreError, StoreResult};
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

/// Flat string key-value store the session repository persists into.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> StoreResult<Option<String>>;
    fn set(&self, key: &str, value: &str) -> StoreResult<()>;
    fn remove(&self, key: &str) -> StoreResult<()>;
    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>>;
}

impl<K: KvStore + ?Sized> KvStore for Arc<K> {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        (**self).get(key)
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        (**self).set(key, value)
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        (**self).remove(key)
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        (**self).keys_with_prefix(prefix)
    }
}

/// In-memory backend. An optional byte capacity models a quota-limited store.
#[derive(Clone, Default)]
pub struct MemKv {
    entries: Arc<RwLock<BTreeMap<String, String>>>,
    capacity: Option<usize>,
}

impl std::fmt::Debug for MemKv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemKv")
            .field("entries", &self.read().len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl MemKv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity_limit(limit: usize) -> Self {
        Self {
            entries: Arc::default(),
            capacity: Some(limit),
        }
    }

    /// Total bytes held across keys and values.
    pub fn used_bytes(&self) -> usize {
        self.read().iter().map(|(k, v)| k.len() + v.len()).sum()
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, String>> {
        self.entries.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, String>> {
        self.entries.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl KvStore for MemKv {
    fn get(&self, key: &str) -> StoreResult<Option<String>> {
        Ok(self.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> StoreResult<()> {
        let mut guard = self.write();
        if let Some(limit) = self.capacity {
            let current: usize = guard
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, v)| k.len() + v.len())
                .sum();
            if current + key.len() + value.len() > limit {
                return Err(StoreError::CapacityExceeded {
                    key: key.to_string(),
                    limit,
                });
            }
        }
        guard.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StoreResult<()> {
        self.write().remove(key);
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StoreResult<Vec<String>> {
        Ok(self
            .read()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_remove() {
        let kv = MemKv::new();
        kv.set("a.1", "one").expect("set");
        kv.set("a.2", "two").expect("set");
        kv.set("b.1", "other").expect("set");
        assert_eq!(kv.get("a.1").expect("get").as_deref(), Some("one"));
        assert_eq!(kv.keys_with_prefix("a.").expect("keys"), vec!["a.1", "a.2"]);
        kv.remove("a.1").expect("remove");
        assert_eq!(kv.get("a.1").expect("get"), None);
    }

    #[test]
    fn capacity_limit_rejects_oversized_writes() {
        let kv = MemKv::with_capacity_limit(16);
        kv.set("k", "small").expect("fits");
        let err = kv.set("big", "0123456789abcdef").expect_err("should overflow");
        assert!(matches!(err, StoreError::CapacityExceeded { limit: 16, .. }));
        // overwriting an existing key only counts the replacement
        kv.set("k", "0123456789").expect("replace fits");
        assert_eq!(kv.used_bytes(), 11);
    }
}
