//! Byte-keyed persistence capability for snapshot checkpoints.

use crate::error::AtmosError;
use alloy_primitives::B256;
use parking_lot::RwLock;
use std::{collections::HashMap, sync::Arc};

/// Database key prefix for persisted snapshots.
pub const SNAPSHOT_PREFIX: &[u8] = b"atmos-";

/// The key a snapshot for `hash` is stored under.
pub fn snapshot_key(hash: B256) -> Vec<u8> {
    let mut key = Vec::with_capacity(SNAPSHOT_PREFIX.len() + hash.len());
    key.extend_from_slice(SNAPSHOT_PREFIX);
    key.extend_from_slice(hash.as_slice());
    key
}

/// Byte-keyed key-value store the engine persists snapshots into.
pub trait Database: Send + Sync {
    /// Fetch the value stored under `key`, if any.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, AtmosError>;

    /// Store `value` under `key`, overwriting any previous value.
    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), AtmosError>;
}

/// In-memory database for tests and ephemeral nodes.
#[derive(Debug, Default)]
pub struct MemoryDatabase {
    entries: RwLock<HashMap<Vec<u8>, Vec<u8>>>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Database for MemoryDatabase {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, AtmosError> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &[u8], value: &[u8]) -> Result<(), AtmosError> {
        self.entries.write().insert(key.to_vec(), value.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_keys_are_prefixed() {
        let hash = B256::repeat_byte(0x42);
        let key = snapshot_key(hash);
        assert!(key.starts_with(SNAPSHOT_PREFIX));
        assert_eq!(&key[SNAPSHOT_PREFIX.len()..], hash.as_slice());
    }

    #[test]
    fn memory_database_read_after_write() {
        let db = MemoryDatabase::new();
        assert!(db.is_empty());
        assert_eq!(db.get(b"missing").unwrap(), None);

        db.put(b"key", b"one").unwrap();
        db.put(b"key", b"two").unwrap();
        assert_eq!(db.get(b"key").unwrap().as_deref(), Some(&b"two"[..]));
        assert_eq!(db.len(), 1);
    }
}
