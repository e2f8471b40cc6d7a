//! Durable backing stores
//!
//! A [`Durable`] store is the source of truth whenever one is configured. All
//! writes arrive as a [`WriteBatch`] and must be applied all-or-nothing.
use crate::error::StoreError;
use sled::Batch;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, RwLock};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    Put(Vec<u8>),
    Delete,
}

/// An ordered set of key writes applied atomically.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct WriteBatch {
    ops: BTreeMap<Vec<u8>, WriteOp>,
}

impl WriteBatch {
    pub fn put(&mut self, key: impl Into<Vec<u8>>, value: Vec<u8>) {
        self.ops.insert(key.into(), WriteOp::Put(value));
    }
    pub fn delete(&mut self, key: impl Into<Vec<u8>>) {
        self.ops.insert(key.into(), WriteOp::Delete);
    }
    /// Later writes to the same key win.
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }
    pub fn get(&self, key: &[u8]) -> Option<&WriteOp> {
        self.ops.get(key)
    }
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
    pub fn len(&self) -> usize {
        self.ops.len()
    }
    pub fn iter(&self) -> impl Iterator<Item = (&Vec<u8>, &WriteOp)> {
        self.ops.iter()
    }
}

impl IntoIterator for WriteBatch {
    type Item = (Vec<u8>, WriteOp);
    type IntoIter = std::collections::btree_map::IntoIter<Vec<u8>, WriteOp>;

    fn into_iter(self) -> Self::IntoIter {
        self.ops.into_iter()
    }
}

pub trait Durable: Send + Sync {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;
    /// Must apply every op in the batch or none of them.
    fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError>;
    /// Key-ordered scan of everything under `prefix`.
    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError>;
}

pub struct SledStore {
    instance: Arc<sled::Db>,
}

impl SledStore {
    pub fn new(instance: Arc<sled::Db>) -> Self {
        Self { instance }
    }
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Ok(Self::new(Arc::new(sled::open(path)?)))
    }
    pub fn flush(&self) -> Result<(), StoreError> {
        self.instance.flush()?;
        Ok(())
    }
}

impl Durable for SledStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        Ok(self.instance.get(key)?.map(|v| v.to_vec()))
    }

    fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut sled_batch = Batch::default();
        for (key, op) in batch.iter() {
            match op {
                WriteOp::Put(value) => sled_batch.insert(key.as_slice(), value.as_slice()),
                WriteOp::Delete => sled_batch.remove(key.as_slice()),
            }
        }
        self.instance.apply_batch(sled_batch)?;
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        self.instance
            .scan_prefix(prefix)
            .map(|kv| -> Result<_, StoreError> {
                let (k, v) = kv?;
                Ok((k.to_vec(), v.to_vec()))
            })
            .collect()
    }
}

/// A [`Durable`] store living in process memory, for embedding and tests.
#[derive(Default)]
pub struct InMemoryStore {
    data: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Durable for InMemoryStore {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        Ok(data.get(key).cloned())
    }

    fn apply(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        let mut data = self.data.write().map_err(|_| StoreError::Poisoned)?;
        for (key, op) in batch.iter() {
            match op {
                WriteOp::Put(value) => {
                    data.insert(key.clone(), value.clone());
                }
                WriteOp::Delete => {
                    data.remove(key);
                }
            }
        }
        Ok(())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Vec<u8>)>, StoreError> {
        let data = self.data.read().map_err(|_| StoreError::Poisoned)?;
        Ok(data
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn sample_batch() -> WriteBatch {
        let mut batch = WriteBatch::default();
        batch.put("acct/a", b"1".to_vec());
        batch.put("acct/b", b"2".to_vec());
        batch.put("other/c", b"3".to_vec());
        batch
    }

    fn exercise(store: &dyn Durable) {
        store.apply(&sample_batch()).unwrap();
        assert_eq!(store.get(b"acct/a").unwrap(), Some(b"1".to_vec()));

        let scanned = store.scan_prefix(b"acct/").unwrap();
        let keys: Vec<_> = scanned.iter().map(|(k, _)| k.as_slice()).collect();
        assert_eq!(keys, vec![b"acct/a".as_slice(), b"acct/b".as_slice()]);

        let mut removal = WriteBatch::default();
        removal.delete("acct/a");
        store.apply(&removal).unwrap();
        assert_eq!(store.get(b"acct/a").unwrap(), None);
    }

    #[test]
    fn in_memory_store_contract() {
        exercise(&InMemoryStore::new());
    }

    #[test]
    fn sled_store_contract() {
        // each test gets its own db on temp, sled holds a file lock
        let temp_dir = tempdir().unwrap();
        let store = SledStore::open(&temp_dir.path().join("store.db")).unwrap();
        exercise(&store);
    }

    #[test]
    fn later_write_to_same_key_wins() {
        let mut batch = WriteBatch::default();
        batch.put("k", b"first".to_vec());
        let mut second = WriteBatch::default();
        second.delete("k");
        batch.extend(second);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch.get(b"k"), Some(&WriteOp::Delete));
    }
}
