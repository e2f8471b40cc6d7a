//! In-memory mirror over an optional durable store
//!
//! The backend is chosen once at construction. With a durable store the
//! mirror is only ever updated after the durable write succeeds, so memory is
//! a subset of durable truth. Without one, memory *is* the truth.
use crate::error::StoreError;
use crate::store::{Durable, WriteBatch, WriteOp};
use crate::utils::{from_cbor, to_cbor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MirrorMode {
    #[default]
    Enabled,
    /// Every read goes to the durable store and nothing is cached.
    Disabled,
}

enum Backend {
    Memory,
    Durable {
        store: Arc<dyn Durable>,
        mode: MirrorMode,
    },
}

pub struct DualStoreMirror {
    namespace: Vec<u8>,
    backend: Backend,
    memory: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl DualStoreMirror {
    /// Process-lifetime store with no durable backing.
    pub fn in_memory(namespace: &str) -> Self {
        Self {
            namespace: namespaced(namespace),
            backend: Backend::Memory,
            memory: BTreeMap::new(),
        }
    }

    pub fn durable(namespace: &str, store: Arc<dyn Durable>, mode: MirrorMode) -> Self {
        Self {
            namespace: namespaced(namespace),
            backend: Backend::Durable { store, mode },
            memory: BTreeMap::new(),
        }
    }

    pub fn is_durable(&self) -> bool {
        matches!(self.backend, Backend::Durable { .. })
    }

    /// Number of entries currently held in memory.
    pub fn cached_len(&self) -> usize {
        self.memory.len()
    }

    fn full_key(&self, key: &[u8]) -> Vec<u8> {
        let mut full = self.namespace.clone();
        full.extend_from_slice(key);
        full
    }

    pub fn read(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let full = self.full_key(key);
        match &self.backend {
            Backend::Memory => Ok(self.memory.get(&full).cloned()),
            Backend::Durable {
                store,
                mode: MirrorMode::Disabled,
            } => store.get(&full),
            Backend::Durable {
                store,
                mode: MirrorMode::Enabled,
            } => {
                if let Some(hit) = self.memory.get(&full) {
                    return Ok(Some(hit.clone()));
                }
                let loaded = store.get(&full)?;
                if let Some(value) = &loaded {
                    self.memory.insert(full, value.clone());
                }
                Ok(loaded)
            }
        }
    }

    pub fn get<T>(&mut self, key: &str) -> Result<Option<T>, StoreError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        match self.read(key.as_bytes())? {
            Some(bytes) => from_cbor(key.as_bytes(), &bytes).map(Some),
            None => Ok(None),
        }
    }

    /// Durable first, memory only once that succeeded.
    pub fn write(&mut self, batch: WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut full = WriteBatch::default();
        for (key, op) in batch {
            let key = self.full_key(&key);
            match op {
                WriteOp::Put(value) => full.put(key, value),
                WriteOp::Delete => full.delete(key),
            }
        }

        let populate = match &self.backend {
            Backend::Memory => true,
            Backend::Durable { store, mode } => {
                if let Err(err) = store.apply(&full) {
                    tracing::warn!(error = %err, keys = full.len(), "durable write failed");
                    return Err(err);
                }
                *mode == MirrorMode::Enabled
            }
        };

        for (key, op) in full {
            match op {
                WriteOp::Put(value) if populate => {
                    self.memory.insert(key, value);
                }
                // a disabled mirror still drops whatever it may hold
                WriteOp::Put(_) | WriteOp::Delete => {
                    self.memory.remove(&key);
                }
            }
        }
        Ok(())
    }

    /// Key-ordered scan. Reads durable truth whenever a durable store exists.
    pub fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        let full = self.full_key(prefix.as_bytes());
        let rows = match &self.backend {
            Backend::Memory => self
                .memory
                .range(full.clone()..)
                .take_while(|(k, _)| k.starts_with(&full))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            Backend::Durable { store, .. } => store.scan_prefix(&full)?,
        };
        Ok(rows
            .into_iter()
            .map(|(k, v)| {
                let relative = String::from_utf8_lossy(&k[self.namespace.len()..]).into_owned();
                (relative, v)
            })
            .collect())
    }

    pub fn begin(&mut self) -> Tx<'_> {
        Tx {
            mirror: self,
            mutations: WriteBatch::default(),
            bookkeeping: WriteBatch::default(),
        }
    }
}

fn namespaced(namespace: &str) -> Vec<u8> {
    format!("{namespace}/").into_bytes()
}

/// Staged writes over a mirror. Nothing reaches the mirror until the executor
/// commits the staged batches.
///
/// A key belongs to one lane for the life of the transaction. Staging it in
/// the other lane is a [`StoreError::LaneConflict`], so reads never have to
/// pick between two staged values.
pub struct Tx<'a> {
    mirror: &'a mut DualStoreMirror,
    mutations: WriteBatch,
    bookkeeping: WriteBatch,
}

impl Tx<'_> {
    pub fn get<T>(&mut self, key: &str) -> Result<Option<T>, StoreError>
    where
        T: for<'b> minicbor::Decode<'b, ()>,
    {
        let staged = self
            .mutations
            .get(key.as_bytes())
            .or_else(|| self.bookkeeping.get(key.as_bytes()));
        match staged {
            Some(WriteOp::Put(bytes)) => from_cbor(key.as_bytes(), bytes).map(Some),
            Some(WriteOp::Delete) => Ok(None),
            None => self.mirror.get(key),
        }
    }

    /// Stage a write that is kept only if the command succeeds.
    pub fn put<T: minicbor::Encode<()>>(&mut self, key: &str, value: &T) -> Result<(), StoreError> {
        claim(&self.bookkeeping, key)?;
        self.mutations.put(key, to_cbor(value)?);
        Ok(())
    }

    pub fn delete(&mut self, key: &str) -> Result<(), StoreError> {
        claim(&self.bookkeeping, key)?;
        self.mutations.delete(key);
        Ok(())
    }

    /// Stage a write that is kept even when the command ends in a denial.
    pub fn record<T: minicbor::Encode<()>>(
        &mut self,
        key: &str,
        value: &T,
    ) -> Result<(), StoreError> {
        claim(&self.mutations, key)?;
        self.bookkeeping.put(key, to_cbor(value)?);
        Ok(())
    }

    pub fn scan(&self, prefix: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.mirror.scan(prefix)
    }

    pub(crate) fn into_batches(self) -> (WriteBatch, WriteBatch) {
        (self.mutations, self.bookkeeping)
    }
}

fn claim(other_lane: &WriteBatch, key: &str) -> Result<(), StoreError> {
    match other_lane.get(key.as_bytes()) {
        Some(_) => Err(StoreError::LaneConflict(key.to_string())),
        None => Ok(()),
    }
}
