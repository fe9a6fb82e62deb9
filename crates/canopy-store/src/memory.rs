use std::collections::BTreeMap;
use std::sync::RwLock;

use bytes::Bytes;

use crate::error::StoreResult;
use crate::key_space::KeySpace;
use crate::local::{LocalStore, WriteBatch};

type Family = BTreeMap<Vec<u8>, Bytes>;

/// In-memory local store.
///
/// Intended for tests and embedding. All key spaces live behind one
/// `RwLock`, which also gives batch flushes atomicity with respect to
/// readers.
pub struct MemoryLocalStore {
    families: RwLock<[Family; KeySpace::COUNT]>,
}

impl MemoryLocalStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            families: RwLock::new(std::array::from_fn(|_| Family::new())),
        }
    }

    /// Number of keys in one key space.
    pub fn len(&self, key_space: KeySpace) -> usize {
        self.families.read().expect("lock poisoned")[key_space.index()].len()
    }

    /// Returns `true` if every key space is empty.
    pub fn is_empty(&self) -> bool {
        self.families
            .read()
            .expect("lock poisoned")
            .iter()
            .all(|f| f.is_empty())
    }
}

impl Default for MemoryLocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore for MemoryLocalStore {
    fn get(&self, key_space: KeySpace, key: &[u8]) -> StoreResult<Option<Bytes>> {
        let families = self.families.read().expect("lock poisoned");
        Ok(families[key_space.index()].get(key).cloned())
    }

    fn put(&self, key_space: KeySpace, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut families = self.families.write().expect("lock poisoned");
        families[key_space.index()].insert(key.to_vec(), Bytes::copy_from_slice(value));
        Ok(())
    }

    fn has_key(&self, key_space: KeySpace, key: &[u8]) -> StoreResult<bool> {
        let families = self.families.read().expect("lock poisoned");
        Ok(families[key_space.index()].contains_key(key))
    }

    fn begin_write(&self, size_hint: usize) -> Box<dyn WriteBatch + '_> {
        let _ = size_hint;
        Box::new(MemoryWriteBatch {
            store: self,
            ops: Vec::new(),
        })
    }

    fn clear_key_space(&self, key_space: KeySpace) -> StoreResult<()> {
        let mut families = self.families.write().expect("lock poisoned");
        families[key_space.index()].clear();
        Ok(())
    }

    fn compact_key_space(&self, _key_space: KeySpace) -> StoreResult<()> {
        // Nothing to compact in a BTreeMap.
        Ok(())
    }
}

struct MemoryWriteBatch<'a> {
    store: &'a MemoryLocalStore,
    ops: Vec<(KeySpace, Vec<u8>, Bytes)>,
}

impl WriteBatch for MemoryWriteBatch<'_> {
    fn put(&mut self, key_space: KeySpace, key: &[u8], value: &[u8]) {
        self.ops
            .push((key_space, key.to_vec(), Bytes::copy_from_slice(value)));
    }

    fn flush(self: Box<Self>) -> StoreResult<()> {
        let mut families = self.store.families.write().expect("lock poisoned");
        for (key_space, key, value) in self.ops {
            families[key_space.index()].insert(key, value);
        }
        Ok(())
    }
}
