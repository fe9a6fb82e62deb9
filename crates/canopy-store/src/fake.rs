use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use canopy_types::Hash;

use crate::error::StoreResult;
use crate::facade::BackingStore;
use crate::object::{Blob, Tree, TreeEntry};

/// Backing store with directly injectable data, for tests.
///
/// Fetches are counted per hash so tests can assert how often the importer
/// was consulted.
pub struct FakeBackingStore {
    trees: Mutex<HashMap<Hash, Tree>>,
    blobs: Mutex<HashMap<Hash, Blob>>,
    commits: Mutex<HashMap<Hash, Hash>>,
    tree_fetches: Mutex<HashMap<Hash, u64>>,
    blob_fetches: Mutex<HashMap<Hash, u64>>,
    commit_fetches: Mutex<HashMap<Hash, u64>>,
}

impl FakeBackingStore {
    pub fn new() -> Self {
        Self {
            trees: Mutex::new(HashMap::new()),
            blobs: Mutex::new(HashMap::new()),
            commits: Mutex::new(HashMap::new()),
            tree_fetches: Mutex::new(HashMap::new()),
            blob_fetches: Mutex::new(HashMap::new()),
            commit_fetches: Mutex::new(HashMap::new()),
        }
    }

    /// Add a single-chunk blob; returns its framed-form object id.
    pub fn add_blob(&self, contents: &[u8]) -> Hash {
        let framed_id = Hash::sha1_slices([
            format!("blob {}\0", contents.len()).as_bytes(),
            contents,
        ]);
        let blob = Blob::new(framed_id, contents.to_vec());
        self.blobs
            .lock()
            .expect("lock poisoned")
            .insert(framed_id, blob);
        framed_id
    }

    /// Add a pre-built blob, computing its id from the framed form when the
    /// stated hash is zero.
    pub fn add_blob_object(&self, blob: Blob) -> Hash {
        let id = if blob.hash().is_zero() {
            let header = format!("blob {}\0", blob.size());
            Hash::sha1_slices(
                std::iter::once(header.as_bytes())
                    .chain(blob.chunks().iter().map(|c| c.as_ref())),
            )
        } else {
            *blob.hash()
        };
        let blob = Blob::from_chunks(id, blob.chunks().to_vec());
        self.blobs.lock().expect("lock poisoned").insert(id, blob);
        id
    }

    /// Add a tree built from the given entries; returns its object id.
    pub fn add_tree(&self, entries: Vec<TreeEntry>) -> Hash {
        let (id, _) = Tree::new(Hash::zero(), entries.clone())
            .expect("fake tree entries must be unique")
            .serialize();
        let tree = Tree::new(id, entries).expect("fake tree entries must be unique");
        self.trees.lock().expect("lock poisoned").insert(id, tree);
        id
    }

    /// Record a commit → root tree edge.
    pub fn set_tree_for_commit(&self, commit: Hash, tree: Hash) {
        self.commits
            .lock()
            .expect("lock poisoned")
            .insert(commit, tree);
    }

    /// How many times a tree was fetched.
    pub fn tree_fetches(&self, id: &Hash) -> u64 {
        *self
            .tree_fetches
            .lock()
            .expect("lock poisoned")
            .get(id)
            .unwrap_or(&0)
    }

    /// How many times a blob was fetched.
    pub fn blob_fetches(&self, id: &Hash) -> u64 {
        *self
            .blob_fetches
            .lock()
            .expect("lock poisoned")
            .get(id)
            .unwrap_or(&0)
    }

    /// How many times a commit was resolved.
    pub fn commit_fetches(&self, id: &Hash) -> u64 {
        *self
            .commit_fetches
            .lock()
            .expect("lock poisoned")
            .get(id)
            .unwrap_or(&0)
    }
}

impl Default for FakeBackingStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BackingStore for FakeBackingStore {
    async fn fetch_tree(&self, id: &Hash) -> StoreResult<Option<Tree>> {
        *self
            .tree_fetches
            .lock()
            .expect("lock poisoned")
            .entry(*id)
            .or_insert(0) += 1;
        Ok(self.trees.lock().expect("lock poisoned").get(id).cloned())
    }

    async fn fetch_blob(&self, id: &Hash) -> StoreResult<Option<Blob>> {
        *self
            .blob_fetches
            .lock()
            .expect("lock poisoned")
            .entry(*id)
            .or_insert(0) += 1;
        Ok(self.blobs.lock().expect("lock poisoned").get(id).cloned())
    }

    async fn fetch_tree_for_commit(&self, commit: &Hash) -> StoreResult<Option<Tree>> {
        *self
            .commit_fetches
            .lock()
            .expect("lock poisoned")
            .entry(*commit)
            .or_insert(0) += 1;
        let tree_id = match self.commits.lock().expect("lock poisoned").get(commit) {
            Some(id) => *id,
            None => return Ok(None),
        };
        Ok(self.trees.lock().expect("lock poisoned").get(&tree_id).cloned())
    }
}
