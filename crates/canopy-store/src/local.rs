use async_trait::async_trait;
use bytes::Bytes;
use canopy_types::Hash;

use crate::error::StoreResult;
use crate::key_space::{KeySpace, Persistence};
use crate::object::{deserialize_blob, deserialize_tree, Blob, BlobMetadata, Tree};

/// A group of puts applied atomically with respect to readers.
///
/// Writes are buffered until [`WriteBatch::flush`]; a dropped batch applies
/// nothing.
pub trait WriteBatch: Send {
    /// Queue a single-value put.
    fn put(&mut self, key_space: KeySpace, key: &[u8], value: &[u8]);

    /// Queue a scatter-gather put: the value is the concatenation of
    /// `slices`. Engines that support vectored values avoid the copy;
    /// the default coalesces.
    fn put_slices(&mut self, key_space: KeySpace, key: &[u8], slices: &[&[u8]]) {
        let total = slices.iter().map(|s| s.len()).sum();
        let mut buf = Vec::with_capacity(total);
        for slice in slices {
            buf.extend_from_slice(slice);
        }
        self.put(key_space, key, &buf);
    }

    /// Apply all queued writes atomically.
    fn flush(self: Box<Self>) -> StoreResult<()>;

    /// Serialize a tree into the batch and return the key used.
    ///
    /// If the tree's stated hash is zero the key is the sha-1 of the
    /// serialized form; otherwise the stated hash is used verbatim.
    fn put_tree(&mut self, tree: &Tree) -> Hash {
        let (id, framed) = tree.serialize();
        self.put(KeySpace::Tree, id.as_bytes(), &framed);
        id
    }

    /// Write a blob's framed body and its 28-byte metadata record.
    ///
    /// The framed body is queued as a scatter-gather of the `blob <n>\0`
    /// header followed by the blob's native chunks.
    fn put_blob(&mut self, blob: &Blob) -> BlobMetadata {
        let metadata = BlobMetadata {
            content_hash: blob.content_sha1(),
            size: blob.size(),
        };

        let header = format!("blob {}\0", blob.size());
        let key = if blob.hash().is_zero() {
            Hash::sha1_slices(
                std::iter::once(header.as_bytes())
                    .chain(blob.chunks().iter().map(|c| c.as_ref())),
            )
        } else {
            *blob.hash()
        };

        let mut slices: Vec<&[u8]> = Vec::with_capacity(1 + blob.chunks().len());
        slices.push(header.as_bytes());
        for chunk in blob.chunks() {
            slices.push(chunk.as_ref());
        }
        self.put_slices(KeySpace::Blob, key.as_bytes(), &slices);
        self.put(KeySpace::BlobMetadata, key.as_bytes(), &metadata.to_bytes());
        metadata
    }
}

/// Column-family key-value store over a persistent engine.
///
/// Missing keys are not errors: reads resolve to `Ok(None)`. The async
/// surface exists so the dispatcher thread never blocks on engine I/O;
/// engines without native async wrap the sync call, and on-disk engines
/// should move it to a blocking pool.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Synchronous point read.
    fn get(&self, key_space: KeySpace, key: &[u8]) -> StoreResult<Option<Bytes>>;

    /// Atomic single-key put.
    fn put(&self, key_space: KeySpace, key: &[u8], value: &[u8]) -> StoreResult<()>;

    /// Atomic single-key put of a scatter-gather value.
    fn put_slices(&self, key_space: KeySpace, key: &[u8], slices: &[&[u8]]) -> StoreResult<()> {
        let total = slices.iter().map(|s| s.len()).sum();
        let mut buf = Vec::with_capacity(total);
        for slice in slices {
            buf.extend_from_slice(slice);
        }
        self.put(key_space, key, &buf)
    }

    /// Returns `true` if the key is present.
    fn has_key(&self, key_space: KeySpace, key: &[u8]) -> StoreResult<bool>;

    /// Start a write batch. `size_hint` is the approximate total value size.
    fn begin_write(&self, size_hint: usize) -> Box<dyn WriteBatch + '_>;

    /// Erase every key in one key space.
    fn clear_key_space(&self, key_space: KeySpace) -> StoreResult<()>;

    /// Ask the engine to compact one key space.
    fn compact_key_space(&self, key_space: KeySpace) -> StoreResult<()>;

    /// Asynchronous point read.
    async fn get_async(&self, key_space: KeySpace, key: Vec<u8>) -> StoreResult<Option<Bytes>> {
        self.get(key_space, &key)
    }

    /// Asynchronous multi-read. The result preserves input order, with one
    /// `None` per absent key.
    async fn get_batch(
        &self,
        key_space: KeySpace,
        keys: Vec<Vec<u8>>,
    ) -> StoreResult<Vec<Option<Bytes>>> {
        let mut results = Vec::with_capacity(keys.len());
        for key in keys {
            results.push(self.get_async(key_space, key).await?);
        }
        Ok(results)
    }

    // -- reclaim ------------------------------------------------------------

    /// Erase all ephemeral key spaces; persistent ones are untouched.
    fn clear_caches(&self) -> StoreResult<()> {
        for ks in KeySpace::ALL {
            if ks.persistence() == Persistence::Ephemeral {
                self.clear_key_space(ks)?;
            }
        }
        Ok(())
    }

    /// Erase all ephemeral key spaces, then compact every key space.
    fn clear_caches_and_compact_all(&self) -> StoreResult<()> {
        for ks in KeySpace::ALL {
            if ks.persistence() == Persistence::Ephemeral {
                self.clear_key_space(ks)?;
            }
            self.compact_key_space(ks)?;
        }
        Ok(())
    }

    /// Compact every key space without clearing anything.
    fn compact_storage(&self) -> StoreResult<()> {
        for ks in KeySpace::ALL {
            self.compact_key_space(ks)?;
        }
        Ok(())
    }

    // -- typed object access ------------------------------------------------

    /// Serialize and store a tree; returns the key used.
    fn put_tree(&self, tree: &Tree) -> StoreResult<Hash> {
        let mut batch = self.begin_write(0);
        let id = batch.put_tree(tree);
        batch.flush()?;
        Ok(id)
    }

    /// Store a blob's framed body and metadata in one batch; returns the
    /// metadata written.
    fn put_blob(&self, blob: &Blob) -> StoreResult<BlobMetadata> {
        let mut batch = self.begin_write(blob.size() as usize + 64);
        let metadata = batch.put_blob(blob);
        batch.flush()?;
        Ok(metadata)
    }

    /// Fetch and parse a tree; absent keys resolve to `None`.
    async fn get_tree(&self, id: &Hash) -> StoreResult<Option<Tree>> {
        match self
            .get_async(KeySpace::Tree, id.as_bytes().to_vec())
            .await?
        {
            None => Ok(None),
            Some(data) => deserialize_tree(*id, &data).map(Some),
        }
    }

    /// Fetch and parse a blob; absent keys resolve to `None`.
    async fn get_blob(&self, id: &Hash) -> StoreResult<Option<Blob>> {
        match self
            .get_async(KeySpace::Blob, id.as_bytes().to_vec())
            .await?
        {
            None => Ok(None),
            Some(data) => deserialize_blob(*id, data).map(Some),
        }
    }

    /// Fetch and parse a blob metadata record; absent keys resolve to `None`.
    async fn get_blob_metadata(&self, id: &Hash) -> StoreResult<Option<BlobMetadata>> {
        match self
            .get_async(KeySpace::BlobMetadata, id.as_bytes().to_vec())
            .await?
        {
            None => Ok(None),
            Some(data) => BlobMetadata::parse(id, &data).map(Some),
        }
    }
}
