use std::sync::Arc;

use async_trait::async_trait;
use canopy_types::Hash;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::key_space::KeySpace;
use crate::local::LocalStore;
use crate::object::{Blob, BlobMetadata, Tree};

/// External importer that can produce objects the local store has never
/// seen. May be multi-layered internally; the facade does not inspect it.
#[async_trait]
pub trait BackingStore: Send + Sync {
    /// Fetch a tree by hash; `None` if the backing source has no such object.
    async fn fetch_tree(&self, id: &Hash) -> StoreResult<Option<Tree>>;

    /// Fetch a blob by hash; `None` if the backing source has no such object.
    async fn fetch_blob(&self, id: &Hash) -> StoreResult<Option<Blob>>;

    /// Resolve a commit id to its root tree.
    async fn fetch_tree_for_commit(&self, commit: &Hash) -> StoreResult<Option<Tree>>;
}

/// Resolves logical object ids to parsed trees and blobs.
///
/// Reads consult the local store first and delegate misses to the backing
/// importer, caching whatever it returns. Imported blobs are written
/// together with their metadata record in one batch, so later size and
/// hash queries are served locally.
pub struct ObjectStore {
    local: Arc<dyn LocalStore>,
    backing: Arc<dyn BackingStore>,
}

impl ObjectStore {
    pub fn new(local: Arc<dyn LocalStore>, backing: Arc<dyn BackingStore>) -> Self {
        Self { local, backing }
    }

    /// The underlying local store.
    pub fn local(&self) -> &Arc<dyn LocalStore> {
        &self.local
    }

    /// Resolve a tree, importing and caching on a local miss.
    pub async fn get_tree(&self, id: &Hash) -> StoreResult<Option<Tree>> {
        if let Some(tree) = self.local.get_tree(id).await? {
            return Ok(Some(tree));
        }
        match self.backing.fetch_tree(id).await? {
            None => Ok(None),
            Some(tree) => {
                self.local.put_tree(&tree)?;
                debug!(%id, "tree imported");
                Ok(Some(tree))
            }
        }
    }

    /// Resolve a blob, importing and caching on a local miss.
    pub async fn get_blob(&self, id: &Hash) -> StoreResult<Option<Blob>> {
        if let Some(blob) = self.local.get_blob(id).await? {
            return Ok(Some(blob));
        }
        match self.backing.fetch_blob(id).await? {
            None => Ok(None),
            Some(blob) => {
                self.local.put_blob(&blob)?;
                debug!(%id, size = blob.size(), "blob imported");
                Ok(Some(blob))
            }
        }
    }

    /// Resolve a blob's size and content hash without handing back the body.
    pub async fn get_blob_metadata(&self, id: &Hash) -> StoreResult<Option<BlobMetadata>> {
        if let Some(metadata) = self.local.get_blob_metadata(id).await? {
            return Ok(Some(metadata));
        }
        // Importing the blob caches both the body and the metadata record.
        match self.backing.fetch_blob(id).await? {
            None => Ok(None),
            Some(blob) => Ok(Some(self.local.put_blob(&blob)?)),
        }
    }

    /// Resolve a commit id to its root tree via the commit→tree key space,
    /// importing and caching the edge on a miss.
    pub async fn get_tree_for_commit(&self, commit: &Hash) -> StoreResult<Option<Tree>> {
        if let Some(edge) = self
            .local
            .get_async(KeySpace::CommitToTree, commit.as_bytes().to_vec())
            .await?
        {
            let tree_id = Hash::from_bytes(&edge).map_err(|e| StoreError::Parse {
                what: "commit edge",
                key: *commit,
                reason: e.to_string(),
            })?;
            if let Some(tree) = self.get_tree(&tree_id).await? {
                return Ok(Some(tree));
            }
        }
        match self.backing.fetch_tree_for_commit(commit).await? {
            None => Ok(None),
            Some(tree) => {
                let id = self.local.put_tree(&tree)?;
                self.local
                    .put(KeySpace::CommitToTree, commit.as_bytes(), id.as_bytes())?;
                debug!(%commit, tree = %id, "commit edge imported");
                Ok(Some(tree))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeBackingStore;
    use crate::memory::MemoryLocalStore;
    use crate::object::{EntryKind, TreeEntry};
    use bytes::Bytes;
    use canopy_types::PathComponent;

    fn facade() -> (Arc<FakeBackingStore>, ObjectStore) {
        let backing = Arc::new(FakeBackingStore::new());
        let local: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let store = ObjectStore::new(local, backing.clone());
        (backing, store)
    }

    #[tokio::test]
    async fn miss_imports_and_caches_blob() {
        let (backing, store) = facade();
        let id = backing.add_blob(b"contents");

        let first = store.get_blob(&id).await.unwrap().unwrap();
        assert_eq!(first.to_bytes().as_ref(), b"contents");
        assert_eq!(backing.blob_fetches(&id), 1);

        // Second read is served from the local store.
        let second = store.get_blob(&id).await.unwrap().unwrap();
        assert_eq!(second.to_bytes().as_ref(), b"contents");
        assert_eq!(backing.blob_fetches(&id), 1);
    }

    #[tokio::test]
    async fn absent_object_resolves_to_none() {
        let (_backing, store) = facade();
        assert!(store.get_blob(&Hash::sha1(b"nope")).await.unwrap().is_none());
        assert!(store.get_tree(&Hash::sha1(b"nope")).await.unwrap().is_none());
        assert!(store
            .get_blob_metadata(&Hash::sha1(b"nope"))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn metadata_import_caches_body_too() {
        let (backing, store) = facade();
        let id = backing.add_blob(b"sized");

        let meta = store.get_blob_metadata(&id).await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.content_hash, Hash::sha1(b"sized"));
        assert_eq!(backing.blob_fetches(&id), 1);

        // Body read now hits the cache populated by the metadata import.
        store.get_blob(&id).await.unwrap().unwrap();
        assert_eq!(backing.blob_fetches(&id), 1);
    }

    #[tokio::test]
    async fn tree_miss_imports_and_caches() {
        let (backing, store) = facade();
        let blob_id = backing.add_blob(b"file body");
        let tree_id = backing.add_tree(vec![TreeEntry::new(
            PathComponent::new("file").unwrap(),
            EntryKind::Regular,
            blob_id,
        )]);

        let tree = store.get_tree(&tree_id).await.unwrap().unwrap();
        assert_eq!(tree.len(), 1);
        assert_eq!(backing.tree_fetches(&tree_id), 1);

        store.get_tree(&tree_id).await.unwrap().unwrap();
        assert_eq!(backing.tree_fetches(&tree_id), 1);
    }

    #[tokio::test]
    async fn commit_resolution_caches_edge() {
        let (backing, store) = facade();
        let tree_id = backing.add_tree(vec![]);
        let commit = Hash::sha1(b"commit-1");
        backing.set_tree_for_commit(commit, tree_id);

        let tree = store.get_tree_for_commit(&commit).await.unwrap().unwrap();
        assert_eq!(tree.hash(), &tree_id);

        // The edge is now local; the backing store is not consulted again.
        let commit_fetches_before = backing.commit_fetches(&commit);
        store.get_tree_for_commit(&commit).await.unwrap().unwrap();
        assert_eq!(backing.commit_fetches(&commit), commit_fetches_before);
    }

    #[tokio::test]
    async fn clear_caches_is_transparent_to_reads() {
        let (backing, store) = facade();
        let id = backing.add_blob(b"transparent");

        let before = store.get_blob(&id).await.unwrap().unwrap();
        store.local().clear_caches().unwrap();
        let after = store.get_blob(&id).await.unwrap().unwrap();
        assert_eq!(before.to_bytes(), after.to_bytes());
        // The reclaim forced one re-import.
        assert_eq!(backing.blob_fetches(&id), 2);
    }

    #[tokio::test]
    async fn chunked_blob_import_is_byte_exact() {
        let (backing, store) = facade();
        let blob = Blob::from_chunks(
            Hash::zero(),
            vec![Bytes::from_static(b"part one "), Bytes::from_static(b"part two")],
        );
        let id = backing.add_blob_object(blob);

        let fetched = store.get_blob(&id).await.unwrap().unwrap();
        assert_eq!(fetched.to_bytes().as_ref(), b"part one part two");
    }
}
