use std::sync::{Arc, Mutex};

use bytes::Bytes;
use tracing::debug;

use canopy_store::{BlobMetadata, ObjectStore};
use canopy_types::{Hash, InodeNumber, PathComponent};

use crate::base::{InodeBase, InodeKind, InodeMetadata};
use crate::error::{FsError, FsResult};
use crate::overlay::Overlay;

/// A file inode is either *clean* (contents live in the object store under
/// a source hash, with the blob metadata cached from load time) or
/// *materialized* (contents live in the overlay under this inode number).
enum FileState {
    Clean {
        source: Hash,
        metadata: BlobMetadata,
    },
    Materialized,
}

/// Regular file or symlink inode.
pub struct FileInode {
    base: InodeBase,
    state: Mutex<FileState>,
    /// Serializes writes and the clean→materialized transition; reads of a
    /// clean file never take it.
    write_lock: tokio::sync::Mutex<()>,
}

impl FileInode {
    /// Clean file backed by a source blob.
    pub fn new_clean(
        ino: InodeNumber,
        parent: InodeNumber,
        name: PathComponent,
        metadata: InodeMetadata,
        source: Hash,
        blob_metadata: BlobMetadata,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: InodeBase::new(ino, InodeKind::File, Some(parent), Some(name), metadata),
            state: Mutex::new(FileState::Clean {
                source,
                metadata: blob_metadata,
            }),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Overlay-backed file (freshly created, or restored after divergence).
    pub fn new_materialized(
        ino: InodeNumber,
        parent: InodeNumber,
        name: PathComponent,
        metadata: InodeMetadata,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: InodeBase::new(ino, InodeKind::File, Some(parent), Some(name), metadata),
            state: Mutex::new(FileState::Materialized),
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn base(&self) -> &InodeBase {
        &self.base
    }

    pub fn is_materialized(&self) -> bool {
        matches!(
            *self.state.lock().expect("lock poisoned"),
            FileState::Materialized
        )
    }

    /// The source hash while clean.
    pub fn source_hash(&self) -> Option<Hash> {
        match *self.state.lock().expect("lock poisoned") {
            FileState::Clean { source, .. } => Some(source),
            FileState::Materialized => None,
        }
    }

    /// Current size without touching contents.
    pub fn size(&self, overlay: &dyn Overlay) -> FsResult<u64> {
        match *self.state.lock().expect("lock poisoned") {
            FileState::Clean { metadata, .. } => Ok(metadata.size),
            FileState::Materialized => overlay.size(self.base.ino()),
        }
    }

    /// Read up to `len` bytes at `offset`.
    pub async fn read(
        &self,
        store: &ObjectStore,
        overlay: &dyn Overlay,
        offset: u64,
        len: u64,
    ) -> FsResult<Bytes> {
        let source = match *self.state.lock().expect("lock poisoned") {
            FileState::Materialized => return overlay.read(self.base.ino(), offset, len),
            FileState::Clean { source, .. } => source,
        };

        let blob = store
            .get_blob(&source)
            .await?
            .ok_or_else(|| FsError::NotFound(format!("source blob {source}")))?;
        let data = blob.to_bytes();
        let start = (offset as usize).min(data.len());
        let end = offset.saturating_add(len).min(data.len() as u64) as usize;
        Ok(data.slice(start..end))
    }

    /// Copy the clean contents into the overlay and flip state. Returns
    /// `true` when this call performed the transition.
    ///
    /// With `keep_contents` false the overlay slot starts empty, which lets
    /// truncate-to-zero skip the blob fetch entirely.
    pub async fn materialize(
        &self,
        store: &ObjectStore,
        overlay: &dyn Overlay,
        keep_contents: bool,
    ) -> FsResult<bool> {
        let _guard = self.write_lock.lock().await;
        self.materialize_locked(store, overlay, keep_contents).await
    }

    async fn materialize_locked(
        &self,
        store: &ObjectStore,
        overlay: &dyn Overlay,
        keep_contents: bool,
    ) -> FsResult<bool> {
        let source = match *self.state.lock().expect("lock poisoned") {
            FileState::Materialized => return Ok(false),
            FileState::Clean { source, .. } => source,
        };

        overlay.allocate(self.base.ino())?;
        if keep_contents {
            let blob = store
                .get_blob(&source)
                .await?
                .ok_or_else(|| FsError::NotFound(format!("source blob {source}")))?;
            let mut offset = 0u64;
            for chunk in blob.chunks() {
                overlay.write(self.base.ino(), offset, chunk)?;
                offset += chunk.len() as u64;
            }
        }

        *self.state.lock().expect("lock poisoned") = FileState::Materialized;
        debug!(ino = %self.base.ino(), %source, kept = keep_contents, "file materialized");
        Ok(true)
    }

    /// Write at `offset`, materializing first if needed. Returns the bytes
    /// written and whether this write performed the transition.
    pub async fn write(
        &self,
        store: &ObjectStore,
        overlay: &dyn Overlay,
        offset: u64,
        data: &[u8],
    ) -> FsResult<(u64, bool)> {
        let _guard = self.write_lock.lock().await;
        let transitioned = self.materialize_locked(store, overlay, true).await?;
        let written = overlay.write(self.base.ino(), offset, data)?;
        Ok((written, transitioned))
    }

    /// Set the file length, materializing first if needed. Returns whether
    /// this call performed the transition.
    pub async fn truncate(
        &self,
        store: &ObjectStore,
        overlay: &dyn Overlay,
        new_size: u64,
    ) -> FsResult<bool> {
        let _guard = self.write_lock.lock().await;
        // Truncation to zero discards the source contents, so skip the fetch.
        let transitioned = self
            .materialize_locked(store, overlay, new_size > 0)
            .await?;
        overlay.truncate(self.base.ino(), new_size)?;
        Ok(transitioned)
    }

    /// Symlink target. Fails for non-symlink modes.
    pub async fn readlink(
        &self,
        store: &ObjectStore,
        overlay: &dyn Overlay,
    ) -> FsResult<String> {
        if !self.base.metadata().is_symlink() {
            return Err(FsError::InvalidArgument(format!(
                "{} is not a symlink",
                self.base.ino()
            )));
        }
        let target = self.read(store, overlay, 0, u64::MAX).await?;
        String::from_utf8(target.to_vec())
            .map_err(|_| FsError::InvalidArgument("symlink target is not utf-8".into()))
    }

    /// sha-1 of the current contents. Served from the cached blob metadata
    /// while clean; recomputed from the overlay once materialized.
    pub async fn content_sha1(
        &self,
        _store: &ObjectStore,
        overlay: &dyn Overlay,
    ) -> FsResult<Hash> {
        match *self.state.lock().expect("lock poisoned") {
            FileState::Clean { metadata, .. } => Ok(metadata.content_hash),
            FileState::Materialized => {
                let data = overlay.read(self.base.ino(), 0, u64::MAX)?;
                Ok(Hash::sha1(&data))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::MemoryOverlay;
    use canopy_store::{FakeBackingStore, LocalStore, MemoryLocalStore, ObjectStore};
    use std::time::SystemTime;

    fn fixture(contents: &[u8]) -> (Arc<FileInode>, ObjectStore, MemoryOverlay) {
        let backing = Arc::new(FakeBackingStore::new());
        let blob_id = backing.add_blob(contents);
        let local: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let store = ObjectStore::new(local, backing);

        let file = FileInode::new_clean(
            InodeNumber::new(2).unwrap(),
            InodeNumber::ROOT,
            PathComponent::new("f").unwrap(),
            InodeMetadata::new(0o100644, 0, 0, SystemTime::now()),
            blob_id,
            BlobMetadata {
                content_hash: Hash::sha1(contents),
                size: contents.len() as u64,
            },
        );
        (file, store, MemoryOverlay::new())
    }

    #[tokio::test]
    async fn clean_read_comes_from_store() {
        let (file, store, overlay) = fixture(b"hello");
        let data = file.read(&store, &overlay, 0, 5).await.unwrap();
        assert_eq!(data.as_ref(), b"hello");
        assert!(!file.is_materialized());
        assert_eq!(file.size(&overlay).unwrap(), 5);
    }

    #[tokio::test]
    async fn partial_reads_slice_the_blob() {
        let (file, store, overlay) = fixture(b"hello world");
        let data = file.read(&store, &overlay, 6, 5).await.unwrap();
        assert_eq!(data.as_ref(), b"world");
        let past_end = file.read(&store, &overlay, 100, 5).await.unwrap();
        assert!(past_end.is_empty());
    }

    #[tokio::test]
    async fn write_materializes_and_persists() {
        let (file, store, overlay) = fixture(b"hello");
        let (written, transitioned) = file.write(&store, &overlay, 0, b"HELLO").await.unwrap();
        assert_eq!(written, 5);
        assert!(transitioned);
        assert!(file.is_materialized());
        assert_eq!(file.source_hash(), None);

        let data = file.read(&store, &overlay, 0, 5).await.unwrap();
        assert_eq!(data.as_ref(), b"HELLO");

        // Second write does not transition again.
        let (_, transitioned) = file.write(&store, &overlay, 5, b"!").await.unwrap();
        assert!(!transitioned);
        assert_eq!(file.size(&overlay).unwrap(), 6);
    }

    #[tokio::test]
    async fn partial_write_keeps_source_contents() {
        let (file, store, overlay) = fixture(b"hello world");
        file.write(&store, &overlay, 0, b"J").await.unwrap();
        let data = file.read(&store, &overlay, 0, 11).await.unwrap();
        assert_eq!(data.as_ref(), b"Jello world");
    }

    #[tokio::test]
    async fn truncate_to_zero_skips_the_fetch() {
        let (file, store, overlay) = fixture(b"contents");
        let transitioned = file.truncate(&store, &overlay, 0).await.unwrap();
        assert!(transitioned);
        assert_eq!(file.size(&overlay).unwrap(), 0);
    }

    #[tokio::test]
    async fn truncate_shrinks_kept_contents() {
        let (file, store, overlay) = fixture(b"abcdef");
        file.truncate(&store, &overlay, 3).await.unwrap();
        let data = file.read(&store, &overlay, 0, 10).await.unwrap();
        assert_eq!(data.as_ref(), b"abc");
    }

    #[tokio::test]
    async fn content_hash_tracks_state() {
        let (file, store, overlay) = fixture(b"hello");
        assert_eq!(
            file.content_sha1(&store, &overlay).await.unwrap(),
            Hash::sha1(b"hello")
        );
        file.write(&store, &overlay, 0, b"HELLO").await.unwrap();
        assert_eq!(
            file.content_sha1(&store, &overlay).await.unwrap(),
            Hash::sha1(b"HELLO")
        );
    }

    #[tokio::test]
    async fn readlink_rejects_regular_files() {
        let (file, store, overlay) = fixture(b"hello");
        assert!(matches!(
            file.readlink(&store, &overlay).await,
            Err(FsError::InvalidArgument(_))
        ));
    }

    #[tokio::test]
    async fn readlink_returns_target() {
        let backing = Arc::new(FakeBackingStore::new());
        let target_id = backing.add_blob(b"../target");
        let local: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let store = ObjectStore::new(local, backing);
        let overlay = MemoryOverlay::new();

        let link = FileInode::new_clean(
            InodeNumber::new(3).unwrap(),
            InodeNumber::ROOT,
            PathComponent::new("l").unwrap(),
            InodeMetadata::new(0o120777, 0, 0, SystemTime::now()),
            target_id,
            BlobMetadata {
                content_hash: Hash::sha1(b"../target"),
                size: 9,
            },
        );
        assert_eq!(link.readlink(&store, &overlay).await.unwrap(), "../target");
    }
}
