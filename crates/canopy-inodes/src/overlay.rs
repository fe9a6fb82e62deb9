use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use bytes::Bytes;

use canopy_types::{InodeNumber, PathComponent};

use crate::error::{FsError, FsResult};
use crate::tree::ChildEntry;

/// Per-inode storage for diverged state.
///
/// Files keep their full contents here once materialized; trees keep their
/// child descriptors. The engine is addressed purely by inode number.
pub trait Overlay: Send + Sync {
    /// Create an empty slot for a newly materialized inode.
    fn allocate(&self, ino: InodeNumber) -> FsResult<()>;

    /// Read up to `len` bytes at `offset`. Short reads past the end are
    /// normal; reads entirely past the end return an empty buffer.
    fn read(&self, ino: InodeNumber, offset: u64, len: u64) -> FsResult<Bytes>;

    /// Write at `offset`, zero-filling any gap. Returns the bytes written.
    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> FsResult<u64>;

    /// Grow (zero-filled) or shrink the file to `new_size`.
    fn truncate(&self, ino: InodeNumber, new_size: u64) -> FsResult<()>;

    /// Current file size. The default derives it from a full read; engines
    /// with cheaper metadata should override.
    fn size(&self, ino: InodeNumber) -> FsResult<u64> {
        Ok(self.read(ino, 0, u64::MAX)?.len() as u64)
    }

    /// Child descriptors of a materialized directory.
    fn list_children(&self, ino: InodeNumber) -> FsResult<BTreeMap<PathComponent, ChildEntry>>;

    /// Insert or replace one child descriptor.
    fn set_child(&self, ino: InodeNumber, name: &PathComponent, entry: ChildEntry)
        -> FsResult<()>;

    /// Remove one child descriptor. Removing an absent name is a no-op.
    fn remove_child(&self, ino: InodeNumber, name: &PathComponent) -> FsResult<()>;

    /// Drop an inode's slot entirely (after unlink, once unreferenced).
    fn free(&self, ino: InodeNumber) -> FsResult<()>;

    /// Make pending state durable.
    fn flush(&self) -> FsResult<()>;
}

#[derive(Default)]
struct OverlayNode {
    data: Vec<u8>,
    children: BTreeMap<PathComponent, ChildEntry>,
}

/// In-memory overlay for tests and ephemeral mounts.
pub struct MemoryOverlay {
    nodes: Mutex<HashMap<InodeNumber, OverlayNode>>,
}

impl MemoryOverlay {
    pub fn new() -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
        }
    }

    /// Number of allocated slots.
    pub fn len(&self) -> usize {
        self.nodes.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.lock().expect("lock poisoned").is_empty()
    }
}

impl Default for MemoryOverlay {
    fn default() -> Self {
        Self::new()
    }
}

impl Overlay for MemoryOverlay {
    fn allocate(&self, ino: InodeNumber) -> FsResult<()> {
        self.nodes
            .lock()
            .expect("lock poisoned")
            .entry(ino)
            .or_default();
        Ok(())
    }

    fn read(&self, ino: InodeNumber, offset: u64, len: u64) -> FsResult<Bytes> {
        let nodes = self.nodes.lock().expect("lock poisoned");
        let node = nodes
            .get(&ino)
            .ok_or_else(|| FsError::NotFound(format!("overlay slot for {ino}")))?;
        let start = (offset as usize).min(node.data.len());
        let end = offset
            .saturating_add(len)
            .min(node.data.len() as u64) as usize;
        Ok(Bytes::copy_from_slice(&node.data[start..end]))
    }

    fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> FsResult<u64> {
        let mut nodes = self.nodes.lock().expect("lock poisoned");
        let node = nodes
            .get_mut(&ino)
            .ok_or_else(|| FsError::NotFound(format!("overlay slot for {ino}")))?;
        let end = offset as usize + data.len();
        if node.data.len() < end {
            node.data.resize(end, 0);
        }
        node.data[offset as usize..end].copy_from_slice(data);
        Ok(data.len() as u64)
    }

    fn truncate(&self, ino: InodeNumber, new_size: u64) -> FsResult<()> {
        let mut nodes = self.nodes.lock().expect("lock poisoned");
        let node = nodes
            .get_mut(&ino)
            .ok_or_else(|| FsError::NotFound(format!("overlay slot for {ino}")))?;
        node.data.resize(new_size as usize, 0);
        Ok(())
    }

    fn size(&self, ino: InodeNumber) -> FsResult<u64> {
        let nodes = self.nodes.lock().expect("lock poisoned");
        let node = nodes
            .get(&ino)
            .ok_or_else(|| FsError::NotFound(format!("overlay slot for {ino}")))?;
        Ok(node.data.len() as u64)
    }

    fn list_children(&self, ino: InodeNumber) -> FsResult<BTreeMap<PathComponent, ChildEntry>> {
        let nodes = self.nodes.lock().expect("lock poisoned");
        let node = nodes
            .get(&ino)
            .ok_or_else(|| FsError::NotFound(format!("overlay slot for {ino}")))?;
        Ok(node.children.clone())
    }

    fn set_child(
        &self,
        ino: InodeNumber,
        name: &PathComponent,
        entry: ChildEntry,
    ) -> FsResult<()> {
        let mut nodes = self.nodes.lock().expect("lock poisoned");
        let node = nodes.entry(ino).or_default();
        node.children.insert(name.clone(), entry);
        Ok(())
    }

    fn remove_child(&self, ino: InodeNumber, name: &PathComponent) -> FsResult<()> {
        let mut nodes = self.nodes.lock().expect("lock poisoned");
        if let Some(node) = nodes.get_mut(&ino) {
            node.children.remove(name);
        }
        Ok(())
    }

    fn free(&self, ino: InodeNumber) -> FsResult<()> {
        self.nodes.lock().expect("lock poisoned").remove(&ino);
        Ok(())
    }

    fn flush(&self) -> FsResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_store::EntryKind;
    use canopy_types::Hash;

    fn ino(n: u64) -> InodeNumber {
        InodeNumber::new(n).unwrap()
    }

    fn name(s: &str) -> PathComponent {
        PathComponent::new(s).unwrap()
    }

    #[test]
    fn write_then_read_back() {
        let overlay = MemoryOverlay::new();
        overlay.allocate(ino(2)).unwrap();
        assert_eq!(overlay.write(ino(2), 0, b"hello").unwrap(), 5);
        assert_eq!(overlay.read(ino(2), 0, 5).unwrap().as_ref(), b"hello");
        assert_eq!(overlay.size(ino(2)).unwrap(), 5);
    }

    #[test]
    fn sparse_write_zero_fills() {
        let overlay = MemoryOverlay::new();
        overlay.allocate(ino(2)).unwrap();
        overlay.write(ino(2), 4, b"x").unwrap();
        assert_eq!(overlay.read(ino(2), 0, 10).unwrap().as_ref(), b"\0\0\0\0x");
    }

    #[test]
    fn read_past_end_is_empty() {
        let overlay = MemoryOverlay::new();
        overlay.allocate(ino(2)).unwrap();
        overlay.write(ino(2), 0, b"abc").unwrap();
        assert!(overlay.read(ino(2), 10, 5).unwrap().is_empty());
        assert_eq!(overlay.read(ino(2), 2, 10).unwrap().as_ref(), b"c");
    }

    #[test]
    fn truncate_grows_and_shrinks() {
        let overlay = MemoryOverlay::new();
        overlay.allocate(ino(2)).unwrap();
        overlay.write(ino(2), 0, b"abcdef").unwrap();
        overlay.truncate(ino(2), 3).unwrap();
        assert_eq!(overlay.read(ino(2), 0, 10).unwrap().as_ref(), b"abc");
        overlay.truncate(ino(2), 5).unwrap();
        assert_eq!(overlay.read(ino(2), 0, 10).unwrap().as_ref(), b"abc\0\0");
    }

    #[test]
    fn unallocated_slot_is_not_found() {
        let overlay = MemoryOverlay::new();
        assert!(matches!(
            overlay.read(ino(9), 0, 1),
            Err(FsError::NotFound(_))
        ));
    }

    #[test]
    fn children_roundtrip() {
        let overlay = MemoryOverlay::new();
        let entry = ChildEntry::new_local(EntryKind::Regular, 0o100644, ino(3));
        overlay.set_child(ino(1), &name("f"), entry.clone()).unwrap();
        overlay
            .set_child(
                ino(1),
                &name("g"),
                ChildEntry::from_source(EntryKind::SubTree, Hash::sha1(b"g")),
            )
            .unwrap();

        let children = overlay.list_children(ino(1)).unwrap();
        assert_eq!(children.len(), 2);
        assert_eq!(children[&name("f")], entry);

        overlay.remove_child(ino(1), &name("f")).unwrap();
        assert_eq!(overlay.list_children(ino(1)).unwrap().len(), 1);
        // Removing an absent name is a no-op.
        overlay.remove_child(ino(1), &name("f")).unwrap();
    }

    #[test]
    fn free_drops_slot() {
        let overlay = MemoryOverlay::new();
        overlay.allocate(ino(4)).unwrap();
        assert_eq!(overlay.len(), 1);
        overlay.free(ino(4)).unwrap();
        assert!(overlay.is_empty());
    }
}
