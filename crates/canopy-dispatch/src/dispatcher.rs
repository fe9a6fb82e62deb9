use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::debug;

use canopy_inodes::{DirListEntry, FsResult, InodeAttr, Mount, SetAttrChanges};
use canopy_types::{InodeNumber, PathComponent};

/// Cache lifetime handed to the kernel for clean inodes. A clean inode
/// cannot change without going through this service, so caching is safe;
/// materialized inodes get zero.
pub const CLEAN_CACHE_TTL: Duration = Duration::from_secs(1);

/// Attribute reply with its kernel cache lifetime.
#[derive(Clone, Copy, Debug)]
pub struct AttrReply {
    pub attr: InodeAttr,
    pub attr_ttl: Duration,
}

/// Entry reply: the looked-up inode's attributes plus entry and attribute
/// lifetimes. The kernel's lookup count on `attr.ino` was incremented by
/// one before this reply was produced.
#[derive(Clone, Copy, Debug)]
pub struct EntryReply {
    pub attr: InodeAttr,
    pub entry_ttl: Duration,
    pub attr_ttl: Duration,
}

/// Reply to open/opendir/create: an opaque handle number.
#[derive(Clone, Copy, Debug)]
pub struct OpenReply {
    pub fh: u64,
}

/// Reply to create: the new entry plus an open handle.
#[derive(Clone, Copy, Debug)]
pub struct CreateReply {
    pub entry: EntryReply,
    pub fh: u64,
}

fn ttl_for(attr: &InodeAttr) -> Duration {
    if attr.materialized {
        Duration::ZERO
    } else {
        CLEAN_CACHE_TTL
    }
}

/// Stateless adapter from decoded kernel requests to mount operations.
///
/// Holds nothing but a reference to the mount; safe for concurrent
/// invocation from any number of protocol worker threads. Every method
/// returns an eventual value — the protocol layer resumes the kernel
/// request when it is ready, and maps errors through
/// [`errno_for`](crate::errno_for).
pub struct Dispatcher {
    mount: Arc<Mount>,
    next_fh: AtomicU64,
}

impl Dispatcher {
    pub fn new(mount: Arc<Mount>) -> Self {
        Self {
            mount,
            next_fh: AtomicU64::new(1),
        }
    }

    pub fn mount(&self) -> &Arc<Mount> {
        &self.mount
    }

    fn entry_reply(&self, attr: InodeAttr) -> EntryReply {
        // The reply hands the kernel a reference on the child.
        self.mount.map().inc_fs_refcount(attr.ino, 1);
        let ttl = ttl_for(&attr);
        EntryReply {
            attr,
            entry_ttl: ttl,
            attr_ttl: ttl,
        }
    }

    fn issue_fh(&self) -> u64 {
        self.next_fh.fetch_add(1, Ordering::Relaxed)
    }

    pub async fn getattr(&self, ino: InodeNumber) -> FsResult<AttrReply> {
        let attr = self.mount.getattr(ino).await?;
        Ok(AttrReply {
            attr_ttl: ttl_for(&attr),
            attr,
        })
    }

    pub async fn setattr(
        &self,
        ino: InodeNumber,
        changes: SetAttrChanges,
    ) -> FsResult<AttrReply> {
        let attr = self.mount.setattr(ino, changes).await?;
        Ok(AttrReply {
            attr_ttl: ttl_for(&attr),
            attr,
        })
    }

    pub async fn lookup(&self, parent: InodeNumber, name: &str) -> FsResult<EntryReply> {
        let name = parse_name(name)?;
        let attr = self.mount.lookup(parent, &name).await?;
        Ok(self.entry_reply(attr))
    }

    /// Forget has no reply and must never fail.
    pub fn forget(&self, ino: InodeNumber, nlookup: u64) {
        debug!(%ino, nlookup, "forget");
        self.mount.forget(ino, nlookup);
    }

    pub async fn open(&self, ino: InodeNumber, _flags: i32) -> FsResult<OpenReply> {
        self.mount.open_file(ino).await?;
        Ok(OpenReply { fh: self.issue_fh() })
    }

    pub async fn opendir(&self, ino: InodeNumber, _flags: i32) -> FsResult<OpenReply> {
        self.mount.open_dir(ino).await?;
        Ok(OpenReply { fh: self.issue_fh() })
    }

    pub async fn readdir(
        &self,
        ino: InodeNumber,
        offset: u64,
        limit: usize,
    ) -> FsResult<Vec<DirListEntry>> {
        self.mount.readdir(ino, offset, limit).await
    }

    pub async fn create(
        &self,
        parent: InodeNumber,
        name: &str,
        mode: u32,
        _flags: i32,
    ) -> FsResult<CreateReply> {
        let name = parse_name(name)?;
        let attr = self.mount.create(parent, &name, mode).await?;
        Ok(CreateReply {
            entry: self.entry_reply(attr),
            fh: self.issue_fh(),
        })
    }

    pub async fn read(&self, ino: InodeNumber, offset: u64, len: u64) -> FsResult<Bytes> {
        self.mount.read(ino, offset, len).await
    }

    pub async fn write(&self, ino: InodeNumber, offset: u64, data: &[u8]) -> FsResult<u64> {
        self.mount.write(ino, offset, data).await
    }

    pub async fn readlink(&self, ino: InodeNumber) -> FsResult<String> {
        self.mount.readlink(ino).await
    }

    pub async fn mknod(
        &self,
        parent: InodeNumber,
        name: &str,
        mode: u32,
        rdev: u32,
    ) -> FsResult<EntryReply> {
        let name = parse_name(name)?;
        let attr = self.mount.mknod(parent, &name, mode, rdev).await?;
        Ok(self.entry_reply(attr))
    }

    pub async fn mkdir(
        &self,
        parent: InodeNumber,
        name: &str,
        mode: u32,
    ) -> FsResult<EntryReply> {
        let name = parse_name(name)?;
        let attr = self.mount.mkdir(parent, &name, mode).await?;
        Ok(self.entry_reply(attr))
    }

    pub async fn symlink(
        &self,
        parent: InodeNumber,
        name: &str,
        target: &str,
    ) -> FsResult<EntryReply> {
        let name = parse_name(name)?;
        let attr = self.mount.symlink(parent, &name, target).await?;
        Ok(self.entry_reply(attr))
    }

    pub async fn link(
        &self,
        ino: InodeNumber,
        new_parent: InodeNumber,
        new_name: &str,
    ) -> FsResult<EntryReply> {
        let new_name = parse_name(new_name)?;
        let attr = self.mount.link(ino, new_parent, &new_name).await?;
        Ok(self.entry_reply(attr))
    }

    pub async fn unlink(&self, parent: InodeNumber, name: &str) -> FsResult<()> {
        let name = parse_name(name)?;
        self.mount.unlink(parent, &name).await
    }

    pub async fn rmdir(&self, parent: InodeNumber, name: &str) -> FsResult<()> {
        let name = parse_name(name)?;
        self.mount.rmdir(parent, &name).await
    }

    pub async fn rename(
        &self,
        parent: InodeNumber,
        name: &str,
        new_parent: InodeNumber,
        new_name: &str,
    ) -> FsResult<()> {
        let name = parse_name(name)?;
        let new_name = parse_name(new_name)?;
        self.mount.rename(parent, &name, new_parent, &new_name).await
    }

    pub async fn getxattr(&self, ino: InodeNumber, name: &str) -> FsResult<String> {
        self.mount.getxattr(ino, name).await
    }

    pub async fn listxattr(&self, ino: InodeNumber) -> FsResult<Vec<String>> {
        self.mount.listxattr(ino).await
    }
}

fn parse_name(name: &str) -> FsResult<PathComponent> {
    PathComponent::new(name)
        .map_err(|e| canopy_inodes::FsError::InvalidArgument(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use canopy_inodes::{FsError, MemoryOverlay, MountConfig, Overlay};
    use canopy_journal::{DeltaKind, Journal, JournalConfig};
    use canopy_store::{
        EntryKind, FakeBackingStore, LocalStore, MemoryLocalStore, ObjectStore, TreeEntry,
    };
    use canopy_types::{Hash, PathComponent};

    struct Harness {
        backing: Arc<FakeBackingStore>,
        dispatcher: Dispatcher,
        blob_a: Hash,
    }

    fn name(s: &str) -> PathComponent {
        PathComponent::new(s).unwrap()
    }

    /// Mount a root tree with two files: `a` = "hello" (5 bytes) and
    /// `b` = "foo" (3 bytes).
    async fn harness() -> Harness {
        let backing = Arc::new(FakeBackingStore::new());
        let blob_a = backing.add_blob(b"hello");
        let blob_b = backing.add_blob(b"foo");
        let root = backing.add_tree(vec![
            TreeEntry::new(name("a"), EntryKind::Regular, blob_a),
            TreeEntry::new(name("b"), EntryKind::Regular, blob_b),
        ]);

        let local: Arc<dyn LocalStore> = Arc::new(MemoryLocalStore::new());
        let store = Arc::new(ObjectStore::new(local, backing.clone()));
        let overlay: Arc<dyn Overlay> = Arc::new(MemoryOverlay::new());
        let journal = Arc::new(Journal::new(JournalConfig::default()));
        let mount = Mount::new(MountConfig::default(), store, overlay, journal, root)
            .await
            .unwrap();

        Harness {
            backing,
            dispatcher: Dispatcher::new(mount),
            blob_a,
        }
    }

    // -----------------------------------------------------------------------
    // Scenario 1: mount, stat, lookup, read
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn mounted_tree_serves_reads() {
        let h = harness().await;

        let root = h.dispatcher.getattr(InodeNumber::ROOT).await.unwrap();
        assert_eq!(root.attr.mode & 0o170000, 0o040000);
        assert_eq!(root.attr.nlink, 2);

        let entry = h.dispatcher.lookup(InodeNumber::ROOT, "a").await.unwrap();
        assert_eq!(entry.attr.ino.get(), 2);
        assert_eq!(entry.attr.size, 5);

        let data = h.dispatcher.read(entry.attr.ino, 0, 5).await.unwrap();
        assert_eq!(data.as_ref(), b"hello");
    }

    // -----------------------------------------------------------------------
    // Scenario 2: write, re-read, parent materialization, journal delta
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn write_is_visible_and_journaled() {
        let h = harness().await;
        let entry = h.dispatcher.lookup(InodeNumber::ROOT, "a").await.unwrap();

        h.dispatcher
            .write(entry.attr.ino, 0, b"HELLO")
            .await
            .unwrap();
        let data = h.dispatcher.read(entry.attr.ino, 0, 5).await.unwrap();
        assert_eq!(data.as_ref(), b"HELLO");

        let root = h.dispatcher.getattr(InodeNumber::ROOT).await.unwrap();
        assert!(root.attr.materialized);

        let journal = h.dispatcher.mount().journal();
        let range = journal.read_range(1, journal.latest_seq()).unwrap();
        let changed: Vec<_> = range
            .deltas()
            .iter()
            .filter(|d| d.kind == DeltaKind::Changed)
            .collect();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].paths[0].as_str(), "a");
    }

    // -----------------------------------------------------------------------
    // Scenario 3: create semantics and listing order
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn create_is_exclusive_and_listed_in_order() {
        let h = harness().await;
        h.dispatcher.lookup(InodeNumber::ROOT, "a").await.unwrap();

        let created = h
            .dispatcher
            .create(InodeNumber::ROOT, "c", 0o644, 0)
            .await
            .unwrap();
        assert!(created.entry.attr.ino.get() >= 3);
        assert!(created.fh > 0);

        let err = h
            .dispatcher
            .create(InodeNumber::ROOT, "c", 0o644, 0)
            .await
            .unwrap_err();
        assert_eq!(crate::errno::errno_for(&err), libc::EEXIST);

        let listing = h
            .dispatcher
            .readdir(InodeNumber::ROOT, 0, 100)
            .await
            .unwrap();
        let names: Vec<_> = listing.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec![".", "..", "a", "b", "c"]);
    }

    // -----------------------------------------------------------------------
    // Scenario 4 lives with the store (framed body and 28-byte metadata).
    // Scenario 5: concurrent lookup issues one backing fetch
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn concurrent_lookup_shares_one_fetch() {
        let h = harness().await;

        let (r1, r2) = tokio::join!(
            h.dispatcher.lookup(InodeNumber::ROOT, "a"),
            h.dispatcher.lookup(InodeNumber::ROOT, "a"),
        );
        let (e1, e2) = (r1.unwrap(), r2.unwrap());
        assert_eq!(e1.attr.ino, e2.attr.ino);
        assert_eq!(h.backing.blob_fetches(&h.blob_a), 1);

        // Both replies handed the kernel a reference.
        let map = h.dispatcher.mount().map();
        assert_eq!(map.fs_refcount(e1.attr.ino), Some(2));
    }

    // -----------------------------------------------------------------------
    // Scenario 6: forget, unload, fresh number
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn forget_unload_fresh_number() {
        let h = harness().await;
        let entry = h.dispatcher.lookup(InodeNumber::ROOT, "a").await.unwrap();
        let first = entry.attr.ino;

        h.dispatcher.forget(first, 1);
        assert_eq!(h.dispatcher.mount().map().unload_unreferenced(), 1);

        let fresh = h.dispatcher.lookup(InodeNumber::ROOT, "a").await.unwrap();
        assert_ne!(fresh.attr.ino, first);
    }

    #[tokio::test]
    async fn modified_inode_survives_forget() {
        let h = harness().await;
        let entry = h.dispatcher.lookup(InodeNumber::ROOT, "a").await.unwrap();
        h.dispatcher.write(entry.attr.ino, 0, b"X").await.unwrap();

        h.dispatcher.forget(entry.attr.ino, 1);
        assert_eq!(h.dispatcher.mount().map().unload_unreferenced(), 0);

        let again = h.dispatcher.lookup(InodeNumber::ROOT, "a").await.unwrap();
        assert_eq!(again.attr.ino, entry.attr.ino);
    }

    // -----------------------------------------------------------------------
    // TTL policy
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn clean_inodes_get_positive_ttls() {
        let h = harness().await;
        let entry = h.dispatcher.lookup(InodeNumber::ROOT, "a").await.unwrap();
        assert_eq!(entry.attr_ttl, CLEAN_CACHE_TTL);
        assert_eq!(entry.entry_ttl, CLEAN_CACHE_TTL);

        h.dispatcher.write(entry.attr.ino, 0, b"X").await.unwrap();
        let attr = h.dispatcher.getattr(entry.attr.ino).await.unwrap();
        assert_eq!(attr.attr_ttl, Duration::ZERO);
    }

    // -----------------------------------------------------------------------
    // Misc adapter behavior
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn invalid_names_are_rejected_up_front() {
        let h = harness().await;
        let err = h
            .dispatcher
            .lookup(InodeNumber::ROOT, "bad/name")
            .await
            .unwrap_err();
        assert_eq!(crate::errno::errno_for(&err), libc::EINVAL);

        let err = h
            .dispatcher
            .create(InodeNumber::ROOT, "..", 0o644, 0)
            .await
            .unwrap_err();
        assert_eq!(crate::errno::errno_for(&err), libc::EINVAL);
    }

    #[tokio::test]
    async fn open_checks_inode_kind() {
        let h = harness().await;
        let entry = h.dispatcher.lookup(InodeNumber::ROOT, "a").await.unwrap();

        assert!(h.dispatcher.open(entry.attr.ino, 0).await.is_ok());
        assert!(h.dispatcher.opendir(InodeNumber::ROOT, 0).await.is_ok());

        let err = h.dispatcher.opendir(entry.attr.ino, 0).await.unwrap_err();
        assert_eq!(crate::errno::errno_for(&err), libc::ENOTDIR);
        let err = h.dispatcher.open(InodeNumber::ROOT, 0).await.unwrap_err();
        assert_eq!(crate::errno::errno_for(&err), libc::EISDIR);
    }

    #[tokio::test]
    async fn file_handles_are_distinct() {
        let h = harness().await;
        let a = h.dispatcher.opendir(InodeNumber::ROOT, 0).await.unwrap();
        let b = h.dispatcher.opendir(InodeNumber::ROOT, 0).await.unwrap();
        assert_ne!(a.fh, b.fh);
    }

    #[tokio::test]
    async fn failed_operations_append_no_journal_entry() {
        let h = harness().await;
        let journal = h.dispatcher.mount().journal();
        let before = journal.latest_seq();

        let _ = h.dispatcher.unlink(InodeNumber::ROOT, "missing").await;
        let _ = h
            .dispatcher
            .rename(InodeNumber::ROOT, "missing", InodeNumber::ROOT, "x")
            .await;
        let _ = h.dispatcher.create(InodeNumber::ROOT, "a", 0o644, 0).await;

        assert_eq!(journal.latest_seq(), before);
    }

    #[tokio::test]
    async fn rename_then_lookup_preserves_number() {
        let h = harness().await;
        let entry = h.dispatcher.lookup(InodeNumber::ROOT, "a").await.unwrap();

        h.dispatcher
            .rename(InodeNumber::ROOT, "a", InodeNumber::ROOT, "renamed")
            .await
            .unwrap();

        let moved = h
            .dispatcher
            .lookup(InodeNumber::ROOT, "renamed")
            .await
            .unwrap();
        assert_eq!(moved.attr.ino, entry.attr.ino);
    }

    #[tokio::test]
    async fn xattr_surface() {
        let h = harness().await;
        let entry = h.dispatcher.lookup(InodeNumber::ROOT, "a").await.unwrap();

        let sha = h
            .dispatcher
            .getxattr(entry.attr.ino, canopy_inodes::XATTR_SHA1)
            .await
            .unwrap();
        assert_eq!(sha, Hash::sha1(b"hello").to_hex());

        let err = h
            .dispatcher
            .getxattr(entry.attr.ino, "user.unknown")
            .await
            .unwrap_err();
        assert_eq!(crate::errno::errno_for(&err), libc::ENODATA);

        assert_eq!(
            h.dispatcher.listxattr(entry.attr.ino).await.unwrap(),
            vec![canopy_inodes::XATTR_SHA1.to_string()]
        );
        assert!(h
            .dispatcher
            .listxattr(InodeNumber::ROOT)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn symlink_and_mkdir_entries_bump_refcounts() {
        let h = harness().await;
        let map = h.dispatcher.mount().map();

        let link = h
            .dispatcher
            .symlink(InodeNumber::ROOT, "l", "a")
            .await
            .unwrap();
        assert_eq!(map.fs_refcount(link.attr.ino), Some(1));
        assert_eq!(
            h.dispatcher.readlink(link.attr.ino).await.unwrap(),
            "a"
        );

        let dir = h
            .dispatcher
            .mkdir(InodeNumber::ROOT, "d", 0o755)
            .await
            .unwrap();
        assert_eq!(map.fs_refcount(dir.attr.ino), Some(1));
        // A freshly created directory gets zero TTLs: it is materialized.
        assert_eq!(dir.attr_ttl, Duration::ZERO);
    }

    #[tokio::test]
    async fn link_is_unsupported_after_exists_check() {
        let h = harness().await;
        let entry = h.dispatcher.lookup(InodeNumber::ROOT, "a").await.unwrap();

        let err = h
            .dispatcher
            .link(entry.attr.ino, InodeNumber::ROOT, "b")
            .await
            .unwrap_err();
        assert_eq!(crate::errno::errno_for(&err), libc::EEXIST);

        let err = h
            .dispatcher
            .link(entry.attr.ino, InodeNumber::ROOT, "hard")
            .await
            .unwrap_err();
        assert_eq!(crate::errno::errno_for(&err), libc::ENOSYS);
    }

    #[tokio::test]
    async fn stale_numbers_surface_as_estale() {
        let h = harness().await;
        let err = h
            .dispatcher
            .getattr(InodeNumber::new(404).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, FsError::StaleInode(_)));
        assert_eq!(crate::errno::errno_for(&err), libc::ESTALE);
    }
}
