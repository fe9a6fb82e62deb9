use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use canopy_store::ObjectStore;
use canopy_types::{InodeNumber, PathComponent, RepoPath};

use crate::base::{InodeBase, InodeKind, InodeMetadata};
use crate::error::{FsError, FsResult};
use crate::file::FileInode;
use crate::overlay::Overlay;
use crate::tree::{ChildEntry, TreeInode};

/// Strong handle to a live inode.
///
/// The map holds one; every clone keeps the inode loaded regardless of the
/// kernel's lookup count. The file/tree split is a tagged discriminant, not
/// a class hierarchy: dispatcher code matches on it for kind-specific work
/// and goes through [`InodeHandle::base`] for the shared capability set.
#[derive(Clone)]
pub enum InodeHandle {
    Tree(Arc<TreeInode>),
    File(Arc<FileInode>),
}

impl std::fmt::Debug for InodeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Tree(t) => f.debug_tuple("Tree").field(&t.base().ino()).finish(),
            Self::File(file) => f.debug_tuple("File").field(&file.base().ino()).finish(),
        }
    }
}

impl InodeHandle {
    pub fn base(&self) -> &InodeBase {
        match self {
            Self::Tree(t) => t.base(),
            Self::File(f) => f.base(),
        }
    }

    pub fn ino(&self) -> InodeNumber {
        self.base().ino()
    }

    pub fn kind(&self) -> InodeKind {
        self.base().kind()
    }

    pub fn is_materialized(&self) -> bool {
        match self {
            Self::Tree(t) => t.is_materialized(),
            Self::File(f) => f.is_materialized(),
        }
    }

    /// The tree behind this handle, or *not-a-directory*.
    pub fn as_tree(&self) -> FsResult<&Arc<TreeInode>> {
        match self {
            Self::Tree(t) => Ok(t),
            Self::File(f) => Err(FsError::NotADirectory(f.base().ino().to_string())),
        }
    }

    /// The file behind this handle, or *is-a-directory*.
    pub fn as_file(&self) -> FsResult<&Arc<FileInode>> {
        match self {
            Self::File(f) => Ok(f),
            Self::Tree(t) => Err(FsError::IsADirectory(t.base().ino().to_string())),
        }
    }

    fn strong_count(&self) -> usize {
        match self {
            Self::Tree(t) => Arc::strong_count(t),
            Self::File(f) => Arc::strong_count(f),
        }
    }
}

/// Ambient attributes applied to inodes faulted in from source objects.
#[derive(Clone, Copy, Debug)]
pub struct InodeDefaults {
    pub uid: u32,
    pub gid: u32,
    /// Timestamp reported for clean inodes; typically the mount time.
    pub birthtime: SystemTime,
}

/// A kernel-referenced inode whose in-memory object is not currently
/// loaded (seen after takeover restore).
struct UnloadedEntry {
    parent: InodeNumber,
    name: PathComponent,
    kind: InodeKind,
    fs_refcount: u64,
}

struct PendingLoad {
    waiters: Vec<oneshot::Sender<FsResult<InodeHandle>>>,
}

struct MapInner {
    /// Next number to allocate. Monotonic; never reused.
    next_ino: u64,
    live: HashMap<InodeNumber, InodeHandle>,
    unloaded: HashMap<InodeNumber, UnloadedEntry>,
    /// Reverse index over `unloaded` for (parent, name) loads.
    unloaded_by_location: HashMap<(InodeNumber, PathComponent), InodeNumber>,
    /// At most one load in flight per (parent, name); latecomers wait here.
    pending: HashMap<(InodeNumber, PathComponent), PendingLoad>,
}

enum LookupStep {
    Ready(InodeHandle),
    Wait(oneshot::Receiver<FsResult<InodeHandle>>),
    Load {
        stored: PathComponent,
        entry: ChildEntry,
        ino: InodeNumber,
    },
}

/// Serialized form of the map for the takeover collaborator.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TakeoverSnapshot {
    pub next_ino: u64,
    pub root_refcount: u64,
    pub entries: Vec<TakeoverEntry>,
}

/// One kernel-referenced, non-root inode in a takeover snapshot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TakeoverEntry {
    pub ino: InodeNumber,
    pub parent: InodeNumber,
    pub name: PathComponent,
    pub kind: InodeKind,
    pub fs_refcount: u64,
}

/// Bidirectional map between kernel-visible inode numbers and live inode
/// objects for one mount.
///
/// Owns the number allocator, the live table, and the kernel lookup-count
/// accounting. Short lock sections only: anything that can touch the object
/// store runs outside the table lock, with concurrent loads of the same
/// child collapsed onto a single in-flight fetch.
pub struct InodeMap {
    store: Arc<ObjectStore>,
    overlay: Arc<dyn Overlay>,
    defaults: InodeDefaults,
    case_sensitive: bool,
    inner: Mutex<MapInner>,
}

impl InodeMap {
    pub fn new(
        store: Arc<ObjectStore>,
        overlay: Arc<dyn Overlay>,
        defaults: InodeDefaults,
        case_sensitive: bool,
        root: Arc<TreeInode>,
    ) -> Self {
        let mut live = HashMap::new();
        live.insert(InodeNumber::ROOT, InodeHandle::Tree(root));
        Self {
            store,
            overlay,
            defaults,
            case_sensitive,
            inner: Mutex::new(MapInner {
                next_ino: InodeNumber::ROOT.get() + 1,
                live,
                unloaded: HashMap::new(),
                unloaded_by_location: HashMap::new(),
                pending: HashMap::new(),
            }),
        }
    }

    /// The mount root.
    pub fn root(&self) -> Arc<TreeInode> {
        let inner = self.inner.lock().expect("lock poisoned");
        match inner.live.get(&InodeNumber::ROOT) {
            Some(InodeHandle::Tree(t)) => Arc::clone(t),
            _ => unreachable!("root is always a live tree"),
        }
    }

    /// Hand out a fresh inode number.
    pub fn allocate_ino(&self) -> InodeNumber {
        let mut inner = self.inner.lock().expect("lock poisoned");
        Self::allocate_locked(&mut inner)
    }

    fn allocate_locked(inner: &mut MapInner) -> InodeNumber {
        let ino = InodeNumber::new(inner.next_ino).expect("allocator skips zero");
        inner.next_ino += 1;
        ino
    }

    /// Register a mount-created inode (create/mkdir/symlink paths).
    pub fn insert_live(&self, handle: InodeHandle) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        inner.live.insert(handle.ino(), handle);
    }

    /// Live handle by number, without faulting anything in.
    pub fn get_live(&self, ino: InodeNumber) -> Option<InodeHandle> {
        let inner = self.inner.lock().expect("lock poisoned");
        inner.live.get(&ino).cloned()
    }

    /// Live tree by number; internal walks rely on the invariant that a
    /// live inode's parent is itself live.
    pub(crate) fn get_live_tree(&self, ino: InodeNumber) -> FsResult<Arc<TreeInode>> {
        match self.get_live(ino) {
            Some(InodeHandle::Tree(t)) => Ok(t),
            Some(InodeHandle::File(_)) => Err(FsError::NotADirectory(ino.to_string())),
            None => Err(FsError::Internal(format!(
                "parent {ino} of a live inode is not loaded"
            ))),
        }
    }

    pub fn live_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").live.len()
    }

    pub fn unloaded_count(&self) -> usize {
        self.inner.lock().expect("lock poisoned").unloaded.len()
    }

    /// Resolve an inode number to a strong handle, faulting the inode in
    /// from its parent's child descriptor when needed.
    ///
    /// Fails with *stale-inode* when the number is unknown or references a
    /// reaped entry.
    pub async fn lookup_inode(self: &Arc<Self>, ino: InodeNumber) -> FsResult<InodeHandle> {
        let (parent_ino, name) = {
            let inner = self.inner.lock().expect("lock poisoned");
            if let Some(handle) = inner.live.get(&ino) {
                return Ok(handle.clone());
            }
            match inner.unloaded.get(&ino) {
                Some(u) => (u.parent, u.name.clone()),
                None => return Err(FsError::StaleInode(ino)),
            }
        };

        let parent = Box::pin(self.lookup_inode(parent_ino)).await?;
        let parent = Arc::clone(parent.as_tree()?);
        self.lookup_child(&parent, &name).await
    }

    /// Resolve a child of a loaded tree, loading it if necessary.
    ///
    /// Concurrent lookups of the same (parent, name) pair share one load:
    /// at most one object-store fetch is issued and every waiter receives
    /// the same result. The load runs as a detached task, so waiters
    /// leaving never cancel it.
    pub async fn lookup_child(
        self: &Arc<Self>,
        parent: &Arc<TreeInode>,
        name: &PathComponent,
    ) -> FsResult<InodeHandle> {
        parent.ensure_loaded(&self.store).await?;
        let parent_ino = parent.base().ino();

        let step = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let Some((stored, entry)) = parent.find_child(name, self.case_sensitive)? else {
                return Err(FsError::NotFound(format!("{name} in {parent_ino}")));
            };

            if let Some(ino) = entry.ino {
                if let Some(handle) = inner.live.get(&ino) {
                    LookupStep::Ready(handle.clone())
                } else {
                    Self::begin_or_wait(&mut inner, parent_ino, stored, entry)
                }
            } else {
                Self::begin_or_wait(&mut inner, parent_ino, stored, entry)
            }
        };

        match step {
            LookupStep::Ready(handle) => Ok(handle),
            LookupStep::Wait(rx) => rx
                .await
                .map_err(|_| FsError::Internal("child load abandoned".into()))?,
            LookupStep::Load { stored, entry, ino } => {
                let (tx, rx) = oneshot::channel();
                {
                    let mut inner = self.inner.lock().expect("lock poisoned");
                    if let Some(pending) = inner.pending.get_mut(&(parent_ino, stored.clone())) {
                        pending.waiters.push(tx);
                    }
                }

                let map = Arc::clone(self);
                let parent = Arc::clone(parent);
                tokio::spawn(async move {
                    let result = map
                        .load_child(parent.base().ino(), &stored, &entry, ino)
                        .await;
                    map.finish_load(&parent, &stored, &result);
                });

                rx.await
                    .map_err(|_| FsError::Internal("child load abandoned".into()))?
            }
        }
    }

    fn begin_or_wait(
        inner: &mut MapInner,
        parent_ino: InodeNumber,
        stored: PathComponent,
        entry: ChildEntry,
    ) -> LookupStep {
        let key = (parent_ino, stored.clone());
        if let Some(pending) = inner.pending.get_mut(&key) {
            let (tx, rx) = oneshot::channel();
            pending.waiters.push(tx);
            return LookupStep::Wait(rx);
        }

        // Reuse a number the kernel still references (takeover restore);
        // otherwise allocate. Failed loads waste the number, which is fine:
        // the allocator never reuses numbers anyway.
        let ino = entry
            .ino
            .or_else(|| inner.unloaded_by_location.get(&key).copied())
            .unwrap_or_else(|| Self::allocate_locked(inner));

        inner.pending.insert(key, PendingLoad { waiters: Vec::new() });
        LookupStep::Load { stored, entry, ino }
    }

    /// Construct the in-memory inode for a child descriptor. Runs without
    /// the table lock; may await object-store fetches.
    async fn load_child(
        &self,
        parent_ino: InodeNumber,
        name: &PathComponent,
        entry: &ChildEntry,
        ino: InodeNumber,
    ) -> FsResult<InodeHandle> {
        let d = self.defaults;
        let metadata = InodeMetadata::new(entry.mode, d.uid, d.gid, d.birthtime);

        let handle = match (entry.kind.is_tree(), entry.source) {
            // Clean tree: its own child list is fetched on demand, not here.
            (true, Some(source)) => InodeHandle::Tree(TreeInode::new_unloaded(
                ino,
                parent_ino,
                name.clone(),
                metadata,
                source,
            )),
            // Diverged tree: listing lives in the overlay.
            (true, None) => {
                let children = self.overlay.list_children(ino)?;
                InodeHandle::Tree(TreeInode::new_materialized(
                    ino,
                    Some(parent_ino),
                    Some(name.clone()),
                    metadata,
                    children,
                ))
            }
            // Clean file: cache the blob metadata so attribute queries need
            // no further store traffic.
            (false, Some(source)) => {
                let blob_metadata = self
                    .store
                    .get_blob_metadata(&source)
                    .await?
                    .ok_or_else(|| FsError::NotFound(format!("source blob {source}")))?;
                InodeHandle::File(FileInode::new_clean(
                    ino,
                    parent_ino,
                    name.clone(),
                    metadata,
                    source,
                    blob_metadata,
                ))
            }
            // Diverged file: contents must already be in the overlay.
            (false, None) => {
                self.overlay.size(ino)?;
                InodeHandle::File(FileInode::new_materialized(
                    ino,
                    parent_ino,
                    name.clone(),
                    metadata,
                ))
            }
        };

        debug!(ino = %ino, parent = %parent_ino, name = %name, "inode loaded");
        Ok(handle)
    }

    /// Publish a finished load and fan the result out to waiters.
    fn finish_load(
        &self,
        parent: &Arc<TreeInode>,
        stored: &PathComponent,
        result: &FsResult<InodeHandle>,
    ) {
        let parent_ino = parent.base().ino();
        let key = (parent_ino, stored.clone());

        let waiters = {
            let mut inner = self.inner.lock().expect("lock poisoned");
            let waiters = inner
                .pending
                .remove(&key)
                .map(|p| p.waiters)
                .unwrap_or_default();

            if let Ok(handle) = result {
                let ino = handle.ino();
                if let Some(unloaded) = inner.unloaded.remove(&ino) {
                    inner.unloaded_by_location.remove(&key);
                    handle.base().inc_fs_refcount(unloaded.fs_refcount);
                }
                inner.live.insert(ino, handle.clone());
                if let Err(e) = parent.set_child_ino(stored, ino) {
                    warn!(%ino, error = %e, "descriptor vanished during load");
                }
            }
            waiters
        };

        for tx in waiters {
            let _ = tx.send(result.clone());
        }
    }

    // -- kernel lookup-count accounting -------------------------------------

    /// Account for `n` kernel lookups of `ino`.
    pub fn inc_fs_refcount(&self, ino: InodeNumber, n: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(handle) = inner.live.get(&ino) {
            handle.base().inc_fs_refcount(n);
        } else if let Some(u) = inner.unloaded.get_mut(&ino) {
            u.fs_refcount += n;
        } else {
            warn!(%ino, "refcount increment for unknown inode");
        }
    }

    /// Account for a kernel forget of `n` lookups. When the count reaches
    /// zero the entry becomes unload-eligible.
    pub fn dec_fs_refcount(&self, ino: InodeNumber, n: u64) {
        let mut inner = self.inner.lock().expect("lock poisoned");
        if let Some(handle) = inner.live.get(&ino) {
            handle.base().dec_fs_refcount(n);
            return;
        }
        let remove = match inner.unloaded.get_mut(&ino) {
            Some(u) => {
                if n > u.fs_refcount {
                    warn!(%ino, count = u.fs_refcount, forget = n, "fs refcount underflow");
                }
                u.fs_refcount = u.fs_refcount.saturating_sub(n);
                u.fs_refcount == 0
            }
            None => {
                warn!(%ino, "forget for unknown inode");
                false
            }
        };
        if remove {
            if let Some(u) = inner.unloaded.remove(&ino) {
                inner.unloaded_by_location.remove(&(u.parent, u.name));
            }
        }
    }

    /// Kernel lookup count for an inode, live or unloaded.
    pub fn fs_refcount(&self, ino: InodeNumber) -> Option<u64> {
        let inner = self.inner.lock().expect("lock poisoned");
        if let Some(handle) = inner.live.get(&ino) {
            return Some(handle.base().fs_refcount());
        }
        inner.unloaded.get(&ino).map(|u| u.fs_refcount)
    }

    // -- unload -------------------------------------------------------------

    /// Sweep the live table, unloading every eligible entry. Returns how
    /// many inodes were unloaded.
    ///
    /// An entry is unloaded when all of: the kernel count is zero, no
    /// strong handle exists outside the map, it holds no materialized state
    /// (unless detached by unlink), and no loaded child still pins it.
    /// Unloading reverses the load exactly: the descriptor in the parent
    /// reverts to source-hash form, and the number is never reused.
    pub fn unload_unreferenced(&self) -> usize {
        let mut total = 0;
        // A parent pinned only by its children becomes eligible once they
        // go; sweep to a fixpoint.
        loop {
            let unloaded = self.unload_pass();
            if unloaded == 0 {
                break;
            }
            total += unloaded;
        }
        if total > 0 {
            debug!(count = total, "unloaded unreferenced inodes");
        }
        total
    }

    fn unload_pass(&self) -> usize {
        let mut inner = self.inner.lock().expect("lock poisoned");

        let victims: Vec<InodeNumber> = inner
            .live
            .iter()
            .filter(|(ino, handle)| {
                if ino.is_root() || handle.base().fs_refcount() > 0 {
                    return false;
                }
                if handle.strong_count() > 1 {
                    return false;
                }
                if handle.base().is_detached() {
                    // Unlinked and unreferenced: always reapable.
                    return true;
                }
                if handle.is_materialized() {
                    return false;
                }
                if let InodeHandle::Tree(t) = handle {
                    if t.has_assigned_children() {
                        return false;
                    }
                }
                true
            })
            .map(|(ino, _)| *ino)
            .collect();

        let mut unloaded = 0;
        for ino in victims {
            let Some(handle) = inner.live.get(&ino).cloned() else {
                continue;
            };
            let detached = handle.base().is_detached();
            if !detached {
                let location = handle.base().location();
                let (Some(parent_ino), Some(name)) = (location.parent, location.name) else {
                    continue;
                };
                let Some(InodeHandle::Tree(parent)) = inner.live.get(&parent_ino) else {
                    warn!(%ino, parent = %parent_ino, "live inode with unloaded parent");
                    continue;
                };
                // No source hash to revert to means the inode must stay.
                if !parent.clear_child_ino(&name) {
                    continue;
                }
            } else if let Err(e) = self.overlay.free(ino) {
                warn!(%ino, error = %e, "failed to drop overlay slot of unlinked inode");
            }
            inner.live.remove(&ino);
            unloaded += 1;
        }
        unloaded
    }

    // -- path resolution ----------------------------------------------------

    /// Mount-relative path of a live inode, walking parent links through
    /// the map.
    pub fn path_to(&self, ino: InodeNumber) -> FsResult<RepoPath> {
        let inner = self.inner.lock().expect("lock poisoned");
        let mut parts: Vec<PathComponent> = Vec::new();
        let mut cursor = ino;
        while !cursor.is_root() {
            let handle = inner
                .live
                .get(&cursor)
                .ok_or(FsError::StaleInode(cursor))?;
            let location = handle.base().location();
            let (Some(parent), Some(name)) = (location.parent, location.name) else {
                return Err(FsError::StaleInode(cursor));
            };
            parts.push(name);
            cursor = parent;
        }
        let mut path = RepoPath::root();
        for part in parts.iter().rev() {
            path = path.join(part);
        }
        Ok(path)
    }

    // -- takeover -----------------------------------------------------------

    /// Serialize kernel-referenced numbering for the takeover collaborator.
    pub fn snapshot_for_takeover(&self) -> TakeoverSnapshot {
        let inner = self.inner.lock().expect("lock poisoned");
        let mut entries = Vec::new();

        for (ino, handle) in &inner.live {
            if ino.is_root() || handle.base().fs_refcount() == 0 {
                continue;
            }
            let location = handle.base().location();
            let (Some(parent), Some(name)) = (location.parent, location.name) else {
                // Unlinked inodes cannot be re-resolved by name after a
                // restore; the kernel re-learns them as stale.
                continue;
            };
            entries.push(TakeoverEntry {
                ino: *ino,
                parent,
                name,
                kind: handle.kind(),
                fs_refcount: handle.base().fs_refcount(),
            });
        }

        for (ino, u) in &inner.unloaded {
            entries.push(TakeoverEntry {
                ino: *ino,
                parent: u.parent,
                name: u.name.clone(),
                kind: u.kind,
                fs_refcount: u.fs_refcount,
            });
        }

        let root_refcount = inner
            .live
            .get(&InodeNumber::ROOT)
            .map(|h| h.base().fs_refcount())
            .unwrap_or(0);

        TakeoverSnapshot {
            next_ino: inner.next_ino,
            root_refcount,
            entries,
        }
    }

    /// Restore numbering from a takeover snapshot into a freshly built map.
    /// The allocator resumes above the maximum restored number.
    pub fn restore_from_takeover(&self, snapshot: TakeoverSnapshot) -> FsResult<()> {
        let mut inner = self.inner.lock().expect("lock poisoned");

        let mut max_ino = InodeNumber::ROOT.get();
        for entry in &snapshot.entries {
            max_ino = max_ino.max(entry.ino.get());
            inner.unloaded.insert(
                entry.ino,
                UnloadedEntry {
                    parent: entry.parent,
                    name: entry.name.clone(),
                    kind: entry.kind,
                    fs_refcount: entry.fs_refcount,
                },
            );
            inner
                .unloaded_by_location
                .insert((entry.parent, entry.name.clone()), entry.ino);
        }

        inner.next_ino = inner.next_ino.max(snapshot.next_ino).max(max_ino + 1);

        if let Some(root) = inner.live.get(&InodeNumber::ROOT) {
            root.base().inc_fs_refcount(snapshot.root_refcount);
        }

        debug!(
            entries = snapshot.entries.len(),
            next_ino = inner.next_ino,
            "inode map restored from takeover"
        );
        Ok(())
    }
}
