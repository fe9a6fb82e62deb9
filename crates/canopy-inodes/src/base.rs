use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::warn;

use canopy_types::{InodeNumber, PathComponent};

/// Coarse inode kind; fine-grained file flavors live in the mode bits.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodeKind {
    Tree,
    File,
}

/// Where an inode currently sits in the tree.
///
/// The parent link is a bare inode number, resolved through the map — never
/// an owning reference — so a parent cannot keep a child loaded and vice
/// versa. Detached inodes (unlinked but still referenced by the kernel)
/// have neither parent nor name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InodeLocation {
    pub parent: Option<InodeNumber>,
    pub name: Option<PathComponent>,
}

/// Mutable attribute block shared by every inode.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InodeMetadata {
    /// Full mode, type bits included.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl InodeMetadata {
    pub fn new(mode: u32, uid: u32, gid: u32, now: SystemTime) -> Self {
        Self {
            mode,
            uid,
            gid,
            atime: now,
            mtime: now,
            ctime: now,
        }
    }

    /// Type bits of the mode (the `S_IFMT` portion).
    pub fn format_bits(&self) -> u32 {
        self.mode & 0o170000
    }

    /// Returns `true` for symlink-typed modes.
    pub fn is_symlink(&self) -> bool {
        self.format_bits() == 0o120000
    }
}

/// State common to every inode: identity, position, attributes, and the
/// kernel's lookup count.
pub struct InodeBase {
    ino: InodeNumber,
    kind: InodeKind,
    location: Mutex<InodeLocation>,
    metadata: Mutex<InodeMetadata>,
    /// Kernel lookup count: incremented per lookup reply, decremented by
    /// forget. While positive, the kernel may address this inode by number.
    fs_refcount: AtomicU64,
}

impl InodeBase {
    pub fn new(
        ino: InodeNumber,
        kind: InodeKind,
        parent: Option<InodeNumber>,
        name: Option<PathComponent>,
        metadata: InodeMetadata,
    ) -> Self {
        Self {
            ino,
            kind,
            location: Mutex::new(InodeLocation { parent, name }),
            metadata: Mutex::new(metadata),
            fs_refcount: AtomicU64::new(0),
        }
    }

    pub fn ino(&self) -> InodeNumber {
        self.ino
    }

    pub fn kind(&self) -> InodeKind {
        self.kind
    }

    pub fn location(&self) -> InodeLocation {
        self.location.lock().expect("lock poisoned").clone()
    }

    /// Move the inode to a new position, or detach it with `(None, None)`.
    pub fn set_location(&self, parent: Option<InodeNumber>, name: Option<PathComponent>) {
        let mut loc = self.location.lock().expect("lock poisoned");
        loc.parent = parent;
        loc.name = name;
    }

    /// Returns `true` if the inode has been unlinked from its parent.
    pub fn is_detached(&self) -> bool {
        let loc = self.location.lock().expect("lock poisoned");
        loc.parent.is_none() && !self.ino.is_root()
    }

    pub fn metadata(&self) -> InodeMetadata {
        *self.metadata.lock().expect("lock poisoned")
    }

    /// Apply a closure to the attribute block under its lock.
    pub fn update_metadata<R>(&self, f: impl FnOnce(&mut InodeMetadata) -> R) -> R {
        let mut meta = self.metadata.lock().expect("lock poisoned");
        f(&mut meta)
    }

    pub fn fs_refcount(&self) -> u64 {
        self.fs_refcount.load(Ordering::Acquire)
    }

    pub fn inc_fs_refcount(&self, n: u64) -> u64 {
        self.fs_refcount.fetch_add(n, Ordering::AcqRel) + n
    }

    /// Decrement the kernel lookup count by `n`, clamping at zero.
    ///
    /// Underflow indicates a protocol accounting bug; it is logged but must
    /// not take the process down.
    pub fn dec_fs_refcount(&self, n: u64) -> u64 {
        let mut current = self.fs_refcount.load(Ordering::Acquire);
        loop {
            let next = match current.checked_sub(n) {
                Some(next) => next,
                None => {
                    warn!(ino = %self.ino, count = current, forget = n, "fs refcount underflow");
                    0
                }
            };
            match self.fs_refcount.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(observed) => current = observed,
            }
        }
    }
}
