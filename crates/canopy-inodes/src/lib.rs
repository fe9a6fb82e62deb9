//! The virtual inode engine: inode objects, the inode map, and the mount.
//!
//! An inode is either *clean* (state fully derivable from a source-control
//! object hash) or *materialized* (diverged, backed by the overlay). The
//! [`InodeMap`] owns the number allocator and the live table and drives the
//! load/unload lifecycle from kernel lookup counts; the [`Mount`] wires one
//! tree's worth of map, object store, overlay, and journal together and
//! exposes the operation set the dispatcher consumes.
//!
//! # Key Types
//!
//! - [`InodeMap`] — number ↔ inode table with load dedup and unload sweeps
//! - [`TreeInode`] / [`FileInode`] — directory and file state machines
//! - [`Mount`] — per-mount wiring and filesystem operations
//! - [`Overlay`] — storage contract for diverged state; [`MemoryOverlay`]
//! - [`FsError`] — kernel-facing error taxonomy

pub mod base;
pub mod error;
pub mod file;
pub mod map;
pub mod mount;
pub mod overlay;
pub mod tree;

pub use base::{InodeBase, InodeKind, InodeLocation, InodeMetadata};
pub use error::{FsError, FsResult};
pub use file::FileInode;
pub use map::{InodeDefaults, InodeHandle, InodeMap, TakeoverEntry, TakeoverSnapshot};
pub use mount::{
    DirListEntry, InodeAttr, Mount, MountConfig, MountPoint, SetAttrChanges, XATTR_SHA1,
};
pub use overlay::{MemoryOverlay, Overlay};
pub use tree::{initial_mode, ChildEntry, TreeInode};
