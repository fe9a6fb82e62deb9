//! Foundation types for the canopy virtual filesystem.
//!
//! This crate provides the identifier and path types used throughout the
//! canopy workspace. Every other canopy crate depends on `canopy-types`.
//!
//! # Key Types
//!
//! - [`Hash`] — Fixed 20-byte content identifier (sha-1 over git framing)
//! - [`InodeNumber`] — Kernel-visible inode number; `1` is the mount root
//! - [`PathComponent`] — Validated single name within a directory
//! - [`RepoPath`] — Mount-relative `/`-joined path

pub mod error;
pub mod hash;
pub mod ino;
pub mod path;

pub use error::TypeError;
pub use hash::{Hash, HASH_LEN};
pub use ino::InodeNumber;
pub use path::{PathComponent, RepoPath};
