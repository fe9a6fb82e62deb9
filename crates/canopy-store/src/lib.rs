//! Content-addressed storage for canopy.
//!
//! Two layers live here. The *local store* is a column-family key-value
//! layer with a git-compatible framing for trees and blobs; the *object
//! store facade* resolves logical object ids to parsed values, delegating
//! cache misses to an external backing importer.
//!
//! # Key Types
//!
//! - [`Tree`], [`Blob`], [`BlobMetadata`] — object model with git framing
//! - [`KeySpace`] — named store partition with a persistence class
//! - [`LocalStore`] — engine trait; [`MemoryLocalStore`], [`SqliteLocalStore`]
//! - [`ObjectStore`] — facade over a local store and a [`BackingStore`]
//! - [`FakeBackingStore`] — injectable importer for tests

pub mod error;
pub mod facade;
pub mod fake;
pub mod key_space;
pub mod local;
pub mod memory;
pub mod object;
pub mod sqlite;

pub use error::{StoreError, StoreResult};
pub use facade::{BackingStore, ObjectStore};
pub use fake::FakeBackingStore;
pub use key_space::{KeySpace, Persistence};
pub use local::{LocalStore, WriteBatch};
pub use memory::MemoryLocalStore;
pub use object::{
    deserialize_blob, deserialize_tree, Blob, BlobMetadata, EntryKind, Tree, TreeEntry,
};
pub use sqlite::SqliteLocalStore;
