//! Adapter from the kernel protocol to canopy mounts.
//!
//! The [`Dispatcher`] decodes nothing itself: the transport hands it decoded
//! requests (opcode, inode numbers, arguments) and it invokes the matching
//! mount operation, shaping the reply with entry and attribute lifetimes.
//! Errors map to protocol error numbers through a fixed table.

pub mod dispatcher;
pub mod errno;

pub use dispatcher::{
    AttrReply, CreateReply, Dispatcher, EntryReply, OpenReply, CLEAN_CACHE_TTL,
};
pub use errno::errno_for;
