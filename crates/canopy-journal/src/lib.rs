//! Append-only journal of working-copy mutations.
//!
//! Each mutating filesystem operation appends one [`JournalDelta`]. Readers
//! either pull a sequence range or subscribe for live delivery; a bounded
//! in-memory ring holds recent history, and older entries collapse into a
//! truncation marker.

pub mod delta;
pub mod error;
pub mod journal;

pub use delta::{DeltaKind, JournalDelta};
pub use error::{JournalError, JournalResult};
pub use journal::{DeltaRange, Journal, JournalConfig};
