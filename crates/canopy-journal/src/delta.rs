use std::time::SystemTime;

use serde::{Deserialize, Serialize};

use canopy_types::RepoPath;

/// Classification of an observed mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeltaKind {
    /// A name was created under some tree.
    Created,
    /// A name was removed from some tree.
    Removed,
    /// A file's contents or attributes changed.
    Changed,
    /// A name moved; the delta carries the source and destination paths.
    Renamed,
}

impl std::fmt::Display for DeltaKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Removed => "removed",
            Self::Changed => "changed",
            Self::Renamed => "renamed",
        };
        f.write_str(s)
    }
}

/// One journal record describing a single observed filesystem mutation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalDelta {
    /// Strictly increasing sequence number; the first delta is 1.
    pub seq: u64,
    /// Wall-clock time the mutation was observed.
    pub timestamp: SystemTime,
    /// What happened.
    pub kind: DeltaKind,
    /// Affected mount-relative paths. One path for created/removed/changed;
    /// source then destination for renamed.
    pub paths: Vec<RepoPath>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_display() {
        assert_eq!(DeltaKind::Created.to_string(), "created");
        assert_eq!(DeltaKind::Renamed.to_string(), "renamed");
    }
}
