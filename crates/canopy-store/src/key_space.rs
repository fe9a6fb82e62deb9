use std::fmt;

/// Whether a key space survives cache reclaim.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Persistence {
    /// May be erased and rebuilt on demand.
    Ephemeral,
    /// Must survive reclaim operations.
    Persistent,
}

/// A named partition of the local store.
///
/// Each key space has its own persistence class and value schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum KeySpace {
    /// Git-framed blob bodies, keyed by blob hash.
    Blob,
    /// 28-byte blob metadata records, keyed by blob hash.
    BlobMetadata,
    /// Git-framed tree bodies, keyed by tree hash.
    Tree,
    /// Importer proxy hashes; opaque to the engine.
    ProxyHash,
    /// Commit id to root tree hash edges; opaque to the engine.
    CommitToTree,
}

impl KeySpace {
    /// All key spaces, in stable index order.
    pub const ALL: [KeySpace; 5] = [
        KeySpace::Blob,
        KeySpace::BlobMetadata,
        KeySpace::Tree,
        KeySpace::ProxyHash,
        KeySpace::CommitToTree,
    ];

    /// Number of key spaces.
    pub const COUNT: usize = Self::ALL.len();

    /// Stable index for array-backed engines.
    pub fn index(self) -> usize {
        match self {
            Self::Blob => 0,
            Self::BlobMetadata => 1,
            Self::Tree => 2,
            Self::ProxyHash => 3,
            Self::CommitToTree => 4,
        }
    }

    /// Reclaim class of this key space.
    ///
    /// Trees must survive reclaim: a materialized tree written back by a
    /// mount may exist nowhere else. Proxy hashes are required to re-import
    /// objects after an inode is unloaded, so erasing them would break
    /// refetching.
    pub fn persistence(self) -> Persistence {
        match self {
            Self::Blob | Self::BlobMetadata | Self::CommitToTree => Persistence::Ephemeral,
            Self::Tree | Self::ProxyHash => Persistence::Persistent,
        }
    }

    /// Short stable name, usable as an engine table name.
    pub fn name(self) -> &'static str {
        match self {
            Self::Blob => "blob",
            Self::BlobMetadata => "blob_metadata",
            Self::Tree => "tree",
            Self::ProxyHash => "proxy_hash",
            Self::CommitToTree => "commit_to_tree",
        }
    }
}

impl fmt::Display for KeySpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn indices_are_dense_and_stable() {
        for (i, ks) in KeySpace::ALL.iter().enumerate() {
            assert_eq!(ks.index(), i);
        }
    }

    #[test]
    fn persistence_classes() {
        assert_eq!(KeySpace::Blob.persistence(), Persistence::Ephemeral);
        assert_eq!(KeySpace::BlobMetadata.persistence(), Persistence::Ephemeral);
        assert_eq!(KeySpace::CommitToTree.persistence(), Persistence::Ephemeral);
        assert_eq!(KeySpace::Tree.persistence(), Persistence::Persistent);
        assert_eq!(KeySpace::ProxyHash.persistence(), Persistence::Persistent);
    }

    #[test]
    fn names_are_unique() {
        let mut names: Vec<_> = KeySpace::ALL.iter().map(|ks| ks.name()).collect();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), KeySpace::COUNT);
    }
}
