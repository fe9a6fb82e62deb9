use std::fmt;

use serde::{Deserialize, Serialize};

/// Kernel-visible inode number.
///
/// Non-zero, 64 bits wide. `1` is the mount root. Numbers are handed out
/// monotonically by the inode map and never reused within a mount's
/// lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InodeNumber(u64);

impl InodeNumber {
    /// The mount root.
    pub const ROOT: Self = Self(1);

    /// Wrap a raw inode number. Returns `None` for zero, which the kernel
    /// protocol reserves.
    pub fn new(raw: u64) -> Option<Self> {
        if raw == 0 {
            None
        } else {
            Some(Self(raw))
        }
    }

    /// The raw value.
    pub fn get(self) -> u64 {
        self.0
    }

    /// Returns `true` if this is the mount root.
    pub fn is_root(self) -> bool {
        self == Self::ROOT
    }
}

impl fmt::Debug for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ino:{}", self.0)
    }
}

impl fmt::Display for InodeNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
