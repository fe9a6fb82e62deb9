use std::fmt;

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};

use crate::error::TypeError;

/// Raw byte length of a [`Hash`].
pub const HASH_LEN: usize = 20;

/// Fixed-width content identifier for trees, blobs, and commits.
///
/// A `Hash` is the sha-1 of an object's git-framed form. Equality, ordering,
/// and hex rendering are purely byte-wise. The all-zero value is a sentinel
/// meaning "unknown/uncomputed": stores that receive it compute the real
/// hash from the serialized content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Hash([u8; HASH_LEN]);

impl Hash {
    /// Compute the sha-1 of the given bytes.
    pub fn sha1(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self(hasher.finalize().into())
    }

    /// Compute the sha-1 of a sequence of byte slices, hashed as if
    /// concatenated.
    pub fn sha1_slices<'a, I>(slices: I) -> Self
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut hasher = Sha1::new();
        for slice in slices {
            hasher.update(slice);
        }
        Self(hasher.finalize().into())
    }

    /// Create a `Hash` from a pre-computed 20-byte digest.
    pub const fn from_raw(raw: [u8; HASH_LEN]) -> Self {
        Self(raw)
    }

    /// Parse from exactly 20 raw bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypeError> {
        let raw: [u8; HASH_LEN] = bytes.try_into().map_err(|_| TypeError::InvalidLength {
            expected: HASH_LEN,
            actual: bytes.len(),
        })?;
        Ok(Self(raw))
    }

    /// The zero hash: "unknown/uncomputed".
    pub const fn zero() -> Self {
        Self([0u8; HASH_LEN])
    }

    /// Returns `true` if this is the zero sentinel.
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }

    /// The raw 20-byte digest.
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Hex-encoded string representation (40 characters).
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Short hex representation (first 8 characters).
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..4])
    }

    /// Parse from a 40-character hex string.
    pub fn from_hex(s: &str) -> Result<Self, TypeError> {
        let bytes = hex::decode(s).map_err(|e| TypeError::InvalidHex(e.to_string()))?;
        Self::from_bytes(&bytes)
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.short_hex())
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; HASH_LEN]> for Hash {
    fn from(raw: [u8; HASH_LEN]) -> Self {
        Self(raw)
    }
}
