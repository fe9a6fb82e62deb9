use std::fmt;

use bytes::Bytes;
use canopy_types::{Hash, PathComponent, HASH_LEN};

use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

/// The kind of object a tree entry points at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    /// Normal file (0o100644).
    Regular,
    /// Executable file (0o100755).
    Executable,
    /// Symbolic link (0o120000).
    Symlink,
    /// Nested tree (0o040000).
    SubTree,
}

impl EntryKind {
    /// Full octal mode value.
    pub fn mode_bits(self) -> u32 {
        match self {
            Self::Regular => 0o100644,
            Self::Executable => 0o100755,
            Self::Symlink => 0o120000,
            Self::SubTree => 0o040000,
        }
    }

    /// Parse from a full octal mode value.
    pub fn from_mode_bits(bits: u32) -> Option<Self> {
        match bits {
            0o100644 => Some(Self::Regular),
            0o100755 => Some(Self::Executable),
            0o120000 => Some(Self::Symlink),
            0o040000 => Some(Self::SubTree),
            _ => None,
        }
    }

    /// The mode string used in git tree serialization. Note that git writes
    /// sub-trees as `40000`, without the leading zero.
    pub fn git_mode(self) -> &'static str {
        match self {
            Self::Regular => "100644",
            Self::Executable => "100755",
            Self::Symlink => "120000",
            Self::SubTree => "40000",
        }
    }

    /// Returns `true` for the sub-tree kind.
    pub fn is_tree(self) -> bool {
        matches!(self, Self::SubTree)
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06o}", self.mode_bits())
    }
}

/// A single entry in a tree: name, kind, and the child object's hash.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: PathComponent,
    pub kind: EntryKind,
    pub hash: Hash,
}

impl TreeEntry {
    pub fn new(name: PathComponent, kind: EntryKind, hash: Hash) -> Self {
        Self { name, kind, hash }
    }

    /// Full octal mode bits for this entry.
    pub fn mode_bits(&self) -> u32 {
        self.kind.mode_bits()
    }
}

/// An ordered directory listing with git-compatible serialization.
///
/// Entries are kept sorted by name and names are unique; construction
/// rejects duplicates. The `hash` field may be the zero sentinel, in which
/// case [`Tree::serialize`] computes the real id from the framed bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Tree {
    hash: Hash,
    entries: Vec<TreeEntry>,
}

impl Tree {
    /// Build a tree from entries, sorting by name and rejecting duplicates.
    pub fn new(hash: Hash, mut entries: Vec<TreeEntry>) -> StoreResult<Self> {
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        for pair in entries.windows(2) {
            if pair[0].name == pair[1].name {
                return Err(StoreError::DuplicateEntry(pair[0].name.to_string()));
            }
        }
        Ok(Self { hash, entries })
    }

    /// An empty tree with an uncomputed hash.
    pub fn empty() -> Self {
        Self {
            hash: Hash::zero(),
            entries: Vec::new(),
        }
    }

    /// The tree's stated hash; zero if uncomputed.
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Entries in name order.
    pub fn entries(&self) -> &[TreeEntry] {
        &self.entries
    }

    /// Look up an entry by name.
    pub fn get(&self, name: &PathComponent) -> Option<&TreeEntry> {
        self.entries
            .binary_search_by(|e| e.name.cmp(name))
            .ok()
            .map(|i| &self.entries[i])
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Serialize to the git wire form and return `(id, framed bytes)`.
    ///
    /// The id is the tree's stated hash, or the sha-1 of the framed bytes
    /// when the stated hash is zero.
    pub fn serialize(&self) -> (Hash, Bytes) {
        let mut body = Vec::new();
        for entry in &self.entries {
            body.extend_from_slice(entry.kind.git_mode().as_bytes());
            body.push(b' ');
            body.extend_from_slice(entry.name.as_bytes());
            body.push(0);
            body.extend_from_slice(entry.hash.as_bytes());
        }

        let header = format!("tree {}\0", body.len());
        let mut framed = Vec::with_capacity(header.len() + body.len());
        framed.extend_from_slice(header.as_bytes());
        framed.extend_from_slice(&body);

        let id = if self.hash.is_zero() {
            Hash::sha1(&framed)
        } else {
            self.hash
        };
        (id, Bytes::from(framed))
    }

    /// Internal constructor for the deserializer: entries arrive in stored
    /// order and were already validated piecewise.
    fn from_parsed(hash: Hash, entries: Vec<TreeEntry>) -> Self {
        Self { hash, entries }
    }
}

/// Parse a git-framed tree body fetched under `id`.
pub fn deserialize_tree(id: Hash, data: &[u8]) -> StoreResult<Tree> {
    let parse_err = |reason: String| StoreError::Parse {
        what: "tree",
        key: id,
        reason,
    };

    let body = strip_frame_header(data, b"tree ").map_err(parse_err)?;

    let mut entries = Vec::new();
    let mut rest = body;
    while !rest.is_empty() {
        let space = rest
            .iter()
            .position(|&b| b == b' ')
            .ok_or_else(|| parse_err("entry missing mode terminator".into()))?;
        let mode_str = std::str::from_utf8(&rest[..space])
            .map_err(|_| parse_err("entry mode is not ascii".into()))?;
        let mode = u32::from_str_radix(mode_str, 8)
            .map_err(|_| parse_err(format!("invalid octal mode {mode_str:?}")))?;
        let kind = EntryKind::from_mode_bits(mode)
            .ok_or_else(|| parse_err(format!("unsupported entry mode {mode:#o}")))?;
        rest = &rest[space + 1..];

        let nul = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| parse_err("entry missing name terminator".into()))?;
        let name = std::str::from_utf8(&rest[..nul])
            .map_err(|_| parse_err("entry name is not utf-8".into()))?;
        let name = PathComponent::new(name)
            .map_err(|e| parse_err(format!("invalid entry name: {e}")))?;
        rest = &rest[nul + 1..];

        if rest.len() < HASH_LEN {
            return Err(parse_err(format!(
                "truncated entry hash for {name}: {} bytes left",
                rest.len()
            )));
        }
        let hash = Hash::from_bytes(&rest[..HASH_LEN])
            .map_err(|e| parse_err(e.to_string()))?;
        rest = &rest[HASH_LEN..];

        entries.push(TreeEntry::new(name, kind, hash));
    }

    Ok(Tree::from_parsed(id, entries))
}

// ---------------------------------------------------------------------------
// Blob
// ---------------------------------------------------------------------------

/// A possibly-chunked byte sequence identified by an object hash.
///
/// Chunks are kept as handed to us so the store can write them as a
/// scatter-gather without re-assembling the body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Blob {
    hash: Hash,
    chunks: Vec<Bytes>,
}

impl Blob {
    /// Single-chunk blob.
    pub fn new(hash: Hash, data: impl Into<Bytes>) -> Self {
        Self {
            hash,
            chunks: vec![data.into()],
        }
    }

    /// Blob built from pre-chunked contents.
    pub fn from_chunks(hash: Hash, chunks: Vec<Bytes>) -> Self {
        Self { hash, chunks }
    }

    /// The blob's stated object hash; zero if uncomputed.
    pub fn hash(&self) -> &Hash {
        &self.hash
    }

    /// Chunks of the body, in order.
    pub fn chunks(&self) -> &[Bytes] {
        &self.chunks
    }

    /// Total length across all chunks.
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|c| c.len() as u64).sum()
    }

    /// sha-1 over the concatenated contents (the *content hash*; this is not
    /// the framed-object hash).
    pub fn content_sha1(&self) -> Hash {
        Hash::sha1_slices(self.chunks.iter().map(|c| c.as_ref()))
    }

    /// Copy the body into a single contiguous buffer.
    pub fn to_bytes(&self) -> Bytes {
        if self.chunks.len() == 1 {
            return self.chunks[0].clone();
        }
        let mut out = Vec::with_capacity(self.size() as usize);
        for chunk in &self.chunks {
            out.extend_from_slice(chunk);
        }
        Bytes::from(out)
    }
}

/// Parse a git-framed blob body (`blob <len>\0<bytes>`) fetched under `id`.
pub fn deserialize_blob(id: Hash, data: Bytes) -> StoreResult<Blob> {
    let parse_err = |reason: String| StoreError::Parse {
        what: "blob",
        key: id,
        reason,
    };

    let body_start = {
        let body = strip_frame_header(&data, b"blob ").map_err(parse_err)?;
        data.len() - body.len()
    };
    Ok(Blob::new(id, data.slice(body_start..)))
}

/// Validate a `<tag><len>\0<body>` frame and return the body slice.
fn strip_frame_header<'a>(data: &'a [u8], tag: &[u8]) -> Result<&'a [u8], String> {
    if !data.starts_with(tag) {
        return Err(format!(
            "missing {:?} header",
            String::from_utf8_lossy(tag)
        ));
    }
    let after_tag = &data[tag.len()..];
    let nul = after_tag
        .iter()
        .position(|&b| b == 0)
        .ok_or("missing length terminator")?;
    let len_str =
        std::str::from_utf8(&after_tag[..nul]).map_err(|_| "length is not ascii".to_string())?;
    let len: usize = len_str
        .parse()
        .map_err(|_| format!("invalid length {len_str:?}"))?;
    let body = &after_tag[nul + 1..];
    if body.len() != len {
        return Err(format!(
            "length mismatch: header says {len}, body has {}",
            body.len()
        ));
    }
    Ok(body)
}

// ---------------------------------------------------------------------------
// BlobMetadata
// ---------------------------------------------------------------------------

/// Size and content hash of a blob, persisted as exactly 28 bytes:
/// 8-byte big-endian size followed by the 20-byte content hash.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlobMetadata {
    pub content_hash: Hash,
    pub size: u64,
}

impl BlobMetadata {
    pub const SERIALIZED_LEN: usize = 8 + HASH_LEN;

    /// The 28-byte persisted form.
    pub fn to_bytes(&self) -> [u8; Self::SERIALIZED_LEN] {
        let mut out = [0u8; Self::SERIALIZED_LEN];
        out[..8].copy_from_slice(&self.size.to_be_bytes());
        out[8..].copy_from_slice(self.content_hash.as_bytes());
        out
    }

    /// Parse the persisted form fetched under `key`. A record of any other
    /// size fails with a parse error naming the key.
    pub fn parse(key: &Hash, data: &[u8]) -> StoreResult<Self> {
        if data.len() != Self::SERIALIZED_LEN {
            return Err(StoreError::Parse {
                what: "blob metadata",
                key: *key,
                reason: format!(
                    "expected {} bytes, got {}",
                    Self::SERIALIZED_LEN,
                    data.len()
                ),
            });
        }
        let size = u64::from_be_bytes(data[..8].try_into().expect("sliced to 8 bytes"));
        let content_hash = Hash::from_bytes(&data[8..]).expect("sliced to 20 bytes");
        Ok(Self { content_hash, size })
    }
}
