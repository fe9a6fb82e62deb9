use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::TypeError;

/// A single name within a directory.
///
/// Never empty, never contains `/` or NUL, and never one of the reserved
/// names `.` and `..`. Comparison is byte-wise; any case-folding policy is
/// applied by the mount, not here.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PathComponent(String);

impl PathComponent {
    /// Validate and wrap a name component.
    pub fn new(name: impl Into<String>) -> Result<Self, TypeError> {
        let name = name.into();
        if name.is_empty() {
            return Err(TypeError::InvalidPathComponent("empty name".into()));
        }
        if name == "." || name == ".." {
            return Err(TypeError::InvalidPathComponent(format!(
                "reserved name {name:?}"
            )));
        }
        if name.bytes().any(|b| b == b'/' || b == 0) {
            return Err(TypeError::InvalidPathComponent(format!(
                "name {name:?} contains '/' or NUL"
            )));
        }
        Ok(Self(name))
    }

    /// The component as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The component as raw bytes.
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }
}

impl TryFrom<String> for PathComponent {
    type Error = TypeError;

    fn try_from(s: String) -> Result<Self, TypeError> {
        Self::new(s)
    }
}

impl From<PathComponent> for String {
    fn from(c: PathComponent) -> String {
        c.0
    }
}

impl fmt::Debug for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for PathComponent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A mount-relative path: zero or more components joined by `/`.
///
/// The empty path denotes the mount root.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct RepoPath(String);

impl RepoPath {
    /// The mount root.
    pub const fn root() -> Self {
        Self(String::new())
    }

    /// Parse a `/`-separated relative path, validating every component.
    pub fn parse(s: &str) -> Result<Self, TypeError> {
        if s.is_empty() {
            return Ok(Self::root());
        }
        for part in s.split('/') {
            PathComponent::new(part)?;
        }
        Ok(Self(s.to_string()))
    }

    /// Returns `true` if this is the mount root.
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Append one component, producing a child path.
    pub fn join(&self, name: &PathComponent) -> RepoPath {
        if self.is_root() {
            RepoPath(name.as_str().to_string())
        } else {
            RepoPath(format!("{}/{}", self.0, name))
        }
    }

    /// The path as a string slice (empty for the root).
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

impl fmt::Display for RepoPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_accepts_ordinary_names() {
        assert!(PathComponent::new("hello.txt").is_ok());
        assert!(PathComponent::new("a b c").is_ok());
        assert!(PathComponent::new("...").is_ok());
    }

    #[test]
    fn component_rejects_reserved_and_malformed() {
        assert!(PathComponent::new("").is_err());
        assert!(PathComponent::new(".").is_err());
        assert!(PathComponent::new("..").is_err());
        assert!(PathComponent::new("a/b").is_err());
        assert!(PathComponent::new("a\0b").is_err());
    }

    #[test]
    fn join_builds_slash_separated_paths() {
        let a = PathComponent::new("a").unwrap();
        let b = PathComponent::new("b").unwrap();
        let path = RepoPath::root().join(&a).join(&b);
        assert_eq!(path.as_str(), "a/b");
        assert!(!path.is_root());
    }

    #[test]
    fn root_is_empty() {
        assert!(RepoPath::root().is_root());
        assert_eq!(RepoPath::root().as_str(), "");
    }

    #[test]
    fn parse_validates_components() {
        assert!(RepoPath::parse("src/lib.rs").is_ok());
        assert!(RepoPath::parse("").is_ok());
        assert!(RepoPath::parse("src//lib.rs").is_err());
        assert!(RepoPath::parse("src/../etc").is_err());
    }

    #[test]
    fn component_serde_rejects_invalid() {
        let ok: Result<PathComponent, _> = serde_json::from_str("\"name\"");
        assert!(ok.is_ok());
        let bad: Result<PathComponent, _> = serde_json::from_str("\"a/b\"");
        assert!(bad.is_err());
    }
}
