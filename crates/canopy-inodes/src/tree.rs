use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use tracing::debug;

use canopy_store::{EntryKind, ObjectStore};
use canopy_types::{Hash, InodeNumber, PathComponent};

use crate::base::{InodeBase, InodeKind, InodeMetadata};
use crate::error::{FsError, FsResult};

/// Descriptor for one child of a tree.
///
/// A clean child carries the hash of its source object; a diverged child
/// carries none and lives in the overlay. The inode number is present only
/// while the child is loaded (or was restored with a positive kernel
/// count); parent→child references stay weak by never holding more than
/// this number.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChildEntry {
    pub kind: EntryKind,
    /// Full mode, type bits included.
    pub mode: u32,
    pub ino: Option<InodeNumber>,
    pub source: Option<Hash>,
}

impl ChildEntry {
    /// Descriptor for a child still identical to its source object.
    pub fn from_source(kind: EntryKind, source: Hash) -> Self {
        Self {
            kind,
            mode: initial_mode(kind),
            ino: None,
            source: Some(source),
        }
    }

    /// Descriptor for a freshly created, overlay-backed child.
    pub fn new_local(kind: EntryKind, mode: u32, ino: InodeNumber) -> Self {
        Self {
            kind,
            mode,
            ino: Some(ino),
            source: None,
        }
    }
}

/// Default full mode for a child faulted in from a source tree.
pub fn initial_mode(kind: EntryKind) -> u32 {
    match kind {
        EntryKind::Regular => 0o100644,
        EntryKind::Executable => 0o100755,
        EntryKind::Symlink => 0o120777,
        EntryKind::SubTree => 0o040755,
    }
}

/// A tree inode is in exactly one of three states. `Unloaded` and `Loaded`
/// are both *clean* (fully derivable from the source hash); `Materialized`
/// means at least one descendant diverged and the listing is backed by the
/// overlay.
pub(crate) enum TreeState {
    Unloaded {
        source: Hash,
    },
    Loaded {
        source: Hash,
        children: BTreeMap<PathComponent, ChildEntry>,
    },
    Materialized {
        children: BTreeMap<PathComponent, ChildEntry>,
    },
}

impl TreeState {
    pub(crate) fn children(&self) -> FsResult<&BTreeMap<PathComponent, ChildEntry>> {
        match self {
            TreeState::Unloaded { .. } => Err(FsError::Internal(
                "tree contents accessed before load".into(),
            )),
            TreeState::Loaded { children, .. } | TreeState::Materialized { children } => {
                Ok(children)
            }
        }
    }

    pub(crate) fn children_mut(
        &mut self,
    ) -> FsResult<&mut BTreeMap<PathComponent, ChildEntry>> {
        match self {
            TreeState::Unloaded { .. } => Err(FsError::Internal(
                "tree contents accessed before load".into(),
            )),
            TreeState::Loaded { children, .. } | TreeState::Materialized { children } => {
                Ok(children)
            }
        }
    }
}

/// Directory inode.
pub struct TreeInode {
    base: InodeBase,
    pub(crate) state: Mutex<TreeState>,
    /// Serializes fetches of the source tree so concurrent readers issue at
    /// most one object-store call.
    load_lock: tokio::sync::Mutex<()>,
}

impl TreeInode {
    /// Clean tree whose own child list will be fetched on demand.
    pub fn new_unloaded(
        ino: InodeNumber,
        parent: InodeNumber,
        name: PathComponent,
        metadata: InodeMetadata,
        source: Hash,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: InodeBase::new(ino, InodeKind::Tree, Some(parent), Some(name), metadata),
            state: Mutex::new(TreeState::Unloaded { source }),
            load_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Materialized tree backed by the overlay (the root, a restored
    /// directory, or a fresh mkdir).
    pub fn new_materialized(
        ino: InodeNumber,
        parent: Option<InodeNumber>,
        name: Option<PathComponent>,
        metadata: InodeMetadata,
        children: BTreeMap<PathComponent, ChildEntry>,
    ) -> Arc<Self> {
        Arc::new(Self {
            base: InodeBase::new(ino, InodeKind::Tree, parent, name, metadata),
            state: Mutex::new(TreeState::Materialized { children }),
            load_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn base(&self) -> &InodeBase {
        &self.base
    }

    pub fn is_materialized(&self) -> bool {
        matches!(
            *self.state.lock().expect("lock poisoned"),
            TreeState::Materialized { .. }
        )
    }

    /// The source hash while clean; `None` once materialized.
    pub fn source_hash(&self) -> Option<Hash> {
        match *self.state.lock().expect("lock poisoned") {
            TreeState::Unloaded { source } | TreeState::Loaded { source, .. } => Some(source),
            TreeState::Materialized { .. } => None,
        }
    }

    /// Fault in the child list from the object store if this tree is still
    /// deferred. Concurrent callers serialize on the load lock; only the
    /// first fetches.
    pub async fn ensure_loaded(&self, store: &ObjectStore) -> FsResult<()> {
        if !matches!(
            *self.state.lock().expect("lock poisoned"),
            TreeState::Unloaded { .. }
        ) {
            return Ok(());
        }

        let _guard = self.load_lock.lock().await;
        let source = match *self.state.lock().expect("lock poisoned") {
            TreeState::Unloaded { source } => source,
            // Someone else finished the load while we waited.
            _ => return Ok(()),
        };

        let tree = store
            .get_tree(&source)
            .await?
            .ok_or_else(|| FsError::NotFound(format!("source tree {source}")))?;

        let children = tree
            .entries()
            .iter()
            .map(|e| (e.name.clone(), ChildEntry::from_source(e.kind, e.hash)))
            .collect();

        let mut state = self.state.lock().expect("lock poisoned");
        if let TreeState::Unloaded { .. } = *state {
            *state = TreeState::Loaded { source, children };
            debug!(ino = %self.base.ino(), %source, "tree contents loaded");
        }
        Ok(())
    }

    /// Snapshot of the child map. The tree must be loaded.
    pub fn children_snapshot(&self) -> FsResult<BTreeMap<PathComponent, ChildEntry>> {
        let state = self.state.lock().expect("lock poisoned");
        state.children().cloned()
    }

    /// Find a child by name, honoring the mount's case policy. Returns the
    /// stored key alongside the entry, since a case-folding match may differ
    /// from the query.
    pub fn find_child(
        &self,
        name: &PathComponent,
        case_sensitive: bool,
    ) -> FsResult<Option<(PathComponent, ChildEntry)>> {
        let state = self.state.lock().expect("lock poisoned");
        let children = state.children()?;
        Ok(find_in(children, name, case_sensitive).map(|k| (k.clone(), children[&k].clone())))
    }

    /// Record the inode number assigned to a loaded child.
    pub fn set_child_ino(&self, name: &PathComponent, ino: InodeNumber) -> FsResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        let children = state.children_mut()?;
        match children.get_mut(name) {
            Some(entry) => {
                entry.ino = Some(ino);
                Ok(())
            }
            None => Err(FsError::Internal(format!(
                "no descriptor for loaded child {name}"
            ))),
        }
    }

    /// Reverse a load: drop the child's inode number so the descriptor
    /// reverts to source-hash form. Returns `false` (and leaves the entry
    /// untouched) when the child has no source to revert to.
    pub fn clear_child_ino(&self, name: &PathComponent) -> bool {
        let mut state = self.state.lock().expect("lock poisoned");
        let Ok(children) = state.children_mut() else {
            return false;
        };
        match children.get_mut(name) {
            Some(entry) if entry.source.is_some() => {
                entry.ino = None;
                true
            }
            _ => false,
        }
    }

    /// Drop the source hash on a child whose contents diverged. Returns the
    /// updated descriptor for the overlay write.
    pub fn clear_child_source(&self, name: &PathComponent) -> FsResult<ChildEntry> {
        let mut state = self.state.lock().expect("lock poisoned");
        let children = state.children_mut()?;
        match children.get_mut(name) {
            Some(entry) => {
                entry.source = None;
                Ok(entry.clone())
            }
            None => Err(FsError::Internal(format!(
                "no descriptor for materialized child {name}"
            ))),
        }
    }

    /// Transition `Loaded` → `Materialized`.
    ///
    /// Returns a snapshot of the children when this call performed the
    /// transition (the caller persists the listing to the overlay), `None`
    /// when the tree was already materialized.
    pub fn materialize_now(&self) -> FsResult<Option<BTreeMap<PathComponent, ChildEntry>>> {
        let mut state = self.state.lock().expect("lock poisoned");
        match &*state {
            TreeState::Unloaded { .. } => Err(FsError::Internal(
                "materialize before contents were loaded".into(),
            )),
            TreeState::Materialized { .. } => Ok(None),
            TreeState::Loaded { children, .. } => {
                let snapshot = children.clone();
                *state = TreeState::Materialized {
                    children: snapshot.clone(),
                };
                debug!(ino = %self.base.ino(), "tree materialized");
                Ok(Some(snapshot))
            }
        }
    }

    /// Add a child descriptor, failing with *exists* if the name is already
    /// taken under the mount's case policy. The check and the insert are
    /// atomic under the state lock.
    pub fn insert_child(
        &self,
        name: &PathComponent,
        entry: ChildEntry,
        case_sensitive: bool,
    ) -> FsResult<()> {
        let mut state = self.state.lock().expect("lock poisoned");
        let children = state.children_mut()?;
        if find_in(children, name, case_sensitive).is_some() {
            return Err(FsError::Exists(name.to_string()));
        }
        children.insert(name.clone(), entry);
        Ok(())
    }

    /// Remove a child descriptor by its stored name.
    pub fn remove_child_entry(&self, name: &PathComponent) -> FsResult<ChildEntry> {
        let mut state = self.state.lock().expect("lock poisoned");
        let children = state.children_mut()?;
        children
            .remove(name)
            .ok_or_else(|| FsError::NotFound(name.to_string()))
    }

    /// Number of sub-tree children; used for `nlink`.
    pub fn count_subtrees(&self) -> FsResult<u32> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state
            .children()?
            .values()
            .filter(|e| e.kind.is_tree())
            .count() as u32)
    }

    /// Returns `true` when the directory has no children.
    pub fn is_empty_dir(&self) -> FsResult<bool> {
        let state = self.state.lock().expect("lock poisoned");
        Ok(state.children()?.is_empty())
    }

    /// Returns `true` when any child descriptor holds an inode number.
    pub fn has_assigned_children(&self) -> bool {
        let state = self.state.lock().expect("lock poisoned");
        match state.children() {
            Ok(children) => children.values().any(|e| e.ino.is_some()),
            Err(_) => false,
        }
    }
}

/// Name resolution with optional ascii case folding.
pub(crate) fn find_in(
    children: &BTreeMap<PathComponent, ChildEntry>,
    name: &PathComponent,
    case_sensitive: bool,
) -> Option<PathComponent> {
    if case_sensitive || children.contains_key(name) {
        return children.contains_key(name).then(|| name.clone());
    }
    children
        .keys()
        .find(|k| k.as_str().eq_ignore_ascii_case(name.as_str()))
        .cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn name(s: &str) -> PathComponent {
        PathComponent::new(s).unwrap()
    }

    fn meta() -> InodeMetadata {
        InodeMetadata::new(0o040755, 0, 0, SystemTime::now())
    }

    fn materialized_tree(children: Vec<(&str, ChildEntry)>) -> Arc<TreeInode> {
        TreeInode::new_materialized(
            InodeNumber::ROOT,
            None,
            None,
            meta(),
            children
                .into_iter()
                .map(|(n, e)| (name(n), e))
                .collect(),
        )
    }

    #[test]
    fn unloaded_tree_rejects_content_access() {
        let tree = TreeInode::new_unloaded(
            InodeNumber::new(5).unwrap(),
            InodeNumber::ROOT,
            name("dir"),
            meta(),
            Hash::sha1(b"tree"),
        );
        assert!(tree.children_snapshot().is_err());
        assert!(!tree.is_materialized());
        assert_eq!(tree.source_hash(), Some(Hash::sha1(b"tree")));
    }

    #[test]
    fn clear_child_ino_requires_source() {
        let clean = ChildEntry::from_source(EntryKind::Regular, Hash::sha1(b"src"));
        let local = ChildEntry::new_local(EntryKind::Regular, 0o100644, InodeNumber::new(9).unwrap());
        let tree = materialized_tree(vec![("clean", clean), ("local", local)]);

        tree.set_child_ino(&name("clean"), InodeNumber::new(8).unwrap())
            .unwrap();
        assert!(tree.clear_child_ino(&name("clean")));
        assert!(!tree.clear_child_ino(&name("local")));

        let snap = tree.children_snapshot().unwrap();
        assert_eq!(snap[&name("clean")].ino, None);
        assert!(snap[&name("local")].ino.is_some());
    }

    #[test]
    fn case_folding_lookup() {
        let entry = ChildEntry::from_source(EntryKind::Regular, Hash::sha1(b"x"));
        let tree = materialized_tree(vec![("README", entry)]);

        assert!(tree
            .find_child(&name("readme"), true)
            .unwrap()
            .is_none());
        let (stored, _) = tree.find_child(&name("readme"), false).unwrap().unwrap();
        assert_eq!(stored.as_str(), "README");
    }

    #[test]
    fn subtree_count_and_emptiness() {
        let tree = materialized_tree(vec![
            ("f", ChildEntry::from_source(EntryKind::Regular, Hash::sha1(b"f"))),
            ("d1", ChildEntry::from_source(EntryKind::SubTree, Hash::sha1(b"d1"))),
            ("d2", ChildEntry::from_source(EntryKind::SubTree, Hash::sha1(b"d2"))),
        ]);
        assert_eq!(tree.count_subtrees().unwrap(), 2);
        assert!(!tree.is_empty_dir().unwrap());
        assert!(materialized_tree(vec![]).is_empty_dir().unwrap());
    }
}
