use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use rusqlite::{Connection, OptionalExtension};
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::key_space::KeySpace;
use crate::local::{LocalStore, WriteBatch};

/// Sqlite-backed local store: one table per key space.
///
/// Sqlite has no async surface, so the async reads hop to the blocking
/// thread pool; the calling task never blocks on engine I/O.
pub struct SqliteLocalStore {
    conn: Arc<Mutex<Connection>>,
}

impl std::fmt::Debug for SqliteLocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLocalStore").finish_non_exhaustive()
    }
}

impl SqliteLocalStore {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open a private in-memory database.
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;",
        )?;
        for ks in KeySpace::ALL {
            conn.execute_batch(&format!(
                "CREATE TABLE IF NOT EXISTS {} (
                     key BLOB PRIMARY KEY,
                     value BLOB NOT NULL
                 )",
                Self::table(ks)
            ))?;
        }
        debug!("sqlite local store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn table(key_space: KeySpace) -> String {
        format!("ks_{}", key_space.name())
    }

    fn get_locked(
        conn: &Mutex<Connection>,
        key_space: KeySpace,
        key: &[u8],
    ) -> StoreResult<Option<Bytes>> {
        let conn = conn.lock().expect("lock poisoned");
        let value: Option<Vec<u8>> = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", Self::table(key_space)),
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.map(Bytes::from))
    }
}

#[async_trait]
impl LocalStore for SqliteLocalStore {
    fn get(&self, key_space: KeySpace, key: &[u8]) -> StoreResult<Option<Bytes>> {
        Self::get_locked(&self.conn, key_space, key)
    }

    fn put(&self, key_space: KeySpace, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                Self::table(key_space)
            ),
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    fn has_key(&self, key_space: KeySpace, key: &[u8]) -> StoreResult<bool> {
        let conn = self.conn.lock().expect("lock poisoned");
        let found: Option<i64> = conn
            .query_row(
                &format!("SELECT 1 FROM {} WHERE key = ?1", Self::table(key_space)),
                [key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    fn begin_write(&self, size_hint: usize) -> Box<dyn WriteBatch + '_> {
        Box::new(SqliteWriteBatch {
            conn: Arc::clone(&self.conn),
            ops: Vec::new(),
            size_hint,
        })
    }

    fn clear_key_space(&self, key_space: KeySpace) -> StoreResult<()> {
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute(&format!("DELETE FROM {}", Self::table(key_space)), [])?;
        Ok(())
    }

    fn compact_key_space(&self, _key_space: KeySpace) -> StoreResult<()> {
        // Sqlite vacuums the whole database; there is no per-table pass.
        let conn = self.conn.lock().expect("lock poisoned");
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    async fn get_async(&self, key_space: KeySpace, key: Vec<u8>) -> StoreResult<Option<Bytes>> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || Self::get_locked(&conn, key_space, &key))
            .await
            .map_err(|e| StoreError::Storage(format!("blocking read task failed: {e}")))?
    }

    async fn get_batch(
        &self,
        key_space: KeySpace,
        keys: Vec<Vec<u8>>,
    ) -> StoreResult<Vec<Option<Bytes>>> {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            keys.iter()
                .map(|key| Self::get_locked(&conn, key_space, key))
                .collect()
        })
        .await
        .map_err(|e| StoreError::Storage(format!("blocking read task failed: {e}")))?
    }
}

struct SqliteWriteBatch {
    conn: Arc<Mutex<Connection>>,
    ops: Vec<(KeySpace, Vec<u8>, Vec<u8>)>,
    size_hint: usize,
}

impl WriteBatch for SqliteWriteBatch {
    fn put(&mut self, key_space: KeySpace, key: &[u8], value: &[u8]) {
        self.ops.push((key_space, key.to_vec(), value.to_vec()));
    }

    fn flush(self: Box<Self>) -> StoreResult<()> {
        let mut conn = self.conn.lock().expect("lock poisoned");
        let tx = conn.transaction()?;
        for (key_space, key, value) in &self.ops {
            tx.execute(
                &format!(
                    "INSERT OR REPLACE INTO {} (key, value) VALUES (?1, ?2)",
                    SqliteLocalStore::table(*key_space)
                ),
                rusqlite::params![key, value],
            )?;
        }
        tx.commit()?;
        debug!(ops = self.ops.len(), size_hint = self.size_hint, "batch flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Blob, BlobMetadata, Tree, TreeEntry, EntryKind};
    use canopy_types::{Hash, PathComponent};

    fn name(s: &str) -> PathComponent {
        PathComponent::new(s).unwrap()
    }

    #[test]
    fn put_get_roundtrip() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        store.put(KeySpace::ProxyHash, b"key", b"value").unwrap();
        let got = store.get(KeySpace::ProxyHash, b"key").unwrap().unwrap();
        assert_eq!(got.as_ref(), b"value");
        assert!(store.has_key(KeySpace::ProxyHash, b"key").unwrap());
        assert!(store.get(KeySpace::ProxyHash, b"other").unwrap().is_none());
    }

    #[test]
    fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("store.db");
        {
            let store = SqliteLocalStore::open(&db).unwrap();
            store.put(KeySpace::Tree, b"k", b"persisted").unwrap();
        }
        let store = SqliteLocalStore::open(&db).unwrap();
        let got = store.get(KeySpace::Tree, b"k").unwrap().unwrap();
        assert_eq!(got.as_ref(), b"persisted");
    }

    #[test]
    fn batch_flush_applies_all() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        let mut batch = store.begin_write(128);
        batch.put(KeySpace::Blob, b"a", b"1");
        batch.put(KeySpace::Tree, b"b", b"2");
        assert!(store.get(KeySpace::Blob, b"a").unwrap().is_none());
        batch.flush().unwrap();
        assert!(store.has_key(KeySpace::Blob, b"a").unwrap());
        assert!(store.has_key(KeySpace::Tree, b"b").unwrap());
    }

    #[test]
    fn clear_caches_then_compact() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        store.put(KeySpace::Blob, b"b", b"ephemeral").unwrap();
        store.put(KeySpace::Tree, b"t", b"persistent").unwrap();
        store.clear_caches_and_compact_all().unwrap();
        assert!(!store.has_key(KeySpace::Blob, b"b").unwrap());
        assert!(store.has_key(KeySpace::Tree, b"t").unwrap());
    }

    #[tokio::test]
    async fn async_read_path() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        store.put(KeySpace::Blob, b"k", b"v").unwrap();
        let got = store
            .get_async(KeySpace::Blob, b"k".to_vec())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.as_ref(), b"v");

        let batch = store
            .get_batch(KeySpace::Blob, vec![b"k".to_vec(), b"nope".to_vec()])
            .await
            .unwrap();
        assert!(batch[0].is_some());
        assert!(batch[1].is_none());
    }

    // -----------------------------------------------------------------------
    // Typed put/get protocols
    // -----------------------------------------------------------------------

    #[test]
    fn put_blob_writes_framed_body_and_28_byte_metadata() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        let contents: &[u8] = &[0xDE, 0xAD, 0xBE, 0xEF];
        let blob = Blob::new(Hash::zero(), Bytes::copy_from_slice(contents));

        let metadata = store.put_blob(&blob).unwrap();
        assert_eq!(metadata.size, 4);
        assert_eq!(metadata.content_hash, Hash::sha1(contents));

        // Key: hash of the framed form, since the stated hash was zero.
        let mut framed = b"blob 4\0".to_vec();
        framed.extend_from_slice(contents);
        let key = Hash::sha1(&framed);

        let body = store.get(KeySpace::Blob, key.as_bytes()).unwrap().unwrap();
        assert_eq!(body.len(), 11);
        assert_eq!(body.as_ref(), framed.as_slice());

        let meta_bytes = store
            .get(KeySpace::BlobMetadata, key.as_bytes())
            .unwrap()
            .unwrap();
        assert_eq!(meta_bytes.len(), 28);
        assert_eq!(&meta_bytes[..8], &[0, 0, 0, 0, 0, 0, 0, 4]);
        assert_eq!(&meta_bytes[8..], Hash::sha1(contents).as_bytes());

        let parsed = BlobMetadata::parse(&key, &meta_bytes).unwrap();
        assert_eq!(parsed, metadata);
    }

    #[tokio::test]
    async fn put_tree_then_get_tree_roundtrip() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        let tree = Tree::new(
            Hash::zero(),
            vec![
                TreeEntry::new(name("a"), EntryKind::Regular, Hash::sha1(b"a")),
                TreeEntry::new(name("sub"), EntryKind::SubTree, Hash::sha1(b"s")),
            ],
        )
        .unwrap();

        let id = store.put_tree(&tree).unwrap();
        let fetched = store.get_tree(&id).await.unwrap().unwrap();
        assert_eq!(fetched.entries(), tree.entries());

        assert!(store.get_tree(&Hash::sha1(b"missing")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn get_blob_parses_framing() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        let blob = Blob::new(Hash::zero(), Bytes::from_static(b"hello"));
        store.put_blob(&blob).unwrap();

        let mut framed = b"blob 5\0".to_vec();
        framed.extend_from_slice(b"hello");
        let key = Hash::sha1(&framed);

        let fetched = store.get_blob(&key).await.unwrap().unwrap();
        assert_eq!(fetched.to_bytes().as_ref(), b"hello");

        let meta = store.get_blob_metadata(&key).await.unwrap().unwrap();
        assert_eq!(meta.size, 5);
        assert_eq!(meta.content_hash, Hash::sha1(b"hello"));
    }

    #[tokio::test]
    async fn clear_caches_then_repopulate_reads_identically() {
        let store = SqliteLocalStore::open_in_memory().unwrap();
        let blob = Blob::new(Hash::zero(), Bytes::from_static(b"cached"));
        let before = store.put_blob(&blob).unwrap();

        store.clear_caches().unwrap();

        // Repopulating yields byte-identical read behavior.
        let after = store.put_blob(&blob).unwrap();
        assert_eq!(before, after);
    }
}
