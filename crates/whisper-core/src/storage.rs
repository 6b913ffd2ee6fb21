//! Key/value persistence.
//!
//! The mesh core treats durable storage as an external collaborator with a
//! tiny async contract: `get`, `set`, `remove` over string keys and string
//! (JSON) values. Two implementations ship here:
//!
//! - [`RedbKv`]: a single redb table on disk, used by the CLI
//! - [`MemoryKv`]: a process-local map, used by tests and simulations
//!
//! Every key lives under a stable, versioned name (see [`keys`]). Values are
//! JSON documents decoded with `#[serde(default)]` on optional fields so the
//! persisted schema can grow additively.

use std::collections::HashMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use redb::{Database, ReadableTable, TableDefinition};

use crate::error::{MeshError, MeshResult};

/// Versioned storage keys.
pub mod keys {
    /// Local identity record
    pub const IDENTITY: &str = "whisper.v1.identity";
    /// Local key pair
    pub const KEY_PAIR: &str = "whisper.v1.keys";
    /// Conversation index
    pub const CONVERSATIONS: &str = "whisper.v1.conversations";
    /// Delivered message ids
    pub const DELIVERED: &str = "whisper.v1.delivered";
    /// Outgoing packets that have not reached any neighbor yet
    pub const PENDING: &str = "whisper.v1.pending";
    /// Router seen-set snapshot
    pub const SEEN: &str = "whisper.v1.seen";
    /// Known peers and their public keys
    pub const PEERS: &str = "whisper.v1.peers";
}

/// Async key/value persistence contract.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Read a value, `None` when the key is absent.
    async fn get(&self, key: &str) -> MeshResult<Option<String>>;

    /// Write a value, replacing any previous one.
    async fn set(&self, key: &str, value: &str) -> MeshResult<()>;

    /// Delete a key. Removing an absent key is not an error.
    async fn remove(&self, key: &str) -> MeshResult<()>;
}

/// Run a persistence future with an upper time bound.
///
/// A timeout is reported as [`MeshError::Persistence`] so callers can treat
/// it like any other resource failure.
pub(crate) async fn bounded<T, F>(timeout: Duration, what: &str, fut: F) -> MeshResult<T>
where
    F: Future<Output = MeshResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(MeshError::Persistence(format!(
            "{} timed out after {:?}",
            what, timeout
        ))),
    }
}

// Table definition
const KV_TABLE: TableDefinition<&str, &str> = TableDefinition::new("whisper_kv");

/// redb-backed key/value store.
///
/// redb calls are blocking, so each operation runs on the blocking pool and
/// the async caller only suspends on the join.
#[derive(Clone)]
pub struct RedbKv {
    db: Arc<RwLock<Database>>,
}

impl RedbKv {
    /// Open (or create) a store at the given path.
    ///
    /// This will:
    /// - Create the parent directory if it doesn't exist
    /// - Initialize the database file
    /// - Create the key/value table
    pub fn open(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;

        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(KV_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// List every stored key (diagnostics only).
    pub fn keys(&self) -> MeshResult<Vec<String>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(KV_TABLE)?;

        let mut keys = Vec::new();
        for entry in table.iter()? {
            let (key, _) = entry?;
            keys.push(key.value().to_string());
        }
        Ok(keys)
    }

    async fn blocking<T, F>(&self, op: F) -> MeshResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> MeshResult<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || {
            let guard = db.read();
            op(&guard)
        })
        .await
        .map_err(|e| MeshError::Persistence(format!("Blocking task failed: {}", e)))?
    }
}

#[async_trait]
impl KvStore for RedbKv {
    async fn get(&self, key: &str) -> MeshResult<Option<String>> {
        let key = key.to_string();
        self.blocking(move |db| {
            let read_txn = db.begin_read()?;
            let table = read_txn.open_table(KV_TABLE)?;
            let value = table.get(key.as_str())?.map(|v| v.value().to_string());
            Ok(value)
        })
        .await
    }

    async fn set(&self, key: &str, value: &str) -> MeshResult<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(KV_TABLE)?;
                table.insert(key.as_str(), value.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }

    async fn remove(&self, key: &str) -> MeshResult<()> {
        let key = key.to_string();
        self.blocking(move |db| {
            let write_txn = db.begin_write()?;
            {
                let mut table = write_txn.open_table(KV_TABLE)?;
                table.remove(key.as_str())?;
            }
            write_txn.commit()?;
            Ok(())
        })
        .await
    }
}

/// In-memory key/value store.
#[derive(Debug, Default, Clone)]
pub struct MemoryKv {
    entries: Arc<RwLock<HashMap<String, String>>>,
}

impl MemoryKv {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored keys.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Check whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.entries.read().contains_key(key)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> MeshResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> MeshResult<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn remove(&self, key: &str) -> MeshResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_kv() -> (RedbKv, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");
        let kv = RedbKv::open(&db_path).unwrap();
        (kv, temp_dir)
    }

    #[test]
    fn test_store_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested/path/to/test.redb");
        let kv = RedbKv::open(&db_path);
        assert!(kv.is_ok());
        assert!(db_path.exists());
    }

    #[tokio::test]
    async fn test_set_get_remove() {
        let (kv, _temp) = create_test_kv();

        assert!(kv.get(keys::IDENTITY).await.unwrap().is_none());

        kv.set(keys::IDENTITY, "{\"id\":\"abc\"}").await.unwrap();
        assert_eq!(
            kv.get(keys::IDENTITY).await.unwrap().as_deref(),
            Some("{\"id\":\"abc\"}")
        );

        kv.remove(keys::IDENTITY).await.unwrap();
        assert!(kv.get(keys::IDENTITY).await.unwrap().is_none());

        // Removing twice is fine
        kv.remove(keys::IDENTITY).await.unwrap();
    }

    #[tokio::test]
    async fn test_values_persist_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.redb");

        {
            let kv = RedbKv::open(&db_path).unwrap();
            kv.set(keys::DELIVERED, "[\"m1\"]").await.unwrap();
        }

        {
            let kv = RedbKv::open(&db_path).unwrap();
            assert_eq!(
                kv.get(keys::DELIVERED).await.unwrap().as_deref(),
                Some("[\"m1\"]")
            );
            assert_eq!(kv.keys().unwrap(), vec![keys::DELIVERED.to_string()]);
        }
    }

    #[tokio::test]
    async fn test_memory_kv() {
        let kv = MemoryKv::new();
        assert!(kv.is_empty());

        kv.set("a", "1").await.unwrap();
        kv.set("a", "2").await.unwrap();
        assert_eq!(kv.len(), 1);
        assert_eq!(kv.get("a").await.unwrap().as_deref(), Some("2"));

        // Clones share state
        let other = kv.clone();
        other.remove("a").await.unwrap();
        assert!(!kv.contains("a"));
    }

    #[tokio::test]
    async fn test_bounded_times_out() {
        let result: MeshResult<()> = bounded(Duration::from_millis(10), "slow write", async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;

        match result {
            Err(MeshError::Persistence(msg)) => assert!(msg.contains("slow write")),
            other => panic!("expected persistence timeout, got {:?}", other),
        }
    }
}
