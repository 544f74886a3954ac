use bytes::Bytes;
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use slatedb::db::Db;
use slatedb::object_store::ObjectStore;
use slatedb::object_store::local::LocalFileSystem;
use slatedb::object_store::memory::InMemory;
use slatedb::object_store::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

use crate::watch::EventLog;

/// Version expected by a create: the key must not exist yet.
pub const NEW_OBJECT_VERSION: u64 = 0;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("object not found: {0}")]
    NotFound(String),
    /// The object changed since it was read. Callers retry with a fresh
    /// read; this error never escapes to users.
    #[error("version conflict on {0}")]
    VersionConflict(String),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Compute the exclusive upper bound of a key prefix scan: the prefix with
/// its trailing `0xff` bytes stripped and the last remaining byte incremented.
/// If the prefix is all `0xff` (or empty), the range is unbounded above.
fn prefix_upper_bound(prefix: &[u8]) -> std::ops::Bound<Bytes> {
    let mut end = prefix.to_vec();
    while let Some(&last) = end.last() {
        if last == 0xff {
            end.pop();
        } else {
            let idx = end.len() - 1;
            end[idx] += 1;
            return std::ops::Bound::Excluded(Bytes::from(end));
        }
    }
    std::ops::Bound::Unbounded
}

/// Persisted record envelope carrying the optimistic-concurrency version.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Versioned<T> {
    version: u64,
    obj: T,
}

/// Persistent object registry backed by SlateDB.
///
/// Every record is wrapped in a `{version, obj}` envelope; writes are
/// compare-and-swap on the version, serialized per key by a lock table.
/// Mutations emit watch events on the embedded event log.
#[derive(Clone)]
pub struct Registry {
    db: Arc<Db>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
    pub event_log: EventLog,
}

impl Registry {
    /// Open (or create) a registry rooted at `path` on the local filesystem.
    pub async fn new(path: &str) -> anyhow::Result<Self> {
        info!("Opening registry at {}", path);
        std::fs::create_dir_all(path)
            .map_err(|e| anyhow::anyhow!("Failed to create data directory {}: {}", path, e))?;
        let object_store = Arc::new(
            LocalFileSystem::new_with_prefix(path)
                .map_err(|e| anyhow::anyhow!("Failed to create local object store: {}", e))?,
        );
        Self::open(object_store).await
    }

    /// Open a registry over an in-memory object store. Used in tests.
    pub async fn new_in_memory() -> anyhow::Result<Self> {
        Self::open(Arc::new(InMemory::new())).await
    }

    async fn open(object_store: Arc<dyn ObjectStore>) -> anyhow::Result<Self> {
        let db = Db::open(Path::from("/"), object_store)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open SlateDB: {}", e))?;
        Ok(Self {
            db: Arc::new(db),
            locks: Arc::new(DashMap::new()),
            event_log: EventLog::new(10_000),
        })
    }

    fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn read_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match self.db.get(key.as_bytes()).await {
            Ok(Some(bytes)) => Ok(Some(bytes.to_vec())),
            Ok(None) => Ok(None),
            Err(e) => Err(RegistryError::Storage(format!("get {}: {}", key, e))),
        }
    }

    async fn write_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .put(key.as_bytes(), value)
            .await
            .map_err(|e| RegistryError::Storage(format!("put {}: {}", key, e)))?;
        self.event_log.record_put(key, value).await;
        Ok(())
    }

    /// Retrieve an object and its version token.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<(T, u64)> {
        let bytes = self
            .read_raw(key)
            .await?
            .ok_or_else(|| RegistryError::NotFound(key.to_string()))?;
        let rec: Versioned<T> = serde_json::from_slice(&bytes)?;
        Ok((rec.obj, rec.version))
    }

    /// Create a new object. Fails with `VersionConflict` if the key exists.
    pub async fn create<T: Serialize>(&self, key: &str, obj: &T) -> Result<u64> {
        self.update(key, NEW_OBJECT_VERSION, obj).await
    }

    /// Compare-and-swap write. `expected_version` must match the stored
    /// version (`NEW_OBJECT_VERSION` for a create). Returns the new version.
    pub async fn update<T: Serialize>(
        &self,
        key: &str,
        expected_version: u64,
        obj: &T,
    ) -> Result<u64> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        let current = self.stored_version(key).await?;
        if current != expected_version {
            return Err(RegistryError::VersionConflict(key.to_string()));
        }
        let next = expected_version + 1;
        let bytes = serde_json::to_vec(&Versioned {
            version: next,
            obj,
        })?;
        self.write_raw(key, &bytes).await?;
        Ok(next)
    }

    /// Compare-and-swap write over two keys at once. Both versions are
    /// checked before either write happens; any mismatch fails the whole
    /// operation with `VersionConflict`. This is what makes a pod/node
    /// claim atomic: no observer sees a half-claimed pair.
    pub async fn update_pair<A: Serialize, B: Serialize>(
        &self,
        (key_a, expected_a, obj_a): (&str, u64, &A),
        (key_b, expected_b, obj_b): (&str, u64, &B),
    ) -> Result<(u64, u64)> {
        // Lock in sorted key order so concurrent pair updates never deadlock.
        let (first, second) = if key_a <= key_b {
            (key_a, key_b)
        } else {
            (key_b, key_a)
        };
        let lock_first = self.key_lock(first);
        let _guard_first = lock_first.lock().await;
        let lock_second = self.key_lock(second);
        let _guard_second = lock_second.lock().await;

        if self.stored_version(key_a).await? != expected_a {
            return Err(RegistryError::VersionConflict(key_a.to_string()));
        }
        if self.stored_version(key_b).await? != expected_b {
            return Err(RegistryError::VersionConflict(key_b.to_string()));
        }
        let bytes_a = serde_json::to_vec(&Versioned {
            version: expected_a + 1,
            obj: obj_a,
        })?;
        let bytes_b = serde_json::to_vec(&Versioned {
            version: expected_b + 1,
            obj: obj_b,
        })?;
        self.write_raw(key_a, &bytes_a).await?;
        self.write_raw(key_b, &bytes_b).await?;
        Ok((expected_a + 1, expected_b + 1))
    }

    async fn stored_version(&self, key: &str) -> Result<u64> {
        match self.read_raw(key).await? {
            None => Ok(NEW_OBJECT_VERSION),
            Some(bytes) => {
                let rec: Versioned<serde_json::Value> = serde_json::from_slice(&bytes)?;
                Ok(rec.version)
            }
        }
    }

    /// Delete a key. Deleting a missing key is not an error.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.db
            .delete(key.as_bytes())
            .await
            .map_err(|e| RegistryError::Storage(format!("delete {}: {}", key, e)))?;
        self.event_log.record_delete(key).await;
        self.locks.remove(key);
        Ok(())
    }

    /// List all objects whose keys start with `prefix`, with versions.
    pub async fn list<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<(String, T, u64)>> {
        let mut results = Vec::new();
        let start = Bytes::copy_from_slice(prefix.as_bytes());
        let range = (
            std::ops::Bound::Included(start),
            prefix_upper_bound(prefix.as_bytes()),
        );
        let mut iter = self
            .db
            .scan(range)
            .await
            .map_err(|e| RegistryError::Storage(format!("scan {}: {}", prefix, e)))?;
        while let Ok(Some(kv)) = iter.next().await {
            let key = String::from_utf8_lossy(&kv.key).to_string();
            let rec: Versioned<T> = serde_json::from_slice(&kv.value)?;
            results.push((key, rec.obj, rec.version));
        }
        Ok(results)
    }

    /// Gracefully close the registry.
    pub async fn close(self) -> anyhow::Result<()> {
        info!("Closing registry");
        self.db
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("SlateDB close failed: {}", e))
    }
}
