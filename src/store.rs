//! Key-value persistence interface for rate-limit counters.
//!
//! Keys are namespaced as `"{user_id}_{field}"`. The default backend is an
//! embedded sled tree; the in-memory backend backs tests and single-shot
//! tooling. Backends are synchronous (sled is), exposed behind
//! `Arc<dyn KvStore>`.

use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;

/// Minimal get/set/commit interface over durable key-value state.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn set(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Flush pending writes to durable storage. A no-op for volatile
    /// backends.
    fn commit(&self) -> Result<()>;
}

/// sled-backed store.
pub struct SledStore {
    _db: sled::Db,
    tree: sled::Tree,
}

impl SledStore {
    /// Open (or create) a sled database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path)?;
        let tree = db.open_tree("modelgate")?;
        Ok(Self { _db: db, tree })
    }
}

impl KvStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.tree.get(key.as_bytes())?.map(|iv| iv.to_vec()))
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        self.tree.insert(key.as_bytes(), value)?;
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        self.tree.flush()?;
        Ok(())
    }
}

/// Volatile in-memory store for tests and non-persistent deployments.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let map = self
            .inner
            .read()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<()> {
        let mut map = self
            .inner
            .write()
            .map_err(|_| anyhow!("memory store lock poisoned"))?;
        map.insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn commit(&self) -> Result<()> {
        Ok(())
    }
}
