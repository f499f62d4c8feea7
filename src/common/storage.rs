/// Storage engines backing a participant replica
///
/// Supports in-memory, sled, and RocksDB backends. Each engine serializes its own
/// writes and provides its own durability; the 2PC layer never locks it.
use crate::common::{Error, Result, StorageBackend};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

#[cfg(feature = "rocksdb")]
use rocksdb::{IteratorMode, Options, DB};

/// Trait for key-value storage backends
pub trait KVStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: &[u8]) -> Result<()>;
    /// Returns whether the key existed.
    fn delete(&self, key: &str) -> Result<bool>;
    /// Every entry, ordered by key.
    fn iter_all(&self) -> Result<Vec<(String, Vec<u8>)>>;
}

/// In-memory store
#[derive(Default)]
pub struct MemStore {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KVStore for MemStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.map.lock()?.get(key).cloned())
    }
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.map.lock()?.insert(key.to_string(), value.to_vec());
        Ok(())
    }
    fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.map.lock()?.remove(key).is_some())
    }
    fn iter_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        Ok(self
            .map
            .lock()?
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

/// Sled store
#[cfg(feature = "sled-backend")]
pub struct SledStore {
    db: sled::Db,
}

#[cfg(feature = "sled-backend")]
impl SledStore {
    pub fn open(path: &Path) -> Result<Self> {
        let db = sled::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self { db })
    }
}

#[cfg(feature = "sled-backend")]
impl KVStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map(|v| v.map(|ivec| ivec.to_vec()))
            .map_err(|e| Error::Storage(e.to_string()))
    }
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .insert(key, value)
            .map_err(|e| Error::Storage(e.to_string()))?;
        self.db.flush().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(())
    }
    fn delete(&self, key: &str) -> Result<bool> {
        let existed = self
            .db
            .remove(key)
            .map_err(|e| Error::Storage(e.to_string()))?
            .is_some();
        self.db.flush().map_err(|e| Error::Storage(e.to_string()))?;
        Ok(existed)
    }
    fn iter_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.iter() {
            let (k, v) = item.map_err(|e| Error::Storage(e.to_string()))?;
            let key = String::from_utf8(k.to_vec())
                .map_err(|_| Error::Corrupted("non UTF-8 key in storage".into()))?;
            out.push((key, v.to_vec()));
        }
        Ok(out)
    }
}

/// RocksDB store
#[cfg(feature = "rocksdb")]
pub struct RocksStore {
    db: DB,
}

#[cfg(feature = "rocksdb")]
impl RocksStore {
    pub fn open(path: &Path) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self { db })
    }
}

#[cfg(feature = "rocksdb")]
impl KVStore for RocksStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db.get(key).map_err(|e| Error::Storage(e.to_string()))
    }
    fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.db
            .put(key, value)
            .map_err(|e| Error::Storage(e.to_string()))
    }
    fn delete(&self, key: &str) -> Result<bool> {
        let existed = self.get(key)?.is_some();
        if existed {
            self.db
                .delete(key)
                .map_err(|e| Error::Storage(e.to_string()))?;
        }
        Ok(existed)
    }
    fn iter_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        let mut out = Vec::new();
        for item in self.db.iterator(IteratorMode::Start) {
            let (k, v) = item.map_err(|e| Error::Storage(e.to_string()))?;
            let key = String::from_utf8(k.to_vec())
                .map_err(|_| Error::Corrupted("non UTF-8 key in storage".into()))?;
            out.push((key, v.to_vec()));
        }
        Ok(out)
    }
}

/// Shared handle to the configured storage engine
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn KVStore>,
}

impl Storage {
    pub fn new_memory() -> Self {
        Self {
            backend: Arc::new(MemStore::new()),
        }
    }

    /// Open the engine selected by `backend` under `path`.
    pub fn open(backend: StorageBackend, path: &Path) -> Result<Self> {
        match backend {
            StorageBackend::Memory => Ok(Self::new_memory()),
            #[cfg(feature = "sled-backend")]
            StorageBackend::Sled => Ok(Self {
                backend: Arc::new(SledStore::open(path)?),
            }),
            #[cfg(feature = "rocksdb")]
            StorageBackend::RocksDb => Ok(Self {
                backend: Arc::new(RocksStore::open(path)?),
            }),
            #[allow(unreachable_patterns)]
            other => Err(Error::InvalidConfig(format!(
                "storage backend {:?} not compiled in (path {:?})",
                other, path
            ))),
        }
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.backend.get(key)
    }
    pub fn put(&self, key: &str, value: &[u8]) -> Result<()> {
        self.backend.put(key, value)
    }
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.backend.delete(key)
    }
    pub fn iter_all(&self) -> Result<Vec<(String, Vec<u8>)>> {
        self.backend.iter_all()
    }
}

impl Default for Storage {
    fn default() -> Self {
        Self::new_memory()
    }
}
