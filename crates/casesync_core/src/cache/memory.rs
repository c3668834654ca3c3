//! In-memory cache backend.

use std::collections::HashMap;
use std::sync::RwLock;

use super::{CacheBackend, CacheKey, CacheSnapshot};
use crate::error::CacheResult;

/// Cache backend that keeps snapshots in a map. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryCacheBackend {
    entries: RwLock<HashMap<CacheKey, CacheSnapshot>>,
}

impl MemoryCacheBackend {
    /// Create an empty backend.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CacheBackend for MemoryCacheBackend {
    fn load(&self, key: &CacheKey) -> CacheResult<Option<CacheSnapshot>> {
        Ok(self.entries.read().unwrap().get(key).cloned())
    }

    fn store(&self, snapshot: &CacheSnapshot) -> CacheResult<()> {
        self.entries
            .write()
            .unwrap()
            .insert(snapshot.key.clone(), snapshot.clone());
        Ok(())
    }

    fn remove(&self, key: &CacheKey) -> CacheResult<()> {
        self.entries.write().unwrap().remove(key);
        Ok(())
    }

    fn keys(&self) -> CacheResult<Vec<CacheKey>> {
        Ok(self.entries.read().unwrap().keys().cloned().collect())
    }

    fn clear(&self) -> CacheResult<()> {
        self.entries.write().unwrap().clear();
        Ok(())
    }
}
