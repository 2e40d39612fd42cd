//! Persisted device capabilities and last-used configuration.
//!
//! Records are JSON documents tagged with a schema version. Anything that does
//! not parse, carries another schema version, or belongs to a different device
//! is treated as absent. Writes for one stable id are serialized; different ids
//! never wait on each other.

pub mod merge;
pub mod store;

pub use merge::{merge, reconcile_selection};
pub use store::{CacheStore, FileStore, MemoryStore};

use crate::errors::RigError;
use crate::types::{CapabilitySource, DeviceCapabilities, SelectedConfig};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

pub const CACHE_SCHEMA_VERSION: u32 = 2;

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    schema_version: u32,
    stable_id: String,
    saved_at: DateTime<Utc>,
    capabilities: Option<DeviceCapabilities>,
    selected_config: Option<SelectedConfig>,
}

#[derive(Deserialize)]
struct RecordHeader {
    schema_version: u32,
}

/// What the cache knows about one device.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedDevice {
    pub capabilities: Option<DeviceCapabilities>,
    pub selected_config: Option<SelectedConfig>,
    pub saved_at: DateTime<Utc>,
}

pub struct CapabilityCache {
    store: Arc<dyn CacheStore>,
    schema_version: u32,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl std::fmt::Debug for CapabilityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CapabilityCache")
            .field("schema_version", &self.schema_version)
            .finish()
    }
}

impl CapabilityCache {
    pub fn new(store: Arc<dyn CacheStore>) -> Self {
        Self::with_schema_version(store, CACHE_SCHEMA_VERSION)
    }

    /// A cache that reads and writes a specific schema version.
    pub fn with_schema_version(store: Arc<dyn CacheStore>, schema_version: u32) -> Self {
        Self {
            store,
            schema_version,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Cache without persistence.
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryStore::new()))
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    fn key_lock(&self, stable_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.key_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks
            .entry(stable_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Load the record for `stable_id`. Unusable records read as `None`.
    pub fn load(&self, stable_id: &str) -> Option<CachedDevice> {
        let bytes = match self.store.load(stable_id) {
            Ok(Some(bytes)) => bytes,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Cache read failed for {}: {}", stable_id, e);
                return None;
            }
        };

        let header: RecordHeader = match serde_json::from_slice(&bytes) {
            Ok(header) => header,
            Err(e) => {
                log::warn!("Ignoring corrupted cache record for {}: {}", stable_id, e);
                return None;
            }
        };
        if header.schema_version != self.schema_version {
            log::info!(
                "Ignoring cache record for {} with schema version {} (expected {})",
                stable_id,
                header.schema_version,
                self.schema_version
            );
            return None;
        }

        let record: CacheRecord = match serde_json::from_slice(&bytes) {
            Ok(record) => record,
            Err(e) => {
                log::warn!("Ignoring corrupted cache record for {}: {}", stable_id, e);
                return None;
            }
        };
        if record.stable_id != stable_id {
            log::warn!(
                "Cache record for {} names device {}, ignoring",
                stable_id,
                record.stable_id
            );
            return None;
        }

        if record
            .capabilities
            .as_ref()
            .is_some_and(|caps| !caps.is_consistent())
        {
            log::warn!(
                "Ignoring cache record for {} with an inconsistent mode list",
                stable_id
            );
            return None;
        }

        let capabilities = record.capabilities.map(|mut caps| {
            caps.source = CapabilitySource::Cache;
            caps
        });
        Some(CachedDevice {
            capabilities,
            selected_config: record.selected_config,
            saved_at: record.saved_at,
        })
    }

    /// Persist the current observations for a device, last writer wins.
    pub fn save(
        &self,
        stable_id: &str,
        capabilities: Option<&DeviceCapabilities>,
        selected_config: Option<&SelectedConfig>,
    ) -> Result<(), RigError> {
        let record = CacheRecord {
            schema_version: self.schema_version,
            stable_id: stable_id.to_string(),
            saved_at: Utc::now(),
            capabilities: capabilities.cloned(),
            selected_config: selected_config.cloned(),
        };
        let bytes = serde_json::to_vec_pretty(&record)?;

        let lock = self.key_lock(stable_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store
            .save(stable_id, &bytes)
            .map_err(|e| RigError::Cache(format!("failed to save {}: {}", stable_id, e)))?;
        log::debug!("Cached capabilities for {}", stable_id);
        Ok(())
    }

    pub fn forget(&self, stable_id: &str) -> Result<(), RigError> {
        let lock = self.key_lock(stable_id);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.store
            .remove(stable_id)
            .map_err(|e| RigError::Cache(format!("failed to remove {}: {}", stable_id, e)))
    }
}
