// SPDX-License-Identifier: MIT

//! Durable draft cache - the local resilience backstop
//!
//! This module provides:
//! - `DraftCache` - synchronous, byte-limited key/value storage
//! - `MemoryDraftCache` - process-local backend (tests, ephemeral runs)
//! - `FileDraftCache` - one JSON file per key, replaced atomically
//!
//! Writers always replace a whole record; there are no partial updates.

mod file;
mod memory;

pub use file::FileDraftCache;
pub use memory::MemoryDraftCache;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::CacheError;

/// Synchronous key/value storage scoped to one installation
pub trait DraftCache: Send + Sync {
    /// Read a value, `None` when the key was never written
    fn get(&self, key: &str) -> Result<Option<String>, CacheError>;

    /// Replace the value stored under `key`
    fn set(&self, key: &str, value: &str) -> Result<(), CacheError>;

    /// Delete `key`; deleting a missing key is not an error
    fn remove(&self, key: &str) -> Result<(), CacheError>;
}

/// Read and decode a JSON record
pub fn read_json<T: DeserializeOwned>(
    cache: &dyn DraftCache,
    key: &str,
) -> Result<Option<T>, CacheError> {
    match cache.get(key)? {
        Some(raw) => serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| CacheError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            }),
        None => Ok(None),
    }
}

/// Encode and store a JSON record
pub fn write_json<T: Serialize>(
    cache: &dyn DraftCache,
    key: &str,
    value: &T,
) -> Result<(), CacheError> {
    let raw = serde_json::to_string(value).map_err(|e| CacheError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    cache.set(key, &raw)
}

/// Cache keys used by the engine, all under one namespace
#[derive(Debug, Clone)]
pub struct CacheKeys {
    namespace: String,
}

impl CacheKeys {
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Draft record for a session, or the local-only draft when there is none
    pub fn draft(&self, session_id: Option<&str>) -> String {
        match session_id {
            Some(id) => format!("{}:draft:{}", self.namespace, id),
            None => format!("{}:draft:local", self.namespace),
        }
    }

    /// Local draft replaced by newer server state during replay
    pub fn superseded(&self, session_id: &str) -> String {
        format!("{}:superseded:{}", self.namespace, session_id)
    }

    /// The offline queue
    pub fn queue(&self) -> String {
        format!("{}:offline-queue", self.namespace)
    }

    /// Last active session id, used to resume after a reload
    pub fn active_session(&self) -> String {
        format!("{}:active-session", self.namespace)
    }
}

impl Default for CacheKeys {
    fn default() -> Self {
        Self::new("onboarding")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        name: String,
        rooms: u32,
    }

    #[test]
    fn test_json_helpers() {
        let cache = MemoryDraftCache::new();
        let record = Record {
            name: "Grand Plaza".to_string(),
            rooms: 120,
        };

        write_json(&cache, "rec", &record).unwrap();
        let loaded: Option<Record> = read_json(&cache, "rec").unwrap();
        assert_eq!(loaded, Some(record));

        let missing: Option<Record> = read_json(&cache, "nope").unwrap();
        assert!(missing.is_none());
    }

    #[test]
    fn test_corrupt_record() {
        let cache = MemoryDraftCache::new();
        cache.set("rec", "{not json").unwrap();

        let result: Result<Option<Record>, _> = read_json(&cache, "rec");
        assert!(matches!(result, Err(CacheError::Corrupt { .. })));
    }

    #[test]
    fn test_keys() {
        let keys = CacheKeys::new("ob");
        assert_eq!(keys.draft(Some("s1")), "ob:draft:s1");
        assert_eq!(keys.draft(None), "ob:draft:local");
        assert_eq!(keys.queue(), "ob:offline-queue");
        assert_eq!(keys.superseded("s1"), "ob:superseded:s1");
    }
}
