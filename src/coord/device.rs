//! Device-local state shared by every tab of one device

use crate::coord::types::Identity;
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

const CACHED_IDENTITY_KEY: &str = "scout-user";

/// Key/value storage visible to all tabs of a device, never to other devices
#[derive(Clone, Debug, Default)]
pub struct DeviceStorage {
    entries: Arc<DashMap<String, Value>>,
}

impl DeviceStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Value> {
        self.entries.get(key).map(|v| v.clone())
    }

    pub fn set(&self, key: &str, value: Value) {
        self.entries.insert(key.to_string(), value);
    }

    pub fn remove(&self, key: &str) -> Option<Value> {
        self.entries.remove(key).map(|(_, v)| v)
    }
}

/// One physical device; clones are tabs on the same device
#[derive(Clone, Debug)]
pub struct Device {
    id: String,
    storage: DeviceStorage,
}

impl Device {
    pub fn new() -> Self {
        Self::with_id(Uuid::new_v4().simple().to_string())
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            storage: DeviceStorage::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn storage(&self) -> &DeviceStorage {
        &self.storage
    }

    /// Identity remembered from the last login on this device
    pub fn cached_identity(&self) -> Option<Identity> {
        let value = self.storage.get(CACHED_IDENTITY_KEY)?;
        match serde_json::from_value(value) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!(device = %self.id, "Discarding unreadable cached identity: {}", e);
                self.storage.remove(CACHED_IDENTITY_KEY);
                None
            }
        }
    }

    pub fn cache_identity(&self, identity: &Identity) {
        match serde_json::to_value(identity) {
            Ok(value) => self.storage.set(CACHED_IDENTITY_KEY, value),
            Err(e) => warn!(device = %self.id, "Could not cache identity: {}", e),
        }
    }

    pub fn forget_identity(&self) {
        self.storage.remove(CACHED_IDENTITY_KEY);
    }
}

impl Default for Device {
    fn default() -> Self {
        Self::new()
    }
}
