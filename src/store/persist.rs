//! Durable snapshots of the shared state tree.
//!
//! Each top-level collection (`users`, `queue`, `matches`, ...) is stored as
//! one zstd-compressed JSON blob in the `shared_state` sled tree.

use crate::core::errors::{Result, ScoutError};
use serde_json::{Map, Value};
use sled::{Db, Tree};
use std::path::Path;
use tracing::{debug, info};

const TREE_NAME: &str = "shared_state";

#[derive(Clone)]
pub struct SnapshotStore {
    db: Db,
    tree: Tree,
    level: i32,
}

impl SnapshotStore {
    pub fn open(path: impl AsRef<Path>, level: i32) -> Result<Self> {
        let path = path.as_ref();
        let db = sled::open(path)?;
        let tree = db.open_tree(TREE_NAME)?;
        info!(path = %path.display(), "Opened shared state snapshot store");
        Ok(Self { db, tree, level })
    }

    /// Throwaway database, removed when dropped
    pub fn temporary(level: i32) -> Result<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        let tree = db.open_tree(TREE_NAME)?;
        Ok(Self { db, tree, level })
    }

    /// Persist one collection; `None` deletes it
    pub fn save_collection(&self, name: &str, value: Option<&Value>) -> Result<()> {
        match value {
            Some(value) => {
                let serialized = serde_json::to_vec(value)?;
                let compressed = zstd::encode_all(&serialized[..], self.level)
                    .map_err(|e| ScoutError::io("zstd encode", e))?;
                debug!(
                    collection = name,
                    raw = serialized.len(),
                    compressed = compressed.len(),
                    "Saving collection snapshot"
                );
                self.tree.insert(name.as_bytes(), compressed)?;
            }
            None => {
                self.tree.remove(name.as_bytes())?;
            }
        }
        Ok(())
    }

    /// Load every saved collection into a root object
    pub fn load_root(&self) -> Result<Value> {
        let mut root = Map::new();
        for item in self.tree.iter() {
            let (key, compressed) = item?;
            let name = String::from_utf8(key.to_vec())
                .map_err(|e| ScoutError::serialization("utf8", e))?;
            let bytes =
                zstd::decode_all(&compressed[..]).map_err(|e| ScoutError::io("zstd decode", e))?;
            let value: Value = serde_json::from_slice(&bytes)?;
            root.insert(name, value);
        }
        info!(collections = root.len(), "Loaded shared state snapshot");
        Ok(Value::Object(root))
    }

    pub fn flush(&self) -> Result<()> {
        self.db.flush()?;
        Ok(())
    }
}
