//! Cross-tab hints
//!
//! Short-lived signals between tabs of one device, such as "do not sign in
//! automatically, a logout just happened". Each hint lives in the shared
//! store with its own time-to-live and is active iff
//! `now - setAt < ttlMs`, measured on the store clock.

use crate::core::clock::duration_millis;
use crate::core::errors::Result;
use crate::coord::types::{decode, paths};
use crate::store::{server_timestamp, SharedStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Blocks auto sign-in right after a logout
pub const SUPPRESS_AUTO_SIGNIN: &str = "suppressAutoSignIn";
/// Blocks the unload presence write right after a logout
pub const SUPPRESS_PRESENCE_ON_UNLOAD: &str = "suppressPresenceOnUnload";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hint {
    pub set_at: i64,
    pub ttl_ms: i64,
}

impl Hint {
    pub fn is_active(&self, now: i64) -> bool {
        now - self.set_at < self.ttl_ms
    }
}

/// Hints scoped to one device
#[derive(Clone)]
pub struct HintBoard {
    store: Arc<dyn SharedStore>,
    device_id: String,
}

impl HintBoard {
    pub fn new(store: Arc<dyn SharedStore>, device_id: impl Into<String>) -> Self {
        Self {
            store,
            device_id: device_id.into(),
        }
    }

    pub async fn set(&self, name: &str, ttl: Duration) -> Result<()> {
        self.store
            .set(
                &paths::hint(&self.device_id, name),
                json!({ "setAt": server_timestamp(), "ttlMs": duration_millis(ttl) }),
            )
            .await?;
        debug!(device = %self.device_id, hint = name, ttl_ms = duration_millis(ttl), "Hint set");
        Ok(())
    }

    pub async fn clear(&self, name: &str) -> Result<()> {
        self.store.remove(&paths::hint(&self.device_id, name)).await?;
        debug!(device = %self.device_id, hint = name, "Hint cleared");
        Ok(())
    }

    pub async fn get(&self, name: &str) -> Result<Option<Hint>> {
        match self.store.get(&paths::hint(&self.device_id, name)).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    /// Whether the hint is set and unexpired.
    ///
    /// A hint that cannot be read counts as inactive.
    pub async fn is_active(&self, name: &str) -> bool {
        match self.get(name).await {
            Ok(Some(hint)) => hint.is_active(self.store.now_millis()),
            Ok(None) => false,
            Err(e) => {
                warn!(device = %self.device_id, hint = name, "Could not read hint: {}", e);
                false
            }
        }
    }
}
