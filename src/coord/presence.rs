//! Presence and name uniqueness
//!
//! Liveness is a `lastActive` timestamp on the identity record, written with
//! the store clock. A record with no `lastActive` at all is treated as live.

use crate::core::clock::{duration_millis, format_millis};
use crate::core::config::CoordConfig;
use crate::core::errors::{Result, ScoutError};
use crate::coord::queue::Queue;
use crate::coord::types::{decode, paths, Identity};
use crate::store::{server_timestamp, DisconnectOp, Query, SharedStore};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Identity currently holding a display name
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NameOwner {
    pub owner_id: String,
    pub last_active: Option<i64>,
}

pub struct PresenceRegistry {
    store: Arc<dyn SharedStore>,
    queue: Queue,
    name_grace: Duration,
    stale_threshold: Duration,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn SharedStore>, config: &CoordConfig) -> Self {
        Self {
            queue: Queue::new(store.clone()),
            store,
            name_grace: config.name_grace,
            stale_threshold: config.stale_threshold,
        }
    }

    pub fn name_grace(&self) -> Duration {
        self.name_grace
    }

    pub fn stale_threshold(&self) -> Duration {
        self.stale_threshold
    }

    /// Publish an identity as live.
    ///
    /// Fields are written one by one so a live `currentAssignment` under the
    /// record survives a re-login. The name goes last: a reader never sees
    /// the name without a fresh `lastActive`.
    pub async fn set_presence(&self, identity: &Identity) -> Result<()> {
        let id = &identity.id;
        let email = identity.email.clone().map(Value::from).unwrap_or(Value::Null);
        self.store.set(&paths::user_field(id, "id"), Value::from(id.as_str())).await?;
        self.store.set(&paths::user_field(id, "email"), email).await?;
        self.store
            .set(&paths::user_field(id, "source"), Value::from(identity.source.to_string()))
            .await?;
        self.store.set(&paths::last_active(id), server_timestamp()).await?;
        self.store
            .set(&paths::user_field(id, "name"), Value::from(identity.name.as_str()))
            .await?;

        if let Err(e) = self
            .store
            .on_disconnect(&paths::last_active(id), DisconnectOp::Set(server_timestamp()))
            .await
        {
            warn!(identity = %id, "Could not register presence disconnect hook: {}", e);
        }
        info!(identity = %id, name = %identity.name, source = %identity.source, "Presence set");
        Ok(())
    }

    /// Mark offline now without deleting anything
    pub async fn clear_presence(&self, identity_id: &str) -> Result<()> {
        self.store.set(&paths::last_active(identity_id), server_timestamp()).await?;
        debug!(identity = %identity_id, "Presence cleared");
        Ok(())
    }

    /// Restamp `lastActive`
    pub async fn touch(&self, identity_id: &str) -> Result<()> {
        self.store.set(&paths::last_active(identity_id), server_timestamp()).await
    }

    /// Delete only `lastActive`
    pub async fn remove_last_active(&self, identity_id: &str) -> Result<()> {
        self.store.remove(&paths::last_active(identity_id)).await?;
        debug!(identity = %identity_id, "Removed lastActive");
        Ok(())
    }

    /// Drop this connection's pending presence write for the identity
    pub async fn suppress_disconnect_presence(&self, identity_id: &str) -> Result<()> {
        self.store.cancel_on_disconnect(&paths::user(identity_id)).await
    }

    pub async fn get_identity(&self, identity_id: &str) -> Result<Option<Identity>> {
        match self.store.get(&paths::user(identity_id)).await? {
            Some(value) => Ok(Some(decode(value)?)),
            None => Ok(None),
        }
    }

    /// Identity records carrying exactly `name`
    pub async fn identities_named(&self, name: &str) -> Result<Vec<Identity>> {
        let rows = self
            .store
            .query(paths::USERS, &Query::order_by("name").equal_to(name))
            .await?;
        rows.into_iter()
            .map(|(key, value)| {
                let mut identity: Identity = decode(value)?;
                // The key is authoritative even if the stored id drifted.
                identity.id = key;
                Ok(identity)
            })
            .collect()
    }

    /// Another live identity holding `name`, if any.
    ///
    /// Live means no `lastActive` at all, or one within `grace` of now.
    pub async fn is_name_in_use(
        &self,
        name: &str,
        exclude: Option<&str>,
        grace: Duration,
    ) -> Result<Option<NameOwner>> {
        let now = self.store.now_millis();
        let grace = duration_millis(grace);
        let owner = self
            .identities_named(name)
            .await?
            .into_iter()
            .filter(|i| Some(i.id.as_str()) != exclude)
            .find(|i| match i.last_active {
                None => true,
                Some(ts) => now - ts <= grace,
            })
            .map(|i| NameOwner {
                owner_id: i.id,
                last_active: i.last_active,
            });
        if let Some(owner) = &owner {
            debug!(name = %name, owner = %owner.owner_id, "Name is in use");
        }
        Ok(owner)
    }

    /// [`is_name_in_use`](Self::is_name_in_use) with the configured grace window
    pub async fn name_owner(&self, name: &str, exclude: Option<&str>) -> Result<Option<NameOwner>> {
        self.is_name_in_use(name, exclude, self.name_grace).await
    }

    /// An identity holding `name` whose last activity is older than `threshold`
    pub async fn find_stale_owner(
        &self,
        name: &str,
        exclude: Option<&str>,
        threshold: Duration,
    ) -> Result<Option<NameOwner>> {
        let now = self.store.now_millis();
        let threshold = duration_millis(threshold);
        Ok(self
            .identities_named(name)
            .await?
            .into_iter()
            .filter(|i| Some(i.id.as_str()) != exclude)
            .find(|i| matches!(i.last_active, Some(ts) if now - ts > threshold))
            .map(|i| NameOwner {
                owner_id: i.id,
                last_active: i.last_active,
            }))
    }

    /// Delete the identity record and every queue entry it holds
    pub async fn remove_identity_completely(&self, identity_id: &str) -> Result<()> {
        self.store.remove(&paths::user(identity_id)).await?;
        let removed = self.queue.leave(identity_id).await?;
        info!(identity = %identity_id, queue_entries = removed, "Identity removed");
        Ok(())
    }

    /// Forcibly remove a stale owner of `name`
    pub async fn evict(&self, owner: &NameOwner, name: &str) -> Result<()> {
        match self.remove_identity_completely(&owner.owner_id).await {
            Ok(()) => {
                let last_active = owner.last_active.map(format_millis).unwrap_or_default();
                info!(identity = %owner.owner_id, name = %name, last_active = %last_active, "Evicted stale identity");
                Ok(())
            }
            Err(e) => {
                warn!(identity = %owner.owner_id, name = %name, "Eviction failed: {}", e);
                Err(ScoutError::eviction_failed(owner.owner_id.clone(), name, Some(e)))
            }
        }
    }
}
