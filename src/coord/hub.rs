//! Per-tab facade
//!
//! A [`ScoutHub`] wires every component to one store connection and one
//! auth session, and exposes the operations and push feeds a client UI
//! consumes. Each tab gets its own hub; tabs of the same device share a
//! [`Device`].

use crate::auth::AuthProvider;
use crate::core::config::CoordConfig;
use crate::core::errors::{Result, ScoutError};
use crate::coord::device::Device;
use crate::coord::identity::IdentityAllocator;
use crate::coord::lifecycle::{validate_slot_label, AutoEndDetector, MatchLifecycle};
use crate::coord::presence::PresenceRegistry;
use crate::coord::queue::{Queue, QueueView};
use crate::coord::session::{Credentials, LoginOutcome, Session};
use crate::coord::types::{Assignment, Identity, IdentitySource, Match, QueueEntry, Submission};
use crate::store::{MemoryStore, SharedStore, StoreConnection, SubscriptionHandle};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, warn};

pub struct ScoutHub {
    connection: Option<StoreConnection>,
    store: Arc<dyn SharedStore>,
    config: Arc<CoordConfig>,
    session: Session,
    queue: Queue,
    lifecycle: MatchLifecycle,
    presence: PresenceRegistry,
    allocator: IdentityAllocator,
}

impl ScoutHub {
    /// Open a new tab against an in-process server
    pub fn connect(
        server: &MemoryStore,
        auth: Arc<dyn AuthProvider>,
        device: Device,
        config: CoordConfig,
    ) -> Result<Self> {
        let connection = server.connect();
        let store: Arc<dyn SharedStore> = Arc::new(connection.clone());
        let mut hub = Self::with_store(store, auth, device, config)?;
        hub.connection = Some(connection);
        Ok(hub)
    }

    /// Build a tab on any [`SharedStore`] implementation
    pub fn with_store(
        store: Arc<dyn SharedStore>,
        auth: Arc<dyn AuthProvider>,
        device: Device,
        config: CoordConfig,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        Ok(Self {
            connection: None,
            session: Session::new(store.clone(), auth, device, config.clone()),
            queue: Queue::new(store.clone()),
            lifecycle: MatchLifecycle::new(store.clone(), &config),
            presence: PresenceRegistry::new(store.clone(), &config),
            allocator: IdentityAllocator::new(store.clone(), &config),
            store,
            config,
        })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn lifecycle(&self) -> &MatchLifecycle {
        &self.lifecycle
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn allocator(&self) -> &IdentityAllocator {
        &self.allocator
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }

    pub fn config(&self) -> &CoordConfig {
        &self.config
    }

    pub async fn login(&self, name: &str, credentials: Option<Credentials>) -> Result<LoginOutcome> {
        self.session.login(name, credentials).await
    }

    pub async fn logout(&self) -> Result<()> {
        self.session.logout().await
    }

    pub async fn auto_sign_in(&self) -> Result<Option<Identity>> {
        self.session.auto_sign_in().await
    }

    pub async fn heartbeat(&self) -> Result<()> {
        self.session.heartbeat().await
    }

    async fn require_identity(&self) -> Result<Identity> {
        self.session
            .current()
            .await
            .ok_or_else(|| ScoutError::validation("Not logged in"))
    }

    async fn require_lead(&self) -> Result<Identity> {
        let identity = self.require_identity().await?;
        if identity.source != IdentitySource::Authenticated || !self.session.is_privileged(&identity.name) {
            return Err(ScoutError::validation("Only a lead can run matches"));
        }
        Ok(identity)
    }

    pub async fn join_queue(&self) -> Result<Option<String>> {
        let identity = self.require_identity().await?;
        self.queue.join(&identity.id, &identity.name).await
    }

    pub async fn leave_queue(&self) -> Result<usize> {
        let identity = self.require_identity().await?;
        self.queue.leave(&identity.id).await
    }

    pub async fn queue_view(&self) -> Result<QueueView> {
        Ok(QueueView::from(self.queue.snapshot_ordered().await?))
    }

    /// Start a match as the logged-in lead
    pub async fn start_match(&self, slot_labels: &[String]) -> Result<String> {
        let lead = self.require_lead().await?;
        // Blank labels are allowed and leave the slot empty.
        for label in slot_labels.iter().filter(|l| !l.trim().is_empty()) {
            validate_slot_label(label)?;
        }
        self.lifecycle.start(&lead.scout(), slot_labels).await
    }

    /// End a match as the logged-in lead
    pub async fn end_match(&self, match_id: &str) -> Result<bool> {
        let lead = self.require_lead().await?;
        self.lifecycle.end(match_id, Some(&lead.scout())).await
    }

    /// Watch a match and end it when every slot has submitted
    pub async fn auto_end(&self, match_id: &str) -> Result<AutoEndDetector> {
        let lead = self.require_lead().await?;
        Ok(self.lifecycle.auto_end(match_id, Some(lead.scout())))
    }

    /// Hand in the current identity's result, ending the match if it was the
    /// last one outstanding
    pub async fn submit(&self, payload: Value) -> Result<Submission> {
        let identity = self.require_identity().await?;
        let submission = self.lifecycle.submit(&identity.id, payload).await?;
        match self
            .lifecycle
            .end_if_last(&submission.match_id, Some(&identity.scout()))
            .await
        {
            Ok(true) => info!(match_id = %submission.match_id, "Match auto-ended after final submission"),
            Ok(false) => {}
            Err(e) => warn!(match_id = %submission.match_id, "Auto-end check failed: {}", e),
        }
        Ok(submission)
    }

    pub async fn current_assignment(&self) -> Result<Option<Assignment>> {
        let identity = self.require_identity().await?;
        self.lifecycle.assignment_for(&identity.id).await
    }

    pub fn subscribe_to_queue<C>(&self, on_change: C) -> SubscriptionHandle
    where
        C: FnMut(Vec<QueueEntry>) + Send + 'static,
    {
        self.queue.subscribe(on_change)
    }

    pub fn subscribe_to_active_match<C>(&self, on_change: C) -> SubscriptionHandle
    where
        C: FnMut(Option<Match>) + Send + 'static,
    {
        self.lifecycle.subscribe_active_match(on_change)
    }

    pub fn subscribe_to_assignment<C>(&self, identity_id: &str, on_change: C) -> SubscriptionHandle
    where
        C: FnMut(Option<Assignment>) + Send + 'static,
    {
        self.lifecycle.subscribe_assignment(identity_id, on_change)
    }

    /// Close the tab gracefully, then drop the connection
    pub async fn close_tab(&self) -> Result<()> {
        let result = self.session.close_tab().await;
        if let Err(e) = &result {
            warn!("Unload presence write failed: {}", e);
        }
        self.drop_connection().await;
        result
    }

    /// Lose the connection without any goodbye; disconnect hooks run.
    /// Returns how many hooks fired.
    pub async fn drop_connection(&self) -> usize {
        match &self.connection {
            Some(connection) => connection.disconnect().await,
            None => 0,
        }
    }
}
