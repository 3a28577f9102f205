//! Session lifecycle for one tab
//!
//! Login establishes an identity (provider first, allocator as fallback),
//! enforces name uniqueness and publishes presence. Logout tears all of it
//! down in an order that keeps other tabs on the same device from
//! resurrecting the session: the suppression hints go up before any state
//! is removed.

use crate::auth::{AuthProvider, AuthUser};
use crate::core::config::CoordConfig;
use crate::core::errors::{Result, ScoutError};
use crate::coord::device::Device;
use crate::coord::hints::{HintBoard, SUPPRESS_AUTO_SIGNIN, SUPPRESS_PRESENCE_ON_UNLOAD};
use crate::coord::identity::{local_id_for, Allocation, IdentityAllocator};
use crate::coord::presence::PresenceRegistry;
use crate::coord::queue::Queue;
use crate::coord::types::{Identity, IdentitySource};
use crate::store::SharedStore;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Email/password pair for privileged logins
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

/// What a successful login produced
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LoginOutcome {
    pub identity: Identity,
    /// False for a local-only identity with no record in the store
    pub server_presence: bool,
    /// Previous id of a cached identity that was moved to this one
    pub migrated_from: Option<String>,
}

/// Whether `name` contains `keyword` as a whole word, ignoring case
pub fn is_privileged_name(name: &str, keyword: &str) -> bool {
    name.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .any(|word| !word.is_empty() && word.eq_ignore_ascii_case(keyword))
}

pub struct Session {
    store: Arc<dyn SharedStore>,
    auth: Arc<dyn AuthProvider>,
    device: Device,
    config: Arc<CoordConfig>,
    allocator: IdentityAllocator,
    presence: PresenceRegistry,
    queue: Queue,
    hints: HintBoard,
    current: RwLock<Option<Identity>>,
}

impl Session {
    pub fn new(
        store: Arc<dyn SharedStore>,
        auth: Arc<dyn AuthProvider>,
        device: Device,
        config: Arc<CoordConfig>,
    ) -> Self {
        Self {
            allocator: IdentityAllocator::new(store.clone(), &config),
            presence: PresenceRegistry::new(store.clone(), &config),
            queue: Queue::new(store.clone()),
            hints: HintBoard::new(store.clone(), device.id()),
            store,
            auth,
            device,
            config,
            current: RwLock::new(None),
        }
    }

    pub async fn current(&self) -> Option<Identity> {
        self.current.read().await.clone()
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn hints(&self) -> &HintBoard {
        &self.hints
    }

    pub fn is_privileged(&self, name: &str) -> bool {
        is_privileged_name(name, &self.config.privileged_keyword)
    }

    /// Log in under a display name.
    ///
    /// Privileged names need credentials. Everyone else is checked for a
    /// live name conflict, may evict a stale holder of the name, and then
    /// gets an anonymous provider id or, failing that, an allocated one.
    pub async fn login(&self, name: &str, credentials: Option<Credentials>) -> Result<LoginOutcome> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ScoutError::validation_field("Please enter your name", "name"));
        }

        let (identity, server_presence) = if self.is_privileged(name) {
            (self.login_privileged(name, credentials).await?, true)
        } else {
            self.login_scout(name).await?
        };

        let migrated_from = self.migrate_cached(&identity).await;

        if server_presence {
            if let Err(e) = self.presence.set_presence(&identity).await {
                warn!(identity = %identity.id, "Presence write failed during login: {}", e);
                if let Err(e) = self.auth.sign_out().await {
                    debug!("Sign out after failed login also failed: {}", e);
                }
                return Err(e);
            }
            if identity.source != IdentitySource::Local {
                if let Err(e) = self.auth.update_display_name(name).await {
                    warn!(identity = %identity.id, "Could not update provider display name: {}", e);
                }
            }
        }

        self.device.cache_identity(&identity);
        *self.current.write().await = Some(identity.clone());
        info!(
            identity = %identity.id,
            name = %identity.name,
            source = %identity.source,
            server_presence,
            "Logged in"
        );
        Ok(LoginOutcome {
            identity,
            server_presence,
            migrated_from,
        })
    }

    async fn login_privileged(&self, name: &str, credentials: Option<Credentials>) -> Result<Identity> {
        let credentials = match credentials {
            Some(c) if !c.email.trim().is_empty() && !c.password.is_empty() => c,
            _ => {
                return Err(ScoutError::validation_field(
                    "Please enter email and password",
                    "credentials",
                ))
            }
        };
        let user = self
            .auth
            .sign_in_with_password(credentials.email.trim(), &credentials.password)
            .await?;

        if let Some(owner) = self.presence.name_owner(name, Some(&user.uid)).await? {
            warn!(name = %name, owner = %owner.owner_id, "Privileged name already active");
            if let Err(e) = self.auth.sign_out().await {
                debug!("Sign out after name conflict failed: {}", e);
            }
            return Err(ScoutError::name_in_use(name, owner.owner_id, owner.last_active));
        }

        Ok(Identity::new(user.uid, name, IdentitySource::Authenticated).with_email(user.email))
    }

    async fn login_scout(&self, name: &str) -> Result<(Identity, bool)> {
        // A re-login from this device must not collide with its own record.
        let own_id = self
            .device
            .cached_identity()
            .filter(|cached| cached.name == name)
            .map(|cached| cached.id);
        let exclude = own_id.as_deref();

        if let Some(owner) = self.presence.name_owner(name, exclude).await? {
            return Err(ScoutError::name_in_use(name, owner.owner_id, owner.last_active));
        }

        if let Some(stale) = self
            .presence
            .find_stale_owner(name, exclude, self.config.stale_threshold)
            .await?
        {
            self.presence.evict(&stale, name).await?;
        }

        match self.auth.sign_in_anonymously().await {
            Ok(user) => Ok((Identity::new(user.uid, name, IdentitySource::Anonymous), true)),
            Err(e) => {
                warn!(name = %name, category = e.category(), "Provider sign-in failed, allocating a local identity: {}", e);
                match self.allocator.allocate(name).await {
                    Some(allocation) => {
                        if let Allocation::Pool(code) = &allocation {
                            debug!(code = %code, "Pool code claimed for scout");
                        }
                        Ok((Identity::new(allocation.into_id(), name, IdentitySource::Local), true))
                    }
                    None => {
                        warn!(name = %name, "Allocator failed, continuing with a local-only identity");
                        Ok((Identity::new(local_id_for(name), name, IdentitySource::Local), false))
                    }
                }
            }
        }
    }

    /// Move a same-name identity cached on this device to the new id
    async fn migrate_cached(&self, identity: &Identity) -> Option<String> {
        let cached = self.device.cached_identity()?;
        if cached.name != identity.name || cached.id == identity.id {
            return None;
        }
        match self
            .allocator
            .migrate_identity(&cached.id, &identity.id, Some(&identity.name))
            .await
        {
            Ok(()) => Some(cached.id),
            Err(e) => {
                warn!(from = %cached.id, to = %identity.id, "Identity migration failed: {}", e);
                None
            }
        }
    }

    /// Log out and remove every trace of the identity.
    ///
    /// Every step after the first hint is best-effort; a failure is logged
    /// and the next step still runs.
    pub async fn logout(&self) -> Result<()> {
        if let Err(e) = self
            .hints
            .set(SUPPRESS_AUTO_SIGNIN, self.config.suppress_signin_ttl)
            .await
        {
            warn!(device = %self.device.id(), "Could not set auto sign-in suppression: {}", e);
        }

        let identity = self.current.write().await.take().or_else(|| self.device.cached_identity());
        self.device.forget_identity();

        if let Some(identity) = &identity {
            let id = identity.id.as_str();
            if let Err(e) = self
                .hints
                .set(SUPPRESS_PRESENCE_ON_UNLOAD, self.config.unload_suppress_ttl)
                .await
            {
                warn!(identity = %id, "Could not set unload suppression: {}", e);
            }
            if let Err(e) = self.presence.suppress_disconnect_presence(id).await {
                warn!(identity = %id, "Could not cancel presence disconnect hook: {}", e);
            }

            if let Err(e) = self.presence.remove_identity_completely(id).await {
                warn!(identity = %id, "Full removal failed, falling back: {}", e);
                if let Err(e) = self.presence.remove_last_active(id).await {
                    warn!(identity = %id, "Fallback lastActive removal failed: {}", e);
                }
                if let Err(e) = self.queue.leave(id).await {
                    warn!(identity = %id, "Fallback queue leave failed: {}", e);
                }
            }
        }

        if let Err(e) = self.auth.sign_out().await {
            warn!("Provider sign out failed: {}", e);
        }

        let hints = self.hints.clone();
        let delay = self.config.logout_clear_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = hints.clear(SUPPRESS_AUTO_SIGNIN).await {
                debug!("Could not clear auto sign-in suppression: {}", e);
            }
        });

        info!(identity = ?identity.as_ref().map(|i| i.id.as_str()), "Logged out");
        Ok(())
    }

    /// Restore a session for a freshly opened tab.
    ///
    /// Uses the identity cached on the device, else the provider's current
    /// user. Does nothing while a recent logout suppresses it.
    pub async fn auto_sign_in(&self) -> Result<Option<Identity>> {
        if self.hints.is_active(SUPPRESS_AUTO_SIGNIN).await {
            debug!(device = %self.device.id(), "Auto sign-in suppressed");
            return Ok(None);
        }

        let identity = match self.device.cached_identity() {
            Some(cached) => cached,
            None => match self.auth.current_user() {
                Some(user) => match identity_from_provider(&user) {
                    Some(identity) => identity,
                    None => return Ok(None),
                },
                None => return Ok(None),
            },
        };

        self.presence.set_presence(&identity).await?;
        self.device.cache_identity(&identity);
        *self.current.write().await = Some(identity.clone());
        info!(identity = %identity.id, name = %identity.name, "Signed in automatically");
        Ok(Some(identity))
    }

    /// Graceful tab close: mark the identity offline unless a logout just
    /// asked tabs not to.
    pub async fn close_tab(&self) -> Result<()> {
        let Some(identity) = self.current().await else {
            return Ok(());
        };
        if self.hints.is_active(SUPPRESS_PRESENCE_ON_UNLOAD).await {
            debug!(identity = %identity.id, "Unload presence write suppressed");
            // The connection's own disconnect write would recreate the record.
            return self.presence.suppress_disconnect_presence(&identity.id).await;
        }
        self.presence.clear_presence(&identity.id).await
    }

    /// Refresh `lastActive` for the current identity
    pub async fn heartbeat(&self) -> Result<()> {
        match self.current().await {
            Some(identity) => self.presence.touch(&identity.id).await,
            None => Ok(()),
        }
    }

    pub fn store(&self) -> &Arc<dyn SharedStore> {
        &self.store
    }
}

fn identity_from_provider(user: &AuthUser) -> Option<Identity> {
    let name = user.display_name.clone().filter(|n| !n.trim().is_empty())?;
    let source = if user.is_anonymous {
        IdentitySource::Anonymous
    } else {
        IdentitySource::Authenticated
    };
    Some(Identity::new(user.uid.clone(), name, source).with_email(user.email.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::LocalAuthProvider;
    use crate::core::clock::ManualClock;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn session_on(server: &MemoryStore, auth: &LocalAuthProvider, device: &Device) -> Session {
        Session::new(
            Arc::new(server.connect()),
            Arc::new(auth.clone()),
            device.clone(),
            Arc::new(CoordConfig::development()),
        )
    }

    #[test]
    fn test_privileged_name_detection() {
        assert!(is_privileged_name("Lead Sam", "lead"));
        assert!(is_privileged_name("sam (LEAD)", "lead"));
        assert!(is_privileged_name("drive-lead", "lead"));
        assert!(!is_privileged_name("Leadership", "lead"));
        assert!(!is_privileged_name("lead_sam", "lead"));
        assert!(!is_privileged_name("Alice", "lead"));
    }

    #[tokio::test]
    async fn test_blank_name_rejected() {
        let server = MemoryStore::new();
        let session = session_on(&server, &LocalAuthProvider::new(), &Device::new());
        let err = session.login("   ", None).await.unwrap_err();
        assert!(matches!(err, ScoutError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_lead_requires_credentials() {
        let server = MemoryStore::new();
        let auth = LocalAuthProvider::new().with_account("lead@example.com", "pw", "uid-lead");
        let session = session_on(&server, &auth, &Device::new());

        assert!(matches!(
            session.login("Lead Sam", None).await.unwrap_err(),
            ScoutError::Validation { .. }
        ));
        assert!(matches!(
            session
                .login("Lead Sam", Some(Credentials::new("lead@example.com", "bad")))
                .await
                .unwrap_err(),
            ScoutError::Auth { .. }
        ));

        let outcome = session
            .login("Lead Sam", Some(Credentials::new("lead@example.com", "pw")))
            .await
            .unwrap();
        assert_eq!(outcome.identity.id, "uid-lead");
        assert_eq!(outcome.identity.source, IdentitySource::Authenticated);
        assert_eq!(auth.current_user().unwrap().display_name.as_deref(), Some("Lead Sam"));
    }

    #[tokio::test]
    async fn test_scout_login_conflict() {
        let server = MemoryStore::new();
        let auth = LocalAuthProvider::new();
        let first = session_on(&server, &auth, &Device::new());
        let second = session_on(&server, &LocalAuthProvider::new(), &Device::new());

        let outcome = first.login("Alice", None).await.unwrap();
        assert_eq!(outcome.identity.source, IdentitySource::Anonymous);
        assert!(outcome.server_presence);

        let err = second.login("Alice", None).await.unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(err.user_message(), "The name \"Alice\" is already active elsewhere.");
    }

    #[tokio::test]
    async fn test_provider_outage_uses_pool() {
        let server = MemoryStore::new();
        let auth = LocalAuthProvider::new();
        auth.set_available(false);
        let session = session_on(&server, &auth, &Device::new());

        let outcome = session.login("Bob", None).await.unwrap();
        assert_eq!(outcome.identity.id, "A1");
        assert_eq!(outcome.identity.source, IdentitySource::Local);
        assert!(server.read("users/A1/lastActive").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_relogin_migrates_cached_identity() {
        let server = MemoryStore::new();
        let auth = LocalAuthProvider::new();
        auth.set_available(false);
        let device = Device::new();
        let session = session_on(&server, &auth, &device);
        session.login("Dana", None).await.unwrap();
        Queue::new(Arc::new(server.connect())).join("A1", "Dana").await.unwrap();

        auth.set_available(true);
        let outcome = session.login("Dana", None).await.unwrap();
        assert_eq!(outcome.migrated_from.as_deref(), Some("A1"));
        assert_eq!(server.read("users/A1").await.unwrap(), None);

        let queue = Queue::new(Arc::new(server.connect())).snapshot_ordered().await.unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue[0].identity_id, outcome.identity.id);
    }

    #[tokio::test]
    async fn test_logout_suppresses_auto_sign_in() {
        let clock = ManualClock::starting_now();
        let server = MemoryStore::with_clock(Arc::new(clock.clone()));
        let auth = LocalAuthProvider::new();
        let device = Device::new();
        let tab_one = session_on(&server, &auth, &device);
        let tab_two = session_on(&server, &auth, &device);

        let outcome = tab_one.login("Erin", None).await.unwrap();
        tab_one.logout().await.unwrap();

        assert_eq!(server.read(&format!("users/{}", outcome.identity.id)).await.unwrap(), None);
        assert_eq!(tab_two.auto_sign_in().await.unwrap(), None);
        assert_eq!(device.cached_identity(), None);
        assert!(auth.current_user().is_none());

        clock.advance(Duration::from_secs(1));
        assert!(!tab_two.hints().is_active(SUPPRESS_AUTO_SIGNIN).await);
    }

    #[tokio::test]
    async fn test_auto_sign_in_restores_cached_identity() {
        let server = MemoryStore::new();
        let auth = LocalAuthProvider::new();
        let device = Device::new();
        let tab_one = session_on(&server, &auth, &device);
        let outcome = tab_one.login("Finn", None).await.unwrap();

        let tab_two = session_on(&server, &auth, &device);
        let restored = tab_two.auto_sign_in().await.unwrap().unwrap();
        assert_eq!(restored.id, outcome.identity.id);
        assert_eq!(tab_two.current().await.map(|i| i.id), Some(outcome.identity.id));
    }
}
