//! Authentication provider boundary
//!
//! The engine consumes an external identity provider through
//! [`AuthProvider`]. The provider's `uid` becomes the canonical identity id
//! whenever a sign-in succeeds. [`LocalAuthProvider`] is an in-process
//! implementation with a fixed account table, used by tests and the demo.

use crate::core::errors::{Result, ScoutError};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info};

/// User as reported by the provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthUser {
    pub uid: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub is_anonymous: bool,
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthUser>;

    async fn sign_in_anonymously(&self) -> Result<AuthUser>;

    async fn sign_out(&self) -> Result<()>;

    async fn update_display_name(&self, name: &str) -> Result<()>;

    fn current_user(&self) -> Option<AuthUser>;

    /// Watch sign-in / sign-out transitions
    fn subscribe_auth_state(&self) -> watch::Receiver<Option<AuthUser>>;
}

#[derive(Clone, Debug)]
struct Account {
    uid: String,
    password: String,
    display_name: Option<String>,
}

/// In-process provider. Clones share the same session, like tabs of one
/// browser profile.
#[derive(Clone)]
pub struct LocalAuthProvider {
    accounts: Arc<DashMap<String, Account>>,
    available: Arc<AtomicBool>,
    state: Arc<watch::Sender<Option<AuthUser>>>,
}

impl LocalAuthProvider {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self {
            accounts: Arc::new(DashMap::new()),
            available: Arc::new(AtomicBool::new(true)),
            state: Arc::new(tx),
        }
    }

    /// Register an email/password account
    pub fn with_account(self, email: &str, password: &str, uid: &str) -> Self {
        self.accounts.insert(
            email.to_lowercase(),
            Account {
                uid: uid.to_string(),
                password: password.to_string(),
                display_name: None,
            },
        );
        self
    }

    /// Simulate the provider being unreachable
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ScoutError::auth_unavailable("provider unreachable"))
        }
    }
}

impl Default for LocalAuthProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthProvider for LocalAuthProvider {
    async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthUser> {
        self.ensure_available()?;
        let key = email.trim().to_lowercase();
        let account = self
            .accounts
            .get(&key)
            .map(|a| a.clone())
            .ok_or_else(|| ScoutError::auth("unknown account"))?;
        if account.password != password {
            return Err(ScoutError::auth("wrong password"));
        }
        let user = AuthUser {
            uid: account.uid,
            display_name: account.display_name,
            email: Some(key),
            is_anonymous: false,
        };
        info!(uid = %user.uid, "Signed in with password");
        self.state.send_replace(Some(user.clone()));
        Ok(user)
    }

    async fn sign_in_anonymously(&self) -> Result<AuthUser> {
        self.ensure_available()?;
        let user = AuthUser {
            uid: cuid2::create_id(),
            display_name: None,
            email: None,
            is_anonymous: true,
        };
        info!(uid = %user.uid, "Signed in anonymously");
        self.state.send_replace(Some(user.clone()));
        Ok(user)
    }

    async fn sign_out(&self) -> Result<()> {
        if let Some(user) = self.state.send_replace(None) {
            debug!(uid = %user.uid, "Signed out");
        }
        Ok(())
    }

    async fn update_display_name(&self, name: &str) -> Result<()> {
        self.ensure_available()?;
        let mut updated = None;
        self.state.send_if_modified(|current| match current {
            Some(user) => {
                user.display_name = Some(name.to_string());
                updated = Some(user.clone());
                true
            }
            None => false,
        });
        let user = updated.ok_or_else(|| ScoutError::auth("no signed-in user"))?;
        if let Some(email) = &user.email {
            if let Some(mut account) = self.accounts.get_mut(email) {
                account.display_name = Some(name.to_string());
            }
        }
        Ok(())
    }

    fn current_user(&self) -> Option<AuthUser> {
        self.state.borrow().clone()
    }

    fn subscribe_auth_state(&self) -> watch::Receiver<Option<AuthUser>> {
        self.state.subscribe()
    }
}
