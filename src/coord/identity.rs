//! Identity allocation
//!
//! Scouts without a provider identity get a short human-readable code from
//! a fixed pool (`A1..A25`). When the pool is exhausted, or every claim
//! attempt loses a race, a derived `local:<slug>` id is used instead.
//!
//! Claims are check-then-write against a store without transactions, so two
//! clients can still claim the same code in the same instant. The window is
//! narrowed by re-reading the candidate right before writing it.

use crate::core::config::CoordConfig;
use crate::core::errors::{Result, ScoutError};
use crate::coord::queue::Queue;
use crate::coord::types::{encode, paths, Identity, IdentitySource};
use crate::store::{server_timestamp, SharedStore};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";
const LOCAL_PREFIX: &str = "local:";

/// Fixed, enumerable namespace of short codes
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IdentityPool {
    prefix: String,
    size: usize,
}

impl IdentityPool {
    pub fn new(prefix: impl Into<String>, size: usize) -> Self {
        Self {
            prefix: prefix.into(),
            size,
        }
    }

    pub fn from_config(config: &CoordConfig) -> Self {
        Self::new(config.pool_prefix.clone(), config.pool_size)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Codes in allocation order
    pub fn codes(&self) -> impl Iterator<Item = String> + '_ {
        (1..=self.size).map(move |n| format!("{}{}", self.prefix, n))
    }

    pub fn contains(&self, id: &str) -> bool {
        match id.strip_prefix(self.prefix.as_str()) {
            Some(digits) if !digits.starts_with('0') => digits
                .parse::<usize>()
                .map(|n| (1..=self.size).contains(&n))
                .unwrap_or(false),
            _ => false,
        }
    }
}

/// How an id was obtained
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Allocation {
    /// Pool code, identity record already written
    Pool(String),
    /// Derived slug, the caller writes the record
    Derived(String),
}

impl Allocation {
    pub fn id(&self) -> &str {
        match self {
            Allocation::Pool(id) | Allocation::Derived(id) => id,
        }
    }

    pub fn into_id(self) -> String {
        match self {
            Allocation::Pool(id) | Allocation::Derived(id) => id,
        }
    }
}

/// Lowercase, non-alphanumeric runs become one `-`, trimmed. Empty input
/// gives `scout`.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !slug.is_empty() {
                slug.push('-');
            }
            pending_dash = false;
            slug.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    if slug.is_empty() {
        "scout".to_string()
    } else {
        slug
    }
}

/// Derived id for a display name, without any uniqueness check
pub fn local_id_for(name: &str) -> String {
    format!("{}{}", LOCAL_PREFIX, slugify(name))
}

fn random_token(len: usize) -> String {
    (0..len)
        .map(|_| BASE36[fastrand::usize(..BASE36.len())] as char)
        .collect()
}

fn to_base36(mut n: u64) -> String {
    if n == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while n > 0 {
        digits.push(BASE36[(n % 36) as usize]);
        n /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

pub struct IdentityAllocator {
    store: Arc<dyn SharedStore>,
    pool: IdentityPool,
    attempts: u32,
    backoff: Duration,
    local_attempts: u32,
}

impl IdentityAllocator {
    pub fn new(store: Arc<dyn SharedStore>, config: &CoordConfig) -> Self {
        Self {
            store,
            pool: IdentityPool::from_config(config),
            attempts: config.allocation_attempts,
            backoff: config.allocation_backoff,
            local_attempts: config.local_id_attempts,
        }
    }

    pub fn pool(&self) -> &IdentityPool {
        &self.pool
    }

    /// Ids of every identity record currently stored
    async fn used_ids(&self) -> Result<HashSet<String>> {
        let users = self.store.get(paths::USERS).await?;
        Ok(match users {
            Some(Value::Object(map)) => map.keys().cloned().collect(),
            _ => HashSet::new(),
        })
    }

    /// First pool code with no identity record
    pub async fn available_code(&self) -> Result<Option<String>> {
        let used = self.used_ids().await?;
        Ok(self.pool.codes().find(|code| !used.contains(code)))
    }

    /// Claim a pool code for `name`.
    ///
    /// Returns `None` when the pool is exhausted or every attempt lost its
    /// race. A code is used iff an identity record exists under it.
    pub async fn claim_pool_code(&self, name: &str) -> Option<String> {
        for attempt in 0..self.attempts {
            match self.try_claim(name).await {
                Ok(Claim::Claimed(code)) => {
                    info!(code = %code, name = %name, attempt, "Claimed pool identity");
                    return Some(code);
                }
                Ok(Claim::Exhausted) => {
                    debug!(name = %name, "Identity pool exhausted");
                    return None;
                }
                Ok(Claim::Raced(code)) => {
                    debug!(code = %code, attempt, "Pool code taken before claim, retrying");
                }
                Err(e) => {
                    warn!(name = %name, attempt, "Pool claim attempt failed: {}", e);
                }
            }
            tokio::time::sleep(self.backoff * (attempt + 1)).await;
        }
        warn!(name = %name, attempts = self.attempts, "Giving up on pool identity");
        None
    }

    async fn try_claim(&self, name: &str) -> Result<Claim> {
        let Some(code) = self.available_code().await? else {
            return Ok(Claim::Exhausted);
        };
        if self.store.get(&paths::user(&code)).await?.is_some() {
            return Ok(Claim::Raced(code));
        }
        let mut record = encode(&Identity::new(code.clone(), name, IdentitySource::Local))?;
        record["lastActive"] = server_timestamp();
        self.store.set(&paths::user(&code), record).await?;
        Ok(Claim::Claimed(code))
    }

    /// Derived `local:<slug>` id for `name`.
    ///
    /// The bare slug is reused when free or already owned by the same
    /// name; otherwise random suffixes are tried, and finally a suffix
    /// from the current time.
    pub async fn local_slug_id(&self, name: &str) -> Result<String> {
        let base = local_id_for(name);
        if self.slug_is_usable(&base, name).await? {
            return Ok(base);
        }
        for _ in 0..self.local_attempts {
            let candidate = format!("{}-{}", base, random_token(4));
            if self.store.get(&paths::user(&candidate)).await?.is_none() {
                return Ok(candidate);
            }
        }
        let millis = self.store.now_millis().max(0) as u64;
        Ok(format!("{}-{}", base, to_base36(millis)))
    }

    async fn slug_is_usable(&self, id: &str, name: &str) -> Result<bool> {
        match self.store.get(&paths::user(id)).await? {
            None => Ok(true),
            Some(existing) => {
                let owner = existing.get("name").and_then(Value::as_str);
                Ok(owner == Some(name))
            }
        }
    }

    /// Pool code first, then a derived slug.
    ///
    /// `None` means both failed; the caller is on its own with a
    /// local-only identity.
    pub async fn allocate(&self, name: &str) -> Option<Allocation> {
        if let Some(code) = self.claim_pool_code(name).await {
            return Some(Allocation::Pool(code));
        }
        for attempt in 0..self.local_attempts {
            match self.local_slug_id(name).await {
                Ok(id) => {
                    info!(id = %id, name = %name, "Using derived identity");
                    return Some(Allocation::Derived(id));
                }
                Err(e) => {
                    warn!(name = %name, attempt, "Derived identity lookup failed: {}", e);
                    tokio::time::sleep(self.backoff * (attempt + 1)).await;
                }
            }
        }
        None
    }

    /// Move an identity to a new id.
    ///
    /// Copies the record (renamed when `name` is given), removes the old
    /// one, points the old identity's queue entries at the new id and then
    /// prunes same-name entries owned by anyone else.
    pub async fn migrate_identity(
        &self,
        old_id: &str,
        new_id: &str,
        name: Option<&str>,
    ) -> Result<()> {
        if old_id.is_empty() || new_id.is_empty() || old_id == new_id {
            return Ok(());
        }
        info!(from = %old_id, to = %new_id, "Migrating identity");

        let existing = self.store.get(&paths::user(old_id)).await?;
        let mut record = match existing {
            Some(Value::Object(map)) => Value::Object(map),
            Some(other) => {
                return Err(ScoutError::internal(format!(
                    "identity record {} is not an object: {}",
                    old_id, other
                )))
            }
            None => serde_json::json!({}),
        };
        record["id"] = Value::from(new_id);
        if let Some(name) = name {
            record["name"] = Value::from(name);
        }
        if record.get("name").is_some() {
            record["lastActive"] = server_timestamp();
            // Keep whatever the new id already holds, such as a live assignment.
            if let Some(current) = self.store.get(&paths::assignment(new_id)).await? {
                record["currentAssignment"] = current;
            }
            self.store.set(&paths::user(new_id), record.clone()).await?;
        }
        self.store.remove(&paths::user(old_id)).await?;

        let queue = Queue::new(self.store.clone());
        let display_name = name
            .map(str::to_string)
            .or_else(|| record.get("name").and_then(Value::as_str).map(str::to_string));
        let moved = queue.reassign(old_id, new_id, display_name.as_deref()).await?;
        if let Some(display_name) = display_name {
            queue.prune_duplicate_names(new_id, &display_name).await?;
        }
        debug!(from = %old_id, to = %new_id, moved, "Migrated queue entries");
        Ok(())
    }
}

enum Claim {
    Claimed(String),
    Raced(String),
    Exhausted,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn allocator() -> (MemoryStore, IdentityAllocator) {
        let server = MemoryStore::new();
        let store: Arc<dyn SharedStore> = Arc::new(server.connect());
        let allocator = IdentityAllocator::new(store, &CoordConfig::development());
        (server, allocator)
    }

    #[test]
    fn test_slugify() {
        assert_eq!(slugify("Alice Smith"), "alice-smith");
        assert_eq!(slugify("  --Bob__99!! "), "bob-99");
        assert_eq!(slugify("***"), "scout");
        assert_eq!(slugify(""), "scout");
        assert_eq!(local_id_for("Carol"), "local:carol");
    }

    #[test]
    fn test_pool_membership() {
        let pool = IdentityPool::from_config(&CoordConfig::default());
        assert_eq!(pool.codes().count(), 25);
        assert_eq!(pool.codes().next().as_deref(), Some("A1"));
        assert!(pool.contains("A25"));
        assert!(!pool.contains("A26"));
        assert!(!pool.contains("A0"));
        assert!(!pool.contains("A01"));
        assert!(!pool.contains("local:a1"));
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
    }

    #[tokio::test]
    async fn test_claims_lowest_free_code() {
        let (server, allocator) = allocator();
        let conn = server.connect();
        conn.set("users/A1", json!({"id": "A1", "name": "Zed"})).await.unwrap();

        let code = allocator.claim_pool_code("Alice").await;
        assert_eq!(code.as_deref(), Some("A2"));
        let record = server.read("users/A2").await.unwrap().unwrap();
        assert_eq!(record["name"], json!("Alice"));
        assert_eq!(record["source"], json!("local"));
        assert!(record["lastActive"].is_number());
    }

    #[tokio::test]
    async fn test_exhausted_pool_falls_back_to_slug() {
        let server = MemoryStore::new();
        let store: Arc<dyn SharedStore> = Arc::new(server.connect());
        let config = CoordConfig::builder()
            .pool("A", 1)
            .allocation_retries(2, Duration::from_millis(1))
            .build()
            .unwrap();
        let allocator = IdentityAllocator::new(store, &config);

        assert_eq!(allocator.allocate("Alice").await, Some(Allocation::Pool("A1".into())));
        assert_eq!(allocator.available_code().await.unwrap(), None);
        assert_eq!(
            allocator.allocate("Bob").await,
            Some(Allocation::Derived("local:bob".into()))
        );
    }

    #[tokio::test]
    async fn test_slug_collision_gets_suffix() {
        let (server, allocator) = allocator();
        let conn = server.connect();
        conn.set("users/local:bob", json!({"name": "Bob"})).await.unwrap();
        assert_eq!(allocator.local_slug_id("Bob").await.unwrap(), "local:bob");

        conn.set("users/local:bob", json!({"name": "bob!"})).await.unwrap();
        let id = allocator.local_slug_id("Bob").await.unwrap();
        assert!(id.starts_with("local:bob-"));
        assert_eq!(id.len(), "local:bob-".len() + 4);
    }

    #[tokio::test]
    async fn test_migrate_identity_moves_record_and_queue() {
        let (server, allocator) = allocator();
        let conn = server.connect();
        conn.set("users/A3", json!({"id": "A3", "name": "Dana", "source": "local"}))
            .await
            .unwrap();
        conn.push("queue", json!({"userId": "A3", "name": "Dana", "joinedAt": 1}))
            .await
            .unwrap();
        conn.push("queue", json!({"userId": "A9", "name": "Dana", "joinedAt": 2}))
            .await
            .unwrap();

        allocator.migrate_identity("A3", "uid-dana", None).await.unwrap();

        assert_eq!(server.read("users/A3").await.unwrap(), None);
        let moved = server.read("users/uid-dana").await.unwrap().unwrap();
        assert_eq!(moved["id"], json!("uid-dana"));
        assert_eq!(moved["name"], json!("Dana"));

        let queue = server.read("queue").await.unwrap().unwrap();
        let owners: Vec<&str> = queue
            .as_object()
            .unwrap()
            .values()
            .map(|e| e["userId"].as_str().unwrap())
            .collect();
        assert_eq!(owners, vec!["uid-dana"]);
    }

    #[tokio::test]
    async fn test_migrate_same_id_is_noop() {
        let (server, allocator) = allocator();
        allocator.migrate_identity("A1", "A1", Some("x")).await.unwrap();
        allocator.migrate_identity("", "A1", None).await.unwrap();
        assert_eq!(server.read("users").await.unwrap(), None);
    }
}
