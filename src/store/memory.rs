use crate::core::clock::{Clock, SystemClock};
use crate::core::config::StoreConfig;
use crate::core::errors::{Result, ScoutError};
use crate::store::path;
use crate::store::persist::SnapshotStore;
use crate::store::{is_server_timestamp, ChangeEvent, ConnectionId, DisconnectOp, Query, SharedStore};
use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Map, Value};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// In-process shared state server.
///
/// Cloning is shallow; all clones and every [`StoreConnection`] share the
/// same tree, change feed and hook table.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

struct Inner {
    root: RwLock<Value>,
    clock: Arc<dyn Clock>,
    feed: async_broadcast::Sender<ChangeEvent>,
    // Keeps the feed open while no client is listening.
    _feed_keepalive: async_broadcast::InactiveReceiver<ChangeEvent>,
    hooks: DashMap<ConnectionId, Vec<(String, DisconnectOp)>>,
    push_seq: AtomicU64,
    change_seq: AtomicU64,
    snapshots: Option<SnapshotStore>,
}

impl MemoryStore {
    /// Volatile store on the wall clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Volatile store on a caller-supplied clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self::build(StoreConfig::default(), clock, Value::Object(Map::new()), None)
    }

    /// Store backed by sled snapshots when `config.snapshot_path` is set
    pub fn open(config: StoreConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate()?;
        let (root, snapshots) = match &config.snapshot_path {
            Some(p) => {
                let snapshots = SnapshotStore::open(p, config.compression_level)?;
                let root = snapshots.load_root()?;
                (root, Some(snapshots))
            }
            None => (Value::Object(Map::new()), None),
        };
        Ok(Self::build(config, clock, root, snapshots))
    }

    /// Store persisting into an existing snapshot handle
    pub fn with_snapshots(snapshots: SnapshotStore, clock: Arc<dyn Clock>) -> Result<Self> {
        let root = snapshots.load_root()?;
        Ok(Self::build(StoreConfig::default(), clock, root, Some(snapshots)))
    }

    fn build(
        config: StoreConfig,
        clock: Arc<dyn Clock>,
        root: Value,
        snapshots: Option<SnapshotStore>,
    ) -> Self {
        let (mut tx, rx) = async_broadcast::broadcast(config.change_feed_capacity.max(1));
        tx.set_overflow(true); // Drop oldest notifications when a listener lags
        Self {
            inner: Arc::new(Inner {
                root: RwLock::new(root),
                clock,
                feed: tx,
                _feed_keepalive: rx.deactivate(),
                hooks: DashMap::new(),
                push_seq: AtomicU64::new(0),
                change_seq: AtomicU64::new(0),
                snapshots,
            }),
        }
    }

    /// Open a new client connection
    pub fn connect(&self) -> StoreConnection {
        let id = ConnectionId::new();
        debug!(connection = %id, "Client connected");
        StoreConnection {
            id,
            server: self.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn now_millis(&self) -> i64 {
        self.inner.clock.now_millis()
    }

    /// Number of disconnect writes pending for a connection
    pub fn pending_hooks(&self, conn: ConnectionId) -> usize {
        self.inner.hooks.get(&conn).map(|h| h.len()).unwrap_or(0)
    }

    /// Read a subtree directly, bypassing any connection
    pub async fn read(&self, at: &str) -> Result<Option<Value>> {
        let segs = path::segments(at)?;
        let root = self.inner.root.read().await;
        let mut node = &*root;
        for seg in &segs {
            match node.get(*seg) {
                Some(child) => node = child,
                None => return Ok(None),
            }
        }
        if is_empty_node(node) {
            Ok(None)
        } else {
            Ok(Some(node.clone()))
        }
    }

    async fn write(&self, at: &str, value: Option<Value>) -> Result<()> {
        let segs = path::segments(at)?;
        {
            let mut root = self.inner.root.write().await;
            self.apply(&mut root, &segs, value)?;
        }
        self.notify(path::join(&segs));
        Ok(())
    }

    /// Insert `value` under a fresh key below `at`.
    ///
    /// The key is minted under the write lock, so children become visible
    /// in key order.
    async fn push_child(&self, at: &str, value: Value) -> Result<String> {
        let parent = path::join(&path::segments(at)?);
        let (key, child) = {
            let mut root = self.inner.root.write().await;
            let key = self.next_push_key();
            let child = path::join(&[parent.as_str(), key.as_str()]);
            let segs = path::segments(&child)?;
            self.apply(&mut root, &segs, Some(value))?;
            (key, child)
        };
        self.notify(child);
        Ok(key)
    }

    fn apply(&self, root: &mut Value, segs: &[&str], value: Option<Value>) -> Result<()> {
        let now = self.inner.clock.now_millis();
        set_at(root, segs, value.and_then(|v| normalize(v, now)));
        if !root.is_object() {
            *root = Value::Object(Map::new());
        }
        match &self.inner.snapshots {
            Some(snapshots) => self.persist(snapshots, root, segs),
            None => Ok(()),
        }
    }

    fn persist(&self, snapshots: &SnapshotStore, root: &Value, segs: &[&str]) -> Result<()> {
        match segs.first() {
            Some(collection) => snapshots.save_collection(collection, root.get(*collection)),
            None => {
                if let Value::Object(map) = root {
                    for (name, value) in map {
                        snapshots.save_collection(name, Some(value))?;
                    }
                }
                Ok(())
            }
        }
    }

    fn notify(&self, path: String) {
        let sequence = self.inner.change_seq.fetch_add(1, Ordering::SeqCst) + 1;
        // Inactive/closed feeds just mean nobody is listening.
        let _ = self.inner.feed.try_broadcast(ChangeEvent { sequence, path });
    }

    fn next_push_key(&self) -> String {
        let floor = (self.inner.clock.now_millis().max(0) as u64) << 10;
        self.inner.push_seq.fetch_max(floor, Ordering::SeqCst);
        let seq = self.inner.push_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let suffix: String = cuid2::create_id().chars().take(8).collect();
        format!("{:016x}{}", seq, suffix)
    }

    fn register_hook(&self, conn: ConnectionId, at: &str, op: DisconnectOp) -> Result<()> {
        let segs = path::segments(at)?;
        let canonical = path::join(&segs);
        let mut hooks = self.inner.hooks.entry(conn).or_default();
        hooks.retain(|(p, _)| p != &canonical);
        hooks.push((canonical, op));
        Ok(())
    }

    fn cancel_hooks(&self, conn: ConnectionId, at: &str) -> Result<usize> {
        let segs = path::segments(at)?;
        let canonical = path::join(&segs);
        let mut removed = 0;
        if let Some(mut hooks) = self.inner.hooks.get_mut(&conn) {
            let before = hooks.len();
            hooks.retain(|(p, _)| !(p == &canonical || p.starts_with(&format!("{}/", canonical))));
            removed = before - hooks.len();
        }
        Ok(removed)
    }

    /// Run and discard every disconnect write registered by `conn`
    async fn fire_disconnect(&self, conn: ConnectionId) -> usize {
        let hooks = self.inner.hooks.remove(&conn).map(|(_, h)| h).unwrap_or_default();
        let count = hooks.len();
        for (at, op) in hooks {
            let result = match op {
                DisconnectOp::Set(v) => self.write(&at, Some(v)).await,
                DisconnectOp::Remove => self.write(&at, None).await,
            };
            if let Err(e) = result {
                warn!(connection = %conn, path = %at, "Disconnect write failed: {}", e);
            }
        }
        info!(connection = %conn, hooks = count, "Client disconnected");
        count
    }

    /// Flush snapshots to disk
    pub fn flush(&self) -> Result<()> {
        if let Some(snapshots) = &self.inner.snapshots {
            snapshots.flush()?;
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

/// One client's connection to a [`MemoryStore`]
#[derive(Clone)]
pub struct StoreConnection {
    id: ConnectionId,
    server: MemoryStore,
    open: Arc<AtomicBool>,
}

impl StoreConnection {
    pub fn server(&self) -> &MemoryStore {
        &self.server
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Lose the connection: the server runs this client's disconnect writes.
    ///
    /// Returns the number of writes executed. Calling it again is a no-op.
    pub async fn disconnect(&self) -> usize {
        if !self.open.swap(false, Ordering::SeqCst) {
            return 0;
        }
        self.server.fire_disconnect(self.id).await
    }

    fn ensure_open(&self, operation: &str, at: &str) -> Result<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(ScoutError::store(operation, at).with_context("reason", "connection closed"))
        }
    }
}

#[async_trait]
impl SharedStore for StoreConnection {
    fn connection_id(&self) -> ConnectionId {
        self.id
    }

    fn now_millis(&self) -> i64 {
        self.server.now_millis()
    }

    async fn get(&self, at: &str) -> Result<Option<Value>> {
        self.ensure_open("get", at)?;
        self.server.read(at).await
    }

    async fn set(&self, at: &str, value: Value) -> Result<()> {
        self.ensure_open("set", at)?;
        debug!(connection = %self.id, path = at, "set");
        self.server.write(at, Some(value)).await
    }

    async fn remove(&self, at: &str) -> Result<()> {
        self.ensure_open("remove", at)?;
        debug!(connection = %self.id, path = at, "remove");
        self.server.write(at, None).await
    }

    async fn push(&self, at: &str, value: Value) -> Result<String> {
        self.ensure_open("push", at)?;
        let key = self.server.push_child(at, value).await?;
        debug!(connection = %self.id, path = at, key = %key, "push");
        Ok(key)
    }

    async fn query(&self, at: &str, query: &Query) -> Result<Vec<(String, Value)>> {
        self.ensure_open("query", at)?;
        let node = self.server.read(at).await?;
        Ok(query.apply(node.as_ref()))
    }

    async fn on_disconnect(&self, at: &str, op: DisconnectOp) -> Result<()> {
        self.ensure_open("on_disconnect", at)?;
        self.server.register_hook(self.id, at, op)
    }

    async fn cancel_on_disconnect(&self, at: &str) -> Result<()> {
        self.ensure_open("cancel_on_disconnect", at)?;
        let removed = self.server.cancel_hooks(self.id, at)?;
        debug!(connection = %self.id, path = at, removed, "Cancelled disconnect writes");
        Ok(())
    }

    fn changes(&self) -> async_broadcast::Receiver<ChangeEvent> {
        self.server.inner.feed.new_receiver()
    }
}

fn is_empty_node(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Resolve server timestamps and drop null/empty children
fn normalize(value: Value, now: i64) -> Option<Value> {
    if is_server_timestamp(&value) {
        return Some(Value::from(now));
    }
    match value {
        Value::Null => None,
        Value::Object(map) => {
            let cleaned: Map<String, Value> = map
                .into_iter()
                .filter_map(|(k, v)| normalize(v, now).map(|v| (k, v)))
                .collect();
            if cleaned.is_empty() {
                None
            } else {
                Some(Value::Object(cleaned))
            }
        }
        Value::Array(items) => Some(Value::Array(
            items
                .into_iter()
                .map(|v| normalize(v, now).unwrap_or(Value::Null))
                .collect(),
        )),
        other => Some(other),
    }
}

fn set_at(node: &mut Value, segs: &[&str], value: Option<Value>) {
    let Some((head, rest)) = segs.split_first() else {
        *node = value.unwrap_or(Value::Null);
        return;
    };

    if !node.is_object() {
        if value.is_none() {
            return;
        }
        *node = Value::Object(Map::new());
    }

    if let Value::Object(map) = node {
        if rest.is_empty() {
            match value {
                Some(v) => {
                    map.insert((*head).to_string(), v);
                }
                None => {
                    map.remove(*head);
                }
            }
        } else {
            let child = map.entry((*head).to_string()).or_insert(Value::Null);
            set_at(child, rest, value);
            let empty = is_empty_node(child);
            if empty {
                map.remove(*head);
            }
        }
    }
}
