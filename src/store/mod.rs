//! Shared state store
//!
//! A path-addressable JSON tree with last-write-wins point writes, ordered
//! child queries, change notifications and per-connection disconnect hooks.
//! There is no multi-key atomicity: every mutation touches exactly one path.
//!
//! The engine only depends on the [`SharedStore`] trait. [`MemoryStore`] is
//! the bundled server; each client (tab) talks to it through its own
//! [`StoreConnection`].

pub mod memory;
pub mod path;
pub mod persist;
pub mod subscription;

pub use memory::{MemoryStore, StoreConnection};
pub use persist::SnapshotStore;
pub use subscription::{watch, Subscription, SubscriptionHandle};

use crate::core::errors::Result;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::fmt;
use uuid::Uuid;

/// Identifies one client connection to the store
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Notification that the subtree rooted at `path` was mutated
#[derive(Clone, Debug, PartialEq)]
pub struct ChangeEvent {
    pub sequence: u64,
    pub path: String,
}

/// Write the store performs on behalf of a connection once it is lost
#[derive(Clone, Debug, PartialEq)]
pub enum DisconnectOp {
    Set(Value),
    Remove,
}

/// Ordered, optionally filtered read over the children of a path
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    pub order_by_child: Option<String>,
    pub equal_to: Option<Value>,
    pub limit_to_first: Option<usize>,
}

impl Query {
    /// Order children by a field
    pub fn order_by(child: impl Into<String>) -> Self {
        Self {
            order_by_child: Some(child.into()),
            ..Default::default()
        }
    }

    /// Keep only children whose ordered field equals `value`
    pub fn equal_to(mut self, value: impl Into<Value>) -> Self {
        self.equal_to = Some(value.into());
        self
    }

    pub fn limit_to_first(mut self, n: usize) -> Self {
        self.limit_to_first = Some(n);
        self
    }

    /// Apply the query to the children of an object node
    pub fn apply(&self, node: Option<&Value>) -> Vec<(String, Value)> {
        let Some(Value::Object(children)) = node else {
            return Vec::new();
        };

        let field = self.order_by_child.as_deref();
        let field_of = |v: &Value| -> Value {
            match field {
                Some(f) => v.get(f).cloned().unwrap_or(Value::Null),
                None => Value::Null,
            }
        };

        let mut out: Vec<(String, Value)> = children
            .iter()
            .filter(|(_, v)| match &self.equal_to {
                Some(expected) => &field_of(v) == expected,
                None => true,
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        // Ties fall back to key order, which for pushed children is insertion order.
        out.sort_by(|(ka, va), (kb, vb)| {
            compare_values(&field_of(va), &field_of(vb)).then_with(|| ka.cmp(kb))
        });

        if let Some(limit) = self.limit_to_first {
            out.truncate(limit);
        }
        out
    }
}

/// Total order over JSON values: null < false < true < numbers < strings < containers
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(v: &Value) -> u8 {
        match v {
            Value::Null => 0,
            Value::Bool(false) => 1,
            Value::Bool(true) => 2,
            Value::Number(_) => 3,
            Value::String(_) => 4,
            Value::Array(_) | Value::Object(_) => 5,
        }
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        _ => rank(a).cmp(&rank(b)),
    }
}

/// Placeholder the store replaces with its current time on write
pub fn server_timestamp() -> Value {
    json!({ ".sv": "timestamp" })
}

pub(crate) fn is_server_timestamp(value: &Value) -> bool {
    matches!(value, Value::Object(map) if map.len() == 1 && map.get(".sv") == Some(&Value::String("timestamp".to_string())))
}

/// Client view of the shared state store.
///
/// Every call may suspend for network latency and may fail; none of them
/// can be aborted once issued.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Connection this handle speaks for
    fn connection_id(&self) -> ConnectionId;

    /// Store clock in epoch milliseconds
    fn now_millis(&self) -> i64;

    /// Read the subtree at `path`
    async fn get(&self, path: &str) -> Result<Option<Value>>;

    /// Replace the subtree at `path`. Writing `null` deletes it.
    async fn set(&self, path: &str, value: Value) -> Result<()>;

    /// Delete the subtree at `path`
    async fn remove(&self, path: &str) -> Result<()>;

    /// Create a child with a generated, insertion-ordered key
    async fn push(&self, path: &str, value: Value) -> Result<String>;

    /// Ordered/filtered read over the children of `path`
    async fn query(&self, path: &str, query: &Query) -> Result<Vec<(String, Value)>>;

    /// Register a write to run when this connection is lost
    async fn on_disconnect(&self, path: &str, op: DisconnectOp) -> Result<()>;

    /// Drop a previously registered disconnect write for `path`
    async fn cancel_on_disconnect(&self, path: &str) -> Result<()>;

    /// Feed of mutation notifications for every path
    fn changes(&self) -> async_broadcast::Receiver<ChangeEvent>;
}
