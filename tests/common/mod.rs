//! Shared helpers for the integration suites
#![allow(dead_code)]

use async_trait::async_trait;
use scoutq::store::{ChangeEvent, ConnectionId, DisconnectOp, Query};
use scoutq::{
    CoordConfig, Device, LocalAuthProvider, MemoryStore, Result, ScoutError, ScoutHub, SharedStore,
};
use serde_json::Value;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Op {
    Get,
    Set,
    Remove,
    Push,
    Query,
}

struct Rule {
    op: Op,
    matches: Box<dyn Fn(&str) -> bool + Send + Sync>,
}

/// Store wrapper that fails selected operations on selected paths
pub struct FaultyStore {
    inner: Arc<dyn SharedStore>,
    rules: Mutex<Vec<Rule>>,
}

impl FaultyStore {
    pub fn new(inner: Arc<dyn SharedStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            rules: Mutex::new(Vec::new()),
        })
    }

    /// Fail `op` on exactly `path`
    pub fn fail_exact(&self, op: Op, path: &str) {
        let path = path.to_string();
        self.fail_when(op, move |p| p == path);
    }

    /// Fail `op` on `prefix` and everything below it
    pub fn fail_under(&self, op: Op, prefix: &str) {
        let prefix = prefix.to_string();
        self.fail_when(op, move |p| p == prefix || p.starts_with(&format!("{}/", prefix)));
    }

    pub fn fail_when(&self, op: Op, matches: impl Fn(&str) -> bool + Send + Sync + 'static) {
        self.rules.lock().unwrap().push(Rule {
            op,
            matches: Box::new(matches),
        });
    }

    pub fn heal(&self) {
        self.rules.lock().unwrap().clear();
    }

    fn check(&self, op: Op, path: &str) -> Result<()> {
        let rules = self.rules.lock().unwrap();
        if rules.iter().any(|r| r.op == op && (r.matches)(path)) {
            return Err(ScoutError::store(format!("{:?}", op), path).with_context("fault", "injected"));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedStore for FaultyStore {
    fn connection_id(&self) -> ConnectionId {
        self.inner.connection_id()
    }

    fn now_millis(&self) -> i64 {
        self.inner.now_millis()
    }

    async fn get(&self, path: &str) -> Result<Option<Value>> {
        self.check(Op::Get, path)?;
        self.inner.get(path).await
    }

    async fn set(&self, path: &str, value: Value) -> Result<()> {
        self.check(Op::Set, path)?;
        self.inner.set(path, value).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.check(Op::Remove, path)?;
        self.inner.remove(path).await
    }

    async fn push(&self, path: &str, value: Value) -> Result<String> {
        self.check(Op::Push, path)?;
        self.inner.push(path, value).await
    }

    async fn query(&self, path: &str, query: &Query) -> Result<Vec<(String, Value)>> {
        self.check(Op::Query, path)?;
        self.inner.query(path, query).await
    }

    async fn on_disconnect(&self, path: &str, op: DisconnectOp) -> Result<()> {
        self.inner.on_disconnect(path, op).await
    }

    async fn cancel_on_disconnect(&self, path: &str) -> Result<()> {
        self.inner.cancel_on_disconnect(path).await
    }

    fn changes(&self) -> async_broadcast::Receiver<ChangeEvent> {
        self.inner.changes()
    }
}

pub const LEAD_EMAIL: &str = "lead@example.com";
pub const LEAD_PASSWORD: &str = "scouting";

pub fn lead_auth() -> Arc<LocalAuthProvider> {
    Arc::new(LocalAuthProvider::new().with_account(LEAD_EMAIL, LEAD_PASSWORD, "uid-lead"))
}

/// A fresh tab on its own device with its own provider session
pub fn scout_tab(server: &MemoryStore) -> ScoutHub {
    ScoutHub::connect(
        server,
        Arc::new(LocalAuthProvider::new()),
        Device::new(),
        CoordConfig::development(),
    )
    .unwrap()
}

pub fn lead_tab(server: &MemoryStore) -> ScoutHub {
    ScoutHub::connect(server, lead_auth(), Device::new(), CoordConfig::development()).unwrap()
}

pub fn labels(raw: &[&str]) -> Vec<String> {
    raw.iter().map(|s| s.to_string()).collect()
}

/// Poll `check` until it holds or a second passes
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}
