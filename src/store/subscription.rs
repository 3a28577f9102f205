//! Change subscriptions.
//!
//! A [`Subscription`] filters the store's change feed down to a set of
//! watched paths. [`watch`] turns that into a push feed: it re-reads a
//! consistent snapshot after every relevant change and hands it to a
//! callback on a background task.

use crate::core::errors::Result;
use crate::store::{path, ChangeEvent, SharedStore};
use async_broadcast::{Receiver, RecvError, TryRecvError};
use std::future::Future;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

pub struct Subscription {
    rx: Receiver<ChangeEvent>,
    paths: Vec<String>,
}

impl Subscription {
    pub fn new<S: Into<String>>(store: &dyn SharedStore, paths: Vec<S>) -> Self {
        Self {
            rx: store.changes(),
            paths: paths.into_iter().map(Into::into).collect(),
        }
    }

    fn is_relevant(&self, changed: &str) -> bool {
        self.paths.iter().any(|watched| path::overlaps(changed, watched))
    }

    /// Wait for the next change touching a watched path.
    ///
    /// Notifications already queued behind it are coalesced. A lagging
    /// listener that lost notifications is told something changed. Returns
    /// `None` once the feed is closed.
    pub async fn changed(&mut self) -> Option<()> {
        loop {
            match self.rx.recv().await {
                Ok(event) if self.is_relevant(&event.path) => break,
                Ok(_) => continue,
                Err(RecvError::Overflowed(missed)) => {
                    debug!(missed, "Change feed overflowed");
                    break;
                }
                Err(RecvError::Closed) => return None,
            }
        }
        loop {
            match self.rx.try_recv() {
                Ok(_) | Err(TryRecvError::Overflowed(_)) => continue,
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => break,
            }
        }
        Some(())
    }
}

/// Keeps a push feed alive; dropping or unsubscribing stops it
pub struct SubscriptionHandle {
    handle: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    /// Wrap a background task so it stops with the handle
    pub fn from_task(handle: JoinHandle<()>) -> Self {
        Self {
            handle: Some(handle),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    pub fn is_active(&self) -> bool {
        self.handle.as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Deliver `load`'s snapshot to `on_change` now and after every change
/// under `paths`.
pub fn watch<T, L, Fut, C>(
    store: Arc<dyn SharedStore>,
    paths: Vec<String>,
    load: L,
    mut on_change: C,
) -> SubscriptionHandle
where
    T: Send + 'static,
    L: Fn(Arc<dyn SharedStore>) -> Fut + Send + 'static,
    Fut: Future<Output = Result<T>> + Send + 'static,
    C: FnMut(T) + Send + 'static,
{
    // Subscribe before the first read so no change slips between them.
    let mut subscription = Subscription::new(store.as_ref(), paths.clone());
    let handle = tokio::spawn(async move {
        loop {
            match load(store.clone()).await {
                Ok(snapshot) => on_change(snapshot),
                Err(e) => warn!(paths = ?paths, "Subscription reload failed: {}", e),
            }
            if subscription.changed().await.is_none() {
                debug!(paths = ?paths, "Change feed closed, ending subscription");
                break;
            }
        }
    });
    SubscriptionHandle {
        handle: Some(handle),
    }
}
