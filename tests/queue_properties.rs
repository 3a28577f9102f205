//! Queue invariants under repeated and concurrent use

mod common;

use common::{eventually, scout_tab};
use pretty_assertions::assert_eq;
use scoutq::coord::{Queue, QueueEntry};
use scoutq::MemoryStore;
use std::sync::Arc;
use tokio::sync::mpsc;

fn queue_on(server: &MemoryStore) -> Queue {
    Queue::new(Arc::new(server.connect()))
}

async fn entries_for(server: &MemoryStore, identity_id: &str) -> usize {
    queue_on(server).entries_for(identity_id).await.unwrap().len()
}

#[tokio::test]
async fn test_join_leave_sequences_keep_one_entry() {
    let server = MemoryStore::new();
    let queue = queue_on(&server);
    let mut rng = fastrand::Rng::with_seed(955);

    for _ in 0..60 {
        if rng.bool() {
            queue.join("A1", "Alice").await.unwrap();
        } else {
            queue.leave("A1").await.unwrap();
        }
        assert!(entries_for(&server, "A1").await <= 1);
    }
}

const RACE_ROUNDS: usize = 200;

/// Run two joins from separate connections on separate worker threads
async fn race_joins(server: &MemoryStore, first: (&str, &str), second: (&str, &str)) {
    let joins = [first, second].map(|(id, name)| {
        let queue = queue_on(server);
        let (id, name) = (id.to_string(), name.to_string());
        tokio::spawn(async move { queue.join(&id, &name).await })
    });
    for join in joins {
        join.await.unwrap().unwrap();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_same_identity() {
    for round in 0..RACE_ROUNDS {
        let server = MemoryStore::new();
        race_joins(&server, ("A1", "Alice"), ("A1", "Alice")).await;
        assert_eq!(entries_for(&server, "A1").await, 1, "round {}", round);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_joins_same_name() {
    for round in 0..RACE_ROUNDS {
        let server = MemoryStore::new();
        race_joins(&server, ("A1", "Sam"), ("local:sam", "Sam")).await;

        let entries = queue_on(&server).snapshot_ordered().await.unwrap();
        let sams: Vec<&QueueEntry> = entries.iter().filter(|e| e.display_name == "Sam").collect();
        assert_eq!(sams.len(), 1, "round {}", round);
    }
}

#[tokio::test]
async fn test_hub_join_requires_login() {
    let server = MemoryStore::new();
    let tab = scout_tab(&server);
    assert!(tab.join_queue().await.is_err());

    let alice = tab.login("Alice", None).await.unwrap().identity;
    assert!(tab.join_queue().await.unwrap().is_some());
    assert!(tab.join_queue().await.unwrap().is_none());

    let view = tab.queue_view().await.unwrap();
    assert_eq!(view.position(&alice.id), Some(0));
    assert_eq!(tab.leave_queue().await.unwrap(), 1);
}

#[tokio::test]
async fn test_crashed_tab_leaves_queue() {
    let server = MemoryStore::new();
    let alice = scout_tab(&server);
    let bob = scout_tab(&server);
    alice.login("Alice", None).await.unwrap();
    bob.login("Bob", None).await.unwrap();
    alice.join_queue().await.unwrap();
    bob.join_queue().await.unwrap();

    assert!(alice.drop_connection().await >= 2);
    let names: Vec<String> = bob
        .queue()
        .snapshot_ordered()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.display_name)
        .collect();
    assert_eq!(names, vec!["Bob".to_string()]);
}

#[tokio::test]
async fn test_queue_feed_follows_changes() {
    let server = MemoryStore::new();
    let tab = scout_tab(&server);
    let observer = scout_tab(&server);
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = observer.subscribe_to_queue(move |entries| {
        let _ = tx.send(entries.len());
    });

    tab.login("Alice", None).await.unwrap();
    tab.join_queue().await.unwrap();
    let mut last = None;
    assert!(
        eventually(|| {
            while let Ok(n) = rx.try_recv() {
                last = Some(n);
            }
            let done = last == Some(1);
            async move { done }
        })
        .await
    );

    tab.leave_queue().await.unwrap();
    assert!(
        eventually(|| {
            while let Ok(n) = rx.try_recv() {
                last = Some(n);
            }
            let done = last == Some(0);
            async move { done }
        })
        .await
    );
    handle.unsubscribe();
}
