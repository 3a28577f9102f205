use anyhow::{anyhow, Context, Result};
use scoutq::{
    Credentials, CoordConfig, Device, LocalAuthProvider, MatchStatus, MemoryStore, ScoutHub,
    StoreConfig, SystemClock,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

// Usage: scoutq-demo [config.yaml] [snapshot-dir]
#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut args = std::env::args().skip(1);
    let config = match args.next() {
        Some(path) => CoordConfig::from_yaml_file(&path)
            .with_context(|| format!("loading config from {}", path))?,
        None => CoordConfig::development(),
    };
    let store_config = match args.next() {
        Some(dir) => StoreConfig::default().with_snapshot_path(dir),
        None => StoreConfig::default(),
    };

    info!("Starting scoutq demo");
    let server = MemoryStore::open(store_config, Arc::new(SystemClock))?;

    let lead_auth = LocalAuthProvider::new().with_account("lead@example.com", "scouting", "uid-lead");
    let lead = ScoutHub::connect(&server, Arc::new(lead_auth), Device::new(), config.clone())?;
    let alice = ScoutHub::connect(&server, Arc::new(LocalAuthProvider::new()), Device::new(), config.clone())?;
    let bob = ScoutHub::connect(&server, Arc::new(LocalAuthProvider::new()), Device::new(), config)?;

    let _queue_feed = lead.subscribe_to_queue(|entries| {
        let names: Vec<String> = entries.into_iter().map(|e| e.display_name).collect();
        info!(queue = ?names, "Queue changed");
    });
    let _match_feed = lead.subscribe_to_active_match(|active| match active {
        Some(m) => info!(match_id = %m.match_id, participants = m.participants.len(), "Match running"),
        None => info!("No active match"),
    });

    lead.login("Lead Sam", Some(Credentials::new("lead@example.com", "scouting")))
        .await?;
    let alice_id = alice.login("Alice", None).await?.identity.id;
    bob.login("Bob", None).await?;

    alice.join_queue().await?;
    bob.join_queue().await?;

    let match_id = lead.start_match(&["100".to_string()]).await?;
    let started = lead
        .lifecycle()
        .get_match(&match_id)
        .await?
        .ok_or_else(|| anyhow!("match {} vanished", match_id))?;
    for p in &started.participants {
        info!(scout = %p.name, slot = ?p.assigned_slot, "Participant");
    }

    let assignment = alice
        .current_assignment()
        .await?
        .ok_or_else(|| anyhow!("{} has no assignment", alice_id))?;
    info!(slot = %assignment.slot_label, "Alice is scouting");
    alice
        .submit(json!({"autoPoints": 12, "teleopPoints": 30, "notes": "solid defense"}))
        .await?;

    let ended = lead
        .lifecycle()
        .get_match(&match_id)
        .await?
        .ok_or_else(|| anyhow!("match {} vanished", match_id))?;
    if ended.status != MatchStatus::Ended {
        return Err(anyhow!("match {} did not auto-end", match_id));
    }
    info!(match_id = %match_id, "Match auto-ended after the last submission");

    bob.logout().await?;
    alice.close_tab().await?;
    lead.logout().await?;

    // Let the feeds log the final state.
    tokio::time::sleep(Duration::from_millis(100)).await;
    server.flush()?;
    info!("Demo complete");
    Ok(())
}
