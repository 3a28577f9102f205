// Core infrastructure modules
pub mod core;

pub mod auth;  // Identity provider boundary
pub mod coord; // Presence, queue, identities, matches and sessions
pub mod store; // Shared state tree, change feed and disconnect hooks

// Re-exports for convenience
pub use auth::{AuthProvider, AuthUser, LocalAuthProvider};
pub use crate::core::{Clock, CoordConfig, ManualClock, Result, ScoutError, StoreConfig, SystemClock};
pub use coord::{
    Assignment, Credentials, Device, Identity, IdentitySource, LoginOutcome, Match, MatchStatus,
    Participant, QueueEntry, QueueView, ScoutHub, Submission,
};
pub use store::{MemoryStore, SharedStore, StoreConnection, SubscriptionHandle};

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_hub_round_trip() {
        let server = MemoryStore::new();
        let auth = LocalAuthProvider::new().with_account("lead@example.com", "pw", "uid-lead");
        let config = CoordConfig::development();

        let scout = ScoutHub::connect(&server, Arc::new(LocalAuthProvider::new()), Device::new(), config.clone())
            .unwrap();
        let lead = ScoutHub::connect(&server, Arc::new(auth), Device::new(), config).unwrap();

        let alice = scout.login("Alice", None).await.unwrap().identity;
        assert!(scout.join_queue().await.unwrap().is_some());
        lead.login("Lead Sam", Some(Credentials::new("lead@example.com", "pw")))
            .await
            .unwrap();

        // Scouts cannot run matches.
        assert!(scout.start_match(&["1".to_string()]).await.is_err());

        let match_id = lead.start_match(&["254".to_string()]).await.unwrap();
        let assignment = scout.current_assignment().await.unwrap().unwrap();
        assert_eq!(assignment.slot_label, "254");

        let submission = scout.submit(json!({"auto": 2})).await.unwrap();
        assert_eq!(submission.identity_id, alice.id);
        let ended = lead.lifecycle().get_match(&match_id).await.unwrap().unwrap();
        assert_eq!(ended.status, MatchStatus::Ended);
        assert_eq!(ended.ended_by.as_deref(), Some(alice.id.as_str()));
    }
}
