//! Match lifecycle
//!
//! Each run is its own record under `matches/` and moves
//! `active -> ended` exactly once. At most one match is active at a time;
//! this is checked before and again right before the record is written,
//! which narrows but cannot close the race between two leads. A second
//! active match discovered afterwards is reported, not rolled back.

use crate::core::config::CoordConfig;
use crate::core::errors::{Result, ScoutError};
use crate::coord::queue::Queue;
use crate::coord::types::{
    decode, encode, paths, Assignment, Match, MatchStatus, Participant, QueueEntry, ScoutRef,
    Submission,
};
use crate::store::{server_timestamp, watch, Query, SharedStore, Subscription, SubscriptionHandle};
use futures::future::join_all;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Longest slot label accepted by [`validate_slot_label`]
pub const MAX_SLOT_LABEL_LEN: usize = 6;

/// Trim and check a slot label: 1 to 6 ASCII digits
pub fn validate_slot_label(label: &str) -> Result<String> {
    let trimmed = label.trim();
    if trimmed.is_empty() {
        return Err(ScoutError::validation_field("Slot label is required", "slot_label"));
    }
    if trimmed.len() > MAX_SLOT_LABEL_LEN || !trimmed.chars().all(|c| c.is_ascii_digit()) {
        return Err(ScoutError::validation_field(
            format!("Slot label must be 1-{} digits", MAX_SLOT_LABEL_LEN),
            "slot_label",
        ));
    }
    Ok(trimmed.to_string())
}

/// Participants for a queue snapshot. The first
/// `min(max_slots, entries, labels)` get the matching label; blank labels
/// mean no slot.
pub fn assign_slots(entries: &[QueueEntry], labels: &[String], max_slots: usize) -> Vec<Participant> {
    let slotted = max_slots.min(entries.len()).min(labels.len());
    entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let assigned_slot = if i < slotted {
                Some(labels[i].trim().to_string()).filter(|l| !l.is_empty())
            } else {
                None
            };
            Participant {
                identity_id: entry.identity_id.clone(),
                name: entry.display_name.clone(),
                assigned_slot,
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct MatchLifecycle {
    store: Arc<dyn SharedStore>,
    queue: Queue,
    max_slots: usize,
}

impl MatchLifecycle {
    pub fn new(store: Arc<dyn SharedStore>, config: &CoordConfig) -> Self {
        Self {
            queue: Queue::new(store.clone()),
            store,
            max_slots: config.max_slots,
        }
    }

    pub async fn get_match(&self, match_id: &str) -> Result<Option<Match>> {
        match self.store.get(&paths::match_record(match_id)).await? {
            Some(value) => Ok(Some(decode_match(match_id.to_string(), value)?)),
            None => Ok(None),
        }
    }

    /// The active match, if any
    pub async fn active_match(&self) -> Result<Option<Match>> {
        load_active(self.store.as_ref()).await
    }

    /// Every match ever started, oldest first
    pub async fn matches(&self) -> Result<Vec<Match>> {
        let rows = self
            .store
            .query(paths::MATCHES, &Query::order_by("startedAt"))
            .await?;
        rows.into_iter()
            .map(|(key, value)| decode_match(key, value))
            .collect()
    }

    /// Start a match with everyone currently queued.
    ///
    /// Writes the match record, then the assignments, then drains the
    /// queue. Returns the new match id.
    pub async fn start(&self, lead: &ScoutRef, slot_labels: &[String]) -> Result<String> {
        if let Some(active) = self.active_match().await? {
            return Err(ScoutError::match_already_active(active.match_id));
        }

        let entries = self.queue.snapshot_ordered().await?;
        if entries.is_empty() {
            return Err(ScoutError::QueueEmpty);
        }
        let participants = assign_slots(&entries, slot_labels, self.max_slots);

        // Another lead may have started while we read the queue.
        if let Some(active) = self.active_match().await? {
            return Err(ScoutError::match_already_active(active.match_id));
        }

        let mut record = encode(&Match {
            match_id: String::new(),
            started_by: lead.id.clone(),
            started_by_name: lead.name.clone(),
            participants: participants.clone(),
            started_at: None,
            status: MatchStatus::Active,
            ended_at: None,
            ended_by: None,
        })?;
        record["startedAt"] = server_timestamp();
        let match_id = self.store.push(paths::MATCHES, record).await?;
        info!(
            match_id = %match_id,
            lead = %lead.id,
            participants = participants.len(),
            slotted = participants.iter().filter(|p| p.assigned_slot.is_some()).count(),
            "Match started"
        );

        self.report_concurrent_starts(&match_id).await;

        let assignments: Vec<(String, Value)> = participants
            .iter()
            .filter_map(|p| {
                p.assigned_slot.as_ref().map(|slot| {
                    (
                        paths::assignment(&p.identity_id),
                        json!({
                            "matchId": match_id,
                            "slotLabel": slot,
                            "assignedAt": server_timestamp(),
                        }),
                    )
                })
            })
            .collect();
        for result in join_all(
            assignments
                .iter()
                .map(|(at, value)| self.store.set(at, value.clone())),
        )
        .await
        {
            if let Err(e) = result {
                error!(match_id = %match_id, "Failed to write assignment: {}", e);
                return Err(e);
            }
        }

        let drained = join_all(participants.iter().map(|p| self.queue.leave(&p.identity_id))).await;
        for (participant, result) in participants.iter().zip(drained) {
            if let Err(e) = result {
                warn!(match_id = %match_id, identity = %participant.identity_id, "Failed to drain queue entry: {}", e);
            }
        }

        Ok(match_id)
    }

    async fn report_concurrent_starts(&self, match_id: &str) {
        let rows = self
            .store
            .query(
                paths::MATCHES,
                &Query::order_by("status").equal_to(MatchStatus::Active.as_str()),
            )
            .await;
        if let Ok(rows) = rows {
            if rows.len() > 1 {
                let ids: Vec<&str> = rows.iter().map(|(k, _)| k.as_str()).collect();
                warn!(match_id = %match_id, active = ?ids, "More than one active match");
            }
        }
    }

    /// End a match.
    ///
    /// Returns `false` when the match was already ended. Assignments still
    /// pointing at the match are removed either way, so a retry after a
    /// partial failure finishes the teardown.
    pub async fn end(&self, match_id: &str, ended_by: Option<&ScoutRef>) -> Result<bool> {
        let Some(record) = self.get_match(match_id).await? else {
            return Err(ScoutError::not_found("match", match_id));
        };
        let at = paths::match_record(match_id);

        if !record.is_active() {
            if record.ended_at.is_none() {
                self.store.set(&format!("{}/endedAt", at), server_timestamp()).await?;
            }
            let removed = self.clear_assignments(&record).await;
            debug!(match_id = %match_id, assignments_cleared = removed, "Match already ended");
            return Ok(false);
        }

        self.store
            .set(&format!("{}/status", at), Value::from(MatchStatus::Ended.as_str()))
            .await?;
        self.store.set(&format!("{}/endedAt", at), server_timestamp()).await?;
        if let Some(by) = ended_by {
            self.store.set(&format!("{}/endedBy", at), Value::from(by.id.as_str())).await?;
        }

        let removed = self.clear_assignments(&record).await;
        info!(
            match_id = %match_id,
            ended_by = ?ended_by.map(|b| b.id.as_str()),
            assignments_cleared = removed,
            "Match ended"
        );
        Ok(true)
    }

    /// Remove participants' assignments that point at `record`
    async fn clear_assignments(&self, record: &Match) -> usize {
        let match_id = record.match_id.as_str();
        let cleared = join_all(
            record
                .participants
                .iter()
                .map(|p| self.clear_assignment_if(&p.identity_id, match_id)),
        )
        .await;
        let mut removed = 0;
        for (participant, result) in record.participants.iter().zip(cleared) {
            match result {
                Ok(true) => removed += 1,
                Ok(false) => {}
                Err(e) => warn!(match_id = %match_id, identity = %participant.identity_id, "Failed to clear assignment: {}", e),
            }
        }
        removed
    }

    async fn clear_assignment_if(&self, identity_id: &str, match_id: &str) -> Result<bool> {
        match self.assignment_for(identity_id).await? {
            Some(a) if a.match_id == match_id => {
                self.store.remove(&paths::assignment(identity_id)).await?;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    pub async fn assignment_for(&self, identity_id: &str) -> Result<Option<Assignment>> {
        load_assignment(self.store.as_ref(), identity_id).await
    }

    /// Hand in a participant's result and release their slot
    pub async fn submit(&self, identity_id: &str, payload: Value) -> Result<Submission> {
        let Some(assignment) = self.assignment_for(identity_id).await? else {
            return Err(ScoutError::not_found("assignment", identity_id));
        };
        match self.get_match(&assignment.match_id).await? {
            Some(m) if m.is_active() => {}
            _ => {
                return Err(ScoutError::validation(format!(
                    "Match {} is no longer active",
                    assignment.match_id
                )))
            }
        }

        let submission = Submission {
            match_id: assignment.match_id.clone(),
            identity_id: identity_id.to_string(),
            slot_label: assignment.slot_label.clone(),
            submitted_at: None,
            payload,
        };
        let mut record = encode(&submission)?;
        record["submittedAt"] = server_timestamp();
        self.store
            .set(&paths::submission(&assignment.match_id, identity_id), record)
            .await?;
        self.store.remove(&paths::assignment(identity_id)).await?;
        info!(match_id = %assignment.match_id, identity = %identity_id, slot = %assignment.slot_label, "Submission recorded");

        Ok(Submission {
            submitted_at: Some(self.store.now_millis()),
            ..submission
        })
    }

    pub async fn submissions(&self, match_id: &str) -> Result<Vec<Submission>> {
        let node = self
            .store
            .get(&format!("{}/{}", paths::SUBMISSIONS, match_id))
            .await?;
        match node {
            Some(Value::Object(map)) => map.into_iter().map(|(_, v)| decode(v)).collect(),
            _ => Ok(Vec::new()),
        }
    }

    /// Slotted participants whose assignment still points at the match
    pub async fn outstanding_participants(&self, match_id: &str) -> Result<Vec<Participant>> {
        let Some(record) = self.get_match(match_id).await? else {
            return Err(ScoutError::not_found("match", match_id));
        };
        let slotted: Vec<Participant> = record.slotted().cloned().collect();
        let assignments =
            join_all(slotted.iter().map(|p| self.assignment_for(&p.identity_id))).await;
        let mut outstanding = Vec::new();
        for (participant, assignment) in slotted.into_iter().zip(assignments) {
            if matches!(assignment?, Some(a) if a.match_id == match_id) {
                outstanding.push(participant);
            }
        }
        Ok(outstanding)
    }

    /// End the match once every slotted participant has submitted.
    ///
    /// Matches without any slotted participant are left alone.
    pub async fn end_if_last(&self, match_id: &str, ended_by: Option<&ScoutRef>) -> Result<bool> {
        let Some(record) = self.get_match(match_id).await? else {
            return Ok(false);
        };
        if !record.is_active() || record.slotted().next().is_none() {
            return Ok(false);
        }
        let outstanding = self.outstanding_participants(match_id).await?;
        if !outstanding.is_empty() {
            debug!(match_id = %match_id, outstanding = outstanding.len(), "Match still has outstanding participants");
            return Ok(false);
        }
        info!(match_id = %match_id, "Last participant submitted, ending match");
        self.end(match_id, ended_by).await
    }

    /// Push the active match (or `None`) now and on every match change
    pub fn subscribe_active_match<C>(&self, on_change: C) -> SubscriptionHandle
    where
        C: FnMut(Option<Match>) + Send + 'static,
    {
        watch(
            self.store.clone(),
            vec![paths::MATCHES.to_string()],
            |store: Arc<dyn SharedStore>| async move { load_active(store.as_ref()).await },
            on_change,
        )
    }

    /// Push one identity's assignment (or `None`) now and on every change
    pub fn subscribe_assignment<C>(&self, identity_id: &str, on_change: C) -> SubscriptionHandle
    where
        C: FnMut(Option<Assignment>) + Send + 'static,
    {
        let id = identity_id.to_string();
        watch(
            self.store.clone(),
            vec![paths::assignment(identity_id)],
            move |store: Arc<dyn SharedStore>| {
                let id = id.clone();
                async move { load_assignment(store.as_ref(), &id).await }
            },
            on_change,
        )
    }

    /// Watch a match and end it when the last slotted participant submits
    pub fn auto_end(&self, match_id: &str, ended_by: Option<ScoutRef>) -> AutoEndDetector {
        AutoEndDetector::spawn(self.clone(), match_id.to_string(), ended_by)
    }
}

fn decode_match(match_id: String, value: Value) -> Result<Match> {
    let mut record: Match = decode(value)?;
    record.match_id = match_id;
    Ok(record)
}

async fn load_active(store: &dyn SharedStore) -> Result<Option<Match>> {
    let rows = store
        .query(
            paths::MATCHES,
            &Query::order_by("status")
                .equal_to(MatchStatus::Active.as_str())
                .limit_to_first(1),
        )
        .await?;
    rows.into_iter()
        .next()
        .map(|(key, value)| decode_match(key, value))
        .transpose()
}

async fn load_assignment(store: &dyn SharedStore, identity_id: &str) -> Result<Option<Assignment>> {
    match store.get(&paths::assignment(identity_id)).await? {
        Some(value) => Ok(Some(decode(value)?)),
        None => Ok(None),
    }
}

/// Background task ending a match once its assignments are all gone.
///
/// Best-effort: a missed notification only delays the end until the next
/// change, and `end` itself stays idempotent.
pub struct AutoEndDetector {
    match_id: String,
    handle: SubscriptionHandle,
}

impl AutoEndDetector {
    fn spawn(lifecycle: MatchLifecycle, match_id: String, ended_by: Option<ScoutRef>) -> Self {
        let watched = vec![paths::USERS.to_string(), paths::match_record(&match_id)];
        let mut subscription = Subscription::new(lifecycle.store.as_ref(), watched);
        let id = match_id.clone();
        let task = tokio::spawn(async move {
            loop {
                match lifecycle.end_if_last(&id, ended_by.as_ref()).await {
                    Ok(true) => break,
                    Ok(false) => {}
                    Err(e) => warn!(match_id = %id, "Auto-end check failed: {}", e),
                }
                match lifecycle.get_match(&id).await {
                    Ok(Some(m)) if !m.is_active() => break,
                    Ok(None) => break,
                    _ => {}
                }
                if subscription.changed().await.is_none() {
                    break;
                }
            }
            debug!(match_id = %id, "Auto-end detector finished");
        });
        Self {
            match_id,
            handle: SubscriptionHandle::from_task(task),
        }
    }

    pub fn match_id(&self) -> &str {
        &self.match_id
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_active()
    }

    pub fn stop(self) {
        self.handle.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn lead() -> ScoutRef {
        ScoutRef::new("uid-lead", "Lead Sam")
    }

    fn labels(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    async fn setup(scouts: &[(&str, &str)]) -> (MemoryStore, MatchLifecycle) {
        let server = MemoryStore::new();
        let store: Arc<dyn SharedStore> = Arc::new(server.connect());
        let queue = Queue::new(store.clone());
        for (id, name) in scouts {
            queue.join(id, name).await.unwrap();
        }
        (server, MatchLifecycle::new(store, &CoordConfig::default()))
    }

    #[test]
    fn test_validate_slot_label() {
        assert_eq!(validate_slot_label(" 254 ").unwrap(), "254");
        assert!(validate_slot_label("").is_err());
        assert!(validate_slot_label("12a").is_err());
        assert!(validate_slot_label("1234567").is_err());
    }

    #[test]
    fn test_assign_slots_caps() {
        let entries: Vec<QueueEntry> = (0..8)
            .map(|i| QueueEntry {
                entry_id: format!("k{}", i),
                identity_id: format!("A{}", i),
                display_name: format!("S{}", i),
                joined_at: Some(i),
            })
            .collect();
        let all = labels(&["1", "2", " ", "4", "5", "6", "7", "8"]);
        let participants = assign_slots(&entries, &all, 6);
        let slots: Vec<Option<&str>> =
            participants.iter().map(|p| p.assigned_slot.as_deref()).collect();
        assert_eq!(
            slots,
            vec![Some("1"), Some("2"), None, Some("4"), Some("5"), Some("6"), None, None]
        );
        assert_eq!(assign_slots(&entries[..2], &all, 6).iter().filter(|p| p.assigned_slot.is_some()).count(), 2);
    }

    #[tokio::test]
    async fn test_start_requires_queue() {
        let (_, lifecycle) = setup(&[]).await;
        let err = lifecycle.start(&lead(), &labels(&["1"])).await.unwrap_err();
        assert!(matches!(err, ScoutError::QueueEmpty));
    }

    #[tokio::test]
    async fn test_start_assigns_and_drains() {
        let (server, lifecycle) = setup(&[("A1", "Alice"), ("A2", "Bob")]).await;
        let match_id = lifecycle.start(&lead(), &labels(&["100"])).await.unwrap();

        let m = lifecycle.active_match().await.unwrap().unwrap();
        assert_eq!(m.match_id, match_id);
        assert_eq!(m.started_by, "uid-lead");
        assert_eq!(m.participants[0].assigned_slot.as_deref(), Some("100"));
        assert_eq!(m.participants[1].assigned_slot, None);

        assert_eq!(server.read("queue").await.unwrap(), None);
        let alice = lifecycle.assignment_for("A1").await.unwrap().unwrap();
        assert_eq!(alice.match_id, match_id);
        assert_eq!(alice.slot_label, "100");
        assert_eq!(lifecycle.assignment_for("A2").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_single_active_match() {
        let (server, lifecycle) = setup(&[("A1", "Alice")]).await;
        let first = lifecycle.start(&lead(), &[]).await.unwrap();

        Queue::new(Arc::new(server.connect())).join("A2", "Bob").await.unwrap();
        let err = lifecycle.start(&lead(), &[]).await.unwrap_err();
        assert!(matches!(err, ScoutError::MatchAlreadyActive { ref match_id } if match_id == &first));

        assert!(lifecycle.end(&first, Some(&lead())).await.unwrap());
        assert!(!lifecycle.end(&first, Some(&lead())).await.unwrap());
        let second = lifecycle.start(&lead(), &[]).await.unwrap();
        assert_ne!(first, second);
        assert_eq!(lifecycle.matches().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_end_clears_only_own_assignments() {
        let (server, lifecycle) = setup(&[("A1", "Alice"), ("A2", "Bob")]).await;
        let match_id = lifecycle.start(&lead(), &labels(&["100", "200"])).await.unwrap();
        let conn = server.connect();
        conn.set("users/A2/currentAssignment/matchId", json!("other")).await.unwrap();

        assert!(lifecycle.end(&match_id, None).await.unwrap());
        assert_eq!(lifecycle.assignment_for("A1").await.unwrap(), None);
        assert_eq!(lifecycle.assignment_for("A2").await.unwrap().unwrap().match_id, "other");

        let ended = lifecycle.get_match(&match_id).await.unwrap().unwrap();
        assert_eq!(ended.status, MatchStatus::Ended);
        assert!(ended.ended_at.is_some());
        assert_eq!(ended.ended_by, None);
    }

    #[tokio::test]
    async fn test_end_missing_match() {
        let (_, lifecycle) = setup(&[]).await;
        let err = lifecycle.end("nope", None).await.unwrap_err();
        assert!(matches!(err, ScoutError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_submit_and_end_if_last() {
        let (_, lifecycle) = setup(&[("A1", "Alice"), ("A2", "Bob")]).await;
        let match_id = lifecycle.start(&lead(), &labels(&["100", "200"])).await.unwrap();

        lifecycle.submit("A1", json!({"auto": 3})).await.unwrap();
        assert!(!lifecycle.end_if_last(&match_id, None).await.unwrap());
        assert_eq!(lifecycle.outstanding_participants(&match_id).await.unwrap().len(), 1);
        assert!(lifecycle.submit("A1", json!({})).await.is_err());

        let submission = lifecycle.submit("A2", json!({"auto": 5})).await.unwrap();
        assert_eq!(submission.slot_label, "200");
        assert!(lifecycle.end_if_last(&match_id, None).await.unwrap());
        assert_eq!(lifecycle.submissions(&match_id).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_auto_end_detector() {
        let (_, lifecycle) = setup(&[("A1", "Alice"), ("A2", "Bob")]).await;
        let match_id = lifecycle.start(&lead(), &labels(&["100"])).await.unwrap();
        let detector = lifecycle.auto_end(&match_id, Some(lead()));
        assert_eq!(detector.match_id(), match_id);

        lifecycle.submit("A1", json!({"notes": "fast"})).await.unwrap();
        let mut ended = false;
        for _ in 0..100 {
            if !lifecycle.get_match(&match_id).await.unwrap().unwrap().is_active() {
                ended = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(ended);
        let m = lifecycle.get_match(&match_id).await.unwrap().unwrap();
        assert_eq!(m.ended_by.as_deref(), Some("uid-lead"));
    }

    #[tokio::test]
    async fn test_unslotted_match_is_not_auto_ended() {
        let (_, lifecycle) = setup(&[("A1", "Alice")]).await;
        let match_id = lifecycle.start(&lead(), &[]).await.unwrap();
        assert!(!lifecycle.end_if_last(&match_id, None).await.unwrap());
        assert!(lifecycle.active_match().await.unwrap().is_some());
    }
}
