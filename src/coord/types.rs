//! Records stored in the shared tree
//!
//! Field names are camelCase on the wire. Keys that live in the path
//! (entry keys, match ids) are carried in `#[serde(skip)]` fields and
//! filled in after a read.

use crate::core::errors::{Result, ScoutError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Where an identity id came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IdentitySource {
    /// Credentialed provider account
    Authenticated,
    /// Anonymous provider session
    Anonymous,
    /// Pool code or derived slug assigned without the provider
    Local,
}

impl fmt::Display for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentitySource::Authenticated => write!(f, "authenticated"),
            IdentitySource::Anonymous => write!(f, "anonymous"),
            IdentitySource::Local => write!(f, "local"),
        }
    }
}

/// One logical user, stored at `users/{id}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default)]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub last_active: Option<i64>,
    #[serde(default = "default_source")]
    pub source: IdentitySource,
}

fn default_source() -> IdentitySource {
    IdentitySource::Local
}

impl Identity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, source: IdentitySource) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: None,
            last_active: None,
            source,
        }
    }

    pub fn with_email(mut self, email: Option<String>) -> Self {
        self.email = email;
        self
    }

    /// Lightweight reference used by the queue and matches
    pub fn scout(&self) -> ScoutRef {
        ScoutRef {
            id: self.id.clone(),
            name: self.name.clone(),
        }
    }
}

/// Identity id plus the display name it was seen with
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ScoutRef {
    pub id: String,
    pub name: String,
}

impl ScoutRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
        }
    }
}

/// Waiting-list entry, stored at `queue/{entryId}`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    #[serde(skip)]
    pub entry_id: String,
    #[serde(rename = "userId")]
    pub identity_id: String,
    #[serde(rename = "name")]
    pub display_name: String,
    #[serde(rename = "joinedAt", default)]
    pub joined_at: Option<i64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Active,
    Ended,
}

impl MatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchStatus::Active => "active",
            MatchStatus::Ended => "ended",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    #[serde(rename = "userId")]
    pub identity_id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_slot: Option<String>,
}

/// One match run, stored at `matches/{matchId}`. Never deleted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    #[serde(skip)]
    pub match_id: String,
    pub started_by: String,
    pub started_by_name: String,
    #[serde(default)]
    pub participants: Vec<Participant>,
    #[serde(default)]
    pub started_at: Option<i64>,
    pub status: MatchStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_by: Option<String>,
}

impl Match {
    pub fn is_active(&self) -> bool {
        self.status == MatchStatus::Active
    }

    /// Participants holding a slot label
    pub fn slotted(&self) -> impl Iterator<Item = &Participant> {
        self.participants.iter().filter(|p| p.assigned_slot.is_some())
    }

    pub fn participant(&self, identity_id: &str) -> Option<&Participant> {
        self.participants.iter().find(|p| p.identity_id == identity_id)
    }
}

/// Live slot assignment, stored at `users/{id}/currentAssignment`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Assignment {
    pub match_id: String,
    pub slot_label: String,
    #[serde(default)]
    pub assigned_at: Option<i64>,
}

/// Result handed in by a participant, stored at
/// `submissions/{matchId}/{identityId}`
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub match_id: String,
    #[serde(rename = "userId")]
    pub identity_id: String,
    pub slot_label: String,
    #[serde(default)]
    pub submitted_at: Option<i64>,
    #[serde(default)]
    pub payload: Value,
}

/// Decode a stored record
pub fn decode<T: DeserializeOwned>(value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| ScoutError::serialization("json", e))
}

/// Encode a record for writing
pub fn encode<T: Serialize>(record: &T) -> Result<Value> {
    serde_json::to_value(record).map_err(|e| ScoutError::serialization("json", e))
}

/// Store paths of every record kind
pub mod paths {
    pub const USERS: &str = "users";
    pub const QUEUE: &str = "queue";
    pub const MATCHES: &str = "matches";
    pub const SUBMISSIONS: &str = "submissions";
    pub const HINTS: &str = "hints";

    pub fn user(id: &str) -> String {
        format!("{}/{}", USERS, id)
    }

    pub fn user_field(id: &str, field: &str) -> String {
        format!("{}/{}/{}", USERS, id, field)
    }

    pub fn last_active(id: &str) -> String {
        user_field(id, "lastActive")
    }

    pub fn assignment(id: &str) -> String {
        user_field(id, "currentAssignment")
    }

    pub fn queue_entry(key: &str) -> String {
        format!("{}/{}", QUEUE, key)
    }

    pub fn match_record(id: &str) -> String {
        format!("{}/{}", MATCHES, id)
    }

    pub fn submission(match_id: &str, identity_id: &str) -> String {
        format!("{}/{}/{}", SUBMISSIONS, match_id, identity_id)
    }

    pub fn hint(device_id: &str, name: &str) -> String {
        format!("{}/{}/{}", HINTS, device_id, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_identity_wire_format() {
        let identity = Identity::new("A1", "Alice", IdentitySource::Local);
        let value = encode(&identity).unwrap();
        assert_eq!(value["source"], json!("local"));
        assert_eq!(value["lastActive"], Value::Null);

        let stored = json!({
            "id": "A1",
            "name": "Alice",
            "lastActive": 42,
            "source": "anonymous",
            "currentAssignment": {"matchId": "m1", "slotLabel": "100"}
        });
        let decoded: Identity = decode(stored).unwrap();
        assert_eq!(decoded.last_active, Some(42));
        assert_eq!(decoded.source, IdentitySource::Anonymous);
    }

    #[test]
    fn test_match_wire_format() {
        let stored = json!({
            "startedBy": "uid-lead",
            "startedByName": "Lead Sam",
            "participants": [
                {"userId": "A1", "name": "Alice", "assignedSlot": "100"},
                {"userId": "A2", "name": "Bob"}
            ],
            "startedAt": 1000,
            "status": "active"
        });
        let m: Match = decode(stored).unwrap();
        assert!(m.is_active());
        assert_eq!(m.slotted().count(), 1);
        assert_eq!(m.participant("A2").unwrap().assigned_slot, None);
        assert_eq!(m.match_id, "");

        let round = encode(&m).unwrap();
        assert!(round.get("endedAt").is_none());
        assert!(round["participants"][1].get("assignedSlot").is_none());
    }

    #[test]
    fn test_queue_entry_fields() {
        let entry: QueueEntry =
            decode(json!({"userId": "A1", "name": "Alice", "joinedAt": 5})).unwrap();
        assert_eq!(entry.identity_id, "A1");
        assert_eq!(entry.display_name, "Alice");
        assert_eq!(entry.joined_at, Some(5));
    }
}
