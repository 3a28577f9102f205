//! Coordination engine
//!
//! Presence, queue, identity allocation, match lifecycle and sessions on
//! top of a [`SharedStore`](crate::store::SharedStore) with no transactions.
//! Every component is stateless apart from its store handle; the store is
//! the only source of truth.

pub mod device;
pub mod hints;
pub mod hub;
pub mod identity;
pub mod lifecycle;
pub mod presence;
pub mod queue;
pub mod session;
pub mod types;

pub use device::{Device, DeviceStorage};
pub use hints::{Hint, HintBoard, SUPPRESS_AUTO_SIGNIN, SUPPRESS_PRESENCE_ON_UNLOAD};
pub use hub::ScoutHub;
pub use identity::{slugify, Allocation, IdentityAllocator, IdentityPool};
pub use lifecycle::{validate_slot_label, AutoEndDetector, MatchLifecycle};
pub use presence::{NameOwner, PresenceRegistry};
pub use queue::{Queue, QueueView};
pub use session::{is_privileged_name, Credentials, LoginOutcome, Session};
pub use types::{
    Assignment, Identity, IdentitySource, Match, MatchStatus, Participant, QueueEntry, ScoutRef,
    Submission,
};
