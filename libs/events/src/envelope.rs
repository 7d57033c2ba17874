//! Event record - the common shape of every emitted event.

use chrono::{DateTime, Utc};
use fleet_id::{EventUid, ReconcileId};
use serde::{Deserialize, Serialize};

use crate::{EventError, EventType, Reason};

/// Kind of object an event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ObjectKind {
    Fleet,
    Instance,
}

impl std::fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ObjectKind::Fleet => write!(f, "Fleet"),
            ObjectKind::Instance => write!(f, "Instance"),
        }
    }
}

/// Reference to the object an event is recorded against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InvolvedObject {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
    /// Rendered UID, so references survive the object being recreated.
    pub uid: String,
}

/// A single event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetEvent {
    /// Unique identifier for this event.
    pub uid: EventUid,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    pub event_type: EventType,

    pub reason: Reason,

    /// Human-readable detail.
    pub message: String,

    pub involved: InvolvedObject,

    /// Component that emitted the event.
    pub reporter: String,

    /// Reconcile invocation that emitted the event, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconcile_id: Option<ReconcileId>,
}

impl FleetEvent {
    /// Build an event whose severity follows from `reason`.
    pub fn new(
        involved: InvolvedObject,
        reason: Reason,
        message: impl Into<String>,
        reporter: impl Into<String>,
    ) -> Self {
        Self {
            uid: EventUid::new(),
            occurred_at: Utc::now(),
            event_type: reason.event_type(),
            reason,
            message: message.into(),
            involved,
            reporter: reporter.into(),
            reconcile_id: None,
        }
    }

    #[must_use]
    pub fn with_reconcile_id(mut self, id: ReconcileId) -> Self {
        self.reconcile_id = Some(id);
        self
    }

    pub fn is_warning(&self) -> bool {
        self.event_type == EventType::Warning
    }

    pub fn to_json(&self) -> Result<String, EventError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(s: &str) -> Result<Self, EventError> {
        Ok(serde_json::from_str(s)?)
    }
}
