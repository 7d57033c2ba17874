//! Event type and reason catalogue.

use serde::{Deserialize, Serialize};

use crate::EventError;

/// Severity of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum EventType {
    /// Expected progress.
    #[default]
    Normal,
    /// Something the fleet owner may need to act on.
    Warning,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventType::Normal => write!(f, "Normal"),
            EventType::Warning => write!(f, "Warning"),
        }
    }
}

impl std::str::FromStr for EventType {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Normal" => Ok(EventType::Normal),
            "Warning" => Ok(EventType::Warning),
            other => Err(EventError::UnknownEventType(other.to_string())),
        }
    }
}

/// Why an event was emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Reason {
    // Lifecycle
    FinalizerAdded,
    TeardownComplete,
    TeardownFailed,

    // Recovery
    OutdatedInstanceDeleted,
    StuckInstanceDeleted,
    RecoveryFailed,

    // Scaling
    InstanceCreated,
    InstanceDeleted,
    ScaleFailed,
}

impl Reason {
    /// Every reason, in catalogue order.
    pub const ALL: [Reason; 9] = [
        Reason::FinalizerAdded,
        Reason::TeardownComplete,
        Reason::TeardownFailed,
        Reason::OutdatedInstanceDeleted,
        Reason::StuckInstanceDeleted,
        Reason::RecoveryFailed,
        Reason::InstanceCreated,
        Reason::InstanceDeleted,
        Reason::ScaleFailed,
    ];

    /// The severity this reason is always reported with.
    pub fn event_type(&self) -> EventType {
        match self {
            Reason::TeardownFailed | Reason::RecoveryFailed | Reason::ScaleFailed => {
                EventType::Warning
            }
            _ => EventType::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Reason::FinalizerAdded => "FinalizerAdded",
            Reason::TeardownComplete => "TeardownComplete",
            Reason::TeardownFailed => "TeardownFailed",
            Reason::OutdatedInstanceDeleted => "OutdatedInstanceDeleted",
            Reason::StuckInstanceDeleted => "StuckInstanceDeleted",
            Reason::RecoveryFailed => "RecoveryFailed",
            Reason::InstanceCreated => "InstanceCreated",
            Reason::InstanceDeleted => "InstanceDeleted",
            Reason::ScaleFailed => "ScaleFailed",
        }
    }
}

impl std::fmt::Display for Reason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Reason {
    type Err = EventError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Reason::ALL
            .iter()
            .copied()
            .find(|r| r.as_str() == s)
            .ok_or_else(|| EventError::UnknownReason(s.to_string()))
    }
}
