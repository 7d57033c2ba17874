//! Fleet and instance object model.
//!
//! These are the shapes the controller reads from and writes to the
//! platform. Templates are opaque JSON blobs; the controller never looks
//! inside them and tells template versions apart only by [`Revision`].

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use fleet_id::{FleetUid, InstanceUid};
use fleet_reconcile::Revision;
use serde::{Deserialize, Serialize};

/// Label carrying the owning fleet's name. Only a narrowing selector; the
/// owner reference is authoritative.
pub const FLEET_NAME_LABEL: &str = "fleet.plfm.dev/name";

/// Label carrying the revision an instance was created from.
pub const REVISION_LABEL: &str = "fleet.plfm.dev/revision";

/// Finalizer guarding teardown of external resources.
pub const TEARDOWN_FINALIZER: &str = "fleet.plfm.dev/teardown";

pub const FLEET_KIND: &str = "Fleet";

/// Condition types and reasons used on instances and fleets.
pub mod conditions {
    pub const SCHEDULED: &str = "Scheduled";
    pub const READY: &str = "Ready";
    pub const REPLICA_FAILURE: &str = "ReplicaFailure";

    pub const REASON_UNSCHEDULABLE: &str = "Unschedulable";
    pub const REASON_CREATE_FAILED: &str = "CreateFailed";
    pub const REASON_DELETE_FAILED: &str = "DeleteFailed";
}

/// Namespaced identity of a fleet; the work queue key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FleetKey {
    pub namespace: String,
    pub name: String,
}

impl FleetKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for FleetKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Exclusive ownership link from a child to its controller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: FleetUid,
    /// Only the controlling owner routes events and drives garbage collection.
    pub controller: bool,
}

/// Metadata common to every platform object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ObjectMeta<U> {
    pub name: String,
    pub namespace: String,
    pub uid: U,

    /// Optimistic-concurrency token, bumped by the platform on every write.
    #[serde(default)]
    pub resource_version: u64,

    /// Bumped by the platform whenever the spec changes.
    #[serde(default)]
    pub generation: u64,

    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,

    #[serde(default)]
    pub finalizers: Vec<String>,

    pub creation_timestamp: DateTime<Utc>,

    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
}

impl<U> ObjectMeta<U> {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, uid: U) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            uid,
            resource_version: 0,
            generation: 0,
            labels: BTreeMap::new(),
            owner_references: Vec::new(),
            finalizers: Vec::new(),
            creation_timestamp: Utc::now(),
            deletion_timestamp: None,
        }
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Adds `finalizer`; returns false if it was already present.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Removes `finalizer`; returns false if it was not present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        self.finalizers.len() != before
    }

    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }
}

// =============================================================================
// Conditions
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
}

impl Condition {
    pub fn new(
        type_: &str,
        status: ConditionStatus,
        reason: &str,
        message: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            type_: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: message.into(),
            last_transition_time: at,
        }
    }
}

fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

// =============================================================================
// Fleet
// =============================================================================

/// Template every instance of a fleet is stamped from.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceTemplate {
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub spec: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetSpec {
    pub replicas: u32,
    pub template: InstanceTemplate,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FleetStatus {
    /// Revision new instances must carry. Minted by the platform, never by
    /// the controller.
    #[serde(default)]
    pub current_revision: Revision,

    /// Live instances at the current revision.
    #[serde(default)]
    pub replicas: u32,

    #[serde(default)]
    pub ready_replicas: u32,

    #[serde(default)]
    pub observed_generation: u64,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

impl FleetStatus {
    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        find_condition(&self.conditions, type_)
    }
}

/// The fleet declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fleet {
    pub metadata: ObjectMeta<FleetUid>,
    pub spec: FleetSpec,
    #[serde(default)]
    pub status: FleetStatus,
}

impl Fleet {
    pub fn key(&self) -> FleetKey {
        FleetKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn uid(&self) -> FleetUid {
        self.metadata.uid
    }

    pub fn current_revision(&self) -> &Revision {
        &self.status.current_revision
    }

    /// Controller owner reference for instances created on behalf of this
    /// fleet.
    pub fn owner_reference(&self) -> OwnerReference {
        OwnerReference {
            kind: FLEET_KIND.to_string(),
            name: self.metadata.name.clone(),
            uid: self.metadata.uid,
            controller: true,
        }
    }
}

// =============================================================================
// Instance
// =============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    #[default]
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl Phase {
    /// Terminal phases never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Succeeded | Phase::Failed)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InstanceStatus {
    #[serde(default)]
    pub phase: Phase,

    /// When the platform first acknowledged the instance for scheduling.
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,

    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub metadata: ObjectMeta<InstanceUid>,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: InstanceStatus,
}

impl Instance {
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn uid(&self) -> InstanceUid {
        self.metadata.uid
    }

    /// Revision label value; empty when the label is missing.
    pub fn revision(&self) -> Revision {
        self.metadata
            .labels
            .get(REVISION_LABEL)
            .map(|r| Revision::new(r.as_str()))
            .unwrap_or_default()
    }

    pub fn phase(&self) -> Phase {
        self.status.phase
    }

    pub fn condition(&self, type_: &str) -> Option<&Condition> {
        find_condition(&self.status.conditions, type_)
    }

    fn condition_is(&self, type_: &str, status: ConditionStatus) -> bool {
        self.condition(type_).is_some_and(|c| c.status == status)
    }

    /// Counts toward the fleet: not finished and not on its way out.
    pub fn is_live(&self) -> bool {
        !self.status.phase.is_terminal() && !self.metadata.is_deleting()
    }

    pub fn is_ready(&self) -> bool {
        self.status.phase == Phase::Running
            && self.condition_is(conditions::READY, ConditionStatus::True)
    }

    pub fn is_scheduled(&self) -> bool {
        self.condition_is(conditions::SCHEDULED, ConditionStatus::True)
    }

    /// The scheduler explicitly rejected this instance.
    pub fn is_unschedulable(&self) -> bool {
        self.status.conditions.iter().any(|c| {
            c.type_ == conditions::SCHEDULED
                && c.status == ConditionStatus::False
                && c.reason == conditions::REASON_UNSCHEDULABLE
        })
    }

    pub fn controller_owner(&self) -> Option<&OwnerReference> {
        self.metadata.owner_references.iter().find(|o| o.controller)
    }

    pub fn is_controlled_by(&self, uid: FleetUid) -> bool {
        self.controller_owner().is_some_and(|o| o.uid == uid)
    }
}
