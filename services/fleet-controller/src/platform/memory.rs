//! In-process platform for development and testing.
//!
//! Behaves like the real thing where the controller can tell the difference:
//! resource versions, generation bumps, revision minting, finalizer-gated
//! deletion, owner garbage collection and the watch stream. Every call is
//! recorded, and faults can be injected per operation and target.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use fleet_events::FleetEvent;
use fleet_id::FleetUid;
use fleet_reconcile::{Revision, SpecHash};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info};

use super::{
    DeleteOptions, LabelSelector, Platform, PlatformError, PlatformResult, Propagation,
    WatchEvent,
};
use crate::model::{
    conditions, Condition, ConditionStatus, Fleet, FleetKey, FleetSpec, FleetStatus, Instance,
    InstanceStatus, InstanceTemplate, ObjectMeta, Phase,
};

const WATCH_CAPACITY: usize = 1024;

/// User-facing fleet declaration, as applied by an operator or seed file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FleetManifest {
    pub namespace: String,
    pub name: String,
    pub replicas: u32,
    #[serde(default)]
    pub template: InstanceTemplate,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

/// Platform operations, for call recording and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    GetFleet,
    ListFleets,
    ListInstances,
    CreateInstance,
    DeleteInstance,
    UpdateFleet,
    UpdateFleetStatus,
    RecordEvent,
}

impl Operation {
    /// Create, delete and update calls.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Operation::CreateInstance
                | Operation::DeleteInstance
                | Operation::UpdateFleet
                | Operation::UpdateFleetStatus
        )
    }
}

/// A call the platform received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Call {
    pub operation: Operation,
    pub namespace: String,
    pub name: String,
    pub propagation: Option<Propagation>,
}

/// An injected failure.
#[derive(Debug, Clone)]
pub struct Fault {
    operation: Operation,
    target: Option<String>,
    error: PlatformError,
    remaining: Option<u32>,
}

impl Fault {
    /// Fail every `operation` call with `error` until cleared.
    pub fn new(operation: Operation, error: PlatformError) -> Self {
        Self {
            operation,
            target: None,
            error,
            remaining: None,
        }
    }

    /// Only fail calls against the object with this name.
    #[must_use]
    pub fn on(mut self, name: &str) -> Self {
        self.target = Some(name.to_string());
        self
    }

    /// Only fail the next `n` matching calls.
    #[must_use]
    pub fn times(mut self, n: u32) -> Self {
        self.remaining = Some(n);
        self
    }

    fn matches(&self, operation: Operation, name: &str) -> bool {
        self.operation == operation && self.target.as_deref().is_none_or(|t| t == name)
    }
}

#[derive(Default)]
struct State {
    fleets: BTreeMap<FleetKey, Fleet>,
    instances: BTreeMap<(String, String), Instance>,
    events: Vec<FleetEvent>,
    calls: Vec<Call>,
    faults: Vec<Fault>,
    version: u64,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.version += 1;
        self.version
    }

    /// Record a call and apply the first matching fault.
    fn admit(
        &mut self,
        operation: Operation,
        namespace: &str,
        name: &str,
        propagation: Option<Propagation>,
    ) -> PlatformResult<()> {
        self.calls.push(Call {
            operation,
            namespace: namespace.to_string(),
            name: name.to_string(),
            propagation,
        });

        let Some(index) = self.faults.iter().position(|f| f.matches(operation, name)) else {
            return Ok(());
        };

        let fault = &mut self.faults[index];
        let error = fault.error.clone();
        let exhausted = match fault.remaining.as_mut() {
            Some(remaining) => {
                *remaining = remaining.saturating_sub(1);
                *remaining == 0
            }
            None => false,
        };
        if exhausted {
            self.faults.remove(index);
        }
        Err(error)
    }

    /// Remove a fleet and collect every instance it controls.
    fn remove_fleet(&mut self, key: &FleetKey, uid: FleetUid) -> Vec<WatchEvent> {
        let mut changes = Vec::new();
        self.fleets.remove(key);
        changes.push(WatchEvent::Fleet(key.clone()));

        let owned: Vec<_> = self
            .instances
            .iter()
            .filter(|(_, i)| i.is_controlled_by(uid))
            .map(|(k, _)| k.clone())
            .collect();

        for k in owned {
            if let Some(instance) = self.instances.remove(&k) {
                changes.push(instance_event(&instance));
            }
        }

        info!(fleet = %key, collected = changes.len() - 1, "Fleet removed");
        changes
    }
}

fn instance_event(instance: &Instance) -> WatchEvent {
    WatchEvent::Instance {
        namespace: instance.metadata.namespace.clone(),
        name: instance.metadata.name.clone(),
        owner: instance.controller_owner().cloned(),
    }
}

fn fleet_not_found(key: &FleetKey) -> PlatformError {
    PlatformError::NotFound(format!("fleet {key}"))
}

/// Mint the revision for a template.
pub fn mint_revision(template: &InstanceTemplate) -> Revision {
    let labels: serde_json::Map<String, serde_json::Value> = template
        .labels
        .iter()
        .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
        .collect();

    let mut canonical = serde_json::Map::new();
    canonical.insert("labels".to_string(), serde_json::Value::Object(labels));
    canonical.insert("spec".to_string(), template.spec.clone());

    SpecHash::from_json(&serde_json::Value::Object(canonical)).into()
}

/// In-process platform.
pub struct MemoryPlatform {
    state: Mutex<State>,
    watch_tx: broadcast::Sender<WatchEvent>,
}

impl MemoryPlatform {
    pub fn new() -> Self {
        let (watch_tx, _) = broadcast::channel(WATCH_CAPACITY);
        Self {
            state: Mutex::new(State::default()),
            watch_tx,
        }
    }

    fn publish(&self, changes: impl IntoIterator<Item = WatchEvent>) {
        for change in changes {
            // No subscribers is fine
            let _ = self.watch_tx.send(change);
        }
    }

    // =========================================================================
    // Operator side
    // =========================================================================

    /// Create or update a fleet from a manifest.
    ///
    /// A template change bumps the generation and mints a new revision.
    pub async fn apply_fleet(&self, manifest: FleetManifest) -> Fleet {
        let key = FleetKey::new(&manifest.namespace, &manifest.name);
        let spec = FleetSpec {
            replicas: manifest.replicas,
            template: manifest.template,
        };

        let mut state = self.state.lock().await;
        let version = state.next_version();

        let fleet = match state.fleets.get_mut(&key) {
            Some(existing) => {
                if existing.spec != spec {
                    if existing.spec.template != spec.template {
                        existing.status.current_revision = mint_revision(&spec.template);
                    }
                    existing.spec = spec;
                    existing.metadata.generation += 1;
                }
                existing.metadata.labels = manifest.labels;
                existing.metadata.resource_version = version;
                existing.clone()
            }
            None => {
                let mut metadata = ObjectMeta::new(&key.namespace, &key.name, FleetUid::new());
                metadata.labels = manifest.labels;
                metadata.generation = 1;
                metadata.resource_version = version;

                let fleet = Fleet {
                    metadata,
                    status: FleetStatus {
                        current_revision: mint_revision(&spec.template),
                        ..FleetStatus::default()
                    },
                    spec,
                };
                state.fleets.insert(key.clone(), fleet.clone());
                fleet
            }
        };
        drop(state);

        debug!(fleet = %key, revision = %fleet.status.current_revision, "Fleet applied");
        self.publish([WatchEvent::Fleet(key)]);
        fleet
    }

    /// Ask for a fleet to be deleted.
    ///
    /// With finalizers present the fleet only gets a deletion timestamp and
    /// lingers until they are removed.
    pub async fn request_fleet_deletion(&self, key: &FleetKey) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        let version = state.next_version();

        let fleet = state.fleets.get_mut(key).ok_or_else(|| fleet_not_found(key))?;
        let changes = if fleet.metadata.finalizers.is_empty() {
            let uid = fleet.metadata.uid;
            state.remove_fleet(key, uid)
        } else {
            fleet.metadata.deletion_timestamp.get_or_insert_with(Utc::now);
            fleet.metadata.resource_version = version;
            vec![WatchEvent::Fleet(key.clone())]
        };
        drop(state);

        self.publish(changes);
        Ok(())
    }

    pub async fn fleet(&self, key: &FleetKey) -> Option<Fleet> {
        self.state.lock().await.fleets.get(key).cloned()
    }

    /// Seed an instance as-is (timestamps included), bypassing call recording.
    pub async fn insert_instance(&self, mut instance: Instance) {
        let mut state = self.state.lock().await;
        instance.metadata.resource_version = state.next_version();
        let event = instance_event(&instance);
        state.instances.insert(
            (
                instance.metadata.namespace.clone(),
                instance.metadata.name.clone(),
            ),
            instance,
        );
        drop(state);
        self.publish([event]);
    }

    /// Overwrite an instance's status, as the node-level runtime would.
    pub async fn set_instance_status(
        &self,
        namespace: &str,
        name: &str,
        status: InstanceStatus,
    ) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        let version = state.next_version();
        let instance = state
            .instances
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| PlatformError::NotFound(format!("instance {namespace}/{name}")))?;
        instance.status = status;
        instance.metadata.resource_version = version;
        let event = instance_event(instance);
        drop(state);

        self.publish([event]);
        Ok(())
    }

    /// Schedule and start every pending instance.
    ///
    /// Stands in for the scheduler and node runtime in development mode.
    pub async fn simulate_scheduling(&self) -> usize {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let mut changes = Vec::new();

        let pending: Vec<_> = state
            .instances
            .iter()
            .filter(|(_, i)| i.phase() == Phase::Pending && i.is_live())
            .map(|(k, _)| k.clone())
            .collect();

        for key in pending {
            let version = state.next_version();
            if let Some(instance) = state.instances.get_mut(&key) {
                instance.status = InstanceStatus {
                    phase: Phase::Running,
                    start_time: Some(now),
                    conditions: vec![
                        Condition::new(conditions::SCHEDULED, ConditionStatus::True, "", "", now),
                        Condition::new(conditions::READY, ConditionStatus::True, "", "", now),
                    ],
                };
                instance.metadata.resource_version = version;
                changes.push(instance_event(instance));
            }
        }
        drop(state);

        let started = changes.len();
        self.publish(changes);
        started
    }

    pub async fn instances(&self, namespace: &str) -> Vec<Instance> {
        self.state
            .lock()
            .await
            .instances
            .values()
            .filter(|i| i.metadata.namespace == namespace)
            .cloned()
            .collect()
    }

    pub async fn events(&self) -> Vec<FleetEvent> {
        self.state.lock().await.events.clone()
    }

    // =========================================================================
    // Call recording and fault injection
    // =========================================================================

    pub async fn calls(&self) -> Vec<Call> {
        self.state.lock().await.calls.clone()
    }

    pub async fn calls_of(&self, operation: Operation) -> Vec<Call> {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.operation == operation)
            .cloned()
            .collect()
    }

    /// Number of create, delete and update calls received.
    pub async fn mutation_count(&self) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.operation.is_mutation())
            .count()
    }

    pub async fn clear_calls(&self) {
        self.state.lock().await.calls.clear();
    }

    pub async fn inject(&self, fault: Fault) {
        self.state.lock().await.faults.push(fault);
    }

    pub async fn clear_faults(&self) {
        self.state.lock().await.faults.clear();
    }
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Platform for MemoryPlatform {
    async fn get_fleet(&self, key: &FleetKey) -> PlatformResult<Fleet> {
        let mut state = self.state.lock().await;
        state.admit(Operation::GetFleet, &key.namespace, &key.name, None)?;
        state.fleets.get(key).cloned().ok_or_else(|| fleet_not_found(key))
    }

    async fn list_fleets(&self) -> PlatformResult<Vec<Fleet>> {
        let mut state = self.state.lock().await;
        state.admit(Operation::ListFleets, "", "", None)?;
        Ok(state.fleets.values().cloned().collect())
    }

    async fn list_instances(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> PlatformResult<Vec<Instance>> {
        let mut state = self.state.lock().await;
        state.admit(Operation::ListInstances, namespace, "", None)?;
        Ok(state
            .instances
            .values()
            .filter(|i| i.metadata.namespace == namespace && selector.matches(&i.metadata.labels))
            .cloned()
            .collect())
    }

    async fn create_instance(&self, mut instance: Instance) -> PlatformResult<Instance> {
        let namespace = instance.metadata.namespace.clone();
        let name = instance.metadata.name.clone();

        let mut state = self.state.lock().await;
        state.admit(Operation::CreateInstance, &namespace, &name, None)?;

        let key = (namespace, name);
        if state.instances.contains_key(&key) {
            return Err(PlatformError::AlreadyExists(format!(
                "instance {}/{}",
                key.0, key.1
            )));
        }

        instance.metadata.resource_version = state.next_version();
        instance.metadata.creation_timestamp = Utc::now();
        instance.metadata.deletion_timestamp = None;
        let event = instance_event(&instance);
        state.instances.insert(key, instance.clone());
        drop(state);

        self.publish([event]);
        Ok(instance)
    }

    async fn delete_instance(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        state.admit(
            Operation::DeleteInstance,
            namespace,
            name,
            Some(options.propagation),
        )?;

        let key = (namespace.to_string(), name.to_string());
        let Some(existing) = state.instances.get(&key) else {
            return Err(PlatformError::NotFound(format!("instance {namespace}/{name}")));
        };

        if let Some(uid) = options.precondition_uid {
            if existing.uid() != uid {
                return Err(PlatformError::Conflict(format!(
                    "instance {namespace}/{name} has uid {}, expected {uid}",
                    existing.uid()
                )));
            }
        }

        // Instances own no dependents here, so every propagation mode
        // removes the object immediately.
        let event = state.instances.remove(&key).map(|i| instance_event(&i));
        drop(state);

        self.publish(event);
        Ok(())
    }

    async fn update_fleet(&self, fleet: &Fleet) -> PlatformResult<Fleet> {
        let key = fleet.key();
        let mut state = self.state.lock().await;
        state.admit(Operation::UpdateFleet, &key.namespace, &key.name, None)?;
        let version = state.next_version();

        let current = state.fleets.get_mut(&key).ok_or_else(|| fleet_not_found(&key))?;
        if current.metadata.uid != fleet.metadata.uid
            || current.metadata.resource_version != fleet.metadata.resource_version
        {
            return Err(PlatformError::Conflict(format!(
                "fleet {key} is at version {}, update was based on {}",
                current.metadata.resource_version, fleet.metadata.resource_version
            )));
        }

        if current.spec != fleet.spec {
            if current.spec.template != fleet.spec.template {
                current.status.current_revision = mint_revision(&fleet.spec.template);
            }
            current.spec = fleet.spec.clone();
            current.metadata.generation += 1;
        }
        current.metadata.labels = fleet.metadata.labels.clone();
        current.metadata.finalizers = fleet.metadata.finalizers.clone();
        current.metadata.resource_version = version;

        let updated = current.clone();
        let changes = if updated.metadata.is_deleting() && updated.metadata.finalizers.is_empty() {
            state.remove_fleet(&key, updated.metadata.uid)
        } else {
            vec![WatchEvent::Fleet(key)]
        };
        drop(state);

        self.publish(changes);
        Ok(updated)
    }

    async fn update_fleet_status(&self, fleet: &Fleet) -> PlatformResult<Fleet> {
        let key = fleet.key();
        let mut state = self.state.lock().await;
        state.admit(Operation::UpdateFleetStatus, &key.namespace, &key.name, None)?;
        let version = state.next_version();

        let current = state.fleets.get_mut(&key).ok_or_else(|| fleet_not_found(&key))?;
        if current.metadata.uid != fleet.metadata.uid
            || current.metadata.resource_version != fleet.metadata.resource_version
        {
            return Err(PlatformError::Conflict(format!(
                "fleet {key} status is at version {}, update was based on {}",
                current.metadata.resource_version, fleet.metadata.resource_version
            )));
        }

        // The revision is platform-owned
        let revision = current.status.current_revision.clone();
        current.status = fleet.status.clone();
        current.status.current_revision = revision;
        current.metadata.resource_version = version;
        let updated = current.clone();
        drop(state);

        self.publish([WatchEvent::Fleet(key)]);
        Ok(updated)
    }

    async fn record_event(&self, event: FleetEvent) -> PlatformResult<()> {
        let mut state = self.state.lock().await;
        state.admit(
            Operation::RecordEvent,
            &event.involved.namespace,
            &event.involved.name,
            None,
        )?;
        debug!(
            reason = %event.reason,
            event_type = %event.event_type,
            object = %event.involved.name,
            message = %event.message,
            "Event recorded"
        );
        state.events.push(event);
        Ok(())
    }

    fn watch(&self) -> broadcast::Receiver<WatchEvent> {
        self.watch_tx.subscribe()
    }
}
