//! Orchestration platform client interface.
//!
//! The platform owns storage of fleets and instances, optimistic
//! concurrency, garbage collection of owned objects, and the watch stream.
//! The controller only talks to it through [`Platform`], which is injected
//! at construction time.
//!
//! An in-process implementation lives in [`memory`] for development and
//! tests.

use std::collections::BTreeMap;

use async_trait::async_trait;
use fleet_events::FleetEvent;
use fleet_id::InstanceUid;
use thiserror::Error;
use tokio::sync::broadcast;

use crate::model::{Fleet, FleetKey, Instance, OwnerReference};

pub mod memory;

/// Errors returned by platform calls.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PlatformError {
    /// The object does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The write carried a stale resource version or failed a precondition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// An object with that name already exists.
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// The platform could not be reached or timed out.
    #[error("platform unavailable: {0}")]
    Unavailable(String),

    /// The platform refused the request (quota, validation).
    #[error("rejected: {0}")]
    Rejected(String),
}

impl PlatformError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, PlatformError::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, PlatformError::Conflict(_))
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

/// Equality-based label selector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LabelSelector {
    pub match_labels: BTreeMap<String, String>,
}

impl LabelSelector {
    /// Selects everything.
    pub fn everything() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: &str) -> Self {
        self.match_labels.insert(key.to_string(), value.to_string());
        self
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.match_labels
            .iter()
            .all(|(k, v)| labels.get(k) == Some(v))
    }
}

/// How dependents of a deleted object are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Propagation {
    /// Dependents are removed before the object disappears from listings.
    Foreground,
    /// The object is removed now; dependents are collected afterwards.
    #[default]
    Background,
    /// Dependents are left behind.
    Orphan,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub propagation: Propagation,

    /// Only delete if the live object still has this UID, so a replacement
    /// reusing the name is never removed by mistake.
    pub precondition_uid: Option<InstanceUid>,
}

impl DeleteOptions {
    pub fn foreground() -> Self {
        Self {
            propagation: Propagation::Foreground,
            precondition_uid: None,
        }
    }

    #[must_use]
    pub fn with_uid(mut self, uid: InstanceUid) -> Self {
        self.precondition_uid = Some(uid);
        self
    }
}

/// Change notifications from the platform's watch stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A fleet was created, updated or removed.
    Fleet(FleetKey),

    /// An instance was created, updated or removed.
    Instance {
        namespace: String,
        name: String,
        /// Controlling owner at the time of the change.
        owner: Option<OwnerReference>,
    },
}

/// Client for the orchestration platform.
///
/// Every method is a remote call from the controller's point of view. Writes
/// are atomic at the platform; version-checked writes fail with
/// [`PlatformError::Conflict`] when the caller's copy is stale.
#[async_trait]
pub trait Platform: Send + Sync {
    async fn get_fleet(&self, key: &FleetKey) -> PlatformResult<Fleet>;

    async fn list_fleets(&self) -> PlatformResult<Vec<Fleet>>;

    async fn list_instances(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> PlatformResult<Vec<Instance>>;

    async fn create_instance(&self, instance: Instance) -> PlatformResult<Instance>;

    /// Deleting an instance that does not exist returns `NotFound`.
    async fn delete_instance(
        &self,
        namespace: &str,
        name: &str,
        options: &DeleteOptions,
    ) -> PlatformResult<()>;

    /// Writes metadata and spec; status is ignored.
    async fn update_fleet(&self, fleet: &Fleet) -> PlatformResult<Fleet>;

    /// Writes status only.
    async fn update_fleet_status(&self, fleet: &Fleet) -> PlatformResult<Fleet>;

    async fn record_event(&self, event: FleetEvent) -> PlatformResult<()>;

    /// Subscribe to change notifications.
    fn watch(&self) -> broadcast::Receiver<WatchEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_matches_subset() {
        let selector = LabelSelector::everything().with("fleet.plfm.dev/name", "web");

        let mut labels = BTreeMap::new();
        assert!(!selector.matches(&labels));

        labels.insert("fleet.plfm.dev/name".to_string(), "web".to_string());
        labels.insert("tier".to_string(), "frontend".to_string());
        assert!(selector.matches(&labels));

        labels.insert("fleet.plfm.dev/name".to_string(), "api".to_string());
        assert!(!selector.matches(&labels));
    }

    #[test]
    fn test_empty_selector_matches_everything() {
        assert!(LabelSelector::everything().matches(&BTreeMap::new()));
    }

    #[test]
    fn test_delete_options() {
        let uid = InstanceUid::new();
        let options = DeleteOptions::foreground().with_uid(uid);
        assert_eq!(options.propagation, Propagation::Foreground);
        assert_eq!(options.precondition_uid, Some(uid));
        assert_eq!(DeleteOptions::default().propagation, Propagation::Background);
    }
}
