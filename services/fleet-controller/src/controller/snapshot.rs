//! Snapshot reader.
//!
//! Reads the fleet and the instances it controls. Nothing is cached between
//! passes; every reconcile starts from a fresh listing.

use thiserror::Error;
use tracing::debug;

use crate::model::{Fleet, FleetKey, Instance, FLEET_NAME_LABEL};
use crate::platform::{LabelSelector, Platform, PlatformError};

#[derive(Debug, Error)]
pub enum SnapshotError {
    /// The fleet no longer exists. Nothing to do.
    #[error("fleet {0} not found")]
    NotFound(FleetKey),

    /// Any other read failure; retried with backoff.
    #[error("failed to read fleet state: {0}")]
    Read(#[from] PlatformError),
}

/// Point-in-time view of a fleet and its instances.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub fleet: Fleet,

    /// Instances controlled by `fleet`, oldest first.
    pub instances: Vec<Instance>,
}

impl Snapshot {
    /// Live instances whose revision matches the fleet's current revision.
    pub fn live_at_current_revision(&self) -> Vec<&Instance> {
        let current = self.fleet.current_revision();
        self.instances
            .iter()
            .filter(|i| i.is_live() && &i.revision() == current)
            .collect()
    }
}

/// Read a fleet and every instance whose controller owner is that fleet.
///
/// The name label only narrows the listing. Instances carrying the label but
/// owned by another UID (a previous fleet of the same name, or a foreign
/// object) are ignored.
pub async fn load_snapshot(
    platform: &dyn Platform,
    key: &FleetKey,
) -> Result<Snapshot, SnapshotError> {
    let fleet = match platform.get_fleet(key).await {
        Ok(fleet) => fleet,
        Err(e) if e.is_not_found() => return Err(SnapshotError::NotFound(key.clone())),
        Err(e) => return Err(e.into()),
    };

    let selector = LabelSelector::everything().with(FLEET_NAME_LABEL, &key.name);
    let listed = platform.list_instances(&key.namespace, &selector).await?;

    let uid = fleet.uid();
    let (mut instances, foreign): (Vec<_>, Vec<_>) =
        listed.into_iter().partition(|i| i.is_controlled_by(uid));

    for instance in &foreign {
        debug!(
            fleet = %key,
            instance = %instance.name(),
            "Ignoring labelled instance owned by another object"
        );
    }

    instances.sort_by(|a, b| {
        a.metadata
            .creation_timestamp
            .cmp(&b.metadata.creation_timestamp)
            .then_with(|| a.name().cmp(b.name()))
    });

    Ok(Snapshot { fleet, instances })
}
