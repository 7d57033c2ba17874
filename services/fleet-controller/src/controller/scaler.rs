//! Replica scaler.
//!
//! Closes the gap between `spec.replicas` and the live instances at the
//! current revision. Instances at older revisions are not counted and never
//! chosen as scale-down victims.
//!
//! Scale-down victims are chosen in a fixed order so repeated passes over the
//! same state make the same choice:
//!
//! 1. unscheduled before not-ready before ready
//! 2. oldest creation time first
//! 3. name, as the final tiebreak

use chrono::{DateTime, Utc};
use fleet_id::InstanceUid;
use fleet_reconcile::{order_for_drain, DrainPriority};
use thiserror::Error;
use tracing::{debug, info, instrument};

use crate::model::{Fleet, Instance, ObjectMeta, FLEET_NAME_LABEL, REVISION_LABEL};
use crate::platform::{DeleteOptions, Platform, PlatformError};

/// Random suffix length of generated instance names.
const NAME_SUFFIX_LEN: usize = 5;

/// Attempts at finding a free instance name.
const MAX_NAME_ATTEMPTS: usize = 3;

#[derive(Debug, Error)]
pub enum ScaleError {
    #[error("fleet {0} has no current revision yet")]
    Unrevisioned(String),

    #[error("failed to create instance {name} ({created} of {wanted} created): {source}")]
    Create {
        name: String,
        created: usize,
        wanted: usize,
        #[source]
        source: PlatformError,
    },

    #[error("failed to delete instance {name} ({deleted} of {wanted} deleted): {source}")]
    Delete {
        name: String,
        deleted: usize,
        wanted: usize,
        #[source]
        source: PlatformError,
    },
}

impl ScaleError {
    /// Whether any instance was created or deleted before the failure.
    pub fn mutated(&self) -> bool {
        match self {
            ScaleError::Unrevisioned(_) => false,
            ScaleError::Create { created, .. } => *created > 0,
            ScaleError::Delete { deleted, .. } => *deleted > 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScaleOutcome {
    pub created: Vec<String>,
    pub deleted: Vec<String>,
}

impl ScaleOutcome {
    pub fn is_noop(&self) -> bool {
        self.created.is_empty() && self.deleted.is_empty()
    }
}

pub fn drain_priority(instance: &Instance) -> DrainPriority {
    if !instance.is_scheduled() {
        DrainPriority::Unscheduled
    } else if !instance.is_ready() {
        DrainPriority::NotReady
    } else {
        DrainPriority::Ready
    }
}

/// The first `count` instances in scale-down order.
pub fn select_victims<'a>(live: &[&'a Instance], count: usize) -> Vec<&'a Instance> {
    let ordered = order_for_drain(live.to_vec(), |i| {
        let created: DateTime<Utc> = i.metadata.creation_timestamp;
        (drain_priority(i), (created, i.name().to_string()))
    });
    ordered.into_iter().take(count).collect()
}

/// Stamp a new instance from the fleet's template.
pub fn build_instance(fleet: &Fleet) -> Instance {
    let uid = InstanceUid::new();
    let name = format!("{}-{}", fleet.metadata.name, uid.suffix(NAME_SUFFIX_LEN));

    let mut metadata = ObjectMeta::new(&fleet.metadata.namespace, name, uid);
    metadata.labels = fleet.spec.template.labels.clone();
    metadata
        .labels
        .insert(FLEET_NAME_LABEL.to_string(), fleet.metadata.name.clone());
    metadata.labels.insert(
        REVISION_LABEL.to_string(),
        fleet.current_revision().to_string(),
    );
    metadata.owner_references.push(fleet.owner_reference());

    Instance {
        metadata,
        spec: fleet.spec.template.spec.clone(),
        status: Default::default(),
    }
}

async fn create_one(
    platform: &dyn Platform,
    fleet: &Fleet,
) -> Result<Instance, (String, PlatformError)> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        let instance = build_instance(fleet);
        let name = instance.name().to_string();
        match platform.create_instance(instance).await {
            Ok(created) => return Ok(created),
            Err(PlatformError::AlreadyExists(_)) if attempt < MAX_NAME_ATTEMPTS => {
                debug!(instance = %name, "Instance name taken, picking another");
            }
            Err(e) => return Err((name, e)),
        }
    }
}

/// Create or delete instances until `live` matches `spec.replicas`.
///
/// `live` must only hold live instances at the current revision. The first
/// failed create or delete stops the pass.
#[instrument(
    skip_all,
    fields(fleet = %fleet.key(), desired = fleet.spec.replicas, live = live.len())
)]
pub async fn reconcile_replicas(
    platform: &dyn Platform,
    fleet: &Fleet,
    live: &[&Instance],
) -> Result<ScaleOutcome, ScaleError> {
    let desired = fleet.spec.replicas as usize;
    let mut outcome = ScaleOutcome::default();

    if live.len() < desired {
        if fleet.current_revision().is_empty() {
            return Err(ScaleError::Unrevisioned(fleet.key().to_string()));
        }

        let wanted = desired - live.len();
        for _ in 0..wanted {
            match create_one(platform, fleet).await {
                Ok(instance) => {
                    info!(
                        instance = %instance.name(),
                        revision = %fleet.current_revision(),
                        "Created instance"
                    );
                    outcome.created.push(instance.name().to_string());
                }
                Err((name, source)) => {
                    return Err(ScaleError::Create {
                        name,
                        created: outcome.created.len(),
                        wanted,
                        source,
                    });
                }
            }
        }
    } else if live.len() > desired {
        let wanted = live.len() - desired;
        for victim in select_victims(live, wanted) {
            let options = DeleteOptions::foreground().with_uid(victim.uid());
            match platform
                .delete_instance(&victim.metadata.namespace, victim.name(), &options)
                .await
            {
                Ok(()) => {
                    info!(instance = %victim.name(), "Deleted surplus instance");
                    outcome.deleted.push(victim.name().to_string());
                }
                Err(e) if e.is_not_found() => {
                    debug!(instance = %victim.name(), "Surplus instance already gone");
                }
                Err(source) => {
                    return Err(ScaleError::Delete {
                        name: victim.name().to_string(),
                        deleted: outcome.deleted.len(),
                        wanted,
                        source,
                    });
                }
            }
        }
    }

    Ok(outcome)
}
