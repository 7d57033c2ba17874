//! Status reporter.
//!
//! Recomputes the fleet's status from its instances and writes it only when
//! something changed, so a converged fleet costs no writes.

use chrono::{DateTime, Utc};
use fleet_reconcile::ConvergenceStatus;
use tracing::debug;

use super::scaler::ScaleError;
use crate::model::{conditions, Condition, ConditionStatus, Fleet, FleetStatus, Instance};
use crate::platform::{Platform, PlatformError, PlatformResult};

/// Compute the status `fleet` should report.
///
/// `replicas` counts live instances at the current revision; `ready_replicas`
/// counts ready live instances at any revision. Instances with a deletion
/// timestamp are terminating and count toward neither, even while still
/// Running and Ready. A scale failure sets the `ReplicaFailure` condition, a
/// clean pass clears it.
pub fn compute_status(
    fleet: &Fleet,
    instances: &[Instance],
    scale_failure: Option<&ScaleError>,
    now: DateTime<Utc>,
) -> FleetStatus {
    let current = fleet.current_revision();
    let live = instances.iter().filter(|i| i.is_live());

    let mut replicas = 0u32;
    let mut ready_replicas = 0u32;
    for instance in live {
        if &instance.revision() == current {
            replicas += 1;
        }
        if instance.is_ready() {
            ready_replicas += 1;
        }
    }

    let mut status = FleetStatus {
        current_revision: current.clone(),
        replicas,
        ready_replicas,
        observed_generation: fleet.metadata.generation,
        conditions: fleet
            .status
            .conditions
            .iter()
            .filter(|c| c.type_ != conditions::REPLICA_FAILURE)
            .cloned()
            .collect(),
    };

    if let Some(failure) = scale_failure {
        let reason = match failure {
            ScaleError::Delete { .. } => conditions::REASON_DELETE_FAILED,
            _ => conditions::REASON_CREATE_FAILED,
        };
        let message = failure.to_string();

        // Keep the transition time while the failure persists
        let condition = match fleet.status.condition(conditions::REPLICA_FAILURE) {
            Some(existing)
                if existing.status == ConditionStatus::True
                    && existing.reason == reason
                    && existing.message == message =>
            {
                existing.clone()
            }
            Some(existing) if existing.status == ConditionStatus::True => Condition {
                reason: reason.to_string(),
                message,
                ..existing.clone()
            },
            _ => Condition::new(
                conditions::REPLICA_FAILURE,
                ConditionStatus::True,
                reason,
                message,
                now,
            ),
        };
        status.conditions.push(condition);
    }

    status
}

/// Write the computed status if it differs from what the fleet reports.
///
/// On a version conflict the fleet is re-read and the write retried once.
/// Returns whether a write happened.
pub async fn report_status(
    platform: &dyn Platform,
    fleet: &Fleet,
    instances: &[Instance],
    scale_failure: Option<&ScaleError>,
) -> PlatformResult<bool> {
    let now = Utc::now();
    let status = compute_status(fleet, instances, scale_failure, now);
    let convergence =
        ConvergenceStatus::assess(fleet.spec.replicas, status.replicas, status.ready_replicas);
    if status == fleet.status {
        debug!(fleet = %fleet.key(), ?convergence, "Status unchanged");
        return Ok(false);
    }
    debug!(
        fleet = %fleet.key(),
        replicas = status.replicas,
        ready_replicas = status.ready_replicas,
        ?convergence,
        "Writing status"
    );

    let mut updated = fleet.clone();
    updated.status = status;
    match platform.update_fleet_status(&updated).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_conflict() => {
            debug!(fleet = %fleet.key(), "Status write conflicted, retrying once");

            let fresh = match platform.get_fleet(&fleet.key()).await {
                Ok(fresh) => fresh,
                Err(e) if e.is_not_found() => return Ok(false),
                Err(e) => return Err(e),
            };
            if fresh.uid() != fleet.uid() {
                return Err(PlatformError::Conflict(format!(
                    "fleet {} was recreated",
                    fleet.key()
                )));
            }

            let status = compute_status(&fresh, instances, scale_failure, now);
            if status == fresh.status {
                return Ok(false);
            }
            let mut retry = fresh;
            retry.status = status;
            platform.update_fleet_status(&retry).await.map(|_| true)
        }
        Err(e) => Err(e),
    }
}
