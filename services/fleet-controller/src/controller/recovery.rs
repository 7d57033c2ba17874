//! Recovery of pending instances that will never start.
//!
//! Two independent predicates select instances for replacement:
//!
//! - **Outdated**: still Pending but created from an old revision. Deleting
//!   it lets the scaler recreate it from the current template.
//! - **Stuck**: Pending for longer than the threshold with the scheduler
//!   reporting it unschedulable.
//!
//! Analysis is pure; `now` is passed in. Execution is best-effort: every
//! selected instance is attempted and failures are returned as a list.

use std::collections::HashSet;
use std::time::Duration;

use chrono::{DateTime, Utc};
use fleet_id::InstanceUid;
use fleet_reconcile::Revision;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::{Instance, Phase};
use crate::platform::{DeleteOptions, Platform, PlatformError};

/// How long an unschedulable instance may stay pending before it is
/// replaced.
pub const STUCK_PENDING_THRESHOLD: Duration = Duration::from_secs(5 * 60);

/// When the instance started waiting: its start time if the platform set
/// one, else its creation time.
pub fn pending_since(instance: &Instance) -> DateTime<Utc> {
    instance
        .status
        .start_time
        .unwrap_or(instance.metadata.creation_timestamp)
}

/// Pending and labelled with a revision other than `current`.
pub fn is_outdated_pending(instance: &Instance, current: &Revision) -> bool {
    instance.phase() == Phase::Pending && &instance.revision() != current
}

/// Pending for longer than `threshold` and explicitly unschedulable.
pub fn is_stuck_pending(instance: &Instance, now: DateTime<Utc>, threshold: Duration) -> bool {
    if instance.phase() != Phase::Pending || !instance.is_unschedulable() {
        return false;
    }

    // A start time in the future reads as not stuck
    match (now - pending_since(instance)).to_std() {
        Ok(age) => age > threshold,
        Err(_) => false,
    }
}

/// An instance selected for replacement.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryCandidate<'a> {
    pub instance: &'a Instance,
    pub outdated: bool,
    pub stuck: bool,
}

#[derive(Debug, Default)]
pub struct RecoveryPlan<'a> {
    /// Deduplicated by UID, in input order.
    pub candidates: Vec<RecoveryCandidate<'a>>,

    /// Time until the next unschedulable instance crosses the threshold.
    pub recheck_after: Option<Duration>,
}

impl RecoveryPlan<'_> {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn instances(&self) -> Vec<&Instance> {
        self.candidates.iter().map(|c| c.instance).collect()
    }
}

/// Select the instances to replace.
pub fn analyze<'a>(
    instances: &'a [Instance],
    current: &Revision,
    now: DateTime<Utc>,
    threshold: Duration,
) -> RecoveryPlan<'a> {
    let mut plan = RecoveryPlan::default();
    let mut seen: HashSet<InstanceUid> = HashSet::new();

    for instance in instances {
        // Already on its way out
        if instance.metadata.is_deleting() {
            continue;
        }

        let outdated = is_outdated_pending(instance, current);
        let stuck = is_stuck_pending(instance, now, threshold);

        if outdated || stuck {
            if seen.insert(instance.uid()) {
                plan.candidates.push(RecoveryCandidate {
                    instance,
                    outdated,
                    stuck,
                });
            }
            continue;
        }

        if instance.phase() == Phase::Pending && instance.is_unschedulable() {
            let waited = (now - pending_since(instance)).to_std().unwrap_or_default();
            // Land just past the threshold
            let remaining = threshold.saturating_sub(waited) + Duration::from_secs(1);
            plan.recheck_after = Some(match plan.recheck_after {
                Some(existing) => existing.min(remaining),
                None => remaining,
            });
        }
    }

    plan
}

// =============================================================================
// Execution
// =============================================================================

#[derive(Debug, Error)]
#[error("failed to delete instance {name}: {error}")]
pub struct InstanceDeleteFailure {
    pub name: String,
    pub uid: InstanceUid,
    #[source]
    pub error: PlatformError,
}

/// Result of a best-effort batch delete.
#[derive(Debug, Default)]
pub struct RecoveryOutcome {
    pub deleted: Vec<String>,
    pub failures: Vec<InstanceDeleteFailure>,
}

impl RecoveryOutcome {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    /// One line per failure, for logs and events.
    pub fn failure_summary(&self) -> String {
        self.failures
            .iter()
            .map(|f| f.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

/// Delete every instance, continuing past failures.
///
/// An instance that is already gone counts as deleted. The UID precondition
/// keeps a same-named replacement from being removed.
pub async fn delete_instances(platform: &dyn Platform, instances: &[&Instance]) -> RecoveryOutcome {
    let mut outcome = RecoveryOutcome::default();

    for instance in instances {
        let options = DeleteOptions::default().with_uid(instance.uid());
        match platform
            .delete_instance(&instance.metadata.namespace, instance.name(), &options)
            .await
        {
            Ok(()) => {
                info!(instance = %instance.name(), "Deleted instance for recovery");
                outcome.deleted.push(instance.name().to_string());
            }
            Err(e) if e.is_not_found() => {
                debug!(instance = %instance.name(), "Instance already gone");
                outcome.deleted.push(instance.name().to_string());
            }
            Err(e) => {
                warn!(instance = %instance.name(), error = %e, "Failed to delete instance");
                outcome.failures.push(InstanceDeleteFailure {
                    name: instance.name().to_string(),
                    uid: instance.uid(),
                    error: e,
                });
            }
        }
    }

    outcome
}
