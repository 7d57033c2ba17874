//! Fleet reconciler.
//!
//! One pass of the control loop for one fleet:
//!
//! 1. Read the fleet and the instances it controls
//! 2. Drive the finalizer lifecycle (adding it, or tearing down on deletion)
//! 3. Replace outdated and stuck pending instances
//! 4. Create or delete instances to match the replica count
//! 5. Report status
//!
//! Every decision is re-derived from what the platform reports right now.
//! Nothing is remembered between passes, so a missed or replayed event is
//! harmless.

pub mod lifecycle;
pub mod recovery;
pub mod scaler;
pub mod snapshot;
pub mod status;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use fleet_events::{FleetEvent, InvolvedObject, ObjectKind, Reason};
use fleet_id::ReconcileId;
use fleet_reconcile::Action;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::model::{Fleet, FleetKey};
use crate::platform::{Platform, PlatformError};
use lifecycle::{FleetLifecycle, ReleaseManager};
use recovery::STUCK_PENDING_THRESHOLD;
use scaler::ScaleError;
use snapshot::{load_snapshot, Snapshot, SnapshotError};

/// Component name events are reported under.
pub const REPORTER: &str = "fleet-controller";

/// Delay before retrying after some recovery deletes failed.
pub const RECOVERY_RETRY_DELAY: Duration = Duration::from_secs(15);

/// Errors that fail a reconcile pass. The key is retried with backoff.
#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("failed to read fleet state: {0}")]
    TransientRead(#[source] PlatformError),

    #[error("failed to write fleet state: {0}")]
    TransientWrite(#[source] PlatformError),

    /// A version-checked write lost twice in a row.
    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("failed to scale fleet: {0}")]
    FatalScale(#[from] ScaleError),

    #[error("teardown failed: {0:#}")]
    Teardown(anyhow::Error),

    #[error("reconcile timed out after {0:?}")]
    Timeout(Duration),
}

impl ReconcileError {
    /// Failures expected to clear up on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ReconcileError::TransientRead(_)
                | ReconcileError::TransientWrite(_)
                | ReconcileError::Conflict(_)
                | ReconcileError::Timeout(_)
        )
    }
}

fn write_error(e: PlatformError) -> ReconcileError {
    match e {
        PlatformError::Conflict(msg) => ReconcileError::Conflict(msg),
        other => ReconcileError::TransientWrite(other),
    }
}

/// Statistics from one reconcile pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileStats {
    pub created: usize,
    pub deleted: usize,
    pub recovered: usize,
    pub recovery_failures: usize,
    pub status_written: bool,
}

impl ReconcileStats {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }

    /// Whether instances were created or deleted.
    pub fn mutated_instances(&self) -> bool {
        self.created + self.deleted + self.recovered > 0
    }
}

/// Tunables for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerSettings {
    pub stuck_pending_threshold: Duration,
    pub reporter: String,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        Self {
            stuck_pending_threshold: STUCK_PENDING_THRESHOLD,
            reporter: REPORTER.to_string(),
        }
    }
}

/// Converges fleets toward their declared state.
pub struct FleetReconciler {
    platform: Arc<dyn Platform>,
    releases: Arc<dyn ReleaseManager>,
    settings: ReconcilerSettings,
}

impl FleetReconciler {
    pub fn new(platform: Arc<dyn Platform>, releases: Arc<dyn ReleaseManager>) -> Self {
        Self {
            platform,
            releases,
            settings: ReconcilerSettings::default(),
        }
    }

    #[must_use]
    pub fn with_settings(mut self, settings: ReconcilerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn platform(&self) -> &Arc<dyn Platform> {
        &self.platform
    }

    /// Run one reconcile pass for `key`.
    ///
    /// A fleet that no longer exists is not an error.
    #[instrument(skip_all, fields(fleet = %key, reconcile_id = tracing::field::Empty))]
    pub async fn reconcile(&self, key: &FleetKey) -> Result<Action, ReconcileError> {
        let id = ReconcileId::new();
        tracing::Span::current().record("reconcile_id", tracing::field::display(id));

        let snapshot = match load_snapshot(self.platform.as_ref(), key).await {
            Ok(snapshot) => snapshot,
            Err(SnapshotError::NotFound(_)) => {
                debug!("Fleet not found, nothing to do");
                return Ok(Action::await_change());
            }
            Err(SnapshotError::Read(e)) => return Err(ReconcileError::TransientRead(e)),
        };

        match FleetLifecycle::of(Some(&snapshot.fleet)) {
            FleetLifecycle::Missing | FleetLifecycle::Finalized => {
                debug!("Fleet is being removed, nothing to do");
                Ok(Action::await_change())
            }
            FleetLifecycle::Uninitialized => self.initialize(&snapshot.fleet, id).await,
            FleetLifecycle::Terminating => self.finalize(&snapshot.fleet, id).await,
            FleetLifecycle::Active => self.converge(snapshot, id).await,
        }
    }

    async fn initialize(&self, fleet: &Fleet, id: ReconcileId) -> Result<Action, ReconcileError> {
        match lifecycle::add_finalizer(self.platform.as_ref(), fleet).await {
            Ok(Some(_)) => {
                info!("Added teardown finalizer");
                self.emit(fleet, Reason::FinalizerAdded, "Teardown finalizer added", id)
                    .await;
                Ok(Action::requeue_now())
            }
            Ok(None) => Ok(Action::await_change()),
            Err(e) => Err(write_error(e)),
        }
    }

    async fn finalize(&self, fleet: &Fleet, id: ReconcileId) -> Result<Action, ReconcileError> {
        let teardown = self
            .releases
            .uninstall(fleet)
            .await
            .with_context(|| format!("failed to uninstall releases for fleet {}", fleet.key()));

        if let Err(e) = teardown {
            let message = format!("{e:#}");
            warn!(error = %message, "Teardown failed, keeping finalizer");
            self.emit(fleet, Reason::TeardownFailed, message, id).await;
            return Err(ReconcileError::Teardown(e));
        }

        self.emit(fleet, Reason::TeardownComplete, "External resources removed", id)
            .await;
        lifecycle::remove_finalizer(self.platform.as_ref(), fleet)
            .await
            .map_err(write_error)?;

        info!("Teardown complete, finalizer removed");
        Ok(Action::await_change())
    }

    async fn converge(
        &self,
        snapshot: Snapshot,
        id: ReconcileId,
    ) -> Result<Action, ReconcileError> {
        let fleet = &snapshot.fleet;
        let mut stats = ReconcileStats::default();

        // Recovery
        let plan = recovery::analyze(
            &snapshot.instances,
            fleet.current_revision(),
            Utc::now(),
            self.settings.stuck_pending_threshold,
        );
        let mut requeue_after = plan.recheck_after;
        let mut replaced = HashSet::new();

        if !plan.is_empty() {
            let outcome =
                recovery::delete_instances(self.platform.as_ref(), &plan.instances()).await;

            for candidate in &plan.candidates {
                let name = candidate.instance.name();
                if !outcome.deleted.iter().any(|d| d == name) {
                    continue;
                }
                replaced.insert(candidate.instance.uid());

                let (reason, message) = if candidate.outdated {
                    (
                        Reason::OutdatedInstanceDeleted,
                        format!(
                            "Deleted pending instance {name} at outdated revision {}",
                            candidate.instance.revision()
                        ),
                    )
                } else {
                    (
                        Reason::StuckInstanceDeleted,
                        format!("Deleted instance {name} stuck pending and unschedulable"),
                    )
                };
                self.emit(fleet, reason, message, id).await;
            }

            stats.recovered = outcome.deleted.len();
            stats.recovery_failures = outcome.failures.len();

            if !outcome.is_complete() {
                let summary = outcome.failure_summary();
                warn!(failures = outcome.failures.len(), error = %summary, "Recovery incomplete");
                self.emit(fleet, Reason::RecoveryFailed, summary, id).await;
                requeue_after = Some(
                    requeue_after.map_or(RECOVERY_RETRY_DELAY, |d| d.min(RECOVERY_RETRY_DELAY)),
                );
            }
        }

        // Scaling
        let live: Vec<_> = snapshot
            .live_at_current_revision()
            .into_iter()
            .filter(|i| !replaced.contains(&i.uid()))
            .collect();

        let scaled = scaler::reconcile_replicas(self.platform.as_ref(), fleet, &live).await;
        let scale_failure = match scaled {
            Ok(outcome) => {
                for name in &outcome.created {
                    let message = format!("Created instance {name}");
                    self.emit(fleet, Reason::InstanceCreated, message, id).await;
                }
                for name in &outcome.deleted {
                    let message = format!("Deleted surplus instance {name}");
                    self.emit(fleet, Reason::InstanceDeleted, message, id).await;
                }
                stats.created = outcome.created.len();
                stats.deleted = outcome.deleted.len();
                None
            }
            Err(e) => {
                warn!(error = %e, "Scaling failed");
                self.emit(fleet, Reason::ScaleFailed, e.to_string(), id).await;
                Some(e)
            }
        };

        // Status
        let mutated = stats.mutated_instances()
            || scale_failure.as_ref().is_some_and(ScaleError::mutated);
        let written = self
            .report(&snapshot, mutated, scale_failure.as_ref())
            .await;

        if let Some(e) = scale_failure {
            if let Err(status_error) = written {
                warn!(error = %status_error, "Failed to report scale failure in status");
            }
            return Err(ReconcileError::FatalScale(e));
        }
        stats.status_written = written?;

        if !stats.is_noop() {
            info!(
                created = stats.created,
                deleted = stats.deleted,
                recovered = stats.recovered,
                recovery_failures = stats.recovery_failures,
                status_written = stats.status_written,
                "Reconcile pass complete"
            );
        }

        Ok(match requeue_after {
            Some(delay) => Action::requeue(delay),
            None => Action::await_change(),
        })
    }

    /// Write status, re-reading instances first if this pass changed them.
    async fn report(
        &self,
        snapshot: &Snapshot,
        mutated: bool,
        scale_failure: Option<&ScaleError>,
    ) -> Result<bool, ReconcileError> {
        let fresh;
        let snapshot = if mutated {
            fresh = match load_snapshot(self.platform.as_ref(), &snapshot.fleet.key()).await {
                Ok(fresh) => fresh,
                Err(SnapshotError::NotFound(_)) => return Ok(false),
                Err(SnapshotError::Read(e)) => return Err(ReconcileError::TransientRead(e)),
            };
            &fresh
        } else {
            snapshot
        };

        status::report_status(
            self.platform.as_ref(),
            &snapshot.fleet,
            &snapshot.instances,
            scale_failure,
        )
        .await
        .map_err(write_error)
    }

    /// Record an event against the fleet. Failures are logged and dropped.
    async fn emit(
        &self,
        fleet: &Fleet,
        reason: Reason,
        message: impl Into<String>,
        id: ReconcileId,
    ) {
        let involved = InvolvedObject {
            kind: ObjectKind::Fleet,
            namespace: fleet.metadata.namespace.clone(),
            name: fleet.metadata.name.clone(),
            uid: fleet.uid().to_string(),
        };
        let event = FleetEvent::new(involved, reason, message, &self.settings.reporter)
            .with_reconcile_id(id);

        if let Err(e) = self.platform.record_event(event).await {
            debug!(reason = %reason, error = %e, "Failed to record event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{conditions, TEARDOWN_FINALIZER};
    use crate::platform::memory::{Fault, FleetManifest, MemoryPlatform, Operation};
    use lifecycle::MemoryReleases;

    fn manifest(replicas: u32) -> FleetManifest {
        FleetManifest {
            namespace: "default".to_string(),
            name: "web".to_string(),
            replicas,
            template: Default::default(),
            labels: Default::default(),
        }
    }

    fn reconciler(
        platform: &Arc<MemoryPlatform>,
        releases: &Arc<MemoryReleases>,
    ) -> FleetReconciler {
        FleetReconciler::new(platform.clone(), releases.clone())
    }

    #[test]
    fn test_error_classification() {
        let unavailable = PlatformError::Unavailable("x".into());
        assert!(ReconcileError::TransientRead(unavailable).is_transient());
        assert!(ReconcileError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(!ReconcileError::Teardown(anyhow::anyhow!("boom")).is_transient());
        assert!(matches!(
            write_error(PlatformError::Conflict("stale".into())),
            ReconcileError::Conflict(_)
        ));
    }

    #[test]
    fn test_teardown_error_shows_cause_chain() {
        let err = ReconcileError::Teardown(
            anyhow::anyhow!("release backend unavailable").context("failed to uninstall releases"),
        );
        assert_eq!(
            err.to_string(),
            "teardown failed: failed to uninstall releases: release backend unavailable"
        );
    }

    #[tokio::test]
    async fn test_first_pass_only_adds_finalizer() {
        let platform = Arc::new(MemoryPlatform::new());
        let releases = Arc::new(MemoryReleases::new());
        let fleet = platform.apply_fleet(manifest(3)).await;

        let action = reconciler(&platform, &releases).reconcile(&fleet.key()).await.unwrap();

        assert_eq!(action, Action::requeue_now());
        assert!(platform.calls_of(Operation::CreateInstance).await.is_empty());
        let fleet = platform.fleet(&fleet.key()).await.unwrap();
        assert!(fleet.metadata.has_finalizer(TEARDOWN_FINALIZER));
        assert_eq!(platform.events().await[0].reason, Reason::FinalizerAdded);
    }

    #[tokio::test]
    async fn test_missing_fleet_is_noop() {
        let platform = Arc::new(MemoryPlatform::new());
        let releases = Arc::new(MemoryReleases::new());

        let action = reconciler(&platform, &releases)
            .reconcile(&FleetKey::new("default", "gone"))
            .await
            .unwrap();
        assert_eq!(action, Action::await_change());
        assert_eq!(platform.mutation_count().await, 0);
    }

    #[tokio::test]
    async fn test_read_failure_is_transient_and_mutates_nothing() {
        let platform = Arc::new(MemoryPlatform::new());
        let releases = Arc::new(MemoryReleases::new());
        let fleet = platform.apply_fleet(manifest(3)).await;
        platform
            .inject(Fault::new(
                Operation::ListInstances,
                PlatformError::Unavailable("etcd".into()),
            ))
            .await;

        let err = reconciler(&platform, &releases)
            .reconcile(&fleet.key())
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::TransientRead(_)));
        assert_eq!(platform.mutation_count().await, 0);
    }

    #[tokio::test]
    async fn test_scale_failure_sets_condition_and_warns() {
        let platform = Arc::new(MemoryPlatform::new());
        let releases = Arc::new(MemoryReleases::new());
        let fleet = platform.apply_fleet(manifest(2)).await;
        let reconciler = reconciler(&platform, &releases);
        reconciler.reconcile(&fleet.key()).await.unwrap();

        platform
            .inject(Fault::new(
                Operation::CreateInstance,
                PlatformError::Rejected("quota exceeded".into()),
            ))
            .await;

        let err = reconciler.reconcile(&fleet.key()).await.unwrap_err();
        assert!(matches!(err, ReconcileError::FatalScale(_)));

        let fleet = platform.fleet(&fleet.key()).await.unwrap();
        let condition = fleet.status.condition(conditions::REPLICA_FAILURE).unwrap();
        assert!(condition.message.contains("quota exceeded"));
        assert!(platform
            .events()
            .await
            .iter()
            .any(|e| e.reason == Reason::ScaleFailed && e.is_warning()));

        platform.clear_faults().await;
        reconciler.reconcile(&fleet.key()).await.unwrap();
        let fleet = platform.fleet(&fleet.key()).await.unwrap();
        assert!(fleet.status.condition(conditions::REPLICA_FAILURE).is_none());
        assert_eq!(fleet.status.replicas, 2);
    }

    #[tokio::test]
    async fn test_event_write_failure_is_ignored() {
        let platform = Arc::new(MemoryPlatform::new());
        let releases = Arc::new(MemoryReleases::new());
        let fleet = platform.apply_fleet(manifest(1)).await;
        platform
            .inject(Fault::new(
                Operation::RecordEvent,
                PlatformError::Unavailable("events".into()),
            ))
            .await;

        let reconciler = reconciler(&platform, &releases);
        reconciler.reconcile(&fleet.key()).await.unwrap();
        reconciler.reconcile(&fleet.key()).await.unwrap();

        assert_eq!(platform.instances("default").await.len(), 1);
        assert!(platform.events().await.is_empty());
    }
}
