//! Controller runtime.
//!
//! Drives a [`FleetReconciler`] from the platform's watch stream:
//!
//! - **Router**: maps watch events to fleet keys. Instance events reach the
//!   owning fleet through the controller owner reference once
//!   [`Controller::owns_instances`] is registered.
//! - **Resync**: enqueues every fleet on an interval, so a lost event only
//!   delays convergence.
//! - **Workers**: a fixed pool draining the work queue, each pass bounded
//!   by a deadline. Failed keys are retried with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use fleet_reconcile::{BackoffPolicy, RetryTracker, DEFAULT_RESYNC_INTERVAL};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::controller::{FleetReconciler, ReconcileError};
use crate::model::{FleetKey, FLEET_KIND};
use crate::platform::{Platform, WatchEvent};
use crate::queue::WorkQueue;

/// Controller runtime configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of fleets reconciled in parallel.
    pub concurrency: usize,

    /// Deadline for a single reconcile pass.
    pub reconcile_timeout: Duration,

    /// Interval between full resyncs.
    pub resync_interval: Duration,

    /// Retry delays for failed passes.
    pub backoff: BackoffPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            reconcile_timeout: Duration::from_secs(30),
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Routes a watch event to the fleet that should be reconciled, if any.
pub fn route(event: &WatchEvent, owns_instances: bool) -> Option<FleetKey> {
    match event {
        WatchEvent::Fleet(key) => Some(key.clone()),
        WatchEvent::Instance {
            namespace, owner, ..
        } if owns_instances => owner
            .as_ref()
            .filter(|o| o.controller && o.kind == FLEET_KIND)
            .map(|o| FleetKey::new(namespace, &o.name)),
        WatchEvent::Instance { .. } => None,
    }
}

/// Shared state of the worker pool.
struct Workers {
    reconciler: Arc<FleetReconciler>,
    queue: Arc<WorkQueue<FleetKey>>,
    retries: Mutex<RetryTracker>,
    config: ControllerConfig,
}

impl Workers {
    async fn run_worker(self: Arc<Self>, worker_id: usize) {
        debug!(worker_id, "Worker started");

        while let Some(key) = self.queue.next().await {
            self.process(&key).await;
            self.queue.done(&key).await;
        }

        debug!(worker_id, "Worker stopped");
    }

    async fn process(&self, key: &FleetKey) {
        let timeout = self.config.reconcile_timeout;
        let result = match tokio::time::timeout(timeout, self.reconciler.reconcile(key)).await {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::Timeout(timeout)),
        };

        match result {
            Ok(action) => {
                self.retries.lock().await.clear(&key.to_string());
                match action.requeue_after() {
                    Some(delay) if delay.is_zero() => self.queue.add(key.clone()).await,
                    Some(delay) => {
                        let delay_ms = delay.as_millis() as u64;
                        debug!(fleet = %key, delay_ms, "Requeue requested");
                        self.queue.add_after(key.clone(), delay).await;
                    }
                    None => {}
                }
            }
            Err(e) => self.error_policy(key, e).await,
        }
    }

    /// Retry the key with backoff; unbounded, the delay caps out.
    async fn error_policy(&self, key: &FleetKey, e: ReconcileError) {
        let attempt = self.retries.lock().await.record_failure(&key.to_string());
        let delay = self.config.backoff.delay(attempt);

        if e.is_transient() {
            warn!(
                fleet = %key,
                error = %e,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                "Reconcile failed, will retry"
            );
        } else {
            error!(
                fleet = %key,
                error = %e,
                attempt,
                retry_in_ms = delay.as_millis() as u64,
                "Reconcile failed, will retry"
            );
        }

        self.queue.add_after(key.clone(), delay).await;
    }
}

/// Runs a fleet reconciler against the platform until shutdown.
pub struct Controller {
    reconciler: Arc<FleetReconciler>,
    platform: Arc<dyn Platform>,
    queue: Arc<WorkQueue<FleetKey>>,
    config: ControllerConfig,
    owns_instances: bool,
}

impl Controller {
    pub fn new(reconciler: FleetReconciler, config: ControllerConfig) -> Self {
        let platform = Arc::clone(reconciler.platform());
        Self {
            reconciler: Arc::new(reconciler),
            platform,
            queue: Arc::new(WorkQueue::new()),
            config,
            owns_instances: false,
        }
    }

    /// Reconcile a fleet whenever one of the instances it controls changes.
    #[must_use]
    pub fn owns_instances(mut self) -> Self {
        self.owns_instances = true;
        self
    }

    pub fn queue(&self) -> Arc<WorkQueue<FleetKey>> {
        Arc::clone(&self.queue)
    }

    /// Run until `shutdown` flips to true, then let in-flight passes finish.
    #[instrument(skip_all)]
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            concurrency = self.config.concurrency,
            reconcile_timeout_secs = self.config.reconcile_timeout.as_secs(),
            resync_interval_secs = self.config.resync_interval.as_secs(),
            owns_instances = self.owns_instances,
            "Starting fleet controller"
        );

        // Subscribe before the initial listing so nothing falls in between
        let events = self.platform.watch();
        enqueue_all(self.platform.as_ref(), &self.queue).await;

        let mut tasks: Vec<JoinHandle<()>> = Vec::new();

        tasks.push(tokio::spawn(run_router(
            events,
            Arc::clone(&self.platform),
            Arc::clone(&self.queue),
            self.owns_instances,
            shutdown.clone(),
        )));

        tasks.push(tokio::spawn(run_resync(
            Arc::clone(&self.platform),
            Arc::clone(&self.queue),
            self.config.resync_interval,
            shutdown.clone(),
        )));

        let workers = Arc::new(Workers {
            reconciler: Arc::clone(&self.reconciler),
            queue: Arc::clone(&self.queue),
            retries: Mutex::new(RetryTracker::new()),
            config: self.config.clone(),
        });
        for worker_id in 0..self.config.concurrency.max(1) {
            tasks.push(tokio::spawn(Arc::clone(&workers).run_worker(worker_id)));
        }

        while !*shutdown.borrow() {
            if shutdown.changed().await.is_err() {
                break;
            }
        }

        info!("Fleet controller shutting down");
        self.queue.shutdown().await;

        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Controller task panicked");
            }
        }

        info!("Fleet controller stopped");
    }
}

async fn enqueue_all(platform: &dyn Platform, queue: &WorkQueue<FleetKey>) {
    match platform.list_fleets().await {
        Ok(fleets) => {
            debug!(fleet_count = fleets.len(), "Enqueueing all fleets");
            for fleet in fleets {
                queue.add(fleet.key()).await;
            }
        }
        Err(e) => warn!(error = %e, "Failed to list fleets, will retry on next resync"),
    }
}

async fn run_router(
    mut events: broadcast::Receiver<WatchEvent>,
    platform: Arc<dyn Platform>,
    queue: Arc<WorkQueue<FleetKey>>,
    owns_instances: bool,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    if let Some(key) = route(&event, owns_instances) {
                        queue.add(key).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Watch stream lagged, resyncing all fleets");
                    enqueue_all(platform.as_ref(), &queue).await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    warn!("Watch stream closed");
                    break;
                }
            },
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

async fn run_resync(
    platform: Arc<dyn Platform>,
    queue: Arc<WorkQueue<FleetKey>>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    // The initial listing already covered the first tick
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => {
                enqueue_all(platform.as_ref(), &queue).await;
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OwnerReference;
    use fleet_id::FleetUid;
    use rstest::rstest;

    fn owner(kind: &str, controller: bool) -> OwnerReference {
        OwnerReference {
            kind: kind.to_string(),
            name: "web".to_string(),
            uid: FleetUid::new(),
            controller,
        }
    }

    #[rstest]
    #[case::controlled(Some(owner(FLEET_KIND, true)), true, true)]
    #[case::not_registered(Some(owner(FLEET_KIND, true)), false, false)]
    #[case::not_controller(Some(owner(FLEET_KIND, false)), true, false)]
    #[case::other_kind(Some(owner("Job", true)), true, false)]
    #[case::orphan(None, true, false)]
    fn test_route_instance_events(
        #[case] owner: Option<OwnerReference>,
        #[case] owns_instances: bool,
        #[case] routed: bool,
    ) {
        let event = WatchEvent::Instance {
            namespace: "default".to_string(),
            name: "web-abcde".to_string(),
            owner,
        };

        let expected = routed.then(|| FleetKey::new("default", "web"));
        assert_eq!(route(&event, owns_instances), expected);
    }

    #[test]
    fn test_route_fleet_events() {
        let key = FleetKey::new("default", "web");
        assert_eq!(route(&WatchEvent::Fleet(key.clone()), false), Some(key));
    }
}
