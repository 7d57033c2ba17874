//! Fleet lifecycle and the teardown finalizer.
//!
//! ```text
//!   Missing        (fleet gone)                      -> nothing to do
//!   Uninitialized  (live, no finalizer)              -> add finalizer, requeue
//!   Active         (live, finalizer present)         -> recover, scale, report
//!   Terminating    (deleting, finalizer present)     -> teardown, remove finalizer
//!   Finalized      (deleting, finalizer removed)     -> nothing to do
//! ```
//!
//! The finalizer is on the fleet before any instance is created for it and
//! stays there until teardown of external resources has succeeded.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::model::{Fleet, FleetKey, TEARDOWN_FINALIZER};
use crate::platform::{Platform, PlatformError, PlatformResult};

/// Where a fleet is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FleetLifecycle {
    Missing,
    Uninitialized,
    Active,
    Terminating,
    Finalized,
}

impl FleetLifecycle {
    pub fn of(fleet: Option<&Fleet>) -> Self {
        let Some(fleet) = fleet else {
            return FleetLifecycle::Missing;
        };

        let guarded = fleet.metadata.has_finalizer(TEARDOWN_FINALIZER);
        match (fleet.metadata.is_deleting(), guarded) {
            (false, false) => FleetLifecycle::Uninitialized,
            (false, true) => FleetLifecycle::Active,
            (true, true) => FleetLifecycle::Terminating,
            (true, false) => FleetLifecycle::Finalized,
        }
    }
}

/// Apply `mutate` and persist, re-reading and retrying once on conflict.
///
/// `mutate` returns false when the fleet already has the wanted shape, in
/// which case nothing is written.
async fn update_with_retry<F>(
    platform: &dyn Platform,
    fleet: &Fleet,
    mutate: F,
) -> PlatformResult<Option<Fleet>>
where
    F: Fn(&mut Fleet) -> bool,
{
    let mut desired = fleet.clone();
    if !mutate(&mut desired) {
        return Ok(Some(desired));
    }

    match platform.update_fleet(&desired).await {
        Ok(updated) => Ok(Some(updated)),
        Err(e) if e.is_conflict() => {
            debug!(fleet = %fleet.key(), "Fleet changed underneath us, retrying once");

            let mut fresh = match platform.get_fleet(&fleet.key()).await {
                Ok(fresh) => fresh,
                Err(e) if e.is_not_found() => return Ok(None),
                Err(e) => return Err(e),
            };
            if fresh.uid() != fleet.uid() {
                return Err(PlatformError::Conflict(format!(
                    "fleet {} was recreated",
                    fleet.key()
                )));
            }
            if !mutate(&mut fresh) {
                return Ok(Some(fresh));
            }
            platform.update_fleet(&fresh).await.map(Some)
        }
        Err(e) => Err(e),
    }
}

/// Guard the fleet with the teardown finalizer.
///
/// Returns the persisted fleet, or `None` if it disappeared meanwhile.
pub async fn add_finalizer(
    platform: &dyn Platform,
    fleet: &Fleet,
) -> PlatformResult<Option<Fleet>> {
    update_with_retry(platform, fleet, |f| {
        !f.metadata.is_deleting() && f.metadata.add_finalizer(TEARDOWN_FINALIZER)
    })
    .await
}

/// Release the fleet for deletion. The platform removes it once no
/// finalizers remain.
pub async fn remove_finalizer(platform: &dyn Platform, fleet: &Fleet) -> PlatformResult<()> {
    update_with_retry(platform, fleet, |f| {
        f.metadata.remove_finalizer(TEARDOWN_FINALIZER)
    })
    .await
    .map(|_| ())
}

// =============================================================================
// External resource teardown
// =============================================================================

/// Owner of the external resources (packaged releases) installed on behalf
/// of a fleet.
#[async_trait]
pub trait ReleaseManager: Send + Sync {
    /// Remove everything installed for `fleet`. Must be idempotent:
    /// uninstalling something already gone succeeds.
    async fn uninstall(&self, fleet: &Fleet) -> Result<()>;
}

/// In-process release manager for development and testing.
pub struct MemoryReleases {
    installed: Mutex<BTreeSet<FleetKey>>,
    uninstall_calls: AtomicU64,
    fail_uninstalls: AtomicBool,
}

impl MemoryReleases {
    pub fn new() -> Self {
        Self {
            installed: Mutex::new(BTreeSet::new()),
            uninstall_calls: AtomicU64::new(0),
            fail_uninstalls: AtomicBool::new(false),
        }
    }

    /// Create a release manager that fails all uninstalls.
    pub fn failing() -> Self {
        let releases = Self::new();
        releases.set_failing(true);
        releases
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_uninstalls.store(failing, Ordering::SeqCst);
    }

    pub async fn install(&self, key: FleetKey) {
        self.installed.lock().await.insert(key);
    }

    pub async fn is_installed(&self, key: &FleetKey) -> bool {
        self.installed.lock().await.contains(key)
    }

    pub fn uninstall_calls(&self) -> u64 {
        self.uninstall_calls.load(Ordering::SeqCst)
    }
}

impl Default for MemoryReleases {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ReleaseManager for MemoryReleases {
    async fn uninstall(&self, fleet: &Fleet) -> Result<()> {
        self.uninstall_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_uninstalls.load(Ordering::SeqCst) {
            anyhow::bail!("release backend unavailable");
        }

        let key = fleet.key();
        if self.installed.lock().await.remove(&key) {
            info!(fleet = %key, "Releases uninstalled");
        } else {
            warn!(fleet = %key, "No releases installed, nothing to uninstall");
        }
        Ok(())
    }
}
