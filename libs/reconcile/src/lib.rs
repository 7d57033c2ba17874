//! Reconciliation loop primitives.
//!
//! Helpers shared by level-triggered controllers that converge observed
//! state toward declared state:
//!
//! - **Revision**: opaque template version; compared, never interpreted.
//! - **Action**: what the work queue should do with a key after a pass.
//! - **Convergence**: how far observed replicas are from desired.
//! - **Drain ordering**: deterministic victim selection on scale-down.
//! - **Backoff**: exponential retry delays for failed passes.
//!
//! # Invariants
//!
//! - All helpers are pure; no I/O happens here
//! - Decisions are deterministic given the same inputs

use std::collections::BTreeMap;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// =============================================================================
// Revisions
// =============================================================================

/// Opaque template revision.
///
/// Minted by whoever owns the template whenever it changes meaningfully.
/// Controllers only compare revisions for equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Revision(String);

impl Revision {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty revision, which no minted revision ever equals.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for Revision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Revision {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for Revision {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A spec hash for deterministic template comparison.
///
/// Used by template owners to mint a [`Revision`] when the template changes.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpecHash(String);

impl SpecHash {
    /// Compute a spec hash from canonical JSON.
    pub fn from_json(json: &serde_json::Value) -> Self {
        let canonical = canonical_json(json);
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        let result = hasher.finalize();
        // 80 bits is plenty to tell template versions of one fleet apart
        Self(hex::encode(&result[..10]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<SpecHash> for Revision {
    fn from(hash: SpecHash) -> Self {
        Revision(hash.0)
    }
}

/// Produce canonical JSON (sorted keys, no extra whitespace).
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let sorted: BTreeMap<_, _> = map.iter().collect();
            let inner: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| {
                    let key = serde_json::Value::from(k.as_str());
                    format!("{key}:{}", canonical_json(v))
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        serde_json::Value::Array(arr) => {
            let inner: Vec<String> = arr.iter().map(canonical_json).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

// =============================================================================
// Convergence
// =============================================================================

/// Convergence status for a replicated resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvergenceStatus {
    /// Live count matches desired and every live replica is ready.
    Converged,

    /// Live count matches desired but some replicas are not ready yet.
    Converging,

    /// Live count differs from desired.
    Diverged,
}

impl ConvergenceStatus {
    pub fn assess(desired: u32, live: u32, ready: u32) -> Self {
        if live != desired {
            Self::Diverged
        } else if ready < live {
            Self::Converging
        } else {
            Self::Converged
        }
    }

    pub fn is_converged(&self) -> bool {
        matches!(self, Self::Converged)
    }
}

// =============================================================================
// Drain Ordering
// =============================================================================

/// Drain selection priority for replicas.
///
/// Lower priority values are drained first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DrainPriority {
    /// Replica has not been placed yet.
    Unscheduled = 0,

    /// Replica is placed but not ready.
    NotReady = 1,

    /// Replica is serving (drain last).
    Ready = 2,
}

/// Order replicas for draining.
///
/// Sorted by drain priority, then by the caller's tiebreak key. The sort is
/// stable, so equal keys keep their input order.
pub fn order_for_drain<T, K, F>(replicas: Vec<T>, key: F) -> Vec<T>
where
    K: Ord,
    F: Fn(&T) -> (DrainPriority, K),
{
    let mut keyed: Vec<_> = replicas.into_iter().map(|r| (key(&r), r)).collect();
    keyed.sort_by(|(a, _), (b, _)| a.cmp(b));
    keyed.into_iter().map(|(_, r)| r).collect()
}

// =============================================================================
// Requeue Directive
// =============================================================================

/// What the work queue should do with a key after a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Action {
    requeue_after: Option<Duration>,
}

impl Action {
    /// Reconcile again after `delay`.
    pub fn requeue(delay: Duration) -> Self {
        Self {
            requeue_after: Some(delay),
        }
    }

    /// Reconcile again as soon as a worker is free.
    pub fn requeue_now() -> Self {
        Self::requeue(Duration::ZERO)
    }

    /// Do nothing until a watch event (or resync) enqueues the key again.
    pub fn await_change() -> Self {
        Self {
            requeue_after: None,
        }
    }

    pub fn requeue_after(&self) -> Option<Duration> {
        self.requeue_after
    }
}

// =============================================================================
// Backoff
// =============================================================================

/// Exponential backoff configuration.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    /// Base delay for first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(200),
            max: Duration::from_secs(300),
            jitter: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.min(31) as i32;
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(exp);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter).max(0.0) as u64)
    }
}

/// Consecutive failure counts per key.
///
/// Retries are unbounded; the count only drives the backoff exponent and is
/// cleared on the first success.
#[derive(Debug, Clone, Default)]
pub struct RetryTracker {
    failures: BTreeMap<String, u32>,
}

impl RetryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return how many failed in a row before this one.
    pub fn record_failure(&mut self, key: &str) -> u32 {
        let count = self.failures.entry(key.to_string()).or_insert(0);
        let previous = *count;
        *count = count.saturating_add(1);
        previous
    }

    pub fn failures(&self, key: &str) -> u32 {
        self.failures.get(key).copied().unwrap_or(0)
    }

    /// Clear failure tracking for a key (on success).
    pub fn clear(&mut self, key: &str) {
        self.failures.remove(key);
    }
}

/// Default period after which every key is reconciled even without events.
pub const DEFAULT_RESYNC_INTERVAL: Duration = Duration::from_secs(5 * 60);

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_spec_hash_ignores_key_order() {
        let json1 = serde_json::json!({"b": 2, "a": {"y": [1, 2], "x": "v"}});
        let json2 = serde_json::json!({"a": {"x": "v", "y": [1, 2]}, "b": 2});

        assert_eq!(SpecHash::from_json(&json1), SpecHash::from_json(&json2));
    }

    #[test]
    fn test_spec_hash_changes_with_content() {
        let json1 = serde_json::json!({"image": "app:v1"});
        let json2 = serde_json::json!({"image": "app:v2"});

        let r1: Revision = SpecHash::from_json(&json1).into();
        let r2: Revision = SpecHash::from_json(&json2).into();
        assert_ne!(r1, r2);
        assert_eq!(r1.as_str().len(), 20);
    }

    #[rstest]
    #[case(3, 3, 3, ConvergenceStatus::Converged)]
    #[case(3, 3, 1, ConvergenceStatus::Converging)]
    #[case(3, 2, 2, ConvergenceStatus::Diverged)]
    #[case(0, 0, 0, ConvergenceStatus::Converged)]
    fn test_convergence(
        #[case] desired: u32,
        #[case] live: u32,
        #[case] ready: u32,
        #[case] expected: ConvergenceStatus,
    ) {
        assert_eq!(ConvergenceStatus::assess(desired, live, ready), expected);
    }

    #[test]
    fn test_order_for_drain() {
        let replicas = vec![
            ("ready-old", DrainPriority::Ready, 1),
            ("pending", DrainPriority::Unscheduled, 5),
            ("ready-new", DrainPriority::Ready, 9),
            ("not-ready", DrainPriority::NotReady, 3),
        ];

        let ordered = order_for_drain(replicas, |(_, p, age)| (*p, *age));
        let names: Vec<_> = ordered.iter().map(|(n, _, _)| *n).collect();
        assert_eq!(names, ["pending", "not-ready", "ready-old", "ready-new"]);
    }

    #[test]
    fn test_action() {
        assert_eq!(Action::await_change().requeue_after(), None);
        assert_eq!(Action::requeue_now().requeue_after(), Some(Duration::ZERO));
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_secs(5),
            jitter: 0.0,
        };

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(40), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_jitter_bounded() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(1000),
            max: Duration::from_secs(60),
            jitter: 0.25,
        };

        for _ in 0..50 {
            let d = policy.delay(0);
            assert!(d >= Duration::from_millis(750) && d <= Duration::from_millis(1250));
        }
    }

    #[test]
    fn test_retry_tracker() {
        let mut tracker = RetryTracker::new();

        assert_eq!(tracker.record_failure("default/web"), 0);
        assert_eq!(tracker.record_failure("default/web"), 1);
        assert_eq!(tracker.record_failure("default/web"), 2);
        assert_eq!(tracker.failures("default/web"), 3);
        assert_eq!(tracker.failures("default/api"), 0);

        tracker.clear("default/web");
        assert_eq!(tracker.failures("default/web"), 0);
    }

    fn priority(n: u8) -> DrainPriority {
        match n % 3 {
            0 => DrainPriority::Unscheduled,
            1 => DrainPriority::NotReady,
            _ => DrainPriority::Ready,
        }
    }

    proptest::proptest! {
        #[test]
        fn prop_drain_order_ignores_input_order(
            replicas in proptest::collection::vec((0u8..3, 0u32..100, "[a-z]{1,4}"), 0..20)
        ) {
            let key = |r: &(u8, u32, String)| (priority(r.0), (r.1, r.2.clone()));

            let forward = order_for_drain(replicas.clone(), key);
            let mut reversed_input = replicas;
            reversed_input.reverse();
            let backward = order_for_drain(reversed_input, key);

            let forward_keys: Vec<_> = forward.iter().map(key).collect();
            let backward_keys: Vec<_> = backward.iter().map(key).collect();
            proptest::prop_assert_eq!(forward_keys, backward_keys);
        }

        #[test]
        fn prop_backoff_never_exceeds_max(attempt in 0u32..100) {
            let policy = BackoffPolicy { jitter: 0.0, ..BackoffPolicy::default() };
            proptest::prop_assert!(policy.delay(attempt) <= policy.max);
        }
    }
}
