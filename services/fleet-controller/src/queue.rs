//! Deduplicating work queue.
//!
//! - A key is queued at most once, however often it is added.
//! - A key is handed to at most one worker at a time. Adding a key that is
//!   being processed marks it dirty; it is queued again once the worker
//!   calls [`WorkQueue::done`].
//! - A key has at most one delayed add pending; the earliest deadline wins.
//! - After [`WorkQueue::shutdown`], [`WorkQueue::next`] returns `None`,
//!   pending delayed adds are cancelled and further adds are ignored.

use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::task::AbortHandle;
use tokio::time::Instant;

struct Delayed {
    deadline: Instant,
    timer: AbortHandle,
}

struct QueueState<K> {
    queue: VecDeque<K>,
    queued: HashSet<K>,
    processing: HashSet<K>,
    dirty: HashSet<K>,
    delayed: HashMap<K, Delayed>,
    shutdown: bool,
}

pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                queued: HashSet::new(),
                processing: HashSet::new(),
                dirty: HashSet::new(),
                delayed: HashMap::new(),
                shutdown: false,
            }),
            notify: Notify::new(),
        }
    }

    pub async fn add(&self, key: K) {
        let mut state = self.state.lock().await;
        if state.shutdown {
            return;
        }

        if state.processing.contains(&key) {
            state.dirty.insert(key);
            return;
        }

        if state.queued.insert(key.clone()) {
            state.queue.push_back(key);
            drop(state);
            self.notify.notify_one();
        }
    }

    /// Add `key` once `delay` has passed.
    ///
    /// A later deadline than one already pending for `key` is dropped; an
    /// earlier one replaces it.
    pub async fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.add(key).await;
        }

        let deadline = Instant::now() + delay;
        let mut state = self.state.lock().await;
        if state.shutdown {
            return;
        }
        if let Some(pending) = state.delayed.get(&key) {
            if pending.deadline <= deadline {
                return;
            }
            pending.timer.abort();
        }

        let queue = Arc::clone(self);
        let fired = key.clone();
        let timer = tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            queue.fire(fired, deadline).await;
        });
        state.delayed.insert(
            key,
            Delayed {
                deadline,
                timer: timer.abort_handle(),
            },
        );
    }

    async fn fire(&self, key: K, deadline: Instant) {
        {
            let mut state = self.state.lock().await;
            // Superseded by an earlier deadline or cancelled by shutdown
            if !state.delayed.get(&key).is_some_and(|p| p.deadline == deadline) {
                return;
            }
            state.delayed.remove(&key);
        }
        self.add(key).await;
    }

    /// Wait for the next key. Returns `None` once the queue is shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock().await;
                if state.shutdown {
                    return None;
                }
                if let Some(key) = state.queue.pop_front() {
                    state.queued.remove(&key);
                    state.processing.insert(key.clone());
                    return Some(key);
                }
            }

            notified.await;
        }
    }

    /// Mark `key` as finished, requeueing it if it was added meanwhile.
    pub async fn done(&self, key: &K) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);

        if state.dirty.remove(key) && !state.shutdown && state.queued.insert(key.clone()) {
            state.queue.push_back(key.clone());
            drop(state);
            self.notify.notify_one();
        }
    }

    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        state.shutdown = true;
        for (_, pending) in state.delayed.drain() {
            pending.timer.abort();
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Keys waiting for a worker.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn is_processing(&self, key: &K) -> bool {
        self.state.lock().await.processing.contains(key)
    }

    /// Keys with a delayed add still pending.
    pub async fn delayed_len(&self) -> usize {
        self.state.lock().await.delayed.len()
    }
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let queue = WorkQueue::new();
        queue.add("a").await;
        queue.add("a").await;
        queue.add("b").await;

        assert_eq!(queue.len().await, 2);
        assert_eq!(queue.next().await, Some("a"));
        assert_eq!(queue.next().await, Some("b"));
    }

    #[tokio::test]
    async fn test_key_added_while_processing_is_requeued_on_done() {
        let queue = WorkQueue::new();
        queue.add("a").await;

        let key = queue.next().await.unwrap();
        queue.add("a").await;
        assert!(queue.is_empty().await, "in-flight key must not be handed out twice");

        queue.done(&key).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.next().await, Some("a"));
    }

    #[tokio::test]
    async fn test_done_without_readd_drops_key() {
        let queue = WorkQueue::new();
        queue.add("a").await;
        let key = queue.next().await.unwrap();
        queue.done(&key).await;

        assert!(queue.is_empty().await);
        assert!(!queue.is_processing(&"a").await);
    }

    #[tokio::test]
    async fn test_shutdown_wakes_waiters() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::new());
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.next().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.shutdown().await;

        assert_eq!(waiter.await.unwrap(), None);
        queue.add("a").await;
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_waiter_receives_later_add() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::new());
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.next().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.add("a").await;

        assert_eq!(waiter.await.unwrap(), Some("a"));
    }

    #[tokio::test]
    async fn test_add_after_delays() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::new());
        queue.add_after("a", Duration::from_millis(50)).await;

        assert!(queue.is_empty().await);
        assert_eq!(queue.delayed_len().await, 1);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(queue.len().await, 1);
        assert_eq!(queue.delayed_len().await, 0);
    }

    #[tokio::test]
    async fn test_repeated_add_after_keeps_one_timer_per_key() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::new());
        for _ in 0..10 {
            queue.add_after("a", Duration::from_secs(300)).await;
        }
        queue.add_after("b", Duration::from_secs(300)).await;
        assert_eq!(queue.delayed_len().await, 2);

        // An earlier deadline replaces the pending one
        queue.add_after("a", Duration::from_millis(30)).await;
        assert_eq!(queue.delayed_len().await, 2);

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(queue.next().await, Some("a"));
        assert!(queue.is_empty().await);
        assert_eq!(queue.delayed_len().await, 1);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_delayed_adds() {
        let queue: Arc<WorkQueue<&str>> = Arc::new(WorkQueue::new());
        queue.add_after("a", Duration::from_millis(30)).await;
        queue.shutdown().await;
        assert_eq!(queue.delayed_len().await, 0);

        queue.add_after("b", Duration::from_millis(10)).await;
        assert_eq!(queue.delayed_len().await, 0);

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(queue.is_empty().await);
    }
}
