//! Bounded retry queue with backoff, dedup and an in-flight set.

use crate::backoff::BackoffPolicy;
use crate::storage::DurableStore;
use beacon_context::{Context, Environment};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Something that can wait in a [`RetryQueue`].
///
/// `queue_id` identifies the logical item across retries; two items with the
/// same id never occupy the queue at the same time.
pub trait QueueItem: Clone + Serialize + DeserializeOwned + Send + 'static {
    fn queue_id(&self) -> &str;
}

impl QueueItem for Context {
    fn queue_id(&self) -> &str {
        self.id()
    }
}

/// Durable storage key for a queue: `<namespace>:<name>`.
pub fn storage_key(namespace: &str, name: &str) -> String {
    format!("{namespace}:{name}")
}

/// Configuration for a [`RetryQueue`].
#[derive(Debug, Clone)]
pub struct RetryQueueConfig {
    /// Pushes beyond this many attempts are rejected.
    pub max_attempts: u32,
    /// Upper bound on queued entries; the oldest entry is evicted to make room.
    pub max_size: usize,
    /// Delay schedule for `push_with_backoff`.
    pub backoff: BackoffPolicy,
}

impl Default for RetryQueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            max_size: 1000,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// A queued item plus its scheduling metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryEntry<T> {
    item: T,
    attempts: u32,
    enqueued_at: DateTime<Utc>,
    eligible_at: DateTime<Utc>,
    #[serde(skip, default = "Instant::now")]
    ready_at: Instant,
}

impl<T> RetryEntry<T> {
    fn new(item: T, attempts: u32, delay: Duration) -> Self {
        let now = Utc::now();
        let eligible_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(now);
        Self {
            item,
            attempts,
            enqueued_at: now,
            eligible_at,
            ready_at: Instant::now() + delay,
        }
    }

    pub fn item(&self) -> &T {
        &self.item
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn enqueued_at(&self) -> DateTime<Utc> {
        self.enqueued_at
    }

    pub fn eligible_at(&self) -> DateTime<Utc> {
        self.eligible_at
    }

    fn is_due(&self, now: Instant) -> bool {
        self.ready_at <= now
    }

    /// Rebuild the monotonic deadline after deserialization.
    fn rearm(&mut self) {
        let remaining = (self.eligible_at - Utc::now())
            .to_std()
            .unwrap_or(Duration::ZERO);
        self.ready_at = Instant::now() + remaining;
    }
}

/// Why a push was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// The item already used up `max_attempts`.
    AttemptsExhausted,
    /// An entry with the same id is already queued.
    Duplicate,
}

/// Outcome of [`RetryQueue::push`] and [`RetryQueue::push_with_backoff`].
#[derive(Debug)]
pub enum PushResult<T> {
    /// Queued. `evicted` is the oldest entry dropped to stay within `max_size`.
    Accepted { evicted: Option<T> },
    /// Not queued; the item is handed back.
    Rejected { item: T, reason: RejectReason },
}

impl<T> PushResult<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, PushResult::Accepted { .. })
    }
}

struct Persistence {
    store: Arc<dyn DurableStore>,
    key: String,
    degraded: bool,
}

/// Bounded priority queue of items awaiting redelivery.
///
/// Ready entries are ordered by attempt count (fewest first, FIFO among
/// equals). Backed-off entries wait in a separate list until their deadline
/// passes. Items handed out by [`flush`](Self::flush) stay in the in-flight
/// set until they are completed or pushed back.
///
/// The persisted variant writes every mutation to a [`DurableStore`]. Any
/// store failure switches the queue to memory-only operation for the rest of
/// the process.
pub struct RetryQueue<T: QueueItem> {
    config: RetryQueueConfig,
    ready: VecDeque<RetryEntry<T>>,
    future: Vec<RetryEntry<T>>,
    in_flight: Vec<RetryEntry<T>>,
    seen: HashMap<String, u32>,
    persistence: Option<Persistence>,
}

impl<T: QueueItem> RetryQueue<T> {
    /// Queue without durable storage.
    pub fn in_memory(config: RetryQueueConfig) -> Self {
        let config = RetryQueueConfig {
            max_size: config.max_size.max(1),
            ..config
        };
        Self {
            config,
            ready: VecDeque::new(),
            future: Vec::new(),
            in_flight: Vec::new(),
            seen: HashMap::new(),
            persistence: None,
        }
    }

    /// Queue backed by `store` under `storage_key(namespace, name)`.
    ///
    /// Entries left by a previous process are restored, including ones that
    /// were in flight. Unreadable contents yield an empty queue.
    pub fn persisted(
        config: RetryQueueConfig,
        store: Arc<dyn DurableStore>,
        namespace: &str,
        name: &str,
    ) -> Self {
        let key = storage_key(namespace, name);
        let mut queue = Self::in_memory(config);

        let (entries, degraded) = match store.get(&key) {
            Ok(Some(raw)) => match serde_json::from_str::<Vec<RetryEntry<T>>>(&raw) {
                Ok(entries) => (entries, false),
                Err(e) => {
                    warn!(key = %key, error = %e, "Discarding unreadable persisted queue");
                    (Vec::new(), false)
                }
            },
            Ok(None) => (Vec::new(), false),
            Err(e) => {
                warn!(key = %key, error = %e, "Durable store unavailable, queue is memory-only");
                (Vec::new(), true)
            }
        };

        queue.persistence = Some(Persistence {
            store,
            key,
            degraded,
        });

        for mut entry in entries {
            let id = entry.item.queue_id().to_string();
            if queue.seen.contains_key(&id) {
                debug!(id = %id, "Skipping duplicate persisted entry");
                continue;
            }
            queue.seen.insert(id, entry.attempts);
            entry.rearm();
            if entry.is_due(Instant::now()) {
                queue.ready.push_back(entry);
            } else {
                queue.future.push(entry);
            }
        }
        while queue.len() > queue.config.max_size {
            queue.evict_oldest();
        }
        queue.sort_ready();

        if !queue.is_empty() {
            if let Some(p) = &queue.persistence {
                info!(key = %p.key, count = queue.len(), "Restored persisted queue");
            }
        }
        queue
    }

    pub fn config(&self) -> &RetryQueueConfig {
        &self.config
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Attempts recorded for `id` (0 if never pushed).
    pub fn get_attempts(&self, id: &str) -> u32 {
        self.seen.get(id).copied().unwrap_or(0)
    }

    /// Count an attempt made without queueing; returns the new total.
    pub fn update_attempts(&mut self, id: &str) -> u32 {
        let attempts = self.get_attempts(id) + 1;
        self.seen.insert(id.to_string(), attempts);
        attempts
    }

    /// Drop the attempt history for `id`.
    pub fn forget(&mut self, id: &str) {
        self.seen.remove(id);
    }

    /// Whether `id` is queued (ready or backed off).
    pub fn includes(&self, id: &str) -> bool {
        self.ready.iter().any(|e| e.item.queue_id() == id)
            || self.future.iter().any(|e| e.item.queue_id() == id)
    }

    /// Queued entries, ready and backed off.
    pub fn len(&self) -> usize {
        self.ready.len() + self.future.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Outstanding work: queued plus in-flight entries.
    pub fn todo(&self) -> usize {
        self.len() + self.in_flight.len()
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn is_persistent(&self) -> bool {
        self.persistence.is_some()
    }

    /// Whether a store failure forced memory-only operation.
    pub fn is_degraded(&self) -> bool {
        self.persistence.as_ref().map_or(false, |p| p.degraded)
    }

    /// Queue `item` for the next cycle.
    pub fn push(&mut self, item: T) -> PushResult<T> {
        self.enqueue(item, None)
    }

    /// Queue `item` after a backoff delay derived from its attempt count.
    ///
    /// `min_delay` (e.g. a server retry-after) raises the computed delay. An
    /// item that was never attempted and has no `min_delay` is queued at once.
    pub fn push_with_backoff(&mut self, item: T, min_delay: Option<Duration>) -> PushResult<T> {
        let min_delay = min_delay.filter(|d| !d.is_zero());
        if min_delay.is_none() && self.get_attempts(item.queue_id()) == 0 {
            return self.push(item);
        }
        self.enqueue(item, Some(min_delay.unwrap_or(Duration::ZERO)))
    }

    fn enqueue(&mut self, item: T, backoff_floor: Option<Duration>) -> PushResult<T> {
        let id = item.queue_id().to_string();
        if self.includes(&id) {
            return PushResult::Rejected {
                item,
                reason: RejectReason::Duplicate,
            };
        }

        let attempts = self.get_attempts(&id) + 1;
        self.in_flight.retain(|e| e.item.queue_id() != id);
        if attempts > self.config.max_attempts {
            debug!(id = %id, attempts, "Attempts exhausted, dropping entry");
            self.seen.remove(&id);
            self.persist();
            return PushResult::Rejected {
                item,
                reason: RejectReason::AttemptsExhausted,
            };
        }
        self.seen.insert(id.clone(), attempts);

        let mut evicted = None;
        while self.len() >= self.config.max_size {
            match self.evict_oldest() {
                Some(item) => evicted = Some(item),
                None => break,
            }
        }

        match backoff_floor {
            None => {
                self.ready.push_back(RetryEntry::new(item, attempts, Duration::ZERO));
                self.sort_ready();
            }
            Some(floor) => {
                let delay = self.config.backoff.delay(attempts - 1).max(floor);
                debug!(id = %id, attempts, delay_ms = delay.as_millis() as u64, "Backing off");
                self.future.push(RetryEntry::new(item, attempts, delay));
            }
        }

        self.persist();
        PushResult::Accepted { evicted }
    }

    /// Remove and return the next due entry.
    pub fn pop(&mut self) -> Option<T> {
        self.promote_due();
        let entry = self.ready.pop_front()?;
        self.persist();
        Some(entry.item)
    }

    /// Hand out every due entry for redelivery.
    ///
    /// Returned items move to the in-flight set. Backed-off entries stay
    /// queued. Nothing is released while the environment is offline.
    pub fn flush(&mut self, env: &Environment) -> Vec<T> {
        if env.is_offline() {
            return Vec::new();
        }
        self.promote_due();
        if self.ready.is_empty() {
            return Vec::new();
        }

        let items: Vec<T> = self.ready.iter().map(|e| e.item.clone()).collect();
        self.in_flight.extend(self.ready.drain(..));
        self.persist();
        items
    }

    /// Time until the earliest backed-off entry becomes due.
    ///
    /// `Some(ZERO)` when something is ready now, `None` when the queue is empty.
    pub fn next_ready_in(&self) -> Option<Duration> {
        if !self.ready.is_empty() {
            return Some(Duration::ZERO);
        }
        let now = Instant::now();
        self.future
            .iter()
            .map(|e| e.ready_at.saturating_duration_since(now))
            .min()
    }

    /// Track an item that is being delivered outside of [`flush`](Self::flush).
    pub fn mark_in_flight(&mut self, item: T) {
        let id = item.queue_id().to_string();
        if self.in_flight.iter().any(|e| e.item.queue_id() == id) {
            return;
        }
        let attempts = self.get_attempts(&id);
        self.in_flight.push(RetryEntry::new(item, attempts, Duration::ZERO));
        self.persist();
    }

    /// Delivery of `id` resolved; stop tracking it.
    pub fn complete(&mut self, id: &str) -> bool {
        let before = self.in_flight.len();
        self.in_flight.retain(|e| e.item.queue_id() != id);
        self.seen.remove(id);
        let removed = self.in_flight.len() != before;
        if removed {
            self.persist();
        }
        removed
    }

    /// Drop every trace of `id`: queued, in-flight and attempt history.
    ///
    /// Returns the queued or in-flight copy, if there was one.
    pub fn remove(&mut self, id: &str) -> Option<T> {
        let mut removed = None;
        if let Some(i) = self.ready.iter().position(|e| e.item.queue_id() == id) {
            removed = self.ready.remove(i).map(|e| e.item);
        }
        if let Some(i) = self.future.iter().position(|e| e.item.queue_id() == id) {
            removed = Some(self.future.remove(i).item);
        }
        if let Some(i) = self.in_flight.iter().position(|e| e.item.queue_id() == id) {
            let entry = self.in_flight.remove(i);
            removed.get_or_insert(entry.item);
        }
        let known = self.seen.remove(id).is_some();
        if removed.is_some() || known {
            self.persist();
        }
        removed
    }

    /// Move every in-flight item back into the ready queue.
    ///
    /// Used when the process is about to stop mid-delivery.
    pub fn restore_in_flight(&mut self) -> usize {
        let mut restored = 0;
        for entry in std::mem::take(&mut self.in_flight) {
            let id = entry.item.queue_id().to_string();
            if self.includes(&id) {
                continue;
            }
            self.ready.push_back(entry);
            restored += 1;
        }
        while self.len() > self.config.max_size {
            self.evict_oldest();
        }
        self.sort_ready();
        self.persist();
        restored
    }

    fn promote_due(&mut self) {
        if self.future.is_empty() {
            return;
        }
        let now = Instant::now();
        let (due, waiting): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.future).into_iter().partition(|e| e.is_due(now));
        self.future = waiting;
        if !due.is_empty() {
            self.ready.extend(due);
            self.sort_ready();
        }
    }

    fn sort_ready(&mut self) {
        self.ready
            .make_contiguous()
            .sort_by_key(|entry| entry.attempts);
    }

    fn evict_oldest(&mut self) -> Option<T> {
        let oldest_ready = self
            .ready
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.enqueued_at)
            .map(|(i, e)| (i, e.enqueued_at));
        let oldest_future = self
            .future
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.enqueued_at)
            .map(|(i, e)| (i, e.enqueued_at));

        let entry = match (oldest_ready, oldest_future) {
            (Some((i, r)), Some((_, f))) if r <= f => self.ready.remove(i),
            (Some(_), Some((j, _))) => Some(self.future.remove(j)),
            (Some((i, _)), None) => self.ready.remove(i),
            (None, Some((j, _))) => Some(self.future.remove(j)),
            (None, None) => None,
        }?;

        let id = entry.item.queue_id().to_string();
        warn!(id = %id, attempts = entry.attempts, "Retry queue full, evicting oldest entry");
        self.seen.remove(&id);
        Some(entry.item)
    }

    fn persist(&mut self) {
        let Some(persistence) = self.persistence.as_mut() else {
            return;
        };
        if persistence.degraded {
            return;
        }

        let result = if self.ready.is_empty() && self.future.is_empty() && self.in_flight.is_empty()
        {
            persistence.store.delete(&persistence.key).map(|_| ())
        } else {
            let entries: Vec<&RetryEntry<T>> = self
                .ready
                .iter()
                .chain(self.future.iter())
                .chain(self.in_flight.iter())
                .collect();
            match serde_json::to_string(&entries) {
                Ok(raw) => persistence.store.set(&persistence.key, &raw),
                Err(e) => {
                    warn!(key = %persistence.key, error = %e, "Failed to encode retry queue");
                    persistence.degraded = true;
                    return;
                }
            }
        };

        if let Err(e) = result {
            warn!(
                key = %persistence.key,
                error = %e,
                "Failed to persist retry queue, continuing in memory"
            );
            persistence.degraded = true;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryStore, StorageError, StorageResult};
    use beacon_context::Event;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: String,
    }

    impl QueueItem for Job {
        fn queue_id(&self) -> &str {
            &self.id
        }
    }

    fn job(id: &str) -> Job {
        Job { id: id.to_string() }
    }

    fn config(max_attempts: u32, max_size: usize) -> RetryQueueConfig {
        RetryQueueConfig {
            max_attempts,
            max_size,
            backoff: BackoffPolicy {
                base: Duration::from_millis(500),
                factor: 2.0,
                max: Duration::from_secs(60),
                jitter: false,
            },
        }
    }

    struct BrokenStore;

    impl DurableStore for BrokenStore {
        fn get(&self, _key: &str) -> StorageResult<Option<String>> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
        fn set(&self, _key: &str, _value: &str) -> StorageResult<()> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
        fn delete(&self, _key: &str) -> StorageResult<bool> {
            Err(StorageError::Unavailable("disk gone".into()))
        }
    }

    #[test]
    fn push_counts_attempts_and_pops_in_order() {
        let mut q = RetryQueue::in_memory(config(3, 10));
        assert!(q.push(job("a")).is_accepted());
        assert!(q.push(job("b")).is_accepted());
        assert_eq!(q.get_attempts("a"), 1);

        assert_eq!(q.pop(), Some(job("a")));
        assert!(q.push(job("a")).is_accepted());
        assert_eq!(q.get_attempts("a"), 2);

        // b has fewer attempts and goes first.
        assert_eq!(q.pop(), Some(job("b")));
        assert_eq!(q.pop(), Some(job("a")));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn update_attempts_feeds_backoff() {
        let mut q = RetryQueue::in_memory(config(2, 10));
        assert_eq!(q.update_attempts("a"), 1);
        assert!(q.push_with_backoff(job("a"), None).is_accepted());
        assert_eq!(q.get_attempts("a"), 2);
        assert!(q.future.len() == 1 && q.ready.is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let mut q = RetryQueue::in_memory(config(3, 10));
        assert!(q.push(job("a")).is_accepted());
        match q.push(job("a")) {
            PushResult::Rejected { reason, .. } => assert_eq!(reason, RejectReason::Duplicate),
            other => panic!("expected rejection, got {other:?}"),
        }
        assert_eq!(q.len(), 1);
        assert_eq!(q.get_attempts("a"), 1);
    }

    #[test]
    fn exhausted_attempts_are_rejected() {
        let mut q = RetryQueue::in_memory(config(2, 10));
        q.push(job("a"));
        q.pop();
        q.push(job("a"));
        q.pop();
        match q.push(job("a")) {
            PushResult::Rejected { item, reason } => {
                assert_eq!(item, job("a"));
                assert_eq!(reason, RejectReason::AttemptsExhausted);
            }
            other => panic!("expected rejection, got {other:?}"),
        }
        assert!(q.is_empty());
        assert_eq!(q.get_attempts("a"), 0);
    }

    #[test]
    fn length_never_exceeds_max_size() {
        let mut q = RetryQueue::in_memory(config(3, 3));
        let mut evicted = Vec::new();
        for i in 0..10 {
            if let PushResult::Accepted {
                evicted: Some(item),
            } = q.push(job(&i.to_string()))
            {
                evicted.push(item.id);
            }
            assert!(q.len() <= 3);
        }
        assert_eq!(q.len(), 3);
        assert_eq!(evicted.len(), 7);
        assert!(!q.includes("0"));
        assert!(q.includes("9"));
    }

    #[tokio::test(start_paused = true)]
    async fn backed_off_entries_wait_for_their_deadline() {
        let env = Environment::new();
        let mut q = RetryQueue::in_memory(config(5, 10));
        q.push(job("a"));
        q.pop();

        // Second attempt: backoff(1) = 1s.
        assert!(q.push_with_backoff(job("a"), None).is_accepted());
        assert!(q.includes("a"));
        assert!(q.flush(&env).is_empty());
        assert_eq!(q.next_ready_in(), Some(Duration::from_secs(1)));

        tokio::time::advance(Duration::from_millis(999)).await;
        assert!(q.pop().is_none());

        tokio::time::advance(Duration::from_millis(1)).await;
        assert_eq!(q.flush(&env), vec![job("a")]);
        assert_eq!(q.in_flight_count(), 1);
        assert_eq!(q.todo(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn min_delay_raises_backoff() {
        let mut q = RetryQueue::in_memory(config(5, 10));
        q.push_with_backoff(job("a"), Some(Duration::from_secs(5)));
        assert_eq!(q.get_attempts("a"), 1);
        assert_eq!(q.next_ready_in(), Some(Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(q.pop(), Some(job("a")));
    }

    #[test]
    fn fresh_item_without_min_delay_is_ready_immediately() {
        let mut q = RetryQueue::in_memory(config(5, 10));
        q.push_with_backoff(job("a"), None);
        assert_eq!(q.next_ready_in(), Some(Duration::ZERO));
    }

    #[test]
    fn flush_is_noop_while_offline() {
        let env = Environment::new();
        let mut q = RetryQueue::in_memory(config(5, 10));
        q.push(job("a"));

        env.set_online(false);
        assert!(q.flush(&env).is_empty());
        assert_eq!(q.len(), 1);

        env.set_online(true);
        assert_eq!(q.flush(&env).len(), 1);
        assert!(q.is_empty());
    }

    #[test]
    fn in_flight_items_move_back_on_restore() {
        let env = Environment::new();
        let mut q = RetryQueue::in_memory(config(5, 10));
        q.push(job("a"));
        q.push(job("b"));
        q.flush(&env);
        assert!(q.complete("a"));
        assert_eq!(q.in_flight_count(), 1);

        assert_eq!(q.restore_in_flight(), 1);
        assert_eq!(q.in_flight_count(), 0);
        assert_eq!(q.pop(), Some(job("b")));
    }

    #[test]
    fn remove_clears_every_trace() {
        let env = Environment::new();
        let mut q = RetryQueue::in_memory(config(5, 10));
        q.push(job("a"));
        q.push_with_backoff(job("b"), Some(Duration::from_secs(30)));
        q.push(job("c"));
        q.flush(&env);

        assert_eq!(q.remove("b"), Some(job("b")));
        assert_eq!(q.remove("c"), Some(job("c")));
        assert_eq!(q.get_attempts("b"), 0);
        assert!(!q.includes("b"));
        assert_eq!(q.in_flight_count(), 1);
        assert_eq!(q.remove("missing"), None);
    }

    #[test]
    fn pushing_an_in_flight_item_keeps_one_live_entry() {
        let env = Environment::new();
        let mut q = RetryQueue::in_memory(config(5, 10));
        q.push(job("a"));
        q.flush(&env);

        q.push(job("a"));
        assert_eq!(q.in_flight_count(), 0);
        assert_eq!(q.todo(), 1);
    }

    #[test]
    fn persisted_queue_round_trips() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        {
            let mut q = RetryQueue::persisted(config(5, 10), store.clone(), "persisted-queue:v1", "dest");
            q.push(job("a"));
            q.push(job("b"));
            q.pop();
            q.push(job("a"));
            q.push(job("c"));
        }

        let mut q: RetryQueue<Job> =
            RetryQueue::persisted(config(5, 10), store, "persisted-queue:v1", "dest");
        assert_eq!(q.len(), 3);
        assert_eq!(q.get_attempts("a"), 2);
        assert_eq!(q.get_attempts("b"), 1);
        assert_eq!(q.pop(), Some(job("b")));
        assert_eq!(q.pop(), Some(job("c")));
        assert_eq!(q.pop(), Some(job("a")));
    }

    #[test]
    fn persisted_queue_restores_in_flight_items() {
        let env = Environment::new();
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        {
            let mut q = RetryQueue::persisted(config(5, 10), store.clone(), "ns", "dest");
            q.push(job("a"));
            q.flush(&env);
            assert_eq!(q.in_flight_count(), 1);
        }

        let q: RetryQueue<Job> = RetryQueue::persisted(config(5, 10), store, "ns", "dest");
        assert!(q.includes("a"));
        assert_eq!(q.in_flight_count(), 0);
    }

    #[test]
    fn corrupt_contents_yield_empty_queue() {
        let store = Arc::new(MemoryStore::new());
        store.set("ns:dest", "{not json").unwrap();

        let mut q: RetryQueue<Job> = RetryQueue::persisted(config(5, 10), store.clone(), "ns", "dest");
        assert!(q.is_empty());
        assert!(!q.is_degraded());

        q.push(job("a"));
        assert!(store.get("ns:dest").unwrap().unwrap().contains("\"a\""));
    }

    #[test]
    fn keys_are_isolated_per_destination() {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let mut first = RetryQueue::persisted(config(5, 10), store.clone(), "ns", "one");
        first.push(job("a"));

        let second: RetryQueue<Job> = RetryQueue::persisted(config(5, 10), store, "ns", "two");
        assert!(second.is_empty());
    }

    #[test]
    fn unavailable_store_degrades_to_memory() {
        let mut q: RetryQueue<Job> =
            RetryQueue::persisted(config(5, 10), Arc::new(BrokenStore), "ns", "dest");
        assert!(q.is_degraded());

        assert!(q.push(job("a")).is_accepted());
        assert_eq!(q.pop(), Some(job("a")));
    }

    #[test]
    fn full_store_degrades_without_losing_entries() {
        let store = Arc::new(MemoryStore::with_capacity(64));
        let mut q: RetryQueue<Job> = RetryQueue::persisted(config(5, 10), store, "ns", "dest");
        for i in 0..5 {
            assert!(q.push(job(&format!("job-{i}"))).is_accepted());
        }
        assert!(q.is_degraded());
        assert_eq!(q.len(), 5);
    }

    #[test]
    fn empty_queue_clears_stored_key() {
        let store = Arc::new(MemoryStore::new());
        let mut q: RetryQueue<Job> = RetryQueue::persisted(config(5, 10), store.clone(), "ns", "dest");
        q.push(job("a"));
        assert!(store.get("ns:dest").unwrap().is_some());
        q.pop();
        assert!(store.get("ns:dest").unwrap().is_none());
    }

    #[test]
    fn contexts_keep_their_id_through_the_queue() {
        let mut q = RetryQueue::in_memory(RetryQueueConfig::default());
        let ctx = Context::new(Event::track("Order Completed"));
        let id = ctx.id().to_string();
        q.push(ctx);
        let popped = q.pop().unwrap();
        assert_eq!(popped.id(), id);
        assert_eq!(q.get_attempts(&id), 1);
    }
}
