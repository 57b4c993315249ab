//! A deduplicating, rate-limited work queue.
//!
//! Keys wait in strict FIFO order and are collapsed while queued: adding a
//! key that is already waiting is a no-op, so a burst of updates to one
//! object is processed once. Failed items re-enter through
//! [`WorkQueue::add_rate_limited`] with per-key exponential backoff.

use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::collections::VecDeque;
use std::hash::Hash;
use tokio::time::{Duration, Instant};

const BASE_DELAY: Duration = Duration::from_millis(5);
const MAX_DELAY: Duration = Duration::from_secs(1000);

pub struct WorkQueue<K> {
    ready: VecDeque<K>,
    queued: HashSet<K>,
    delayed: Vec<(Instant, K)>,
    failures: HashMap<K, u32>,
}

// === impl WorkQueue ===

impl<K: Eq + Hash + Clone> Default for WorkQueue<K> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone> WorkQueue<K> {
    pub fn new() -> Self {
        Self {
            ready: VecDeque::new(),
            queued: HashSet::new(),
            delayed: Vec::new(),
            failures: HashMap::new(),
        }
    }

    /// Enqueues a key unless it is already waiting.
    pub fn add(&mut self, key: K) {
        if self.queued.insert(key.clone()) {
            self.ready.push_back(key);
        }
    }

    /// Re-enqueues a failed key after a per-key exponential backoff.
    pub fn add_rate_limited(&mut self, key: K) {
        if self.queued.contains(&key) {
            return;
        }
        let failures = self.failures.entry(key.clone()).or_insert(0);
        *failures += 1;
        let exp = (*failures - 1).min(20);
        let delay = BASE_DELAY
            .checked_mul(1 << exp)
            .map_or(MAX_DELAY, |d| d.min(MAX_DELAY));
        self.queued.insert(key.clone());
        self.delayed.push((Instant::now() + delay, key));
    }

    /// Clears the failure history of a key that was processed successfully.
    pub fn forget(&mut self, key: &K) {
        self.failures.remove(key);
    }

    pub fn is_empty(&self) -> bool {
        self.ready.is_empty() && self.delayed.is_empty()
    }

    /// Takes the next due key, if any.
    pub fn try_next(&mut self) -> Option<K> {
        self.promote_due(Instant::now());
        let key = self.ready.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }

    /// Waits until a key is due. Completes immediately if one already is;
    /// pends forever on an empty queue.
    pub async fn wait(&self) {
        if !self.ready.is_empty() {
            return;
        }
        match self.delayed.iter().map(|(at, _)| *at).min() {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending().await,
        }
    }

    fn promote_due(&mut self, now: Instant) {
        // Preserve due-time ordering among promoted items.
        self.delayed.sort_by_key(|(at, _)| *at);
        while let Some((at, _)) = self.delayed.first() {
            if *at > now {
                break;
            }
            let (_, key) = self.delayed.remove(0);
            self.ready.push_back(key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn deduplicates_waiting_keys() {
        let mut q = WorkQueue::new();
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.try_next(), Some("a"));
        assert_eq!(q.try_next(), Some("b"));
        assert_eq!(q.try_next(), None);

        // Once taken, the key may be queued again.
        q.add("a");
        assert_eq!(q.try_next(), Some("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_keys_back_off() {
        let mut q = WorkQueue::new();
        q.add_rate_limited("a");
        assert_eq!(q.try_next(), None);
        q.wait().await;
        assert_eq!(q.try_next(), Some("a"));

        // A second failure waits longer than the first.
        q.add_rate_limited("a");
        let first = Instant::now();
        q.wait().await;
        let first_delay = first.elapsed();
        assert_eq!(q.try_next(), Some("a"));

        q.add_rate_limited("a");
        let second = Instant::now();
        q.wait().await;
        assert!(second.elapsed() > first_delay);
        assert_eq!(q.try_next(), Some("a"));

        // Success resets the backoff.
        q.forget(&"a");
        q.add_rate_limited("a");
        let reset = Instant::now();
        q.wait().await;
        assert_eq!(reset.elapsed(), BASE_DELAY);
    }
}
