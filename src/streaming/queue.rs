//! Admission queue for node loads
//!
//! Waiting jobs live in an indexed binary max-heap: a position map from key to
//! heap slot allows raising the priority of, or removing, any job in O(log n).
//! Jobs taken by a loader stay indexed as LOADING until the cache resolves
//! them, so a node is never queued twice.

use std::cmp::{Ordering, Reverse};
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};

use crate::core::types::{NodeKey, Priority};
use crate::streaming::lock;
use crate::streaming::slot_pool::SlotHandle;

/// Where a job is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobStatus {
    /// In the heap, not yet picked up
    Waiting,
    /// Taken by a loader worker
    Loading,
}

/// One pending node load
#[derive(Clone, Debug)]
pub struct Job {
    pub key: NodeKey,
    pub priority: Priority,
    pub status: JobStatus,
    /// Slot reserved by the loader, set once the job is being loaded
    pub slot: Option<SlotHandle>,
    /// Insertion order, breaks priority ties (earlier first)
    seq: u64,
}

impl Job {
    /// Heap order: higher priority first, then older jobs first
    fn rank(&self) -> (Priority, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }

    fn outranks(&self, other: &Job) -> bool {
        self.rank().cmp(&other.rank()) == Ordering::Greater
    }
}

/// Result of [`AdmissionQueue::abort`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AbortResult {
    /// The waiting job was removed
    Aborted,
    /// No waiting job for the key (absent, or already loading)
    Failed,
}

/// Result of [`AdmissionQueue::query`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryResult {
    NotIndexed,
    Waiting,
    Loading,
}

#[derive(Debug, Default)]
struct QueueState {
    heap: Vec<Job>,
    positions: HashMap<NodeKey, usize>,
    loading: HashMap<NodeKey, Job>,
    next_seq: u64,
    shutdown: bool,
}

impl QueueState {
    fn insert(&mut self, job: Job) {
        let pos = self.heap.len();
        self.positions.insert(job.key, pos);
        self.heap.push(job);
        self.sift_up(pos);
    }

    fn pop_top(&mut self) -> Option<Job> {
        self.remove_at(0)
    }

    fn remove_at(&mut self, pos: usize) -> Option<Job> {
        let last = self.heap.len().checked_sub(1)?;
        self.swap(pos, last);
        let job = self.heap.pop()?;
        self.positions.remove(&job.key);
        if pos < self.heap.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
        Some(job)
    }

    fn swap(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        self.heap.swap(a, b);
        self.positions.insert(self.heap[a].key, a);
        self.positions.insert(self.heap[b].key, b);
    }

    fn sift_up(&mut self, mut pos: usize) {
        while pos > 0 {
            let parent = (pos - 1) / 2;
            if !self.heap[pos].outranks(&self.heap[parent]) {
                break;
            }
            self.swap(pos, parent);
            pos = parent;
        }
    }

    fn sift_down(&mut self, mut pos: usize) {
        let len = self.heap.len();
        loop {
            let left = 2 * pos + 1;
            let right = left + 1;
            let mut best = pos;
            if left < len && self.heap[left].outranks(&self.heap[best]) {
                best = left;
            }
            if right < len && self.heap[right].outranks(&self.heap[best]) {
                best = right;
            }
            if best == pos {
                break;
            }
            self.swap(pos, best);
            pos = best;
        }
    }

    /// Raise a waiting job's priority; false if it was already at least `priority`
    fn raise(&mut self, pos: usize, priority: Priority) -> bool {
        if priority <= self.heap[pos].priority {
            return false;
        }
        self.heap[pos].priority = priority;
        self.sift_up(pos);
        true
    }

    fn take(&mut self) -> Option<Job> {
        let mut job = self.pop_top()?;
        job.status = JobStatus::Loading;
        self.loading.insert(job.key, job.clone());
        Some(job)
    }
}

/// Thread-safe priority queue of node loads
///
/// Producers are the cut update threads (through the cache), consumers are the
/// loader workers.
#[derive(Debug, Default)]
pub struct AdmissionQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl AdmissionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a load for `key`
    ///
    /// Returns false if the key is already waiting or loading; its priority is
    /// then raised to the larger of the two.
    pub fn push(&self, key: NodeKey, priority: Priority) -> bool {
        let mut state = lock(&self.state);

        if let Some(&pos) = state.positions.get(&key) {
            state.raise(pos, priority);
            return false;
        }
        if let Some(job) = state.loading.get_mut(&key) {
            job.priority = job.priority.max(priority);
            return false;
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        state.insert(Job {
            key,
            priority,
            status: JobStatus::Waiting,
            slot: None,
            seq,
        });
        log::trace!("Queued {} at priority {}", key, priority);

        self.ready.notify_one();
        true
    }

    /// Take the highest-priority job, blocking until one exists
    ///
    /// Returns `None` once the queue is shut down.
    pub fn pop_blocking(&self) -> Option<Job> {
        let mut state = lock(&self.state);
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(job) = state.take() {
                return Some(job);
            }
            state = self.ready.wait(state).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Take the highest-priority job if there is one
    pub fn try_pop(&self) -> Option<Job> {
        let mut state = lock(&self.state);
        if state.shutdown {
            return None;
        }
        state.take()
    }

    /// Raise the priority of a waiting job. Never lowers it.
    pub fn update_priority(&self, key: NodeKey, priority: Priority) -> bool {
        let mut state = lock(&self.state);
        if let Some(&pos) = state.positions.get(&key) {
            return state.raise(pos, priority);
        }
        if let Some(job) = state.loading.get_mut(&key) {
            if priority > job.priority {
                job.priority = priority;
                return true;
            }
        }
        false
    }

    /// Remove a waiting job. Jobs already being loaded cannot be aborted.
    pub fn abort(&self, key: NodeKey) -> AbortResult {
        let mut state = lock(&self.state);
        match state.positions.get(&key) {
            Some(&pos) => {
                state.remove_at(pos);
                log::trace!("Aborted {}", key);
                AbortResult::Aborted
            }
            None => AbortResult::Failed,
        }
    }

    /// Park a loading job back in the heap (no slot was available)
    ///
    /// The job keeps its insertion order, and any priority raised while it
    /// was loading.
    pub fn requeue(&self, mut job: Job) {
        let mut state = lock(&self.state);
        if let Some(record) = state.loading.remove(&job.key) {
            job.priority = job.priority.max(record.priority);
        }
        if state.positions.contains_key(&job.key) {
            return;
        }
        job.status = JobStatus::Waiting;
        job.slot = None;
        state.insert(job);
        self.ready.notify_one();
    }

    /// Forget a loading job once its result has been handled
    pub fn complete(&self, key: NodeKey) -> bool {
        lock(&self.state).loading.remove(&key).is_some()
    }

    pub fn query(&self, key: NodeKey) -> QueryResult {
        let state = lock(&self.state);
        if state.positions.contains_key(&key) {
            QueryResult::Waiting
        } else if state.loading.contains_key(&key) {
            QueryResult::Loading
        } else {
            QueryResult::NotIndexed
        }
    }

    /// Current priority of a waiting or loading job
    pub fn priority_of(&self, key: NodeKey) -> Option<Priority> {
        let state = lock(&self.state);
        match state.positions.get(&key) {
            Some(&pos) => Some(state.heap[pos].priority),
            None => state.loading.get(&key).map(|job| job.priority),
        }
    }

    pub fn num_waiting(&self) -> usize {
        lock(&self.state).heap.len()
    }

    pub fn num_loading(&self) -> usize {
        lock(&self.state).loading.len()
    }

    pub fn is_empty(&self) -> bool {
        let state = lock(&self.state);
        state.heap.is_empty() && state.loading.is_empty()
    }

    /// Drop every waiting job, returning them highest priority first
    pub fn clear_waiting(&self) -> Vec<Job> {
        let mut state = lock(&self.state);
        let mut jobs = Vec::with_capacity(state.heap.len());
        while let Some(job) = state.pop_top() {
            jobs.push(job);
        }
        jobs
    }

    /// Wake every blocked consumer; `pop_blocking` returns `None` from now on
    pub fn shutdown(&self) {
        lock(&self.state).shutdown = true;
        self.ready.notify_all();
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.state).shutdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn key(node: u64) -> NodeKey {
        NodeKey::new(0, node)
    }

    fn drain(queue: &AdmissionQueue) -> Vec<u64> {
        std::iter::from_fn(|| queue.try_pop()).map(|job| job.key.node).collect()
    }

    #[test]
    fn test_pops_by_priority() {
        let queue = AdmissionQueue::new();
        queue.push(key(1), 5);
        queue.push(key(2), 50);
        queue.push(key(3), -3);
        queue.push(key(4), 20);

        assert_eq!(drain(&queue), vec![2, 4, 1, 3]);
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let queue = AdmissionQueue::new();
        for node in [9, 3, 7, 1, 5] {
            queue.push(key(node), 10);
        }
        assert_eq!(drain(&queue), vec![9, 3, 7, 1, 5]);
    }

    #[test]
    fn test_duplicate_push_raises_priority() {
        let queue = AdmissionQueue::new();
        assert!(queue.push(key(1), 10));
        assert!(queue.push(key(2), 20));
        assert!(!queue.push(key(1), 30));
        assert!(!queue.push(key(1), 5));

        assert_eq!(queue.num_waiting(), 2);
        assert_eq!(queue.priority_of(key(1)), Some(30));
        assert_eq!(drain(&queue), vec![1, 2]);
    }

    #[test]
    fn test_loading_job_is_deduplicated() {
        let queue = AdmissionQueue::new();
        queue.push(key(1), 1);
        let job = queue.try_pop().unwrap();
        assert_eq!(job.status, JobStatus::Loading);
        assert_eq!(queue.query(key(1)), QueryResult::Loading);

        assert!(!queue.push(key(1), 8));
        assert_eq!(queue.num_waiting(), 0);
        assert_eq!(queue.num_loading(), 1);

        assert!(queue.complete(key(1)));
        assert_eq!(queue.query(key(1)), QueryResult::NotIndexed);
        assert!(queue.push(key(1), 8));
    }

    #[test]
    fn test_update_priority_only_raises() {
        let queue = AdmissionQueue::new();
        queue.push(key(1), 10);
        queue.push(key(2), 5);

        assert!(!queue.update_priority(key(1), 3));
        assert!(queue.update_priority(key(2), 11));
        assert!(!queue.update_priority(key(7), 100));
        assert_eq!(drain(&queue), vec![2, 1]);
    }

    #[test]
    fn test_abort() {
        let queue = AdmissionQueue::new();
        for node in 0..6 {
            queue.push(key(node), node as Priority);
        }
        assert_eq!(queue.abort(key(3)), AbortResult::Aborted);
        assert_eq!(queue.abort(key(3)), AbortResult::Failed);

        let job = queue.try_pop().unwrap();
        assert_eq!(job.key, key(5));
        assert_eq!(queue.abort(key(5)), AbortResult::Failed);

        assert_eq!(drain(&queue), vec![4, 2, 1, 0]);
    }

    #[test]
    fn test_requeue_keeps_order_and_raise() {
        let queue = AdmissionQueue::new();
        queue.push(key(1), 10);
        queue.push(key(2), 10);

        let job = queue.try_pop().unwrap();
        assert_eq!(job.key, key(1));
        queue.update_priority(key(1), 12);
        queue.requeue(job);

        assert_eq!(queue.query(key(1)), QueryResult::Waiting);
        assert_eq!(queue.num_loading(), 0);
        assert_eq!(queue.priority_of(key(1)), Some(12));
        assert_eq!(drain(&queue), vec![1, 2]);
    }

    #[test]
    fn test_clear_waiting() {
        let queue = AdmissionQueue::new();
        queue.push(key(1), 1);
        queue.push(key(2), 2);
        queue.push(key(3), 3);
        queue.try_pop();

        let cleared = queue.clear_waiting();
        assert_eq!(cleared.iter().map(|j| j.key.node).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(queue.num_waiting(), 0);
        assert_eq!(queue.num_loading(), 1);
        assert!(!queue.is_empty());
    }

    #[test]
    fn test_heap_order_under_churn() {
        let queue = AdmissionQueue::new();
        for node in 0..200u64 {
            queue.push(key(node), ((node * 37) % 23) as Priority);
        }
        for node in (0..200u64).step_by(3) {
            queue.abort(key(node));
        }
        for node in (1..200u64).step_by(7) {
            queue.update_priority(key(node), 30);
        }

        let mut last: Option<Priority> = None;
        while let Some(job) = queue.try_pop() {
            if let Some(prev) = last {
                assert!(job.priority <= prev);
            }
            last = Some(job.priority);
        }
    }

    #[test]
    fn test_pop_blocking_wakes_on_push() {
        let queue = Arc::new(AdmissionQueue::new());
        let consumer = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || queue.pop_blocking().map(|job| job.key))
        };

        thread::sleep(Duration::from_millis(20));
        queue.push(key(42), 0);
        assert_eq!(consumer.join().unwrap(), Some(key(42)));
    }

    #[test]
    fn test_shutdown_releases_consumers() {
        let queue = Arc::new(AdmissionQueue::new());
        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                thread::spawn(move || queue.pop_blocking().is_none())
            })
            .collect();

        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        for consumer in consumers {
            assert!(consumer.join().unwrap());
        }
        assert!(queue.is_shutdown());
        queue.push(key(1), 0);
        assert!(queue.try_pop().is_none());
    }
}
