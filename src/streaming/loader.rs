//! Loader pool: worker threads that move node payloads from disk into slots
//!
//! Workers pull the highest-priority job from the admission queue, reserve a
//! slot, read the node's byte range and append the outcome to the shared load
//! history. Nothing becomes visible to readers until the cache resolves the
//! history in `refresh`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::core::config::StreamingConfig;
use crate::core::types::{NodeKey, ResourceId, Result};
use crate::streaming::catalog::Catalog;
use crate::streaming::lock;
use crate::streaming::queue::AdmissionQueue;
use crate::streaming::reader::{RangeReader, ReaderFactory};
use crate::streaming::slot_pool::{SlotHandle, SlotPool};

/// Outcome of one load, recorded for the next `refresh`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadEvent {
    /// Payload written into the reserved slot
    Completion { key: NodeKey, slot: SlotHandle },
    /// Read failed; the slot was already returned
    Failure { key: NodeKey },
}

impl LoadEvent {
    pub fn key(&self) -> NodeKey {
        match *self {
            LoadEvent::Completion { key, .. } | LoadEvent::Failure { key } => key,
        }
    }
}

/// Completed loads not yet seen by the cache
#[derive(Debug, Default)]
pub struct LoadHistory {
    events: Mutex<Vec<LoadEvent>>,
}

impl LoadHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, event: LoadEvent) {
        lock(&self.events).push(event);
    }

    /// Take every recorded event, oldest first
    pub fn drain(&self) -> Vec<LoadEvent> {
        std::mem::take(&mut *lock(&self.events))
    }

    pub fn len(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Loader statistics since the last [`LoaderPool::begin_measure`]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LoaderStats {
    pub bytes_loaded: u64,
    pub nodes_loaded: u64,
    pub failures: u64,
    pub backpressure_waits: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    bytes_loaded: AtomicU64,
    nodes_loaded: AtomicU64,
    failures: AtomicU64,
    backpressure_waits: AtomicU64,
}

impl StatsCounters {
    fn snapshot(&self) -> LoaderStats {
        LoaderStats {
            bytes_loaded: self.bytes_loaded.load(Ordering::Relaxed),
            nodes_loaded: self.nodes_loaded.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            backpressure_waits: self.backpressure_waits.load(Ordering::Relaxed),
        }
    }

    fn reset(&self) {
        self.bytes_loaded.store(0, Ordering::Relaxed);
        self.nodes_loaded.store(0, Ordering::Relaxed);
        self.failures.store(0, Ordering::Relaxed);
        self.backpressure_waits.store(0, Ordering::Relaxed);
    }
}

/// State shared by all workers
struct Shared {
    catalog: Arc<Catalog>,
    pool: Arc<SlotPool>,
    queue: Arc<AdmissionQueue>,
    history: Arc<LoadHistory>,
    readers: Arc<dyn ReaderFactory>,
    stats: StatsCounters,
    shutdown: AtomicBool,
    retry_interval: Duration,
}

/// Fixed set of loader threads
pub struct LoaderPool {
    workers: Vec<JoinHandle<()>>,
    shared: Arc<Shared>,
}

impl LoaderPool {
    /// Start `config.loader_threads` workers
    ///
    /// # Arguments
    /// * `config` - Thread count and backpressure retry interval
    /// * `catalog` - Resolves keys to resources and byte ranges
    /// * `pool` - Slots the payloads are written into
    /// * `queue` - Jobs to load
    /// * `history` - Receives one event per finished job
    /// * `readers` - Opens a reader per resource for each worker
    pub fn spawn(
        config: &StreamingConfig,
        catalog: Arc<Catalog>,
        pool: Arc<SlotPool>,
        queue: Arc<AdmissionQueue>,
        history: Arc<LoadHistory>,
        readers: Arc<dyn ReaderFactory>,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            catalog,
            pool,
            queue,
            history,
            readers,
            stats: StatsCounters::default(),
            shutdown: AtomicBool::new(false),
            retry_interval: Duration::from_millis(config.retry_interval_ms.max(1)),
        });

        let mut loader = Self {
            workers: Vec::with_capacity(config.loader_threads),
            shared,
        };
        for id in 0..config.loader_threads {
            let shared = Arc::clone(&loader.shared);
            let handle = thread::Builder::new()
                .name(format!("lodstream-loader-{}", id))
                .spawn(move || worker_loop(id, shared));
            match handle {
                Ok(handle) => loader.workers.push(handle),
                Err(e) => {
                    loader.shutdown();
                    return Err(e.into());
                }
            }
        }

        log::info!("Started {} loader threads", loader.workers.len());
        Ok(loader)
    }

    pub fn num_workers(&self) -> usize {
        self.workers.len()
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Reset the statistics counters
    pub fn begin_measure(&self) {
        self.shared.stats.reset();
    }

    pub fn stats(&self) -> LoaderStats {
        self.shared.stats.snapshot()
    }

    /// Stop all workers and wait for them
    ///
    /// A read in progress is finished and recorded; a job parked on
    /// backpressure goes back to the queue.
    pub fn shutdown(&mut self) {
        if self.workers.is_empty() {
            return;
        }
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.queue.shutdown();

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                log::error!("Loader thread panicked");
            }
        }
        log::info!("Loader threads stopped");
    }
}

impl Drop for LoaderPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(id: usize, shared: Arc<Shared>) {
    log::debug!("Loader {} started", id);

    let mut readers: HashMap<ResourceId, Box<dyn RangeReader>> = HashMap::new();
    let mut buf = Vec::new();

    while let Some(mut job) = shared.queue.pop_blocking() {
        if shared.shutdown.load(Ordering::Acquire) {
            shared.queue.requeue(job);
            break;
        }

        let priority = job.priority;
        let slot = match shared.pool.reserve(priority) {
            Ok(slot) => slot,
            Err(_) => {
                // Stall: park the job and wait for a slot it may take
                shared.stats.backpressure_waits.fetch_add(1, Ordering::Relaxed);
                shared.queue.requeue(job);
                shared.pool.wait_for_slot(priority, shared.retry_interval);
                continue;
            }
        };
        job.slot = Some(slot);

        match read_node(&shared, &mut readers, job.key, &mut buf) {
            Ok(()) => {
                shared.pool.write(slot, &buf);
                shared.stats.bytes_loaded.fetch_add(buf.len() as u64, Ordering::Relaxed);
                shared.stats.nodes_loaded.fetch_add(1, Ordering::Relaxed);
                shared.history.push(LoadEvent::Completion { key: job.key, slot });
                log::trace!("Loader {} loaded {} into slot {}", id, job.key, slot.index());
            }
            Err(e) => {
                log::warn!("Loader {} failed to load {}: {}", id, job.key, e);
                readers.remove(&job.key.resource);
                shared.pool.unreserve(slot);
                shared.stats.failures.fetch_add(1, Ordering::Relaxed);
                shared.history.push(LoadEvent::Failure { key: job.key });
            }
        }
    }

    log::debug!("Loader {} stopped", id);
}

/// Read a node's payload into `buf`, opening the resource's reader on first use
fn read_node(
    shared: &Shared,
    readers: &mut HashMap<ResourceId, Box<dyn RangeReader>>,
    key: NodeKey,
    buf: &mut Vec<u8>,
) -> Result<()> {
    let resource = shared.catalog.resolve(key)?;
    let (offset, len) = resource.byte_range(key.node);

    let reader = match readers.entry(key.resource) {
        std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
        std::collections::hash_map::Entry::Vacant(entry) => {
            entry.insert(shared.readers.open(resource)?)
        }
    };

    buf.resize(len, 0);
    reader.read_at(offset, buf)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streaming::catalog::ResourceDesc;
    use crate::streaming::reader::{MemoryReaderFactory, build_nodes};
    use std::time::Instant;

    struct Fixture {
        pool: Arc<SlotPool>,
        queue: Arc<AdmissionQueue>,
        history: Arc<LoadHistory>,
        loader: LoaderPool,
    }

    fn fixture(slots: u32, threads: usize, with_data: bool) -> Fixture {
        let catalog = Arc::new(Catalog::from_descs([ResourceDesc::geometry("mem", 2, 3, 4)]).unwrap());
        let mut readers = MemoryReaderFactory::new();
        if with_data {
            let resource = catalog.get(0).unwrap();
            readers.insert(0, build_nodes(resource, |node, buf| buf.fill(node as u8)));
        }
        let config = StreamingConfig {
            loader_threads: threads,
            retry_interval_ms: 1,
            ..Default::default()
        };
        let pool = Arc::new(SlotPool::new(slots, 4));
        let queue = Arc::new(AdmissionQueue::new());
        let history = Arc::new(LoadHistory::new());
        let loader = LoaderPool::spawn(
            &config,
            catalog,
            Arc::clone(&pool),
            Arc::clone(&queue),
            Arc::clone(&history),
            Arc::new(readers),
        )
        .unwrap();
        Fixture { pool, queue, history, loader }
    }

    fn wait_for_events(history: &LoadHistory, count: usize) {
        let start = Instant::now();
        while history.len() < count {
            assert!(start.elapsed() < Duration::from_secs(5), "timed out waiting for loads");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_loads_into_slot() {
        let mut f = fixture(4, 2, true);
        f.queue.push(NodeKey::new(0, 5), 1);
        wait_for_events(&f.history, 1);
        f.loader.shutdown();

        let events = f.history.drain();
        let LoadEvent::Completion { key, slot } = events[0] else {
            panic!("expected completion, got {:?}", events[0]);
        };
        assert_eq!(key, NodeKey::new(0, 5));

        // Still reserved until the cache assigns it
        assert!(f.pool.read(slot).is_none());
        assert!(f.pool.assign(slot, key));
        assert_eq!(&*f.pool.read(slot).unwrap(), &[5, 5, 5, 5]);

        let stats = f.loader.stats();
        assert_eq!(stats.nodes_loaded, 1);
        assert_eq!(stats.bytes_loaded, 4);
    }

    #[test]
    fn test_failure_releases_slot() {
        let mut f = fixture(1, 1, false);
        f.queue.push(NodeKey::new(0, 1), 1);
        wait_for_events(&f.history, 1);
        f.loader.shutdown();

        assert_eq!(f.history.drain(), vec![LoadEvent::Failure { key: NodeKey::new(0, 1) }]);
        assert_eq!(f.pool.num_free(), 1);
        assert_eq!(f.loader.stats().failures, 1);
    }

    #[test]
    fn test_backpressure_parks_job() {
        let mut f = fixture(1, 2, true);
        let held = f.pool.reserve(0).unwrap();

        f.queue.push(NodeKey::new(0, 2), 1);
        let start = Instant::now();
        while f.loader.stats().backpressure_waits == 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
        }
        assert!(f.history.is_empty());

        // Freeing the slot lets the parked job through
        f.pool.unreserve(held);
        wait_for_events(&f.history, 1);
        f.loader.shutdown();
        assert!(matches!(f.history.drain()[0], LoadEvent::Completion { .. }));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut f = fixture(2, 3, true);
        assert_eq!(f.loader.num_workers(), 3);
        f.loader.shutdown();
        f.loader.shutdown();
        assert!(!f.loader.is_running());
        assert!(f.queue.is_shutdown());
    }

    #[test]
    fn test_begin_measure_resets() {
        let mut f = fixture(8, 2, true);
        for node in 0..4 {
            f.queue.push(NodeKey::new(0, node), 0);
        }
        wait_for_events(&f.history, 4);
        assert_eq!(f.loader.stats().nodes_loaded, 4);
        f.loader.begin_measure();
        assert_eq!(f.loader.stats(), LoaderStats::default());
        f.loader.shutdown();
    }
}
