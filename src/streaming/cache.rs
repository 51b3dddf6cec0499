//! Streaming cache: the one entry point cut updaters and renderers use
//!
//! Ties the slot pool, the admission queue and the loader pool together.
//! Loads become visible only in [`StreamingCache::refresh`], which the cut
//! update threads call once per cycle.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::core::config::StreamingConfig;
use crate::core::error::Error;
use crate::core::types::{ContextId, NodeKey, Priority, Result};
use crate::streaming::catalog::Catalog;
use crate::streaming::loader::{LoadEvent, LoadHistory, LoaderPool, LoaderStats};
use crate::streaming::lock;
use crate::streaming::queue::{AbortResult, AdmissionQueue, QueryResult};
use crate::streaming::reader::ReaderFactory;
use crate::streaming::slot_pool::{SlotBytes, SlotHandle, SlotPool};

/// What one [`StreamingCache::refresh`] did
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RefreshReport {
    /// Loads that became resident
    pub resolved: usize,
    /// Loads thrown away (cancelled, or the key was already resident)
    pub discarded: usize,
    /// Loads whose read failed
    pub failed: usize,
}

impl RefreshReport {
    pub fn is_empty(&self) -> bool {
        self.resolved == 0 && self.discarded == 0 && self.failed == 0
    }
}

/// Out-of-core node cache shared by all rendering contexts
pub struct StreamingCache {
    config: StreamingConfig,
    catalog: Arc<Catalog>,
    pool: Arc<SlotPool>,
    queue: Arc<AdmissionQueue>,
    history: Arc<LoadHistory>,
    loader: Mutex<LoaderPool>,
    /// Loading jobs whose result should be dropped at refresh
    unwanted: Mutex<HashSet<NodeKey>>,
}

impl StreamingCache {
    /// Allocate the slot pool and start the loader threads
    ///
    /// # Arguments
    /// * `config` - Pool size, thread count and retry interval
    /// * `catalog` - Every resource served by this cache
    /// * `readers` - Opens byte-range readers for the loaders
    pub fn new(
        config: StreamingConfig,
        catalog: Catalog,
        readers: Arc<dyn ReaderFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let node_size = catalog
            .node_size()
            .ok_or_else(|| Error::Config("catalog has no resources".into()))?;
        let num_slots = config.num_slots(node_size).min(u32::MAX as usize) as u32;
        if num_slots == 0 {
            return Err(Error::Config(format!(
                "slot pool of {} bytes cannot hold a node of {} bytes",
                config.slot_pool_bytes, node_size
            )));
        }
        // A split uploads a whole sibling group in one cycle
        let max_fan = catalog
            .resources()
            .map(|r| r.fan_factor() as usize)
            .max()
            .unwrap_or(0);
        if config.transfer_budget < max_fan {
            return Err(Error::Config(format!(
                "transfer budget {} cannot pay for a split of {} children",
                config.transfer_budget, max_fan
            )));
        }

        let catalog = Arc::new(catalog);
        let pool = Arc::new(SlotPool::new(num_slots, node_size));
        let queue = Arc::new(AdmissionQueue::new());
        let history = Arc::new(LoadHistory::new());
        let loader = LoaderPool::spawn(
            &config,
            Arc::clone(&catalog),
            Arc::clone(&pool),
            Arc::clone(&queue),
            Arc::clone(&history),
            readers,
        )?;

        log::info!(
            "Streaming cache ready: {} resources, {} slots of {} bytes",
            catalog.len(),
            num_slots,
            node_size
        );

        Ok(Self {
            config,
            catalog,
            pool,
            queue,
            history,
            loader: Mutex::new(loader),
            unwanted: Mutex::new(HashSet::new()),
        })
    }

    /// Request `key` to be loaded
    ///
    /// Returns whether a new job was queued. A resident key only has the
    /// priority of any outstanding job raised.
    pub fn register(&self, key: NodeKey, priority: Priority) -> Result<bool> {
        self.catalog.resolve(key)?;

        if self.pool.is_resident(key) {
            self.queue.update_priority(key, priority);
            return Ok(false);
        }
        lock(&self.unwanted).remove(&key);
        Ok(self.queue.push(key, priority))
    }

    /// True if `key` is resident; its slot is then referenced by `context`
    /// until released
    pub fn is_resident_and_acquired(&self, context: ContextId, key: NodeKey) -> bool {
        self.pool.acquire(context, key)
    }

    pub fn acquire(&self, context: ContextId, key: NodeKey) -> bool {
        self.pool.acquire(context, key)
    }

    pub fn release(&self, context: ContextId, key: NodeKey) -> bool {
        self.pool.release(context, key)
    }

    /// Release, and free the slot right away if no context references it
    pub fn release_and_invalidate(&self, context: ContextId, key: NodeKey) -> bool {
        self.pool.release_and_invalidate(context, key)
    }

    pub fn is_resident(&self, key: NodeKey) -> bool {
        self.pool.is_resident(key)
    }

    /// Payload of `key`; only for resident nodes some context references
    pub fn data(&self, key: NodeKey) -> Option<SlotBytes<'_>> {
        let handle = self.pool.lookup(key)?;
        if !self.pool.is_referenced(key) {
            return None;
        }
        self.pool.read(handle)
    }

    pub fn slot_of(&self, key: NodeKey) -> Option<SlotHandle> {
        self.pool.lookup(key)
    }

    /// Withdraw a load request
    ///
    /// A waiting job is removed. A job already loading cannot be stopped; it is
    /// marked unwanted and its result dropped at the next refresh.
    pub fn cancel(&self, key: NodeKey) -> AbortResult {
        let result = self.queue.abort(key);
        if result == AbortResult::Failed && self.queue.query(key) == QueryResult::Loading {
            lock(&self.unwanted).insert(key);
        }
        result
    }

    /// Make finished loads resident
    ///
    /// Drains the load history, assigns each completed slot to its key and
    /// retires the jobs. Unwanted loads and loads of keys that are already
    /// resident give their slot back.
    pub fn refresh(&self) -> RefreshReport {
        let mut report = RefreshReport::default();

        for event in self.history.drain() {
            let key = event.key();
            let unwanted = lock(&self.unwanted).remove(&key);

            match event {
                LoadEvent::Completion { slot, .. } => {
                    if unwanted || self.pool.is_resident(key) || !self.pool.assign(slot, key) {
                        self.pool.unreserve(slot);
                        report.discarded += 1;
                    } else {
                        report.resolved += 1;
                    }
                }
                LoadEvent::Failure { .. } => report.failed += 1,
            }
            self.queue.complete(key);
        }

        if !report.is_empty() {
            log::debug!(
                "Refresh: {} resident, {} discarded, {} failed, {} waiting",
                report.resolved,
                report.discarded,
                report.failed,
                self.queue.num_waiting()
            );
        }
        report
    }

    /// Stop the loaders; pending jobs stay queued but are never loaded
    pub fn shutdown(&self) {
        lock(&self.loader).shutdown();
    }

    pub fn loader_stats(&self) -> LoaderStats {
        lock(&self.loader).stats()
    }

    pub fn begin_measure(&self) {
        lock(&self.loader).begin_measure();
    }

    /// Jobs waiting or being loaded
    pub fn num_pending(&self) -> usize {
        self.queue.num_waiting() + self.queue.num_loading()
    }

    pub fn query(&self, key: NodeKey) -> QueryResult {
        self.queue.query(key)
    }

    pub fn config(&self) -> &StreamingConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn slot_pool(&self) -> &SlotPool {
        &self.pool
    }
}
