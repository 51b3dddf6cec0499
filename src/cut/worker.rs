//! Background cut update thread, one per rendering context
//!
//! The render loop calls [`CutUpdateThread::dispatch`] once per frame; the
//! thread then runs one update cycle. Dispatches arriving while a cycle runs
//! are merged into the next one.

use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::core::types::{ContextId, Result};
use crate::cut::update::{CutUpdater, CycleReport, LodMetric};
use crate::streaming::lock;

/// How long the idle thread sleeps before re-checking for shutdown
const WAKE_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
struct Signal {
    requested: bool,
    stop: bool,
    cycles: u64,
    last_report: Option<CycleReport>,
}

#[derive(Debug, Default)]
struct Shared {
    signal: Mutex<Signal>,
    /// Wakes the update thread
    wake: Condvar,
    /// Wakes callers waiting for a cycle to finish
    done: Condvar,
}

/// Thread running [`CutUpdater::run_cycle`] on demand
pub struct CutUpdateThread {
    context: ContextId,
    shared: Arc<Shared>,
    handle: Option<JoinHandle<CutUpdater>>,
}

impl CutUpdateThread {
    /// Start the update thread of `updater`'s context
    pub fn spawn(updater: CutUpdater, metric: Arc<dyn LodMetric>) -> Result<Self> {
        let context = updater.context();
        let shared = Arc::new(Shared::default());
        let thread_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("lodstream-cut-{}", context))
            .spawn(move || run(updater, metric, thread_shared))?;

        log::info!("Started cut update thread for context {}", context);
        Ok(Self {
            context,
            shared,
            handle: Some(handle),
        })
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    /// Request an update cycle
    pub fn dispatch(&self) {
        lock(&self.shared.signal).requested = true;
        self.shared.wake.notify_one();
    }

    /// Cycles completed so far
    pub fn cycles(&self) -> u64 {
        lock(&self.shared.signal).cycles
    }

    pub fn last_report(&self) -> Option<CycleReport> {
        lock(&self.shared.signal).last_report
    }

    /// Block until at least `cycles` cycles have completed or `timeout` passes.
    /// Returns whether the count was reached.
    pub fn wait_for_cycles(&self, cycles: u64, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut signal = lock(&self.shared.signal);
        while signal.cycles < cycles {
            let now = Instant::now();
            if now >= deadline || self.handle.is_none() {
                return false;
            }
            signal = self
                .shared
                .done
                .wait_timeout(signal, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
        true
    }

    /// Stop the thread after its current cycle and hand the updater back
    pub fn stop(&mut self) -> Option<CutUpdater> {
        let handle = self.handle.take()?;
        lock(&self.shared.signal).stop = true;
        self.shared.wake.notify_one();

        match handle.join() {
            Ok(updater) => {
                log::info!("Stopped cut update thread for context {}", self.context);
                Some(updater)
            }
            Err(_) => {
                log::error!("Cut update thread for context {} panicked", self.context);
                None
            }
        }
    }
}

impl Drop for CutUpdateThread {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(mut updater: CutUpdater, metric: Arc<dyn LodMetric>, shared: Arc<Shared>) -> CutUpdater {
    loop {
        {
            let mut signal = lock(&shared.signal);
            while !signal.requested && !signal.stop {
                signal = shared
                    .wake
                    .wait_timeout(signal, WAKE_INTERVAL)
                    .unwrap_or_else(|e| e.into_inner())
                    .0;
            }
            if signal.stop {
                break;
            }
            signal.requested = false;
        }

        let report = updater.run_cycle(metric.as_ref());

        let mut signal = lock(&shared.signal);
        signal.cycles += 1;
        signal.last_report = Some(report);
        shared.done.notify_all();
    }
    updater
}
