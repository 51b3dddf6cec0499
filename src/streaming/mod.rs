//! Out-of-core node streaming: catalog, slot pool, admission queue and loaders

pub mod budget;
pub mod cache;
pub mod catalog;
pub mod loader;
pub mod queue;
pub mod reader;
pub mod slot_pool;

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

pub use budget::BudgetDispatcher;
pub use cache::{RefreshReport, StreamingCache};
pub use catalog::{Catalog, Resource, ResourceDesc, ResourceKind};
pub use loader::{LoadEvent, LoadHistory, LoaderPool, LoaderStats};
pub use queue::{AbortResult, AdmissionQueue, Job, JobStatus, QueryResult};
pub use reader::{
    FileRangeReader, FileReaderFactory, MemoryRangeReader, MemoryReaderFactory, RangeReader,
    ReaderFactory, build_nodes, write_nodes,
};
pub use slot_pool::{Backpressure, SlotBytes, SlotHandle, SlotPool, SlotState};

// Poisoned locks are recovered: no critical section leaves its data half
// updated when it panics.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(rw: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    rw.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(rw: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    rw.write().unwrap_or_else(PoisonError::into_inner)
}
