//! Double-buffered cut
//!
//! The update thread edits the back buffer, the renderer reads the front one.
//! Publishing only try-locks the front buffer, so a renderer holding it never
//! stalls the update thread; the copy is then delivered by the next reader
//! that finds the back buffer free.

use std::collections::BTreeMap;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, TryLockError};

use crate::core::types::NodeId;
use crate::streaming::SlotHandle;
use crate::streaming::lock;

/// A node that entered the frontier and whose slot must be uploaded
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SlotUpdate {
    pub node: NodeId,
    pub slot: SlotHandle,
}

/// The accepted frontier of one (context, view, resource)
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CutState {
    /// Frontier nodes and their slots. A slot is `None` only for the root of a
    /// fresh cut that has not been loaded yet.
    pub nodes: BTreeMap<NodeId, Option<SlotHandle>>,
    /// Uploads pending since the renderer last received this cut
    pub updates: Vec<SlotUpdate>,
    /// Incremented on every publish
    pub generation: u64,
}

impl Default for CutState {
    fn default() -> Self {
        Self::new()
    }
}

impl CutState {
    /// Fresh cut: just the root, not yet resident
    pub fn new() -> Self {
        Self {
            nodes: BTreeMap::from([(0, None)]),
            updates: Vec::new(),
            generation: 0,
        }
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.nodes.contains_key(&node)
    }

    pub fn slot(&self, node: NodeId) -> Option<SlotHandle> {
        self.nodes.get(&node).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Frontier node ids in ascending order
    pub fn frontier(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }

    /// Frontier nodes that can be drawn (their slot is known)
    pub fn drawable(&self) -> impl Iterator<Item = (NodeId, SlotHandle)> + '_ {
        self.nodes
            .iter()
            .filter_map(|(&node, slot)| slot.map(|slot| (node, slot)))
    }
}

/// Outcome of [`DoubleBufferedCut::publish`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapResult {
    /// The front buffer now holds the new state
    Published,
    /// A reader held the front buffer; the state is delivered on a later read
    Deferred,
}

/// Read guard over the front buffer
pub struct FrontCut<'a> {
    guard: MutexGuard<'a, CutState>,
}

impl Deref for FrontCut<'_> {
    type Target = CutState;

    fn deref(&self) -> &CutState {
        &self.guard
    }
}

/// Front/back pair of one cut
#[derive(Debug, Default)]
pub struct DoubleBufferedCut {
    back: Mutex<CutState>,
    front: Mutex<CutState>,
    /// Back buffer holds a state the front has not received yet
    pending: AtomicBool,
}

impl DoubleBufferedCut {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lock the back buffer for editing (update thread only)
    pub fn write(&self) -> MutexGuard<'_, CutState> {
        lock(&self.back)
    }

    /// Finish editing and hand the state to readers if none is reading
    pub fn publish(&self, mut back: MutexGuard<'_, CutState>) -> SwapResult {
        back.generation += 1;

        let front = match self.front.try_lock() {
            Ok(front) => front,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => {
                self.pending.store(true, Ordering::Release);
                return SwapResult::Deferred;
            }
        };
        Self::deliver(front, &mut back);
        self.pending.store(false, Ordering::Release);
        SwapResult::Published
    }

    /// Lock the front buffer for reading
    ///
    /// A state whose publish was deferred is delivered first, unless the
    /// update thread is editing the back buffer right now.
    pub fn read(&self) -> FrontCut<'_> {
        let mut front = lock(&self.front);

        if self.pending.load(Ordering::Acquire) {
            let back = match self.back.try_lock() {
                Ok(back) => Some(back),
                Err(TryLockError::Poisoned(e)) => Some(e.into_inner()),
                Err(TryLockError::WouldBlock) => None,
            };
            if let Some(mut back) = back {
                // Re-check under the back lock: publish may have delivered since
                if self.pending.swap(false, Ordering::AcqRel) {
                    front.clone_from(&*back);
                    back.updates.clear();
                }
            }
        }

        FrontCut { guard: front }
    }

    /// Whether a published state is still waiting for delivery
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    fn deliver(mut front: MutexGuard<'_, CutState>, back: &mut CutState) {
        front.clone_from(back);
        back.updates.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn set_frontier(state: &mut CutState, nodes: &[NodeId]) {
        state.nodes = nodes.iter().map(|&n| (n, None)).collect();
    }

    #[test]
    fn test_new_cut_has_root() {
        let cut = DoubleBufferedCut::new();
        let front = cut.read();
        assert_eq!(front.frontier().collect::<Vec<_>>(), vec![0]);
        assert_eq!(front.slot(0), None);
        assert_eq!(front.drawable().count(), 0);
        assert_eq!(front.generation, 0);
    }

    #[test]
    fn test_publish_without_reader() {
        let cut = DoubleBufferedCut::new();
        let mut back = cut.write();
        set_frontier(&mut back, &[1, 2]);
        assert_eq!(cut.publish(back), SwapResult::Published);
        assert!(!cut.is_pending());

        let front = cut.read();
        assert_eq!(front.frontier().collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(front.generation, 1);
    }

    #[test]
    fn test_publish_deferred_while_reading() {
        let cut = DoubleBufferedCut::new();

        let reader = cut.read();
        let mut back = cut.write();
        set_frontier(&mut back, &[1, 2]);
        assert_eq!(cut.publish(back), SwapResult::Deferred);
        assert!(cut.is_pending());

        // The held front is unchanged
        assert_eq!(reader.frontier().collect::<Vec<_>>(), vec![0]);
        drop(reader);

        // The next read delivers the deferred state
        let front = cut.read();
        assert_eq!(front.frontier().collect::<Vec<_>>(), vec![1, 2]);
        assert!(!cut.is_pending());
    }

    #[test]
    fn test_read_does_not_deliver_while_writing() {
        let cut = DoubleBufferedCut::new();
        {
            let _reader = cut.read();
            let mut back = cut.write();
            set_frontier(&mut back, &[1, 2]);
            cut.publish(back);
        }

        // Update thread is editing again: the reader keeps the old front
        let mut back = cut.write();
        set_frontier(&mut back, &[3, 4]);
        assert_eq!(cut.read().frontier().collect::<Vec<_>>(), vec![0]);
        assert_eq!(cut.publish(back), SwapResult::Published);
        assert_eq!(cut.read().frontier().collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn test_updates_cleared_after_delivery() {
        let cut = DoubleBufferedCut::new();
        let pool = crate::streaming::SlotPool::new(1, 4);
        let slot = pool.reserve(0).unwrap();

        let mut back = cut.write();
        back.updates.push(SlotUpdate { node: 0, slot });
        cut.publish(back);

        assert_eq!(cut.read().updates.len(), 1);
        assert!(cut.write().updates.is_empty());
    }

    #[test]
    fn test_front_is_never_torn() {
        // Every published state has all node ids in one decade; a reader must
        // never see a mix of two states.
        let cut = Arc::new(DoubleBufferedCut::new());
        let writer = {
            let cut = Arc::clone(&cut);
            thread::spawn(move || {
                for round in 1..500u64 {
                    let mut back = cut.write();
                    let nodes: Vec<NodeId> = (0..8).map(|i| round * 10 + i % 10).collect();
                    set_frontier(&mut back, &nodes);
                    cut.publish(back);
                }
            })
        };

        let mut last_generation = 0;
        for _ in 0..2000 {
            let front = cut.read();
            let decades: std::collections::HashSet<_> = front.frontier().map(|n| n / 10).collect();
            assert!(decades.len() <= 1, "torn cut: {:?}", front.nodes);
            assert!(front.generation >= last_generation);
            last_generation = front.generation;
        }
        writer.join().unwrap();
    }
}
