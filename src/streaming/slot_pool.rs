//! Slot Pool - fixed-size memory slots with LRU eviction
//!
//! Based on the brick pool concept:
//! - Fixed capacity, allocated once, slots are recycled and never freed
//! - Index from (resource, node) to slot for O(1) residency checks
//! - LRU eviction, but never of a slot some context still references
//!
//! The LRU list only links slots that may be handed out by `reserve()`:
//! free slots sit at the head, unreferenced occupied slots follow in order of
//! last use. Reserved slots and referenced slots are unlinked, which is what
//! makes "never evict a referenced slot" hold structurally.
//!
//! A freshly loaded slot keeps the priority of the job that loaded it until a
//! context first uses it, and only a job of at least that priority may evict
//! it. Once used and released it is ordinary LRU data again.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::ops::Deref;
use std::sync::{Condvar, Mutex, RwLock, RwLockReadGuard};
use std::time::Duration;

use crate::core::types::{ContextId, NodeKey, Priority};
use crate::streaming::{lock, read_lock, write_lock};

/// Handle to a slot: arena index plus generation
///
/// The generation changes whenever the slot is reserved for new data or
/// invalidated, so a handle kept past eviction no longer resolves.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct SlotHandle {
    index: u32,
    generation: u32,
}

impl SlotHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

/// Lifecycle of a slot
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    /// Holds nothing
    Free,
    /// Handed to a loader, data is being written
    Reserved,
    /// Holds the data of its key
    Occupied,
}

/// No slot can be reserved right now; retry later
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backpressure;

impl fmt::Display for Backpressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "all slots are reserved or referenced")
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct Links {
    prev: Option<u32>,
    next: Option<u32>,
}

#[derive(Clone, Debug)]
struct SlotMeta {
    state: SlotState,
    key: Option<NodeKey>,
    generation: u32,
    /// Priority of the load that filled the slot, `MIN` once used
    priority: Priority,
    /// Contexts holding a reference
    refs: BTreeSet<ContextId>,
    /// Position in the LRU list, `None` while unlinked
    links: Option<Links>,
}

impl SlotMeta {
    fn free() -> Self {
        Self {
            state: SlotState::Free,
            key: None,
            generation: 0,
            priority: Priority::MIN,
            refs: BTreeSet::new(),
            links: None,
        }
    }
}

/// Doubly linked list threaded through the slot array by index
#[derive(Debug, Default)]
struct LruList {
    head: Option<u32>,
    tail: Option<u32>,
    len: usize,
}

impl LruList {
    fn push_front(&mut self, slots: &mut [SlotMeta], idx: u32) {
        debug_assert!(slots[idx as usize].links.is_none(), "slot {} already linked", idx);
        slots[idx as usize].links = Some(Links { prev: None, next: self.head });
        match self.head {
            Some(head) => Self::set_prev(slots, head, Some(idx)),
            None => self.tail = Some(idx),
        }
        self.head = Some(idx);
        self.len += 1;
    }

    fn push_back(&mut self, slots: &mut [SlotMeta], idx: u32) {
        debug_assert!(slots[idx as usize].links.is_none(), "slot {} already linked", idx);
        slots[idx as usize].links = Some(Links { prev: self.tail, next: None });
        match self.tail {
            Some(tail) => Self::set_next(slots, tail, Some(idx)),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
        self.len += 1;
    }

    /// Remove `idx` from the list; no-op if it is not linked
    fn unlink(&mut self, slots: &mut [SlotMeta], idx: u32) {
        let Some(links) = slots[idx as usize].links.take() else {
            return;
        };
        match links.prev {
            Some(prev) => Self::set_next(slots, prev, links.next),
            None => self.head = links.next,
        }
        match links.next {
            Some(next) => Self::set_prev(slots, next, links.prev),
            None => self.tail = links.prev,
        }
        self.len -= 1;
    }

    fn set_prev(slots: &mut [SlotMeta], idx: u32, prev: Option<u32>) {
        if let Some(links) = slots[idx as usize].links.as_mut() {
            links.prev = prev;
        }
    }

    fn set_next(slots: &mut [SlotMeta], idx: u32, next: Option<u32>) {
        if let Some(links) = slots[idx as usize].links.as_mut() {
            links.next = next;
        }
    }

    #[cfg(test)]
    fn order(&self, slots: &[SlotMeta]) -> Vec<u32> {
        let mut order = Vec::with_capacity(self.len);
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            order.push(idx);
            cursor = slots[idx as usize].links.and_then(|l| l.next);
        }
        order
    }
}

/// Slot metadata and the key map, guarded together
#[derive(Debug)]
struct SlotIndex {
    slots: Vec<SlotMeta>,
    lru: LruList,
    map: HashMap<NodeKey, u32>,
}

impl SlotIndex {
    /// Metadata for a handle whose generation is still current
    fn current(&mut self, handle: SlotHandle) -> Option<&mut SlotMeta> {
        self.slots
            .get_mut(handle.index as usize)
            .filter(|slot| slot.generation == handle.generation)
    }

    /// First linked slot a load of `priority` may take: free, or holding
    /// data loaded at no higher priority
    fn reservable(&self, priority: Priority) -> Option<u32> {
        let mut cursor = self.lru.head;
        while let Some(idx) = cursor {
            let slot = &self.slots[idx as usize];
            if slot.state == SlotState::Free || slot.priority <= priority {
                return Some(idx);
            }
            cursor = slot.links.and_then(|l| l.next);
        }
        None
    }

    fn handle(&self, idx: u32) -> SlotHandle {
        SlotHandle {
            index: idx,
            generation: self.slots[idx as usize].generation,
        }
    }
}

/// Read access to the bytes of an occupied slot
///
/// Holding this blocks any loader from overwriting the slot.
pub struct SlotBytes<'a> {
    guard: RwLockReadGuard<'a, Box<[u8]>>,
    handle: SlotHandle,
}

impl SlotBytes<'_> {
    pub fn handle(&self) -> SlotHandle {
        self.handle
    }

    /// View the payload as a slice of plain-old-data elements
    pub fn cast<T: bytemuck::Pod>(&self) -> Option<&[T]> {
        bytemuck::try_cast_slice(&self.guard).ok()
    }
}

impl Deref for SlotBytes<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.guard
    }
}

/// Fixed pool of equally sized slots
pub struct SlotPool {
    index: Mutex<SlotIndex>,
    data: Vec<RwLock<Box<[u8]>>>,
    slot_size: usize,
    /// Signalled whenever a slot becomes reservable
    available: Condvar,
}

impl SlotPool {
    /// Create a pool of `num_slots` slots of `slot_size` bytes each
    pub fn new(num_slots: u32, slot_size: usize) -> Self {
        let mut slots = vec![SlotMeta::free(); num_slots as usize];
        let mut lru = LruList::default();
        for idx in 0..num_slots {
            lru.push_back(&mut slots, idx);
        }
        let data = (0..num_slots)
            .map(|_| RwLock::new(vec![0u8; slot_size].into_boxed_slice()))
            .collect();

        log::info!(
            "Created slot pool: {} slots x {} bytes ({} MB)",
            num_slots,
            slot_size,
            num_slots as usize * slot_size / 1024 / 1024
        );

        Self {
            index: Mutex::new(SlotIndex {
                slots,
                lru,
                map: HashMap::with_capacity(num_slots as usize),
            }),
            data,
            slot_size,
            available: Condvar::new(),
        }
    }

    /// Take the least recently used slot a load of `priority` may evict
    ///
    /// Any key the slot held is dropped from the index. Fails with
    /// [`Backpressure`] when every slot is reserved, referenced, or holds
    /// unused data loaded at a higher priority.
    pub fn reserve(&self, priority: Priority) -> Result<SlotHandle, Backpressure> {
        let mut index = lock(&self.index);
        let index = &mut *index;
        let idx = index.reservable(priority).ok_or(Backpressure)?;
        index.lru.unlink(&mut index.slots, idx);

        let slot = &mut index.slots[idx as usize];
        debug_assert!(slot.refs.is_empty(), "referenced slot {} was in the LRU list", idx);
        if let Some(key) = slot.key.take() {
            index.map.remove(&key);
            log::trace!("Evicted {} from slot {}", key, idx);
        }
        slot.state = SlotState::Reserved;
        slot.priority = priority;
        slot.generation = slot.generation.wrapping_add(1);

        Ok(index.handle(idx))
    }

    /// Bind a reserved slot to `key` and make it resident
    ///
    /// Returns false (and changes nothing) if the handle is stale, the slot is
    /// not reserved, or another slot already owns `key`.
    pub fn assign(&self, handle: SlotHandle, key: NodeKey) -> bool {
        let mut index = lock(&self.index);
        let index = &mut *index;

        if index.map.contains_key(&key) {
            debug_assert!(false, "key {} is already resident", key);
            return false;
        }
        let Some(slot) = index.current(handle) else {
            debug_assert!(false, "assign with stale handle {:?}", handle);
            return false;
        };
        if slot.state != SlotState::Reserved {
            debug_assert!(false, "assign to unreserved slot {:?}", handle);
            return false;
        }

        slot.state = SlotState::Occupied;
        slot.key = Some(key);
        index.map.insert(key, handle.index);
        index.lru.push_back(&mut index.slots, handle.index);
        log::trace!("Assigned {} to slot {}", key, handle.index);

        self.available.notify_all();
        true
    }

    /// Return a reserved slot without data (failed or discarded load)
    pub fn unreserve(&self, handle: SlotHandle) -> bool {
        let mut index = lock(&self.index);
        let index = &mut *index;

        let Some(slot) = index.current(handle) else {
            return false;
        };
        if slot.state != SlotState::Reserved {
            return false;
        }
        slot.state = SlotState::Free;
        slot.priority = Priority::MIN;
        slot.generation = slot.generation.wrapping_add(1);
        index.lru.push_front(&mut index.slots, handle.index);

        self.available.notify_all();
        true
    }

    /// Copy loaded bytes into a reserved slot
    pub fn write(&self, handle: SlotHandle, bytes: &[u8]) -> bool {
        {
            let mut index = lock(&self.index);
            match index.current(handle) {
                Some(slot) if slot.state == SlotState::Reserved => {}
                _ => return false,
            }
        }
        let Some(cell) = self.data.get(handle.index as usize) else {
            return false;
        };
        let mut buf = write_lock(cell);
        let len = bytes.len().min(buf.len());
        buf[..len].copy_from_slice(&bytes[..len]);
        buf[len..].fill(0);
        true
    }

    /// Bytes of an occupied slot, if the handle is still current
    pub fn read(&self, handle: SlotHandle) -> Option<SlotBytes<'_>> {
        let guard = read_lock(self.data.get(handle.index as usize)?);
        let mut index = lock(&self.index);
        match index.current(handle) {
            Some(slot) if slot.state == SlotState::Occupied => Some(SlotBytes { guard, handle }),
            _ => None,
        }
    }

    /// Slot holding `key`
    pub fn lookup(&self, key: NodeKey) -> Option<SlotHandle> {
        let index = lock(&self.index);
        index.map.get(&key).map(|&idx| index.handle(idx))
    }

    pub fn is_resident(&self, key: NodeKey) -> bool {
        lock(&self.index).map.contains_key(&key)
    }

    /// Add `context` to the references of `key`'s slot
    ///
    /// Returns false if `key` is not resident.
    pub fn acquire(&self, context: ContextId, key: NodeKey) -> bool {
        let mut index = lock(&self.index);
        let index = &mut *index;

        let Some(&idx) = index.map.get(&key) else {
            return false;
        };
        let slot = &mut index.slots[idx as usize];
        if slot.refs.insert(context) && slot.refs.len() == 1 {
            index.lru.unlink(&mut index.slots, idx);
        }
        true
    }

    /// Drop `context`'s reference; the slot becomes evictable (most recently
    /// used) once no references remain. Returns false if nothing was held.
    pub fn release(&self, context: ContextId, key: NodeKey) -> bool {
        let mut index = lock(&self.index);
        let index = &mut *index;

        let Some(&idx) = index.map.get(&key) else {
            return false;
        };
        let slot = &mut index.slots[idx as usize];
        if !slot.refs.remove(&context) {
            return false;
        }
        if slot.refs.is_empty() {
            slot.priority = Priority::MIN;
            index.lru.push_back(&mut index.slots, idx);
            self.available.notify_all();
        }
        true
    }

    /// Like [`release`](Self::release), but if this was the last reference the
    /// key is dropped from the index and the slot freed for immediate reuse.
    ///
    /// Returns true only if the slot was invalidated by this call.
    pub fn release_and_invalidate(&self, context: ContextId, key: NodeKey) -> bool {
        let mut index = lock(&self.index);
        let index = &mut *index;

        let Some(&idx) = index.map.get(&key) else {
            return false;
        };
        let slot = &mut index.slots[idx as usize];
        if !slot.refs.remove(&context) || !slot.refs.is_empty() {
            return false;
        }

        slot.key = None;
        slot.state = SlotState::Free;
        slot.priority = Priority::MIN;
        slot.generation = slot.generation.wrapping_add(1);
        index.map.remove(&key);
        index.lru.push_front(&mut index.slots, idx);
        log::trace!("Invalidated {} in slot {}", key, idx);

        self.available.notify_all();
        true
    }

    /// Number of contexts referencing `key`
    pub fn references(&self, key: NodeKey) -> usize {
        let index = lock(&self.index);
        index
            .map
            .get(&key)
            .map_or(0, |&idx| index.slots[idx as usize].refs.len())
    }

    pub fn is_referenced(&self, key: NodeKey) -> bool {
        self.references(key) > 0
    }

    /// Block until a load of `priority` may find a slot or `timeout` passes
    pub fn wait_for_slot(&self, priority: Priority, timeout: Duration) {
        let index = lock(&self.index);
        if index.reservable(priority).is_none() {
            let _ = self
                .available
                .wait_timeout(index, timeout)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    pub fn capacity(&self) -> u32 {
        self.data.len() as u32
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn num_free(&self) -> usize {
        self.count_state(SlotState::Free)
    }

    pub fn num_reserved(&self) -> usize {
        self.count_state(SlotState::Reserved)
    }

    pub fn num_occupied(&self) -> usize {
        self.count_state(SlotState::Occupied)
    }

    /// Slots with at least one reference
    pub fn num_referenced(&self) -> usize {
        lock(&self.index)
            .slots
            .iter()
            .filter(|s| !s.refs.is_empty())
            .count()
    }

    /// Slots not reserved or referenced; unused data loaded at a high priority
    /// counts even though lower-priority loads cannot take it
    pub fn num_evictable(&self) -> usize {
        lock(&self.index).lru.len
    }

    /// Pool utilization percentage (occupied slots)
    pub fn utilization(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.num_occupied() as f32 / self.data.len() as f32 * 100.0
    }

    fn count_state(&self, state: SlotState) -> usize {
        lock(&self.index)
            .slots
            .iter()
            .filter(|s| s.state == state)
            .count()
    }

    /// Keys in eviction order (next victim first), free slots skipped
    #[cfg(test)]
    fn eviction_order(&self) -> Vec<NodeKey> {
        let index = lock(&self.index);
        index
            .lru
            .order(&index.slots)
            .into_iter()
            .filter_map(|idx| index.slots[idx as usize].key)
            .collect()
    }

    /// Every invariant of the index, for tests
    #[cfg(test)]
    fn check_invariants(&self) {
        let index = lock(&self.index);
        let linked = index.lru.order(&index.slots);
        assert_eq!(linked.len(), index.lru.len);

        let mut owners = HashMap::new();
        for (idx, slot) in index.slots.iter().enumerate() {
            let in_list = linked.contains(&(idx as u32));
            match slot.state {
                SlotState::Free => {
                    assert!(slot.key.is_none());
                    assert_eq!(slot.priority, Priority::MIN);
                    assert!(in_list);
                }
                SlotState::Reserved => assert!(!in_list),
                SlotState::Occupied => {
                    let key = slot.key.expect("occupied slot without key");
                    assert!(owners.insert(key, idx).is_none(), "key {} owned twice", key);
                    assert_eq!(index.map.get(&key), Some(&(idx as u32)));
                    assert_eq!(in_list, slot.refs.is_empty());
                }
            }
        }
        assert_eq!(owners.len(), index.map.len());
    }
}
