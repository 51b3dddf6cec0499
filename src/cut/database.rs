//! Registry of every cut, keyed by (context, view, resource)

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use crate::core::types::{ContextId, CutKey};
use crate::cut::buffer::{CutState, DoubleBufferedCut};
use crate::streaming::{read_lock, write_lock};

/// All cuts of all contexts
///
/// Lookups take a read lock; the map is only written when a cut is created or
/// removed.
#[derive(Debug, Default)]
pub struct CutDatabase {
    cuts: RwLock<BTreeMap<CutKey, Arc<DoubleBufferedCut>>>,
}

impl CutDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// The cut for `key`, created with just the root if it does not exist
    pub fn cut(&self, key: CutKey) -> Arc<DoubleBufferedCut> {
        if let Some(cut) = self.get(key) {
            return cut;
        }
        let mut cuts = write_lock(&self.cuts);
        Arc::clone(cuts.entry(key).or_insert_with(|| {
            log::debug!("Created cut {}", key);
            Arc::new(DoubleBufferedCut::new())
        }))
    }

    pub fn get(&self, key: CutKey) -> Option<Arc<DoubleBufferedCut>> {
        read_lock(&self.cuts).get(&key).cloned()
    }

    /// Copy of the front buffer of `key`, for the renderer
    pub fn current_cut(&self, key: CutKey) -> Option<CutState> {
        self.get(key).map(|cut| cut.read().clone())
    }

    /// Keys of every cut belonging to `context`, in key order
    pub fn keys_for_context(&self, context: ContextId) -> Vec<CutKey> {
        let from = CutKey::new(context, 0, 0);
        read_lock(&self.cuts)
            .range(from..)
            .map(|(key, _)| *key)
            .take_while(|key| key.context == context)
            .collect()
    }

    pub fn remove(&self, key: CutKey) -> Option<Arc<DoubleBufferedCut>> {
        write_lock(&self.cuts).remove(&key)
    }

    pub fn len(&self) -> usize {
        read_lock(&self.cuts).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
