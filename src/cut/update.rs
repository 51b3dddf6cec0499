//! Cut update: keep, split or collapse frontier nodes
//!
//! One `CutUpdater` per rendering context. Each cycle it makes finished loads
//! resident, then walks every cut of its context top-down and asks an external
//! metric what each frontier node should do. A node is only replaced once
//! everything replacing it is resident, so a published cut never has holes.
//!
//! Collapses run before splits, and splits run in descending priority. When
//! the render budget cannot take a split, sibling groups nobody wants refined
//! are collapsed to make room, as long as their parent is wanted less than
//! the split.
//!
//! Every node in a context's frontiers is referenced in the slot pool for that
//! context; the updater counts how many of its cuts use a node so that views
//! sharing a node keep a single reference.

use std::collections::{HashMap, HashSet};
use std::ops::Range;
use std::sync::Arc;

use crate::core::types::{ContextId, CutKey, NodeId, NodeKey, Priority, ViewId};
use crate::cut::buffer::{CutState, SlotUpdate};
use crate::cut::database::CutDatabase;
use crate::streaming::{BudgetDispatcher, RefreshReport, Resource, SlotHandle, StreamingCache};

/// Priority of the root of a cut that is not loaded yet
pub const ROOT_PRIORITY: Priority = Priority::MAX;

/// Priority of a parent requested so a sibling group can collapse
pub const COLLAPSE_PRIORITY: Priority = 0;

/// What the metric wants for one frontier node
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LodDecision {
    /// Detail is adequate
    Keep,
    /// Too coarse: replace with children; `priority` orders their loads
    Split { priority: Priority },
    /// Too fine: replace the sibling group with its parent
    Collapse,
}

/// Screen-space error metric, supplied by the renderer
pub trait LodMetric: Send + Sync {
    fn decide(&self, view: ViewId, key: NodeKey) -> LodDecision;
}

impl<F> LodMetric for F
where
    F: Fn(ViewId, NodeKey) -> LodDecision + Send + Sync,
{
    fn decide(&self, view: ViewId, key: NodeKey) -> LodDecision {
        self(view, key)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum SplitOutcome {
    Done,
    /// Children still loading, or the transfer budget is spent
    Waiting,
    /// Everything is resident but this many more drawable nodes do not fit
    OverRenderBudget(usize),
}

/// Metric answers for one cut, asked at most once per node and pass
struct Decisions<'a> {
    metric: &'a dyn LodMetric,
    key: CutKey,
    answers: HashMap<NodeId, LodDecision>,
}

impl<'a> Decisions<'a> {
    fn new(metric: &'a dyn LodMetric, key: CutKey) -> Self {
        Self {
            metric,
            key,
            answers: HashMap::new(),
        }
    }

    fn get(&mut self, node: NodeId) -> LodDecision {
        let (metric, key) = (self.metric, self.key);
        *self
            .answers
            .entry(node)
            .or_insert_with(|| metric.decide(key.view, NodeKey::new(key.resource, node)))
    }
}

/// Statistics of one update cycle
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Cuts evaluated
    pub cuts: usize,
    pub splits: usize,
    pub collapses: usize,
    /// New load requests
    pub registered: usize,
    /// Requests or frontier changes postponed by the transfer budget
    pub deferred: usize,
    /// Frontier size summed over all cuts after the cycle
    pub frontier_nodes: usize,
    /// Outcome of the cache refresh that started the cycle
    pub refresh: RefreshReport,
}

/// Evaluates and publishes the cuts of one context
pub struct CutUpdater {
    context: ContextId,
    cache: Arc<StreamingCache>,
    cuts: Arc<CutDatabase>,
    budget: BudgetDispatcher,
    /// Nodes this context references, with the number of its cuts using each
    held: HashMap<NodeKey, usize>,
}

impl CutUpdater {
    pub fn new(context: ContextId, cache: Arc<StreamingCache>, cuts: Arc<CutDatabase>) -> Self {
        let config = cache.config();
        let budget = BudgetDispatcher::new(config.transfer_budget, config.render_budget);
        Self {
            context,
            cache,
            cuts,
            budget,
            held: HashMap::new(),
        }
    }

    pub fn context(&self) -> ContextId {
        self.context
    }

    pub fn budget(&self) -> &BudgetDispatcher {
        &self.budget
    }

    /// Distinct nodes currently referenced by this context
    pub fn held_nodes(&self) -> usize {
        self.held.len()
    }

    /// Refresh the cache and update every cut of this context once
    pub fn run_cycle(&mut self, metric: &dyn LodMetric) -> CycleReport {
        let mut report = CycleReport {
            refresh: self.cache.refresh(),
            ..Default::default()
        };
        self.budget.begin_cycle();
        self.budget.sync_render(self.held.len());

        let cache = Arc::clone(&self.cache);
        for key in self.cuts.keys_for_context(self.context) {
            let resource = match cache.catalog().get(key.resource) {
                Ok(resource) => resource,
                Err(e) => {
                    log::warn!("Skipping cut {}: {}", key, e);
                    continue;
                }
            };

            let cut = self.cuts.cut(key);
            let mut back = cut.write();
            self.update_cut(key, resource, &mut back, metric, &mut report);
            debug_assert!(is_hole_free(resource, &back), "cut {} has a hole", key);

            report.cuts += 1;
            report.frontier_nodes += back.len();
            cut.publish(back);
        }

        log::debug!(
            "Context {} cycle: {} cuts, {} nodes, {} splits, {} collapses, {} requested, {} deferred",
            self.context,
            report.cuts,
            report.frontier_nodes,
            report.splits,
            report.collapses,
            report.registered,
            report.deferred
        );
        report
    }

    /// Drop every cut of this context and invalidate the slots only it used
    pub fn reset(&mut self) {
        for key in self.cuts.keys_for_context(self.context) {
            let Some(cut) = self.cuts.remove(key) else {
                continue;
            };
            let nodes: Vec<NodeId> = cut.write().drawable().map(|(node, _)| node).collect();
            for node in nodes {
                self.unhold(NodeKey::new(key.resource, node), true);
            }
        }
        for (key, _) in self.held.drain() {
            self.cache.release_and_invalidate(self.context, key);
        }
        self.budget.reset();
        log::debug!("Context {} reset", self.context);
    }

    fn update_cut(
        &mut self,
        key: CutKey,
        resource: &Resource,
        cut: &mut CutState,
        metric: &dyn LodMetric,
        report: &mut CycleReport,
    ) {
        let pending: Vec<NodeId> = cut
            .nodes
            .iter()
            .filter(|(_, slot)| slot.is_none())
            .map(|(&node, _)| node)
            .collect();
        for node in pending {
            self.load_pending(resource, node, cut, report);
        }

        let mut decisions = Decisions::new(metric, key);
        let frontier: Vec<NodeId> = cut.frontier().collect();
        let mut visited: HashSet<NodeId> = HashSet::with_capacity(frontier.len());
        let mut splits: Vec<(Priority, NodeId)> = Vec::new();

        // Collapses first: they give back the budget splits spend
        for node in frontier {
            // Removed by a collapse earlier in this pass, or not loaded yet
            if !visited.insert(node) || cut.slot(node).is_none() {
                continue;
            }

            match decisions.get(node) {
                LodDecision::Keep => {}
                LodDecision::Split { priority } => splits.push((priority, node)),
                LodDecision::Collapse => {
                    let Some(parent) = resource.parent(node) else {
                        continue;
                    };
                    let siblings = resource.siblings(node);
                    let group_agrees = siblings.clone().all(|s| {
                        cut.slot(s).is_some() && decisions.get(s) == LodDecision::Collapse
                    });
                    if !group_agrees {
                        continue;
                    }
                    visited.extend(siblings.clone());
                    if self.try_collapse(resource, parent, siblings, cut, report) {
                        report.collapses += 1;
                    }
                }
            }
        }

        // Most wanted refinements spend the budgets first
        splits.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
        let mut donors: Option<Vec<(Priority, NodeId)>> = None;
        for (priority, node) in splits {
            if !cut.contains(node) {
                continue;
            }
            let mut outcome = self.try_split(resource, node, priority, cut, report);
            if let SplitOutcome::OverRenderBudget(needed) = outcome {
                let donors = donors.get_or_insert_with(|| donor_groups(resource, &*cut, &mut decisions));
                if self.collapse_on_need(resource, priority, needed, donors, cut, report) {
                    outcome = self.try_split(resource, node, priority, cut, report);
                }
            }
            if outcome == SplitOutcome::Done {
                report.splits += 1;
            }
        }
    }

    /// Bring a node whose slot is unknown (the root of a fresh cut) into use
    fn load_pending(
        &mut self,
        resource: &Resource,
        node: NodeId,
        cut: &mut CutState,
        report: &mut CycleReport,
    ) {
        let key = NodeKey::new(resource.id(), node);
        let cost = usize::from(!self.held.contains_key(&key));
        if self.budget.transfer_remaining() < cost || self.budget.render_remaining() < 1 {
            report.deferred += 1;
            return;
        }
        let Some(slot) = self.hold(key) else {
            self.request(key, ROOT_PRIORITY, report);
            return;
        };

        self.budget.try_consume_transfer(cost);
        self.budget.try_consume_render(1);
        cut.nodes.insert(node, Some(slot));
        cut.updates.push(SlotUpdate { node, slot });
    }

    /// Replace `node` by its children if all are resident and affordable
    fn try_split(
        &mut self,
        resource: &Resource,
        node: NodeId,
        priority: Priority,
        cut: &mut CutState,
        report: &mut CycleReport,
    ) -> SplitOutcome {
        let children = resource.children(node);
        if children.is_empty() {
            return SplitOutcome::Waiting;
        }

        let mut acquired: Vec<(NodeId, SlotHandle)> = Vec::with_capacity(children.clone().count());
        let mut missing = Vec::new();
        let mut new_uploads = 0;
        for child in children.clone() {
            let key = NodeKey::new(resource.id(), child);
            let was_held = self.held.contains_key(&key);
            match self.hold(key) {
                Some(slot) => {
                    acquired.push((child, slot));
                    if !was_held {
                        new_uploads += 1;
                    }
                }
                None => missing.push(key),
            }
        }

        let extra_drawn = acquired.len().saturating_sub(1);
        let outcome = if !missing.is_empty() || self.budget.transfer_remaining() < new_uploads {
            SplitOutcome::Waiting
        } else if self.budget.render_remaining() < extra_drawn {
            SplitOutcome::OverRenderBudget(extra_drawn)
        } else {
            SplitOutcome::Done
        };
        if outcome != SplitOutcome::Done {
            for (child, _) in acquired {
                self.unhold(NodeKey::new(resource.id(), child), false);
            }
            for key in missing {
                self.request(key, priority, report);
            }
            return outcome;
        }

        self.budget.try_consume_transfer(new_uploads);
        self.budget.try_consume_render(extra_drawn);

        cut.nodes.remove(&node);
        if self.unhold(NodeKey::new(resource.id(), node), false) {
            self.budget.credit_freed(1);
        }
        for (child, slot) in acquired {
            cut.nodes.insert(child, Some(slot));
            cut.updates.push(SlotUpdate { node: child, slot });
        }
        SplitOutcome::Done
    }

    /// Collapse groups nobody wants refined until `needed` render budget is
    /// free. Only groups whose parent is wanted less than `priority` qualify.
    /// `donors` is ordered so the least wanted group is last.
    fn collapse_on_need(
        &mut self,
        resource: &Resource,
        priority: Priority,
        needed: usize,
        donors: &mut Vec<(Priority, NodeId)>,
        cut: &mut CutState,
        report: &mut CycleReport,
    ) -> bool {
        while self.budget.render_remaining() < needed {
            let Some(&(wanted, parent)) = donors.last() else {
                return false;
            };
            if wanted >= priority {
                return false;
            }
            donors.pop();

            let siblings = resource.children(parent);
            if !siblings.clone().all(|s| cut.slot(s).is_some()) {
                continue;
            }
            if self.try_collapse(resource, parent, siblings, cut, report) {
                report.collapses += 1;
            }
        }
        true
    }

    /// Replace the sibling group by `parent` if the parent is resident
    fn try_collapse(
        &mut self,
        resource: &Resource,
        parent: NodeId,
        siblings: Range<NodeId>,
        cut: &mut CutState,
        report: &mut CycleReport,
    ) -> bool {
        let parent_key = NodeKey::new(resource.id(), parent);
        let cost = usize::from(!self.held.contains_key(&parent_key));
        if self.budget.transfer_remaining() < cost {
            report.deferred += 1;
            return false;
        }
        let Some(slot) = self.hold(parent_key) else {
            self.request(parent_key, COLLAPSE_PRIORITY, report);
            return false;
        };
        self.budget.try_consume_transfer(cost);

        let removed = siblings.clone().count();
        for sibling in siblings {
            cut.nodes.remove(&sibling);
            if self.unhold(NodeKey::new(resource.id(), sibling), false) {
                self.budget.credit_freed(1);
            }
        }
        self.budget.return_render(removed.saturating_sub(1));

        cut.nodes.insert(parent, Some(slot));
        cut.updates.push(SlotUpdate { node: parent, slot });
        true
    }

    /// Queue a load unless the transfer budget is already spent
    fn request(&mut self, key: NodeKey, priority: Priority, report: &mut CycleReport) {
        if self.budget.is_transfer_exhausted() {
            report.deferred += 1;
            return;
        }
        match self.cache.register(key, priority) {
            Ok(true) => report.registered += 1,
            Ok(false) => {}
            Err(e) => log::warn!("Cannot request {}: {}", key, e),
        }
    }

    /// Take one more use of `key` for this context; the first use references
    /// the slot. `None` if the node is not resident.
    fn hold(&mut self, key: NodeKey) -> Option<SlotHandle> {
        if let Some(count) = self.held.get_mut(&key) {
            *count += 1;
            return self.cache.slot_of(key);
        }
        if !self.cache.is_resident_and_acquired(self.context, key) {
            return None;
        }
        match self.cache.slot_of(key) {
            Some(slot) => {
                self.held.insert(key, 1);
                Some(slot)
            }
            None => {
                self.cache.release(self.context, key);
                None
            }
        }
    }

    /// Give up one use of `key`. Returns true if that was the last use and the
    /// slot reference was dropped.
    fn unhold(&mut self, key: NodeKey, invalidate: bool) -> bool {
        let Some(count) = self.held.get_mut(&key) else {
            return false;
        };
        *count -= 1;
        if *count > 0 {
            return false;
        }
        self.held.remove(&key);
        if invalidate {
            self.cache.release_and_invalidate(self.context, key);
        } else {
            self.cache.release(self.context, key);
        }
        true
    }
}

/// Complete sibling groups of the frontier in which no node wants to split,
/// with how much their parent wants to split (`MIN` if it does not). Sorted
/// most wanted first, ties by id, so popping yields the next group to give up.
fn donor_groups(
    resource: &Resource,
    cut: &CutState,
    decisions: &mut Decisions<'_>,
) -> Vec<(Priority, NodeId)> {
    let mut donors = Vec::new();
    for node in cut.frontier() {
        let Some(parent) = resource.parent(node) else {
            continue;
        };
        let siblings = resource.siblings(node);
        if node != siblings.start {
            continue;
        }
        let whole = siblings.clone().all(|s| {
            cut.slot(s).is_some() && !matches!(decisions.get(s), LodDecision::Split { .. })
        });
        if !whole {
            continue;
        }
        let wanted = match decisions.get(parent) {
            LodDecision::Split { priority } => priority,
            _ => Priority::MIN,
        };
        donors.push((wanted, parent));
    }
    donors.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));
    donors
}

/// Whether `cut` covers every leaf of `resource` exactly once: no frontier
/// node is an ancestor of another and no subtree is left uncovered.
pub fn is_hole_free(resource: &Resource, cut: &CutState) -> bool {
    for node in cut.frontier() {
        if !resource.contains(node) {
            return false;
        }
        let mut ancestor = resource.parent(node);
        while let Some(id) = ancestor {
            if cut.contains(id) {
                return false;
            }
            ancestor = resource.parent(id);
        }
    }
    covers(resource, cut, 0)
}

fn covers(resource: &Resource, cut: &CutState, node: NodeId) -> bool {
    cut.contains(node)
        || (!resource.is_leaf(node) && resource.children(node).all(|c| covers(resource, cut, c)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::StreamingConfig;
    use crate::streaming::{Catalog, MemoryReaderFactory, ResourceDesc, build_nodes};
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU8, Ordering};
    use std::thread;
    use std::time::{Duration, Instant};

    const NODE_SIZE: usize = 8;

    struct Setup {
        cache: Arc<StreamingCache>,
        cuts: Arc<CutDatabase>,
        updater: CutUpdater,
    }

    /// Quadtree of depth 3 (nodes 0..85), every node stamped with its id
    fn setup(slots: usize, transfer_budget: usize, render_budget: usize) -> Setup {
        let catalog = Catalog::from_descs([ResourceDesc::geometry("quad", 4, 3, NODE_SIZE)]).unwrap();
        let data = build_nodes(catalog.get(0).unwrap(), |node, buf| buf.fill(node as u8));
        let config = StreamingConfig {
            slot_pool_bytes: slots * NODE_SIZE,
            loader_threads: 2,
            transfer_budget,
            render_budget,
            retry_interval_ms: 1,
        };
        let cache = Arc::new(
            StreamingCache::new(config, catalog, Arc::new(MemoryReaderFactory::new().with(0, data)))
                .unwrap(),
        );
        let cuts = Arc::new(CutDatabase::new());
        let updater = CutUpdater::new(0, Arc::clone(&cache), Arc::clone(&cuts));
        Setup { cache, cuts, updater }
    }

    fn frontier(cuts: &CutDatabase, key: CutKey) -> Vec<NodeId> {
        cuts.current_cut(key).unwrap().frontier().collect()
    }

    /// Run cycles until the published frontier of `key` equals `expected`
    fn run_until(s: &mut Setup, metric: &dyn LodMetric, key: CutKey, expected: &[NodeId]) {
        let resource = s.cache.catalog().get(key.resource).unwrap().clone();
        let start = Instant::now();
        loop {
            s.updater.run_cycle(metric);
            let state = s.cuts.current_cut(key).unwrap();
            assert!(is_hole_free(&resource, &state), "hole in {:?}", state.nodes);
            if state.frontier().collect::<Vec<_>>() == expected {
                return;
            }
            assert!(
                start.elapsed() < Duration::from_secs(5),
                "stuck at {:?}, expected {:?}",
                state.nodes,
                expected
            );
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn split_nodes(nodes: &'static [NodeId]) -> impl Fn(ViewId, NodeKey) -> LodDecision + Send + Sync {
        move |_, key| {
            if nodes.contains(&key.node) {
                LodDecision::Split { priority: 10 }
            } else {
                LodDecision::Keep
            }
        }
    }

    fn keep(_: ViewId, _: NodeKey) -> LodDecision {
        LodDecision::Keep
    }

    #[test]
    fn test_root_loads_first() {
        let mut s = setup(64, 64, 1024);
        let key = CutKey::new(0, 0, 0);
        s.cuts.cut(key);

        let report = s.updater.run_cycle(&keep);
        assert_eq!(report.cuts, 1);
        assert_eq!(report.registered, 1);

        let start = Instant::now();
        while s.cuts.current_cut(key).unwrap().slot(0).is_none() {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(1));
            s.updater.run_cycle(&keep);
        }

        let state = s.cuts.current_cut(key).unwrap();
        assert_eq!(state.updates.len(), 1);
        assert_eq!(state.updates[0].node, 0);
        assert!(s.cache.is_resident(NodeKey::new(0, 0)));
        assert_eq!(&*s.cache.data(NodeKey::new(0, 0)).unwrap(), &[0u8; NODE_SIZE]);
    }

    #[test]
    fn test_split_waits_for_all_children() {
        // Node 10 splits into 41..44 only once all four are resident; until
        // then every published cut still contains 10.
        let mut s = setup(128, 64, 1024);
        let key = CutKey::new(0, 0, 0);
        s.cuts.cut(key);
        let metric = split_nodes(&[0, 2, 10]);

        run_until(&mut s, &metric, key, &[1, 3, 4, 9, 10, 11, 12]);

        let report = s.updater.run_cycle(&metric);
        let state = s.cuts.current_cut(key).unwrap();
        if state.contains(10) {
            assert!(report.registered > 0 || s.cache.num_pending() > 0 || report.refresh.resolved > 0);
            assert!((41..45).all(|child| !state.contains(child)));
        }

        run_until(&mut s, &metric, key, &[1, 3, 4, 9, 11, 12, 41, 42, 43, 44]);
        for child in 41..45 {
            let slot = s.cuts.current_cut(key).unwrap().slot(child).unwrap();
            assert_eq!(s.cache.slot_of(NodeKey::new(0, child)), Some(slot));
        }
    }

    #[test]
    fn test_collapse_back_to_root() {
        let mut s = setup(128, 64, 1024);
        let key = CutKey::new(0, 0, 0);
        s.cuts.cut(key);

        // 0 = split everything above the leaves, 1 = collapse everything
        let mode = Arc::new(AtomicU8::new(0));
        let metric = {
            let mode = Arc::clone(&mode);
            move |_: ViewId, key: NodeKey| {
                if mode.load(Ordering::Relaxed) == 0 {
                    LodDecision::Split { priority: 1 }
                } else if key.node == 0 {
                    LodDecision::Keep
                } else {
                    LodDecision::Collapse
                }
            }
        };

        let leaves: Vec<NodeId> = (21..85).collect();
        run_until(&mut s, &metric, key, &leaves);
        assert_eq!(s.updater.held_nodes(), 64);

        mode.store(1, Ordering::Relaxed);
        run_until(&mut s, &metric, key, &[0]);
        assert_eq!(s.updater.held_nodes(), 1);
        assert_eq!(s.cache.slot_pool().num_referenced(), 1);
    }

    #[test]
    fn test_collapse_needs_whole_group() {
        let mut s = setup(64, 64, 1024);
        let key = CutKey::new(0, 0, 0);
        s.cuts.cut(key);
        run_until(&mut s, &split_nodes(&[0]), key, &[1, 2, 3, 4]);

        // Only node 2 wants to collapse: the group stays
        let metric = |_: ViewId, key: NodeKey| {
            if key.node == 2 { LodDecision::Collapse } else { LodDecision::Keep }
        };
        for _ in 0..5 {
            let report = s.updater.run_cycle(&metric);
            assert_eq!(report.collapses, 0);
        }
        assert_eq!(frontier(&s.cuts, key), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_render_budget_limits_frontier() {
        // Root plus one split fits in 4 drawable nodes, a second split does not
        let mut s = setup(64, 64, 4);
        let key = CutKey::new(0, 0, 0);
        s.cuts.cut(key);
        let split_all = |_: ViewId, _: NodeKey| LodDecision::Split { priority: 1 };

        run_until(&mut s, &split_all, key, &[1, 2, 3, 4]);
        for _ in 0..20 {
            s.updater.run_cycle(&split_all);
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(frontier(&s.cuts, key), vec![1, 2, 3, 4]);
        assert_eq!(s.updater.budget().render_remaining(), 0);
    }

    #[test]
    fn test_sibling_splits_while_another_votes_collapse() {
        let mut s = setup(64, 64, 1024);
        let key = CutKey::new(0, 0, 0);
        s.cuts.cut(key);
        run_until(&mut s, &split_nodes(&[0]), key, &[1, 2, 3, 4]);

        // Node 1 alone cannot collapse its group, which must not stop node 2
        let metric = |_: ViewId, key: NodeKey| match key.node {
            1 => LodDecision::Collapse,
            2 => LodDecision::Split { priority: 5 },
            _ => LodDecision::Keep,
        };
        run_until(&mut s, &metric, key, &[1, 3, 4, 9, 10, 11, 12]);
    }

    #[test]
    fn test_render_budget_goes_to_highest_priority_split() {
        // Root split leaves room for exactly one more split of four children
        let mut s = setup(64, 64, 7);
        let key = CutKey::new(0, 0, 0);
        s.cuts.cut(key);
        run_until(&mut s, &split_nodes(&[0]), key, &[1, 2, 3, 4]);

        let children = || (5..9).chain(17..21).map(|node| NodeKey::new(0, node));
        for child in children() {
            s.cache.register(child, 1).unwrap();
        }
        let start = Instant::now();
        while !children().all(|child| s.cache.is_resident(child)) {
            assert!(start.elapsed() < Duration::from_secs(5), "children never loaded");
            thread::sleep(Duration::from_millis(1));
            s.cache.refresh();
        }

        let metric = |_: ViewId, key: NodeKey| match key.node {
            1 => LodDecision::Split { priority: 1 },
            4 => LodDecision::Split { priority: 9 },
            _ => LodDecision::Keep,
        };
        let report = s.updater.run_cycle(&metric);
        assert_eq!(report.splits, 1);
        assert_eq!(report.collapses, 0);
        assert_eq!(frontier(&s.cuts, key), vec![1, 2, 3, 17, 18, 19, 20]);
    }

    #[test]
    fn test_collapse_on_need_frees_render_budget() {
        let mut s = setup(64, 64, 7);
        let key = CutKey::new(0, 0, 0);
        s.cuts.cut(key);
        run_until(&mut s, &split_nodes(&[0, 1]), key, &[2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(s.updater.budget().render_remaining(), 0);

        // Node 4 now matters more than node 1: 5..8 give way to 17..20
        let metric = |_: ViewId, key: NodeKey| match key.node {
            1 => LodDecision::Split { priority: 1 },
            4 => LodDecision::Split { priority: 9 },
            _ => LodDecision::Keep,
        };
        run_until(&mut s, &metric, key, &[1, 2, 3, 17, 18, 19, 20]);

        // Node 1 cannot take the budget back from the more wanted split
        for _ in 0..10 {
            let report = s.updater.run_cycle(&metric);
            assert_eq!(report.splits + report.collapses, 0);
        }
        assert_eq!(frontier(&s.cuts, key), vec![1, 2, 3, 17, 18, 19, 20]);
    }

    #[test]
    fn test_views_share_references() {
        let mut s = setup(64, 64, 1024);
        let first = CutKey::new(0, 0, 0);
        let second = CutKey::new(0, 1, 0);
        s.cuts.cut(first);
        s.cuts.cut(second);

        let metric = |view: ViewId, key: NodeKey| {
            if view == 0 && key.node == 0 {
                LodDecision::Split { priority: 1 }
            } else {
                LodDecision::Keep
            }
        };
        run_until(&mut s, &metric, first, &[1, 2, 3, 4]);
        assert_eq!(frontier(&s.cuts, second), vec![0]);

        assert_eq!(s.cache.slot_pool().references(NodeKey::new(0, 0)), 1);
        assert_eq!(s.updater.held_nodes(), 5);
    }

    #[test]
    fn test_reset_invalidates() {
        let mut s = setup(64, 64, 1024);
        let key = CutKey::new(0, 0, 0);
        s.cuts.cut(key);
        run_until(&mut s, &split_nodes(&[0]), key, &[1, 2, 3, 4]);

        s.updater.reset();
        assert!(s.cuts.keys_for_context(0).is_empty());
        assert_eq!(s.updater.held_nodes(), 0);
        assert_eq!(s.cache.slot_pool().num_referenced(), 0);
        for node in 1..5 {
            assert!(!s.cache.is_resident(NodeKey::new(0, node)));
        }
    }

    #[test]
    fn test_hole_free_check() {
        let resource = Catalog::from_descs([ResourceDesc::geometry("q", 4, 2, 4)])
            .unwrap()
            .get(0)
            .unwrap()
            .clone();
        let cut_of = |nodes: &[NodeId]| CutState {
            nodes: nodes.iter().map(|&n| (n, None)).collect::<BTreeMap<_, _>>(),
            ..CutState::new()
        };

        assert!(is_hole_free(&resource, &cut_of(&[0])));
        assert!(is_hole_free(&resource, &cut_of(&[1, 2, 3, 4])));
        assert!(is_hole_free(&resource, &cut_of(&[1, 3, 4, 9, 10, 11, 12])));
        // Missing sibling
        assert!(!is_hole_free(&resource, &cut_of(&[1, 2, 3])));
        // Parent and child together
        assert!(!is_hole_free(&resource, &cut_of(&[0, 1, 2, 3, 4])));
        // Out of range
        assert!(!is_hole_free(&resource, &cut_of(&[1, 2, 3, 4, 99])));
        assert!(!is_hole_free(&resource, &cut_of(&[])));
    }
}
