//! Per-context budget dispatcher
//!
//! Two counters bound what one update cycle may do:
//! - transfer: nodes that may newly enter a cut (uploaded) this cycle
//! - render: nodes that may be drawable in the context at once
//!
//! Each context owns its dispatcher, so no synchronisation is needed.

/// Transfer and render budget of one rendering context
#[derive(Clone, Debug)]
pub struct BudgetDispatcher {
    /// Nodes that may be uploaded per cycle
    transfer_allowance: usize,
    /// Uploads left in the current cycle
    transfer_remaining: usize,
    /// Slots freed since the last cycle began, credited at the next one
    freed_credit: usize,
    /// Maximum drawable nodes
    render_budget: usize,
    /// Drawable nodes that may still be added
    render_remaining: usize,
}

impl BudgetDispatcher {
    /// Create a dispatcher with a full render budget and no transfer budget
    /// until the first [`begin_cycle`](Self::begin_cycle)
    ///
    /// # Arguments
    /// * `transfer_allowance` - Nodes that may be uploaded per cycle
    /// * `render_budget` - Maximum nodes drawable at once
    pub fn new(transfer_allowance: usize, render_budget: usize) -> Self {
        Self {
            transfer_allowance,
            transfer_remaining: 0,
            freed_credit: 0,
            render_budget,
            render_remaining: render_budget,
        }
    }

    /// Start an update cycle: transfer budget = allowance + freed credits
    pub fn begin_cycle(&mut self) {
        self.transfer_remaining = self.transfer_allowance.saturating_add(self.freed_credit);
        self.freed_credit = 0;
    }

    // --- Transfer budget ---

    /// Spend `n` uploads if they are all affordable
    pub fn try_consume_transfer(&mut self, n: usize) -> bool {
        if n > self.transfer_remaining {
            return false;
        }
        self.transfer_remaining -= n;
        true
    }

    /// Record `n` slots released by this context; credited at the next cycle
    pub fn credit_freed(&mut self, n: usize) {
        self.freed_credit = self.freed_credit.saturating_add(n);
    }

    pub fn transfer_remaining(&self) -> usize {
        self.transfer_remaining
    }

    pub fn is_transfer_exhausted(&self) -> bool {
        self.transfer_remaining == 0
    }

    // --- Render budget ---

    /// Make `n` more nodes drawable if the render budget allows it
    pub fn try_consume_render(&mut self, n: usize) -> bool {
        if n > self.render_remaining {
            return false;
        }
        self.render_remaining -= n;
        true
    }

    /// Give back render budget for `n` nodes that are no longer drawn
    pub fn return_render(&mut self, n: usize) {
        self.render_remaining = self
            .render_remaining
            .saturating_add(n)
            .min(self.render_budget);
    }

    /// Recount: `used` nodes are drawable right now
    pub fn sync_render(&mut self, used: usize) {
        self.render_remaining = self.render_budget.saturating_sub(used);
    }

    pub fn render_remaining(&self) -> usize {
        self.render_remaining
    }

    /// Drawable nodes currently accounted for
    pub fn render_used(&self) -> usize {
        self.render_budget - self.render_remaining
    }

    pub fn render_budget(&self) -> usize {
        self.render_budget
    }

    /// Forget all accounting (the context's cuts were dropped)
    pub fn reset(&mut self) {
        self.transfer_remaining = 0;
        self.freed_credit = 0;
        self.render_remaining = self.render_budget;
    }
}
