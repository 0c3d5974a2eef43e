//! Hypothesis bookkeeping for multi-model tracking
//!
//! An external manager may run several self-and-ball filters side by side, each representing a
//! different belief about where the robot is (for example after the robot has been picked up and
//! put down). This module holds what the manager needs to tell them apart: a globally unique id,
//! the id of the filter a hypothesis was spawned from, and a likelihood weight `alpha` that every
//! weighted measurement multiplies down.
//!
//! Ids come from a single process-wide counter that starts at 0 and is incremented atomically, so
//! filters may be created from several threads.

use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_HYPOTHESIS_ID: AtomicU64 = AtomicU64::new(0);

/// Allocate a fresh, never reused, hypothesis id.
pub fn generate_id() -> u64 {
    NEXT_HYPOTHESIS_ID.fetch_add(1, Ordering::Relaxed)
}

/// Identity, lineage and weight of one filter instance.
#[derive(Clone, Debug, PartialEq)]
pub struct Hypothesis {
    id: u64,
    parent_id: Option<u64>,
    alpha: f64,
    is_active: bool,
    to_be_activated: bool,
}

impl Default for Hypothesis {
    fn default() -> Self {
        Hypothesis::new()
    }
}

impl Hypothesis {
    /// New root hypothesis with a fresh id and unit weight.
    pub fn new() -> Hypothesis {
        Hypothesis {
            id: generate_id(),
            parent_id: None,
            alpha: 1.0,
            is_active: false,
            to_be_activated: false,
        }
    }
    pub fn id(&self) -> u64 {
        self.id
    }
    pub fn parent_id(&self) -> Option<u64> {
        self.parent_id
    }
    pub fn alpha(&self) -> f64 {
        self.alpha
    }
    pub fn set_alpha(&mut self, alpha: f64) {
        self.alpha = alpha;
    }
    /// Scale the weight by a likelihood factor.
    pub fn multiply_alpha(&mut self, factor: f64) {
        self.alpha *= factor;
    }
    pub fn is_active(&self) -> bool {
        self.is_active
    }
    pub fn set_active(&mut self, active: bool) {
        self.is_active = active;
    }
    pub fn to_be_activated(&self) -> bool {
        self.to_be_activated
    }
    pub fn set_to_be_activated(&mut self, pending: bool) {
        self.to_be_activated = pending;
    }
    /// Take a fresh id and record `parent` as the origin of this hypothesis.
    ///
    /// Only the lineage changes; weights and any filter state are left to the caller.
    pub fn spawn_from(&mut self, parent: &Hypothesis) -> u64 {
        self.parent_id = Some(parent.id);
        self.id = generate_id();
        self.id
    }
}
