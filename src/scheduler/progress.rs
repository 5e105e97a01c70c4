//! Run-wide progress accounting.
//!
//! Every task contributes a forecast of abstract units when it enters the
//! run; units only ever move from "outstanding" to "done", so the overall
//! fraction is monotone non-decreasing for the lifetime of a run. Reserved
//! placeholder units for downstream work that never materializes are
//! released by decrementing the total before the replacement forecast is
//! added, or by counting them done when the upstream unit fails.

use std::collections::HashMap;

use ingestforge_core::TaskId;

#[derive(Debug, Default)]
pub struct ProgressLedger {
    total_units: u64,
    done_units: u64,
    /// In-flight fractional progress per task, in units.
    fractions: HashMap<TaskId, f64>,
}

impl ProgressLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a task's forecast when it is added to the run.
    pub fn add_forecast(&mut self, units: u64) {
        self.total_units += units;
    }

    /// Releases one reserved placeholder unit ahead of adding the real
    /// forecast of a discovered task.
    pub fn release_reservation(&mut self) {
        debug_assert!(self.total_units > self.done_units);
        self.total_units = self.total_units.saturating_sub(1);
    }

    /// Marks `units` of outstanding work as done.
    pub fn complete(&mut self, units: u64) {
        self.done_units = (self.done_units + units).min(self.total_units);
    }

    /// Records in-flight fractional progress for a running task, weighted
    /// by that task's own unit span.
    pub fn set_fraction(&mut self, task_id: TaskId, units: f64) {
        self.fractions.insert(task_id, units);
    }

    /// Drops a task's in-flight fraction, typically right before its whole
    /// units are completed.
    pub fn clear_fraction(&mut self, task_id: TaskId) {
        self.fractions.remove(&task_id);
    }

    /// Shrinks a task's stored in-flight fraction by `units` that were just
    /// counted done, so the fraction and the done counter never cover the
    /// same work at once.
    pub fn absorb_fraction(&mut self, task_id: TaskId, units: f64) {
        if let Some(fraction) = self.fractions.get_mut(&task_id) {
            *fraction = (*fraction - units).max(0.0);
        }
    }

    pub fn total_units(&self) -> u64 {
        self.total_units
    }

    pub fn done_units(&self) -> u64 {
        self.done_units
    }

    /// Overall run progress in `0.0..=1.0`. An empty run reports zero.
    pub fn overall(&self) -> f64 {
        if self.total_units == 0 {
            return 0.0;
        }
        let in_flight: f64 = self.fractions.values().sum();
        ((self.done_units as f64 + in_flight) / self.total_units as f64).min(1.0)
    }

    pub fn reset(&mut self) {
        self.total_units = 0;
        self.done_units = 0;
        self.fractions.clear();
    }
}
