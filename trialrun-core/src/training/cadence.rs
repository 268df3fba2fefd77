//! Cadence rules: when a step is a validation, checkpoint or report boundary.
//!
//! Every decision is a pure function of the progress counters. Epoch and
//! record counts are derived from the batch counter, never tracked on their
//! own, so workers that agree on `batches_trained`, the epoch length and the
//! global batch size always agree on every boundary.

use crate::training::unit::{SearcherUnit, TrainUnit};

/// Progress counters a cadence decision is made from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub batches_trained: u64,
    pub epochs_trained: u64,
    pub global_batch_size: u64,
}

impl Progress {
    /// Records seen so far. Approximate when the global batch size changed
    /// across a resume.
    pub fn records_trained(&self) -> u64 {
        self.batches_trained.saturating_mul(self.global_batch_size)
    }

    /// The counter expressed in the same unit as `unit`.
    pub fn in_unit_of(&self, unit: &TrainUnit) -> u64 {
        match unit {
            TrainUnit::Batch(_) => self.batches_trained,
            TrainUnit::Epoch(_) => self.epochs_trained,
            TrainUnit::Record(_) => self.records_trained(),
        }
    }

    /// Progress as the searcher wants it reported.
    pub fn in_searcher_unit(&self, unit: SearcherUnit) -> u64 {
        match unit {
            SearcherUnit::Batches => self.batches_trained,
            SearcherUnit::Epochs => self.epochs_trained,
            SearcherUnit::Records => self.records_trained(),
        }
    }
}

/// `counter mod max(period, 1) == 0`; a period of 0 fires every step.
pub fn should_trigger(period: &TrainUnit, progress: &Progress) -> bool {
    progress.in_unit_of(period) % period.value().max(1) == 0
}

/// Like [`should_trigger`] but an absent period never fires.
pub fn is_due(period: Option<&TrainUnit>, progress: &Progress) -> bool {
    period.is_some_and(|p| should_trigger(p, progress))
}

/// Report boundaries surface control to metric flushes and preemption checks.
pub fn is_report_boundary(batches_trained: u64, scheduling_unit: u64) -> bool {
    batches_trained % scheduling_unit.max(1) == 0
}

/// Length left in `max_length`'s own unit; negative when overshot. Wide
/// enough for any pair of `u64` counts.
pub fn steps_remaining(max_length: &TrainUnit, progress: &Progress) -> i128 {
    let done = progress.in_unit_of(max_length);
    i128::from(max_length.value()) - i128::from(done)
}

/// Epoch index of a given 0-based batch index.
pub fn epoch_of(batch_idx: u64, epoch_len: u64) -> u64 {
    batch_idx / epoch_len.max(1)
}
