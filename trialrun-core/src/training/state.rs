//! Persisted progress of a trial.

use serde::{Deserialize, Serialize};

use crate::training::cadence::{self, Progress};

/// The progress record written next to every checkpoint bundle.
///
/// `batches_trained` is the canonical counter; everything else is derived
/// from it or records the value it had when an action last ran.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialState {
    /// Distinguishes a pause/restart of this trial from a new trial that
    /// continues from another trial's checkpoint.
    #[serde(default)]
    pub trial_id: u64,
    #[serde(default)]
    pub batches_trained: u64,
    #[serde(default)]
    pub epochs_trained: u64,
    #[serde(default, alias = "last_ckpt")]
    pub last_checkpoint_step: u64,
    #[serde(default, alias = "last_val")]
    pub last_validation_step: u64,
}

impl TrialState {
    pub fn new(trial_id: u64, batches_trained: u64, epoch_len: u64) -> Self {
        Self {
            trial_id,
            batches_trained,
            epochs_trained: cadence::epoch_of(batches_trained, epoch_len),
            last_checkpoint_step: 0,
            last_validation_step: 0,
        }
    }

    /// Advance by one batch and return the 0-based index of the batch just
    /// trained.
    pub fn step(&mut self, epoch_len: u64) -> u64 {
        let trained_idx = self.batches_trained;
        self.batches_trained += 1;
        self.epochs_trained = cadence::epoch_of(self.batches_trained, epoch_len);
        trained_idx
    }

    pub fn progress(&self, global_batch_size: u64) -> Progress {
        Progress {
            batches_trained: self.batches_trained,
            epochs_trained: self.epochs_trained,
            global_batch_size,
        }
    }

    pub fn checkpoint_is_current(&self) -> bool {
        self.last_checkpoint_step == self.batches_trained
    }

    pub fn validation_is_current(&self) -> bool {
        self.last_validation_step == self.batches_trained
    }
}
