//! What user trial code sees of the running controller.

use rand_chacha::ChaCha8Rng;
use serde_json::Value;

use crate::distributed::DistributedContext;
use crate::error::TrialError;
use crate::rng::RngStreams;

/// Per-worker view of the trial: hyperparameters, batch sizing, the current
/// position in training, random streams and the stop flag.
#[derive(Debug)]
pub struct TrialContext {
    dist: DistributedContext,
    trial_id: u64,
    hparams: Value,
    global_batch_size: u64,
    aggregation_frequency: u64,
    auto_amp: bool,
    epoch_len: Option<u64>,
    batch_idx: u64,
    stop_requested: bool,
    rng: RngStreams,
}

impl TrialContext {
    pub fn new(
        dist: DistributedContext,
        trial_id: u64,
        hparams: Value,
        global_batch_size: u64,
        aggregation_frequency: u64,
        auto_amp: bool,
        seed: u64,
    ) -> Self {
        Self {
            dist,
            trial_id,
            hparams,
            global_batch_size,
            aggregation_frequency: aggregation_frequency.max(1),
            auto_amp,
            epoch_len: None,
            batch_idx: 0,
            stop_requested: false,
            rng: RngStreams::new(seed),
        }
    }

    pub fn distributed(&self) -> &DistributedContext {
        &self.dist
    }

    pub fn trial_id(&self) -> u64 {
        self.trial_id
    }

    pub fn hparams(&self) -> &Value {
        &self.hparams
    }

    /// Look up one hyperparameter; missing is an invalid-hyperparameter error.
    pub fn hparam(&self, name: &str) -> Result<&Value, TrialError> {
        self.hparams
            .get(name)
            .ok_or_else(|| TrialError::invalid_hp(format!("missing hyperparameter '{name}'")))
    }

    pub fn global_batch_size(&self) -> u64 {
        self.global_batch_size
    }

    pub fn per_slot_batch_size(&self) -> u64 {
        (self.global_batch_size / self.dist.size() as u64).max(1)
    }

    pub fn aggregation_frequency(&self) -> u64 {
        self.aggregation_frequency
    }

    pub fn auto_amp(&self) -> bool {
        self.auto_amp
    }

    /// Batches per epoch; `None` until training data has been built.
    pub fn epoch_len(&self) -> Option<u64> {
        self.epoch_len
    }

    pub(crate) fn set_epoch_len(&mut self, epoch_len: u64) {
        self.epoch_len = Some(epoch_len);
    }

    /// Global index of the batch being trained.
    pub fn batch_idx(&self) -> u64 {
        self.batch_idx
    }

    pub(crate) fn set_batch_idx(&mut self, batch_idx: u64) {
        self.batch_idx = batch_idx;
    }

    pub fn is_epoch_start(&self) -> bool {
        self.epoch_len
            .is_some_and(|len| self.batch_idx % len.max(1) == 0)
    }

    pub fn is_epoch_end(&self) -> bool {
        self.epoch_len
            .is_some_and(|len| (self.batch_idx + 1) % len.max(1) == 0)
    }

    /// True on batches where accumulated gradients are exchanged and the
    /// optimizer steps.
    pub fn should_communicate_and_update(&self) -> bool {
        (self.batch_idx + 1) % self.aggregation_frequency == 0
    }

    /// Ask the controller to stop at the next step boundary, with a
    /// checkpoint.
    pub fn set_stop_requested(&mut self, stop: bool) {
        self.stop_requested = stop;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub fn rng(&mut self) -> &mut ChaCha8Rng {
        self.rng.host()
    }

    pub(crate) fn rng_streams(&self) -> &RngStreams {
        &self.rng
    }

    pub(crate) fn rng_streams_mut(&mut self) -> &mut RngStreams {
        &mut self.rng
    }
}
