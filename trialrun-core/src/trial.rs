//! User-facing trial contract.
//!
//! A [`Trial`] owns its models, optimizers, schedulers and optional scaler
//! and hands them to the controller as ordered lists. The position of each
//! object in its list is the identity it has inside a checkpoint bundle, so
//! a trial must return them in the same order on every call.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::context::TrialContext;
use crate::error::TrialError;
use crate::rng::EntropySource;
use crate::training::callbacks::TrialCallback;
use crate::training::metrics::EvaluationReducer;

/// Opaque serialized state of one wrapped object.
pub type StateDict = BTreeMap<String, Value>;

/// Anything whose state is saved in a checkpoint.
pub trait Stateful: Send {
    fn state_dict(&self) -> Result<StateDict, TrialError>;
    fn load_state_dict(&mut self, state: StateDict) -> Result<(), TrialError>;
}

pub trait Model: Stateful {
    /// Whether the model is wrapped for data parallelism. Wrapped models
    /// prefix every parameter key with `module.`.
    fn is_data_parallel(&self) -> bool {
        false
    }

    /// Switch between training and inference behavior.
    fn set_training(&mut self, _training: bool) {}
}

/// When the controller steps a learning-rate scheduler on the trial's behalf.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepMode {
    /// The trial steps the scheduler itself.
    #[default]
    Manual,
    EveryBatch,
    /// Only on batches where gradients are communicated and applied.
    EveryOptimizerStep,
    EveryEpoch,
}

pub trait LrScheduler: Stateful {
    fn step(&mut self);

    fn step_mode(&self) -> StepMode {
        StepMode::Manual
    }

    /// Step every `frequency` qualifying events.
    fn frequency(&self) -> u64 {
        1
    }
}

/// Dynamic loss scaler for mixed-precision training.
pub trait GradScaler: Stateful {
    /// Adjust the scale after an optimizer step.
    fn update(&mut self);
}

/// Which slice of a data source one worker reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub rank: usize,
    pub num_replicas: usize,
}

impl Shard {
    pub fn whole() -> Self {
        Self {
            rank: 0,
            num_replicas: 1,
        }
    }

    /// True when the global batch at `idx` belongs to this shard.
    pub fn owns(&self, idx: usize) -> bool {
        idx % self.num_replicas.max(1) == self.rank
    }
}

/// A finite, re-iterable source of batches.
pub trait DataSource<B>: Send {
    /// Number of batches in one pass over this worker's shard, if known.
    fn num_batches(&self, shard: Shard) -> Option<usize>;

    /// A fresh pass over the shard, starting after `skip` of its batches.
    fn batches(&self, skip: usize, shard: Shard) -> Box<dyn Iterator<Item = B> + Send>;
}

/// An in-memory data source. Global batch `i` belongs to worker
/// `i % num_replicas`.
#[derive(Debug, Clone)]
pub struct VecSource<B> {
    batches: Vec<B>,
}

impl<B> VecSource<B> {
    pub fn new(batches: Vec<B>) -> Self {
        Self { batches }
    }
}

impl<B: Clone + Send + Sync + 'static> DataSource<B> for VecSource<B> {
    fn num_batches(&self, shard: Shard) -> Option<usize> {
        Some((0..self.batches.len()).filter(|i| shard.owns(*i)).count())
    }

    fn batches(&self, skip: usize, shard: Shard) -> Box<dyn Iterator<Item = B> + Send> {
        let owned: Vec<B> = self
            .batches
            .iter()
            .enumerate()
            .filter(|(i, _)| shard.owns(*i))
            .skip(skip)
            .map(|(_, b)| b.clone())
            .collect();
        Box::new(owned.into_iter())
    }
}

/// A trainable, evaluable experiment.
///
/// Exactly one of [`Trial::evaluate_batch`] and
/// [`Trial::evaluate_full_dataset`] must be supported.
pub trait Trial: Send {
    type Batch: Send + 'static;

    /// Train on one batch and return its metrics: a mapping of names to
    /// numbers or numeric vectors, or a bare number taken as `loss`.
    fn train_batch(
        &mut self,
        ctx: &mut TrialContext,
        batch: Self::Batch,
        epoch_idx: u64,
        batch_idx: u64,
    ) -> Result<Value, TrialError>;

    fn build_training_data(
        &mut self,
        ctx: &TrialContext,
    ) -> Result<Box<dyn DataSource<Self::Batch>>, TrialError>;

    fn build_validation_data(
        &mut self,
        ctx: &TrialContext,
    ) -> Result<Box<dyn DataSource<Self::Batch>>, TrialError>;

    /// Number of records in a batch.
    fn batch_length(&self, batch: &Self::Batch) -> usize;

    fn models(&mut self) -> Vec<&mut dyn Model>;

    fn optimizers(&mut self) -> Vec<&mut dyn Stateful>;

    fn lr_schedulers(&mut self) -> Vec<&mut dyn LrScheduler> {
        Vec::new()
    }

    fn scaler(&mut self) -> Option<&mut dyn GradScaler> {
        None
    }

    fn build_callbacks(&mut self) -> Vec<(String, Box<dyn TrialCallback>)> {
        Vec::new()
    }

    fn supports_evaluate_batch(&self) -> bool {
        false
    }

    fn evaluate_batch(
        &mut self,
        _ctx: &TrialContext,
        _batch: Self::Batch,
        _batch_idx: u64,
    ) -> Result<Value, TrialError> {
        Err(TrialError::invalid_experiment(
            "evaluate_batch is not implemented by this trial",
        ))
    }

    fn supports_evaluate_full_dataset(&self) -> bool {
        false
    }

    fn evaluate_full_dataset(
        &mut self,
        _ctx: &TrialContext,
        _data: &dyn DataSource<Self::Batch>,
    ) -> Result<Value, TrialError> {
        Err(TrialError::invalid_experiment(
            "evaluate_full_dataset is not implemented by this trial",
        ))
    }

    fn evaluation_reducer(&self) -> EvaluationReducer {
        EvaluationReducer::default()
    }

    /// Extra random streams to seed, checkpoint and restore with the trial.
    fn entropy_sources(&mut self) -> Vec<Box<dyn EntropySource>> {
        Vec::new()
    }

    /// Name written into the reconstruction metadata of every checkpoint.
    fn trial_type(&self) -> String {
        std::any::type_name::<Self>().to_string()
    }
}
