//! Shared fixtures: a small linear-regression trial with real optimizer,
//! scheduler and random-stream state.

#![allow(dead_code)]

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{Value, json};
use std::sync::{Arc, Mutex};

use trialrun_core::context::TrialContext;
use trialrun_core::training::callbacks::{CallbackAction, TrialCallback};
use trialrun_core::training::metrics::Metrics;
use trialrun_core::training::unit::LengthSpec;
use trialrun_core::{
    DataSource, ExitRequest, LrScheduler, Model, PreemptionService, StateDict, Stateful, StepMode,
    Trial, TrialConfig, TrialError, VecSource,
};

pub type Batch = Vec<(f64, f64)>;

/// Batches drawn from `y = 3x + 0.5` plus a little noise.
pub fn make_batches(n_batches: usize, batch_size: usize, seed: u64) -> Vec<Batch> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    (0..n_batches)
        .map(|_| {
            (0..batch_size)
                .map(|_| {
                    let x: f64 = rng.gen_range(-1.0..1.0);
                    let noise: f64 = rng.gen_range(-0.05..0.05);
                    (x, 3.0 * x + 0.5 + noise)
                })
                .collect()
        })
        .collect()
}

fn read_f64(state: &StateDict, key: &str) -> Result<f64, TrialError> {
    state
        .get(key)
        .and_then(Value::as_f64)
        .ok_or_else(|| TrialError::checkpoint_format(format!("missing '{key}'")))
}

#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    pub weight: f64,
    pub bias: f64,
    pub data_parallel: bool,
    pub training: bool,
}

impl Linear {
    pub fn new(weight: f64, bias: f64) -> Self {
        Self {
            weight,
            bias,
            data_parallel: false,
            training: false,
        }
    }

    fn prefix(&self) -> &'static str {
        if self.data_parallel { "module." } else { "" }
    }

    pub fn mse(&self, batch: &Batch) -> f64 {
        let n = batch.len().max(1) as f64;
        batch
            .iter()
            .map(|(x, y)| (self.weight * x + self.bias - y).powi(2))
            .sum::<f64>()
            / n
    }
}

impl Stateful for Linear {
    fn state_dict(&self) -> Result<StateDict, TrialError> {
        let p = self.prefix();
        Ok([
            (format!("{p}weight"), json!(self.weight)),
            (format!("{p}bias"), json!(self.bias)),
        ]
        .into())
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<(), TrialError> {
        let p = self.prefix();
        self.weight = read_f64(&state, &format!("{p}weight"))?;
        self.bias = read_f64(&state, &format!("{p}bias"))?;
        Ok(())
    }
}

impl Model for Linear {
    fn is_data_parallel(&self) -> bool {
        self.data_parallel
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }
}

/// SGD with momentum; one velocity pair per model.
#[derive(Debug, Clone, PartialEq)]
pub struct Sgd {
    pub momentum: f64,
    pub velocity: Vec<(f64, f64)>,
    pub steps: u64,
}

impl Sgd {
    pub fn new(momentum: f64, n_models: usize) -> Self {
        Self {
            momentum,
            velocity: vec![(0.0, 0.0); n_models],
            steps: 0,
        }
    }
}

impl Stateful for Sgd {
    fn state_dict(&self) -> Result<StateDict, TrialError> {
        if self.momentum >= 1.0 {
            return Err(TrialError::invalid_hp(format!(
                "momentum {} does not converge",
                self.momentum
            )));
        }
        Ok([
            ("momentum".to_string(), json!(self.momentum)),
            ("velocity".to_string(), json!(self.velocity)),
            ("steps".to_string(), json!(self.steps)),
        ]
        .into())
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<(), TrialError> {
        self.momentum = read_f64(&state, "momentum")?;
        self.velocity = serde_json::from_value(state.get("velocity").cloned().unwrap_or_default())?;
        self.steps = state.get("steps").and_then(Value::as_u64).unwrap_or_default();
        Ok(())
    }
}

/// Multiplies the learning rate by `gamma` every `step_size` steps.
#[derive(Debug, Clone, PartialEq)]
pub struct StepLr {
    pub step_size: u64,
    pub gamma: f64,
    pub steps: u64,
    pub mode: StepMode,
}

impl StepLr {
    pub fn scale(&self) -> f64 {
        self.gamma.powi((self.steps / self.step_size.max(1)) as i32)
    }
}

impl Stateful for StepLr {
    fn state_dict(&self) -> Result<StateDict, TrialError> {
        Ok([("steps".to_string(), json!(self.steps))].into())
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<(), TrialError> {
        self.steps = state.get("steps").and_then(Value::as_u64).unwrap_or_default();
        Ok(())
    }
}

impl LrScheduler for StepLr {
    fn step(&mut self) {
        self.steps += 1;
    }

    fn step_mode(&self) -> StepMode {
        self.mode
    }
}

pub struct LinearTrial {
    pub models: Vec<Linear>,
    pub optimizer: Sgd,
    pub scheduler: StepLr,
    pub train: Vec<Batch>,
    pub val: Vec<Batch>,
    /// Validation batch index that reports an extra metric.
    pub mismatch_at: Option<u64>,
    pub callbacks: Vec<(String, Box<dyn TrialCallback>)>,
}

impl LinearTrial {
    pub fn new(n_models: usize) -> Self {
        Self {
            models: (0..n_models).map(|i| Linear::new(i as f64 * 0.1, 0.0)).collect(),
            optimizer: Sgd::new(0.5, n_models),
            scheduler: StepLr {
                step_size: 4,
                gamma: 0.5,
                steps: 0,
                mode: StepMode::EveryBatch,
            },
            train: make_batches(8, 4, 1),
            val: make_batches(3, 4, 2),
            mismatch_at: None,
            callbacks: Vec::new(),
        }
    }

    pub fn with_callback(mut self, name: &str, callback: Box<dyn TrialCallback>) -> Self {
        self.callbacks.push((name.to_string(), callback));
        self
    }
}

impl Trial for LinearTrial {
    type Batch = Batch;

    fn train_batch(
        &mut self,
        ctx: &mut TrialContext,
        batch: Batch,
        _epoch_idx: u64,
        _batch_idx: u64,
    ) -> Result<Value, TrialError> {
        let lr = ctx
            .hparam("lr")?
            .as_f64()
            .ok_or_else(|| TrialError::invalid_hp("lr must be a number"))?
            * self.scheduler.scale();
        let n = batch.len().max(1) as f64;
        let mut loss = 0.0;
        for (model, velocity) in self.models.iter_mut().zip(self.optimizer.velocity.iter_mut()) {
            let (mut gw, mut gb) = (0.0, 0.0);
            for (x, y) in &batch {
                let err = model.weight * x + model.bias - y;
                gw += 2.0 * err * x / n;
                gb += 2.0 * err / n;
            }
            loss += model.mse(&batch);
            velocity.0 = self.optimizer.momentum * velocity.0 + gw;
            velocity.1 = self.optimizer.momentum * velocity.1 + gb;
            model.weight -= lr * velocity.0;
            model.bias -= lr * velocity.1;
        }
        // Jitter from the controller-owned stream so restores must replay it.
        let jitter: f64 = ctx.rng().gen_range(-1e-6..1e-6);
        if let Some(first) = self.models.first_mut() {
            first.weight += jitter;
        }
        self.optimizer.steps += 1;
        Ok(json!({ "loss": loss / self.models.len().max(1) as f64 }))
    }

    fn build_training_data(
        &mut self,
        _ctx: &TrialContext,
    ) -> Result<Box<dyn DataSource<Batch>>, TrialError> {
        Ok(Box::new(VecSource::new(self.train.clone())))
    }

    fn build_validation_data(
        &mut self,
        _ctx: &TrialContext,
    ) -> Result<Box<dyn DataSource<Batch>>, TrialError> {
        Ok(Box::new(VecSource::new(self.val.clone())))
    }

    fn batch_length(&self, batch: &Batch) -> usize {
        batch.len()
    }

    fn models(&mut self) -> Vec<&mut dyn Model> {
        self.models.iter_mut().map(|m| m as &mut dyn Model).collect()
    }

    fn optimizers(&mut self) -> Vec<&mut dyn Stateful> {
        vec![&mut self.optimizer as &mut dyn Stateful]
    }

    fn lr_schedulers(&mut self) -> Vec<&mut dyn LrScheduler> {
        vec![&mut self.scheduler as &mut dyn LrScheduler]
    }

    fn build_callbacks(&mut self) -> Vec<(String, Box<dyn TrialCallback>)> {
        std::mem::take(&mut self.callbacks)
    }

    fn supports_evaluate_batch(&self) -> bool {
        true
    }

    fn evaluate_batch(
        &mut self,
        _ctx: &TrialContext,
        batch: Batch,
        batch_idx: u64,
    ) -> Result<Value, TrialError> {
        let loss = self.models[0].mse(&batch);
        if self.mismatch_at == Some(batch_idx) {
            return Ok(json!({ "validation_loss": loss, "accuracy": 1.0 }));
        }
        Ok(json!({ "validation_loss": loss }))
    }
}

/// Preempts on the `at`-th poll.
#[derive(Debug, Clone)]
pub struct PreemptAt {
    pub at: u64,
    pub checkpoint: bool,
    polls: u64,
}

impl PreemptAt {
    pub fn new(at: u64, checkpoint: bool) -> Self {
        Self {
            at,
            checkpoint,
            polls: 0,
        }
    }
}

impl PreemptionService for PreemptAt {
    fn should_preempt(&mut self) -> Option<ExitRequest> {
        self.polls += 1;
        (self.polls >= self.at).then_some(ExitRequest {
            checkpoint: self.checkpoint,
        })
    }
}

/// Records every hook it sees.
#[derive(Debug, Clone, Default)]
pub struct RecordingCallback {
    pub events: Arc<Mutex<Vec<String>>>,
    pub stop_after_validations: Option<usize>,
    pub validations: usize,
}

impl RecordingCallback {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    fn push(&self, event: String) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}

impl TrialCallback for RecordingCallback {
    fn on_trial_startup(&mut self, first_batch_idx: u64, _latest_checkpoint: Option<&str>) {
        self.push(format!("startup:{first_batch_idx}"));
    }

    fn on_trial_shutdown(&mut self) {
        self.push("shutdown".to_string());
    }

    fn on_training_epoch_start(&mut self, epoch_idx: u64) {
        self.push(format!("epoch_start:{epoch_idx}"));
    }

    fn on_training_epoch_end(&mut self, epoch_idx: u64) {
        self.push(format!("epoch_end:{epoch_idx}"));
    }

    fn on_validation_end(&mut self, _metrics: &Metrics) -> CallbackAction {
        self.validations += 1;
        self.push("validation_end".to_string());
        match self.stop_after_validations {
            Some(n) if self.validations >= n => CallbackAction::Stop,
            _ => CallbackAction::Continue,
        }
    }

    fn on_checkpoint_upload_end(&mut self, _storage_id: &str) {
        self.push("checkpoint".to_string());
    }

    fn state_dict(&self) -> Option<Value> {
        Some(json!({ "validations": self.validations }))
    }

    fn load_state_dict(&mut self, state: Value) -> Result<(), TrialError> {
        self.validations = state["validations"].as_u64().unwrap_or_default() as usize;
        Ok(())
    }
}

pub fn config(storage: &std::path::Path) -> TrialConfig {
    TrialConfig {
        scheduling_unit: 1,
        global_batch_size: 4,
        checkpoint_storage: storage.to_path_buf(),
        hyperparameters: json!({ "lr": 0.05 }),
        ..Default::default()
    }
}

pub fn local_config(storage: &std::path::Path, max_batches: u64) -> TrialConfig {
    TrialConfig {
        max_length: LengthSpec::batches(max_batches),
        ..config(storage)
    }
}
