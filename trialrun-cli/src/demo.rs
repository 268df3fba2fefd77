//! Built-in demo trial: linear regression on synthetic data, trained with
//! momentum SGD and a step learning-rate schedule.

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde_json::{Value, json};
use trialrun_core::context::TrialContext;
use trialrun_core::training::callbacks::{EarlyStoppingCallback, TrialCallback};
use trialrun_core::{
    DataSource, LrScheduler, Model, StateDict, Stateful, StepMode, Trial, TrialError, VecSource,
};

pub type Example = (Vec<f64>, f64);
pub type Batch = Vec<Example>;

fn hparam_f64(ctx: &TrialContext, name: &str) -> Result<f64, TrialError> {
    ctx.hparam(name)?
        .as_f64()
        .ok_or_else(|| TrialError::invalid_hp(format!("hyperparameter '{name}' must be a number")))
}

fn hparam_u64(ctx: &TrialContext, name: &str, default: u64) -> Result<u64, TrialError> {
    match ctx.hparams().get(name) {
        None => Ok(default),
        Some(v) => v.as_u64().ok_or_else(|| {
            TrialError::invalid_hp(format!("hyperparameter '{name}' must be a non-negative integer"))
        }),
    }
}

fn read_vec(state: &StateDict, key: &str) -> Result<Vec<f64>, TrialError> {
    let value = state
        .get(key)
        .cloned()
        .ok_or_else(|| TrialError::checkpoint_format(format!("missing '{key}'")))?;
    Ok(serde_json::from_value(value)?)
}

/// `y = w.x + b`
#[derive(Debug, Clone, PartialEq)]
pub struct LinearModel {
    pub weights: Vec<f64>,
    pub bias: f64,
}

impl LinearModel {
    pub fn new(features: usize) -> Self {
        Self {
            weights: vec![0.0; features],
            bias: 0.0,
        }
    }

    pub fn predict(&self, x: &[f64]) -> f64 {
        self.weights.iter().zip(x).map(|(w, x)| w * x).sum::<f64>() + self.bias
    }

    pub fn mse(&self, batch: &Batch) -> f64 {
        let n = batch.len().max(1) as f64;
        batch
            .iter()
            .map(|(x, y)| (self.predict(x) - y).powi(2))
            .sum::<f64>()
            / n
    }

    /// Gradient of the mean squared error: one entry per weight, then the bias.
    fn gradient(&self, batch: &Batch) -> Vec<f64> {
        let n = batch.len().max(1) as f64;
        let mut grad = vec![0.0; self.weights.len() + 1];
        for (x, y) in batch {
            let err = self.predict(x) - y;
            for (g, xi) in grad.iter_mut().zip(x) {
                *g += 2.0 * err * xi / n;
            }
            if let Some(b) = grad.last_mut() {
                *b += 2.0 * err / n;
            }
        }
        grad
    }
}

impl Stateful for LinearModel {
    fn state_dict(&self) -> Result<StateDict, TrialError> {
        Ok([
            ("weights".to_string(), json!(self.weights)),
            ("bias".to_string(), json!(self.bias)),
        ]
        .into())
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<(), TrialError> {
        let weights = read_vec(&state, "weights")?;
        if weights.len() != self.weights.len() {
            return Err(TrialError::state_mismatch(
                "linear model weights",
                self.weights.len(),
                weights.len(),
            ));
        }
        self.weights = weights;
        self.bias = state
            .get("bias")
            .and_then(Value::as_f64)
            .ok_or_else(|| TrialError::checkpoint_format("missing 'bias'"))?;
        Ok(())
    }
}

impl Model for LinearModel {}

#[derive(Debug, Clone, PartialEq)]
pub struct MomentumSgd {
    pub momentum: f64,
    pub velocity: Vec<f64>,
}

impl MomentumSgd {
    fn apply(&mut self, model: &mut LinearModel, grad: &[f64], lr: f64) {
        if self.velocity.len() != grad.len() {
            self.velocity = vec![0.0; grad.len()];
        }
        for (v, g) in self.velocity.iter_mut().zip(grad) {
            *v = self.momentum * *v + g;
        }
        let (weight_velocity, bias_velocity) = self.velocity.split_at(model.weights.len());
        for (w, v) in model.weights.iter_mut().zip(weight_velocity) {
            *w -= lr * v;
        }
        if let Some(v) = bias_velocity.first() {
            model.bias -= lr * v;
        }
    }
}

impl Stateful for MomentumSgd {
    fn state_dict(&self) -> Result<StateDict, TrialError> {
        Ok([
            ("momentum".to_string(), json!(self.momentum)),
            ("velocity".to_string(), json!(self.velocity)),
        ]
        .into())
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<(), TrialError> {
        self.velocity = read_vec(&state, "velocity")?;
        Ok(())
    }
}

/// Decays the learning rate by `gamma` at the end of every `step_size` epochs.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDecay {
    pub step_size: u64,
    pub gamma: f64,
    pub epochs: u64,
}

impl StepDecay {
    pub fn factor(&self) -> f64 {
        self.gamma.powi((self.epochs / self.step_size.max(1)) as i32)
    }
}

impl Stateful for StepDecay {
    fn state_dict(&self) -> Result<StateDict, TrialError> {
        Ok([("epochs".to_string(), json!(self.epochs))].into())
    }

    fn load_state_dict(&mut self, state: StateDict) -> Result<(), TrialError> {
        self.epochs = state.get("epochs").and_then(Value::as_u64).unwrap_or_default();
        Ok(())
    }
}

impl LrScheduler for StepDecay {
    fn step(&mut self) {
        self.epochs += 1;
    }

    fn step_mode(&self) -> StepMode {
        StepMode::EveryEpoch
    }
}

/// Synthetic regression problem with known coefficients.
pub fn synthetic_batches(
    n_batches: usize,
    batch_size: usize,
    features: usize,
    seed: u64,
) -> Vec<Batch> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let truth: Vec<f64> = (0..features).map(|i| (i as f64 + 1.0) * 0.5).collect();
    (0..n_batches)
        .map(|_| {
            (0..batch_size)
                .map(|_| {
                    let x: Vec<f64> = (0..features).map(|_| rng.gen_range(-1.0..1.0)).collect();
                    let noise: f64 = rng.gen_range(-0.01..0.01);
                    let y = truth.iter().zip(&x).map(|(w, x)| w * x).sum::<f64>() + 1.0 + noise;
                    (x, y)
                })
                .collect()
        })
        .collect()
}

pub struct LinearRegressionTrial {
    model: LinearModel,
    optimizer: MomentumSgd,
    scheduler: StepDecay,
    features: usize,
    patience: Option<usize>,
    metric: String,
}

impl LinearRegressionTrial {
    /// Build from hyperparameters: `features`, `momentum`, `lr_step_epochs`,
    /// `lr_gamma` and an optional early-stopping `patience`.
    pub fn from_hparams(hparams: &Value, searcher_metric: &str) -> Result<Self, TrialError> {
        let number = |name: &str, default: f64| -> Result<f64, TrialError> {
            match hparams.get(name) {
                None => Ok(default),
                Some(v) => v.as_f64().ok_or_else(|| {
                    TrialError::invalid_hp(format!("hyperparameter '{name}' must be a number"))
                }),
            }
        };
        let features = number("features", 3.0)?;
        if features < 1.0 {
            return Err(TrialError::invalid_hp("features must be at least 1"));
        }
        let features = features as usize;
        let momentum = number("momentum", 0.9)?;
        if !(0.0..1.0).contains(&momentum) {
            return Err(TrialError::invalid_hp(format!(
                "momentum must be in [0, 1), got {momentum}"
            )));
        }
        Ok(Self {
            model: LinearModel::new(features),
            optimizer: MomentumSgd {
                momentum,
                velocity: vec![0.0; features + 1],
            },
            scheduler: StepDecay {
                step_size: number("lr_step_epochs", 2.0)? as u64,
                gamma: number("lr_gamma", 0.5)?,
                epochs: 0,
            },
            features,
            patience: hparams
                .get("patience")
                .and_then(Value::as_u64)
                .map(|p| p as usize),
            metric: searcher_metric.to_string(),
        })
    }

    pub fn model(&self) -> &LinearModel {
        &self.model
    }
}

impl Trial for LinearRegressionTrial {
    type Batch = Batch;

    fn train_batch(
        &mut self,
        ctx: &mut TrialContext,
        batch: Batch,
        _epoch_idx: u64,
        _batch_idx: u64,
    ) -> Result<Value, TrialError> {
        let lr = hparam_f64(ctx, "learning_rate")? * self.scheduler.factor();
        let loss = self.model.mse(&batch);
        let grad = self.model.gradient(&batch);
        self.optimizer.apply(&mut self.model, &grad, lr);
        Ok(json!({ "loss": loss, "lr": lr }))
    }

    fn build_training_data(
        &mut self,
        ctx: &TrialContext,
    ) -> Result<Box<dyn DataSource<Batch>>, TrialError> {
        let n_batches = hparam_u64(ctx, "train_batches", 16)? as usize;
        let seed = hparam_u64(ctx, "data_seed", 0)?;
        Ok(Box::new(VecSource::new(synthetic_batches(
            n_batches,
            ctx.per_slot_batch_size() as usize,
            self.features,
            seed,
        ))))
    }

    fn build_validation_data(
        &mut self,
        ctx: &TrialContext,
    ) -> Result<Box<dyn DataSource<Batch>>, TrialError> {
        let n_batches = hparam_u64(ctx, "validation_batches", 4)? as usize;
        let seed = hparam_u64(ctx, "data_seed", 0)?.wrapping_add(1);
        Ok(Box::new(VecSource::new(synthetic_batches(
            n_batches,
            ctx.per_slot_batch_size() as usize,
            self.features,
            seed,
        ))))
    }

    fn batch_length(&self, batch: &Batch) -> usize {
        batch.len()
    }

    fn models(&mut self) -> Vec<&mut dyn Model> {
        vec![&mut self.model as &mut dyn Model]
    }

    fn optimizers(&mut self) -> Vec<&mut dyn Stateful> {
        vec![&mut self.optimizer as &mut dyn Stateful]
    }

    fn lr_schedulers(&mut self) -> Vec<&mut dyn LrScheduler> {
        vec![&mut self.scheduler as &mut dyn LrScheduler]
    }

    fn build_callbacks(&mut self) -> Vec<(String, Box<dyn TrialCallback>)> {
        match self.patience {
            Some(patience) => vec![(
                "early_stopping".to_string(),
                Box::new(EarlyStoppingCallback::new(self.metric.clone(), true, patience, 0.0))
                    as Box<dyn TrialCallback>,
            )],
            None => Vec::new(),
        }
    }

    fn supports_evaluate_batch(&self) -> bool {
        true
    }

    fn evaluate_batch(
        &mut self,
        _ctx: &TrialContext,
        batch: Batch,
        _batch_idx: u64,
    ) -> Result<Value, TrialError> {
        Ok(json!({ "validation_loss": self.model.mse(&batch) }))
    }

    fn trial_type(&self) -> String {
        "linear_regression".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trialrun_core::DistributedContext;

    fn ctx() -> TrialContext {
        TrialContext::new(
            DistributedContext::single(),
            1,
            json!({ "learning_rate": 0.1 }),
            8,
            1,
            false,
            0,
        )
    }

    #[test]
    fn test_training_reduces_loss() {
        let mut trial = LinearRegressionTrial::from_hparams(&json!({ "features": 2 }), "validation_loss").unwrap();
        let mut ctx = ctx();
        let data = synthetic_batches(8, 8, 2, 3);
        let before: f64 = data.iter().map(|b| trial.model().mse(b)).sum();
        for _ in 0..10 {
            for (i, batch) in data.iter().enumerate() {
                trial.train_batch(&mut ctx, batch.clone(), 0, i as u64).unwrap();
            }
        }
        let after: f64 = data.iter().map(|b| trial.model().mse(b)).sum();
        assert!(after < before / 10.0, "loss went from {before} to {after}");
    }

    #[test]
    fn test_invalid_momentum_rejected() {
        let err = LinearRegressionTrial::from_hparams(&json!({ "momentum": 1.2 }), "validation_loss")
            .err()
            .unwrap();
        assert!(err.is_invalid_hp());
    }

    #[test]
    fn test_model_state_round_trip_checks_width() {
        let mut model = LinearModel::new(3);
        model.weights = vec![1.0, 2.0, 3.0];
        let state = model.state_dict().unwrap();
        let mut narrow = LinearModel::new(2);
        assert!(narrow.load_state_dict(state.clone()).is_err());
        let mut same = LinearModel::new(3);
        same.load_state_dict(state).unwrap();
        assert_eq!(same, model);
    }

    #[test]
    fn test_step_decay_factor() {
        let mut decay = StepDecay {
            step_size: 2,
            gamma: 0.5,
            epochs: 0,
        };
        assert_eq!(decay.factor(), 1.0);
        decay.step();
        decay.step();
        assert_eq!(decay.factor(), 0.5);
    }
}
