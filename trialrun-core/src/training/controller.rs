//! The trial execution controller.
//!
//! Every worker runs the same controller in lock-step. Decisions that only
//! the chief may make (scheduler traffic, checkpoint writes, full-dataset
//! evaluation) are computed on rank 0 and broadcast, so all workers take the
//! same branch at every collective.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;
use std::time::Instant;

use crate::config::{CheckpointPolicy, TrialConfig};
use crate::context::TrialContext;
use crate::distributed::DistributedContext;
use crate::error::TrialError;
use crate::metric_writer::{MetricWriter, TracingMetricWriter};
use crate::preemption::{ExitRequest, NeverPreempt, PreemptionService};
use crate::searcher::{self, EarlyExitReason, SchedulerClient, SearcherOperation};
use crate::storage::{CheckpointMetadata, CheckpointStorage};
use crate::training::callbacks::CallbackSet;
use crate::training::cadence::{self, Progress};
use crate::training::checkpoint::{self, CheckpointBundle, LiveCounts, LoadData};
use crate::training::metrics::{self, Metrics, TrainingReport};
use crate::training::reducer;
use crate::training::state::TrialState;
use crate::training::stream::TrainingStream;
use crate::training::unit::{SearcherUnit, TrainUnit};
use crate::trial::{DataSource, Shard, StepMode, Trial};

/// Where the controller is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerPhase {
    Idle,
    Initializing,
    Running,
    Validating,
    Checkpointing,
    ReportingProgress,
    Completed,
    Preempted,
    Failed,
}

/// Result of every step function. Early exits are values, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopOutcome {
    Continue,
    Completed,
    Exit(ExitRequest),
    InvalidHyperparameters,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunExit {
    Completed,
    Preempted,
    InvalidHyperparameters,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub exit: RunExit,
    pub batches_trained: u64,
    pub epochs_trained: u64,
    pub operations_completed: usize,
    pub latest_checkpoint: Option<String>,
    /// Reduced metrics of the last validation. Only the chief has them.
    pub last_validation: Option<Metrics>,
}

/// Identity of this run of the trial.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchInfo {
    pub trial_id: u64,
    /// Storage id of the checkpoint to resume from.
    pub latest_checkpoint: Option<String>,
}

/// External collaborators. Scheduler connections given to non-chief workers
/// are dropped; storage must be readable from every worker.
pub struct TrialServices {
    pub scheduler: Option<Box<dyn SchedulerClient>>,
    pub storage: Box<dyn CheckpointStorage>,
    pub preemption: Box<dyn PreemptionService>,
    pub metric_writer: Box<dyn MetricWriter>,
}

impl TrialServices {
    /// Services for training without a searcher.
    pub fn local(storage: Box<dyn CheckpointStorage>) -> Self {
        Self {
            scheduler: None,
            storage,
            preemption: Box::new(NeverPreempt),
            metric_writer: Box::new(TracingMetricWriter),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Box<dyn SchedulerClient>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    pub fn with_preemption(mut self, preemption: Box<dyn PreemptionService>) -> Self {
        self.preemption = preemption;
        self
    }

    pub fn with_metric_writer(mut self, writer: Box<dyn MetricWriter>) -> Self {
        self.metric_writer = writer;
        self
    }
}

/// What the chief decided after reporting a validation.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct ValidationVerdict {
    checkpoint: bool,
    completed_with: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum StoreOutcome {
    Stored(String),
    InvalidHyperparameters(String),
}

pub struct TrialController<T: Trial> {
    trial: T,
    ctx: TrialContext,
    dist: DistributedContext,
    config: TrialConfig,
    launch: LaunchInfo,

    scheduler: Option<Box<dyn SchedulerClient>>,
    storage: Box<dyn CheckpointStorage>,
    preemption: Box<dyn PreemptionService>,
    metric_writer: Box<dyn MetricWriter>,
    callbacks: CallbackSet,

    training: TrainingStream<T::Batch>,
    validation: Box<dyn DataSource<T::Batch>>,
    shard: Shard,
    epoch_len: u64,
    validation_period: Option<TrainUnit>,
    checkpoint_period: Option<TrainUnit>,
    searcher_unit: Option<SearcherUnit>,
    evaluate_per_batch: bool,

    state: TrialState,
    phase: ControllerPhase,
    op: Option<SearcherOperation>,
    max_length: Option<TrainUnit>,
    batch_metrics: Vec<Metrics>,
    best_metric: Option<f64>,
    last_searcher_metric: Option<f64>,
    last_validation: Option<Metrics>,
    latest_checkpoint: Option<String>,
    operations_completed: usize,
}

impl<T: Trial> TrialController<T> {
    /// Check the trial and wire it to its collaborators. Every worker must
    /// construct its controller; the epoch length and searcher unit are
    /// agreed here through the chief.
    pub fn new(
        mut trial: T,
        config: TrialConfig,
        launch: LaunchInfo,
        services: TrialServices,
        dist: DistributedContext,
    ) -> Result<Self, TrialError> {
        config.validate()?;

        if trial.models().is_empty() {
            return Err(TrialError::invalid_experiment(
                "the trial must expose at least one model",
            ));
        }
        if trial.optimizers().is_empty() {
            return Err(TrialError::invalid_experiment(
                "the trial must expose at least one optimizer",
            ));
        }
        let per_batch = trial.supports_evaluate_batch();
        if per_batch == trial.supports_evaluate_full_dataset() {
            return Err(TrialError::invalid_experiment(
                "define exactly one of evaluate_batch or evaluate_full_dataset",
            ));
        }
        if config.auto_amp && trial.scaler().is_none() {
            tracing::warn!("auto_amp is enabled but the trial has no gradient scaler");
        }

        let mut ctx = TrialContext::new(
            dist.clone(),
            launch.trial_id,
            config.hyperparameters.clone(),
            config.global_batch_size,
            config.aggregation_frequency,
            config.auto_amp,
            config.seed,
        );
        for source in trial.entropy_sources() {
            ctx.rng_streams_mut().register(source);
        }
        ctx.rng_streams_mut().seed_all(config.seed);

        let callbacks = CallbackSet::new(trial.build_callbacks())?;
        let shard = Shard {
            rank: dist.rank(),
            num_replicas: dist.size(),
        };
        let training_source = trial.build_training_data(&ctx)?;
        let validation = trial.build_validation_data(&ctx)?;

        let epoch_len = dist.chief_computed(|| match training_source.num_batches(shard) {
            Some(0) => Err(TrialError::data("training data has no batches")),
            Some(n) => Ok(n as u64),
            None => Ok(u64::MAX),
        })?;
        ctx.set_epoch_len(epoch_len);

        let mut scheduler = services.scheduler;
        if !dist.is_chief() && scheduler.take().is_some() {
            tracing::debug!(rank = dist.rank(), "ignoring scheduler connection on non-chief worker");
        }
        let searcher_unit =
            dist.chief_computed(|| Ok(scheduler.as_ref().map(|s| s.configured_unit())))?;
        if searcher_unit.is_none() && config.max_length.is_empty() {
            return Err(TrialError::invalid_experiment(
                "training without a searcher requires max_length",
            ));
        }

        let validation_period = config.validation_period()?;
        let checkpoint_period = config.checkpoint_period()?;
        let state = TrialState::new(launch.trial_id, 0, epoch_len);

        tracing::info!(
            trial_id = launch.trial_id,
            rank = dist.rank(),
            size = dist.size(),
            epoch_len,
            searcher = ?searcher_unit,
            "trial controller ready"
        );

        Ok(Self {
            trial,
            ctx,
            dist,
            config,
            launch,
            scheduler,
            storage: services.storage,
            preemption: services.preemption,
            metric_writer: services.metric_writer,
            callbacks,
            training: TrainingStream::new(training_source, shard),
            validation,
            shard,
            epoch_len,
            validation_period,
            checkpoint_period,
            searcher_unit,
            evaluate_per_batch: per_batch,
            state,
            phase: ControllerPhase::Idle,
            op: None,
            max_length: None,
            batch_metrics: Vec::new(),
            best_metric: None,
            last_searcher_metric: None,
            last_validation: None,
            latest_checkpoint: None,
            operations_completed: 0,
        })
    }

    pub fn state(&self) -> &TrialState {
        &self.state
    }

    pub fn phase(&self) -> ControllerPhase {
        self.phase
    }

    pub fn trial(&self) -> &T {
        &self.trial
    }

    pub fn trial_mut(&mut self) -> &mut T {
        &mut self.trial
    }

    pub fn context(&self) -> &TrialContext {
        &self.ctx
    }

    pub fn epoch_len(&self) -> u64 {
        self.epoch_len
    }

    pub fn latest_checkpoint(&self) -> Option<&str> {
        self.latest_checkpoint.as_deref()
    }

    pub fn into_trial(self) -> T {
        self.trial
    }

    fn set_phase(&mut self, phase: ControllerPhase) {
        if self.phase != phase {
            tracing::debug!(from = ?self.phase, to = ?phase, "controller phase");
            self.phase = phase;
        }
    }

    fn progress(&self) -> Progress {
        self.state.progress(self.config.global_batch_size)
    }

    /// Run every operation to completion, or until an early exit.
    ///
    /// Trial shutdown hooks run however the run ends.
    pub fn run(&mut self) -> Result<RunSummary, TrialError> {
        self.set_phase(ControllerPhase::Initializing);
        let result = self.run_inner();
        self.callbacks.for_each(|cb| cb.on_trial_shutdown());

        let exit = match result {
            Ok(exit) => exit,
            Err(e) => {
                self.set_phase(ControllerPhase::Failed);
                tracing::error!(error = %e, rank = self.dist.rank(), "trial failed");
                return Err(e);
            }
        };
        Ok(RunSummary {
            exit,
            batches_trained: self.state.batches_trained,
            epochs_trained: self.state.epochs_trained,
            operations_completed: self.operations_completed,
            latest_checkpoint: self.latest_checkpoint.clone(),
            last_validation: self.last_validation.clone(),
        })
    }

    fn run_inner(&mut self) -> Result<RunExit, TrialError> {
        if let Some(storage_id) = self.launch.latest_checkpoint.clone() {
            tracing::info!(storage_id = %storage_id, "restoring trial from checkpoint");
            self.restore(&storage_id)?;
        }
        self.training.seek(self.state.batches_trained, self.epoch_len);

        let first_batch = self.state.batches_trained;
        let latest = self.launch.latest_checkpoint.clone();
        self.callbacks
            .for_each(|cb| cb.on_trial_startup(first_batch, latest.as_deref()));
        for model in self.trial.models() {
            model.set_training(true);
        }
        self.callbacks.for_each(|cb| cb.on_training_start());
        self.set_status("training");

        let outcome = match self.searcher_unit {
            Some(unit) => self.run_operations(unit)?,
            None => self.run_local()?,
        };

        match outcome {
            LoopOutcome::Continue | LoopOutcome::Completed => {
                self.set_phase(ControllerPhase::Completed);
                tracing::info!(
                    batches_trained = self.state.batches_trained,
                    operations = self.operations_completed,
                    "trial completed"
                );
                Ok(RunExit::Completed)
            }
            LoopOutcome::Exit(request) => {
                tracing::info!(
                    batches_trained = self.state.batches_trained,
                    checkpoint = request.checkpoint,
                    "trial exiting early"
                );
                if request.checkpoint {
                    if let LoopOutcome::InvalidHyperparameters = self.checkpoint()? {
                        return Ok(RunExit::InvalidHyperparameters);
                    }
                }
                self.set_phase(ControllerPhase::Preempted);
                Ok(RunExit::Preempted)
            }
            LoopOutcome::InvalidHyperparameters => {
                self.set_phase(ControllerPhase::Preempted);
                Ok(RunExit::InvalidHyperparameters)
            }
        }
    }

    fn run_operations(&mut self, unit: SearcherUnit) -> Result<LoopOutcome, TrialError> {
        loop {
            let next = searcher::next_operation(&self.dist, self.scheduler.as_mut())?;
            let Some(op) = next else {
                return Ok(LoopOutcome::Completed);
            };
            let max_length = TrainUnit::from_searcher_unit(op.length(), unit);
            tracing::info!(op = op.id(), length = %max_length, "starting searcher operation");
            self.op = Some(op);

            match self.train_for(max_length)? {
                LoopOutcome::Continue | LoopOutcome::Completed => {}
                other => return Ok(other),
            }
            self.ensure_completed()?;
            self.operations_completed += 1;
            self.op = None;
        }
    }

    fn run_local(&mut self) -> Result<LoopOutcome, TrialError> {
        let max_length = self
            .config
            .local_max_length()?
            .ok_or_else(|| TrialError::invalid_experiment("max_length is not set"))?;
        let outcome = self.train_for(max_length)?;
        if matches!(outcome, LoopOutcome::Continue | LoopOutcome::Completed) {
            self.operations_completed += 1;
        }
        Ok(outcome)
    }

    /// Train until `max_length` is reached, then run the end-of-operation
    /// sequence.
    fn train_for(&mut self, max_length: TrainUnit) -> Result<LoopOutcome, TrialError> {
        self.max_length = Some(max_length);
        self.set_phase(ControllerPhase::Running);

        while cadence::steps_remaining(&max_length, &self.progress()) > 0 {
            let batch = self.training.next_batch();
            let batch = self.dist.all_ok(batch)?;
            let trained = self.train_one_batch(batch);
            self.dist.all_ok(trained)?;
            match self.after_batch()? {
                LoopOutcome::Continue => {}
                other => return Ok(other),
            }
        }
        tracing::debug!(length = %max_length, "training finished for operation");

        self.report_training_metrics()?;
        if !self.state.validation_is_current() {
            let outcome = self.validate_and_report()?;
            if outcome != LoopOutcome::Continue {
                return Ok(outcome);
            }
        }
        if !self.state.checkpoint_is_current() {
            let outcome = self.checkpoint()?;
            if outcome != LoopOutcome::Continue {
                return Ok(outcome);
            }
        }
        Ok(LoopOutcome::Completed)
    }

    fn train_one_batch(&mut self, batch: T::Batch) -> Result<(), TrialError> {
        let batch_idx = self.state.batches_trained;
        let epoch_idx = cadence::epoch_of(batch_idx, self.epoch_len);
        self.ctx.set_batch_idx(batch_idx);

        let raw = self
            .trial
            .train_batch(&mut self.ctx, batch, epoch_idx, batch_idx)?;
        let metrics = metrics::metrics_from_value(raw, "train_batch", true)?;
        self.auto_step(batch_idx, epoch_idx);

        self.state.step(self.epoch_len);
        if self.ctx.is_epoch_start() {
            self.callbacks
                .for_each(|cb| cb.on_training_epoch_start(epoch_idx));
        }
        if self.ctx.is_epoch_end() {
            self.callbacks.for_each(|cb| cb.on_training_epoch_end(epoch_idx));
        }
        self.batch_metrics.push(metrics);
        Ok(())
    }

    /// Step schedulers and the gradient scaler for the batch just trained.
    fn auto_step(&mut self, batch_idx: u64, epoch_idx: u64) {
        let optimizer_step = self.ctx.should_communicate_and_update();
        let epoch_end = self.ctx.is_epoch_end();
        let aggregation = self.ctx.aggregation_frequency();

        for scheduler in self.trial.lr_schedulers() {
            let frequency = scheduler.frequency().max(1);
            let due = match scheduler.step_mode() {
                StepMode::Manual => false,
                StepMode::EveryBatch => (batch_idx + 1) % frequency == 0,
                StepMode::EveryOptimizerStep => {
                    optimizer_step && ((batch_idx + 1) / aggregation) % frequency == 0
                }
                StepMode::EveryEpoch => epoch_end && (epoch_idx + 1) % frequency == 0,
            };
            if due {
                scheduler.step();
            }
        }

        if self.config.auto_amp && optimizer_step {
            if let Some(scaler) = self.trial.scaler() {
                scaler.update();
            }
        }
    }

    /// Cadence evaluation after a batch.
    fn after_batch(&mut self) -> Result<LoopOutcome, TrialError> {
        let progress = self.progress();
        let should_validate = cadence::is_due(self.validation_period.as_ref(), &progress);
        let should_checkpoint = cadence::is_due(self.checkpoint_period.as_ref(), &progress);
        let should_report =
            cadence::is_report_boundary(self.state.batches_trained, self.config.scheduling_unit);
        if !(should_validate || should_checkpoint || should_report) {
            return Ok(LoopOutcome::Continue);
        }

        self.set_phase(ControllerPhase::ReportingProgress);
        let reported = self.report_searcher_progress();
        self.dist.all_ok(reported)?;
        self.report_training_metrics()?;

        if should_validate {
            let outcome = self.validate_and_report()?;
            if outcome != LoopOutcome::Continue {
                return Ok(outcome);
            }
        }
        if should_checkpoint {
            let outcome = self.checkpoint()?;
            if outcome != LoopOutcome::Continue {
                return Ok(outcome);
            }
        }
        self.set_phase(ControllerPhase::Running);

        match self.check_stop()? {
            Some(request) => Ok(LoopOutcome::Exit(request)),
            None => Ok(LoopOutcome::Continue),
        }
    }

    fn report_searcher_progress(&mut self) -> Result<(), TrialError> {
        let (Some(op), Some(unit)) = (self.op.as_mut(), self.searcher_unit) else {
            return Ok(());
        };
        if op.is_completed() {
            return Ok(());
        }
        let progress = self
            .state
            .progress(self.config.global_batch_size)
            .in_searcher_unit(unit);
        op.report_progress(self.scheduler.as_mut(), progress)
    }

    /// Reduce and report buffered training metrics, then clear the buffer.
    fn report_training_metrics(&mut self) -> Result<(), TrialError> {
        if self.batch_metrics.is_empty() {
            return Ok(());
        }
        let buffered = std::mem::take(&mut self.batch_metrics);
        let batches = if self.config.average_training_metrics && self.dist.size() > 1 {
            reducer::combine_and_average_training_metrics(&self.dist, &buffered)?
        } else {
            buffered
        };
        let report = self.dist.all_ok(TrainingReport::from_batches(batches))?;

        let stop = self.callbacks.any_stop(|cb| {
            cb.on_training_workload_end(&report.avg_metrics, &report.batch_metrics)
        });
        if stop {
            self.ctx.set_stop_requested(true);
        }

        let steps = self.state.batches_trained;
        if self.dist.is_chief() {
            self.metric_writer.on_train_step_end(steps, &report);
        }
        let sent = match self.scheduler.as_mut() {
            Some(s) => s.report_training_metrics(steps, &report),
            None => Ok(()),
        };
        self.dist.all_ok(sent)
    }

    fn validate_and_report(&mut self) -> Result<LoopOutcome, TrialError> {
        if self.state.validation_is_current() {
            return Ok(LoopOutcome::Continue);
        }
        let metrics = self.validate()?;
        self.report_validation(metrics)
    }

    /// Evaluate at the current step. Returns the reduced metrics on the
    /// chief and `None` elsewhere. A no-op when validation is current.
    pub fn validate(&mut self) -> Result<Option<Metrics>, TrialError> {
        if self.state.validation_is_current() {
            return Ok(None);
        }
        self.set_phase(ControllerPhase::Validating);
        self.set_status("validating");
        let started = Instant::now();
        for model in self.trial.models() {
            model.set_training(false);
        }
        self.callbacks.for_each(|cb| cb.on_validation_start());

        let reduced = if self.evaluate_per_batch {
            self.evaluate_batches(started)?
        } else {
            let local = if self.dist.is_chief() {
                self.trial
                    .evaluate_full_dataset(&self.ctx, &*self.validation)
                    .and_then(|v| metrics::metrics_from_value(v, "evaluate_full_dataset", false))
                    .map(Some)
            } else {
                Ok(None)
            };
            self.dist.all_ok(local)?
        };

        let observed = if self.dist.size() > 1 && self.callbacks.observes_validation_end() {
            Some(self.dist.broadcast(reduced.clone().unwrap_or_default())?)
        } else {
            reduced.clone()
        };
        if let Some(metrics) = &observed {
            if self.callbacks.any_stop(|cb| cb.on_validation_end(metrics)) {
                self.ctx.set_stop_requested(true);
            }
        }

        for model in self.trial.models() {
            model.set_training(true);
        }
        self.state.last_validation_step = self.state.batches_trained;
        self.set_status("training");
        if reduced.is_some() {
            self.last_validation = reduced.clone();
        }
        Ok(reduced)
    }

    fn evaluate_batches(&mut self, started: Instant) -> Result<Option<Metrics>, TrialError> {
        self.callbacks.for_each(|cb| cb.on_validation_epoch_start());
        let local = self.evaluate_local_shard();
        let (batch_metrics, examples) = self.dist.all_ok(local)?;
        self.callbacks
            .for_each(|cb| cb.on_validation_epoch_end(&batch_metrics));

        let n_batches = batch_metrics.len() as u64;
        let counts = reducer::sum_input_counts(&self.dist, (examples, n_batches))?;
        let eval_reducer = self.trial.evaluation_reducer();
        let reduced = reducer::reduce_validation_metrics(&self.dist, batch_metrics, &eval_reducer);
        let reduced = self.dist.all_ok(reduced)?;

        if let Some((examples, batches)) = counts {
            let secs = started.elapsed().as_secs_f64();
            tracing::info!(
                examples,
                batches,
                elapsed_secs = secs,
                examples_per_sec = if secs > 0.0 { examples as f64 / secs } else { 0.0 },
                "validation finished"
            );
        }
        Ok(reduced)
    }

    /// One pass over this worker's validation shard. Every batch must report
    /// the same metric names.
    fn evaluate_local_shard(&mut self) -> Result<(Vec<Metrics>, u64), TrialError> {
        let mut batch_metrics: Vec<Metrics> = Vec::new();
        let mut expected: Option<BTreeSet<String>> = None;
        let mut examples = 0u64;

        for (idx, batch) in self.validation.batches(0, self.shard).enumerate() {
            examples += self.trial.batch_length(&batch) as u64;
            let raw = self.trial.evaluate_batch(&self.ctx, batch, idx as u64)?;
            let m = metrics::metrics_from_value(raw, "evaluate_batch", false)?;
            let keys = metrics::key_set(&m);
            match &expected {
                Some(exp) if *exp != keys => {
                    return Err(TrialError::MetricKeyMismatch {
                        expected: exp.iter().cloned().collect(),
                        found: keys.into_iter().collect(),
                        batch_idx: idx,
                    });
                }
                Some(_) => {}
                None => expected = Some(keys),
            }
            batch_metrics.push(m);
            if self.config.test_mode {
                break;
            }
        }
        Ok((batch_metrics, examples))
    }

    /// Report validation metrics on the chief, complete the operation when
    /// its length is reached, and checkpoint according to the policy.
    fn report_validation(&mut self, metrics: Option<Metrics>) -> Result<LoopOutcome, TrialError> {
        let dist = self.dist.clone();
        let verdict = dist.chief_computed(|| self.validation_verdict(metrics.as_ref()))?;

        if let Some(metric) = verdict.completed_with {
            if let Some(op) = self.op.as_mut().filter(|op| !op.is_completed()) {
                op.report_completed(None, metric)?;
            }
        }
        if verdict.checkpoint {
            return self.checkpoint();
        }
        Ok(LoopOutcome::Continue)
    }

    fn validation_verdict(&mut self, metrics: Option<&Metrics>) -> Result<ValidationVerdict, TrialError> {
        let metrics =
            metrics.ok_or_else(|| TrialError::searcher("chief has no reduced validation metrics"))?;
        let searcher_metric = self.searcher_metric(metrics)?;
        let steps = self.state.batches_trained;

        let best_before = match self.scheduler.as_ref() {
            Some(s) => s.best_validation()?,
            None => self.best_metric,
        };

        let mut completed_with = None;
        let remaining = self
            .max_length
            .map(|len| cadence::steps_remaining(&len, &self.progress()));
        if let (Some(op), Some(metric)) = (self.op.as_mut(), searcher_metric) {
            if !op.is_completed() && remaining.is_some_and(|r| r < 1) {
                op.report_completed(self.scheduler.as_mut(), metric)?;
                completed_with = Some(metric);
            }
        }

        if let Some(s) = self.scheduler.as_mut() {
            s.report_validation_metrics(steps, metrics)?;
        }
        self.metric_writer.on_validation_step_end(steps, metrics);

        let improved = searcher_metric.is_some_and(|m| self.improves(m, best_before));
        if improved {
            self.best_metric = searcher_metric;
        }
        if searcher_metric.is_some() {
            self.last_searcher_metric = searcher_metric;
        }

        let checkpoint = !self.state.checkpoint_is_current()
            && match self.config.checkpoint_policy {
                CheckpointPolicy::All => true,
                CheckpointPolicy::Best => improved,
                CheckpointPolicy::None => false,
            };
        Ok(ValidationVerdict {
            checkpoint,
            completed_with,
        })
    }

    /// The configured searcher metric. Required when a searcher is attached.
    fn searcher_metric(&self, metrics: &Metrics) -> Result<Option<f64>, TrialError> {
        let name = &self.config.searcher.metric;
        match metrics.get(name) {
            Some(value) => value.as_scalar().map(Some).ok_or_else(|| {
                TrialError::SearcherMetric(format!("searcher metric '{name}' must be a scalar"))
            }),
            None if self.searcher_unit.is_some() => Err(TrialError::SearcherMetric(format!(
                "searcher is configured to use metric '{name}' but validation returned {:?}",
                metrics.keys().collect::<Vec<_>>()
            ))),
            None => Ok(None),
        }
    }

    fn improves(&self, value: f64, best: Option<f64>) -> bool {
        match best {
            None => true,
            Some(b) if self.config.searcher.smaller_is_better => value < b,
            Some(b) => value > b,
        }
    }

    /// Report completion if validation never did, e.g. when the operation's
    /// length was already reached by a restored checkpoint.
    fn ensure_completed(&mut self) -> Result<(), TrialError> {
        let pending = self.op.as_ref().is_some_and(|op| !op.is_completed());
        if !pending {
            return Ok(());
        }
        let dist = self.dist.clone();
        let metric = dist.chief_computed(|| {
            let fallback = match self.scheduler.as_ref() {
                Some(s) => s.last_validation()?.and_then(|r| r.searcher_metric),
                None => None,
            };
            self.last_searcher_metric.or(fallback).ok_or_else(|| {
                TrialError::searcher("operation finished without a searcher metric to report")
            })
        })?;
        if let Some(op) = self.op.as_mut() {
            let client = if self.dist.is_chief() {
                self.scheduler.as_mut()
            } else {
                None
            };
            let done = op.report_completed(client, metric);
            self.dist.all_ok(done)?;
        }
        Ok(())
    }

    /// Poll preemption on the chief and stop flags everywhere; every worker
    /// gets the same answer.
    fn check_stop(&mut self) -> Result<Option<ExitRequest>, TrialError> {
        let preempt = if self.dist.is_chief() {
            self.preemption.should_preempt()
        } else {
            None
        };
        let local = self
            .ctx
            .stop_requested()
            .then_some(ExitRequest { checkpoint: true });
        let mine = match (preempt, local) {
            (Some(a), Some(b)) => Some(ExitRequest {
                checkpoint: a.checkpoint || b.checkpoint,
            }),
            (a, b) => a.or(b),
        };
        let all: Vec<Option<ExitRequest>> = self.dist.allgather(mine)?;
        Ok(all.into_iter().flatten().reduce(|a, b| ExitRequest {
            checkpoint: a.checkpoint || b.checkpoint,
        }))
    }

    fn set_status(&mut self, label: &str) {
        self.preemption.set_status(label);
    }

    /// Checkpoint at the current step. A no-op when a checkpoint already
    /// exists for it.
    pub fn checkpoint(&mut self) -> Result<LoopOutcome, TrialError> {
        if self.state.checkpoint_is_current() {
            return Ok(LoopOutcome::Continue);
        }
        self.set_phase(ControllerPhase::Checkpointing);
        self.set_status("checkpointing");
        self.state.last_checkpoint_step = self.state.batches_trained;

        let dist = self.dist.clone();
        let outcome = dist.chief_computed(|| self.store_checkpoint())?;
        self.set_status("training");
        match outcome {
            StoreOutcome::Stored(storage_id) => {
                self.callbacks
                    .for_each(|cb| cb.on_checkpoint_upload_end(&storage_id));
                self.latest_checkpoint = Some(storage_id);
                Ok(LoopOutcome::Continue)
            }
            StoreOutcome::InvalidHyperparameters(msg) => {
                tracing::warn!(reason = %msg, "invalid hyperparameters while checkpointing");
                Ok(LoopOutcome::InvalidHyperparameters)
            }
        }
    }

    fn store_checkpoint(&mut self) -> Result<StoreOutcome, TrialError> {
        match self.write_checkpoint() {
            Ok(storage_id) => Ok(StoreOutcome::Stored(storage_id)),
            Err(e) if e.is_invalid_hp() => {
                if let Some(s) = self.scheduler.as_mut() {
                    s.report_early_exit(EarlyExitReason::InvalidHp)?;
                }
                Ok(StoreOutcome::InvalidHyperparameters(e.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn write_checkpoint(&mut self) -> Result<String, TrialError> {
        let bundle = self.build_bundle()?;
        let state = self.state.clone();
        let load_data = LoadData {
            trial_type: self.trial.trial_type(),
            experiment_config: serde_json::to_value(&self.config)?,
            hparams: self.config.hyperparameters.clone(),
            trialrun_version: crate::VERSION.to_string(),
        };
        let metadata = CheckpointMetadata::new(state.batches_trained);
        let callbacks = &mut self.callbacks;
        self.storage.store(&metadata, &mut |dir: &Path| {
            checkpoint::write_checkpoint(dir, &bundle, &state, &load_data)?;
            callbacks.for_each(|cb| cb.on_checkpoint_write_end(dir));
            Ok(())
        })
    }

    /// Capture everything a checkpoint holds, in wrap order.
    pub fn build_bundle(&mut self) -> Result<CheckpointBundle, TrialError> {
        let mut bundle = CheckpointBundle::new(self.state.batches_trained);
        bundle.models_state_dict = Some(
            self.trial
                .models()
                .into_iter()
                .map(|m| m.state_dict())
                .collect::<Result<_, _>>()?,
        );
        bundle.optimizers_state_dict = Some(
            self.trial
                .optimizers()
                .into_iter()
                .map(|o| o.state_dict())
                .collect::<Result<_, _>>()?,
        );
        bundle.lr_schedulers_state_dict = Some(
            self.trial
                .lr_schedulers()
                .into_iter()
                .map(|s| s.state_dict())
                .collect::<Result<_, _>>()?,
        );
        bundle.scaler_state_dict = self.trial.scaler().map(|s| s.state_dict()).transpose()?;
        bundle.rng_state = Some(self.ctx.rng_streams().capture()?);
        bundle.callbacks = self.callbacks.state_dicts();
        self.callbacks
            .try_for_each(|cb| cb.on_checkpoint_save_start(&mut bundle))?;
        Ok(bundle)
    }

    fn live_counts(&mut self) -> LiveCounts {
        LiveCounts {
            models: self.trial.models().len(),
            optimizers: self.trial.optimizers().len(),
            lr_schedulers: self.trial.lr_schedulers().len(),
            has_scaler: self.trial.scaler().is_some(),
        }
    }

    /// Load a stored checkpoint into the live trial. The bundle is checked
    /// as a whole before any state is touched.
    pub fn restore(&mut self, storage_id: &str) -> Result<(), TrialError> {
        let loaded = self.restore_local(storage_id);
        self.dist.all_ok(loaded)?;

        let dist = self.dist.clone();
        let last_validated = dist.chief_computed(|| match self.scheduler.as_ref() {
            Some(s) => Ok(s.last_validation()?.map(|r| r.steps_completed)),
            None => Ok(None),
        })?;
        if last_validated == Some(self.state.batches_trained) {
            tracing::debug!(
                batches_trained = self.state.batches_trained,
                "last known validation matches the restored step"
            );
            self.state.last_validation_step = self.state.batches_trained;
        }
        self.latest_checkpoint = Some(storage_id.to_string());
        Ok(())
    }

    fn restore_local(&mut self, storage_id: &str) -> Result<(), TrialError> {
        let dir = self.storage.restore_path(storage_id)?;
        let Some((path, bundle)) = checkpoint::probe_bundle(&dir)? else {
            tracing::info!(storage_id, "no restorable state found, starting fresh");
            return Ok(());
        };
        let live = self.live_counts();
        bundle.validate(live)?;
        tracing::debug!(path = %path.display(), legacy = bundle.is_legacy(), "loading checkpoint bundle");

        self.callbacks.for_each(|cb| cb.on_checkpoint_load_start(&bundle));

        for (model, state) in self.trial.models().into_iter().zip(bundle.model_states()) {
            let data_parallel = model.is_data_parallel();
            model.load_state_dict(checkpoint::match_model_wrapping(state, data_parallel))?;
        }
        for (optimizer, state) in self
            .trial
            .optimizers()
            .into_iter()
            .zip(bundle.optimizer_states())
        {
            optimizer.load_state_dict(state)?;
        }
        for (scheduler, state) in self
            .trial
            .lr_schedulers()
            .into_iter()
            .zip(bundle.lr_scheduler_states())
        {
            scheduler.load_state_dict(state)?;
        }
        match (self.trial.scaler(), bundle.scaler_state_dict.clone()) {
            (Some(scaler), Some(state)) => scaler.load_state_dict(state)?,
            (Some(_), None) => {
                tracing::warn!("checkpoint has no scaler state; the scaler starts fresh")
            }
            _ => {}
        }
        match bundle.rng_state.clone() {
            Some(rng) => self.ctx.rng_streams_mut().restore(rng)?,
            None => tracing::warn!("checkpoint has no RNG state; random streams keep their seed"),
        }
        self.callbacks.load_state_dicts(&bundle.callbacks)?;

        match checkpoint::read_progress(&dir)? {
            Some(saved) if saved.trial_id == self.state.trial_id => {
                self.state = TrialState {
                    epochs_trained: cadence::epoch_of(saved.batches_trained, self.epoch_len),
                    ..saved
                };
                tracing::info!(
                    batches_trained = self.state.batches_trained,
                    "restored trial progress"
                );
            }
            Some(saved) => {
                tracing::info!(
                    checkpoint_trial = saved.trial_id,
                    trial_id = self.state.trial_id,
                    "checkpoint belongs to another trial; progress counters start at zero"
                );
            }
            None => tracing::warn!("checkpoint has no progress record; counters start at zero"),
        }
        Ok(())
    }
}
