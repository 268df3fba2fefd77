//! Searcher operations and the scheduler connection.
//!
//! The scheduler hands out operations ("train to length N in unit U"). Only
//! the chief talks to it; other workers learn each operation's length through
//! a broadcast and carry a local copy that never reports.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::distributed::DistributedContext;
use crate::error::TrialError;
use crate::training::metrics::{Metrics, TrainingReport};
use crate::training::unit::SearcherUnit;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EarlyExitReason {
    InvalidHp,
    UserRequestedStop,
    Errored,
}

/// An operation as the scheduler describes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationSpec {
    pub id: u64,
    pub length: u64,
}

/// The most recent validation the scheduler knows about for this trial.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ValidationRecord {
    pub steps_completed: u64,
    pub searcher_metric: Option<f64>,
}

/// Connection to the hyperparameter search scheduler.
pub trait SchedulerClient: Send {
    fn configured_unit(&self) -> SearcherUnit;

    /// The next operation, or `None` when the searcher has no more work.
    fn next_operation(&mut self) -> Result<Option<OperationSpec>, TrialError>;

    fn report_progress(&mut self, op_id: u64, progress: u64) -> Result<(), TrialError>;

    fn report_completed(&mut self, op_id: u64, searcher_metric: f64) -> Result<(), TrialError>;

    fn report_early_exit(&mut self, reason: EarlyExitReason) -> Result<(), TrialError>;

    fn report_training_metrics(
        &mut self,
        steps_completed: u64,
        report: &TrainingReport,
    ) -> Result<(), TrialError>;

    fn report_validation_metrics(
        &mut self,
        steps_completed: u64,
        metrics: &Metrics,
    ) -> Result<(), TrialError>;

    /// Best searcher metric reported by any trial of the experiment.
    fn best_validation(&self) -> Result<Option<f64>, TrialError>;

    fn last_validation(&self) -> Result<Option<ValidationRecord>, TrialError>;
}

/// One unit of work from the searcher, as seen by a worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearcherOperation {
    id: u64,
    length: u64,
    completed: bool,
    last_progress: Option<u64>,
}

impl SearcherOperation {
    fn new(spec: OperationSpec) -> Self {
        Self {
            id: spec.id,
            length: spec.length,
            completed: false,
            last_progress: None,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Target length in the searcher's unit.
    pub fn length(&self) -> u64 {
        self.length
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }

    /// Report progress in the searcher's unit. Progress may not go backwards.
    /// Workers without a scheduler connection only track it locally.
    pub fn report_progress(
        &mut self,
        client: Option<&mut Box<dyn SchedulerClient>>,
        progress: u64,
    ) -> Result<(), TrialError> {
        if let Some(last) = self.last_progress {
            if progress < last {
                return Err(TrialError::searcher(format!(
                    "operation {} progress went backwards: {last} -> {progress}",
                    self.id
                )));
            }
        }
        self.last_progress = Some(progress);
        if let Some(client) = client {
            client.report_progress(self.id, progress)?;
        }
        Ok(())
    }

    /// Mark the operation done. Allowed once.
    pub fn report_completed(
        &mut self,
        client: Option<&mut Box<dyn SchedulerClient>>,
        searcher_metric: f64,
    ) -> Result<(), TrialError> {
        if self.completed {
            return Err(TrialError::searcher(format!(
                "operation {} already completed",
                self.id
            )));
        }
        self.completed = true;
        if let Some(client) = client {
            client.report_completed(self.id, searcher_metric)?;
        }
        Ok(())
    }
}

/// Fetch the next operation on the chief and share it with every worker.
pub fn next_operation(
    dist: &DistributedContext,
    client: Option<&mut Box<dyn SchedulerClient>>,
) -> Result<Option<SearcherOperation>, TrialError> {
    let spec = dist.chief_computed(|| {
        client
            .ok_or_else(|| TrialError::searcher("the chief has no scheduler connection"))?
            .next_operation()
    })?;
    Ok(spec.map(SearcherOperation::new))
}

/// Everything a scheduler was told, in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SchedulerEvent {
    Progress { op_id: u64, progress: u64 },
    Completed { op_id: u64, searcher_metric: f64 },
    EarlyExit { reason: EarlyExitReason },
    TrainingMetrics { steps_completed: u64, avg_metrics: Metrics },
    ValidationMetrics { steps_completed: u64, metrics: Metrics },
}

#[derive(Debug, Default)]
struct SchedulerLog {
    pending: Vec<u64>,
    next_id: u64,
    events: Vec<SchedulerEvent>,
    best: Option<f64>,
    last_validation: Option<ValidationRecord>,
}

/// A scheduler that lives in memory: a fixed queue of operation lengths
/// and a log of every report. Clones share state.
#[derive(Debug, Clone)]
pub struct InMemoryScheduler {
    unit: SearcherUnit,
    metric: String,
    smaller_is_better: bool,
    log: Arc<Mutex<SchedulerLog>>,
}

impl InMemoryScheduler {
    pub fn new(
        unit: SearcherUnit,
        lengths: impl IntoIterator<Item = u64>,
        metric: impl Into<String>,
        smaller_is_better: bool,
    ) -> Self {
        Self {
            unit,
            metric: metric.into(),
            smaller_is_better,
            log: Arc::new(Mutex::new(SchedulerLog {
                pending: lengths.into_iter().collect(),
                ..Default::default()
            })),
        }
    }

    /// Seed the record of a validation from an earlier run of the trial.
    pub fn with_last_validation(self, record: ValidationRecord) -> Self {
        if let Ok(mut log) = self.log.lock() {
            log.last_validation = Some(record);
        }
        self
    }

    pub fn with_best_validation(self, best: f64) -> Self {
        if let Ok(mut log) = self.log.lock() {
            log.best = Some(best);
        }
        self
    }

    fn log(&self) -> Result<MutexGuard<'_, SchedulerLog>, TrialError> {
        self.log
            .lock()
            .map_err(|_| TrialError::searcher("scheduler log poisoned"))
    }

    pub fn events(&self) -> Vec<SchedulerEvent> {
        self.log().map(|l| l.events.clone()).unwrap_or_default()
    }

    pub fn completions(&self) -> Vec<(u64, f64)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SchedulerEvent::Completed { op_id, searcher_metric } => {
                    Some((op_id, searcher_metric))
                }
                _ => None,
            })
            .collect()
    }

    fn improves(&self, value: f64, best: Option<f64>) -> bool {
        match best {
            None => true,
            Some(b) if self.smaller_is_better => value < b,
            Some(b) => value > b,
        }
    }
}

impl SchedulerClient for InMemoryScheduler {
    fn configured_unit(&self) -> SearcherUnit {
        self.unit
    }

    fn next_operation(&mut self) -> Result<Option<OperationSpec>, TrialError> {
        let mut log = self.log()?;
        if log.pending.is_empty() {
            return Ok(None);
        }
        let length = log.pending.remove(0);
        let id = log.next_id;
        log.next_id += 1;
        Ok(Some(OperationSpec { id, length }))
    }

    fn report_progress(&mut self, op_id: u64, progress: u64) -> Result<(), TrialError> {
        self.log()?
            .events
            .push(SchedulerEvent::Progress { op_id, progress });
        Ok(())
    }

    fn report_completed(&mut self, op_id: u64, searcher_metric: f64) -> Result<(), TrialError> {
        self.log()?.events.push(SchedulerEvent::Completed {
            op_id,
            searcher_metric,
        });
        Ok(())
    }

    fn report_early_exit(&mut self, reason: EarlyExitReason) -> Result<(), TrialError> {
        self.log()?.events.push(SchedulerEvent::EarlyExit { reason });
        Ok(())
    }

    fn report_training_metrics(
        &mut self,
        steps_completed: u64,
        report: &TrainingReport,
    ) -> Result<(), TrialError> {
        self.log()?.events.push(SchedulerEvent::TrainingMetrics {
            steps_completed,
            avg_metrics: report.avg_metrics.clone(),
        });
        Ok(())
    }

    fn report_validation_metrics(
        &mut self,
        steps_completed: u64,
        metrics: &Metrics,
    ) -> Result<(), TrialError> {
        let searcher_metric = metrics.get(&self.metric).and_then(|v| v.as_scalar());
        let best = self.log()?.best;
        let improved = searcher_metric.is_some_and(|v| self.improves(v, best));
        let mut log = self.log()?;
        if improved {
            log.best = searcher_metric;
        }
        log.last_validation = Some(ValidationRecord {
            steps_completed,
            searcher_metric,
        });
        log.events.push(SchedulerEvent::ValidationMetrics {
            steps_completed,
            metrics: metrics.clone(),
        });
        Ok(())
    }

    fn best_validation(&self) -> Result<Option<f64>, TrialError> {
        Ok(self.log()?.best)
    }

    fn last_validation(&self) -> Result<Option<ValidationRecord>, TrialError> {
        Ok(self.log()?.last_validation)
    }
}
