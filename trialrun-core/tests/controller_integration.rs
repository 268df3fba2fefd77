//! End-to-end runs of the trial controller on a single worker.

mod common;

use common::{LinearTrial, PreemptAt, RecordingCallback, config, local_config, make_batches};
use pretty_assertions::assert_eq;
use trialrun_core::searcher::EarlyExitReason;
use trialrun_core::training::AnomalyDetectionCallback;
use trialrun_core::training::unit::{LengthSpec, SearcherUnit};
use trialrun_core::{
    CheckpointPolicy, DistributedContext, InMemoryScheduler, LaunchInfo, LoopOutcome,
    PreemptionService, RunExit, SchedulerEvent, SharedFsStorage, TrialConfig, TrialController,
    TrialError, TrialServices,
};

fn services(storage: &SharedFsStorage) -> TrialServices {
    TrialServices::local(Box::new(storage.clone()))
}

fn controller(
    trial: LinearTrial,
    config: TrialConfig,
    launch: LaunchInfo,
    services: TrialServices,
) -> TrialController<LinearTrial> {
    TrialController::new(trial, config, launch, services, DistributedContext::single()).unwrap()
}

fn stored_steps(storage: &SharedFsStorage) -> Vec<u64> {
    storage
        .list()
        .unwrap()
        .into_iter()
        .map(|e| e.steps_completed)
        .collect()
}

fn preempt(at: u64, checkpoint: bool) -> Box<dyn PreemptionService> {
    Box::new(PreemptAt::new(at, checkpoint))
}

#[test]
fn test_checkpoints_follow_batch_cadence() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let config = TrialConfig {
        min_checkpoint_period: LengthSpec::batches(5),
        checkpoint_policy: CheckpointPolicy::None,
        ..local_config(dir.path(), 12)
    };
    // Stop right after batch 12 so the end-of-operation checkpoint never runs.
    let mut c = controller(
        LinearTrial::new(1),
        config,
        LaunchInfo::default(),
        services(&storage).with_preemption(preempt(12, false)),
    );
    let summary = c.run().unwrap();

    assert_eq!(summary.exit, RunExit::Preempted);
    assert_eq!(summary.batches_trained, 12);
    assert_eq!(stored_steps(&storage), vec![5, 10]);
}

#[test]
fn test_operation_end_validates_and_checkpoints_once() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let config = TrialConfig {
        min_checkpoint_period: LengthSpec::batches(5),
        ..local_config(dir.path(), 12)
    };
    let mut c = controller(LinearTrial::new(1), config, LaunchInfo::default(), services(&storage));
    let summary = c.run().unwrap();

    assert_eq!(summary.exit, RunExit::Completed);
    assert_eq!(summary.operations_completed, 1);
    assert_eq!(stored_steps(&storage), vec![5, 10, 12]);
    assert!(summary.last_validation.unwrap().contains_key("validation_loss"));

    // Both actions are idempotent at the same step.
    assert_eq!(c.checkpoint().unwrap(), LoopOutcome::Continue);
    assert_eq!(c.validate().unwrap(), None);
    assert_eq!(storage.list().unwrap().len(), 3);
}

#[test]
fn test_preemption_mid_operation_reports_no_completion() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let scheduler = InMemoryScheduler::new(SearcherUnit::Batches, [10], "validation_loss", true);
    let mut c = controller(
        LinearTrial::new(1),
        config(dir.path()),
        LaunchInfo::default(),
        services(&storage)
            .with_scheduler(Box::new(scheduler.clone()))
            .with_preemption(preempt(3, false)),
    );
    let summary = c.run().unwrap();

    assert_eq!(summary.exit, RunExit::Preempted);
    assert_eq!(summary.batches_trained, 3);
    assert!(scheduler.completions().is_empty());
    assert!(storage.list().unwrap().is_empty());
    let progress: Vec<u64> = scheduler
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::Progress { progress, .. } => Some(progress),
            _ => None,
        })
        .collect();
    assert_eq!(progress, vec![1, 2, 3]);
}

#[test]
fn test_preemption_can_request_exit_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let scheduler = InMemoryScheduler::new(SearcherUnit::Batches, [10], "validation_loss", true);
    let mut c = controller(
        LinearTrial::new(1),
        config(dir.path()),
        LaunchInfo::default(),
        services(&storage)
            .with_scheduler(Box::new(scheduler.clone()))
            .with_preemption(preempt(3, true)),
    );
    let summary = c.run().unwrap();

    assert_eq!(summary.exit, RunExit::Preempted);
    assert_eq!(stored_steps(&storage), vec![3]);
    assert!(summary.latest_checkpoint.is_some());
    assert!(scheduler.completions().is_empty());
}

#[test]
fn test_validation_key_mismatch_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let scheduler = InMemoryScheduler::new(SearcherUnit::Batches, [4], "validation_loss", true);
    let mut trial = LinearTrial::new(1);
    trial.mismatch_at = Some(1);
    let config = TrialConfig {
        min_validation_period: LengthSpec::batches(2),
        ..config(dir.path())
    };
    let mut c = controller(
        trial,
        config,
        LaunchInfo::default(),
        services(&storage).with_scheduler(Box::new(scheduler.clone())),
    );

    let err = c.run().unwrap_err();
    assert!(matches!(err, TrialError::MetricKeyMismatch { batch_idx: 1, .. }));
    assert!(
        !scheduler
            .events()
            .iter()
            .any(|e| matches!(e, SchedulerEvent::ValidationMetrics { .. }))
    );
    assert!(scheduler.completions().is_empty());
}

#[test]
fn test_searcher_operations_complete_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let scheduler = InMemoryScheduler::new(SearcherUnit::Batches, [4, 8], "validation_loss", true);
    let mut c = controller(
        LinearTrial::new(1),
        config(dir.path()),
        LaunchInfo::default(),
        services(&storage).with_scheduler(Box::new(scheduler.clone())),
    );
    let summary = c.run().unwrap();

    assert_eq!(summary.exit, RunExit::Completed);
    assert_eq!(summary.operations_completed, 2);
    assert_eq!(summary.batches_trained, 8);
    let completed: Vec<u64> = scheduler.completions().into_iter().map(|(id, _)| id).collect();
    assert_eq!(completed, vec![0, 1]);
    assert_eq!(stored_steps(&storage), vec![4, 8]);

    let validated: Vec<u64> = scheduler
        .events()
        .into_iter()
        .filter_map(|e| match e {
            SchedulerEvent::ValidationMetrics { steps_completed, .. } => Some(steps_completed),
            _ => None,
        })
        .collect();
    assert_eq!(validated, vec![4, 8]);
}

#[test]
fn test_invalid_hyperparameters_exit_skips_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let scheduler = InMemoryScheduler::new(SearcherUnit::Batches, [4], "validation_loss", true);
    let mut trial = LinearTrial::new(1);
    trial.optimizer.momentum = 1.5;
    let mut c = controller(
        trial,
        config(dir.path()),
        LaunchInfo::default(),
        services(&storage).with_scheduler(Box::new(scheduler.clone())),
    );
    let summary = c.run().unwrap();

    assert_eq!(summary.exit, RunExit::InvalidHyperparameters);
    assert!(storage.list().unwrap().is_empty());
    assert!(scheduler.events().contains(&SchedulerEvent::EarlyExit {
        reason: EarlyExitReason::InvalidHp
    }));
}

#[test]
fn test_callback_hooks_fire_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let recorder = RecordingCallback::default();
    let mut trial = LinearTrial::new(1).with_callback("recorder", Box::new(recorder.clone()));
    trial.train = make_batches(4, 4, 1);
    let mut c = controller(trial, local_config(dir.path(), 8), LaunchInfo::default(), services(&storage));
    c.run().unwrap();

    assert_eq!(
        recorder.events(),
        vec![
            "startup:0",
            "epoch_start:0",
            "epoch_end:0",
            "epoch_start:1",
            "epoch_end:1",
            "validation_end",
            "checkpoint",
            "shutdown",
        ]
    );
}

#[test]
fn test_callback_stop_exits_with_checkpoint() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let recorder = RecordingCallback {
        stop_after_validations: Some(1),
        ..Default::default()
    };
    let config = TrialConfig {
        min_validation_period: LengthSpec::batches(2),
        ..local_config(dir.path(), 8)
    };
    let trial = LinearTrial::new(1).with_callback("recorder", Box::new(recorder));
    let mut c = controller(trial, config, LaunchInfo::default(), services(&storage));
    let summary = c.run().unwrap();

    assert_eq!(summary.exit, RunExit::Preempted);
    assert_eq!(summary.batches_trained, 2);
    assert_eq!(stored_steps(&storage), vec![2]);
}

/// Validate every 2 batches of a 6-batch operation under the best policy.
fn run_best_policy(scheduler: InMemoryScheduler, smaller_is_better: bool) -> Vec<u64> {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let mut config = TrialConfig {
        min_validation_period: LengthSpec::batches(2),
        checkpoint_policy: CheckpointPolicy::Best,
        ..config(dir.path())
    };
    config.searcher.smaller_is_better = smaller_is_better;
    let mut c = controller(
        LinearTrial::new(1),
        config,
        LaunchInfo::default(),
        services(&storage).with_scheduler(Box::new(scheduler)),
    );
    let summary = c.run().unwrap();
    assert_eq!(summary.exit, RunExit::Completed);
    stored_steps(&storage)
}

#[test]
fn test_best_policy_checkpoints_every_improvement() {
    let scheduler = InMemoryScheduler::new(SearcherUnit::Batches, [6], "validation_loss", true);
    // The last improvement already checkpointed step 6; the operation end
    // must not store it twice.
    assert_eq!(run_best_policy(scheduler, true), vec![2, 4, 6]);
}

#[test]
fn test_best_policy_skips_validations_that_do_not_improve() {
    // No squared error can beat a negative best.
    let scheduler = InMemoryScheduler::new(SearcherUnit::Batches, [6], "validation_loss", true)
        .with_best_validation(-1.0);
    assert_eq!(run_best_policy(scheduler, true), vec![6]);
}

#[test]
fn test_best_policy_follows_larger_is_better() {
    // The loss falls as training goes on, so only the first validation beats
    // the best when larger is better; step 6 comes from the operation end.
    let scheduler = InMemoryScheduler::new(SearcherUnit::Batches, [6], "validation_loss", false)
        .with_best_validation(-1.0);
    assert_eq!(run_best_policy(scheduler, false), vec![2, 6]);

    let scheduler = InMemoryScheduler::new(SearcherUnit::Batches, [6], "validation_loss", false)
        .with_best_validation(1.0e9);
    assert_eq!(run_best_policy(scheduler, false), vec![6]);
}

#[test]
fn test_non_finite_loss_stops_through_anomaly_callback() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let mut trial = LinearTrial::new(1)
        .with_callback("anomaly", Box::new(AnomalyDetectionCallback::new("loss", 10.0, 5)));
    trial.train = vec![vec![(1.0, f64::NAN)]; 8];
    let mut c = controller(trial, local_config(dir.path(), 8), LaunchInfo::default(), services(&storage));
    let summary = c.run().unwrap();

    assert_eq!(summary.exit, RunExit::Preempted);
    assert_eq!(summary.batches_trained, 1);
    assert_eq!(stored_steps(&storage), vec![1]);
}

#[test]
fn test_trial_without_models_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let result = TrialController::new(
        LinearTrial::new(0),
        local_config(dir.path(), 4),
        LaunchInfo::default(),
        services(&storage),
        DistributedContext::single(),
    );
    assert!(matches!(result, Err(TrialError::InvalidExperiment(_))));
}

#[test]
fn test_local_mode_requires_max_length() {
    let dir = tempfile::tempdir().unwrap();
    let storage = SharedFsStorage::new(dir.path());
    let result = TrialController::new(
        LinearTrial::new(1),
        config(dir.path()),
        LaunchInfo::default(),
        services(&storage),
        DistributedContext::single(),
    );
    assert!(matches!(result, Err(TrialError::InvalidExperiment(_))));
}
