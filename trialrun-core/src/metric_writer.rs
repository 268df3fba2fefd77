//! Sinks for reported metrics, separate from the scheduler.

use crate::training::metrics::{MetricValue, Metrics, TrainingReport};

pub trait MetricWriter: Send {
    fn on_train_step_end(&mut self, steps_completed: u64, report: &TrainingReport);
    fn on_validation_step_end(&mut self, steps_completed: u64, metrics: &Metrics);
}

/// Writes metrics as structured log events.
#[derive(Debug, Default, Clone)]
pub struct TracingMetricWriter;

fn render(metrics: &Metrics) -> String {
    metrics
        .iter()
        .map(|(k, v)| match v {
            MetricValue::Scalar(x) => format!("{k}={x:.6}"),
            MetricValue::Vector(xs) => format!("{k}=[{} values]", xs.len()),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

impl MetricWriter for TracingMetricWriter {
    fn on_train_step_end(&mut self, steps_completed: u64, report: &TrainingReport) {
        tracing::info!(
            target: "trialrun::metrics",
            steps_completed,
            batches = report.batch_metrics.len(),
            metrics = %render(&report.avg_metrics),
            "training metrics"
        );
    }

    fn on_validation_step_end(&mut self, steps_completed: u64, metrics: &Metrics) {
        tracing::info!(
            target: "trialrun::metrics",
            steps_completed,
            metrics = %render(metrics),
            "validation metrics"
        );
    }
}
