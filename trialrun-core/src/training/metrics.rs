//! Metric values, per-metric reducers and the training report shape.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Value, json};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::TrialError;

/// A single metric: a scalar or a vector of numbers.
///
/// Serialized as JSON numbers, except that NaN and the infinities become the
/// strings `"NaN"`, `"inf"` and `"-inf"` so they survive checkpoints and the
/// worker transport.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Scalar(f64),
    Vector(Vec<f64>),
}

fn encode_number(x: f64) -> Value {
    if x.is_nan() {
        json!("NaN")
    } else if x == f64::INFINITY {
        json!("inf")
    } else if x == f64::NEG_INFINITY {
        json!("-inf")
    } else {
        json!(x)
    }
}

/// Read one metric number. `null` is what `serde_json` makes of a
/// non-finite float, so it reads back as NaN.
pub fn decode_number(v: &Value) -> Option<f64> {
    match v {
        Value::Number(n) => n.as_f64(),
        Value::Null => Some(f64::NAN),
        Value::String(s) => match s.as_str() {
            "NaN" | "nan" => Some(f64::NAN),
            "inf" | "+inf" | "Infinity" => Some(f64::INFINITY),
            "-inf" | "-Infinity" => Some(f64::NEG_INFINITY),
            _ => None,
        },
        _ => None,
    }
}

impl Serialize for MetricValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Scalar(x) => encode_number(*x).serialize(serializer),
            Self::Vector(xs) => xs
                .iter()
                .map(|x| encode_number(*x))
                .collect::<Vec<_>>()
                .serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for MetricValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        match &value {
            Value::Array(items) => items
                .iter()
                .map(decode_number)
                .collect::<Option<Vec<_>>>()
                .map(Self::Vector)
                .ok_or_else(|| de::Error::custom(format!("metric vector must hold numbers, got {value}"))),
            other => decode_number(other)
                .map(Self::Scalar)
                .ok_or_else(|| de::Error::custom(format!("metric must be a number, got {other}"))),
        }
    }
}

impl MetricValue {
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Vector(_) => None,
        }
    }
}

impl From<f64> for MetricValue {
    fn from(v: f64) -> Self {
        Self::Scalar(v)
    }
}

impl From<Vec<f64>> for MetricValue {
    fn from(v: Vec<f64>) -> Self {
        Self::Vector(v)
    }
}

/// Metric name to value. Ordered so reports serialize deterministically.
pub type Metrics = BTreeMap<String, MetricValue>;

/// The key set of a metrics mapping, for mismatch reports.
pub fn key_set(metrics: &Metrics) -> BTreeSet<String> {
    metrics.keys().cloned().collect()
}

/// Normalize what user code returned into [`Metrics`].
///
/// A bare number is accepted as `{"loss": n}` when `bare_loss` is set, which
/// is how training steps usually report. Anything that is not a mapping of
/// numbers or numeric arrays is a configuration error; `null` reads as NaN.
pub fn metrics_from_value(value: Value, context: &str, bare_loss: bool) -> Result<Metrics, TrialError> {
    let map = match value {
        Value::Object(map) => map,
        other => {
            return match decode_number(&other) {
                Some(loss) if bare_loss => Ok([("loss".to_string(), MetricValue::Scalar(loss))].into()),
                _ => Err(TrialError::MetricsType {
                    context: context.to_string(),
                    found: json_kind(&other).to_string(),
                }),
            };
        }
    };

    let mut metrics = Metrics::new();
    for (name, v) in map {
        let mv = match &v {
            Value::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    match decode_number(item) {
                        Some(x) => out.push(x),
                        None => {
                            return Err(TrialError::MetricsType {
                                context: format!("{context} (metric '{name}')"),
                                found: format!("array containing {}", json_kind(item)),
                            });
                        }
                    }
                }
                MetricValue::Vector(out)
            }
            other => match decode_number(other) {
                Some(x) => MetricValue::Scalar(x),
                None => {
                    return Err(TrialError::MetricsType {
                        context: format!("{context} (metric '{name}')"),
                        found: json_kind(other).to_string(),
                    });
                }
            },
        };
        metrics.insert(name, mv);
    }
    Ok(metrics)
}

fn json_kind(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// How a metric is combined across batches and workers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reducer {
    #[default]
    Avg,
    Sum,
    Min,
    Max,
}

/// Reducer configuration supplied by a trial for its evaluation metrics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EvaluationReducer {
    All(Reducer),
    PerMetric(BTreeMap<String, Reducer>),
}

impl Default for EvaluationReducer {
    fn default() -> Self {
        Self::All(Reducer::Avg)
    }
}

impl EvaluationReducer {
    /// Resolve to one reducer per metric key.
    ///
    /// A per-metric map must name exactly the metrics the trial returns.
    pub fn resolve(&self, keys: &BTreeSet<String>) -> Result<BTreeMap<String, Reducer>, TrialError> {
        match self {
            Self::All(r) => Ok(keys.iter().map(|k| (k.clone(), *r)).collect()),
            Self::PerMetric(map) => {
                let configured: BTreeSet<String> = map.keys().cloned().collect();
                if &configured != keys {
                    return Err(TrialError::config(format!(
                        "evaluation reducer keys {configured:?} do not match validation metric keys {keys:?}"
                    )));
                }
                Ok(map.clone())
            }
        }
    }
}

/// Sum in a canonical order so the result does not depend on input order.
fn ordered_sum(values: &mut [f64]) -> f64 {
    values.sort_by(f64::total_cmp);
    values.iter().sum()
}

fn reduce_scalars(reducer: Reducer, mut values: Vec<f64>) -> f64 {
    if values.is_empty() {
        return f64::NAN;
    }
    match reducer {
        Reducer::Avg => {
            let n = values.len() as f64;
            ordered_sum(&mut values) / n
        }
        Reducer::Sum => ordered_sum(&mut values),
        Reducer::Min => values.into_iter().fold(f64::INFINITY, f64::min),
        Reducer::Max => values.into_iter().fold(f64::NEG_INFINITY, f64::max),
    }
}

/// Combine values of one metric. Vectors are reduced element-wise and must
/// all have the same length.
pub fn reduce_values(name: &str, reducer: Reducer, values: &[MetricValue]) -> Result<MetricValue, TrialError> {
    let Some(first) = values.first() else {
        return Ok(MetricValue::Scalar(f64::NAN));
    };
    match first {
        MetricValue::Scalar(_) => {
            let mut scalars = Vec::with_capacity(values.len());
            for v in values {
                match v {
                    MetricValue::Scalar(x) => scalars.push(*x),
                    MetricValue::Vector(_) => {
                        return Err(TrialError::state_mismatch(
                            format!("metric '{name}'"),
                            "scalar values",
                            "a vector",
                        ));
                    }
                }
            }
            Ok(MetricValue::Scalar(reduce_scalars(reducer, scalars)))
        }
        MetricValue::Vector(head) => {
            let width = head.len();
            let mut columns = vec![Vec::with_capacity(values.len()); width];
            for v in values {
                match v {
                    MetricValue::Vector(xs) if xs.len() == width => {
                        for (col, x) in columns.iter_mut().zip(xs) {
                            col.push(*x);
                        }
                    }
                    MetricValue::Vector(xs) => {
                        return Err(TrialError::state_mismatch(
                            format!("metric '{name}'"),
                            format!("vectors of length {width}"),
                            format!("length {}", xs.len()),
                        ));
                    }
                    MetricValue::Scalar(_) => {
                        return Err(TrialError::state_mismatch(
                            format!("metric '{name}'"),
                            "vector values",
                            "a scalar",
                        ));
                    }
                }
            }
            Ok(MetricValue::Vector(
                columns.into_iter().map(|c| reduce_scalars(reducer, c)).collect(),
            ))
        }
    }
}

/// Reduce a list of metric mappings key by key.
pub fn reduce_batches(
    batches: &[Metrics],
    reducers: &BTreeMap<String, Reducer>,
) -> Result<Metrics, TrialError> {
    let mut out = Metrics::new();
    for (name, reducer) in reducers {
        let values: Vec<MetricValue> = batches.iter().filter_map(|m| m.get(name).cloned()).collect();
        out.insert(name.clone(), reduce_values(name, *reducer, &values)?);
    }
    Ok(out)
}

/// What one training report carries: per-key averages plus the raw batches.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingReport {
    pub avg_metrics: Metrics,
    pub batch_metrics: Vec<Metrics>,
}

impl TrainingReport {
    /// Average every key over the batches that reported it.
    pub fn from_batches(batch_metrics: Vec<Metrics>) -> Result<Self, TrialError> {
        let keys: BTreeSet<String> = batch_metrics.iter().flat_map(|m| m.keys().cloned()).collect();
        let reducers: BTreeMap<String, Reducer> = keys.into_iter().map(|k| (k, Reducer::Avg)).collect();
        let avg_metrics = reduce_batches(&batch_metrics, &reducers)?;
        Ok(Self {
            avg_metrics,
            batch_metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn scalar_metrics(pairs: &[(&str, f64)]) -> Metrics {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), MetricValue::Scalar(*v)))
            .collect()
    }

    #[test]
    fn test_bare_number_becomes_loss() {
        let m = metrics_from_value(json!(0.25), "train_batch", true).unwrap();
        assert_eq!(m.get("loss"), Some(&MetricValue::Scalar(0.25)));
    }

    #[test]
    fn test_bare_number_rejected_for_evaluation() {
        let err = metrics_from_value(json!(0.25), "evaluate_batch", false).unwrap_err();
        assert!(matches!(err, TrialError::MetricsType { .. }));
    }

    #[test]
    fn test_non_numeric_metric_rejected() {
        let err = metrics_from_value(json!({"acc": "high"}), "evaluate_batch", false).unwrap_err();
        assert!(err.to_string().contains("metric 'acc'"));
    }

    #[test]
    fn test_non_finite_metrics_read_as_numbers() {
        let m = metrics_from_value(json!({"loss": f64::NAN, "norm": "inf"}), "train_batch", true).unwrap();
        assert!(m["loss"].as_scalar().unwrap().is_nan());
        assert_eq!(m["norm"], MetricValue::Scalar(f64::INFINITY));

        let bare = metrics_from_value(json!(f64::INFINITY), "train_batch", true).unwrap();
        assert!(bare["loss"].as_scalar().unwrap().is_nan());
    }

    #[test]
    fn test_non_finite_values_survive_json() {
        let m: Metrics = [
            ("loss".to_string(), MetricValue::Scalar(f64::NEG_INFINITY)),
            ("per_class".to_string(), MetricValue::Vector(vec![1.5, f64::INFINITY])),
            ("nan".to_string(), MetricValue::Scalar(f64::NAN)),
        ]
        .into();
        let text = serde_json::to_string(&m).unwrap();
        assert!(text.contains("\"-inf\""));
        let back: Metrics = serde_json::from_str(&text).unwrap();
        assert_eq!(back["loss"], m["loss"]);
        assert_eq!(back["per_class"], m["per_class"]);
        assert!(back["nan"].as_scalar().unwrap().is_nan());
    }

    #[test]
    fn test_vector_metric_parsed() {
        let m = metrics_from_value(json!({"per_class": [0.5, 1.0]}), "evaluate_batch", false).unwrap();
        assert_eq!(m["per_class"], MetricValue::Vector(vec![0.5, 1.0]));
    }

    #[test]
    fn test_reducers() {
        let vals: Vec<MetricValue> = [1.0, 4.0, 2.0].into_iter().map(MetricValue::Scalar).collect();
        assert_eq!(reduce_values("x", Reducer::Avg, &vals).unwrap(), MetricValue::Scalar(7.0 / 3.0));
        assert_eq!(reduce_values("x", Reducer::Sum, &vals).unwrap(), MetricValue::Scalar(7.0));
        assert_eq!(reduce_values("x", Reducer::Min, &vals).unwrap(), MetricValue::Scalar(1.0));
        assert_eq!(reduce_values("x", Reducer::Max, &vals).unwrap(), MetricValue::Scalar(4.0));
    }

    #[test]
    fn test_vector_reduce_elementwise() {
        let vals = vec![
            MetricValue::Vector(vec![1.0, 10.0]),
            MetricValue::Vector(vec![3.0, 20.0]),
        ];
        assert_eq!(
            reduce_values("v", Reducer::Avg, &vals).unwrap(),
            MetricValue::Vector(vec![2.0, 15.0])
        );
        let ragged = vec![MetricValue::Vector(vec![1.0]), MetricValue::Vector(vec![1.0, 2.0])];
        assert!(reduce_values("v", Reducer::Sum, &ragged).is_err());
    }

    #[test]
    fn test_per_metric_reducer_must_cover_keys() {
        let keys: BTreeSet<String> = ["acc".to_string(), "loss".to_string()].into();
        let partial = EvaluationReducer::PerMetric([("acc".to_string(), Reducer::Max)].into());
        assert!(partial.resolve(&keys).is_err());
        let all = EvaluationReducer::All(Reducer::Sum).resolve(&keys).unwrap();
        assert_eq!(all["loss"], Reducer::Sum);
    }

    #[test]
    fn test_training_report_averages() {
        let report = TrainingReport::from_batches(vec![
            scalar_metrics(&[("loss", 1.0)]),
            scalar_metrics(&[("loss", 3.0), ("grad_norm", 2.0)]),
        ])
        .unwrap();
        assert_eq!(report.avg_metrics["loss"], MetricValue::Scalar(2.0));
        assert_eq!(report.avg_metrics["grad_norm"], MetricValue::Scalar(2.0));
        assert_eq!(report.batch_metrics.len(), 2);
    }
}
