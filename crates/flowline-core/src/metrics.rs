use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::Result;
use crate::ordered::OrderedMap;
use crate::types::{ExecutorKind, NodeOutput, StepOutput};

/// Counters reported by a single unit. Opaque to the engine apart from
/// being summed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_secs: Option<f64>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub additional: Map<String, Value>,
}

impl Metrics {
    pub fn with_duration(secs: f64) -> Self {
        Self {
            duration_secs: Some(secs),
            ..Default::default()
        }
    }

    pub fn add(&mut self, other: &Metrics) {
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.total_tokens = self.total_tokens.saturating_add(other.total_tokens);
        self.duration_secs = match (self.duration_secs, other.duration_secs) {
            (Some(a), Some(b)) => Some(a + b),
            (a, b) => a.or(b),
        };
        for (k, v) in &other.additional {
            self.additional.insert(k.clone(), v.clone());
        }
    }
}

/// Either a unit's own counters or, for a parallel node, one child per branch.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricsDetail {
    Leaf(Option<Metrics>),
    Parallel(OrderedMap<StepMetrics>),
}

/// Metrics node mirroring one step output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StepMetricsRecord", into = "StepMetricsRecord")]
pub struct StepMetrics {
    pub step_name: String,
    pub executor_kind: ExecutorKind,
    pub executor_name: Option<String>,
    pub detail: MetricsDetail,
}

impl StepMetrics {
    pub fn from_output(output: &StepOutput) -> Self {
        let detail = match (&output.executor_kind, &output.parallel_outputs) {
            (ExecutorKind::Parallel, Some(branches)) => MetricsDetail::Parallel(
                branches
                    .iter()
                    .map(|(name, out)| (name, StepMetrics::from_output(out)))
                    .collect(),
            ),
            (ExecutorKind::Parallel, None) => MetricsDetail::Parallel(OrderedMap::new()),
            _ => MetricsDetail::Leaf(output.metrics.clone()),
        };
        Self {
            step_name: output.step_name.clone(),
            executor_kind: output.executor_kind,
            executor_name: output.executor_name.clone(),
            detail,
        }
    }

    pub fn leaf(&self) -> Option<&Metrics> {
        match &self.detail {
            MetricsDetail::Leaf(m) => m.as_ref(),
            MetricsDetail::Parallel(_) => None,
        }
    }

    pub fn branches(&self) -> Option<&OrderedMap<StepMetrics>> {
        match &self.detail {
            MetricsDetail::Parallel(children) => Some(children),
            MetricsDetail::Leaf(_) => None,
        }
    }

    /// Leaf counters of this node and everything below it.
    pub fn total(&self) -> Metrics {
        let mut sum = Metrics::default();
        match &self.detail {
            MetricsDetail::Leaf(Some(m)) => sum.add(m),
            MetricsDetail::Leaf(None) => {}
            MetricsDetail::Parallel(children) => {
                for child in children.values() {
                    sum.add(&child.total());
                }
            }
        }
        sum
    }
}

/// Wire form. Exactly one of `metrics` / `parallel_steps` is written.
#[derive(Serialize, Deserialize)]
struct StepMetricsRecord {
    step_name: String,
    executor_type: ExecutorKind,
    #[serde(default)]
    executor_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    metrics: Option<Metrics>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    parallel_steps: Option<OrderedMap<StepMetrics>>,
}

impl TryFrom<StepMetricsRecord> for StepMetrics {
    type Error = String;

    fn try_from(record: StepMetricsRecord) -> std::result::Result<Self, Self::Error> {
        let detail = match (record.executor_type, record.metrics, record.parallel_steps) {
            (ExecutorKind::Parallel, None, children) => {
                MetricsDetail::Parallel(children.unwrap_or_default())
            }
            (ExecutorKind::Parallel, Some(_), _) => {
                return Err(format!(
                    "parallel step '{}' cannot carry leaf metrics",
                    record.step_name
                ))
            }
            (_, _, Some(_)) => {
                return Err(format!(
                    "step '{}' is not parallel but has parallel_steps",
                    record.step_name
                ))
            }
            (_, metrics, None) => MetricsDetail::Leaf(metrics),
        };
        Ok(Self {
            step_name: record.step_name,
            executor_kind: record.executor_type,
            executor_name: record.executor_name,
            detail,
        })
    }
}

impl From<StepMetrics> for StepMetricsRecord {
    fn from(m: StepMetrics) -> Self {
        let (metrics, parallel_steps) = match m.detail {
            MetricsDetail::Leaf(metrics) => (metrics, None),
            MetricsDetail::Parallel(children) => (None, Some(children)),
        };
        Self {
            step_name: m.step_name,
            executor_type: m.executor_kind,
            executor_name: m.executor_name,
            metrics,
            parallel_steps,
        }
    }
}

/// Per-run metrics summary keyed by step name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkflowMetrics {
    pub total_steps: usize,
    pub steps: OrderedMap<StepMetrics>,
}

impl WorkflowMetrics {
    /// Count every produced output, nested loop and sequence outputs included.
    pub fn aggregate(results: &[NodeOutput]) -> Self {
        let mut metrics = Self::default();
        for output in results.iter().flat_map(NodeOutput::outputs) {
            metrics.total_steps += 1;
            metrics
                .steps
                .insert(output.step_name.clone(), StepMetrics::from_output(output));
        }
        metrics
    }

    /// JSON value form. `Value` objects sort their keys, so step and branch
    /// order do not survive a trip through here; use
    /// [`to_json`](Self::to_json) when order matters.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// JSON text that keeps steps and branches in execution order.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Sum of all leaf counters.
    pub fn totals(&self) -> Metrics {
        let mut sum = Metrics::default();
        for step in self.steps.values() {
            sum.add(&step.total());
        }
        sum
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn leaf(name: &str, tokens: u64) -> StepOutput {
        StepOutput::new(name, ExecutorKind::Agent)
            .with_executor_name(name)
            .with_metrics(Metrics {
                input_tokens: tokens,
                output_tokens: tokens,
                total_tokens: tokens * 2,
                ..Default::default()
            })
    }

    fn parallel_output() -> StepOutput {
        let mut branches = OrderedMap::new();
        branches.insert("left", leaf("left", 3));
        branches.insert("right", leaf("right", 5));
        StepOutput::new("fan", ExecutorKind::Parallel).with_parallel_outputs(branches)
    }

    #[test]
    fn test_metrics_add() {
        let mut a = Metrics::with_duration(1.5);
        a.input_tokens = 10;
        let mut b = Metrics::with_duration(0.5);
        b.input_tokens = u64::MAX;
        b.additional.insert("cache_hits".into(), json!(2));
        a.add(&b);
        assert_eq!(a.input_tokens, u64::MAX);
        assert_eq!(a.duration_secs, Some(2.0));
        assert_eq!(a.additional["cache_hits"], json!(2));
    }

    #[test]
    fn test_aggregate_counts_nested_outputs() {
        let results = vec![
            NodeOutput::Single(leaf("research", 1)),
            NodeOutput::Iterations(vec![vec![leaf("refine", 1)], vec![leaf("refine", 2)]]),
            NodeOutput::Single(parallel_output()),
        ];
        let metrics = WorkflowMetrics::aggregate(&results);
        assert_eq!(metrics.total_steps, 4);
        assert_eq!(metrics.steps.len(), 3);
        assert_eq!(metrics.steps.get("refine").unwrap().leaf().unwrap().input_tokens, 2);

        let fan = metrics.steps.get("fan").unwrap();
        assert!(fan.leaf().is_none());
        assert_eq!(fan.branches().unwrap().len(), 2);
        assert_eq!(fan.total().input_tokens, 8);
        assert_eq!(metrics.totals().input_tokens, 10);
    }

    #[test]
    fn test_round_trip_with_parallel_nodes() {
        let results = vec![
            NodeOutput::Single(leaf("a", 1)),
            NodeOutput::Single(StepOutput::new("plain", ExecutorKind::Function)),
            NodeOutput::Single(parallel_output()),
        ];
        let metrics = WorkflowMetrics::aggregate(&results);
        let value = metrics.to_value().unwrap();
        let restored = WorkflowMetrics::from_value(value).unwrap();
        assert_eq!(restored, metrics);
    }

    #[test]
    fn test_json_text_keeps_order() {
        let mut branches = OrderedMap::new();
        branches.insert("zeta", leaf("zeta", 1));
        branches.insert("alpha", leaf("alpha", 2));
        let fan = StepOutput::new("fan", ExecutorKind::Parallel).with_parallel_outputs(branches);
        let results = vec![
            NodeOutput::Single(leaf("write", 1)),
            NodeOutput::Single(fan),
            NodeOutput::Single(leaf("edit", 1)),
        ];
        let metrics = WorkflowMetrics::aggregate(&results);

        let restored = WorkflowMetrics::from_json(&metrics.to_json().unwrap()).unwrap();
        assert_eq!(restored.steps.keys().collect::<Vec<_>>(), vec!["write", "fan", "edit"]);
        let fan = restored.steps.get("fan").unwrap().branches().unwrap();
        assert_eq!(fan.keys().collect::<Vec<_>>(), vec!["zeta", "alpha"]);
    }

    #[test]
    fn test_wire_shape() {
        let value = serde_json::to_value(StepMetrics::from_output(&parallel_output())).unwrap();
        assert_eq!(value["executor_type"], json!("parallel"));
        assert!(value.get("metrics").is_none());
        assert!(value["parallel_steps"]["left"]["metrics"].is_object());

        let plain = serde_json::to_value(StepMetrics::from_output(&leaf("solo", 1))).unwrap();
        assert!(plain.get("parallel_steps").is_none());
        assert_eq!(plain["metrics"]["total_tokens"], json!(2));
    }

    #[test]
    fn test_decode_rejects_mixed_detail() {
        let bad = json!({
            "step_name": "fan",
            "executor_type": "parallel",
            "metrics": {"input_tokens": 1}
        });
        assert!(serde_json::from_value::<StepMetrics>(bad).is_err());

        let bad = json!({
            "step_name": "solo",
            "executor_type": "function",
            "parallel_steps": {}
        });
        assert!(serde_json::from_value::<StepMetrics>(bad).is_err());
    }
}
