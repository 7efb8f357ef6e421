use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::event::WorkflowEvent;
use crate::metrics::Metrics;
use crate::ordered::OrderedMap;

/// Unique session identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_str(s: &str) -> Self {
        Self(s.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Fresh run identifier.
pub fn new_run_id() -> String {
    Uuid::new_v4().to_string()
}

/// A record decoded against a named input schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    pub type_name: String,
    pub value: Map<String, Value>,
}

/// Payload flowing between steps.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Record(Map<String, Value>),
    List(Vec<Value>),
    Typed(TypedValue),
    Scalar(Value),
}

impl Content {
    pub fn text(s: impl Into<String>) -> Self {
        Content::Text(s.into())
    }

    /// Classify an arbitrary JSON value.
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::String(s) => Content::Text(s),
            Value::Object(map) => Content::Record(map),
            Value::Array(items) => Content::List(items),
            other => Content::Scalar(other),
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            Content::Text(s) => Value::String(s.clone()),
            Content::Record(map) => Value::Object(map.clone()),
            Content::List(items) => Value::Array(items.clone()),
            Content::Typed(t) => Value::Object(t.value.clone()),
            Content::Scalar(v) => v.clone(),
        }
    }

    /// Text verbatim, scalars compact, structures as pretty JSON.
    pub fn render(&self) -> String {
        match self {
            Content::Text(s) => s.clone(),
            Content::Scalar(v) => v.to_string(),
            other => serde_json::to_string_pretty(&other.to_value()).unwrap_or_default(),
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Content::Scalar(v) => v.as_i64(),
            Content::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Content::Scalar(v) => v.as_f64(),
            Content::Text(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Field lookup on record-like content.
    pub fn field(&self, key: &str) -> Option<&Value> {
        match self {
            Content::Record(map) => map.get(key),
            Content::Typed(t) => t.value.get(key),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Content::Text(_) => "text",
            Content::Record(_) => "record",
            Content::List(_) => "list",
            Content::Typed(_) => "typed",
            Content::Scalar(_) => "scalar",
        }
    }
}

impl std::fmt::Display for Content {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<&str> for Content {
    fn from(s: &str) -> Self {
        Content::Text(s.to_string())
    }
}

impl From<String> for Content {
    fn from(s: String) -> Self {
        Content::Text(s)
    }
}

impl From<i64> for Content {
    fn from(n: i64) -> Self {
        Content::Scalar(Value::from(n))
    }
}

impl From<f64> for Content {
    fn from(n: f64) -> Self {
        Content::Scalar(Value::from(n))
    }
}

impl From<bool> for Content {
    fn from(b: bool) -> Self {
        Content::Scalar(Value::Bool(b))
    }
}

impl From<Value> for Content {
    fn from(v: Value) -> Self {
        Content::from_value(v)
    }
}

/// A reference to an image, video, or audio artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaArtifact {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// Inline payload, base64 encoded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl MediaArtifact {
    pub fn from_url(url: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            url: Some(url.into()),
            mime_type: None,
            data: None,
        }
    }

    pub fn with_mime_type(mut self, mime: impl Into<String>) -> Self {
        self.mime_type = Some(mime.into());
        self
    }
}

/// Images, videos and audio accumulated over a run. Append-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaSet {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<MediaArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub videos: Vec<MediaArtifact>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub audio: Vec<MediaArtifact>,
}

impl MediaSet {
    pub fn is_empty(&self) -> bool {
        self.images.is_empty() && self.videos.is_empty() && self.audio.is_empty()
    }

    pub fn len(&self) -> usize {
        self.images.len() + self.videos.len() + self.audio.len()
    }

    pub fn extend(&mut self, other: &MediaSet) {
        self.images.extend(other.images.iter().cloned());
        self.videos.extend(other.videos.iter().cloned());
        self.audio.extend(other.audio.iter().cloned());
    }
}

/// What produced a step output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorKind {
    Function,
    Agent,
    Team,
    Steps,
    Loop,
    Parallel,
    Condition,
    Router,
    Custom,
}

impl ExecutorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutorKind::Function => "function",
            ExecutorKind::Agent => "agent",
            ExecutorKind::Team => "team",
            ExecutorKind::Steps => "steps",
            ExecutorKind::Loop => "loop",
            ExecutorKind::Parallel => "parallel",
            ExecutorKind::Condition => "condition",
            ExecutorKind::Router => "router",
            ExecutorKind::Custom => "custom",
        }
    }
}

impl std::fmt::Display for ExecutorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The caller's input to a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionInput {
    #[serde(default)]
    pub input: Option<Content>,
    #[serde(default)]
    pub additional_data: Option<Map<String, Value>>,
    #[serde(default)]
    pub media: MediaSet,
}

/// The envelope a step receives.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepInput {
    pub input: Option<Content>,
    pub previous_step_content: Option<Content>,
    #[serde(default)]
    pub previous_step_outputs: OrderedMap<StepOutput>,
    #[serde(default)]
    pub additional_data: Option<Map<String, Value>>,
    #[serde(default)]
    pub media: MediaSet,
}

impl StepInput {
    pub fn new(input: impl Into<Content>) -> Self {
        Self {
            input: Some(input.into()),
            ..Default::default()
        }
    }

    pub fn from_execution_input(exec: &ExecutionInput) -> Self {
        Self {
            input: exec.input.clone(),
            previous_step_content: None,
            previous_step_outputs: OrderedMap::new(),
            additional_data: exec.additional_data.clone(),
            media: exec.media.clone(),
        }
    }

    /// Record a produced output so later steps can see it.
    pub fn absorb(&mut self, output: &StepOutput) {
        self.previous_step_content = output.content.clone();
        self.media.extend(&output.media);
        self.previous_step_outputs
            .insert(output.step_name.clone(), output.clone());
    }

    pub fn step_output(&self, name: &str) -> Option<&StepOutput> {
        self.previous_step_outputs.get(name)
    }

    /// Content of a named earlier step. Parallel outputs come back as a
    /// record keyed by branch name.
    pub fn step_content(&self, name: &str) -> Option<Content> {
        let output = self.previous_step_outputs.get(name)?;
        match &output.parallel_outputs {
            Some(branches) => {
                let record: Map<String, Value> = branches
                    .iter()
                    .filter_map(|(branch, out)| {
                        out.content.as_ref().map(|c| (branch.to_string(), c.to_value()))
                    })
                    .collect();
                Some(Content::Record(record))
            }
            None => output.content.clone(),
        }
    }

    /// All earlier contents as `=== name ===` sections.
    pub fn all_previous_content(&self) -> String {
        self.previous_step_outputs
            .iter()
            .filter_map(|(name, out)| {
                out.content
                    .as_ref()
                    .map(|c| format!("=== {} ===\n{}", name, c.render()))
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn last_step_content(&self) -> Option<&Content> {
        self.previous_step_outputs
            .last()
            .and_then(|(_, out)| out.content.as_ref())
    }

    pub fn input_as_string(&self) -> Option<String> {
        self.input.as_ref().map(Content::render)
    }
}

/// The result of executing one unit or composite.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepOutput {
    pub step_name: String,
    pub step_id: String,
    #[serde(rename = "executor_type")]
    pub executor_kind: ExecutorKind,
    #[serde(default)]
    pub executor_name: Option<String>,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_outputs: Option<OrderedMap<StepOutput>>,
    #[serde(default)]
    pub media: MediaSet,
    #[serde(default)]
    pub metrics: Option<Metrics>,
    #[serde(default = "default_success")]
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub stop: bool,
}

fn default_success() -> bool {
    true
}

impl StepOutput {
    pub fn new(step_name: impl Into<String>, executor_kind: ExecutorKind) -> Self {
        Self {
            step_name: step_name.into(),
            step_id: Uuid::new_v4().to_string(),
            executor_kind,
            executor_name: None,
            content: None,
            parallel_outputs: None,
            media: MediaSet::default(),
            metrics: None,
            success: true,
            error: None,
            stop: false,
        }
    }

    /// Convenience for function steps returning a finished output.
    pub fn from_content(content: impl Into<Content>) -> Self {
        Self::new("", ExecutorKind::Function).with_content(content)
    }

    pub fn with_content(mut self, content: impl Into<Content>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_executor_name(mut self, name: impl Into<String>) -> Self {
        self.executor_name = Some(name.into());
        self
    }

    pub fn with_media(mut self, media: MediaSet) -> Self {
        self.media = media;
        self
    }

    pub fn with_metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Mark this output as failed.
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    /// Ask the engine to schedule nothing after this output.
    pub fn with_stop(mut self) -> Self {
        self.stop = true;
        self
    }

    /// Attach per-branch outputs. Only parallel outputs carry these.
    pub fn with_parallel_outputs(mut self, branches: OrderedMap<StepOutput>) -> Self {
        debug_assert_eq!(self.executor_kind, ExecutorKind::Parallel);
        self.parallel_outputs = Some(branches);
        self
    }

    pub fn content_string(&self) -> Option<String> {
        self.content.as_ref().map(Content::render)
    }
}

/// What a step function hands back: a finished output or bare content.
#[derive(Debug, Clone, PartialEq)]
pub enum StepReturn {
    Output(StepOutput),
    Content(Content),
}

impl From<StepOutput> for StepReturn {
    fn from(output: StepOutput) -> Self {
        StepReturn::Output(output)
    }
}

impl From<Content> for StepReturn {
    fn from(content: Content) -> Self {
        StepReturn::Content(content)
    }
}

impl From<&str> for StepReturn {
    fn from(s: &str) -> Self {
        StepReturn::Content(Content::from(s))
    }
}

impl From<String> for StepReturn {
    fn from(s: String) -> Self {
        StepReturn::Content(Content::from(s))
    }
}

impl From<i64> for StepReturn {
    fn from(n: i64) -> Self {
        StepReturn::Content(Content::from(n))
    }
}

impl From<Value> for StepReturn {
    fn from(v: Value) -> Self {
        StepReturn::Content(Content::from(v))
    }
}

/// One item yielded by a streaming step function.
#[derive(Debug, Clone, PartialEq)]
pub enum UnitChunk {
    /// Appended to the step's content.
    Content(String),
    /// Forwarded to the event stream as-is.
    Event(WorkflowEvent),
    /// Replaces whatever content was accumulated.
    Output(StepOutput),
}

/// What one node of the composition produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", content = "outputs", rename_all = "snake_case")]
pub enum NodeOutput {
    Single(StepOutput),
    Sequence(Vec<StepOutput>),
    /// One inner list per loop iteration.
    Iterations(Vec<Vec<StepOutput>>),
}

impl NodeOutput {
    /// Flattened outputs in execution order.
    pub fn outputs(&self) -> Vec<&StepOutput> {
        match self {
            NodeOutput::Single(out) => vec![out],
            NodeOutput::Sequence(outs) => outs.iter().collect(),
            NodeOutput::Iterations(iters) => iters.iter().flatten().collect(),
        }
    }

    pub fn into_outputs(self) -> Vec<StepOutput> {
        match self {
            NodeOutput::Single(out) => vec![out],
            NodeOutput::Sequence(outs) => outs,
            NodeOutput::Iterations(iters) => iters.into_iter().flatten().collect(),
        }
    }

    pub fn last(&self) -> Option<&StepOutput> {
        match self {
            NodeOutput::Single(out) => Some(out),
            NodeOutput::Sequence(outs) => outs.last(),
            NodeOutput::Iterations(iters) => iters.iter().rev().find_map(|it| it.last()),
        }
    }

    pub fn stop_requested(&self) -> bool {
        self.outputs().iter().any(|o| o.stop)
    }

    pub fn is_empty(&self) -> bool {
        match self {
            NodeOutput::Single(_) => false,
            NodeOutput::Sequence(outs) => outs.is_empty(),
            NodeOutput::Iterations(iters) => iters.iter().all(Vec::is_empty),
        }
    }

    pub fn len(&self) -> usize {
        self.outputs().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_from_value() {
        assert_eq!(Content::from(json!("hi")), Content::Text("hi".into()));
        assert!(matches!(Content::from(json!({"a": 1})), Content::Record(_)));
        assert!(matches!(Content::from(json!([1, 2])), Content::List(_)));
        assert_eq!(Content::from(json!(7)), Content::Scalar(json!(7)));
    }

    #[test]
    fn test_content_render() {
        assert_eq!(Content::text("plain").render(), "plain");
        assert_eq!(Content::from(42).render(), "42");
        let rendered = Content::from(json!({"k": "v"})).render();
        assert!(rendered.contains("\"k\": \"v\""));
    }

    #[test]
    fn test_content_numeric_accessors() {
        assert_eq!(Content::from(6).as_i64(), Some(6));
        assert_eq!(Content::text(" 12 ").as_i64(), Some(12));
        assert_eq!(Content::from(json!({"x": 1})).as_i64(), None);
    }

    #[test]
    fn test_absorb_overwrites_same_name() {
        let mut input = StepInput::new("start");
        input.absorb(&StepOutput::new("a", ExecutorKind::Function).with_content("one"));
        input.absorb(&StepOutput::new("b", ExecutorKind::Function).with_content("two"));
        input.absorb(&StepOutput::new("a", ExecutorKind::Function).with_content("three"));

        assert_eq!(input.previous_step_outputs.len(), 2);
        assert_eq!(
            input.previous_step_outputs.keys().collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(input.step_content("a"), Some(Content::text("three")));
        assert_eq!(input.previous_step_content, Some(Content::text("three")));
    }

    #[test]
    fn test_absorb_appends_media() {
        let mut input = StepInput::default();
        let mut media = MediaSet::default();
        media.images.push(MediaArtifact::from_url("https://img/1.png"));
        input.absorb(&StepOutput::new("draw", ExecutorKind::Function).with_media(media.clone()));
        input.absorb(&StepOutput::new("draw", ExecutorKind::Function).with_media(media));
        assert_eq!(input.media.images.len(), 2);
    }

    #[test]
    fn test_parallel_step_content_is_record() {
        let mut branches = OrderedMap::new();
        branches.insert(
            "left",
            StepOutput::new("left", ExecutorKind::Function).with_content("L"),
        );
        branches.insert("empty", StepOutput::new("empty", ExecutorKind::Function));
        let parallel = StepOutput::new("fan", ExecutorKind::Parallel).with_parallel_outputs(branches);

        let mut input = StepInput::default();
        input.absorb(&parallel);

        let content = input.step_content("fan").unwrap();
        assert_eq!(content, Content::Record(json!({"left": "L"}).as_object().unwrap().clone()));
    }

    #[test]
    fn test_all_previous_content() {
        let mut input = StepInput::default();
        input.absorb(&StepOutput::new("research", ExecutorKind::Agent).with_content("facts"));
        input.absorb(&StepOutput::new("silent", ExecutorKind::Function));
        input.absorb(&StepOutput::new("draft", ExecutorKind::Agent).with_content("words"));

        assert_eq!(
            input.all_previous_content(),
            "=== research ===\nfacts\n\n=== draft ===\nwords"
        );
        assert_eq!(input.last_step_content(), Some(&Content::text("words")));
    }

    #[test]
    fn test_node_output_last_and_stop() {
        let a = StepOutput::new("a", ExecutorKind::Function).with_content(1);
        let b = StepOutput::new("b", ExecutorKind::Function).with_content(2).with_stop();
        let iters = NodeOutput::Iterations(vec![vec![a.clone()], vec![b.clone()], vec![]]);

        assert_eq!(iters.last().unwrap().step_name, "b");
        assert!(iters.stop_requested());
        assert_eq!(iters.len(), 2);
        assert!(!NodeOutput::Sequence(vec![a]).stop_requested());
        assert!(NodeOutput::Sequence(vec![]).is_empty());
    }

    #[test]
    fn test_with_error_marks_failure() {
        let out = StepOutput::new("boom", ExecutorKind::Function).with_error("exploded");
        assert!(!out.success);
        assert_eq!(out.error.as_deref(), Some("exploded"));
    }
}
