use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use serde_json::{Map, Value};
use uuid::Uuid;

use flowline_core::config::WorkflowConfig;
use flowline_core::error::{FlowlineError, Result};
use flowline_core::run::StepSummary;
use flowline_core::schema::InputSchema;
use flowline_core::state::StateHandle;
use flowline_core::types::{Content, ExecutionInput, ExecutorKind, SessionId, UnitChunk};

use crate::node::{validate_children, Node};

/// What a custom workflow function sees.
#[derive(Debug, Clone)]
pub struct WorkflowContext {
    pub run_id: String,
    pub session_id: SessionId,
    pub user_id: Option<String>,
    pub workflow_id: String,
    pub workflow_name: String,
    pub input: ExecutionInput,
    /// Writes are merged into session state when the function returns.
    pub state: StateHandle,
}

/// Result of a custom workflow function.
pub enum CustomOutput {
    Content(Content),
    Stream(BoxStream<'static, Result<UnitChunk>>),
}

impl From<Content> for CustomOutput {
    fn from(content: Content) -> Self {
        CustomOutput::Content(content)
    }
}

impl From<&str> for CustomOutput {
    fn from(s: &str) -> Self {
        CustomOutput::Content(Content::text(s))
    }
}

impl From<String> for CustomOutput {
    fn from(s: String) -> Self {
        CustomOutput::Content(Content::Text(s))
    }
}

pub type CustomFn =
    Arc<dyn Fn(WorkflowContext) -> BoxFuture<'static, Result<CustomOutput>> + Send + Sync>;

/// Body of a workflow: a node composition or one custom function.
#[derive(Clone)]
pub enum WorkflowSteps {
    Nodes(Vec<Node>),
    Custom(CustomFn),
}

/// A named, validated workflow definition. Cheap to share across runs.
pub struct Workflow {
    pub name: String,
    pub workflow_id: String,
    pub description: Option<String>,
    pub steps: WorkflowSteps,
    pub input_schema: Option<InputSchema>,
    pub debug_mode: bool,
    pub stream_intermediate_steps: bool,
    pub store_events: bool,
    pub events_to_skip: Vec<String>,
    /// Initial session state; stored state wins on conflicts.
    pub session_state: Map<String, Value>,
}

impl Workflow {
    pub fn builder(name: impl Into<String>) -> WorkflowBuilder {
        WorkflowBuilder::new(name)
    }

    /// Static summary of the top-level nodes, kept on the session record.
    pub fn summaries(&self) -> Vec<StepSummary> {
        match &self.steps {
            WorkflowSteps::Nodes(nodes) => nodes.iter().map(Node::summary).collect(),
            WorkflowSteps::Custom(_) => vec![StepSummary {
                name: self.name.clone(),
                kind: ExecutorKind::Custom,
                description: self.description.clone(),
            }],
        }
    }
}

pub struct WorkflowBuilder {
    name: String,
    workflow_id: Option<String>,
    description: Option<String>,
    nodes: Vec<Node>,
    custom: Option<CustomFn>,
    input_schema: Option<InputSchema>,
    debug_mode: bool,
    stream_intermediate_steps: bool,
    store_events: bool,
    events_to_skip: Vec<String>,
    session_state: Map<String, Value>,
}

impl WorkflowBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            workflow_id: None,
            description: None,
            nodes: Vec::new(),
            custom: None,
            input_schema: None,
            debug_mode: false,
            stream_intermediate_steps: false,
            store_events: false,
            events_to_skip: Vec::new(),
            session_state: Map::new(),
        }
    }

    /// Start from the `[workflow]` config table.
    pub fn from_config(config: &WorkflowConfig) -> Self {
        let mut builder = Self::new(config.name.clone());
        builder.workflow_id = config.workflow_id.clone();
        builder.description = config.description.clone();
        builder.debug_mode = config.debug_mode;
        builder.stream_intermediate_steps = config.stream_intermediate_steps;
        builder.store_events = config.store_events;
        builder.events_to_skip = config.events_to_skip.clone();
        builder
    }

    pub fn workflow_id(mut self, id: impl Into<String>) -> Self {
        self.workflow_id = Some(id.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn step(mut self, node: impl Into<Node>) -> Self {
        self.nodes.push(node.into());
        self
    }

    pub fn steps(mut self, nodes: impl IntoIterator<Item = Node>) -> Self {
        self.nodes.extend(nodes);
        self
    }

    /// Replace the node composition with a single async function.
    pub fn custom<F, Fut, O>(mut self, f: F) -> Self
    where
        F: Fn(WorkflowContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
        O: Into<CustomOutput> + 'static,
    {
        let custom: CustomFn = Arc::new(
            move |ctx: WorkflowContext| -> BoxFuture<'static, Result<CustomOutput>> {
                let fut = f(ctx);
                Box::pin(async move { fut.await.map(Into::into) })
            },
        );
        self.custom = Some(custom);
        self
    }

    /// Custom function that streams its content.
    pub fn custom_stream<F, S>(self, f: F) -> Self
    where
        F: Fn(WorkflowContext) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<UnitChunk>> + Send + 'static,
    {
        let f = Arc::new(f);
        self.custom(move |ctx: WorkflowContext| {
            let f = Arc::clone(&f);
            async move { Ok(CustomOutput::Stream(Box::pin(f(ctx)))) }
        })
    }

    pub fn input_schema(mut self, schema: InputSchema) -> Self {
        self.input_schema = Some(schema);
        self
    }

    pub fn debug_mode(mut self, enabled: bool) -> Self {
        self.debug_mode = enabled;
        self
    }

    pub fn stream_intermediate_steps(mut self, enabled: bool) -> Self {
        self.stream_intermediate_steps = enabled;
        self
    }

    pub fn store_events(mut self, enabled: bool) -> Self {
        self.store_events = enabled;
        self
    }

    /// Leave this event type out of stored run records.
    pub fn skip_event(mut self, event_type: impl Into<String>) -> Self {
        self.events_to_skip.push(event_type.into());
        self
    }

    pub fn session_state(mut self, state: Map<String, Value>) -> Self {
        self.session_state = state;
        self
    }

    pub fn build(self) -> Result<Workflow> {
        if self.name.trim().is_empty() {
            return Err(FlowlineError::InvalidComposition(
                "workflow name must not be empty".into(),
            ));
        }
        let steps = match self.custom {
            Some(_) if !self.nodes.is_empty() => {
                return Err(FlowlineError::InvalidComposition(format!(
                    "workflow '{}' has both steps and a custom function",
                    self.name
                )))
            }
            Some(custom) => WorkflowSteps::Custom(custom),
            None => {
                validate_children(&self.name, &self.nodes)?;
                WorkflowSteps::Nodes(self.nodes)
            }
        };

        Ok(Workflow {
            workflow_id: self
                .workflow_id
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            name: self.name,
            description: self.description,
            steps,
            input_schema: self.input_schema,
            debug_mode: self.debug_mode,
            stream_intermediate_steps: self.stream_intermediate_steps,
            store_events: self.store_events,
            events_to_skip: self.events_to_skip,
            session_state: self.session_state,
        })
    }
}
