//! Mocks and fixtures shared by Flowline's tests.

use std::sync::Mutex;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{Map, Value};
use tempfile::TempDir;

use flowline_core::config::AppConfig;
use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::WorkflowRunEvent;
use flowline_core::state::StateHandle;
use flowline_core::traits::{
    EventHandler, Executor, ExecutorChunk, ExecutorRequest, ExecutorResponse,
};
use flowline_core::types::{Content, ExecutorKind, StepInput, StepOutput, StepReturn};
use flowline_store::SqliteStore;

// ---------------------------------------------------------------------------
// Step function fixtures
// ---------------------------------------------------------------------------

fn number(content: Option<&Content>) -> i64 {
    content.and_then(Content::as_i64).unwrap_or(0)
}

/// Doubles the run input.
pub fn double(input: StepInput, _state: StateHandle) -> Result<StepReturn> {
    Ok(Content::from(number(input.input.as_ref()) * 2).into())
}

/// Adds one to the previous step's content, or to the run input.
pub fn add_one(input: StepInput, _state: StateHandle) -> Result<StepReturn> {
    let base = input
        .previous_step_content
        .as_ref()
        .or(input.input.as_ref());
    Ok(Content::from(number(base) + 1).into())
}

/// Echoes the input and asks the workflow to stop.
pub fn stopping(input: StepInput, _state: StateHandle) -> Result<StepReturn> {
    let text = input.input_as_string().unwrap_or_else(|| "stopped".into());
    Ok(StepOutput::from_content(text).with_stop().into())
}

/// Always fails.
pub fn failing(_input: StepInput, _state: StateHandle) -> Result<StepReturn> {
    Err(FlowlineError::UnitExecution {
        step: "failing".into(),
        message: "fixture failure".into(),
    })
}

// ---------------------------------------------------------------------------
// MockExecutor
// ---------------------------------------------------------------------------

/// Agent stand-in with a canned reply. Records every request it receives.
pub struct MockExecutor {
    name: String,
    kind: ExecutorKind,
    reply: Option<Content>,
    state: Option<Map<String, Value>>,
    stop: bool,
    failure: Option<String>,
    requests: Mutex<Vec<ExecutorRequest>>,
}

impl MockExecutor {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: ExecutorKind::Agent,
            reply: None,
            state: None,
            stop: false,
            failure: None,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn team(name: &str) -> Self {
        Self {
            kind: ExecutorKind::Team,
            ..Self::new(name)
        }
    }

    pub fn with_reply(mut self, reply: impl Into<Content>) -> Self {
        self.reply = Some(reply.into());
        self
    }

    /// Session state handed back with every response. Must be a JSON object.
    pub fn with_state(mut self, state: Value) -> Self {
        self.state = state.as_object().cloned();
        self
    }

    pub fn with_stop(mut self) -> Self {
        self.stop = true;
        self
    }

    pub fn failing(mut self, message: &str) -> Self {
        self.failure = Some(message.to_string());
        self
    }

    /// Requests seen so far.
    pub fn requests(&self) -> Vec<ExecutorRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl Executor for MockExecutor {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ExecutorKind {
        self.kind
    }

    fn run(&self, request: ExecutorRequest) -> BoxFuture<'_, Result<ExecutorResponse>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            if let Some(message) = &self.failure {
                return Err(FlowlineError::UnitExecution {
                    step: self.name.clone(),
                    message: message.clone(),
                });
            }
            Ok(ExecutorResponse {
                content: self.reply.clone(),
                session_state: self.state.clone(),
                stop: self.stop,
                ..Default::default()
            })
        })
    }
}

// ---------------------------------------------------------------------------
// StaticChunks
// ---------------------------------------------------------------------------

/// Executor that streams fixed chunks and completes without its own content.
pub struct StaticChunks {
    name: String,
    chunks: Vec<String>,
}

impl StaticChunks {
    pub fn new(name: &str, chunks: Vec<&str>) -> Self {
        Self {
            name: name.to_string(),
            chunks: chunks.into_iter().map(String::from).collect(),
        }
    }
}

impl Executor for StaticChunks {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, _request: ExecutorRequest) -> BoxFuture<'_, Result<ExecutorResponse>> {
        Box::pin(async move { Ok(ExecutorResponse::text(self.chunks.concat())) })
    }

    fn run_stream(
        &self,
        _request: ExecutorRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<ExecutorChunk>>>> {
        Box::pin(async move {
            let mut items: Vec<Result<ExecutorChunk>> = self
                .chunks
                .iter()
                .map(|c| Ok(ExecutorChunk::Content(c.clone())))
                .collect();
            items.push(Ok(ExecutorChunk::Completed(ExecutorResponse::default())));
            let stream: BoxStream<'_, Result<ExecutorChunk>> =
                Box::pin(futures::stream::iter(items));
            Ok(stream)
        })
    }
}

// ---------------------------------------------------------------------------
// Event collection
// ---------------------------------------------------------------------------

/// Push handler that keeps every event it receives.
#[derive(Default)]
pub struct EventCollector {
    events: Mutex<Vec<WorkflowRunEvent>>,
}

impl EventCollector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<WorkflowRunEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_types(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(WorkflowRunEvent::event_type)
            .collect()
    }
}

impl EventHandler for EventCollector {
    fn handle_event(&self, event: &WorkflowRunEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Stores and config
// ---------------------------------------------------------------------------

/// SQLite store in a temp directory that lives as long as the returned guard.
pub fn temp_sqlite_store() -> (SqliteStore, TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteStore::open(&dir.path().join("sessions.db")).unwrap();
    (store, dir)
}

/// A config with the in-memory backend and event storage switched on.
pub fn memory_config() -> AppConfig {
    toml::from_str(
        r#"
[workflow]
name = "fixture"
store_events = true

[storage]
backend = "memory"
"#,
    )
    .unwrap()
}
