use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::event::WorkflowRunEvent;
use crate::metrics::Metrics;
use crate::run::SessionRecord;
use crate::types::{Content, ExecutorKind, MediaSet, SessionId};

/// What an agent or team is asked to do for one step.
#[derive(Debug, Clone)]
pub struct ExecutorRequest {
    /// Rendered step input, with the previous step's output prefixed.
    pub message: String,
    pub step_name: String,
    pub run_id: String,
    pub session_id: SessionId,
    pub user_id: Option<String>,
    pub media: MediaSet,
    pub additional_data: Option<Map<String, Value>>,
    /// Copy of the shared session state.
    pub session_state: Map<String, Value>,
    pub stream: bool,
}

/// Final result of an executor call.
#[derive(Debug, Clone, Default)]
pub struct ExecutorResponse {
    pub content: Option<Content>,
    pub media: MediaSet,
    pub metrics: Option<Metrics>,
    /// Session state as the executor left it, merged back by the engine.
    pub session_state: Option<Map<String, Value>>,
    pub stop: bool,
}

impl ExecutorResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: Some(Content::Text(content.into())),
            ..Default::default()
        }
    }
}

/// Incremental output of a streaming executor call.
#[derive(Debug, Clone)]
pub enum ExecutorChunk {
    Content(String),
    Event(Value),
    Completed(ExecutorResponse),
}

/// An agent or team reached through its own run contract.
pub trait Executor: Send + Sync + 'static {
    /// Executor name, reported as `executor_name` on step outputs.
    fn name(&self) -> &str;

    fn kind(&self) -> ExecutorKind {
        ExecutorKind::Agent
    }

    /// Run to completion.
    fn run(&self, request: ExecutorRequest) -> BoxFuture<'_, Result<ExecutorResponse>>;

    /// Run and stream chunks. The last chunk should be `Completed`.
    fn run_stream(
        &self,
        request: ExecutorRequest,
    ) -> BoxFuture<'_, Result<BoxStream<'_, Result<ExecutorChunk>>>> {
        Box::pin(async move {
            let response = self.run(request).await?;
            let stream: BoxStream<'_, Result<ExecutorChunk>> =
                Box::pin(futures::stream::iter(vec![Ok(ExecutorChunk::Completed(response))]));
            Ok(stream)
        })
    }
}

/// Persistence backend for session records.
pub trait SessionStore: Send + Sync + 'static {
    fn get_session(&self, session_id: &SessionId) -> BoxFuture<'_, Result<Option<SessionRecord>>>;

    /// Insert or replace the whole record.
    fn upsert_session(&self, record: SessionRecord) -> BoxFuture<'_, Result<SessionRecord>>;

    /// Returns true if a record was removed.
    fn delete_session(&self, session_id: &SessionId) -> BoxFuture<'_, Result<bool>>;

    /// Most recently updated sessions first.
    fn list_sessions(&self, limit: usize) -> BoxFuture<'_, Result<Vec<SessionRecord>>>;
}

/// Push receiver for run events (websocket-style delivery).
pub trait EventHandler: Send + Sync + 'static {
    fn handle_event(&self, event: &WorkflowRunEvent) -> Result<()>;
}
