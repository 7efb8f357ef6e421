use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};
use std::time::Instant;

use chrono::Utc;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, warn};

use flowline_core::config::debug_from_env;
use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::{EventBus, WorkflowEvent, WorkflowRunEvent};
use flowline_core::metrics::{Metrics, WorkflowMetrics};
use flowline_core::run::{RunStatus, SessionRecord, WorkflowRun};
use flowline_core::state::{deep_merge, SessionState};
use flowline_core::traits::{EventHandler, SessionStore};
use flowline_core::types::{
    new_run_id, Content, ExecutionInput, ExecutorKind, MediaSet, NodeOutput, SessionId,
    StepInput, StepOutput, UnitChunk,
};

use crate::context::{EventDispatcher, EventSink, ExecutionContext};
use crate::node::Node;
use crate::step::panic_message;
use crate::workflow::{CustomFn, CustomOutput, Workflow, WorkflowContext, WorkflowSteps};

/// Events of one streamed run, `WorkflowStarted` first and
/// `WorkflowCompleted` last.
pub type WorkflowEventStream = BoxStream<'static, WorkflowRunEvent>;

/// Arguments for one run.
#[derive(Clone, Default)]
pub struct RunRequest {
    pub input: Option<Content>,
    pub additional_data: Option<Map<String, Value>>,
    pub user_id: Option<String>,
    /// Reuse this session instead of the engine's current one.
    pub session_id: Option<SessionId>,
    pub media: MediaSet,
    /// Overrides the workflow's own setting for this run.
    pub stream_intermediate_steps: Option<bool>,
    pub background: bool,
    pub stream: bool,
    /// Receives every event of a background streaming run.
    pub event_handler: Option<Arc<dyn EventHandler>>,
}

impl RunRequest {
    pub fn new(input: impl Into<Content>) -> Self {
        Self {
            input: Some(input.into()),
            ..Default::default()
        }
    }

    pub fn with_additional_data(mut self, data: Map<String, Value>) -> Self {
        self.additional_data = Some(data);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_session(mut self, session_id: SessionId) -> Self {
        self.session_id = Some(session_id);
        self
    }

    pub fn with_media(mut self, media: MediaSet) -> Self {
        self.media = media;
        self
    }

    pub fn with_intermediate_steps(mut self, enabled: bool) -> Self {
        self.stream_intermediate_steps = Some(enabled);
        self
    }

    pub fn background(mut self) -> Self {
        self.background = true;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }

    pub fn with_event_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    fn execution_input(&self, input: Option<Content>) -> ExecutionInput {
        ExecutionInput {
            input,
            additional_data: self.additional_data.clone(),
            media: self.media.clone(),
        }
    }
}

/// A run detached onto its own task.
pub struct BackgroundRun {
    /// The run as first persisted, still `pending`.
    pub run: WorkflowRun,
    /// Latest known state of the run.
    pub updates: watch::Receiver<WorkflowRun>,
    handle: JoinHandle<WorkflowRun>,
}

impl BackgroundRun {
    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    /// Wait for the run to reach a terminal state.
    pub async fn wait(self) -> Result<WorkflowRun> {
        self.handle
            .await
            .map_err(|e| FlowlineError::BackgroundExecution(e.to_string()))
    }
}

/// What [`WorkflowEngine::execute`] started.
pub enum RunOutcome {
    Completed(WorkflowRun),
    Stream(WorkflowEventStream),
    Background(BackgroundRun),
}

#[derive(Debug, Clone, Copy)]
enum RunMode {
    Buffered,
    Streaming,
    Background,
}

impl RunMode {
    fn failure_prefix(self) -> &'static str {
        match self {
            RunMode::Buffered | RunMode::Streaming => "Workflow execution failed",
            RunMode::Background => "Background execution failed",
        }
    }
}

/// Validated input plus the records a run writes to.
struct PreparedRun {
    run: WorkflowRun,
    record: SessionRecord,
    state: SessionState,
    input: ExecutionInput,
    stream_intermediate_steps: bool,
}

/// Drives runs of one workflow and keeps its session records.
pub struct WorkflowEngine {
    workflow: Arc<Workflow>,
    store: Arc<dyn SessionStore>,
    event_bus: Option<Arc<EventBus>>,
    session_id: RwLock<Option<SessionId>>,
    persist_lock: Mutex<()>,
}

impl WorkflowEngine {
    pub fn new(workflow: Workflow, store: Arc<dyn SessionStore>) -> Self {
        Self {
            workflow: Arc::new(workflow),
            store,
            event_bus: None,
            session_id: RwLock::new(None),
            persist_lock: Mutex::new(()),
        }
    }

    /// Publish every streamed event on `bus` as well.
    pub fn with_event_bus(mut self, bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(bus);
        self
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    /// Run to completion and return the finished run.
    ///
    /// A failed run is persisted with status `error` before the error is
    /// returned.
    pub async fn run(&self, request: RunRequest) -> Result<WorkflowRun> {
        let prepared = self.prepare(&request).await?;
        let (run, failure) = self.drive(prepared, RunMode::Buffered, None, None).await;
        match failure {
            Some(e) => Err(e),
            None => Ok(run),
        }
    }

    /// [`run`](Self::run) on a private current-thread runtime. Must not be
    /// called from inside another tokio runtime.
    pub fn run_blocking(&self, request: RunRequest) -> Result<WorkflowRun> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(self.run(request))
    }

    /// Run on a spawned task and stream its events.
    ///
    /// Input validation errors are returned here; anything later arrives as
    /// a `WorkflowError` event.
    pub async fn run_stream(self: &Arc<Self>, request: RunRequest) -> Result<WorkflowEventStream> {
        let prepared = self.prepare(&request).await?;
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Arc::new(
            self.dispatcher(&prepared.run, request.event_handler.clone())
                .with_sender(tx),
        );

        let engine = Arc::clone(self);
        tokio::spawn(async move {
            let (run, failure) = engine
                .drive(prepared, RunMode::Streaming, Some(dispatcher), None)
                .await;
            if let Some(e) = failure {
                warn!(run_id = %run.run_id, error = %e, "Streamed run failed");
            }
        });

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    /// Persist a pending run, start it on its own task and return at once.
    pub async fn run_background(self: &Arc<Self>, request: RunRequest) -> Result<BackgroundRun> {
        if request.stream && request.event_handler.is_none() {
            return Err(FlowlineError::BackgroundExecution(
                "streaming in the background needs an event handler".into(),
            ));
        }
        let prepared = self.prepare(&request).await?;
        self.persist(&prepared.run, &prepared.state.snapshot(), &prepared.record)
            .await?;

        let pending = prepared.run.clone();
        let (tx, rx) = watch::channel(pending.clone());
        let dispatcher = request.stream.then(|| {
            Arc::new(self.dispatcher(&prepared.run, request.event_handler.clone()))
        });

        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let (run, failure) = engine
                .drive(prepared, RunMode::Background, dispatcher, Some(&tx))
                .await;
            if let Some(e) = failure {
                error!(run_id = %run.run_id, error = %e, "Background execution failed");
            }
            run
        });
        info!(run_id = %pending.run_id, session_id = %pending.session_id, "Background run admitted");

        Ok(BackgroundRun {
            run: pending,
            updates: rx,
            handle,
        })
    }

    /// Pick run mode from the request flags.
    pub async fn execute(self: &Arc<Self>, request: RunRequest) -> Result<RunOutcome> {
        if request.background {
            Ok(RunOutcome::Background(self.run_background(request).await?))
        } else if request.stream {
            Ok(RunOutcome::Stream(self.run_stream(request).await?))
        } else {
            Ok(RunOutcome::Completed(self.run(request).await?))
        }
    }

    /// A stored run of the current session.
    pub async fn get_run(&self, run_id: &str) -> Result<WorkflowRun> {
        let session_id = self.session_id().ok_or(FlowlineError::SessionNotSet)?;
        self.store
            .get_session(&session_id)
            .await?
            .and_then(|record| record.get_run(run_id).cloned())
            .ok_or_else(|| FlowlineError::RunNotFound(run_id.to_string()))
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.session_id
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Start over with a fresh session id.
    pub fn new_session(&self) -> SessionId {
        let id = SessionId::new();
        *self
            .session_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id.clone());
        info!(session_id = %id, "New session");
        id
    }

    /// Name the current session. `None` derives a name from the workflow
    /// description and the current time.
    pub async fn set_session_name(&self, name: Option<String>) -> Result<String> {
        let session_id = self.session_id().ok_or(FlowlineError::SessionNotSet)?;
        let name = name.unwrap_or_else(|| self.generate_session_name());

        let _guard = self.persist_lock.lock().await;
        let mut record = match self.store.get_session(&session_id).await? {
            Some(record) => record,
            None => self.blank_record(session_id),
        };
        record.session_name = Some(name.clone());
        record
            .session_state
            .insert("session_name".into(), json!(name));
        record.updated_at = Utc::now();
        self.store.upsert_session(record).await?;

        info!(session_name = %name, "Session renamed");
        Ok(name)
    }

    pub async fn delete_session(&self, session_id: &SessionId) -> Result<bool> {
        let removed = self.store.delete_session(session_id).await?;
        let mut current = self
            .session_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if current.as_ref() == Some(session_id) {
            *current = None;
        }
        Ok(removed)
    }

    /// Stored state of the current session.
    pub async fn session_state(&self) -> Result<Map<String, Value>> {
        let session_id = self.session_id().ok_or(FlowlineError::SessionNotSet)?;
        Ok(match self.store.get_session(&session_id).await? {
            Some(record) => record.session_state,
            None => self.workflow.session_state.clone(),
        })
    }

    fn generate_session_name(&self) -> String {
        let stamp = Utc::now().format("%Y-%m-%d %H:%M");
        let description = self
            .workflow
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty());
        match description {
            Some(desc) if desc.chars().count() > 40 => {
                let short: String = desc.chars().take(40).collect();
                format!("{}- - {}", short, stamp)
            }
            Some(desc) => format!("{} - {}", desc, stamp),
            None => format!("Workflow Session-{}", stamp),
        }
    }

    fn blank_record(&self, session_id: SessionId) -> SessionRecord {
        let mut record = SessionRecord::new(
            session_id,
            self.workflow.workflow_id.clone(),
            self.workflow.name.clone(),
        );
        record.workflow_data = self.workflow.summaries();
        record.session_state = self.workflow.session_state.clone();
        record
    }

    fn resolve_session(&self, requested: Option<SessionId>) -> SessionId {
        let mut current = self
            .session_id
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let id = requested.or_else(|| current.clone()).unwrap_or_default();
        *current = Some(id.clone());
        id
    }

    fn dispatcher(
        &self,
        run: &WorkflowRun,
        handler: Option<Arc<dyn EventHandler>>,
    ) -> EventDispatcher {
        let dispatcher = EventDispatcher::new(run)
            .with_bus(self.event_bus.clone())
            .with_handler(handler);
        if self.workflow.store_events {
            dispatcher.recording(&self.workflow.events_to_skip)
        } else {
            dispatcher
        }
    }

    /// Validate input, load the session and seed its state.
    async fn prepare(&self, request: &RunRequest) -> Result<PreparedRun> {
        let input = match &self.workflow.input_schema {
            Some(schema) => Some(schema.validate(request.input.as_ref())?),
            None => request.input.clone(),
        };

        let session_id = self.resolve_session(request.session_id.clone());
        let mut record = match self.store.get_session(&session_id).await? {
            Some(record) => record,
            None => self.blank_record(session_id.clone()),
        };
        record.workflow_data = self.workflow.summaries();
        if request.user_id.is_some() {
            record.user_id = request.user_id.clone();
        }

        let mut run = WorkflowRun::new(
            new_run_id(),
            session_id.clone(),
            self.workflow.workflow_id.clone(),
            self.workflow.name.clone(),
        );
        run.user_id = request.user_id.clone();

        let mut seeded = self.workflow.session_state.clone();
        deep_merge(&mut seeded, &record.session_state);
        seeded.insert("workflow_id".into(), json!(self.workflow.workflow_id));
        seeded.insert("workflow_name".into(), json!(self.workflow.name));
        seeded.insert("run_id".into(), json!(run.run_id));
        seeded.insert("session_id".into(), json!(session_id.as_str()));
        if let Some(name) = &record.session_name {
            seeded.insert("session_name".into(), json!(name));
        }

        Ok(PreparedRun {
            input: request.execution_input(input),
            stream_intermediate_steps: request
                .stream_intermediate_steps
                .unwrap_or(self.workflow.stream_intermediate_steps),
            state: SessionState::new(seeded),
            record,
            run,
        })
    }

    /// Execute a prepared run and persist every status change. Returns the
    /// final run together with the error that failed it, if any.
    async fn drive(
        &self,
        prepared: PreparedRun,
        mode: RunMode,
        dispatcher: Option<Arc<EventDispatcher>>,
        updates: Option<&watch::Sender<WorkflowRun>>,
    ) -> (WorkflowRun, Option<FlowlineError>) {
        let PreparedRun {
            mut run,
            record,
            state,
            input,
            stream_intermediate_steps,
        } = prepared;

        run.set_status(RunStatus::Running);
        if let Err(e) = self.persist(&run, &state.snapshot(), &record).await {
            warn!(run_id = %run.run_id, error = %e, "Failed to persist running state");
        }
        if let Some(tx) = updates {
            tx.send_replace(run.clone());
        }

        let mut ctx = ExecutionContext::new(
            run.run_id.clone(),
            run.session_id.clone(),
            self.workflow.workflow_id.clone(),
            self.workflow.name.clone(),
        )
        .with_user(run.user_id.clone())
        .with_state(state.clone())
        .with_debug(self.workflow.debug_mode || debug_from_env())
        .with_intermediate_steps(stream_intermediate_steps);
        if let Some(dispatcher) = &dispatcher {
            ctx = ctx.with_sink(EventSink::Dispatch(Arc::clone(dispatcher)));
        }

        info!(
            run_id = %run.run_id,
            session_id = %run.session_id,
            workflow = %self.workflow.name,
            "Workflow run started"
        );
        ctx.emit(WorkflowEvent::WorkflowStarted);

        let walked = AssertUnwindSafe(self.walk(&input, &ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(FlowlineError::WorkflowExecution(panic_message(panic))));

        let mut failure = match walked {
            Ok(results) => {
                finish_run(&mut run, &input.media, results);
                info!(
                    run_id = %run.run_id,
                    steps = run.outputs().len(),
                    "Workflow run completed"
                );
                None
            }
            Err(e) => {
                error!(run_id = %run.run_id, error = %e, "Workflow run failed");
                run.content = Some(Content::Text(format!("{}: {}", mode.failure_prefix(), e)));
                run.set_status(RunStatus::Error);
                ctx.emit(WorkflowEvent::WorkflowError {
                    error: e.to_string(),
                });
                Some(e)
            }
        };

        ctx.emit(WorkflowEvent::WorkflowCompleted {
            status: run.status,
            content: run.content.clone(),
        });
        if let Some(dispatcher) = &dispatcher {
            run.events = dispatcher.take_recorded();
        }
        drop(ctx);

        if let Err(e) = self.persist(&run, &state.snapshot(), &record).await {
            error!(run_id = %run.run_id, error = %e, "Failed to persist run");
            failure.get_or_insert(e);
        }
        if let Some(tx) = updates {
            tx.send_replace(run.clone());
        }
        (run, failure)
    }

    async fn walk(&self, input: &ExecutionInput, ctx: &ExecutionContext) -> Result<Vec<NodeOutput>> {
        match &self.workflow.steps {
            WorkflowSteps::Nodes(nodes) => {
                walk_nodes(nodes, StepInput::from_execution_input(input), ctx).await
            }
            WorkflowSteps::Custom(custom) => {
                let produced = self
                    .run_custom(custom, input, ctx)
                    .await
                    .map_err(|e| match e {
                        FlowlineError::WorkflowExecution(_) => e,
                        other => FlowlineError::WorkflowExecution(other.to_string()),
                    })?;
                ctx.emit(WorkflowEvent::StepOutput {
                    output: Box::new(produced.clone()),
                });
                Ok(vec![NodeOutput::Single(produced)])
            }
        }
    }

    async fn run_custom(
        &self,
        custom: &CustomFn,
        input: &ExecutionInput,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput> {
        let started = Instant::now();
        let handle = ctx.state.handle();
        let workflow_ctx = WorkflowContext {
            run_id: ctx.run_id.clone(),
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
            workflow_id: ctx.workflow_id.clone(),
            workflow_name: ctx.workflow_name.clone(),
            input: input.clone(),
            state: handle.clone(),
        };

        let mut output = StepOutput::new(self.workflow.name.clone(), ExecutorKind::Custom)
            .with_executor_name(self.workflow.name.clone());
        match custom(workflow_ctx).await? {
            CustomOutput::Content(content) => output.content = Some(content),
            CustomOutput::Stream(mut stream) => {
                let mut buffer = String::new();
                while let Some(chunk) = stream.next().await {
                    match chunk? {
                        UnitChunk::Content(text) => {
                            ctx.emit(WorkflowEvent::StepContent {
                                step_name: self.workflow.name.clone(),
                                content: text.clone(),
                            });
                            buffer.push_str(&text);
                        }
                        UnitChunk::Event(event) => ctx.emit(event),
                        UnitChunk::Output(produced) => {
                            output.content = produced.content;
                            output.media = produced.media;
                            output.stop = produced.stop;
                        }
                    }
                }
                if output.content.is_none() && !buffer.is_empty() {
                    output.content = Some(Content::Text(buffer));
                }
            }
        }

        ctx.state.apply(&handle);
        output.metrics = Some(Metrics::with_duration(started.elapsed().as_secs_f64()));
        Ok(output)
    }

    async fn persist(
        &self,
        run: &WorkflowRun,
        state: &Map<String, Value>,
        template: &SessionRecord,
    ) -> Result<()> {
        let _guard = self.persist_lock.lock().await;
        let mut record = self
            .store
            .get_session(&run.session_id)
            .await?
            .unwrap_or_else(|| template.clone());
        record.workflow_data = template.workflow_data.clone();
        if template.user_id.is_some() {
            record.user_id = template.user_id.clone();
        }
        record.session_state = state.clone();
        record.upsert_run(run.clone());
        self.store.upsert_session(record).await?;
        debug!(run_id = %run.run_id, status = %run.status, "Persisted run");
        Ok(())
    }
}

/// Top-level walk: like a sequence, but every output is also streamed as a
/// `StepOutput` event and empty composite results are dropped.
async fn walk_nodes(
    nodes: &[Node],
    mut input: StepInput,
    ctx: &ExecutionContext,
) -> Result<Vec<NodeOutput>> {
    let mut results = Vec::new();
    for node in nodes {
        let produced = node.execute(input.clone(), ctx).await?;
        let stop = produced.stop_requested();
        for output in produced.outputs() {
            input.absorb(output);
            ctx.emit(WorkflowEvent::StepOutput {
                output: Box::new(output.clone()),
            });
        }
        // Later steps can address a composite by its own name.
        if let Some(last) = produced.last() {
            if last.step_name != node.name() {
                input
                    .previous_step_outputs
                    .insert(node.name().to_string(), last.clone());
            }
        }
        if !produced.is_empty() {
            results.push(produced);
        }
        if stop {
            info!(step = %node.name(), "Early termination requested");
            break;
        }
    }
    Ok(results)
}

/// Run media starts from the input media, then gains every output's media.
fn finish_run(run: &mut WorkflowRun, input_media: &MediaSet, results: Vec<NodeOutput>) {
    let mut media = input_media.clone();
    for output in results.iter().flat_map(NodeOutput::outputs) {
        media.extend(&output.media);
    }
    run.media = media;
    run.metrics = Some(WorkflowMetrics::aggregate(&results));
    run.content = match results.last() {
        Some(last) => last.last().and_then(|o| o.content.clone()),
        None => Some(Content::text("No steps executed")),
    };
    run.step_results = results;
    run.set_status(RunStatus::Completed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    use flowline_core::schema::{FieldType, InputSchema};
    use flowline_core::state::StateHandle;
    use flowline_core::types::StepReturn;
    use flowline_store::MemoryStore;
    use flowline_test_utils::{add_one, double, stopping};

    use crate::step::Step;

    fn engine(workflow: Workflow) -> Arc<WorkflowEngine> {
        Arc::new(WorkflowEngine::new(workflow, Arc::new(MemoryStore::new())))
    }

    fn pipeline() -> Workflow {
        Workflow::builder("pipeline")
            .step(Step::function("double", double))
            .step(Step::function("add_one", add_one))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_run_persists_completed_run() {
        let engine = engine(pipeline());
        let run = engine.run(RunRequest::new(3)).await.unwrap();
        assert_eq!(run.status, RunStatus::Completed);
        assert_eq!(run.content, Some(Content::from(7)));

        let metrics = run.metrics.clone().unwrap();
        assert_eq!(metrics.total_steps, 2);

        let stored = engine.get_run(&run.run_id).await.unwrap();
        assert_eq!(stored.status, RunStatus::Completed);
        assert_eq!(stored.content, run.content);
    }

    #[tokio::test]
    async fn test_empty_workflow_reports_no_steps() {
        let engine = engine(Workflow::builder("empty").build().unwrap());
        let run = engine.run(RunRequest::default()).await.unwrap();
        assert_eq!(run.content, Some(Content::text("No steps executed")));
    }

    #[tokio::test]
    async fn test_stop_ends_walk() {
        let wf = Workflow::builder("halting")
            .step(Step::function("halt", stopping))
            .step(Step::function("double", double))
            .build()
            .unwrap();
        let run = engine(wf).run(RunRequest::new(1)).await.unwrap();
        assert_eq!(run.outputs().len(), 1);
        assert_eq!(run.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_schema_rejects_before_any_step() {
        let wf = Workflow::builder("typed")
            .input_schema(InputSchema::new("Order").field("qty", FieldType::Integer))
            .step(Step::function("double", double))
            .build()
            .unwrap();
        let engine = engine(wf);
        let err = engine.run(RunRequest::new("not a record")).await.unwrap_err();
        assert!(err.is_validation());
        // Validation happens before a session is chosen
        assert!(engine.session_id().is_none());
    }

    #[tokio::test]
    async fn test_reserved_state_keys_seeded() {
        let wf = Workflow::builder("stateful")
            .step(Step::function("mark", |_i, state: StateHandle| {
                state.set("visited", json!(true));
                Ok(StepReturn::from("ok"))
            }))
            .build()
            .unwrap();
        let engine = engine(wf);
        let run = engine.run(RunRequest::default()).await.unwrap();

        let state = engine.session_state().await.unwrap();
        assert_eq!(state.get("run_id"), Some(&json!(run.run_id)));
        assert_eq!(state.get("workflow_name"), Some(&json!("stateful")));
        assert_eq!(state.get("visited"), Some(&json!(true)));
    }

    #[tokio::test]
    async fn test_state_survives_runs_in_same_session() {
        let wf = Workflow::builder("counter")
            .step(Step::function("count", |_i, state: StateHandle| {
                let n = state.get("count").and_then(|v| v.as_i64()).unwrap_or(0);
                state.set("count", json!(n + 1));
                Ok(StepReturn::from(n + 1))
            }))
            .build()
            .unwrap();
        let engine = engine(wf);
        engine.run(RunRequest::default()).await.unwrap();
        let second = engine.run(RunRequest::default()).await.unwrap();
        assert_eq!(second.content, Some(Content::from(2)));

        engine.new_session();
        let fresh = engine.run(RunRequest::default()).await.unwrap();
        assert_eq!(fresh.content, Some(Content::from(1)));
    }

    #[tokio::test]
    async fn test_custom_failure_fails_run() {
        let wf = Workflow::builder("custom")
            .custom(|_ctx| async {
                Err::<String, _>(FlowlineError::UnitExecution {
                    step: "custom".into(),
                    message: "exploded".into(),
                })
            })
            .build()
            .unwrap();
        let engine = engine(wf);
        let err = engine.run(RunRequest::default()).await.unwrap_err();
        assert!(matches!(err, FlowlineError::WorkflowExecution(_)));

        let session = engine.session_id().unwrap();
        let record = engine.store.get_session(&session).await.unwrap().unwrap();
        let stored = record.latest_run().unwrap();
        assert_eq!(stored.status, RunStatus::Error);
        assert!(stored
            .content_string()
            .unwrap()
            .starts_with("Workflow execution failed: "));
    }

    #[tokio::test]
    async fn test_custom_stream_accumulates() {
        let wf = Workflow::builder("writer")
            .custom_stream(|ctx: WorkflowContext| {
                let topic = ctx.input.input.map(|c| c.render()).unwrap_or_default();
                stream::iter(vec![
                    Ok(UnitChunk::Content("about ".into())),
                    Ok(UnitChunk::Content(topic)),
                ])
            })
            .build()
            .unwrap();
        let engine = engine(wf);
        let events: Vec<_> = engine
            .run_stream(RunRequest::new("rust"))
            .await
            .unwrap()
            .collect()
            .await;

        let chunks = events
            .iter()
            .filter(|e| e.event_type() == "StepContent")
            .count();
        assert_eq!(chunks, 2);
        match &events.last().unwrap().event {
            WorkflowEvent::WorkflowCompleted { status, content } => {
                assert_eq!(*status, RunStatus::Completed);
                assert_eq!(content.as_ref(), Some(&Content::text("about rust")));
            }
            other => panic!("unexpected last event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_session_name_autogenerated() {
        let wf = Workflow::builder("named")
            .description("Summarize the weekly engineering reports for the leadership team")
            .step(Step::function("double", double))
            .build()
            .unwrap();
        let engine = engine(wf);
        assert!(matches!(
            engine.set_session_name(None).await,
            Err(FlowlineError::SessionNotSet)
        ));

        engine.run(RunRequest::new(1)).await.unwrap();
        let name = engine.set_session_name(None).await.unwrap();
        assert!(name.starts_with("Summarize the weekly engineering reports- - "));

        let custom = engine
            .set_session_name(Some("weekly".into()))
            .await
            .unwrap();
        assert_eq!(custom, "weekly");
        let state = engine.session_state().await.unwrap();
        assert_eq!(state.get("session_name"), Some(&json!("weekly")));
    }

    #[tokio::test]
    async fn test_default_session_name() {
        let engine = engine(pipeline());
        engine.new_session();
        let name = engine.set_session_name(None).await.unwrap();
        assert!(name.starts_with("Workflow Session-"));
    }

    #[tokio::test]
    async fn test_delete_session_clears_current() {
        let engine = engine(pipeline());
        engine.run(RunRequest::new(2)).await.unwrap();
        let session = engine.session_id().unwrap();
        assert!(engine.delete_session(&session).await.unwrap());
        assert!(engine.session_id().is_none());
        assert!(!engine.delete_session(&session).await.unwrap());
    }

    #[tokio::test]
    async fn test_get_run_unknown() {
        let engine = engine(pipeline());
        engine.run(RunRequest::new(2)).await.unwrap();
        assert!(matches!(
            engine.get_run("nope").await,
            Err(FlowlineError::RunNotFound(_))
        ));
    }

    #[test]
    fn test_run_blocking() {
        let engine = WorkflowEngine::new(pipeline(), Arc::new(MemoryStore::new()));
        let run = engine.run_blocking(RunRequest::new(10)).unwrap();
        assert_eq!(run.content, Some(Content::from(21)));
    }

    #[tokio::test]
    async fn test_background_stream_requires_handler() {
        let engine = engine(pipeline());
        let result = engine
            .run_background(RunRequest::new(1).background().streaming())
            .await;
        assert!(matches!(result, Err(FlowlineError::BackgroundExecution(_))));
    }
}
