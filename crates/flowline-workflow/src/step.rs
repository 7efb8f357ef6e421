use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use tracing::{debug, error, warn};
use uuid::Uuid;

use flowline_core::error::Result;
use flowline_core::event::WorkflowEvent;
use flowline_core::metrics::Metrics;
use flowline_core::state::StateHandle;
use flowline_core::traits::{Executor, ExecutorChunk, ExecutorRequest, ExecutorResponse};
use flowline_core::types::{
    Content, ExecutorKind, NodeOutput, StepInput, StepOutput, StepReturn, UnitChunk,
};

use crate::context::ExecutionContext;

pub type StepFuture = BoxFuture<'static, Result<StepReturn>>;
pub type ValueFn = Arc<dyn Fn(StepInput, StateHandle) -> StepFuture + Send + Sync>;
pub type StreamFn =
    Arc<dyn Fn(StepInput, StateHandle) -> BoxStream<'static, Result<UnitChunk>> + Send + Sync>;

/// A user-supplied function, either returning once or yielding chunks.
#[derive(Clone)]
pub enum StepFunction {
    Value(ValueFn),
    Stream(StreamFn),
}

/// The single thing a [`Step`] runs.
#[derive(Clone)]
pub enum ExecutionUnit {
    Function(StepFunction),
    Agent(Arc<dyn Executor>),
    Team(Arc<dyn Executor>),
}

/// Atomic node wrapping exactly one execution unit.
pub struct Step {
    pub name: String,
    pub step_id: String,
    pub description: Option<String>,
    /// Extra attempts after a failed invocation.
    pub max_retries: u32,
    unit: ExecutionUnit,
}

impl Step {
    pub fn new(name: impl Into<String>, unit: ExecutionUnit) -> Self {
        Self {
            name: name.into(),
            step_id: Uuid::new_v4().to_string(),
            description: None,
            max_retries: 0,
            unit,
        }
    }

    /// Wrap a synchronous function.
    pub fn function<F, R>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInput, StateHandle) -> Result<R> + Send + Sync + 'static,
        R: Into<StepReturn>,
    {
        let f = Arc::new(f);
        let value: ValueFn = Arc::new(move |input: StepInput, state: StateHandle| -> StepFuture {
            let f = Arc::clone(&f);
            Box::pin(async move { f(input, state).map(Into::into) })
        });
        Self::new(name, ExecutionUnit::Function(StepFunction::Value(value)))
    }

    /// Wrap an async function.
    pub fn async_function<F, Fut, R>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInput, StateHandle) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R>> + Send + 'static,
        R: Into<StepReturn> + 'static,
    {
        let value: ValueFn = Arc::new(move |input: StepInput, state: StateHandle| -> StepFuture {
            let fut = f(input, state);
            Box::pin(async move { fut.await.map(Into::into) })
        });
        Self::new(name, ExecutionUnit::Function(StepFunction::Value(value)))
    }

    /// Wrap a function that yields content chunks, events or a final output.
    pub fn stream_function<F, S>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(StepInput, StateHandle) -> S + Send + Sync + 'static,
        S: Stream<Item = Result<UnitChunk>> + Send + 'static,
    {
        let stream: StreamFn = Arc::new(
            move |input: StepInput, state: StateHandle| -> BoxStream<'static, Result<UnitChunk>> {
                Box::pin(f(input, state))
            },
        );
        Self::new(name, ExecutionUnit::Function(StepFunction::Stream(stream)))
    }

    pub fn agent(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self::new(name, ExecutionUnit::Agent(executor))
    }

    pub fn team(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        Self::new(name, ExecutionUnit::Team(executor))
    }

    /// Wrap an executor, classified by its own `kind()`.
    pub fn executor(name: impl Into<String>, executor: Arc<dyn Executor>) -> Self {
        match executor.kind() {
            ExecutorKind::Team => Self::team(name, executor),
            _ => Self::agent(name, executor),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Retry a failed attempt up to `retries` more times. When retries are
    /// on, streamed chunks are held until an attempt succeeds, and chunks from
    /// failed attempts are dropped.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_step_id(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = step_id.into();
        self
    }

    pub fn executor_kind(&self) -> ExecutorKind {
        match &self.unit {
            ExecutionUnit::Function(_) => ExecutorKind::Function,
            ExecutionUnit::Agent(_) => ExecutorKind::Agent,
            ExecutionUnit::Team(_) => ExecutorKind::Team,
        }
    }

    fn executor_name(&self) -> String {
        match &self.unit {
            ExecutionUnit::Function(_) => self.name.clone(),
            ExecutionUnit::Agent(e) | ExecutionUnit::Team(e) => e.name().to_string(),
        }
    }

    pub fn execute<'a>(
        &'a self,
        input: StepInput,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            ctx.emit_lifecycle(WorkflowEvent::StepStarted {
                step_name: self.name.clone(),
            });
            if ctx.debug {
                debug!(step = %self.name, kind = %self.executor_kind(), "Executing step");
            }

            let started = Instant::now();
            let mut attempt = 0;
            let output = loop {
                let handle = ctx.state.handle();
                let held = (self.max_retries > 0).then(|| ctx.hold_events());
                let attempt_ctx = held.as_ref().map_or(ctx, |(held_ctx, _)| held_ctx);
                match self.invoke(input.clone(), handle.clone(), attempt_ctx).await {
                    Ok(output) => {
                        ctx.state.apply(&handle);
                        if let Some((_, buffer)) = &held {
                            for event in buffer.drain() {
                                ctx.emit(event);
                            }
                        }
                        break output;
                    }
                    Err(message) if attempt < self.max_retries => {
                        attempt += 1;
                        warn!(step = %self.name, attempt, error = %message, "Step failed, retrying");
                    }
                    Err(message) => {
                        error!(step = %self.name, error = %message, "Step failed");
                        break self.blank_output().with_error(message);
                    }
                }
            };
            let output = self.finish(output, started.elapsed().as_secs_f64());

            if ctx.debug {
                debug!(
                    step = %self.name,
                    success = output.success,
                    stop = output.stop,
                    "Step complete"
                );
            }
            ctx.emit_lifecycle(WorkflowEvent::StepCompleted {
                step_name: self.name.clone(),
                success: output.success,
                content: output.content.clone(),
            });
            Ok(NodeOutput::Single(output))
        })
    }

    /// One attempt. Errors and panics both come back as a message.
    async fn invoke(
        &self,
        input: StepInput,
        handle: StateHandle,
        ctx: &ExecutionContext,
    ) -> std::result::Result<StepOutput, String> {
        match AssertUnwindSafe(self.run_unit(input, handle, ctx))
            .catch_unwind()
            .await
        {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(panic_message(panic)),
        }
    }

    async fn run_unit(
        &self,
        input: StepInput,
        handle: StateHandle,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput> {
        match &self.unit {
            ExecutionUnit::Function(StepFunction::Value(f)) => {
                let returned = f(input, handle).await?;
                Ok(match returned {
                    StepReturn::Output(output) => output,
                    StepReturn::Content(content) => self.blank_output().with_content(content),
                })
            }
            ExecutionUnit::Function(StepFunction::Stream(f)) => {
                let mut stream = f(input, handle);
                let mut buffer = String::new();
                let mut produced = None;
                while let Some(chunk) = stream.next().await {
                    match chunk? {
                        UnitChunk::Content(text) => {
                            ctx.emit(WorkflowEvent::StepContent {
                                step_name: self.name.clone(),
                                content: text.clone(),
                            });
                            buffer.push_str(&text);
                        }
                        UnitChunk::Event(event) => ctx.emit(event),
                        UnitChunk::Output(output) => produced = Some(output),
                    }
                }
                Ok(match produced {
                    Some(output) => output,
                    None if buffer.is_empty() => self.blank_output(),
                    None => self.blank_output().with_content(Content::Text(buffer)),
                })
            }
            ExecutionUnit::Agent(executor) | ExecutionUnit::Team(executor) => {
                self.run_executor(executor, input, handle, ctx).await
            }
        }
    }

    async fn run_executor(
        &self,
        executor: &Arc<dyn Executor>,
        input: StepInput,
        handle: StateHandle,
        ctx: &ExecutionContext,
    ) -> Result<StepOutput> {
        let request = ExecutorRequest {
            message: render_message(&input),
            step_name: self.name.clone(),
            run_id: ctx.run_id.clone(),
            session_id: ctx.session_id.clone(),
            user_id: ctx.user_id.clone(),
            media: input.media.clone(),
            additional_data: input.additional_data.clone(),
            session_state: handle.snapshot(),
            stream: ctx.is_streaming(),
        };

        let response = if ctx.is_streaming() {
            let mut stream = executor.run_stream(request).await?;
            let mut buffer = String::new();
            let mut completed: Option<ExecutorResponse> = None;
            while let Some(chunk) = stream.next().await {
                match chunk? {
                    ExecutorChunk::Content(text) => {
                        ctx.emit(WorkflowEvent::StepContent {
                            step_name: self.name.clone(),
                            content: text.clone(),
                        });
                        buffer.push_str(&text);
                    }
                    ExecutorChunk::Event(payload) => ctx.emit(WorkflowEvent::ExecutorEvent {
                        step_name: self.name.clone(),
                        executor_name: executor.name().to_string(),
                        payload,
                    }),
                    ExecutorChunk::Completed(response) => completed = Some(response),
                }
            }
            let mut response = completed.unwrap_or_default();
            if response.content.is_none() && !buffer.is_empty() {
                response.content = Some(Content::Text(buffer));
            }
            response
        } else {
            executor.run(request).await?
        };

        if let Some(state) = &response.session_state {
            handle.merge(state);
        }

        let mut output = self.blank_output().with_media(response.media);
        output.content = response.content;
        output.metrics = response.metrics;
        output.stop = response.stop;
        Ok(output)
    }

    fn blank_output(&self) -> StepOutput {
        StepOutput::new(self.name.clone(), self.executor_kind())
    }

    /// Stamp identity onto whatever the unit produced.
    fn finish(&self, mut output: StepOutput, elapsed_secs: f64) -> StepOutput {
        output.step_name = self.name.clone();
        output.step_id = self.step_id.clone();
        output.executor_kind = self.executor_kind();
        output.executor_name = Some(self.executor_name());
        output.parallel_outputs = None;
        if output.metrics.is_none() {
            output.metrics = Some(Metrics::with_duration(elapsed_secs));
        }
        output
    }
}

/// Message sent to agents and teams.
fn render_message(input: &StepInput) -> String {
    let message = input.input_as_string().unwrap_or_default();
    match &input.previous_step_content {
        Some(previous) => format!(
            "Previous step output:\n---\n{}\n---\n\n{}",
            previous.render(),
            message
        ),
        None => message,
    }
}

pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", s)
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {}", s)
    } else {
        "panicked".to_string()
    }
}
