use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::mpsc;
use tracing::warn;

use flowline_core::event::{EventBus, WorkflowEvent, WorkflowRunEvent};
use flowline_core::run::WorkflowRun;
use flowline_core::state::SessionState;
use flowline_core::traits::EventHandler;
use flowline_core::types::SessionId;

/// Stamps events with run identity and a sequence number, then fans them
/// out to the stream receiver, the event bus, a push handler and the
/// stored-event recorder.
pub struct EventDispatcher {
    run_id: String,
    session_id: String,
    workflow_id: String,
    workflow_name: String,
    seq: AtomicU64,
    tx: Option<mpsc::UnboundedSender<WorkflowRunEvent>>,
    bus: Option<Arc<EventBus>>,
    handler: Option<Arc<dyn EventHandler>>,
    recorder: Option<EventRecorder>,
}

struct EventRecorder {
    skip: HashSet<String>,
    events: Mutex<Vec<WorkflowRunEvent>>,
}

impl EventDispatcher {
    pub fn new(run: &WorkflowRun) -> Self {
        Self {
            run_id: run.run_id.clone(),
            session_id: run.session_id.0.clone(),
            workflow_id: run.workflow_id.clone(),
            workflow_name: run.workflow_name.clone(),
            seq: AtomicU64::new(0),
            tx: None,
            bus: None,
            handler: None,
            recorder: None,
        }
    }

    pub fn with_sender(mut self, tx: mpsc::UnboundedSender<WorkflowRunEvent>) -> Self {
        self.tx = Some(tx);
        self
    }

    pub fn with_bus(mut self, bus: Option<Arc<EventBus>>) -> Self {
        self.bus = bus;
        self
    }

    pub fn with_handler(mut self, handler: Option<Arc<dyn EventHandler>>) -> Self {
        self.handler = handler;
        self
    }

    /// Keep a copy of every event whose type is not in `skip`.
    pub fn recording(mut self, skip: &[String]) -> Self {
        self.recorder = Some(EventRecorder {
            skip: skip.iter().cloned().collect(),
            events: Mutex::new(Vec::new()),
        });
        self
    }

    pub fn dispatch(&self, event: WorkflowEvent) {
        let envelope = WorkflowRunEvent {
            seq: self.seq.fetch_add(1, Ordering::SeqCst),
            run_id: self.run_id.clone(),
            session_id: self.session_id.clone(),
            workflow_id: self.workflow_id.clone(),
            workflow_name: self.workflow_name.clone(),
            created_at: Utc::now(),
            event,
        };

        if let Some(recorder) = &self.recorder {
            if !recorder.skip.contains(envelope.event_type()) {
                recorder
                    .events
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .push(envelope.clone());
            }
        }
        if let Some(bus) = &self.bus {
            bus.publish(envelope.clone());
        }
        if let Some(handler) = &self.handler {
            if let Err(e) = handler.handle_event(&envelope) {
                warn!(run_id = %self.run_id, error = %e, "Event handler failed");
            }
        }
        if let Some(tx) = &self.tx {
            // Receiver may have been dropped by a caller that stopped listening
            let _ = tx.send(envelope);
        }
    }

    /// Drain the recorded events.
    pub fn take_recorded(&self) -> Vec<WorkflowRunEvent> {
        match &self.recorder {
            Some(recorder) => std::mem::take(
                &mut *recorder
                    .events
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner()),
            ),
            None => Vec::new(),
        }
    }
}

/// Where a node's events go.
#[derive(Clone)]
pub enum EventSink {
    Dispatch(Arc<EventDispatcher>),
    /// Held back and replayed by the parent, used for parallel branches.
    Buffer(EventBuffer),
}

impl EventSink {
    fn emit(&self, event: WorkflowEvent) {
        match self {
            EventSink::Dispatch(dispatcher) => dispatcher.dispatch(event),
            EventSink::Buffer(buffer) => buffer.push(event),
        }
    }
}

/// Shared list of not-yet-dispatched events.
#[derive(Clone, Default)]
pub struct EventBuffer {
    events: Arc<Mutex<Vec<WorkflowEvent>>>,
}

impl EventBuffer {
    fn push(&self, event: WorkflowEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }

    pub fn drain(&self) -> Vec<WorkflowEvent> {
        std::mem::take(
            &mut *self
                .events
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
        )
    }
}

/// Per-run context threaded through every node.
///
/// Carries identity, the debug flag, the canonical session state and, when
/// streaming, the event sink. Buffered runs have no sink and emit nothing.
#[derive(Clone)]
pub struct ExecutionContext {
    pub run_id: String,
    pub session_id: SessionId,
    pub user_id: Option<String>,
    pub workflow_id: String,
    pub workflow_name: String,
    pub debug: bool,
    /// Emit step and composite lifecycle events, not just content.
    pub stream_intermediate_steps: bool,
    pub state: SessionState,
    sink: Option<EventSink>,
}

impl ExecutionContext {
    pub fn new(
        run_id: impl Into<String>,
        session_id: SessionId,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            session_id,
            user_id: None,
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            debug: false,
            stream_intermediate_steps: false,
            state: SessionState::default(),
            sink: None,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_state(mut self, state: SessionState) -> Self {
        self.state = state;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    pub fn with_intermediate_steps(mut self, enabled: bool) -> Self {
        self.stream_intermediate_steps = enabled;
        self
    }

    pub fn with_sink(mut self, sink: EventSink) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Stream into a local buffer instead of a dispatcher.
    pub fn with_event_buffer(self) -> (Self, EventBuffer) {
        let buffer = EventBuffer::default();
        (self.with_sink(EventSink::Buffer(buffer.clone())), buffer)
    }

    pub fn is_streaming(&self) -> bool {
        self.sink.is_some()
    }

    pub fn emit(&self, event: WorkflowEvent) {
        if let Some(sink) = &self.sink {
            sink.emit(event);
        }
    }

    /// Emit only when intermediate steps are streamed.
    pub fn emit_lifecycle(&self, event: WorkflowEvent) {
        if self.stream_intermediate_steps {
            self.emit(event);
        }
    }

    /// Context for a concurrently running branch: forked state, and events
    /// held in a buffer when the parent streams.
    pub fn branch(&self) -> (ExecutionContext, EventBuffer) {
        let (mut ctx, buffer) = self.hold_events();
        ctx.state = self.state.fork();
        (ctx, buffer)
    }

    /// Same context and state, but events wait in a buffer until the caller
    /// replays or drops them.
    pub fn hold_events(&self) -> (ExecutionContext, EventBuffer) {
        let buffer = EventBuffer::default();
        let mut ctx = self.clone();
        if self.sink.is_some() {
            ctx.sink = Some(EventSink::Buffer(buffer.clone()));
        }
        (ctx, buffer)
    }
}
