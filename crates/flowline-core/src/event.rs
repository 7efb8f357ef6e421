use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{FlowlineError, Result};
use crate::run::RunStatus;
use crate::traits::EventHandler;
use crate::types::{Content, StepOutput};

/// Lifecycle and content events emitted while a workflow streams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WorkflowEvent {
    WorkflowStarted,
    WorkflowCompleted {
        status: RunStatus,
        #[serde(default)]
        content: Option<Content>,
    },
    WorkflowError {
        error: String,
    },

    StepStarted {
        step_name: String,
    },
    StepCompleted {
        step_name: String,
        success: bool,
        #[serde(default)]
        content: Option<Content>,
    },
    /// Incremental content produced by a unit.
    StepContent {
        step_name: String,
        content: String,
    },
    /// A finished top-level output.
    StepOutput {
        output: Box<StepOutput>,
    },

    StepsStarted {
        step_name: String,
        steps_count: usize,
    },
    StepsCompleted {
        step_name: String,
        steps_executed: usize,
    },

    LoopStarted {
        step_name: String,
        max_iterations: usize,
    },
    LoopIterationStarted {
        step_name: String,
        iteration: usize,
        max_iterations: usize,
    },
    LoopIterationCompleted {
        step_name: String,
        iteration: usize,
        max_iterations: usize,
        should_continue: bool,
    },
    LoopCompleted {
        step_name: String,
        total_iterations: usize,
        max_iterations: usize,
    },

    ParallelStarted {
        step_name: String,
        parallel_step_count: usize,
    },
    ParallelCompleted {
        step_name: String,
        parallel_step_count: usize,
        successful: usize,
    },

    ConditionStarted {
        step_name: String,
        condition_result: bool,
    },
    ConditionCompleted {
        step_name: String,
        condition_result: bool,
        executed_steps: usize,
    },

    RouterStarted {
        step_name: String,
        selected_steps: Vec<String>,
    },
    RouterCompleted {
        step_name: String,
        executed_steps: usize,
    },

    /// Opaque event forwarded from an agent or team.
    ExecutorEvent {
        step_name: String,
        executor_name: String,
        payload: serde_json::Value,
    },
}

impl WorkflowEvent {
    /// Stable name, as used by `events_to_skip`.
    pub fn event_type(&self) -> &'static str {
        match self {
            WorkflowEvent::WorkflowStarted => "WorkflowStarted",
            WorkflowEvent::WorkflowCompleted { .. } => "WorkflowCompleted",
            WorkflowEvent::WorkflowError { .. } => "WorkflowError",
            WorkflowEvent::StepStarted { .. } => "StepStarted",
            WorkflowEvent::StepCompleted { .. } => "StepCompleted",
            WorkflowEvent::StepContent { .. } => "StepContent",
            WorkflowEvent::StepOutput { .. } => "StepOutput",
            WorkflowEvent::StepsStarted { .. } => "StepsStarted",
            WorkflowEvent::StepsCompleted { .. } => "StepsCompleted",
            WorkflowEvent::LoopStarted { .. } => "LoopStarted",
            WorkflowEvent::LoopIterationStarted { .. } => "LoopIterationStarted",
            WorkflowEvent::LoopIterationCompleted { .. } => "LoopIterationCompleted",
            WorkflowEvent::LoopCompleted { .. } => "LoopCompleted",
            WorkflowEvent::ParallelStarted { .. } => "ParallelStarted",
            WorkflowEvent::ParallelCompleted { .. } => "ParallelCompleted",
            WorkflowEvent::ConditionStarted { .. } => "ConditionStarted",
            WorkflowEvent::ConditionCompleted { .. } => "ConditionCompleted",
            WorkflowEvent::RouterStarted { .. } => "RouterStarted",
            WorkflowEvent::RouterCompleted { .. } => "RouterCompleted",
            WorkflowEvent::ExecutorEvent { .. } => "ExecutorEvent",
        }
    }

    /// Name of the step the event belongs to, if any.
    pub fn step_name(&self) -> Option<&str> {
        match self {
            WorkflowEvent::WorkflowStarted
            | WorkflowEvent::WorkflowCompleted { .. }
            | WorkflowEvent::WorkflowError { .. } => None,
            WorkflowEvent::StepOutput { output } => Some(&output.step_name),
            WorkflowEvent::StepStarted { step_name }
            | WorkflowEvent::StepCompleted { step_name, .. }
            | WorkflowEvent::StepContent { step_name, .. }
            | WorkflowEvent::StepsStarted { step_name, .. }
            | WorkflowEvent::StepsCompleted { step_name, .. }
            | WorkflowEvent::LoopStarted { step_name, .. }
            | WorkflowEvent::LoopIterationStarted { step_name, .. }
            | WorkflowEvent::LoopIterationCompleted { step_name, .. }
            | WorkflowEvent::LoopCompleted { step_name, .. }
            | WorkflowEvent::ParallelStarted { step_name, .. }
            | WorkflowEvent::ParallelCompleted { step_name, .. }
            | WorkflowEvent::ConditionStarted { step_name, .. }
            | WorkflowEvent::ConditionCompleted { step_name, .. }
            | WorkflowEvent::RouterStarted { step_name, .. }
            | WorkflowEvent::RouterCompleted { step_name, .. }
            | WorkflowEvent::ExecutorEvent { step_name, .. } => Some(step_name),
        }
    }
}

/// An event plus the identity of the run that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRunEvent {
    /// Position in the run's event sequence, starting at 0.
    pub seq: u64,
    pub run_id: String,
    pub session_id: String,
    pub workflow_id: String,
    pub workflow_name: String,
    pub created_at: DateTime<Utc>,
    pub event: WorkflowEvent,
}

impl WorkflowRunEvent {
    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<WorkflowRunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: WorkflowRunEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<WorkflowRunEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

impl EventHandler for EventBus {
    fn handle_event(&self, event: &WorkflowRunEvent) -> Result<()> {
        self.publish(event.clone());
        Ok(())
    }
}

/// Push handler that forwards events into an mpsc channel, e.g. to a
/// websocket writer task.
pub struct ChannelHandler {
    tx: mpsc::UnboundedSender<WorkflowRunEvent>,
}

impl ChannelHandler {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkflowRunEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventHandler for ChannelHandler {
    fn handle_event(&self, event: &WorkflowRunEvent) -> Result<()> {
        self.tx
            .send(event.clone())
            .map_err(|_| FlowlineError::EventHandler("receiver dropped".into()))
    }
}
