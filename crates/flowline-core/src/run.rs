use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::event::WorkflowRunEvent;
use crate::metrics::WorkflowMetrics;
use crate::types::{Content, ExecutorKind, MediaSet, NodeOutput, SessionId, StepOutput};

/// Lifecycle of a run. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Error,
}

impl RunStatus {
    fn rank(self) -> u8 {
        match self {
            RunStatus::Pending => 0,
            RunStatus::Running => 1,
            RunStatus::Completed | RunStatus::Error => 2,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 2
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        next.rank() > self.rank()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything recorded about one invocation of a workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: String,
    pub session_id: SessionId,
    pub workflow_id: String,
    pub workflow_name: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub status: RunStatus,
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub step_results: Vec<NodeOutput>,
    #[serde(default)]
    pub metrics: Option<WorkflowMetrics>,
    #[serde(default)]
    pub media: MediaSet,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub events: Vec<WorkflowRunEvent>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn new(
        run_id: impl Into<String>,
        session_id: SessionId,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            run_id: run_id.into(),
            session_id,
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            user_id: None,
            status: RunStatus::Pending,
            content: None,
            step_results: vec![],
            metrics: None,
            media: MediaSet::default(),
            events: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    /// Advance the status. Backward transitions are ignored.
    pub fn set_status(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(run_id = %self.run_id, from = %self.status, to = %next, "Ignoring backward status transition");
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    /// Every step output in execution order.
    pub fn outputs(&self) -> Vec<&StepOutput> {
        self.step_results.iter().flat_map(NodeOutput::outputs).collect()
    }

    pub fn content_string(&self) -> Option<String> {
        self.content.as_ref().map(Content::render)
    }
}

/// Static description of a top-level node, stored alongside the session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSummary {
    pub name: String,
    #[serde(rename = "step_type")]
    pub kind: ExecutorKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Durable record of one workflow session and its runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub session_id: SessionId,
    #[serde(default)]
    pub user_id: Option<String>,
    pub workflow_id: String,
    pub workflow_name: String,
    #[serde(default)]
    pub session_name: Option<String>,
    #[serde(default)]
    pub session_state: Map<String, Value>,
    #[serde(default)]
    pub workflow_data: Vec<StepSummary>,
    #[serde(default)]
    pub runs: Vec<WorkflowRun>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn new(
        session_id: SessionId,
        workflow_id: impl Into<String>,
        workflow_name: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            session_id,
            user_id: None,
            workflow_id: workflow_id.into(),
            workflow_name: workflow_name.into(),
            session_name: None,
            session_state: Map::new(),
            workflow_data: vec![],
            runs: vec![],
            created_at: now,
            updated_at: now,
        }
    }

    /// Replace the run with the same id, or append it.
    pub fn upsert_run(&mut self, run: WorkflowRun) {
        match self.runs.iter_mut().find(|r| r.run_id == run.run_id) {
            Some(existing) => *existing = run,
            None => self.runs.push(run),
        }
        self.updated_at = Utc::now();
    }

    pub fn get_run(&self, run_id: &str) -> Option<&WorkflowRun> {
        self.runs.iter().find(|r| r.run_id == run_id)
    }

    pub fn latest_run(&self) -> Option<&WorkflowRun> {
        self.runs.last()
    }
}
