pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod ordered;
pub mod run;
pub mod schema;
pub mod state;
pub mod traits;
pub mod types;

pub use config::AppConfig;
pub use error::{FlowlineError, Result};
pub use event::{ChannelHandler, EventBus, WorkflowEvent, WorkflowRunEvent};
pub use metrics::{Metrics, MetricsDetail, StepMetrics, WorkflowMetrics};
pub use ordered::OrderedMap;
pub use run::{RunStatus, SessionRecord, StepSummary, WorkflowRun};
pub use schema::{FieldType, InputSchema};
pub use state::{deep_merge, state_delta, SessionState, StateHandle};
pub use types::*;
