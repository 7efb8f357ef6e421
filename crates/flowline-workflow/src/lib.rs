pub mod condition;
pub mod context;
pub mod engine;
pub mod looping;
pub mod node;
pub mod parallel;
pub mod router;
pub mod step;
pub mod steps;
pub mod workflow;

pub use condition::Condition;
pub use context::{EventBuffer, EventDispatcher, EventSink, ExecutionContext};
pub use engine::{BackgroundRun, RunOutcome, RunRequest, WorkflowEngine, WorkflowEventStream};
pub use looping::Loop;
pub use node::Node;
pub use parallel::Parallel;
pub use router::Router;
pub use step::{ExecutionUnit, Step, StepFunction};
pub use steps::Steps;
pub use workflow::{CustomOutput, Workflow, WorkflowBuilder, WorkflowContext, WorkflowSteps};
