use futures::future::BoxFuture;
use tracing::debug;

use flowline_core::error::Result;
use flowline_core::event::WorkflowEvent;
use flowline_core::types::{NodeOutput, StepInput, StepOutput};

use crate::context::ExecutionContext;
use crate::node::Node;

/// Ordered group of nodes sharing one input thread.
pub struct Steps {
    pub name: String,
    pub description: Option<String>,
    pub children: Vec<Node>,
}

impl Steps {
    pub fn new(name: impl Into<String>, children: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            description: None,
            children,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn execute<'a>(
        &'a self,
        input: StepInput,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            ctx.emit_lifecycle(WorkflowEvent::StepsStarted {
                step_name: self.name.clone(),
                steps_count: self.children.len(),
            });

            let run = run_sequence(&self.children, input, ctx).await?;

            ctx.emit_lifecycle(WorkflowEvent::StepsCompleted {
                step_name: self.name.clone(),
                steps_executed: run.executed,
            });
            Ok(NodeOutput::Sequence(run.outputs))
        })
    }
}

/// Outcome of running nodes back to back.
pub(crate) struct SequenceRun {
    pub outputs: Vec<StepOutput>,
    /// Nodes that actually ran.
    pub executed: usize,
    pub stopped: bool,
    /// Input as seen after the last node, for callers that keep threading.
    pub input: StepInput,
}

/// Run `nodes` in order. Every node sees all earlier outputs; a node
/// requesting stop is the last one to run.
pub(crate) async fn run_sequence(
    nodes: &[Node],
    mut input: StepInput,
    ctx: &ExecutionContext,
) -> Result<SequenceRun> {
    let mut outputs = Vec::new();
    let mut executed = 0;
    let mut stopped = false;

    for node in nodes {
        let produced = node.execute(input.clone(), ctx).await?;
        executed += 1;
        stopped = produced.stop_requested();
        for output in produced.into_outputs() {
            input.absorb(&output);
            outputs.push(output);
        }
        if stopped {
            debug!(step = %node.name(), "Stop requested, skipping remaining steps");
            break;
        }
    }

    Ok(SequenceRun {
        outputs,
        executed,
        stopped,
        input,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use flowline_core::types::{Content, SessionId, StepReturn};
    use flowline_test_utils::{add_one, double, stopping};

    use crate::step::Step;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("run-1", SessionId::from_str("s-1"), "wf", "test")
    }

    #[tokio::test]
    async fn test_linear_pipeline() {
        let steps = Steps::new(
            "pipeline",
            vec![
                Step::function("double", double).into(),
                Step::function("add_one", add_one).into(),
            ],
        );
        let out = steps.execute(StepInput::new(3), &ctx()).await.unwrap();
        let outputs = out.outputs();
        assert_eq!(outputs.len(), 2);
        assert_eq!(outputs[0].content, Some(Content::from(6)));
        assert_eq!(out.last().unwrap().content, Some(Content::from(7)));
    }

    #[tokio::test]
    async fn test_later_steps_see_all_earlier_outputs() {
        let reader = Step::function("c", |input: StepInput, _state| {
            let seen: Vec<String> = input
                .previous_step_outputs
                .iter()
                .map(|(name, out)| {
                    format!("{}={}", name, out.content_string().unwrap_or_default())
                })
                .collect();
            Ok(StepReturn::from(seen.join(",")))
        });
        let steps = Steps::new(
            "abc",
            vec![
                Step::function("a", |_i, _s| Ok(StepReturn::from("A"))).into(),
                Step::function("b", |_i, _s| Ok(StepReturn::from("B"))).into(),
                reader.into(),
            ],
        );
        let out = steps.execute(StepInput::default(), &ctx()).await.unwrap();
        let outputs = out.outputs();
        assert_eq!(outputs[0].content, Some(Content::text("A")));
        assert_eq!(out.last().unwrap().content, Some(Content::text("a=A,b=B")));
    }

    #[tokio::test]
    async fn test_stop_skips_rest() {
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let steps = Steps::new(
            "halting",
            vec![
                Step::function("halt", stopping).into(),
                Step::function("never", move |_i, _s| {
                    flag.store(true, Ordering::SeqCst);
                    Ok(StepReturn::from("late"))
                })
                .into(),
            ],
        );
        let out = steps.execute(StepInput::new("go"), &ctx()).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.stop_requested());
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_lifecycle_counts() {
        let steps = Steps::new(
            "halting",
            vec![
                Step::function("halt", stopping).into(),
                Step::function("never", double).into(),
            ],
        );
        let (ctx, buffer) = ctx().with_event_buffer();
        let ctx = ctx.with_intermediate_steps(true);
        steps.execute(StepInput::new(1), &ctx).await.unwrap();

        let events = buffer.drain();
        assert!(matches!(
            events.first(),
            Some(WorkflowEvent::StepsStarted { steps_count: 2, .. })
        ));
        assert!(matches!(
            events.last(),
            Some(WorkflowEvent::StepsCompleted { steps_executed: 1, .. })
        ));
    }
}
