use std::sync::Arc;

use futures::future::BoxFuture;

use flowline_core::error::Result;
use flowline_core::event::WorkflowEvent;
use flowline_core::types::{NodeOutput, StepInput};

use crate::context::ExecutionContext;
use crate::node::Node;
use crate::steps::run_sequence;

pub type ConditionFn = Arc<dyn Fn(&StepInput) -> bool + Send + Sync>;

/// Runs `then` when the predicate holds, `otherwise` when it does not.
pub struct Condition {
    pub name: String,
    pub description: Option<String>,
    pub then: Vec<Node>,
    pub otherwise: Vec<Node>,
    predicate: ConditionFn,
}

impl Condition {
    pub fn new<F>(name: impl Into<String>, predicate: F, then: Vec<Node>) -> Self
    where
        F: Fn(&StepInput) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            then,
            otherwise: Vec::new(),
            predicate: Arc::new(predicate),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn otherwise(mut self, nodes: Vec<Node>) -> Self {
        self.otherwise = nodes;
        self
    }

    pub fn execute<'a>(
        &'a self,
        input: StepInput,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let condition_result = (self.predicate)(&input);
            ctx.emit_lifecycle(WorkflowEvent::ConditionStarted {
                step_name: self.name.clone(),
                condition_result,
            });

            let branch = if condition_result {
                &self.then
            } else {
                &self.otherwise
            };
            let run = run_sequence(branch, input, ctx).await?;

            ctx.emit_lifecycle(WorkflowEvent::ConditionCompleted {
                step_name: self.name.clone(),
                condition_result,
                executed_steps: run.executed,
            });
            Ok(NodeOutput::Sequence(run.outputs))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flowline_core::types::{Content, SessionId, StepReturn};

    use crate::step::Step;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("run-1", SessionId::from_str("s-1"), "wf", "test")
    }

    fn over_ten() -> Condition {
        Condition::new(
            "big?",
            |input: &StepInput| input.input.as_ref().and_then(Content::as_i64).unwrap_or(0) > 10,
            vec![Step::function("large", |_i, _s| Ok(StepReturn::from("large"))).into()],
        )
        .otherwise(vec![
            Step::function("small", |_i, _s| Ok(StepReturn::from("small"))).into(),
        ])
    }

    #[tokio::test]
    async fn test_else_branch_runs() {
        let out = over_ten().execute(StepInput::new(5), &ctx()).await.unwrap();
        assert_eq!(out.len(), 1);
        let only = out.last().unwrap();
        assert_eq!(only.step_name, "small");
        assert_eq!(only.content, Some(Content::text("small")));
    }

    #[tokio::test]
    async fn test_then_branch_runs() {
        let out = over_ten().execute(StepInput::new(50), &ctx()).await.unwrap();
        assert_eq!(out.last().unwrap().step_name, "large");
    }

    #[tokio::test]
    async fn test_false_without_otherwise_runs_nothing() {
        let cond = Condition::new(
            "never",
            |_: &StepInput| false,
            vec![Step::function("x", |_i, _s| Ok(StepReturn::from("x"))).into()],
        );
        let (ctx, buffer) = ctx().with_event_buffer();
        let ctx = ctx.with_intermediate_steps(true);
        let out = cond.execute(StepInput::default(), &ctx).await.unwrap();
        assert!(out.is_empty());

        let events = buffer.drain();
        assert_eq!(
            events,
            vec![
                WorkflowEvent::ConditionStarted {
                    step_name: "never".into(),
                    condition_result: false,
                },
                WorkflowEvent::ConditionCompleted {
                    step_name: "never".into(),
                    condition_result: false,
                    executed_steps: 0,
                },
            ]
        );
    }
}
