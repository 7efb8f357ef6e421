use std::sync::Arc;

use futures::future::BoxFuture;
use tracing::debug;

use flowline_core::error::Result;
use flowline_core::event::WorkflowEvent;
use flowline_core::types::{NodeOutput, StepInput, StepOutput};

use crate::context::ExecutionContext;
use crate::node::Node;
use crate::steps::run_sequence;

/// Decides after each iteration whether another one should run.
pub type LoopPredicate = Arc<dyn Fn(&[StepOutput]) -> bool + Send + Sync>;

fn default_max_iterations() -> usize {
    3
}

/// Repeats its body until the predicate says stop, a body step requests
/// stop, or `max_iterations` is reached.
pub struct Loop {
    pub name: String,
    pub description: Option<String>,
    pub body: Vec<Node>,
    pub max_iterations: usize,
    continue_while: Option<LoopPredicate>,
}

impl Loop {
    pub fn new(name: impl Into<String>, body: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            description: None,
            body,
            max_iterations: default_max_iterations(),
            continue_while: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = max;
        self
    }

    /// Keep iterating while `predicate` returns true for the outputs of
    /// the iteration that just finished.
    pub fn continue_while<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&[StepOutput]) -> bool + Send + Sync + 'static,
    {
        self.continue_while = Some(Arc::new(predicate));
        self
    }

    pub fn execute<'a>(
        &'a self,
        input: StepInput,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            ctx.emit_lifecycle(WorkflowEvent::LoopStarted {
                step_name: self.name.clone(),
                max_iterations: self.max_iterations,
            });

            let mut current = input;
            let mut iterations: Vec<Vec<StepOutput>> = Vec::new();

            for iteration in 1..=self.max_iterations {
                ctx.emit_lifecycle(WorkflowEvent::LoopIterationStarted {
                    step_name: self.name.clone(),
                    iteration,
                    max_iterations: self.max_iterations,
                });

                let run = run_sequence(&self.body, current, ctx).await?;
                current = run.input;

                let wants_more = self
                    .continue_while
                    .as_ref()
                    .map_or(true, |predicate| predicate(&run.outputs));
                let should_continue =
                    wants_more && !run.stopped && iteration < self.max_iterations;

                ctx.emit_lifecycle(WorkflowEvent::LoopIterationCompleted {
                    step_name: self.name.clone(),
                    iteration,
                    max_iterations: self.max_iterations,
                    should_continue,
                });
                iterations.push(run.outputs);

                if !should_continue {
                    debug!(
                        step = %self.name,
                        iteration,
                        stopped = run.stopped,
                        "Loop finished"
                    );
                    break;
                }
            }

            ctx.emit_lifecycle(WorkflowEvent::LoopCompleted {
                step_name: self.name.clone(),
                total_iterations: iterations.len(),
                max_iterations: self.max_iterations,
            });
            Ok(NodeOutput::Iterations(iterations))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use flowline_core::types::{Content, SessionId, StepReturn};
    use flowline_test_utils::{add_one, stopping};

    use crate::step::Step;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("run-1", SessionId::from_str("s-1"), "wf", "test")
    }

    #[tokio::test]
    async fn test_always_true_predicate_hits_cap() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let body = Step::function("tick", move |_i, _s| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(StepReturn::from("tick"))
        });
        let looped = Loop::new("forever", vec![body.into()])
            .with_max_iterations(5)
            .continue_while(|_| true);

        let out = looped.execute(StepInput::default(), &ctx()).await.unwrap();
        match out {
            NodeOutput::Iterations(iters) => assert_eq!(iters.len(), 5),
            other => panic!("expected iterations, got {:?}", other),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_predicate_ends_loop() {
        let looped = Loop::new("count", vec![Step::function("inc", add_one).into()])
            .with_max_iterations(10)
            .continue_while(|outputs| {
                outputs
                    .last()
                    .and_then(|o| o.content.as_ref())
                    .and_then(Content::as_i64)
                    .map_or(false, |n| n < 3)
            });

        let out = looped.execute(StepInput::new(0), &ctx()).await.unwrap();
        // 0 -> 1 -> 2 -> 3, each iteration threading the previous content
        assert_eq!(out.len(), 3);
        assert_eq!(out.last().unwrap().content, Some(Content::from(3)));
    }

    #[tokio::test]
    async fn test_stop_in_body_ends_loop() {
        let looped = Loop::new("halting", vec![Step::function("halt", stopping).into()])
            .with_max_iterations(4);
        let out = looped.execute(StepInput::new("x"), &ctx()).await.unwrap();
        assert_eq!(out.len(), 1);
        assert!(out.stop_requested());
    }

    #[tokio::test]
    async fn test_iteration_events() {
        let looped = Loop::new("twice", vec![Step::function("inc", add_one).into()])
            .with_max_iterations(2);
        let (ctx, buffer) = ctx().with_event_buffer();
        let ctx = ctx.with_intermediate_steps(true);
        looped.execute(StepInput::new(0), &ctx).await.unwrap();

        let iterations: Vec<(usize, usize)> = buffer
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                WorkflowEvent::LoopIterationStarted {
                    iteration,
                    max_iterations,
                    ..
                } => Some((iteration, max_iterations)),
                _ => None,
            })
            .collect();
        assert_eq!(iterations, vec![(1, 2), (2, 2)]);
    }
}
