use std::sync::Arc;

use futures::future::BoxFuture;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::event::WorkflowEvent;
use flowline_core::types::{NodeOutput, StepInput};

use crate::context::ExecutionContext;
use crate::node::Node;
use crate::steps::run_sequence;

pub type SelectorFn = Arc<dyn Fn(&StepInput) -> Vec<String> + Send + Sync>;

/// Picks which of its named choices run, at run time.
pub struct Router {
    pub name: String,
    pub description: Option<String>,
    pub choices: Vec<Node>,
    selector: SelectorFn,
}

impl Router {
    pub fn new<F>(name: impl Into<String>, selector: F, choices: Vec<Node>) -> Self
    where
        F: Fn(&StepInput) -> Vec<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: None,
            choices,
            selector: Arc::new(selector),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    fn select(&self, input: &StepInput) -> Result<(Vec<String>, Vec<Node>)> {
        let names = (self.selector)(input);
        let mut selected = Vec::with_capacity(names.len());
        for name in &names {
            let node = self
                .choices
                .iter()
                .find(|choice| choice.name() == name)
                .ok_or_else(|| {
                    FlowlineError::WorkflowExecution(format!(
                        "router '{}' selected unknown step '{}'",
                        self.name, name
                    ))
                })?;
            selected.push(node.clone());
        }
        Ok((names, selected))
    }

    pub fn execute<'a>(
        &'a self,
        input: StepInput,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let (names, selected) = self.select(&input)?;
            ctx.emit_lifecycle(WorkflowEvent::RouterStarted {
                step_name: self.name.clone(),
                selected_steps: names,
            });

            let run = run_sequence(&selected, input, ctx).await?;

            ctx.emit_lifecycle(WorkflowEvent::RouterCompleted {
                step_name: self.name.clone(),
                executed_steps: run.executed,
            });
            Ok(NodeOutput::Sequence(run.outputs))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use flowline_core::types::{Content, SessionId, StepReturn};

    use crate::step::Step;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("run-1", SessionId::from_str("s-1"), "wf", "test")
    }

    #[tokio::test]
    async fn test_runs_selected_in_selector_order() {
        let a_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&a_ran);
        let router = Router::new(
            "pick",
            |_: &StepInput| vec!["B".to_string(), "C".to_string()],
            vec![
                Step::function("A", move |_i, _s| {
                    flag.store(true, Ordering::SeqCst);
                    Ok(StepReturn::from("a"))
                })
                .into(),
                Step::function("C", |input: StepInput, _s| {
                    let prev = input.previous_step_content.map(|c| c.render()).unwrap_or_default();
                    Ok(StepReturn::from(format!("c after {}", prev)))
                })
                .into(),
                Step::function("B", |_i, _s| Ok(StepReturn::from("b"))).into(),
            ],
        );

        let out = router.execute(StepInput::default(), &ctx()).await.unwrap();
        let names: Vec<&str> = out.outputs().into_iter().map(|o| o.step_name.as_str()).collect();
        assert_eq!(names, vec!["B", "C"]);
        assert_eq!(out.last().unwrap().content, Some(Content::text("c after b")));
        assert!(!a_ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_unknown_choice_is_error() {
        let router = Router::new(
            "pick",
            |_: &StepInput| vec!["missing".to_string()],
            vec![Step::function("A", |_i, _s| Ok(StepReturn::from("a"))).into()],
        );
        let (ctx, buffer) = ctx().with_event_buffer();
        let ctx = ctx.with_intermediate_steps(true);
        let err = router.execute(StepInput::default(), &ctx).await.unwrap_err();
        assert!(matches!(err, FlowlineError::WorkflowExecution(_)));
        assert!(buffer.drain().is_empty());
    }

    #[tokio::test]
    async fn test_empty_selection_runs_nothing() {
        let router = Router::new(
            "pick",
            |_: &StepInput| Vec::new(),
            vec![Step::function("A", |_i, _s| Ok(StepReturn::from("a"))).into()],
        );
        let out = router.execute(StepInput::default(), &ctx()).await.unwrap();
        assert!(out.is_empty());
    }
}
