use futures::future::{join_all, BoxFuture};
use tracing::{debug, warn};

use flowline_core::error::Result;
use flowline_core::event::WorkflowEvent;
use flowline_core::metrics::{Metrics, StepMetrics};
use flowline_core::ordered::OrderedMap;
use flowline_core::state::state_delta;
use flowline_core::types::{Content, ExecutorKind, MediaSet, NodeOutput, StepInput, StepOutput};

use crate::context::ExecutionContext;
use crate::node::Node;
use crate::step::panic_message;

/// Fan-out over branches that all see the same input.
///
/// Each branch runs on its own tokio task with a forked copy of session
/// state. Results, state and buffered events are folded back in launch
/// order once every branch has finished.
pub struct Parallel {
    pub name: String,
    pub description: Option<String>,
    pub branches: Vec<Node>,
    /// Mark the parallel output failed when any branch failed.
    pub propagate_failures: bool,
}

impl Parallel {
    pub fn new(name: impl Into<String>, branches: Vec<Node>) -> Self {
        Self {
            name: name.into(),
            description: None,
            branches,
            propagate_failures: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn propagate_failures(mut self, enabled: bool) -> Self {
        self.propagate_failures = enabled;
        self
    }

    pub fn execute<'a>(
        &'a self,
        input: StepInput,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        Box::pin(async move {
            let count = self.branches.len();
            ctx.emit_lifecycle(WorkflowEvent::ParallelStarted {
                step_name: self.name.clone(),
                parallel_step_count: count,
            });

            let base = ctx.state.snapshot();
            let mut pending = Vec::with_capacity(count);
            for node in &self.branches {
                let (branch_ctx, buffer) = ctx.branch();
                let node = node.clone();
                let branch_input = input.clone();
                let handle = tokio::spawn(async move {
                    let result = node.execute(branch_input, &branch_ctx).await;
                    (result, branch_ctx.state.snapshot())
                });
                pending.push((handle, buffer));
            }

            let joined = join_all(pending.into_iter().map(|(handle, buffer)| async move {
                (handle.await, buffer)
            }))
            .await;

            let mut results: OrderedMap<StepOutput> = OrderedMap::new();
            for (node, (joined, buffer)) in self.branches.iter().zip(joined) {
                for event in buffer.drain() {
                    ctx.emit(event);
                }
                let output = match joined {
                    Ok((Ok(produced), state)) => {
                        ctx.state.merge(&state_delta(&base, &state));
                        summarize(node, produced)
                    }
                    Ok((Err(e), _)) => {
                        warn!(step = %self.name, branch = %node.name(), error = %e, "Parallel branch failed");
                        failed_branch(node, e.to_string())
                    }
                    Err(join_error) => {
                        let message = if join_error.is_panic() {
                            panic_message(join_error.into_panic())
                        } else {
                            join_error.to_string()
                        };
                        warn!(step = %self.name, branch = %node.name(), error = %message, "Parallel branch aborted");
                        failed_branch(node, message)
                    }
                };
                results.insert(node.name().to_string(), output);
            }

            let output = self.combine(results);
            let successful = output
                .parallel_outputs
                .as_ref()
                .map_or(0, |branches| branches.values().filter(|o| o.success).count());
            debug!(step = %self.name, branches = count, successful, "Parallel complete");

            ctx.emit_lifecycle(WorkflowEvent::ParallelCompleted {
                step_name: self.name.clone(),
                parallel_step_count: count,
                successful,
            });
            Ok(NodeOutput::Single(output))
        })
    }

    fn combine(&self, branches: OrderedMap<StepOutput>) -> StepOutput {
        let mut media = MediaSet::default();
        let mut sections = Vec::new();
        let mut stop = false;
        let mut failures = Vec::new();

        for (name, out) in branches.iter() {
            media.extend(&out.media);
            stop |= out.stop;
            if let Some(content) = &out.content {
                sections.push(format!("=== {} ===\n{}", name, content.render()));
            }
            if !out.success {
                failures.push(format!(
                    "{}: {}",
                    name,
                    out.error.as_deref().unwrap_or("failed")
                ));
            }
        }

        let mut output = StepOutput::new(self.name.clone(), ExecutorKind::Parallel)
            .with_executor_name(self.name.clone())
            .with_media(media)
            .with_parallel_outputs(branches);
        if !sections.is_empty() {
            output.content = Some(Content::Text(sections.join("\n\n")));
        }
        output.stop = stop;
        if self.propagate_failures && !failures.is_empty() {
            output = output.with_error(failures.join("; "));
        }
        output
    }
}

/// One entry per branch. Single outputs, nested parallels included, are kept
/// whole; sequences and loops collapse into a summary.
fn summarize(node: &Node, produced: NodeOutput) -> StepOutput {
    let outputs = match produced {
        NodeOutput::Single(output) => return output,
        other => other.into_outputs(),
    };
    let mut summary = StepOutput::new(node.name().to_string(), node.kind())
        .with_executor_name(node.name().to_string());
    let mut media = MediaSet::default();
    let mut metrics = Metrics::default();
    let mut has_metrics = false;
    for out in &outputs {
        media.extend(&out.media);
        let counted = StepMetrics::from_output(out);
        if out.metrics.is_some() || counted.branches().is_some() {
            metrics.add(&counted.total());
            has_metrics = true;
        }
        summary.stop |= out.stop;
        if !out.success && summary.success {
            summary.success = false;
            summary.error = out.error.clone();
        }
    }
    summary.content = outputs.last().and_then(|o| o.content.clone());
    summary.media = media;
    if has_metrics {
        summary.metrics = Some(metrics);
    }
    summary
}

fn failed_branch(node: &Node, message: String) -> StepOutput {
    StepOutput::new(node.name().to_string(), node.kind())
        .with_executor_name(node.name().to_string())
        .with_error(message)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    use flowline_core::error::FlowlineError;
    use flowline_core::state::StateHandle;
    use flowline_core::types::{MediaArtifact, SessionId, StepReturn};
    use flowline_test_utils::{add_one, double};

    use crate::step::Step;
    use crate::steps::Steps;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new("run-1", SessionId::from_str("s-1"), "wf", "test")
    }

    fn single(out: NodeOutput) -> StepOutput {
        match out {
            NodeOutput::Single(o) => o,
            other => panic!("expected single output, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_failed_branch_is_isolated() {
        let parallel = Parallel::new(
            "fan",
            vec![
                Step::function("a", |_i, _s| Ok(StepReturn::from("A"))).into(),
                Step::function("b", |_i, _s| -> Result<StepReturn> {
                    Err(FlowlineError::WorkflowExecution("b broke".into()))
                })
                .into(),
                Step::function("c", |_i, _s| Ok(StepReturn::from("C"))).into(),
            ],
        );

        let out = single(parallel.execute(StepInput::default(), &ctx()).await.unwrap());
        assert!(out.success);
        assert_eq!(out.executor_kind, ExecutorKind::Parallel);

        let branches = out.parallel_outputs.unwrap();
        assert_eq!(branches.keys().collect::<Vec<_>>(), vec!["a", "b", "c"]);
        assert!(branches.get("a").unwrap().success);
        assert!(branches.get("c").unwrap().success);
        let b = branches.get("b").unwrap();
        assert!(!b.success);
        assert!(b.error.as_deref().unwrap().contains("b broke"));
    }

    #[tokio::test]
    async fn test_propagate_failures_marks_parent() {
        let parallel = Parallel::new(
            "fan",
            vec![
                Step::function("ok", |_i, _s| Ok(StepReturn::from("fine"))).into(),
                Step::function("boom", |_i, _s| -> Result<StepReturn> { panic!("exploded") })
                    .into(),
            ],
        )
        .propagate_failures(true);

        let out = single(parallel.execute(StepInput::default(), &ctx()).await.unwrap());
        assert!(!out.success);
        assert_eq!(out.error.as_deref(), Some("boom: panicked: exploded"));
    }

    #[tokio::test]
    async fn test_branches_share_input_not_outputs() {
        let parallel = Parallel::new(
            "fan",
            vec![
                Step::function("double", double).into(),
                Step::function("add_one", add_one).into(),
            ],
        );
        let out = single(parallel.execute(StepInput::new(5), &ctx()).await.unwrap());
        let branches = out.parallel_outputs.clone().unwrap();
        assert_eq!(branches.get("double").unwrap().content, Some(Content::from(10)));
        assert_eq!(branches.get("add_one").unwrap().content, Some(Content::from(6)));
        assert_eq!(
            out.content,
            Some(Content::text("=== double ===\n10\n\n=== add_one ===\n6"))
        );
    }

    #[tokio::test]
    async fn test_state_and_media_union() {
        let parallel = Parallel::new(
            "fan",
            vec![
                Step::function("left", |_i, state: StateHandle| {
                    state.set("left", json!(1));
                    Ok(StepOutput::from_content("L").with_media(MediaSet {
                        images: vec![MediaArtifact::from_url("http://img/l.png")],
                        ..Default::default()
                    }))
                })
                .into(),
                Step::function("right", |_i, state: StateHandle| {
                    state.set("right", json!(2));
                    Ok(StepOutput::from_content("R").with_media(MediaSet {
                        images: vec![MediaArtifact::from_url("http://img/r.png")],
                        ..Default::default()
                    }))
                })
                .into(),
            ],
        );
        let ctx = ctx();
        ctx.state.insert("shared", json!("kept"));
        let out = single(parallel.execute(StepInput::default(), &ctx).await.unwrap());

        assert_eq!(out.media.images.len(), 2);
        assert_eq!(ctx.state.get("left"), Some(json!(1)));
        assert_eq!(ctx.state.get("right"), Some(json!(2)));
        assert_eq!(ctx.state.get("shared"), Some(json!("kept")));
    }

    #[tokio::test]
    async fn test_composite_branch_summarized() {
        let parallel = Parallel::new(
            "fan",
            vec![
                Steps::new(
                    "chain",
                    vec![
                        Step::function("double", double).into(),
                        Step::function("add_one", add_one).into(),
                    ],
                )
                .into(),
                Step::function("solo", |_i, _s| Ok(StepReturn::from("S"))).into(),
            ],
        );
        let out = single(parallel.execute(StepInput::new(2), &ctx()).await.unwrap());
        let chain = out.parallel_outputs.unwrap().get("chain").cloned().unwrap();
        assert_eq!(chain.executor_kind, ExecutorKind::Steps);
        assert_eq!(chain.content, Some(Content::from(5)));
        assert!(chain.success);
    }

    fn costed(name: &str, tokens: u64) -> Node {
        Step::function(name, move |_i, _s| {
            Ok(StepOutput::from_content(tokens as i64).with_metrics(Metrics {
                input_tokens: tokens,
                ..Default::default()
            }))
        })
        .into()
    }

    #[tokio::test]
    async fn test_nested_parallel_keeps_branches_and_metrics() {
        let inner = Parallel::new("inner", vec![costed("a", 3), costed("b", 5)]);
        let outer = Parallel::new("outer", vec![inner.into(), costed("c", 7)]);

        let out = single(outer.execute(StepInput::default(), &ctx()).await.unwrap());
        let branches = out.parallel_outputs.clone().unwrap();
        let inner = branches.get("inner").unwrap();
        assert_eq!(inner.executor_kind, ExecutorKind::Parallel);
        let nested = inner.parallel_outputs.as_ref().unwrap();
        assert_eq!(nested.keys().collect::<Vec<_>>(), vec!["a", "b"]);
        assert_eq!(nested.get("b").unwrap().content, Some(Content::from(5)));

        let tree = StepMetrics::from_output(&out);
        assert_eq!(tree.total().input_tokens, 15);
        let inner_metrics = tree.branches().unwrap().get("inner").unwrap();
        assert_eq!(inner_metrics.branches().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_sequence_branch_counts_nested_parallel_metrics() {
        let chain = Steps::new(
            "chain",
            vec![
                Parallel::new("inner", vec![costed("a", 2), costed("b", 4)]).into(),
                costed("c", 1),
            ],
        );
        let outer = Parallel::new("outer", vec![chain.into()]);

        let out = single(outer.execute(StepInput::default(), &ctx()).await.unwrap());
        let chain = out.parallel_outputs.unwrap().get("chain").cloned().unwrap();
        assert_eq!(chain.metrics.unwrap().input_tokens, 7);
    }

    #[tokio::test]
    async fn test_events_replayed_in_launch_order() {
        let slow = Step::async_function("slow", |_i, _s| async {
            tokio::time::sleep(std::time::Duration::from_millis(30)).await;
            Ok(StepReturn::from("slow"))
        });
        let fast = Step::function("fast", |_i, _s| Ok(StepReturn::from("fast")));
        let parallel = Parallel::new("fan", vec![slow.into(), fast.into()]);

        let (ctx, buffer) = ctx().with_event_buffer();
        let ctx = ctx.with_intermediate_steps(true);
        parallel.execute(StepInput::default(), &ctx).await.unwrap();

        let started: Vec<String> = buffer
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                WorkflowEvent::StepStarted { step_name } => Some(step_name),
                _ => None,
            })
            .collect();
        assert_eq!(started, vec!["slow", "fast"]);
    }
}
