use std::collections::HashSet;
use std::sync::Arc;

use futures::future::BoxFuture;

use flowline_core::error::{FlowlineError, Result};
use flowline_core::run::StepSummary;
use flowline_core::types::{ExecutorKind, NodeOutput, StepInput};

use crate::condition::Condition;
use crate::context::ExecutionContext;
use crate::looping::Loop;
use crate::parallel::Parallel;
use crate::router::Router;
use crate::step::Step;
use crate::steps::Steps;

/// One node of a workflow composition.
///
/// Nodes are cheap to clone; parallel branches move clones into their own
/// tasks.
#[derive(Clone)]
pub enum Node {
    Step(Arc<Step>),
    Steps(Arc<Steps>),
    Loop(Arc<Loop>),
    Parallel(Arc<Parallel>),
    Condition(Arc<Condition>),
    Router(Arc<Router>),
}

impl Node {
    pub fn name(&self) -> &str {
        match self {
            Node::Step(s) => &s.name,
            Node::Steps(s) => &s.name,
            Node::Loop(l) => &l.name,
            Node::Parallel(p) => &p.name,
            Node::Condition(c) => &c.name,
            Node::Router(r) => &r.name,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            Node::Step(s) => s.description.as_deref(),
            Node::Steps(s) => s.description.as_deref(),
            Node::Loop(l) => l.description.as_deref(),
            Node::Parallel(p) => p.description.as_deref(),
            Node::Condition(c) => c.description.as_deref(),
            Node::Router(r) => r.description.as_deref(),
        }
    }

    pub fn kind(&self) -> ExecutorKind {
        match self {
            Node::Step(s) => s.executor_kind(),
            Node::Steps(_) => ExecutorKind::Steps,
            Node::Loop(_) => ExecutorKind::Loop,
            Node::Parallel(_) => ExecutorKind::Parallel,
            Node::Condition(_) => ExecutorKind::Condition,
            Node::Router(_) => ExecutorKind::Router,
        }
    }

    pub fn summary(&self) -> StepSummary {
        StepSummary {
            name: self.name().to_string(),
            kind: self.kind(),
            description: self.description().map(str::to_string),
        }
    }

    /// Run this node. Unit failures come back as data inside the output;
    /// `Err` means the composition itself could not proceed.
    pub fn execute<'a>(
        &'a self,
        input: StepInput,
        ctx: &'a ExecutionContext,
    ) -> BoxFuture<'a, Result<NodeOutput>> {
        match self {
            Node::Step(s) => s.execute(input, ctx),
            Node::Steps(s) => s.execute(input, ctx),
            Node::Loop(l) => l.execute(input, ctx),
            Node::Parallel(p) => p.execute(input, ctx),
            Node::Condition(c) => c.execute(input, ctx),
            Node::Router(r) => r.execute(input, ctx),
        }
    }

    /// Check names and bounds for this node and everything beneath it.
    pub fn validate(&self) -> Result<()> {
        if self.name().trim().is_empty() {
            return Err(FlowlineError::InvalidComposition(format!(
                "{} node has an empty name",
                self.kind()
            )));
        }
        match self {
            Node::Step(_) => Ok(()),
            Node::Steps(s) => validate_children(&s.name, &s.children),
            Node::Loop(l) => {
                if l.max_iterations == 0 {
                    return Err(FlowlineError::InvalidComposition(format!(
                        "loop '{}' needs max_iterations of at least 1",
                        l.name
                    )));
                }
                validate_children(&l.name, &l.body)
            }
            Node::Parallel(p) => {
                if p.branches.is_empty() {
                    return Err(FlowlineError::InvalidComposition(format!(
                        "parallel '{}' has no branches",
                        p.name
                    )));
                }
                validate_children(&p.name, &p.branches)
            }
            Node::Condition(c) => {
                validate_children(&c.name, &c.then)?;
                validate_children(&c.name, &c.otherwise)
            }
            Node::Router(r) => validate_children(&r.name, &r.choices),
        }
    }
}

/// Sibling names must be unique; they key step outputs.
pub(crate) fn validate_children(parent: &str, children: &[Node]) -> Result<()> {
    let mut seen = HashSet::new();
    for child in children {
        if !seen.insert(child.name()) {
            return Err(FlowlineError::InvalidComposition(format!(
                "duplicate step name '{}' in '{}'",
                child.name(),
                parent
            )));
        }
        child.validate()?;
    }
    Ok(())
}

impl From<Step> for Node {
    fn from(step: Step) -> Self {
        Node::Step(Arc::new(step))
    }
}

impl From<Steps> for Node {
    fn from(steps: Steps) -> Self {
        Node::Steps(Arc::new(steps))
    }
}

impl From<Loop> for Node {
    fn from(l: Loop) -> Self {
        Node::Loop(Arc::new(l))
    }
}

impl From<Parallel> for Node {
    fn from(p: Parallel) -> Self {
        Node::Parallel(Arc::new(p))
    }
}

impl From<Condition> for Node {
    fn from(c: Condition) -> Self {
        Node::Condition(Arc::new(c))
    }
}

impl From<Router> for Node {
    fn from(r: Router) -> Self {
        Node::Router(Arc::new(r))
    }
}
