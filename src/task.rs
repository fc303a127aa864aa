//! Task Model: what a virtual user does on each iteration.
//!
//! A workload author describes behavior as a [`TaskSetSpec`]: an ordered list of
//! [`Step`]s, each either an atomic [`TaskSpec`] or a nested set. A set is either
//! *sequential* (steps run in listed order, each `weight` times in a row, wrapping after
//! the last) or *weighted* (one step drawn per iteration with probability
//! `weight / total_weight`). Every weight must be at least 1.
//!
//! Specs are validated and flattened once by [`TaskModel::load`]; the resulting model
//! is immutable and shared by every user of a profile. Each user walks it with its own
//! [`TaskCursor`], which owns the only mutable state (sequential positions and
//! in-progress nested sets).
//!
//! # Nested sets
//!
//! Selecting a nested set resolves recursively into that set's own next step. A nested
//! sequential set runs a full pass before its parent advances (or, under a weighted
//! parent, before the parent draws again).

use std::{fmt, sync::Arc};

use futures::future::BoxFuture;
use rand::Rng;

use crate::{
    error::{ActionResult, Error},
    user::UserContext,
};

/// A unit of user behavior. Receives the user's context and may issue any number of
/// requests through it.
///
/// Any `fn(&mut UserContext) -> BoxFuture<'_, ActionResult>` is an `Action`; the
/// `#[action]` attribute (feature `macros`) turns a plain `async fn` into one.
pub trait Action: Send + Sync {
    fn execute<'a>(&'a self, ctx: &'a mut UserContext) -> BoxFuture<'a, ActionResult>;
}

impl<F> Action for F
where
    F: for<'a> Fn(&'a mut UserContext) -> BoxFuture<'a, ActionResult> + Send + Sync,
{
    fn execute<'a>(&'a self, ctx: &'a mut UserContext) -> BoxFuture<'a, ActionResult> {
        self(ctx)
    }
}

/// An atomic, weighted task.
#[derive(Clone)]
pub struct TaskSpec {
    /// Default aggregation key for requests issued by this task.
    pub label: String,
    pub weight: u32,
    pub action: Arc<dyn Action>,
}

impl TaskSpec {
    pub fn new(label: impl Into<String>, action: impl Action + 'static) -> Self {
        Self {
            label: label.into(),
            weight: 1,
            action: Arc::new(action),
        }
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

impl fmt::Debug for TaskSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskSpec")
            .field("label", &self.label)
            .field("weight", &self.weight)
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SetMode {
    /// Every step `weight` times in a row per pass, in listed order.
    Sequential,
    /// One step per draw, proportional to weight.
    Weighted,
}

#[derive(Clone, Debug)]
pub enum Step {
    Task(TaskSpec),
    Set(TaskSetSpec),
}

impl Step {
    fn weight(&self) -> u32 {
        match self {
            Step::Task(t) => t.weight,
            Step::Set(s) => s.weight,
        }
    }
}

/// Author-facing description of a task set.
#[derive(Clone, Debug)]
pub struct TaskSetSpec {
    pub mode: SetMode,
    /// Weight of this set when nested inside a weighted parent.
    pub weight: u32,
    pub steps: Vec<Step>,
}

impl TaskSetSpec {
    pub fn sequential() -> Self {
        Self {
            mode: SetMode::Sequential,
            weight: 1,
            steps: Vec::new(),
        }
    }

    pub fn weighted() -> Self {
        Self {
            mode: SetMode::Weighted,
            weight: 1,
            steps: Vec::new(),
        }
    }

    pub fn task(mut self, task: TaskSpec) -> Self {
        self.steps.push(Step::Task(task));
        self
    }

    pub fn set(mut self, nested: TaskSetSpec) -> Self {
        self.steps.push(Step::Set(nested));
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

#[derive(Clone, Copy, Debug)]
enum Child {
    Task(usize),
    Set(usize),
}

#[derive(Debug)]
struct Node {
    mode: SetMode,
    children: Vec<Child>,
    /// Running sum of child weights; only filled for weighted nodes.
    cumulative: Vec<u64>,
    /// Consecutive runs of each child per pass; only filled for sequential nodes.
    repeats: Vec<u32>,
}

/// Validated, flattened task tree. Node 0 is the root.
#[derive(Debug)]
pub struct TaskModel {
    nodes: Vec<Node>,
    tasks: Vec<TaskSpec>,
}

impl TaskModel {
    /// Validate `spec` and precompute weighted-selection tables.
    ///
    /// Fails with [`Error::Configuration`] on an empty set or a zero weight, at any
    /// depth.
    pub fn load(spec: &TaskSetSpec) -> Result<Self, Error> {
        let mut model = Self {
            nodes: Vec::new(),
            tasks: Vec::new(),
        };
        model.add_set(spec, "root")?;
        Ok(model)
    }

    fn add_set(&mut self, spec: &TaskSetSpec, path: &str) -> Result<usize, Error> {
        if spec.steps.is_empty() {
            return Err(Error::config(format!("task set `{path}` has no steps")));
        }
        let id = self.nodes.len();
        self.nodes.push(Node {
            mode: spec.mode,
            children: Vec::with_capacity(spec.steps.len()),
            cumulative: Vec::new(),
            repeats: Vec::new(),
        });

        let mut children = Vec::with_capacity(spec.steps.len());
        let mut cumulative = Vec::new();
        let mut repeats = Vec::new();
        let mut running = 0u64;
        for (i, step) in spec.steps.iter().enumerate() {
            if step.weight() == 0 {
                return Err(Error::config(format!(
                    "step {i} of task set `{path}` has weight 0"
                )));
            }
            match spec.mode {
                SetMode::Weighted => {
                    running += u64::from(step.weight());
                    cumulative.push(running);
                }
                SetMode::Sequential => repeats.push(step.weight()),
            }
            let child = match step {
                Step::Task(task) => {
                    self.tasks.push(task.clone());
                    Child::Task(self.tasks.len() - 1)
                }
                Step::Set(nested) => Child::Set(self.add_set(nested, &format!("{path}.{i}"))?),
            };
            children.push(child);
        }

        let node = &mut self.nodes[id];
        node.children = children;
        node.cumulative = cumulative;
        node.repeats = repeats;
        Ok(id)
    }

    /// Every atomic task, in declaration order.
    pub fn tasks(&self) -> &[TaskSpec] {
        &self.tasks
    }
}

#[derive(Clone, Copy, Debug, Default)]
struct NodeCursor {
    /// Next child of a sequential node.
    position: usize,
    /// Completed runs of that child in the current pass.
    repeat: u32,
    /// Child of a weighted node that is mid-pass and must be resumed.
    active: Option<usize>,
}

/// Per-user walker over a shared [`TaskModel`].
pub struct TaskCursor {
    model: Arc<TaskModel>,
    cursors: Vec<NodeCursor>,
}

impl TaskCursor {
    pub fn new(model: Arc<TaskModel>) -> Self {
        let cursors = vec![NodeCursor::default(); model.nodes.len()];
        Self { model, cursors }
    }

    /// The task to run next.
    pub fn next_step<R: Rng + ?Sized>(&mut self, rng: &mut R) -> &TaskSpec {
        let (task, _) = self.resolve(0, rng);
        &self.model.tasks[task]
    }

    /// Returns the chosen task and whether `node` just completed a full pass.
    fn resolve<R: Rng + ?Sized>(&mut self, node: usize, rng: &mut R) -> (usize, bool) {
        match self.model.nodes[node].mode {
            SetMode::Sequential => {
                let position = self.cursors[node].position;
                let child = self.model.nodes[node].children[position];
                let (task, child_done) = self.resolve_child(child, rng);
                if !child_done {
                    return (task, false);
                }
                let cursor = &mut self.cursors[node];
                cursor.repeat += 1;
                if cursor.repeat < self.model.nodes[node].repeats[position] {
                    return (task, false);
                }
                cursor.repeat = 0;
                let next = position + 1;
                let wrapped = next == self.model.nodes[node].children.len();
                cursor.position = if wrapped { 0 } else { next };
                (task, wrapped)
            }
            SetMode::Weighted => {
                let index = match self.cursors[node].active {
                    Some(index) => index,
                    None => pick_weighted(&self.model.nodes[node].cumulative, rng),
                };
                let child = self.model.nodes[node].children[index];
                let (task, child_done) = self.resolve_child(child, rng);
                self.cursors[node].active = (!child_done).then_some(index);
                (task, child_done)
            }
        }
    }

    fn resolve_child<R: Rng + ?Sized>(&mut self, child: Child, rng: &mut R) -> (usize, bool) {
        match child {
            Child::Task(task) => (task, true),
            Child::Set(node) => self.resolve(node, rng),
        }
    }
}

/// First index whose cumulative weight exceeds a uniform draw in `[0, total)`.
fn pick_weighted<R: Rng + ?Sized>(cumulative: &[u64], rng: &mut R) -> usize {
    let total = cumulative.last().copied().unwrap_or(0);
    if total == 0 {
        return 0;
    }
    let draw = rng.random_range(0..total);
    cumulative.partition_point(|&c| c <= draw)
}
