//! The stage graph and its pull-based evaluation.
//!
//! Every stage is a node in a `petgraph` graph. Pulling a handle walks the
//! ancestors of its node in dependency order and brings each of them up to
//! date for the current revision:
//!
//! 1. A stage already verified in this revision is skipped.
//! 2. A stage whose dependencies have not changed since it was last verified
//!    keeps its cached output, its transform is not invoked.
//! 3. Otherwise the transform runs. If the new output is structurally equal
//!    to the old one, the old one is kept and the stage does not count as
//!    changed, so its dependents can be skipped in turn.
//!
//! Input feeds advance the revision when their content changes.

mod combinators;
mod handle;
mod stage;

use std::any::type_name;
use std::borrow::Cow;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::{Duration, Instant};

use petgraph::Graph;
use petgraph::graph::NodeIndex;
use petgraph::visit::{DfsPostOrder, Reversed};
use tracing_indicatif::span_ext::IndicatifSpanExt;

use crate::cancel::Cancellation;
use crate::core::{Dynamic, Hash32, Item, Value};
use crate::error::{EngineError, UserError};
use crate::sink::Artifact;
use crate::snapshot::Snapshot;

pub use crate::engine::handle::{Dependencies, Grouped, Handle, Keyed, Provider};
pub use crate::engine::stage::StageContext;
use crate::engine::stage::{Stage, StageNode};

/// A monotonically increasing counter, advanced whenever an input changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Revision(pub u64);

impl Revision {
    fn next(self) -> Self {
        Revision(self.0 + 1)
    }
}

#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub start: Instant,
    pub duration: Duration,
}

/// What happened to the stages touched since the last call to
/// [`Engine::take_trace`].
#[derive(Debug, Default, Clone)]
pub(crate) struct PassTrace {
    pub executions: HashMap<NodeIndex, TaskExecution>,
    pub reused: usize,
    pub unchanged: usize,
}

pub(crate) enum NodeKind {
    Input(&'static str),
    Derived(Arc<dyn Stage>),
}

pub(crate) struct NodeState {
    pub output: Dynamic,
    pub fingerprint: Hash32,
    /// Last revision in which the output actually changed.
    pub changed_at: Revision,
    /// Last revision in which the output was confirmed up to date.
    pub verified_at: Revision,
}

pub(crate) struct Node {
    pub name: Cow<'static, str>,
    pub kind: NodeKind,
    pub state: Option<NodeState>,
    pub runs: usize,
}

impl Node {
    fn type_name_output(&self) -> &'static str {
        match &self.kind {
            NodeKind::Input(name) => name,
            NodeKind::Derived(stage) => stage.output_type_name(),
        }
    }
}

/// The stage graph of one generation session.
///
/// Stages are added through typed builder methods which return
/// [`Handle`]s; handles are then used as the dependencies of further stages.
/// Since a stage can only depend on handles that already exist, the graph is
/// acyclic by construction.
pub struct Engine {
    pub(crate) graph: Graph<Node, ()>,
    revision: Revision,
    outputs: Vec<Provider<Artifact>>,
    trace: PassTrace,
}

impl Engine {
    pub fn new() -> Self {
        Self {
            graph: Graph::new(),
            revision: Revision::default(),
            outputs: Vec::new(),
            trace: PassTrace::default(),
        }
    }

    pub fn revision(&self) -> Revision {
        self.revision
    }

    /// Number of stages in the graph, inputs included.
    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn name(&self, index: NodeIndex) -> Option<&str> {
        self.graph.node_weight(index).map(|node| node.name.as_ref())
    }

    /// How many times the transform behind `handle` has been invoked.
    pub fn runs<H: Handle>(&self, handle: H) -> usize {
        self.graph
            .node_weight(handle.index())
            .map(|node| node.runs)
            .unwrap_or(0)
    }

    /// Renames a stage, mostly useful for diagnostics.
    pub fn label<H: Handle>(&mut self, handle: H, name: impl Into<Cow<'static, str>>) -> H {
        if let Some(node) = self.graph.node_weight_mut(handle.index()) {
            node.name = name.into();
        }
        handle
    }

    /// Declares an input feed, initially empty.
    pub fn input<T: Item>(&mut self, name: impl Into<Cow<'static, str>>) -> Provider<T> {
        let snapshot = Snapshot::<T>::empty();
        let state = NodeState {
            fingerprint: snapshot.fingerprint(),
            output: Arc::new(snapshot),
            changed_at: self.revision,
            verified_at: self.revision,
        };

        let index = self.graph.add_node(Node {
            name: name.into(),
            kind: NodeKind::Input(type_name::<Snapshot<T>>()),
            state: Some(state),
            runs: 0,
        });

        Provider::new(index)
    }

    /// Replaces the content of an input feed.
    ///
    /// Returns `false` and leaves the revision alone when the new content is
    /// structurally equal to the current one.
    pub fn set_input<T, I>(&mut self, input: Provider<T>, items: I) -> Result<bool, EngineError>
    where
        T: Item,
        I: IntoIterator<Item = T>,
    {
        let snapshot: Snapshot<T> = items.into_iter().collect();
        let fingerprint = snapshot.fingerprint();

        let node = self
            .graph
            .node_weight(input.index())
            .ok_or(EngineError::UnknownStage(input.index().index()))?;

        if !matches!(node.kind, NodeKind::Input(_)) {
            return Err(EngineError::NotAnInput(node.name.to_string()));
        }

        if let Some(state) = &node.state
            && state.fingerprint == fingerprint
            && state.output.downcast_ref::<Snapshot<T>>() == Some(&snapshot)
        {
            return Ok(false);
        }

        self.revision = self.revision.next();
        let revision = self.revision;
        tracing::debug!(input = %node.name, revision = revision.0, "input changed");

        self.graph[input.index()].state = Some(NodeState {
            output: Arc::new(snapshot),
            fingerprint,
            changed_at: revision,
            verified_at: revision,
        });

        Ok(true)
    }

    /// Adds a sequence stage computing a snapshot from `dependencies`.
    ///
    /// `dependencies` is a handle, a tuple of handles or a `Vec` of handles;
    /// the transform receives their outputs in the same shape.
    pub fn derive<D, U, F>(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        dependencies: D,
        transform: F,
    ) -> Provider<U>
    where
        D: Dependencies + Send + Sync + 'static,
        U: Item,
        F: Fn(&StageContext<'_>, D::Output) -> anyhow::Result<Snapshot<U>>
            + Send
            + Sync
            + 'static,
    {
        Provider::new(self.add_stage(name, dependencies, true, transform))
    }

    pub(crate) fn add_stage<D, O, F>(
        &mut self,
        name: impl Into<Cow<'static, str>>,
        dependencies: D,
        cutoff: bool,
        callback: F,
    ) -> NodeIndex
    where
        D: Dependencies + Send + Sync + 'static,
        O: Value,
        F: Fn(&StageContext<'_>, D::Output) -> anyhow::Result<O> + Send + Sync + 'static,
    {
        let edges = dependencies.dependencies();
        let stage = StageNode {
            dependencies,
            callback,
            cutoff,
            _phantom: PhantomData,
        };

        let index = self.graph.add_node(Node {
            name: name.into(),
            kind: NodeKind::Derived(Arc::new(stage)),
            state: None,
            runs: 0,
        });

        for dependency in edges {
            self.graph.add_edge(dependency, index, ());
        }

        index
    }

    /// Marks a provider of artifacts as a terminal feed for the sink.
    pub fn output(&mut self, artifacts: Provider<Artifact>) {
        if !self.outputs.contains(&artifacts) {
            self.outputs.push(artifacts);
        }
    }

    pub fn outputs(&self) -> &[Provider<Artifact>] {
        &self.outputs
    }

    /// Brings `handle` up to date and returns its output.
    pub fn pull<H: Handle>(
        &mut self,
        handle: H,
        cancel: &Cancellation,
    ) -> Result<Arc<H::Output>, EngineError> {
        self.update(handle.index(), cancel)?;
        self.cached(handle)
    }

    /// The last computed output of `handle`, without evaluating anything.
    pub fn cached<H: Handle>(&self, handle: H) -> Result<Arc<H::Output>, EngineError> {
        let node = self
            .graph
            .node_weight(handle.index())
            .ok_or(EngineError::UnknownStage(handle.index().index()))?;

        let state = node
            .state
            .as_ref()
            .ok_or_else(|| EngineError::NotReady(node.name.to_string()))?;

        Arc::clone(&state.output)
            .downcast::<H::Output>()
            .map_err(|_| EngineError::TypeMismatch {
                name: node.name.to_string(),
                expected: type_name::<H::Output>(),
            })
    }

    pub(crate) fn take_trace(&mut self) -> PassTrace {
        std::mem::take(&mut self.trace)
    }

    fn update(&mut self, target: NodeIndex, cancel: &Cancellation) -> Result<(), EngineError> {
        if self.graph.node_weight(target).is_none() {
            return Err(EngineError::UnknownStage(target.index()));
        }

        // Post-order over the reversed graph yields dependencies first.
        let order = {
            let graph = Reversed(&self.graph);
            let mut dfs = DfsPostOrder::new(graph, target);
            let mut order = Vec::new();
            while let Some(index) = dfs.next(graph) {
                order.push(index);
            }
            order
        };

        let span = tracing::info_span!("pass", revision = self.revision.0);
        span.pb_set_style(&crate::utils::get_style_pass());
        span.pb_set_length(order.len() as u64);
        let _enter = span.enter();

        for index in order {
            self.refresh(index, cancel)?;
            span.pb_inc(1);
        }

        Ok(())
    }

    fn refresh(&mut self, index: NodeIndex, cancel: &Cancellation) -> Result<(), EngineError> {
        let revision = self.revision;

        let stage = match &self.graph[index].kind {
            NodeKind::Derived(stage) => Some(Arc::clone(stage)),
            NodeKind::Input(_) => None,
        };

        let verified = self.graph[index]
            .state
            .as_ref()
            .is_some_and(|state| state.verified_at == revision);

        if verified {
            return Ok(());
        }

        let Some(stage) = stage else {
            if let Some(state) = self.graph[index].state.as_mut() {
                state.verified_at = revision;
            }
            return Ok(());
        };

        let dependencies = stage.dependencies();

        let fresh = match &self.graph[index].state {
            Some(state) => dependencies.iter().all(|dependency| {
                self.graph[*dependency]
                    .state
                    .as_ref()
                    .is_some_and(|dep| dep.changed_at <= state.verified_at)
            }),
            None => false,
        };

        if fresh {
            tracing::debug!(stage = %self.graph[index].name, "reusing cached output");
            if let Some(state) = self.graph[index].state.as_mut() {
                state.verified_at = revision;
            }
            self.trace.reused += 1;
            return Ok(());
        }

        cancel.check()?;

        let inputs = dependencies
            .iter()
            .map(|dependency| {
                let node = &self.graph[*dependency];
                node.state
                    .as_ref()
                    .map(|state| Arc::clone(&state.output))
                    .ok_or_else(|| EngineError::NotReady(node.name.to_string()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let name = self.graph[index].name.clone();
        let cx = StageContext {
            name: &name,
            graph: &self.graph,
            revision,
            cancel,
        };

        let start = Instant::now();

        let result = match catch_unwind(AssertUnwindSafe(|| stage.execute(&cx, &inputs))) {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!(crate::utils::panic_message(&panic))),
        };

        let duration = start.elapsed();
        self.trace
            .executions
            .insert(index, TaskExecution { start, duration });

        let node = &mut self.graph[index];
        node.runs += 1;

        let (output, fingerprint) = result.map_err(|err| match err.downcast_ref::<EngineError>() {
            Some(EngineError::Cancelled) => EngineError::Cancelled,
            _ => {
                tracing::error!(stage = %name, "{err:#}");
                EngineError::Stage(name.to_string(), UserError::from(err))
            }
        })?;

        match &mut node.state {
            Some(state)
                if stage.cutoff()
                    && state.fingerprint == fingerprint
                    && stage.same(&state.output, &output) =>
            {
                tracing::debug!(stage = %name, "output unchanged");
                state.verified_at = revision;
                self.trace.unchanged += 1;
            }
            slot => {
                *slot = Some(NodeState {
                    output,
                    fingerprint,
                    changed_at: revision,
                    verified_at: revision,
                });
            }
        }

        Ok(())
    }
}

impl Default for Engine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        for index in self.graph.node_indices() {
            let name = self.graph[index].name.replace('"', "\\\"");
            writeln!(f, "    {}[\"{}\"]", index.index(), name)?;
        }

        for output in &self.outputs {
            writeln!(f, "    {} --> Output", output.index().index())?;
        }

        if !self.outputs.is_empty() {
            writeln!(f, "    Output[Output]")?;
        }

        for edge in self.graph.raw_edges() {
            let type_name = self.graph[edge.source()]
                .type_name_output()
                .replace('<', "&lt;")
                .replace('>', "&gt;");
            writeln!(
                f,
                "    {} -- \"{}\" --> {}",
                edge.source().index(),
                type_name,
                edge.target().index()
            )?;
        }

        Ok(())
    }
}
