use std::marker::PhantomData;
use std::sync::Arc;

use petgraph::Graph;
use petgraph::graph::NodeIndex;

use crate::cancel::Cancellation;
use crate::core::{Dynamic, Hash32, Value};
use crate::engine::handle::{Dependencies, Handle};
use crate::engine::{Node, NodeKind, Revision};
use crate::error::EngineError;

/// The context passed to every transform.
///
/// Gives access to the cancellation token and to side-channel reads of other
/// stages. It is immutable while the transform runs.
pub struct StageContext<'a> {
    pub(crate) name: &'a str,
    pub(crate) graph: &'a Graph<Node, ()>,
    pub(crate) revision: Revision,
    pub(crate) cancel: &'a Cancellation,
}

impl<'a> StageContext<'a> {
    /// Name of the running stage.
    pub fn name(&self) -> &str {
        self.name
    }

    /// A suspension point: fails with [`EngineError::Cancelled`] once the
    /// pass has been cancelled.
    pub fn checkpoint(&self) -> Result<(), EngineError> {
        self.cancel.check()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Reads the output of a stage that is not a declared dependency.
    ///
    /// Input feeds are always current. Any other stage must already have
    /// been brought up to date in the current revision, which is what
    /// [`Engine::depends_on`](crate::Engine::depends_on) guarantees. Anything
    /// else is reported as [`EngineError::NotReady`] instead of serving a
    /// stale value.
    pub fn peek<H: Handle>(&self, handle: H) -> Result<Arc<H::Output>, EngineError> {
        let node = self
            .graph
            .node_weight(handle.index())
            .ok_or(EngineError::UnknownStage(handle.index().index()))?;

        match &node.state {
            Some(state)
                if state.verified_at == self.revision || matches!(node.kind, NodeKind::Input(_)) =>
            {
                Arc::clone(&state.output)
                    .downcast::<H::Output>()
                    .map_err(|_| EngineError::TypeMismatch {
                        name: node.name.to_string(),
                        expected: std::any::type_name::<H::Output>(),
                    })
            }
            _ => Err(EngineError::NotReady(node.name.to_string())),
        }
    }
}

pub(crate) trait TypedStage: Send + Sync {
    /// The concrete output type of this stage.
    type Output: Value;

    fn dependencies(&self) -> Vec<NodeIndex>;

    /// Whether an output equal to the previous one stops propagation.
    fn cutoff(&self) -> bool {
        true
    }

    fn execute(&self, cx: &StageContext<'_>, inputs: &[Dynamic]) -> anyhow::Result<Self::Output>;
}

/// The type-erased foundation that allows the graph to hold stages with
/// different output types.
pub(crate) trait Stage: Send + Sync {
    fn output_type_name(&self) -> &'static str;

    fn dependencies(&self) -> Vec<NodeIndex>;

    fn cutoff(&self) -> bool;

    fn execute(
        &self,
        cx: &StageContext<'_>,
        inputs: &[Dynamic],
    ) -> anyhow::Result<(Dynamic, Hash32)>;

    /// Structural equality of two outputs of this stage.
    fn same(&self, old: &Dynamic, new: &Dynamic) -> bool;
}

// This is where the type erasure actually happens.
impl<T> Stage for T
where
    T: TypedStage + 'static,
{
    fn output_type_name(&self) -> &'static str {
        std::any::type_name::<T::Output>()
    }

    fn dependencies(&self) -> Vec<NodeIndex> {
        T::dependencies(self)
    }

    fn cutoff(&self) -> bool {
        T::cutoff(self)
    }

    fn execute(
        &self,
        cx: &StageContext<'_>,
        inputs: &[Dynamic],
    ) -> anyhow::Result<(Dynamic, Hash32)> {
        let output = T::execute(self, cx, inputs)?;
        let fingerprint = Hash32::of(&output);
        Ok((Arc::new(output), fingerprint))
    }

    fn same(&self, old: &Dynamic, new: &Dynamic) -> bool {
        match (
            old.downcast_ref::<T::Output>(),
            new.downcast_ref::<T::Output>(),
        ) {
            (Some(old), Some(new)) => old == new,
            _ => false,
        }
    }
}

pub(crate) struct StageNode<D, F, O> {
    pub dependencies: D,
    pub callback: F,
    pub cutoff: bool,
    pub _phantom: PhantomData<fn() -> O>,
}

impl<D, F, O> TypedStage for StageNode<D, F, O>
where
    D: Dependencies + Send + Sync,
    F: Fn(&StageContext<'_>, D::Output) -> anyhow::Result<O> + Send + Sync,
    O: Value,
{
    type Output = O;

    fn dependencies(&self) -> Vec<NodeIndex> {
        self.dependencies.dependencies()
    }

    fn cutoff(&self) -> bool {
        self.cutoff
    }

    fn execute(&self, cx: &StageContext<'_>, inputs: &[Dynamic]) -> anyhow::Result<O> {
        let inputs = self.dependencies.resolve(inputs)?;
        (self.callback)(cx, inputs)
    }
}
