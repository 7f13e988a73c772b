use std::any::type_name;
use std::marker::PhantomData;
use std::sync::Arc;

use petgraph::graph::NodeIndex;

use crate::core::{Dynamic, Item, Key, Value};
use crate::error::EngineError;
use crate::keyed::{GroupingMap, KeyedMap};
use crate::snapshot::Snapshot;

/// Things that can be used as a dependency of a stage.
///
/// A handle is a lightweight, copyable token pointing at a node of the stage
/// graph, typed by the output that node produces.
pub trait Handle: Copy + Send + Sync + 'static {
    type Output: Value;

    fn index(&self) -> NodeIndex;
}

macro_rules! handle {
    ($(#[$meta:meta])* $name:ident<$($T:ident: $B:ident),+> => $output:ty) => {
        $(#[$meta])*
        pub struct $name<$($T),+> {
            pub(crate) index: NodeIndex,
            _phantom: PhantomData<fn() -> ($($T,)+)>,
        }

        impl<$($T),+> $name<$($T),+> {
            pub(crate) fn new(index: NodeIndex) -> Self {
                Self {
                    index,
                    _phantom: PhantomData,
                }
            }

            /// Returns the underlying `NodeIndex` of the stage in the graph.
            pub fn index(&self) -> NodeIndex {
                self.index
            }
        }

        impl<$($T),+> Clone for $name<$($T),+> {
            fn clone(&self) -> Self {
                *self
            }
        }

        impl<$($T),+> Copy for $name<$($T),+> {}

        impl<$($T),+> PartialEq for $name<$($T),+> {
            fn eq(&self, other: &Self) -> bool {
                self.index == other.index
            }
        }

        impl<$($T),+> Eq for $name<$($T),+> {}

        impl<$($T),+> std::fmt::Debug for $name<$($T),+> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}({})", stringify!($name), self.index.index())
            }
        }

        impl<$($T: $B),+> Handle for $name<$($T),+> {
            type Output = $output;

            fn index(&self) -> NodeIndex {
                self.index
            }
        }
    };
}

handle! {
    /// A sequence provider: a stage producing a [`Snapshot<T>`].
    Provider<T: Item> => Snapshot<T>
}

handle! {
    /// A keyed map provider: a stage producing a [`KeyedMap<K, V>`].
    Keyed<K: Key, V: Item> => KeyedMap<K, V>
}

handle! {
    /// A grouping provider: a stage producing a [`GroupingMap<K, V>`].
    Grouped<K: Key, V: Item> => GroupingMap<K, V>
}

fn downcast<H: Handle>(handle: &H, output: &Dynamic) -> Result<Arc<H::Output>, EngineError> {
    Arc::clone(output)
        .downcast::<H::Output>()
        .map_err(|_| EngineError::TypeMismatch {
            name: format!("#{}", handle.index().index()),
            expected: type_name::<H::Output>(),
        })
}

/// A collection of [`Handle`]s that can be used as the dependencies of a
/// stage.
///
/// Implemented for a single handle, tuples of handles and `Vec`s of
/// handles. Resolving turns the type-erased outputs of the dependencies back
/// into their concrete types, in the same shape as the collection itself.
pub trait Dependencies {
    /// For a tuple of handles, a tuple of `Arc`s of their outputs.
    type Output;

    /// Returns the [`NodeIndex`] for each dependency in the collection.
    fn dependencies(&self) -> Vec<NodeIndex>;

    /// Resolves the type-erased outputs, given in the order returned by
    /// [`dependencies`](Self::dependencies).
    fn resolve(&self, outputs: &[Dynamic]) -> Result<Self::Output, EngineError>;
}

impl Dependencies for () {
    type Output = ();

    fn dependencies(&self) -> Vec<NodeIndex> {
        vec![]
    }

    fn resolve(&self, _: &[Dynamic]) -> Result<Self::Output, EngineError> {
        Ok(())
    }
}

impl<H> Dependencies for H
where
    H: Handle,
{
    type Output = Arc<H::Output>;

    fn dependencies(&self) -> Vec<NodeIndex> {
        vec![self.index()]
    }

    fn resolve(&self, outputs: &[Dynamic]) -> Result<Self::Output, EngineError> {
        match outputs.first() {
            Some(output) => downcast(self, output),
            None => Err(EngineError::NotReady(format!("#{}", self.index().index()))),
        }
    }
}

impl<H> Dependencies for Vec<H>
where
    H: Handle,
{
    type Output = Vec<Arc<H::Output>>;

    fn dependencies(&self) -> Vec<NodeIndex> {
        self.iter().map(|h| h.index()).collect()
    }

    fn resolve(&self, outputs: &[Dynamic]) -> Result<Self::Output, EngineError> {
        self.iter()
            .zip(outputs)
            .map(|(handle, output)| downcast(handle, output))
            .collect()
    }
}

macro_rules! impl_deps {
    ($($D:ident),*) => {
        #[allow(non_snake_case)]
        impl<$($D),*> Dependencies for ($($D,)*)
        where
            $($D: Handle),* {
            type Output = ($(Arc<$D::Output>,)*);

            fn dependencies(&self) -> Vec<NodeIndex> {
                let ($($D,)*) = self;
                vec![$(Handle::index($D),)*]
            }

            fn resolve(&self, outputs: &[Dynamic]) -> Result<Self::Output, EngineError> {
                let ($($D,)*) = self;
                let mut iter = outputs.iter();

                Ok(($({
                    let out = iter
                        .next()
                        .ok_or_else(|| EngineError::NotReady(format!("#{}", $D.index().index())))?;
                    downcast($D, out)?
                },)*))
            }
        }
    };
}

impl_deps!(A);
impl_deps!(A, B);
impl_deps!(A, B, C);
impl_deps!(A, B, C, D);
impl_deps!(A, B, C, D, E);
impl_deps!(A, B, C, D, E, F);
impl_deps!(A, B, C, D, E, F, G);
impl_deps!(A, B, C, D, E, F, G, H);
