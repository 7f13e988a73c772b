//! Session-scoped task instances.
//!
//! A task is a Rust type that knows how to build itself: while it is being
//! built it declares the providers it owns in the [`Engine`] and may require
//! other tasks. The registry makes sure every task type is built at most once
//! per session and that tasks never require each other in a loop.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;

use petgraph::graphmap::DiGraphMap;

use crate::core::{Dynamic, Environment};
use crate::engine::Engine;
use crate::error::{RegistryError, UserError};
use crate::log::TaskLog;

/// A unit of the pipeline, instantiated once per session.
///
/// # Example
///
/// ```rust
/// use tsumugi::{Construct, Provider, Task};
///
/// struct Routes {
///     feed: Provider<String>,
/// }
///
/// impl Task for Routes {
///     fn build(cx: &mut Construct<'_>) -> anyhow::Result<Self> {
///         let feed = cx.engine().input("routes");
///         Ok(Self { feed })
///     }
/// }
/// ```
pub trait Task<G: Send + Sync = ()>: Any + Send + Sync + Sized {
    fn build(cx: &mut Construct<'_, G>) -> anyhow::Result<Self>;
}

type Factory<G> = fn(&mut Construct<'_, G>) -> anyhow::Result<Dynamic>;

fn construct<G, T>(cx: &mut Construct<'_, G>) -> anyhow::Result<Dynamic>
where
    G: Send + Sync,
    T: Task<G>,
{
    Ok(Arc::new(T::build(cx)?))
}

struct TaskEntry<G: Send + Sync> {
    id: TypeId,
    name: &'static str,
    build: Factory<G>,
}

/// The static table of tasks a session starts with.
///
/// Registering a type here only records how to build it; nothing is built
/// until [`TaskRegistry::initialize`] walks the table.
pub struct Blueprint<G: Send + Sync = ()> {
    tasks: Vec<TaskEntry<G>>,
}

impl<G: Send + Sync> Blueprint<G> {
    pub fn new() -> Self {
        Self { tasks: Vec::new() }
    }

    /// Adds a task type to the table. Registering the same type twice has no
    /// effect.
    pub fn task<T: Task<G>>(&mut self) -> &mut Self {
        let id = TypeId::of::<T>();

        if !self.tasks.iter().any(|entry| entry.id == id) {
            self.tasks.push(TaskEntry {
                id,
                name: type_name::<T>(),
                build: construct::<G, T>,
            });
        }

        self
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Names of the registered tasks, in registration order.
    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.tasks.iter().map(|entry| entry.name)
    }
}

impl<G: Send + Sync> Default for Blueprint<G> {
    fn default() -> Self {
        Self::new()
    }
}

/// What a task sees while it is being built.
pub struct Construct<'a, G: Send + Sync = ()> {
    registry: &'a mut TaskRegistry<G>,
    engine: &'a mut Engine,
    env: &'a Environment<G>,
    task: TypeId,
    log: TaskLog,
}

impl<'a, G: Send + Sync> Construct<'a, G> {
    /// Returns the instance of another task, building it first if needed.
    ///
    /// A satisfied requirement is recorded as a dependency edge. Requiring a
    /// task that is still being built fails with
    /// [`RegistryError::CycleDetected`].
    pub fn require<U: Task<G>>(&mut self) -> Result<Arc<U>, RegistryError> {
        let instance = self.registry.get_or_create::<U>(self.engine, self.env)?;
        self.registry
            .graph
            .add_edge(self.task, TypeId::of::<U>(), ());
        Ok(instance)
    }

    /// The stage graph, for declaring the providers this task owns.
    pub fn engine(&mut self) -> &mut Engine {
        self.engine
    }

    pub fn env(&self) -> &Environment<G> {
        self.env
    }

    pub fn data(&self) -> &G {
        &self.env.data
    }

    /// The diagnostic log of the task being built.
    pub fn log(&self) -> &TaskLog {
        &self.log
    }
}

/// One instance per task type, for the lifetime of a session.
pub struct TaskRegistry<G: Send + Sync = ()> {
    instances: HashMap<TypeId, Dynamic>,
    names: HashMap<TypeId, &'static str>,
    /// Constructors that failed keep failing with the same error.
    failed: HashMap<TypeId, RegistryError>,
    /// Stack of tasks currently being built, outermost first.
    in_progress: Vec<(TypeId, &'static str)>,
    /// An edge `a -> b` means `a` required `b`.
    graph: DiGraphMap<TypeId, ()>,
    logs: Vec<TaskLog>,
    _phantom: PhantomData<fn() -> G>,
}

impl<G: Send + Sync> TaskRegistry<G> {
    pub fn new() -> Self {
        Self {
            instances: HashMap::new(),
            names: HashMap::new(),
            failed: HashMap::new(),
            in_progress: Vec::new(),
            graph: DiGraphMap::new(),
            logs: Vec::new(),
            _phantom: PhantomData,
        }
    }

    /// Clears the registry and builds every task of the blueprint in order.
    ///
    /// Stops at the first task that fails; everything built before it stays
    /// registered.
    pub fn initialize(
        &mut self,
        blueprint: &Blueprint<G>,
        engine: &mut Engine,
        env: &Environment<G>,
    ) -> Result<(), RegistryError> {
        self.instances.clear();
        self.names.clear();
        self.failed.clear();
        self.in_progress.clear();
        self.graph.clear();
        self.logs.clear();

        for entry in &blueprint.tasks {
            if self.instances.contains_key(&entry.id) {
                continue;
            }

            self.resolve(entry.id, entry.name, entry.build, engine, env)?;
        }

        tracing::info!(tasks = self.instances.len(), "tasks initialized");
        Ok(())
    }

    /// Returns the instance of `T`, building it on first use.
    pub fn get_or_create<T: Task<G>>(
        &mut self,
        engine: &mut Engine,
        env: &Environment<G>,
    ) -> Result<Arc<T>, RegistryError> {
        let id = TypeId::of::<T>();
        let instance = self.resolve(id, type_name::<T>(), construct::<G, T>, engine, env)?;

        instance
            .downcast::<T>()
            .map_err(|_| RegistryError::TaskMismatch {
                expected: type_name::<T>(),
                found: self.names.get(&id).copied().unwrap_or("<unknown>"),
            })
    }

    /// The instance of `T` if it has already been built.
    pub fn get<T: Task<G>>(&self) -> Option<Arc<T>> {
        self.instances
            .get(&TypeId::of::<T>())
            .and_then(|instance| Arc::clone(instance).downcast::<T>().ok())
    }

    pub fn contains<T: Task<G>>(&self) -> bool {
        self.instances.contains_key(&TypeId::of::<T>())
    }

    /// Number of tasks built so far.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Names of the tasks `T` required while it was built.
    pub fn dependencies_of<T: Task<G>>(&self) -> Vec<&'static str> {
        let id = TypeId::of::<T>();

        if !self.graph.contains_node(id) {
            return Vec::new();
        }

        self.graph
            .neighbors(id)
            .filter_map(|dependency| self.names.get(&dependency).copied())
            .collect()
    }

    /// The logs of every task whose construction was attempted.
    pub fn logs(&self) -> &[TaskLog] {
        &self.logs
    }

    fn resolve(
        &mut self,
        id: TypeId,
        name: &'static str,
        build: Factory<G>,
        engine: &mut Engine,
        env: &Environment<G>,
    ) -> Result<Dynamic, RegistryError> {
        if let Some(instance) = self.instances.get(&id) {
            return Ok(Arc::clone(instance));
        }

        if let Some(err) = self.failed.get(&id) {
            return Err(err.clone());
        }

        if let Some(start) = self.in_progress.iter().position(|(task, _)| *task == id) {
            let mut chain: Vec<&'static str> =
                self.in_progress[start..].iter().map(|(_, name)| *name).collect();
            chain.push(name);
            return Err(RegistryError::CycleDetected(chain));
        }

        self.in_progress.push((id, name));
        self.names.insert(id, name);
        self.graph.add_node(id);

        let log = TaskLog::new(name);
        let result = {
            let mut cx = Construct {
                registry: self,
                engine,
                env,
                task: id,
                log: log.clone(),
            };
            build(&mut cx)
        };

        self.in_progress.pop();
        self.logs.push(log);

        match result {
            Ok(instance) => {
                tracing::info!(task = name, "task built");
                self.instances.insert(id, Arc::clone(&instance));
                Ok(instance)
            }
            Err(err) => {
                // Invariant faults from nested requirements pass through as is.
                let err = match err.downcast::<RegistryError>() {
                    Ok(inner) if inner.is_invariant() => inner,
                    Ok(inner) => RegistryError::Construction(name, UserError::new(inner)),
                    Err(err) => RegistryError::Construction(name, UserError::from(err)),
                };
                tracing::error!(task = name, "{err}");
                self.failed.insert(id, err.clone());
                Err(err)
            }
        }
    }
}

impl<G: Send + Sync> Default for TaskRegistry<G> {
    fn default() -> Self {
        Self::new()
    }
}

impl<G: Send + Sync> std::fmt::Display for TaskRegistry<G> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "graph LR")?;

        let ids: HashMap<TypeId, usize> = self
            .graph
            .nodes()
            .enumerate()
            .map(|(i, id)| (id, i))
            .collect();

        for (id, i) in ids.iter().map(|(id, i)| (*id, *i)) {
            let name = self.names.get(&id).copied().unwrap_or("<unknown>");
            writeln!(f, "    {}[\"{}\"]", i, name.replace('"', "\\\""))?;
        }

        for (from, to, _) in self.graph.all_edges() {
            writeln!(f, "    {} --> {}", ids[&from], ids[&to])?;
        }

        Ok(())
    }
}
