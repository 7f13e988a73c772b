use std::sync::Arc;

use thiserror::Error;

/// A shared, cloneable wrapper around an error coming from user code.
#[derive(Debug, Clone)]
pub struct UserError(pub(crate) Arc<anyhow::Error>);

impl UserError {
    pub fn new(err: impl Into<anyhow::Error>) -> Self {
        Self(Arc::new(err.into()))
    }

    /// Attempts to view the wrapped error as a concrete type.
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        self.0.downcast_ref::<E>()
    }
}

impl std::fmt::Display for UserError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for UserError {}

impl From<anyhow::Error> for UserError {
    fn from(e: anyhow::Error) -> Self {
        UserError(Arc::new(e))
    }
}

/// Errors raised while building or evaluating the stage graph.
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Fan-out requires at least one branch")]
    EmptyBranches,

    #[error("Evaluation was cancelled")]
    Cancelled,

    #[error("Stage '{0}':\n{1}")]
    Stage(String, UserError),

    #[error("Stage #{0} does not exist in this engine")]
    UnknownStage(usize),

    #[error("Stage '{0}' is not an input feed")]
    NotAnInput(String),

    #[error("Stage '{0}' has no output in the current revision")]
    NotReady(String),

    #[error("Stage '{name}' does not produce {expected}")]
    TypeMismatch {
        name: String,
        expected: &'static str,
    },
}

/// Errors raised by the task registry.
#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    #[error("Cycle detected while constructing tasks: {}", .0.join(" -> "))]
    CycleDetected(Vec<&'static str>),

    #[error("Task '{found}' is registered where {expected} was requested")]
    TaskMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("Task '{0}':\n{1}")]
    Construction(&'static str, UserError),
}

impl RegistryError {
    /// Internal invariant violations, never recoverable by the caller.
    pub fn is_invariant(&self) -> bool {
        matches!(
            self,
            RegistryError::CycleDetected(_) | RegistryError::TaskMismatch { .. }
        )
    }
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    GlobPattern(#[from] glob::PatternError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error("Couldn't render artifact '{0}':\n{1}")]
    Render(String, anyhow::Error),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Couldn't read config file.\n{0}")]
    Io(#[from] std::io::Error),

    #[error("Couldn't parse config.\n{0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Error while initializing tasks:\n{0}")]
    Registry(#[from] RegistryError),

    #[error("Error while evaluating the pipeline:\n{0}")]
    Engine(#[from] EngineError),

    #[error("Error while writing artifacts:\n{0}")]
    Sink(#[from] SinkError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}
