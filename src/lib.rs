#![forbid(unsafe_code)]
#![doc = include_str!("../README.md")]

mod cancel;
mod config;
mod core;
mod diagnostics;
mod engine;
mod error;
mod keyed;
mod log;
#[cfg(feature = "logging")]
mod logging;
mod registry;
mod session;
mod sink;
mod snapshot;
mod utils;

pub use crate::cancel::Cancellation;
pub use crate::config::Config;
pub use crate::core::{Environment, Hash32, Item, Key, Value};
pub use crate::diagnostics::{Diagnostics, Fault};
pub use crate::engine::{
    Dependencies, Engine, Grouped, Handle, Keyed, Provider, Revision, StageContext, TaskExecution,
};
pub use crate::error::*;
pub use crate::keyed::{GroupingMap, KeyedMap};
pub use crate::log::TaskLog;
#[cfg(feature = "logging")]
pub use crate::logging::init_logging;
pub use crate::registry::{Blueprint, Construct, Task, TaskRegistry};
pub use crate::session::{Session, Summary};
pub use crate::sink::{Artifact, ArtifactSink, EmitSummary, Emission, Render};
pub use crate::snapshot::Snapshot;
