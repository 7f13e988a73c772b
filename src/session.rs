//! One generation run, from task construction to the final artifact set.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use camino::Utf8PathBuf;
use petgraph::graph::NodeIndex;

use crate::cancel::Cancellation;
use crate::config::Config;
use crate::core::{Environment, Item};
use crate::diagnostics::{Diagnostics, Fault};
use crate::engine::{Engine, Handle, Provider};
use crate::error::{EngineError, RegistryError, SessionError};
use crate::registry::{Blueprint, Task, TaskRegistry};
use crate::sink::{ArtifactSink, Render};

/// Everything a session leaves behind.
#[derive(Debug)]
pub struct Summary {
    pub sink: ArtifactSink,
    pub faults: Vec<Fault>,
    /// Flushed log lines, per task.
    pub logs: BTreeMap<&'static str, Vec<String>>,
}

/// Owns the engine, the task instances and the artifact sink of one run.
///
/// Nothing is shared between sessions, so any number of them can exist at
/// the same time.
pub struct Session<G: Send + Sync = ()> {
    engine: Engine,
    registry: TaskRegistry<G>,
    sink: ArtifactSink,
    env: Environment<G>,
    config: Config,
    faults: Vec<Fault>,
    /// Paths each output produced the last time it evaluated successfully.
    produced: BTreeMap<NodeIndex, BTreeSet<Utf8PathBuf>>,
}

impl<G: Send + Sync> Session<G> {
    /// Starts a session and builds every task of the blueprint.
    ///
    /// A task that fails to build is recorded as a [`Fault`] and the session
    /// goes on with what could be built, unless [`Config::fail_fast`] is set.
    pub fn begin(
        blueprint: &Blueprint<G>,
        env: Environment<G>,
        config: Config,
    ) -> Result<Self, SessionError> {
        let mut session = Self {
            engine: Engine::new(),
            registry: TaskRegistry::new(),
            sink: ArtifactSink::new(),
            env,
            config,
            faults: Vec::new(),
            produced: BTreeMap::new(),
        };

        tracing::info!(generator = session.env.generator, tasks = blueprint.len(), "session started");

        let initialized = session
            .registry
            .initialize(blueprint, &mut session.engine, &session.env);

        if let Err(err) = initialized {
            if session.config.fail_fast {
                return Err(err.into());
            }

            tracing::warn!("continuing with {} tasks", session.registry.len());
            session.faults.push(Fault::Task(err));
        }

        Ok(session)
    }

    /// The instance of a task, built on demand if the blueprint did not
    /// contain it.
    pub fn get<T: Task<G>>(&mut self) -> Result<Arc<T>, RegistryError> {
        self.registry.get_or_create::<T>(&mut self.engine, &self.env)
    }

    pub fn set_input<T, I>(&mut self, input: Provider<T>, items: I) -> Result<bool, EngineError>
    where
        T: Item,
        I: IntoIterator<Item = T>,
    {
        self.engine.set_input(input, items)
    }

    pub fn pull<H: Handle>(
        &mut self,
        handle: H,
        cancel: &Cancellation,
    ) -> Result<Arc<H::Output>, EngineError> {
        self.engine.pull(handle, cancel)
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn engine_mut(&mut self) -> &mut Engine {
        &mut self.engine
    }

    pub fn registry(&self) -> &TaskRegistry<G> {
        &self.registry
    }

    pub fn sink(&self) -> &ArtifactSink {
        &self.sink
    }

    pub fn env(&self) -> &Environment<G> {
        &self.env
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Faults recorded so far, construction faults first.
    pub fn faults(&self) -> &[Fault] {
        &self.faults
    }

    /// Evaluates every output and emits the results into the sink.
    ///
    /// An output that fails is recorded as a fault and skipped, the others
    /// still emit. A faulted output keeps the artifacts of its last
    /// successful pass. Any other artifact that no output produced in this
    /// pass is retracted from the sink. Cancellation aborts the whole pass
    /// and leaves the sink as it was.
    pub fn run(&mut self, cancel: &Cancellation) -> Result<Diagnostics, SessionError> {
        let mut diagnostics = Diagnostics {
            revision: self.engine.revision(),
            ..Default::default()
        };

        // The sink is only touched once every output has been evaluated.
        let mut evaluated = Vec::new();

        for output in self.engine.outputs().to_vec() {
            match self.engine.pull(output, cancel) {
                Ok(artifacts) => evaluated.push((output.index(), artifacts)),
                Err(EngineError::Cancelled) => {
                    self.engine.take_trace();
                    return Err(EngineError::Cancelled.into());
                }
                Err(error) => {
                    let stage = self
                        .engine
                        .name(output.index())
                        .unwrap_or_default()
                        .to_string();
                    tracing::error!(output = %stage, "output skipped");
                    diagnostics.faults.push(Fault::Output { stage, error });
                }
            }
        }

        for (output, artifacts) in evaluated {
            diagnostics.emitted += self.sink.emit_all(&artifacts);
            let paths = artifacts.iter().map(|a| a.path.clone()).collect();
            self.produced.insert(output, paths);
        }

        let live: BTreeSet<Utf8PathBuf> = self.produced.values().flatten().cloned().collect();
        diagnostics.emitted.removed = self.sink.retain(&live);

        let trace = self.engine.take_trace();
        diagnostics.execution_times = trace.executions;
        diagnostics.reused = trace.reused;
        diagnostics.unchanged = trace.unchanged;

        self.faults.extend(diagnostics.faults.iter().cloned());

        tracing::info!(
            revision = diagnostics.revision.0,
            executed = diagnostics.execution_times.len(),
            reused = diagnostics.reused,
            removed = diagnostics.emitted.removed,
            "pass finished"
        );

        Ok(diagnostics)
    }

    /// Writes the pending artifacts under the configured output directory,
    /// then the manifest if one is configured.
    pub fn render<R>(&mut self, renderer: &R) -> Result<Vec<Utf8PathBuf>, SessionError>
    where
        R: Render + ?Sized,
    {
        let written = self.sink.render_pending(&self.config.out_dir, renderer)?;

        if let Some(manifest) = &self.config.manifest {
            self.sink.write_manifest(manifest)?;
        }

        Ok(written)
    }

    /// Ends the session, flushing the log of every task.
    pub fn end(self) -> Summary {
        let mut logs = BTreeMap::new();

        for log in self.registry.logs() {
            log.flush();
            let lines = log.lines();
            if !lines.is_empty() {
                logs.insert(log.task(), lines);
            }
        }

        tracing::info!(
            artifacts = self.sink.len(),
            faults = self.faults.len(),
            "session ended"
        );

        Summary {
            sink: self.sink,
            faults: self.faults,
            logs,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::registry::Construct;
    use crate::sink::Artifact;
    use crate::snapshot::Snapshot;

    #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
    struct Route {
        actor: &'static str,
        method: &'static str,
    }

    fn route(actor: &'static str, method: &'static str) -> Route {
        Route { actor, method }
    }

    struct Routes {
        feed: Provider<Route>,
    }

    impl Task for Routes {
        fn build(cx: &mut Construct<'_>) -> anyhow::Result<Self> {
            let feed = cx.engine().input("routes");
            Ok(Routes { feed })
        }
    }

    /// One artifact per actor, listing its methods.
    struct Files {
        artifacts: Provider<Artifact>,
    }

    impl Task for Files {
        fn build(cx: &mut Construct<'_>) -> anyhow::Result<Self> {
            let routes = cx.require::<Routes>()?;
            let log = cx.log().clone();
            let engine = cx.engine();

            let by_actor = engine.group_by(routes.feed, |r| r.actor, |r| r.method);
            let groups = engine.groups(by_actor);
            let artifacts = engine.select(groups, move |(actor, methods)| {
                log.line(format!("rendering {actor}"));
                methods
                    .iter()
                    .fold(Artifact::new(format!("{actor}.cs"), "Api"), |a, m| {
                        a.declare(format!("void {m}()"))
                    })
            });
            let artifacts = engine.label(artifacts, "files");
            engine.output(artifacts);

            Ok(Files { artifacts })
        }
    }

    struct Broken;

    impl Task for Broken {
        fn build(_: &mut Construct<'_>) -> anyhow::Result<Self> {
            anyhow::bail!("no schema")
        }
    }

    fn blueprint() -> Blueprint {
        let mut blueprint = Blueprint::new();
        blueprint.task::<Files>();
        blueprint
    }

    #[test]
    fn test_incremental_runs() {
        let cancel = Cancellation::new();
        let mut session = Session::begin(&blueprint(), Environment::default(), Config::default())
            .unwrap();
        let feed = session.get::<Routes>().unwrap().feed;

        session
            .set_input(feed, [route("guild", "get"), route("user", "get"), route("guild", "delete")])
            .unwrap();
        let first = session.run(&cancel).unwrap();
        assert!(first.is_ok());
        assert_eq!(first.emitted.added, 2);
        assert_eq!(
            session.sink().get("guild.cs").unwrap().declarations,
            vec!["void get()", "void delete()"]
        );

        // Nothing changed: nothing runs, nothing new is emitted.
        let second = session.run(&cancel).unwrap();
        assert!(second.execution_times.is_empty());
        assert_eq!(second.emitted.unchanged, 2);
        assert!(!second.emitted.changed());

        session
            .set_input(feed, [route("guild", "get"), route("user", "get"), route("user", "put")])
            .unwrap();
        let third = session.run(&cancel).unwrap();
        assert_eq!(third.emitted.replaced, 2);

        let summary = session.end();
        assert_eq!(summary.sink.len(), 2);
        assert!(summary.faults.is_empty());

        let files = summary
            .logs
            .iter()
            .find(|(task, _)| task.ends_with("Files"))
            .map(|(_, lines)| lines.clone())
            .unwrap();
        assert_eq!(files.len(), 4);
    }

    #[test]
    fn test_same_task_instance() {
        let mut session = Session::begin(&blueprint(), Environment::default(), Config::default())
            .unwrap();

        let a = session.get::<Files>().unwrap();
        let b = session.get::<Files>().unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(a.artifacts, b.artifacts);
        assert_eq!(session.engine().outputs(), &[a.artifacts]);
        assert_eq!(session.registry().len(), 2);
    }

    #[test]
    fn test_degraded_session() {
        let mut blueprint = blueprint();
        blueprint.task::<Broken>();

        let mut session =
            Session::begin(&blueprint, Environment::default(), Config::default()).unwrap();

        assert_eq!(session.faults().len(), 1);
        assert!(matches!(session.faults()[0], Fault::Task(RegistryError::Construction(..))));
        assert!(session.get::<Files>().is_ok());
        assert!(session.get::<Broken>().is_err());
    }

    #[test]
    fn test_fail_fast() {
        let mut blueprint = blueprint();
        blueprint.task::<Broken>();

        let config = Config {
            fail_fast: true,
            ..Config::default()
        };

        let result = Session::begin(&blueprint, Environment::default(), config);
        assert!(matches!(result, Err(SessionError::Registry(_))));
    }

    #[test]
    fn test_faulted_output_is_skipped() {
        let cancel = Cancellation::new();
        let mut session =
            Session::begin(&Blueprint::new(), Environment::default(), Config::default()).unwrap();

        let engine = session.engine_mut();
        let names = engine.input::<&'static str>("names");
        let good = engine.select(names, |name| Artifact::new(format!("{name}.cs"), "Api"));
        let bad = engine.derive("bad", names, |_, _| -> anyhow::Result<Snapshot<Artifact>> {
            anyhow::bail!("template missing")
        });
        engine.output(bad);
        engine.output(good);

        session.set_input(names, ["guild"]).unwrap();
        let diagnostics = session.run(&cancel).unwrap();

        assert_eq!(diagnostics.emitted.added, 1);
        assert_eq!(diagnostics.faults.len(), 1);
        assert!(matches!(&diagnostics.faults[0], Fault::Output { stage, .. } if stage == "bad"));
        assert_eq!(session.faults().len(), 1);
    }

    fn sink_paths<G: Send + Sync>(session: &Session<G>) -> Vec<&str> {
        session.sink().iter().map(|a| a.path.as_str()).collect()
    }

    #[test]
    fn test_shrinking_input_retracts_artifacts() {
        let root = std::env::temp_dir().join(format!("tsumugi-shrink-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let root = Utf8PathBuf::from_path_buf(root).unwrap();

        let config = Config {
            out_dir: root.join("out"),
            manifest: Some(root.join("manifest.json")),
            ..Config::default()
        };

        let cancel = Cancellation::new();
        let mut session = Session::begin(&Blueprint::new(), Environment::default(), config).unwrap();

        let engine = session.engine_mut();
        let names = engine.input::<&'static str>("names");
        let files = engine.select(names, |name| Artifact::new(format!("{name}.cs"), "Api"));
        engine.output(files);

        let renderer = |artifact: &Artifact| -> anyhow::Result<String> {
            Ok(artifact.namespace.clone())
        };

        session.set_input(names, ["guild", "user"]).unwrap();
        session.run(&cancel).unwrap();
        session.render(&renderer).unwrap();
        assert!(root.join("out/guild.cs").exists());

        session.set_input(names, ["user"]).unwrap();
        let diagnostics = session.run(&cancel).unwrap();

        assert_eq!(diagnostics.emitted.unchanged, 1);
        assert_eq!(diagnostics.emitted.removed, 1);
        assert!(diagnostics.emitted.changed());
        assert_eq!(sink_paths(&session), ["user.cs"]);
        assert_eq!(session.sink().pending().count(), 0);

        assert!(session.render(&renderer).unwrap().is_empty());
        assert!(!root.join("out/guild.cs").exists());
        assert!(root.join("out/user.cs").exists());

        let manifest = fs::read_to_string(root.join("manifest.json")).unwrap();
        assert!(manifest.contains("user.cs"));
        assert!(!manifest.contains("guild.cs"));

        let summary = session.end();
        assert_eq!(summary.sink.len(), 1);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_faulted_output_keeps_last_artifacts() {
        let cancel = Cancellation::new();
        let mut session =
            Session::begin(&Blueprint::new(), Environment::default(), Config::default()).unwrap();

        let engine = session.engine_mut();
        let names = engine.input::<&'static str>("names");
        let files = engine.derive(
            "files",
            names,
            |_, names| -> anyhow::Result<Snapshot<Artifact>> {
                if names.iter().any(|name| *name == "unknown") {
                    anyhow::bail!("no template for unknown");
                }
                Ok(Snapshot::new(
                    names
                        .iter()
                        .map(|name| Artifact::new(format!("{name}.cs"), "Api"))
                        .collect(),
                ))
            },
        );
        let roles = engine.select(names, |name| Artifact::new(format!("{name}Role.cs"), "Roles"));
        engine.output(files);
        engine.output(roles);

        session.set_input(names, ["guild"]).unwrap();
        session.run(&cancel).unwrap();
        assert_eq!(sink_paths(&session), ["guild.cs", "guildRole.cs"]);

        // The failing output keeps what it produced last time; the healthy
        // one moves on and drops what it no longer produces.
        session.set_input(names, ["unknown"]).unwrap();
        let degraded = session.run(&cancel).unwrap();
        assert_eq!(degraded.faults.len(), 1);
        assert_eq!(degraded.emitted.added, 1);
        assert_eq!(degraded.emitted.removed, 1);
        assert_eq!(sink_paths(&session), ["guild.cs", "unknownRole.cs"]);

        session.set_input(names, ["user"]).unwrap();
        let recovered = session.run(&cancel).unwrap();
        assert!(recovered.is_ok());
        assert_eq!(recovered.emitted.removed, 2);
        assert_eq!(sink_paths(&session), ["user.cs", "userRole.cs"]);
    }

    #[test]
    fn test_cancelled_run_leaves_sink_untouched() {
        let cancel = Cancellation::new();
        let mut session =
            Session::begin(&Blueprint::new(), Environment::default(), Config::default()).unwrap();

        let engine = session.engine_mut();
        let names = engine.input::<&'static str>("names");
        let files = engine.select(names, |name| Artifact::new(format!("{name}.cs"), "Api"));
        let stop = cancel.clone();
        let late = engine.derive("late", names, move |_, _| -> anyhow::Result<Snapshot<Artifact>> {
            stop.cancel();
            Ok(Snapshot::empty())
        });
        let gated = engine.derive("gated", late, |cx, late| {
            cx.checkpoint()?;
            Ok((*late).clone())
        });
        engine.output(files);
        engine.output(gated);

        session.set_input(names, ["guild"]).unwrap();
        let err = session.run(&cancel).unwrap_err();

        assert!(matches!(err, SessionError::Engine(EngineError::Cancelled)));
        assert!(session.sink().is_empty());
    }

    #[test]
    fn test_cancelled_run() {
        let mut session = Session::begin(&blueprint(), Environment::default(), Config::default())
            .unwrap();
        let feed = session.get::<Routes>().unwrap().feed;
        session.set_input(feed, [route("guild", "get")]).unwrap();

        let cancel = Cancellation::new();
        cancel.cancel();

        let err = session.run(&cancel).unwrap_err();
        assert!(matches!(err, SessionError::Engine(EngineError::Cancelled)));
        assert!(session.sink().is_empty());
    }

    #[test]
    fn test_render_with_manifest() {
        let root = std::env::temp_dir().join(format!("tsumugi-session-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        let root = Utf8PathBuf::from_path_buf(root).unwrap();

        let config = Config {
            out_dir: root.join("out"),
            manifest: Some(root.join("manifest.json")),
            ..Config::default()
        };

        let mut session = Session::begin(&blueprint(), Environment::default(), config).unwrap();
        let feed = session.get::<Routes>().unwrap().feed;
        session.set_input(feed, [route("guild", "get")]).unwrap();
        session.run(&Cancellation::new()).unwrap();

        let renderer = |artifact: &Artifact| -> anyhow::Result<String> {
            Ok(artifact.declarations.join("\n"))
        };
        let written = session.render(&renderer).unwrap();

        assert_eq!(written, vec![root.join("out/guild.cs")]);
        assert_eq!(fs::read_to_string(root.join("out/guild.cs")).unwrap(), "void get()");
        assert!(root.join("manifest.json").exists());
        assert!(session.render(&renderer).unwrap().is_empty());

        let _ = fs::remove_dir_all(&root);
    }
}
