//! The terminal consumer of the pipeline.
//!
//! Artifacts emitted by output providers land here, indexed by path. The
//! sink only tracks what the current content of every path is; turning an
//! artifact into text is left to a [`Render`] implementation, and only
//! artifacts whose content changed since they were last written are rendered
//! again. Artifacts that stop being produced are retracted, and their files
//! are deleted on the next render.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

use crate::core::Hash32;
use crate::error::SinkError;
use crate::snapshot::Snapshot;

/// A generated source file, described by what it contains rather than by
/// its text.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Artifact {
    /// Destination path, relative to the output root.
    pub path: Utf8PathBuf,
    pub namespace: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub declarations: Vec<String>,
    /// Diagnostic codes the consumer should not report for this file.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suppressed: Vec<String>,
}

impl Artifact {
    /// Starts an empty artifact. The path is normalized, so `a/./b/../c.cs`
    /// and `a/c.cs` refer to the same artifact.
    pub fn new(path: impl AsRef<Utf8Path>, namespace: impl Into<String>) -> Self {
        Self {
            path: normalize_path(path.as_ref()),
            namespace: namespace.into(),
            imports: Vec::new(),
            declarations: Vec::new(),
            suppressed: Vec::new(),
        }
    }

    pub fn import(mut self, import: impl Into<String>) -> Self {
        self.imports.push(import.into());
        self
    }

    pub fn declare(mut self, declaration: impl Into<String>) -> Self {
        self.declarations.push(declaration.into());
        self
    }

    pub fn suppress(mut self, code: impl Into<String>) -> Self {
        self.suppressed.push(code.into());
        self
    }
}

/// Normalize a path, removing things like `.` and `..`.
///
/// Symlinks are not resolved, the path is only treated lexically.
fn normalize_path(path: &Utf8Path) -> Utf8PathBuf {
    let mut components = path.components().peekable();
    let mut ret = if let Some(c @ Utf8Component::Prefix(..)) = components.peek().cloned() {
        components.next();
        Utf8PathBuf::from(c.as_str())
    } else {
        Utf8PathBuf::new()
    };

    for component in components {
        match component {
            Utf8Component::Prefix(..) => {}
            Utf8Component::RootDir => {
                ret.push(Utf8Component::RootDir);
            }
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                if ret.ends_with(Utf8Component::ParentDir) {
                    ret.push(Utf8Component::ParentDir);
                } else {
                    let popped = ret.pop();
                    if !popped && !ret.has_root() {
                        ret.push(Utf8Component::ParentDir);
                    }
                }
            }
            Utf8Component::Normal(c) => {
                ret.push(c);
            }
        }
    }
    ret
}

/// Turns an artifact into the text of a file.
pub trait Render {
    fn render(&self, artifact: &Artifact) -> anyhow::Result<String>;
}

impl<F> Render for F
where
    F: Fn(&Artifact) -> anyhow::Result<String>,
{
    fn render(&self, artifact: &Artifact) -> anyhow::Result<String> {
        self(artifact)
    }
}

/// What [`ArtifactSink::emit`] did with an artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emission {
    /// First artifact under its path.
    Added,
    /// Identical to what was already registered under the path.
    Unchanged,
    /// Overwrote different content under the same path.
    Replaced,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EmitSummary {
    pub added: usize,
    pub unchanged: usize,
    pub replaced: usize,
    /// Artifacts retracted because no output produced them any more.
    pub removed: usize,
}

impl EmitSummary {
    pub fn record(&mut self, emission: Emission) {
        match emission {
            Emission::Added => self.added += 1,
            Emission::Unchanged => self.unchanged += 1,
            Emission::Replaced => self.replaced += 1,
        }
    }

    /// Number of artifacts emitted, retractions not included.
    pub fn total(&self) -> usize {
        self.added + self.unchanged + self.replaced
    }

    /// Whether anything new reached the sink.
    pub fn changed(&self) -> bool {
        self.added + self.replaced + self.removed > 0
    }
}

impl std::ops::AddAssign for EmitSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.added += rhs.added;
        self.unchanged += rhs.unchanged;
        self.replaced += rhs.replaced;
        self.removed += rhs.removed;
    }
}

#[derive(Debug, Clone)]
struct Entry {
    artifact: Artifact,
    fingerprint: Hash32,
    /// Fingerprint of the content last written to disk.
    rendered: Option<Hash32>,
}

impl Entry {
    fn is_pending(&self) -> bool {
        self.rendered != Some(self.fingerprint)
    }
}

#[derive(Serialize)]
struct ManifestEntry<'a> {
    path: &'a Utf8Path,
    namespace: &'a str,
    hash: String,
}

/// The set of artifacts produced by a session, one per path.
#[derive(Debug, Clone, Default)]
pub struct ArtifactSink {
    entries: BTreeMap<Utf8PathBuf, Entry>,
    /// Retracted paths that were written before and still exist on disk.
    retracted: BTreeSet<Utf8PathBuf>,
}

impl ArtifactSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an artifact. Emitting the same content twice is a no-op;
    /// different content under an existing path replaces it.
    pub fn emit(&mut self, artifact: Artifact) -> Emission {
        let fingerprint = Hash32::of(&artifact);

        match self.entries.get_mut(&artifact.path) {
            Some(entry) if entry.fingerprint == fingerprint && entry.artifact == artifact => {
                Emission::Unchanged
            }
            Some(entry) => {
                tracing::info!(path = %artifact.path, "artifact replaced");
                entry.artifact = artifact;
                entry.fingerprint = fingerprint;
                Emission::Replaced
            }
            None => {
                tracing::debug!(path = %artifact.path, "artifact added");
                self.retracted.remove(&artifact.path);
                self.entries.insert(
                    artifact.path.clone(),
                    Entry {
                        artifact,
                        fingerprint,
                        rendered: None,
                    },
                );
                Emission::Added
            }
        }
    }

    pub fn emit_all(&mut self, artifacts: &Snapshot<Artifact>) -> EmitSummary {
        let mut summary = EmitSummary::default();
        for artifact in artifacts {
            summary.record(self.emit(artifact.clone()));
        }
        summary
    }

    /// Drops every artifact whose path is not in `live` and returns how many
    /// were dropped. Files already written for them are deleted by the next
    /// [`render_pending`](Self::render_pending).
    pub fn retain(&mut self, live: &BTreeSet<Utf8PathBuf>) -> usize {
        let before = self.entries.len();
        let retracted = &mut self.retracted;

        self.entries.retain(|path, entry| {
            if live.contains(path) {
                return true;
            }
            tracing::info!(path = %path, "artifact retracted");
            if entry.rendered.is_some() {
                retracted.insert(path.clone());
            }
            false
        });

        before - self.entries.len()
    }

    /// Paths retracted since the last render whose files are still on disk.
    pub fn retracted(&self) -> impl Iterator<Item = &Utf8Path> {
        self.retracted.iter().map(|path| path.as_path())
    }

    pub fn get(&self, path: impl AsRef<Utf8Path>) -> Option<&Artifact> {
        self.entries
            .get(&normalize_path(path.as_ref()))
            .map(|entry| &entry.artifact)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// All artifacts, in path order.
    pub fn iter(&self) -> impl Iterator<Item = &Artifact> {
        self.entries.values().map(|entry| &entry.artifact)
    }

    /// Artifacts whose path matches a glob pattern.
    pub fn glob(&self, pattern: &str) -> Result<Vec<&Artifact>, SinkError> {
        let pattern = glob::Pattern::new(pattern)?;

        Ok(self
            .entries
            .iter()
            .filter(|(path, _)| pattern.matches(path.as_str()))
            .map(|(_, entry)| &entry.artifact)
            .collect())
    }

    /// Artifacts whose current content has not been written yet.
    pub fn pending(&self) -> impl Iterator<Item = &Artifact> {
        self.entries
            .values()
            .filter(|entry| entry.is_pending())
            .map(|entry| &entry.artifact)
    }

    /// Deletes the files of retracted artifacts, then writes every pending
    /// artifact under `root` and returns the written paths. An artifact that
    /// fails to render stays pending.
    pub fn render_pending<R>(
        &mut self,
        root: impl AsRef<Utf8Path>,
        renderer: &R,
    ) -> Result<Vec<Utf8PathBuf>, SinkError>
    where
        R: Render + ?Sized,
    {
        let root = root.as_ref();
        let mut written = Vec::new();

        let mut deleted = 0;
        while let Some(path) = self.retracted.pop_first() {
            match fs::remove_file(root.join(&path)) {
                Ok(()) => deleted += 1,
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    self.retracted.insert(path);
                    return Err(e.into());
                }
            }
        }

        if deleted > 0 {
            tracing::info!(root = %root, count = deleted, "retracted artifacts deleted");
        }

        for (path, entry) in self.entries.iter_mut().filter(|(_, e)| e.is_pending()) {
            let text = renderer
                .render(&entry.artifact)
                .map_err(|e| SinkError::Render(path.to_string(), e))?;

            let file_path = root.join(path);
            if let Some(parent) = file_path.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&file_path, text)?;

            entry.rendered = Some(entry.fingerprint);
            written.push(file_path);
        }

        if !written.is_empty() {
            tracing::info!(root = %root, count = written.len(), "artifacts written");
        }

        Ok(written)
    }

    /// The artifact index as JSON: path, namespace and content hash of every
    /// artifact.
    pub fn manifest(&self) -> Result<String, SinkError> {
        let entries: Vec<ManifestEntry<'_>> = self
            .entries
            .iter()
            .map(|(path, entry)| ManifestEntry {
                path,
                namespace: &entry.artifact.namespace,
                hash: entry.fingerprint.to_hex(),
            })
            .collect();

        Ok(serde_json::to_string_pretty(&entries)?)
    }

    pub fn write_manifest(&self, path: impl AsRef<Utf8Path>) -> Result<(), SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.manifest()?)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> Utf8PathBuf {
        let dir = std::env::temp_dir().join(format!("tsumugi-{}-{}", name, std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        Utf8PathBuf::from_path_buf(dir).unwrap()
    }

    fn guild() -> Artifact {
        Artifact::new("Api/Guild.cs", "Api")
            .import("System")
            .declare("class Guild {}")
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(Utf8Path::new("a/./b/../c.cs")), "a/c.cs");
        assert_eq!(normalize_path(Utf8Path::new("../a.cs")), "../a.cs");
    }

    #[test]
    fn test_emit_is_idempotent() {
        let mut sink = ArtifactSink::new();

        assert_eq!(sink.emit(guild()), Emission::Added);
        assert_eq!(sink.emit(guild()), Emission::Unchanged);
        assert_eq!(sink.len(), 1);
    }

    #[test]
    fn test_emit_last_wins() {
        let mut sink = ArtifactSink::new();
        sink.emit(guild());

        let other = Artifact::new("Api/./Guild.cs", "Api").declare("class Other {}");
        assert_eq!(sink.emit(other.clone()), Emission::Replaced);
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.get("Api/Guild.cs"), Some(&other));
    }

    #[test]
    fn test_emit_all_summary() {
        let mut sink = ArtifactSink::new();
        sink.emit(guild());

        let batch = Snapshot::new(vec![
            guild(),
            Artifact::new("Api/User.cs", "Api"),
            Artifact::new("Api/Guild.cs", "Api"),
        ]);
        let summary = sink.emit_all(&batch);

        assert_eq!(
            summary,
            EmitSummary {
                added: 1,
                unchanged: 1,
                replaced: 1,
                removed: 0,
            }
        );
        assert_eq!(summary.total(), 3);
        assert!(summary.changed());
    }

    #[test]
    fn test_glob() {
        let mut sink = ArtifactSink::new();
        sink.emit(guild());
        sink.emit(Artifact::new("Api/User.cs", "Api"));
        sink.emit(Artifact::new("Models/User.cs", "Models"));

        let api = sink.glob("Api/*.cs").unwrap();
        assert_eq!(api.len(), 2);
        assert!(sink.glob("[").is_err());
    }

    #[test]
    fn test_render_pending_writes_once() {
        let root = scratch("render");
        let mut sink = ArtifactSink::new();
        sink.emit(guild());

        let renderer = |artifact: &Artifact| -> anyhow::Result<String> {
            Ok(format!(
                "namespace {};\n{}",
                artifact.namespace,
                artifact.declarations.join("\n")
            ))
        };

        let written = sink.render_pending(&root, &renderer).unwrap();
        assert_eq!(written, vec![root.join("Api/Guild.cs")]);
        assert_eq!(
            fs::read_to_string(root.join("Api/Guild.cs")).unwrap(),
            "namespace Api;\nclass Guild {}"
        );

        // Same content again: nothing to do.
        sink.emit(guild());
        assert_eq!(sink.pending().count(), 0);
        assert!(sink.render_pending(&root, &renderer).unwrap().is_empty());

        sink.emit(guild().declare("class Extra {}"));
        assert_eq!(sink.pending().count(), 1);
        assert_eq!(sink.render_pending(&root, &renderer).unwrap().len(), 1);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_render_failure_stays_pending() {
        let root = scratch("render-failure");
        let mut sink = ArtifactSink::new();
        sink.emit(guild());

        let broken = |_: &Artifact| -> anyhow::Result<String> { anyhow::bail!("no template") };
        let err = sink.render_pending(&root, &broken).unwrap_err();

        assert!(matches!(err, SinkError::Render(ref path, _) if path == "Api/Guild.cs"));
        assert_eq!(sink.pending().count(), 1);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_retain_drops_stale_artifacts() {
        let root = scratch("retain");
        let renderer = |artifact: &Artifact| -> anyhow::Result<String> {
            Ok(artifact.namespace.clone())
        };

        let mut sink = ArtifactSink::new();
        sink.emit(guild());
        sink.emit(Artifact::new("Api/User.cs", "Api"));
        sink.emit(Artifact::new("Api/Role.cs", "Api"));
        sink.render_pending(&root, &renderer).unwrap();
        assert!(root.join("Api/Guild.cs").exists());

        let live = BTreeSet::from([Utf8PathBuf::from("Api/User.cs")]);
        assert_eq!(sink.retain(&live), 2);
        assert_eq!(sink.iter().map(|a| a.path.as_str()).collect::<Vec<_>>(), ["Api/User.cs"]);
        assert_eq!(sink.retracted().count(), 2);
        assert!(!sink.manifest().unwrap().contains("Guild"));

        // Coming back before the next render cancels the deletion.
        sink.emit(Artifact::new("Api/Role.cs", "Api"));
        assert_eq!(sink.retracted().collect::<Vec<_>>(), [Utf8Path::new("Api/Guild.cs")]);

        let written = sink.render_pending(&root, &renderer).unwrap();
        assert_eq!(written, vec![root.join("Api/Role.cs")]);
        assert!(!root.join("Api/Guild.cs").exists());
        assert!(root.join("Api/User.cs").exists());
        assert_eq!(sink.retracted().count(), 0);

        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_retain_unrendered_leaves_nothing_to_delete() {
        let mut sink = ArtifactSink::new();
        sink.emit(guild());

        assert_eq!(sink.retain(&BTreeSet::new()), 1);
        assert!(sink.is_empty());
        assert_eq!(sink.retracted().count(), 0);
    }

    #[test]
    fn test_manifest() {
        let mut sink = ArtifactSink::new();
        sink.emit(guild());

        let manifest: serde_json::Value = serde_json::from_str(&sink.manifest().unwrap()).unwrap();
        let entries = manifest.as_array().unwrap();

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0]["path"], "Api/Guild.cs");
        assert_eq!(entries[0]["namespace"], "Api");
        assert_eq!(entries[0]["hash"].as_str().unwrap().len(), 64);
    }

    #[test]
    fn test_artifact_serde() {
        let artifact = guild().suppress("CS0618");
        let json = serde_json::to_string(&artifact).unwrap();
        let back: Artifact = serde_json::from_str(&json).unwrap();

        assert_eq!(back, artifact);
        assert!(!json.contains("\"imports\":[]"));
    }
}
