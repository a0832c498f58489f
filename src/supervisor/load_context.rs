//! Isolated load contexts.
//!
//! A [`LoadContext`] is an ordered chain of resource sources queried front to
//! back. A module's context always puts the module's own archive first and the
//! host's sources after it, so a file bundled by the module shadows the host's
//! copy of the same name.
//!
//! While an instance starts and runs, its context is the *ambient* context of
//! that task (see [`LoadContext::scope`] and [`current`]). The ambient context is
//! task-local: concurrent module tasks never observe each other's context.

use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::future::Future;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex};

use zip::ZipArchive;

use super::error::ResolveError;
use super::module_loader::{Artifact, ModuleReference};

tokio::task_local! {
    static ACTIVE_CONTEXT: Arc<LoadContext>;
}

/// The context activated for the current task, if any.
///
/// Task-locals are not inherited by `tokio::spawn`; read the context before
/// spawning helper tasks.
pub fn current() -> Option<Arc<LoadContext>> {
    ACTIVE_CONTEXT.try_with(Arc::clone).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Bundled by the module itself.
    Module,
    /// Provided by the launcher host.
    Host,
}

/// One resolved resource.
#[derive(Debug, Clone)]
pub struct Resource {
    pub name: String,
    pub origin: Origin,
    pub source: String,
    pub data: Vec<u8>,
}

impl Resource {
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// A single link in a resolution chain.
pub trait ResourceSource: Send + Sync + fmt::Debug {
    /// Human readable label used in logs.
    fn label(&self) -> &str;

    fn origin(&self) -> Origin;

    fn contains(&self, name: &str) -> bool;

    /// Reads a resource; `Ok(None)` when this source does not provide it.
    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>>;

    /// On-disk location of the resource, for sources backed by a directory.
    fn local_path(&self, _name: &str) -> Option<PathBuf> {
        None
    }
}

/// Rejects absolute names and names escaping the source root.
fn normalize(name: &str) -> Option<&str> {
    let name = name.trim_start_matches("./");
    let path = Path::new(name);
    if name.is_empty() || path.is_absolute() {
        return None;
    }
    path.components()
        .all(|c| matches!(c, Component::Normal(_)))
        .then_some(name)
}

// ─── Archive source ──────────────────────────────────────────

/// Resources bundled in a module archive. Each instance opens its own handle.
pub struct ArchiveSource {
    label: String,
    prefix: String,
    names: HashSet<String>,
    archive: Mutex<ZipArchive<fs::File>>,
}

impl ArchiveSource {
    pub fn open(artifact: &Artifact) -> Result<Self, ResolveError> {
        let file = fs::File::open(&artifact.path).map_err(|e| ResolveError::invalid(&artifact.path, e))?;
        let archive = ZipArchive::new(file).map_err(|e| ResolveError::invalid(&artifact.path, e))?;

        let names = archive
            .file_names()
            .filter_map(|n| n.strip_prefix(artifact.root_prefix.as_str()))
            .filter(|n| !n.is_empty() && !n.ends_with('/'))
            .map(String::from)
            .collect();

        Ok(Self {
            label: format!("module:{}", artifact.module),
            prefix: artifact.root_prefix.clone(),
            names,
            archive: Mutex::new(archive),
        })
    }
}

impl fmt::Debug for ArchiveSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveSource")
            .field("label", &self.label)
            .field("entries", &self.names.len())
            .finish()
    }
}

impl ResourceSource for ArchiveSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn origin(&self) -> Origin {
        Origin::Module
    }

    fn contains(&self, name: &str) -> bool {
        normalize(name).is_some_and(|n| self.names.contains(n))
    }

    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        let Some(name) = normalize(name).filter(|n| self.names.contains(*n)) else {
            return Ok(None);
        };
        let mut archive = self
            .archive
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "archive lock poisoned"))?;
        let mut entry = archive
            .by_name(&format!("{}{}", self.prefix, name))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        Ok(Some(data))
    }
}

// ─── Directory source ────────────────────────────────────────

/// Resources provided by a host directory.
#[derive(Debug, Clone)]
pub struct DirSource {
    label: String,
    root: PathBuf,
}

impl DirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            label: format!("host:{}", root.display()),
            root,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ResourceSource for DirSource {
    fn label(&self) -> &str {
        &self.label
    }

    fn origin(&self) -> Origin {
        Origin::Host
    }

    fn contains(&self, name: &str) -> bool {
        self.local_path(name).is_some()
    }

    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        match self.local_path(name) {
            Some(path) => fs::read(path).map(Some),
            None => Ok(None),
        }
    }

    fn local_path(&self, name: &str) -> Option<PathBuf> {
        let path = self.root.join(normalize(name)?);
        path.is_file().then_some(path)
    }
}

// ─── Load context ────────────────────────────────────────────

/// Ordered resolution chain. Built fresh for every module instance.
#[derive(Debug, Clone, Default)]
pub struct LoadContext {
    module: Option<ModuleReference>,
    sources: Vec<Arc<dyn ResourceSource>>,
    host_dirs: Vec<PathBuf>,
}

impl LoadContext {
    /// The launcher's own context: host directories only.
    pub fn host<I, P>(dirs: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        let host_dirs: Vec<PathBuf> = dirs.into_iter().map(Into::into).collect();
        let sources = host_dirs
            .iter()
            .map(|d| Arc::new(DirSource::new(d.clone())) as Arc<dyn ResourceSource>)
            .collect();
        Self {
            module: None,
            sources,
            host_dirs,
        }
    }

    /// Child-first context for `artifact`: the module's archive, then `host`.
    ///
    /// Opens a new archive handle; `host` is left untouched.
    pub fn build(artifact: &Artifact, host: &LoadContext) -> Result<Self, ResolveError> {
        let own: Arc<dyn ResourceSource> = Arc::new(ArchiveSource::open(artifact)?);
        let sources = std::iter::once(own).chain(host.sources.iter().cloned()).collect();
        Ok(Self {
            module: Some(artifact.module.clone()),
            sources,
            host_dirs: host.host_dirs.clone(),
        })
    }

    /// Builds a context from arbitrary sources, in lookup order.
    pub fn from_sources(module: Option<ModuleReference>, sources: Vec<Arc<dyn ResourceSource>>) -> Self {
        Self {
            module,
            sources,
            host_dirs: Vec::new(),
        }
    }

    pub fn module(&self) -> Option<&ModuleReference> {
        self.module.as_ref()
    }

    pub fn host_dirs(&self) -> &[PathBuf] {
        &self.host_dirs
    }

    pub fn source_labels(&self) -> Vec<&str> {
        self.sources.iter().map(|s| s.label()).collect()
    }

    /// First source in the chain providing `name`.
    pub fn resolve(&self, name: &str) -> io::Result<Option<Resource>> {
        for source in &self.sources {
            if let Some(data) = source.read(name)? {
                return Ok(Some(Resource {
                    name: name.to_string(),
                    origin: source.origin(),
                    source: source.label().to_string(),
                    data,
                }));
            }
        }
        Ok(None)
    }

    /// Every copy of `name`, in lookup order.
    pub fn resolve_all(&self, name: &str) -> io::Result<Vec<Resource>> {
        let mut found = Vec::new();
        for source in &self.sources {
            if let Some(data) = source.read(name)? {
                found.push(Resource {
                    name: name.to_string(),
                    origin: source.origin(),
                    source: source.label().to_string(),
                    data,
                });
            }
        }
        Ok(found)
    }

    pub fn origin_of(&self, name: &str) -> Option<Origin> {
        self.sources.iter().find(|s| s.contains(name)).map(|s| s.origin())
    }

    /// Whether the module itself wins the lookup for `name`.
    pub fn is_bundled(&self, name: &str) -> bool {
        self.origin_of(name) == Some(Origin::Module)
    }

    /// On-disk path of the winning source for `name`, when it has one.
    pub fn local_path(&self, name: &str) -> Option<PathBuf> {
        self.sources
            .iter()
            .find(|s| s.contains(name))
            .and_then(|s| s.local_path(name))
    }

    /// Runs `fut` with this context as the ambient context of the task.
    ///
    /// The activation ends when `fut` completes, is dropped, or panics.
    pub fn scope<F>(self: Arc<Self>, fut: F) -> impl Future<Output = F::Output>
    where
        F: Future,
    {
        ACTIVE_CONTEXT.scope(self, fut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::supervisor::module_loader::{self, tests::write_module, tests::ECHO_MANIFEST};

    fn fixture() -> (tempfile::TempDir, tempfile::TempDir, Artifact) {
        let home = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        write_module(
            home.path(),
            "echo.zip",
            &[
                ("module.toml", ECHO_MANIFEST),
                ("lib/codec.txt", "codec 2.0 (module)"),
                ("bin/echo", "#!/bin/sh\n"),
            ],
        );
        fs::create_dir_all(host.path().join("lib")).unwrap();
        fs::write(host.path().join("lib/codec.txt"), "codec 1.0 (host)").unwrap();
        fs::write(host.path().join("lib/shared.txt"), "host only").unwrap();
        let artifact = module_loader::resolve(home.path(), "echo").unwrap();
        (home, host, artifact)
    }

    #[test]
    fn module_resources_shadow_host() {
        let (_home, host_dir, artifact) = fixture();
        let host = LoadContext::host([host_dir.path()]);
        let ctx = LoadContext::build(&artifact, &host).unwrap();

        let codec = ctx.resolve("lib/codec.txt").unwrap().unwrap();
        assert_eq!(codec.origin, Origin::Module);
        assert_eq!(codec.as_str(), Some("codec 2.0 (module)"));

        // the host context itself is unchanged
        let host_codec = host.resolve("lib/codec.txt").unwrap().unwrap();
        assert_eq!(host_codec.origin, Origin::Host);
        assert_eq!(host_codec.as_str(), Some("codec 1.0 (host)"));
    }

    #[test]
    fn falls_back_to_host() {
        let (_home, host_dir, artifact) = fixture();
        let ctx = LoadContext::build(&artifact, &LoadContext::host([host_dir.path()])).unwrap();

        let shared = ctx.resolve("lib/shared.txt").unwrap().unwrap();
        assert_eq!(shared.origin, Origin::Host);
        assert!(!ctx.is_bundled("lib/shared.txt"));
        assert_eq!(ctx.local_path("lib/shared.txt"), Some(host_dir.path().join("lib/shared.txt")));
        assert!(ctx.resolve("lib/nope.txt").unwrap().is_none());
    }

    #[test]
    fn resolve_all_is_child_first() {
        let (_home, host_dir, artifact) = fixture();
        let ctx = LoadContext::build(&artifact, &LoadContext::host([host_dir.path()])).unwrap();

        let all = ctx.resolve_all("lib/codec.txt").unwrap();
        let origins: Vec<Origin> = all.iter().map(|r| r.origin).collect();
        assert_eq!(origins, vec![Origin::Module, Origin::Host]);
        assert_eq!(ctx.source_labels()[0], "module:echo");
    }

    #[test]
    fn bundled_entry_has_no_local_path() {
        let (_home, host_dir, artifact) = fixture();
        let ctx = LoadContext::build(&artifact, &LoadContext::host([host_dir.path()])).unwrap();
        assert!(ctx.is_bundled("bin/echo"));
        assert!(ctx.local_path("bin/echo").is_none());
    }

    #[test]
    fn rejects_escaping_names() {
        let (_home, host_dir, artifact) = fixture();
        let ctx = LoadContext::build(&artifact, &LoadContext::host([host_dir.path().join("lib")])).unwrap();
        assert!(ctx.resolve("../lib/codec.txt").unwrap().is_none());
        assert!(ctx.resolve("/etc/passwd").unwrap().is_none());
        assert!(ctx.resolve("./codec.txt").unwrap().is_some());
    }

    #[test]
    fn each_build_is_independent() {
        let (_home, host_dir, artifact) = fixture();
        let host = LoadContext::host([host_dir.path()]);
        let a = Arc::new(LoadContext::build(&artifact, &host).unwrap());
        let b = Arc::new(LoadContext::build(&artifact, &host).unwrap());
        assert!(!Arc::ptr_eq(&a.sources[0], &b.sources[0]));
        // host sources are shared read-only
        assert!(Arc::ptr_eq(&a.sources[1], &b.sources[1]));
    }

    #[tokio::test]
    async fn scope_is_task_local() {
        assert!(current().is_none());

        let a = Arc::new(LoadContext::from_sources(Some(ModuleReference::new("a")), vec![]));
        let b = Arc::new(LoadContext::from_sources(Some(ModuleReference::new("b")), vec![]));

        let ta = tokio::spawn(a.scope(async {
            tokio::task::yield_now().await;
            current().and_then(|c| c.module().cloned())
        }));
        let tb = tokio::spawn(b.scope(async {
            tokio::task::yield_now().await;
            current().and_then(|c| c.module().cloned())
        }));

        assert_eq!(ta.await.unwrap(), Some(ModuleReference::new("a")));
        assert_eq!(tb.await.unwrap(), Some(ModuleReference::new("b")));
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn scope_released_after_panic() {
        let ctx = Arc::new(LoadContext::from_sources(Some(ModuleReference::new("p")), vec![]));
        let result = tokio::spawn(ctx.scope(async { panic!("boom") })).await;
        assert!(result.is_err());
        assert!(current().is_none());
    }
}
