//! Module artifact resolution.
//!
//! A module is a ZIP archive `<name>.zip` under the module home. The archive
//! carries a `module.toml` manifest either at its root or inside a single
//! top-level folder:
//!
//! ```toml
//! [module]
//! name = "echo"
//! version = "1.0.0"
//! entry = ["bin/echo-server", "--verbose"]   # or "bin/echo-server --verbose"
//! log_pattern = "(?P<level>INFO|WARN|ERROR|DEBUG)"
//!
//! [readiness]
//! kind = "log"            # "immediate" (default), "log" or "port"
//! pattern = "Started on"
//! ```

use std::fmt;
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

use regex::Regex;
use serde::{Deserialize, Serialize};
use zip::ZipArchive;

use super::error::ResolveError;

/// Canonical module file suffix.
pub const MODULE_SUFFIX: &str = ".zip";

pub const MANIFEST_FILE: &str = "module.toml";

/// Logical module name as supplied by configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ModuleReference(String);

impl ModuleReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Splits a comma-delimited list, trimming tokens and dropping empty ones.
    pub fn parse_list(list: &str) -> Vec<ModuleReference> {
        list.split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ModuleReference::new)
            .collect()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// File name of the artifact, with the canonical suffix appended when absent.
    pub fn file_name(&self) -> String {
        if self.0.ends_with(MODULE_SUFFIX) {
            self.0.clone()
        } else {
            format!("{}{}", self.0, MODULE_SUFFIX)
        }
    }

    /// Name with the canonical suffix stripped.
    pub fn stem(&self) -> &str {
        self.0.strip_suffix(MODULE_SUFFIX).unwrap_or(&self.0)
    }
}

impl fmt::Display for ModuleReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Command line declared by `[module] entry`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryPoint {
    pub program: String,
    pub args: Vec<String>,
}

/// When a started instance counts as ready.
#[derive(Debug, Clone)]
pub enum Readiness {
    /// Ready as soon as the entry point has been launched.
    Immediate,
    /// Ready once an output line matches the pattern.
    LogLine(Regex),
    /// Ready once the instance accepts TCP connections on its assigned port.
    PortOpen,
}

#[derive(Debug, Clone)]
pub struct ModuleManifest {
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub entry: EntryPoint,
    pub readiness: Readiness,
    pub log_pattern: Option<Regex>,
}

/// A resolved module archive on disk together with its validated manifest.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub module: ModuleReference,
    pub path: PathBuf,
    /// Folder inside the archive holding the manifest (`""` or `"name/"`).
    pub root_prefix: String,
    pub manifest: ModuleManifest,
}

impl Artifact {
    pub fn entry_point(&self) -> &EntryPoint {
        &self.manifest.entry
    }
}

// ─── Raw manifest ────────────────────────────────────────────

#[derive(Deserialize)]
struct RawManifest {
    module: RawModuleSection,
    #[serde(default)]
    readiness: Option<RawReadiness>,
}

#[derive(Deserialize)]
struct RawModuleSection {
    name: String,
    version: String,
    description: Option<String>,
    entry: RawEntry,
    log_pattern: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEntry {
    Line(String),
    Argv(Vec<String>),
}

#[derive(Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum RawReadiness {
    Immediate,
    Log { pattern: String },
    Port,
}

/// Parses and validates `module.toml` contents.
pub fn parse_manifest(content: &str) -> Result<ModuleManifest, String> {
    let raw: RawManifest = toml::from_str(content).map_err(|e| format!("malformed {}: {}", MANIFEST_FILE, e))?;

    let argv: Vec<String> = match raw.module.entry {
        RawEntry::Line(line) => line.split_whitespace().map(String::from).collect(),
        RawEntry::Argv(argv) => argv,
    };
    let mut argv = argv.into_iter();
    let program = argv
        .next()
        .filter(|p| !p.trim().is_empty())
        .ok_or_else(|| "module declares no entry point".to_string())?;

    let readiness = match raw.readiness {
        None | Some(RawReadiness::Immediate) => Readiness::Immediate,
        Some(RawReadiness::Port) => Readiness::PortOpen,
        Some(RawReadiness::Log { pattern }) => Readiness::LogLine(
            Regex::new(&pattern).map_err(|e| format!("invalid readiness pattern '{}': {}", pattern, e))?,
        ),
    };

    let log_pattern = raw
        .module
        .log_pattern
        .map(|pat| Regex::new(&pat).map_err(|e| format!("invalid log_pattern '{}': {}", pat, e)))
        .transpose()?;

    Ok(ModuleManifest {
        name: raw.module.name,
        version: raw.module.version,
        description: raw.module.description,
        entry: EntryPoint {
            program,
            args: argv.collect(),
        },
        readiness,
        log_pattern,
    })
}

/// Locates the manifest entry: archive root first, then a single nested folder.
fn find_manifest(names: &[String]) -> Option<(String, String)> {
    if names.iter().any(|n| n == MANIFEST_FILE) {
        return Some((MANIFEST_FILE.to_string(), String::new()));
    }
    names
        .iter()
        .filter_map(|n| {
            let (dir, file) = n.split_once('/')?;
            (file == MANIFEST_FILE && !dir.is_empty()).then(|| (n.clone(), format!("{}/", dir)))
        })
        .next()
}

/// Maps a module name to its artifact under `module_home`.
///
/// Blocking: reads the archive's central directory and manifest.
pub fn resolve(module_home: &Path, module_name: &str) -> Result<Artifact, ResolveError> {
    let module = ModuleReference::new(module_name.trim());
    if module.stem().is_empty() {
        return Err(ResolveError::invalid(module_home, "empty module name"));
    }
    let name = module.as_str();
    if name.contains(|c: char| c == '/' || c == '\\') || name == "." || name == ".." {
        return Err(ResolveError::invalid(
            module_home.join(module.file_name()),
            "module name must be a plain file name under the module home",
        ));
    }

    let path = module_home.join(module.file_name());
    if !path.is_file() {
        return Err(ResolveError::NotFound { path });
    }
    let path = fs::canonicalize(&path).unwrap_or(path);

    let file = fs::File::open(&path).map_err(|e| ResolveError::invalid(&path, e))?;
    let mut archive = ZipArchive::new(file).map_err(|e| ResolveError::invalid(&path, e))?;

    let names: Vec<String> = archive.file_names().map(String::from).collect();
    let (manifest_name, root_prefix) = find_manifest(&names)
        .ok_or_else(|| ResolveError::invalid(&path, format!("no {} found in archive", MANIFEST_FILE)))?;

    let mut content = String::new();
    archive
        .by_name(&manifest_name)
        .map_err(|e| ResolveError::invalid(&path, e))?
        .read_to_string(&mut content)
        .map_err(|e| ResolveError::invalid(&path, e))?;

    let manifest = parse_manifest(&content).map_err(|reason| ResolveError::invalid(&path, reason))?;

    tracing::debug!(
        "Resolved module '{}' -> {} ({} v{})",
        module,
        path.display(),
        manifest.name,
        manifest.version
    );

    Ok(Artifact {
        module,
        path,
        root_prefix,
        manifest,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::FileOptions;

    pub(crate) fn write_module(dir: &Path, file_name: &str, files: &[(&str, &str)]) -> PathBuf {
        let path = dir.join(file_name);
        let file = fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        for (name, content) in files {
            zip.start_file(*name, FileOptions::default()).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
        path
    }

    pub(crate) const ECHO_MANIFEST: &str = r#"
[module]
name = "echo"
version = "1.0.0"
entry = "bin/echo --verbose"
"#;

    #[test]
    fn module_reference_suffix_handling() {
        let plain = ModuleReference::new("foo");
        let suffixed = ModuleReference::new("foo.zip");
        assert_eq!(plain.file_name(), "foo.zip");
        assert_eq!(suffixed.file_name(), "foo.zip");
        assert_eq!(plain.stem(), "foo");
        assert_eq!(suffixed.stem(), "foo");
    }

    #[test]
    fn parse_list_trims_and_drops_empty_tokens() {
        let list = ModuleReference::parse_list(" a, b ,,c , ");
        let names: Vec<&str> = list.iter().map(|m| m.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
        assert!(ModuleReference::parse_list(" , ").is_empty());
    }

    #[test]
    fn parse_manifest_entry_forms() {
        let manifest = parse_manifest(ECHO_MANIFEST).unwrap();
        assert_eq!(manifest.entry.program, "bin/echo");
        assert_eq!(manifest.entry.args, vec!["--verbose"]);
        assert!(matches!(manifest.readiness, Readiness::Immediate));

        let manifest = parse_manifest(
            r#"
[module]
name = "web"
version = "0.2.0"
entry = ["sh", "run server.sh"]

[readiness]
kind = "log"
pattern = "Started on \\d+"
"#,
        )
        .unwrap();
        assert_eq!(manifest.entry.args, vec!["run server.sh"]);
        match manifest.readiness {
            Readiness::LogLine(re) => assert!(re.is_match("Started on 8080")),
            other => panic!("unexpected readiness {:?}", other),
        }
    }

    #[test]
    fn parse_manifest_rejects_missing_entry() {
        let err = parse_manifest("[module]\nname = \"x\"\nversion = \"1\"\nentry = \"  \"\n").unwrap_err();
        assert!(err.contains("no entry point"));

        let err = parse_manifest("[module]\nname = \"x\"\nversion = \"1\"\n").unwrap_err();
        assert!(err.contains("malformed"));
    }

    #[test]
    fn parse_manifest_rejects_bad_patterns() {
        let err = parse_manifest(
            "[module]\nname = \"x\"\nversion = \"1\"\nentry = \"x\"\n[readiness]\nkind = \"log\"\npattern = \"(\"\n",
        )
        .unwrap_err();
        assert!(err.contains("readiness pattern"));
    }

    #[test]
    fn resolve_appends_suffix() {
        let home = tempfile::tempdir().unwrap();
        write_module(home.path(), "echo.zip", &[("module.toml", ECHO_MANIFEST)]);

        let a = resolve(home.path(), "echo").unwrap();
        let b = resolve(home.path(), "echo.zip").unwrap();
        assert_eq!(a.path, b.path);
        assert_eq!(a.manifest.name, "echo");
        assert_eq!(a.root_prefix, "");
    }

    #[test]
    fn resolve_nested_manifest() {
        let home = tempfile::tempdir().unwrap();
        write_module(
            home.path(),
            "nested.zip",
            &[("nested/module.toml", ECHO_MANIFEST), ("nested/bin/echo", "#!/bin/sh\n")],
        );
        let artifact = resolve(home.path(), "nested").unwrap();
        assert_eq!(artifact.root_prefix, "nested/");
    }

    #[test]
    fn resolve_missing_is_not_found() {
        let home = tempfile::tempdir().unwrap();
        let err = resolve(home.path(), "missing").unwrap_err();
        assert_eq!(err, ResolveError::NotFound { path: home.path().join("missing.zip") });
    }

    #[test]
    fn resolve_directory_is_not_found() {
        let home = tempfile::tempdir().unwrap();
        fs::create_dir(home.path().join("dir.zip")).unwrap();
        assert!(matches!(resolve(home.path(), "dir"), Err(ResolveError::NotFound { .. })));
    }

    #[test]
    fn resolve_invalid_archives() {
        let home = tempfile::tempdir().unwrap();
        fs::write(home.path().join("garbage.zip"), b"not a zip").unwrap();
        write_module(home.path(), "nomanifest.zip", &[("readme.txt", "hi")]);

        assert!(matches!(resolve(home.path(), "garbage"), Err(ResolveError::InvalidArtifact { .. })));
        match resolve(home.path(), "nomanifest") {
            Err(ResolveError::InvalidArtifact { reason, .. }) => assert!(reason.contains("module.toml")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn resolve_empty_name_is_invalid() {
        let home = tempfile::tempdir().unwrap();
        assert!(matches!(resolve(home.path(), "  "), Err(ResolveError::InvalidArtifact { .. })));
        assert!(matches!(resolve(home.path(), ".zip"), Err(ResolveError::InvalidArtifact { .. })));
    }

    #[test]
    fn resolve_rejects_names_outside_home() {
        let root = tempfile::tempdir().unwrap();
        let home = root.path().join("modules");
        fs::create_dir_all(home.join("sub")).unwrap();
        write_module(root.path(), "outside.zip", &[("module.toml", ECHO_MANIFEST)]);
        write_module(&home.join("sub"), "nested.zip", &[("module.toml", ECHO_MANIFEST)]);

        for name in ["../outside", "sub/nested", "sub\\nested", ".."] {
            match resolve(&home, name) {
                Err(ResolveError::InvalidArtifact { reason, .. }) => assert!(reason.contains("plain file name"), "{}", name),
                other => panic!("{}: unexpected {:?}", name, other),
            }
        }
    }
}
