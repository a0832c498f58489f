//! Launcher configuration: an optional TOML file overlaid with environment variables.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::supervisor::identity::DEFAULT_BASE_PORT;
use crate::supervisor::module_loader::ModuleReference;
use crate::supervisor::LaunchMode;

pub const CONFIG_PATH_ENV: &str = "MODLAUNCH_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "modlaunch.toml";

pub const MODULES_ENV: &str = "MODULES";
pub const MODULE_HOME_ENV: &str = "MODULE_HOME";
pub const BASE_PORT_ENV: &str = "MODULE_BASE_PORT";
pub const LAUNCH_MODE_ENV: &str = "MODULE_LAUNCH_MODE";
pub const WORK_DIR_ENV: &str = "MODULE_WORK_DIR";
pub const HOST_RESOURCES_ENV: &str = "MODULE_HOST_RESOURCES";

pub const DEFAULT_MODULE_HOME: &str = "/opt/modules";
pub const DEFAULT_MAX_CONCURRENT_LAUNCHES: usize = 16;
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 10;
pub const DEFAULT_READY_TIMEOUT_SECS: u64 = 60;
pub const DEFAULT_STOP_GRACE_SECS: u64 = 5;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Either the 'modules' setting or the '{}' environment variable is required", MODULES_ENV)]
    MissingModules,

    #[error("invalid value for '{key}': {reason}")]
    Invalid { key: String, reason: String },

    #[error("failed to read config file {path}: {reason}")]
    File { path: PathBuf, reason: String },
}

impl ConfigError {
    fn invalid(key: &str, reason: impl ToString) -> Self {
        Self::Invalid {
            key: key.to_string(),
            reason: reason.to_string(),
        }
    }
}

/// `modules = "a, b"` or `modules = ["a", "b"]`
#[derive(Deserialize, Debug, Clone)]
#[serde(untagged)]
enum ModuleList {
    Line(String),
    List(Vec<String>),
}

impl ModuleList {
    fn into_references(self) -> Vec<ModuleReference> {
        match self {
            Self::Line(line) => ModuleReference::parse_list(&line),
            Self::List(items) => items
                .iter()
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(ModuleReference::new)
                .collect(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct SubprocessConfig {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// The TOML file as written; every key optional.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    modules: Option<ModuleList>,
    module_home: Option<PathBuf>,
    base_port: Option<u16>,
    mode: Option<LaunchMode>,
    max_concurrent_launches: Option<usize>,
    shutdown_timeout_secs: Option<u64>,
    ready_timeout_secs: Option<u64>,
    stop_grace_secs: Option<u64>,
    work_dir: Option<PathBuf>,
    host_resources: Option<Vec<PathBuf>>,
    subprocess: Option<SubprocessConfig>,
}

#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub modules: Vec<ModuleReference>,
    pub module_home: PathBuf,
    pub base_port: u16,
    pub mode: LaunchMode,
    pub max_concurrent_launches: usize,
    pub shutdown_timeout_secs: u64,
    pub ready_timeout_secs: u64,
    /// 0 disables the forced kill after a stop request.
    pub stop_grace_secs: u64,
    pub work_dir: PathBuf,
    pub host_resources: Vec<PathBuf>,
    pub subprocess: Option<SubprocessConfig>,
}

impl LauncherConfig {
    /// Reads the config file named by `MODLAUNCH_CONFIG` (or `modlaunch.toml`)
    /// and applies the process environment on top.
    ///
    /// The default file is optional; an explicitly named one must exist.
    pub fn load() -> Result<Self, ConfigError> {
        let explicit = std::env::var_os(CONFIG_PATH_ENV).filter(|p| !p.is_empty());
        let path = explicit
            .clone()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));

        let contents = match std::fs::read_to_string(&path) {
            Ok(s) => {
                tracing::debug!("Loaded launcher config from {}", path.display());
                Some(s)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && explicit.is_none() => None,
            Err(e) => {
                return Err(ConfigError::File {
                    path,
                    reason: e.to_string(),
                })
            }
        };

        Self::from_sources(contents.as_deref(), |key| std::env::var(key).ok()).map_err(|e| match e {
            ConfigError::File { reason, .. } => ConfigError::File { path: path.clone(), reason },
            other => other,
        })
    }

    /// Builds the config from file contents and an environment lookup.
    pub fn from_sources<E>(file: Option<&str>, env: E) -> Result<Self, ConfigError>
    where
        E: Fn(&str) -> Option<String>,
    {
        let file: FileConfig = match file {
            Some(contents) => toml::from_str(contents).map_err(|e| ConfigError::File {
                path: PathBuf::from(DEFAULT_CONFIG_PATH),
                reason: e.to_string(),
            })?,
            None => FileConfig::default(),
        };
        let env = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let modules = match env(MODULES_ENV) {
            Some(list) => ModuleReference::parse_list(&list),
            None => file.modules.map(ModuleList::into_references).unwrap_or_default(),
        };
        if modules.is_empty() {
            return Err(ConfigError::MissingModules);
        }

        let module_home = env(MODULE_HOME_ENV)
            .map(PathBuf::from)
            .or(file.module_home)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MODULE_HOME));

        let base_port = match env(BASE_PORT_ENV) {
            Some(v) => v.parse::<u16>().map_err(|e| ConfigError::invalid(BASE_PORT_ENV, e))?,
            None => file.base_port.unwrap_or(DEFAULT_BASE_PORT),
        };

        let mode = match env(LAUNCH_MODE_ENV) {
            Some(v) => v.parse::<LaunchMode>().map_err(|e| ConfigError::invalid(LAUNCH_MODE_ENV, e))?,
            None => file.mode.unwrap_or_default(),
        };

        let max_concurrent_launches = file
            .max_concurrent_launches
            .unwrap_or(DEFAULT_MAX_CONCURRENT_LAUNCHES);
        if max_concurrent_launches == 0 {
            return Err(ConfigError::invalid("max_concurrent_launches", "must be at least 1"));
        }

        let work_dir = env(WORK_DIR_ENV)
            .map(PathBuf::from)
            .or(file.work_dir)
            .unwrap_or_else(|| std::env::temp_dir().join("modlaunch"));

        let host_resources = match env(HOST_RESOURCES_ENV) {
            Some(v) => std::env::split_paths(&v).filter(|p| !p.as_os_str().is_empty()).collect(),
            None => file.host_resources.unwrap_or_default(),
        };

        Ok(Self {
            modules,
            module_home,
            base_port,
            mode,
            max_concurrent_launches,
            shutdown_timeout_secs: file.shutdown_timeout_secs.unwrap_or(DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            ready_timeout_secs: file.ready_timeout_secs.unwrap_or(DEFAULT_READY_TIMEOUT_SECS),
            stop_grace_secs: file.stop_grace_secs.unwrap_or(DEFAULT_STOP_GRACE_SECS),
            work_dir,
            host_resources,
            subprocess: file.subprocess,
        })
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn stop_grace(&self) -> Option<Duration> {
        (self.stop_grace_secs > 0).then(|| Duration::from_secs(self.stop_grace_secs))
    }

    pub fn module_path(&self, module: &ModuleReference) -> PathBuf {
        Path::new(&self.module_home).join(module.file_name())
    }
}
