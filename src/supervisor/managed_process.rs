//! Process Framework - runs a module's entry point as a managed child process
//!
//! The default [`ServiceFramework`] used by the launcher binary:
//! - Materializes the module archive into a per-instance directory
//! - Resolves the entry program child-first through the module's load context
//! - Injects the instance config as `--key=value` arguments
//! - Relays stdout/stderr through `tracing`, with level parsing via `log_pattern`
//! - Waits for the manifest's readiness condition before reporting the instance ready

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::watch;

use super::framework::{RunningService, ServiceFramework, StartRequest};
use super::load_context::LoadContext;
use super::module_loader::Readiness;
use super::process::{exit_code, ChildService};

/// Search path handed to the module: materialized root first, then host dirs.
pub const RESOURCE_PATH_ENV: &str = "MODULE_RESOURCE_PATH";

pub const DEFAULT_READY_TIMEOUT: Duration = Duration::from_secs(60);

const PORT_POLL_INTERVAL: Duration = Duration::from_millis(100);
const EXIT_WAIT: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogSource {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

#[derive(Debug, Clone)]
pub struct ProcessFramework {
    work_dir: PathBuf,
    ready_timeout: Duration,
    stop_grace: Option<Duration>,
}

impl ProcessFramework {
    /// `work_dir` receives one materialized directory per instance, named by domain.
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            ready_timeout: DEFAULT_READY_TIMEOUT,
            stop_grace: None,
        }
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Kill instances still alive this long after a stop request.
    pub fn with_stop_grace(mut self, grace: Option<Duration>) -> Self {
        self.stop_grace = grace;
        self
    }
}

#[async_trait]
impl ServiceFramework for ProcessFramework {
    async fn start(&self, request: StartRequest<'_>) -> Result<Box<dyn RunningService>> {
        let domain = request.identity.domain.clone();
        let artifact = request.artifact;
        let entry = artifact.entry_point();

        let instance_dir = self.work_dir.join(&domain);
        let root = {
            let archive = artifact.path.clone();
            let dir = instance_dir.clone();
            tokio::task::spawn_blocking(move || materialize(&archive, &dir))
                .await
                .context("materialize task failed")??;
            instance_dir.join(&artifact.root_prefix)
        };

        let program = resolve_program(request.context, &entry.program, &root)?;
        let search_path = std::env::join_paths(
            std::iter::once(root.clone()).chain(request.context.host_dirs().iter().cloned()),
        )
        .unwrap_or_else(|_| OsString::from(root.as_os_str()));

        tracing::debug!(
            "Spawning '{}' for instance '{}' in {}",
            program.display(),
            domain,
            root.display()
        );

        let mut cmd = TokioCommand::new(&program);
        cmd.args(&entry.args)
            .args(request.config.to_args())
            .current_dir(&root)
            .env(RESOURCE_PATH_ENV, search_path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("failed to spawn entry point '{}'", program.display()))?;

        let manifest = &artifact.manifest;
        let (ready_tx, mut ready_rx) = watch::channel(false);
        let ready_tx = Arc::new(ready_tx);
        let ready_pattern = match &manifest.readiness {
            Readiness::LogLine(re) => Some(Arc::new(re.clone())),
            _ => None,
        };
        let log_regex = manifest.log_pattern.clone().map(Arc::new);

        // ── stdout / stderr relays ───────────────────────────
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(relay_output(
                stdout,
                LogSource::Stdout,
                domain.clone(),
                log_regex.clone(),
                ready_pattern.clone().map(|re| (re, ready_tx.clone())),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(relay_output(
                stderr,
                LogSource::Stderr,
                domain.clone(),
                log_regex,
                ready_pattern.map(|re| (re, ready_tx.clone())),
            ));
        }
        drop(ready_tx);

        // ── readiness ────────────────────────────────────────
        let port = request.identity.port;
        let ready = async {
            match &manifest.readiness {
                Readiness::Immediate => Ok(()),
                Readiness::LogLine(re) => ready_rx
                    .wait_for(|ready| *ready)
                    .await
                    .map(|_| ())
                    .map_err(|_| anyhow::anyhow!("output closed before a line matched '{}'", re.as_str())),
                Readiness::PortOpen => {
                    wait_for_port(port).await;
                    Ok(())
                }
            }
        };

        let outcome = tokio::select! {
            result = tokio::time::timeout(self.ready_timeout, ready) => Ok(result),
            status = child.wait() => Err(status),
        };
        match outcome {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => {
                // output closes when the entry point exits; report its code if so
                if let Ok(Ok(status)) = tokio::time::timeout(EXIT_WAIT, child.wait()).await {
                    anyhow::bail!("entry point exited with code {} before becoming ready", exit_code(status));
                }
                return Err(e);
            }
            Ok(Err(_)) => anyhow::bail!("instance not ready within {:?}", self.ready_timeout),
            Err(status) => {
                let status = status?;
                anyhow::bail!("entry point exited with code {} before becoming ready", exit_code(status));
            }
        }

        Ok(Box::new(ChildService::new(domain, child, self.stop_grace)))
    }
}

/// Extracts `archive` into a fresh `dir`.
fn materialize(archive: &Path, dir: &Path) -> Result<()> {
    if dir.exists() {
        std::fs::remove_dir_all(dir).with_context(|| format!("failed to clear {}", dir.display()))?;
    }
    std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;

    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file)?;
    zip.extract(dir)
        .with_context(|| format!("failed to extract {} into {}", archive.display(), dir.display()))?;
    Ok(())
}

/// Child-first lookup of the entry program: the module's own copy, then a
/// host directory's, then the bare name for the OS to find on `PATH`.
fn resolve_program(context: &LoadContext, program: &str, root: &Path) -> Result<PathBuf> {
    if context.is_bundled(program) {
        let path = root.join(program);
        ensure_executable(&path)?;
        return Ok(path);
    }
    Ok(context.local_path(program).unwrap_or_else(|| PathBuf::from(program)))
}

#[cfg(unix)]
fn ensure_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    if perms.mode() & 0o111 == 0 {
        perms.set_mode(perms.mode() | 0o755);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}

#[cfg(not(unix))]
fn ensure_executable(_path: &Path) -> Result<()> {
    Ok(())
}

async fn wait_for_port(port: u16) {
    loop {
        if tokio::net::TcpStream::connect(("127.0.0.1", port)).await.is_ok() {
            return;
        }
        tokio::time::sleep(PORT_POLL_INTERVAL).await;
    }
}

/// Forwards each output line to `tracing` and flags readiness on a pattern match.
async fn relay_output<R>(
    stream: R,
    source: LogSource,
    domain: String,
    log_regex: Option<Arc<Regex>>,
    ready: Option<(Arc<Regex>, Arc<watch::Sender<bool>>)>,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Some((pattern, tx)) = &ready {
            if !*tx.borrow() && pattern.is_match(&line) {
                let _ = tx.send(true);
            }
        }

        let level = parse_log_level(&line, log_regex.as_deref());
        // stderr lines default to at least Warn
        let level = if source == LogSource::Stderr && level == LogLevel::Info {
            LogLevel::Warn
        } else {
            level
        };
        match level {
            LogLevel::Error => tracing::error!(target: "module", domain = %domain, "{}", line),
            LogLevel::Warn => tracing::warn!(target: "module", domain = %domain, "{}", line),
            LogLevel::Debug => tracing::debug!(target: "module", domain = %domain, "{}", line),
            LogLevel::Info => tracing::info!(target: "module", domain = %domain, "{}", line),
        }
    }
}

/// Parse the log level from a module output line using an optional regex pattern.
///
/// The pattern should contain a named capture group `level` matching level
/// keywords (INFO, WARN, ERROR, DEBUG, etc.). Without a pattern or a match,
/// defaults to Info.
fn parse_log_level(line: &str, pattern: Option<&Regex>) -> LogLevel {
    let Some(level) = pattern.and_then(|re| re.captures(line)).and_then(|caps| caps.name("level")) else {
        return LogLevel::Info;
    };
    match level.as_str().to_uppercase().as_str() {
        "ERROR" | "FATAL" => LogLevel::Error,
        "WARN" | "WARNING" => LogLevel::Warn,
        "DEBUG" | "TRACE" => LogLevel::Debug,
        _ => LogLevel::Info,
    }
}
