pub mod error;
pub mod framework;
pub mod identity;
pub mod instance;
pub mod load_context;
pub mod managed_process;
pub mod module_loader;
pub mod process;
pub mod runner;
pub mod state_machine;

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::time::Instant;

use crate::config::{self, LauncherConfig};
use error::{panic_message, Failure, SupervisorError};
use framework::ServiceFramework;
use identity::{IdentityAssignor, DEFAULT_BASE_PORT};
use instance::{InstanceHandle, InstanceSnapshot, InstanceStatus};
use load_context::LoadContext;
use managed_process::ProcessFramework;
use module_loader::ModuleReference;
use process::SubprocessCommand;
use runner::InstanceRunner;
use state_machine::{StateMachine, SupervisorState};

/// How module instances are hosted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum LaunchMode {
    /// Isolated load context and assigned identity per module, started through
    /// the service framework.
    #[default]
    InProcess,
    /// One external OS process per module, inheriting the launcher's stdio.
    Subprocess,
}

impl FromStr for LaunchMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "in-process" | "inprocess" => Ok(Self::InProcess),
            "subprocess" | "process" => Ok(Self::Subprocess),
            other => Err(format!("unknown launch mode '{}' (expected 'in-process' or 'subprocess')", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorOptions {
    pub module_home: PathBuf,
    pub base_port: u16,
    /// Upper bound on modules being resolved and dispatched at the same time.
    pub max_concurrent_launches: usize,
    /// Bound on the wait for instances to confirm termination.
    pub shutdown_timeout: Duration,
    pub mode: LaunchMode,
}

impl Default for SupervisorOptions {
    fn default() -> Self {
        Self {
            module_home: PathBuf::from(config::DEFAULT_MODULE_HOME),
            base_port: DEFAULT_BASE_PORT,
            max_concurrent_launches: config::DEFAULT_MAX_CONCURRENT_LAUNCHES,
            shutdown_timeout: Duration::from_secs(config::DEFAULT_SHUTDOWN_TIMEOUT_SECS),
            mode: LaunchMode::InProcess,
        }
    }
}

/// Outcome of [`LaunchSupervisor::shutdown`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Whether shutdown was triggered by an external request rather than all
    /// instances exiting on their own.
    pub signalled: bool,
    /// Instances asked to terminate.
    pub requested: usize,
    /// Instances that did not confirm termination within the timeout.
    pub residual: Vec<String>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.residual.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LaunchReport {
    pub state: SupervisorState,
    pub instances: Vec<InstanceSnapshot>,
    pub residual: Vec<String>,
}

/// Everything one module's launch task needs; cloned into each task.
#[derive(Clone)]
struct LaunchTask {
    module_home: PathBuf,
    mode: LaunchMode,
    host: Arc<LoadContext>,
    assignor: Arc<IdentityAssignor>,
    runner: InstanceRunner,
    subprocess: Option<SubprocessCommand>,
}

impl LaunchTask {
    /// resolve → build context → assign identity → start, strictly in order.
    async fn launch(self, module: ModuleReference) -> InstanceHandle {
        let home = self.module_home.clone();
        let host = self.host.clone();
        let name = module.as_str().to_string();
        let build_context = self.mode == LaunchMode::InProcess;

        let resolved = tokio::task::spawn_blocking(move || {
            let artifact = module_loader::resolve(&home, &name)?;
            let context = if build_context {
                Some(Arc::new(LoadContext::build(&artifact, &host)?))
            } else {
                None
            };
            Ok::<_, error::ResolveError>((artifact, context))
        })
        .await;

        let (artifact, context) = match resolved {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(e)) => {
                tracing::error!(module = %module, "Failed to resolve module: {}", e);
                return InstanceHandle::failed(module, None, e.into());
            }
            Err(e) => {
                let message = panic_message(e);
                tracing::error!(module = %module, "Module resolution panicked: {}", message);
                return InstanceHandle::failed(module, None, Failure::Panicked(message));
            }
        };

        let identity = match self.assignor.assign(&artifact) {
            Ok(identity) => identity,
            Err(e) => {
                tracing::error!(module = %module, "Cannot assign identity: {}", e);
                return InstanceHandle::failed(module, None, e.into());
            }
        };
        match (context, &self.subprocess) {
            (Some(context), _) => self.runner.start(artifact, context, identity),
            (None, Some(command)) => {
                let command = command.clone().env(config::BASE_PORT_ENV, identity.port.to_string());
                InstanceRunner::start_subprocess(artifact, Some(identity), command)
            }
            (None, None) => InstanceHandle::failed(
                module,
                Some(identity),
                Failure::StartFailure("no subprocess command configured".to_string()),
            ),
        }
    }
}

/// Orchestrates concurrent launch and coordinated shutdown of module instances.
///
/// The identity counter is owned by the supervisor, so independent supervisors
/// (e.g. in tests) never share ports.
pub struct LaunchSupervisor {
    options: SupervisorOptions,
    host: Arc<LoadContext>,
    assignor: Arc<IdentityAssignor>,
    runner: InstanceRunner,
    subprocess: Option<SubprocessCommand>,
    state: StateMachine,
    handles: Vec<InstanceHandle>,
    residual: Vec<String>,
}

impl LaunchSupervisor {
    pub fn new(options: SupervisorOptions, host: LoadContext, framework: Arc<dyn ServiceFramework>) -> Self {
        Self {
            assignor: Arc::new(IdentityAssignor::new(options.base_port)),
            options,
            host: Arc::new(host),
            runner: InstanceRunner::new(framework),
            subprocess: None,
            state: StateMachine::new(),
            handles: Vec::new(),
            residual: Vec::new(),
        }
    }

    /// Command used in [`LaunchMode::Subprocess`].
    pub fn with_subprocess(mut self, command: SubprocessCommand) -> Self {
        self.subprocess = Some(command);
        self
    }

    /// Supervisor wired with the process framework, as used by the binary.
    pub fn from_config(config: &LauncherConfig) -> anyhow::Result<Self> {
        let framework = ProcessFramework::new(&config.work_dir)
            .with_ready_timeout(config.ready_timeout())
            .with_stop_grace(config.stop_grace());
        let options = SupervisorOptions {
            module_home: config.module_home.clone(),
            base_port: config.base_port,
            max_concurrent_launches: config.max_concurrent_launches,
            shutdown_timeout: config.shutdown_timeout(),
            mode: config.mode,
        };
        let supervisor = Self::new(
            options,
            LoadContext::host(config.host_resources.iter().cloned()),
            Arc::new(framework),
        );

        if config.mode != LaunchMode::Subprocess {
            return Ok(supervisor);
        }
        let command = match &config.subprocess {
            Some(custom) => {
                let mut command = SubprocessCommand::new(&custom.program);
                command.args = custom.args.clone();
                command.env = custom.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
                command
            }
            None => {
                let exe = std::env::current_exe().context("cannot locate launcher executable")?;
                SubprocessCommand::new(exe)
                    .env(config::MODULES_ENV, "{module}")
                    .env(config::MODULE_HOME_ENV, config.module_home.to_string_lossy())
                    .env(config::LAUNCH_MODE_ENV, "in-process")
            }
        };
        Ok(supervisor.with_subprocess(command.kill_after(config.stop_grace())))
    }

    pub fn state(&self) -> SupervisorState {
        self.state.state()
    }

    pub fn handles(&self) -> &[InstanceHandle] {
        &self.handles
    }

    pub fn assignor(&self) -> &IdentityAssignor {
        &self.assignor
    }

    pub fn mode(&self) -> LaunchMode {
        self.options.mode
    }

    /// Launches every module concurrently and returns their handles, in input order.
    ///
    /// Returns once every module has been dispatched; instances may still be
    /// `Starting`. Per-module failures are recorded on the handles.
    pub async fn launch(&mut self, modules: &[ModuleReference]) -> Result<&[InstanceHandle], SupervisorError> {
        self.state.transition(SupervisorState::Launching)?;
        tracing::info!("Launching {} module(s) from {}", modules.len(), self.options.module_home.display());

        let first = self.handles.len();
        let handles = self.launch_batch(modules.to_vec()).await;
        self.handles.extend(handles);

        self.state.transition(SupervisorState::Running)?;
        Ok(&self.handles[first..])
    }

    /// Relaunches every module whose instance failed, each with a fresh identity.
    ///
    /// Failed modules are never retried automatically.
    pub async fn retry_failed(&mut self) -> Result<Vec<InstanceHandle>, SupervisorError> {
        if self.state() != SupervisorState::Running {
            return Err(state_machine::TransitionError::InvalidTransition(self.state(), SupervisorState::Launching).into());
        }
        let failed: Vec<(usize, ModuleReference)> = self
            .handles
            .iter()
            .enumerate()
            .filter(|(_, h)| matches!(h.status(), InstanceStatus::Failed(_)))
            .map(|(i, h)| (i, h.module().clone()))
            .collect();
        if failed.is_empty() {
            return Ok(Vec::new());
        }

        self.state.transition(SupervisorState::Launching)?;
        tracing::info!("Retrying {} failed module(s)", failed.len());
        let modules = failed.iter().map(|(_, m)| m.clone()).collect();
        let relaunched = self.launch_batch(modules).await;
        for ((index, _), handle) in failed.iter().zip(&relaunched) {
            self.handles[*index] = handle.clone();
        }
        self.state.transition(SupervisorState::Running)?;
        Ok(relaunched)
    }

    async fn launch_batch(&self, modules: Vec<ModuleReference>) -> Vec<InstanceHandle> {
        let permits = Arc::new(Semaphore::new(self.options.max_concurrent_launches.max(1)));
        let task = LaunchTask {
            module_home: self.options.module_home.clone(),
            mode: self.options.mode,
            host: self.host.clone(),
            assignor: self.assignor.clone(),
            runner: self.runner.clone(),
            subprocess: self.subprocess.clone(),
        };

        let mut pending = Vec::with_capacity(modules.len());
        for module in modules {
            let task = task.clone();
            let permits = permits.clone();
            let launching = module.clone();
            let join = tokio::spawn(async move {
                // bounds resolve/build/dispatch only; starting runs outside the pool
                let _permit = permits.acquire_owned().await.ok();
                task.launch(launching).await
            });
            pending.push((module, join));
        }

        let mut handles = Vec::with_capacity(pending.len());
        for (module, join) in pending {
            let handle = match join.await {
                Ok(handle) => handle,
                Err(e) => {
                    let message = panic_message(e);
                    tracing::error!(module = %module, "Launch task failed: {}", message);
                    InstanceHandle::failed(module, None, Failure::Panicked(message))
                }
            };
            handles.push(handle);
        }
        handles
    }

    /// Resolves once every instance is `Failed` or `Exited`.
    pub async fn wait_all_settled(&self) {
        for handle in &self.handles {
            handle.wait_settled().await;
        }
    }

    /// Runs until every instance has settled or `signal` completes, then shuts down.
    pub async fn run_until_shutdown<F>(&mut self, signal: F) -> Result<ShutdownReport, SupervisorError>
    where
        F: std::future::Future<Output = ()>,
    {
        let signalled = tokio::select! {
            _ = self.wait_all_settled() => false,
            _ = signal => true,
        };
        if signalled {
            tracing::info!("Shutdown requested, stopping {} instance(s)", self.handles.len());
        } else {
            tracing::info!("All module instances have exited");
        }
        let mut report = self.shutdown().await?;
        report.signalled = signalled;
        Ok(report)
    }

    /// Requests termination of every unsettled instance and waits for them,
    /// bounded by the shutdown timeout.
    pub async fn shutdown(&mut self) -> Result<ShutdownReport, SupervisorError> {
        self.state.transition(SupervisorState::ShuttingDown)?;
        let deadline = Instant::now() + self.options.shutdown_timeout;

        let waits: Vec<_> = self
            .handles
            .iter()
            .filter(|h| h.request_termination())
            .cloned()
            .map(|handle| {
                tokio::spawn(async move {
                    let confirmed = tokio::time::timeout_at(deadline, handle.wait_settled()).await.is_ok();
                    (handle, confirmed)
                })
            })
            .collect();

        let mut report = ShutdownReport {
            requested: waits.len(),
            ..Default::default()
        };
        for wait in waits {
            match wait.await {
                Ok((_, true)) => {}
                Ok((handle, false)) => {
                    tracing::warn!(
                        "Instance '{}' did not confirm termination within {:?}",
                        handle.label(),
                        self.options.shutdown_timeout
                    );
                    report.residual.push(handle.label());
                }
                Err(e) => report.residual.push(format!("<wait task: {}>", panic_message(e))),
            }
        }

        self.residual = report.residual.clone();
        self.state.transition(SupervisorState::Terminated)?;
        tracing::info!(
            "Supervisor terminated ({} termination request(s), {} residual)",
            report.requested,
            report.residual.len()
        );
        Ok(report)
    }

    pub fn snapshot(&self) -> Vec<InstanceSnapshot> {
        self.handles.iter().map(InstanceHandle::snapshot).collect()
    }

    pub fn report(&self) -> LaunchReport {
        LaunchReport {
            state: self.state(),
            instances: self.snapshot(),
            residual: self.residual.clone(),
        }
    }

    /// Process exit code for this launch.
    ///
    /// A lone subprocess-mode module propagates its own exit code. Otherwise 0
    /// when every instance exited cleanly or was stopped by a shutdown request
    /// and nothing is residual, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.options.mode == LaunchMode::Subprocess && self.handles.len() == 1 {
            if let InstanceStatus::Exited(code) = self.handles[0].status() {
                return code;
            }
        }
        if !self.residual.is_empty() {
            return 1;
        }
        let clean = self.handles.iter().all(|h| match h.status() {
            InstanceStatus::Exited(0) => true,
            InstanceStatus::Exited(_) | InstanceStatus::Failed(Failure::Aborted) => h.is_termination_requested(),
            _ => false,
        });
        if clean {
            0
        } else {
            1
        }
    }
}
