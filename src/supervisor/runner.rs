//! Instance Runner: starts one instance and drives its handle to a settled state.
//!
//! Every instance runs in its own task. Errors and panics are caught at that
//! task's boundary and recorded on the instance's handle; they never reach a
//! sibling instance or the supervisor.

use std::future::Future;
use std::sync::Arc;

use anyhow::Result;

use super::error::{panic_message, Failure};
use super::framework::{InstanceConfig, RunningService, ServiceFramework, StartRequest};
use super::identity::RuntimeIdentity;
use super::instance::{InstanceHandle, InstanceStatus, StatusReporter};
use super::load_context::LoadContext;
use super::module_loader::Artifact;
use super::process::SubprocessCommand;

#[derive(Clone)]
pub struct InstanceRunner {
    framework: Arc<dyn ServiceFramework>,
}

impl InstanceRunner {
    pub fn new(framework: Arc<dyn ServiceFramework>) -> Self {
        Self { framework }
    }

    /// Starts `artifact` inside `context` with `identity`.
    ///
    /// Returns immediately; the handle is `Starting` until the framework
    /// reports readiness.
    pub fn start(&self, artifact: Artifact, context: Arc<LoadContext>, identity: RuntimeIdentity) -> InstanceHandle {
        let (handle, reporter) = InstanceHandle::starting(artifact.module.clone(), Some(identity.clone()));
        let config = InstanceConfig::for_identity(&identity);
        let framework = self.framework.clone();

        tracing::info!(
            module = %artifact.module,
            domain = %identity.domain,
            port = identity.port,
            "Starting instance"
        );

        let driver = reporter.clone();
        let scoped = context.clone();
        let run = async move {
            let request = StartRequest {
                artifact: &artifact,
                context: &context,
                identity: &identity,
                config: &config,
            };
            drive(&driver, framework.start(request)).await;
        };
        spawn_isolated(reporter, scoped.scope(run));
        handle
    }

    /// Starts `artifact` as an external process running `command`.
    ///
    /// No load context: the child builds its own. `identity` is informational,
    /// the child assigns its own from the base port it is given.
    pub fn start_subprocess(
        artifact: Artifact,
        identity: Option<RuntimeIdentity>,
        command: SubprocessCommand,
    ) -> InstanceHandle {
        let (handle, reporter) = InstanceHandle::starting(artifact.module.clone(), identity);

        tracing::info!(module = %artifact.module, path = %artifact.path.display(), "Starting module subprocess");

        let driver = reporter.clone();
        let run = async move {
            let start = async { command.spawn(&artifact).map(|child| Box::new(child) as Box<dyn RunningService>) };
            drive(&driver, start).await;
        };
        spawn_isolated(reporter, run);
        handle
    }
}

/// Runs `fut` in its own task; a panic inside it fails the instance.
fn spawn_isolated<F>(reporter: StatusReporter, fut: F)
where
    F: Future<Output = ()> + Send + 'static,
{
    let task = tokio::spawn(fut);
    tokio::spawn(async move {
        if let Err(err) = task.await {
            let message = panic_message(err);
            tracing::error!("Instance '{}' task panicked: {}", reporter.label(), message);
            reporter.transition(InstanceStatus::Failed(Failure::Panicked(message)));
        }
    });
}

async fn drive<F>(reporter: &StatusReporter, start: F)
where
    F: Future<Output = Result<Box<dyn RunningService>>>,
{
    let label = reporter.label();

    let started = tokio::select! {
        biased;
        _ = reporter.terminated() => None,
        result = start => Some(result),
    };

    let mut service = match started {
        None => {
            tracing::info!("Instance '{}' terminated before it became ready", label);
            reporter.transition(InstanceStatus::Failed(Failure::Aborted));
            return;
        }
        Some(Err(e)) => {
            tracing::error!("Instance '{}' failed to start: {:#}", label, e);
            reporter.transition(InstanceStatus::Failed(Failure::StartFailure(format!("{:#}", e))));
            return;
        }
        Some(Ok(service)) => service,
    };

    if reporter.transition(InstanceStatus::Running) {
        tracing::info!("Instance '{}' is running", label);
    }

    let exited = tokio::select! {
        result = service.wait() => Some(result),
        _ = reporter.terminated() => None,
    };
    let exit = match exited {
        Some(result) => result,
        None => {
            if let Err(e) = service.stop().await {
                tracing::warn!("Instance '{}' did not accept stop request: {:#}", label, e);
            }
            service.wait().await
        }
    };

    match exit {
        Ok(code) => {
            tracing::info!("Instance '{}' exited with code {}", label, code);
            reporter.transition(InstanceStatus::Exited(code));
        }
        Err(e) => {
            tracing::error!("Lost instance '{}': {:#}", label, e);
            reporter.transition(InstanceStatus::Failed(Failure::Lost(format!("{:#}", e))));
        }
    }
}
