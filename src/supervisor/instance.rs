//! Instance handles: the tracked lifecycle state of one module instance.
//!
//! Status lives in a `watch` channel. The runner task owns the [`StatusReporter`]
//! side and moves the instance through its states; the supervisor holds
//! cloneable [`InstanceHandle`]s to observe status and request termination.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::error::Failure;
use super::identity::RuntimeIdentity;
use super::module_loader::ModuleReference;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "detail", rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Running,
    /// Termination requested, waiting for the instance to exit.
    Stopping,
    Failed(Failure),
    Exited(i32),
}

impl InstanceStatus {
    /// `Failed` and `Exited` are terminal.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Failed(_) | Self::Exited(_))
    }

    pub fn can_transition(&self, to: &InstanceStatus) -> bool {
        use InstanceStatus::*;
        matches!(
            (self, to),
            (Starting, Running)
                | (Starting, Failed(_))
                | (Starting, Stopping)
                | (Running, Stopping)
                | (Running, Exited(_))
                | (Running, Failed(_))
                | (Stopping, Exited(_))
                | (Stopping, Failed(_))
        )
    }
}

/// Shared mutable side of an instance: status sender plus termination token.
#[derive(Debug)]
struct InstanceControl {
    status: watch::Sender<InstanceStatus>,
    terminate: CancellationToken,
}

impl InstanceControl {
    fn transition(&self, label: &str, to: InstanceStatus) -> bool {
        let mut rejected = None;
        let changed = self.status.send_if_modified(|current| {
            if current.can_transition(&to) {
                *current = to.clone();
                true
            } else {
                rejected = Some(current.clone());
                false
            }
        });
        if let Some(from) = rejected {
            tracing::debug!("Instance '{}': ignoring transition {:?} -> {:?}", label, from, to);
        } else {
            tracing::debug!("Instance '{}' -> {:?}", label, to);
        }
        changed
    }
}

/// Writer side used by the task driving an instance.
#[derive(Debug, Clone)]
pub struct StatusReporter {
    label: String,
    control: Arc<InstanceControl>,
}

impl StatusReporter {
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Applies a transition; invalid transitions are ignored and return `false`.
    pub fn transition(&self, to: InstanceStatus) -> bool {
        self.control.transition(&self.label, to)
    }

    pub fn status(&self) -> InstanceStatus {
        self.control.status.borrow().clone()
    }

    /// Resolves once termination has been requested.
    pub async fn terminated(&self) {
        self.control.terminate.cancelled().await
    }

    pub fn is_termination_requested(&self) -> bool {
        self.control.terminate.is_cancelled()
    }
}

/// Serializable view of one instance, used in launch reports.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot {
    pub module: ModuleReference,
    pub identity: Option<RuntimeIdentity>,
    pub status: InstanceStatus,
    /// [`Failure::error_code`] when the instance failed.
    pub error_code: Option<&'static str>,
    pub termination_requested: bool,
}

#[derive(Debug, Clone)]
pub struct InstanceHandle {
    module: ModuleReference,
    identity: Option<RuntimeIdentity>,
    status_rx: watch::Receiver<InstanceStatus>,
    control: Arc<InstanceControl>,
}

impl InstanceHandle {
    /// A new handle in `Starting`, plus the reporter for the task driving it.
    pub fn starting(module: ModuleReference, identity: Option<RuntimeIdentity>) -> (Self, StatusReporter) {
        let (tx, rx) = watch::channel(InstanceStatus::Starting);
        let control = Arc::new(InstanceControl {
            status: tx,
            terminate: CancellationToken::new(),
        });
        let label = match &identity {
            Some(id) => id.domain.clone(),
            None => module.to_string(),
        };
        let reporter = StatusReporter {
            label,
            control: control.clone(),
        };
        let handle = Self {
            module,
            identity,
            status_rx: rx,
            control,
        };
        (handle, reporter)
    }

    /// A handle for a module that never got as far as starting.
    pub fn failed(module: ModuleReference, identity: Option<RuntimeIdentity>, failure: Failure) -> Self {
        let (handle, reporter) = Self::starting(module, identity);
        reporter.transition(InstanceStatus::Failed(failure));
        handle
    }

    pub fn module(&self) -> &ModuleReference {
        &self.module
    }

    pub fn identity(&self) -> Option<&RuntimeIdentity> {
        self.identity.as_ref()
    }

    /// Domain when an identity was assigned, module name otherwise.
    pub fn label(&self) -> String {
        self.identity
            .as_ref()
            .map(|id| id.domain.clone())
            .unwrap_or_else(|| self.module.to_string())
    }

    pub fn status(&self) -> InstanceStatus {
        self.status_rx.borrow().clone()
    }

    pub fn is_settled(&self) -> bool {
        self.status_rx.borrow().is_settled()
    }

    pub fn is_termination_requested(&self) -> bool {
        self.control.terminate.is_cancelled()
    }

    /// Asks the instance to terminate. No-op for settled instances.
    ///
    /// Returns whether a request was issued.
    pub fn request_termination(&self) -> bool {
        if self.is_settled() {
            return false;
        }
        let label = self.label();
        self.control.transition(&label, InstanceStatus::Stopping);
        self.control.terminate.cancel();
        tracing::info!("Termination requested for instance '{}'", label);
        true
    }

    /// Waits until the instance leaves `Starting`.
    pub async fn wait_started(&self) -> InstanceStatus {
        self.wait_for(|s| *s != InstanceStatus::Starting).await
    }

    /// Waits until the instance is `Failed` or `Exited`.
    pub async fn wait_settled(&self) -> InstanceStatus {
        self.wait_for(InstanceStatus::is_settled).await
    }

    async fn wait_for(&self, mut pred: impl FnMut(&InstanceStatus) -> bool) -> InstanceStatus {
        let mut rx = self.status_rx.clone();
        let result = rx.wait_for(|s| pred(s)).await.map(|status| status.clone());
        match result {
            Ok(status) => status,
            // the handle itself keeps the sender alive, so this is teardown only
            Err(_) => rx.borrow().clone(),
        }
    }

    pub fn snapshot(&self) -> InstanceSnapshot {
        let status = self.status();
        let error_code = match &status {
            InstanceStatus::Failed(failure) => Some(failure.error_code()),
            _ => None,
        };
        InstanceSnapshot {
            module: self.module.clone(),
            identity: self.identity.clone(),
            status,
            error_code,
            termination_requested: self.is_termination_requested(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn identity() -> RuntimeIdentity {
        RuntimeIdentity {
            domain: "echo-8080".into(),
            port: 8080,
            location: "file:/modules/echo.zip".into(),
        }
    }

    #[test]
    fn valid_status_transitions() {
        let (handle, reporter) = InstanceHandle::starting(ModuleReference::new("echo"), Some(identity()));
        assert_eq!(handle.status(), InstanceStatus::Starting);
        assert!(reporter.transition(InstanceStatus::Running));
        assert!(reporter.transition(InstanceStatus::Exited(0)));
        assert_eq!(handle.status(), InstanceStatus::Exited(0));
        assert!(handle.is_settled());
    }

    #[test]
    fn settled_is_final() {
        let (handle, reporter) = InstanceHandle::starting(ModuleReference::new("echo"), None);
        assert!(reporter.transition(InstanceStatus::Failed(Failure::StartFailure("x".into()))));
        assert!(!reporter.transition(InstanceStatus::Running));
        assert!(!reporter.transition(InstanceStatus::Exited(0)));
        assert!(matches!(handle.status(), InstanceStatus::Failed(_)));
    }

    #[test]
    fn cannot_skip_running() {
        let (_handle, reporter) = InstanceHandle::starting(ModuleReference::new("echo"), None);
        assert!(!reporter.transition(InstanceStatus::Exited(0)));
    }

    #[test]
    fn failed_constructor() {
        let handle = InstanceHandle::failed(
            ModuleReference::new("missing"),
            None,
            Failure::NotFound("/modules/missing.zip".into()),
        );
        assert_eq!(handle.status(), InstanceStatus::Failed(Failure::NotFound("/modules/missing.zip".into())));
        assert_eq!(handle.label(), "missing");
        // nothing to terminate
        assert!(!handle.request_termination());
        assert!(!handle.is_termination_requested());
    }

    #[tokio::test]
    async fn termination_request_reaches_reporter() {
        let (handle, reporter) = InstanceHandle::starting(ModuleReference::new("echo"), Some(identity()));
        reporter.transition(InstanceStatus::Running);

        let task = tokio::spawn(async move {
            reporter.terminated().await;
            reporter.transition(InstanceStatus::Exited(143));
        });

        assert!(handle.request_termination());
        assert_eq!(handle.status(), InstanceStatus::Stopping);
        let status = tokio::time::timeout(Duration::from_secs(5), handle.wait_settled()).await.unwrap();
        assert_eq!(status, InstanceStatus::Exited(143));
        task.await.unwrap();
    }

    #[tokio::test]
    async fn late_running_after_stop_request_is_ignored() {
        let (handle, reporter) = InstanceHandle::starting(ModuleReference::new("echo"), None);
        handle.request_termination();
        assert!(!reporter.transition(InstanceStatus::Running));
        assert_eq!(handle.status(), InstanceStatus::Stopping);
        assert!(reporter.is_termination_requested());
    }

    #[test]
    fn snapshot_serializes() {
        let (handle, reporter) = InstanceHandle::starting(ModuleReference::new("echo"), Some(identity()));
        reporter.transition(InstanceStatus::Running);
        let json = serde_json::to_value(handle.snapshot()).unwrap();
        assert_eq!(json["module"], "echo");
        assert_eq!(json["identity"]["port"], 8080);
        assert_eq!(json["status"]["state"], "running");
        assert!(json["error_code"].is_null());
        assert_eq!(json["termination_requested"], false);

        let failed = InstanceHandle::failed(
            ModuleReference::new("missing"),
            None,
            Failure::NotFound("/modules/missing.zip".into()),
        );
        let json = serde_json::to_value(failed.snapshot()).unwrap();
        assert_eq!(json["status"]["state"], "failed");
        assert_eq!(json["status"]["detail"]["kind"], "not_found");
        assert_eq!(json["error_code"], "NOT_FOUND");
    }
}
