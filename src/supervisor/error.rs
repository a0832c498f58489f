//! Error types shared by the launcher components.
//!
//! Per-module errors ([`ResolveError`], start failures) never escape a module's
//! launch task: they are folded into a [`Failure`] recorded on the module's
//! instance handle. [`SupervisorError`] only covers misuse of the supervisor API.

use std::path::PathBuf;

use serde::Serialize;

use super::state_machine::TransitionError;

/// Artifact lookup failures.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ResolveError {
    #[error("module artifact not found: {}", path.display())]
    NotFound { path: PathBuf },

    #[error("invalid module artifact {}: {reason}", path.display())]
    InvalidArtifact { path: PathBuf, reason: String },
}

/// The supervisor's port range is used up.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("no ports left after {issued} identities starting at {base_port}")]
pub struct PortsExhausted {
    pub base_port: u16,
    pub issued: usize,
}

impl ResolveError {
    pub(crate) fn invalid(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        Self::InvalidArtifact {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Why an instance ended up `Failed`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum Failure {
    #[error("artifact not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("invalid artifact: {0}")]
    InvalidArtifact(String),

    #[error("no runtime identity: {0}")]
    NoIdentity(String),

    #[error("start failed: {0}")]
    StartFailure(String),

    #[error("start aborted by termination request")]
    Aborted,

    #[error("lost track of running instance: {0}")]
    Lost(String),

    #[error("launch task panicked: {0}")]
    Panicked(String),
}

impl Failure {
    /// Machine readable code, reported in instance snapshots.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidArtifact(_) => "INVALID_ARTIFACT",
            Self::NoIdentity(_) => "NO_IDENTITY",
            Self::StartFailure(_) => "START_FAILURE",
            Self::Aborted => "ABORTED",
            Self::Lost(_) => "LOST",
            Self::Panicked(_) => "PANICKED",
        }
    }
}

impl From<ResolveError> for Failure {
    fn from(err: ResolveError) -> Self {
        match err {
            ResolveError::NotFound { path } => Self::NotFound(path),
            err @ ResolveError::InvalidArtifact { .. } => Self::InvalidArtifact(err.to_string()),
        }
    }
}

impl From<PortsExhausted> for Failure {
    fn from(err: PortsExhausted) -> Self {
        Self::NoIdentity(err.to_string())
    }
}

/// Errors returned by [`LaunchSupervisor`](super::LaunchSupervisor) operations.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error(transparent)]
    InvalidState(#[from] TransitionError),
}

/// Turns a `JoinError` payload into a readable message.
pub(crate) fn panic_message(err: tokio::task::JoinError) -> String {
    if !err.is_panic() {
        return err.to_string();
    }
    let payload = err.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_error_maps_to_failure() {
        let err = ResolveError::NotFound { path: "/modules/missing.zip".into() };
        assert_eq!(Failure::from(err), Failure::NotFound("/modules/missing.zip".into()));

        let err = ResolveError::invalid("/modules/bad.zip", "no manifest");
        let failure = Failure::from(err);
        assert_eq!(failure.error_code(), "INVALID_ARTIFACT");
        assert!(failure.to_string().contains("no manifest"));
    }

    #[test]
    fn exhausted_ports_map_to_failure() {
        let failure = Failure::from(PortsExhausted { base_port: 65535, issued: 1 });
        assert_eq!(failure.error_code(), "NO_IDENTITY");
        assert!(failure.to_string().contains("65535"));
    }

    #[test]
    fn failure_serializes_with_kind_tag() {
        let json = serde_json::to_value(Failure::StartFailure("boom".into())).unwrap();
        assert_eq!(json["kind"], "start_failure");
        assert_eq!(json["detail"], "boom");

        let json = serde_json::to_value(Failure::Aborted).unwrap();
        assert_eq!(json["kind"], "aborted");
    }

    #[tokio::test]
    async fn panic_message_extracts_payload() {
        let err = tokio::spawn(async { panic!("exploded") }).await.unwrap_err();
        assert_eq!(panic_message(err), "exploded");
    }
}
