//! The seam between the launcher and the service framework a module runs.
//!
//! The launcher treats the framework as a black box: it is handed the artifact,
//! the module's load context and an [`InstanceConfig`], and returns a
//! [`RunningService`] once the instance signals readiness.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;

use super::identity::RuntimeIdentity;
use super::load_context::LoadContext;
use super::module_loader::Artifact;

pub const MANAGEMENT_DOMAIN: &str = "management-domain";
pub const NETWORK_PORT: &str = "network-port";
pub const STATE_LOCATION: &str = "state-location";
/// Keeps instances from registering under the framework's shared default domain.
pub const MANAGEMENT_SHARED_REGISTRATION: &str = "management-shared-registration";

/// Instance-local configuration handed to the framework.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceConfig {
    values: BTreeMap<String, String>,
}

impl InstanceConfig {
    pub fn for_identity(identity: &RuntimeIdentity) -> Self {
        let mut config = Self::default();
        config.insert(MANAGEMENT_DOMAIN, &identity.domain);
        config.insert(NETWORK_PORT, identity.port.to_string());
        config.insert(STATE_LOCATION, &identity.location);
        config.insert(MANAGEMENT_SHARED_REGISTRATION, "false");
        config
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    pub fn port(&self) -> Option<u16> {
        self.get(NETWORK_PORT).and_then(|p| p.parse().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// `--key=value` command-line form, in key order.
    pub fn to_args(&self) -> Vec<String> {
        self.iter().map(|(k, v)| format!("--{}={}", k, v)).collect()
    }
}

/// Everything a framework needs to start one instance.
#[derive(Debug, Clone, Copy)]
pub struct StartRequest<'a> {
    pub artifact: &'a Artifact,
    pub context: &'a Arc<LoadContext>,
    pub identity: &'a RuntimeIdentity,
    pub config: &'a InstanceConfig,
}

/// A started instance.
#[async_trait]
pub trait RunningService: Send {
    /// Waits for the instance to exit and returns its exit code.
    ///
    /// Must be cancel safe: the runner races it against termination requests.
    async fn wait(&mut self) -> Result<i32>;

    /// Asks the instance to shut down. Does not wait for the exit.
    async fn stop(&mut self) -> Result<()>;
}

/// Starts instances of module artifacts.
///
/// `start` runs with the module's load context active as the ambient context
/// (see [`load_context::current`](super::load_context::current)) and resolves
/// once the instance is ready.
#[async_trait]
pub trait ServiceFramework: Send + Sync {
    async fn start(&self, request: StartRequest<'_>) -> Result<Box<dyn RunningService>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_carries_identity() {
        let identity = RuntimeIdentity {
            domain: "echo-8081".into(),
            port: 8081,
            location: "file:/modules/echo.zip".into(),
        };
        let config = InstanceConfig::for_identity(&identity);
        assert_eq!(config.get(MANAGEMENT_DOMAIN), Some("echo-8081"));
        assert_eq!(config.port(), Some(8081));
        assert_eq!(config.get(STATE_LOCATION), Some("file:/modules/echo.zip"));
        assert_eq!(config.get(MANAGEMENT_SHARED_REGISTRATION), Some("false"));
        assert_eq!(
            config.to_args(),
            vec![
                "--management-domain=echo-8081",
                "--management-shared-registration=false",
                "--network-port=8081",
                "--state-location=file:/modules/echo.zip",
            ]
        );
    }
}
