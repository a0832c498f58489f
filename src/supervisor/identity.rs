use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use serde::Serialize;

use super::error::PortsExhausted;
use super::module_loader::Artifact;

pub const DEFAULT_BASE_PORT: u16 = 8080;

/// Runtime identity of one instance. Unique per assignor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct RuntimeIdentity {
    /// Management domain, e.g. `echo-8081`.
    pub domain: String,
    pub port: u16,
    /// Where the instance reports its state, e.g. `file:/opt/modules/echo.zip`.
    pub location: String,
}

/// Hands out identities from a port counter shared by all launch tasks of one
/// supervisor. Ports are never reused, even after an instance fails.
///
/// At most `65536 - base_port` identities are handed out; the counter never wraps.
#[derive(Debug)]
pub struct IdentityAssignor {
    base_port: u16,
    /// Next port to hand out; `65536` once the range is used up.
    next_port: AtomicU32,
    issued: AtomicUsize,
}

impl IdentityAssignor {
    pub fn new(base_port: u16) -> Self {
        Self {
            base_port,
            next_port: AtomicU32::new(u32::from(base_port)),
            issued: AtomicUsize::new(0),
        }
    }

    pub fn assign(&self, artifact: &Artifact) -> Result<RuntimeIdentity, PortsExhausted> {
        let port = self
            .next_port
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |next| {
                u16::try_from(next).ok().and_then(|_| next.checked_add(1))
            })
            .ok()
            .and_then(|previous| u16::try_from(previous).ok())
            .ok_or_else(|| PortsExhausted {
                base_port: self.base_port,
                issued: self.issued(),
            })?;
        self.issued.fetch_add(1, Ordering::Relaxed);

        let identity = RuntimeIdentity {
            domain: format!("{}-{}", artifact.module.stem(), port),
            port,
            location: format!("file:{}", artifact.path.display()),
        };
        tracing::debug!(module = %artifact.module, domain = %identity.domain, port, "Assigned identity");
        Ok(identity)
    }

    pub fn base_port(&self) -> u16 {
        self.base_port
    }

    /// Number of identities handed out so far.
    pub fn issued(&self) -> usize {
        self.issued.load(Ordering::Relaxed)
    }
}

impl Default for IdentityAssignor {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_PORT)
    }
}
