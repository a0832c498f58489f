//! OS shutdown signals.
//!
//! [`ShutdownSignal`] registers its handlers when installed, so a signal that
//! arrives before anyone awaits it (e.g. while modules are still launching) is
//! kept and reported by the next [`ShutdownSignal::recv`].
//!
//! ## Unix
//! SIGINT, SIGTERM and SIGQUIT.
//!
//! ## Windows
//! Ctrl-C only.

#[cfg(unix)]
pub struct ShutdownSignal {
    sigint: tokio::signal::unix::Signal,
    sigterm: tokio::signal::unix::Signal,
    sigquit: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl ShutdownSignal {
    /// Must be called from within a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    pub async fn recv(&mut self) {
        tokio::select! {
            _ = self.sigint.recv()  => tracing::info!("Received SIGINT"),
            _ = self.sigterm.recv() => tracing::info!("Received SIGTERM"),
            _ = self.sigquit.recv() => tracing::info!("Received SIGQUIT"),
        }
    }
}

#[cfg(not(unix))]
pub struct ShutdownSignal {
    ctrl_c: tokio::signal::windows::CtrlC,
}

#[cfg(not(unix))]
impl ShutdownSignal {
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            ctrl_c: tokio::signal::windows::ctrl_c()?,
        })
    }

    pub async fn recv(&mut self) {
        self.ctrl_c.recv().await;
        tracing::info!("Received Ctrl-C");
    }
}

/// Completes when the process receives a termination signal.
pub async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    ShutdownSignal::install()?.recv().await;
    Ok(())
}
