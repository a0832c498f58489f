pub mod config;
pub mod signals;
pub mod supervisor;

pub use config::{ConfigError, LauncherConfig};
pub use supervisor::{LaunchMode, LaunchSupervisor, ShutdownReport, SupervisorOptions};
