/// Taskpack Daemon: control-plane HTTP server for task-package workflows
/// Hosts the workflow runtime and exposes start, cancel, status, update, info and mode routes
pub mod api;
pub mod auth;
pub mod config;
pub mod config_watcher;
pub mod errors;
pub mod metrics;
pub mod server;
pub mod types;

// Re-export commonly used types
pub use api::TaskPackageApi;
pub use auth::{AuthContext, IdentityGate, ProviderFamily};
pub use config::DaemonConfig;
pub use config_watcher::{reload, ConfigOverrides, ConfigWatcher};
pub use errors::{DaemonError, DaemonResult};
pub use metrics::MetricsCollector;
pub use server::{handle_request, AppState, TaskPackageServer, PREFIX};

/// Daemon version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version() {
        assert!(!VERSION.is_empty());
    }
}
