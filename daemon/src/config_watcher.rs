/// Configuration file watcher and hot-reloading of the runtime
use crate::api::TaskPackageApi;
use crate::config::DaemonConfig;
use crate::errors::DaemonResult;
use crate::server::AppState;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Adjustments re-applied to every reloaded configuration (CLI flags)
pub type ConfigOverrides = Arc<dyn Fn(&mut DaemonConfig) + Send + Sync>;

/// Polls the configuration file's modification time
pub struct ConfigWatcher {
    config_path: PathBuf,
    last_modified: Mutex<SystemTime>,
    check_interval: Duration,
    overrides: Option<ConfigOverrides>,
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

impl ConfigWatcher {
    pub fn new(config_path: PathBuf) -> Self {
        let last_modified = modified(&config_path).unwrap_or_else(SystemTime::now);
        ConfigWatcher {
            config_path,
            last_modified: Mutex::new(last_modified),
            check_interval: Duration::from_secs(5),
            overrides: None,
        }
    }

    pub fn with_check_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    pub fn with_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.overrides = Some(overrides);
        self
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn check_interval(&self) -> Duration {
        self.check_interval
    }

    /// New modification time, if the file changed since the last check
    pub fn check_for_changes(&self) -> Option<SystemTime> {
        let current = match std::fs::metadata(&self.config_path).and_then(|m| m.modified()) {
            Ok(time) => time,
            Err(e) => {
                warn!("Failed to check config file metadata: {}", e);
                return None;
            }
        };

        let mut last = self.last_modified.lock();
        if current > *last {
            debug!("Configuration file has been modified");
            *last = current;
            Some(current)
        } else {
            None
        }
    }

    /// Read, override and validate the configuration file
    pub fn load(&self) -> DaemonResult<DaemonConfig> {
        let mut config = DaemonConfig::load(&self.config_path)?;
        if let Some(overrides) = &self.overrides {
            overrides(&mut config);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn load_if_changed(&self) -> DaemonResult<Option<DaemonConfig>> {
        if self.check_for_changes().is_some() {
            debug!("Reloading configuration from: {:?}", self.config_path);
            self.load().map(Some)
        } else {
            Ok(None)
        }
    }

    /// Poll the file and listen for SIGHUP; each one rebuilds the API
    pub fn spawn(self: Arc<Self>, state: Arc<AppState>, initial: DaemonConfig) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut current = initial;
            let mut ticker = tokio::time::interval(self.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            #[cfg(unix)]
            let mut hangup =
                match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup()) {
                    Ok(signal) => Some(signal),
                    Err(e) => {
                        warn!("SIGHUP reload unavailable: {}", e);
                        None
                    }
                };

            loop {
                #[cfg(unix)]
                let forced = tokio::select! {
                    _ = ticker.tick() => false,
                    Some(()) = async {
                        match hangup.as_mut() {
                            Some(signal) => signal.recv().await,
                            None => std::future::pending().await,
                        }
                    } => true,
                };
                #[cfg(not(unix))]
                let forced = {
                    ticker.tick().await;
                    false
                };

                let loaded = if forced {
                    info!("Received SIGHUP, reloading configuration");
                    self.load().map(Some)
                } else {
                    self.load_if_changed()
                };

                match loaded {
                    Ok(Some(config)) => match reload(&state, &current, &config).await {
                        Ok(()) => current = config,
                        Err(e) => error!("Reload failed, keeping previous runtime: {}", e),
                    },
                    Ok(None) => {}
                    Err(e) => error!("Invalid configuration, keeping previous runtime: {}", e),
                }
            }
        })
    }
}

/// Build a fresh store, runtime and API from `next`, install it, then stop the old one.
/// Server bind settings only take effect on restart.
pub async fn reload(
    state: &AppState,
    previous: &DaemonConfig,
    next: &DaemonConfig,
) -> DaemonResult<()> {
    if previous.server != next.server {
        warn!("[server] changes take effect after a restart");
    }

    let api = TaskPackageApi::from_config(next, state.metrics().clone()).await?;
    let old = state.swap(Arc::new(api));
    old.shutdown().await;

    info!("Configuration reloaded");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_unchanged_file_reports_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("taskpack.toml");
        fs::write(&config_path, "[server]\nhttp_port = 8181\n").unwrap();

        let watcher = ConfigWatcher::new(config_path);
        assert!(watcher.check_for_changes().is_none());
        assert!(watcher.load_if_changed().unwrap().is_none());
    }

    #[test]
    fn test_overrides_apply_on_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("taskpack.toml");
        fs::write(&config_path, "[server]\nhttp_port = 8181\n").unwrap();

        let watcher = ConfigWatcher::new(config_path)
            .with_overrides(Arc::new(|config: &mut DaemonConfig| config.server.http_port = 9191));
        assert_eq!(watcher.load().unwrap().server.http_port, 9191);
    }

    #[test]
    fn test_missing_file_is_not_a_change() {
        let temp_dir = TempDir::new().unwrap();
        let watcher = ConfigWatcher::new(temp_dir.path().join("absent.toml"))
            .with_check_interval(Duration::from_millis(10));
        assert!(watcher.check_for_changes().is_none());
        assert_eq!(watcher.check_interval(), Duration::from_millis(10));
    }
}
