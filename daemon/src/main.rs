/// Taskpack Daemon - Main entry point
/// Starts the task-package control plane and the workflow runtime behind it
use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use taskpack_daemon::{
    AppState, ConfigOverrides, ConfigWatcher, DaemonConfig, MetricsCollector, TaskPackageApi,
    TaskPackageServer,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "taskpack-daemon",
    about = "Control plane for task-package workflows",
    version = env!("CARGO_PKG_VERSION")
)]
struct Args {
    /// Configuration file path
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to configuration file (TOML)"
    )]
    config: Option<PathBuf>,

    /// HTTP server port
    #[arg(
        short = 'p',
        long,
        value_name = "PORT",
        help = "HTTP server port (default: 8080)"
    )]
    http_port: Option<u16>,

    /// SQLite database file
    #[arg(long, value_name = "PATH", help = "SQLite database file")]
    db_path: Option<PathBuf>,

    /// Identity provider base URL
    #[arg(long, value_name = "URL", help = "Identity provider base URL")]
    provider_url: Option<String>,

    /// Log level
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        help = "Log level (trace, debug, info, warn, error)"
    )]
    log_level: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let args = self.clone();
        Arc::new(move |config: &mut DaemonConfig| {
            if let Some(port) = args.http_port {
                config.server.http_port = port;
            }
            if let Some(path) = &args.db_path {
                config.storage.db_path = path.clone();
            }
            if let Some(url) = &args.provider_url {
                config.auth.provider_url = Some(url.clone());
            }
            if let Some(level) = &args.log_level {
                config.logging.level = level.clone();
            }
            if args.verbose {
                config.logging.level = "debug".to_string();
            }
        })
    }
}

fn init_tracing(config: &DaemonConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(config.logging.level.parse()?);
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_line_number(true);

    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse command line arguments
    let args = Args::parse();
    let overrides = args.overrides();

    // Load configuration
    let mut config = DaemonConfig::load_or_default(args.config.as_deref())?;
    overrides(&mut config);
    config.validate()?;

    init_tracing(&config)?;

    info!("Starting Taskpack Daemon v{}", taskpack_daemon::VERSION);
    match &args.config {
        Some(path) => info!("Loaded configuration from: {}", path.display()),
        None => info!("Using default configuration"),
    }
    info!(
        "Server configuration: HTTP {}:{}, metrics {}",
        config.server.http_addr,
        config.server.http_port,
        if config.server.enable_metrics {
            config.server.metrics_port.to_string()
        } else {
            "disabled".to_string()
        }
    );

    let metrics = Arc::new(MetricsCollector::new()?);
    let api = TaskPackageApi::from_config(&config, metrics)
        .await
        .context("failed to initialise the runtime")?;
    let state = Arc::new(AppState::new(Arc::new(api)));

    // Hot reload on file change or SIGHUP
    let watcher_handle = args.config.as_ref().map(|path| {
        let watcher = Arc::new(ConfigWatcher::new(path.clone()).with_overrides(overrides.clone()));
        watcher.spawn(state.clone(), config.clone())
    });

    let server = TaskPackageServer::new(config.server.clone(), state.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!("Server error: {}", e);
        }
    });

    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for CTRL+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
        _ = server_handle => {
            info!("Server terminated unexpectedly");
        }
    }

    info!("Shutting down daemon...");
    if let Some(handle) = watcher_handle {
        handle.abort();
    }
    state.api().shutdown().await;

    info!("Taskpack Daemon stopped");
    Ok(())
}
