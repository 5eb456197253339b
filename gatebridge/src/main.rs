//! GateBridge: posts pipeline gate requests to Slack and turns reviewer
//! clicks back into gate decisions.
//!
//! Startup order: logging, environment safety, process defaults, config,
//! backends, then the bridge itself. SIGINT or SIGTERM starts a graceful
//! shutdown that stops consuming, drains in-flight work, and exits.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

use gatebridge::bridge::{Bridge, ChatBackend};
use gatebridge_core::config::{BridgeDefaults, find_config_file, load_and_validate};
use gatebridge_core::lifecycle::{DrainResult, LifecycleManager, validate_environment};

/// Command-line options.
///
/// | Port | Env Variable | Default | Purpose |
/// |------|--------------|---------|---------|
/// | 3000 | GATEBRIDGE_INTERACTIONS_PORT | 3000 | Slack interaction callbacks |
/// | 7469 | GATEBRIDGE_ADMIN_PORT | 7469 | Health checks, metrics |
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to the YAML configuration file.
    /// If not specified, searches: GATEBRIDGE_CONFIG env, /etc/gatebridge/config.yaml, ./config.yaml
    #[arg(long, env = "GATEBRIDGE_CONFIG")]
    config: Option<PathBuf>,

    /// Chat backend. `mock` records notifications instead of sending them.
    #[arg(long, value_enum, default_value = "slack")]
    chat: ChatBackend,

    /// Override the interaction endpoint port.
    #[arg(long)]
    interactions_port: Option<u16>,

    /// Override the admin server port.
    #[arg(long)]
    admin_port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // The guard flushes buffered log lines on drop; hold it until exit.
    let (non_blocking, _guard) = tracing_appender::non_blocking(std::io::stdout());
    tracing_subscriber::fmt()
        .json()
        .with_writer(non_blocking)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    if let Err(msg) = validate_environment(cli.chat == ChatBackend::Mock) {
        error!(reason = %msg, "Unsafe configuration detected, refusing to start");
        std::process::exit(1);
    }

    let mut defaults = BridgeDefaults::from_env();
    if let Some(port) = cli.interactions_port {
        defaults.interactions_port = port;
    }
    if let Some(port) = cli.admin_port {
        defaults.admin_port = port;
    }
    if let Err(msg) = defaults.validate() {
        error!(reason = %msg, "Invalid process defaults, refusing to start");
        std::process::exit(1);
    }

    let config_path = match find_config_file(cli.config.as_deref()) {
        Ok(path) => path,
        Err(e) => {
            error!(error = %e, "No configuration file found");
            std::process::exit(1);
        }
    };

    let (config, validation) = match load_and_validate(&config_path) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(path = %config_path.display(), error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };
    for warning in &validation.warnings {
        warn!(warning = %warning, "Configuration warning");
    }
    info!(
        path = %config_path.display(),
        routes = config.routing.all_routes().count(),
        identities = config.rbac.len(),
        "Configuration loaded"
    );

    let bridge = Bridge::connect(&config, defaults, cli.chat).await?;
    setup_signal_handlers(bridge.lifecycle());

    match bridge.run().await {
        DrainResult::Complete => Ok(()),
        DrainResult::Timeout { remaining } => {
            warn!(remaining, "Exiting with work still in flight");
            Ok(())
        }
    }
}

/// Starts graceful shutdown on SIGINT or SIGTERM.
fn setup_signal_handlers(lifecycle: Arc<LifecycleManager>) {
    let lifecycle_sigint = lifecycle.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
                lifecycle_sigint.begin_shutdown();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGINT");
            }
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                info!("Received SIGTERM, initiating graceful shutdown");
                lifecycle.begin_shutdown();
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
            }
        }
    });
}
