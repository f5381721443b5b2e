use anyhow::Context;
use clap::Parser;
use fleet_pool::config::Config;
use fleet_pool::environment::EnvironmentManager;
use fleet_pool::{FleetManager, MonitorEvent};
use std::path::PathBuf;
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

/// Pool connections to a fleet of environments and monitor their health
#[derive(Debug, Parser)]
#[command(name = "fleet-monitor", version)]
struct Cli {
    /// Configuration file (defaults to fleet.toml or config/fleet.toml)
    #[arg(short, long, env = "FLEET_CONFIG")]
    config: Option<PathBuf>,

    /// Override the configured log level
    #[arg(long)]
    log_level: Option<String>,

    /// Run one health check per environment, print the system snapshot as JSON and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration first to get the log level
    let loaded = match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            // Initialize basic tracing for error reporting
            tracing_subscriber::fmt::init();
            error!("Failed to load configuration: {}", e.user_message());
            error!("Configuration error details: {}", e.detailed_message());
            return Err(e).context("loading configuration");
        }
    };
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }

    let log_level = match config.logging.level.to_lowercase().as_str() {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "info" => tracing::Level::INFO,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };
    tracing_subscriber::fmt().with_max_level(log_level).init();

    info!("Starting fleet monitor");
    info!("Log level set to: {}", config.logging.level);
    info!(
        "Health checks every {}s, alert cooldown {}s, up to {} recovery attempt(s)",
        config.monitor.check_interval_secs, config.monitor.alert_cooldown_secs, config.monitor.max_recovery_attempts
    );

    let environments = EnvironmentManager::load_from_config(&config).context("validating environments")?;
    let fleet = FleetManager::with_ssh(config.monitor.clone());
    let events = fleet.subscribe();

    for env_config in environments.enabled_configs() {
        let name = env_config.name.clone();
        fleet
            .register_environment(env_config)
            .await
            .with_context(|| format!("registering environment '{}'", name))?;
    }

    if cli.once {
        let checks = fleet.monitor().check_all().await;
        for check in &checks {
            info!("Environment '{}': {}", check.environment, check.overall);
        }
        let snapshot = fleet.get_system_health().await;
        println!(
            "{}",
            serde_json::to_string_pretty(&snapshot).context("serializing system health")?
        );
        fleet.close_all_pools().await;
        return Ok(());
    }

    let logger = tokio::spawn(log_events(events));

    setup_shutdown_signal().await;
    info!("Shutdown signal received, closing pools");

    fleet.close_all_pools().await;
    logger.abort();
    info!("Fleet monitor stopped");
    Ok(())
}

/// Forward monitor events to the log
async fn log_events(mut events: broadcast::Receiver<MonitorEvent>) {
    loop {
        match events.recv().await {
            Ok(MonitorEvent::HealthAlert(alert)) => warn!(
                "ALERT environment '{}' is {} ({} consecutive failures)",
                alert.environment, alert.status, alert.consecutive_failures
            ),
            Ok(MonitorEvent::EnvironmentStatusChanged { environment, from, to }) => {
                info!("Environment '{}' changed from {} to {}", environment, from, to)
            }
            Ok(MonitorEvent::EnvironmentRecovered { environment, attempts }) => {
                info!("Environment '{}' recovered after {} attempt(s)", environment, attempts)
            }
            Ok(MonitorEvent::RecoveryAttempted(attempt)) if !attempt.success => warn!(
                "Recovery attempt {} for '{}' failed: {}",
                attempt.attempt_number,
                attempt.environment,
                attempt.errors.join("; ")
            ),
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event logger fell behind, {} event(s) skipped", skipped)
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Wait for Ctrl+C or SIGTERM
async fn setup_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
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
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received terminate signal");
        },
    }
}
