/**
 * ESPRESENSE WATCHDOG - Point d'entrée
 *
 * RÔLE : écoute la télémétrie MQTT des rooms ESPresense et redémarre (POST
 * /restart) les nodes silencieux depuis plus de 5 min ou allumés depuis plus
 * de 6 h.
 *
 * ARCHITECTURE : une task MQTT qui alimente le registre, une task scheduler
 * qui l'évalue chaque minute. Arrêt propre sur Ctrl-C / SIGTERM.
 */

mod clock;
mod config;
mod health;
mod models;
mod mqtt;
mod policy;
mod registry;
mod restart;
mod scheduler;
mod telemetry;

use crate::clock::{Clock, SystemClock};
use crate::config::{BrokerEndpoint, Cli};
use crate::health::HealthTracker;
use crate::registry::DeviceRegistry;
use crate::restart::HttpRestarter;
use crate::scheduler::{SchedulerSettings, Watchdog};
use crate::telemetry::TelemetryIngestor;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::Parser;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("espresense_watchdog=info")),
        )
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if matches!(e.kind(), ErrorKind::DisplayHelp | ErrorKind::DisplayVersion) => e.exit(),
        Err(e) => {
            error!("this program takes three arguments: mqtt_host mqtt_user mqtt_pass");
            let _ = e.print();
            std::process::exit(1);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start tokio runtime");
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(cli)) {
        error!("{e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let cfg = config::load_config().context("loading watchdog config")?;
    let endpoint = BrokerEndpoint::parse(&cli.mqtt_host, cfg.mqtt.port).context("parsing broker endpoint")?;

    let registry = DeviceRegistry::new();
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let health = HealthTracker::new();
    let (stop_tx, stop_rx) = watch::channel(false);

    let ingestor = TelemetryIngestor::new(registry.clone(), clock.clone(), health.clone(), &cfg.mqtt.topic);
    let opts = mqtt::mqtt_options(&cfg.mqtt, &endpoint, &cli);
    info!(host = %endpoint.host, port = endpoint.port, topic = %cfg.mqtt.topic, "connecting to MQTT");
    let listener = mqtt::spawn_telemetry_listener(opts, ingestor, health.clone(), stop_rx.clone());

    let restarter = HttpRestarter::new(cfg.restart_timeout(), cfg.strict_http_status)
        .context("building HTTP client")?;
    let watchdog = Watchdog::new(
        registry,
        cfg.policy(),
        restarter,
        clock,
        health,
        SchedulerSettings {
            tick_interval: cfg.tick_interval(),
            cooldown: cfg.cooldown(),
            restart_timeout: cfg.restart_timeout(),
        },
    );
    let watcher = tokio::spawn(watchdog.run(stop_rx));

    shutdown_signal().await;
    info!("shutdown requested");
    let _ = stop_tx.send(true);

    let grace = cfg.shutdown_grace();
    let both = async {
        let _ = listener.await;
        let _ = watcher.await;
    };
    if tokio::time::timeout(grace, both).await.is_err() {
        warn!(grace_secs = grace.as_secs(), "tasks did not stop in time, abandoning them");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
