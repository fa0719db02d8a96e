use anyhow::{Context, Result};
use metrics::{describe_counter, describe_gauge};
use netdrill_engine::api::create_router;
use netdrill_engine::{EngineConfig, SimulationEngine};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

const DEFAULT_CONFIG_PATH: &str = "config/default";

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("NETDRILL_CONFIG").ok())
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());
    let loaded = EngineConfig::from_file(&config_path);

    let logging = match &loaded {
        Ok(config) => config.logging.clone(),
        Err(_) => Default::default(),
    };
    init_tracing(&logging.level, logging.json);

    info!("Starting Netdrill Engine v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration from file if available, otherwise use defaults
    let config = match loaded {
        Ok(config) => {
            info!(path = %config_path, "Configuration loaded");
            config
        }
        Err(e) => {
            warn!("Failed to load config file {}: {}, using defaults", config_path, e);
            EngineConfig::default()
        }
    };
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

    initialize_metrics();
    if config.server.metrics_enabled {
        start_metrics_exporter(config.metrics_addr()?)?;
    }

    let engine = Arc::new(SimulationEngine::new(config.clone()).context("Failed to build simulation engine")?);
    let shutdown = CancellationToken::new();

    // Scenario and drift ticks
    let scheduler = Arc::clone(engine.scheduler());
    let scheduler_shutdown = shutdown.clone();
    let scheduler_task = tokio::spawn(async move {
        scheduler.run(scheduler_shutdown).await;
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal_shutdown.cancel();
    });

    let app = create_router(Arc::clone(&engine));
    let listen_addr = config.listen_addr()?;
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {listen_addr}"))?;

    info!(listen_addr = %listen_addr, "Netdrill API server listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("API server error")?;

    shutdown.cancel();
    if let Err(e) = scheduler_task.await {
        error!(error = %e, "Scenario scheduler task failed");
    }
    if let Some(report) = engine.scheduler().stop().await {
        info!(scenario_id = %report.scenario_id, "Active scenario stopped on shutdown");
    }

    info!("Netdrill Engine stopped");
    Ok(())
}

fn init_tracing(default_filter: &str, json: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    if json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(true)
            .with_line_number(true)
            .init();
    }
}

fn start_metrics_exporter(addr: SocketAddr) -> Result<()> {
    use metrics_exporter_prometheus::PrometheusBuilder;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("Failed to install Prometheus exporter")?;

    info!(metrics_addr = %addr, "Prometheus metrics exporter started");
    Ok(())
}

fn initialize_metrics() {
    describe_counter!(
        "netdrill_samples_processed_total",
        "Metric samples accepted by the pipeline"
    );
    describe_counter!(
        "netdrill_samples_rejected_total",
        "Metric samples rejected as invalid"
    );
    describe_counter!("netdrill_anomalies_total", "Threshold breaches detected");
    describe_counter!("netdrill_alerts_total", "Alerts raised, by severity");
    describe_counter!(
        "netdrill_timeseries_write_failures_total",
        "Time-series writes that failed or were dropped"
    );
    describe_counter!(
        "netdrill_timeseries_points_forwarded_total",
        "Points accepted by the time-series server"
    );
    describe_counter!("netdrill_scenarios_started_total", "Scenarios started");
    describe_counter!(
        "netdrill_scenario_events_total",
        "Scenario events applied, by type"
    );
    describe_counter!(
        "netdrill_scenario_event_failures_total",
        "Scenario events whose handler failed, by type"
    );
    describe_counter!("netdrill_push_events_total", "Push events queued to sessions");
    describe_counter!(
        "netdrill_push_dropped_total",
        "Push events dropped because a session queue was full"
    );
    describe_counter!("netdrill_messages_total", "Inter-city messages, by outcome");
    describe_gauge!("netdrill_scenario_active", "1 while a scenario is running");
    describe_gauge!("netdrill_sessions_active", "Connected push sessions");
    describe_gauge!("netdrill_assigned_cities", "Cities assigned to students");
    describe_gauge!("netdrill_alert_log_size", "Alerts currently retained");
}
