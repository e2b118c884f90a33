use anyhow::{Context, Result};
use skywatch_feed::api::{start_api_server, AppState};
use skywatch_feed::config::Config;
use skywatch_feed::datastore::{Datastore, PgDatastore};
use skywatch_feed::feed::{spawn_mirror, FeedStore};
use skywatch_feed::status::StatusMirror;
use skywatch_feed::weather::{OpenMeteoClient, WeatherPoller, WeatherView};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level);

    info!(
        service = %config.service.name,
        "Starting Skywatch Feed Service"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    let pg = PgDatastore::connect(&config.database)
        .await
        .context("Failed to initialize datastore")?;

    // Run migrations if enabled
    if config.database.run_migrations {
        pg.run_migrations()
            .await
            .context("Failed to run database migrations")?;
    }

    let datastore: Arc<dyn Datastore> = Arc::new(pg);
    let shutdown = CancellationToken::new();
    let policy = config.resubscribe_policy();

    let (detections, detections_task) = spawn_mirror(
        FeedStore::new(config.feeds.detections.settings("detections")),
        datastore.clone(),
        policy,
        shutdown.child_token(),
    );
    let (person_counts, person_counts_task) = spawn_mirror(
        FeedStore::new(config.feeds.person_counts.settings("person_counts")),
        datastore.clone(),
        policy,
        shutdown.child_token(),
    );
    let (status, status_task) = spawn_mirror(
        StatusMirror::new(&config.feeds.status.table),
        datastore.clone(),
        policy,
        shutdown.child_token(),
    );

    let (weather, weather_task) = if config.weather.enabled {
        let client = OpenMeteoClient::new(&config.weather)
            .context("Failed to initialize weather client")?;
        let (poller, receiver) =
            WeatherPoller::new(Arc::new(client), config.weather_poll_interval());
        let task = tokio::spawn(poller.run(shutdown.child_token()));
        (receiver, Some(task))
    } else {
        warn!("Weather polling disabled");
        let (_, receiver) = watch::channel(WeatherView::unavailable());
        (receiver, None)
    };

    // Create API state
    let api_state = AppState {
        detections,
        person_counts,
        status,
        weather,
    };

    // Spawn API server task
    let api_config = config.api.clone();
    let api_shutdown = shutdown.child_token();
    let api_handle = tokio::spawn(async move {
        if let Err(e) = start_api_server(api_state, &api_config, api_shutdown).await {
            error!(error = %e, "API server error");
        }
    });

    info!("Feed service started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down feed service");
    shutdown.cancel();

    let mut tasks = vec![detections_task, person_counts_task, status_task, api_handle];
    tasks.extend(weather_task);
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Task ended abnormally");
        }
    }

    info!("Feed service stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str) {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().json())
        .init();
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    metrics_exporter_prometheus::PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
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
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
