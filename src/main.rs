//! FX Collector
//!
//! Connects to the configured FX venues, validates and aggregates their
//! quotes, and publishes raw and calculated rates over IPC.

use prometheus::Registry;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fx_collector::{
    health, AdapterRegistry, AppState, Coordinator, IpcPublisher, LogNotifier, Notifier,
    PipelineMetrics, RateCache, RateManager, Settings, WebhookNotifier,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(fmt::layer().json())
        .with(EnvFilter::from_default_env().add_directive(Level::INFO.into()))
        .init();

    info!("Starting FX Collector");

    // Load configuration
    let settings = Arc::new(Settings::load()?);
    info!(
        platforms = ?settings.platforms.iter().map(|p| p.name.as_str()).collect::<Vec<_>>(),
        retry_limit = settings.retry.limit,
        retry_delay_secs = settings.retry.delay_secs,
        "Configuration loaded"
    );

    let registry = Registry::new();
    let metrics = PipelineMetrics::new(&registry)?;

    let cache = Arc::new(RateCache::new(settings.cache.ttl()));
    let eviction = cache.spawn_eviction(settings.cache.eviction_interval());

    // Initialize publisher for IPC
    let publisher = Arc::new(IpcPublisher::new(&settings.ipc_socket_path));

    let notifier: Arc<dyn Notifier> = match &settings.alert_webhook_url {
        Some(url) => Arc::new(WebhookNotifier::new(url)?),
        None => Arc::new(LogNotifier),
    };

    let rate_manager = Arc::new(RateManager::new(
        Arc::clone(&cache),
        publisher,
        settings.derivation.clone(),
        metrics.clone(),
    ));

    let coordinator = Coordinator::new(
        Arc::clone(&settings),
        &AdapterRegistry::with_defaults(),
        rate_manager,
        notifier,
        metrics,
    )?;

    // Start health check server
    let state = Arc::new(AppState {
        registry,
        statuses: coordinator.status_map(),
        cache,
    });
    let port = settings.health_port;
    tokio::spawn(async move {
        if let Err(e) = health::serve(state, port).await {
            warn!(error = %e, "Health server error");
        }
    });

    let handle = coordinator.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    handle.shutdown().await;
    eviction.abort();

    info!("FX Collector stopped");
    Ok(())
}
