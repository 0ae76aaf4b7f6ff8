use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use message_hub::clock::SystemClock;
use message_hub::hub::{HttpDeliveryTransport, MessageHub};
use message_hub::metrics::{self, Metrics};
use message_hub::registry::HttpHealthProbe;
use message_hub::store::{BackingStore, MemoryStore, RedisStore};
use message_hub::HubConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize structured logging with environment-based filtering
    // Default to INFO level, can be overridden with RUST_LOG env var
    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(true))
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,message_hub=debug")),
        )
        .init();

    tracing::info!("Starting message hub");

    // === 1. Configuration ===
    let config = HubConfig::from_env()?;

    // === 2. Backing store ===
    let store: Arc<dyn BackingStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisStore::connect(url).await?),
        None => {
            tracing::warn!("HUB_REDIS_URL not set, staging messages in process memory");
            Arc::new(MemoryStore::new())
        }
    };

    // === 3. Metrics ===
    let metrics = Arc::new(Metrics::new()?);
    let metrics_registry = Arc::new(metrics.registry().clone());
    let metrics_port = config.metrics_port;
    std::thread::spawn(move || {
        let system = actix_web::rt::System::new();
        if let Err(e) = system.block_on(metrics::start_metrics_server(metrics_registry, metrics_port)) {
            tracing::error!(error = %e, "Metrics server error");
        }
    });

    // === 4. Hub ===
    let probe = Arc::new(HttpHealthProbe::new(
        config.registry.probe_timeout,
        config.registry.slow_response_threshold,
    )?);
    let transport = Arc::new(HttpDeliveryTransport::new(config.dispatch.delivery_timeout)?);
    let instances = config.instances.clone();

    let hub = Arc::new(MessageHub::with_metrics(
        config,
        store,
        probe,
        transport,
        Arc::new(SystemClock),
        metrics,
    ));

    for registration in instances {
        hub.registry().register_instance(registration)?;
    }

    hub.initialize();
    tracing::info!(
        services = hub.registry().service_types().len(),
        "Message hub running, press Ctrl-C to stop"
    );

    // === 5. Run until interrupted ===
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutdown signal received");
    hub.shutdown().await;

    Ok(())
}
