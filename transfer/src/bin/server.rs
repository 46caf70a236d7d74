//! Transfer saga server.
//!
//! Runs the HTTP ingress and all four consuming roles in one process.

use saga_core::event_bus::EventBus;
use saga_redpanda::RedpandaEventBus;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use transfer_saga::{Application, Config, ledger_for};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,transfer_saga=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(
        brokers = %config.redpanda.brokers,
        topic = %config.redpanda.topic,
        ledger = %config.saga.ledger_mode,
        "Configuration loaded"
    );

    let redpanda = RedpandaEventBus::builder()
        .brokers(&config.redpanda.brokers)
        .auto_offset_reset(&config.redpanda.auto_offset_reset)
        .build()?;
    let bus: Arc<dyn EventBus> = Arc::new(redpanda.clone());
    let redpanda_config = config.redpanda.clone();

    let listener = tokio::net::TcpListener::bind(config.server.bind_address()).await?;
    let ledger = ledger_for(&config.saga)?;

    let app = Application::new(config, bus, ledger)
        .with_consumer_bus(move |role| {
            let group = redpanda_config.consumer_group(role);
            Arc::new(redpanda.for_consumer_group(group)) as Arc<dyn EventBus>
        })
        .start()?;

    app.serve(listener).await?;
    Ok(())
}
