//! Application wiring and lifecycle.
//!
//! One process runs every saga role:
//!
//! - the HTTP ingress (Transfer Initiator)
//! - Deposit and Withdraw Processors
//! - Deposit and Withdraw Compensators
//!
//! All of them share one event bus for publishing. Each consumer subscribes
//! through its own bus handle so that a broker-backed bus can give every role
//! its own consumer group; every role then sees every event.
//!
//! # Graceful Shutdown
//!
//! 1. HTTP server stops accepting new connections
//! 2. Shutdown signal broadcast to all consumers
//! 3. Wait for consumers to finish their current batch (bounded by
//!    `SHUTDOWN_TIMEOUT_SECS`)
//! 4. Flush the shared bus

use crate::compensators::Compensator;
use crate::config::{Config, LedgerMode, SagaConfig};
use crate::consumer::EventConsumer;
use crate::dispatch::{BatchHandler, Dispatcher};
use crate::error::ConfigurationError;
use crate::initiator::TransferInitiator;
use crate::ledger::{InMemoryLedger, Ledger, SimulatedLedger};
use crate::processors::StepProcessor;
use crate::server;
use saga_core::environment::{Clock, SystemClock};
use saga_core::event_bus::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Produces the bus a consuming role subscribes through, given the role name.
pub type ConsumerBusFactory = Arc<dyn Fn(&str) -> Arc<dyn EventBus> + Send + Sync>;

/// Build the ledger selected by `config`.
///
/// # Errors
///
/// Returns [`ConfigurationError::InvalidValue`] if the success rate is not a
/// probability.
pub fn ledger_for(config: &SagaConfig) -> Result<Arc<dyn Ledger>, ConfigurationError> {
    Ok(match config.ledger_mode {
        LedgerMode::Simulated => Arc::new(SimulatedLedger::new(config.step_success_rate)?),
        LedgerMode::InMemory => Arc::new(InMemoryLedger::new()),
    })
}

/// A configured, not yet started saga process.
pub struct Application {
    config: Config,
    bus: Arc<dyn EventBus>,
    consumer_bus: ConsumerBusFactory,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
}

impl Application {
    /// Wire an application around a shared bus and ledger.
    ///
    /// Consumers subscribe through `bus` itself unless
    /// [`with_consumer_bus`](Self::with_consumer_bus) says otherwise.
    #[must_use]
    pub fn new(config: Config, bus: Arc<dyn EventBus>, ledger: Arc<dyn Ledger>) -> Self {
        let shared = bus.clone();
        Self {
            config,
            bus,
            consumer_bus: Arc::new(move |_: &str| shared.clone()),
            ledger,
            clock: Arc::new(SystemClock),
        }
    }

    /// Give each consuming role its own bus handle.
    #[must_use]
    pub fn with_consumer_bus(
        mut self,
        factory: impl Fn(&str) -> Arc<dyn EventBus> + Send + Sync + 'static,
    ) -> Self {
        self.consumer_bus = Arc::new(factory);
        self
    }

    /// Replace the clock used for acceptance timestamps.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn roles(&self) -> Vec<Arc<dyn BatchHandler>> {
        let topic = &self.config.redpanda.topic;
        vec![
            Arc::new(Dispatcher::new(StepProcessor::deposit(
                self.ledger.clone(),
                self.bus.clone(),
                topic.clone(),
            ))) as Arc<dyn BatchHandler>,
            Arc::new(Dispatcher::new(StepProcessor::withdraw(
                self.ledger.clone(),
                self.bus.clone(),
                topic.clone(),
            ))),
            Arc::new(Dispatcher::new(Compensator::deposit(self.ledger.clone()))),
            Arc::new(Dispatcher::new(Compensator::withdraw(self.ledger.clone()))),
        ]
    }

    /// Spawn every consumer and build the ingress router.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigurationError`] if a consumer cannot be built.
    pub fn start(self) -> Result<RunningApp, ConfigurationError> {
        let (shutdown_tx, _) = broadcast::channel(1);
        let topic = self.config.redpanda.topic.clone();

        let consumers = self
            .roles()
            .into_iter()
            .map(|handler| {
                let name = handler.name().to_string();
                EventConsumer::builder()
                    .topics(vec![topic.clone()])
                    .event_bus((self.consumer_bus)(&name))
                    .handler(handler)
                    .shutdown(shutdown_tx.subscribe())
                    .retry_delay(self.config.saga.consumer_retry_delay())
                    .batch_max_size(self.config.saga.batch_max_size)
                    .build()
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(consumer_count = consumers.len(), topic = %topic, "Starting event consumers");
        let handles = consumers.into_iter().map(EventConsumer::spawn).collect();

        let initiator = TransferInitiator::new(self.bus.clone(), topic, self.clock);
        Ok(RunningApp {
            router: server::router(initiator),
            handles,
            shutdown_tx,
            bus: self.bus,
            shutdown_timeout: self.config.server.shutdown_timeout(),
        })
    }
}

/// A started saga process.
pub struct RunningApp {
    router: axum::Router,
    handles: Vec<JoinHandle<()>>,
    shutdown_tx: broadcast::Sender<()>,
    bus: Arc<dyn EventBus>,
    shutdown_timeout: Duration,
}

impl RunningApp {
    /// The ingress router.
    #[must_use]
    pub fn router(&self) -> axum::Router {
        self.router.clone()
    }

    /// Number of running consumers.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.handles.iter().filter(|h| !h.is_finished()).count()
    }

    /// Serve HTTP on `listener` until Ctrl+C or SIGTERM, then shut down.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the server fails.
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        info!(address = ?listener.local_addr().ok(), "HTTP server listening for requests");
        axum::serve(listener, self.router.clone())
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        info!("HTTP server stopped, initiating graceful shutdown...");
        self.shutdown().await;
        Ok(())
    }

    /// Stop every consumer and flush the bus.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());

        for (idx, handle) in self.handles.into_iter().enumerate() {
            match tokio::time::timeout(self.shutdown_timeout, handle).await {
                Ok(Ok(())) => info!(consumer = idx, "Consumer stopped gracefully"),
                Ok(Err(e)) => warn!(consumer = idx, error = %e, "Consumer task failed"),
                Err(_) => warn!(consumer = idx, "Consumer shutdown timed out"),
            }
        }

        if let Err(e) = self.bus.flush().await {
            error!(error = %e, "Failed to flush event bus at shutdown");
        }
        info!("Graceful shutdown complete");
    }
}

async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
