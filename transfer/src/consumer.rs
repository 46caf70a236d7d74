//! Event bus consumer with batching and automatic reconnection.
//!
//! `EventConsumer` owns the subscribe-process-reconnect loop for one role:
//!
//! ```text
//! loop {
//!     subscribe
//!     loop {
//!         collect ready messages (up to batch_max_size)
//!         handler.handle_batch(batch)
//!         bus.flush()
//!         bus.acknowledge(batch)
//!     }
//!     stream ended or failed: wait retry_delay, resubscribe
//! }
//! ```
//!
//! Transport errors inside a batch are logged and dropped from it. The
//! shutdown signal is honoured between batches and while waiting to
//! reconnect; a batch that has started is always finished and flushed.
//!
//! A batch is acknowledged only after its outcomes were flushed, so a crash
//! mid-batch leads to redelivery rather than loss. When the flush fails the
//! batch is left unacknowledged.

use crate::dispatch::BatchHandler;
use crate::error::ConfigurationError;
use futures::StreamExt;
use saga_core::event::SerializedEvent;
use saga_core::event_bus::{EventBus, EventStream};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

/// Default delay before resubscribing.
pub const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Default upper bound on messages per batch.
pub const DEFAULT_BATCH_MAX_SIZE: usize = 100;

/// Consumes batches for one [`BatchHandler`].
pub struct EventConsumer {
    name: String,
    topics: Vec<String>,
    event_bus: Arc<dyn EventBus>,
    handler: Arc<dyn BatchHandler>,
    shutdown: broadcast::Receiver<()>,
    retry_delay: Duration,
    batch_max_size: usize,
}

impl EventConsumer {
    /// Create a builder for configuring a consumer.
    #[must_use]
    pub fn builder() -> EventConsumerBuilder {
        EventConsumerBuilder::default()
    }

    /// Spawn the consumer as a background task.
    ///
    /// The task runs until the shutdown signal fires.
    #[must_use]
    pub fn spawn(mut self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&mut self) {
        info!(consumer = %self.name, "Event consumer started");

        loop {
            let topics: Vec<&str> = self.topics.iter().map(String::as_str).collect();

            let subscribed = tokio::select! {
                _ = self.shutdown.recv() => break,
                subscribed = self.event_bus.subscribe(&topics) => subscribed,
            };

            match subscribed {
                Ok(stream) => {
                    info!(consumer = %self.name, topics = ?self.topics, "Subscribed to event bus");
                    if self.process_stream(stream).await.is_break() {
                        break;
                    }
                    warn!(
                        consumer = %self.name,
                        "Event stream ended, reconnecting in {:?}",
                        self.retry_delay
                    );
                },
                Err(e) => {
                    error!(
                        consumer = %self.name,
                        error = %e,
                        "Failed to subscribe to event bus, retrying in {:?}",
                        self.retry_delay
                    );
                },
            }

            tokio::select! {
                _ = self.shutdown.recv() => break,
                () = tokio::time::sleep(self.retry_delay) => {},
            }
        }

        info!(consumer = %self.name, "Event consumer stopped");
    }

    /// Process batches until the stream ends (`Continue`) or shutdown is
    /// requested (`Break`).
    async fn process_stream(&mut self, stream: EventStream) -> std::ops::ControlFlow<()> {
        let mut batches = stream.ready_chunks(self.batch_max_size);

        loop {
            let deliveries = tokio::select! {
                _ = self.shutdown.recv() => {
                    info!(consumer = %self.name, "Shutdown requested during processing");
                    return std::ops::ControlFlow::Break(());
                }
                next = batches.next() => match next {
                    Some(deliveries) => deliveries,
                    None => return std::ops::ControlFlow::Continue(()),
                },
            };

            let batch: Vec<SerializedEvent> = deliveries
                .into_iter()
                .filter_map(|delivery| match delivery {
                    Ok(event) => Some(event),
                    Err(e) => {
                        error!(consumer = %self.name, error = %e, "Error receiving event from stream");
                        None
                    },
                })
                .collect();

            if !batch.is_empty() {
                let report = self.handler.handle_batch(&batch).await;
                debug!(consumer = %self.name, received = report.received, "Batch complete");
            }

            if let Err(e) = self.event_bus.flush().await {
                error!(consumer = %self.name, error = %e, "Failed to flush event bus after batch");
                continue;
            }

            if !batch.is_empty() {
                if let Err(e) = self.event_bus.acknowledge(&batch).await {
                    warn!(
                        consumer = %self.name,
                        error = %e,
                        "Failed to acknowledge batch (events may be redelivered)"
                    );
                }
            }
        }
    }
}

/// Builder for configuring an [`EventConsumer`].
#[derive(Default)]
pub struct EventConsumerBuilder {
    name: Option<String>,
    topics: Option<Vec<String>>,
    event_bus: Option<Arc<dyn EventBus>>,
    handler: Option<Arc<dyn BatchHandler>>,
    shutdown: Option<broadcast::Receiver<()>>,
    retry_delay: Option<Duration>,
    batch_max_size: Option<usize>,
}

impl EventConsumerBuilder {
    /// Set consumer name. Defaults to the handler's name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set topics to subscribe to.
    #[must_use]
    pub fn topics(mut self, topics: Vec<String>) -> Self {
        self.topics = Some(topics);
        self
    }

    /// Set event bus instance.
    #[must_use]
    pub fn event_bus(mut self, event_bus: Arc<dyn EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Set batch handler.
    #[must_use]
    pub fn handler(mut self, handler: Arc<dyn BatchHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// Set shutdown signal receiver.
    #[must_use]
    pub fn shutdown(mut self, shutdown: broadcast::Receiver<()>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    /// Set retry delay (default: 5 seconds).
    #[must_use]
    pub const fn retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    /// Set the largest batch handed to the handler (default: 100).
    #[must_use]
    pub const fn batch_max_size(mut self, size: usize) -> Self {
        self.batch_max_size = Some(size);
        self
    }

    /// Build the [`EventConsumer`].
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::Missing`] if the topics, event bus,
    /// handler or shutdown receiver were not set, and
    /// [`ConfigurationError::InvalidValue`] for a zero batch size.
    pub fn build(self) -> Result<EventConsumer, ConfigurationError> {
        let missing = |setting| ConfigurationError::Missing {
            component: "EventConsumer",
            setting,
        };

        let handler = self.handler.ok_or_else(|| missing("handler"))?;
        let batch_max_size = self.batch_max_size.unwrap_or(DEFAULT_BATCH_MAX_SIZE);
        if batch_max_size == 0 {
            return Err(ConfigurationError::InvalidValue {
                name: "BATCH_MAX_SIZE",
                value: "0".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(EventConsumer {
            name: self.name.unwrap_or_else(|| handler.name().to_string()),
            topics: self.topics.ok_or_else(|| missing("topics"))?,
            event_bus: self.event_bus.ok_or_else(|| missing("event_bus"))?,
            handler,
            shutdown: self.shutdown.ok_or_else(|| missing("shutdown"))?,
            retry_delay: self.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY),
            batch_max_size,
        })
    }
}
