//! Redpanda event bus implementation for the transfer saga.
//!
//! This crate provides a Redpanda-based event bus that implements the
//! [`EventBus`] trait from `saga-core`. It uses rdkafka for Kafka-compatible
//! event streaming, so any Kafka-compatible broker works.
//!
//! # Payload
//!
//! The bus does not interpret payloads. [`SerializedEvent::data`] is written
//! verbatim as the record value and the event type is used as the record key,
//! so all events of one type land on the same partition. On the consuming
//! side the record value becomes `data` again and the record coordinates are
//! attached as metadata (`topic`, `partition`, `offset`).
//!
//! # Delivery Semantics
//!
//! **At-least-once delivery** with manual offset commits:
//! - Nothing is committed when a record is received. Offsets are committed
//!   by [`EventBus::acknowledge`], which consumers call once a batch has been
//!   handled and flushed
//! - If the process crashes before that, the batch is redelivered
//! - Subscribers MUST be idempotent
//! - Ordering is guaranteed within the same partition only
//!
//! # Consumer groups
//!
//! Every saga role needs its own copy of every event, so each role subscribes
//! under its own consumer group. [`RedpandaEventBus::for_consumer_group`]
//! derives a bus for a role that shares the producer of the original.
//!
//! # Example
//!
//! ```no_run
//! use saga_redpanda::RedpandaEventBus;
//! use saga_core::event_bus::EventBus;
//! use saga_core::event::SerializedEvent;
//! use futures::StreamExt;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let event_bus = RedpandaEventBus::new("localhost:9092")?;
//!
//! let event = SerializedEvent::new("StartTransfer".to_string(), br#""{}""#.to_vec(), None);
//! event_bus.publish("transfer-saga-events", &event).await?;
//!
//! let deposits = event_bus.for_consumer_group("transfer-saga-deposit");
//! let mut stream = deposits.subscribe(&["transfer-saga-events"]).await?;
//! while let Some(result) = stream.next().await {
//!     match result {
//!         Ok(event) => println!("Received: {:?}", event.event_type),
//!         Err(e) => eprintln!("Error: {}", e),
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::Message;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{Offset, TopicPartitionList};
use saga_core::event::SerializedEvent;
use saga_core::event_bus::{BusFuture, EventBus, EventBusError, EventStream};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const DEFAULT_BUFFER_SIZE: usize = 1000;
const DEFAULT_OFFSET_RESET: &str = "latest";

/// Consumer of the most recent subscription, used to commit acknowledged
/// offsets.
type ActiveConsumer = Arc<Mutex<Option<Arc<StreamConsumer>>>>;

/// Offset to commit per `(topic, partition)`: one past the highest offset
/// among `events`. Events without record coordinates are ignored.
fn next_offsets(events: &[SerializedEvent]) -> BTreeMap<(String, i32), i64> {
    let mut next = BTreeMap::new();
    for event in events {
        let Some(metadata) = &event.metadata else {
            continue;
        };
        let topic = metadata.get("topic").and_then(serde_json::Value::as_str);
        let partition = metadata
            .get("partition")
            .and_then(serde_json::Value::as_i64)
            .and_then(|p| i32::try_from(p).ok());
        let offset = metadata.get("offset").and_then(serde_json::Value::as_i64);

        if let (Some(topic), Some(partition), Some(offset)) = (topic, partition, offset) {
            let committed = next.entry((topic.to_string(), partition)).or_insert(offset + 1);
            *committed = (*committed).max(offset + 1);
        }
    }
    next
}

/// Redpanda event bus implementation.
///
/// One instance (and therefore one producer) is created per process and
/// shared by the HTTP ingress and every consumer role.
///
/// # Example
///
/// ```no_run
/// use saga_redpanda::RedpandaEventBus;
///
/// # fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let event_bus = RedpandaEventBus::builder()
///     .brokers("localhost:9092,localhost:9093")
///     .producer_acks("all")
///     .compression("lz4")
///     .build()?;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct RedpandaEventBus {
    /// Kafka producer for publishing events
    producer: FutureProducer,
    /// Broker addresses (for creating consumers)
    brokers: String,
    /// Producer timeout, also used as the flush deadline
    timeout: Duration,
    /// Consumer group ID (if explicitly set)
    consumer_group: Option<String>,
    /// Event buffer size for subscribers
    buffer_size: usize,
    /// Auto offset reset policy
    auto_offset_reset: String,
    /// Consumer that acknowledged offsets are committed through
    consumer: ActiveConsumer,
}

impl RedpandaEventBus {
    /// Create a new Redpanda event bus with default configuration.
    ///
    /// # Parameters
    ///
    /// - `brokers`: Comma-separated list of broker addresses (e.g., "localhost:9092")
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if the producer cannot be
    /// created from the given configuration.
    pub fn new(brokers: &str) -> Result<Self, EventBusError> {
        Self::builder().brokers(brokers).build()
    }

    /// Create a new builder for configuring the event bus.
    #[must_use]
    pub fn builder() -> RedpandaEventBusBuilder {
        RedpandaEventBusBuilder::default()
    }

    /// Get a reference to the brokers string.
    #[must_use]
    pub fn brokers(&self) -> &str {
        &self.brokers
    }

    /// Get the consumer group used by [`EventBus::subscribe`], if set.
    #[must_use]
    pub fn consumer_group(&self) -> Option<&str> {
        self.consumer_group.as_deref()
    }

    /// Derive a bus that subscribes under `consumer_group`.
    ///
    /// The derived bus shares this bus's producer, so publishing through
    /// either one goes through the same connection. It has its own
    /// subscription and acknowledges on it.
    #[must_use]
    pub fn for_consumer_group(&self, consumer_group: impl Into<String>) -> Self {
        Self {
            consumer_group: Some(consumer_group.into()),
            consumer: ActiveConsumer::default(),
            ..self.clone()
        }
    }

    fn group_id_for(&self, topics: &[String]) -> String {
        if let Some(group) = &self.consumer_group {
            return group.clone();
        }
        // Sort topics for deterministic consumer group naming
        let mut sorted_topics = topics.to_vec();
        sorted_topics.sort();
        format!("transfer-saga-{}", sorted_topics.join("-"))
    }
}

/// Builder for configuring a [`RedpandaEventBus`].
#[derive(Default)]
pub struct RedpandaEventBusBuilder {
    brokers: Option<String>,
    producer_acks: Option<String>,
    compression: Option<String>,
    timeout: Option<Duration>,
    consumer_group: Option<String>,
    buffer_size: Option<usize>,
    auto_offset_reset: Option<String>,
}

impl RedpandaEventBusBuilder {
    /// Set the broker addresses.
    #[must_use]
    pub fn brokers(mut self, brokers: impl Into<String>) -> Self {
        self.brokers = Some(brokers.into());
        self
    }

    /// Set the producer acknowledgment mode: "0", "1" or "all".
    ///
    /// Default: "1"
    #[must_use]
    pub fn producer_acks(mut self, acks: impl Into<String>) -> Self {
        self.producer_acks = Some(acks.into());
        self
    }

    /// Set the compression codec: "none", "gzip", "snappy", "lz4", "zstd".
    ///
    /// Default: "none"
    #[must_use]
    pub fn compression(mut self, compression: impl Into<String>) -> Self {
        self.compression = Some(compression.into());
        self
    }

    /// Set the producer send timeout (also the flush deadline).
    ///
    /// Default: 5 seconds
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Set the consumer group ID for subscriptions.
    ///
    /// If not set, the consumer group is derived from the subscribed topics.
    #[must_use]
    pub fn consumer_group(mut self, consumer_group: impl Into<String>) -> Self {
        self.consumer_group = Some(consumer_group.into());
        self
    }

    /// Set the event buffer size for subscriptions (default: 1000).
    ///
    /// A size of 0 is treated as 1.
    #[must_use]
    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = Some(buffer_size.max(1));
        self
    }

    /// Set the auto offset reset policy for new consumer groups:
    /// `"earliest"`, `"latest"` or `"error"`.
    ///
    /// Default: "latest"
    #[must_use]
    pub fn auto_offset_reset(mut self, policy: impl Into<String>) -> Self {
        self.auto_offset_reset = Some(policy.into());
        self
    }

    /// Build the [`RedpandaEventBus`].
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::ConnectionFailed`] if:
    /// - Brokers not set
    /// - Cannot create producer
    /// - Invalid configuration
    pub fn build(self) -> Result<RedpandaEventBus, EventBusError> {
        let brokers = self
            .brokers
            .filter(|b| !b.trim().is_empty())
            .ok_or_else(|| EventBusError::ConnectionFailed("Brokers not configured".to_string()))?;

        let acks = self.producer_acks.as_deref().unwrap_or("1");
        let compression = self.compression.as_deref().unwrap_or("none");
        let timeout = self.timeout.unwrap_or(Duration::from_secs(5));
        let buffer_size = self.buffer_size.unwrap_or(DEFAULT_BUFFER_SIZE);
        let auto_offset_reset = self
            .auto_offset_reset
            .unwrap_or_else(|| DEFAULT_OFFSET_RESET.to_string());

        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &brokers)
            .set("message.timeout.ms", timeout.as_millis().to_string())
            .set("acks", acks)
            .set("compression.type", compression)
            .create()
            .map_err(|e| {
                EventBusError::ConnectionFailed(format!("Failed to create producer: {e}"))
            })?;

        tracing::info!(
            brokers = %brokers,
            acks,
            compression,
            buffer_size,
            auto_offset_reset = %auto_offset_reset,
            "RedpandaEventBus created successfully"
        );

        Ok(RedpandaEventBus {
            producer,
            brokers,
            timeout,
            consumer_group: self.consumer_group,
            buffer_size,
            auto_offset_reset,
            consumer: ActiveConsumer::default(),
        })
    }
}

impl EventBus for RedpandaEventBus {
    fn publish(&self, topic: &str, event: &SerializedEvent) -> BusFuture<'_, ()> {
        let topic = topic.to_string();
        let event = event.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            // Events of the same type go to the same partition
            let record = FutureRecord::to(&topic)
                .payload(&event.data)
                .key(event.event_type.as_bytes());

            match self.producer.send(record, Timeout::After(timeout)).await {
                Ok((partition, offset)) => {
                    tracing::debug!(
                        topic = %topic,
                        partition,
                        offset,
                        event_type = %event.event_type,
                        "Event published successfully"
                    );
                    Ok(())
                },
                Err((kafka_error, _)) => {
                    tracing::error!(
                        topic = %topic,
                        event_type = %event.event_type,
                        error = %kafka_error,
                        "Failed to publish event"
                    );
                    Err(EventBusError::PublishFailed {
                        topic,
                        reason: kafka_error.to_string(),
                    })
                },
            }
        })
    }

    fn subscribe(&self, topics: &[&str]) -> BusFuture<'_, EventStream> {
        let topics: Vec<String> = topics.iter().map(|s| (*s).to_string()).collect();
        let consumer_group_id = self.group_id_for(&topics);
        let brokers = self.brokers.clone();
        let buffer_size = self.buffer_size;
        let auto_offset_reset = self.auto_offset_reset.clone();
        let active = self.consumer.clone();

        Box::pin(async move {
            // Manual commit for at-least-once
            let consumer: StreamConsumer = ClientConfig::new()
                .set("bootstrap.servers", &brokers)
                .set("group.id", &consumer_group_id)
                .set("enable.auto.commit", "false")
                .set("auto.offset.reset", &auto_offset_reset)
                .set("session.timeout.ms", "6000")
                .set("enable.partition.eof", "false")
                .create()
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to create consumer: {e}"),
                })?;

            let consumer = Arc::new(consumer);
            let topic_refs: Vec<&str> = topics.iter().map(String::as_str).collect();
            consumer
                .subscribe(&topic_refs)
                .map_err(|e| EventBusError::SubscriptionFailed {
                    topics: topics.clone(),
                    reason: format!("Failed to subscribe to topics: {e}"),
                })?;

            tracing::info!(
                topics = ?topics,
                consumer_group = %consumer_group_id,
                buffer_size,
                auto_offset_reset = %auto_offset_reset,
                manual_commit = true,
                "Subscribed to topics"
            );

            *active.lock().unwrap_or_else(PoisonError::into_inner) = Some(consumer.clone());
            let (tx, rx) = tokio::sync::mpsc::channel(buffer_size);

            // The task forwards messages; offsets are committed on acknowledge
            tokio::spawn(async move {
                use futures::StreamExt;

                let mut stream = consumer.stream();

                while let Some(msg_result) = stream.next().await {
                    match msg_result {
                        Ok(message) => {
                            let event_result = match message.payload() {
                                Some(payload) => {
                                    let event_type = message
                                        .key()
                                        .map(|k| String::from_utf8_lossy(k).into_owned())
                                        .unwrap_or_default();
                                    tracing::trace!(
                                        topic = message.topic(),
                                        partition = message.partition(),
                                        offset = message.offset(),
                                        event_type = %event_type,
                                        "Received event"
                                    );
                                    Ok(SerializedEvent::new(
                                        event_type,
                                        payload.to_vec(),
                                        Some(serde_json::json!({
                                            "topic": message.topic(),
                                            "partition": message.partition(),
                                            "offset": message.offset(),
                                        })),
                                    ))
                                },
                                None => Err(EventBusError::DeserializationFailed(
                                    "Message has no payload".to_string(),
                                )),
                            };

                            if tx.send(event_result).await.is_err() {
                                tracing::debug!("Channel receiver dropped, exiting consumer task");
                                break;
                            }
                        },
                        Err(e) => {
                            let err = EventBusError::TransportError(format!(
                                "Failed to receive message: {e}"
                            ));
                            if tx.send(Err(err)).await.is_err() {
                                break;
                            }
                        },
                    }
                }

                tracing::debug!("Consumer task exiting");
            });

            let stream = async_stream::stream! {
                let mut rx = rx;
                while let Some(result) = rx.recv().await {
                    yield result;
                }
            };

            Ok(Box::pin(stream) as EventStream)
        })
    }

    fn flush(&self) -> BusFuture<'_, ()> {
        let producer = self.producer.clone();
        let timeout = self.timeout;

        Box::pin(async move {
            // rdkafka's flush blocks the calling thread
            tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
                .await
                .map_err(|e| EventBusError::FlushFailed(format!("Flush task failed: {e}")))?
                .map_err(|e| EventBusError::FlushFailed(e.to_string()))
        })
    }

    fn acknowledge(&self, events: &[SerializedEvent]) -> BusFuture<'_, ()> {
        let offsets = next_offsets(events);
        let consumer = self
            .consumer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        Box::pin(async move {
            if offsets.is_empty() {
                return Ok(());
            }
            let consumer = consumer.ok_or_else(|| {
                EventBusError::TransportError("No subscription to commit offsets on".to_string())
            })?;

            let mut list = TopicPartitionList::new();
            for ((topic, partition), offset) in &offsets {
                list.add_partition_offset(topic, *partition, Offset::Offset(*offset))
                    .map_err(|e| EventBusError::TransportError(format!("Invalid offset: {e}")))?;
            }

            consumer.commit(&list, CommitMode::Async).map_err(|e| {
                EventBusError::TransportError(format!("Failed to commit offsets: {e}"))
            })?;
            tracing::debug!(partitions = offsets.len(), "Committed acknowledged offsets");
            Ok(())
        })
    }
}
