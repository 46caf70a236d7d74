//! Event bus abstraction for the saga choreography.
//!
//! This module provides the [`EventBus`] trait for publishing and subscribing
//! to events. Every saga participant talks to the others exclusively through
//! it; there is no direct call between participants.
//!
//! # Architecture
//!
//! ```text
//!   ┌───────────┐   StartTransfer   ┌──────────────────┐
//!   │ Initiator │──────────────────►│                  │
//!   └───────────┘                   │                  │
//!   ┌───────────┐   *Completed /    │    Event Bus     │
//!   │ Processors│◄─────────────────►│ (at-least-once)  │
//!   └───────────┘   *Compensation   │                  │
//!   ┌───────────┐                   │                  │
//!   │Compensator│◄──────────────────│                  │
//!   └───────────┘                   └──────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - **At-least-once delivery**: Events may be delivered multiple times; a
//!   consumed event counts as done only once it is acknowledged
//! - **Idempotency**: Subscribers must handle duplicate events
//! - **Ordered within partition only**: No ordering across partitions or topics
//! - **Fan-out**: Every subscription receives every event of its topics; a
//!   subscriber filters on the event type itself
//!
//! # Implementations
//!
//! - `InMemoryEventBus` in `saga-testing` - For tests and local runs
//! - `RedpandaEventBus` in `saga-redpanda` - For production (Kafka-compatible)

use crate::event::SerializedEvent;
use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Errors that can occur during event bus operations.
#[derive(Error, Debug, Clone)]
pub enum EventBusError {
    /// Failed to connect to the event bus
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to publish an event to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to topics
    #[error("Subscription failed for topics {topics:?}: {reason}")]
    SubscriptionFailed {
        /// The topics that failed to subscribe
        topics: Vec<String>,
        /// The reason for failure
        reason: String,
    },

    /// A received message could not be turned into a [`SerializedEvent`]
    #[error("Deserialization failed: {0}")]
    DeserializationFailed(String),

    /// Outstanding publishes could not be flushed
    #[error("Flush failed: {0}")]
    FlushFailed(String),

    /// Network or transport error
    #[error("Transport error: {0}")]
    TransportError(String),
}

/// Stream of events from subscriptions.
///
/// Each item is a `Result` that may contain an event or a transport error.
/// Transport errors are per-message; the stream keeps going after them.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<SerializedEvent, EventBusError>> + Send>>;

/// Boxed future returned by [`EventBus`] operations.
pub type BusFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, EventBusError>> + Send + 'a>>;

/// Trait for event bus implementations.
///
/// # Design Principles
///
/// - **Async-first**: All operations are async for non-blocking I/O
/// - **At-least-once**: Subscribers may receive duplicate events
/// - **Explicit lifecycle**: A bus is created once per process and shared;
///   [`flush`](EventBus::flush) drains buffered publishes and is called at
///   the end of every consumer batch and at shutdown
///
/// # Dyn Compatibility
///
/// This trait uses explicit `Pin<Box<dyn Future>>` returns instead of `async fn`
/// so it can be shared as `Arc<dyn EventBus>` between the HTTP ingress and
/// every consumer task.
pub trait EventBus: Send + Sync {
    /// Publish an event to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::PublishFailed`] if the publish operation fails.
    fn publish(&self, topic: &str, event: &SerializedEvent) -> BusFuture<'_, ()>;

    /// Publish several events to a topic, in order.
    ///
    /// Stops at the first failure; events before it may already be delivered.
    ///
    /// # Errors
    ///
    /// Returns the first [`EventBusError`] encountered.
    fn publish_all<'a>(
        &'a self,
        topic: &'a str,
        events: &'a [SerializedEvent],
    ) -> BusFuture<'a, ()> {
        Box::pin(async move {
            for event in events {
                self.publish(topic, event).await?;
            }
            Ok(())
        })
    }

    /// Subscribe to one or more topics and receive a stream of events.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::SubscriptionFailed`] if subscription fails.
    fn subscribe(&self, topics: &[&str]) -> BusFuture<'_, EventStream>;

    /// Wait until every event handed to [`publish`](EventBus::publish) has
    /// been acknowledged by the transport.
    ///
    /// The default implementation is a no-op for buses that publish
    /// synchronously.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::FlushFailed`] if buffered events could not be
    /// delivered in time.
    fn flush(&self) -> BusFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }

    /// Mark `events` received from [`subscribe`](EventBus::subscribe) as
    /// processed, so they are not redelivered after a restart.
    ///
    /// Consumers call this once a batch has been handled and flushed.
    /// Anything not yet acknowledged when the process dies is delivered
    /// again. The default implementation is a no-op for buses without
    /// durable positions.
    ///
    /// # Errors
    ///
    /// Returns [`EventBusError::TransportError`] if the positions could not
    /// be stored; the events will then be redelivered.
    fn acknowledge(&self, events: &[SerializedEvent]) -> BusFuture<'_, ()> {
        let _ = events;
        Box::pin(async { Ok(()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<(String, String)>>,
        fail_on: Option<String>,
    }

    impl EventBus for RecordingBus {
        fn publish(&self, topic: &str, event: &SerializedEvent) -> BusFuture<'_, ()> {
            let topic = topic.to_string();
            let event_type = event.event_type.clone();
            Box::pin(async move {
                if self.fail_on.as_deref() == Some(event_type.as_str()) {
                    return Err(EventBusError::PublishFailed {
                        topic,
                        reason: "refused".to_string(),
                    });
                }
                if let Ok(mut published) = self.published.lock() {
                    published.push((topic, event_type));
                }
                Ok(())
            })
        }

        fn subscribe(&self, topics: &[&str]) -> BusFuture<'_, EventStream> {
            let topics = topics.iter().map(|t| (*t).to_string()).collect();
            Box::pin(async move {
                Err(EventBusError::SubscriptionFailed {
                    topics,
                    reason: "not supported".to_string(),
                })
            })
        }
    }

    fn event(event_type: &str) -> SerializedEvent {
        SerializedEvent::new(event_type.to_string(), vec![], None)
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn publish_all_preserves_order() {
        let bus = RecordingBus::default();
        let events = vec![event("A"), event("B"), event("C")];

        bus.publish_all("saga", &events).await.unwrap();

        let published = bus.published.lock().unwrap();
        let types: Vec<&str> = published.iter().map(|(_, t)| t.as_str()).collect();
        assert_eq!(types, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    #[allow(clippy::unwrap_used)]
    async fn publish_all_stops_at_first_failure() {
        let bus = RecordingBus {
            fail_on: Some("B".to_string()),
            ..RecordingBus::default()
        };
        let events = vec![event("A"), event("B"), event("C")];

        let result = bus.publish_all("saga", &events).await;

        assert!(matches!(result, Err(EventBusError::PublishFailed { .. })));
        assert_eq!(bus.published.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn default_flush_and_acknowledge_succeed() {
        let bus = RecordingBus::default();
        assert!(bus.flush().await.is_ok());
        assert!(bus.acknowledge(&[event("A")]).await.is_ok());
    }
}
