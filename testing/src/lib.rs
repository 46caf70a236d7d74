//! # Saga Testing
//!
//! Testing utilities for the transfer saga.
//!
//! This crate provides:
//! - [`InMemoryEventBus`]: a fan-out event bus that records everything published
//! - [`FailingEventBus`]: a bus whose every operation fails
//! - [`FixedClock`]: deterministic time
//!
//! ## Example
//!
//! ```
//! use saga_testing::InMemoryEventBus;
//! use saga_core::event::SerializedEvent;
//! use saga_core::event_bus::EventBus;
//! use futures::StreamExt;
//!
//! # tokio_test::block_on(async {
//! let bus = InMemoryEventBus::new();
//! let mut stream = bus.subscribe(&["saga"]).await.unwrap();
//!
//! let event = SerializedEvent::new("StartTransfer".to_string(), b"\"{}\"".to_vec(), None);
//! bus.publish("saga", &event).await.unwrap();
//!
//! let received = stream.next().await.unwrap().unwrap();
//! assert_eq!(received.event_type, "StartTransfer");
//! assert_eq!(bus.published_types(), vec!["StartTransfer"]);
//! # });
//! ```

use chrono::{DateTime, Utc};
use saga_core::environment::Clock;

/// Mock implementations of the saga's injected capabilities.
pub mod mocks {
    use super::{Clock, DateTime, Utc};
    use saga_core::event::SerializedEvent;
    use saga_core::event_bus::{BusFuture, EventBus, EventBusError, EventStream};
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Fixed clock for deterministic tests
    ///
    /// Always returns the same time, making tests reproducible.
    ///
    /// # Example
    ///
    /// ```
    /// use saga_testing::mocks::FixedClock;
    /// use saga_core::environment::Clock;
    /// use chrono::Utc;
    ///
    /// let clock = FixedClock::new(Utc::now());
    /// assert_eq!(clock.now(), clock.now());
    /// ```
    #[derive(Debug, Clone)]
    pub struct FixedClock {
        time: DateTime<Utc>,
    }

    impl FixedClock {
        /// Create a new fixed clock with the given time
        #[must_use]
        pub const fn new(time: DateTime<Utc>) -> Self {
            Self { time }
        }
    }

    impl Clock for FixedClock {
        fn now(&self) -> DateTime<Utc> {
            self.time
        }
    }

    /// Create a default fixed clock for tests (2025-01-01 00:00:00 UTC)
    ///
    /// # Panics
    ///
    /// This function will panic if the hardcoded timestamp fails to parse,
    /// which should never happen in practice.
    #[must_use]
    #[allow(clippy::expect_used)]
    pub fn test_clock() -> FixedClock {
        FixedClock::new(
            DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
                .expect("hardcoded timestamp should always parse")
                .with_timezone(&Utc),
        )
    }

    type Delivery = Result<SerializedEvent, EventBusError>;

    struct Subscriber {
        topics: Vec<String>,
        tx: mpsc::UnboundedSender<Delivery>,
    }

    #[derive(Default)]
    struct BusState {
        subscribers: Vec<Subscriber>,
        published: Vec<(String, SerializedEvent)>,
        acknowledged: Vec<SerializedEvent>,
        rejected_types: HashSet<String>,
    }

    /// In-memory event bus.
    ///
    /// Every subscription receives every event published to one of its
    /// topics after it subscribed, which mirrors one consumer group per
    /// subscriber on a real broker. Delivery is immediate and ordered.
    ///
    /// Everything successfully published is also recorded so tests can
    /// assert on the saga's output.
    #[derive(Clone, Default)]
    pub struct InMemoryEventBus {
        state: Arc<Mutex<BusState>>,
        flushes: Arc<AtomicUsize>,
    }

    impl InMemoryEventBus {
        /// Create an empty bus.
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }

        fn state(&self) -> MutexGuard<'_, BusState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        /// Make every later publish of `event_type` fail.
        pub fn reject_event_type(&self, event_type: impl Into<String>) {
            self.state().rejected_types.insert(event_type.into());
        }

        /// Every event published so far, in publish order.
        #[must_use]
        pub fn published(&self) -> Vec<SerializedEvent> {
            self.state()
                .published
                .iter()
                .map(|(_, event)| event.clone())
                .collect()
        }

        /// Events published to `topic`, in publish order.
        #[must_use]
        pub fn published_to(&self, topic: &str) -> Vec<SerializedEvent> {
            self.state()
                .published
                .iter()
                .filter(|(t, _)| t == topic)
                .map(|(_, event)| event.clone())
                .collect()
        }

        /// The event types published so far, in publish order.
        #[must_use]
        pub fn published_types(&self) -> Vec<String> {
            self.state()
                .published
                .iter()
                .map(|(_, event)| event.event_type.clone())
                .collect()
        }

        /// Every event consumers acknowledged, in acknowledgement order.
        #[must_use]
        pub fn acknowledged(&self) -> Vec<SerializedEvent> {
            self.state().acknowledged.clone()
        }

        /// How many times [`EventBus::flush`] has been called.
        #[must_use]
        pub fn flush_count(&self) -> usize {
            self.flushes.load(Ordering::SeqCst)
        }

        /// Number of live subscriptions.
        #[must_use]
        pub fn subscriber_count(&self) -> usize {
            let mut state = self.state();
            state.subscribers.retain(|s| !s.tx.is_closed());
            state.subscribers.len()
        }

        /// Push a transport error to every subscriber of `topic`.
        pub fn inject_error(&self, topic: &str, error: EventBusError) {
            let mut state = self.state();
            state.subscribers.retain(|s| {
                !s.topics.iter().any(|t| t == topic) || s.tx.send(Err(error.clone())).is_ok()
            });
        }

        /// Poll until `predicate` holds for the published events or
        /// `timeout` elapses. Returns whether the predicate held.
        pub async fn wait_until<F>(&self, timeout: Duration, mut predicate: F) -> bool
        where
            F: FnMut(&[SerializedEvent]) -> bool,
        {
            let deadline = tokio::time::Instant::now() + timeout;
            loop {
                if predicate(&self.published()) {
                    return true;
                }
                if tokio::time::Instant::now() >= deadline {
                    return false;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
    }

    impl EventBus for InMemoryEventBus {
        fn publish(&self, topic: &str, event: &SerializedEvent) -> BusFuture<'_, ()> {
            let topic = topic.to_string();
            let event = event.clone();

            Box::pin(async move {
                let mut state = self.state();
                if state.rejected_types.contains(&event.event_type) {
                    return Err(EventBusError::PublishFailed {
                        topic,
                        reason: format!("{} rejected by test bus", event.event_type),
                    });
                }

                // Closed receivers are dropped on the way
                state.subscribers.retain(|s| {
                    !s.topics.contains(&topic) || s.tx.send(Ok(event.clone())).is_ok()
                });
                state.published.push((topic, event));
                Ok(())
            })
        }

        fn subscribe(&self, topics: &[&str]) -> BusFuture<'_, EventStream> {
            let topics: Vec<String> = topics.iter().map(|t| (*t).to_string()).collect();

            Box::pin(async move {
                let (tx, mut rx) = mpsc::unbounded_channel();
                self.state().subscribers.push(Subscriber { topics, tx });

                let stream = async_stream::stream! {
                    while let Some(delivery) = rx.recv().await {
                        yield delivery;
                    }
                };
                Ok(Box::pin(stream) as EventStream)
            })
        }

        fn flush(&self) -> BusFuture<'_, ()> {
            self.flushes.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Ok(()) })
        }

        fn acknowledge(&self, events: &[SerializedEvent]) -> BusFuture<'_, ()> {
            self.state().acknowledged.extend_from_slice(events);
            Box::pin(async { Ok(()) })
        }
    }

    /// Event bus whose every operation fails.
    ///
    /// Useful for exercising the error paths of publishers.
    #[derive(Debug, Clone, Default)]
    pub struct FailingEventBus;

    impl FailingEventBus {
        /// Create a failing bus.
        #[must_use]
        pub const fn new() -> Self {
            Self
        }
    }

    impl EventBus for FailingEventBus {
        fn publish(&self, topic: &str, _event: &SerializedEvent) -> BusFuture<'_, ()> {
            let topic = topic.to_string();
            Box::pin(async move {
                Err(EventBusError::PublishFailed {
                    topic,
                    reason: "broker unavailable".to_string(),
                })
            })
        }

        fn subscribe(&self, topics: &[&str]) -> BusFuture<'_, EventStream> {
            let topics = topics.iter().map(|t| (*t).to_string()).collect();
            Box::pin(async move {
                Err(EventBusError::SubscriptionFailed {
                    topics,
                    reason: "broker unavailable".to_string(),
                })
            })
        }

        fn flush(&self) -> BusFuture<'_, ()> {
            Box::pin(async { Err(EventBusError::FlushFailed("broker unavailable".to_string())) })
        }
    }
}

// Re-export commonly used items
pub use mocks::{FailingEventBus, FixedClock, InMemoryEventBus, test_clock};

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use saga_core::event::SerializedEvent;
    use saga_core::event_bus::{EventBus, EventBusError};
    use std::time::Duration;

    fn event(event_type: &str) -> SerializedEvent {
        SerializedEvent::new(event_type.to_string(), b"\"{}\"".to_vec(), None)
    }

    #[test]
    fn test_fixed_clock() {
        let clock = test_clock();
        let time1 = clock.now();
        let time2 = clock.now();
        assert_eq!(time1, time2);
    }

    #[tokio::test]
    async fn every_subscriber_receives_every_event() {
        let bus = InMemoryEventBus::new();
        let mut first = bus.subscribe(&["saga"]).await.unwrap();
        let mut second = bus.subscribe(&["saga"]).await.unwrap();

        bus.publish("saga", &event("StartTransfer")).await.unwrap();

        assert_eq!(first.next().await.unwrap().unwrap().event_type, "StartTransfer");
        assert_eq!(second.next().await.unwrap().unwrap().event_type, "StartTransfer");
    }

    #[tokio::test]
    async fn subscribers_only_see_their_topics() {
        let bus = InMemoryEventBus::new();
        let mut stream = bus.subscribe(&["saga"]).await.unwrap();

        bus.publish("other", &event("Noise")).await.unwrap();
        bus.publish("saga", &event("StartTransfer")).await.unwrap();

        assert_eq!(stream.next().await.unwrap().unwrap().event_type, "StartTransfer");
        assert_eq!(bus.published_to("other").len(), 1);
    }

    #[tokio::test]
    async fn rejected_types_fail_and_are_not_recorded() {
        let bus = InMemoryEventBus::new();
        bus.reject_event_type("DepositCompleted");

        let result = bus.publish("saga", &event("DepositCompleted")).await;

        assert!(matches!(result, Err(EventBusError::PublishFailed { .. })));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn dropped_subscriptions_are_pruned() {
        let bus = InMemoryEventBus::new();
        let stream = bus.subscribe(&["saga"]).await.unwrap();
        assert_eq!(bus.subscriber_count(), 1);

        drop(stream);
        bus.publish("saga", &event("StartTransfer")).await.unwrap();

        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn flush_is_counted() {
        let bus = InMemoryEventBus::new();
        bus.flush().await.unwrap();
        bus.flush().await.unwrap();
        assert_eq!(bus.flush_count(), 2);
    }

    #[tokio::test]
    async fn acknowledgements_are_recorded() {
        let bus = InMemoryEventBus::new();
        bus.acknowledge(&[event("StartTransfer"), event("DepositCompleted")])
            .await
            .unwrap();
        assert_eq!(bus.acknowledged().len(), 2);
    }

    #[tokio::test]
    async fn wait_until_times_out_when_nothing_happens() {
        let bus = InMemoryEventBus::new();
        let seen = bus
            .wait_until(Duration::from_millis(20), |events| !events.is_empty())
            .await;
        assert!(!seen);
    }

    #[tokio::test]
    async fn failing_bus_fails_everything() {
        let bus = FailingEventBus::new();
        assert!(bus.publish("saga", &event("StartTransfer")).await.is_err());
        assert!(bus.subscribe(&["saga"]).await.is_err());
        assert!(bus.flush().await.is_err());
    }
}
