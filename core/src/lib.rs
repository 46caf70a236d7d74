//! # Saga Core
//!
//! Core traits and types shared by every participant of the transfer saga.
//!
//! The saga is a *choreography*: there is no coordinator. Each participant
//! subscribes to the shared event bus, reacts to the event types it owns and
//! publishes its own outcome events. This crate only defines the vocabulary
//! those participants share:
//!
//! - [`event`]: the [`Event`](event::Event) trait and the transport-neutral
//!   [`SerializedEvent`](event::SerializedEvent)
//! - [`event_bus`]: the [`EventBus`](event_bus::EventBus) publish/subscribe contract
//! - [`environment`]: injected capabilities such as [`Clock`](environment::Clock)
//!
//! Concrete buses live in `saga-redpanda` (production) and `saga-testing`
//! (in-memory).

#![forbid(unsafe_code)]
#![warn(missing_docs)]

// Re-export commonly used types
pub use chrono::{DateTime, Utc};

pub mod event;
pub mod event_bus;

/// Environment module - Dependency injection traits
///
/// External capabilities are abstracted behind traits and injected into the
/// components that need them, so tests can substitute deterministic versions.
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// # Examples
    ///
    /// ```
    /// use saga_core::environment::{Clock, SystemClock};
    ///
    /// let clock = SystemClock;
    /// let before = clock.now();
    /// assert!(clock.now() >= before);
    /// ```
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Wall-clock time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}
