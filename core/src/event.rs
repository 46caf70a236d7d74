//! Event trait and related types.
//!
//! Events represent facts about things that have happened and are immutable.
//! A participant turns its typed event into a [`SerializedEvent`] before
//! handing it to the event bus, and turns the bytes it receives back into a
//! typed event on the consuming side.
//!
//! # Design
//!
//! Events are serialized as JSON. The saga's participants are independently
//! deployed and the wire format is shared with non-Rust producers, so a
//! self-describing, human-readable encoding is used instead of a compact
//! binary one.
//!
//! # Example
//!
//! ```
//! use saga_core::event::Event;
//!
//! #[derive(Clone, Debug)]
//! enum AccountEvent {
//!     Credited { account: String, amount: f64 },
//!     Debited { account: String, amount: f64 },
//! }
//!
//! impl Event for AccountEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             AccountEvent::Credited { .. } => "Credited",
//!             AccountEvent::Debited { .. } => "Debited",
//!         }
//!     }
//! }
//! ```

use std::fmt;
use thiserror::Error;

/// Error types for event operations.
#[derive(Error, Debug)]
pub enum EventError {
    /// Failed to serialize event to bytes.
    #[error("Failed to serialize event: {0}")]
    SerializationError(String),
}

/// An event that can be published on the event bus.
///
/// # Event Naming Convention
///
/// `event_type()` returns the stable discriminator that consumers filter on.
/// It must match the `type` field of the JSON representation so that
/// consumers can route without decoding the full payload.
///
/// # Thread Safety
///
/// Events must be `Send + Sync + 'static` to be passed between the tasks
/// that publish and consume them.
pub trait Event: Send + Sync + 'static {
    /// Returns the event type identifier for this event.
    fn event_type(&self) -> &'static str;
}

/// A serialized event as it travels through the event bus.
///
/// `data` holds the transport payload exactly as it is written to (or read
/// from) the bus. The event bus never interprets it; producers and consumers
/// agree on its encoding.
#[derive(Clone, Debug, PartialEq)]
pub struct SerializedEvent {
    /// The event type identifier (e.g., "StartTransfer").
    ///
    /// Used as the partitioning key by bus implementations. Consumers must
    /// not trust it for routing; the payload carries the authoritative type.
    pub event_type: String,

    /// The transport payload.
    pub data: Vec<u8>,

    /// Optional transport metadata.
    ///
    /// Consumed events carry `topic`, `partition` and `offset`.
    pub metadata: Option<serde_json::Value>,
}

impl SerializedEvent {
    /// Create a new serialized event.
    ///
    /// # Examples
    ///
    /// ```
    /// use saga_core::event::SerializedEvent;
    ///
    /// let event = SerializedEvent::new(
    ///     "StartTransfer".to_string(),
    ///     br#""{}""#.to_vec(),
    ///     None,
    /// );
    /// assert_eq!(event.event_type, "StartTransfer");
    /// ```
    #[must_use]
    pub const fn new(
        event_type: String,
        data: Vec<u8>,
        metadata: Option<serde_json::Value>,
    ) -> Self {
        Self {
            event_type,
            data,
            metadata,
        }
    }
}

impl fmt::Display for SerializedEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SerializedEvent {{ type: {}, size: {} bytes }}",
            self.event_type,
            self.data.len()
        )
    }
}
