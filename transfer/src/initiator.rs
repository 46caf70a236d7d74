//! Transfer Initiator: turns an accepted request into a `StartTransfer`.

use crate::codec::{self, EventFields};
use crate::error::{BusError, ValidationError};
use crate::events::{SagaEvent, TransferStarted};
use crate::types::TransferId;
use crate::validation;
use chrono::{DateTime, Utc};
use saga_core::environment::Clock;
use saga_core::event::EventError;
use saga_core::event_bus::EventBus;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

/// Why a transfer was not started.
#[derive(Error, Debug)]
pub enum InitiateError {
    /// The request is missing or has ill-typed fields. Nothing was published.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// The event could not be encoded. Nothing was published.
    #[error("failed to encode StartTransfer: {0}")]
    Encode(#[from] EventError),

    /// The bus refused the event.
    #[error("failed to publish StartTransfer: {0}")]
    Publish(#[from] BusError),
}

/// Response to an accepted transfer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferAccepted {
    /// Always `"accepted"`
    pub status: &'static str,
    /// Identifier threaded through every event of the transfer
    pub transfer_id: TransferId,
    /// When the transfer was accepted
    pub accepted_at: DateTime<Utc>,
}

/// Validates transfer requests and publishes `StartTransfer`.
#[derive(Clone)]
pub struct TransferInitiator {
    bus: Arc<dyn EventBus>,
    topic: String,
    clock: Arc<dyn Clock>,
}

impl TransferInitiator {
    /// Create an initiator publishing to `topic`.
    #[must_use]
    pub fn new(bus: Arc<dyn EventBus>, topic: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            bus,
            topic: topic.into(),
            clock,
        }
    }

    /// Start a transfer.
    ///
    /// Publishes exactly one `StartTransfer` with a fresh transfer id. No
    /// retry on publish failure.
    ///
    /// # Errors
    ///
    /// Returns [`InitiateError::Validation`] before publishing anything when
    /// `fromAccount`, `toAccount` or `amount` is missing, and
    /// [`InitiateError::Publish`] when the bus refuses the event.
    pub async fn initiate(&self, request: &EventFields) -> Result<TransferAccepted, InitiateError> {
        let transfer = validation::transfer_request(request)?;
        let transfer_id = TransferId::new();

        let event = SagaEvent::StartTransfer(TransferStarted {
            transfer_id: Some(transfer_id),
            from_account: transfer.from_account,
            to_account: transfer.to_account,
            amount: transfer.amount,
        });
        let serialized = codec::encode(&event)?;

        if let Err(e) = self.bus.publish(&self.topic, &serialized).await {
            error!(transfer_id = %transfer_id, error = %e, "Failed to publish StartTransfer");
            return Err(e.into());
        }

        info!(transfer_id = %transfer_id, topic = %self.topic, "Transfer started");
        Ok(TransferAccepted {
            status: "accepted",
            transfer_id,
            accepted_at: self.clock.now(),
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use saga_testing::{FailingEventBus, InMemoryEventBus, test_clock};
    use serde_json::json;

    fn request(value: serde_json::Value) -> EventFields {
        match value {
            serde_json::Value::Object(map) => EventFields::from_map(map),
            _ => EventFields::default(),
        }
    }

    #[tokio::test]
    async fn publishes_one_start_transfer_with_transfer_id() {
        let bus = InMemoryEventBus::new();
        let initiator = TransferInitiator::new(Arc::new(bus.clone()), "transfers", Arc::new(test_clock()));

        let accepted = initiator
            .initiate(&request(json!({"fromAccount": "A", "toAccount": "B", "amount": 100})))
            .await
            .unwrap();

        let published = bus.published_to("transfers");
        assert_eq!(published.len(), 1);
        let event = codec::decode_event(&published[0].data).unwrap();
        assert_eq!(event.transfer_id(), Some(accepted.transfer_id));
        assert_eq!(accepted.accepted_at, test_clock().now());
    }

    #[tokio::test]
    async fn invalid_request_publishes_nothing() {
        let bus = InMemoryEventBus::new();
        let initiator = TransferInitiator::new(Arc::new(bus.clone()), "transfers", Arc::new(test_clock()));

        let result = initiator
            .initiate(&request(json!({"fromAccount": "A", "toAccount": "B"})))
            .await;

        assert!(matches!(result, Err(InitiateError::Validation(_))));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn publish_failure_is_reported() {
        let initiator =
            TransferInitiator::new(Arc::new(FailingEventBus::new()), "transfers", Arc::new(test_clock()));

        let result = initiator
            .initiate(&request(json!({"fromAccount": "A", "toAccount": "B", "amount": 5})))
            .await;

        assert!(matches!(result, Err(InitiateError::Publish(_))));
    }
}
