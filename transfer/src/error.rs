//! Error taxonomy for the transfer saga.
//!
//! | Error                  | Raised by                  | Consequence                           |
//! |------------------------|----------------------------|---------------------------------------|
//! | [`DecodeError`]        | codec                      | message skipped, batch continues      |
//! | [`ValidationError`]    | field validation, ingress  | message skipped / HTTP 400            |
//! | [`BusError`]           | event bus                  | logged, batch continues / HTTP 500    |
//! | [`LedgerError`]        | ledger                     | compensation event / reversal retried |
//! | [`ConfigurationError`] | start-up                   | process exits                         |

use crate::types::{AccountId, Amount, Step, TransferId};
use thiserror::Error;

/// Failures of the event bus, shared with every other saga crate.
pub type BusError = saga_core::event_bus::EventBusError;

/// A transport payload that is not a well-formed, string-wrapped JSON object.
#[derive(Error, Debug)]
pub enum DecodeError {
    /// The raw payload is not JSON.
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(#[source] serde_json::Error),

    /// The raw payload is JSON but not the string wrapping the event body.
    #[error("envelope must be a JSON string, found {found}")]
    EnvelopeNotString {
        /// JSON kind that was found instead
        found: &'static str,
    },

    /// The wrapped body is not JSON.
    #[error("malformed event body: {0}")]
    MalformedBody(#[source] serde_json::Error),

    /// The wrapped body is JSON but not an object.
    #[error("event body must be a JSON object, found {found}")]
    BodyNotObject {
        /// JSON kind that was found instead
        found: &'static str,
    },
}

/// A decoded event (or ingress request) whose fields are unusable.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// One or more required fields are absent, null, empty or zero.
    #[error("Missing required fields: {}", .0.join(", "))]
    MissingFields(Vec<&'static str>),

    /// A field is present with the wrong JSON type.
    #[error("Field '{field}' must be {expected}")]
    WrongType {
        /// Wire name of the field
        field: &'static str,
        /// Human-readable expected type
        expected: &'static str,
    },

    /// `amount` is negative or not finite.
    #[error("Field 'amount' must be a positive number, got {0}")]
    InvalidAmount(String),

    /// `transferId` is not a UUID.
    #[error("Field 'transferId' must be a UUID, got '{0}'")]
    InvalidTransferId(String),

    /// `type` does not name one of the saga's event types.
    #[error("Unknown event type '{0}'")]
    UnknownEventType(String),
}

impl ValidationError {
    /// Shorthand for a single missing field.
    #[must_use]
    pub fn missing(field: &'static str) -> Self {
        Self::MissingFields(vec![field])
    }
}

/// Why a single message was not turned into work.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The payload could not be decoded.
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// The payload decoded but its fields are unusable.
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A ledger operation that did not take effect.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    /// The step was declined (the simulated ledger's coin came up tails).
    #[error("{step} of {amount} on account {account} was declined")]
    Declined {
        /// Which half of the transfer
        step: Step,
        /// Account the step targeted
        account: AccountId,
        /// Amount of the step
        amount: Amount,
    },

    /// A debit would take the account below zero.
    #[error("insufficient funds on account {account}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        /// Debited account
        account: AccountId,
        /// Balance before the debit
        balance: f64,
        /// Amount requested
        requested: Amount,
    },

    /// The transfer was already compensated; its steps are refused.
    #[error("{step} refused: transfer {transfer_id} was compensated")]
    Compensated {
        /// Step that was refused
        step: Step,
        /// The compensated transfer
        transfer_id: TransferId,
    },

    /// The ledger itself could not be reached or is inconsistent.
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

/// Invalid process configuration. Fatal at start-up.
#[derive(Error, Debug)]
pub enum ConfigurationError {
    /// An environment variable holds an unusable value.
    #[error("invalid value '{value}' for {name}: {reason}")]
    InvalidValue {
        /// Variable name
        name: &'static str,
        /// Value as found in the environment
        value: String,
        /// What was expected
        reason: String,
    },

    /// A component was built without a required part.
    #[error("{component} is missing required setting '{setting}'")]
    Missing {
        /// Component being built
        component: &'static str,
        /// Setting that was not provided
        setting: &'static str,
    },

    /// The event bus could not be created.
    #[error("event bus setup failed: {0}")]
    Bus(#[from] BusError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_lists_every_field() {
        let err = ValidationError::MissingFields(vec!["toAccount", "amount"]);
        assert_eq!(err.to_string(), "Missing required fields: toAccount, amount");
    }

    #[test]
    fn message_error_is_transparent() {
        let err = MessageError::from(ValidationError::missing("amount"));
        assert_eq!(err.to_string(), "Missing required fields: amount");
    }
}
