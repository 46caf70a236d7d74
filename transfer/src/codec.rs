//! Wire codec for saga events.
//!
//! The transport carries each event as a JSON *string* whose contents are the
//! JSON event body:
//!
//! ```text
//! "{\"type\":\"StartTransfer\",\"fromAccount\":\"A\",\"toAccount\":\"B\",\"amount\":100}"
//! ```
//!
//! Decoding therefore takes two passes. The first pass must yield a string,
//! the second an object. Anything else is a [`DecodeError`]. Whether the
//! object has the fields a consumer needs is not the codec's concern: an empty
//! object decodes fine and fails later, in validation.

use crate::error::{DecodeError, MessageError, ValidationError};
use crate::events::{DepositLeg, EventType, SagaEvent, TransferStarted, WithdrawLeg};
use crate::types::{AccountId, Amount, TransferId};
use saga_core::event::{Event, EventError, SerializedEvent};
use serde_json::{Map, Value};

/// Wrap `event` for the transport.
///
/// # Errors
///
/// Returns [`EventError::SerializationError`] if the event cannot be
/// serialized.
pub fn encode(event: &SagaEvent) -> Result<SerializedEvent, EventError> {
    let body =
        serde_json::to_string(event).map_err(|e| EventError::SerializationError(e.to_string()))?;
    let envelope =
        serde_json::to_vec(&body).map_err(|e| EventError::SerializationError(e.to_string()))?;
    Ok(SerializedEvent::new(
        event.event_type().to_string(),
        envelope,
        None,
    ))
}

/// Unwrap a transport payload into its field map.
///
/// # Errors
///
/// Returns a [`DecodeError`] when either pass fails or yields the wrong kind
/// of JSON value.
pub fn decode(payload: &[u8]) -> Result<EventFields, DecodeError> {
    let envelope: Value = serde_json::from_slice(payload).map_err(DecodeError::MalformedEnvelope)?;
    let body = match envelope {
        Value::String(body) => body,
        other => return Err(DecodeError::EnvelopeNotString { found: kind(&other) }),
    };

    let body: Value = serde_json::from_str(&body).map_err(DecodeError::MalformedBody)?;
    match body {
        Value::Object(fields) => Ok(EventFields(fields)),
        other => Err(DecodeError::BodyNotObject { found: kind(&other) }),
    }
}

/// Decode a transport payload into a fully validated event.
///
/// Every field of the event's type is required.
///
/// # Errors
///
/// Returns [`MessageError::Decode`] for malformed payloads and
/// [`MessageError::Validation`] for missing, ill-typed or unknown fields.
pub fn decode_event(payload: &[u8]) -> Result<SagaEvent, MessageError> {
    let fields = decode(payload)?;
    Ok(SagaEvent::try_from(&fields)?)
}

const fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// A decoded event body, not yet validated.
///
/// The accessors apply the saga's field rules: absent, `null`, empty and zero
/// values count as missing; values of the wrong JSON type are
/// [`ValidationError::WrongType`].
#[derive(Clone, Debug, Default, PartialEq)]
pub struct EventFields(Map<String, Value>);

impl EventFields {
    /// Wrap an already-parsed JSON object.
    #[must_use]
    pub const fn from_map(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Raw access to a field.
    #[must_use]
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field).filter(|v| !v.is_null())
    }

    /// The raw `type` field, if it is a string.
    #[must_use]
    pub fn type_name(&self) -> Option<&str> {
        self.get("type").and_then(Value::as_str)
    }

    /// The event type, if `type` names one of the saga's events.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::MissingFields`] when `type` is absent
    /// - [`ValidationError::WrongType`] when it is not a string
    /// - [`ValidationError::UnknownEventType`] when it names no saga event
    pub fn event_type(&self) -> Result<EventType, ValidationError> {
        match self.get("type") {
            None => Err(ValidationError::missing("type")),
            Some(Value::String(name)) => name.parse(),
            Some(_) => Err(ValidationError::WrongType {
                field: "type",
                expected: "a string",
            }),
        }
    }

    /// A required account field.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when the field is missing, empty or not
    /// a string.
    pub fn account(&self, field: &'static str) -> Result<AccountId, ValidationError> {
        match self.get(field) {
            None => Err(ValidationError::missing(field)),
            Some(Value::String(value)) => AccountId::parse(field, value.as_str()),
            Some(_) => Err(ValidationError::WrongType {
                field,
                expected: "a string",
            }),
        }
    }

    /// The required `amount` field.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when `amount` is missing, zero, negative
    /// or not a number.
    pub fn amount(&self) -> Result<Amount, ValidationError> {
        match self.get("amount") {
            None => Err(ValidationError::missing("amount")),
            Some(Value::Number(n)) => n
                .as_f64()
                .ok_or_else(|| ValidationError::InvalidAmount(n.to_string()))
                .and_then(Amount::new),
            Some(_) => Err(ValidationError::WrongType {
                field: "amount",
                expected: "a number",
            }),
        }
    }

    /// The optional `transferId` field.
    ///
    /// # Errors
    ///
    /// Returns a [`ValidationError`] when `transferId` is present but not a
    /// UUID string.
    pub fn transfer_id(&self) -> Result<Option<TransferId>, ValidationError> {
        match self.get("transferId") {
            None => Ok(None),
            Some(Value::String(id)) => id.parse().map(Some),
            Some(_) => Err(ValidationError::WrongType {
                field: "transferId",
                expected: "a UUID string",
            }),
        }
    }

    /// Check several required fields at once, reporting every missing one.
    ///
    /// Type errors are reported for the first ill-typed field only.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingFields`] listing every missing
    /// field, or the first other error encountered.
    pub fn require_all(&self, checks: &[(&'static str, FieldCheck)]) -> Result<(), ValidationError> {
        let mut missing = Vec::new();
        for &(field, check) in checks {
            let result = match check {
                FieldCheck::Account => self.account(field).map(drop),
                FieldCheck::Amount => self.amount().map(drop),
            };
            match result {
                Ok(()) => {},
                Err(ValidationError::MissingFields(fields)) => missing.extend(fields),
                Err(other) => return Err(other),
            }
        }
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ValidationError::MissingFields(missing))
        }
    }
}

/// Kind of value a required field must hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FieldCheck {
    /// A non-empty string
    Account,
    /// A positive number
    Amount,
}

impl TryFrom<&EventFields> for SagaEvent {
    type Error = ValidationError;

    fn try_from(fields: &EventFields) -> Result<Self, Self::Error> {
        let transfer_id = fields.transfer_id()?;
        let event = match fields.event_type()? {
            EventType::StartTransfer => Self::StartTransfer(TransferStarted {
                transfer_id,
                from_account: fields.account("fromAccount")?,
                to_account: fields.account("toAccount")?,
                amount: fields.amount()?,
            }),
            EventType::DepositCompleted => Self::DepositCompleted(deposit_leg(fields, transfer_id)?),
            EventType::DepositCompensation => {
                Self::DepositCompensation(deposit_leg(fields, transfer_id)?)
            },
            EventType::WithdrawCompleted => {
                Self::WithdrawCompleted(withdraw_leg(fields, transfer_id)?)
            },
            EventType::WithdrawCompensation => {
                Self::WithdrawCompensation(withdraw_leg(fields, transfer_id)?)
            },
        };
        Ok(event)
    }
}

fn deposit_leg(
    fields: &EventFields,
    transfer_id: Option<TransferId>,
) -> Result<DepositLeg, ValidationError> {
    Ok(DepositLeg {
        transfer_id,
        to_account: fields.account("toAccount")?,
        amount: fields.amount()?,
    })
}

fn withdraw_leg(
    fields: &EventFields,
    transfer_id: Option<TransferId>,
) -> Result<WithdrawLeg, ValidationError> {
    Ok(WithdrawLeg {
        transfer_id,
        from_account: fields.account("fromAccount")?,
        amount: fields.amount()?,
    })
}
