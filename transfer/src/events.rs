//! The saga's event vocabulary.
//!
//! Five event types drive a transfer:
//!
//! ```text
//!                         ┌──► DepositCompleted
//!                         │    DepositCompensation ──► deposit reversal
//! StartTransfer ──────────┤
//!                         │    WithdrawCompleted
//!                         └──► WithdrawCompensation ─► withdraw reversal
//! ```
//!
//! Both processors react to the same `StartTransfer` independently; there
//! is no ordering between the deposit and the withdraw outcome.

use crate::error::ValidationError;
use crate::types::{AccountId, Amount, Step, StepCommand, TransferId};
use saga_core::event::Event;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;

/// Discriminator carried in the `type` field of every event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum EventType {
    /// A transfer was accepted by the initiator.
    StartTransfer,
    /// The destination account was credited.
    DepositCompleted,
    /// The credit failed and must be compensated.
    DepositCompensation,
    /// The source account was debited.
    WithdrawCompleted,
    /// The debit failed and must be compensated.
    WithdrawCompensation,
}

impl EventType {
    /// Every event type, in causal order.
    pub const ALL: [Self; 5] = [
        Self::StartTransfer,
        Self::DepositCompleted,
        Self::DepositCompensation,
        Self::WithdrawCompleted,
        Self::WithdrawCompensation,
    ];

    /// Wire name of the type.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::StartTransfer => "StartTransfer",
            Self::DepositCompleted => "DepositCompleted",
            Self::DepositCompensation => "DepositCompensation",
            Self::WithdrawCompleted => "WithdrawCompleted",
            Self::WithdrawCompensation => "WithdrawCompensation",
        }
    }

    /// Event announcing that `step` succeeded.
    #[must_use]
    pub const fn completed(step: Step) -> Self {
        match step {
            Step::Deposit => Self::DepositCompleted,
            Step::Withdraw => Self::WithdrawCompleted,
        }
    }

    /// Event requesting compensation of `step`.
    #[must_use]
    pub const fn compensation(step: Step) -> Self {
        match step {
            Step::Deposit => Self::DepositCompensation,
            Step::Withdraw => Self::WithdrawCompensation,
        }
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownEventType(s.to_string()))
    }
}

/// Payload of `StartTransfer`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferStarted {
    /// Transfer identifier; absent on events from older producers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<TransferId>,
    /// Account to debit
    pub from_account: AccountId,
    /// Account to credit
    pub to_account: AccountId,
    /// Amount to move
    pub amount: Amount,
}

/// Payload of `DepositCompleted` and `DepositCompensation`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositLeg {
    /// Transfer identifier; absent on events from older producers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<TransferId>,
    /// Credited account
    pub to_account: AccountId,
    /// Credited amount
    pub amount: Amount,
}

/// Payload of `WithdrawCompleted` and `WithdrawCompensation`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawLeg {
    /// Transfer identifier; absent on events from older producers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<TransferId>,
    /// Debited account
    pub from_account: AccountId,
    /// Debited amount
    pub amount: Amount,
}

/// An event of the transfer saga.
///
/// Serializes to the flat wire shape, e.g.
/// `{"type":"DepositCompleted","transferId":"…","toAccount":"B","amount":100}`.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SagaEvent {
    /// A transfer was accepted.
    StartTransfer(TransferStarted),
    /// The destination account was credited.
    DepositCompleted(DepositLeg),
    /// The credit failed.
    DepositCompensation(DepositLeg),
    /// The source account was debited.
    WithdrawCompleted(WithdrawLeg),
    /// The debit failed.
    WithdrawCompensation(WithdrawLeg),
}

impl SagaEvent {
    /// The event's discriminator.
    #[must_use]
    pub const fn kind(&self) -> EventType {
        match self {
            Self::StartTransfer(_) => EventType::StartTransfer,
            Self::DepositCompleted(_) => EventType::DepositCompleted,
            Self::DepositCompensation(_) => EventType::DepositCompensation,
            Self::WithdrawCompleted(_) => EventType::WithdrawCompleted,
            Self::WithdrawCompensation(_) => EventType::WithdrawCompensation,
        }
    }

    /// Transfer id carried by the event, if any.
    #[must_use]
    pub const fn transfer_id(&self) -> Option<TransferId> {
        match self {
            Self::StartTransfer(e) => e.transfer_id,
            Self::DepositCompleted(e) | Self::DepositCompensation(e) => e.transfer_id,
            Self::WithdrawCompleted(e) | Self::WithdrawCompensation(e) => e.transfer_id,
        }
    }

    /// The outcome a processor announces after running `command`.
    #[must_use]
    pub fn outcome(command: &StepCommand, succeeded: bool) -> Self {
        let transfer_id = command.transfer_id;
        let account = command.account.clone();
        let amount = command.amount;
        match (command.step, succeeded) {
            (Step::Deposit, true) => Self::DepositCompleted(DepositLeg {
                transfer_id,
                to_account: account,
                amount,
            }),
            (Step::Deposit, false) => Self::DepositCompensation(DepositLeg {
                transfer_id,
                to_account: account,
                amount,
            }),
            (Step::Withdraw, true) => Self::WithdrawCompleted(WithdrawLeg {
                transfer_id,
                from_account: account,
                amount,
            }),
            (Step::Withdraw, false) => Self::WithdrawCompensation(WithdrawLeg {
                transfer_id,
                from_account: account,
                amount,
            }),
        }
    }
}

impl Event for SagaEvent {
    fn event_type(&self) -> &'static str {
        self.kind().as_str()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn command(step: Step) -> StepCommand {
        StepCommand {
            step,
            transfer_id: None,
            account: AccountId::parse(step.account_field(), "A").unwrap(),
            amount: Amount::new(100.0).unwrap(),
        }
    }

    #[test]
    fn event_type_names_round_trip() {
        for event_type in EventType::ALL {
            assert_eq!(event_type.as_str().parse::<EventType>().unwrap(), event_type);
        }
        assert!("Refund".parse::<EventType>().is_err());
    }

    #[test]
    fn wire_shape_is_flat_and_camel_case() {
        let event = SagaEvent::outcome(&command(Step::Withdraw), false);
        let json = serde_json::to_value(&event).unwrap();

        assert_eq!(
            json,
            serde_json::json!({"type": "WithdrawCompensation", "fromAccount": "A", "amount": 100})
        );
    }

    #[test]
    fn outcome_matches_step_and_result() {
        assert_eq!(
            SagaEvent::outcome(&command(Step::Deposit), true).kind(),
            EventType::DepositCompleted
        );
        assert_eq!(
            SagaEvent::outcome(&command(Step::Deposit), false).kind(),
            EventType::DepositCompensation
        );
        assert_eq!(
            SagaEvent::outcome(&command(Step::Withdraw), true).event_type(),
            "WithdrawCompleted"
        );
    }
}
