//! Value types shared by every saga participant.

use crate::error::ValidationError;
use serde::{Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Identifier of one logical transfer.
///
/// Generated by the initiator and carried by every event of the saga, so
/// outcomes and compensations can be attributed to their transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct TransferId(Uuid);

impl TransferId {
    /// Creates a new random transfer ID
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates a transfer ID from a UUID
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TransferId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransferId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TransferId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|_| ValidationError::InvalidTransferId(s.to_string()))
    }
}

/// Account identifier. Never empty.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AccountId(String);

impl AccountId {
    /// Validate an account identifier.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::MissingFields`] naming `field` when `value`
    /// is empty.
    pub fn parse(field: &'static str, value: impl Into<String>) -> Result<Self, ValidationError> {
        let value = value.into();
        if value.is_empty() {
            return Err(ValidationError::missing(field));
        }
        Ok(Self(value))
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A strictly positive, finite amount of money.
///
/// Whole amounts are written to the wire as JSON integers (`100`, not
/// `100.0`) so events stay byte-compatible with other producers.
#[derive(Clone, Copy, Debug, PartialEq, PartialOrd)]
pub struct Amount(f64);

/// Largest integer an `f64` represents exactly.
const MAX_EXACT_INTEGER: f64 = 9_007_199_254_740_992.0;

impl Amount {
    /// Validate an amount.
    ///
    /// Zero counts as missing, in line with how the ingress treats falsy
    /// values.
    ///
    /// # Errors
    ///
    /// - [`ValidationError::MissingFields`] for zero
    /// - [`ValidationError::InvalidAmount`] for negative or non-finite values
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if value == 0.0 {
            return Err(ValidationError::missing("amount"));
        }
        if !value.is_finite() || value < 0.0 {
            return Err(ValidationError::InvalidAmount(value.to_string()));
        }
        Ok(Self(value))
    }

    /// The amount as a float.
    #[must_use]
    pub const fn value(self) -> f64 {
        self.0
    }

    #[allow(clippy::cast_possible_truncation)]
    fn as_exact_integer(self) -> Option<i64> {
        (self.0.fract() == 0.0 && self.0 <= MAX_EXACT_INTEGER).then_some(self.0 as i64)
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_exact_integer() {
            Some(whole) => write!(f, "{whole}"),
            None => write!(f, "{}", self.0),
        }
    }
}

impl Serialize for Amount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.as_exact_integer() {
            Some(whole) => serializer.serialize_i64(whole),
            None => serializer.serialize_f64(self.0),
        }
    }
}

/// One half of a transfer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Step {
    /// Credit the destination account.
    Deposit,
    /// Debit the source account.
    Withdraw,
}

impl Step {
    /// Both steps.
    pub const ALL: [Self; 2] = [Self::Deposit, Self::Withdraw];

    /// Lowercase name used in logs, metrics and consumer groups.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdraw => "withdraw",
        }
    }

    /// The other half of the same transfer.
    #[must_use]
    pub const fn counterpart(self) -> Self {
        match self {
            Self::Deposit => Self::Withdraw,
            Self::Withdraw => Self::Deposit,
        }
    }

    /// Wire name of the account field this step acts on.
    #[must_use]
    pub const fn account_field(self) -> &'static str {
        match self {
            Self::Deposit => "toAccount",
            Self::Withdraw => "fromAccount",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key under which one step of one transfer is deduplicated and journaled:
/// `step/transferId`.
///
/// Only events that carry a transfer id have one. Account and amount do not
/// identify a transfer, so events without an id are never deduplicated.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct StepKey(String);

impl StepKey {
    /// Key of `step` within `transfer_id`.
    #[must_use]
    pub fn new(step: Step, transfer_id: TransferId) -> Self {
        Self(format!("{step}/{transfer_id}"))
    }

    /// The key as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The unit of work every role acts on: one step of one transfer.
#[derive(Clone, Debug, PartialEq)]
pub struct StepCommand {
    /// Which half of the transfer
    pub step: Step,
    /// Transfer the step belongs to, when the producer sent one
    pub transfer_id: Option<TransferId>,
    /// Account the step acts on
    pub account: AccountId,
    /// Amount of the step
    pub amount: Amount,
}

impl StepCommand {
    /// Deduplication and journal key of this step, if it has a transfer id.
    #[must_use]
    pub fn key(&self) -> Option<StepKey> {
        self.transfer_id.map(|id| StepKey::new(self.step, id))
    }

    /// Key of the other step of the same transfer.
    #[must_use]
    pub fn counterpart_key(&self) -> Option<StepKey> {
        self.transfer_id
            .map(|id| StepKey::new(self.step.counterpart(), id))
    }

    /// Whether the command lacks a transfer id.
    #[must_use]
    pub const fn is_legacy(&self) -> bool {
        self.transfer_id.is_none()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn command(transfer_id: Option<TransferId>) -> StepCommand {
        StepCommand {
            step: Step::Deposit,
            transfer_id,
            account: AccountId::parse("toAccount", "B").unwrap(),
            amount: Amount::new(100.0).unwrap(),
        }
    }

    #[test]
    fn amount_rejects_zero_as_missing() {
        assert_eq!(Amount::new(0.0), Err(ValidationError::missing("amount")));
    }

    #[test]
    fn amount_rejects_negative_and_non_finite() {
        assert!(matches!(Amount::new(-5.0), Err(ValidationError::InvalidAmount(_))));
        assert!(matches!(Amount::new(f64::NAN), Err(ValidationError::InvalidAmount(_))));
        assert!(matches!(Amount::new(f64::INFINITY), Err(ValidationError::InvalidAmount(_))));
    }

    #[test]
    fn whole_amounts_serialize_as_integers() {
        let whole = serde_json::to_string(&Amount::new(100.0).unwrap()).unwrap();
        let fractional = serde_json::to_string(&Amount::new(12.5).unwrap()).unwrap();
        assert_eq!(whole, "100");
        assert_eq!(fractional, "12.5");
    }

    #[test]
    fn empty_account_is_missing() {
        assert_eq!(
            AccountId::parse("fromAccount", ""),
            Err(ValidationError::missing("fromAccount"))
        );
    }

    #[test]
    fn transfer_id_parses_uuid_strings_only() {
        let id = TransferId::new();
        assert_eq!(id.to_string().parse::<TransferId>().unwrap(), id);
        assert!(matches!(
            "not-a-uuid".parse::<TransferId>(),
            Err(ValidationError::InvalidTransferId(_))
        ));
    }

    #[test]
    fn only_commands_with_a_transfer_id_have_keys() {
        let id = TransferId::new();
        let keyed = command(Some(id));
        assert_eq!(keyed.key().unwrap().as_str(), format!("deposit/{id}"));
        assert_eq!(keyed.counterpart_key().unwrap().as_str(), format!("withdraw/{id}"));

        // Two separate transfers A->B 100 look identical without an id
        assert_eq!(command(None).key(), None);
        assert_eq!(command(None).counterpart_key(), None);
        assert!(command(None).is_legacy());
    }
}
