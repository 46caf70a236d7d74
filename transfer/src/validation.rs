//! Required-field validation.
//!
//! Each role needs only part of an event: the deposit side needs `toAccount`
//! and `amount`, the withdraw side `fromAccount` and `amount`. A
//! `StartTransfer` without `fromAccount` is therefore still valid work for the
//! deposit processor.

use crate::codec::{EventFields, FieldCheck};
use crate::error::ValidationError;
use crate::types::{AccountId, Amount, Step, StepCommand};

/// Extract the work for `step` from a decoded event.
///
/// # Errors
///
/// Returns a [`ValidationError`] when the step's account field or `amount`
/// is missing or ill-typed, or when `transferId` is present but malformed.
pub fn step_command(fields: &EventFields, step: Step) -> Result<StepCommand, ValidationError> {
    let account_field = step.account_field();
    fields.require_all(&[(account_field, FieldCheck::Account), ("amount", FieldCheck::Amount)])?;

    Ok(StepCommand {
        step,
        transfer_id: fields.transfer_id()?,
        account: fields.account(account_field)?,
        amount: fields.amount()?,
    })
}

/// A transfer request that passed ingress validation.
#[derive(Clone, Debug, PartialEq)]
pub struct ValidTransfer {
    /// Account to debit
    pub from_account: AccountId,
    /// Account to credit
    pub to_account: AccountId,
    /// Amount to move
    pub amount: Amount,
}

/// Validate an ingress request body.
///
/// All three fields must be present and truthy. Every missing field is
/// reported, not just the first.
///
/// # Errors
///
/// Returns [`ValidationError::MissingFields`] or the first type error.
pub fn transfer_request(body: &EventFields) -> Result<ValidTransfer, ValidationError> {
    body.require_all(&[
        ("fromAccount", FieldCheck::Account),
        ("toAccount", FieldCheck::Account),
        ("amount", FieldCheck::Amount),
    ])?;

    Ok(ValidTransfer {
        from_account: body.account("fromAccount")?,
        to_account: body.account("toAccount")?,
        amount: body.amount()?,
    })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(value: serde_json::Value) -> EventFields {
        match value {
            serde_json::Value::Object(map) => EventFields::from_map(map),
            _ => EventFields::default(),
        }
    }

    #[test]
    fn deposit_needs_only_to_account_and_amount() {
        let command = step_command(
            &fields(json!({"type": "StartTransfer", "toAccount": "B", "amount": 100})),
            Step::Deposit,
        )
        .unwrap();

        assert_eq!(command.account.as_str(), "B");
        assert_eq!(command.amount.value(), 100.0);
        assert!(command.transfer_id.is_none());
    }

    #[test]
    fn withdraw_reports_its_own_missing_fields() {
        let result = step_command(&fields(json!({"toAccount": "B"})), Step::Withdraw);
        assert_eq!(
            result,
            Err(ValidationError::MissingFields(vec!["fromAccount", "amount"]))
        );
    }

    #[test]
    fn ingress_rejects_falsy_values() {
        let result = transfer_request(&fields(json!({
            "fromAccount": "A",
            "toAccount": "",
            "amount": 0
        })));
        assert_eq!(
            result,
            Err(ValidationError::MissingFields(vec!["toAccount", "amount"]))
        );
    }

    #[test]
    fn ingress_rejects_ill_typed_amount() {
        let result = transfer_request(&fields(json!({
            "fromAccount": "A",
            "toAccount": "B",
            "amount": "100"
        })));
        assert!(matches!(result, Err(ValidationError::WrongType { field: "amount", .. })));
    }
}
