//! Deposit and Withdraw Compensators.
//!
//! A compensation event reports that the step it names failed. The
//! compensator asks the ledger to compensate the whole transfer: whatever the
//! named step applied is reversed, the other step's entry is reversed too, and
//! the transfer's remaining steps are refused. A failed withdrawal therefore
//! takes back the credit its deposit made. Compensation is terminal: nothing
//! is published.
//!
//! Events without a transfer id cannot be tied to a ledger entry; their
//! compensation is logged and reverses nothing.

use crate::dispatch::{Outcome, StepHandler};
use crate::events::EventType;
use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
use crate::ledger::{Ledger, Reversal};
use crate::types::{Step, StepCommand};
use async_trait::async_trait;
use metrics::counter;
use std::sync::Arc;
use tracing::{error, info};

/// Reverses the ledger effect of one failed step.
pub struct Compensator {
    step: Step,
    ledger: Arc<dyn Ledger>,
    processed: Arc<dyn IdempotencyStore>,
}

impl Compensator {
    /// Compensator for `step` with its own in-memory idempotency store.
    #[must_use]
    pub fn new(step: Step, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            step,
            ledger,
            processed: Arc::new(InMemoryIdempotencyStore::new()),
        }
    }

    /// Handles `DepositCompensation`.
    #[must_use]
    pub fn deposit(ledger: Arc<dyn Ledger>) -> Self {
        Self::new(Step::Deposit, ledger)
    }

    /// Handles `WithdrawCompensation`.
    #[must_use]
    pub fn withdraw(ledger: Arc<dyn Ledger>) -> Self {
        Self::new(Step::Withdraw, ledger)
    }

    /// Replace the idempotency store.
    #[must_use]
    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.processed = store;
        self
    }
}

#[async_trait]
impl StepHandler for Compensator {
    fn role(&self) -> &'static str {
        match self.step {
            Step::Deposit => "deposit-compensator",
            Step::Withdraw => "withdraw-compensator",
        }
    }

    fn accepts(&self) -> EventType {
        EventType::compensation(self.step)
    }

    fn step(&self) -> Step {
        self.step
    }

    async fn handle(&self, command: StepCommand) -> Outcome {
        let role = self.role();
        let key = command.key();
        if let Some(key) = &key {
            if self.processed.contains(key).await {
                info!(role, key = %key, "Compensation already handled, skipping redelivery");
                return Outcome::Duplicate;
            }
        }

        let transfer_id = command.transfer_id.map(|id| id.to_string());
        match self.ledger.compensate(&command).await {
            Ok(compensation) => {
                let counterpart = compensation.counterpart.map(Reversal::as_str);
                info!(
                    role,
                    account = %command.account,
                    amount = %command.amount,
                    transfer_id = transfer_id.as_deref().unwrap_or("none"),
                    outcome = compensation.step.as_str(),
                    counterpart = counterpart.unwrap_or("none"),
                    "Compensation processed"
                );
                counter!("saga_reversals_total", "role" => role, "outcome" => compensation.step.as_str())
                    .increment(1);
                if let Some(counterpart) = counterpart {
                    counter!("saga_reversals_total", "role" => role, "outcome" => counterpart)
                        .increment(1);
                }
                if let Some(key) = key {
                    self.processed.mark(key).await;
                }
                Outcome::Handled
            },
            Err(e) => {
                error!(
                    role,
                    account = %command.account,
                    amount = %command.amount,
                    transfer_id = transfer_id.as_deref().unwrap_or("none"),
                    error = %e,
                    "Compensation failed, leaving it for redelivery"
                );
                Outcome::Failed
            },
        }
    }
}
