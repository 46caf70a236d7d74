//! Deposit and Withdraw Processors.
//!
//! Both react to `StartTransfer`. The deposit processor credits `toAccount`,
//! the withdraw processor debits `fromAccount`, and each announces exactly one
//! outcome: `…Completed` when the ledger accepted the step, `…Compensation`
//! when it did not.

use crate::codec;
use crate::dispatch::{Outcome, StepHandler};
use crate::events::{EventType, SagaEvent};
use crate::idempotency::{IdempotencyStore, InMemoryIdempotencyStore};
use crate::ledger::Ledger;
use crate::types::{Step, StepCommand, StepKey};
use async_trait::async_trait;
use saga_core::event_bus::EventBus;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Executes one half of every transfer and publishes its outcome.
pub struct StepProcessor {
    step: Step,
    ledger: Arc<dyn Ledger>,
    bus: Arc<dyn EventBus>,
    topic: String,
    processed: Arc<dyn IdempotencyStore>,
}

impl StepProcessor {
    /// Processor for `step` with its own in-memory idempotency store.
    #[must_use]
    pub fn new(
        step: Step,
        ledger: Arc<dyn Ledger>,
        bus: Arc<dyn EventBus>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            step,
            ledger,
            bus,
            topic: topic.into(),
            processed: Arc::new(InMemoryIdempotencyStore::new()),
        }
    }

    /// Credits `toAccount` on every `StartTransfer`.
    #[must_use]
    pub fn deposit(ledger: Arc<dyn Ledger>, bus: Arc<dyn EventBus>, topic: impl Into<String>) -> Self {
        Self::new(Step::Deposit, ledger, bus, topic)
    }

    /// Debits `fromAccount` on every `StartTransfer`.
    #[must_use]
    pub fn withdraw(
        ledger: Arc<dyn Ledger>,
        bus: Arc<dyn EventBus>,
        topic: impl Into<String>,
    ) -> Self {
        Self::new(Step::Withdraw, ledger, bus, topic)
    }

    /// Replace the idempotency store.
    #[must_use]
    pub fn with_idempotency_store(mut self, store: Arc<dyn IdempotencyStore>) -> Self {
        self.processed = store;
        self
    }
}

#[async_trait]
impl StepHandler for StepProcessor {
    fn role(&self) -> &'static str {
        match self.step {
            Step::Deposit => "deposit-processor",
            Step::Withdraw => "withdraw-processor",
        }
    }

    fn accepts(&self) -> EventType {
        EventType::StartTransfer
    }

    fn step(&self) -> Step {
        self.step
    }

    async fn handle(&self, command: StepCommand) -> Outcome {
        let role = self.role();
        let key = command.key();
        let step_key = key.as_ref().map_or("none", StepKey::as_str);
        if let Some(key) = &key {
            if self.processed.contains(key).await {
                info!(role, key = %key, "Step already processed, skipping redelivery");
                return Outcome::Duplicate;
            }
        }

        let succeeded = match self.ledger.apply(&command).await {
            Ok(()) => true,
            Err(e) => {
                warn!(role, key = step_key, error = %e, "Step failed, requesting compensation");
                false
            },
        };

        let outcome = SagaEvent::outcome(&command, succeeded);
        let event_type = outcome.kind();
        let published = match codec::encode(&outcome) {
            Ok(serialized) => self
                .bus
                .publish(&self.topic, &serialized)
                .await
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };

        if let Err(e) = published {
            error!(
                role,
                key = step_key,
                event_type = %event_type,
                account = %command.account,
                amount = %command.amount,
                error = %e,
                "Step attempted but its outcome was not published"
            );
            return Outcome::Failed;
        }

        info!(
            role,
            key = step_key,
            event_type = %event_type,
            account = %command.account,
            amount = %command.amount,
            "Outcome published"
        );
        if let Some(key) = key {
            self.processed.mark(key).await;
        }
        Outcome::Handled
    }
}
