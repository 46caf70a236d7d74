//! Per-message dispatch shared by every consuming role.
//!
//! A delivered batch is walked in order. Each message goes through:
//!
//! ```text
//! decode ──► filter on type ──► validate fields ──► role handler
//!   │              │                    │
//!   ▼              ▼                    ▼
//! malformed     ignored              invalid
//! ```
//!
//! A message that falls out at any stage is logged and counted, and the
//! batch continues with the next message. Nothing a single message carries
//! can stop its siblings from being processed.

use crate::codec;
use crate::events::EventType;
use crate::types::{Step, StepCommand};
use crate::validation;
use async_trait::async_trait;
use metrics::counter;
use saga_core::event::SerializedEvent;
use tracing::{debug, warn};

/// Consumes whole batches of transport messages.
///
/// This is the seam between the consumer runtime, which knows about
/// subscriptions and reconnects, and the saga roles, which know about events.
#[async_trait]
pub trait BatchHandler: Send + Sync + 'static {
    /// Name used in logs and metrics.
    fn name(&self) -> &str;

    /// Process one batch. Never fails: per-message problems are tallied in
    /// the report.
    async fn handle_batch(&self, batch: &[SerializedEvent]) -> BatchReport;
}

/// What a role did with a validated step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The step was acted on.
    Handled,
    /// The step was handled before and was skipped.
    Duplicate,
    /// Acting on the step failed; the failure was logged.
    Failed,
}

/// A saga role that acts on one event type.
#[async_trait]
pub trait StepHandler: Send + Sync + 'static {
    /// Role name, e.g. `deposit-processor`.
    fn role(&self) -> &'static str;

    /// The event type this role consumes.
    fn accepts(&self) -> EventType;

    /// Which half of the transfer the role's events describe.
    fn step(&self) -> Step;

    /// Act on one step.
    async fn handle(&self, command: StepCommand) -> Outcome;
}

/// Where a single message ended up.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Decoded, validated and acted on
    Handled,
    /// Already acted on before
    Duplicate,
    /// Acting on it failed
    Failed,
    /// Not the role's event type
    Ignored,
    /// Could not be decoded
    Malformed,
    /// Decoded but missing or ill-typed fields
    Invalid,
}

impl Disposition {
    /// Label used for the `outcome` metric dimension.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handled => "handled",
            Self::Duplicate => "duplicate",
            Self::Failed => "failed",
            Self::Ignored => "ignored",
            Self::Malformed => "malformed",
            Self::Invalid => "invalid",
        }
    }
}

impl From<Outcome> for Disposition {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Handled => Self::Handled,
            Outcome::Duplicate => Self::Duplicate,
            Outcome::Failed => Self::Failed,
        }
    }
}

/// Tally of one batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Messages in the batch
    pub received: usize,
    /// Messages acted on
    pub handled: usize,
    /// Messages skipped as redeliveries
    pub duplicates: usize,
    /// Messages whose handling failed
    pub failed: usize,
    /// Messages of other types
    pub ignored: usize,
    /// Undecodable messages
    pub malformed: usize,
    /// Messages with missing or ill-typed fields
    pub invalid: usize,
}

impl BatchReport {
    /// Count one message.
    pub fn record(&mut self, disposition: Disposition) {
        self.received += 1;
        let slot = match disposition {
            Disposition::Handled => &mut self.handled,
            Disposition::Duplicate => &mut self.duplicates,
            Disposition::Failed => &mut self.failed,
            Disposition::Ignored => &mut self.ignored,
            Disposition::Malformed => &mut self.malformed,
            Disposition::Invalid => &mut self.invalid,
        };
        *slot += 1;
    }

    /// Messages that were skipped without reaching the role.
    #[must_use]
    pub const fn skipped(&self) -> usize {
        self.ignored + self.malformed + self.invalid
    }
}

/// Runs a [`StepHandler`] over batches.
pub struct Dispatcher<H> {
    handler: H,
}

impl<H: StepHandler> Dispatcher<H> {
    /// Wrap a role.
    #[must_use]
    pub const fn new(handler: H) -> Self {
        Self { handler }
    }

    /// The wrapped role.
    #[must_use]
    pub const fn handler(&self) -> &H {
        &self.handler
    }

    /// Route one message to the role, or say why it was skipped.
    pub async fn dispatch(&self, message: &SerializedEvent) -> Disposition {
        let role = self.handler.role();

        let fields = match codec::decode(&message.data) {
            Ok(fields) => fields,
            Err(e) => {
                warn!(role, error = %e, "Skipping malformed message");
                return Disposition::Malformed;
            },
        };

        let accepted = self.handler.accepts();
        if fields.type_name() != Some(accepted.as_str()) {
            debug!(role, event_type = ?fields.type_name(), "Ignoring event of another type");
            return Disposition::Ignored;
        }

        let command = match validation::step_command(&fields, self.handler.step()) {
            Ok(command) => command,
            Err(e) => {
                warn!(role, event_type = %accepted, error = %e, "Skipping invalid event");
                return Disposition::Invalid;
            },
        };

        if command.is_legacy() {
            warn!(
                role,
                account = %command.account,
                amount = %command.amount,
                "Event has no transferId, processing it without deduplication"
            );
        }

        self.handler.handle(command).await.into()
    }
}

#[async_trait]
impl<H: StepHandler> BatchHandler for Dispatcher<H> {
    fn name(&self) -> &str {
        self.handler.role()
    }

    async fn handle_batch(&self, batch: &[SerializedEvent]) -> BatchReport {
        let role = self.handler.role();
        let mut report = BatchReport::default();

        for message in batch {
            let disposition = self.dispatch(message).await;
            counter!(
                "saga_messages_total",
                "role" => role,
                "outcome" => disposition.as_str()
            )
            .increment(1);
            report.record(disposition);
        }

        debug!(
            role,
            received = report.received,
            handled = report.handled,
            duplicates = report.duplicates,
            failed = report.failed,
            skipped = report.skipped(),
            "Batch processed"
        );
        report
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct Recorder {
        seen: Mutex<Vec<StepCommand>>,
    }

    #[async_trait]
    impl StepHandler for Recorder {
        fn role(&self) -> &'static str {
            "recorder"
        }

        fn accepts(&self) -> EventType {
            EventType::WithdrawCompensation
        }

        fn step(&self) -> Step {
            Step::Withdraw
        }

        async fn handle(&self, command: StepCommand) -> Outcome {
            self.seen.lock().unwrap().push(command);
            Outcome::Handled
        }
    }

    fn message(body: &str) -> SerializedEvent {
        SerializedEvent::new("test".to_string(), serde_json::to_vec(body).unwrap(), None)
    }

    #[tokio::test]
    async fn bad_messages_do_not_stop_the_batch() {
        let dispatcher = Dispatcher::new(Recorder {
            seen: Mutex::new(Vec::new()),
        });
        let batch = vec![
            SerializedEvent::new("x".to_string(), b"not json".to_vec(), None),
            message(r#"{"type":"WithdrawCompensation","amount":5}"#),
            message(r#"{"type":"DepositCompensation","toAccount":"B","amount":5}"#),
            message("{}"),
            message(r#"{"type":"WithdrawCompensation","fromAccount":"A","amount":5}"#),
        ];

        let report = dispatcher.handle_batch(&batch).await;

        assert_eq!(
            report,
            BatchReport {
                received: 5,
                handled: 1,
                malformed: 1,
                invalid: 1,
                ignored: 2,
                ..BatchReport::default()
            }
        );
        let seen = dispatcher.handler().seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].account.as_str(), "A");
    }
}
