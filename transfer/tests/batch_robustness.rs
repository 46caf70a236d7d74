//! Malformed messages never stop a batch, for any of the four roles.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use proptest::prelude::*;
use saga_core::event::SerializedEvent;
use saga_testing::InMemoryEventBus;
use std::sync::Arc;
use transfer_saga::codec;
use transfer_saga::compensators::Compensator;
use transfer_saga::dispatch::{BatchHandler, BatchReport, Dispatcher};
use transfer_saga::ledger::{InMemoryLedger, Ledger, SimulatedLedger};
use transfer_saga::processors::StepProcessor;
use transfer_saga::{AccountId, Amount, Step, StepCommand, TransferId};
use transfer_saga::events::{SagaEvent, TransferStarted};

fn account(name: &str) -> AccountId {
    AccountId::parse("account", name).unwrap()
}

fn raw(bytes: &[u8]) -> SerializedEvent {
    SerializedEvent::new("garbage".to_string(), bytes.to_vec(), None)
}

fn wrapped(body: &str) -> SerializedEvent {
    SerializedEvent::new("garbage".to_string(), serde_json::to_vec(body).unwrap(), None)
}

fn start_transfer() -> SerializedEvent {
    codec::encode(&SagaEvent::StartTransfer(TransferStarted {
        transfer_id: Some(TransferId::new()),
        from_account: account("A"),
        to_account: account("B"),
        amount: Amount::new(100.0).unwrap(),
    }))
    .unwrap()
}

fn compensation(step: Step) -> SerializedEvent {
    let command = StepCommand {
        step,
        transfer_id: Some(TransferId::new()),
        account: account(if step == Step::Deposit { "B" } else { "A" }),
        amount: Amount::new(100.0).unwrap(),
    };
    codec::encode(&SagaEvent::outcome(&command, false)).unwrap()
}

/// Messages every role must skip.
fn garbage() -> Vec<SerializedEvent> {
    vec![
        raw(b""),
        raw(b"{not json"),
        raw(br#"{"type":"StartTransfer","fromAccount":"A","toAccount":"B","amount":100}"#),
        wrapped("{}"),
        wrapped("[]"),
        wrapped("not json either"),
        wrapped(r#"{"type":"StartTransfer"}"#),
        wrapped(r#"{"type":"DepositCompensation","amount":100}"#),
        wrapped(r#"{"type":"WithdrawCompensation","fromAccount":"","amount":100}"#),
        wrapped(r#"{"type":"StartTransfer","fromAccount":"A","toAccount":"B","amount":"100"}"#),
        wrapped(r#"{"type":"Refund","toAccount":"B","amount":100}"#),
    ]
}

async fn run(handler: &dyn BatchHandler, valid: SerializedEvent) -> BatchReport {
    let mut batch = garbage();
    batch.insert(3, valid.clone());
    batch.push(valid);
    handler.handle_batch(&batch).await
}

#[tokio::test]
async fn deposit_processor_skips_and_continues() {
    let bus = InMemoryEventBus::new();
    let processor = Dispatcher::new(StepProcessor::deposit(
        Arc::new(SimulatedLedger::seeded(1.0, 1).unwrap()),
        Arc::new(bus.clone()),
        "transfers",
    ));

    let first = start_transfer();
    let report = run(&processor, first).await;

    assert_eq!(report.received, garbage().len() + 2);
    assert_eq!(report.handled, 1);
    assert_eq!(report.duplicates, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(bus.published_types(), vec!["DepositCompleted".to_string()]);
}

#[tokio::test]
async fn withdraw_processor_skips_and_continues() {
    let bus = InMemoryEventBus::new();
    let processor = Dispatcher::new(StepProcessor::withdraw(
        Arc::new(SimulatedLedger::seeded(0.0, 1).unwrap()),
        Arc::new(bus.clone()),
        "transfers",
    ));

    let mut batch = garbage();
    batch.push(start_transfer());
    batch.insert(0, start_transfer());
    let report = processor.handle_batch(&batch).await;

    assert_eq!(report.handled, 2);
    assert_eq!(report.skipped(), garbage().len());
    assert_eq!(
        bus.published_types(),
        vec!["WithdrawCompensation".to_string(), "WithdrawCompensation".to_string()]
    );
}

#[tokio::test]
async fn compensators_skip_and_continue() {
    for step in Step::ALL {
        let ledger: Arc<dyn Ledger> = Arc::new(InMemoryLedger::new());
        let compensator = Dispatcher::new(Compensator::new(step, ledger));

        let report = run(&compensator, compensation(step)).await;

        assert_eq!(report.handled, 1, "{step}");
        assert_eq!(report.duplicates, 1, "{step}");
        assert_eq!(report.skipped(), garbage().len(), "{step}");
    }
}

#[tokio::test]
async fn unpublished_outcome_does_not_stop_the_batch() {
    let bus = InMemoryEventBus::new();
    bus.reject_event_type("WithdrawCompleted");
    let processor = Dispatcher::new(StepProcessor::withdraw(
        Arc::new(InMemoryLedger::new().with_balance(account("A"), 100.0)),
        Arc::new(bus.clone()),
        "transfers",
    ));

    // The first debit succeeds but its outcome is rejected; the second is
    // declined for lack of funds and its compensation goes through
    let report = processor
        .handle_batch(&[start_transfer(), start_transfer()])
        .await;

    assert_eq!(report.failed, 1);
    assert_eq!(report.handled, 1);
    assert_eq!(bus.published_types(), vec!["WithdrawCompensation".to_string()]);
}

#[tokio::test]
async fn repeated_transfers_without_ids_each_get_an_outcome() {
    let bus = InMemoryEventBus::new();
    let processor = Dispatcher::new(StepProcessor::deposit(
        Arc::new(SimulatedLedger::seeded(1.0, 1).unwrap()),
        Arc::new(bus.clone()),
        "transfers",
    ));
    let transfer = wrapped(r#"{"type":"StartTransfer","fromAccount":"A","toAccount":"B","amount":100}"#);

    let first = processor.handle_batch(std::slice::from_ref(&transfer)).await;
    let second = processor.handle_batch(&[transfer]).await;

    assert_eq!(first.handled, 1);
    assert_eq!(second.handled, 1);
    assert_eq!(second.duplicates, 0);
    assert_eq!(
        bus.published_types(),
        vec!["DepositCompleted".to_string(), "DepositCompleted".to_string()]
    );
}

fn message() -> impl Strategy<Value = Option<usize>> {
    // None: a valid StartTransfer; Some(i): garbage()[i]
    prop_oneof![
        Just(None),
        (0..garbage().len()).prop_map(Some),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn every_valid_message_in_a_mixed_batch_is_processed(picks in prop::collection::vec(message(), 0..40)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let pool = garbage();
        let batch: Vec<SerializedEvent> = picks
            .iter()
            .map(|pick| pick.map_or_else(start_transfer, |i| pool[i].clone()))
            .collect();
        let valid = picks.iter().filter(|p| p.is_none()).count();

        let bus = InMemoryEventBus::new();
        let processor = Dispatcher::new(StepProcessor::deposit(
            Arc::new(SimulatedLedger::seeded(0.5, 9).unwrap()),
            Arc::new(bus.clone()),
            "transfers",
        ));
        let report = runtime.block_on(processor.handle_batch(&batch));

        prop_assert_eq!(report.received, batch.len());
        prop_assert_eq!(report.handled, valid);
        prop_assert_eq!(report.skipped(), batch.len() - valid);
        prop_assert_eq!(bus.published().len(), valid);
    }
}
