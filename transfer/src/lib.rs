//! Choreographed funds-transfer saga.
//!
//! A transfer moves `amount` from `fromAccount` to `toAccount` without a
//! coordinator. Every participant reacts to events on one shared topic:
//!
//! ```text
//!  POST /transfers
//!        │
//!        ▼
//!  Transfer Initiator ──► StartTransfer
//!                              │
//!              ┌───────────────┴───────────────┐
//!              ▼                               ▼
//!      Deposit Processor               Withdraw Processor
//!      credit(toAccount)               debit(fromAccount)
//!              │                               │
//!   DepositCompleted | DepositCompensation   WithdrawCompleted | WithdrawCompensation
//!                          │                                          │
//!                          ▼                                          ▼
//!                Deposit Compensator                       Withdraw Compensator
//!              compensate(transfer)                      compensate(transfer)
//! ```
//!
//! Delivery is at least once. Every consumer skips what it cannot use
//! (malformed payloads, other event types, missing fields) and carries on
//! with the rest of its batch, and deduplicates on `(step, transferId)`.
//! Events without a `transferId` are processed on every delivery.
//!
//! # Modules
//!
//! - [`codec`]: the string-wrapped JSON wire format
//! - [`dispatch`]: decode, filter and validate per message
//! - [`initiator`], [`processors`], [`compensators`]: the saga's roles
//! - [`ledger`], [`idempotency`]: injected collaborators
//! - [`consumer`], [`app`], [`server`], [`config`]: process plumbing

#![forbid(unsafe_code)]
#![warn(missing_docs, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod codec;
pub mod compensators;
pub mod config;
pub mod consumer;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod idempotency;
pub mod initiator;
pub mod ledger;
pub mod processors;
pub mod server;
pub mod types;
pub mod validation;

pub use app::{Application, RunningApp, ledger_for};
pub use config::Config;
pub use error::{ConfigurationError, DecodeError, LedgerError, MessageError, ValidationError};
pub use events::{EventType, SagaEvent};
pub use initiator::{TransferAccepted, TransferInitiator};
pub use types::{AccountId, Amount, Step, StepCommand, TransferId};
