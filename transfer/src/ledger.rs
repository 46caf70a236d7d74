//! Ledger collaborator: where the money actually moves.
//!
//! Processors call [`Ledger::credit`] / [`Ledger::debit`]; compensators call
//! [`Ledger::compensate`]. Steps that carry a transfer id are keyed by their
//! [`StepKey`], which makes them idempotent under redelivery:
//!
//! - applying a key that was already applied is a no-op
//! - compensating a transfer undoes each of its applied steps at most once
//! - once a transfer is compensated, its remaining steps are refused
//!
//! Steps without a transfer id cannot be told apart from another transfer
//! with the same accounts and amount. They are applied on every delivery and
//! their compensation reverses nothing.
//!
//! Two implementations ship with the crate:
//!
//! - [`SimulatedLedger`]: a weighted coin (80% success by default) standing in
//!   for a real balance service
//! - [`InMemoryLedger`]: real balances with an append-only journal

use crate::error::{ConfigurationError, LedgerError};
use crate::types::{AccountId, Amount, Step, StepCommand, StepKey, TransferId};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{HashMap, HashSet, VecDeque};
use std::hash::Hash;
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Default probability that a simulated step succeeds.
pub const DEFAULT_SUCCESS_RATE: f64 = 0.8;

/// Default number of steps and compensated transfers a [`SimulatedLedger`]
/// remembers.
pub const DEFAULT_TRACKED_STEPS: usize = 100_000;

/// What undoing one step did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reversal {
    /// The applied entry was undone.
    Reversed,
    /// Nothing was applied under this key, so there was nothing to undo.
    NotApplied,
    /// The entry had already been undone.
    AlreadyReversed,
}

impl Reversal {
    /// Lowercase name for logs and metrics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Reversed => "reversed",
            Self::NotApplied => "not_applied",
            Self::AlreadyReversed => "already_reversed",
        }
    }
}

/// What compensating a transfer did to each of its steps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Compensation {
    /// The step named by the compensation event.
    pub step: Reversal,
    /// The other step of the same transfer; `None` without a transfer id.
    pub counterpart: Option<Reversal>,
}

/// Balance-mutation capability used by the saga's roles.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Credit `command.account` with `command.amount`.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if the credit did not take effect.
    async fn credit(&self, command: &StepCommand) -> Result<(), LedgerError>;

    /// Debit `command.account` by `command.amount`.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if the debit did not take effect.
    async fn debit(&self, command: &StepCommand) -> Result<(), LedgerError>;

    /// Undo whatever was applied for the transfer `command` belongs to, on
    /// both steps, and refuse its steps from now on.
    ///
    /// # Errors
    ///
    /// Returns a [`LedgerError`] if the ledger could not be consulted; the
    /// caller may retry.
    async fn compensate(&self, command: &StepCommand) -> Result<Compensation, LedgerError>;

    /// Run the step `command` describes: credit for deposits, debit for
    /// withdrawals.
    ///
    /// # Errors
    ///
    /// Propagates the error of the underlying operation.
    async fn apply(&self, command: &StepCommand) -> Result<(), LedgerError> {
        match command.step {
            Step::Deposit => self.credit(command).await,
            Step::Withdraw => self.debit(command).await,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn refused(command: &StepCommand, transfer_id: TransferId) -> LedgerError {
    LedgerError::Compensated {
        step: command.step,
        transfer_id,
    }
}

/// Map that forgets its oldest entries once it holds more than `capacity`.
struct Recent<K, V> {
    entries: HashMap<K, V>,
    order: VecDeque<K>,
    capacity: usize,
}

impl<K: Clone + Eq + Hash, V> Recent<K, V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.entries.get_mut(key)
    }

    fn insert(&mut self, key: K, value: V) {
        if self.entries.insert(key.clone(), value).is_some() {
            return;
        }
        self.order.push_back(key);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.entries.remove(&oldest);
            }
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct SimulatedState {
    /// Applied keys, mapped to whether they were reversed since
    applied: Recent<StepKey, bool>,
    compensated: Recent<TransferId, ()>,
}

impl SimulatedState {
    fn reverse(&mut self, key: &StepKey) -> Reversal {
        match self.applied.get_mut(key) {
            None => Reversal::NotApplied,
            Some(true) => Reversal::AlreadyReversed,
            Some(reversed) => {
                *reversed = true;
                Reversal::Reversed
            },
        }
    }
}

/// Ledger that decides each step's outcome with a weighted coin.
///
/// No balances are kept. The ledger still remembers which keyed steps it
/// applied and which transfers were compensated, so redeliveries and
/// compensations behave like a real ledger. Memory is bounded: only the most
/// recent [`DEFAULT_TRACKED_STEPS`] of each are kept.
pub struct SimulatedLedger {
    success_rate: f64,
    rng: Mutex<StdRng>,
    state: Mutex<SimulatedState>,
}

impl SimulatedLedger {
    /// Create a ledger whose steps succeed with probability `success_rate`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigurationError::InvalidValue`] unless `success_rate` is
    /// within `0.0..=1.0`.
    pub fn new(success_rate: f64) -> Result<Self, ConfigurationError> {
        Self::with_rng(success_rate, StdRng::from_entropy())
    }

    /// Like [`new`](Self::new), with a deterministic random sequence.
    ///
    /// # Errors
    ///
    /// Same as [`new`](Self::new).
    pub fn seeded(success_rate: f64, seed: u64) -> Result<Self, ConfigurationError> {
        Self::with_rng(success_rate, StdRng::seed_from_u64(seed))
    }

    fn with_rng(success_rate: f64, rng: StdRng) -> Result<Self, ConfigurationError> {
        if !(0.0..=1.0).contains(&success_rate) {
            return Err(ConfigurationError::InvalidValue {
                name: "STEP_SUCCESS_RATE",
                value: success_rate.to_string(),
                reason: "must be between 0.0 and 1.0".to_string(),
            });
        }
        Ok(Self {
            success_rate,
            rng: Mutex::new(rng),
            state: Mutex::new(SimulatedState {
                applied: Recent::new(DEFAULT_TRACKED_STEPS),
                compensated: Recent::new(DEFAULT_TRACKED_STEPS),
            }),
        })
    }

    /// Remember at most `capacity` steps (and as many compensated transfers).
    #[must_use]
    pub fn with_capacity(self, capacity: usize) -> Self {
        *lock(&self.state) = SimulatedState {
            applied: Recent::new(capacity),
            compensated: Recent::new(capacity),
        };
        self
    }

    /// Probability that a step succeeds.
    #[must_use]
    pub const fn success_rate(&self) -> f64 {
        self.success_rate
    }

    /// Number of applied steps currently remembered.
    #[must_use]
    pub fn tracked_steps(&self) -> usize {
        lock(&self.state).applied.len()
    }

    fn attempt(&self, command: &StepCommand) -> Result<(), LedgerError> {
        let mut state = lock(&self.state);
        if let Some(id) = command.transfer_id {
            if state.compensated.contains(&id) {
                return Err(refused(command, id));
            }
        }

        let key = command.key();
        if let Some(key) = &key {
            if state.applied.contains(key) {
                tracing::debug!(key = %key, "Step already applied");
                return Ok(());
            }
        }

        if !lock(&self.rng).gen_bool(self.success_rate) {
            return Err(LedgerError::Declined {
                step: command.step,
                account: command.account.clone(),
                amount: command.amount,
            });
        }
        if let Some(key) = key {
            state.applied.insert(key, false);
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for SimulatedLedger {
    async fn credit(&self, command: &StepCommand) -> Result<(), LedgerError> {
        self.attempt(command)
    }

    async fn debit(&self, command: &StepCommand) -> Result<(), LedgerError> {
        self.attempt(command)
    }

    async fn compensate(&self, command: &StepCommand) -> Result<Compensation, LedgerError> {
        let Some(id) = command.transfer_id else {
            return Ok(Compensation {
                step: Reversal::NotApplied,
                counterpart: None,
            });
        };

        let mut state = lock(&self.state);
        state.compensated.insert(id, ());
        let step = state.reverse(&StepKey::new(command.step, id));
        let counterpart = state.reverse(&StepKey::new(command.step.counterpart(), id));
        Ok(Compensation {
            step,
            counterpart: Some(counterpart),
        })
    }
}

/// What a journal line records.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Money added to the account
    Credit,
    /// Money taken from the account
    Debit,
    /// A reversal attempt and what it did
    Reversal(Reversal),
}

/// One line of the [`InMemoryLedger`] journal.
#[derive(Clone, Debug, PartialEq)]
pub struct JournalEntry {
    /// Key of the step, when it had a transfer id
    pub key: Option<StepKey>,
    /// Which half of the transfer
    pub step: Step,
    /// What happened
    pub kind: EntryKind,
    /// Account affected
    pub account: AccountId,
    /// Amount involved
    pub amount: Amount,
}

#[derive(Clone, Debug)]
struct Applied {
    step: Step,
    kind: EntryKind,
    account: AccountId,
    amount: Amount,
    reversed: bool,
}

#[derive(Default)]
struct LedgerState {
    balances: HashMap<AccountId, f64>,
    applied: HashMap<StepKey, Applied>,
    compensated: HashSet<TransferId>,
    journal: Vec<JournalEntry>,
}

impl LedgerState {
    /// Undo the entry under `key` and journal it. `None` if nothing was
    /// applied under that key.
    fn reverse(&mut self, key: &StepKey) -> Option<Reversal> {
        let entry = self.applied.get_mut(key)?;
        let reversal = if entry.reversed {
            Reversal::AlreadyReversed
        } else {
            entry.reversed = true;
            let undo = match entry.kind {
                EntryKind::Credit => -entry.amount.value(),
                _ => entry.amount.value(),
            };
            *self.balances.entry(entry.account.clone()).or_insert(0.0) += undo;
            Reversal::Reversed
        };

        self.journal.push(JournalEntry {
            key: Some(key.clone()),
            step: entry.step,
            kind: EntryKind::Reversal(reversal),
            account: entry.account.clone(),
            amount: entry.amount,
        });
        Some(reversal)
    }
}

/// Ledger with real balances and an append-only journal.
///
/// Unknown accounts have a zero balance. Debits that would overdraw an
/// account fail with [`LedgerError::InsufficientFunds`].
///
/// The whole history is kept in memory; this ledger is meant for tests and
/// local runs.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
}

impl InMemoryLedger {
    /// Create an empty ledger.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an account's balance.
    #[must_use]
    pub fn with_balance(self, account: AccountId, balance: f64) -> Self {
        lock(&self.state).balances.insert(account, balance);
        self
    }

    /// Current balance of `account`.
    #[must_use]
    pub fn balance(&self, account: &AccountId) -> f64 {
        lock(&self.state).balances.get(account).copied().unwrap_or(0.0)
    }

    /// Every journal line, oldest first.
    #[must_use]
    pub fn journal(&self) -> Vec<JournalEntry> {
        lock(&self.state).journal.clone()
    }

    fn post(&self, command: &StepCommand, kind: EntryKind) -> Result<(), LedgerError> {
        let key = command.key();
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        if let Some(id) = command.transfer_id {
            if state.compensated.contains(&id) {
                return Err(refused(command, id));
            }
        }
        if let Some(key) = &key {
            if state.applied.contains_key(key) {
                tracing::debug!(key = %key, "Entry already posted");
                return Ok(());
            }
        }

        let amount = command.amount.value();
        let balance = state.balances.entry(command.account.clone()).or_insert(0.0);
        match kind {
            EntryKind::Debit if *balance < amount => {
                return Err(LedgerError::InsufficientFunds {
                    account: command.account.clone(),
                    balance: *balance,
                    requested: command.amount,
                });
            },
            EntryKind::Debit => *balance -= amount,
            _ => *balance += amount,
        }

        if let Some(key) = &key {
            state.applied.insert(
                key.clone(),
                Applied {
                    step: command.step,
                    kind,
                    account: command.account.clone(),
                    amount: command.amount,
                    reversed: false,
                },
            );
        }
        state.journal.push(JournalEntry {
            key,
            step: command.step,
            kind,
            account: command.account.clone(),
            amount: command.amount,
        });
        Ok(())
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn credit(&self, command: &StepCommand) -> Result<(), LedgerError> {
        self.post(command, EntryKind::Credit)
    }

    async fn debit(&self, command: &StepCommand) -> Result<(), LedgerError> {
        self.post(command, EntryKind::Debit)
    }

    async fn compensate(&self, command: &StepCommand) -> Result<Compensation, LedgerError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;

        let step = match command.key().and_then(|key| state.reverse(&key)) {
            Some(reversal) => reversal,
            None => {
                state.journal.push(JournalEntry {
                    key: command.key(),
                    step: command.step,
                    kind: EntryKind::Reversal(Reversal::NotApplied),
                    account: command.account.clone(),
                    amount: command.amount,
                });
                Reversal::NotApplied
            },
        };

        let counterpart = command.transfer_id.map(|id| {
            state.compensated.insert(id);
            state
                .reverse(&StepKey::new(command.step.counterpart(), id))
                .unwrap_or(Reversal::NotApplied)
        });

        Ok(Compensation { step, counterpart })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::float_cmp)]
mod tests {
    use super::*;

    fn account(name: &str) -> AccountId {
        AccountId::parse("account", name).unwrap()
    }

    fn command(step: Step, name: &str, amount: f64, transfer_id: Option<TransferId>) -> StepCommand {
        StepCommand {
            step,
            transfer_id,
            account: account(name),
            amount: Amount::new(amount).unwrap(),
        }
    }

    #[test]
    fn success_rate_must_be_a_probability() {
        assert!(SimulatedLedger::new(1.5).is_err());
        assert!(SimulatedLedger::new(-0.1).is_err());
        assert!(SimulatedLedger::new(f64::NAN).is_err());
        assert!(SimulatedLedger::new(0.0).is_ok());
    }

    #[tokio::test]
    async fn simulated_ledger_honours_extreme_rates() {
        let always = SimulatedLedger::seeded(1.0, 7).unwrap();
        let never = SimulatedLedger::seeded(0.0, 7).unwrap();
        let cmd = command(Step::Deposit, "B", 100.0, Some(TransferId::new()));

        assert!(always.apply(&cmd).await.is_ok());
        assert!(matches!(never.apply(&cmd).await, Err(LedgerError::Declined { .. })));
    }

    #[tokio::test]
    async fn simulated_ledger_is_roughly_eighty_twenty() {
        let ledger = SimulatedLedger::seeded(DEFAULT_SUCCESS_RATE, 42).unwrap();
        let mut successes = 0;
        for _ in 0..1000 {
            let cmd = command(Step::Withdraw, "A", 1.0, Some(TransferId::new()));
            if ledger.apply(&cmd).await.is_ok() {
                successes += 1;
            }
        }
        assert!((700..=900).contains(&successes), "successes = {successes}");
    }

    #[tokio::test]
    async fn simulated_compensation_undoes_both_steps_once() {
        let ledger = SimulatedLedger::seeded(1.0, 1).unwrap();
        let id = TransferId::new();
        let deposit = command(Step::Deposit, "B", 100.0, Some(id));
        let withdraw = command(Step::Withdraw, "A", 100.0, Some(id));
        ledger.apply(&deposit).await.unwrap();

        let first = ledger.compensate(&withdraw).await.unwrap();
        let again = ledger.compensate(&withdraw).await.unwrap();

        assert_eq!(first.step, Reversal::NotApplied);
        assert_eq!(first.counterpart, Some(Reversal::Reversed));
        assert_eq!(again.counterpart, Some(Reversal::AlreadyReversed));
    }

    #[tokio::test]
    async fn steps_of_a_compensated_transfer_are_refused() {
        let ledger = SimulatedLedger::seeded(1.0, 1).unwrap();
        let id = TransferId::new();
        ledger
            .compensate(&command(Step::Withdraw, "A", 100.0, Some(id)))
            .await
            .unwrap();

        let late = ledger.apply(&command(Step::Deposit, "B", 100.0, Some(id))).await;

        assert!(matches!(late, Err(LedgerError::Compensated { step: Step::Deposit, .. })));
    }

    #[tokio::test]
    async fn steps_without_transfer_id_are_applied_every_time() {
        let ledger = SimulatedLedger::seeded(1.0, 1).unwrap();
        let cmd = command(Step::Deposit, "B", 100.0, None);

        assert!(ledger.apply(&cmd).await.is_ok());
        assert!(ledger.apply(&cmd).await.is_ok());
        assert_eq!(ledger.tracked_steps(), 0);
        assert_eq!(
            ledger.compensate(&cmd).await.unwrap(),
            Compensation {
                step: Reversal::NotApplied,
                counterpart: None
            }
        );
    }

    #[tokio::test]
    async fn simulated_ledger_forgets_oldest_steps_beyond_capacity() {
        let ledger = SimulatedLedger::seeded(1.0, 1).unwrap().with_capacity(2);
        let oldest = command(Step::Deposit, "B", 1.0, Some(TransferId::new()));
        ledger.apply(&oldest).await.unwrap();
        for _ in 0..2 {
            let cmd = command(Step::Deposit, "B", 1.0, Some(TransferId::new()));
            ledger.apply(&cmd).await.unwrap();
        }

        assert_eq!(ledger.tracked_steps(), 2);
        let withdraw = StepCommand {
            step: Step::Withdraw,
            ..oldest
        };
        let compensation = ledger.compensate(&withdraw).await.unwrap();
        assert_eq!(compensation.counterpart, Some(Reversal::NotApplied));
    }

    #[tokio::test]
    async fn in_memory_ledger_applies_each_key_once() {
        let ledger = InMemoryLedger::new().with_balance(account("A"), 500.0);
        let id = Some(TransferId::new());
        let debit = command(Step::Withdraw, "A", 100.0, id);
        let credit = command(Step::Deposit, "B", 100.0, id);

        for _ in 0..2 {
            ledger.apply(&debit).await.unwrap();
            ledger.apply(&credit).await.unwrap();
        }

        assert_eq!(ledger.balance(&account("A")), 400.0);
        assert_eq!(ledger.balance(&account("B")), 100.0);
        assert_eq!(ledger.journal().len(), 2);
    }

    #[tokio::test]
    async fn in_memory_ledger_posts_unkeyed_steps_on_every_delivery() {
        let ledger = InMemoryLedger::new().with_balance(account("A"), 500.0);
        let debit = command(Step::Withdraw, "A", 100.0, None);

        ledger.apply(&debit).await.unwrap();
        ledger.apply(&debit).await.unwrap();

        assert_eq!(ledger.balance(&account("A")), 300.0);
        assert!(ledger.journal().iter().all(|e| e.key.is_none()));
    }

    #[tokio::test]
    async fn in_memory_ledger_refuses_overdraft() {
        let ledger = InMemoryLedger::new().with_balance(account("A"), 50.0);
        let debit = command(Step::Withdraw, "A", 100.0, Some(TransferId::new()));

        let result = ledger.apply(&debit).await;

        assert!(matches!(result, Err(LedgerError::InsufficientFunds { .. })));
        assert_eq!(ledger.balance(&account("A")), 50.0);
        assert!(ledger.journal().is_empty());
    }

    #[tokio::test]
    async fn failed_withdrawal_compensation_reverses_the_deposit() {
        let ledger = InMemoryLedger::new().with_balance(account("A"), 50.0);
        let id = Some(TransferId::new());
        let credit = command(Step::Deposit, "B", 100.0, id);
        let debit = command(Step::Withdraw, "A", 100.0, id);
        ledger.apply(&credit).await.unwrap();
        assert!(ledger.apply(&debit).await.is_err());

        let compensation = ledger.compensate(&debit).await.unwrap();
        let again = ledger.compensate(&debit).await.unwrap();

        assert_eq!(compensation.step, Reversal::NotApplied);
        assert_eq!(compensation.counterpart, Some(Reversal::Reversed));
        assert_eq!(again.counterpart, Some(Reversal::AlreadyReversed));
        assert_eq!(ledger.balance(&account("A")), 50.0);
        assert_eq!(ledger.balance(&account("B")), 0.0);

        let kinds: Vec<(Step, EntryKind)> =
            ledger.journal().iter().map(|e| (e.step, e.kind)).collect();
        assert_eq!(
            kinds,
            vec![
                (Step::Deposit, EntryKind::Credit),
                (Step::Withdraw, EntryKind::Reversal(Reversal::NotApplied)),
                (Step::Deposit, EntryKind::Reversal(Reversal::Reversed)),
                (Step::Withdraw, EntryKind::Reversal(Reversal::NotApplied)),
                (Step::Deposit, EntryKind::Reversal(Reversal::AlreadyReversed)),
            ]
        );
    }

    #[tokio::test]
    async fn deposit_arriving_after_compensation_is_refused() {
        let ledger = InMemoryLedger::new();
        let id = Some(TransferId::new());
        ledger
            .compensate(&command(Step::Withdraw, "A", 100.0, id))
            .await
            .unwrap();

        let late = ledger.apply(&command(Step::Deposit, "B", 100.0, id)).await;

        assert!(matches!(late, Err(LedgerError::Compensated { .. })));
        assert_eq!(ledger.balance(&account("B")), 0.0);
    }
}
