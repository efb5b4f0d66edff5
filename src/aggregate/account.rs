//! Account Aggregate
//!
//! Encapsulates the balance, the applied-transaction history and the business
//! rules. State changes only through `apply`; a rejected command surfaces as a
//! `DomainError` which the apply stage records as a `Fail` fact.

use std::collections::HashSet;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::domain::{tags, AccountEvent, Amount, Balance, DomainError, EventKind};
use crate::snapshot::AccountSnapshot;

/// Account Aggregate
///
/// `version` is the stream revision of the last journaled event for this
/// account (-1 before anything was journaled). It is advanced by the journal
/// stage after a durable append, and by the loader during replay; `apply`
/// itself never touches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Account {
    id: String,

    balance: Balance,

    /// Last journaled stream revision; -1 when the stream is empty.
    version: i64,

    /// Dedup keys (`KIND:transactionId`) of every applied event. A
    /// compensation refund reuses the transaction id of the withdraw it
    /// undoes, so the key includes the kind.
    processed: HashSet<String>,
}

impl Account {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            balance: Balance::zero(),
            version: -1,
            processed: HashSet::new(),
        }
    }

    /// Restore state from a snapshot; replay continues from
    /// `snapshot.last_event_sequence + 1`.
    pub fn from_snapshot(snapshot: &AccountSnapshot) -> Result<Self, DomainError> {
        Ok(Self {
            id: snapshot.account_id.clone(),
            balance: Balance::new(snapshot.balance)
                .map_err(|e| DomainError::InvalidAmount(e.to_string()))?,
            version: snapshot.last_event_sequence,
            processed: snapshot.processed_transactions.clone(),
        })
    }

    /// Apply one event, subject to invariants.
    ///
    /// Rules:
    /// - `Fail` is never an applicable command;
    /// - a (kind, transaction id) pair applies at most once;
    /// - a `TRANSFER_DEPOSIT` requires a pre-existing target account;
    /// - a withdraw must leave the balance non-negative.
    pub fn apply(&mut self, event: &AccountEvent) -> Result<(), DomainError> {
        if event.kind == EventKind::Fail {
            return Err(DomainError::UnsupportedCommand {
                kind: event.kind.as_str().to_string(),
            });
        }

        let key = event.dedup_key();
        if self.processed.contains(&key) {
            return Err(DomainError::DuplicateTransaction {
                account_id: self.id.clone(),
                transaction_id: event.transaction_id.clone(),
            });
        }

        let amount =
            Amount::new(event.amount).map_err(|e| DomainError::InvalidAmount(e.to_string()))?;

        let next_balance = match event.kind {
            EventKind::Deposit => {
                // A transfer deposit must land on an account that already
                // exists; depositing into a zero-balance, zero-history
                // aggregate would silently create the target.
                if event.description == tags::TRANSFER_DEPOSIT && self.is_unseeded() {
                    return Err(DomainError::TargetAccountMissing {
                        account_id: self.id.clone(),
                    });
                }
                self.balance
                    .credit(&amount)
                    .map_err(|e| DomainError::InvalidAmount(e.to_string()))?
            }
            EventKind::Withdraw => {
                if !self.balance.is_sufficient_for(&amount) {
                    return Err(DomainError::InsufficientBalance {
                        account_id: self.id.clone(),
                        balance: self.balance.value(),
                        requested: amount.value(),
                    });
                }
                self.balance
                    .debit(&amount)
                    .map_err(|e| DomainError::InvalidAmount(e.to_string()))?
            }
            EventKind::Fail => unreachable!("rejected above"),
        };

        self.balance = next_balance;
        self.processed.insert(key);
        Ok(())
    }

    /// Advance the journaled stream revision. Called by the journal stage
    /// after a durable append and by the loader during replay; must be
    /// strictly monotonic.
    pub fn record_revision(&mut self, revision: i64) {
        debug_assert!(revision > self.version);
        self.version = revision;
    }

    /// An aggregate with no balance and no applied history. Such an account
    /// only exists because something asked for it; it was never funded.
    pub fn is_unseeded(&self) -> bool {
        self.balance.is_zero() && self.processed.is_empty()
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn balance(&self) -> Decimal {
        self.balance.value()
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn processed_transactions(&self) -> &HashSet<String> {
        &self.processed
    }
}
