//! Domain errors
//!
//! Business rule violations raised by the account aggregate. The apply stage
//! converts every one of these into a recorded `Fail` fact rather than
//! propagating it.

use rust_decimal::Decimal;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DomainError {
    #[error("Insufficient balance on account {account_id}: has {balance}, needs {requested}")]
    InsufficientBalance {
        account_id: String,
        balance: Decimal,
        requested: Decimal,
    },

    #[error("Transaction {transaction_id} already applied to account {account_id}")]
    DuplicateTransaction {
        account_id: String,
        transaction_id: String,
    },

    #[error("Transfer target {account_id} does not exist")]
    TargetAccountMissing { account_id: String },

    #[error("{kind} is not an applicable command")]
    UnsupportedCommand { kind: String },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
}
