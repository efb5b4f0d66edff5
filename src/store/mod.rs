//! Relational store ports
//!
//! Narrow contracts over the read model, the snapshot table, the idempotency
//! table and the checkpoint tables. Implementations: `postgres` for the real
//! store, `memory` for tests and benchmarks.

mod memory;
mod postgres;

pub use memory::{
    MemoryCheckpointStore, MemoryIdempotencyStore, MemoryReadModelStore, MemorySnapshotStore,
};
pub use postgres::{
    PgCheckpointStore, PgIdempotencyStore, PgReadModelStore, PgSnapshotStore,
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::event_log::Position;
use crate::snapshot::AccountSnapshot;

/// Saga step names stored in the idempotency table.
pub mod steps {
    pub const INIT: &str = "INIT";
    pub const COMPLETE: &str = "COMPLETE";
    pub const COMPENSATION: &str = "COMPENSATION";
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Absolute balance carried by the ring's read-model stage.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceSync {
    pub account_id: String,
    pub balance: Decimal,
}

/// Balance delta carried by the projector.
#[derive(Debug, Clone, PartialEq)]
pub struct BalanceDelta {
    pub account_id: String,
    pub amount: Decimal,
}

/// One row of the `accounts` read model.
#[derive(Debug, Clone, PartialEq)]
pub struct AccountRow {
    pub account_id: String,
    pub balance: Decimal,
    pub last_updated_at: DateTime<Utc>,
}

/// One recorded saga step.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaStage {
    pub step: String,
    pub processed_at: DateTime<Utc>,
}

/// The `accounts` read-model table.
///
/// Withdraw operations are strict updates on purpose: a withdraw must never
/// create a row, otherwise a failed transfer could materialise a ghost
/// account.
#[async_trait]
pub trait ReadModelStore: Send + Sync {
    /// Batch UPSERT of absolute balances (ring stage, deposits).
    async fn batch_upsert_balances(&self, rows: &[BalanceSync]) -> Result<(), StoreError>;

    /// Batch strict UPDATE of absolute balances (ring stage, withdraws).
    /// Returns the accounts whose update matched no row.
    async fn batch_update_balances(&self, rows: &[BalanceSync]) -> Result<Vec<String>, StoreError>;

    /// Batch UPSERT `balance = balance + ?` (projector, deposits); creates
    /// the row when missing.
    async fn apply_deposit_deltas(&self, rows: &[BalanceDelta]) -> Result<(), StoreError>;

    /// Batch strict UPDATE `balance = balance - ?` (projector, withdraws).
    /// Returns the accounts whose update matched no row — a read/write model
    /// divergence signal.
    async fn apply_withdraw_deltas(&self, rows: &[BalanceDelta])
        -> Result<Vec<String>, StoreError>;

    /// Point lookup for queries.
    async fn fetch_account(&self, account_id: &str) -> Result<Option<AccountRow>, StoreError>;
}

/// The `account_snapshots` table.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// UPSERT by `(account_id, last_event_sequence)`.
    async fn save(&self, snapshot: &AccountSnapshot) -> Result<(), StoreError>;

    /// Latest snapshot by sequence for one account.
    async fn find_latest(&self, account_id: &str) -> Result<Option<AccountSnapshot>, StoreError>;

    /// Retention: delete all but the newest `retain_count` snapshots.
    /// Returns the number of deleted rows.
    async fn delete_older_snapshots(
        &self,
        account_id: &str,
        retain_count: u32,
    ) -> Result<u64, StoreError>;
}

/// The `processed_transactions` idempotency table. Correctness rests on the
/// primary key `(transaction_id, step)`; every operation is safe under
/// concurrent callers from any number of nodes.
#[async_trait]
pub trait IdempotencyStore: Send + Sync {
    /// Atomically reserve a step. Returns whether this caller won the
    /// insertion race; a unique violation is reported as `false`, never as an
    /// error.
    async fn try_mark_as_processed(&self, transaction_id: &str, step: &str)
        -> Result<bool, StoreError>;

    /// All recorded steps of one transaction, oldest first.
    async fn find_stages_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<SagaStage>, StoreError>;

    /// Orphan detection: transactions whose INIT is older than
    /// `timeout_seconds` and which have neither COMPLETE nor COMPENSATION.
    async fn find_timeout_transactions(
        &self,
        timeout_seconds: i64,
    ) -> Result<Vec<String>, StoreError>;

    /// Housekeeping: delete records older than `days`. Returns deleted rows.
    async fn delete_old_records(&self, days: i64) -> Result<u64, StoreError>;
}

/// A checkpoint table (`projection_checkpoints` or `saga_checkpoints`).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn load(&self, name: &str) -> Result<Option<Position>, StoreError>;

    async fn save(&self, name: &str, position: Position) -> Result<(), StoreError>;
}
