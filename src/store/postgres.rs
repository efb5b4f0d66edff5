//! Postgres store implementations
//!
//! Raw sqlx queries in the exact SQL shapes the tables are specified to
//! support. Batch operations run inside one transaction per flush.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};

use crate::event_log::Position;
use crate::snapshot::AccountSnapshot;

use super::{
    AccountRow, BalanceDelta, BalanceSync, CheckpointStore, IdempotencyStore, ReadModelStore,
    SagaStage, SnapshotStore, StoreError,
};

// =========================================================================
// Read model
// =========================================================================

#[derive(Clone)]
pub struct PgReadModelStore {
    pool: PgPool,
}

impl PgReadModelStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReadModelStore for PgReadModelStore {
    async fn batch_upsert_balances(&self, rows: &[BalanceSync]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO accounts (account_id, balance, last_updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (account_id)
                DO UPDATE SET balance = EXCLUDED.balance, last_updated_at = NOW()
                "#,
            )
            .bind(&row.account_id)
            .bind(row.balance)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn batch_update_balances(&self, rows: &[BalanceSync]) -> Result<Vec<String>, StoreError> {
        let mut missed = Vec::new();
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let affected = sqlx::query(
                r#"
                UPDATE accounts
                SET balance = $2, last_updated_at = NOW()
                WHERE account_id = $1
                "#,
            )
            .bind(&row.account_id)
            .bind(row.balance)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if affected == 0 {
                missed.push(row.account_id.clone());
            }
        }
        tx.commit().await?;
        Ok(missed)
    }

    async fn apply_deposit_deltas(&self, rows: &[BalanceDelta]) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;
        for row in rows {
            sqlx::query(
                r#"
                INSERT INTO accounts (account_id, balance, last_updated_at)
                VALUES ($1, $2, NOW())
                ON CONFLICT (account_id)
                DO UPDATE SET balance = accounts.balance + EXCLUDED.balance,
                              last_updated_at = NOW()
                "#,
            )
            .bind(&row.account_id)
            .bind(row.amount)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn apply_withdraw_deltas(
        &self,
        rows: &[BalanceDelta],
    ) -> Result<Vec<String>, StoreError> {
        let mut missed = Vec::new();
        let mut tx = self.pool.begin().await?;
        for row in rows {
            let affected = sqlx::query(
                r#"
                UPDATE accounts
                SET balance = balance - $2, last_updated_at = NOW()
                WHERE account_id = $1
                "#,
            )
            .bind(&row.account_id)
            .bind(row.amount)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if affected == 0 {
                missed.push(row.account_id.clone());
            }
        }
        tx.commit().await?;
        Ok(missed)
    }

    async fn fetch_account(&self, account_id: &str) -> Result<Option<AccountRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT account_id, balance, last_updated_at
            FROM accounts
            WHERE account_id = $1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| AccountRow {
            account_id: r.get("account_id"),
            balance: r.get("balance"),
            last_updated_at: r.get("last_updated_at"),
        }))
    }
}

// =========================================================================
// Snapshots
// =========================================================================

#[derive(Clone)]
pub struct PgSnapshotStore {
    pool: PgPool,
}

impl PgSnapshotStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SnapshotStore for PgSnapshotStore {
    async fn save(&self, snapshot: &AccountSnapshot) -> Result<(), StoreError> {
        let transactions = serde_json::to_value(&snapshot.processed_transactions)?;

        sqlx::query(
            r#"
            INSERT INTO account_snapshots
                (account_id, last_event_sequence, balance, processed_transactions, created_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (account_id, last_event_sequence)
            DO UPDATE SET balance = EXCLUDED.balance,
                          processed_transactions = EXCLUDED.processed_transactions,
                          created_at = EXCLUDED.created_at
            "#,
        )
        .bind(&snapshot.account_id)
        .bind(snapshot.last_event_sequence)
        .bind(snapshot.balance)
        .bind(transactions)
        .bind(snapshot.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_latest(&self, account_id: &str) -> Result<Option<AccountSnapshot>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT account_id, last_event_sequence, balance, processed_transactions, created_at
            FROM account_snapshots
            WHERE account_id = $1
            ORDER BY last_event_sequence DESC
            LIMIT 1
            "#,
        )
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| -> Result<AccountSnapshot, StoreError> {
            let transactions: serde_json::Value = r.get("processed_transactions");
            Ok(AccountSnapshot {
                account_id: r.get("account_id"),
                last_event_sequence: r.get("last_event_sequence"),
                balance: r.get("balance"),
                processed_transactions: serde_json::from_value::<HashSet<String>>(transactions)?,
                created_at: r.get("created_at"),
            })
        })
        .transpose()
    }

    async fn delete_older_snapshots(
        &self,
        account_id: &str,
        retain_count: u32,
    ) -> Result<u64, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM account_snapshots
            WHERE account_id = $1
              AND last_event_sequence < (
                  SELECT MIN(last_event_sequence) FROM (
                      SELECT last_event_sequence
                      FROM account_snapshots
                      WHERE account_id = $1
                      ORDER BY last_event_sequence DESC
                      LIMIT $2
                  ) AS newest
              )
            "#,
        )
        .bind(account_id)
        .bind(retain_count as i64)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }
}

// =========================================================================
// Idempotency
// =========================================================================

#[derive(Clone)]
pub struct PgIdempotencyStore {
    pool: PgPool,
}

impl PgIdempotencyStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl IdempotencyStore for PgIdempotencyStore {
    async fn try_mark_as_processed(
        &self,
        transaction_id: &str,
        step: &str,
    ) -> Result<bool, StoreError> {
        let affected = sqlx::query(
            r#"
            INSERT INTO processed_transactions (transaction_id, step, processed_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (transaction_id, step) DO NOTHING
            "#,
        )
        .bind(transaction_id)
        .bind(step)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(affected > 0)
    }

    async fn find_stages_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<SagaStage>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT step, processed_at
            FROM processed_transactions
            WHERE transaction_id = $1
            ORDER BY processed_at ASC
            "#,
        )
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|r| SagaStage {
                step: r.get("step"),
                processed_at: r.get::<DateTime<Utc>, _>("processed_at"),
            })
            .collect())
    }

    async fn find_timeout_transactions(
        &self,
        timeout_seconds: i64,
    ) -> Result<Vec<String>, StoreError> {
        // Anti-join: INIT rows with no closing COMPLETE/COMPENSATION row.
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT t1.transaction_id
            FROM processed_transactions t1
            LEFT JOIN processed_transactions t2
                ON t1.transaction_id = t2.transaction_id
                AND t2.step IN ('COMPLETE', 'COMPENSATION')
            WHERE t1.step = 'INIT'
              AND t2.transaction_id IS NULL
              AND t1.processed_at < NOW() - ($1 * INTERVAL '1 second')
            "#,
        )
        .bind(timeout_seconds)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    async fn delete_old_records(&self, days: i64) -> Result<u64, StoreError> {
        let deleted = sqlx::query(
            r#"
            DELETE FROM processed_transactions
            WHERE processed_at < NOW() - ($1 * INTERVAL '1 day')
            "#,
        )
        .bind(days)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(deleted)
    }
}

// =========================================================================
// Checkpoints
// =========================================================================

#[derive(Clone, Copy)]
enum CheckpointTable {
    Projection,
    Saga,
}

impl CheckpointTable {
    fn select_sql(self) -> &'static str {
        match self {
            CheckpointTable::Projection => {
                "SELECT last_commit, last_prepare FROM projection_checkpoints WHERE projection_name = $1"
            }
            CheckpointTable::Saga => {
                "SELECT last_commit, last_prepare FROM saga_checkpoints WHERE saga_name = $1"
            }
        }
    }

    fn upsert_sql(self) -> &'static str {
        match self {
            CheckpointTable::Projection => {
                "INSERT INTO projection_checkpoints (projection_name, last_commit, last_prepare) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (projection_name) \
                 DO UPDATE SET last_commit = EXCLUDED.last_commit, last_prepare = EXCLUDED.last_prepare"
            }
            CheckpointTable::Saga => {
                "INSERT INTO saga_checkpoints (saga_name, last_commit, last_prepare) \
                 VALUES ($1, $2, $3) \
                 ON CONFLICT (saga_name) \
                 DO UPDATE SET last_commit = EXCLUDED.last_commit, last_prepare = EXCLUDED.last_prepare"
            }
        }
    }
}

#[derive(Clone)]
pub struct PgCheckpointStore {
    pool: PgPool,
    table: CheckpointTable,
}

impl PgCheckpointStore {
    /// Checkpoints for projectors (`projection_checkpoints`).
    pub fn for_projections(pool: PgPool) -> Self {
        Self {
            pool,
            table: CheckpointTable::Projection,
        }
    }

    /// Checkpoints for sagas (`saga_checkpoints`).
    pub fn for_sagas(pool: PgPool) -> Self {
        Self {
            pool,
            table: CheckpointTable::Saga,
        }
    }
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn load(&self, name: &str) -> Result<Option<Position>, StoreError> {
        let row = sqlx::query(self.table.select_sql())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        Ok(row.map(|r| Position::new(r.get("last_commit"), r.get("last_prepare"))))
    }

    async fn save(&self, name: &str, position: Position) -> Result<(), StoreError> {
        sqlx::query(self.table.upsert_sql())
            .bind(name)
            .bind(position.commit)
            .bind(position.prepare)
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}
