//! In-memory store implementations
//!
//! Behaviorally equivalent to the Postgres stores, used by tests and
//! benchmarks. Time comes from the injected [`Clock`] so the idempotency
//! timeout queries can be driven deterministically.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::clock::{Clock, SystemClock};
use crate::event_log::Position;
use crate::snapshot::AccountSnapshot;

use super::{
    AccountRow, BalanceDelta, BalanceSync, CheckpointStore, IdempotencyStore, ReadModelStore,
    SagaStage, SnapshotStore, StoreError,
};

// =========================================================================
// Read model
// =========================================================================

#[derive(Clone, Default)]
pub struct MemoryReadModelStore {
    rows: Arc<Mutex<HashMap<String, AccountRow>>>,
}

impl MemoryReadModelStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, AccountRow>> {
        self.rows.lock().expect("read model lock poisoned")
    }
}

#[async_trait]
impl ReadModelStore for MemoryReadModelStore {
    async fn batch_upsert_balances(&self, rows: &[BalanceSync]) -> Result<(), StoreError> {
        let mut table = self.lock();
        for row in rows {
            table.insert(
                row.account_id.clone(),
                AccountRow {
                    account_id: row.account_id.clone(),
                    balance: row.balance,
                    last_updated_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    async fn batch_update_balances(&self, rows: &[BalanceSync]) -> Result<Vec<String>, StoreError> {
        let mut table = self.lock();
        let mut missed = Vec::new();
        for row in rows {
            match table.get_mut(&row.account_id) {
                Some(existing) => {
                    existing.balance = row.balance;
                    existing.last_updated_at = Utc::now();
                }
                None => missed.push(row.account_id.clone()),
            }
        }
        Ok(missed)
    }

    async fn apply_deposit_deltas(&self, rows: &[BalanceDelta]) -> Result<(), StoreError> {
        let mut table = self.lock();
        for row in rows {
            table
                .entry(row.account_id.clone())
                .and_modify(|existing| {
                    existing.balance += row.amount;
                    existing.last_updated_at = Utc::now();
                })
                .or_insert_with(|| AccountRow {
                    account_id: row.account_id.clone(),
                    balance: row.amount,
                    last_updated_at: Utc::now(),
                });
        }
        Ok(())
    }

    async fn apply_withdraw_deltas(
        &self,
        rows: &[BalanceDelta],
    ) -> Result<Vec<String>, StoreError> {
        let mut table = self.lock();
        let mut missed = Vec::new();
        for row in rows {
            match table.get_mut(&row.account_id) {
                Some(existing) => {
                    existing.balance -= row.amount;
                    existing.last_updated_at = Utc::now();
                }
                None => missed.push(row.account_id.clone()),
            }
        }
        Ok(missed)
    }

    async fn fetch_account(&self, account_id: &str) -> Result<Option<AccountRow>, StoreError> {
        Ok(self.lock().get(account_id).cloned())
    }
}

// =========================================================================
// Snapshots
// =========================================================================

#[derive(Clone, Default)]
pub struct MemorySnapshotStore {
    snapshots: Arc<Mutex<HashMap<String, Vec<AccountSnapshot>>>>,
}

impl MemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<AccountSnapshot>>> {
        self.snapshots.lock().expect("snapshot lock poisoned")
    }

    /// Number of retained snapshots for one account.
    pub fn count_for(&self, account_id: &str) -> usize {
        self.lock().get(account_id).map(Vec::len).unwrap_or(0)
    }

    /// Drop every snapshot of one account (benchmark cold starts).
    pub fn clear_account(&self, account_id: &str) {
        self.lock().remove(account_id);
    }
}

#[async_trait]
impl SnapshotStore for MemorySnapshotStore {
    async fn save(&self, snapshot: &AccountSnapshot) -> Result<(), StoreError> {
        // JSON round-trip mirrors the durable representation of the
        // processed-transaction set.
        let encoded = serde_json::to_value(&snapshot.processed_transactions)?;
        let mut stored = snapshot.clone();
        stored.processed_transactions = serde_json::from_value(encoded)?;

        let mut table = self.lock();
        let rows = table.entry(snapshot.account_id.clone()).or_default();
        rows.retain(|s| s.last_event_sequence != snapshot.last_event_sequence);
        rows.push(stored);
        rows.sort_by_key(|s| s.last_event_sequence);
        Ok(())
    }

    async fn find_latest(&self, account_id: &str) -> Result<Option<AccountSnapshot>, StoreError> {
        Ok(self
            .lock()
            .get(account_id)
            .and_then(|rows| rows.last())
            .cloned())
    }

    async fn delete_older_snapshots(
        &self,
        account_id: &str,
        retain_count: u32,
    ) -> Result<u64, StoreError> {
        let mut table = self.lock();
        let Some(rows) = table.get_mut(account_id) else {
            return Ok(0);
        };
        let excess = rows.len().saturating_sub(retain_count as usize);
        rows.drain(..excess);
        Ok(excess as u64)
    }
}

// =========================================================================
// Idempotency
// =========================================================================

#[derive(Clone)]
pub struct MemoryIdempotencyStore {
    rows: Arc<Mutex<HashMap<(String, String), DateTime<Utc>>>>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryIdempotencyStore {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl MemoryIdempotencyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            rows: Arc::new(Mutex::new(HashMap::new())),
            clock,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<(String, String), DateTime<Utc>>> {
        self.rows.lock().expect("idempotency lock poisoned")
    }

    /// Insert a row with an explicit timestamp; used by tests to simulate
    /// aged INIT rows.
    pub fn mark_with_timestamp(&self, transaction_id: &str, step: &str, at: DateTime<Utc>) {
        self.lock()
            .insert((transaction_id.to_string(), step.to_string()), at);
    }
}

#[async_trait]
impl IdempotencyStore for MemoryIdempotencyStore {
    async fn try_mark_as_processed(
        &self,
        transaction_id: &str,
        step: &str,
    ) -> Result<bool, StoreError> {
        let mut rows = self.lock();
        let key = (transaction_id.to_string(), step.to_string());
        if rows.contains_key(&key) {
            return Ok(false);
        }
        rows.insert(key, self.clock.now());
        Ok(true)
    }

    async fn find_stages_by_transaction_id(
        &self,
        transaction_id: &str,
    ) -> Result<Vec<SagaStage>, StoreError> {
        let rows = self.lock();
        let mut stages: Vec<SagaStage> = rows
            .iter()
            .filter(|((tx, _), _)| tx == transaction_id)
            .map(|((_, step), at)| SagaStage {
                step: step.clone(),
                processed_at: *at,
            })
            .collect();
        stages.sort_by_key(|s| s.processed_at);
        Ok(stages)
    }

    async fn find_timeout_transactions(
        &self,
        timeout_seconds: i64,
    ) -> Result<Vec<String>, StoreError> {
        let rows = self.lock();
        let cutoff = self.clock.now() - Duration::seconds(timeout_seconds);
        let orphans = rows
            .iter()
            .filter(|((_, step), at)| step == super::steps::INIT && **at < cutoff)
            .map(|((tx, _), _)| tx.clone())
            .filter(|tx| {
                !rows.contains_key(&(tx.clone(), super::steps::COMPLETE.to_string()))
                    && !rows.contains_key(&(tx.clone(), super::steps::COMPENSATION.to_string()))
            })
            .collect();
        Ok(orphans)
    }

    async fn delete_old_records(&self, days: i64) -> Result<u64, StoreError> {
        let mut rows = self.lock();
        let cutoff = self.clock.now() - Duration::days(days);
        let before = rows.len();
        rows.retain(|_, at| *at >= cutoff);
        Ok((before - rows.len()) as u64)
    }
}

// =========================================================================
// Checkpoints
// =========================================================================

#[derive(Clone, Default)]
pub struct MemoryCheckpointStore {
    positions: Arc<Mutex<HashMap<String, Position>>>,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn load(&self, name: &str) -> Result<Option<Position>, StoreError> {
        Ok(self
            .positions
            .lock()
            .expect("checkpoint lock poisoned")
            .get(name)
            .copied())
    }

    async fn save(&self, name: &str, position: Position) -> Result<(), StoreError> {
        self.positions
            .lock()
            .expect("checkpoint lock poisoned")
            .insert(name.to_string(), position);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::steps;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn test_try_mark_wins_once() {
        let store = MemoryIdempotencyStore::new();
        assert!(store.try_mark_as_processed("T1", steps::INIT).await.unwrap());
        assert!(!store.try_mark_as_processed("T1", steps::INIT).await.unwrap());
        assert!(store
            .try_mark_as_processed("T1", steps::COMPENSATION)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_timeout_query_is_an_anti_join() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryIdempotencyStore::with_clock(clock.clone());

        store.try_mark_as_processed("ORPHAN", steps::INIT).await.unwrap();
        store.try_mark_as_processed("DONE", steps::INIT).await.unwrap();
        store.try_mark_as_processed("DONE", steps::COMPLETE).await.unwrap();
        store
            .try_mark_as_processed("REFUNDED", steps::INIT)
            .await
            .unwrap();
        store
            .try_mark_as_processed("REFUNDED", steps::COMPENSATION)
            .await
            .unwrap();

        clock.advance(Duration::seconds(60));
        store.try_mark_as_processed("FRESH", steps::INIT).await.unwrap();

        let orphans = store.find_timeout_transactions(30).await.unwrap();
        assert_eq!(orphans, vec!["ORPHAN".to_string()]);
    }

    #[tokio::test]
    async fn test_delete_old_records() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = MemoryIdempotencyStore::with_clock(clock.clone());

        store.try_mark_as_processed("OLD", steps::INIT).await.unwrap();
        clock.advance(Duration::days(40));
        store.try_mark_as_processed("NEW", steps::INIT).await.unwrap();

        let deleted = store.delete_old_records(30).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(store
            .find_stages_by_transaction_id("NEW")
            .await
            .unwrap()
            .len()
            == 1);
    }

    #[tokio::test]
    async fn test_snapshot_retention_keeps_newest() {
        let store = MemorySnapshotStore::new();
        for seq in [10, 20, 30] {
            store
                .save(&AccountSnapshot {
                    account_id: "A".into(),
                    balance: Decimal::new(seq, 0),
                    last_event_sequence: seq,
                    processed_transactions: Default::default(),
                    created_at: Utc::now(),
                })
                .await
                .unwrap();
        }

        let deleted = store.delete_older_snapshots("A", 2).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(store.count_for("A"), 2);

        let latest = store.find_latest("A").await.unwrap().unwrap();
        assert_eq!(latest.last_event_sequence, 30);
    }

    #[tokio::test]
    async fn test_withdraw_delta_never_creates_rows() {
        let store = MemoryReadModelStore::new();
        let missed = store
            .apply_withdraw_deltas(&[BalanceDelta {
                account_id: "GHOST".into(),
                amount: Decimal::new(5, 0),
            }])
            .await
            .unwrap();
        assert_eq!(missed, vec!["GHOST".to_string()]);
        assert!(store.fetch_account("GHOST").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_deposit_delta_creates_and_accumulates() {
        let store = MemoryReadModelStore::new();
        let delta = BalanceDelta {
            account_id: "A".into(),
            amount: Decimal::new(50, 0),
        };
        store.apply_deposit_deltas(&[delta.clone()]).await.unwrap();
        store.apply_deposit_deltas(&[delta]).await.unwrap();

        let row = store.fetch_account("A").await.unwrap().unwrap();
        assert_eq!(row.balance, Decimal::new(100, 0));
    }
}
