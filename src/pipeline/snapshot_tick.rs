//! Snapshot tick stage and janitor
//!
//! Runs behind the journal barrier. Every time the ring sequence crosses a
//! positive multiple of the threshold on a non-FAIL event, the janitor takes
//! a defensive copy of the cached aggregate, stamps it with the aggregate's
//! last journaled stream revision, persists it and prunes old snapshots down
//! to the retain count. Nothing here is allowed to disturb the ring.

use std::sync::Arc;

use crate::aggregate::AggregateLoader;
use crate::clock::Clock;
use crate::domain::{AccountEvent, EventKind};
use crate::snapshot::AccountSnapshot;
use crate::store::SnapshotStore;

pub(crate) struct SnapshotTickStage {
    janitor: SnapshotJanitor,
    threshold: u64,
}

impl SnapshotTickStage {
    pub(crate) fn new(janitor: SnapshotJanitor, threshold: u64) -> Self {
        Self { janitor, threshold }
    }

    pub(crate) async fn handle(&self, sequence: u64, event: &AccountEvent) {
        if event.kind == EventKind::Fail || sequence == 0 || sequence % self.threshold != 0 {
            return;
        }
        tracing::info!(
            sequence,
            account_id = %event.account_id,
            "snapshot threshold crossed"
        );
        self.janitor.snapshot_account(&event.account_id).await;
    }
}

pub struct SnapshotJanitor {
    store: Arc<dyn SnapshotStore>,
    loader: Arc<AggregateLoader>,
    clock: Arc<dyn Clock>,
    retain_count: u32,
}

impl SnapshotJanitor {
    pub fn new(
        store: Arc<dyn SnapshotStore>,
        loader: Arc<AggregateLoader>,
        clock: Arc<dyn Clock>,
        retain_count: u32,
    ) -> Self {
        Self {
            store,
            loader,
            clock,
            retain_count,
        }
    }

    /// Emit one snapshot for the account and prune the old ones. Persistence
    /// failures are logged and swallowed; pruning failures likewise.
    pub async fn snapshot_account(&self, account_id: &str) {
        let Some(account) = self.loader.peek(account_id) else {
            tracing::error!(account_id, "no cached aggregate to snapshot");
            return;
        };

        let snapshot = {
            let account = account.lock().await;
            if account.version() < 0 {
                // Nothing journaled yet; a snapshot would have no cursor.
                return;
            }
            AccountSnapshot {
                account_id: account.id().to_string(),
                balance: account.balance(),
                last_event_sequence: account.version(),
                processed_transactions: account.processed_transactions().clone(),
                created_at: self.clock.now(),
            }
        };

        if let Err(e) = self.store.save(&snapshot).await {
            tracing::error!(account_id, error = %e, "snapshot persistence failed");
            return;
        }

        match self
            .store
            .delete_older_snapshots(account_id, self.retain_count)
            .await
        {
            Ok(deleted) if deleted > 0 => {
                tracing::debug!(account_id, deleted, "pruned old snapshots");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(account_id, error = %e, "snapshot pruning failed");
            }
        }

        tracing::info!(
            account_id,
            sequence = snapshot.last_event_sequence,
            balance = %snapshot.balance,
            "snapshot stored"
        );
    }
}
