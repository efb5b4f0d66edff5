//! Read-model buffer stage
//!
//! Third consumer on the ring. Classifies non-FAIL events into a deposit
//! (upsert) buffer and a withdraw (strict update) buffer keyed per account —
//! last writer wins within a batch, each entry carrying the aggregate's
//! current absolute balance — and flushes both as batch SQL at end-of-batch.
//! Withdraws never INSERT: a failed transfer must not materialise a ghost
//! account.

use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregate::AggregateLoader;
use crate::domain::{AccountEvent, EventKind};
use crate::store::{BalanceSync, ReadModelStore};

pub(crate) struct ReadModelStage {
    store: Arc<dyn ReadModelStore>,
    loader: Arc<AggregateLoader>,
    upserts: HashMap<String, BalanceSync>,
    updates: HashMap<String, BalanceSync>,
}

impl ReadModelStage {
    pub(crate) fn new(store: Arc<dyn ReadModelStore>, loader: Arc<AggregateLoader>) -> Self {
        Self {
            store,
            loader,
            upserts: HashMap::new(),
            updates: HashMap::new(),
        }
    }

    pub(crate) async fn buffer(&mut self, sequence: u64, event: &AccountEvent) {
        // FAIL firewall: a failure fact never reaches SQL.
        if event.kind == EventKind::Fail {
            tracing::debug!(
                sequence,
                transaction_id = %event.transaction_id,
                "FAIL fact, skipping read-model sync"
            );
            return;
        }

        let Some(account) = self.loader.peek(&event.account_id) else {
            tracing::error!(
                sequence,
                account_id = %event.account_id,
                "no cached aggregate for read-model sync"
            );
            return;
        };
        let balance = account.lock().await.balance();
        let sync = BalanceSync {
            account_id: event.account_id.clone(),
            balance,
        };

        match event.kind {
            EventKind::Deposit => {
                self.upserts.insert(event.account_id.clone(), sync);
            }
            EventKind::Withdraw => {
                self.updates.insert(event.account_id.clone(), sync);
            }
            EventKind::Fail => unreachable!("filtered above"),
        }
    }

    /// Flush both buffers. Errors are logged and the buffers cleared; the
    /// read model reconverges through the projector.
    pub(crate) async fn flush(&mut self) {
        if !self.upserts.is_empty() {
            let rows: Vec<BalanceSync> = self.upserts.drain().map(|(_, v)| v).collect();
            tracing::debug!(count = rows.len(), "flushing deposit upsert buffer");
            if let Err(e) = self.store.batch_upsert_balances(&rows).await {
                tracing::error!(error = %e, "deposit batch sync failed, dropping buffer");
            }
        }

        if !self.updates.is_empty() {
            let rows: Vec<BalanceSync> = self.updates.drain().map(|(_, v)| v).collect();
            tracing::debug!(count = rows.len(), "flushing withdraw update buffer");
            match self.store.batch_update_balances(&rows).await {
                Ok(missed) => {
                    for account_id in missed {
                        tracing::error!(
                            account_id,
                            "withdraw sync matched no row, read model diverged"
                        );
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "withdraw batch sync failed, dropping buffer");
                }
            }
        }
    }
}
