//! Aggregate loader
//!
//! Resolves an account through three cascading strategies: L1 cache hit,
//! snapshot restore plus tail replay, or full replay from revision 0. The
//! returned handle is the canonical in-memory instance — the apply stage
//! mutates it directly, which is safe because the pipeline consumer is the
//! only mutator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::domain::{stream_for_account, EventKind};
use crate::event_log::EventLog;
use crate::store::SnapshotStore;

use super::Account;

pub type SharedAccount = Arc<Mutex<Account>>;

pub struct AggregateLoader {
    cache: StdMutex<HashMap<String, SharedAccount>>,
    log: Arc<dyn EventLog>,
    snapshots: Arc<dyn SnapshotStore>,
    read_timeout: Duration,
}

impl AggregateLoader {
    pub fn new(
        log: Arc<dyn EventLog>,
        snapshots: Arc<dyn SnapshotStore>,
        read_timeout: Duration,
    ) -> Self {
        Self {
            cache: StdMutex::new(HashMap::new()),
            log,
            snapshots,
            read_timeout,
        }
    }

    /// Load an account, reconstructing it from snapshot and log when the
    /// cache misses. Reconstruction never fabricates state: on any read
    /// failure the base aggregate (fresh or snapshot-restored) is returned
    /// unchanged.
    pub async fn load(&self, account_id: &str) -> SharedAccount {
        if let Some(cached) = self.peek(account_id) {
            return cached;
        }

        tracing::info!(account_id, "L1 cache miss, reconstructing from log");
        let account = self.reconstruct(account_id).await;

        let mut cache = self.cache.lock().expect("aggregate cache lock poisoned");
        Arc::clone(
            cache
                .entry(account_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(account))),
        )
    }

    /// Cache-only lookup.
    pub fn peek(&self, account_id: &str) -> Option<SharedAccount> {
        self.cache
            .lock()
            .expect("aggregate cache lock poisoned")
            .get(account_id)
            .cloned()
    }

    /// Drop one account from the cache. Tests and benchmarks use this to
    /// force reconstruction.
    pub fn evict(&self, account_id: &str) {
        self.cache
            .lock()
            .expect("aggregate cache lock poisoned")
            .remove(account_id);
    }

    /// Drop the whole cache.
    pub fn evict_all(&self) {
        self.cache
            .lock()
            .expect("aggregate cache lock poisoned")
            .clear();
    }

    async fn reconstruct(&self, account_id: &str) -> Account {
        // Strategy B: restore the latest snapshot when one exists.
        let mut account = match self.snapshots.find_latest(account_id).await {
            Ok(Some(snapshot)) => match Account::from_snapshot(&snapshot) {
                Ok(account) => {
                    tracing::info!(
                        account_id,
                        sequence = snapshot.last_event_sequence,
                        "snapshot found, replaying tail"
                    );
                    account
                }
                Err(e) => {
                    tracing::warn!(account_id, error = %e, "snapshot restore failed, full replay");
                    Account::new(account_id)
                }
            },
            Ok(None) => Account::new(account_id),
            Err(e) => {
                tracing::warn!(account_id, error = %e, "snapshot lookup failed, full replay");
                Account::new(account_id)
            }
        };

        // Strategy C: replay the remaining events, bounded by the read
        // timeout.
        let from_revision = account.version() + 1;
        let stream = stream_for_account(account_id);
        let read = tokio::time::timeout(
            self.read_timeout,
            self.log.read_stream(&stream, from_revision),
        )
        .await;

        match read {
            Ok(Ok(records)) => {
                for record in records {
                    if record.event.kind != EventKind::Fail {
                        if let Err(e) = account.apply(&record.event) {
                            tracing::warn!(
                                account_id,
                                revision = record.revision,
                                error = %e,
                                "skipping unappliable event during replay"
                            );
                        }
                    }
                    account.record_revision(record.revision);
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(account_id, error = %e, "log read failed, using base aggregate");
            }
            Err(_) => {
                tracing::warn!(
                    account_id,
                    timeout_ms = self.read_timeout.as_millis() as u64,
                    "log read timed out, using base aggregate"
                );
            }
        }

        account
    }
}
