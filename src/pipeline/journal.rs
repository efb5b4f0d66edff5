//! Journal stage
//!
//! Second consumer on the ring: the fact stream is the system of record, so
//! the whole batch is appended per account stream and awaited for durability
//! before anything downstream may observe it. An append error is a safety
//! stop — the pipeline halts rather than diverge from the log.

use std::collections::HashMap;
use std::sync::Arc;

use crate::aggregate::AggregateLoader;
use crate::domain::{stream_for_account, AccountEvent};
use crate::event_log::{EventLog, EventLogError};

pub(crate) struct JournalStage {
    log: Arc<dyn EventLog>,
    loader: Arc<AggregateLoader>,
}

impl JournalStage {
    pub(crate) fn new(log: Arc<dyn EventLog>, loader: Arc<AggregateLoader>) -> Self {
        Self { log, loader }
    }

    /// Append the batch, grouped per account with order preserved inside each
    /// group. After a durable append the returned stream revision is stamped
    /// back into the cached aggregate so snapshots carry replayable cursors.
    pub(crate) async fn flush(&self, batch: &[(u64, AccountEvent)]) -> Result<(), EventLogError> {
        let mut groups: HashMap<String, Vec<AccountEvent>> = HashMap::new();
        for (_, event) in batch {
            groups
                .entry(event.account_id.clone())
                .or_default()
                .push(event.clone());
        }

        for (account_id, events) in groups {
            let count = events.len();
            let last_revision = self
                .log
                .append_to_stream(&stream_for_account(&account_id), events)
                .await?;

            tracing::debug!(account_id = %account_id, count, last_revision, "batch journaled");

            if let Some(account) = self.loader.peek(&account_id) {
                account.lock().await.record_revision(last_revision);
            }
        }

        Ok(())
    }
}
