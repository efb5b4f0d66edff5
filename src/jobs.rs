//! Scheduled housekeeping
//!
//! Background loop for periodic maintenance. Currently one job: pruning aged
//! idempotency records so the table stays scan-friendly for the watcher.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::interval;

use crate::store::IdempotencyStore;

#[derive(Debug, Clone)]
pub struct HousekeepingOptions {
    pub cleanup_period: Duration,
    pub idempotency_retention_days: i64,
}

impl Default for HousekeepingOptions {
    fn default() -> Self {
        Self {
            cleanup_period: Duration::from_secs(24 * 60 * 60),
            idempotency_retention_days: 30,
        }
    }
}

pub struct Housekeeping {
    idempotency: Arc<dyn IdempotencyStore>,
    options: HousekeepingOptions,
}

impl Housekeeping {
    pub fn new(idempotency: Arc<dyn IdempotencyStore>, options: HousekeepingOptions) -> Self {
        Self {
            idempotency,
            options,
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.options.cleanup_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick fires immediately; skip it so startup isn't a
            // cleanup storm.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                self.run_once().await;
            }
        })
    }

    /// Run the cleanup once (manual trigger or tests).
    pub async fn run_once(&self) {
        match self
            .idempotency
            .delete_old_records(self.options.idempotency_retention_days)
            .await
        {
            Ok(deleted) if deleted > 0 => {
                tracing::info!(deleted, "pruned aged idempotency records");
            }
            Ok(_) => {}
            Err(e) => {
                tracing::error!(error = %e, "idempotency cleanup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::{steps, IdempotencyStore, MemoryIdempotencyStore};
    use chrono::Utc;

    #[tokio::test]
    async fn test_run_once_prunes_only_aged_rows() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let store = Arc::new(MemoryIdempotencyStore::with_clock(clock.clone()));

        store.try_mark_as_processed("OLD", steps::INIT).await.unwrap();
        clock.advance(chrono::Duration::days(31));
        store.try_mark_as_processed("NEW", steps::INIT).await.unwrap();

        let jobs = Housekeeping::new(store.clone(), HousekeepingOptions::default());
        jobs.run_once().await;

        assert!(store
            .find_stages_by_transaction_id("OLD")
            .await
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .find_stages_by_transaction_id("NEW")
                .await
                .unwrap()
                .len(),
            1
        );
    }
}
