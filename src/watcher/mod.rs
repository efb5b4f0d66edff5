//! Timeout watcher
//!
//! Periodic scanner for transfers that captured INIT and then went silent.
//! For each orphan it walks the global stream backwards, bounded by the scan
//! depth, to find the original WITHDRAW fact, and injects a compensation
//! trigger carrying the source account in both `account_id` and `target_id` —
//! the saga's compensation branch reads `target_id` as the refund
//! destination. A miss within the scan bound is logged for the operator,
//! never guessed at.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use crate::domain::{tags, AccountEvent, EventKind};
use crate::event_log::EventLog;
use crate::pipeline::CommandBus;
use crate::store::IdempotencyStore;

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub period: Duration,
    /// INIT rows older than this are considered orphaned.
    pub timeout_seconds: i64,
    /// Backward scan bound on the global stream.
    pub scan_depth: usize,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(60),
            timeout_seconds: 30,
            scan_depth: 2000,
        }
    }
}

pub struct TimeoutWatcher {
    idempotency: Arc<dyn IdempotencyStore>,
    log: Arc<dyn EventLog>,
    command_bus: Arc<dyn CommandBus>,
    options: WatcherOptions,
}

impl TimeoutWatcher {
    pub fn new(
        idempotency: Arc<dyn IdempotencyStore>,
        log: Arc<dyn EventLog>,
        command_bus: Arc<dyn CommandBus>,
        options: WatcherOptions,
    ) -> Self {
        Self {
            idempotency,
            log,
            command_bus,
            options,
        }
    }

    /// Spawn the periodic scan loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.options.period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        })
    }

    /// One scan pass. Public so tests and operators can trigger it directly.
    pub async fn tick(&self) {
        let orphans = match self
            .idempotency
            .find_timeout_transactions(self.options.timeout_seconds)
            .await
        {
            Ok(orphans) => orphans,
            Err(e) => {
                tracing::error!(error = %e, "orphan scan query failed");
                return;
            }
        };

        if orphans.is_empty() {
            tracing::debug!("no orphaned transactions");
            return;
        }

        tracing::warn!(count = orphans.len(), "orphaned transactions detected");

        // One depth-bounded backward window per tick, searched per
        // transaction.
        let window = match self.log.read_all_backwards(self.options.scan_depth).await {
            Ok(window) => window,
            Err(e) => {
                tracing::error!(error = %e, "backward log scan failed");
                return;
            }
        };

        for transaction_id in orphans {
            let original = window.iter().find(|record| {
                !record.stream.starts_with('$')
                    && record.event_type == AccountEvent::EVENT_TYPE
                    && record.event.kind == EventKind::Withdraw
                    && record.event.transaction_id == transaction_id
            });

            match original {
                Some(record) => self.trigger_recovery(&transaction_id, &record.event).await,
                None => {
                    tracing::error!(
                        transaction_id = %transaction_id,
                        scan_depth = self.options.scan_depth,
                        "no matching withdraw within scan depth, leaving for operator"
                    );
                }
            }
        }
    }

    async fn trigger_recovery(&self, transaction_id: &str, withdraw: &AccountEvent) {
        tracing::warn!(
            transaction_id,
            account_id = %withdraw.account_id,
            amount = %withdraw.amount,
            "recovering orphaned transfer"
        );

        // The source account rides in both fields so the saga treats this as
        // a compensation with a known refund target.
        let recovery = AccountEvent::new(
            withdraw.account_id.clone(),
            withdraw.amount,
            EventKind::Fail,
            transaction_id,
        )
        .with_target(withdraw.account_id.clone())
        .with_description(tags::TRANSFER_DEPOSIT);

        if let Err(e) = self.command_bus.publish(recovery).await {
            tracing::error!(
                transaction_id,
                error = %e,
                "recovery command could not be published"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::PipelineError;
    use crate::store::{steps, MemoryIdempotencyStore};
    use crate::event_log::MemoryEventLog;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<AccountEvent>>,
    }

    impl RecordingBus {
        fn published(&self) -> Vec<AccountEvent> {
            self.published.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandBus for RecordingBus {
        async fn publish(&self, command: AccountEvent) -> Result<(), PipelineError> {
            self.published.lock().unwrap().push(command);
            Ok(())
        }
    }

    fn watcher(
        idempotency: &Arc<MemoryIdempotencyStore>,
        log: &MemoryEventLog,
        bus: &Arc<RecordingBus>,
        scan_depth: usize,
    ) -> TimeoutWatcher {
        TimeoutWatcher::new(
            Arc::clone(idempotency) as Arc<dyn IdempotencyStore>,
            Arc::new(log.clone()),
            Arc::clone(bus) as Arc<dyn CommandBus>,
            WatcherOptions {
                scan_depth,
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn test_orphan_recovery_reconstructs_withdraw() {
        let idempotency = Arc::new(MemoryIdempotencyStore::new());
        let log = MemoryEventLog::new();
        let bus = Arc::new(RecordingBus::default());

        let withdraw =
            AccountEvent::new("A", Decimal::new(100, 0), EventKind::Withdraw, "T5")
                .with_target("B999")
                .with_description(tags::SAGA_BYPASS);
        log.append_to_stream("Account-A", vec![withdraw]).await.unwrap();

        idempotency.mark_with_timestamp("T5", steps::INIT, Utc::now() - chrono::Duration::seconds(60));

        watcher(&idempotency, &log, &bus, 2000).tick().await;

        let published = bus.published();
        assert_eq!(published.len(), 1);
        let recovery = &published[0];
        assert_eq!(recovery.kind, EventKind::Fail);
        assert_eq!(recovery.description, tags::TRANSFER_DEPOSIT);
        assert_eq!(recovery.account_id, "A");
        assert_eq!(recovery.target_id.as_deref(), Some("A"));
        assert_eq!(recovery.amount, Decimal::new(100, 0));
        assert_eq!(recovery.transaction_id, "T5");
    }

    #[tokio::test]
    async fn test_scan_miss_emits_nothing() {
        let idempotency = Arc::new(MemoryIdempotencyStore::new());
        let log = MemoryEventLog::new();
        let bus = Arc::new(RecordingBus::default());

        idempotency.mark_with_timestamp("GONE", steps::INIT, Utc::now() - chrono::Duration::seconds(60));

        watcher(&idempotency, &log, &bus, 2000).tick().await;

        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_scan_depth_bound_is_honoured() {
        let idempotency = Arc::new(MemoryIdempotencyStore::new());
        let log = MemoryEventLog::new();
        let bus = Arc::new(RecordingBus::default());

        // The withdraw sits below the scan window.
        let withdraw =
            AccountEvent::new("A", Decimal::new(100, 0), EventKind::Withdraw, "DEEP");
        log.append_to_stream("Account-A", vec![withdraw]).await.unwrap();
        for i in 0..5 {
            let filler =
                AccountEvent::new("B", Decimal::new(1, 0), EventKind::Deposit, format!("F{i}"));
            log.append_to_stream("Account-B", vec![filler]).await.unwrap();
        }

        idempotency.mark_with_timestamp("DEEP", steps::INIT, Utc::now() - chrono::Duration::seconds(60));

        watcher(&idempotency, &log, &bus, 5).tick().await;

        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn test_fresh_init_is_not_recovered() {
        let idempotency = Arc::new(MemoryIdempotencyStore::new());
        let log = MemoryEventLog::new();
        let bus = Arc::new(RecordingBus::default());

        let withdraw =
            AccountEvent::new("A", Decimal::new(100, 0), EventKind::Withdraw, "FRESH").with_target("B");
        log.append_to_stream("Account-A", vec![withdraw]).await.unwrap();
        idempotency.mark_with_timestamp("FRESH", steps::INIT, Utc::now());

        watcher(&idempotency, &log, &bus, 2000).tick().await;

        assert!(bus.published().is_empty());
    }
}
