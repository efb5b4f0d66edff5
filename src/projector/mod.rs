//! Balance projector
//!
//! At-least-once maintainer of the `accounts` read model. A catch-up
//! subscription feeds an in-memory buffer with two flush triggers: the buffer
//! reaching the batch size, and a scheduled tick. Each flush records the last
//! global position, firewalls FAIL facts away from SQL, partitions the rest
//! into deposit upserts and strict withdraw updates, and persists the
//! position as the new checkpoint. Correctness under redelivery rests on the
//! monotone checkpoint and the single-writer order of the log.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::event_log::{EventLog, RecordedEvent, SubscribeAllOptions};
use crate::store::{BalanceDelta, CheckpointStore, ReadModelStore};

pub const PROJECTION_NAME: &str = "account_balance_projection";

#[derive(Debug, Clone)]
pub struct ProjectorOptions {
    pub batch_size: usize,
    pub flush_period: Duration,
}

impl Default for ProjectorOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            flush_period: Duration::from_secs(3),
        }
    }
}

pub struct BalanceProjector {
    log: Arc<dyn EventLog>,
    read_model: Arc<dyn ReadModelStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    options: ProjectorOptions,
    buffer: Mutex<Vec<RecordedEvent>>,
}

impl BalanceProjector {
    pub fn new(
        log: Arc<dyn EventLog>,
        read_model: Arc<dyn ReadModelStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        options: ProjectorOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            log,
            read_model,
            checkpoints,
            options,
            buffer: Mutex::new(Vec::new()),
        })
    }

    /// Start the subscription and the flush ticker.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let from = match self.checkpoints.load(PROJECTION_NAME).await {
                Ok(position) => position,
                Err(e) => {
                    tracing::error!(error = %e, "checkpoint load failed, starting from scratch");
                    None
                }
            };

            let mut subscription = loop {
                let options = SubscribeAllOptions {
                    from,
                    ..Default::default()
                };
                match self.log.subscribe_to_all(options).await {
                    Ok(subscription) => break subscription,
                    Err(e) => {
                        tracing::error!(error = %e, "projector subscription failed, retrying");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            };

            tracing::info!(
                batch_size = self.options.batch_size,
                period_secs = self.options.flush_period.as_secs(),
                resume_from = from.map(|p| p.commit),
                "balance projection started"
            );

            let mut ticker = tokio::time::interval(self.options.flush_period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    delivery = subscription.next() => {
                        match delivery {
                            Some(record) => {
                                let reached_batch = {
                                    let mut buffer = self.buffer.lock().await;
                                    buffer.push(record);
                                    buffer.len() >= self.options.batch_size
                                };
                                if reached_batch {
                                    self.flush().await;
                                }
                            }
                            None => {
                                tracing::warn!("projector subscription ended, final flush");
                                self.flush().await;
                                return;
                            }
                        }
                    }
                    _ = ticker.tick() => {
                        self.flush().await;
                    }
                }
            }
        })
    }

    /// Flush the buffer: firewall, partition, batch SQL, checkpoint. Errors
    /// drop the batch; the read model reconverges from the checkpoint on
    /// restart.
    pub async fn flush(&self) {
        let mut buffer = self.buffer.lock().await;
        if buffer.is_empty() {
            return;
        }

        let trigger = if buffer.len() >= self.options.batch_size {
            "batch size"
        } else {
            "timer"
        };
        tracing::debug!(count = buffer.len(), trigger, "flushing projection buffer");

        let mut last_position = None;
        let mut dropped_failures = 0usize;
        let mut deposits = Vec::new();
        let mut withdraws = Vec::new();

        for record in buffer.iter() {
            last_position = Some(record.position);
            match record.event.kind {
                crate::domain::EventKind::Fail => dropped_failures += 1,
                crate::domain::EventKind::Deposit => deposits.push(BalanceDelta {
                    account_id: record.event.account_id.clone(),
                    amount: record.event.amount,
                }),
                crate::domain::EventKind::Withdraw => withdraws.push(BalanceDelta {
                    account_id: record.event.account_id.clone(),
                    amount: record.event.amount,
                }),
            }
        }

        if dropped_failures > 0 {
            tracing::debug!(dropped_failures, "firewall kept FAIL facts out of SQL");
        }

        if let Err(e) = self.apply(&deposits, &withdraws, last_position).await {
            tracing::error!(error = %e, "projection flush failed, dropping batch");
        }
        buffer.clear();
    }

    async fn apply(
        &self,
        deposits: &[BalanceDelta],
        withdraws: &[BalanceDelta],
        last_position: Option<crate::event_log::Position>,
    ) -> Result<(), crate::store::StoreError> {
        if !deposits.is_empty() {
            self.read_model.apply_deposit_deltas(deposits).await?;
        }
        if !withdraws.is_empty() {
            let missed = self.read_model.apply_withdraw_deltas(withdraws).await?;
            for account_id in missed {
                // A withdraw against a missing row means the read model and
                // the write model disagree. Loud, but not fatal.
                tracing::warn!(account_id = %account_id, "withdraw hit no read-model row, models diverged");
            }
        }
        if let Some(position) = last_position {
            self.checkpoints.save(PROJECTION_NAME, position).await?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) async fn buffer_for_test(&self, records: Vec<RecordedEvent>) {
        self.buffer.lock().await.extend(records);
    }
}
