//! Saga subscription runner
//!
//! Feeds the saga from a persistent competing-consumer subscription on the
//! global fact stream. Every delivery is acknowledged on success; a failed
//! decision is retried up to the consumer ceiling and then parked for
//! operational inspection. The group's progress lives with the log, so a
//! restarted runner resumes where the group left off.

use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::event_log::{EventLog, NackAction, PersistentOptions};

use super::{TransferSaga, SAGA_GROUP};

/// Deliveries that failed this many times are parked instead of retried.
const CONSUMER_RETRY_CEILING: u32 = 5;

pub struct SagaRunner {
    saga: Arc<TransferSaga>,
    log: Arc<dyn EventLog>,
    options: PersistentOptions,
}

impl SagaRunner {
    pub fn new(saga: Arc<TransferSaga>, log: Arc<dyn EventLog>, options: PersistentOptions) -> Self {
        Self { saga, log, options }
    }

    /// Spawn the long-lived consume loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut subscription = loop {
                match self
                    .log
                    .subscribe_persistent(SAGA_GROUP, self.options.clone())
                    .await
                {
                    Ok(subscription) => break subscription,
                    Err(e) => {
                        tracing::error!(error = %e, "saga subscription failed, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            };

            tracing::info!(group = SAGA_GROUP, "saga subscription started");

            while let Some(message) = subscription.next().await {
                match self.saga.on_event(&message.event.event).await {
                    Ok(()) => {
                        if let Err(e) = subscription.ack().await {
                            tracing::error!(error = %e, "saga ack failed, stopping");
                            return;
                        }
                    }
                    Err(e) => {
                        let action = if message.retry_count >= CONSUMER_RETRY_CEILING {
                            tracing::error!(
                                error = %e,
                                transaction_id = %message.event.event.transaction_id,
                                retry_count = message.retry_count,
                                "saga decision kept failing, parking message"
                            );
                            NackAction::Park
                        } else {
                            tracing::warn!(
                                error = %e,
                                transaction_id = %message.event.event.transaction_id,
                                retry_count = message.retry_count,
                                "saga decision failed, requesting retry"
                            );
                            NackAction::Retry
                        };
                        if let Err(e) = subscription.nack(action).await {
                            tracing::error!(error = %e, "saga nack failed, stopping");
                            return;
                        }
                    }
                }
            }

            tracing::info!(group = SAGA_GROUP, "saga subscription ended");
        })
    }
}
