//! Apply stage
//!
//! First consumer on the ring. Loads the aggregate, applies the domain rule
//! for the command and, on a business failure, rewrites the slot's kind to
//! `Fail` in place while keeping the description — downstream stages and
//! every subscriber then see the canonical outcome.

use std::sync::Arc;

use crate::aggregate::AggregateLoader;
use crate::domain::{AccountEvent, DomainError, EventKind};

use super::ring::RingBuffer;

pub(crate) struct ApplyStage {
    loader: Arc<AggregateLoader>,
}

impl ApplyStage {
    pub(crate) fn new(loader: Arc<AggregateLoader>) -> Self {
        Self { loader }
    }

    /// Process one slot. `event` is the consumer's working copy of the slot
    /// and is kept in sync with any rewrite.
    pub(crate) async fn handle(&self, ring: &RingBuffer, sequence: u64, event: &mut AccountEvent) {
        match self.try_apply(event).await {
            Ok(balance) => {
                tracing::info!(
                    sequence,
                    account_id = %event.account_id,
                    kind = %event.kind,
                    %balance,
                    "command applied"
                );
            }
            Err(e) => {
                // The rewrite is the single point where a business error
                // becomes a recorded fact. Fail-kind commands (recovery
                // triggers) land here too; for them the rewrite is a no-op.
                if event.kind != EventKind::Fail {
                    tracing::warn!(
                        sequence,
                        account_id = %event.account_id,
                        error = %e,
                        "business rule violated, recording FAIL fact"
                    );
                }
                ring.rewrite(sequence, |slot| slot.kind = EventKind::Fail);
                event.kind = EventKind::Fail;
            }
        }
    }

    async fn try_apply(&self, event: &AccountEvent) -> Result<rust_decimal::Decimal, DomainError> {
        let account = self.loader.load(&event.account_id).await;
        let mut account = account.lock().await;
        account.apply(event)?;
        Ok(account.balance())
    }
}
