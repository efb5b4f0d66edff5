//! Money transfer saga
//!
//! Choreographed process manager over the account fact stream. For each
//! incoming event it makes at most one decision:
//!
//! - phase 1 (a withdraw carrying a target): reserve `(tx, INIT)` and send
//!   the deposit to the target account;
//! - phase 2 success (a deposit tagged `TRANSFER_DEPOSIT`): reserve
//!   `(tx, COMPLETE)` to close the transfer;
//! - phase 2 failure (a FAIL tagged `TRANSFER_DEPOSIT`): reserve
//!   `(tx, COMPENSATION)` and refund the original source.
//!
//! Transfer states are never stored; they are derivable from the idempotency
//! rows, and the row insertion is the serialisation point — no two nodes ever
//! emit the same command twice.

mod monitor;
mod runner;

pub use monitor::{saga_status, SagaStatusReport, SagaStepDetail};
pub use runner::SagaRunner;

use std::sync::Arc;

use crate::domain::{tags, AccountEvent, EventKind};
use crate::pipeline::{CommandBus, PipelineError};
use crate::store::{steps, IdempotencyStore, StoreError};

/// Persistent subscription group the saga consumes through.
pub const SAGA_GROUP: &str = "money-transfer-saga";

#[derive(Debug, thiserror::Error)]
pub enum SagaError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),
}

pub struct TransferSaga {
    command_bus: Arc<dyn CommandBus>,
    idempotency: Arc<dyn IdempotencyStore>,
}

impl TransferSaga {
    pub fn new(command_bus: Arc<dyn CommandBus>, idempotency: Arc<dyn IdempotencyStore>) -> Self {
        Self {
            command_bus,
            idempotency,
        }
    }

    /// Decide on one observed fact.
    pub async fn on_event(&self, event: &AccountEvent) -> Result<(), SagaError> {
        // Drill tag: stay silent so the timeout watcher can be exercised.
        if event.description == tags::SAGA_BYPASS {
            tracing::debug!(transaction_id = %event.transaction_id, "saga bypass tag, ignoring");
            return Ok(());
        }
        // Superseded trigger shape; recovery now arrives as a reconstructed
        // FAIL fact instead.
        if event.description == tags::TIMEOUT_RECOVERY_TRIGGER {
            tracing::debug!(
                transaction_id = %event.transaction_id,
                "legacy recovery trigger, ignoring"
            );
            return Ok(());
        }

        match event.kind {
            EventKind::Withdraw if event.target_id.is_some() => self.start_transfer(event).await,
            EventKind::Deposit if event.description == tags::TRANSFER_DEPOSIT => {
                self.complete_transfer(event).await
            }
            EventKind::Fail if event.description == tags::TRANSFER_DEPOSIT => {
                self.compensate(event).await
            }
            _ => Ok(()),
        }
    }

    /// Phase 1 observed: the source account was debited. Send the deposit to
    /// the target, recording the original source in `target_id` so a later
    /// failure knows where the refund goes.
    async fn start_transfer(&self, event: &AccountEvent) -> Result<(), SagaError> {
        let Some(target) = event.target_id.as_deref() else {
            return Ok(());
        };

        if !self
            .idempotency
            .try_mark_as_processed(&event.transaction_id, steps::INIT)
            .await?
        {
            tracing::debug!(
                transaction_id = %event.transaction_id,
                "transfer already initiated elsewhere, dropping"
            );
            return Ok(());
        }
        tracing::info!(
            transaction_id = %event.transaction_id,
            source = %event.account_id,
            target,
            amount = %event.amount,
            "transfer phase 1 captured, sending deposit"
        );

        let deposit = AccountEvent::new(
            target,
            event.amount,
            EventKind::Deposit,
            event.transaction_id.clone(),
        )
        .with_target(event.account_id.clone())
        .with_description(tags::TRANSFER_DEPOSIT);

        self.command_bus.publish(deposit).await?;
        Ok(())
    }

    /// Phase 2 succeeded. Closing the transfer keeps the watcher's orphan
    /// query from refunding a finished transfer.
    async fn complete_transfer(&self, event: &AccountEvent) -> Result<(), SagaError> {
        if self
            .idempotency
            .try_mark_as_processed(&event.transaction_id, steps::COMPLETE)
            .await?
        {
            tracing::info!(
                transaction_id = %event.transaction_id,
                target = %event.account_id,
                "transfer completed"
            );
        }
        Ok(())
    }

    /// Phase 2 failed: refund the original source. The refund destination is
    /// read from `target_id`, where phase 1 deliberately stored the source.
    async fn compensate(&self, event: &AccountEvent) -> Result<(), SagaError> {
        if !self
            .idempotency
            .try_mark_as_processed(&event.transaction_id, steps::COMPENSATION)
            .await?
        {
            tracing::debug!(
                transaction_id = %event.transaction_id,
                "compensation already handled elsewhere, dropping"
            );
            return Ok(());
        }

        let Some(refund_to) = event.target_id.as_deref() else {
            tracing::warn!(
                transaction_id = %event.transaction_id,
                "failure fact carries no refund target, abandoning recovery"
            );
            return Ok(());
        };

        tracing::warn!(
            transaction_id = %event.transaction_id,
            refund_to,
            amount = %event.amount,
            "transfer deposit failed, refunding source"
        );

        let refund = AccountEvent::new(
            refund_to,
            event.amount,
            EventKind::Deposit,
            event.transaction_id.clone(),
        )
        .with_description(tags::COMPENSATION);

        self.command_bus.publish(refund).await?;
        Ok(())
    }
}
