//! Ring pipeline
//!
//! The single-writer core. Producers (REST handlers, the saga, the watcher)
//! publish command-events through the [`CommandBus`] port; one consumer task
//! drives the stages in fixed dependency order — apply, journal, read-model
//! buffer, snapshot tick — over each contiguous batch. No subscriber observes
//! an event before the journal has durably accepted it.

mod apply;
mod journal;
mod read_model;
mod ring;
mod snapshot_tick;

pub use ring::{RingBuffer, RingClosed};
pub use snapshot_tick::SnapshotJanitor;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::aggregate::AggregateLoader;
use crate::clock::Clock;
use crate::domain::AccountEvent;
use crate::event_log::EventLog;
use crate::store::{ReadModelStore, SnapshotStore};

use apply::ApplyStage;
use journal::JournalStage;
use read_model::ReadModelStage;
use snapshot_tick::SnapshotTickStage;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Pipeline halted after a journal failure")]
    Halted,

    #[error("Pipeline is shut down")]
    Closed,
}

/// Which component owns the `accounts` read model. Absolute-balance sync from
/// the ring and delta arithmetic from the projector must never both run
/// against the same table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadModelSyncMode {
    /// The buffered projector maintains the read model (default).
    Projector,
    /// The ring's read-model stage flushes absolute balances directly.
    Pipeline,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Power of two.
    pub ring_capacity: usize,
    /// Snapshot every N ring sequences.
    pub snapshot_threshold: u64,
    pub snapshot_retain_count: u32,
    pub read_model_sync: ReadModelSyncMode,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            ring_capacity: 1024,
            snapshot_threshold: 100,
            snapshot_retain_count: 2,
            read_model_sync: ReadModelSyncMode::Projector,
        }
    }
}

/// Port through which every producer publishes into the ring.
#[async_trait]
pub trait CommandBus: Send + Sync {
    async fn publish(&self, command: AccountEvent) -> Result<(), PipelineError>;
}

struct RingCommandBus {
    ring: Arc<RingBuffer>,
    halted: Arc<AtomicBool>,
}

#[async_trait]
impl CommandBus for RingCommandBus {
    async fn publish(&self, command: AccountEvent) -> Result<(), PipelineError> {
        if self.halted.load(Ordering::Acquire) {
            return Err(PipelineError::Halted);
        }
        self.ring.publish(&command).await.map_err(|RingClosed| {
            if self.halted.load(Ordering::Acquire) {
                PipelineError::Halted
            } else {
                PipelineError::Closed
            }
        })?;
        Ok(())
    }
}

/// The assembled pipeline. Owns its consumer task and exposes only the
/// command-bus port plus the loader's eviction surface.
pub struct RingPipeline {
    ring: Arc<RingBuffer>,
    halted: Arc<AtomicBool>,
    loader: Arc<AggregateLoader>,
    consumer: JoinHandle<()>,
}

impl RingPipeline {
    pub fn start(
        options: PipelineOptions,
        loader: Arc<AggregateLoader>,
        log: Arc<dyn EventLog>,
        read_model: Arc<dyn ReadModelStore>,
        snapshots: Arc<dyn SnapshotStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let ring = Arc::new(RingBuffer::with_capacity(options.ring_capacity));
        let halted = Arc::new(AtomicBool::new(false));

        let apply = ApplyStage::new(Arc::clone(&loader));
        let journal = JournalStage::new(Arc::clone(&log), Arc::clone(&loader));
        let read_model_stage = ReadModelStage::new(read_model, Arc::clone(&loader));
        let janitor = SnapshotJanitor::new(
            snapshots,
            Arc::clone(&loader),
            clock,
            options.snapshot_retain_count,
        );
        let snapshot_tick = SnapshotTickStage::new(janitor, options.snapshot_threshold);

        let consumer = tokio::spawn(Self::consume(
            Arc::clone(&ring),
            Arc::clone(&halted),
            apply,
            journal,
            read_model_stage,
            snapshot_tick,
            options.read_model_sync,
        ));

        Self {
            ring,
            halted,
            loader,
            consumer,
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn consume(
        ring: Arc<RingBuffer>,
        halted: Arc<AtomicBool>,
        apply: ApplyStage,
        journal: JournalStage,
        mut read_model: ReadModelStage,
        snapshot_tick: SnapshotTickStage,
        sync_mode: ReadModelSyncMode,
    ) {
        let batch_limit = ring.capacity();
        loop {
            let mut batch = ring.peek_batch(batch_limit);
            if batch.is_empty() {
                if ring.is_closed() {
                    tracing::info!("ring closed, pipeline consumer stopping");
                    return;
                }
                ring.wait_for_committed(ring.cursor()).await;
                continue;
            }

            // Stage 1: apply domain rules; rejected commands become FAIL
            // facts in place.
            for (sequence, event) in batch.iter_mut() {
                apply.handle(&ring, *sequence, event).await;
            }

            // Stage 2: journal the batch and wait for durability. An append
            // failure is a safety stop.
            if let Err(e) = journal.flush(&batch).await {
                tracing::error!(error = %e, "journal append failed, halting pipeline");
                halted.store(true, Ordering::Release);
                ring.close();
                return;
            }

            // Stage 3: read-model buffer, only when the ring owns the table.
            if sync_mode == ReadModelSyncMode::Pipeline {
                for (sequence, event) in &batch {
                    read_model.buffer(*sequence, event).await;
                }
                read_model.flush().await;
            }

            // Stage 4: snapshot tick, behind the journal barrier.
            for (sequence, event) in &batch {
                snapshot_tick.handle(*sequence, event).await;
            }

            let last_sequence = batch[batch.len() - 1].0;
            ring.release_through(last_sequence);
        }
    }

    /// The command-bus port shared with producers.
    pub fn command_bus(&self) -> Arc<dyn CommandBus> {
        Arc::new(RingCommandBus {
            ring: Arc::clone(&self.ring),
            halted: Arc::clone(&self.halted),
        })
    }

    /// Loader handle, exposed for cache eviction in tests and benchmarks.
    pub fn loader(&self) -> &Arc<AggregateLoader> {
        &self.loader
    }

    /// True after a journal failure stopped the consumer.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Stop accepting commands, drain nothing further and wait for the
    /// consumer to exit.
    pub async fn shutdown(self) {
        self.ring.close();
        if let Err(e) = self.consumer.await {
            if !e.is_cancelled() {
                tracing::error!(error = %e, "pipeline consumer ended abnormally");
            }
        }
    }
}
