//! Shared integration-test harness
//!
//! Wires the full write side against the in-memory ports: ring pipeline,
//! saga subscription, balance projector and timeout watcher. Assertions poll
//! with [`await_until`] because everything downstream of the ring is
//! asynchronous by design.

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;

use ring_ledger::aggregate::AggregateLoader;
use ring_ledger::clock::SystemClock;
use ring_ledger::domain::{AccountEvent, EventKind};
use ring_ledger::event_log::{MemoryEventLog, PersistentOptions};
use ring_ledger::pipeline::{CommandBus, PipelineOptions, ReadModelSyncMode, RingPipeline};
use ring_ledger::projector::{BalanceProjector, ProjectorOptions};
use ring_ledger::saga::{SagaRunner, TransferSaga};
use ring_ledger::store::{
    IdempotencyStore, MemoryCheckpointStore, MemoryIdempotencyStore, MemoryReadModelStore,
    MemorySnapshotStore, ReadModelStore,
};
use ring_ledger::watcher::{TimeoutWatcher, WatcherOptions};

pub struct TestStack {
    pub pipeline: RingPipeline,
    pub bus: Arc<dyn CommandBus>,
    pub log: MemoryEventLog,
    pub read_model: MemoryReadModelStore,
    pub idempotency: Arc<MemoryIdempotencyStore>,
    pub watcher: TimeoutWatcher,
}

/// Start the full stack: projector-owned read model, fast flush period so
/// tests converge quickly, watcher constructed but driven manually.
pub fn start_stack() -> TestStack {
    let log = MemoryEventLog::new();
    let read_model = MemoryReadModelStore::new();
    let snapshots = MemorySnapshotStore::new();
    let idempotency = Arc::new(MemoryIdempotencyStore::new());
    let checkpoints = MemoryCheckpointStore::new();

    let loader = Arc::new(AggregateLoader::new(
        Arc::new(log.clone()),
        Arc::new(snapshots.clone()),
        Duration::from_secs(5),
    ));
    let pipeline = RingPipeline::start(
        PipelineOptions {
            read_model_sync: ReadModelSyncMode::Projector,
            ..Default::default()
        },
        loader,
        Arc::new(log.clone()),
        Arc::new(read_model.clone()),
        Arc::new(snapshots.clone()),
        Arc::new(SystemClock),
    );
    let bus = pipeline.command_bus();

    let saga = Arc::new(TransferSaga::new(
        Arc::clone(&bus),
        Arc::clone(&idempotency) as Arc<dyn IdempotencyStore>,
    ));
    SagaRunner::new(saga, Arc::new(log.clone()), PersistentOptions::default()).spawn();

    BalanceProjector::new(
        Arc::new(log.clone()),
        Arc::new(read_model.clone()),
        Arc::new(checkpoints),
        ProjectorOptions {
            batch_size: 500,
            flush_period: Duration::from_millis(100),
        },
    )
    .spawn();

    let watcher = TimeoutWatcher::new(
        Arc::clone(&idempotency) as Arc<dyn IdempotencyStore>,
        Arc::new(log.clone()),
        Arc::clone(&bus),
        WatcherOptions::default(),
    );

    TestStack {
        pipeline,
        bus,
        log,
        read_model,
        idempotency,
        watcher,
    }
}

/// Poll a condition until it holds, failing after five seconds.
pub async fn await_until<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}

pub fn deposit(account: &str, amount: i64, tx: &str) -> AccountEvent {
    AccountEvent::new(account, Decimal::new(amount, 0), EventKind::Deposit, tx)
}

pub fn withdraw(account: &str, amount: i64, tx: &str) -> AccountEvent {
    AccountEvent::new(account, Decimal::new(amount, 0), EventKind::Withdraw, tx)
}

/// A transfer enters the ring as a withdraw carrying the target.
pub fn transfer(source: &str, target: &str, amount: i64, tx: &str) -> AccountEvent {
    withdraw(source, amount, tx).with_target(target)
}

pub async fn read_model_balance(stack: &TestStack, account: &str) -> Option<Decimal> {
    stack
        .read_model
        .fetch_account(account)
        .await
        .expect("read model lookup")
        .map(|row| row.balance)
}

pub async fn recorded_steps(stack: &TestStack, tx: &str) -> Vec<String> {
    stack
        .idempotency
        .find_stages_by_transaction_id(tx)
        .await
        .expect("idempotency lookup")
        .into_iter()
        .map(|s| s.step)
        .collect()
}
