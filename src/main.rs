//! ring-ledger server
//!
//! Wires the write-side engine: Postgres-backed event log and stores, the
//! ring pipeline, the saga subscription, the balance projector, the timeout
//! watcher and the housekeeping jobs, fronted by a small HTTP surface.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use sqlx::postgres::PgPoolOptions;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ring_ledger::aggregate::AggregateLoader;
use ring_ledger::api::{self, AppState};
use ring_ledger::clock::SystemClock;
use ring_ledger::config::Config;
use ring_ledger::event_log::{EventLog, PersistentOptions, PgEventLog};
use ring_ledger::jobs::{Housekeeping, HousekeepingOptions};
use ring_ledger::pipeline::{PipelineOptions, ReadModelSyncMode, RingPipeline};
use ring_ledger::projector::{BalanceProjector, ProjectorOptions};
use ring_ledger::saga::{SagaRunner, TransferSaga};
use ring_ledger::store::{
    IdempotencyStore, PgCheckpointStore, PgIdempotencyStore, PgReadModelStore, PgSnapshotStore,
    ReadModelStore, SnapshotStore,
};
use ring_ledger::db;
use ring_ledger::watcher::{TimeoutWatcher, WatcherOptions};

/// Initialize tracing/logging
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ring_ledger=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = Config::from_env()?;
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    tracing::info!("Starting ring-ledger");
    tracing::info!("Connecting to database...");

    let pool = PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .connect(&config.database_url)
        .await?;

    db::verify_connection(&pool).await?;
    if !db::check_schema(&pool).await? {
        tracing::error!("Database schema is not complete. Please run migrations.");
        return Err(anyhow::anyhow!("Database schema incomplete"));
    }
    tracing::info!("Database connected");

    // Ports
    let event_log: Arc<dyn EventLog> = Arc::new(PgEventLog::new(pool.clone()));
    let read_model: Arc<dyn ReadModelStore> = Arc::new(PgReadModelStore::new(pool.clone()));
    let snapshots: Arc<dyn SnapshotStore> = Arc::new(PgSnapshotStore::new(pool.clone()));
    let idempotency: Arc<dyn IdempotencyStore> = Arc::new(PgIdempotencyStore::new(pool.clone()));
    let clock = Arc::new(SystemClock);

    // The single-writer core
    let loader = Arc::new(AggregateLoader::new(
        Arc::clone(&event_log),
        Arc::clone(&snapshots),
        config.aggregate_read_timeout,
    ));
    let pipeline = RingPipeline::start(
        PipelineOptions {
            ring_capacity: config.ring_capacity,
            snapshot_threshold: config.snapshot_threshold,
            snapshot_retain_count: config.snapshot_retain_count,
            read_model_sync: config.read_model_sync,
        },
        loader,
        Arc::clone(&event_log),
        Arc::clone(&read_model),
        Arc::clone(&snapshots),
        clock,
    );
    let command_bus = pipeline.command_bus();

    // Saga: independent persistent subscription on the fact stream
    let saga = Arc::new(TransferSaga::new(
        Arc::clone(&command_bus),
        Arc::clone(&idempotency),
    ));
    let saga_runner = SagaRunner::new(
        saga,
        Arc::clone(&event_log),
        PersistentOptions {
            buffer_size: config.subscription_buffer_size,
            max_retries: config.subscription_max_retries,
            ack_timeout: config.subscription_ack_timeout,
            ..Default::default()
        },
    )
    .spawn();

    // Projector: owns the read model unless the ring stage does
    let projector_handle = if config.read_model_sync == ReadModelSyncMode::Projector {
        let projector = BalanceProjector::new(
            Arc::clone(&event_log),
            Arc::clone(&read_model),
            Arc::new(PgCheckpointStore::for_projections(pool.clone())),
            ProjectorOptions {
                batch_size: config.projector_batch_size,
                flush_period: config.projector_flush_period,
            },
        );
        Some((Arc::clone(&projector), projector.spawn()))
    } else {
        tracing::info!("read model owned by the ring stage, projector disabled");
        None
    };

    // Watcher + housekeeping
    let watcher_handle = TimeoutWatcher::new(
        Arc::clone(&idempotency),
        Arc::clone(&event_log),
        Arc::clone(&command_bus),
        WatcherOptions {
            period: config.watcher_period,
            timeout_seconds: config.watcher_timeout_seconds,
            scan_depth: config.watcher_scan_depth,
        },
    )
    .spawn();
    let housekeeping_handle = Housekeeping::new(
        Arc::clone(&idempotency),
        HousekeepingOptions {
            idempotency_retention_days: config.idempotency_retention_days,
            ..Default::default()
        },
    )
    .spawn();

    // HTTP surface
    let state = AppState {
        command_bus,
        read_model,
        idempotency,
    };
    let app = Router::new()
        .route("/health", axum::routing::get(health_check))
        .merge(api::create_router(state))
        .layer(TraceLayer::new_for_http());

    tracing::info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Server shutting down...");

    // Flush what the projector still buffers, then stop the background tasks.
    if let Some((projector, handle)) = projector_handle {
        projector.flush().await;
        handle.abort();
    }
    saga_runner.abort();
    watcher_handle.abort();
    housekeeping_handle.abort();
    pipeline.shutdown().await;
    pool.close().await;

    tracing::info!("Goodbye");
    Ok(())
}

async fn health_check() -> &'static str {
    "OK"
}

/// Shutdown signal handler for graceful shutdown
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown...");
        },
    }
}
