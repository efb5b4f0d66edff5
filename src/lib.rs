//! ring-ledger
//!
//! Single-writer, event-sourced account ledger. Commands are serialised
//! through a bounded ring pipeline (apply, journal, read-model sync, snapshot
//! tick); cross-account transfers are coordinated by a choreographed saga
//! with idempotent compensation and timeout-driven recovery; the read model
//! is maintained by an at-least-once checkpointed projector.

pub mod aggregate;
pub mod api;
pub mod clock;
pub mod config;
pub mod db;
pub mod domain;
pub mod error;
pub mod event_log;
pub mod jobs;
pub mod pipeline;
pub mod projector;
pub mod saga;
pub mod snapshot;
pub mod store;
pub mod watcher;

pub use config::Config;
pub use error::{AppError, AppResult};
pub use domain::{AccountEvent, Amount, AmountError, Balance, DomainError, EventKind};
