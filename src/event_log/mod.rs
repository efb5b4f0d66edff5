//! Event log port
//!
//! Thin contract over an append-only log: per-stream append, per-stream read
//! from a revision, global backward scan, catch-up subscription with an
//! event-type prefix filter, and a persistent competing-consumer subscription
//! with ack / nack(retry) / nack(park). The write side only ever depends on
//! this trait; the Postgres adapter and the in-memory adapter are
//! interchangeable.

mod memory;
mod postgres;

pub use memory::MemoryEventLog;
pub use postgres::PgEventLog;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::domain::AccountEvent;

/// Global log position as a (commit, prepare) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Position {
    pub commit: i64,
    pub prepare: i64,
}

impl Position {
    pub fn new(commit: i64, prepare: i64) -> Self {
        Self { commit, prepare }
    }

    pub fn start() -> Self {
        Self {
            commit: -1,
            prepare: -1,
        }
    }
}

/// One event as read back from the log.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedEvent {
    pub stream: String,
    /// Per-stream revision, starting at 0.
    pub revision: i64,
    /// Global position in the `$all` order.
    pub position: Position,
    pub event_type: String,
    pub event: AccountEvent,
}

#[derive(Debug, thiserror::Error)]
pub enum EventLogError {
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Subscription closed")]
    SubscriptionClosed,

    #[error("Event log error: {0}")]
    Backend(String),
}

/// Options for the global catch-up subscription.
#[derive(Debug, Clone)]
pub struct SubscribeAllOptions {
    /// Server-side filter on the event type prefix.
    pub event_type_prefix: String,
    /// Resume strictly after this position; `None` starts from the beginning.
    pub from: Option<Position>,
}

impl Default for SubscribeAllOptions {
    fn default() -> Self {
        Self {
            event_type_prefix: AccountEvent::EVENT_TYPE.to_string(),
            from: None,
        }
    }
}

/// Options for a persistent competing-consumer subscription.
#[derive(Debug, Clone)]
pub struct PersistentOptions {
    pub buffer_size: usize,
    /// Server-side redelivery ceiling; exceeding it parks the message.
    pub max_retries: u32,
    /// Unacknowledged deliveries are retried after this long.
    pub ack_timeout: Duration,
    pub event_type_prefix: String,
}

impl Default for PersistentOptions {
    fn default() -> Self {
        Self {
            buffer_size: 50,
            max_retries: 10,
            ack_timeout: Duration::from_secs(10),
            event_type_prefix: AccountEvent::EVENT_TYPE.to_string(),
        }
    }
}

/// Push-based catch-up subscription; delivery order is the `$all` order.
pub struct CatchUpSubscription {
    receiver: mpsc::Receiver<RecordedEvent>,
}

impl CatchUpSubscription {
    pub(crate) fn new(receiver: mpsc::Receiver<RecordedEvent>) -> Self {
        Self { receiver }
    }

    /// Next event, or `None` once the feeding task has stopped.
    pub async fn next(&mut self) -> Option<RecordedEvent> {
        self.receiver.recv().await
    }
}

/// A message delivered by a persistent subscription.
#[derive(Debug, Clone)]
pub struct PersistentMessage {
    pub event: RecordedEvent,
    /// How many times this message was delivered before, including ack
    /// timeouts.
    pub retry_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackAction {
    /// Ask the server to redeliver.
    Retry,
    /// Move the message to the parked queue and advance.
    Park,
}

pub(crate) enum Feedback {
    Ack,
    Nack(NackAction),
}

/// Persistent subscription handle. Delivery is one message at a time: the
/// consumer must ack or nack the current message before the next one arrives;
/// an unacknowledged message is redelivered after the ack timeout.
pub struct PersistentSubscription {
    receiver: mpsc::Receiver<PersistentMessage>,
    feedback: mpsc::Sender<Feedback>,
}

impl PersistentSubscription {
    pub(crate) fn new(
        receiver: mpsc::Receiver<PersistentMessage>,
        feedback: mpsc::Sender<Feedback>,
    ) -> Self {
        Self { receiver, feedback }
    }

    pub async fn next(&mut self) -> Option<PersistentMessage> {
        self.receiver.recv().await
    }

    /// Acknowledge the in-flight message; the group checkpoint advances.
    pub async fn ack(&self) -> Result<(), EventLogError> {
        self.feedback
            .send(Feedback::Ack)
            .await
            .map_err(|_| EventLogError::SubscriptionClosed)
    }

    /// Negatively acknowledge the in-flight message.
    pub async fn nack(&self, action: NackAction) -> Result<(), EventLogError> {
        self.feedback
            .send(Feedback::Nack(action))
            .await
            .map_err(|_| EventLogError::SubscriptionClosed)
    }
}

/// The append-only log contract.
#[async_trait]
pub trait EventLog: Send + Sync {
    /// Append events to one stream, waiting for durability. Returns the
    /// stream revision of the last appended event.
    async fn append_to_stream(
        &self,
        stream: &str,
        events: Vec<AccountEvent>,
    ) -> Result<i64, EventLogError>;

    /// Read one stream forward from the given revision (inclusive).
    async fn read_stream(
        &self,
        stream: &str,
        from_revision: i64,
    ) -> Result<Vec<RecordedEvent>, EventLogError>;

    /// Read the global stream backwards (newest first), bounded by
    /// `max_count`.
    async fn read_all_backwards(&self, max_count: usize)
        -> Result<Vec<RecordedEvent>, EventLogError>;

    /// Catch-up subscription over the global stream.
    async fn subscribe_to_all(
        &self,
        options: SubscribeAllOptions,
    ) -> Result<CatchUpSubscription, EventLogError>;

    /// Persistent competing-consumer subscription keyed by group name. The
    /// group's progress survives the subscriber.
    async fn subscribe_persistent(
        &self,
        group: &str,
        options: PersistentOptions,
    ) -> Result<PersistentSubscription, EventLogError>;
}

/// JSON codec for event bodies. The wire format is the serde encoding of
/// [`AccountEvent`] tagged with the logical type name.
pub mod codec {
    use super::EventLogError;
    use crate::domain::AccountEvent;

    pub fn encode(event: &AccountEvent) -> Result<Vec<u8>, EventLogError> {
        Ok(serde_json::to_vec(event)?)
    }

    pub fn decode(data: &[u8]) -> Result<AccountEvent, EventLogError> {
        Ok(serde_json::from_slice(data)?)
    }

}
