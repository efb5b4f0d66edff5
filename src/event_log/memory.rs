//! In-memory event log
//!
//! Backs tests and benchmarks with the full log contract: ordered streams, a
//! global `$all` order, catch-up subscriptions and persistent groups with
//! retry/park semantics. Group cursors live in memory, so persistence of
//! progress only spans the life of the log instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, Notify};

use crate::domain::AccountEvent;

use super::{
    codec, CatchUpSubscription, EventLog, EventLogError, Feedback, NackAction, PersistentMessage,
    PersistentOptions, PersistentSubscription, Position, RecordedEvent, SubscribeAllOptions,
};

struct StoredRecord {
    stream: String,
    revision: i64,
    event_type: String,
    data: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    records: Vec<StoredRecord>,
    stream_revisions: HashMap<String, i64>,
    group_cursors: HashMap<String, i64>,
    parked: HashMap<String, Vec<RecordedEvent>>,
}

#[derive(Clone, Default)]
pub struct MemoryEventLog {
    inner: Arc<Mutex<Inner>>,
    appended: Arc<Notify>,
}

impl MemoryEventLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("event log lock poisoned")
    }

    fn resolve(record: &StoredRecord, global: i64) -> Result<RecordedEvent, EventLogError> {
        Ok(RecordedEvent {
            stream: record.stream.clone(),
            revision: record.revision,
            position: Position::new(global, global),
            event_type: record.event_type.clone(),
            event: codec::decode(&record.data)?,
        })
    }

    /// Messages parked by a persistent group, for operational inspection.
    pub fn parked_messages(&self, group: &str) -> Vec<RecordedEvent> {
        self.lock().parked.get(group).cloned().unwrap_or_default()
    }

    /// Total number of records in the global stream.
    pub fn global_length(&self) -> usize {
        self.lock().records.len()
    }

    fn collect_after(
        &self,
        cursor: i64,
        prefix: &str,
        limit: usize,
    ) -> Result<Vec<RecordedEvent>, EventLogError> {
        let inner = self.lock();
        let start = (cursor + 1).max(0) as usize;
        let mut out = Vec::new();
        for (idx, record) in inner.records.iter().enumerate().skip(start) {
            if !record.event_type.starts_with(prefix) {
                continue;
            }
            out.push(Self::resolve(record, idx as i64)?);
            if out.len() >= limit {
                break;
            }
        }
        Ok(out)
    }
}

#[async_trait::async_trait]
impl EventLog for MemoryEventLog {
    async fn append_to_stream(
        &self,
        stream: &str,
        events: Vec<AccountEvent>,
    ) -> Result<i64, EventLogError> {
        let mut last_revision = -1;
        {
            let mut inner = self.lock();
            for event in &events {
                let data = codec::encode(event)?;
                let revision = inner
                    .stream_revisions
                    .get(stream)
                    .copied()
                    .unwrap_or(-1)
                    + 1;
                inner.stream_revisions.insert(stream.to_string(), revision);
                inner.records.push(StoredRecord {
                    stream: stream.to_string(),
                    revision,
                    event_type: AccountEvent::EVENT_TYPE.to_string(),
                    data,
                });
                last_revision = revision;
            }
        }
        self.appended.notify_waiters();
        Ok(last_revision)
    }

    async fn read_stream(
        &self,
        stream: &str,
        from_revision: i64,
    ) -> Result<Vec<RecordedEvent>, EventLogError> {
        let inner = self.lock();
        inner
            .records
            .iter()
            .enumerate()
            .filter(|(_, r)| r.stream == stream && r.revision >= from_revision)
            .map(|(idx, r)| Self::resolve(r, idx as i64))
            .collect()
    }

    async fn read_all_backwards(
        &self,
        max_count: usize,
    ) -> Result<Vec<RecordedEvent>, EventLogError> {
        let inner = self.lock();
        inner
            .records
            .iter()
            .enumerate()
            .rev()
            .take(max_count)
            .map(|(idx, r)| Self::resolve(r, idx as i64))
            .collect()
    }

    async fn subscribe_to_all(
        &self,
        options: SubscribeAllOptions,
    ) -> Result<CatchUpSubscription, EventLogError> {
        let (tx, rx) = mpsc::channel(256);
        let log = self.clone();
        let appended = Arc::clone(&self.appended);
        let mut cursor = options.from.map(|p| p.commit).unwrap_or(-1);
        let prefix = options.event_type_prefix;

        tokio::spawn(async move {
            loop {
                let mut notified = std::pin::pin!(appended.notified());
                notified.as_mut().enable();
                let batch = match log.collect_after(cursor, &prefix, 256) {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::error!(error = %e, "catch-up subscription read failed");
                        return;
                    }
                };
                if batch.is_empty() {
                    notified.await;
                    continue;
                }
                for record in batch {
                    cursor = record.position.commit;
                    if tx.send(record).await.is_err() {
                        return;
                    }
                }
            }
        });

        Ok(CatchUpSubscription::new(rx))
    }

    async fn subscribe_persistent(
        &self,
        group: &str,
        options: PersistentOptions,
    ) -> Result<PersistentSubscription, EventLogError> {
        let (event_tx, event_rx) = mpsc::channel(options.buffer_size.max(1));
        let (feedback_tx, mut feedback_rx) = mpsc::channel(options.buffer_size.max(1));
        let log = self.clone();
        let appended = Arc::clone(&self.appended);
        let group = group.to_string();

        tokio::spawn(async move {
            loop {
                let mut notified = std::pin::pin!(appended.notified());
                notified.as_mut().enable();
                let cursor = log
                    .lock()
                    .group_cursors
                    .get(&group)
                    .copied()
                    .unwrap_or(-1);
                let batch = match log.collect_after(cursor, &options.event_type_prefix, 1) {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::error!(error = %e, group = %group, "persistent subscription read failed");
                        return;
                    }
                };
                let Some(record) = batch.into_iter().next() else {
                    notified.await;
                    continue;
                };

                let position = record.position.commit;
                let mut retry_count = 0u32;
                loop {
                    let message = PersistentMessage {
                        event: record.clone(),
                        retry_count,
                    };
                    if event_tx.send(message).await.is_err() {
                        return;
                    }

                    let verdict =
                        tokio::time::timeout(options.ack_timeout, feedback_rx.recv()).await;
                    match verdict {
                        Ok(Some(Feedback::Ack)) => {
                            log.lock().group_cursors.insert(group.clone(), position);
                            break;
                        }
                        Ok(Some(Feedback::Nack(NackAction::Park))) => {
                            tracing::warn!(group = %group, position, "message parked by consumer");
                            let mut inner = log.lock();
                            inner.parked.entry(group.clone()).or_default().push(record.clone());
                            inner.group_cursors.insert(group.clone(), position);
                            break;
                        }
                        Ok(Some(Feedback::Nack(NackAction::Retry))) | Err(_) => {
                            retry_count += 1;
                            if retry_count > options.max_retries {
                                tracing::error!(
                                    group = %group,
                                    position,
                                    retry_count,
                                    "retry ceiling exceeded, parking message"
                                );
                                let mut inner = log.lock();
                                inner
                                    .parked
                                    .entry(group.clone())
                                    .or_default()
                                    .push(record.clone());
                                inner.group_cursors.insert(group.clone(), position);
                                break;
                            }
                        }
                        Ok(None) => return,
                    }
                }
            }
        });

        Ok(PersistentSubscription::new(event_rx, feedback_tx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::EventKind;
    use rust_decimal::Decimal;
    use std::time::Duration;

    fn event(account: &str, tx: &str) -> AccountEvent {
        AccountEvent::new(account, Decimal::new(10, 0), EventKind::Deposit, tx)
    }

    #[tokio::test]
    async fn test_stream_revisions_are_per_stream() {
        let log = MemoryEventLog::new();
        log.append_to_stream("Account-A", vec![event("A", "T1"), event("A", "T2")])
            .await
            .unwrap();
        let last = log
            .append_to_stream("Account-B", vec![event("B", "T3")])
            .await
            .unwrap();
        assert_eq!(last, 0);

        let a = log.read_stream("Account-A", 0).await.unwrap();
        assert_eq!(a.len(), 2);
        assert_eq!(a[1].revision, 1);

        let tail = log.read_stream("Account-A", 1).await.unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].event.transaction_id, "T2");
    }

    #[tokio::test]
    async fn test_backward_scan_is_newest_first_and_bounded() {
        let log = MemoryEventLog::new();
        for i in 0..10 {
            log.append_to_stream("Account-A", vec![event("A", &format!("T{i}"))])
                .await
                .unwrap();
        }
        let scan = log.read_all_backwards(3).await.unwrap();
        assert_eq!(scan.len(), 3);
        assert_eq!(scan[0].event.transaction_id, "T9");
        assert_eq!(scan[2].event.transaction_id, "T7");
    }

    #[tokio::test]
    async fn test_catch_up_subscription_replays_then_follows() {
        let log = MemoryEventLog::new();
        log.append_to_stream("Account-A", vec![event("A", "T1")])
            .await
            .unwrap();

        let mut sub = log
            .subscribe_to_all(SubscribeAllOptions::default())
            .await
            .unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.event.transaction_id, "T1");

        log.append_to_stream("Account-A", vec![event("A", "T2")])
            .await
            .unwrap();
        let second = tokio::time::timeout(Duration::from_secs(1), sub.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.event.transaction_id, "T2");
        assert!(second.position > first.position);
    }

    #[tokio::test]
    async fn test_catch_up_resumes_after_position() {
        let log = MemoryEventLog::new();
        log.append_to_stream("Account-A", vec![event("A", "T1"), event("A", "T2")])
            .await
            .unwrap();

        let mut sub = log
            .subscribe_to_all(SubscribeAllOptions {
                from: Some(Position::new(0, 0)),
                ..Default::default()
            })
            .await
            .unwrap();
        let next = sub.next().await.unwrap();
        assert_eq!(next.event.transaction_id, "T2");
    }

    #[tokio::test]
    async fn test_persistent_ack_advances_group() {
        let log = MemoryEventLog::new();
        log.append_to_stream("Account-A", vec![event("A", "T1"), event("A", "T2")])
            .await
            .unwrap();

        let mut sub = log
            .subscribe_persistent("group-1", PersistentOptions::default())
            .await
            .unwrap();
        let first = sub.next().await.unwrap();
        assert_eq!(first.retry_count, 0);
        sub.ack().await.unwrap();
        let second = sub.next().await.unwrap();
        assert_eq!(second.event.event.transaction_id, "T2");
        sub.ack().await.unwrap();
    }

    #[tokio::test]
    async fn test_persistent_retry_then_park() {
        let log = MemoryEventLog::new();
        log.append_to_stream("Account-A", vec![event("A", "T1"), event("A", "T2")])
            .await
            .unwrap();

        let mut sub = log
            .subscribe_persistent("group-2", PersistentOptions::default())
            .await
            .unwrap();

        let first = sub.next().await.unwrap();
        assert_eq!(first.retry_count, 0);
        sub.nack(NackAction::Retry).await.unwrap();

        let redelivered = sub.next().await.unwrap();
        assert_eq!(redelivered.retry_count, 1);
        assert_eq!(redelivered.event.event.transaction_id, "T1");
        sub.nack(NackAction::Park).await.unwrap();

        // parked message is skipped, the group moves on
        let next = sub.next().await.unwrap();
        assert_eq!(next.event.event.transaction_id, "T2");
        sub.ack().await.unwrap();

        assert_eq!(log.parked_messages("group-2").len(), 1);
    }
}
