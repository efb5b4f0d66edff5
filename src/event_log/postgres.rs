//! Postgres event log
//!
//! Append-only `events` table with a bigserial global position as the `$all`
//! order. Stream revisions are computed inside the append transaction, which
//! is safe because the journal stage is the only writer per stream.
//! Subscriptions are polling-based; persistent groups persist their cursor in
//! `saga_checkpoints` so progress survives restarts.

use std::time::Duration;

use sqlx::{PgPool, Row};
use tokio::sync::mpsc;

use crate::domain::AccountEvent;

use super::{
    CatchUpSubscription, EventLog, EventLogError, Feedback, NackAction, PersistentMessage,
    PersistentOptions, PersistentSubscription, Position, RecordedEvent, SubscribeAllOptions,
};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct PgEventLog {
    pool: PgPool,
}

impl PgEventLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn row_to_record(row: &sqlx::postgres::PgRow) -> Result<RecordedEvent, EventLogError> {
        let global: i64 = row.get("global_position");
        let data: serde_json::Value = row.get("event_data");
        Ok(RecordedEvent {
            stream: row.get("stream_name"),
            revision: row.get("stream_revision"),
            position: Position::new(global, global),
            event_type: row.get("event_type"),
            event: serde_json::from_value(data)?,
        })
    }

    async fn fetch_after(
        &self,
        cursor: i64,
        prefix: &str,
        limit: i64,
    ) -> Result<Vec<RecordedEvent>, EventLogError> {
        let rows = sqlx::query(
            r#"
            SELECT global_position, stream_name, stream_revision, event_type, event_data
            FROM events
            WHERE global_position > $1 AND event_type LIKE $2 || '%'
            ORDER BY global_position ASC
            LIMIT $3
            "#,
        )
        .bind(cursor)
        .bind(prefix)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn load_group_cursor(&self, group: &str) -> Result<i64, EventLogError> {
        let cursor: Option<i64> = sqlx::query_scalar(
            r#"
            SELECT last_commit FROM saga_checkpoints WHERE saga_name = $1
            "#,
        )
        .bind(group)
        .fetch_optional(&self.pool)
        .await?;

        Ok(cursor.unwrap_or(-1))
    }

    async fn save_group_cursor(&self, group: &str, position: i64) -> Result<(), EventLogError> {
        sqlx::query(
            r#"
            INSERT INTO saga_checkpoints (saga_name, last_commit, last_prepare)
            VALUES ($1, $2, $2)
            ON CONFLICT (saga_name)
            DO UPDATE SET last_commit = EXCLUDED.last_commit,
                          last_prepare = EXCLUDED.last_prepare
            "#,
        )
        .bind(group)
        .bind(position)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl EventLog for PgEventLog {
    async fn append_to_stream(
        &self,
        stream: &str,
        events: Vec<AccountEvent>,
    ) -> Result<i64, EventLogError> {
        let mut tx = self.pool.begin().await?;

        let mut revision: i64 = sqlx::query_scalar(
            r#"
            SELECT COALESCE(MAX(stream_revision), -1) FROM events WHERE stream_name = $1
            "#,
        )
        .bind(stream)
        .fetch_one(&mut *tx)
        .await?;

        for event in &events {
            revision += 1;
            let body = serde_json::to_value(event)?;
            sqlx::query(
                r#"
                INSERT INTO events (stream_name, stream_revision, event_type, event_data)
                VALUES ($1, $2, $3, $4)
                "#,
            )
            .bind(stream)
            .bind(revision)
            .bind(AccountEvent::EVENT_TYPE)
            .bind(body)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(revision)
    }

    async fn read_stream(
        &self,
        stream: &str,
        from_revision: i64,
    ) -> Result<Vec<RecordedEvent>, EventLogError> {
        let rows = sqlx::query(
            r#"
            SELECT global_position, stream_name, stream_revision, event_type, event_data
            FROM events
            WHERE stream_name = $1 AND stream_revision >= $2
            ORDER BY stream_revision ASC
            "#,
        )
        .bind(stream)
        .bind(from_revision)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn read_all_backwards(
        &self,
        max_count: usize,
    ) -> Result<Vec<RecordedEvent>, EventLogError> {
        let rows = sqlx::query(
            r#"
            SELECT global_position, stream_name, stream_revision, event_type, event_data
            FROM events
            ORDER BY global_position DESC
            LIMIT $1
            "#,
        )
        .bind(max_count as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_record).collect()
    }

    async fn subscribe_to_all(
        &self,
        options: SubscribeAllOptions,
    ) -> Result<CatchUpSubscription, EventLogError> {
        let (tx, rx) = mpsc::channel(256);
        let log = self.clone();
        let mut cursor = options.from.map(|p| p.commit).unwrap_or(-1);
        let prefix = options.event_type_prefix;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                let batch = match log.fetch_after(cursor, &prefix, 256).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(error = %e, "catch-up poll failed, will retry");
                        continue;
                    }
                };
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
        let group = group.to_string();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(POLL_INTERVAL);
            loop {
                ticker.tick().await;
                let cursor = match log.load_group_cursor(&group).await {
                    Ok(cursor) => cursor,
                    Err(e) => {
                        tracing::warn!(error = %e, group = %group, "group cursor load failed, will retry");
                        continue;
                    }
                };
                let batch = match log.fetch_after(cursor, &options.event_type_prefix, 1).await {
                    Ok(batch) => batch,
                    Err(e) => {
                        tracing::warn!(error = %e, group = %group, "persistent poll failed, will retry");
                        continue;
                    }
                };
                let Some(record) = batch.into_iter().next() else {
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
                    let advance = match verdict {
                        Ok(Some(Feedback::Ack)) => true,
                        Ok(Some(Feedback::Nack(NackAction::Park))) => {
                            tracing::warn!(group = %group, position, "message parked by consumer");
                            true
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
                                true
                            } else {
                                false
                            }
                        }
                        Ok(None) => return,
                    };

                    if advance {
                        if let Err(e) = log.save_group_cursor(&group, position).await {
                            tracing::error!(error = %e, group = %group, "group cursor save failed");
                        }
                        break;
                    }
                }
            }
        });

        Ok(PersistentSubscription::new(event_rx, feedback_tx))
    }
}
