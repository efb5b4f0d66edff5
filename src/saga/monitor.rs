//! Saga status reporting
//!
//! Derives the state of a transfer from its idempotency rows; nothing else is
//! stored about a saga instance.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::store::{steps, IdempotencyStore, StoreError};

#[derive(Debug, Clone, Serialize)]
pub struct SagaStepDetail {
    pub step: String,
    pub processed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SagaStatusReport {
    pub transaction_id: String,
    pub status: String,
    pub steps: Vec<SagaStepDetail>,
}

/// Build the full report for one transaction. Returns `Ok(None)` when no
/// stage was ever recorded.
pub async fn saga_status(
    idempotency: &Arc<dyn IdempotencyStore>,
    transaction_id: &str,
) -> Result<Option<SagaStatusReport>, StoreError> {
    let stages = idempotency
        .find_stages_by_transaction_id(transaction_id)
        .await?;

    if stages.is_empty() {
        return Ok(None);
    }

    let status = determine_final_status(stages.iter().map(|s| s.step.as_str()));

    Ok(Some(SagaStatusReport {
        transaction_id: transaction_id.to_string(),
        status: status.to_string(),
        steps: stages
            .into_iter()
            .map(|s| SagaStepDetail {
                step: s.step,
                processed_at: s.processed_at,
            })
            .collect(),
    }))
}

fn determine_final_status<'a>(steps_seen: impl Iterator<Item = &'a str> + Clone) -> &'static str {
    if steps_seen.clone().any(|s| s == steps::COMPENSATION) {
        "FAILED_AND_COMPENSATED"
    } else if steps_seen.clone().any(|s| s == steps::COMPLETE) {
        "COMPLETED"
    } else {
        "PROCESSING"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryIdempotencyStore;

    #[tokio::test]
    async fn test_status_progression() {
        let store: Arc<dyn IdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());

        assert!(saga_status(&store, "T1").await.unwrap().is_none());

        store.try_mark_as_processed("T1", steps::INIT).await.unwrap();
        let report = saga_status(&store, "T1").await.unwrap().unwrap();
        assert_eq!(report.status, "PROCESSING");

        store
            .try_mark_as_processed("T1", steps::COMPLETE)
            .await
            .unwrap();
        let report = saga_status(&store, "T1").await.unwrap().unwrap();
        assert_eq!(report.status, "COMPLETED");
        assert_eq!(report.steps.len(), 2);
    }

    #[tokio::test]
    async fn test_compensation_dominates() {
        let store: Arc<dyn IdempotencyStore> = Arc::new(MemoryIdempotencyStore::new());
        store.try_mark_as_processed("T4", steps::INIT).await.unwrap();
        store
            .try_mark_as_processed("T4", steps::COMPENSATION)
            .await
            .unwrap();

        let report = saga_status(&store, "T4").await.unwrap().unwrap();
        assert_eq!(report.status, "FAILED_AND_COMPENSATED");
    }
}
