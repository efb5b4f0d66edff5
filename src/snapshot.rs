//! Account snapshot
//!
//! A point-in-time copy of an aggregate plus the stream revision it covers.
//! Replay resumes from `last_event_sequence + 1`; for a fixed account the
//! snapshot with the highest sequence is authoritative.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub account_id: String,
    pub balance: Decimal,
    /// Stream revision of the last event folded into this snapshot.
    pub last_event_sequence: i64,
    /// Copy of the aggregate's processed-transaction set, taken defensively
    /// at snapshot time.
    pub processed_transactions: HashSet<String>,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processed_set_serializes_reversibly() {
        let mut set = HashSet::new();
        set.insert("DEPOSIT:T1".to_string());
        set.insert("WITHDRAW:T2".to_string());

        let snapshot = AccountSnapshot {
            account_id: "A".into(),
            balance: Decimal::new(70, 0),
            last_event_sequence: 1,
            processed_transactions: set.clone(),
            created_at: Utc::now(),
        };

        let json = serde_json::to_string(&snapshot.processed_transactions).unwrap();
        let back: HashSet<String> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, set);
    }
}
