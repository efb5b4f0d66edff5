//! Domain Events
//!
//! The account fact record carried through the ring, the journal and every
//! subscription. Events are immutable once journaled; the only mutation that
//! ever happens is the apply stage rewriting an in-flight slot's kind to
//! `Fail` before the journal accepts it.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Well-known description tags.
pub mod tags {
    /// Phase 2 of a transfer: the deposit the saga sends to the target
    /// account. A `Fail` fact with this tag triggers compensation.
    pub const TRANSFER_DEPOSIT: &str = "TRANSFER_DEPOSIT";

    /// The refund deposit the saga sends back to the original source.
    pub const COMPENSATION: &str = "COMPENSATION";

    /// Legacy recovery-trigger shape. Recognised and dropped by the saga;
    /// the watcher now reconstructs the original withdraw instead.
    pub const TIMEOUT_RECOVERY_TRIGGER: &str = "TIMEOUT_RECOVERY_TRIGGER";

    /// Drill tag: the saga stays silent on events carrying it so the timeout
    /// watcher can be exercised against real wiring. Not for production
    /// traffic.
    pub const SAGA_BYPASS: &str = "SAGA_BYPASS";

    /// Default tag for operator-initiated commands.
    pub const USER_REQUEST: &str = "USER_REQUEST";
}

/// Account operation kind.
///
/// `Fail` is a first-class variant: it is the recorded form of a command that
/// violated a business rule, and the compensation trigger the watcher injects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    Deposit,
    Withdraw,
    Fail,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Deposit => "DEPOSIT",
            EventKind::Withdraw => "WITHDRAW",
            EventKind::Fail => "FAIL",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An account fact. The same record doubles as the command carrier in the
/// ring slots: producers fill the fields in place and the apply stage turns a
/// rejected command into a `Fail` fact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountEvent {
    pub account_id: String,
    pub amount: Decimal,
    pub kind: EventKind,
    /// End-to-end transaction trace id; the saga keys all idempotency
    /// reservations on it.
    pub transaction_id: String,
    /// Transfer target on phase 1; refund destination on compensation facts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default)]
    pub description: String,
}

impl AccountEvent {
    /// Event type tag used for stream filtering.
    pub const EVENT_TYPE: &'static str = "AccountEvent";

    pub fn new(
        account_id: impl Into<String>,
        amount: Decimal,
        kind: EventKind,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self {
            account_id: account_id.into(),
            amount,
            kind,
            transaction_id: transaction_id.into(),
            target_id: None,
            description: tags::USER_REQUEST.to_string(),
        }
    }

    pub fn with_target(mut self, target_id: impl Into<String>) -> Self {
        self.target_id = Some(target_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Dedup key for the aggregate's processed set. A compensation refund
    /// reuses the transaction id of the withdraw it undoes on the same
    /// account, so at-most-once keys on kind plus transaction id.
    pub fn dedup_key(&self) -> String {
        format!("{}:{}", self.kind.as_str(), self.transaction_id)
    }

    /// Name of the per-account journal stream.
    pub fn stream_name(&self) -> String {
        stream_for_account(&self.account_id)
    }

    /// Overwrite every field in place. Used by ring producers so the slot
    /// carrier is reused instead of allocating a fresh event per command.
    pub fn overwrite_from(&mut self, other: &AccountEvent) {
        self.account_id.clear();
        self.account_id.push_str(&other.account_id);
        self.amount = other.amount;
        self.kind = other.kind;
        self.transaction_id.clear();
        self.transaction_id.push_str(&other.transaction_id);
        match (&mut self.target_id, &other.target_id) {
            (slot, Some(target)) => {
                let reused = match slot {
                    Some(existing) => {
                        existing.clear();
                        existing.push_str(target);
                        true
                    }
                    None => false,
                };
                if !reused {
                    *slot = Some(target.clone());
                }
            }
            (slot, None) => *slot = None,
        }
        self.description.clear();
        self.description.push_str(&other.description);
    }
}

/// Stream naming convention: `Account-<accountId>`.
pub fn stream_for_account(account_id: &str) -> String {
    format!("Account-{account_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization_round_trip() {
        let event = AccountEvent::new("A-1", Decimal::new(100, 0), EventKind::Withdraw, "TX-1")
            .with_target("B-2")
            .with_description(tags::TRANSFER_DEPOSIT);

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("WITHDRAW"));
        assert!(json.contains("TRANSFER_DEPOSIT"));

        let back: AccountEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(event, back);
    }

    #[test]
    fn test_missing_target_deserializes_as_none() {
        let json = r#"{"account_id":"A","amount":"5","kind":"DEPOSIT","transaction_id":"T","description":""}"#;
        let event: AccountEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.target_id, None);
    }

    #[test]
    fn test_dedup_key_distinguishes_kinds() {
        let withdraw = AccountEvent::new("A", Decimal::ONE, EventKind::Withdraw, "TX");
        let refund = AccountEvent::new("A", Decimal::ONE, EventKind::Deposit, "TX");
        assert_ne!(withdraw.dedup_key(), refund.dedup_key());
    }

    #[test]
    fn test_overwrite_reuses_slot() {
        let mut slot = AccountEvent::new("OLD", Decimal::ONE, EventKind::Deposit, "OLD-TX")
            .with_target("OLD-TARGET");
        let incoming = AccountEvent::new("A-9", Decimal::new(42, 0), EventKind::Withdraw, "TX-9")
            .with_description(tags::SAGA_BYPASS);

        slot.overwrite_from(&incoming);
        assert_eq!(slot, incoming);

        // target re-appears when the next occupant carries one
        let with_target = incoming.clone().with_target("B-1");
        slot.overwrite_from(&with_target);
        assert_eq!(slot.target_id.as_deref(), Some("B-1"));
    }

    #[test]
    fn test_stream_naming() {
        assert_eq!(stream_for_account("ACC-7"), "Account-ACC-7");
    }
}
