//! Ring buffer
//!
//! Bounded, power-of-two sequence buffer carrying command-events. Producers
//! claim a sequence, overwrite the slot carrier in place and commit by
//! stamping the slot; the single consumer walks contiguous committed
//! sequences and frees them in batches. A full ring blocks the producer until
//! the consumer releases slots; nothing is ever dropped silently.

use std::pin::pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use rust_decimal::Decimal;
use tokio::sync::Notify;

use crate::domain::{AccountEvent, EventKind};

/// Slot sentinel: not yet committed for any sequence.
const UNCOMMITTED: u64 = u64::MAX;

struct Slot {
    /// Sequence this slot was committed for; `UNCOMMITTED` between commits.
    committed: AtomicU64,
    cell: Mutex<AccountEvent>,
}

impl Slot {
    fn empty() -> Self {
        Self {
            committed: AtomicU64::new(UNCOMMITTED),
            cell: Mutex::new(AccountEvent::new(
                String::new(),
                Decimal::ZERO,
                EventKind::Fail,
                String::new(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Ring buffer closed")]
pub struct RingClosed;

pub struct RingBuffer {
    slots: Box<[Slot]>,
    mask: u64,
    capacity: u64,
    /// Next sequence handed to a producer.
    claim: AtomicU64,
    /// Next sequence the consumer will take; everything below is free.
    consumed: AtomicU64,
    closed: AtomicBool,
    /// Consumer → producers: slots were freed (or the ring closed).
    space: Notify,
    /// Producers → consumer: a slot was committed.
    data: Notify,
}

impl RingBuffer {
    /// Capacity must be a power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity > 0,
            "ring capacity must be a power of two"
        );
        let slots = (0..capacity).map(|_| Slot::empty()).collect::<Vec<_>>();
        Self {
            slots: slots.into_boxed_slice(),
            mask: capacity as u64 - 1,
            capacity: capacity as u64,
            claim: AtomicU64::new(0),
            consumed: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            space: Notify::new(),
            data: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity as usize
    }

    /// Claim the next sequence, write the command into the slot in place and
    /// commit it. Blocks while the ring is full.
    pub async fn publish(&self, command: &AccountEvent) -> Result<u64, RingClosed> {
        let sequence = self.claim_next().await?;
        let slot = &self.slots[(sequence & self.mask) as usize];
        {
            let mut cell = slot.cell.lock().expect("ring slot lock poisoned");
            cell.overwrite_from(command);
        }
        slot.committed.store(sequence, Ordering::Release);
        self.data.notify_waiters();
        Ok(sequence)
    }

    async fn claim_next(&self) -> Result<u64, RingClosed> {
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(RingClosed);
            }
            let mut notified = pin!(self.space.notified());
            notified.as_mut().enable();

            let sequence = self.claim.load(Ordering::Acquire);
            if sequence.wrapping_sub(self.consumed.load(Ordering::Acquire)) >= self.capacity {
                // Ring full: wait until the consumer frees slots.
                notified.await;
                continue;
            }
            if self
                .claim
                .compare_exchange(sequence, sequence + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(sequence);
            }
        }
    }

    /// Wait until at least one sequence past `cursor` is committed, or the
    /// ring closes.
    pub async fn wait_for_committed(&self, cursor: u64) {
        loop {
            let mut notified = pin!(self.data.notified());
            notified.as_mut().enable();
            if self.is_committed(cursor) || self.closed.load(Ordering::Acquire) {
                return;
            }
            notified.await;
        }
    }

    fn is_committed(&self, sequence: u64) -> bool {
        self.slots[(sequence & self.mask) as usize]
            .committed
            .load(Ordering::Acquire)
            == sequence
    }

    /// Clone the contiguous run of committed events starting at the consume
    /// cursor, without freeing the slots. Returns `(sequence, event)` pairs.
    pub fn peek_batch(&self, max: usize) -> Vec<(u64, AccountEvent)> {
        let mut batch = Vec::new();
        let mut sequence = self.consumed.load(Ordering::Acquire);
        while batch.len() < max && self.is_committed(sequence) {
            let slot = &self.slots[(sequence & self.mask) as usize];
            let event = slot.cell.lock().expect("ring slot lock poisoned").clone();
            batch.push((sequence, event));
            sequence += 1;
        }
        batch
    }

    /// Mutate a committed, not-yet-released slot in place. Used by the apply
    /// stage to rewrite a rejected command into its `Fail` form.
    pub fn rewrite(&self, sequence: u64, rewrite: impl FnOnce(&mut AccountEvent)) {
        debug_assert!(self.is_committed(sequence));
        let slot = &self.slots[(sequence & self.mask) as usize];
        let mut cell = slot.cell.lock().expect("ring slot lock poisoned");
        rewrite(&mut cell);
    }

    /// Free every slot up to and including `sequence`.
    pub fn release_through(&self, sequence: u64) {
        self.consumed.store(sequence + 1, Ordering::Release);
        self.space.notify_waiters();
    }

    /// Current consume cursor.
    pub fn cursor(&self) -> u64 {
        self.consumed.load(Ordering::Acquire)
    }

    /// Stop accepting publishes and wake every blocked producer.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.space.notify_waiters();
        self.data.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
