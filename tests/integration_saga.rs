//! End-to-end transfer scenarios: two-phase saga, automatic compensation and
//! timeout-driven orphan recovery.

mod common;

use common::*;

use chrono::Utc;
use ring_ledger::domain::{tags, EventKind};
use ring_ledger::event_log::EventLog;
use ring_ledger::pipeline::CommandBus;
use ring_ledger::store::steps;
use rust_decimal::Decimal;

#[tokio::test]
async fn happy_path_transfer_moves_money_and_completes() {
    let stack = start_stack();

    stack.bus.publish(deposit("A", 1000, "SEED-A")).await.unwrap();
    stack.bus.publish(deposit("B", 200, "SEED-B")).await.unwrap();
    await_until("seeds applied", || async {
        read_model_balance(&stack, "B").await == Some(Decimal::new(200, 0))
    })
    .await;

    stack.bus.publish(transfer("A", "B", 150, "T3")).await.unwrap();

    // Phase 1: the withdraw lands on A's stream.
    await_until("withdraw journaled on A", || {
        let log = stack.log.clone();
        async move {
            log.read_stream("Account-A", 0)
                .await
                .map(|records| {
                    records
                        .iter()
                        .any(|r| r.event.transaction_id == "T3" && r.event.kind == EventKind::Withdraw)
                })
                .unwrap_or(false)
        }
    })
    .await;

    // Phase 2: the saga's deposit lands on B's stream with the transfer tag
    // and the original source recorded as the refund target.
    await_until("saga deposit journaled on B", || {
        let log = stack.log.clone();
        async move {
            log.read_stream("Account-B", 0)
                .await
                .map(|records| {
                    records.iter().any(|r| {
                        r.event.transaction_id == "T3"
                            && r.event.kind == EventKind::Deposit
                            && r.event.description == tags::TRANSFER_DEPOSIT
                            && r.event.target_id.as_deref() == Some("A")
                    })
                })
                .unwrap_or(false)
        }
    })
    .await;

    await_until("read model A=850, B=350", || async {
        read_model_balance(&stack, "A").await == Some(Decimal::new(850, 0))
            && read_model_balance(&stack, "B").await == Some(Decimal::new(350, 0))
    })
    .await;

    await_until("transfer completed", || async {
        recorded_steps(&stack, "T3").await.contains(&steps::COMPLETE.to_string())
    })
    .await;

    let recorded = recorded_steps(&stack, "T3").await;
    assert!(recorded.contains(&steps::INIT.to_string()));
    assert!(!recorded.contains(&steps::COMPENSATION.to_string()));
}

#[tokio::test]
async fn failing_transfer_is_compensated_automatically() {
    let stack = start_stack();

    stack.bus.publish(deposit("A", 1000, "SEED-A")).await.unwrap();
    await_until("seed applied", || async {
        read_model_balance(&stack, "A").await == Some(Decimal::new(1000, 0))
    })
    .await;

    // C does not exist; the transfer deposit will be rejected.
    stack.bus.publish(transfer("A", "C", 200, "T4")).await.unwrap();

    // The rejected deposit shows up as a FAIL fact on C's stream.
    await_until("FAIL fact journaled on C", || {
        let log = stack.log.clone();
        async move {
            log.read_stream("Account-C", 0)
                .await
                .map(|records| {
                    records.iter().any(|r| {
                        r.event.transaction_id == "T4"
                            && r.event.kind == EventKind::Fail
                            && r.event.description == tags::TRANSFER_DEPOSIT
                    })
                })
                .unwrap_or(false)
        }
    })
    .await;

    // Compensation: the refund deposit restores A.
    await_until("compensation recorded", || async {
        recorded_steps(&stack, "T4").await.contains(&steps::COMPENSATION.to_string())
    })
    .await;
    await_until("A restored to 1000", || async {
        read_model_balance(&stack, "A").await == Some(Decimal::new(1000, 0))
    })
    .await;

    let refund = stack
        .log
        .read_stream("Account-A", 0)
        .await
        .unwrap()
        .into_iter()
        .find(|r| r.event.kind == EventKind::Deposit && r.event.description == tags::COMPENSATION)
        .expect("refund fact");
    assert_eq!(refund.event.transaction_id, "T4");
    assert_eq!(refund.event.amount, Decimal::new(200, 0));

    // C never materialises in the read model.
    assert_eq!(read_model_balance(&stack, "C").await, None);

    let recorded = recorded_steps(&stack, "T4").await;
    assert!(recorded.contains(&steps::INIT.to_string()));
    assert!(recorded.contains(&steps::COMPENSATION.to_string()));
}

#[tokio::test]
async fn orphaned_transfer_is_recovered_by_the_watcher() {
    let stack = start_stack();

    stack.bus.publish(deposit("A", 1000, "SEED-A")).await.unwrap();
    await_until("seed applied", || async {
        read_model_balance(&stack, "A").await == Some(Decimal::new(1000, 0))
    })
    .await;

    // The drill tag keeps the saga silent, simulating a crash after phase 1.
    let orphaned = transfer("A", "B999", 100, "T5").with_description(tags::SAGA_BYPASS);
    stack.bus.publish(orphaned).await.unwrap();

    await_until("orphan withdraw journaled", || {
        let log = stack.log.clone();
        async move {
            log.read_stream("Account-A", 0)
                .await
                .map(|records| records.iter().any(|r| r.event.transaction_id == "T5"))
                .unwrap_or(false)
        }
    })
    .await;

    // Simulate the INIT row aged past the timeout threshold.
    stack.idempotency.mark_with_timestamp(
        "T5",
        steps::INIT,
        Utc::now() - chrono::Duration::seconds(60),
    );

    stack.watcher.tick().await;

    // The saga completes compensation from the reconstructed trigger.
    await_until("compensation recorded for T5", || async {
        recorded_steps(&stack, "T5").await.contains(&steps::COMPENSATION.to_string())
    })
    .await;

    await_until("A restored after refund", || async {
        read_model_balance(&stack, "A").await == Some(Decimal::new(1000, 0))
    })
    .await;

    let recorded = recorded_steps(&stack, "T5").await;
    assert!(recorded.contains(&steps::INIT.to_string()));
    assert!(recorded.contains(&steps::COMPENSATION.to_string()));
}

#[tokio::test]
async fn transfer_balance_changes_always_sum_to_zero() {
    let stack = start_stack();

    stack.bus.publish(deposit("A", 500, "SEED-A")).await.unwrap();
    stack.bus.publish(deposit("B", 500, "SEED-B")).await.unwrap();
    await_until("seeds applied", || async {
        read_model_balance(&stack, "A").await == Some(Decimal::new(500, 0))
            && read_model_balance(&stack, "B").await == Some(Decimal::new(500, 0))
    })
    .await;

    for i in 0..5 {
        stack
            .bus
            .publish(transfer("A", "B", 20, &format!("TX-{i}")))
            .await
            .unwrap();
    }

    await_until("all transfers completed", || async {
        let mut done = true;
        for i in 0..5 {
            done &= recorded_steps(&stack, &format!("TX-{i}"))
                .await
                .contains(&steps::COMPLETE.to_string());
        }
        done
    })
    .await;

    await_until("conservation holds", || async {
        let a = read_model_balance(&stack, "A").await.unwrap_or_default();
        let b = read_model_balance(&stack, "B").await.unwrap_or_default();
        a + b == Decimal::new(1000, 0) && a == Decimal::new(400, 0)
    })
    .await;
}
