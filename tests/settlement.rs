mod common;

use common::{harness, harness_with_retries, units, T0};
use ethers::signers::Signer;
use ethers::types::Address;
use tokio_test::assert_ok;

use intent_settlement::htlc::HtlcState;
use intent_settlement::intent::IntentStatus;
use intent_settlement::swap::SwapStatus;
use intent_settlement::SettlementError;

#[tokio::test]
async fn test_eth_to_matic_happy_path() {
    let h = harness().await;
    let params = h.eth_to_matic(1);
    let signature = h.sign(&params).await;
    let intent_id = h.intents.create_intent(params, signature).await.unwrap();

    let p1 = h.proposal(intent_id, h.solver, "2100", "0.005", 80);
    let low = h.proposal(intent_id, Address::repeat_byte(0x51), "1999", "0.001", 99);
    let greedy = h.proposal(intent_id, Address::repeat_byte(0x52), "2300", "0.05", 99);
    assert!(h.intents.submit_proposal(intent_id, p1).await.unwrap());
    assert!(!h.intents.submit_proposal(intent_id, low).await.unwrap());
    assert!(!h.intents.submit_proposal(intent_id, greedy).await.unwrap());

    let ranked = h.intents.rank_proposals(intent_id).await.unwrap();
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked[0].solver, h.solver);

    assert!(h.intents.accept_proposal(intent_id, h.solver).await.unwrap());
    let status = h.engine.settle_intent(intent_id).await.unwrap();
    assert_eq!(status, SwapStatus::Completed);

    let record = h.intents.get_intent(intent_id).await.unwrap();
    assert_eq!(record.status, IntentStatus::Completed);
    let swap = h.swaps.get_swap(record.swap_id.unwrap()).await.unwrap();
    assert_eq!(swap.intent_id, Some(intent_id));
    assert_eq!(swap.initiator.timelock, T0 + 3600);
    assert_eq!(swap.participant.timelock, T0 + 1800);
    assert_eq!(swap.initiator.state, Some(HtlcState::Redeemed));
    assert_eq!(swap.participant.state, Some(HtlcState::Redeemed));

    assert_eq!(h.dest.balance_of(h.matic, h.user.address()).await, units(2_100));
    assert_eq!(h.source.balance_of(h.eth, h.solver).await, units(1));
    assert_eq!(h.source.balance_of(h.eth, h.user.address()).await, units(9));
}

#[tokio::test]
async fn test_execution_is_idempotent() {
    let h = harness().await;
    let intent_id = h.accepted_intent(1).await;
    assert_ok!(h.engine.settle_intent(intent_id).await);
    let submitted = h.source.transaction_count().await;

    let err = h.engine.execute_intent(intent_id).await.unwrap_err();
    assert!(matches!(err, SettlementError::StateMismatch { .. }));
    assert!(!h.intents.accept_proposal(intent_id, h.solver).await.unwrap());
    assert!(!h.intents.cancel_intent(intent_id).await.unwrap());

    assert_eq!(h.source.transaction_count().await, submitted);
    assert_eq!(h.source.balance_of(h.eth, h.user.address()).await, units(9));
}

#[tokio::test]
async fn test_refund_path_restores_both_sides() {
    let h = harness().await;
    let intent_id = h.accepted_intent(1).await;
    let swap_id = h.engine.execute_intent(intent_id).await.unwrap();
    h.swaps.lock_initiator_funds(swap_id).await.unwrap();
    h.swaps.lock_participant_funds(swap_id).await.unwrap();

    // nobody claims; nothing is refundable before the timelocks
    h.set_time(T0 + 1799).await;
    let err = h.swaps.refund_participant(swap_id).await.unwrap_err();
    assert!(matches!(err, SettlementError::TimelockNotExpired { .. }));

    h.set_time(T0 + 3600).await;
    let report = h.engine.recover_once().await.unwrap();
    assert_eq!(report.refunded, 2);
    assert_eq!(report.intents_closed, 1);

    let swap = h.swaps.get_swap(swap_id).await.unwrap();
    assert_eq!(swap.status, SwapStatus::Refunded);
    assert!(swap.is_settled());
    assert_eq!(
        h.intents.get_intent(intent_id).await.unwrap().status,
        IntentStatus::Failed
    );
    assert_eq!(h.source.balance_of(h.eth, h.user.address()).await, units(10));
    assert_eq!(h.dest.balance_of(h.matic, h.solver).await, units(5_000));
}

#[tokio::test]
async fn test_participant_lock_failure_refunds_initiator() {
    let h = harness().await;
    let intent_id = h.accepted_intent(1).await;

    h.dest.fail_next_submissions(1).await;
    let err = h.engine.settle_intent(intent_id).await.unwrap_err();
    assert!(err.is_retryable());

    let record = h.intents.get_intent(intent_id).await.unwrap();
    assert_eq!(record.status, IntentStatus::Failed);
    let swap_id = record.swap_id.unwrap();
    let swap = h.swaps.get_swap(swap_id).await.unwrap();
    assert_eq!(swap.status, SwapStatus::Failed);
    assert!(swap.initiator.holds_funds());
    assert_eq!(swap.participant.lock_id, None);

    // the initiator leg waits for its own timelock
    h.set_time(T0 + 1800).await;
    assert_eq!(h.engine.recover_once().await.unwrap().refunded, 0);

    h.set_time(T0 + 3600).await;
    assert_eq!(h.engine.recover_once().await.unwrap().refunded, 1);
    assert!(h.swaps.get_swap(swap_id).await.unwrap().is_settled());
    assert_eq!(h.source.balance_of(h.eth, h.user.address()).await, units(10));
}

#[tokio::test]
async fn test_recovery_completes_revealed_swap() {
    let h = harness().await;
    let intent_id = h.accepted_intent(1).await;
    let swap_id = h.engine.execute_intent(intent_id).await.unwrap();
    h.swaps.lock_initiator_funds(swap_id).await.unwrap();
    h.swaps.lock_participant_funds(swap_id).await.unwrap();
    h.swaps.redeem_participant(swap_id).await.unwrap();

    // stopped after the reveal, before the initiator leg was claimed
    h.set_time(T0 + 2400).await;
    let report = h.engine.recover_once().await.unwrap();
    assert_eq!(report.completed, 1);
    assert_eq!(report.refunded, 0);
    assert_eq!(report.intents_closed, 1);

    assert_eq!(
        h.swaps.get_swap(swap_id).await.unwrap().status,
        SwapStatus::Completed
    );
    assert_eq!(
        h.intents.get_intent(intent_id).await.unwrap().status,
        IntentStatus::Completed
    );
    assert_eq!(h.source.balance_of(h.eth, h.solver).await, units(1));
}

#[tokio::test]
async fn test_atomicity_across_outcomes() {
    // completed: both sides received; refunded: both sides restored
    for complete in [true, false] {
        let h = harness().await;
        let intent_id = h.accepted_intent(1).await;
        let swap_id = h.engine.execute_intent(intent_id).await.unwrap();
        h.swaps.lock_initiator_funds(swap_id).await.unwrap();
        h.swaps.lock_participant_funds(swap_id).await.unwrap();

        if complete {
            h.swaps.redeem_participant(swap_id).await.unwrap();
            h.swaps.complete_from_chain(swap_id).await.unwrap();
        } else {
            h.set_time(T0 + 3600).await;
            h.swaps.refund_expired().await.unwrap();
        }

        let swap = h.swaps.get_swap(swap_id).await.unwrap();
        let states = (swap.initiator.state, swap.participant.state);
        let expected = if complete {
            HtlcState::Redeemed
        } else {
            HtlcState::Refunded
        };
        assert_eq!(states, (Some(expected), Some(expected)));

        let user_matic = h.dest.balance_of(h.matic, h.user.address()).await;
        let solver_eth = h.source.balance_of(h.eth, h.solver).await;
        assert_eq!(user_matic.is_zero(), solver_eth.is_zero());
    }
}

#[tokio::test]
async fn test_lost_lock_response_is_adopted_under_retries() {
    let h = harness_with_retries().await;
    let intent_id = h.accepted_intent(1).await;

    h.source.land_then_fail_next(1).await;
    let status = h.engine.settle_intent(intent_id).await.unwrap();
    assert_eq!(status, SwapStatus::Completed);

    // funds left the user exactly once
    assert_eq!(h.source.balance_of(h.eth, h.user.address()).await, units(9));
    assert_eq!(h.source.balance_of(h.eth, h.solver).await, units(1));
}

#[tokio::test]
async fn test_transient_failures_are_retried() {
    let h = harness_with_retries().await;
    let intent_id = h.accepted_intent(1).await;

    h.source.fail_next_submissions(2).await;
    h.dest.fail_next_submissions(2).await;
    let status = h.engine.settle_intent(intent_id).await.unwrap();
    assert_eq!(status, SwapStatus::Completed);
}

#[tokio::test]
async fn test_cancelled_intent_cannot_execute() {
    let h = harness().await;
    let params = h.eth_to_matic(7);
    let signature = h.sign(&params).await;
    let intent_id = h
        .intents
        .create_intent(params.clone(), signature.clone())
        .await
        .unwrap();

    assert!(h.intents.cancel_intent(intent_id).await.unwrap());
    assert!(matches!(
        h.engine.execute_intent(intent_id).await,
        Err(SettlementError::IntentNotFound(_))
    ));
    // the same signed intent cannot be replayed
    assert!(matches!(
        h.intents.create_intent(params, signature).await,
        Err(SettlementError::StateMismatch { .. })
    ));
}
