//! Property-based tests for the approval state machines
//!
//! The machines accept each event only from its single legal predecessor.
//! These properties drive random event sequences through the pure transition
//! functions and through the wager service, and check that stored state only
//! ever moves along a legal edge.
//!
//! These tests cover:
//!
//! 1. Terminal state stability - nothing leaves APPLIED, REJECTED, SETTLED or CANCELED
//! 2. Predecessor rule - APPLIED is only reachable from APPROVED
//! 3. Rejections carry a domain reason and never change state
//! 4. Service state matches a model fold of the same commands
//!
//! What these tests DON'T cover (deliberately):
//!
//! - Idempotent replay and audit integrity (see the scenario and audit suites)

use command_ledger::{
    ResultCode, Substrate,
    auth::{Actor, ActorType, Capability, RequestContext, StaticResolver},
    clock::ManualClock,
    machine::{ChangeEvent, ChangeStatus, Lifecycle, WagerEvent, WagerStatus},
    wager::{CancelWager, PlaceWager, SettleWager, WagerService},
};
use proptest::prelude::*;
use std::sync::Arc;

fn change_event_strategy() -> impl Strategy<Value = ChangeEvent> {
    prop_oneof![
        Just(ChangeEvent::Approve),
        Just(ChangeEvent::Apply),
        Just(ChangeEvent::Reject),
    ]
}

fn wager_event_strategy() -> impl Strategy<Value = WagerEvent> {
    prop_oneof![Just(WagerEvent::Settle), Just(WagerEvent::Cancel)]
}

/// Folds events over a machine, returning every state visited (the start
/// included) and the number of rejected events
fn walk<S: Lifecycle>(start: S, events: &[S::Event]) -> (Vec<S>, usize) {
    let mut visited = vec![start];
    let mut rejected = 0;
    let mut state = start;
    for event in events {
        match state.transition(*event) {
            Ok(next) => {
                state = next;
                visited.push(next);
            }
            Err(rejection) => {
                assert!(!rejection.reason.is_empty());
                rejected += 1;
            }
        }
    }
    (visited, rejected)
}

// PROPERTY TESTS
proptest! {
    /// Property: once a change is terminal every further event is rejected
    #[test]
    fn prop_terminal_change_is_stable(
        events in prop::collection::vec(change_event_strategy(), 0..=12),
    ) {
        let (visited, _) = walk(ChangeStatus::Proposed, &events);
        if let Some(first_terminal) = visited.iter().position(|s| s.is_terminal()) {
            prop_assert_eq!(
                first_terminal,
                visited.len() - 1,
                "Nothing may follow a terminal state"
            );
        }
    }

    /// Property: APPLIED is only ever entered from APPROVED
    #[test]
    fn prop_applied_requires_approval(
        events in prop::collection::vec(change_event_strategy(), 0..=12),
    ) {
        let (visited, _) = walk(ChangeStatus::Proposed, &events);
        for pair in visited.windows(2) {
            if pair[1] == ChangeStatus::Applied {
                prop_assert_eq!(pair[0], ChangeStatus::Approved, "Applied without approval");
            }
        }
    }

    /// Property: a wager takes at most one transition, out of PENDING
    #[test]
    fn prop_wager_moves_at_most_once(
        events in prop::collection::vec(wager_event_strategy(), 0..=8),
    ) {
        let (visited, rejected) = walk(WagerStatus::Pending, &events);
        prop_assert!(visited.len() <= 2, "Wager moved twice: {:?}", visited);
        prop_assert_eq!(visited.len() - 1 + rejected, events.len());
    }

    /// Property: the stored wager always equals the model fold, and a
    /// rejected command leaves the stored wager byte-for-byte unchanged
    #[test]
    fn prop_wager_service_matches_model(
        events in prop::collection::vec(wager_event_strategy(), 1..=6),
    ) {
        let resolver = StaticResolver::new().register(
            "cashier",
            Actor::new("svc_cashier", ActorType::Service)
                .with(Capability::WagerPlace)
                .with(Capability::WagerSettle)
                .with(Capability::WagerCancel),
        );
        let substrate = Substrate::new(
            Arc::new(ManualClock::at(2026, 3, 1, 9, 0, 0)),
            Arc::new(resolver),
        );
        let service = WagerService::new(&substrate);
        let ctx = RequestContext::new("req").as_actor("cashier");

        let placed = service.place(&ctx, PlaceWager {
            player_id: "player_1".into(),
            game_id: "blackjack".into(),
            stake: 50,
        });
        let wager_id = placed.into_payload().map(|w| w.wager_id);
        prop_assert!(wager_id.is_some(), "Placement should succeed");
        let wager_id = wager_id.unwrap_or_default();

        let mut model = WagerStatus::Pending;
        for event in events {
            let before = service.get_wager(&wager_id).unwrap();
            let response = match event {
                WagerEvent::Settle => service.settle(&ctx, SettleWager {
                    wager_id: wager_id.clone(),
                    payout: 75,
                    outcome_ref: "hand_1".into(),
                }),
                WagerEvent::Cancel => service.cancel(&ctx, CancelWager {
                    wager_id: wager_id.clone(),
                    reason: "table closed".into(),
                }),
            };
            let after = service.get_wager(&wager_id).unwrap();

            match model.transition(event) {
                Ok(next) => {
                    prop_assert_eq!(response.result_code, ResultCode::Ok);
                    model = next;
                }
                Err(rejection) => {
                    prop_assert_eq!(response.result_code, ResultCode::Denied);
                    prop_assert_eq!(response.reason(), rejection.reason);
                    prop_assert_eq!(&after, &before, "Rejected command changed the wager");
                }
            }
            prop_assert_eq!(after.map(|w| w.status), Some(model));
        }
    }
}
