//! Property-based tests for audit chain verification
//!
//! A partition is built from a run of sealed events, then exactly one record
//! is altered (or removed) directly in the durable store, bypassing the
//! ledger. Verification must name the first record whose link no longer
//! holds, whatever field was touched.
//!
//! These tests cover:
//!
//! 1. An untouched partition always verifies
//! 2. Any single-field edit is caught at the edited record
//! 3. Removing a record from the middle is reported as a sequence gap
//! 4. Dropping the newest records is reported as truncation
//!
//! Service wiring (authorization, idempotency) is exercised by the scenario
//! tests, not here.

use chrono::Duration;
use command_ledger::{
    audit::{AuditDraft, AuditEvent, AuditLedger, AuditResult, Fault, Verification},
    auth::ActorType,
    clock::{Clock, ManualClock, TimeStamp},
    mirror::{DualStoreMirror, MirrorMode},
    store::{Durable, InMemoryStore, WriteBatch},
};
use proptest::prelude::*;
use std::sync::Arc;

const DAY: &str = "2026-03-01";
const NAMESPACE: &str = "audit-test";

/// A single after-the-fact edit to one sealed event
#[derive(Debug, Clone)]
enum Tamper {
    ActorId(String),
    Action(String),
    Reason(String),
    Result,
    AfterState(u8),
    OccurredAt(i64),
    Sequence(u64),
    HashPrev,
    HashCurr,
}

impl Tamper {
    fn apply(&self, event: &mut AuditEvent) {
        match self {
            Tamper::ActorId(suffix) => event.actor_id.push_str(suffix),
            Tamper::Action(suffix) => event.action.push_str(suffix),
            Tamper::Reason(text) => event.reason = Some(format!("forged {text}")),
            Tamper::Result => {
                event.result = match event.result {
                    AuditResult::Success => AuditResult::Denied,
                    _ => AuditResult::Success,
                }
            }
            Tamper::AfterState(byte) => {
                event.after_state.get_or_insert_with(Vec::new).push(*byte);
            }
            Tamper::OccurredAt(secs) => {
                let moved = event.occurred_at.to_datetime_utc() + Duration::seconds(*secs);
                event.occurred_at = TimeStamp::from(moved);
            }
            Tamper::Sequence(delta) => event.sequence += delta,
            Tamper::HashPrev => event.hash_prev = sha256::digest("forged link"),
            Tamper::HashCurr => event.hash_curr = sha256::digest("forged hash"),
        }
    }
}

fn tamper_strategy() -> impl Strategy<Value = Tamper> {
    prop_oneof![
        "[a-z]{1,8}".prop_map(Tamper::ActorId),
        "[a-z]{1,8}".prop_map(Tamper::Action),
        "[a-z ]{0,16}".prop_map(Tamper::Reason),
        Just(Tamper::Result),
        any::<u8>().prop_map(Tamper::AfterState),
        (1i64..86_400).prop_map(Tamper::OccurredAt),
        (1u64..5).prop_map(Tamper::Sequence),
        Just(Tamper::HashPrev),
        Just(Tamper::HashCurr),
    ]
}

/// Strategy for a partition length and an index inside it
fn chain_and_target() -> impl Strategy<Value = (usize, usize)> {
    (1usize..8).prop_flat_map(|len| (Just(len), 0..len))
}

struct Partition {
    store: Arc<InMemoryStore>,
    mirror: DualStoreMirror,
    ledger: AuditLedger,
}

impl Partition {
    /// Seals `len` events one second apart, all on [`DAY`]
    fn sealed(len: usize) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let mut mirror = DualStoreMirror::durable(NAMESPACE, store.clone(), MirrorMode::Enabled);
        let ledger = AuditLedger::new();
        let clock = ManualClock::at(2026, 3, 1, 9, 0, 0);

        for n in 0..len {
            let draft = AuditDraft {
                occurred_at: clock.now(),
                actor_id: format!("op_{n}"),
                actor_type: ActorType::Operator,
                object_type: "config_change".into(),
                object_id: format!("chg_{n}"),
                action: "approve".into(),
                before_state: None,
                after_state: Some(vec![n as u8]),
                result: AuditResult::Success,
                reason: None,
            };
            let (_, batch) = ledger.stage(&mut mirror, draft, clock.now()).unwrap();
            mirror.write(batch).unwrap();
            clock.advance(Duration::seconds(1));
        }

        Self {
            store,
            mirror,
            ledger,
        }
    }

    /// Raw (key, bytes) rows of the partition, straight from the store
    fn rows(&self) -> Vec<(Vec<u8>, Vec<u8>)> {
        let prefix = format!("{NAMESPACE}/audit/{DAY}/");
        self.store.scan_prefix(prefix.as_bytes()).unwrap()
    }

    fn rewrite(&self, index: usize, tamper: &Tamper) -> String {
        let (key, bytes) = self.rows().remove(index);
        let mut event: AuditEvent = minicbor::decode(&bytes).unwrap();
        tamper.apply(&mut event);

        let mut batch = WriteBatch::default();
        batch.put(key, minicbor::to_vec(&event).unwrap());
        self.store.apply(&batch).unwrap();
        event.audit_id
    }

    fn remove(&self, indexes: impl IntoIterator<Item = usize>) {
        let rows = self.rows();
        let mut batch = WriteBatch::default();
        for index in indexes {
            batch.delete(rows[index].0.clone());
        }
        self.store.apply(&batch).unwrap();
    }

    fn verify(&mut self) -> Verification {
        self.ledger.verify(&mut self.mirror, DAY).unwrap()
    }
}

// PROPERTY TESTS
proptest! {
    /// Property: an untouched partition verifies and counts every event
    #[test]
    fn prop_untouched_partition_is_valid(len in 0usize..10) {
        let mut partition = Partition::sealed(len);
        prop_assert_eq!(
            partition.verify(),
            Verification::Valid { events: len },
            "Sealed partition should verify"
        );
    }

    /// Property: editing any field of any event is caught at that event
    ///
    /// Earlier events are still intact, so the first broken record is
    /// always the edited one regardless of which check trips.
    #[test]
    fn prop_single_edit_is_caught_at_edited_record(
        (len, target) in chain_and_target(),
        tamper in tamper_strategy(),
    ) {
        let mut partition = Partition::sealed(len);
        let audit_id = partition.rewrite(target, &tamper);

        match partition.verify() {
            Verification::Tampered { index, audit_id: reported, .. } => {
                prop_assert_eq!(index, target, "Should fail at the edited record");
                prop_assert_eq!(reported, audit_id, "Should name the edited record");
            }
            valid => prop_assert!(false, "Edit {:?} went unnoticed: {:?}", tamper, valid),
        }
    }

    /// Property: a record removed from the middle leaves a sequence gap
    #[test]
    fn prop_removed_middle_record_is_a_gap(
        (len, target) in (2usize..8).prop_flat_map(|len| (Just(len), 0..len - 1)),
    ) {
        let mut partition = Partition::sealed(len);
        partition.remove([target]);

        match partition.verify() {
            Verification::Tampered { index, fault, .. } => {
                prop_assert_eq!(index, target, "Gap should be reported where it starts");
                prop_assert_eq!(fault, Fault::SequenceGap);
            }
            valid => prop_assert!(false, "Removal went unnoticed: {:?}", valid),
        }
    }

    /// Property: dropping the newest records is detected through the head
    #[test]
    fn prop_dropped_tail_is_truncation(
        (len, dropped) in (1usize..8).prop_flat_map(|len| (Just(len), 1..=len)),
    ) {
        let mut partition = Partition::sealed(len);
        partition.remove(len - dropped..len);

        match partition.verify() {
            Verification::Tampered { fault, .. } => {
                prop_assert_eq!(fault, Fault::Truncated);
            }
            valid => prop_assert!(false, "Truncation went unnoticed: {:?}", valid),
        }
    }
}

/// Other partitions are unaffected by tampering with one day
#[test]
fn tampering_is_scoped_to_its_partition() {
    let mut partition = Partition::sealed(3);
    partition.rewrite(1, &Tamper::Result);

    assert!(!partition.verify().is_valid());
    assert_eq!(
        partition.ledger.verify(&mut partition.mirror, "2026-03-02").unwrap(),
        Verification::Valid { events: 0 }
    );
}
