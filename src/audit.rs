//! Append-only, hash-chained audit ledger partitioned by calendar day
//!
//! Every event stores `hash_curr = sha256(hash_prev || cbor(event without hashes))`.
//! The first event of a partition links to [`GENESIS_HASH`]. A per-partition
//! head record tracks the newest link so that dropping the tail of a
//! partition is detected as well as editing or forging records.
use crate::auth::ActorType;
use crate::clock::TimeStamp;
use crate::error::StoreError;
use crate::mirror::DualStoreMirror;
use crate::store::WriteBatch;
use crate::utils::{from_cbor, new_id, to_cbor};
use chrono::{DateTime, Utc};

pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

const EVENT_PREFIX: &str = "audit/";
const HEAD_PREFIX: &str = "audit-head/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub enum AuditResult {
    #[n(0)]
    Success,
    #[n(1)]
    Denied,
    #[n(2)]
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct AuditEvent {
    #[n(0)]
    pub audit_id: String,
    #[n(1)]
    pub occurred_at: TimeStamp,
    #[n(2)]
    pub recorded_at: TimeStamp,
    #[n(3)]
    pub actor_id: String,
    #[n(4)]
    pub actor_type: ActorType,
    #[n(5)]
    pub object_type: String,
    #[n(6)]
    pub object_id: String,
    #[n(7)]
    pub action: String,
    #[n(8)]
    pub before_state: Option<Vec<u8>>, // cbor snapshot of the aggregate
    #[n(9)]
    pub after_state: Option<Vec<u8>>,
    #[n(10)]
    pub result: AuditResult,
    #[n(11)]
    pub reason: Option<String>,
    #[n(12)]
    pub partition_day: String,
    #[n(13)]
    pub sequence: u64, // append position within the partition
    #[n(14)]
    pub hash_prev: String,
    #[n(15)]
    pub hash_curr: String,
}

/// What the executor knows about a command outcome before it is sealed.
#[derive(Debug, Clone)]
pub struct AuditDraft {
    pub occurred_at: DateTime<Utc>,
    pub actor_id: String,
    pub actor_type: ActorType,
    pub object_type: String,
    pub object_id: String,
    pub action: String,
    pub before_state: Option<Vec<u8>>,
    pub after_state: Option<Vec<u8>>,
    pub result: AuditResult,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
struct ChainHead {
    #[n(0)]
    next_sequence: u64,
    #[n(1)]
    last_hash: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// A field was changed after the event was sealed.
    HashMismatch,
    /// `hash_prev` does not match the preceding event.
    BrokenLink,
    /// An event is missing from the middle of the partition.
    SequenceGap,
    /// Events are missing from the end of the partition.
    Truncated,
    Undecodable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid { events: usize },
    Tampered {
        index: usize,
        audit_id: String,
        fault: Fault,
    },
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        matches!(self, Verification::Valid { .. })
    }
}

impl AuditEvent {
    /// Recomputes the chained hash from the event's own fields.
    pub fn compute_hash(&self) -> Result<String, StoreError> {
        let mut body = self.clone();
        body.hash_prev.clear();
        body.hash_curr.clear();

        let mut contents = self.hash_prev.as_bytes().to_vec();
        contents.extend(to_cbor(&body)?);
        Ok(sha256::digest(&contents))
    }
}

fn event_key(day: &str, sequence: u64) -> String {
    // zero padded so key order is append order
    format!("{EVENT_PREFIX}{day}/{sequence:020}")
}

fn head_key(day: &str) -> String {
    format!("{HEAD_PREFIX}{day}")
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AuditLedger;

impl AuditLedger {
    pub fn new() -> Self {
        Self
    }

    /// Seals `draft` onto the tail of today's partition. Nothing is written:
    /// the returned batch carries the event and the advanced head, and must
    /// be committed atomically with the command's other writes.
    pub fn stage(
        &self,
        mirror: &mut DualStoreMirror,
        draft: AuditDraft,
        recorded_at: DateTime<Utc>,
    ) -> Result<(AuditEvent, WriteBatch), StoreError> {
        let recorded_at = TimeStamp::from(recorded_at);
        let day = recorded_at.partition_day();
        let head = mirror
            .get::<ChainHead>(&head_key(&day))?
            .unwrap_or_else(|| ChainHead {
                next_sequence: 0,
                last_hash: GENESIS_HASH.to_string(),
            });

        let mut event = AuditEvent {
            audit_id: new_id("audit")?,
            occurred_at: draft.occurred_at.into(),
            recorded_at,
            actor_id: draft.actor_id,
            actor_type: draft.actor_type,
            object_type: draft.object_type,
            object_id: draft.object_id,
            action: draft.action,
            before_state: draft.before_state,
            after_state: draft.after_state,
            result: draft.result,
            reason: draft.reason,
            partition_day: day.clone(),
            sequence: head.next_sequence,
            hash_prev: head.last_hash,
            hash_curr: String::new(),
        };
        event.hash_curr = event.compute_hash()?;

        let next = ChainHead {
            next_sequence: event.sequence + 1,
            last_hash: event.hash_curr.clone(),
        };
        let mut batch = WriteBatch::default();
        batch.put(event_key(&day, event.sequence), to_cbor(&event)?);
        batch.put(head_key(&day), to_cbor(&next)?);
        Ok((event, batch))
    }

    /// Events of one partition in append order.
    pub fn events(
        &self,
        mirror: &DualStoreMirror,
        day: &str,
    ) -> Result<Vec<AuditEvent>, StoreError> {
        mirror
            .scan(&format!("{EVENT_PREFIX}{day}/"))?
            .into_iter()
            .map(|(key, bytes)| from_cbor(key.as_bytes(), &bytes))
            .collect()
    }

    /// Walks a partition in append order and reports the first record whose
    /// hash or link does not hold.
    pub fn verify(
        &self,
        mirror: &mut DualStoreMirror,
        day: &str,
    ) -> Result<Verification, StoreError> {
        let rows = mirror.scan(&format!("{EVENT_PREFIX}{day}/"))?;
        let mut prev = GENESIS_HASH.to_string();
        let mut last_id = String::new();

        for (index, (key, bytes)) in rows.iter().enumerate() {
            let event: AuditEvent = match from_cbor(key.as_bytes(), bytes) {
                Ok(event) => event,
                Err(_) => return Ok(tampered(day, index, key.clone(), Fault::Undecodable)),
            };
            let fault = if event.sequence != index as u64 {
                Some(Fault::SequenceGap)
            } else if event.hash_prev != prev {
                Some(Fault::BrokenLink)
            } else if event.compute_hash()? != event.hash_curr {
                Some(Fault::HashMismatch)
            } else {
                None
            };
            if let Some(fault) = fault {
                return Ok(tampered(day, index, event.audit_id, fault));
            }
            prev = event.hash_curr;
            last_id = event.audit_id;
        }

        // the head always points at the newest sealed event
        let head = mirror.get::<ChainHead>(&head_key(day))?;
        let intact = match &head {
            Some(head) => head.next_sequence == rows.len() as u64 && head.last_hash == prev,
            None => rows.is_empty(),
        };
        if !intact {
            return Ok(tampered(day, rows.len().saturating_sub(1), last_id, Fault::Truncated));
        }

        Ok(Verification::Valid { events: rows.len() })
    }
}

fn tampered(day: &str, index: usize, audit_id: String, fault: Fault) -> Verification {
    tracing::warn!(day, index, audit_id = %audit_id, ?fault, "audit chain verification failed");
    Verification::Tampered {
        index,
        audit_id,
        fault,
    }
}
