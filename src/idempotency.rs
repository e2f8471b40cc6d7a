//! Cached command outcomes keyed by `(scope, idempotency key)`
use crate::clock::{TimeStamp, later};
use crate::envelope::ResultCode;
use crate::error::StoreError;
use crate::mirror::DualStoreMirror;
use crate::store::WriteBatch;
use crate::utils::{from_cbor, to_cbor};
use chrono::{DateTime, Duration, Utc};

const PREFIX: &str = "idem/";

#[derive(Debug, Clone, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct IdempotencyRecord {
    #[n(0)]
    pub scope: String, // aggregate + operation, e.g. "acct_1|deposit"
    #[n(1)]
    pub key: String,
    #[n(2)]
    pub request_fingerprint: String,
    #[n(3)]
    #[cbor(with = "minicbor::bytes")]
    pub response_payload: Vec<u8>, // the encoded response envelope
    #[n(4)]
    pub result_code: ResultCode,
    #[n(5)]
    pub created_at: TimeStamp,
    #[n(6)]
    pub expires_at: TimeStamp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Miss,
    Hit(IdempotencyRecord),
    /// A record exists for the key but was stored for a different request.
    Conflict { stored_fingerprint: String },
}

#[derive(Debug, Clone)]
pub struct IdempotencyStore {
    ttl: Duration,
}

// length prefixed so that no two (scope, key) pairs share a storage key
fn storage_key(scope: &str, key: &str) -> String {
    format!("{PREFIX}{}:{scope}{key}", scope.len())
}

impl IdempotencyStore {
    pub fn new(ttl: Duration) -> Self {
        Self { ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Must be called inside the owning service's critical section.
    pub fn lookup(
        &self,
        mirror: &mut DualStoreMirror,
        scope: &str,
        key: &str,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<Lookup, StoreError> {
        let Some(record) = mirror.get::<IdempotencyRecord>(&storage_key(scope, key))? else {
            return Ok(Lookup::Miss);
        };
        if !record.expires_at.is_after(&now) {
            // awaiting the cleanup sweep
            return Ok(Lookup::Miss);
        }
        if record.request_fingerprint != fingerprint {
            return Ok(Lookup::Conflict {
                stored_fingerprint: record.request_fingerprint,
            });
        }
        Ok(Lookup::Hit(record))
    }

    /// Builds the write for a freshly decided command. The caller commits it
    /// in the same atomic batch as the mutation and the audit event.
    pub fn stage(
        &self,
        scope: &str,
        key: &str,
        fingerprint: &str,
        response_payload: Vec<u8>,
        result_code: ResultCode,
        now: DateTime<Utc>,
    ) -> Result<WriteBatch, StoreError> {
        let record = IdempotencyRecord {
            scope: scope.to_string(),
            key: key.to_string(),
            request_fingerprint: fingerprint.to_string(),
            response_payload,
            result_code,
            created_at: now.into(),
            expires_at: later(now, self.ttl)?.into(),
        };
        let mut batch = WriteBatch::default();
        batch.put(storage_key(scope, key), to_cbor(&record)?);
        Ok(batch)
    }

    /// Deletes every record whose expiry has passed and returns how many went.
    pub fn purge_expired(
        &self,
        mirror: &mut DualStoreMirror,
        now: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let mut batch = WriteBatch::default();
        for (key, bytes) in mirror.scan(PREFIX)? {
            let record: IdempotencyRecord = from_cbor(key.as_bytes(), &bytes)?;
            if !record.expires_at.is_after(&now) {
                batch.delete(key);
            }
        }
        let purged = batch.len();
        mirror.write(batch)?;
        tracing::info!(purged, "idempotency cleanup sweep finished");
        Ok(purged)
    }
}
