//! Failure lockout and sliding attempt window for credential checks
//!
//! Both counters live in the service's store through the bookkeeping lane of
//! a [`Tx`], so they persist on denial and survive restarts when the store
//! is durable.
use crate::clock::{TimeStamp, earlier, later};
use crate::config::{LockoutConfig, RateWindowConfig};
use crate::error::StoreError;
use crate::mirror::Tx;
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
pub struct FailureCounter {
    #[n(0)]
    pub failures: u32,
    #[n(1)]
    pub locked_until: Option<TimeStamp>,
}

#[derive(Debug, Clone)]
pub struct LockoutPolicy {
    threshold: u32,
    ttl: Duration,
}

fn lockout_key(actor_id: &str) -> String {
    format!("lockout/{actor_id}")
}

impl LockoutPolicy {
    pub fn new(threshold: u32, ttl: Duration) -> Self {
        Self { threshold, ttl }
    }

    pub fn from_config(config: &LockoutConfig) -> Self {
        Self::new(config.threshold, config.ttl())
    }

    /// Returns the lock expiry while the actor is locked out. An expired lock
    /// is cleared so counting starts over.
    pub fn locked_until(
        &self,
        tx: &mut Tx<'_>,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let key = lockout_key(actor_id);
        let Some(counter) = tx.get::<FailureCounter>(&key)? else {
            return Ok(None);
        };
        match counter.locked_until {
            Some(until) if until.is_after(&now) => Ok(Some(until.to_datetime_utc())),
            Some(_) => {
                tx.record(&key, &FailureCounter::default())?;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Counts a failed check. Returns the lock expiry once the threshold is hit.
    pub fn record_failure(
        &self,
        tx: &mut Tx<'_>,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, StoreError> {
        let key = lockout_key(actor_id);
        let mut counter = tx.get::<FailureCounter>(&key)?.unwrap_or_default();
        counter.failures = counter.failures.saturating_add(1);
        if counter.failures >= self.threshold {
            let until = later(now, self.ttl)?;
            counter.locked_until = Some(until.into());
            tracing::warn!(actor_id, failures = counter.failures, %until, "actor locked out");
        }
        tx.record(&key, &counter)?;
        Ok(counter.locked_until.map(|t| t.to_datetime_utc()))
    }

    pub fn record_success(&self, tx: &mut Tx<'_>, actor_id: &str) -> Result<(), StoreError> {
        let key = lockout_key(actor_id);
        if tx.get::<FailureCounter>(&key)?.is_some_and(|c| c != FailureCounter::default()) {
            tx.record(&key, &FailureCounter::default())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, minicbor::Encode, minicbor::Decode)]
struct AttemptLog {
    #[n(0)]
    attempts: Vec<TimeStamp>, // oldest first
}

#[derive(Debug, Clone)]
pub struct RateWindow {
    max_attempts: u32,
    window: Duration,
}

fn rate_key(actor_id: &str) -> String {
    format!("rate/{actor_id}")
}

impl RateWindow {
    pub fn new(max_attempts: u32, window: Duration) -> Self {
        Self {
            max_attempts,
            window,
        }
    }

    pub fn from_config(config: &RateWindowConfig) -> Self {
        Self::new(config.max_attempts, config.window())
    }

    /// Records an attempt unless the window is already full. Returns `false`
    /// when the attempt must be refused.
    pub fn try_acquire(
        &self,
        tx: &mut Tx<'_>,
        actor_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let key = rate_key(actor_id);
        let mut log = tx.get::<AttemptLog>(&key)?.unwrap_or_default();

        let cutoff = earlier(now, self.window)?;
        log.attempts.retain(|at| at.is_after(&cutoff));

        if log.attempts.len() >= self.max_attempts as usize {
            tracing::debug!(actor_id, attempts = log.attempts.len(), "rate window full");
            return Ok(false);
        }
        log.attempts.push(now.into());
        tx.record(&key, &log)?;
        Ok(true)
    }
}
