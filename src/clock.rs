//! Injectable time source and the persisted timestamp type
use crate::error::StoreError;
use chrono::{DateTime, Duration, SecondsFormat, TimeZone, Utc};
use std::sync::Mutex;

/// Source of the current time. Every timestamp the crate records flows from here.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }
    pub fn at(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Self::new(TimeStamp::new_with(year, month, day, hour, min, sec).to_datetime_utc())
    }
    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|p| p.into_inner()) = to;
    }
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(|p| p.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Clone, Copy, Hash)]
pub struct TimeStamp(DateTime<Utc>);

impl TimeStamp {
    pub fn new_with(year: i32, month: u32, day: u32, hour: u32, min: u32, sec: u32) -> Self {
        Utc.with_ymd_and_hms(year, month, day, hour, min, sec)
            .single()
            .unwrap_or_default()
            .into()
    }
    pub fn to_datetime_utc(&self) -> DateTime<Utc> {
        self.0
    }
    /// Calendar day bucket, `YYYY-MM-DD`
    pub fn partition_day(&self) -> String {
        self.0.format("%Y-%m-%d").to_string()
    }
    pub fn is_after(&self, other: &DateTime<Utc>) -> bool {
        self.0 > *other
    }
}

impl From<DateTime<Utc>> for TimeStamp {
    fn from(value: DateTime<Utc>) -> Self {
        TimeStamp(value)
    }
}

/// `at + by`, refusing to leave chrono's representable range.
pub fn later(at: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>, StoreError> {
    at.checked_add_signed(by)
        .ok_or_else(|| StoreError::TimeOutOfRange(format!("{at} + {by}")))
}

/// `at - by`, refusing to leave chrono's representable range.
pub fn earlier(at: DateTime<Utc>, by: Duration) -> Result<DateTime<Utc>, StoreError> {
    at.checked_sub_signed(by)
        .ok_or_else(|| StoreError::TimeOutOfRange(format!("{at} - {by}")))
}

/// Fixed nanosecond-precision RFC 3339 rendering used for `server_time`.
pub fn format_server_time(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl<C> minicbor::Encode<C> for TimeStamp {
    fn encode<W: minicbor::encode::Write>(
        &self,
        e: &mut minicbor::Encoder<W>,
        _: &mut C,
    ) -> Result<(), minicbor::encode::Error<W::Error>> {
        if let Some(nsec) = self.0.timestamp_nanos_opt() {
            return e.i64(nsec)?.ok();
        }

        Err(minicbor::encode::Error::message(
            "failed to encode timestamp. timestamp_nanos_opt returned None",
        ))
    }
}

impl<'b, C> minicbor::Decode<'b, C> for TimeStamp {
    fn decode(d: &mut minicbor::Decoder<'b>, _: &mut C) -> Result<Self, minicbor::decode::Error> {
        let nsecs = d.i64()?;

        Ok(TimeStamp(DateTime::from_timestamp_nanos(nsecs)))
    }
}
