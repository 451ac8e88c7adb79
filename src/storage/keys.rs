//! Textual keys for the persisted stat buckets.
//!
//! Every bucket row is addressed as `HOST:<host>:HOUR:<YYYY-MM-DD-HH>` or
//! `HOST:<host>:DAY:<YYYY-MM-DD>`. The host segment must not contain the
//! `:` separator; stamps are UTC.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::time::Duration;

use super::StoreError;

pub const HOST_PREFIX: &str = "HOST:";
pub const GEO_PREFIX: &str = "geo:";

const HOUR_STAMP_FMT: &str = "%Y-%m-%d-%H";
const DAY_STAMP_FMT: &str = "%Y-%m-%d";

/// Granularity of a persisted stat bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKind {
    Hour,
    Day,
}

impl BucketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketKind::Hour => "HOUR",
            BucketKind::Day => "DAY",
        }
    }

    /// Retention applied on every create/update of a bucket of this kind.
    pub fn ttl(&self) -> Duration {
        match self {
            BucketKind::Hour => Duration::from_secs(15 * 24 * 60 * 60),
            BucketKind::Day => Duration::from_secs(90 * 24 * 60 * 60),
        }
    }

    /// Format the bucket stamp for a point in time.
    pub fn stamp(&self, at: DateTime<Utc>) -> String {
        match self {
            BucketKind::Hour => at.format(HOUR_STAMP_FMT).to_string(),
            BucketKind::Day => at.format(DAY_STAMP_FMT).to_string(),
        }
    }
}

/// A decoded bucket key: which host, which window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketKey {
    pub kind: BucketKind,
    pub host: String,
    pub stamp: String,
}

impl BucketKey {
    /// Key for the bucket covering `at`.
    pub fn new(kind: BucketKind, host: &str, at: DateTime<Utc>) -> Self {
        Self {
            kind,
            host: host.to_string(),
            stamp: kind.stamp(at),
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}{}:{}:{}",
            HOST_PREFIX,
            self.host,
            self.kind.as_str(),
            self.stamp
        )
    }

    /// Parse a textual key back into its parts.
    ///
    /// The host segment is everything between the prefix and the kind
    /// marker; a host containing `:` is rejected rather than guessed at.
    pub fn decode(raw: &str) -> Result<Self, StoreError> {
        let bad = || StoreError::BadKey(raw.to_string());

        let rest = raw.strip_prefix(HOST_PREFIX).ok_or_else(bad)?;

        let (kind, host, stamp) = if let Some((host, stamp)) = rest.split_once(":HOUR:") {
            (BucketKind::Hour, host, stamp)
        } else if let Some((host, stamp)) = rest.split_once(":DAY:") {
            (BucketKind::Day, host, stamp)
        } else {
            return Err(bad());
        };

        if host.is_empty() || host.contains(':') {
            return Err(bad());
        }

        match kind {
            BucketKind::Hour => {
                NaiveDateTime::parse_from_str(&format!("{stamp}:00"), "%Y-%m-%d-%H:%M")
                    .map_err(|_| bad())?;
            }
            BucketKind::Day => {
                NaiveDate::parse_from_str(stamp, DAY_STAMP_FMT).map_err(|_| bad())?;
            }
        }

        Ok(Self {
            kind,
            host: host.to_string(),
            stamp: stamp.to_string(),
        })
    }

    /// The calendar date this bucket falls on (hour buckets drop the hour).
    pub fn date(&self) -> Option<NaiveDate> {
        let date_part = match self.kind {
            BucketKind::Hour => self.stamp.rsplit_once('-').map(|(d, _)| d)?,
            BucketKind::Day => self.stamp.as_str(),
        };
        NaiveDate::parse_from_str(date_part, DAY_STAMP_FMT).ok()
    }

    /// The hour component of an hourly bucket; `None` for daily buckets.
    pub fn hour(&self) -> Option<u32> {
        match self.kind {
            BucketKind::Hour => self
                .stamp
                .rsplit_once('-')
                .and_then(|(_, h)| h.parse::<u32>().ok()),
            BucketKind::Day => None,
        }
    }
}
