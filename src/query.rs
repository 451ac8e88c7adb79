//! Read-only queries over the persisted stat buckets.
//!
//! Both queries enumerate keys, narrow them by their decoded stamp, and load
//! the surviving records. One malformed key or corrupt record is skipped
//! with a warning; only transport failures abort a query. Nothing here ever
//! writes to the store.

use chrono::NaiveDate;
use std::collections::HashMap;
use thiserror::Error;
use tracing::warn;

use crate::stats::HostStats;
use crate::storage::{BucketKey, BucketKind, RecordStore, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Granularity {
    Day,
    Hour,
}

impl Granularity {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "day" => Some(Granularity::Day),
            "hour" => Some(Granularity::Hour),
            _ => None,
        }
    }

    fn kind(self) -> BucketKind {
        match self {
            Granularity::Day => BucketKind::Day,
            Granularity::Hour => BucketKind::Hour,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("{0}")]
    BadArgs(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub type QueryResult = (Vec<String>, HashMap<String, HostStats>);

/// Buckets whose calendar date falls in `[from, to]` (equivalently the
/// half-open instant window `[from, to + 1 day)`), at the chosen
/// granularity, optionally narrowed to hosts containing `host_filter`.
pub async fn query_by_date(
    store: &RecordStore,
    from: NaiveDate,
    to: NaiveDate,
    host_filter: Option<&str>,
    granularity: Granularity,
) -> Result<QueryResult, QueryError> {
    if from > to {
        return Err(QueryError::BadArgs(
            "from_date must not be after to_date".to_string(),
        ));
    }

    let mut keys = store.scan_bucket_keys(granularity.kind(), host_filter).await?;
    keys.sort();

    load_matching(store, keys, |key| {
        key.date().is_some_and(|d| d >= from && d <= to)
    })
    .await
}

/// Hourly buckets of one date whose hour falls in `[from_hour, to_hour]`,
/// both ends inclusive.
pub async fn query_by_hour(
    store: &RecordStore,
    date: NaiveDate,
    from_hour: u32,
    to_hour: u32,
) -> Result<QueryResult, QueryError> {
    validate_hours(from_hour, to_hour).map_err(QueryError::BadArgs)?;

    let stamp = date.format("%Y-%m-%d").to_string();
    let mut keys = store.scan_hour_keys_for_date(&stamp).await?;
    keys.sort();

    load_matching(store, keys, |key| {
        key.hour().is_some_and(|h| h >= from_hour && h <= to_hour)
    })
    .await
}

pub fn validate_hours(from_hour: u32, to_hour: u32) -> Result<(), String> {
    if from_hour > 23 || to_hour > 23 {
        return Err("hours must be between 0 and 23".to_string());
    }
    if from_hour > to_hour {
        return Err("from_hour must not be after to_hour".to_string());
    }
    Ok(())
}

async fn load_matching<F>(
    store: &RecordStore,
    keys: Vec<String>,
    retain: F,
) -> Result<QueryResult, QueryError>
where
    F: Fn(&BucketKey) -> bool,
{
    let mut retained = Vec::new();
    let mut records = HashMap::new();

    for raw in keys {
        let key = match BucketKey::decode(&raw) {
            Ok(key) => key,
            Err(_) => {
                warn!("skipping malformed bucket key {raw}");
                continue;
            }
        };
        if !retain(&key) {
            continue;
        }

        match store.get_host_stats(&raw).await {
            Ok(Some(stats)) => {
                retained.push(raw.clone());
                records.insert(raw, stats);
            }
            // Expired between scan and load.
            Ok(None) => {}
            Err(StoreError::Corrupt { key, .. }) => {
                warn!("skipping corrupt record at {key}");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Ok((retained, records))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn granularity_parses_known_values_only() {
        assert_eq!(Granularity::parse("day"), Some(Granularity::Day));
        assert_eq!(Granularity::parse("hour"), Some(Granularity::Hour));
        assert_eq!(Granularity::parse("week"), None);
        assert_eq!(Granularity::parse("Day"), None);
    }

    #[test]
    fn hour_validation() {
        assert!(validate_hours(0, 23).is_ok());
        assert!(validate_hours(10, 16).is_ok());
        assert!(validate_hours(5, 5).is_ok());
        assert!(validate_hours(24, 25).is_err());
        assert!(validate_hours(0, 24).is_err());
        assert!(validate_hours(16, 10).is_err(), "reversed range");
    }

    #[test]
    fn date_window_retention_drops_hour_component() {
        let from = NaiveDate::from_ymd_opt(2024, 3, 22).unwrap();
        let to = NaiveDate::from_ymd_opt(2024, 3, 23).unwrap();
        let in_range = |raw: &str| {
            let key = BucketKey::decode(raw).unwrap();
            key.date().is_some_and(|d| d >= from && d <= to)
        };

        assert!(in_range("HOST:example.com:HOUR:2024-03-22-00"));
        assert!(in_range("HOST:example.com:HOUR:2024-03-23-23"));
        assert!(in_range("HOST:example.com:DAY:2024-03-22"));
        assert!(!in_range("HOST:example.com:HOUR:2024-03-21-23"));
        assert!(!in_range("HOST:example.com:DAY:2024-03-24"));
    }

    #[test]
    fn hour_window_retention_is_inclusive() {
        let retain = |raw: &str, from: u32, to: u32| {
            let key = BucketKey::decode(raw).unwrap();
            key.hour().is_some_and(|h| h >= from && h <= to)
        };

        assert!(retain("HOST:example.com:HOUR:2024-03-22-10", 10, 16));
        assert!(retain("HOST:example.com:HOUR:2024-03-22-16", 10, 16));
        assert!(!retain("HOST:example.com:HOUR:2024-03-22-09", 10, 16));
        assert!(!retain("HOST:example.com:HOUR:2024-03-22-17", 10, 16));
    }
}
