//! Persistent record store backed by Redis.
//!
//! Host-stat buckets and geolocation records are stored as JSON strings with
//! per-key TTLs. Key enumeration uses cursor-based `SCAN` so it never blocks
//! writers; the scan is eventually consistent with concurrent updates.

use deadpool_redis::redis::{cmd, AsyncCommands, RedisError};
use deadpool_redis::{Config as PoolSettings, Pool, PoolConfig, Runtime};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::geo::GeoData;
use crate::stats::HostStats;

pub mod keys;

pub use keys::{BucketKey, BucketKind, GEO_PREFIX, HOST_PREFIX};

/// Retention for `geo:<host>` records.
pub const GEO_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

const SCAN_BATCH: usize = 200;

#[derive(Debug, Error)]
pub enum StoreError {
    /// Transport-level failure talking to the backend.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored record failed to deserialize. The key is left in place.
    #[error("corrupt record at {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    /// A key did not match the expected textual form.
    #[error("bad key: {0}")]
    BadKey(String),
}

impl From<RedisError> for StoreError {
    fn from(err: RedisError) -> Self {
        StoreError::Unavailable(err.to_string())
    }
}

/// Handle to the key-value store. Cheap to clone; connections are pooled and
/// established lazily.
#[derive(Clone)]
pub struct RecordStore {
    pool: Pool,
}

impl RecordStore {
    /// Build a store handle for `addr` (`host:port`). No connection is made
    /// until the first operation; use [`ping`](Self::ping) to verify
    /// reachability at startup.
    pub fn connect(addr: &str, password: Option<&str>) -> Result<Self, StoreError> {
        let url = match password {
            Some(p) if !p.is_empty() => format!("redis://:{p}@{addr}"),
            _ => format!("redis://{addr}"),
        };

        let mut settings = PoolSettings::from_url(url);
        settings.pool = Some(PoolConfig::new(8));
        let pool = settings
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| StoreError::Unavailable(e.to_string()))?;

        Ok(Self { pool })
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection, StoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| StoreError::Unavailable(e.to_string()))
    }

    /// Round-trip a PING to verify the backend is reachable.
    pub async fn ping(&self) -> Result<(), StoreError> {
        let mut conn = self.conn().await?;
        let pong: String = cmd("PING").query_async(&mut conn).await?;
        info!("connected to store: {pong}");
        Ok(())
    }

    pub async fn put_host_stats(
        &self,
        key: &BucketKey,
        record: &HostStats,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let data =
            serde_json::to_string(record).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut conn = self.conn().await?;
        let _: () = conn.set_ex(key.encode(), data, ttl.as_secs()).await?;
        Ok(())
    }

    /// Fetch a stat record. `Ok(None)` means the key does not exist, which
    /// is distinct from transport errors and from corrupt payloads.
    pub async fn get_host_stats(&self, key: &str) -> Result<Option<HostStats>, StoreError> {
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(key).await?;
        match raw {
            None => Ok(None),
            Some(data) => {
                serde_json::from_str(&data)
                    .map(Some)
                    .map_err(|source| StoreError::Corrupt {
                        key: key.to_string(),
                        source,
                    })
            }
        }
    }

    /// Enumerate bucket keys of one granularity, optionally narrowed to
    /// hosts containing `host_filter` as a substring.
    pub async fn scan_bucket_keys(
        &self,
        kind: BucketKind,
        host_filter: Option<&str>,
    ) -> Result<Vec<String>, StoreError> {
        let pattern = match host_filter {
            Some(filter) if !filter.is_empty() => {
                format!("{HOST_PREFIX}*{filter}*:{}:*", kind.as_str())
            }
            _ => format!("{HOST_PREFIX}*:{}:*", kind.as_str()),
        };
        self.scan(&pattern).await
    }

    /// Enumerate hourly bucket keys for one calendar date
    /// (`HOST:*:HOUR:<date>-*`).
    pub async fn scan_hour_keys_for_date(&self, date_stamp: &str) -> Result<Vec<String>, StoreError> {
        self.scan(&format!(
            "{HOST_PREFIX}*:{}:{date_stamp}-*",
            BucketKind::Hour.as_str()
        ))
        .await
    }

    pub async fn put_geo(&self, host: &str, record: &GeoData) -> Result<(), StoreError> {
        let data =
            serde_json::to_string(record).map_err(|e| StoreError::Unavailable(e.to_string()))?;
        let mut conn = self.conn().await?;
        let _: () = conn
            .set_ex(format!("{GEO_PREFIX}{host}"), data, GEO_TTL.as_secs())
            .await?;
        Ok(())
    }

    pub async fn get_geo(&self, host: &str) -> Result<Option<GeoData>, StoreError> {
        let key = format!("{GEO_PREFIX}{host}");
        let mut conn = self.conn().await?;
        let raw: Option<String> = conn.get(&key).await?;
        match raw {
            None => Ok(None),
            Some(data) => serde_json::from_str(&data)
                .map(Some)
                .map_err(|source| StoreError::Corrupt { key, source }),
        }
    }

    /// Hosts with a stored geolocation record (the `geo:` prefix stripped).
    pub async fn scan_geo_hosts(&self) -> Result<Vec<String>, StoreError> {
        let keys = self.scan(&format!("{GEO_PREFIX}*")).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(GEO_PREFIX).map(str::to_string))
            .collect())
    }

    async fn scan(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
        let mut conn = self.conn().await?;
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            cursor = next;
            if cursor == 0 {
                break;
            }
        }
        Ok(keys)
    }
}
