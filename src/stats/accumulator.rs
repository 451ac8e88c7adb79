//! In-memory accumulation of per-host counters with periodic flush.
//!
//! One reader-writer lock guards the whole live map and every record under
//! it. The flush cycle runs under the writer lock end to end, so a record's
//! deltas are reset exactly when its store write succeeded and no update can
//! be lost between overlapping cycles.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::stats::HostStats;
use crate::storage::{BucketKey, BucketKind, RecordStore, StoreError};

/// How often accumulated deltas move to the store.
pub const FLUSH_PERIOD: Duration = Duration::from_secs(60 * 60);

const DNS_TIMEOUT: Duration = Duration::from_secs(1);

pub struct StatsAccumulator {
    live: RwLock<HashMap<String, HostStats>>,
    store: RecordStore,
}

impl StatsAccumulator {
    pub fn new(store: RecordStore) -> Self {
        Self {
            live: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Record one observation for `host` (port already stripped).
    ///
    /// First sight of a host resolves its addresses best-effort; resolution
    /// failure records `"unknown"` rather than failing the observation.
    pub async fn record(&self, host: &str, blocked: bool, bytes: u64, increment_connection: bool) {
        let now = Utc::now();
        let mut live = self.live.write().await;

        if let Some(entry) = live.get_mut(host) {
            entry.apply(blocked, bytes, increment_connection, now);
            return;
        }

        let ips = resolve_ips(host).await;
        let mut fresh = HostStats::new(host, ips, now);
        fresh.apply(blocked, bytes, increment_connection, now);
        live.insert(host.to_string(), fresh);
    }

    /// Move every dirty record into the store, merging into both the HOUR
    /// and DAY buckets of the current wall clock. A host whose write fails
    /// keeps its deltas for the next cycle.
    pub async fn flush(&self) {
        let now = Utc::now();
        let mut live = self.live.write().await;

        let dirty = live.values().filter(|s| s.is_dirty()).count();
        if dirty == 0 {
            return;
        }
        debug!("flushing {dirty} host records");

        for (host, stats) in live.iter_mut() {
            if !stats.is_dirty() {
                continue;
            }
            match persist(&self.store, stats, now).await {
                Ok(()) => stats.reset_deltas(),
                Err(e) => warn!("failed to flush stats for {host}: {e}"),
            }
        }
    }

    /// Spawn the periodic flush timer on its own task.
    pub fn spawn_flush_task(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let accumulator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            // The first tick fires immediately; skip it.
            interval.tick().await;
            loop {
                interval.tick().await;
                accumulator.flush().await;
            }
        })
    }

    /// Current live record for a host, if any.
    pub async fn snapshot(&self, host: &str) -> Option<HostStats> {
        self.live.read().await.get(host).cloned()
    }
}

/// Read-modify-write one host's delta into both bucket granularities.
async fn persist(
    store: &RecordStore,
    delta: &HostStats,
    now: DateTime<Utc>,
) -> Result<(), StoreError> {
    for kind in [BucketKind::Hour, BucketKind::Day] {
        let key = BucketKey::new(kind, &delta.host, now);
        let stored = match store.get_host_stats(&key.encode()).await {
            Ok(stored) => stored,
            Err(StoreError::Corrupt { key, .. }) => {
                warn!("overwriting corrupt record at {key}");
                None
            }
            Err(e) => return Err(e),
        };
        let merged = HostStats::merge_delta(stored, delta, now);
        store.put_host_stats(&key, &merged, kind.ttl()).await?;
    }
    Ok(())
}

async fn resolve_ips(host: &str) -> String {
    let lookup = tokio::net::lookup_host((host, 0u16));
    match tokio::time::timeout(DNS_TIMEOUT, lookup).await {
        Ok(Ok(addrs)) => {
            let mut ips: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
            ips.dedup();
            if ips.is_empty() {
                "unknown".to_string()
            } else {
                ips.join(",")
            }
        }
        _ => "unknown".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lazy_store() -> RecordStore {
        // Connections are lazy; nothing here touches the backend.
        RecordStore::connect("127.0.0.1:1", None).unwrap()
    }

    #[tokio::test]
    async fn record_creates_entry_with_resolved_ips() {
        let acc = StatsAccumulator::new(lazy_store());
        acc.record("127.0.0.1", false, 5, true).await;

        let stats = acc.snapshot("127.0.0.1").await.unwrap();
        assert_eq!(stats.ips, "127.0.0.1");
        assert_eq!(stats.connections, 1);
        assert_eq!(stats.request_count, 1);
        assert_eq!(stats.bytes_transferred, 5);
    }

    #[tokio::test]
    async fn unresolvable_host_records_unknown() {
        let acc = StatsAccumulator::new(lazy_store());
        acc.record("host.invalid", true, 0, false).await;

        let stats = acc.snapshot("host.invalid").await.unwrap();
        assert_eq!(stats.ips, "unknown");
        assert_eq!(stats.blocked_attempts, 1);
        assert!(stats.blocked);
    }

    #[tokio::test]
    async fn deltas_accumulate_across_observations() {
        let acc = StatsAccumulator::new(lazy_store());
        acc.record("127.0.0.1", false, 1024, true).await;
        acc.record("127.0.0.1", false, 2048, false).await;
        acc.record("127.0.0.1", true, 0, true).await;

        let stats = acc.snapshot("127.0.0.1").await.unwrap();
        assert_eq!(stats.connections, 2);
        assert_eq!(stats.request_count, 2);
        assert_eq!(stats.blocked_attempts, 1);
        assert_eq!(stats.bytes_transferred, 3072);
        assert!(stats.is_dirty());
        assert!(stats.blocked_attempts <= stats.request_count);
    }
}
