//! Counter records for observed hosts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-(host, bucket) traffic counters, both the live in-memory form and the
/// JSON form persisted in the store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostStats {
    /// Lowercase registered name, no port.
    pub host: String,

    /// Comma-joined addresses resolved at first sight, or `"unknown"`.
    pub ips: String,

    /// Transport associations observed in this bucket.
    pub connections: u64,

    /// HTTP transactions or CONNECT handshakes, including rejected ones.
    pub request_count: u64,

    /// Subset of `request_count` rejected by the blocklist.
    pub blocked_attempts: u64,

    /// Payload bytes observed in either direction.
    pub bytes_transferred: u64,

    /// Sticky within a bucket: once true, stays true.
    pub blocked: bool,

    pub last_seen: DateTime<Utc>,
}

impl HostStats {
    pub fn new(host: &str, ips: String, now: DateTime<Utc>) -> Self {
        Self {
            host: host.to_string(),
            ips,
            connections: 0,
            request_count: 0,
            blocked_attempts: 0,
            bytes_transferred: 0,
            blocked: false,
            last_seen: now,
        }
    }

    /// Apply one observation.
    ///
    /// `increment_connection` moves `connections` and `request_count`
    /// together. A blocked observation always counts as a transaction, so a
    /// rejected request with no transport association still increments
    /// `request_count` alongside `blocked_attempts` (keeping
    /// `blocked_attempts <= request_count`).
    pub fn apply(
        &mut self,
        blocked: bool,
        bytes: u64,
        increment_connection: bool,
        now: DateTime<Utc>,
    ) {
        if increment_connection {
            self.connections += 1;
            self.request_count += 1;
        }
        self.bytes_transferred += bytes;
        if blocked {
            self.blocked = true;
            self.blocked_attempts += 1;
            if !increment_connection {
                self.request_count += 1;
            }
        }
        if now > self.last_seen {
            self.last_seen = now;
        }
    }

    /// Any delta waiting to be flushed?
    pub fn is_dirty(&self) -> bool {
        self.connections > 0
            || self.request_count > 0
            || self.blocked_attempts > 0
            || self.bytes_transferred > 0
    }

    /// Zero the flushed deltas. `ips`, `blocked`, and `last_seen` survive
    /// for continuity across flush cycles.
    pub fn reset_deltas(&mut self) {
        self.connections = 0;
        self.request_count = 0;
        self.blocked_attempts = 0;
        self.bytes_transferred = 0;
    }

    /// Combine a stored record with an in-memory delta for the
    /// read-modify-write persist step: counters sum, `blocked` ORs,
    /// `last_seen` takes the flush time, and the stored `ips` win unless
    /// they were never resolved.
    pub fn merge_delta(stored: Option<HostStats>, delta: &HostStats, now: DateTime<Utc>) -> Self {
        match stored {
            None => {
                let mut fresh = delta.clone();
                fresh.last_seen = now;
                fresh
            }
            Some(mut merged) => {
                merged.connections += delta.connections;
                merged.request_count += delta.request_count;
                merged.blocked_attempts += delta.blocked_attempts;
                merged.bytes_transferred += delta.bytes_transferred;
                merged.blocked = merged.blocked || delta.blocked;
                merged.last_seen = now;
                if merged.ips.is_empty() || merged.ips == "unknown" {
                    merged.ips = delta.ips.clone();
                }
                merged
            }
        }
    }
}

/// One point of the flat `/api/metrics` series.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp_ms: i64,
    pub value: f64,
    pub host: String,
    #[serde(rename = "type")]
    pub kind: String,
}

/// Expand stat records into host x {connections, bytes, blocked} points.
pub fn metric_points(records: &HashMap<String, HostStats>) -> Vec<MetricPoint> {
    let mut points = Vec::with_capacity(records.len() * 3);
    for stat in records.values() {
        let timestamp_ms = stat.last_seen.timestamp_millis();
        points.push(MetricPoint {
            timestamp_ms,
            value: stat.connections as f64,
            host: stat.host.clone(),
            kind: "connections".to_string(),
        });
        points.push(MetricPoint {
            timestamp_ms,
            value: stat.bytes_transferred as f64,
            host: stat.host.clone(),
            kind: "bytes".to_string(),
        });
        points.push(MetricPoint {
            timestamp_ms,
            value: stat.blocked_attempts as f64,
            host: stat.host.clone(),
            kind: "blocked".to_string(),
        });
    }
    points
}
