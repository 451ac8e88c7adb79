//! Geolocation enrichment with three-tier caching.
//!
//! Lookups go memory LRU, then the persistent store, then the GeoJS HTTP
//! API. Upstream calls are throttled to one per second process-wide by a
//! token channel fed from a ticker task; unclaimed tokens are dropped at the
//! channel so the ticker never stalls.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::proxy::strip_port;
use crate::storage::RecordStore;

mod client;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(2);
const TOKEN_PERIOD: Duration = Duration::from_secs(1);

/// Geolocation attributes attached to a host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeoData {
    pub country_code: String,
    pub country: String,
    pub city: String,
    pub region: String,
    pub timezone: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Error)]
pub enum GeoError {
    /// Upstream unreachable, non-200, or unparseable.
    #[error("geolocation lookup failed: {0}")]
    LookupFailed(String),
}

pub struct GeoCache {
    mem: RwLock<LruCache<String, GeoData>>,
    store: RecordStore,
    http: reqwest::Client,
    tokens: Mutex<mpsc::Receiver<()>>,
    ticker: JoinHandle<()>,
    debug: bool,
}

impl GeoCache {
    pub fn new(store: RecordStore, cache_size: usize, debug: bool) -> anyhow::Result<Self> {
        let capacity = NonZeroUsize::new(cache_size.max(1)).unwrap_or(NonZeroUsize::MIN);

        let http = reqwest::Client::builder()
            .timeout(UPSTREAM_TIMEOUT)
            .build()?;

        let (tx, rx) = mpsc::channel(1);
        let ticker = tokio::spawn(async move {
            let mut interval = tokio::time::interval(TOKEN_PERIOD);
            loop {
                interval.tick().await;
                // A full channel means the last token was never claimed;
                // the new one is dropped instead of queueing up.
                let _ = tx.try_send(());
            }
        });

        Ok(Self {
            mem: RwLock::new(LruCache::new(capacity)),
            store,
            http,
            tokens: Mutex::new(rx),
            ticker,
            debug,
        })
    }

    /// Resolve geolocation for a host, walking the tiers in order.
    pub async fn lookup(&self, host: &str) -> Result<GeoData, GeoError> {
        if let Some(data) = self.mem.read().await.peek(host) {
            return Ok(data.clone());
        }

        match self.store.get_geo(host).await {
            Ok(Some(data)) => {
                self.mem.write().await.put(host.to_string(), data.clone());
                return Ok(data);
            }
            Ok(None) => {}
            Err(e) => {
                if self.debug {
                    debug!("geo store lookup failed for {host}: {e}");
                }
            }
        }

        // Rate limit: one upstream call per token.
        {
            let mut tokens = self.tokens.lock().await;
            if tokens.recv().await.is_none() {
                return Err(GeoError::LookupFailed("rate limiter stopped".to_string()));
            }
        }

        let data = client::fetch(&self.http, host).await?;
        if self.debug {
            debug!("resolved {host} via upstream: {}/{}", data.country_code, data.city);
        }

        self.mem.write().await.put(host.to_string(), data.clone());

        // Write-behind: the caller never waits on the store.
        let store = self.store.clone();
        let host = host.to_string();
        let record = data.clone();
        tokio::spawn(async move {
            if let Err(e) = store.put_geo(&host, &record).await {
                warn!("failed to persist geo data for {host}: {e}");
            }
        });

        Ok(data)
    }

    /// Fire-and-forget enrichment for a host seen by the proxy. Private and
    /// loopback addresses are never sent upstream.
    pub fn record_host_async(self: &Arc<Self>, host: &str) {
        let host = strip_port(host).to_string();
        if host.is_empty() || is_private_host(&host) {
            return;
        }
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let _ = cache.lookup(&host).await;
        });
    }

    /// Warm the LRU from the store at startup. Entries beyond capacity stay
    /// in the store uncached. Scan errors are non-fatal.
    pub async fn preload(&self) {
        let hosts = match self.store.scan_geo_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                warn!("geo preload scan failed: {e}");
                return;
            }
        };

        let mut loaded = 0usize;
        for host in hosts {
            {
                let mem = self.mem.read().await;
                if mem.len() >= mem.cap().get() {
                    break;
                }
            }
            match self.store.get_geo(&host).await {
                Ok(Some(data)) => {
                    self.mem.write().await.put(host, data);
                    loaded += 1;
                }
                Ok(None) => {}
                Err(e) => debug!("skipping geo record for {host}: {e}"),
            }
        }
        info!("preloaded {loaded} geolocation records");
    }

    /// Stop the rate-limiter ticker. Pending token waits resolve once the
    /// sender is gone.
    pub fn shutdown(&self) {
        self.ticker.abort();
    }

    /// Number of records currently held in memory.
    pub async fn cached_len(&self) -> usize {
        self.mem.read().await.len()
    }
}

/// True when `host` is an IP inside the ranges that never get enriched:
/// 127.0.0.0/8, 10.0.0.0/8, 172.16.0.0/12, 192.168.0.0/16, 169.254.0.0/16,
/// ::1/128, fc00::/7, fe80::/10. Hostnames pass through.
fn is_private_host(host: &str) -> bool {
    let ip: IpAddr = match host.trim_matches(['[', ']']).parse() {
        Ok(ip) => ip,
        Err(_) => return false,
    };
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private() || v4.is_link_local(),
        IpAddr::V6(v6) => {
            let first = v6.segments()[0];
            v6.is_loopback() || (first & 0xfe00) == 0xfc00 || (first & 0xffc0) == 0xfe80
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_ranges_are_filtered() {
        for host in [
            "127.0.0.1",
            "127.255.255.254",
            "10.0.0.1",
            "10.255.0.1",
            "172.16.0.1",
            "172.31.255.255",
            "192.168.1.1",
            "169.254.0.10",
            "::1",
            "fc00::1",
            "fd12:3456::1",
            "fe80::1",
        ] {
            assert!(is_private_host(host), "{host} should be private");
        }
    }

    #[test]
    fn public_addresses_and_hostnames_pass() {
        for host in [
            "8.8.8.8",
            "1.1.1.1",
            "172.32.0.1",
            "192.169.0.1",
            "2001:4860:4860::8888",
            "example.com",
            "ads.tracker.net",
        ] {
            assert!(!is_private_host(host), "{host} should not be private");
        }
    }

    #[test]
    fn bracketed_ipv6_literals_are_recognized() {
        assert!(is_private_host("[::1]"));
        assert!(!is_private_host("[2001:db8::1]"));
    }

    fn sample(city: &str) -> GeoData {
        GeoData {
            country_code: "US".into(),
            country: "United States".into(),
            city: city.into(),
            region: "CA".into(),
            timezone: "America/Los_Angeles".into(),
            latitude: 37.4,
            longitude: -122.0,
        }
    }

    #[tokio::test]
    async fn lru_hit_does_not_evict_and_capacity_holds() {
        let store = RecordStore::connect("127.0.0.1:1", None).unwrap();
        let cache = GeoCache::new(store, 2, false).unwrap();

        cache.mem.write().await.put("a.com".into(), sample("A"));
        cache.mem.write().await.put("b.com".into(), sample("B"));
        assert_eq!(cache.cached_len().await, 2);

        assert!(cache.mem.read().await.peek("a.com").is_some());

        cache.mem.write().await.put("c.com".into(), sample("C"));
        assert_eq!(cache.cached_len().await, 2, "capacity is bounded");

        cache.shutdown();
    }

    #[test]
    fn geo_data_round_trips_with_stored_field_names() {
        let data = sample("Mountain View");
        let value = serde_json::to_value(&data).unwrap();
        assert!(value.get("country").is_some());
        assert!(value.get("country_code").is_some());
        assert!(value.get("timezone").is_some());

        let back: GeoData = serde_json::from_value(value).unwrap();
        assert_eq!(back, data);
    }
}
