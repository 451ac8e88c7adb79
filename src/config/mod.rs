use serde::{Deserialize, Serialize};

/// Runtime configuration, sourced from the environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control port: proxy-HTTP on `/`, read API under `/api`.
    pub http_port: u16,

    /// Tunnel port: CONNECT handshakes only.
    pub https_port: u16,

    /// Log file path; empty means stdout.
    pub log_file: String,

    /// Blocklist pattern file; absent means nothing is blocked.
    pub block_file: Option<String>,

    /// Key-value store address (`host:port`).
    pub store_addr: String,

    pub store_password: Option<String>,

    /// Whether hosts are enriched with geolocation data.
    pub geo_enabled: bool,

    /// In-memory geolocation cache capacity.
    pub geo_cache_size: usize,

    /// Verbose per-tier geolocation logging.
    pub geo_debug: bool,
}

impl Config {
    const fn default_http_port() -> u16 {
        3000
    }

    const fn default_https_port() -> u16 {
        3443
    }

    const fn default_geo_cache_size() -> usize {
        10_000
    }

    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let http_port = std::env::var("HTTP_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or_else(Config::default_http_port);

        let https_port = std::env::var("HTTPS_PORT")
            .ok()
            .and_then(|v| v.parse::<u16>().ok())
            .unwrap_or_else(Config::default_https_port);

        let log_file = std::env::var("LOG_FILE").unwrap_or_default();

        let block_file = std::env::var("BLOCK_FILE").ok().filter(|v| !v.is_empty());

        let store_addr =
            std::env::var("STORE_ADDR").unwrap_or_else(|_| "127.0.0.1:6379".to_string());

        let store_password = std::env::var("STORE_PASSWORD").ok().filter(|v| !v.is_empty());

        let geo_enabled = std::env::var("GEO_ENABLED")
            .map(|v| !matches!(v.to_lowercase().as_str(), "false" | "0" | "no"))
            .unwrap_or(true);

        let geo_cache_size = std::env::var("GEO_CACHE_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or_else(Config::default_geo_cache_size);

        let geo_debug = std::env::var("GEO_DEBUG")
            .map(|v| matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);

        Ok(Config {
            http_port,
            https_port,
            log_file,
            block_file,
            store_addr,
            store_password,
            geo_enabled,
            geo_cache_size,
            geo_debug,
        })
    }
}
