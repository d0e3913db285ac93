use std::time::Duration;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Process-wide configuration, read once at startup from the environment
/// (with `.env` support via dotenv).
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the SQLite event store.
    pub database_path: String,
    /// Period of the ingestion sweep timer.
    pub ingest_interval: Duration,
    /// Period of the translation backfill timer.
    pub translate_interval: Duration,
    /// Due sources picked up per sweep, oldest first.
    pub sweep_batch_size: usize,
    /// Consecutive failures before a source is auto-disabled.
    pub failure_ceiling: i64,
    /// HTTP timeout for source fetches.
    pub fetch_timeout: Duration,
    /// Detail pages visited per listing page by the link-discovery adapter.
    pub link_discovery_cap: usize,
    /// Geocoder queries per second ceiling.
    pub geocode_qps: f64,
    /// Geocode cache entry time-to-live.
    pub geocode_ttl: Duration,
    /// Geocode cache maximum entry count.
    pub geocode_max_entries: usize,
    /// Geocoder endpoint (Nominatim-compatible).
    pub geocode_base_url: String,
    /// Translation endpoint.
    pub translate_url: String,
    /// Records per translation batch.
    pub translate_batch_size: usize,
    /// Per-record translation retry budget.
    pub translate_retry_ceiling: i64,
    /// User-agent sent on all outbound requests.
    pub user_agent: String,
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            database_path: std::env::var("AFISHA_DB_PATH")
                .unwrap_or_else(|_| "data/afisha.db".to_string()),
            ingest_interval: Duration::from_secs(env_or("AFISHA_INGEST_INTERVAL_SECS", 300)),
            translate_interval: Duration::from_secs(env_or("AFISHA_TRANSLATE_INTERVAL_SECS", 120)),
            sweep_batch_size: env_or("AFISHA_SWEEP_BATCH_SIZE", 50),
            failure_ceiling: env_or("AFISHA_FAILURE_CEILING", 5),
            fetch_timeout: Duration::from_secs(env_or("AFISHA_FETCH_TIMEOUT_SECS", 20)),
            link_discovery_cap: env_or("AFISHA_LINK_DISCOVERY_CAP", 10),
            geocode_qps: env_or("AFISHA_GEOCODE_QPS", 1.0),
            geocode_ttl: Duration::from_secs(env_or("AFISHA_GEOCODE_TTL_SECS", 86_400)),
            geocode_max_entries: env_or("AFISHA_GEOCODE_MAX_ENTRIES", 10_000),
            geocode_base_url: std::env::var("AFISHA_GEOCODE_URL")
                .unwrap_or_else(|_| "https://nominatim.openstreetmap.org/search".to_string()),
            translate_url: std::env::var("AFISHA_TRANSLATE_URL")
                .unwrap_or_else(|_| "http://localhost:5000/translate".to_string()),
            translate_batch_size: env_or("AFISHA_TRANSLATE_BATCH_SIZE", 10),
            translate_retry_ceiling: env_or("AFISHA_TRANSLATE_RETRY_CEILING", 3),
            user_agent: std::env::var("AFISHA_USER_AGENT")
                .unwrap_or_else(|_| "afisha-pipeline/0.1".to_string()),
        }
    }
}
