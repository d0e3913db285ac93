use crate::error::Result;
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

/// External resolver seam; production talks to a Nominatim-compatible
/// endpoint, tests inject mocks.
#[async_trait::async_trait]
pub trait GeocodeBackend: Send + Sync {
    async fn geocode(&self, query: &str) -> Result<Option<(f64, f64)>>;
    async fn reverse(&self, lat: f64, lng: f64) -> Result<Option<String>>;
}

/// Nominatim-style JSON geocoder.
pub struct NominatimBackend {
    client: reqwest::Client,
    base_url: String,
}

impl NominatimBackend {
    pub fn new(client: reqwest::Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait::async_trait]
impl GeocodeBackend for NominatimBackend {
    async fn geocode(&self, query: &str) -> Result<Option<(f64, f64)>> {
        let payload: Value = self
            .client
            .get(&self.base_url)
            .query(&[("q", query), ("format", "json"), ("limit", "1")])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        let first = payload.as_array().and_then(|a| a.first());
        let coords = first.and_then(|hit| {
            let lat = hit["lat"].as_str()?.parse::<f64>().ok()?;
            let lng = hit["lon"].as_str()?.parse::<f64>().ok()?;
            Some((lat, lng))
        });
        Ok(coords)
    }

    async fn reverse(&self, lat: f64, lng: f64) -> Result<Option<String>> {
        let url = self.base_url.replace("/search", "/reverse");
        let payload: Value = self
            .client
            .get(&url)
            .query(&[
                ("lat", lat.to_string()),
                ("lon", lng.to_string()),
                ("format", "json".to_string()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        Ok(payload["display_name"].as_str().map(|s| s.to_string()))
    }
}

#[derive(Debug, Clone)]
enum CachedResult {
    Forward(Option<(f64, f64)>),
    Reverse(Option<String>),
}

#[derive(Debug, Clone, Copy)]
pub struct GeocodeConfig {
    pub ttl: Duration,
    pub max_entries: usize,
    pub queries_per_second: f64,
}

impl Default for GeocodeConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86_400),
            max_entries: 10_000,
            queries_per_second: 1.0,
        }
    }
}

/// Best-effort venue/address resolution with a TTL + size-bounded memo cache
/// and a minimum inter-call throttle toward the upstream geocoder.
///
/// Constructed once at process start and passed by handle; a test can build a
/// fresh instance around a mock backend.
pub struct GeocodeService {
    backend: Arc<dyn GeocodeBackend>,
    cache: Mutex<HashMap<String, (CachedResult, Instant)>>,
    last_call: Mutex<Option<Instant>>,
    min_interval: Duration,
    ttl: Duration,
    max_entries: usize,
}

impl GeocodeService {
    pub fn new(backend: Arc<dyn GeocodeBackend>, config: GeocodeConfig) -> Self {
        let qps = config.queries_per_second.max(0.01);
        Self {
            backend,
            cache: Mutex::new(HashMap::new()),
            last_call: Mutex::new(None),
            min_interval: Duration::from_secs_f64(1.0 / qps),
            ttl: config.ttl,
            max_entries: config.max_entries.max(2),
        }
    }

    /// Resolve coordinates for a venue and/or address. Never raises; a miss
    /// (including upstream trouble) is an absent result, cached as such.
    pub async fn resolve(&self, venue: Option<&str>, address: Option<&str>) -> Option<(f64, f64)> {
        for query in candidate_queries(venue, address) {
            let key = cache_key(&query);
            if let Some(cached) = self.cache_get(&key).await {
                match cached {
                    CachedResult::Forward(Some(coords)) => return Some(coords),
                    // Cached miss: fall through to the next candidate.
                    CachedResult::Forward(None) => continue,
                    CachedResult::Reverse(_) => continue,
                }
            }

            self.throttle().await;
            let result = match self.backend.geocode(&query).await {
                Ok(coords) => coords,
                Err(e) => {
                    warn!(query = %query, error = %e, "geocode call failed");
                    None
                }
            };
            self.cache_put(key, CachedResult::Forward(result)).await;
            if let Some(coords) = result {
                debug!(query = %query, ?coords, "geocoded");
                return Some(coords);
            }
        }
        None
    }

    /// Reverse lookup under the identical cache and throttle discipline.
    pub async fn reverse_resolve(&self, lat: f64, lng: f64) -> Option<String> {
        let key = cache_key(&format!("rev|{:.6},{:.6}", lat, lng));
        if let Some(CachedResult::Reverse(cached)) = self.cache_get(&key).await {
            return cached;
        }

        self.throttle().await;
        let result = match self.backend.reverse(lat, lng).await {
            Ok(address) => address,
            Err(e) => {
                warn!(lat, lng, error = %e, "reverse geocode call failed");
                None
            }
        };
        self.cache_put(key, CachedResult::Reverse(result.clone()))
            .await;
        result
    }

    /// Block briefly rather than exceed the configured ceiling. The lock is
    /// held across the sleep so concurrent callers queue behind it.
    async fn throttle(&self) {
        let mut last = self.last_call.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn cache_get(&self, key: &str) -> Option<CachedResult> {
        let mut cache = self.cache.lock().await;
        match cache.get(key) {
            Some((value, stored_at)) if stored_at.elapsed() <= self.ttl => Some(value.clone()),
            Some(_) => {
                // Expired entries are misses; purge lazily.
                cache.remove(key);
                None
            }
            None => None,
        }
    }

    async fn cache_put(&self, key: String, value: CachedResult) {
        let mut cache = self.cache.lock().await;
        if cache.len() >= self.max_entries {
            let ttl = self.ttl;
            cache.retain(|_, (_, stored_at)| stored_at.elapsed() <= ttl);
        }
        if cache.len() >= self.max_entries {
            // Still over budget: drop the oldest half by timestamp.
            let mut stamps: Vec<(String, Instant)> = cache
                .iter()
                .map(|(k, (_, stored_at))| (k.clone(), *stored_at))
                .collect();
            stamps.sort_by_key(|(_, stored_at)| *stored_at);
            for (old_key, _) in stamps.iter().take(stamps.len() / 2 + 1) {
                cache.remove(old_key);
            }
        }
        cache.insert(key, (value, Instant::now()));
    }

    #[cfg(test)]
    async fn cache_len(&self) -> usize {
        self.cache.lock().await.len()
    }
}

/// Ordered candidate queries: "venue, address" then address then venue.
fn candidate_queries(venue: Option<&str>, address: Option<&str>) -> Vec<String> {
    let venue = venue.map(str::trim).filter(|s| !s.is_empty());
    let address = address.map(str::trim).filter(|s| !s.is_empty());

    let mut queries = Vec::new();
    if let (Some(v), Some(a)) = (venue, address) {
        queries.push(format!("{}, {}", v, a));
    }
    if let Some(a) = address {
        queries.push(a.to_string());
    }
    if let Some(v) = venue {
        queries.push(v.to_string());
    }
    queries.dedup();
    queries
}

fn cache_key(query: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(query.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockBackend {
        coords: Option<(f64, f64)>,
        calls: AtomicUsize,
    }

    impl MockBackend {
        fn returning(coords: Option<(f64, f64)>) -> Arc<Self> {
            Arc::new(Self {
                coords,
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl GeocodeBackend for MockBackend {
        async fn geocode(&self, _query: &str) -> Result<Option<(f64, f64)>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.coords)
        }

        async fn reverse(&self, _lat: f64, _lng: f64) -> Result<Option<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some("Jl. Danau Tamblingan 80, Sanur".to_string()))
        }
    }

    fn fast_config(max_entries: usize) -> GeocodeConfig {
        GeocodeConfig {
            ttl: Duration::from_secs(3600),
            max_entries,
            queries_per_second: 1000.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn second_identical_query_is_served_from_cache() {
        let backend = MockBackend::returning(Some((-8.6701, 115.2579)));
        let service = GeocodeService::new(backend.clone(), fast_config(100));

        let first = service.resolve(Some("Cafe Moka"), None).await;
        assert_eq!(first, Some((-8.6701, 115.2579)));
        assert_eq!(backend.call_count(), 1);

        let second = service.resolve(Some("Cafe Moka"), None).await;
        assert_eq!(second, first);
        assert_eq!(backend.call_count(), 1, "resolver must not be invoked again");
    }

    #[tokio::test(start_paused = true)]
    async fn negative_results_are_cached_too() {
        let backend = MockBackend::returning(None);
        let service = GeocodeService::new(backend.clone(), fast_config(100));

        assert_eq!(service.resolve(Some("nowhere"), None).await, None);
        assert_eq!(service.resolve(Some("nowhere"), None).await, None);
        assert_eq!(backend.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn candidate_order_tries_combined_query_first() {
        let queries = candidate_queries(Some("Cafe Moka"), Some("Jl. Danau Tamblingan 80"));
        assert_eq!(
            queries,
            vec![
                "Cafe Moka, Jl. Danau Tamblingan 80".to_string(),
                "Jl. Danau Tamblingan 80".to_string(),
                "Cafe Moka".to_string(),
            ]
        );
        assert_eq!(candidate_queries(None, None), Vec::<String>::new());
    }

    #[tokio::test(start_paused = true)]
    async fn cache_never_exceeds_its_ceiling() {
        let backend = MockBackend::returning(Some((1.0, 2.0)));
        let service = GeocodeService::new(backend, fast_config(10));

        for i in 0..30 {
            let name = format!("venue-{}", i);
            service.resolve(Some(&name), None).await;
            assert!(
                service.cache_len().await <= 10,
                "cache exceeded ceiling after insert {}",
                i
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entries_are_misses() {
        let backend = MockBackend::returning(Some((1.0, 2.0)));
        let config = GeocodeConfig {
            ttl: Duration::from_secs(60),
            max_entries: 100,
            queries_per_second: 1000.0,
        };
        let service = GeocodeService::new(backend.clone(), config);

        service.resolve(Some("Cafe Moka"), None).await;
        assert_eq!(backend.call_count(), 1);

        tokio::time::advance(Duration::from_secs(61)).await;
        service.resolve(Some("Cafe Moka"), None).await;
        assert_eq!(backend.call_count(), 2, "expired entry must re-resolve");
    }

    #[tokio::test(start_paused = true)]
    async fn reverse_lookup_shares_the_cache_discipline() {
        let backend = MockBackend::returning(None);
        let service = GeocodeService::new(backend.clone(), fast_config(100));

        let first = service.reverse_resolve(-8.6701, 115.2579).await;
        let second = service.reverse_resolve(-8.6701, 115.2579).await;
        assert_eq!(first.as_deref(), Some("Jl. Danau Tamblingan 80, Sanur"));
        assert_eq!(first, second);
        assert_eq!(backend.call_count(), 1);
    }
}
