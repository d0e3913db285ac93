use crate::error::Result;
use crate::types::{FetchOutcome, RawEvent, Source, SourceAdapter, SourceKind};
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Backoff schedule for 429/5xx responses: base delay doubling per attempt,
/// capped.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Third-party events API adapter. Prefers an OAuth bearer token; falls back
/// to an API-key query parameter when no token is available. An exhausted
/// retry budget yields an empty cycle, never an error past the scheduler.
pub struct ApiFeedAdapter {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl ApiFeedAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self {
            client,
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_backoff(client: reqwest::Client, backoff: BackoffPolicy) -> Self {
        Self { client, backoff }
    }

    async fn fetch_payload(&self, source: &Source) -> Option<Value> {
        for attempt in 0..self.backoff.max_attempts {
            let mut request = self.client.get(&source.url);
            match (&source.oauth_token, &source.api_key) {
                (Some(token), _) => {
                    request = request.bearer_auth(token);
                }
                (None, Some(key)) => {
                    request = request.query(&[("apikey", key.as_str())]);
                }
                (None, None) => {}
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        match response.json::<Value>().await {
                            Ok(payload) => return Some(payload),
                            Err(e) => {
                                warn!(error = %e, "API payload was not valid JSON");
                                return None;
                            }
                        }
                    }
                    if !is_retryable(status) {
                        warn!(%status, "API request failed, not retrying");
                        return None;
                    }
                    debug!(%status, attempt, "retryable API response");
                }
                Err(e) => {
                    debug!(error = %e, attempt, "API request error");
                }
            }

            if attempt + 1 < self.backoff.max_attempts {
                tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            }
        }
        warn!("API retry budget exhausted, returning empty cycle");
        None
    }
}

#[async_trait::async_trait]
impl SourceAdapter for ApiFeedAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::ApiFeed
    }

    #[instrument(skip(self, source), fields(source = %source.name))]
    async fn fetch(&self, source: &Source) -> Result<FetchOutcome> {
        let Some(payload) = self.fetch_payload(source).await else {
            return Ok(FetchOutcome::fetched(Vec::new()));
        };

        let (events, dropped) = parse_api_payload(&payload, &source.name);
        info!(parsed = events.len(), dropped, "parsed API feed");
        Ok(FetchOutcome::fetched(events))
    }
}

/// Parse the JSON events payload. Individual malformed entries are dropped
/// and counted; the rest of the page is still processed.
pub fn parse_api_payload(payload: &Value, source_tag: &str) -> (Vec<RawEvent>, usize) {
    let entries = payload["events"].as_array().cloned().unwrap_or_default();
    let mut events = Vec::new();
    let mut dropped = 0usize;

    for entry in &entries {
        match entry_to_raw(entry, source_tag) {
            Some(event) => events.push(event),
            None => dropped += 1,
        }
    }
    (events, dropped)
}

fn entry_to_raw(entry: &Value, source_tag: &str) -> Option<RawEvent> {
    let title = entry["title"].as_str().filter(|t| !t.trim().is_empty())?;
    let start = entry["start_time"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))?;

    let mut event = RawEvent::new(title.trim(), source_tag);
    event.start_time = Some(start);
    event.end_time = entry["end_time"]
        .as_str()
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc));
    event.external_id = entry["id"].as_str().map(|s| s.to_string());
    event.url = entry["url"].as_str().map(|s| s.to_string());
    event.description = entry["description"].as_str().map(|s| s.to_string());
    event.location_name = entry["venue"]["name"].as_str().map(|s| s.to_string());
    event.address = entry["venue"]["address"].as_str().map(|s| s.to_string());
    event.lat = entry["venue"]["lat"].as_f64();
    event.lng = entry["venue"]["lng"].as_f64();
    Some(event)
}
