use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Where an event row originally came from. The translation backfill engine
/// paces user-entered rows and parser-ingested rows independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventOrigin {
    User,
    Parser,
}

impl EventOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOrigin::User => "user",
            EventOrigin::Parser => "parser",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "user" => Some(EventOrigin::User),
            "parser" => Some(EventOrigin::Parser),
            _ => None,
        }
    }
}

/// Protocol family a registered source speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SourceKind {
    /// ICS feed fetched with conditional GET.
    PullCalendar,
    /// HTML listing page; detail pages are probed for a calendar-export link.
    HtmlListing,
    /// Scraped forum with free-text Russian dates and embedded map links.
    ForumScrape,
    /// Third-party JSON API behind OAuth with API-key fallback.
    ApiFeed,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::PullCalendar => "pull_calendar",
            SourceKind::HtmlListing => "html_listing",
            SourceKind::ForumScrape => "forum_scrape",
            SourceKind::ApiFeed => "api_feed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pull_calendar" => Some(SourceKind::PullCalendar),
            "html_listing" => Some(SourceKind::HtmlListing),
            "forum_scrape" => Some(SourceKind::ForumScrape),
            "api_feed" => Some(SourceKind::ApiFeed),
            _ => None,
        }
    }
}

/// A registered external feed, as stored in the `sources` table.
///
/// Fetch/health state (validators, failure counter) lives alongside the
/// registration on purpose: it is operational metadata the scheduler owns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: i64,
    pub name: String,
    pub kind: SourceKind,
    pub url: String,
    pub region: String,
    pub enabled: bool,
    pub freq_minutes: i64,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub last_status: Option<u16>,
    pub last_fetch_at: Option<DateTime<Utc>>,
    pub consecutive_failures: i64,
    /// Bearer token for api_feed sources, when an OAuth grant exists.
    pub oauth_token: Option<String>,
    /// Fallback API key for api_feed sources.
    pub api_key: Option<String>,
}

/// Adapter output, pre-persistence. Fixed shape with nullable fields; a record
/// without a resolvable start time is dropped before it ever reaches here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawEvent {
    pub title: String,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub source: String,
    pub external_id: Option<String>,
    pub url: Option<String>,
    pub description: Option<String>,
    pub location_name: Option<String>,
    pub address: Option<String>,
}

impl RawEvent {
    pub fn new(title: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            lat: None,
            lng: None,
            start_time: None,
            end_time: None,
            source: source.into(),
            external_id: None,
            url: None,
            description: None,
            location_name: None,
            address: None,
        }
    }
}

/// Result of one adapter fetch cycle.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Conditional fetch confirmed no change; success with zero new records.
    NotModified,
    /// Fresh payload parsed into records, with any cache validators the
    /// server handed back for the next conditional request.
    Fetched {
        events: Vec<RawEvent>,
        etag: Option<String>,
        last_modified: Option<String>,
    },
}

impl FetchOutcome {
    pub fn fetched(events: Vec<RawEvent>) -> Self {
        FetchOutcome::Fetched {
            events,
            etag: None,
            last_modified: None,
        }
    }
}

/// Core trait every source adapter implements.
///
/// Ordinary per-record parse failures are degraded to skipped records inside
/// the adapter; an `Err` from `fetch` means the whole cycle failed and the
/// scheduler counts it against the source's health.
#[async_trait::async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Which source kind this adapter serves.
    fn kind(&self) -> SourceKind;

    /// Run one fetch-and-parse cycle for the given source.
    async fn fetch(&self, source: &Source) -> Result<FetchOutcome>;
}
