use anyhow::Result;
use chrono::{TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::tempdir;

use afisha_pipeline::adapters::ics::parse_ics;
use afisha_pipeline::adapters::AdapterRegistry;
use afisha_pipeline::geocode::{GeocodeBackend, GeocodeConfig, GeocodeService};
use afisha_pipeline::normalize::resolve_external_id;
use afisha_pipeline::scheduler::Scheduler;
use afisha_pipeline::store::{EventStore, NewEvent, NewSource, UpsertOutcome};
use afisha_pipeline::types::{
    EventOrigin, FetchOutcome, RawEvent, Source, SourceAdapter, SourceKind,
};

const BEACH_CLEANUP_ICS: &str = "BEGIN:VCALENDAR\r\n\
    BEGIN:VEVENT\r\n\
    SUMMARY:Beach Cleanup\r\n\
    DTSTART:20251001T080000Z\r\n\
    DTEND:20251001T100000Z\r\n\
    LOCATION:Sanur Beach\r\n\
    DESCRIPTION:Monthly cleanup\\, bring gloves\r\n\
    END:VEVENT\r\n\
    END:VCALENDAR\r\n";

fn raw_to_new_event(raw: &RawEvent) -> NewEvent {
    NewEvent {
        source: raw.source.clone(),
        external_id: resolve_external_id(raw),
        origin: EventOrigin::Parser,
        title: raw.title.clone(),
        description: raw.description.clone(),
        location_name: raw.location_name.clone(),
        lat: raw.lat,
        lng: raw.lng,
        start_time: raw.start_time.expect("parsed event must carry a start"),
        end_time: raw.end_time,
        url: raw.url.clone(),
    }
}

#[tokio::test]
async fn ics_feed_parses_and_upserts_idempotently() -> Result<()> {
    let temp_dir = tempdir()?;
    let store = EventStore::open(temp_dir.path().join("afisha.db"))?;

    let (events, dropped) = parse_ics(BEACH_CLEANUP_ICS, "bali_ics", "https://example.com/cal.ics");
    assert_eq!(dropped, 0);
    assert_eq!(events.len(), 1);

    let event = raw_to_new_event(&events[0]);
    assert_eq!(store.upsert_event(&event)?, UpsertOutcome::Inserted);

    // Re-parsing the unchanged feed yields the same identity; the second
    // upsert merges instead of duplicating.
    let (events, _) = parse_ics(BEACH_CLEANUP_ICS, "bali_ics", "https://example.com/cal.ics");
    let event = raw_to_new_event(&events[0]);
    assert_eq!(store.upsert_event(&event)?, UpsertOutcome::Updated);
    assert_eq!(store.count_events()?, 1);

    let row = store
        .get_event("bali_ics", &event.external_id)?
        .expect("row must exist");
    assert_eq!(row.title, "Beach Cleanup");
    assert_eq!(row.location_name.as_deref(), Some("Sanur Beach"));
    assert_eq!(row.description.as_deref(), Some("Monthly cleanup, bring gloves"));
    assert_eq!(
        row.start_time,
        Utc.with_ymd_and_hms(2025, 10, 1, 8, 0, 0).single().unwrap()
    );
    assert_eq!(
        row.end_time,
        Utc.with_ymd_and_hms(2025, 10, 1, 10, 0, 0).single()
    );
    Ok(())
}

/// Serves a fixed ICS document in place of the HTTP fetch.
struct FixtureIcsAdapter;

#[async_trait::async_trait]
impl SourceAdapter for FixtureIcsAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::PullCalendar
    }

    async fn fetch(&self, source: &Source) -> afisha_pipeline::error::Result<FetchOutcome> {
        let (events, _) = parse_ics(BEACH_CLEANUP_ICS, &source.name, &source.url);
        Ok(FetchOutcome::Fetched {
            events,
            etag: Some("\"fixture\"".to_string()),
            last_modified: None,
        })
    }
}

struct StubGeocoder;

#[async_trait::async_trait]
impl GeocodeBackend for StubGeocoder {
    async fn geocode(&self, _query: &str) -> afisha_pipeline::error::Result<Option<(f64, f64)>> {
        Ok(Some((-8.6701, 115.2579)))
    }

    async fn reverse(&self, _lat: f64, _lng: f64) -> afisha_pipeline::error::Result<Option<String>> {
        Ok(None)
    }
}

#[tokio::test]
async fn full_sweep_ingests_geocodes_and_records_source_health() -> Result<()> {
    let temp_dir = tempdir()?;
    let store = Arc::new(EventStore::open(temp_dir.path().join("afisha.db"))?);

    let mut adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>> = HashMap::new();
    adapters.insert(SourceKind::PullCalendar, Arc::new(FixtureIcsAdapter));
    let registry = Arc::new(AdapterRegistry::with_adapters(adapters));

    let geocoder = Arc::new(GeocodeService::new(
        Arc::new(StubGeocoder),
        GeocodeConfig {
            ttl: Duration::from_secs(3600),
            max_entries: 100,
            queries_per_second: 1000.0,
        },
    ));

    let source_id = store.add_source(&NewSource {
        name: "bali_ics".into(),
        kind: SourceKind::PullCalendar,
        url: "https://example.com/cal.ics".into(),
        region: "bali".into(),
        freq_minutes: 0,
        oauth_token: None,
        api_key: None,
    })?;

    let scheduler = Scheduler::new(store.clone(), registry, geocoder, 50, 5);

    let summary = scheduler.sweep().await?;
    assert_eq!(summary.sources_due, 1);
    assert_eq!(summary.fetched, 1);
    assert_eq!(summary.inserted, 1);

    // Second sweep over the unchanged feed merges into the same row.
    let summary = scheduler.sweep().await?;
    assert_eq!(summary.inserted, 0);
    assert_eq!(summary.updated, 1);
    assert_eq!(store.count_events()?, 1);

    // The record picked up coordinates from the geocoder.
    let rows = store.events_in_window(
        Utc.with_ymd_and_hms(2025, 10, 1, 0, 0, 0).single().unwrap(),
        Utc.with_ymd_and_hms(2025, 10, 2, 0, 0, 0).single().unwrap(),
        None,
        Some("bali_ics"),
    )?;
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].lat, Some(-8.6701));
    assert_eq!(rows[0].lng, Some(115.2579));

    // Source health reflects the successful cycles, validators included.
    let source = store.get_source(source_id)?.expect("source must exist");
    assert_eq!(source.consecutive_failures, 0);
    assert_eq!(source.etag.as_deref(), Some("\"fixture\""));
    assert_eq!(source.last_status, Some(200));
    Ok(())
}
