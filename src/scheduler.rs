use crate::adapters::AdapterRegistry;
use crate::error::{PipelineError, Result};
use crate::geocode::GeocodeService;
use crate::normalize::{enrich_location_fields, resolve_external_id};
use crate::store::{EventStore, NewEvent, UpsertOutcome};
use crate::types::{EventOrigin, FetchOutcome, RawEvent, Source};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// Counters for one ingestion sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct SweepSummary {
    pub sources_due: usize,
    pub fetched: usize,
    pub not_modified: usize,
    pub failed: usize,
    pub disabled: usize,
    pub inserted: usize,
    pub updated: usize,
    pub skipped_records: usize,
}

/// Drives the ingestion loop: picks up due sources, dispatches each to the
/// adapter for its kind, and funnels every parsed record through
/// normalization, geocoding and the upsert engine.
///
/// Source health (validators, failure counter, auto-disable) is recorded per
/// cycle, separately from record persistence: a cycle that fetched fine but
/// parsed zero usable records is still a healthy cycle.
pub struct Scheduler {
    store: Arc<EventStore>,
    adapters: Arc<AdapterRegistry>,
    geocoder: Arc<GeocodeService>,
    batch_size: usize,
    failure_ceiling: i64,
    sweep_in_flight: AtomicBool,
}

impl Scheduler {
    pub fn new(
        store: Arc<EventStore>,
        adapters: Arc<AdapterRegistry>,
        geocoder: Arc<GeocodeService>,
        batch_size: usize,
        failure_ceiling: i64,
    ) -> Self {
        Self {
            store,
            adapters,
            geocoder,
            batch_size,
            failure_ceiling,
            sweep_in_flight: AtomicBool::new(false),
        }
    }

    /// One sweep over all currently due sources, oldest first.
    #[instrument(skip(self))]
    pub async fn sweep(&self) -> Result<SweepSummary> {
        let now = Utc::now();
        let due = self.store.due_sources(now, self.batch_size)?;
        let mut summary = SweepSummary {
            sources_due: due.len(),
            ..Default::default()
        };

        for source in &due {
            self.process_source(source, now, &mut summary).await;
        }

        if summary.sources_due > 0 {
            info!(
                sources_due = summary.sources_due,
                fetched = summary.fetched,
                not_modified = summary.not_modified,
                failed = summary.failed,
                inserted = summary.inserted,
                updated = summary.updated,
                skipped = summary.skipped_records,
                "ingestion sweep done"
            );
        }
        Ok(summary)
    }

    /// One source's fetch cycle. Fetch-level failure is counted against the
    /// source's health; record-level trouble never is.
    async fn process_source(&self, source: &Source, now: DateTime<Utc>, summary: &mut SweepSummary) {
        let adapter = match self.adapters.for_kind(source.kind) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!(source = %source.name, error = %e, "no adapter for source");
                self.record_failure(source, None, summary);
                return;
            }
        };

        match adapter.fetch(source).await {
            Ok(FetchOutcome::NotModified) => {
                // Unchanged upstream is a healthy cycle with zero records.
                debug!(source = %source.name, "not modified, skipping parse");
                summary.not_modified += 1;
                if let Err(e) = self.store.record_fetch_success(source.id, now, 304, None, None) {
                    warn!(source = %source.name, error = %e, "failed to record fetch success");
                }
            }
            Ok(FetchOutcome::Fetched {
                events,
                etag,
                last_modified,
            }) => {
                summary.fetched += 1;
                if let Err(e) = self.store.record_fetch_success(
                    source.id,
                    now,
                    200,
                    etag.as_deref(),
                    last_modified.as_deref(),
                ) {
                    warn!(source = %source.name, error = %e, "failed to record fetch success");
                }
                for event in events {
                    if let Err(e) = self.ingest_record(event, summary).await {
                        warn!(source = %source.name, error = %e, "record persistence failed");
                        summary.skipped_records += 1;
                    }
                }
            }
            Err(e) => {
                warn!(source = %source.name, error = %e, "fetch cycle failed");
                self.record_failure(source, Self::failure_status(&e), summary);
            }
        }
    }

    /// The HTTP status behind a failed cycle, when the error carries one, so
    /// the source's last-status attribute reflects failures too.
    fn failure_status(error: &PipelineError) -> Option<u16> {
        match error {
            PipelineError::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    fn record_failure(&self, source: &Source, status: Option<u16>, summary: &mut SweepSummary) {
        summary.failed += 1;
        match self
            .store
            .record_fetch_failure(source.id, status, self.failure_ceiling)
        {
            Ok(outcome) if outcome.disabled_now => {
                summary.disabled += 1;
                warn!(
                    source = %source.name,
                    failures = outcome.consecutive_failures,
                    "source auto-disabled after consecutive failures"
                );
            }
            Ok(outcome) => {
                debug!(source = %source.name, failures = outcome.consecutive_failures, "failure recorded");
            }
            Err(e) => {
                warn!(source = %source.name, error = %e, "failed to record fetch failure");
            }
        }
    }

    /// Normalize, geocode and upsert one parsed record.
    async fn ingest_record(&self, mut event: RawEvent, summary: &mut SweepSummary) -> Result<()> {
        let Some(start_time) = event.start_time else {
            // Adapters drop these already; guard against a stray one anyway.
            debug!(title = %event.title, "record without start time skipped");
            summary.skipped_records += 1;
            return Ok(());
        };

        enrich_location_fields(&mut event);

        if event.lat.is_none() || event.lng.is_none() {
            if let Some((lat, lng)) = self
                .geocoder
                .resolve(event.location_name.as_deref(), event.address.as_deref())
                .await
            {
                event.lat = Some(lat);
                event.lng = Some(lng);
            }
        } else if event.location_name.is_none() && event.address.is_none() {
            // Coordinates without any textual location: backfill a display
            // address via reverse lookup.
            if let (Some(lat), Some(lng)) = (event.lat, event.lng) {
                event.address = self.geocoder.reverse_resolve(lat, lng).await;
            }
        }

        let external_id = resolve_external_id(&event);
        let new_event = NewEvent {
            source: event.source.clone(),
            external_id,
            origin: EventOrigin::Parser,
            title: event.title.clone(),
            description: event.description.clone(),
            location_name: event.location_name.clone(),
            lat: event.lat,
            lng: event.lng,
            start_time,
            end_time: event.end_time,
            url: event.url.clone(),
        };

        match self.store.upsert_event(&new_event)? {
            UpsertOutcome::Inserted => summary.inserted += 1,
            UpsertOutcome::Updated => summary.updated += 1,
        }
        Ok(())
    }

    /// Periodic driver. Overlapping ticks are skipped, not queued, so a slow
    /// sweep never stacks up behind itself.
    pub async fn run(self: Arc<Self>, period: Duration) {
        let mut timer = tokio::time::interval(period);
        timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            timer.tick().await;
            if self
                .sweep_in_flight
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                debug!("ingestion sweep still running, skipping tick");
                continue;
            }
            if let Err(e) = self.sweep().await {
                warn!(error = %e, "ingestion sweep failed");
            }
            self.sweep_in_flight.store(false, Ordering::SeqCst);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geocode::{GeocodeBackend, GeocodeConfig};
    use crate::store::NewSource;
    use crate::types::{SourceAdapter, SourceKind};
    use chrono::TimeZone;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::Mutex;

    struct MockAdapter {
        outcomes: Mutex<Vec<Result<FetchOutcome>>>,
        calls: AtomicUsize,
    }

    impl MockAdapter {
        fn new(outcomes: Vec<Result<FetchOutcome>>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes),
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl SourceAdapter for MockAdapter {
        fn kind(&self) -> SourceKind {
            SourceKind::PullCalendar
        }

        async fn fetch(&self, _source: &Source) -> Result<FetchOutcome> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().await;
            if outcomes.is_empty() {
                Ok(FetchOutcome::NotModified)
            } else {
                outcomes.remove(0)
            }
        }
    }

    struct FixedGeocoder {
        coords: Option<(f64, f64)>,
    }

    #[async_trait::async_trait]
    impl GeocodeBackend for FixedGeocoder {
        async fn geocode(&self, _query: &str) -> Result<Option<(f64, f64)>> {
            Ok(self.coords)
        }

        async fn reverse(&self, _lat: f64, _lng: f64) -> Result<Option<String>> {
            Ok(Some("Jl. Danau Tamblingan 80, Sanur".to_string()))
        }
    }

    fn fast_geocoder(coords: Option<(f64, f64)>) -> Arc<GeocodeService> {
        Arc::new(GeocodeService::new(
            Arc::new(FixedGeocoder { coords }),
            GeocodeConfig {
                ttl: Duration::from_secs(3600),
                max_entries: 100,
                queries_per_second: 1000.0,
            },
        ))
    }

    fn scheduler_with(
        adapter: Arc<MockAdapter>,
        geocoder: Arc<GeocodeService>,
        ceiling: i64,
    ) -> (Arc<EventStore>, Scheduler) {
        let store = Arc::new(EventStore::open_in_memory().unwrap());
        let mut adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>> = HashMap::new();
        adapters.insert(SourceKind::PullCalendar, adapter);
        let registry = Arc::new(AdapterRegistry::with_adapters(adapters));
        let scheduler = Scheduler::new(store.clone(), registry, geocoder, 50, ceiling);
        (store, scheduler)
    }

    fn add_due_source(store: &EventStore) -> i64 {
        store
            .add_source(&NewSource {
                name: "Bali Community Calendar".into(),
                kind: SourceKind::PullCalendar,
                url: "https://example.com/cal.ics".into(),
                region: "bali".into(),
                // Always due again on the next sweep.
                freq_minutes: 0,
                oauth_token: None,
                api_key: None,
            })
            .unwrap()
    }

    fn raw_event(title: &str) -> RawEvent {
        let mut e = RawEvent::new(title, "bali_ics");
        e.external_id = Some(format!("ext-{}", title));
        e.start_time = Utc.with_ymd_and_hms(2025, 10, 1, 8, 0, 0).single();
        e.location_name = Some("Cafe Moka".into());
        e
    }

    #[tokio::test(start_paused = true)]
    async fn not_modified_is_a_healthy_zero_record_cycle() {
        let adapter = MockAdapter::new(vec![Ok(FetchOutcome::NotModified)]);
        let (store, scheduler) = scheduler_with(adapter, fast_geocoder(None), 5);
        let id = add_due_source(&store);
        // A prior failure must be wiped by the healthy cycle.
        store.record_fetch_failure(id, Some(500), 5).unwrap();

        let summary = scheduler.sweep().await.unwrap();
        assert_eq!(summary.not_modified, 1);
        assert_eq!(summary.inserted, 0);
        assert_eq!(store.count_events().unwrap(), 0);

        let source = store.get_source(id).unwrap().unwrap();
        assert_eq!(source.consecutive_failures, 0);
        assert_eq!(source.last_status, Some(304));
        assert!(source.last_fetch_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn fetched_records_are_geocoded_and_upserted() {
        let adapter = MockAdapter::new(vec![Ok(FetchOutcome::Fetched {
            events: vec![raw_event("Beach Cleanup")],
            etag: Some("\"abc\"".into()),
            last_modified: None,
        })]);
        let (store, scheduler) = scheduler_with(adapter, fast_geocoder(Some((-8.6701, 115.2579))), 5);
        let id = add_due_source(&store);

        let summary = scheduler.sweep().await.unwrap();
        assert_eq!(summary.fetched, 1);
        assert_eq!(summary.inserted, 1);

        let row = store
            .get_event("bali_ics", "ext-Beach Cleanup")
            .unwrap()
            .unwrap();
        assert_eq!(row.lat, Some(-8.6701));
        assert_eq!(row.lng, Some(115.2579));
        assert_eq!(row.location_name.as_deref(), Some("Cafe Moka"));

        let source = store.get_source(id).unwrap().unwrap();
        assert_eq!(source.etag.as_deref(), Some("\"abc\""));
    }

    #[tokio::test(start_paused = true)]
    async fn refetching_the_same_record_updates_instead_of_duplicating() {
        let fetched = || {
            Ok(FetchOutcome::Fetched {
                events: vec![raw_event("Beach Cleanup")],
                etag: None,
                last_modified: None,
            })
        };
        let adapter = MockAdapter::new(vec![fetched(), fetched()]);
        let (store, scheduler) = scheduler_with(adapter, fast_geocoder(None), 5);
        add_due_source(&store);

        let first = scheduler.sweep().await.unwrap();
        assert_eq!(first.inserted, 1);

        let second = scheduler.sweep().await.unwrap();
        assert_eq!(second.inserted, 0);
        assert_eq!(second.updated, 1);
        assert_eq!(store.count_events().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failures_accumulate_until_the_source_is_disabled() {
        let adapter = MockAdapter::new(
            (0..3)
                .map(|_| Err(crate::error::PipelineError::Config("boom".into())))
                .collect(),
        );
        let (store, scheduler) = scheduler_with(adapter.clone(), fast_geocoder(None), 3);
        let id = add_due_source(&store);

        for expected_failures in 1..=2 {
            let summary = scheduler.sweep().await.unwrap();
            assert_eq!(summary.failed, 1);
            assert_eq!(summary.disabled, 0);
            let source = store.get_source(id).unwrap().unwrap();
            assert_eq!(source.consecutive_failures, expected_failures);
            assert!(source.enabled);
        }

        let summary = scheduler.sweep().await.unwrap();
        assert_eq!(summary.disabled, 1);
        assert!(!store.get_source(id).unwrap().unwrap().enabled);

        // Disabled sources never come up as due again.
        let summary = scheduler.sweep().await.unwrap();
        assert_eq!(summary.sources_due, 0);
        assert_eq!(adapter.call_count(), 3);
    }

    fn http_status_error(status: u16) -> PipelineError {
        let response = http::Response::builder()
            .status(status)
            .body("upstream error")
            .unwrap();
        let err = reqwest::Response::from(response)
            .error_for_status()
            .unwrap_err();
        PipelineError::Http(err)
    }

    #[tokio::test(start_paused = true)]
    async fn failing_http_status_lands_on_the_source() {
        let adapter = MockAdapter::new(vec![Err(http_status_error(503))]);
        let (store, scheduler) = scheduler_with(adapter, fast_geocoder(None), 5);
        let id = add_due_source(&store);

        let summary = scheduler.sweep().await.unwrap();
        assert_eq!(summary.failed, 1);

        let source = store.get_source(id).unwrap().unwrap();
        assert_eq!(source.last_status, Some(503));
        assert_eq!(source.consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn records_without_a_start_time_are_skipped() {
        let mut no_start = raw_event("Dateless Meetup");
        no_start.start_time = None;
        let adapter = MockAdapter::new(vec![Ok(FetchOutcome::Fetched {
            events: vec![no_start, raw_event("Beach Cleanup")],
            etag: None,
            last_modified: None,
        })]);
        let (store, scheduler) = scheduler_with(adapter, fast_geocoder(None), 5);
        add_due_source(&store);

        let summary = scheduler.sweep().await.unwrap();
        assert_eq!(summary.skipped_records, 1);
        assert_eq!(summary.inserted, 1);
        assert_eq!(store.count_events().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn coordinates_without_text_get_a_reverse_looked_up_address() {
        let mut with_coords = raw_event("Sunset Yoga");
        with_coords.location_name = None;
        with_coords.lat = Some(-8.6701);
        with_coords.lng = Some(115.2579);
        let adapter = MockAdapter::new(vec![Ok(FetchOutcome::Fetched {
            events: vec![with_coords],
            etag: None,
            last_modified: None,
        })]);
        let (store, scheduler) = scheduler_with(adapter, fast_geocoder(None), 5);
        add_due_source(&store);

        scheduler.sweep().await.unwrap();
        let row = store.get_event("bali_ics", "ext-Sunset Yoga").unwrap().unwrap();
        // The reverse-resolved address feeds geocoding context, not the row;
        // coordinates survive untouched.
        assert_eq!(row.lat, Some(-8.6701));
        assert_eq!(row.lng, Some(115.2579));
    }
}
