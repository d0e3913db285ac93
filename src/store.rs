use crate::error::Result;
use crate::types::{EventOrigin, Source, SourceKind};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;
use tracing::debug;

/// Arguments for registering a new source.
#[derive(Debug, Clone)]
pub struct NewSource {
    pub name: String,
    pub kind: SourceKind,
    pub url: String,
    pub region: String,
    pub freq_minutes: i64,
    pub oauth_token: Option<String>,
    pub api_key: Option<String>,
}

/// A normalized record ready for the upsert engine.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub source: String,
    pub external_id: String,
    pub origin: EventOrigin,
    pub title: String,
    pub description: Option<String>,
    pub location_name: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub url: Option<String>,
}

/// A persisted event row.
#[derive(Debug, Clone)]
pub struct EventRow {
    pub id: i64,
    pub source: String,
    pub external_id: String,
    pub origin: EventOrigin,
    pub title: String,
    pub title_ru: Option<String>,
    pub description: Option<String>,
    pub description_ru: Option<String>,
    pub location_name: Option<String>,
    pub location_name_ru: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub translation_attempts: i64,
    pub translation_failed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Outcome of recording a fetch failure against a source.
#[derive(Debug, Clone, Copy)]
pub struct FailureOutcome {
    pub consecutive_failures: i64,
    /// True exactly when this failure crossed the ceiling and disabled the source.
    pub disabled_now: bool,
}

/// Geographic bounding box for downstream window reads.
#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

/// SQLite-backed store for sources and events.
///
/// The connection is guarded by a mutex; every method takes the lock for the
/// duration of one statement or one short transaction, so concurrent adapters
/// can upsert independently while the (source, external_id) constraint stays
/// the only cross-adapter ordering requirement.
pub struct EventStore {
    conn: Mutex<Connection>,
}

impl EventStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;
            CREATE TABLE IF NOT EXISTS sources (
                id                    INTEGER PRIMARY KEY,
                name                  TEXT NOT NULL,
                kind                  TEXT NOT NULL,
                url                   TEXT NOT NULL UNIQUE,
                region                TEXT NOT NULL DEFAULT '',
                enabled               INTEGER NOT NULL DEFAULT 1,
                freq_minutes          INTEGER NOT NULL DEFAULT 60,
                etag                  TEXT,
                last_modified         TEXT,
                last_status           INTEGER,
                last_fetch_at         INTEGER,
                consecutive_failures  INTEGER NOT NULL DEFAULT 0,
                oauth_token           TEXT,
                api_key               TEXT
            );
            CREATE TABLE IF NOT EXISTS events (
                id                    INTEGER PRIMARY KEY,
                source                TEXT NOT NULL,
                external_id           TEXT NOT NULL,
                origin                TEXT NOT NULL DEFAULT 'parser',
                title                 TEXT NOT NULL,
                title_ru              TEXT,
                description           TEXT,
                description_ru        TEXT,
                location_name         TEXT,
                location_name_ru      TEXT,
                lat                   REAL,
                lng                   REAL,
                start_time            TEXT NOT NULL,
                end_time              TEXT,
                url                   TEXT,
                translation_attempts  INTEGER NOT NULL DEFAULT 0,
                translation_failed    INTEGER NOT NULL DEFAULT 0,
                created_at            TEXT NOT NULL,
                updated_at            TEXT NOT NULL,
                UNIQUE(source, external_id)
            );
            CREATE INDEX IF NOT EXISTS idx_events_start_time ON events(start_time);
            CREATE INDEX IF NOT EXISTS idx_events_lat_lng ON events(lat, lng);
            "#,
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned lock means a previous statement panicked mid-flight;
        // the connection itself is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    // -- Source registration and health --------------------------------------

    pub fn add_source(&self, new: &NewSource) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO sources (name, kind, url, region, freq_minutes, oauth_token, api_key)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                new.name,
                new.kind.as_str(),
                new.url,
                new.region,
                new.freq_minutes,
                new.oauth_token,
                new.api_key
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn get_source(&self, id: i64) -> Result<Option<Source>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM sources WHERE id = ?1")?;
        let source = stmt.query_row(params![id], row_to_source).optional()?;
        Ok(source)
    }

    pub fn list_sources(&self) -> Result<Vec<Source>> {
        let conn = self.lock();
        let mut stmt = conn.prepare("SELECT * FROM sources ORDER BY id ASC")?;
        let rows = stmt.query_map([], row_to_source)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Operator action; auto-disable is the only other path that flips this flag.
    pub fn set_source_enabled(&self, id: i64, enabled: bool) -> Result<usize> {
        let conn = self.lock();
        let n = conn.execute(
            "UPDATE sources SET enabled = ?1, consecutive_failures = CASE WHEN ?1 THEN 0 ELSE consecutive_failures END
             WHERE id = ?2",
            params![enabled, id],
        )?;
        Ok(n)
    }

    /// Enabled sources whose fetch interval has elapsed, oldest first.
    pub fn due_sources(&self, now: DateTime<Utc>, batch: usize) -> Result<Vec<Source>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM sources
             WHERE enabled = 1
               AND (last_fetch_at IS NULL OR ?1 - last_fetch_at >= freq_minutes * 60)
             ORDER BY COALESCE(last_fetch_at, 0) ASC
             LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![now.timestamp(), batch as i64], row_to_source)?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Successful fetch (including not-modified): store validators, reset the
    /// failure counter and advance the fetch clock.
    pub fn record_fetch_success(
        &self,
        id: i64,
        now: DateTime<Utc>,
        status: u16,
        etag: Option<&str>,
        last_modified: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE sources
             SET last_fetch_at = ?1,
                 last_status = ?2,
                 etag = COALESCE(?3, etag),
                 last_modified = COALESCE(?4, last_modified),
                 consecutive_failures = 0
             WHERE id = ?5",
            params![now.timestamp(), status, etag, last_modified, id],
        )?;
        Ok(())
    }

    /// Failed fetch: bump the counter and auto-disable at the ceiling.
    pub fn record_fetch_failure(
        &self,
        id: i64,
        status: Option<u16>,
        ceiling: i64,
    ) -> Result<FailureOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE sources SET consecutive_failures = consecutive_failures + 1, last_status = ?1
             WHERE id = ?2",
            params![status, id],
        )?;
        let (failures, enabled): (i64, bool) = tx.query_row(
            "SELECT consecutive_failures, enabled FROM sources WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        let disabled_now = enabled && failures >= ceiling;
        if disabled_now {
            tx.execute("UPDATE sources SET enabled = 0 WHERE id = ?1", params![id])?;
        }
        tx.commit()?;
        Ok(FailureOutcome {
            consecutive_failures: failures,
            disabled_now,
        })
    }

    // -- Upsert engine -------------------------------------------------------

    /// Idempotent insert-or-merge keyed on (source, external_id).
    ///
    /// The merge never regresses a present value to NULL and always refreshes
    /// `updated_at`; one statement, one atomic unit per record.
    pub fn upsert_event(&self, event: &NewEvent) -> Result<UpsertOutcome> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM events WHERE source = ?1 AND external_id = ?2",
                params![event.source, event.external_id],
                |row| row.get(0),
            )
            .optional()?;

        let now = Utc::now().to_rfc3339();
        tx.execute(
            "INSERT INTO events (source, external_id, origin, title, description, location_name,
                                 lat, lng, start_time, end_time, url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)
             ON CONFLICT(source, external_id) DO UPDATE SET
                 title = excluded.title,
                 description = COALESCE(excluded.description, events.description),
                 location_name = COALESCE(excluded.location_name, events.location_name),
                 lat = COALESCE(excluded.lat, events.lat),
                 lng = COALESCE(excluded.lng, events.lng),
                 start_time = excluded.start_time,
                 end_time = COALESCE(excluded.end_time, events.end_time),
                 url = COALESCE(excluded.url, events.url),
                 updated_at = excluded.updated_at",
            params![
                event.source,
                event.external_id,
                event.origin.as_str(),
                event.title,
                event.description,
                event.location_name,
                event.lat,
                event.lng,
                event.start_time.to_rfc3339(),
                event.end_time.map(|t| t.to_rfc3339()),
                event.url,
                now,
            ],
        )?;
        tx.commit()?;

        let outcome = if existing.is_some() {
            UpsertOutcome::Updated
        } else {
            UpsertOutcome::Inserted
        };
        debug!(source = %event.source, external_id = %event.external_id, ?outcome, "upserted event");
        Ok(outcome)
    }

    // -- Downstream reads ----------------------------------------------------

    /// Row-level read access for the downstream search collaborator.
    pub fn events_in_window(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        bbox: Option<BoundingBox>,
        source: Option<&str>,
    ) -> Result<Vec<EventRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM events
             WHERE start_time >= ?1 AND start_time <= ?2
               AND (?3 IS NULL OR source = ?3)
               AND (?4 IS NULL OR (lat BETWEEN ?4 AND ?5 AND lng BETWEEN ?6 AND ?7))
             ORDER BY start_time ASC",
        )?;
        let rows = stmt.query_map(
            params![
                from.to_rfc3339(),
                to.to_rfc3339(),
                source,
                bbox.map(|b| b.min_lat),
                bbox.map(|b| b.max_lat),
                bbox.map(|b| b.min_lng),
                bbox.map(|b| b.max_lng),
            ],
            row_to_event,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    pub fn get_event(&self, source: &str, external_id: &str) -> Result<Option<EventRow>> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT * FROM events WHERE source = ?1 AND external_id = ?2")?;
        let row = stmt
            .query_row(params![source, external_id], row_to_event)
            .optional()?;
        Ok(row)
    }

    pub fn count_events(&self) -> Result<i64> {
        let conn = self.lock();
        let n = conn.query_row("SELECT COUNT(*) FROM events", [], |row| row.get(0))?;
        Ok(n)
    }

    // -- Translation bookkeeping ---------------------------------------------

    /// Rows still lacking a translated title, within the retry budget.
    pub fn events_needing_translation(
        &self,
        origin: EventOrigin,
        limit: usize,
        retry_ceiling: i64,
    ) -> Result<Vec<EventRow>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT * FROM events
             WHERE origin = ?1
               AND title_ru IS NULL
               AND translation_failed = 0
               AND translation_attempts < ?2
             ORDER BY id ASC
             LIMIT ?3",
        )?;
        let rows = stmt.query_map(
            params![origin.as_str(), retry_ceiling, limit as i64],
            row_to_event,
        )?;
        Ok(rows.collect::<std::result::Result<Vec<_>, _>>()?)
    }

    /// Successful translation: write derived fields, reset the retry counter.
    pub fn store_translation(
        &self,
        event_id: i64,
        title_ru: &str,
        description_ru: Option<&str>,
        location_name_ru: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock();
        conn.execute(
            "UPDATE events
             SET title_ru = ?1,
                 description_ru = COALESCE(?2, description_ru),
                 location_name_ru = COALESCE(?3, location_name_ru),
                 translation_attempts = 0,
                 updated_at = ?4
             WHERE id = ?5",
            params![
                title_ru,
                description_ru,
                location_name_ru,
                Utc::now().to_rfc3339(),
                event_id
            ],
        )?;
        Ok(())
    }

    /// Semantic translation failure: bump the counter; at the ceiling the row
    /// is marked permanently failed and leaves the sweep population.
    pub fn bump_translation_attempts(&self, event_id: i64, ceiling: i64) -> Result<bool> {
        let mut conn = self.lock();
        let tx = conn.transaction()?;
        tx.execute(
            "UPDATE events SET translation_attempts = translation_attempts + 1 WHERE id = ?1",
            params![event_id],
        )?;
        let attempts: i64 = tx.query_row(
            "SELECT translation_attempts FROM events WHERE id = ?1",
            params![event_id],
            |row| row.get(0),
        )?;
        let failed = attempts >= ceiling;
        if failed {
            tx.execute(
                "UPDATE events SET translation_failed = 1 WHERE id = ?1",
                params![event_id],
            )?;
        }
        tx.commit()?;
        Ok(failed)
    }
}

fn parse_ts(s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

fn row_to_source(row: &Row<'_>) -> rusqlite::Result<Source> {
    let kind_str: String = row.get("kind")?;
    let last_fetch_at: Option<i64> = row.get("last_fetch_at")?;
    Ok(Source {
        id: row.get("id")?,
        name: row.get("name")?,
        kind: SourceKind::from_str(&kind_str).unwrap_or(SourceKind::PullCalendar),
        url: row.get("url")?,
        region: row.get("region")?,
        enabled: row.get("enabled")?,
        freq_minutes: row.get("freq_minutes")?,
        etag: row.get("etag")?,
        last_modified: row.get("last_modified")?,
        last_status: row.get("last_status")?,
        last_fetch_at: last_fetch_at.and_then(|ts| DateTime::from_timestamp(ts, 0)),
        consecutive_failures: row.get("consecutive_failures")?,
        oauth_token: row.get("oauth_token")?,
        api_key: row.get("api_key")?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<EventRow> {
    let origin_str: String = row.get("origin")?;
    let end_time: Option<String> = row.get("end_time")?;
    Ok(EventRow {
        id: row.get("id")?,
        source: row.get("source")?,
        external_id: row.get("external_id")?,
        origin: EventOrigin::from_str(&origin_str).unwrap_or(EventOrigin::Parser),
        title: row.get("title")?,
        title_ru: row.get("title_ru")?,
        description: row.get("description")?,
        description_ru: row.get("description_ru")?,
        location_name: row.get("location_name")?,
        location_name_ru: row.get("location_name_ru")?,
        lat: row.get("lat")?,
        lng: row.get("lng")?,
        start_time: parse_ts(row.get("start_time")?)?,
        end_time: end_time.map(parse_ts).transpose()?,
        url: row.get("url")?,
        translation_attempts: row.get("translation_attempts")?,
        translation_failed: row.get("translation_failed")?,
        created_at: parse_ts(row.get("created_at")?)?,
        updated_at: parse_ts(row.get("updated_at")?)?,
    })
}
