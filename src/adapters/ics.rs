use crate::error::Result;
use crate::normalize::canonical_title;
use crate::types::{FetchOutcome, RawEvent, Source, SourceAdapter, SourceKind};
use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use reqwest::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

/// Pull-calendar adapter: conditional GET against an ICS feed.
pub struct IcsAdapter {
    client: reqwest::Client,
}

impl IcsAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for IcsAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::PullCalendar
    }

    #[instrument(skip(self, source), fields(source = %source.name))]
    async fn fetch(&self, source: &Source) -> Result<FetchOutcome> {
        let mut request = self.client.get(&source.url);
        if let Some(etag) = &source.etag {
            request = request.header(IF_NONE_MATCH, etag);
        }
        if let Some(last_modified) = &source.last_modified {
            request = request.header(IF_MODIFIED_SINCE, last_modified);
        }

        let response = request.send().await?;
        if response.status() == StatusCode::NOT_MODIFIED {
            debug!("feed unchanged (304)");
            return Ok(FetchOutcome::NotModified);
        }
        let response = response.error_for_status()?;

        let etag = header_string(&response, ETAG);
        let last_modified = header_string(&response, LAST_MODIFIED);
        let body = response.text().await?;

        let (events, dropped) = parse_ics(&body, &source.name, &source.url);
        info!(
            parsed = events.len(),
            dropped, "parsed ICS feed"
        );
        Ok(FetchOutcome::Fetched {
            events,
            etag,
            last_modified,
        })
    }
}

fn header_string(response: &reqwest::Response, name: reqwest::header::HeaderName) -> Option<String> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
}

/// Deterministic identity for a feed item, stable across repeated parses of an
/// unchanged feed even when the feed carries no UIDs of its own.
pub fn derived_external_id(
    source_tag: &str,
    feed_url: &str,
    title: &str,
    start: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source_tag.as_bytes());
    hasher.update(b"|");
    hasher.update(feed_url.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_title(title).as_bytes());
    hasher.update(b"|");
    hasher.update(start.to_rfc3339().as_bytes());
    let digest = hex::encode(hasher.finalize());
    format!("{}-{}", source_tag, &digest[..16])
}

/// Parse an ICS document into raw events. Returns the events plus the count of
/// VEVENTs dropped for lacking a resolvable start time or title.
pub fn parse_ics(text: &str, source_tag: &str, feed_url: &str) -> (Vec<RawEvent>, usize) {
    let mut events = Vec::new();
    let mut dropped = 0usize;

    for block in vevent_blocks(text) {
        match vevent_to_raw(&block, source_tag, feed_url) {
            Some(event) => events.push(event),
            None => dropped += 1,
        }
    }
    (events, dropped)
}

/// RFC 5545 line unfolding: a line starting with space or tab continues the
/// previous line.
fn unfold_lines(text: &str) -> Vec<String> {
    let mut lines: Vec<String> = Vec::new();
    for raw in text.lines() {
        if (raw.starts_with(' ') || raw.starts_with('\t')) && !lines.is_empty() {
            let idx = lines.len() - 1;
            lines[idx].push_str(&raw[1..]);
        } else {
            lines.push(raw.trim_end_matches('\r').to_string());
        }
    }
    lines
}

fn vevent_blocks(text: &str) -> Vec<Vec<(String, String)>> {
    let mut blocks = Vec::new();
    let mut current: Option<Vec<(String, String)>> = None;

    for line in unfold_lines(text) {
        if line.eq_ignore_ascii_case("BEGIN:VEVENT") {
            current = Some(Vec::new());
            continue;
        }
        if line.eq_ignore_ascii_case("END:VEVENT") {
            if let Some(block) = current.take() {
                blocks.push(block);
            }
            continue;
        }
        if let Some(block) = &mut current {
            if let Some((name, value)) = split_property(&line) {
                block.push((name, value));
            }
        }
    }
    blocks
}

/// Split `NAME;PARAM=X:VALUE` into the bare property name and its value.
fn split_property(line: &str) -> Option<(String, String)> {
    let colon = line.find(':')?;
    let (name_part, value) = line.split_at(colon);
    let name = name_part
        .split(';')
        .next()
        .unwrap_or(name_part)
        .to_ascii_uppercase();
    Some((name, value[1..].to_string()))
}

fn prop<'a>(block: &'a [(String, String)], name: &str) -> Option<&'a str> {
    block
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

fn unescape_text(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') | Some('N') => out.push('\n'),
                Some(other) => out.push(other),
                None => {}
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Parse the ICS date-time forms we accept. Naive stamps are treated as UTC;
/// date-only values become midnight UTC.
fn parse_ics_datetime(value: &str) -> Option<DateTime<Utc>> {
    let v = value.trim();
    let naive_part = v.strip_suffix('Z').unwrap_or(v);
    if let Ok(dt) = NaiveDateTime::parse_from_str(naive_part, "%Y%m%dT%H%M%S") {
        return Some(Utc.from_utc_datetime(&dt));
    }
    if let Ok(d) = NaiveDate::parse_from_str(v, "%Y%m%d") {
        return Some(Utc.from_utc_datetime(&d.and_hms_opt(0, 0, 0)?));
    }
    None
}

fn vevent_to_raw(
    block: &[(String, String)],
    source_tag: &str,
    feed_url: &str,
) -> Option<RawEvent> {
    let title = prop(block, "SUMMARY").map(unescape_text)?;
    if title.trim().is_empty() {
        return None;
    }
    let start = prop(block, "DTSTART").and_then(parse_ics_datetime);
    let Some(start) = start else {
        warn!(%title, "dropping VEVENT without a resolvable start");
        return None;
    };

    let mut event = RawEvent::new(title.trim(), source_tag);
    event.start_time = Some(start);
    event.end_time = prop(block, "DTEND").and_then(parse_ics_datetime);
    event.description = prop(block, "DESCRIPTION").map(unescape_text);
    event.location_name = prop(block, "LOCATION").map(unescape_text);
    event.url = prop(block, "URL").map(|s| s.to_string());
    if let Some(geo) = prop(block, "GEO") {
        let mut parts = geo.split(';');
        let lat = parts.next().and_then(|p| p.trim().parse::<f64>().ok());
        let lng = parts.next().and_then(|p| p.trim().parse::<f64>().ok());
        if let (Some(lat), Some(lng)) = (lat, lng) {
            event.lat = Some(lat);
            event.lng = Some(lng);
        }
    }
    // A feed-native UID is the stronger identity; derive one only without it.
    event.external_id = match prop(block, "UID").map(str::trim).filter(|u| !u.is_empty()) {
        Some(uid) => Some(uid.to_string()),
        None => Some(derived_external_id(source_tag, feed_url, &event.title, start)),
    };
    Some(event)
}
