use crate::error::Result;
use crate::types::{FetchOutcome, RawEvent, Source, SourceAdapter, SourceKind};
use chrono::{DateTime, Datelike, Duration, FixedOffset, NaiveDate, NaiveTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use tracing::{info, instrument, warn};

/// Forum-scrape adapter: listing page of event cards with free-text Russian
/// dates and optional embedded map links.
pub struct ForumAdapter {
    client: reqwest::Client,
}

impl ForumAdapter {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl SourceAdapter for ForumAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::ForumScrape
    }

    #[instrument(skip(self, source), fields(source = %source.name))]
    async fn fetch(&self, source: &Source) -> Result<FetchOutcome> {
        let response = self.client.get(&source.url).send().await?.error_for_status()?;
        let body = response.text().await?;

        let now = Utc::now().with_timezone(&region_offset(&source.region));
        let (events, dropped) = parse_forum_listing(&body, &source.name, now);
        info!(parsed = events.len(), dropped, "parsed forum listing");
        Ok(FetchOutcome::fetched(events))
    }
}

/// Local offset for interpreting forum date words like "сегодня".
fn region_offset(region: &str) -> FixedOffset {
    let hours = match region {
        "bali" => 8,
        // Moscow default for the Russian-speaking forums we scrape.
        _ => 3,
    };
    FixedOffset::east_opt(hours * 3600).expect("static offset")
}

static CARD_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("div.event-card, article.event, li.event").unwrap()
});
static LINK_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());
static DATE_SELECTOR: Lazy<Selector> =
    Lazy::new(|| Selector::parse(".event-date, .date, time").unwrap());
static MAP_SELECTOR: Lazy<Selector> = Lazy::new(|| {
    Selector::parse("a[href*='maps.google'], a[href*='google.com/maps'], a[href*='maps.app'], a[href*='yandex.ru/maps']")
        .unwrap()
});

/// Parse the listing page into raw events. Cards whose date text yields no
/// parseable time are dropped rather than guessed.
pub fn parse_forum_listing(
    html: &str,
    source_tag: &str,
    now: DateTime<FixedOffset>,
) -> (Vec<RawEvent>, usize) {
    let document = Html::parse_document(html);
    let mut events = Vec::new();
    let mut dropped = 0usize;

    for card in document.select(&CARD_SELECTOR) {
        match card_to_raw(&card, source_tag, now) {
            Some(event) => events.push(event),
            None => dropped += 1,
        }
    }
    (events, dropped)
}

fn card_to_raw(
    card: &ElementRef<'_>,
    source_tag: &str,
    now: DateTime<FixedOffset>,
) -> Option<RawEvent> {
    let link = card.select(&LINK_SELECTOR).next()?;
    let title = link.text().collect::<String>().trim().to_string();
    if title.is_empty() {
        return None;
    }
    let url = link.value().attr("href").map(|s| s.to_string());

    let date_text = card
        .select(&DATE_SELECTOR)
        .next()
        .map(|el| el.text().collect::<String>())
        .unwrap_or_else(|| card.text().collect::<String>());

    let Some(when) = parse_event_when(&date_text, now) else {
        warn!(%title, "dropping forum card without a parseable time");
        return None;
    };

    let mut event = RawEvent::new(title, source_tag);
    event.start_time = Some(when.start.with_timezone(&Utc));
    event.end_time = when.end.map(|t| t.with_timezone(&Utc));
    event.external_id = url.clone();
    event.url = url;

    if let Some(map_link) = card.select(&MAP_SELECTOR).next() {
        if let Some(href) = map_link.value().attr("href") {
            if let Some((lat, lng)) = coords_from_map_link(href) {
                event.lat = Some(lat);
                event.lng = Some(lng);
            }
        }
    }
    Some(event)
}

/// Resolved start/end for a card, in the forum's local offset.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EventWhen {
    pub start: DateTime<FixedOffset>,
    pub end: Option<DateTime<FixedOffset>>,
}

// Genitive month-name prefixes; prefix matching tolerates the case endings
// the forum authors actually type.
const MONTH_PREFIXES: [(&str, u32); 12] = [
    ("янва", 1),
    ("февра", 2),
    ("март", 3),
    ("апре", 4),
    ("мая", 5),
    ("июн", 6),
    ("июл", 7),
    ("авгу", 8),
    ("сент", 9),
    ("октя", 10),
    ("ноя", 11),
    ("дека", 12),
];

static DAY_MONTH: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d{1,2})\s+([а-яё]+)").unwrap());
static TIME_RANGE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"с\s*(\d{1,2})[:.](\d{2})\s*до\s*(\d{1,2})[:.](\d{2})").unwrap());
static SINGLE_TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:в\s*)?(\d{1,2})[:.](\d{2})").unwrap());

fn month_from_word(word: &str) -> Option<u32> {
    MONTH_PREFIXES
        .iter()
        .find(|(prefix, _)| word.starts_with(prefix))
        .map(|(_, month)| *month)
}

fn resolve_date(text: &str, now: DateTime<FixedOffset>) -> Option<NaiveDate> {
    if text.contains("сегодня") {
        return Some(now.date_naive());
    }
    if text.contains("завтра") {
        return Some(now.date_naive() + Duration::days(1));
    }
    for caps in DAY_MONTH.captures_iter(text) {
        let day: u32 = caps[1].parse().ok()?;
        if let Some(month) = month_from_word(&caps[2]) {
            // A month already behind us means the event is next year.
            let year = if month < now.month() {
                now.year() + 1
            } else {
                now.year()
            };
            return NaiveDate::from_ymd_opt(year, month, day);
        }
    }
    None
}

/// Parse a free-text Russian date line against a reference "now".
///
/// Returns None when the text yields no usable time component: publishing a
/// guessed start time is worse than dropping the record. "весь день" counts
/// as a usable time (midnight start, open end). An explicit range whose end
/// is earlier than its start rolls the end over to the next day.
pub fn parse_event_when(text: &str, now: DateTime<FixedOffset>) -> Option<EventWhen> {
    let text = text.to_lowercase();
    let date = resolve_date(&text, now)?;
    let offset = *now.offset();

    let at = |d: NaiveDate, t: NaiveTime| offset.from_local_datetime(&d.and_time(t)).single();

    if let Some(caps) = TIME_RANGE.captures(&text) {
        let start_t = NaiveTime::from_hms_opt(caps[1].parse().ok()?, caps[2].parse().ok()?, 0)?;
        let end_t = NaiveTime::from_hms_opt(caps[3].parse().ok()?, caps[4].parse().ok()?, 0)?;
        let start = at(date, start_t)?;
        // End before start implies roll-over past midnight.
        let end_date = if end_t < start_t { date + Duration::days(1) } else { date };
        let end = at(end_date, end_t)?;
        return Some(EventWhen {
            start,
            end: Some(end),
        });
    }

    if text.contains("весь день") {
        let start = at(date, NaiveTime::from_hms_opt(0, 0, 0)?)?;
        return Some(EventWhen { start, end: None });
    }

    if let Some(caps) = SINGLE_TIME.captures(&text) {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps[2].parse().ok()?;
        let start = at(date, NaiveTime::from_hms_opt(hour, minute, 0)?)?;
        return Some(EventWhen { start, end: None });
    }

    // Date-only: no time component, drop upstream.
    None
}

static AT_COORDS: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"@(-?\d{1,3}\.\d+),(-?\d{1,3}\.\d+)").unwrap());
static QUERY_COORDS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"[?&](?:q|query|ll|destination)=(-?\d{1,3}\.\d+)(?:,|%2C)(-?\d{1,3}\.\d+)").unwrap()
});

/// Coordinates out of an embedded map link. Handles the `@lat,lng` path form
/// and the `q=lat,lng` query form.
pub fn coords_from_map_link(href: &str) -> Option<(f64, f64)> {
    let caps = AT_COORDS
        .captures(href)
        .or_else(|| QUERY_COORDS.captures(href))?;
    let lat: f64 = caps[1].parse().ok()?;
    let lng: f64 = caps[2].parse().ok()?;
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return None;
    }
    Some((lat, lng))
}
