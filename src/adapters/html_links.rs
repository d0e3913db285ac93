use crate::adapters::ics::parse_ics;
use crate::error::Result;
use crate::types::{FetchOutcome, RawEvent, Source, SourceAdapter, SourceKind};
use once_cell::sync::Lazy;
use scraper::{Html, Selector};
use tracing::{debug, info, instrument, warn};

/// HTML link-discovery adapter: fetches a listing page, follows a bounded
/// number of candidate detail links, and feeds any calendar-export link it
/// finds there into the ICS parser.
pub struct HtmlLinksAdapter {
    client: reqwest::Client,
    /// Detail pages visited per listing page; keeps the crawl bounded.
    detail_cap: usize,
}

impl HtmlLinksAdapter {
    pub fn new(client: reqwest::Client, detail_cap: usize) -> Self {
        Self { client, detail_cap }
    }

    async fn fetch_text(&self, url: &str) -> Result<String> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        Ok(response.text().await?)
    }
}

#[async_trait::async_trait]
impl SourceAdapter for HtmlLinksAdapter {
    fn kind(&self) -> SourceKind {
        SourceKind::HtmlListing
    }

    #[instrument(skip(self, source), fields(source = %source.name))]
    async fn fetch(&self, source: &Source) -> Result<FetchOutcome> {
        let listing = self.fetch_text(&source.url).await?;
        let candidates = discover_detail_links(&listing, &source.url, self.detail_cap);
        debug!(candidates = candidates.len(), "discovered detail links");

        let mut events: Vec<RawEvent> = Vec::new();
        for detail_url in &candidates {
            // A detail page that fails to load or has no export link is not
            // an error for the cycle; the rest of the candidates still run.
            let detail = match self.fetch_text(detail_url).await {
                Ok(body) => body,
                Err(e) => {
                    warn!(url = %detail_url, error = %e, "detail page fetch failed");
                    continue;
                }
            };
            let Some(export_url) = find_calendar_export_link(&detail, detail_url) else {
                continue;
            };
            match self.fetch_text(&export_url).await {
                Ok(ics_body) => {
                    let (mut parsed, _dropped) = parse_ics(&ics_body, &source.name, &export_url);
                    for event in &mut parsed {
                        if event.url.is_none() {
                            event.url = Some(detail_url.clone());
                        }
                    }
                    events.append(&mut parsed);
                }
                Err(e) => {
                    warn!(url = %export_url, error = %e, "calendar export fetch failed");
                }
            }
        }

        info!(parsed = events.len(), visited = candidates.len(), "link discovery cycle done");
        Ok(FetchOutcome::fetched(events))
    }
}

static ANCHOR_SELECTOR: Lazy<Selector> = Lazy::new(|| Selector::parse("a[href]").unwrap());

const DETAIL_MARKERS: [&str; 4] = ["/event", "/events/", "/e/", "/activity"];
const EXPORT_MARKERS: [&str; 3] = [".ics", "ical", "export"];

fn host_of(url: &str) -> Option<String> {
    let after_scheme = url.split("://").nth(1)?;
    Some(after_scheme.split('/').next()?.to_string())
}

/// Resolve an href against the page it appeared on. Only absolute paths and
/// absolute URLs are expected from the listing pages we handle.
fn absolutize(href: &str, base_url: &str) -> Option<String> {
    if href.starts_with("http://") || href.starts_with("https://") {
        return Some(href.to_string());
    }
    if let Some(path) = href.strip_prefix('/') {
        let scheme = base_url.split("://").next()?;
        let host = host_of(base_url)?;
        return Some(format!("{}://{}/{}", scheme, host, path));
    }
    None
}

/// Candidate detail-page links: same-host anchors whose path looks like an
/// event detail page, deduplicated, capped.
pub fn discover_detail_links(html: &str, base_url: &str, cap: usize) -> Vec<String> {
    let document = Html::parse_document(html);
    let base_host = host_of(base_url);
    let mut seen = std::collections::HashSet::new();
    let mut links = Vec::new();

    for anchor in document.select(&ANCHOR_SELECTOR) {
        let Some(href) = anchor.value().attr("href") else {
            continue;
        };
        let Some(url) = absolutize(href, base_url) else {
            continue;
        };
        if host_of(&url) != base_host {
            continue;
        }
        let lower = url.to_lowercase();
        if !DETAIL_MARKERS.iter().any(|m| lower.contains(m)) {
            continue;
        }
        if url == base_url || !seen.insert(url.clone()) {
            continue;
        }
        links.push(url);
        if links.len() >= cap {
            break;
        }
    }
    links
}

/// First calendar-export link on a detail page, if any. Absence is an
/// ordinary outcome, not an error.
pub fn find_calendar_export_link(html: &str, page_url: &str) -> Option<String> {
    let document = Html::parse_document(html);
    for anchor in document.select(&ANCHOR_SELECTOR) {
        let href = anchor.value().attr("href")?;
        let lower = href.to_lowercase();
        if EXPORT_MARKERS.iter().any(|m| lower.contains(m)) {
            return absolutize(href, page_url);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "https://whatson.example/listing";

    #[test]
    fn discovers_same_host_detail_links_up_to_cap() {
        let html = r#"
            <a href="/events/101">Market day</a>
            <a href="/events/102">Sound healing</a>
            <a href="https://whatson.example/events/103">Workshop</a>
            <a href="https://elsewhere.example/events/999">off-host</a>
            <a href="/about">not an event</a>
            <a href="/events/101">duplicate</a>
        "#;
        let links = discover_detail_links(html, BASE, 2);
        assert_eq!(
            links,
            vec![
                "https://whatson.example/events/101".to_string(),
                "https://whatson.example/events/102".to_string(),
            ]
        );
    }

    #[test]
    fn finds_export_link_variants() {
        let page = "https://whatson.example/events/101";
        let by_suffix = r#"<a href="/events/101/calendar.ics">Add to calendar</a>"#;
        assert_eq!(
            find_calendar_export_link(by_suffix, page).as_deref(),
            Some("https://whatson.example/events/101/calendar.ics")
        );

        let by_marker = r#"<a href="https://whatson.example/ical/101">iCal</a>"#;
        assert_eq!(
            find_calendar_export_link(by_marker, page).as_deref(),
            Some("https://whatson.example/ical/101")
        );

        let none = r#"<a href="/tickets/101">Buy tickets</a>"#;
        assert_eq!(find_calendar_export_link(none, page), None);
    }
}
