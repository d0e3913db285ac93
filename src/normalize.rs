use crate::types::RawEvent;
use once_cell::sync::Lazy;
use regex::Regex;
use sha2::{Digest, Sha256};

/// Collapse whitespace and lowercase for comparison fields.
pub fn canonical_title(title: &str) -> String {
    title
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

static VENUE_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(?:at|на|в)\s+([^,.;\n]{3,60})").unwrap()
});

static ADDRESS_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:ул\.|улица|пер\.|просп\.|jl\.|jalan|street|st\.)\s*[^,.;\n]{2,60}").unwrap()
});

/// Best-effort venue name out of free text, for records where the adapter
/// supplied no structured location.
pub fn extract_venue(text: &str) -> Option<String> {
    let caps = VENUE_PREFIX.captures(text)?;
    let venue = caps.get(1)?.as_str().trim();
    if venue.is_empty() {
        None
    } else {
        Some(venue.to_string())
    }
}

/// Best-effort street address out of free text, keyed on address-word prefixes.
pub fn extract_address(text: &str) -> Option<String> {
    let m = ADDRESS_PREFIX.find(text)?;
    Some(m.as_str().trim().to_string())
}

/// Content hash identifying a logical event when the source supplies no native
/// ID: normalized title, source tag, coordinates rounded to 6 decimal places,
/// and the ISO start time.
pub fn fingerprint(event: &RawEvent) -> String {
    let mut s = String::new();
    s.push_str(&canonical_title(&event.title));
    s.push('|');
    s.push_str(&event.source);
    s.push('|');
    if let Some(lat) = event.lat {
        s.push_str(&format!("{:.6}", lat));
    }
    s.push('|');
    if let Some(lng) = event.lng {
        s.push_str(&format!("{:.6}", lng));
    }
    s.push('|');
    if let Some(start) = event.start_time {
        s.push_str(&start.to_rfc3339());
    }

    let mut hasher = Sha256::new();
    hasher.update(s.as_bytes());
    hex::encode(hasher.finalize())
}

/// Adapter-supplied ID wins; the fingerprint is the fallback identity.
pub fn resolve_external_id(event: &RawEvent) -> String {
    match &event.external_id {
        Some(id) if !id.is_empty() => id.clone(),
        _ => fingerprint(event),
    }
}

/// Fill venue/address from the description when the adapter left them empty.
pub fn enrich_location_fields(event: &mut RawEvent) {
    if event.location_name.is_none() {
        if let Some(text) = &event.description {
            event.location_name = extract_venue(text);
        }
    }
    if event.address.is_none() {
        if let Some(text) = &event.description {
            event.address = extract_address(text);
        }
    }
}
