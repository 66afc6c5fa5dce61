//! Core domain model for offerscout: offer record shapes and the canonical
//! URL function used as the dedup key across the whole pipeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

pub const CRATE_NAME: &str = "offerscout-core";

/// A job offer as extracted by a scraping strategy, before persistence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub title: String,
    /// Canonical form (volatile query parameters stripped).
    pub url: String,
    #[serde(default)]
    pub contract_type: Option<String>,
    #[serde(default)]
    pub requirements: Vec<String>,
    /// Posting date when the listing exposes one; drives the max-age filter.
    #[serde(default)]
    pub posted_at: Option<DateTime<Utc>>,
}

impl Offer {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            contract_type: None,
            requirements: Vec::new(),
            posted_at: None,
        }
    }

    /// Age in whole days relative to `now`, when a posting date is known.
    pub fn age_days(&self, now: DateTime<Utc>) -> Option<i64> {
        self.posted_at
            .map(|posted| (now.date_naive() - posted.date_naive()).num_days())
    }
}

/// The persisted/exported representation, a superset of [`Offer`].
/// `id` is assigned by the relational sink; `check` is owned by the serving
/// layer and always created as false by the ingestion pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredOffer {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub page: String,
    pub tag: Option<String>,
    pub contract_type: Option<String>,
    pub check: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Newest,
    Oldest,
}

/// One page of stored offers plus navigation, as returned by the
/// persistence service's list operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferPage {
    pub offers: Vec<StoredOffer>,
    pub prev_page: Option<u32>,
    pub next_page: Option<u32>,
    pub query: Option<String>,
    pub sort_by: SortOrder,
}

/// Query parameters dropped during canonicalization. Anything keyed here
/// (or prefixed `utm_`) varies per search session and must not take part
/// in dedup comparisons.
const VOLATILE_PARAMS: &[&str] = &["searchId", "sessionId", "sc", "ref", "fromSearch"];

fn is_volatile_param(key: &str) -> bool {
    VOLATILE_PARAMS.iter().any(|p| key.eq_ignore_ascii_case(p)) || key.starts_with("utm_")
}

/// Strip volatile query parameters and the fragment so that the same
/// physical posting scraped at different times yields the same key.
/// Idempotent: `canonical_url(canonical_url(u)) == canonical_url(u)`.
pub fn canonical_url(raw: &str) -> String {
    let trimmed = raw.trim();
    let without_fragment = trimmed.split('#').next().unwrap_or(trimmed);
    let mut parts = without_fragment.splitn(2, '?');
    let base = parts.next().unwrap_or_default();
    let Some(query) = parts.next() else {
        return base.to_string();
    };
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .filter(|pair| {
            let key = pair.split('=').next().unwrap_or("");
            !is_volatile_param(key)
        })
        .collect();
    if kept.is_empty() {
        base.to_string()
    } else {
        format!("{}?{}", base, kept.join("&"))
    }
}

/// Resolve a possibly-relative offer link against its listing page URL.
/// Falls back to the raw href when the base is not an absolute URL.
pub fn absolutize(base: &str, href: &str) -> String {
    match Url::parse(base) {
        Ok(base_url) => base_url
            .join(href)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| href.to_string()),
        Err(_) => href.to_string(),
    }
}

/// Collapse whitespace runs and trim. Listing markup pads titles with
/// newlines and indentation.
pub fn clean_title(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn canonicalization_strips_volatile_params() {
        assert_eq!(
            canonical_url("https://it.pracuj.pl/job/123?searchId=abc"),
            "https://it.pracuj.pl/job/123"
        );
        assert_eq!(
            canonical_url("/job/123?searchId=abc&page=2"),
            "/job/123?page=2"
        );
        assert_eq!(
            canonical_url("/job/123?utm_source=mail&utm_campaign=x"),
            "/job/123"
        );
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let once = canonical_url("https://example.com/offer?searchId=1&id=9#top");
        assert_eq!(canonical_url(&once), once);
        assert_eq!(once, "https://example.com/offer?id=9");
    }

    #[test]
    fn urls_differing_only_in_volatile_params_collapse() {
        let a = canonical_url("/job/123?searchId=abc");
        let b = canonical_url("/job/123?searchId=zzz");
        assert_eq!(a, b);
    }

    #[test]
    fn plain_urls_pass_through_unchanged() {
        assert_eq!(canonical_url("https://pracuj.pl/praca"), "https://pracuj.pl/praca");
        assert_eq!(canonical_url("/job/456?page=3"), "/job/456?page=3");
    }

    #[test]
    fn relative_links_resolve_against_listing_url() {
        assert_eq!(
            absolutize("https://it.pracuj.pl/praca?q=rust", "/job/123"),
            "https://it.pracuj.pl/job/123"
        );
        assert_eq!(absolutize("not a url", "/job/123"), "/job/123");
    }

    #[test]
    fn titles_are_whitespace_normalized() {
        assert_eq!(clean_title("  Senior\n   Rust Developer "), "Senior Rust Developer");
    }

    #[test]
    fn offer_age_in_days() {
        let now = Utc.with_ymd_and_hms(2026, 3, 10, 12, 0, 0).single().unwrap();
        let mut offer = Offer::new("Dev", "/job/1");
        assert_eq!(offer.age_days(now), None);
        offer.posted_at = Utc.with_ymd_and_hms(2026, 3, 3, 23, 59, 0).single();
        assert_eq!(offer.age_days(now), Some(7));
    }
}
