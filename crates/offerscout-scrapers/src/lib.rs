//! Per-site scraping strategies, pagination, and concurrent detail-page
//! enrichment.
//!
//! Site differences live in [`SiteProfile`] tables, not in code: the target
//! boards change their markup over time, so selectors are data a maintainer
//! edits in one place.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use offerscout_core::{absolutize, canonical_url, clean_title, Offer};
use offerscout_storage::{PageRenderer, TextFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};
use url::Url;

pub const CRATE_NAME: &str = "offerscout-scrapers";

#[derive(Debug, Error)]
pub enum ScrapeError {
    #[error("invalid selector {selector:?}: {message}")]
    Selector { selector: String, message: String },
}

/// How to pull an offer's display title out of its listing node.
#[derive(Debug, Clone, Copy)]
pub enum TitleRule {
    /// Read an attribute of the offer node itself.
    Attr(&'static str),
    /// Take the text of the first matching child element.
    ChildText(&'static str),
}

#[derive(Debug, Clone, Copy)]
pub struct PostedRule {
    pub selector: &'static str,
    /// chrono format string tried against each whitespace token of the text.
    pub format: &'static str,
}

#[derive(Debug, Clone, Copy)]
pub struct DetailSelectors {
    pub contract_type: &'static str,
    pub requirements: &'static str,
}

/// Everything site-specific about one job board. The orchestrator never
/// branches on sites; it goes through this table.
#[derive(Debug, Clone, Copy)]
pub struct SiteProfile {
    /// Website label stored with each offer.
    pub site: &'static str,
    pub hosts: &'static [&'static str],
    pub offer_selector: &'static str,
    pub title: TitleRule,
    /// When the offer node is not itself the anchor.
    pub link_selector: Option<&'static str>,
    pub link_attr: &'static str,
    pub max_page_selector: &'static str,
    /// Query parameter appended for pages 2..max.
    pub page_param: &'static str,
    pub consent_selector: Option<&'static str>,
    pub posted: Option<PostedRule>,
    /// Present for boards whose detail pages are worth a second fetch.
    pub detail: Option<DetailSelectors>,
}

// Selector revisions: these class names rotate when the boards redeploy
// their frontends. Update here, nowhere else.
static PROFILES: &[SiteProfile] = &[
    SiteProfile {
        site: "pracuj.pl",
        hosts: &["pracuj.pl", "www.pracuj.pl"],
        offer_selector: "div.be8lukl",
        title: TitleRule::ChildText("h2"),
        link_selector: Some("a.core_n194fgoq"),
        link_attr: "href",
        max_page_selector: r#"span[data-test="top-pagination-max-page-number"]"#,
        page_param: "pn",
        consent_selector: Some(r#"div[data-test="modal-cookie-bottom-bar"]"#),
        posted: None,
        detail: None,
    },
    SiteProfile {
        site: "it.pracuj.pl",
        hosts: &["it.pracuj.pl"],
        offer_selector: r#"a[data-test="link-offer"]"#,
        title: TitleRule::Attr("title"),
        link_selector: None,
        link_attr: "href",
        max_page_selector: r#"span[data-test="top-pagination-max-page-number"]"#,
        page_param: "pn",
        consent_selector: Some(r#"div[data-test="modal-cookie-bottom-bar"]"#),
        posted: Some(PostedRule {
            selector: r#"p[data-test="text-added"]"#,
            format: "%d.%m.%Y",
        }),
        detail: Some(DetailSelectors {
            contract_type: r#"li[data-test="sections-benefit-contracts"]"#,
            requirements: r#"ul[data-test="aggregate-open-dictionary-model"] li"#,
        }),
    },
];

pub fn site_profiles() -> &'static [SiteProfile] {
    PROFILES
}

/// Match a configured URL's host against the profile table. `None` means
/// the website is not supported and the caller should skip it.
pub fn strategy_for_url(url: &str) -> Option<&'static SiteProfile> {
    let parsed = Url::parse(url).ok()?;
    let host = parsed.host_str()?;
    PROFILES
        .iter()
        .find(|p| p.hosts.iter().any(|h| h.eq_ignore_ascii_case(host)))
}

fn sel(selector: &str) -> Result<Selector, ScrapeError> {
    Selector::parse(selector).map_err(|err| ScrapeError::Selector {
        selector: selector.to_string(),
        message: err.to_string(),
    })
}

fn element_text(node: ElementRef<'_>) -> String {
    clean_title(&node.text().collect::<String>())
}

/// Extract offer summaries from one rendered listing page.
pub fn parse_offers(
    html: &str,
    profile: &SiteProfile,
    base_url: &str,
) -> Result<Vec<Offer>, ScrapeError> {
    let document = Html::parse_document(html);
    let offer_selector = sel(profile.offer_selector)?;
    let mut offers = Vec::new();

    for node in document.select(&offer_selector) {
        let title = match profile.title {
            TitleRule::Attr(attr) => node.value().attr(attr).map(clean_title),
            TitleRule::ChildText(child) => {
                node.select(&sel(child)?).next().map(element_text)
            }
        };
        let href = match profile.link_selector {
            Some(link) => node
                .select(&sel(link)?)
                .next()
                .and_then(|a| a.value().attr(profile.link_attr)),
            None => node.value().attr(profile.link_attr),
        };
        let (Some(title), Some(href)) = (title, href) else {
            continue;
        };
        if title.is_empty() {
            continue;
        }
        let url = canonical_url(&absolutize(base_url, href));
        let mut offer = Offer::new(title, url);
        if let Some(rule) = &profile.posted {
            offer.posted_at = parse_posted(node, rule);
        }
        offers.push(offer);
    }

    debug!(site = profile.site, count = offers.len(), "parsed listing page");
    Ok(offers)
}

fn parse_posted(node: ElementRef<'_>, rule: &PostedRule) -> Option<DateTime<Utc>> {
    let selector = Selector::parse(rule.selector).ok()?;
    let text = node.select(&selector).next().map(element_text)?;
    for token in text.split_whitespace() {
        if let Ok(date) = NaiveDate::parse_from_str(token, rule.format) {
            let midnight = date.and_hms_opt(0, 0, 0)?;
            return Some(DateTime::from_naive_utc_and_offset(midnight, Utc));
        }
    }
    None
}

/// Total page count from the pagination indicator. Defaults to 1 on any
/// parsing trouble: a broken indicator must not fail the scrape.
pub fn max_page_number(html: &str, profile: &SiteProfile) -> u32 {
    let Ok(selector) = Selector::parse(profile.max_page_selector) else {
        debug!(site = profile.site, "invalid pagination selector; assuming one page");
        return 1;
    };
    let document = Html::parse_document(html);
    let Some(node) = document.select(&selector).next() else {
        debug!(site = profile.site, "no pagination indicator; assuming one page");
        return 1;
    };
    match element_text(node).parse::<u32>() {
        Ok(n) if n >= 1 => n,
        _ => {
            debug!(site = profile.site, "unparsable pagination indicator; assuming one page");
            1
        }
    }
}

fn with_page_param(base_url: &str, param: &str, page: u32) -> String {
    if base_url.contains('?') {
        format!("{base_url}&{param}={page}")
    } else {
        format!("{base_url}?{param}={page}")
    }
}

fn parse_detail(html: &str, detail: &DetailSelectors) -> Option<(Option<String>, Vec<String>)> {
    let document = Html::parse_document(html);
    let contract_selector = Selector::parse(detail.contract_type).ok()?;
    let requirements_selector = Selector::parse(detail.requirements).ok()?;

    let contract_type = document
        .select(&contract_selector)
        .next()
        .map(element_text)
        .filter(|t| !t.is_empty());
    let requirements = document
        .select(&requirements_selector)
        .map(element_text)
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>();

    Some((contract_type, requirements))
}

/// One site's scraping contract: rendered listing pages in, normalized
/// offers out. Implementations must degrade per-page and per-offer, never
/// abort the caller's run.
#[async_trait]
pub trait ScrapeStrategy: Send + Sync {
    fn site(&self) -> &'static str;

    async fn scrape(
        &self,
        renderer: &dyn PageRenderer,
        http: Arc<dyn TextFetcher>,
        url: &str,
    ) -> Result<Vec<Offer>, ScrapeError>;
}

/// Generic board strategy driven entirely by a [`SiteProfile`].
pub struct BoardStrategy {
    profile: &'static SiteProfile,
    detail_concurrency: usize,
}

impl BoardStrategy {
    pub fn new(profile: &'static SiteProfile, detail_concurrency: usize) -> Self {
        Self {
            profile,
            detail_concurrency,
        }
    }

    fn note_consent(&self, html: &str) {
        let Some(consent) = self.profile.consent_selector else {
            return;
        };
        let Ok(selector) = Selector::parse(consent) else {
            return;
        };
        let document = Html::parse_document(html);
        if document.select(&selector).next().is_some() {
            debug!(site = self.profile.site, "consent overlay present in rendered markup");
        } else {
            debug!(site = self.profile.site, "consent overlay not found");
        }
    }

    /// Concurrently fetch detail pages and merge contract type and
    /// requirements. One offer's failure leaves that offer summary-only.
    async fn enrich(
        &self,
        http: Arc<dyn TextFetcher>,
        detail: &'static DetailSelectors,
        offers: &mut [Offer],
    ) {
        let semaphore = Arc::new(Semaphore::new(self.detail_concurrency.max(1)));
        let mut tasks: JoinSet<(usize, Option<(Option<String>, Vec<String>)>)> = JoinSet::new();

        for (idx, offer) in offers.iter().enumerate() {
            let url = offer.url.clone();
            let http = Arc::clone(&http);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.expect("semaphore not closed");
                match http.fetch_text(&url).await {
                    Ok(html) => (idx, parse_detail(&html, detail)),
                    Err(err) => {
                        warn!(%err, url, "detail fetch failed; keeping summary fields");
                        (idx, None)
                    }
                }
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, Some((contract_type, requirements)))) => {
                    offers[idx].contract_type = contract_type;
                    offers[idx].requirements = requirements;
                }
                Ok((_, None)) => {}
                Err(err) => warn!(%err, "detail enrichment task failed"),
            }
        }
    }
}

#[async_trait]
impl ScrapeStrategy for BoardStrategy {
    fn site(&self) -> &'static str {
        self.profile.site
    }

    async fn scrape(
        &self,
        renderer: &dyn PageRenderer,
        http: Arc<dyn TextFetcher>,
        url: &str,
    ) -> Result<Vec<Offer>, ScrapeError> {
        let first_page = match renderer.render(url).await {
            Ok(html) => html,
            Err(err) => {
                warn!(%err, url, site = self.profile.site, "listing page fetch failed");
                return Ok(Vec::new());
            }
        };
        self.note_consent(&first_page);

        let mut offers = parse_offers(&first_page, self.profile, url)?;
        let max_page = max_page_number(&first_page, self.profile);
        debug!(site = self.profile.site, max_page, "pagination resolved");

        for page in 2..=max_page {
            let page_url = with_page_param(url, self.profile.page_param, page);
            match renderer.render(&page_url).await {
                Ok(html) => offers.extend(parse_offers(&html, self.profile, url)?),
                Err(err) => {
                    warn!(%err, page, site = self.profile.site, "listing page fetch failed; skipping page");
                }
            }
        }

        if let Some(detail) = self.profile.detail.as_ref() {
            self.enrich(http, detail, &mut offers).await;
        }

        Ok(offers)
    }
}

/// Picks the strategy for a configured URL, runs it, and applies the
/// max-age filter. Unsupported or failing sites come back as empty lists,
/// never as errors: one bad site must not stop the others.
pub struct ScraperRunner {
    renderer: Arc<dyn PageRenderer>,
    http: Arc<dyn TextFetcher>,
    detail_concurrency: usize,
}

impl ScraperRunner {
    pub fn new(
        renderer: Arc<dyn PageRenderer>,
        http: Arc<dyn TextFetcher>,
        detail_concurrency: usize,
    ) -> Self {
        Self {
            renderer,
            http,
            detail_concurrency,
        }
    }

    pub async fn run(&self, url: &str, max_age_days: Option<u32>) -> Vec<Offer> {
        let Some(profile) = strategy_for_url(url) else {
            warn!(url, "website is not supported; skipping");
            return Vec::new();
        };
        let strategy = BoardStrategy::new(profile, self.detail_concurrency);
        let offers = match strategy
            .scrape(self.renderer.as_ref(), Arc::clone(&self.http), url)
            .await
        {
            Ok(offers) => offers,
            Err(err) => {
                error!(%err, site = profile.site, "scrape failed");
                return Vec::new();
            }
        };
        apply_age_filter(offers, max_age_days, Utc::now())
    }
}

/// Drop offers strictly older than the threshold. An offer dated exactly
/// `max_age_days` ago stays in; offers without a posting date always pass.
pub fn apply_age_filter(
    offers: Vec<Offer>,
    max_age_days: Option<u32>,
    now: DateTime<Utc>,
) -> Vec<Offer> {
    let Some(max_age) = max_age_days else {
        return offers;
    };
    offers
        .into_iter()
        .filter(|offer| match offer.age_days(now) {
            Some(age) => age <= i64::from(max_age),
            None => true,
        })
        .collect()
}
