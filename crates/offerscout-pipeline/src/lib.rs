//! Run orchestration: configuration, the title filter, the skip list,
//! webhook notification, and the per-website scrape/export loop.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use offerscout_core::Offer;
use offerscout_export::{
    CsvSink, ExportKind, ExportSink, OfferRepository, SheetSink, SqliteSink,
};
use offerscout_scrapers::ScraperRunner;
use offerscout_storage::{
    BrowserClient, HttpClientConfig, HttpFetcher, IntervalPacer, SkipListStore,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "offerscout-pipeline";

fn default_database_url() -> String {
    "sqlite://offers.db".to_string()
}

fn default_csv_path() -> PathBuf {
    PathBuf::from("offers.csv")
}

fn default_skip_list_path() -> PathBuf {
    PathBuf::from("urls_to_skip.txt")
}

fn default_detail_concurrency() -> usize {
    4
}

/// One website to scrape, with an optional label stored alongside its
/// offers (e.g. the search keyword behind the listing URL).
#[derive(Debug, Clone, Deserialize)]
pub struct WebsiteEntry {
    pub url: String,
    #[serde(default)]
    pub tag: Option<String>,
}

/// YAML run configuration. Only `export_type` and `websites` are
/// mandatory; everything else has a default or is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub export_type: ExportKind,
    pub websites: Vec<WebsiteEntry>,
    #[serde(default)]
    pub max_offer_duration_days: Option<u32>,
    #[serde(default)]
    pub keywords_to_pass: Vec<String>,
    #[serde(default)]
    pub worksheet_url: Option<String>,
    #[serde(default)]
    pub worksheet_token: Option<String>,
    #[serde(default = "default_database_url")]
    pub database_url: String,
    #[serde(default = "default_csv_path")]
    pub csv_path: PathBuf,
    #[serde(default = "default_skip_list_path")]
    pub skip_list_path: PathBuf,
    #[serde(default)]
    pub webhook_url: Option<String>,
    #[serde(default)]
    pub render_endpoint: Option<String>,
    #[serde(default)]
    pub render_token: Option<String>,
    #[serde(default = "default_detail_concurrency")]
    pub detail_concurrency: usize,
}

impl RunConfig {
    pub fn from_yaml_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = serde_yaml::from_str(&text)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.websites.is_empty() {
            bail!("config has no websites to scrape");
        }
        if self.export_type == ExportKind::Googlesheet && self.worksheet_url.is_none() {
            bail!("export_type is googlesheet but worksheet_url is not set");
        }
        Ok(())
    }
}

/// Case-insensitive title block list: an offer whose title contains any
/// configured keyword is dropped. An empty list blocks nothing.
#[derive(Debug, Clone)]
pub struct TitleFilter {
    keywords: Vec<String>,
}

impl TitleFilter {
    pub fn new(keywords: &[String]) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
        }
    }

    pub fn blocks(&self, title: &str) -> bool {
        if self.keywords.is_empty() {
            return false;
        }
        let title = title.to_lowercase();
        self.keywords.iter().any(|k| title.contains(k))
    }
}

/// One newly exported offer, as delivered to the webhook.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct NotifiedOffer {
    pub title: String,
    pub url: String,
    pub contract_type: Option<String>,
    pub requirements: Vec<String>,
    pub page: String,
    pub tag: Option<String>,
}

impl NotifiedOffer {
    fn from_offer(offer: &Offer, page: &str, tag: Option<&str>) -> Self {
        Self {
            title: offer.title.clone(),
            url: offer.url.clone(),
            contract_type: offer.contract_type.clone(),
            requirements: offer.requirements.clone(),
            page: page.to_string(),
            tag: tag.map(String::from),
        }
    }
}

/// Best-effort delivery of the run's batch of new offers. Returns whether
/// the batch was accepted; failures are logged, never fatal.
#[async_trait::async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, batch: &[NotifiedOffer]) -> bool;
}

/// POSTs the batch as one JSON array.
pub struct WebhookNotifier {
    http: HttpFetcher,
    url: String,
}

impl WebhookNotifier {
    pub fn new(url: &str) -> anyhow::Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(HttpClientConfig::default())?,
            url: url.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, batch: &[NotifiedOffer]) -> bool {
        match self.http.post_json(&self.url, batch).await {
            Ok(status) if status.is_success() => {
                info!(count = batch.len(), "webhook delivered");
                true
            }
            Ok(status) => {
                warn!(status = status.as_u16(), "webhook rejected the batch");
                false
            }
            Err(err) => {
                warn!(error = %err, "webhook delivery failed");
                false
            }
        }
    }
}

/// Counters for one complete run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sites: usize,
    pub scraped: usize,
    pub skipped: usize,
    pub blocked: usize,
    pub exported: usize,
    pub webhook_delivered: bool,
}

fn website_label(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(String::from))
        .unwrap_or_else(|| url.to_string())
}

/// The run loop with every side-effecting collaborator injected. `run_once`
/// wires the real ones.
pub async fn run_with(
    config: &RunConfig,
    runner: &ScraperRunner,
    sink: &dyn ExportSink,
    skip_store: &SkipListStore,
    notifier: Option<&dyn Notifier>,
) -> anyhow::Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();
    info!(%run_id, sites = config.websites.len(), "starting run");

    let skip = skip_store.load().await?;
    let filter = TitleFilter::new(&config.keywords_to_pass);

    let mut batch: Vec<NotifiedOffer> = Vec::new();
    let mut scraped = 0usize;
    let mut skipped = 0usize;
    let mut blocked = 0usize;

    for site in &config.websites {
        let label = website_label(&site.url);
        let offers = runner.run(&site.url, config.max_offer_duration_days).await;
        info!(website = %label, count = offers.len(), "scraped");
        scraped += offers.len();

        for offer in &offers {
            if skip.contains(&offer.url) {
                skipped += 1;
                continue;
            }
            if filter.blocks(&offer.title) {
                debug!(title = %offer.title, "title blocked by keyword filter");
                blocked += 1;
                continue;
            }
            match sink.exists(&offer.url).await {
                Ok(true) => {
                    skipped += 1;
                    continue;
                }
                Ok(false) => {}
                Err(err) => {
                    error!(website = %label, error = %err, "export failed; skipping rest of website");
                    break;
                }
            }
            if let Err(err) = sink.add(offer, &label, site.tag.as_deref()).await {
                error!(website = %label, error = %err, "export failed; skipping rest of website");
                break;
            }
            batch.push(NotifiedOffer::from_offer(offer, &label, site.tag.as_deref()));
        }
    }

    if let Err(err) = sink.flush().await {
        error!(error = %err, "flushing export sink failed");
    }

    // Final guard: nothing that was skip-listed before the run may reach
    // the webhook.
    batch.retain(|o| !skip.contains(&o.url));

    let webhook_delivered = if batch.is_empty() {
        info!("no new offers this run");
        false
    } else if let Some(notifier) = notifier {
        notifier.notify(&batch).await
    } else {
        false
    };

    // Only offers that actually reached the sink join the skip list, so a
    // failed export is retried on the next run.
    let exported_urls: Vec<String> = batch.iter().map(|o| o.url.clone()).collect();
    skip_store
        .append(&exported_urls)
        .await
        .context("persisting skip list")?;

    let summary = RunSummary {
        run_id,
        started_at,
        finished_at: Utc::now(),
        sites: config.websites.len(),
        scraped,
        skipped,
        blocked,
        exported: batch.len(),
        webhook_delivered,
    };
    info!(
        exported = summary.exported,
        skipped = summary.skipped,
        blocked = summary.blocked,
        "run finished"
    );
    Ok(summary)
}

/// Build the real collaborators from config and execute one run.
pub async fn run_once(config: &RunConfig) -> anyhow::Result<RunSummary> {
    let Some(render_endpoint) = &config.render_endpoint else {
        bail!("render_endpoint is not set; a rendering session is required to scrape");
    };
    let renderer = Arc::new(BrowserClient::new(
        render_endpoint,
        config.render_token.as_deref(),
    )?);
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default())?);
    let runner = ScraperRunner::new(renderer, http, config.detail_concurrency);
    let skip_store = SkipListStore::new(&config.skip_list_path);

    let sink: Box<dyn ExportSink> = match config.export_type {
        ExportKind::Excel => Box::new(CsvSink::open(&config.csv_path)?),
        ExportKind::Googlesheet => {
            let worksheet_url = config
                .worksheet_url
                .as_deref()
                .context("worksheet_url is required for googlesheet export")?;
            // Hosted worksheet quota is roughly one operation per second;
            // a two second gap matches both the read and the append path.
            let pacer = Arc::new(IntervalPacer::new(Duration::from_secs(2)));
            Box::new(SheetSink::new(
                worksheet_url,
                config.worksheet_token.as_deref(),
                pacer,
            )?)
        }
        ExportKind::Db => {
            let repo = OfferRepository::connect(&config.database_url).await?;
            Box::new(SqliteSink::new(repo))
        }
    };

    let notifier = match &config.webhook_url {
        Some(url) => Some(WebhookNotifier::new(url)?),
        None => None,
    };

    run_with(
        config,
        &runner,
        sink.as_ref(),
        &skip_store,
        notifier.as_ref().map(|n| n as &dyn Notifier),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use offerscout_export::ExportError;
    use offerscout_storage::{FetchError, PageRenderer, TextFetcher};
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use tempfile::tempdir;

    const IT_LISTING: &str = r#"
        <html><body>
          <a data-test="link-offer" title="Senior Rust Developer"
             href="/job/123?searchId=abc"></a>
          <a data-test="link-offer" title="Java Architect" href="/job/456"></a>
        </body></html>
    "#;

    struct CannedRenderer {
        pages: HashMap<String, String>,
    }

    impl CannedRenderer {
        fn with_listing(url: &str, html: &str) -> Arc<Self> {
            let mut pages = HashMap::new();
            pages.insert(url.to_string(), html.to_string());
            Arc::new(Self { pages })
        }
    }

    #[async_trait]
    impl PageRenderer for CannedRenderer {
        async fn render(&self, url: &str) -> Result<String, FetchError> {
            Ok(self
                .pages
                .get(url)
                .cloned()
                .unwrap_or_else(|| "<html><body></body></html>".to_string()))
        }
    }

    struct NotFoundFetcher;

    #[async_trait]
    impl TextFetcher for NotFoundFetcher {
        async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
            Err(FetchError::HttpStatus {
                status: 404,
                url: url.to_string(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        existing: HashSet<String>,
        added: Mutex<Vec<(String, String, Option<String>)>>,
        fail_after: Option<usize>,
    }

    #[async_trait]
    impl ExportSink for RecordingSink {
        async fn exists(&self, url: &str) -> Result<bool, ExportError> {
            Ok(self.existing.contains(url))
        }

        async fn add(
            &self,
            offer: &Offer,
            website: &str,
            tag: Option<&str>,
        ) -> Result<(), ExportError> {
            let mut added = self.added.lock().unwrap();
            if let Some(limit) = self.fail_after {
                if added.len() >= limit {
                    return Err(ExportError::UnsupportedExportType("boom".into()));
                }
            }
            added.push((offer.url.clone(), website.to_string(), tag.map(String::from)));
            Ok(())
        }

        async fn flush(&self) -> Result<(), ExportError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingNotifier {
        batches: Mutex<Vec<Vec<NotifiedOffer>>>,
        rejects: bool,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, batch: &[NotifiedOffer]) -> bool {
            self.batches.lock().unwrap().push(batch.to_vec());
            !self.rejects
        }
    }

    const LISTING_URL: &str = "https://it.pracuj.pl/praca";

    fn config(keywords: &[&str], skip_path: &Path) -> RunConfig {
        RunConfig {
            export_type: ExportKind::Db,
            websites: vec![WebsiteEntry {
                url: LISTING_URL.to_string(),
                tag: Some("rust".to_string()),
            }],
            max_offer_duration_days: None,
            keywords_to_pass: keywords.iter().map(|k| k.to_string()).collect(),
            worksheet_url: None,
            worksheet_token: None,
            database_url: default_database_url(),
            csv_path: default_csv_path(),
            skip_list_path: skip_path.to_path_buf(),
            webhook_url: None,
            render_endpoint: None,
            render_token: None,
            detail_concurrency: 2,
        }
    }

    fn runner() -> ScraperRunner {
        ScraperRunner::new(
            CannedRenderer::with_listing(LISTING_URL, IT_LISTING),
            Arc::new(NotFoundFetcher),
            2,
        )
    }

    #[test]
    fn title_filter_is_case_insensitive_and_inert_when_empty() {
        let inert = TitleFilter::new(&[]);
        assert!(!inert.blocks("anything at all"));

        let filter = TitleFilter::new(&["praktykant".to_string(), "staż".to_string()]);
        assert!(filter.blocks("PRAKTYKANT w dziale IT"));
        assert!(!filter.blocks("Senior Rust Developer"));
    }

    #[test]
    fn config_yaml_fills_defaults() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            concat!(
                "export_type: excel\n",
                "websites:\n",
                "  - url: https://it.pracuj.pl/praca\n",
                "    tag: rust\n",
                "keywords_to_pass: [rust]\n",
            ),
        )
        .expect("write config");

        let config = RunConfig::from_yaml_file(&path).expect("parse");
        assert_eq!(config.export_type, ExportKind::Excel);
        assert_eq!(config.database_url, "sqlite://offers.db");
        assert_eq!(config.skip_list_path, PathBuf::from("urls_to_skip.txt"));
        assert_eq!(config.detail_concurrency, 4);
        assert_eq!(config.websites[0].tag.as_deref(), Some("rust"));
    }

    #[test]
    fn config_googlesheet_requires_worksheet_url() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            "export_type: googlesheet\nwebsites:\n  - url: https://it.pracuj.pl/praca\n",
        )
        .expect("write config");

        let err = RunConfig::from_yaml_file(&path).unwrap_err();
        assert!(err.to_string().contains("worksheet_url"));
    }

    #[tokio::test]
    async fn run_exports_new_offers_and_notifies_once() {
        let dir = tempdir().expect("tempdir");
        let skip_path = dir.path().join("skip.txt");
        let config = config(&[], &skip_path);
        let sink = RecordingSink::default();
        let notifier = RecordingNotifier::default();
        let store = SkipListStore::new(&skip_path);

        let summary = run_with(&config, &runner(), &sink, &store, Some(&notifier))
            .await
            .expect("run");

        assert_eq!(summary.scraped, 2);
        assert_eq!(summary.exported, 2);
        assert!(summary.webhook_delivered);

        let added = sink.added.lock().unwrap();
        assert_eq!(added.len(), 2);
        assert_eq!(added[0].0, "https://it.pracuj.pl/job/123");
        assert_eq!(added[0].1, "it.pracuj.pl");
        assert_eq!(added[0].2.as_deref(), Some("rust"));

        let batches = notifier.batches.lock().unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert_eq!(batches[0][1].url, "https://it.pracuj.pl/job/456");

        let skip = store.load().await.expect("load skip list");
        assert!(skip.contains("https://it.pracuj.pl/job/123"));
        assert!(skip.contains("https://it.pracuj.pl/job/456"));
    }

    #[tokio::test]
    async fn failed_webhook_delivery_is_reported_in_the_summary() {
        let dir = tempdir().expect("tempdir");
        let skip_path = dir.path().join("skip.txt");
        let config = config(&[], &skip_path);
        let sink = RecordingSink::default();
        let notifier = RecordingNotifier {
            rejects: true,
            ..RecordingNotifier::default()
        };
        let store = SkipListStore::new(&skip_path);

        let summary = run_with(&config, &runner(), &sink, &store, Some(&notifier))
            .await
            .expect("run");

        // Delivery was attempted and failed; sink writes and the skip list
        // stay durable regardless.
        assert!(!summary.webhook_delivered);
        assert_eq!(summary.exported, 2);
        assert_eq!(notifier.batches.lock().unwrap().len(), 1);
        let skip = store.load().await.expect("load skip list");
        assert!(skip.contains("https://it.pracuj.pl/job/123"));
    }

    #[tokio::test]
    async fn run_honors_the_persisted_skip_list() {
        let dir = tempdir().expect("tempdir");
        let skip_path = dir.path().join("skip.txt");
        std::fs::write(&skip_path, "https://it.pracuj.pl/job/123\n").expect("seed skip");
        let config = config(&[], &skip_path);
        let sink = RecordingSink::default();
        let store = SkipListStore::new(&skip_path);

        let summary = run_with(&config, &runner(), &sink, &store, None)
            .await
            .expect("run");

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.exported, 1);
        let added = sink.added.lock().unwrap();
        assert_eq!(added.len(), 1);
        assert_eq!(added[0].0, "https://it.pracuj.pl/job/456");
    }

    #[tokio::test]
    async fn run_blocks_titles_matching_a_keyword() {
        let dir = tempdir().expect("tempdir");
        let skip_path = dir.path().join("skip.txt");
        let config = config(&["java"], &skip_path);
        let sink = RecordingSink::default();
        let store = SkipListStore::new(&skip_path);

        let summary = run_with(&config, &runner(), &sink, &store, None)
            .await
            .expect("run");

        assert_eq!(summary.blocked, 1);
        assert_eq!(summary.exported, 1);

        // Blocked offers never reach the skip list; a future keyword change
        // can still pick them up.
        let skip = store.load().await.expect("load skip list");
        assert!(!skip.contains("https://it.pracuj.pl/job/456"));
    }

    #[tokio::test]
    async fn run_skips_offers_the_sink_already_holds() {
        let dir = tempdir().expect("tempdir");
        let skip_path = dir.path().join("skip.txt");
        let config = config(&[], &skip_path);
        let mut sink = RecordingSink::default();
        sink.existing
            .insert("https://it.pracuj.pl/job/123".to_string());
        let notifier = RecordingNotifier::default();
        let store = SkipListStore::new(&skip_path);

        let summary = run_with(&config, &runner(), &sink, &store, Some(&notifier))
            .await
            .expect("run");

        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.exported, 1);
        let batches = notifier.batches.lock().unwrap();
        assert_eq!(batches[0].len(), 1);
    }

    #[tokio::test]
    async fn export_failure_aborts_the_website_but_persists_progress() {
        let dir = tempdir().expect("tempdir");
        let skip_path = dir.path().join("skip.txt");
        let config = config(&[], &skip_path);
        let sink = RecordingSink {
            fail_after: Some(1),
            ..RecordingSink::default()
        };
        let store = SkipListStore::new(&skip_path);

        let summary = run_with(&config, &runner(), &sink, &store, None)
            .await
            .expect("run");

        assert_eq!(summary.exported, 1);
        let skip = store.load().await.expect("load skip list");
        assert!(skip.contains("https://it.pracuj.pl/job/123"));
        assert!(!skip.contains("https://it.pracuj.pl/job/456"));
    }
}
