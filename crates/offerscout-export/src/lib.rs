//! Export sinks: CSV spreadsheet file, hosted worksheet API, and the
//! SQLite offer repository. Exactly one sink is active per run.

use std::collections::HashSet;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offerscout_core::{canonical_url, Offer, OfferPage, SortOrder, StoredOffer};
use offerscout_storage::Pacer;
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "offerscout-export";

#[derive(Debug, Error)]
pub enum ExportError {
    #[error("unsupported export type {0:?} (expected excel, googlesheet, or db)")]
    UnsupportedExportType(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Csv(#[from] csv::Error),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error("worksheet API error (status {status}): {message}")]
    Sheet { status: u16, message: String },
    #[error(transparent)]
    Db(#[from] sqlx::Error),
    #[error("invalid stored timestamp: {0}")]
    Timestamp(#[from] chrono::ParseError),
}

/// Which sink a run writes to. Selection is orthogonal to the scraping
/// strategies; an unknown value is a fatal configuration error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportKind {
    /// Spreadsheet file on local disk (CSV, opens in Excel).
    Excel,
    /// Hosted worksheet behind a rate-limited REST API.
    Googlesheet,
    /// Local SQLite store served by the web UI.
    Db,
}

impl FromStr for ExportKind {
    type Err = ExportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "excel" => Ok(Self::Excel),
            "googlesheet" => Ok(Self::Googlesheet),
            "db" => Ok(Self::Db),
            other => Err(ExportError::UnsupportedExportType(other.to_string())),
        }
    }
}

/// Common contract of every export destination. `url` arguments are
/// canonicalized again at this boundary, so dedup comparisons use the same
/// key no matter who calls.
#[async_trait]
pub trait ExportSink: Send + Sync {
    async fn exists(&self, url: &str) -> Result<bool, ExportError>;
    async fn add(&self, offer: &Offer, website: &str, tag: Option<&str>)
        -> Result<(), ExportError>;
    async fn flush(&self) -> Result<(), ExportError>;
}

const CSV_HEADER: &[&str] = &["website", "tag", "title", "url", "contract_type", "requirements"];

struct CsvState {
    seen: HashSet<String>,
    writer: csv::Writer<File>,
}

/// Local spreadsheet-file sink. The URL column of an existing file is read
/// into memory at open so existence checks never touch disk; every add is
/// written and flushed immediately (commit-per-offer, nothing pending on
/// crash).
pub struct CsvSink {
    path: PathBuf,
    state: Mutex<CsvState>,
}

impl CsvSink {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, ExportError> {
        let path = path.into();
        let mut seen = HashSet::new();
        let existed = path.exists();

        if existed {
            let mut reader = csv::Reader::from_path(&path)?;
            let url_column = reader
                .headers()?
                .iter()
                .position(|h| h == "url")
                .unwrap_or(3);
            for record in reader.records() {
                let record = record?;
                if let Some(url) = record.get(url_column) {
                    seen.insert(canonical_url(url));
                }
            }
        }

        let file = File::options().create(true).append(true).open(&path)?;
        let mut writer = csv::WriterBuilder::new().has_headers(false).from_writer(file);
        if !existed {
            writer.write_record(CSV_HEADER)?;
            writer.flush()?;
        }

        debug!(path = %path.display(), known_urls = seen.len(), "csv sink open");
        Ok(Self {
            path,
            state: Mutex::new(CsvState { seen, writer }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ExportSink for CsvSink {
    async fn exists(&self, url: &str) -> Result<bool, ExportError> {
        let state = self.state.lock().expect("csv sink lock");
        Ok(state.seen.contains(&canonical_url(url)))
    }

    async fn add(
        &self,
        offer: &Offer,
        website: &str,
        tag: Option<&str>,
    ) -> Result<(), ExportError> {
        let url = canonical_url(&offer.url);
        let mut state = self.state.lock().expect("csv sink lock");
        state.writer.write_record([
            website,
            tag.unwrap_or_default(),
            offer.title.as_str(),
            url.as_str(),
            offer.contract_type.as_deref().unwrap_or_default(),
            offer.requirements.join("; ").as_str(),
        ])?;
        state.writer.flush()?;
        state.seen.insert(url);
        Ok(())
    }

    async fn flush(&self) -> Result<(), ExportError> {
        let mut state = self.state.lock().expect("csv sink lock");
        state.writer.flush()?;
        Ok(())
    }
}

/// Row shape written to the hosted worksheet, same column order as the CSV
/// file.
pub fn sheet_row(offer: &Offer, website: &str, tag: Option<&str>) -> Vec<String> {
    vec![
        website.to_string(),
        tag.unwrap_or_default().to_string(),
        offer.title.clone(),
        canonical_url(&offer.url),
        offer.contract_type.clone().unwrap_or_default(),
        offer.requirements.join("; "),
    ]
}

#[derive(Debug, Default, Deserialize)]
struct SheetValues {
    #[serde(default)]
    values: Vec<Vec<String>>,
}

/// Hosted worksheet sink. Both the existence check and the append count
/// against the provider's quota (about 60 operations per minute), so every
/// outbound call first waits on the injected pacer.
pub struct SheetSink {
    client: reqwest::Client,
    worksheet_url: String,
    token: Option<String>,
    pacer: Arc<dyn Pacer>,
}

impl SheetSink {
    /// Column holding offer URLs, matching [`sheet_row`]'s order.
    const URL_RANGE: &'static str = "D:D";
    const APPEND_RANGE: &'static str = "A:F";

    pub fn new(
        worksheet_url: &str,
        token: Option<&str>,
        pacer: Arc<dyn Pacer>,
    ) -> Result<Self, ExportError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            client,
            worksheet_url: worksheet_url.trim_end_matches('/').to_string(),
            token: token.map(String::from),
            pacer,
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ExportSink for SheetSink {
    async fn exists(&self, url: &str) -> Result<bool, ExportError> {
        self.pacer.pause().await;
        let needle = canonical_url(url);
        let endpoint = format!("{}/values/{}", self.worksheet_url, Self::URL_RANGE);
        let resp = self.authorized(self.client.get(&endpoint)).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ExportError::Sheet {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        let values: SheetValues = resp.json().await?;
        Ok(values
            .values
            .iter()
            .flatten()
            .any(|cell| cell == &needle))
    }

    async fn add(
        &self,
        offer: &Offer,
        website: &str,
        tag: Option<&str>,
    ) -> Result<(), ExportError> {
        self.pacer.pause().await;
        let endpoint = format!(
            "{}/values/{}:append?valueInputOption=RAW",
            self.worksheet_url,
            Self::APPEND_RANGE
        );
        let body = serde_json::json!({ "values": [sheet_row(offer, website, tag)] });
        let resp = self
            .authorized(self.client.post(&endpoint))
            .json(&body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ExportError::Sheet {
                status: status.as_u16(),
                message: resp.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    async fn flush(&self) -> Result<(), ExportError> {
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS offers (
    id            INTEGER PRIMARY KEY AUTOINCREMENT,
    title         TEXT NOT NULL,
    url           TEXT NOT NULL UNIQUE,
    page          TEXT NOT NULL,
    tag           TEXT,
    contract_type TEXT,
    "check"       INTEGER NOT NULL DEFAULT 0,
    created_at    TEXT NOT NULL
)
"#;

/// Persistence service over the SQLite store: create/read for the
/// ingestion pipeline, list and check-toggle for the serving layer.
#[derive(Debug, Clone)]
pub struct OfferRepository {
    pool: SqlitePool,
}

impl OfferRepository {
    pub async fn connect(database_url: &str) -> Result<Self, ExportError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // A single connection keeps commit-per-offer writes strictly ordered
        // and makes in-memory databases usable in tests.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        sqlx::query(SCHEMA).execute(&pool).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert one offer with `check = false` and a fresh creation
    /// timestamp. Atomic per offer.
    pub async fn create(
        &self,
        offer: &Offer,
        website: &str,
        tag: Option<&str>,
    ) -> Result<(), ExportError> {
        sqlx::query(
            r#"INSERT INTO offers (title, url, page, tag, contract_type, "check", created_at)
               VALUES (?, ?, ?, ?, ?, 0, ?)"#,
        )
        .bind(&offer.title)
        .bind(canonical_url(&offer.url))
        .bind(website)
        .bind(tag)
        .bind(&offer.contract_type)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn exists_by_url(&self, url: &str) -> Result<bool, ExportError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM offers WHERE url = ?")
            .bind(canonical_url(url))
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    /// Flip the serving layer's check flag. Returns false when no offer
    /// has the given id.
    pub async fn set_check_status(&self, id: i64, status: bool) -> Result<bool, ExportError> {
        let result = sqlx::query(r#"UPDATE offers SET "check" = ? WHERE id = ?"#)
            .bind(status)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Paginated listing ordered by creation time. `prev_page`/`next_page`
    /// are clamped to `[1, total_pages]` and `None` at the boundaries.
    pub async fn list(
        &self,
        page: u32,
        page_limit: u32,
        query: Option<&str>,
        sort_by: SortOrder,
    ) -> Result<OfferPage, ExportError> {
        let page = page.max(1);
        let page_limit = page_limit.max(1);
        let like = query.map(|q| format!("%{q}%"));

        let total: i64 = match &like {
            Some(like) => {
                sqlx::query_scalar("SELECT COUNT(*) FROM offers WHERE title LIKE ?")
                    .bind(like)
                    .fetch_one(&self.pool)
                    .await?
            }
            None => {
                sqlx::query_scalar("SELECT COUNT(*) FROM offers")
                    .fetch_one(&self.pool)
                    .await?
            }
        };
        let total_pages = ((total + i64::from(page_limit) - 1) / i64::from(page_limit)) as u32;

        let prev_page = if page > 1 {
            Some((page - 1).min(total_pages.max(1)))
        } else {
            None
        };
        let next_page = if page < total_pages {
            Some(page + 1)
        } else {
            None
        };

        let order = match sort_by {
            SortOrder::Newest => "DESC",
            SortOrder::Oldest => "ASC",
        };
        let where_clause = if like.is_some() { "WHERE title LIKE ?" } else { "" };
        let sql = format!(
            r#"SELECT id, title, url, page, tag, contract_type, "check", created_at
               FROM offers {where_clause}
               ORDER BY created_at {order}, id {order}
               LIMIT ? OFFSET ?"#
        );

        let mut select = sqlx::query(&sql);
        if let Some(like) = &like {
            select = select.bind(like);
        }
        // Offset math in i64: a huge page number must yield an empty page,
        // not overflow u32.
        let rows = select
            .bind(i64::from(page_limit))
            .bind((i64::from(page) - 1) * i64::from(page_limit))
            .fetch_all(&self.pool)
            .await?;

        let mut offers = Vec::with_capacity(rows.len());
        for row in rows {
            let created_at: String = row.try_get("created_at")?;
            let created_at: DateTime<Utc> =
                DateTime::parse_from_rfc3339(&created_at)?.with_timezone(&Utc);
            offers.push(StoredOffer {
                id: row.try_get("id")?,
                title: row.try_get("title")?,
                url: row.try_get("url")?,
                page: row.try_get("page")?,
                tag: row.try_get("tag")?,
                contract_type: row.try_get("contract_type")?,
                check: row.try_get("check")?,
                created_at,
            });
        }

        Ok(OfferPage {
            offers,
            prev_page,
            next_page,
            query: query.map(String::from),
            sort_by,
        })
    }
}

/// Relational sink: thin [`ExportSink`] adapter over [`OfferRepository`].
pub struct SqliteSink {
    repo: OfferRepository,
}

impl SqliteSink {
    pub fn new(repo: OfferRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl ExportSink for SqliteSink {
    async fn exists(&self, url: &str) -> Result<bool, ExportError> {
        self.repo.exists_by_url(url).await
    }

    async fn add(
        &self,
        offer: &Offer,
        website: &str,
        tag: Option<&str>,
    ) -> Result<(), ExportError> {
        self.repo.create(offer, website, tag).await
    }

    async fn flush(&self) -> Result<(), ExportError> {
        Ok(())
    }
}
