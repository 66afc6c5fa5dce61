//! Axum + Askama serving layer over the SQLite offer store. Read-only
//! listing plus the check toggle; ingestion happens in the pipeline.

use std::sync::Arc;

use anyhow::bail;
use askama::Template;
use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use offerscout_core::{SortOrder, StoredOffer};
use offerscout_export::{ExportKind, OfferRepository};
use offerscout_pipeline::RunConfig;
use serde::Deserialize;
use tokio::net::TcpListener;
use tracing::info;

pub const CRATE_NAME: &str = "offerscout-web";

const PAGE_LIMIT: u32 = 20;

#[derive(Clone)]
pub struct AppState {
    pub repo: OfferRepository,
}

impl AppState {
    pub fn new(repo: OfferRepository) -> Self {
        Self { repo }
    }
}

#[derive(Debug, Deserialize, Default)]
struct OffersQuery {
    q: Option<String>,
    sort: Option<SortOrder>,
    page: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct CheckBody {
    check: bool,
}

#[derive(Template)]
#[template(path = "offers.html")]
struct OffersTemplate {
    offers: Vec<StoredOffer>,
    prev_page: Option<u32>,
    next_page: Option<u32>,
    query: String,
    sort: &'static str,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(offers_page_handler))
        .route("/api/offers", get(offers_api_handler))
        .route("/offers/{id}/check", post(check_handler))
        .with_state(Arc::new(state))
}

/// Start serving the configured store. Only the relational export keeps a
/// database the UI can read, so any other `export_type` is refused up
/// front.
pub async fn serve(config: &RunConfig, port: u16) -> anyhow::Result<()> {
    if config.export_type != ExportKind::Db {
        bail!("the web UI requires export_type db (got a spreadsheet export)");
    }
    let repo = OfferRepository::connect(&config.database_url).await?;
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, database = %config.database_url, "serving offers");
    axum::serve(listener, app(AppState::new(repo))).await?;
    Ok(())
}

fn sort_label(sort: SortOrder) -> &'static str {
    match sort {
        SortOrder::Newest => "newest",
        SortOrder::Oldest => "oldest",
    }
}

async fn offers_page_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OffersQuery>,
) -> Response {
    let sort = query.sort.unwrap_or_default();
    let page = state
        .repo
        .list(
            query.page.unwrap_or(1),
            PAGE_LIMIT,
            query.q.as_deref(),
            sort,
        )
        .await;
    match page {
        Ok(page) => render_html(OffersTemplate {
            offers: page.offers,
            prev_page: page.prev_page,
            next_page: page.next_page,
            query: query.q.unwrap_or_default(),
            sort: sort_label(sort),
        }),
        Err(err) => server_error(anyhow::Error::new(err)),
    }
}

async fn offers_api_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OffersQuery>,
) -> Response {
    let result = state
        .repo
        .list(
            query.page.unwrap_or(1),
            PAGE_LIMIT,
            query.q.as_deref(),
            query.sort.unwrap_or_default(),
        )
        .await;
    match result {
        Ok(page) => Json(page).into_response(),
        Err(err) => server_error(anyhow::Error::new(err)),
    }
}

async fn check_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<i64>,
    Json(body): Json<CheckBody>,
) -> Response {
    match state.repo.set_check_status(id, body.check).await {
        Ok(true) => Json(serde_json::json!({ "updated": true })).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "updated": false })),
        )
            .into_response(),
        Err(err) => server_error(anyhow::Error::new(err)),
    }
}

fn render_html<T: Template>(tpl: T) -> Response {
    match tpl.render() {
        Ok(html) => Html(html).into_response(),
        Err(err) => server_error(anyhow::anyhow!(err.to_string())),
    }
}

fn server_error(err: anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Html(format!("Server error: {}", err)),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use offerscout_core::Offer;
    use tower::ServiceExt;

    async fn seeded_state() -> AppState {
        let repo = OfferRepository::connect("sqlite::memory:")
            .await
            .expect("connect");
        let mut rust = Offer::new("Senior Rust Developer", "https://it.pracuj.pl/job/1");
        rust.contract_type = Some("b2b".to_string());
        repo.create(&rust, "it.pracuj.pl", Some("rust"))
            .await
            .expect("seed");
        repo.create(
            &Offer::new("Java Architect", "https://it.pracuj.pl/job/2"),
            "it.pracuj.pl",
            None,
        )
        .await
        .expect("seed");
        AppState::new(repo)
    }

    async fn body_text(resp: Response) -> String {
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn offers_page_lists_seeded_rows() {
        let app = app(seeded_state().await);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let text = body_text(resp).await;
        assert!(text.contains("Senior Rust Developer"));
        assert!(text.contains("Java Architect"));
    }

    #[tokio::test]
    async fn offers_api_filters_by_query() {
        let app = app(seeded_state().await);
        let resp = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/api/offers?q=Rust")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let json: serde_json::Value =
            serde_json::from_str(&body_text(resp).await).expect("json body");
        let offers = json["offers"].as_array().expect("offers array");
        assert_eq!(offers.len(), 1);
        assert_eq!(offers[0]["title"], "Senior Rust Developer");
        assert_eq!(offers[0]["check"], false);
    }

    #[tokio::test]
    async fn check_toggle_round_trips_and_404s_on_missing_id() {
        let state = seeded_state().await;
        let id = state
            .repo
            .list(1, 10, None, SortOrder::Newest)
            .await
            .expect("list")
            .offers[0]
            .id;
        let app = app(state);

        let ok = app
            .clone()
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri(format!("/offers/{id}/check"))
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"check": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let missing = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/offers/424242/check")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{"check": true}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }
}
