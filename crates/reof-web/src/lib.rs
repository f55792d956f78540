//! JSON reporting API over the opportunity store.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use reof_core::{order_for_report, summarize, CityRegistry, CitySummary, Opportunity, ScanRun, Summary};
use reof_storage::OpportunityStore;
use reof_sync::{load_city_registry, open_store, SyncConfig};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{error, info};

pub const CRATE_NAME: &str = "reof-web";

const DEFAULT_PER_PAGE: usize = 20;
const MAX_PER_PAGE: usize = 200;
const DEFAULT_SCAN_RUN_LIMIT: usize = 50;
const MAX_SCAN_RUN_LIMIT: usize = 500;
const RECENT_SCAN_RUNS: usize = 20;
const CITY_TOP_OPPORTUNITIES: usize = 10;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn OpportunityStore>,
    pub registry: Arc<CityRegistry>,
}

impl AppState {
    pub fn new(store: Arc<dyn OpportunityStore>, registry: Arc<CityRegistry>) -> Self {
        Self { store, registry }
    }
}

#[derive(Debug, Deserialize, Default)]
pub struct OpportunitiesQuery {
    pub city: Option<String>,
    pub source: Option<String>,
    pub page: Option<usize>,
    pub per_page: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct OpportunitiesPage {
    pub page: usize,
    pub per_page: usize,
    pub total: usize,
    pub total_pages: usize,
    pub source_counts: BTreeMap<String, usize>,
    pub items: Vec<Opportunity>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatisticsResponse {
    pub summary: Summary,
    pub recent_scan_runs: Vec<ScanRun>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CityResponse {
    pub summary: CitySummary,
    pub top_opportunities: Vec<Opportunity>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ScanRunsQuery {
    pub limit: Option<usize>,
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/api/opportunities", get(opportunities_handler))
        .route("/api/statistics", get(statistics_handler))
        .route("/api/cities/{city}", get(city_handler))
        .route("/api/scan-runs", get(scan_runs_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, store = state.store.backend(), "reporting api listening");
    axum::serve(listener, app(state)).await?;
    Ok(())
}

pub async fn serve_from_env() -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let registry = load_city_registry(&config.cities_path())?;
    let store = open_store(&config).await?;
    serve(AppState::new(store, Arc::new(registry)), config.web_port).await
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(serde_json::json!({
        "status": "ok",
        "store": state.store.backend(),
        "cities": state.registry.len(),
    }))
    .into_response()
}

async fn opportunities_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<OpportunitiesQuery>,
) -> Response {
    match state.store.list_all().await {
        Ok(mut all) => {
            order_for_report(&mut all, &state.registry);
            Json(filtered_paginated_opportunities(all, &query)).into_response()
        }
        Err(err) => server_error(err),
    }
}

async fn statistics_handler(State(state): State<Arc<AppState>>) -> Response {
    let opportunities = match state.store.list_all().await {
        Ok(all) => all,
        Err(err) => return server_error(err),
    };
    let runs = match state.store.list_scan_runs(None).await {
        Ok(runs) => runs,
        Err(err) => return server_error(err),
    };
    let summary = summarize(&opportunities, &runs, &state.registry);
    Json(StatisticsResponse {
        summary,
        recent_scan_runs: runs.into_iter().take(RECENT_SCAN_RUNS).collect(),
    })
    .into_response()
}

async fn city_handler(
    State(state): State<Arc<AppState>>,
    Path(city): Path<String>,
) -> Response {
    let Some(profile) = state.registry.by_name(&city) else {
        return not_found(format!("unknown city `{city}`"));
    };
    let mut opportunities = match state.store.list_by_city(&profile.city).await {
        Ok(list) => list,
        Err(err) => return server_error(err),
    };
    let runs = match state.store.list_scan_runs(None).await {
        Ok(runs) => runs,
        Err(err) => return server_error(err),
    };
    let summary = summarize(&opportunities, &runs, &state.registry)
        .city(&profile.city)
        .cloned()
        .unwrap_or_else(|| CitySummary {
            city: profile.city.clone(),
            state: profile.state.clone(),
            priority: profile.priority,
            ..CitySummary::default()
        });
    order_for_report(&mut opportunities, &state.registry);
    opportunities.truncate(CITY_TOP_OPPORTUNITIES);
    Json(CityResponse {
        summary,
        top_opportunities: opportunities,
    })
    .into_response()
}

async fn scan_runs_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ScanRunsQuery>,
) -> Response {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_SCAN_RUN_LIMIT)
        .clamp(1, MAX_SCAN_RUN_LIMIT);
    match state.store.list_scan_runs(Some(limit)).await {
        Ok(runs) => Json(runs).into_response(),
        Err(err) => server_error(err),
    }
}

fn server_error(err: impl std::fmt::Display) -> Response {
    error!(error = %err, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({ "error": err.to_string() })),
    )
        .into_response()
}

fn not_found(message: String) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": message })),
    )
        .into_response()
}

/// Filter an already report-ordered list by city/source and cut one page out of it.
fn filtered_paginated_opportunities(
    all: Vec<Opportunity>,
    query: &OpportunitiesQuery,
) -> OpportunitiesPage {
    let selected_city = query.city.as_deref().map(str::trim).unwrap_or_default();
    let selected_source = query.source.as_deref().map(str::trim).unwrap_or_default();

    let in_city = all
        .into_iter()
        .filter(|o| selected_city.is_empty() || o.city.eq_ignore_ascii_case(selected_city))
        .collect::<Vec<_>>();
    let mut source_counts = BTreeMap::<String, usize>::new();
    for o in &in_city {
        *source_counts.entry(o.source.clone()).or_default() += 1;
    }

    let filtered = in_city
        .into_iter()
        .filter(|o| selected_source.is_empty() || o.source == selected_source)
        .collect::<Vec<_>>();

    let per_page = query
        .per_page
        .unwrap_or(DEFAULT_PER_PAGE)
        .clamp(1, MAX_PER_PAGE);
    let total = filtered.len();
    let total_pages = total.max(1).div_ceil(per_page);
    let page = query.page.unwrap_or(1).clamp(1, total_pages);
    let start = (page - 1) * per_page;
    let items = filtered
        .into_iter()
        .skip(start)
        .take(per_page)
        .collect::<Vec<_>>();

    OpportunitiesPage {
        page,
        per_page,
        total,
        total_pages,
        source_counts,
        items,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use chrono::{TimeZone, Utc};
    use http_body_util::BodyExt;
    use reof_core::{CityProfile, NormalizedListing, ScanStatus};
    use reof_storage::{MemoryStore, RefreshPolicy};
    use tower::ServiceExt;
    use uuid::Uuid;

    fn profile(city: &str, state: &str, priority: u32) -> CityProfile {
        CityProfile {
            priority,
            potential_label: "gold".to_string(),
            ..CityProfile::new(city, state)
        }
    }

    fn registry() -> CityRegistry {
        CityRegistry::new(vec![
            profile("Senador Canedo", "GO", 6),
            profile("Lucas do Rio Verde", "MT", 1),
        ])
    }

    fn opportunity(profile: &CityProfile, title: &str, price: f64, score: u32, source: &str) -> Opportunity {
        let listing = NormalizedListing {
            title: title.to_string(),
            price,
            area: 200.0,
            price_per_area: price / 200.0,
            rooms: 3,
            bathrooms: 1,
            parking_spaces: 2,
            neighborhood: profile.city.clone(),
            address: format!("{}, {}/{}", profile.city, profile.city, profile.state),
            source_url: String::new(),
            reference: None,
        };
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap();
        Opportunity::new(listing, score, source, profile, at)
    }

    async fn seeded_state() -> AppState {
        let registry = registry();
        let canedo = registry.by_name("Senador Canedo").unwrap().clone();
        let lucas = registry.by_name("Lucas do Rio Verde").unwrap().clone();
        let store = MemoryStore::new();
        for opp in [
            opportunity(&canedo, "Casa 3 quartos no Jardim Europa", 280_000.0, 90, "62imoveis"),
            opportunity(&canedo, "Sobrado no Setor Leste", 350_000.0, 70, "vivareal"),
            opportunity(&lucas, "Terreno no bairro Cidade Nova", 95_000.0, 60, "vivareal"),
        ] {
            store.upsert(&opp, RefreshPolicy::SkipIfPresent).await.unwrap();
        }
        for (minute, status) in [(0, ScanStatus::Success), (5, ScanStatus::Error("http status 503".into()))] {
            store
                .append_scan_run(&ScanRun {
                    id: Uuid::new_v4(),
                    run_id: Uuid::nil(),
                    source: "vivareal".to_string(),
                    city: "Lucas do Rio Verde".to_string(),
                    total_candidates: 3,
                    opportunities_found: 1,
                    duration_seconds: 1.5,
                    status,
                    timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 9, minute, 0).unwrap(),
                })
                .await
                .unwrap();
        }
        AppState::new(Arc::new(store), Arc::new(registry))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn health_reports_store_backend() {
        let (status, body) = get_json(app(seeded_state().await), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["store"], "memory");
        assert_eq!(body["cities"], 2);
    }

    #[tokio::test]
    async fn opportunities_are_ordered_by_city_priority_then_score() {
        let (status, body) = get_json(app(seeded_state().await), "/api/opportunities").await;
        assert_eq!(status, StatusCode::OK);
        let titles = body["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|o| o["title"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(
            titles,
            vec![
                "Terreno no bairro Cidade Nova",
                "Casa 3 quartos no Jardim Europa",
                "Sobrado no Setor Leste"
            ]
        );
        assert_eq!(body["total"], 3);
    }

    #[tokio::test]
    async fn opportunities_filter_and_paginate() {
        let app = app(seeded_state().await);
        let (_, body) = get_json(app.clone(), "/api/opportunities?city=senador%20canedo&per_page=1&page=2").await;
        assert_eq!(body["total"], 2);
        assert_eq!(body["total_pages"], 2);
        assert_eq!(body["page"], 2);
        assert_eq!(body["items"][0]["title"], "Sobrado no Setor Leste");
        assert_eq!(body["source_counts"]["62imoveis"], 1);

        let (_, body) = get_json(app, "/api/opportunities?source=vivareal").await;
        assert_eq!(body["total"], 2);
    }

    #[tokio::test]
    async fn statistics_include_city_and_global_summaries() {
        let (status, body) = get_json(app(seeded_state().await), "/api/statistics").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["global"]["total_opportunities"], 3);
        assert_eq!(body["summary"]["global"]["failed_scan_runs"], 1);
        assert_eq!(body["summary"]["cities"][0]["city"], "Lucas do Rio Verde");
        assert_eq!(body["summary"]["cities"][1]["opportunities"], 2);
        assert_eq!(body["recent_scan_runs"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn city_endpoint_accepts_slug_and_rejects_unknown_city() {
        let app = app(seeded_state().await);
        let (status, body) = get_json(app.clone(), "/api/cities/senador-canedo").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["summary"]["opportunities"], 2);
        assert_eq!(body["top_opportunities"][0]["score"], 90);

        let (status, body) = get_json(app, "/api/cities/goiania").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(body["error"].as_str().unwrap().contains("goiania"));
    }

    #[tokio::test]
    async fn scan_runs_are_newest_first_and_limited() {
        let (status, body) = get_json(app(seeded_state().await), "/api/scan-runs?limit=1").await;
        assert_eq!(status, StatusCode::OK);
        let runs = body.as_array().unwrap();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0]["status"], "error:http status 503");
    }
}
