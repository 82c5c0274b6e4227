//! Axum HTTP surface over the catalog cache and refresh coordinator.

use std::sync::Arc;

use anyhow::Context;
use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use cpw_core::{GameRecord, PriceChange};
use cpw_sources::SourceConfig;
use cpw_storage::{CacheEntry, CacheStore};
use cpw_sync::{CatalogRuntime, CycleReport, RefreshCoordinator, RefreshOutcome, RefreshState};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cpw-web";

const NOT_READY_MESSAGE: &str = "catalog is being fetched, try again shortly";

#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<RefreshCoordinator>,
    pub cache: Arc<CacheStore>,
    pub sources: Vec<SourceConfig>,
}

impl AppState {
    pub fn new(coordinator: Arc<RefreshCoordinator>, sources: Vec<SourceConfig>) -> Self {
        Self {
            cache: Arc::clone(coordinator.cache()),
            coordinator,
            sources,
        }
    }

    pub fn from_runtime(runtime: &CatalogRuntime) -> Self {
        Self::new(Arc::clone(&runtime.coordinator), runtime.sources.clone())
    }

    async fn entry(&self) -> Option<Arc<CacheEntry>> {
        self.cache.get(self.coordinator.key()).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServedFrom {
    Cache,
    Live,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogBody<'a> {
    pub games: &'a [GameRecord],
    pub new_games: &'a [GameRecord],
    pub price_changes: &'a [PriceChange],
    pub total: usize,
    pub last_updated: DateTime<Utc>,
    pub source: ServedFrom,
    pub stale: bool,
    pub complete: bool,
    pub upstream: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh: Option<RefreshOutcome>,
}

impl<'a> CatalogBody<'a> {
    fn new(entry: &'a CacheEntry, source: ServedFrom, stale: bool) -> Self {
        Self {
            games: &entry.snapshot,
            new_games: &entry.diff.new_records,
            price_changes: &entry.diff.price_changes,
            total: entry.snapshot.len(),
            last_updated: entry.fetched_at,
            source,
            stale,
            complete: entry.complete,
            upstream: &entry.source_id,
            refresh: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct NotReady {
    status: &'static str,
    message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh: Option<RefreshOutcome>,
}

fn not_ready(refresh: Option<RefreshOutcome>) -> Response {
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(NotReady {
            status: "not_ready",
            message: NOT_READY_MESSAGE,
            refresh,
        }),
    )
        .into_response()
}

#[derive(Debug, Default, Deserialize)]
pub struct RefreshParams {
    #[serde(default)]
    pub wait: bool,
    #[serde(default)]
    pub invalidate: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CacheStatus {
    present: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    fetched_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    age_secs: Option<u64>,
    stale: bool,
    total: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    upstream: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody<'a> {
    state: RefreshState,
    last_cycle: Option<CycleReport>,
    cache: CacheStatus,
    sources: &'a [SourceConfig],
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(health_handler))
        .route("/catalog", get(catalog_handler))
        .route("/refresh", post(refresh_handler))
        .route("/status", get(status_handler))
        .with_state(Arc::new(state))
}

/// Build the runtime from the environment, start the scheduler and serve
/// until ctrl-c.
pub async fn serve_from_env() -> anyhow::Result<()> {
    let runtime = cpw_sync::build_runtime_from_env().await?;
    let scheduler = runtime.start_scheduler().await?;
    let port = runtime.config.web_port;

    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .with_context(|| format!("binding port {port}"))?;
    info!(port, "catalog api listening");
    axum::serve(listener, app(AppState::from_runtime(&runtime)))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving http")?;

    if let Some(scheduler) = scheduler {
        scheduler.shutdown().await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn catalog_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(entry) = state.entry().await else {
        state.coordinator.trigger_refresh();
        return not_ready(None);
    };
    let stale = state.cache.is_expired(&entry);
    if stale {
        state.coordinator.trigger_if_stale(&entry);
    }
    Json(CatalogBody::new(&entry, ServedFrom::Cache, stale)).into_response()
}

async fn refresh_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<RefreshParams>,
) -> Response {
    if params.invalidate {
        let dropped = state.cache.invalidate(state.coordinator.key()).await;
        info!(dropped = dropped.is_some(), "cache invalidated on request");
    }

    if !params.wait {
        let started = state.coordinator.trigger_refresh();
        let status = if started { "accepted" } else { "already_running" };
        return (StatusCode::ACCEPTED, Json(serde_json::json!({ "status": status }))).into_response();
    }

    let outcome = state.coordinator.refresh_now().await;
    let committed = match &outcome {
        RefreshOutcome::Committed { .. } => true,
        RefreshOutcome::AlreadyInFlight => {
            state.coordinator.wait_idle().await;
            state
                .coordinator
                .last_cycle()
                .is_some_and(|cycle| matches!(cycle.outcome, RefreshOutcome::Committed { .. }))
        }
        RefreshOutcome::Exhausted | RefreshOutcome::Failed { .. } => false,
    };
    let served_from = if committed { ServedFrom::Live } else { ServedFrom::Cache };
    match state.entry().await {
        Some(entry) => {
            let stale = state.cache.is_expired(&entry);
            let mut body = CatalogBody::new(&entry, served_from, stale);
            body.refresh = Some(outcome);
            Json(body).into_response()
        }
        None => not_ready(Some(outcome)),
    }
}

async fn status_handler(State(state): State<Arc<AppState>>) -> Response {
    let entry = state.entry().await;
    let now = Utc::now();
    let cache = match &entry {
        Some(entry) => CacheStatus {
            present: true,
            fetched_at: Some(entry.fetched_at),
            expires_at: Some(entry.expires_at()),
            age_secs: Some(entry.age_at(now).as_secs()),
            stale: entry.is_expired_at(now),
            total: entry.snapshot.len(),
            upstream: Some(entry.source_id.clone()),
        },
        None => CacheStatus {
            present: false,
            fetched_at: None,
            expires_at: None,
            age_secs: None,
            stale: false,
            total: 0,
            upstream: None,
        },
    };
    let status = state.coordinator.status();
    Json(StatusBody {
        state: status.state,
        last_cycle: status.last_cycle,
        cache,
        sources: &state.sources,
    })
    .into_response()
}
