// Metric Reconciliation - Web Server
// REST API with Axum over the reconciliation core

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::NaiveDate;
use metric_reconciliation::{
    init_logging, DataSource, DateRange, MetricCategory, PriorityMatrix, ReconciledValue,
    ReconcilerConfig, SqliteStore, UnifiedFetcher,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Shared application state
#[derive(Clone)]
struct AppState {
    fetcher: Arc<UnifiedFetcher<SqliteStore>>,
    timeout: Duration,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

#[derive(Deserialize)]
struct LatestParams {
    /// Comma separated metric names
    metrics: Option<String>,
}

#[derive(Deserialize)]
struct HistoryParams {
    from: NaiveDate,
    to: NaiveDate,
}

#[derive(Serialize)]
struct RankedSource {
    rank: usize,
    source: DataSource,
    priority: u8,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// Run a reconciliation on the blocking pool, bounded by the request timeout
async fn run_reconcile<F>(state: &AppState, job: F) -> axum::response::Response
where
    F: FnOnce(&UnifiedFetcher<SqliteStore>) -> anyhow::Result<Vec<ReconciledValue>> + Send + 'static,
{
    let fetcher = state.fetcher.clone();
    let task = tokio::task::spawn_blocking(move || job(fetcher.as_ref()));

    match tokio::time::timeout(state.timeout, task).await {
        Ok(Ok(Ok(values))) => (StatusCode::OK, Json(ApiResponse::ok(values))).into_response(),
        Ok(Ok(Err(e))) => {
            error!("Reconciliation failed: {:#}", e);
            (
                StatusCode::BAD_GATEWAY,
                Json(ApiResponse::<Vec<ReconciledValue>>::err(e.to_string())),
            )
                .into_response()
        }
        Ok(Err(join_err)) => {
            error!("Reconciliation task panicked: {}", join_err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::<Vec<ReconciledValue>>::err("internal error".to_string())),
            )
                .into_response()
        }
        Err(_) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(ApiResponse::<Vec<ReconciledValue>>::err(format!(
                "metric store did not answer within {:?}",
                state.timeout
            ))),
        )
            .into_response(),
    }
}

/// GET /api/users/:user_id/latest?metrics=weight,hrv
async fn get_latest(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Query(params): Query<LatestParams>,
) -> impl IntoResponse {
    let metrics: Option<Vec<String>> = params.metrics.map(|m| {
        m.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    });

    run_reconcile(&state, move |fetcher| {
        fetcher.reconcile_latest(&user_id, metrics.as_deref())
    })
    .await
}

/// GET /api/users/:user_id/history/:metric?from=YYYY-MM-DD&to=YYYY-MM-DD
async fn get_history(
    State(state): State<AppState>,
    Path((user_id, metric)): Path<(String, String)>,
    Query(params): Query<HistoryParams>,
) -> impl IntoResponse {
    let range = match DateRange::new(params.from, params.to) {
        Ok(range) => range,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::<Vec<ReconciledValue>>::err(e.to_string())),
            )
                .into_response()
        }
    };

    run_reconcile(&state, move |fetcher| {
        fetcher.reconcile_history(&user_id, &metric, range)
    })
    .await
}

/// GET /api/priorities/:category - Ranked sources for a metric category
async fn get_priorities(Path(category): Path<String>) -> impl IntoResponse {
    let Some(category) = MetricCategory::parse(&category) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::<Vec<RankedSource>>::err(format!(
                "Unknown category: {}",
                category
            ))),
        )
            .into_response();
    };

    let matrix = PriorityMatrix::global();
    let ranked: Vec<RankedSource> = matrix
        .ranked_sources(category)
        .into_iter()
        .enumerate()
        .map(|(i, source)| RankedSource {
            rank: i + 1,
            source,
            priority: matrix.priority(source, category),
        })
        .collect();

    (StatusCode::OK, Json(ApiResponse::ok(ranked))).into_response()
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let config = ReconcilerConfig::load()?;
    let store = SqliteStore::open(&config.database_path, config.fetch_timeout())?;
    info!(path = ?config.database_path, "Database opened");

    let state = AppState {
        timeout: config.fetch_timeout(),
        fetcher: Arc::new(UnifiedFetcher::with_config(store, config)),
    };

    let app = router(state);

    let addr = env_or("METRIC_RECONCILER_ADDR", "0.0.0.0:3000");
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!("🚀 Server running on http://{}", addr);
    info!("   API: http://{}/api/users/<user_id>/latest", addr);

    axum::serve(listener, app).await?;

    Ok(())
}

fn router(state: AppState) -> Router {
    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/users/:user_id/latest", get(get_latest))
        .route("/users/:user_id/history/:metric", get(get_history))
        .route("/priorities/:category", get(get_priorities))
        .with_state(state);

    Router::new().nest("/api", api_routes).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive()),
    )
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

// ============================================================================
// TESTS
// ============================================================================
