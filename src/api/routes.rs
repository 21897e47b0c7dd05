//! REST routes over the comparison engine and observation store.

use crate::engine::{BatchRequest, CompareRequest, ComparisonEngine, ResolveSpec};
use crate::engine::temporal::AsOfPolicy;
use crate::error::EngineError;
use crate::models::{
    Basis, Direction, FiscalPeriod, Observation, ObservationKey, Scope,
    TransitionEvent,
};
use crate::store::{ObservationFilter, ObservationStore};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::debug;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObservationStore>,
    pub engine: ComparisonEngine,
    pub events: broadcast::Sender<TransitionEvent>,
}

impl AppState {
    pub fn new(
        store: Arc<dyn ObservationStore>,
        events: broadcast::Sender<TransitionEvent>,
    ) -> Self {
        let engine = ComparisonEngine::new(store.clone());
        Self {
            store,
            engine,
            events,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/compare", post(compare))
        .route("/v1/compare/batch", post(compare_batch))
        .route("/v1/recent", get(recent))
        .route("/v1/history", get(history))
        .route("/v1/stats", get(stats))
        .route("/v1/stream/earnings", get(super::stream::stream_earnings))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Wire error envelope; every failure renders as `{code, message}`
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }

    fn invalid_period(raw: &str) -> Self {
        Self::new(
            StatusCode::BAD_REQUEST,
            "INVALID_PERIOD",
            format!("unparseable fiscal period: {raw}"),
        )
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "code": self.code,
            "message": self.message,
        });
        (self.status, Json(body)).into_response()
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        let status = match &err {
            EngineError::NoActual { .. }
            | EngineError::ObservationNotFound(_) => StatusCode::NOT_FOUND,
            EngineError::AmbiguousSource { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::AdjustmentIntegrity { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            EngineError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        };
        ApiError::new(status, err.code(), err.to_string())
    }
}

async fn health() -> &'static str {
    "obspine operational"
}

#[derive(Debug, Deserialize)]
pub struct CompareBody {
    pub entity_id: String,
    pub metric_code: String,
    /// `2024:Q4` or `2024:FY`
    pub period: String,
    #[serde(default = "default_basis")]
    pub basis: Basis,
    /// Pin a leg to one vendor instead of authority resolution
    pub estimate_source: Option<String>,
    pub actual_source: Option<String>,
    /// Evaluate both legs as of this instant instead of pre-announcement
    pub as_of: Option<DateTime<Utc>>,
    #[serde(default)]
    pub include_yoy: bool,
}

fn default_basis() -> Basis {
    Basis::Adjusted
}

#[derive(Debug, Serialize)]
pub struct CompareResponse {
    pub entity_id: String,
    pub metric_code: String,
    pub period: String,
    pub estimate: Option<Observation>,
    pub actual: Observation,
    pub comparable: Option<Observation>,
    pub difference: Option<Decimal>,
    pub surprise_pct: Option<Decimal>,
    pub surprise_direction: Direction,
    pub beat: Option<bool>,
    pub yoy_growth_pct: Option<Decimal>,
    pub released_at: DateTime<Utc>,
    pub source: String,
    pub processed_at: DateTime<Utc>,
}

impl From<crate::models::ComparisonResult> for CompareResponse {
    fn from(result: crate::models::ComparisonResult) -> Self {
        Self {
            entity_id: result.entity_id,
            metric_code: result.metric_code,
            period: result.period.to_string(),
            released_at: result.actual.as_of,
            source: result.actual.source.vendor.clone(),
            estimate: result.estimate,
            actual: result.actual,
            comparable: result.comparable,
            difference: result.difference,
            surprise_pct: result.surprise_pct,
            surprise_direction: result.direction,
            beat: result.beat,
            yoy_growth_pct: result.yoy_growth_pct,
            processed_at: Utc::now(),
        }
    }
}

async fn compare(
    State(state): State<AppState>,
    Json(body): Json<CompareBody>,
) -> Result<Json<CompareResponse>, ApiError> {
    let period: FiscalPeriod = body
        .period
        .parse()
        .map_err(|_| ApiError::invalid_period(&body.period))?;

    let mut estimate = match body.as_of {
        Some(ts) => ResolveSpec {
            as_of: AsOfPolicy::At(ts),
            ..ResolveSpec::authoritative(body.basis)
        },
        None => ResolveSpec::pre_announcement(body.basis),
    };
    estimate.source = body.estimate_source;
    let mut actual = match body.as_of {
        Some(ts) => ResolveSpec {
            as_of: AsOfPolicy::At(ts),
            ..ResolveSpec::authoritative(body.basis)
        },
        None => ResolveSpec::authoritative(body.basis),
    };
    actual.source = body.actual_source;

    let req = CompareRequest {
        entity_id: body.entity_id.clone(),
        metric_code: body.metric_code,
        period,
        estimate,
        actual,
        include_yoy: body.include_yoy,
    };

    match state.engine.compare(&req).await {
        Ok(result) => Ok(Json(result.into())),
        Err(EngineError::NoActual { key }) => {
            Err(not_found_detail(&state, &body.entity_id, key).await)
        }
        Err(other) => Err(other.into()),
    }
}

/// Distinguish "entity unknown" from "entity known, no actual yet"
async fn not_found_detail(state: &AppState, entity_id: &str, key: ObservationKey) -> ApiError {
    let probe = ObservationFilter {
        entity_id: Some(entity_id.to_string()),
        limit: Some(1),
        ..Default::default()
    };
    match state.store.query(&probe).await {
        Ok(rows) if rows.is_empty() => ApiError::new(
            StatusCode::NOT_FOUND,
            "ENTITY_NOT_FOUND",
            format!("no observations recorded for entity {entity_id}"),
        ),
        Ok(_) => EngineError::NoActual { key }.into(),
        Err(err) => EngineError::from(err).into(),
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchBody {
    pub metric_code: String,
    pub period: String,
    #[serde(default = "default_basis")]
    pub basis: Basis,
    /// None scans every entity with an actual in the period
    pub entity_ids: Option<Vec<String>>,
    #[serde(default)]
    pub include_yoy: bool,
}

#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub metric_code: String,
    pub period: String,
    pub total_companies: usize,
    pub companies_with_estimates: usize,
    pub beat_count: usize,
    pub miss_count: usize,
    pub inline_count: usize,
    /// beats / (beats + misses + inlines); None when no entity had an estimate
    pub beat_rate: Option<f64>,
    pub results: Vec<CompareResponse>,
    pub errors: Vec<BatchError>,
}

#[derive(Debug, Serialize)]
pub struct BatchError {
    pub code: String,
    pub message: String,
}

async fn compare_batch(
    State(state): State<AppState>,
    Json(body): Json<BatchBody>,
) -> Result<Json<BatchResponse>, ApiError> {
    let period: FiscalPeriod = body
        .period
        .parse()
        .map_err(|_| ApiError::invalid_period(&body.period))?;

    let req = BatchRequest {
        period,
        metric_code: body.metric_code.clone(),
        entity_ids: body.entity_ids,
        estimate: ResolveSpec::pre_announcement(body.basis),
        actual: ResolveSpec::authoritative(body.basis),
        include_yoy: body.include_yoy,
    };
    let mut cursor = state.engine.compare_all(req).await?;
    let (results, errors) = cursor.collect_remaining().await;

    let mut beat_count = 0;
    let mut miss_count = 0;
    let mut inline_count = 0;
    for result in &results {
        match result.direction {
            Direction::Beat => beat_count += 1,
            Direction::Miss => miss_count += 1,
            Direction::Inline => inline_count += 1,
            Direction::NoEstimate => {}
        }
    }
    let companies_with_estimates = beat_count + miss_count + inline_count;
    let beat_rate = if companies_with_estimates > 0 {
        Decimal::from(beat_count)
            .checked_div(Decimal::from(companies_with_estimates))
            .and_then(|r| r.to_f64())
    } else {
        None
    };
    debug!(
        metric = body.metric_code.as_str(),
        results = results.len(),
        errors = errors.len(),
        "batch comparison complete"
    );

    Ok(Json(BatchResponse {
        metric_code: body.metric_code,
        period: period.to_string(),
        total_companies: results.len(),
        companies_with_estimates,
        beat_count,
        miss_count,
        inline_count,
        beat_rate,
        results: results.into_iter().map(CompareResponse::from).collect(),
        errors: errors
            .into_iter()
            .map(|err| BatchError {
                code: err.code().to_string(),
                message: err.to_string(),
            })
            .collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    #[serde(default = "default_since_minutes")]
    pub since_minutes: i64,
    pub metric_code: Option<String>,
}

fn default_since_minutes() -> i64 {
    60
}

#[derive(Debug, Serialize)]
pub struct RecentResponse {
    pub since: DateTime<Utc>,
    pub count: usize,
    pub observations: Vec<Observation>,
}

/// REPORTED observations announced within the trailing window
async fn recent(
    State(state): State<AppState>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<RecentResponse>, ApiError> {
    let since = Utc::now() - Duration::minutes(query.since_minutes.max(0));
    let filter = ObservationFilter {
        scope: Some(Scope::Reported),
        metric_code: query.metric_code,
        as_of_after: Some(since),
        ..Default::default()
    };
    let mut observations = state.store.query(&filter).await.map_err(EngineError::from)?;
    observations.sort_by(|a, b| b.as_of.cmp(&a.as_of));

    Ok(Json(RecentResponse {
        since,
        count: observations.len(),
        observations,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub entity_id: String,
    pub metric_code: String,
    pub period: String,
    #[serde(default = "default_basis")]
    pub basis: Basis,
    #[serde(default = "default_scope")]
    pub scope: Scope,
}

fn default_scope() -> Scope {
    Scope::Reported
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub count: usize,
    pub revisions: Vec<Observation>,
}

/// Full revision history for one logical key, oldest first
async fn history(
    State(state): State<AppState>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let period: FiscalPeriod = query
        .period
        .parse()
        .map_err(|_| ApiError::invalid_period(&query.period))?;
    let key = ObservationKey {
        entity_id: query.entity_id,
        metric_code: query.metric_code,
        basis: query.basis,
        scope: query.scope,
        period,
    };
    let revisions = state.store.history(&key).await.map_err(EngineError::from)?;

    Ok(Json(HistoryResponse {
        count: revisions.len(),
        revisions,
    }))
}

async fn stats(State(state): State<AppState>) -> Result<Json<crate::store::StoreStats>, ApiError> {
    Ok(Json(state.store.stats().await.map_err(EngineError::from)?))
}
