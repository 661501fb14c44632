// FuelEU Compliance - REST API
// Routes, comparison, compliance balance, banking and pooling endpoints

use axum::{
    extract::{
        rejection::{JsonRejection, QueryRejection},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::error::ComplianceError;
use crate::routes::RouteFilter;
use crate::service::ComplianceService;

/// Requests running longer than this are answered with 408
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Request / response payloads
// ============================================================================

/// Wrapper matching the `{ data: ... }` shape the dashboard reads
#[derive(Serialize)]
struct DataResponse<T> {
    data: T,
}

#[derive(Serialize)]
struct MessageResponse<T> {
    message: String,
    data: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShipYearQuery {
    ship_id: String,
    year: i32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecordsQuery {
    ship_id: String,
    year: Option<i32>,
}

#[derive(Debug, Deserialize)]
struct YearQuery {
    year: Option<i32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BankingRequest {
    ship_id: String,
    year: i32,
    amount: f64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PoolMemberRequest {
    ship_id: String,
}

#[derive(Debug, Deserialize)]
struct CreatePoolRequest {
    year: i32,
    members: Vec<PoolMemberRequest>,
}

// ============================================================================
// Errors
// ============================================================================

pub struct ApiError(ComplianceError);

impl From<ComplianceError> for ApiError {
    fn from(err: ComplianceError) -> Self {
        ApiError(err)
    }
}

// Extractor failures answer in the same `{message, code}` shape as domain errors
impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError(ComplianceError::Validation(rejection.body_text()))
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError(ComplianceError::Validation(rejection.body_text()))
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match &self.0 {
            ComplianceError::Validation(_) | ComplianceError::DuplicateMember(_) => StatusCode::BAD_REQUEST,
            ComplianceError::NotFound(_) | ComplianceError::MemberNotFound { .. } => StatusCode::NOT_FOUND,
            ComplianceError::Conflict(_) => StatusCode::CONFLICT,
            ComplianceError::InsufficientSurplus { .. }
            | ComplianceError::InsufficientBankedBalance { .. }
            | ComplianceError::InvalidPool { .. }
            | ComplianceError::NoBaselineSet => StatusCode::UNPROCESSABLE_ENTITY,
            ComplianceError::Internal(_) | ComplianceError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = serde_json::json!({
            "message": self.0.to_string(),
            "code": self.0.code(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

// ============================================================================
// API Handlers
// ============================================================================

/// GET /health - Health check
async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "version": crate::VERSION }))
}

/// GET /routes - All routes, optional vesselType/fuelType/year filters
async fn list_routes(
    State(service): State<ComplianceService>,
    query: Result<Query<RouteFilter>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(filter) = query?;
    Ok(Json(service.list_routes(&filter)?))
}

/// POST /routes/:id/baseline - Make a route the comparison baseline
async fn set_baseline(
    State(service): State<ComplianceService>,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let id: i64 = id
        .parse()
        .map_err(|_| ComplianceError::Validation(format!("route id must be an integer, got '{}'", id)))?;

    let route = service.set_baseline(id)?;
    Ok(Json(MessageResponse {
        message: format!("Route {} set as baseline", route.route_id),
        data: route,
    }))
}

/// GET /routes/comparison - Baseline vs every other route
async fn get_comparison(State(service): State<ComplianceService>) -> ApiResult<impl IntoResponse> {
    Ok(Json(service.comparison()?))
}

/// GET /compliance/cb?shipId&year
async fn get_cb(
    State(service): State<ComplianceService>,
    query: Result<Query<ShipYearQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    Ok(Json(DataResponse {
        data: service.compute_cb(&query.ship_id, query.year)?,
    }))
}

/// GET /compliance/adjusted-cb?shipId&year
async fn get_adjusted_cb(
    State(service): State<ComplianceService>,
    query: Result<Query<ShipYearQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    Ok(Json(DataResponse {
        data: service.adjusted_cb(&query.ship_id, query.year)?,
    }))
}

/// POST /compliance/banking/bank
async fn bank_surplus(
    State(service): State<ComplianceService>,
    payload: Result<Json<BankingRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let outcome = service.bank_surplus(&request.ship_id, request.year, request.amount)?;
    Ok(Json(MessageResponse {
        message: format!(
            "Banked {:.2} gCO2e for {} ({}); banked balance {:.2}",
            request.amount, request.ship_id, request.year, outcome.banked_balance
        ),
        data: outcome,
    }))
}

/// POST /compliance/banking/apply
async fn apply_banked(
    State(service): State<ComplianceService>,
    payload: Result<Json<BankingRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let outcome = service.apply_banked(&request.ship_id, request.year, request.amount)?;
    Ok(Json(MessageResponse {
        message: format!(
            "Applied {:.2} gCO2e to {} ({}); banked balance {:.2}",
            request.amount, request.ship_id, request.year, outcome.banked_balance
        ),
        data: outcome,
    }))
}

/// POST /compliance/banking/borrow
async fn borrow_forward(
    State(service): State<ComplianceService>,
    payload: Result<Json<BankingRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let outcome = service.borrow_forward(&request.ship_id, request.year, request.amount)?;
    Ok(Json(MessageResponse {
        message: format!(
            "Borrowed {:.2} gCO2e into {} for {}",
            request.amount, request.year, request.ship_id
        ),
        data: outcome,
    }))
}

/// GET /compliance/banking/records?shipId[&year]
async fn banking_records(
    State(service): State<ComplianceService>,
    query: Result<Query<RecordsQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    Ok(Json(DataResponse {
        data: service.banking_records(&query.ship_id, query.year)?,
    }))
}

/// POST /pools - Create a pool for one reporting year
async fn create_pool(
    State(service): State<ComplianceService>,
    payload: Result<Json<CreatePoolRequest>, JsonRejection>,
) -> ApiResult<impl IntoResponse> {
    let Json(request) = payload?;
    let ship_ids: Vec<String> = request
        .members
        .into_iter()
        .map(|member| member.ship_id.trim().to_string())
        .collect();

    let pool = service.create_pool(request.year, &ship_ids)?;
    Ok((StatusCode::CREATED, Json(pool)))
}

/// GET /pools[?year]
async fn list_pools(
    State(service): State<ComplianceService>,
    query: Result<Query<YearQuery>, QueryRejection>,
) -> ApiResult<impl IntoResponse> {
    let Query(query) = query?;
    Ok(Json(service.list_pools(query.year)?))
}

/// GET /pools/:pool_id
async fn get_pool(
    State(service): State<ComplianceService>,
    Path(pool_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    Ok(Json(service.get_pool(&pool_id)?))
}

// ============================================================================
// Router
// ============================================================================

pub fn build_router(service: ComplianceService) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/routes", get(list_routes))
        .route("/routes/comparison", get(get_comparison))
        .route("/routes/:id/baseline", post(set_baseline))
        .route("/compliance/cb", get(get_cb))
        .route("/compliance/adjusted-cb", get(get_adjusted_cb))
        .route("/compliance/banking/bank", post(bank_surplus))
        .route("/compliance/banking/apply", post(apply_banked))
        .route("/compliance/banking/borrow", post(borrow_forward))
        .route("/compliance/banking/records", get(banking_records))
        .route("/pools", get(list_pools).post(create_pool))
        .route("/pools/:pool_id", get(get_pool))
        .with_state(service)
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
