//! REST API over the dispatch core.
//!
//! Provides endpoints for:
//! - One-shot planning
//! - Engine control and status
//! - Orders and driver events
//! - Alerts and SLA reporting
//! - Swagger UI at /q/swagger-ui

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use utoipa::{IntoParams, OpenApi, ToSchema};
use utoipa_swagger_ui::SwaggerUi;
use uuid::Uuid;

use crate::alerts::Alert;
use crate::console;
use crate::domain::{DeliveryPoint, Order, Stop, Vehicle, VehicleStatus};
use crate::engine::{Automation, EngineState, EngineStatus, StartOutcome, StopOutcome};
use crate::error::{DispatchError, FailureKind, FailureReport};
use crate::planner::{AuditEntry, PlanOutcome, PlanRequest, Planner};
use crate::sla::{ComplianceReport, SlaStatus};
use crate::state::{FleetSnapshot, FleetState};

/// Application state shared across handlers.
pub struct AppState {
    pub planner: Arc<Planner>,
    pub fleet: Arc<FleetState>,
    pub automation: Automation,
}

impl AppState {
    pub fn new(planner: Arc<Planner>, fleet: Arc<FleetState>) -> Self {
        Self {
            automation: Automation::new(Arc::clone(&fleet), Arc::clone(&planner)),
            planner,
            fleet,
        }
    }
}

/// Creates the API router with CORS and Swagger UI enabled.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & Info
        .route("/health", get(health))
        .route("/info", get(info))
        // Planning
        .route("/plans", post(create_plan))
        // Engines
        .route("/engines", get(list_engines))
        .route("/engines/{name}", get(get_engine))
        .route("/engines/{name}/stats", get(get_engine_stats))
        .route("/engines/{name}/start", post(start_engine))
        .route("/engines/{name}/stop", post(stop_engine))
        // Fleet and orders
        .route("/fleet", get(get_fleet))
        .route("/orders", post(submit_order))
        .route("/orders/{id}", get(get_order).delete(cancel_order))
        .route("/vehicles/{id}/complete-stop", post(complete_stop))
        .route("/vehicles/{id}/traffic", post(report_traffic))
        .route("/vehicles/{id}/status", put(set_vehicle_status))
        .route("/audit", get(get_audit))
        // Alerts and SLA
        .route("/alerts", get(list_alerts))
        .route("/alerts/{id}/resolve", post(resolve_alert))
        .route("/sla/status", get(sla_status))
        .route("/sla/compliance", get(sla_compliance))
        // Swagger UI at /q/swagger-ui (Quarkus-style path)
        .merge(SwaggerUi::new("/q/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(cors)
        .with_state(state)
}

// ============================================================================
// Errors
// ============================================================================

/// A [`DispatchError`] rendered as a [`FailureReport`].
pub struct ApiError(DispatchError);

impl From<DispatchError> for ApiError {
    fn from(e: DispatchError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0.kind() {
            FailureKind::NoCapacity | FailureKind::SlaUnachievable => StatusCode::UNPROCESSABLE_ENTITY,
            FailureKind::InvalidRequest | FailureKind::InvalidConfig => StatusCode::BAD_REQUEST,
            FailureKind::NotFound => StatusCode::NOT_FOUND,
            FailureKind::VehicleBusy => StatusCode::CONFLICT,
            FailureKind::ProviderTimeout => StatusCode::GATEWAY_TIMEOUT,
            FailureKind::SlaViolation | FailureKind::InvariantViolation => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }
        (status, Json(self.0.report())).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ============================================================================
// Health & Info
// ============================================================================

/// Health check response.
#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Status indicator ("UP" when healthy).
    pub status: &'static str,
}

/// GET /health - Health check endpoint.
#[utoipa::path(
    get,
    path = "/health",
    responses((status = 200, description = "Service is healthy", body = HealthResponse))
)]
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "UP" })
}

/// Application info response.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct InfoResponse {
    pub name: &'static str,
    pub version: &'static str,
    pub sla_window_minutes: i64,
    pub engines: Vec<&'static str>,
}

/// GET /info - Application info endpoint.
#[utoipa::path(
    get,
    path = "/info",
    responses((status = 200, description = "Application info", body = InfoResponse))
)]
async fn info(State(state): State<Arc<AppState>>) -> Json<InfoResponse> {
    Json(InfoResponse {
        name: "Fleet Dispatch",
        version: env!("CARGO_PKG_VERSION"),
        sla_window_minutes: state.planner.config().sla.window_minutes,
        engines: state.automation.names(),
    })
}

// ============================================================================
// Planning
// ============================================================================

/// POST /plans - Plan one batch of deliveries.
#[utoipa::path(
    post,
    path = "/plans",
    request_body = PlanRequest,
    responses(
        (status = 200, description = "Plan produced", body = PlanOutcome),
        (status = 422, description = "No capacity or SLA unachievable", body = FailureReport),
        (status = 400, description = "Malformed request", body = FailureReport)
    )
)]
async fn create_plan(
    State(state): State<Arc<AppState>>,
    Json(mut request): Json<PlanRequest>,
) -> ApiResult<PlanOutcome> {
    if request.start_at.is_none() {
        request.start_at = Some(state.fleet.now());
    }
    let outcome = state.planner.plan(&request).await?;
    console::print_plan_summary(&outcome);
    Ok(Json(outcome))
}

// ============================================================================
// Engines
// ============================================================================

/// Counters of one engine.
#[derive(Debug, Serialize, ToSchema)]
pub struct EngineStatsResponse {
    pub name: String,
    pub counters: BTreeMap<String, u64>,
}

/// Result of a start or stop command.
#[derive(Debug, Serialize, ToSchema)]
pub struct LifecycleResponse {
    pub name: String,
    /// `started`, `already_running`, `stopped` or `already_stopped`.
    pub result: String,
    pub state: EngineState,
}

/// GET /engines - Status of every engine.
#[utoipa::path(
    get,
    path = "/engines",
    responses((status = 200, description = "Engine statuses", body = Vec<EngineStatus>))
)]
async fn list_engines(State(state): State<Arc<AppState>>) -> Json<Vec<EngineStatus>> {
    Json(state.automation.statuses())
}

/// GET /engines/{name} - Status of one engine.
#[utoipa::path(
    get,
    path = "/engines/{name}",
    params(("name" = String, Path, description = "Engine name")),
    responses(
        (status = 200, description = "Engine status", body = EngineStatus),
        (status = 404, description = "Unknown engine", body = FailureReport)
    )
)]
async fn get_engine(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> ApiResult<EngineStatus> {
    Ok(Json(state.automation.get(&name)?.status()))
}

/// GET /engines/{name}/stats - Engine-specific counters.
#[utoipa::path(
    get,
    path = "/engines/{name}/stats",
    params(("name" = String, Path, description = "Engine name")),
    responses(
        (status = 200, description = "Engine counters", body = EngineStatsResponse),
        (status = 404, description = "Unknown engine", body = FailureReport)
    )
)]
async fn get_engine_stats(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<EngineStatsResponse> {
    let runner = state.automation.get(&name)?;
    Ok(Json(EngineStatsResponse {
        name: runner.name().to_string(),
        counters: runner.stats(),
    }))
}

/// POST /engines/{name}/start - Start an engine (no-op when running).
#[utoipa::path(
    post,
    path = "/engines/{name}/start",
    params(("name" = String, Path, description = "Engine name")),
    responses(
        (status = 200, description = "Engine running", body = LifecycleResponse),
        (status = 404, description = "Unknown engine", body = FailureReport)
    )
)]
async fn start_engine(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<LifecycleResponse> {
    let runner = state.automation.get(&name)?;
    let result = match runner.start() {
        StartOutcome::Started => "started",
        StartOutcome::AlreadyRunning => "already_running",
    };
    Ok(Json(LifecycleResponse {
        name: runner.name().to_string(),
        result: result.to_string(),
        state: runner.status().state,
    }))
}

/// POST /engines/{name}/stop - Stop an engine after its in-flight cycle.
#[utoipa::path(
    post,
    path = "/engines/{name}/stop",
    params(("name" = String, Path, description = "Engine name")),
    responses(
        (status = 200, description = "Engine stopped", body = LifecycleResponse),
        (status = 404, description = "Unknown engine", body = FailureReport)
    )
)]
async fn stop_engine(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> ApiResult<LifecycleResponse> {
    let runner = state.automation.get(&name)?;
    let result = match runner.stop().await {
        StopOutcome::Stopped => "stopped",
        StopOutcome::AlreadyStopped => "already_stopped",
    };
    Ok(Json(LifecycleResponse {
        name: runner.name().to_string(),
        result: result.to_string(),
        state: runner.status().state,
    }))
}

// ============================================================================
// Fleet, Orders & Driver Events
// ============================================================================

/// GET /fleet - Current vehicles and routes.
#[utoipa::path(
    get,
    path = "/fleet",
    responses((status = 200, description = "Fleet snapshot", body = FleetSnapshot))
)]
async fn get_fleet(State(state): State<Arc<AppState>>) -> Json<FleetSnapshot> {
    Json(state.fleet.snapshot().as_ref().clone())
}

/// POST /orders - Submit a new order.
#[utoipa::path(
    post,
    path = "/orders",
    request_body = DeliveryPoint,
    responses(
        (status = 201, description = "Order accepted", body = Order),
        (status = 400, description = "Duplicate order", body = FailureReport),
        (status = 404, description = "Unknown pickup", body = FailureReport)
    )
)]
async fn submit_order(
    State(state): State<Arc<AppState>>,
    Json(delivery): Json<DeliveryPoint>,
) -> Result<(StatusCode, Json<Order>), ApiError> {
    let order = state.fleet.submit_order(delivery)?;
    Ok((StatusCode::CREATED, Json(order)))
}

/// GET /orders/{id} - Get an order.
#[utoipa::path(
    get,
    path = "/orders/{id}",
    params(("id" = String, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order", body = Order),
        (status = 404, description = "Unknown order", body = FailureReport)
    )
)]
async fn get_order(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Order> {
    state
        .fleet
        .order(&id)
        .map(Json)
        .ok_or_else(|| DispatchError::NotFound { kind: "order", id }.into())
}

/// DELETE /orders/{id} - Cancel an order.
#[utoipa::path(
    delete,
    path = "/orders/{id}",
    params(("id" = String, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order cancelled", body = Order),
        (status = 404, description = "Unknown order", body = FailureReport)
    )
)]
async fn cancel_order(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Order> {
    Ok(Json(state.fleet.cancel_order(&id)?))
}

/// POST /vehicles/{id}/complete-stop - Driver finished the next stop.
#[utoipa::path(
    post,
    path = "/vehicles/{id}/complete-stop",
    params(("id" = String, Path, description = "Vehicle ID")),
    responses(
        (status = 200, description = "Completed stop", body = Stop),
        (status = 404, description = "No open stop", body = FailureReport),
        (status = 409, description = "Vehicle busy", body = FailureReport)
    )
)]
async fn complete_stop(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> ApiResult<Stop> {
    Ok(Json(state.fleet.complete_next_stop(&id).await?))
}

/// Traffic report body.
#[derive(Debug, Deserialize, ToSchema)]
pub struct TrafficReport {
    /// Multiplier on remaining travel times, at least 1.0.
    pub factor: f64,
}

/// POST /vehicles/{id}/traffic - Report a traffic incident on a route.
#[utoipa::path(
    post,
    path = "/vehicles/{id}/traffic",
    params(("id" = String, Path, description = "Vehicle ID")),
    request_body = TrafficReport,
    responses(
        (status = 202, description = "Re-optimisation queued"),
        (status = 404, description = "No route for vehicle", body = FailureReport)
    )
)]
async fn report_traffic(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(report): Json<TrafficReport>,
) -> Result<StatusCode, ApiError> {
    state.fleet.report_traffic(&id, report.factor)?;
    Ok(StatusCode::ACCEPTED)
}

/// Vehicle status change body.
#[derive(Debug, Deserialize, ToSchema)]
pub struct StatusChange {
    pub status: VehicleStatus,
}

/// PUT /vehicles/{id}/status - Change a vehicle's availability.
#[utoipa::path(
    put,
    path = "/vehicles/{id}/status",
    params(("id" = String, Path, description = "Vehicle ID")),
    request_body = StatusChange,
    responses(
        (status = 200, description = "Updated vehicle", body = Vehicle),
        (status = 404, description = "Unknown vehicle", body = FailureReport)
    )
)]
async fn set_vehicle_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(change): Json<StatusChange>,
) -> ApiResult<Vehicle> {
    Ok(Json(state.fleet.set_vehicle_status(&id, change.status).await?))
}

/// GET /audit - Assignment audit trail.
#[utoipa::path(
    get,
    path = "/audit",
    responses((status = 200, description = "Audit entries", body = Vec<AuditEntry>))
)]
async fn get_audit(State(state): State<Arc<AppState>>) -> Json<Vec<AuditEntry>> {
    Json(state.fleet.audit_log())
}

// ============================================================================
// Alerts & SLA
// ============================================================================

#[derive(Debug, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct AlertQuery {
    /// Only resolved (`true`) or only open (`false`) alerts.
    pub resolved: Option<bool>,
}

/// GET /alerts - Alert feed, newest first.
#[utoipa::path(
    get,
    path = "/alerts",
    params(AlertQuery),
    responses((status = 200, description = "Alerts", body = Vec<Alert>))
)]
async fn list_alerts(State(state): State<Arc<AppState>>, Query(query): Query<AlertQuery>) -> Json<Vec<Alert>> {
    Json(state.fleet.list_alerts(query.resolved))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub resolved_by: String,
}

/// POST /alerts/{id}/resolve - Resolve an alert.
#[utoipa::path(
    post,
    path = "/alerts/{id}/resolve",
    params(("id" = Uuid, Path, description = "Alert ID")),
    request_body = ResolveRequest,
    responses(
        (status = 200, description = "Resolved alert", body = Alert),
        (status = 404, description = "Unknown alert", body = FailureReport)
    )
)]
async fn resolve_alert(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Json(body): Json<ResolveRequest>,
) -> ApiResult<Alert> {
    Ok(Json(state.fleet.resolve_alert(id, &body.resolved_by)?))
}

/// GET /sla/status - Live projection of open routes.
#[utoipa::path(
    get,
    path = "/sla/status",
    responses((status = 200, description = "SLA status", body = SlaStatus))
)]
async fn sla_status(State(state): State<Arc<AppState>>) -> Json<SlaStatus> {
    Json(state.fleet.sla_status(state.planner.config().sla.risk_margin_minutes))
}

/// GET /sla/compliance - On-time rate over delivered orders.
#[utoipa::path(
    get,
    path = "/sla/compliance",
    responses((status = 200, description = "Compliance report", body = ComplianceReport))
)]
async fn sla_compliance(State(state): State<Arc<AppState>>) -> Json<ComplianceReport> {
    Json(state.fleet.compliance())
}

// ============================================================================
// OpenAPI Documentation
// ============================================================================

#[derive(OpenApi)]
#[openapi(
    paths(
        health,
        info,
        create_plan,
        list_engines,
        get_engine,
        get_engine_stats,
        start_engine,
        stop_engine,
        get_fleet,
        submit_order,
        get_order,
        cancel_order,
        complete_stop,
        report_traffic,
        set_vehicle_status,
        get_audit,
        list_alerts,
        resolve_alert,
        sla_status,
        sla_compliance,
    ),
    components(schemas(
        HealthResponse,
        InfoResponse,
        EngineStatsResponse,
        LifecycleResponse,
        TrafficReport,
        StatusChange,
        ResolveRequest,
        FailureReport,
    ))
)]
struct ApiDoc;
