//! HTTP surface, exercised through the router without a socket.

use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::sync::Arc;
use tower::ServiceExt;

use fleet_dispatch::api::{create_router, AppState};
use fleet_dispatch::clock::ManualClock;
use fleet_dispatch::config::DispatchConfig;
use fleet_dispatch::distance::FixedDistanceProvider;
use fleet_dispatch::domain::{Coordinate, PickupPoint, Vehicle};
use fleet_dispatch::planner::Planner;
use fleet_dispatch::state::FleetState;

fn app() -> (Arc<AppState>, Router) {
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()));
    let fleet = Arc::new(FleetState::new(clock));
    fleet.add_pickup(PickupPoint::new("hub", "Central Hub", Coordinate::new(24.7136, 46.6753)));
    fleet
        .add_vehicle(Vehicle::new("v1", 50, Coordinate::new(24.7136, 46.6753)))
        .unwrap();
    let planner = Arc::new(Planner::new(
        DispatchConfig::default(),
        Arc::new(FixedDistanceProvider::minutes(10)),
    ));
    let state = Arc::new(AppState::new(planner, fleet));
    let router = create_router(Arc::clone(&state));
    (state, router)
}

async fn call(router: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(b) => builder
            .header("content-type", "application/json")
            .body(Body::from(b.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = router.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn health_reports_up() {
    let (_, router) = app();
    let (status, body) = call(&router, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "UP" }));
}

#[tokio::test]
async fn plan_endpoint_returns_compliant_routes() {
    let (_, router) = app();
    let request = json!({
        "pickups": [{ "id": "hub", "name": "Hub", "location": { "latitude": 24.65, "longitude": 46.65 } }],
        "deliveries": [
            { "id": "d1", "location": { "latitude": 24.70, "longitude": 46.70 }, "pickupId": "hub", "weight": 10 }
        ],
        "vehicles": [
            { "id": "v1", "capacity": 100, "location": { "latitude": 24.60, "longitude": 46.60 } }
        ],
        "startAt": "2025-03-01T08:00:00Z"
    });

    let (status, body) = call(&router, Method::POST, "/plans", Some(request)).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["slaCompliance"], "all_compliant");
    assert_eq!(body["routes"].as_array().unwrap().len(), 1);
    assert_eq!(body["unassignedDeliveries"], json!([]));
}

#[tokio::test]
async fn plan_without_vehicles_is_unprocessable() {
    let (_, router) = app();
    let request = json!({
        "deliveries": [{ "id": "d1", "location": { "latitude": 24.70, "longitude": 46.70 } }],
        "vehicles": []
    });

    let (status, body) = call(&router, Method::POST, "/plans", Some(request)).await;

    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["kind"], "no_capacity");
    assert_eq!(body["additionalCapacity"], 1);
}

#[tokio::test]
async fn orders_can_be_submitted_read_and_cancelled() {
    let (_, router) = app();
    let order = json!({
        "id": "o1",
        "location": { "latitude": 24.72, "longitude": 46.68 },
        "pickupId": "hub"
    });

    let (status, body) = call(&router, Method::POST, "/orders", Some(order.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "pending");

    let (status, _) = call(&router, Method::POST, "/orders", Some(order)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(&router, Method::GET, "/orders/o1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["delivery"]["id"], "o1");

    let (status, body) = call(&router, Method::DELETE, "/orders/o1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "cancelled");

    let (status, body) = call(&router, Method::GET, "/orders/missing", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["kind"], "not_found");
}

#[tokio::test]
async fn engine_lifecycle_over_http() {
    let (state, router) = app();

    let (status, body) = call(&router, Method::GET, "/engines", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().unwrap().len(), 4);

    let (_, body) = call(&router, Method::POST, "/engines/escalation/start", None).await;
    assert_eq!(body["result"], "started");
    assert_eq!(body["state"], "running");

    let (_, body) = call(&router, Method::POST, "/engines/escalation/start", None).await;
    assert_eq!(body["result"], "already_running");

    let (_, body) = call(&router, Method::POST, "/engines/escalation/stop", None).await;
    assert_eq!(body["result"], "stopped");
    assert_eq!(body["state"], "stopped");

    let (status, body) = call(&router, Method::GET, "/engines/escalation/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["counters"]["alerts_raised"].is_u64());

    let (status, _) = call(&router, Method::GET, "/engines/unknown", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    state.automation.stop_all().await;
}

#[tokio::test]
async fn sla_and_alert_views_start_empty() {
    let (_, router) = app();

    let (status, body) = call(&router, Method::GET, "/sla/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["activeRoutes"], 0);
    assert_eq!(body["status"], "healthy");

    let (_, body) = call(&router, Method::GET, "/sla/compliance", None).await;
    assert_eq!(body["complianceRate"], 100.0);

    let (_, body) = call(&router, Method::GET, "/alerts?resolved=false", None).await;
    assert_eq!(body, json!([]));

    let (status, _) = call(
        &router,
        Method::POST,
        "/alerts/00000000-0000-0000-0000-000000000000/resolve",
        Some(json!({ "resolvedBy": "ops" })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn driver_events_validate_their_input() {
    let (_, router) = app();

    let (status, _) = call(&router, Method::POST, "/vehicles/v1/traffic", Some(json!({ "factor": 1.5 }))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(&router, Method::POST, "/vehicles/v1/complete-stop", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = call(&router, Method::PUT, "/vehicles/v1/status", Some(json!({ "status": "offline" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "offline");

    let (_, body) = call(&router, Method::GET, "/fleet", None).await;
    assert_eq!(body["vehicles"]["v1"]["status"], "offline");
}
