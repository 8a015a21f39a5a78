//! Automation engines driven cycle by cycle against a manual clock.

use async_trait::async_trait;
use chrono::{DateTime, Duration as Span, TimeZone, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

use fleet_dispatch::alerts::{AlertKind, Severity};
use fleet_dispatch::clock::ManualClock;
use fleet_dispatch::config::DispatchConfig;
use fleet_dispatch::distance::{DistanceEstimate, DistanceProvider, FixedDistanceProvider};
use fleet_dispatch::domain::{
    Coordinate, DeliveryPoint, OrderStatus, PickupPoint, Route, RouteStatus, Stop, StopKind, Vehicle,
    VehicleStatus,
};
use fleet_dispatch::error::DispatchError;
use fleet_dispatch::engine::{Automation, EngineState, StartOutcome, StopOutcome};
use fleet_dispatch::planner::Planner;
use fleet_dispatch::sla::{ComplianceLevel, OverallStatus};
use fleet_dispatch::state::FleetState;

fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
}

const HUB: Coordinate = Coordinate {
    latitude: 24.7136,
    longitude: 46.6753,
};

fn setup() -> (Arc<ManualClock>, Arc<FleetState>, Automation) {
    setup_with(Arc::new(FixedDistanceProvider::minutes(10)))
}

fn setup_with(distance: Arc<dyn DistanceProvider>) -> (Arc<ManualClock>, Arc<FleetState>, Automation) {
    let clock = Arc::new(ManualClock::new(t0()));
    let state = Arc::new(FleetState::new(clock.clone()));
    let planner = Arc::new(Planner::new(DispatchConfig::default(), distance));
    let automation = Automation::new(Arc::clone(&state), planner);
    (clock, state, automation)
}

/// Fixed 10 minute legs; the first lookup parks until `resume` is notified.
#[derive(Default)]
struct GatedDistance {
    passed: AtomicBool,
    started: Notify,
    resume: Notify,
}

#[async_trait]
impl DistanceProvider for GatedDistance {
    async fn distance_duration(&self, from: Coordinate, to: Coordinate) -> Result<DistanceEstimate, DispatchError> {
        if !self.passed.swap(true, Ordering::SeqCst) {
            self.started.notify_one();
            self.resume.notified().await;
        }
        FixedDistanceProvider::minutes(10).distance_duration(from, to).await
    }
}

fn stop(id: &str, minute: i64, completed: Option<i64>) -> Stop {
    Stop {
        kind: StopKind::Delivery,
        ref_id: id.into(),
        location: Coordinate::new(24.72, 46.68),
        arrival: t0() + Span::minutes(minute),
        service_minutes: 5,
        priority: 0,
        weight: 1,
        completed_at: completed.map(|m| t0() + Span::minutes(m)),
    }
}

#[tokio::test]
async fn late_route_raises_one_critical_alert() {
    let (clock, state, automation) = setup();
    state.add_vehicle(Vehicle::new("v1", 10, HUB)).unwrap();

    // Last completed stop departs at +205; the two open stops are planned
    // 10 and 20 minutes after that, inside the 240 minute deadline.
    let mut route = Route::new("v1", t0(), t0() + Span::minutes(240));
    route.stops = vec![stop("a", 200, Some(203)), stop("b", 215, None), stop("c", 225, None)];
    let route_id = route.id.clone();
    let mut lease = state.try_lease("v1").unwrap();
    state.commit_route(&mut lease, route).unwrap();
    drop(lease);

    // The driver is running late: 230 minutes elapsed, 20 planned minutes left.
    clock.set(t0() + Span::minutes(230));
    let escalation = automation.get("escalation").unwrap();
    escalation.run_once().await.unwrap();
    escalation.run_once().await.unwrap();

    let alerts = state.list_alerts(Some(false));
    assert_eq!(alerts.len(), 1);
    let alert = &alerts[0];
    assert_eq!(alert.kind, AlertKind::SlaRisk);
    assert_eq!(alert.severity, Severity::Critical);
    assert_eq!(alert.minutes_to_breach, Some(-10));
    assert_eq!(alert.route_id.as_deref(), Some(route_id.as_str()));
    assert_eq!(alert.order_id.as_deref(), Some("b"));
    assert_eq!(escalation.stats()["alerts_raised"], 1);
    assert_eq!(escalation.stats()["cycles_run"], 2);

    let status = state.sla_status(15);
    assert_eq!(status.breached, 1);
    assert_eq!(status.status, OverallStatus::Critical);

    // Once resolved, a still-late route is alerted again.
    state.resolve_alert(alert.id, "ops").unwrap();
    escalation.run_once().await.unwrap();
    assert_eq!(state.list_alerts(Some(false)).len(), 1);
    assert_eq!(state.list_alerts(Some(true)).len(), 1);
}

#[tokio::test]
async fn orders_flow_from_batch_to_delivery() {
    let (clock, state, automation) = setup();
    state.add_pickup(PickupPoint::new("hub", "Central Hub", HUB));
    state.add_vehicle(Vehicle::new("v1", 100, HUB)).unwrap();
    for i in 0..3 {
        state
            .submit_order(
                DeliveryPoint::new(format!("o{i}"), Coordinate::new(24.715 + i as f64 * 0.002, 46.676))
                    .with_pickup("hub"),
            )
            .unwrap();
    }

    let batching = automation.get("batching").unwrap();
    let dispatch = automation.get("dispatch").unwrap();

    batching.run_once().await.unwrap();
    assert_eq!(state.orders_with_status(OrderStatus::Pending).len(), 3);

    clock.advance(Span::seconds(121));
    batching.run_once().await.unwrap();
    assert_eq!(state.orders_with_status(OrderStatus::Queued).len(), 3);

    dispatch.run_once().await.unwrap();
    let assigned = state.orders_with_status(OrderStatus::Assigned);
    assert_eq!(assigned.len(), 3);
    assert!(assigned.iter().all(|o| o.vehicle_id.as_deref() == Some("v1")));
    assert_eq!(dispatch.stats()["assignments_made"], 3);

    let snapshot = state.snapshot();
    let route = &snapshot.routes["v1"];
    assert!(route.is_compliant());
    assert_eq!(route.stops[0].kind, StopKind::Pickup);
    assert_eq!(snapshot.vehicles["v1"].load, 3);
    assert_eq!(state.audit_log().len(), 3);

    let stops = route.stops.len();
    for _ in 0..stops {
        clock.advance(Span::minutes(5));
        state.complete_next_stop("v1").await.unwrap();
    }

    let snapshot = state.snapshot();
    assert!(!snapshot.routes.contains_key("v1"));
    assert_eq!(snapshot.vehicles["v1"].status, VehicleStatus::Idle);
    assert_eq!(state.orders_with_status(OrderStatus::Delivered).len(), 3);

    let report = state.compliance();
    assert_eq!(report.total_deliveries, 3);
    assert_eq!(report.on_time, 3);
    assert_eq!(report.level, ComplianceLevel::Excellent);
}

#[tokio::test]
async fn cancelled_assigned_order_leaves_the_route() {
    let (clock, state, automation) = setup();
    state.add_vehicle(Vehicle::new("v1", 100, HUB)).unwrap();
    for i in 0..2 {
        state
            .submit_order(DeliveryPoint::new(format!("o{i}"), Coordinate::new(24.72 + i as f64 * 0.002, 46.68)))
            .unwrap();
    }
    clock.advance(Span::seconds(121));
    automation.get("batching").unwrap().run_once().await.unwrap();
    automation.get("dispatch").unwrap().run_once().await.unwrap();
    assert_eq!(state.snapshot().routes["v1"].delivery_ids().len(), 2);

    state.cancel_order("o0").unwrap();
    let reoptimizer = automation.get("route-reoptimizer").unwrap();
    reoptimizer.run_once().await.unwrap();

    let snapshot = state.snapshot();
    assert_eq!(snapshot.routes["v1"].delivery_ids(), vec!["o1".to_string()]);
    assert_eq!(snapshot.vehicles["v1"].load, 1);
    assert_eq!(state.order("o0").unwrap().status, OrderStatus::Cancelled);
    assert_eq!(reoptimizer.stats()["reoptimizations"], 1);
}

#[tokio::test]
async fn order_cancelled_while_planning_is_removed_from_the_route() {
    let gate = Arc::new(GatedDistance::default());
    let (_, state, automation) = setup_with(gate.clone());
    state.add_vehicle(Vehicle::new("v1", 100, HUB)).unwrap();
    for id in ["a", "b"] {
        state
            .submit_order(DeliveryPoint::new(id, Coordinate::new(24.72, 46.68)))
            .unwrap();
    }
    state.mark_queued(&["a".to_string(), "b".to_string()]);

    let dispatch = automation.get("dispatch").unwrap();
    let (planned, ()) = tokio::join!(dispatch.run_once(), async {
        gate.started.notified().await;
        state.cancel_order("a").unwrap();
        gate.resume.notify_one();
    });
    planned.unwrap();
    assert_eq!(dispatch.stats()["assignments_made"], 1);

    automation.get("route-reoptimizer").unwrap().run_once().await.unwrap();

    let snapshot = state.snapshot();
    assert_eq!(snapshot.routes["v1"].delivery_ids(), vec!["b".to_string()]);
    assert_eq!(snapshot.vehicles["v1"].load, 1);
    assert_eq!(state.order("a").unwrap().status, OrderStatus::Cancelled);

    let stops = snapshot.routes["v1"].stops.len();
    for _ in 0..stops {
        state.complete_next_stop("v1").await.unwrap();
    }
    assert_eq!(state.order("a").unwrap().status, OrderStatus::Cancelled);
    assert_eq!(state.order("b").unwrap().status, OrderStatus::Delivered);
}

#[tokio::test]
async fn repeated_cluster_insertions_respect_vehicle_capacity() {
    let (clock, state, automation) = setup();
    state.add_vehicle(Vehicle::new("v1", 4, HUB)).unwrap();

    // Active route with two units still on board.
    let mut route = Route::new("v1", t0(), t0() + Span::minutes(240));
    route.stops = vec![stop("a", 5, Some(6)), stop("b", 15, None), stop("c", 25, None)];
    route.status = RouteStatus::Active;
    let mut lease = state.try_lease("v1").unwrap();
    state.commit_route(&mut lease, route).unwrap();
    drop(lease);
    assert_eq!(state.snapshot().vehicles["v1"].load, 2);

    let dispatch = automation.get("dispatch").unwrap();
    for id in ["x", "y"] {
        clock.advance(Span::minutes(1));
        state
            .submit_order(DeliveryPoint::new(id, Coordinate::new(24.72, 46.68)).with_weight(2))
            .unwrap();
        state.mark_queued(&[id.to_string()]);
        dispatch.run_once().await.unwrap();
    }
    assert_eq!(dispatch.stats()["cluster_insertions"], 2);

    let reoptimizer = automation.get("route-reoptimizer").unwrap();
    reoptimizer.run_once().await.unwrap();

    let snapshot = state.snapshot();
    let route = &snapshot.routes["v1"];
    assert!(route.load() <= 4);
    assert!(snapshot.vehicles["v1"].load <= 4);
    assert!(route.delivery_ids().contains(&"x".to_string()));
    assert!(!route.delivery_ids().contains(&"y".to_string()));
    assert_eq!(state.order("y").unwrap().status, OrderStatus::Queued);
    assert_eq!(reoptimizer.stats()["insertions_rejected"], 1);
}

#[tokio::test(start_paused = true)]
async fn engines_start_and_stop_idempotently() {
    let (_, _, automation) = setup();
    assert_eq!(
        automation.names(),
        vec!["dispatch", "route-reoptimizer", "batching", "escalation"]
    );

    automation.start_all();
    assert!(automation.statuses().iter().all(|s| s.state == EngineState::Running));

    let dispatch = automation.get("dispatch").unwrap();
    assert_eq!(dispatch.start(), StartOutcome::AlreadyRunning);

    automation.stop_all().await;
    assert!(automation.statuses().iter().all(|s| s.state == EngineState::Stopped));
    assert_eq!(dispatch.stop().await, StopOutcome::AlreadyStopped);

    assert_eq!(dispatch.start(), StartOutcome::Started);
    assert_eq!(dispatch.stop().await, StopOutcome::Stopped);
    assert!(automation.get("nope").is_err());
}
