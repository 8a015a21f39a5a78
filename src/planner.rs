//! Planning pipeline for one batch of deliveries.
//!
//! ```text
//! distance matrix
//!   -> advisor proposal ---- validate ---- Accepted ------------------+
//!   |                            |                                    |
//!   |                        Rejected / timeout                       |
//!   |                            v                                    v
//!   +-> heuristic assign -> sequence -> breach? -> deterministic fallback
//!                                         |                           |
//!                                         +---- compliant ------------+-> commit gate
//! ```
//!
//! Whatever path wins, every route passes [`sla::ensure_committable`] before
//! it is returned.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use crate::advisor::{self, OptimizationAdvisor};
use crate::clustering::{AssignmentInput, AssignmentStrategy, ScoreBreakdown, StrategySelector};
use crate::config::DispatchConfig;
use crate::distance::{CachingDistanceProvider, DistanceMatrix, DistanceProvider, HaversineProvider, PointRef};
use crate::domain::{
    Coordinate, DeliveryId, DeliveryPoint, PickupPoint, Route, RouteStatus, StopKind, Vehicle,
    VehicleId,
};
use crate::error::DispatchError;
use crate::sequencer::{RouteBuilder, Schedule, Sequencer, Waypoint};
use crate::sla::{self, CapacityPlan, OverflowReason, Verdict};

/// Input of [`Planner::plan`].
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanRequest {
    #[serde(default)]
    pub pickups: Vec<PickupPoint>,
    pub deliveries: Vec<DeliveryPoint>,
    pub vehicles: Vec<Vehicle>,
    /// Overrides the configured SLA window.
    #[serde(default)]
    pub sla_minutes: Option<i64>,
    /// Pickup completion time; defaults to now.
    #[serde(default)]
    pub start_at: Option<DateTime<Utc>>,
}

impl PlanRequest {
    pub fn new(pickups: Vec<PickupPoint>, deliveries: Vec<DeliveryPoint>, vehicles: Vec<Vehicle>) -> Self {
        Self {
            pickups,
            deliveries,
            vehicles,
            sla_minutes: None,
            start_at: None,
        }
    }

    pub fn with_sla_minutes(mut self, minutes: i64) -> Self {
        self.sla_minutes = Some(minutes);
        self
    }

    pub fn starting_at(mut self, at: DateTime<Utc>) -> Self {
        self.start_at = Some(at);
        self
    }
}

/// Which path produced the routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum PlanSource {
    Heuristic,
    Advisor,
    Fallback,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SlaCompliance {
    AllCompliant,
    AtRisk,
    Violated,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteSummary {
    pub route_id: String,
    pub vehicle_id: VehicleId,
    pub stops: usize,
    pub distance_km: f64,
    pub duration_minutes: i64,
    pub load: u32,
    pub capacity: u32,
    /// Load as a percentage of capacity.
    pub utilization: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanSummary {
    pub total_distance_km: f64,
    pub vehicles_used: usize,
    pub average_route_km: f64,
    /// Fleet-wide load over capacity of the vehicles used, as a percentage.
    pub capacity_utilization: f64,
    /// Matrix legs answered by the straight-line estimate.
    pub estimated_legs: usize,
    pub strategy: String,
    pub routes: Vec<RouteSummary>,
}

/// One row of the assignment audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub at: DateTime<Utc>,
    pub delivery_id: DeliveryId,
    pub vehicle_id: Option<VehicleId>,
    pub source: PlanSource,
    pub decision: String,
    pub breakdown: Option<ScoreBreakdown>,
}

/// Result of one planning call.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlanOutcome {
    pub routes: Vec<Route>,
    pub unassigned_deliveries: Vec<DeliveryId>,
    pub sla_compliance: SlaCompliance,
    pub max_route_duration_minutes: i64,
    pub source: PlanSource,
    pub capacity_plan: CapacityPlan,
    pub summary: PlanSummary,
    pub audit: Vec<AuditEntry>,
}

impl PlanOutcome {
    /// Delivery ids per vehicle, the part of a plan that must be stable
    /// across identical calls.
    pub fn partition(&self) -> BTreeMap<VehicleId, Vec<DeliveryId>> {
        self.routes
            .iter()
            .map(|r| (r.vehicle_id.clone(), r.delivery_ids()))
            .collect()
    }

    pub fn vehicles_used(&self) -> usize {
        self.routes.iter().filter(|r| !r.stops.is_empty()).count()
    }
}

/// Routes before the commit gate.
struct Draft {
    routes: Vec<Route>,
    overflow: Vec<(DeliveryId, OverflowReason)>,
    source: PlanSource,
    strategy: String,
    breakdowns: Vec<ScoreBreakdown>,
}

/// Orchestrates distance, assignment, sequencing and SLA validation.
#[derive(Clone)]
pub struct Planner {
    config: DispatchConfig,
    distance: Arc<dyn DistanceProvider>,
    advisor: Option<Arc<dyn OptimizationAdvisor>>,
    strategies: StrategySelector,
    sequencer: Sequencer,
}

impl Planner {
    /// Wraps `distance` in a caching, time-bounded provider.
    pub fn new(config: DispatchConfig, distance: Arc<dyn DistanceProvider>) -> Self {
        let caching = CachingDistanceProvider::new(distance, &config.providers);
        Self {
            strategies: StrategySelector::new(&config.sequencer),
            sequencer: Sequencer::new(config.sequencer.max_iterations),
            distance: Arc::new(caching),
            advisor: None,
            config,
        }
    }

    pub fn with_advisor(mut self, advisor: Arc<dyn OptimizationAdvisor>) -> Self {
        self.advisor = Some(advisor);
        self
    }

    pub fn with_external_solver(mut self, solver: Arc<dyn AssignmentStrategy>) -> Self {
        self.strategies = self.strategies.with_external(solver);
        self
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn sequencer(&self) -> Sequencer {
        self.sequencer
    }

    /// Plans a batch through the advisor (if any) or the heuristic.
    pub async fn plan(&self, request: &PlanRequest) -> Result<PlanOutcome, DispatchError> {
        self.run(request, false).await
    }

    /// Plans a batch through the deterministic allocator only.
    pub async fn plan_fallback(&self, request: &PlanRequest) -> Result<PlanOutcome, DispatchError> {
        self.run(request, true).await
    }

    async fn run(&self, request: &PlanRequest, force_fallback: bool) -> Result<PlanOutcome, DispatchError> {
        check_request(request)?;
        let sla_minutes = request.sla_minutes.unwrap_or(self.config.sla.window_minutes);
        let start_at = request.start_at.unwrap_or_else(Utc::now);
        let delivery_ids: Vec<DeliveryId> = request.deliveries.iter().map(|d| d.id.clone()).collect();
        let capacity = CapacityPlan::compute(delivery_ids.len(), sla_minutes, &self.config.sla);

        if request.deliveries.is_empty() {
            return Ok(self.finish(Draft::empty(), request, capacity, start_at, 0, sla_minutes));
        }

        let matrix = self.matrix(request).await?;
        let builder = RouteBuilder::new(
            &request.deliveries,
            &request.pickups,
            &matrix,
            self.sequencer,
            Schedule::new(start_at, sla_minutes),
        );

        let mut draft = None;
        if !force_fallback {
            draft = match &self.advisor {
                Some(advisor) => self.advised(advisor.as_ref(), request, &delivery_ids, &builder, sla_minutes).await,
                None => self.heuristic(request, &matrix, &builder, capacity)?,
            };
        }
        let draft = match draft {
            Some(d) => d,
            None => {
                let fallback = sla::fallback_plan(&request.vehicles, &delivery_ids, &builder, capacity)?;
                Draft {
                    routes: fallback.routes,
                    overflow: fallback.overflow,
                    source: PlanSource::Fallback,
                    strategy: "round_robin".into(),
                    breakdowns: Vec::new(),
                }
            }
        };

        for route in &draft.routes {
            sla::ensure_committable(route)?;
        }
        Ok(self.finish(draft, request, capacity, start_at, matrix.estimated_legs(), sla_minutes))
    }

    async fn matrix(&self, request: &PlanRequest) -> Result<DistanceMatrix, DispatchError> {
        let mut points: Vec<(PointRef, Coordinate)> = Vec::new();
        points.extend(request.vehicles.iter().map(|v| (PointRef::Vehicle(v.id.clone()), v.location)));
        points.extend(request.pickups.iter().map(|p| (PointRef::Pickup(p.id.clone()), p.location)));
        points.extend(request.deliveries.iter().map(|d| (PointRef::Delivery(d.id.clone()), d.location)));

        if request.deliveries.len() > self.config.sequencer.large_batch_threshold {
            info!(points = points.len(), "Large batch, using straight-line matrix");
            let provider = HaversineProvider::from_settings(&self.config.providers);
            return Ok(DistanceMatrix::haversine(&provider, &points));
        }
        DistanceMatrix::build(self.distance.as_ref(), &points).await
    }

    async fn advised(
        &self,
        advisor: &dyn OptimizationAdvisor,
        request: &PlanRequest,
        delivery_ids: &[DeliveryId],
        builder: &RouteBuilder<'_>,
        sla_minutes: i64,
    ) -> Option<Draft> {
        let proposal = advisor::consult(
            advisor,
            self.config.providers.advisor_timeout(),
            &request.pickups,
            &request.deliveries,
            &request.vehicles,
            sla_minutes,
        )
        .await?;

        match sla::validate_proposal(&proposal.by_vehicle, &request.vehicles, delivery_ids, builder) {
            Verdict::Accepted(routes) => {
                info!(advisor = advisor.name(), routes = routes.len(), "Advisor proposal accepted");
                Some(Draft {
                    routes,
                    overflow: Vec::new(),
                    source: PlanSource::Advisor,
                    strategy: advisor.name().to_string(),
                    breakdowns: Vec::new(),
                })
            }
            Verdict::Rejected(reason) => {
                warn!(advisor = advisor.name(), %reason, "Advisor proposal rejected, discarding it entirely");
                None
            }
        }
    }

    /// `Ok(None)` when any heuristic route breaches and the fallback must run.
    fn heuristic(
        &self,
        request: &PlanRequest,
        matrix: &DistanceMatrix,
        builder: &RouteBuilder<'_>,
        capacity: CapacityPlan,
    ) -> Result<Option<Draft>, DispatchError> {
        let strategy = self.strategies.select(request.deliveries.len());
        let assignment = strategy.assign(&AssignmentInput {
            vehicles: &request.vehicles,
            deliveries: &request.deliveries,
            pickups: &request.pickups,
            matrix,
            weights: self.config.weights,
            max_stops_per_vehicle: Some(capacity.max_per_vehicle),
        })?;

        let available = request.vehicles.iter().filter(|v| v.is_available()).count();
        if !assignment.unassigned.is_empty() && available < capacity.min_vehicles {
            warn!(
                strategy = strategy.name(),
                unassigned = assignment.unassigned.len(),
                min_vehicles = capacity.min_vehicles,
                available,
                "Fleet below SLA minimum, using fallback"
            );
            return Ok(None);
        }

        let mut routes = Vec::with_capacity(assignment.by_vehicle.len());
        for (vehicle_id, ids) in &assignment.by_vehicle {
            let Some(vehicle) = request.vehicles.iter().find(|v| &v.id == vehicle_id) else {
                continue;
            };
            let route = builder.build(vehicle, ids)?;
            if !route.is_compliant() {
                let violation = DispatchError::SlaViolation {
                    vehicle_id: vehicle_id.clone(),
                    overrun_minutes: (route.overrun_seconds() + 59) / 60,
                };
                warn!(strategy = strategy.name(), error = %violation, "Heuristic plan breaches SLA, using fallback");
                return Ok(None);
            }
            routes.push(route);
        }

        debug!(strategy = strategy.name(), routes = routes.len(), "Heuristic plan compliant");
        Ok(Some(Draft {
            routes,
            overflow: assignment
                .unassigned
                .into_iter()
                .map(|id| (id, overflow_reason(capacity)))
                .collect(),
            source: PlanSource::Heuristic,
            strategy: strategy.name().to_string(),
            breakdowns: assignment.breakdowns,
        }))
    }

    fn finish(
        &self,
        draft: Draft,
        request: &PlanRequest,
        capacity_plan: CapacityPlan,
        at: DateTime<Utc>,
        estimated_legs: usize,
        sla_minutes: i64,
    ) -> PlanOutcome {
        let risk_margin = self.config.sla.risk_margin_minutes.min(sla_minutes);
        let sla_compliance = if draft.overflow.iter().any(|(_, r)| *r == OverflowReason::Sla) {
            SlaCompliance::Violated
        } else if draft.routes.iter().any(|r| r.slack_minutes() < risk_margin) {
            SlaCompliance::AtRisk
        } else {
            SlaCompliance::AllCompliant
        };

        let summary = summarize(&draft, request, estimated_legs);
        let audit = audit_trail(&draft, at);
        let outcome = PlanOutcome {
            max_route_duration_minutes: draft.routes.iter().map(|r| r.duration_minutes).max().unwrap_or(0),
            unassigned_deliveries: draft.overflow.into_iter().map(|(id, _)| id).collect(),
            routes: draft.routes,
            sla_compliance,
            source: draft.source,
            capacity_plan,
            summary,
            audit,
        };

        info!(
            source = ?outcome.source,
            routes = outcome.routes.len(),
            unassigned = outcome.unassigned_deliveries.len(),
            max_minutes = outcome.max_route_duration_minutes,
            compliance = ?outcome.sla_compliance,
            "Plan complete"
        );
        outcome
    }

    /// Appends the stops of `addition` to an existing planned route.
    ///
    /// The merged route keeps the existing id, start and deadline and is
    /// re-sequenced as a whole. The caller must validate it.
    pub async fn merge_routes(
        &self,
        vehicle: &Vehicle,
        existing: &Route,
        addition: &Route,
    ) -> Result<Route, DispatchError> {
        let mut waypoints: Vec<Waypoint> = existing.remaining_stops().iter().map(Waypoint::from_stop).collect();
        let known: HashSet<(StopKind, String)> =
            waypoints.iter().map(|w| (w.kind, w.ref_id.clone())).collect();
        waypoints.extend(
            addition
                .stops
                .iter()
                .filter(|s| !known.contains(&(s.kind, s.ref_id.clone())))
                .map(Waypoint::from_stop),
        );

        let mut points = vec![(PointRef::Vehicle(vehicle.id.clone()), vehicle.location)];
        points.extend(waypoints.iter().map(|w| (w.point_ref(), w.location)));
        let matrix = DistanceMatrix::build(self.distance.as_ref(), &points).await?;

        let schedule = Schedule {
            start_at: existing.started_at,
            deadline: existing.deadline,
            traffic_factor: existing.traffic_factor,
        };
        let mut merged = self.sequencer.sequence(vehicle, waypoints, &matrix, schedule)?;
        merged.id = existing.id.clone();
        merged.status = RouteStatus::Planned;
        Ok(merged)
    }

    /// Re-sequences the open part of `route` from `from_time`.
    pub async fn resequence(
        &self,
        route: &Route,
        vehicle_location: Coordinate,
        from_time: DateTime<Utc>,
        traffic_factor: f64,
    ) -> Result<Route, DispatchError> {
        let mut points = vec![(PointRef::Vehicle(route.vehicle_id.clone()), vehicle_location)];
        points.extend(
            route
                .remaining_stops()
                .iter()
                .map(|s| (Waypoint::from_stop(s).point_ref(), s.location)),
        );
        let matrix = DistanceMatrix::build(self.distance.as_ref(), &points).await?;
        self.sequencer.resequence_remaining(route, &matrix, from_time, traffic_factor)
    }
}

impl Draft {
    fn empty() -> Self {
        Self {
            routes: Vec::new(),
            overflow: Vec::new(),
            source: PlanSource::Heuristic,
            strategy: "none".into(),
            breakdowns: Vec::new(),
        }
    }
}

/// A window too short for a single stop leaves nothing to do with load.
fn overflow_reason(capacity: CapacityPlan) -> OverflowReason {
    if capacity.max_per_vehicle == 0 {
        OverflowReason::Sla
    } else {
        OverflowReason::Capacity
    }
}

fn check_request(request: &PlanRequest) -> Result<(), DispatchError> {
    if !request.vehicles.iter().any(Vehicle::is_available) {
        return Err(DispatchError::NoCapacity {
            delivery_ids: request.deliveries.iter().map(|d| d.id.clone()).collect(),
            additional_capacity: request
                .deliveries
                .iter()
                .fold(0u32, |acc, d| acc.saturating_add(d.weight)),
        });
    }
    if let Some(minutes) = request.sla_minutes {
        if minutes <= 0 {
            return Err(DispatchError::InvalidRequest("SLA window must be positive".into()));
        }
    }
    let mut seen = HashSet::new();
    for d in &request.deliveries {
        if !seen.insert(d.id.as_str()) {
            return Err(DispatchError::InvalidRequest(format!("duplicate delivery id {}", d.id)));
        }
        if d.service_minutes < 0 {
            return Err(DispatchError::InvalidRequest(format!(
                "delivery {} has negative service minutes",
                d.id
            )));
        }
    }
    let mut seen = HashSet::new();
    for v in &request.vehicles {
        if !seen.insert(v.id.as_str()) {
            return Err(DispatchError::InvalidRequest(format!("duplicate vehicle id {}", v.id)));
        }
    }
    Ok(())
}

fn summarize(draft: &Draft, request: &PlanRequest, estimated_legs: usize) -> PlanSummary {
    let routes: Vec<RouteSummary> = draft
        .routes
        .iter()
        .map(|r| {
            let capacity = request
                .vehicles
                .iter()
                .find(|v| v.id == r.vehicle_id)
                .map_or(0, |v| v.capacity);
            let load = r.load();
            RouteSummary {
                route_id: r.id.clone(),
                vehicle_id: r.vehicle_id.clone(),
                stops: r.stops.len(),
                distance_km: r.distance_meters / 1000.0,
                duration_minutes: r.duration_minutes,
                load,
                capacity,
                utilization: percent(load, capacity),
            }
        })
        .collect();

    let total_distance_km: f64 = routes.iter().map(|r| r.distance_km).sum();
    let vehicles_used = routes.len();
    let (load, capacity) = routes
        .iter()
        .fold((0u32, 0u32), |(l, c), r| (l + r.load, c + r.capacity));

    PlanSummary {
        total_distance_km,
        vehicles_used,
        average_route_km: if vehicles_used == 0 {
            0.0
        } else {
            total_distance_km / vehicles_used as f64
        },
        capacity_utilization: percent(load, capacity),
        estimated_legs,
        strategy: draft.strategy.clone(),
        routes,
    }
}

fn percent(part: u32, whole: u32) -> f64 {
    if whole == 0 {
        0.0
    } else {
        f64::from(part) * 100.0 / f64::from(whole)
    }
}

fn audit_trail(draft: &Draft, at: DateTime<Utc>) -> Vec<AuditEntry> {
    let mut entries = Vec::new();
    for route in &draft.routes {
        for delivery_id in route.delivery_ids() {
            let breakdown = draft
                .breakdowns
                .iter()
                .find(|b| b.delivery_id == delivery_id && b.vehicle_id == route.vehicle_id)
                .cloned();
            entries.push(AuditEntry {
                at,
                vehicle_id: Some(route.vehicle_id.clone()),
                source: draft.source,
                decision: format!("assigned by {}", draft.strategy),
                delivery_id,
                breakdown,
            });
        }
    }
    for (delivery_id, reason) in &draft.overflow {
        entries.push(AuditEntry {
            at,
            delivery_id: delivery_id.clone(),
            vehicle_id: None,
            source: draft.source,
            decision: match reason {
                OverflowReason::Capacity => "unassigned: no vehicle capacity".into(),
                OverflowReason::Sla => "unassigned: no placement within SLA".into(),
            },
            breakdown: None,
        });
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::FixedDistanceProvider;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    fn planner() -> Planner {
        Planner::new(DispatchConfig::default(), Arc::new(FixedDistanceProvider::minutes(10)))
    }

    fn request(vehicles: usize, deliveries: usize) -> PlanRequest {
        let vs = (0..vehicles)
            .map(|i| Vehicle::new(format!("v{i}"), 100, Coordinate::new(24.60, 46.60 + i as f64 * 0.01)))
            .collect();
        let ds = (0..deliveries)
            .map(|i| DeliveryPoint::new(format!("d{i:02}"), Coordinate::new(24.70 + i as f64 * 0.003, 46.70)))
            .collect();
        PlanRequest::new(Vec::new(), ds, vs).starting_at(t0())
    }

    #[tokio::test]
    async fn empty_batch_is_trivially_compliant() {
        let out = planner().plan(&request(2, 0)).await.unwrap();
        assert!(out.routes.is_empty());
        assert_eq!(out.sla_compliance, SlaCompliance::AllCompliant);
    }

    #[tokio::test]
    async fn duplicate_delivery_ids_are_rejected() {
        let mut req = request(1, 2);
        req.deliveries[1].id = req.deliveries[0].id.clone();
        let err = planner().plan(&req).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn heuristic_respects_stop_cap() {
        let out = planner().plan(&request(5, 23)).await.unwrap();
        assert_eq!(out.source, PlanSource::Heuristic);
        assert!(out.routes.iter().all(|r| r.delivery_ids().len() <= 15));
        assert!(out.vehicles_used() >= 2);
        assert!(out.unassigned_deliveries.is_empty());
        assert_eq!(out.summary.vehicles_used, out.vehicles_used());
        assert_eq!(out.audit.len(), 23);
        assert!(out.audit.iter().all(|a| a.breakdown.is_some()));
    }

    #[tokio::test]
    async fn window_shorter_than_one_stop_reports_violation() {
        // 5 minute window minus 5 minutes of service leaves no room for a stop.
        let req = request(3, 2).with_sla_minutes(5);
        let out = planner().plan(&req).await.unwrap();
        assert_eq!(out.capacity_plan.max_per_vehicle, 0);
        assert!(out.routes.is_empty());
        assert_eq!(out.unassigned_deliveries.len(), 2);
        assert_eq!(out.sla_compliance, SlaCompliance::Violated);
        assert!(out.audit.iter().all(|a| a.decision.contains("within SLA")));
    }

    #[tokio::test]
    async fn negative_service_minutes_are_rejected() {
        let mut req = request(1, 2);
        req.deliveries[1].service_minutes = -5;
        let err = planner().plan(&req).await.unwrap_err();
        assert!(matches!(err, DispatchError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn oversized_weights_are_reported_without_overflow() {
        let mut req = request(2, 3);
        req.deliveries[0].weight = u32::MAX;
        let out = planner().plan(&req).await.unwrap();
        assert_eq!(out.unassigned_deliveries, vec!["d00".to_string()]);
        assert!(out.routes.iter().all(|r| r.load() <= 100));

        let mut req = request(0, 2);
        for d in &mut req.deliveries {
            d.weight = u32::MAX;
        }
        let err = planner().plan(&req).await.unwrap_err();
        assert!(matches!(err, DispatchError::NoCapacity { additional_capacity: u32::MAX, .. }));
    }

    #[tokio::test]
    async fn tight_window_needs_the_planned_vehicle_count() {
        // 60 min window, 10 min legs: room for 3 stops, 20 deliveries, 2 vehicles.
        let req = request(2, 20).with_sla_minutes(60);
        let err = planner().plan(&req).await.unwrap_err();
        assert!(matches!(err, DispatchError::SlaUnachievable { .. }));

        // Enough vehicles for the capacity plan; routes stay within the window.
        let req = request(8, 20).with_sla_minutes(60);
        let out = planner().plan(&req).await.unwrap();
        assert!(out.routes.iter().all(Route::is_compliant));
        let placed: usize = out.routes.iter().map(|r| r.delivery_ids().len()).sum();
        assert_eq!(placed + out.unassigned_deliveries.len(), 20);
    }

    #[tokio::test]
    async fn merge_keeps_route_identity() {
        let p = planner();
        let req = request(1, 4);
        let first = p.plan(&PlanRequest::new(Vec::new(), req.deliveries[..2].to_vec(), req.vehicles.clone()).starting_at(t0())).await.unwrap();
        let second = p.plan(&PlanRequest::new(Vec::new(), req.deliveries[2..].to_vec(), req.vehicles.clone()).starting_at(t0())).await.unwrap();

        let merged = p
            .merge_routes(&req.vehicles[0], &first.routes[0], &second.routes[0])
            .await
            .unwrap();
        assert_eq!(merged.id, first.routes[0].id);
        assert_eq!(merged.delivery_ids().len(), 4);
        assert_eq!(merged.deadline, first.routes[0].deadline);
    }
}
