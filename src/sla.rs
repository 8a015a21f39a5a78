//! SLA allocator and validator.
//!
//! This module is the only gate between a proposed route and the fleet
//! state. It offers:
//!
//! - [`CapacityPlan`]: how many vehicles the SLA window demands
//! - [`fallback_plan`]: deterministic round-robin allocation with repair
//! - [`validate_proposal`]: all-or-nothing verdict on an external proposal
//! - [`ensure_committable`]: the final deadline check before a commit
//! - compliance reporting over delivered orders and live routes

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::config::SlaSettings;
use crate::domain::{DeliveryId, Route, StopKind, Vehicle, VehicleId};
use crate::error::DispatchError;
use crate::sequencer::RouteBuilder;

/// More at-risk routes than this turn the overall status to warning.
const WARNING_AT_RISK_COUNT: usize = 5;

/// Vehicle demand implied by the SLA window.
///
/// # Examples
///
/// ```
/// use fleet_dispatch::config::SlaSettings;
/// use fleet_dispatch::sla::CapacityPlan;
///
/// let plan = CapacityPlan::compute(23, 240, &SlaSettings::default());
/// assert_eq!(plan.max_per_vehicle, 15);
/// assert_eq!(plan.min_vehicles, 2);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CapacityPlan {
    /// `floor((S - t_s) / (t_s + t_a))`
    pub max_per_vehicle: usize,
    /// `ceil(D / max_per_vehicle)`
    pub min_vehicles: usize,
}

impl CapacityPlan {
    pub fn compute(deliveries: usize, window_minutes: i64, sla: &SlaSettings) -> Self {
        let per_stop = (sla.service_minutes_per_stop + sla.avg_travel_minutes_per_stop).max(1);
        let usable = (window_minutes - sla.service_minutes_per_stop).max(0);
        let max_per_vehicle = (usable / per_stop) as usize;
        let min_vehicles = if deliveries == 0 {
            0
        } else if max_per_vehicle == 0 {
            // Not even one stop fits the window.
            deliveries
        } else {
            deliveries.div_ceil(max_per_vehicle)
        };
        Self {
            max_per_vehicle,
            min_vehicles,
        }
    }
}

/// Why a delivery left the planned set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OverflowReason {
    /// No vehicle had room for its weight.
    Capacity,
    /// Every placement would breach the deadline.
    Sla,
}

/// Output of the deterministic allocator.
#[derive(Debug, Clone, Default)]
pub struct FallbackPlan {
    pub routes: Vec<Route>,
    pub overflow: Vec<(DeliveryId, OverflowReason)>,
}

/// Deterministic allocation: round-robin, sequence, repair.
///
/// Deliveries are dealt in descending priority across every vehicle with
/// capacity (at least `min_vehicles` of them). Each route is then sequenced;
/// a breaching route sheds its lowest-priority delivery to an unused
/// vehicle, else to any vehicle that stays compliant, else to overflow.
pub fn fallback_plan(
    vehicles: &[Vehicle],
    delivery_ids: &[DeliveryId],
    builder: &RouteBuilder<'_>,
    plan: CapacityPlan,
) -> Result<FallbackPlan, DispatchError> {
    let mut fleet: Vec<&Vehicle> = vehicles.iter().filter(|v| v.is_available()).collect();
    fleet.sort_by(|a, b| a.id.cmp(&b.id));

    if fleet.len() < plan.min_vehicles {
        return Err(DispatchError::SlaUnachievable {
            required_vehicles: plan.min_vehicles,
            available_vehicles: fleet.len(),
        });
    }

    let mut ordered: Vec<&str> = delivery_ids.iter().map(String::as_str).collect();
    ordered.sort_by(|a, b| {
        let (pa, pb) = (priority(builder, a), priority(builder, b));
        pb.cmp(&pa).then_with(|| a.cmp(b))
    });

    let mut buckets: BTreeMap<VehicleId, Vec<DeliveryId>> = BTreeMap::new();
    let mut loads: Vec<u32> = fleet.iter().map(|v| v.load).collect();
    let mut overflow = Vec::new();
    let mut cursor = 0usize;

    for id in ordered {
        let weight = builder.delivery(id).map_or(0, |d| d.weight);
        let slot = (0..fleet.len())
            .map(|k| (cursor + k) % fleet.len().max(1))
            .find(|&k| loads[k].checked_add(weight).is_some_and(|l| l <= fleet[k].capacity));
        match slot {
            Some(k) => {
                loads[k] = loads[k].saturating_add(weight);
                buckets.entry(fleet[k].id.clone()).or_default().push(id.to_string());
                cursor = k + 1;
            }
            None => overflow.push((id.to_string(), OverflowReason::Capacity)),
        }
    }

    let mut routes: BTreeMap<VehicleId, Route> = BTreeMap::new();
    for vehicle in &fleet {
        if let Some(ids) = buckets.get(&vehicle.id) {
            routes.insert(vehicle.id.clone(), builder.build(vehicle, ids)?);
        }
    }

    repair(&fleet, &mut buckets, &mut routes, &mut loads, &mut overflow, builder)?;

    info!(
        routes = routes.len(),
        overflow = overflow.len(),
        min_vehicles = plan.min_vehicles,
        max_per_vehicle = plan.max_per_vehicle,
        "Deterministic fallback allocation complete"
    );
    Ok(FallbackPlan {
        routes: routes.into_values().filter(|r| !r.stops.is_empty()).collect(),
        overflow,
    })
}

fn priority(builder: &RouteBuilder<'_>, id: &str) -> u32 {
    builder.delivery(id).map_or(0, |d| d.priority)
}

fn repair(
    fleet: &[&Vehicle],
    buckets: &mut BTreeMap<VehicleId, Vec<DeliveryId>>,
    routes: &mut BTreeMap<VehicleId, Route>,
    loads: &mut [u32],
    overflow: &mut Vec<(DeliveryId, OverflowReason)>,
    builder: &RouteBuilder<'_>,
) -> Result<(), DispatchError> {
    loop {
        let Some(vehicle_id) = routes
            .iter()
            .find(|(_, r)| !r.is_compliant())
            .map(|(v, _)| v.clone())
        else {
            return Ok(());
        };

        let Some(victim) = lowest_priority(&routes[&vehicle_id]) else {
            routes.remove(&vehicle_id);
            continue;
        };
        let weight = builder.delivery(&victim).map_or(0, |d| d.weight);
        warn!(vehicle_id = %vehicle_id, delivery_id = %victim, "Route breaches SLA, shedding delivery");

        if let Some(ids) = buckets.get_mut(&vehicle_id) {
            ids.retain(|d| d != &victim);
        }
        if let Some(k) = fleet.iter().position(|v| v.id == vehicle_id) {
            loads[k] = loads[k].saturating_sub(weight);
        }
        let remaining = buckets.get(&vehicle_id).cloned().unwrap_or_default();
        if remaining.is_empty() {
            routes.remove(&vehicle_id);
        } else if let Some(vehicle) = fleet.iter().find(|v| v.id == vehicle_id) {
            routes.insert(vehicle_id.clone(), builder.build(vehicle, &remaining)?);
        }

        // Unused vehicles first, then any vehicle that stays compliant.
        let mut candidates: Vec<usize> = (0..fleet.len())
            .filter(|&k| fleet[k].id != vehicle_id && !routes.contains_key(&fleet[k].id))
            .collect();
        candidates.extend(
            (0..fleet.len()).filter(|&k| fleet[k].id != vehicle_id && routes.contains_key(&fleet[k].id)),
        );

        let mut placed = false;
        for k in candidates {
            let vehicle = fleet[k];
            if loads[k].checked_add(weight).map_or(true, |l| l > vehicle.capacity) {
                continue;
            }
            let mut ids = buckets.get(&vehicle.id).cloned().unwrap_or_default();
            ids.push(victim.clone());
            let route = builder.build(vehicle, &ids)?;
            if route.is_compliant() {
                info!(from = %vehicle_id, to = %vehicle.id, delivery_id = %victim, "Moved delivery to keep SLA");
                loads[k] = loads[k].saturating_add(weight);
                buckets.insert(vehicle.id.clone(), ids);
                routes.insert(vehicle.id.clone(), route);
                placed = true;
                break;
            }
        }
        if !placed {
            warn!(delivery_id = %victim, "No compliant placement, moving delivery to overflow");
            overflow.push((victim, OverflowReason::Sla));
        }
    }
}

/// Lowest-priority open delivery; among equals the one arriving last.
pub fn lowest_priority(route: &Route) -> Option<DeliveryId> {
    route
        .stops
        .iter()
        .filter(|s| s.kind == StopKind::Delivery && !s.is_completed())
        .min_by(|a, b| a.priority.cmp(&b.priority).then_with(|| b.arrival.cmp(&a.arrival)))
        .map(|s| s.ref_id.clone())
}

/// Outcome of validating an external proposal.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Accepted(Vec<Route>),
    Rejected(String),
}

/// Checks a proposed partition and re-sequences every route.
///
/// Any structural defect or any breaching route rejects the whole proposal;
/// the validator never patches it.
pub fn validate_proposal(
    proposal: &BTreeMap<VehicleId, Vec<DeliveryId>>,
    vehicles: &[Vehicle],
    delivery_ids: &[DeliveryId],
    builder: &RouteBuilder<'_>,
) -> Verdict {
    let expected: HashSet<&str> = delivery_ids.iter().map(String::as_str).collect();
    let mut seen: HashSet<&str> = HashSet::new();

    for (vehicle_id, ids) in proposal {
        let Some(vehicle) = vehicles.iter().find(|v| &v.id == vehicle_id) else {
            return Verdict::Rejected(format!("unknown vehicle {vehicle_id}"));
        };
        if !vehicle.is_available() && !ids.is_empty() {
            return Verdict::Rejected(format!("vehicle {vehicle_id} is not available"));
        }
        let mut load = vehicle.load;
        for id in ids {
            if !expected.contains(id.as_str()) {
                return Verdict::Rejected(format!("unknown delivery {id}"));
            }
            if !seen.insert(id.as_str()) {
                return Verdict::Rejected(format!("delivery {id} assigned twice"));
            }
            load = match load.checked_add(builder.delivery(id).map_or(0, |d| d.weight)) {
                Some(l) => l,
                None => return Verdict::Rejected(format!("vehicle {vehicle_id} load overflows")),
            };
        }
        if load > vehicle.capacity {
            return Verdict::Rejected(format!(
                "vehicle {vehicle_id} over capacity ({load} > {})",
                vehicle.capacity
            ));
        }
    }
    if seen.len() != expected.len() {
        return Verdict::Rejected(format!(
            "{} deliveries missing from proposal",
            expected.len() - seen.len()
        ));
    }

    let mut routes = Vec::with_capacity(proposal.len());
    for (vehicle_id, ids) in proposal {
        if ids.is_empty() {
            continue;
        }
        let Some(vehicle) = vehicles.iter().find(|v| &v.id == vehicle_id) else {
            continue;
        };
        let route = match builder.build(vehicle, ids) {
            Ok(route) => route,
            Err(e) => return Verdict::Rejected(e.to_string()),
        };
        if !route.is_compliant() {
            let overrun = DispatchError::SlaViolation {
                vehicle_id: vehicle_id.clone(),
                overrun_minutes: (route.overrun_seconds() + 59) / 60,
            };
            return Verdict::Rejected(overrun.to_string());
        }
        routes.push(route);
    }
    Verdict::Accepted(routes)
}

/// Final deadline check before a route reaches the fleet state.
///
/// A failure here is a logic defect: it is logged with the full route.
pub fn ensure_committable(route: &Route) -> Result<(), DispatchError> {
    if route.is_open() && !route.is_compliant() {
        error!(
            route_id = %route.id,
            vehicle_id = %route.vehicle_id,
            overrun_seconds = route.overrun_seconds(),
            route = %route.dump(),
            "Refusing to commit route past its SLA deadline"
        );
        return Err(DispatchError::InvariantViolation {
            route_id: route.id.clone(),
            detail: format!(
                "last arrival {}s after deadline {}",
                route.overrun_seconds(),
                route.deadline
            ),
        });
    }
    Ok(())
}

/// Time left on a live route.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RouteProjection {
    pub route_id: String,
    pub vehicle_id: VehicleId,
    pub projected_completion: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    /// Negative once the projection passes the deadline.
    pub minutes_to_breach: i64,
    pub remaining_stops: usize,
}

/// Projects completion as `now` plus the planned time still ahead.
///
/// # Examples
///
/// ```
/// use chrono::{Duration, TimeZone, Utc};
/// use fleet_dispatch::domain::{Coordinate, Route, Stop, StopKind};
/// use fleet_dispatch::sla::project;
///
/// let start = Utc.with_ymd_and_hms(2025, 1, 5, 8, 0, 0).unwrap();
/// let mut route = Route::new("v1", start, start + Duration::minutes(240));
/// route.stops.push(Stop {
///     kind: StopKind::Delivery,
///     ref_id: "d1".into(),
///     location: Coordinate::new(0.0, 0.0),
///     arrival: start + Duration::minutes(20),
///     service_minutes: 5,
///     priority: 0,
///     weight: 1,
///     completed_at: None,
/// });
///
/// let p = project(&route, start + Duration::minutes(230));
/// assert_eq!(p.minutes_to_breach, -10);
/// ```
pub fn project(route: &Route, now: DateTime<Utc>) -> RouteProjection {
    let projected = now + Duration::minutes(route.remaining_minutes());
    RouteProjection {
        route_id: route.id.clone(),
        vehicle_id: route.vehicle_id.clone(),
        projected_completion: projected,
        deadline: route.deadline,
        minutes_to_breach: (route.deadline - projected).num_minutes(),
        remaining_stops: route.remaining_stops().len(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OverallStatus {
    Healthy,
    Warning,
    Critical,
}

/// Live SLA view over open routes.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SlaStatus {
    pub active_routes: usize,
    pub at_risk: usize,
    pub breached: usize,
    pub min_remaining_minutes: Option<i64>,
    pub status: OverallStatus,
    pub routes: Vec<RouteProjection>,
}

pub fn sla_status<'a>(
    routes: impl IntoIterator<Item = &'a Route>,
    now: DateTime<Utc>,
    risk_margin_minutes: i64,
) -> SlaStatus {
    let projections: Vec<RouteProjection> = routes
        .into_iter()
        .filter(|r| r.is_open() && !r.remaining_stops().is_empty())
        .map(|r| project(r, now))
        .collect();

    let breached = projections.iter().filter(|p| p.minutes_to_breach < 0).count();
    let at_risk = projections
        .iter()
        .filter(|p| (0..risk_margin_minutes).contains(&p.minutes_to_breach))
        .count();

    let status = if breached > 0 {
        OverallStatus::Critical
    } else if at_risk > WARNING_AT_RISK_COUNT {
        OverallStatus::Warning
    } else {
        OverallStatus::Healthy
    };

    SlaStatus {
        active_routes: projections.len(),
        at_risk,
        breached,
        min_remaining_minutes: projections.iter().map(|p| p.minutes_to_breach).min(),
        status,
        routes: projections,
    }
}

/// A completed delivery, kept for compliance reporting.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryRecord {
    pub delivery_id: DeliveryId,
    pub route_id: String,
    pub delivered_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
}

impl DeliveryRecord {
    pub fn on_time(&self) -> bool {
        self.delivered_at <= self.deadline
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceLevel {
    Excellent,
    Good,
    Warning,
    Critical,
}

impl ComplianceLevel {
    /// ```
    /// use fleet_dispatch::sla::ComplianceLevel;
    ///
    /// assert_eq!(ComplianceLevel::classify(96.0), ComplianceLevel::Excellent);
    /// assert_eq!(ComplianceLevel::classify(90.0), ComplianceLevel::Good);
    /// assert_eq!(ComplianceLevel::classify(85.5), ComplianceLevel::Warning);
    /// assert_eq!(ComplianceLevel::classify(10.0), ComplianceLevel::Critical);
    /// ```
    pub fn classify(rate_percent: f64) -> Self {
        match rate_percent {
            r if r >= 95.0 => ComplianceLevel::Excellent,
            r if r >= 90.0 => ComplianceLevel::Good,
            r if r >= 85.0 => ComplianceLevel::Warning,
            _ => ComplianceLevel::Critical,
        }
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    pub total_deliveries: usize,
    pub on_time: usize,
    pub late: usize,
    /// Percentage on time; 100 when nothing has been delivered yet.
    pub compliance_rate: f64,
    pub level: ComplianceLevel,
}

pub fn compliance<'a>(records: impl IntoIterator<Item = &'a DeliveryRecord>) -> ComplianceReport {
    let (mut total, mut on_time) = (0usize, 0usize);
    for r in records {
        total += 1;
        if r.on_time() {
            on_time += 1;
        }
    }
    let rate = if total == 0 {
        100.0
    } else {
        on_time as f64 * 100.0 / total as f64
    };
    ComplianceReport {
        total_deliveries: total,
        on_time,
        late: total - on_time,
        compliance_rate: rate,
        level: ComplianceLevel::classify(rate),
    }
}
