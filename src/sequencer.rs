//! Stop ordering for a single vehicle.
//!
//! Construction is nearest-neighbour from the vehicle's position, pickups
//! first; the delivery segment is then improved with 2-opt segment
//! reversals until no reversal strictly shortens the path or the move cap
//! is hit. Routes are open: there is no return leg.
//!
//! Arrival times are produced by walking the final order from a fixed start,
//! adding travel (scaled by the route's traffic factor) and service time.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;

use crate::distance::{DistanceMatrix, PointRef};
use crate::domain::{
    Coordinate, DeliveryPoint, PickupPoint, Route, RouteStatus, Stop, StopKind, Vehicle,
};
use crate::error::DispatchError;

/// Improvement threshold below which a reversal is not a gain.
const MIN_GAIN_M: f64 = 1e-6;

/// A stop before it has a position in a route.
#[derive(Debug, Clone, PartialEq)]
pub struct Waypoint {
    pub kind: StopKind,
    pub ref_id: String,
    pub location: Coordinate,
    pub service_minutes: i64,
    pub priority: u32,
    pub weight: u32,
}

impl Waypoint {
    /// Pickup dwell is folded into the route start time.
    pub fn pickup(p: &PickupPoint) -> Self {
        Self {
            kind: StopKind::Pickup,
            ref_id: p.id.clone(),
            location: p.location,
            service_minutes: 0,
            priority: 0,
            weight: 0,
        }
    }

    pub fn delivery(d: &DeliveryPoint) -> Self {
        Self {
            kind: StopKind::Delivery,
            ref_id: d.id.clone(),
            location: d.location,
            service_minutes: d.service_minutes,
            priority: d.priority,
            weight: d.weight,
        }
    }

    pub fn from_stop(s: &Stop) -> Self {
        Self {
            kind: s.kind,
            ref_id: s.ref_id.clone(),
            location: s.location,
            service_minutes: s.service_minutes,
            priority: s.priority,
            weight: s.weight,
        }
    }

    pub fn point_ref(&self) -> PointRef {
        match self.kind {
            StopKind::Pickup => PointRef::Pickup(self.ref_id.clone()),
            StopKind::Delivery => PointRef::Delivery(self.ref_id.clone()),
        }
    }
}

/// Timing inputs for one route.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    pub start_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub traffic_factor: f64,
}

impl Schedule {
    pub fn new(start_at: DateTime<Utc>, sla_minutes: i64) -> Self {
        Self {
            start_at,
            deadline: start_at + Duration::minutes(sla_minutes),
            traffic_factor: 1.0,
        }
    }

    pub fn with_traffic(mut self, factor: f64) -> Self {
        self.traffic_factor = factor;
        self
    }
}

/// Nearest-neighbour plus 2-opt sequencer.
#[derive(Debug, Clone, Copy)]
pub struct Sequencer {
    max_iterations: usize,
}

impl Sequencer {
    pub fn new(max_iterations: usize) -> Self {
        Self { max_iterations }
    }

    /// Orders `waypoints` starting from matrix point `origin`.
    ///
    /// Pickups are visited before deliveries. Equal distances keep input
    /// order, so identical inputs give identical sequences.
    pub fn order(
        &self,
        origin: &PointRef,
        waypoints: Vec<Waypoint>,
        matrix: &DistanceMatrix,
    ) -> Result<Vec<Waypoint>, DispatchError> {
        let start = matrix.require(origin)?;
        let (pickups, deliveries): (Vec<Waypoint>, Vec<Waypoint>) =
            waypoints.into_iter().partition(|w| w.kind == StopKind::Pickup);

        let pickup_idx = indices(&pickups, matrix)?;
        let delivery_idx = indices(&deliveries, matrix)?;

        let mut pickup_seq = nearest_neighbour(start, &pickup_idx, matrix);
        let mut budget = self.max_iterations;
        budget -= two_opt(start, &mut pickup_seq, &pickup_idx, matrix, budget);

        let handoff = pickup_seq.last().map_or(start, |&k| pickup_idx[k]);
        let mut delivery_seq = nearest_neighbour(handoff, &delivery_idx, matrix);
        two_opt(handoff, &mut delivery_seq, &delivery_idx, matrix, budget);

        let mut ordered = Vec::with_capacity(pickups.len() + deliveries.len());
        ordered.extend(pickup_seq.into_iter().map(|k| pickups[k].clone()));
        ordered.extend(delivery_seq.into_iter().map(|k| deliveries[k].clone()));
        Ok(ordered)
    }

    /// Builds a planned route for `vehicle` over `waypoints`.
    pub fn sequence(
        &self,
        vehicle: &Vehicle,
        waypoints: Vec<Waypoint>,
        matrix: &DistanceMatrix,
        schedule: Schedule,
    ) -> Result<Route, DispatchError> {
        let origin = PointRef::Vehicle(vehicle.id.clone());
        let ordered = self.order(&origin, waypoints, matrix)?;

        let mut route = Route::new(vehicle.id.clone(), schedule.start_at, schedule.deadline);
        route.traffic_factor = schedule.traffic_factor;
        let (stops, meters) = walk(&origin, &ordered, matrix, schedule.start_at, schedule.traffic_factor)?;
        route.stops = stops;
        route.distance_meters = meters;
        route.duration_minutes = duration_minutes(&route);
        Ok(route)
    }

    /// Re-sequences the stops after the completed prefix.
    ///
    /// The vehicle's matrix point is its current position; completed stops
    /// keep their order and timestamps. Remaining arrivals are walked from
    /// `from_time`.
    pub fn resequence_remaining(
        &self,
        route: &Route,
        matrix: &DistanceMatrix,
        from_time: DateTime<Utc>,
        traffic_factor: f64,
    ) -> Result<Route, DispatchError> {
        let done = route.completed_count();
        let origin = PointRef::Vehicle(route.vehicle_id.clone());
        let remaining: Vec<Waypoint> = route.stops[done..].iter().map(Waypoint::from_stop).collect();
        let ordered = self.order(&origin, remaining, matrix)?;

        let (tail, meters) = walk(&origin, &ordered, matrix, from_time, traffic_factor)?;

        let mut next = route.clone();
        next.stops.truncate(done);
        next.stops.extend(tail);
        next.traffic_factor = traffic_factor;
        next.distance_meters = completed_distance(route) + meters;
        next.duration_minutes = duration_minutes(&next);
        if next.stops.iter().all(Stop::is_completed) && !next.stops.is_empty() {
            next.status = RouteStatus::Completed;
        }
        Ok(next)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new(1_000)
    }
}

/// Turns a vehicle's delivery ids into a sequenced route.
pub struct RouteBuilder<'a> {
    deliveries: HashMap<&'a str, &'a DeliveryPoint>,
    pickups: HashMap<&'a str, &'a PickupPoint>,
    matrix: &'a DistanceMatrix,
    sequencer: Sequencer,
    schedule: Schedule,
}

impl<'a> RouteBuilder<'a> {
    pub fn new(
        deliveries: &'a [DeliveryPoint],
        pickups: &'a [PickupPoint],
        matrix: &'a DistanceMatrix,
        sequencer: Sequencer,
        schedule: Schedule,
    ) -> Self {
        Self {
            deliveries: deliveries.iter().map(|d| (d.id.as_str(), d)).collect(),
            pickups: pickups.iter().map(|p| (p.id.as_str(), p)).collect(),
            matrix,
            sequencer,
            schedule,
        }
    }

    pub fn schedule(&self) -> Schedule {
        self.schedule
    }

    pub fn delivery(&self, id: &str) -> Option<&'a DeliveryPoint> {
        self.deliveries.get(id).copied()
    }

    /// Sequences `delivery_ids` plus each distinct pickup they reference.
    pub fn build(&self, vehicle: &Vehicle, delivery_ids: &[String]) -> Result<Route, DispatchError> {
        let mut waypoints = Vec::with_capacity(delivery_ids.len() + 1);
        let mut seen_pickups: Vec<&str> = Vec::new();

        for id in delivery_ids {
            let delivery = self.delivery(id).ok_or_else(|| DispatchError::NotFound {
                kind: "delivery",
                id: id.clone(),
            })?;
            if let Some(pid) = delivery.pickup_id.as_deref() {
                if !seen_pickups.contains(&pid) {
                    let pickup = self.pickups.get(pid).ok_or_else(|| DispatchError::NotFound {
                        kind: "pickup",
                        id: pid.to_string(),
                    })?;
                    seen_pickups.push(pid);
                    waypoints.push(Waypoint::pickup(pickup));
                }
            }
            waypoints.push(Waypoint::delivery(delivery));
        }

        self.sequencer.sequence(vehicle, waypoints, self.matrix, self.schedule)
    }
}

fn indices(waypoints: &[Waypoint], matrix: &DistanceMatrix) -> Result<Vec<usize>, DispatchError> {
    waypoints.iter().map(|w| matrix.require(&w.point_ref())).collect()
}

/// Returns positions into `nodes`, visiting the closest unvisited each time.
fn nearest_neighbour(start: usize, nodes: &[usize], matrix: &DistanceMatrix) -> Vec<usize> {
    let mut visited = vec![false; nodes.len()];
    let mut seq = Vec::with_capacity(nodes.len());
    let mut at = start;

    for _ in 0..nodes.len() {
        let mut best: Option<(usize, f64)> = None;
        for (k, &node) in nodes.iter().enumerate() {
            if visited[k] {
                continue;
            }
            let d = matrix.meters(at, node);
            if best.map_or(true, |(_, b)| d < b) {
                best = Some((k, d));
            }
        }
        if let Some((k, _)) = best {
            visited[k] = true;
            seq.push(k);
            at = nodes[k];
        }
    }
    seq
}

fn path_meters(start: usize, seq: &[usize], nodes: &[usize], matrix: &DistanceMatrix) -> f64 {
    let mut at = start;
    let mut total = 0.0;
    for &k in seq {
        total += matrix.meters(at, nodes[k]);
        at = nodes[k];
    }
    total
}

/// Applies improving segment reversals; returns the number of moves made.
fn two_opt(start: usize, seq: &mut [usize], nodes: &[usize], matrix: &DistanceMatrix, max_moves: usize) -> usize {
    let n = seq.len();
    if n < 2 || max_moves == 0 {
        return 0;
    }

    let mut best = path_meters(start, seq, nodes, matrix);
    let mut moves = 0;
    loop {
        let mut improved = false;
        for i in 0..n - 1 {
            for j in i + 1..n {
                seq[i..=j].reverse();
                let cost = path_meters(start, seq, nodes, matrix);
                if cost < best - MIN_GAIN_M {
                    best = cost;
                    moves += 1;
                    improved = true;
                    if moves >= max_moves {
                        return moves;
                    }
                } else {
                    seq[i..=j].reverse();
                }
            }
        }
        if !improved {
            return moves;
        }
    }
}

/// Walks `ordered` from `origin`, producing stops and total meters.
fn walk(
    origin: &PointRef,
    ordered: &[Waypoint],
    matrix: &DistanceMatrix,
    start_at: DateTime<Utc>,
    traffic_factor: f64,
) -> Result<(Vec<Stop>, f64), DispatchError> {
    let mut at = matrix.require(origin)?;
    let mut clock = start_at;
    let mut meters = 0.0;
    let mut stops = Vec::with_capacity(ordered.len());

    for w in ordered {
        let next = matrix.require(&w.point_ref())?;
        meters += matrix.meters(at, next);
        clock += Duration::seconds(matrix.seconds_with_traffic(at, next, traffic_factor));
        stops.push(Stop {
            kind: w.kind,
            ref_id: w.ref_id.clone(),
            location: w.location,
            arrival: clock,
            service_minutes: w.service_minutes,
            priority: w.priority,
            weight: w.weight,
            completed_at: None,
        });
        clock += Duration::minutes(w.service_minutes);
        at = next;
    }
    Ok((stops, meters))
}

fn completed_distance(route: &Route) -> f64 {
    let done = route.completed_count();
    let total = route.stops.len().max(1) as f64;
    route.distance_meters * done as f64 / total
}

fn duration_minutes(route: &Route) -> i64 {
    route
        .last_arrival()
        .map_or(0, |last| (last - route.started_at).num_minutes())
}
