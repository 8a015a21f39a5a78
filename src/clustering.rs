//! Delivery-to-vehicle assignment.
//!
//! Every (vehicle, delivery) pair gets a composite score; lower wins.
//!
//! ```text
//! score = w1 * vehicle_to_pickup_km
//!       + w2 * pickup_to_delivery_km
//!       + w3 * (1 + km from delivery to the vehicle's cluster centroid)
//!       + w4 * projected_load / capacity
//!       + w5 * (0 if the vehicle continues from the same pickup, else 1)
//! ```
//!
//! Strategies share the [`AssignmentStrategy`] contract: every delivery ends
//! up either in exactly one vehicle's list or in `unassigned`.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;
use utoipa::ToSchema;

use crate::config::{ScoringWeights, SequencerSettings};
use crate::distance::{DistanceMatrix, PointRef};
use crate::domain::{Coordinate, DeliveryId, DeliveryPoint, PickupPoint, Vehicle, VehicleId};
use crate::error::DispatchError;

/// Cost of leaving a delivery out, dominating any real score.
const UNASSIGNED_PENALTY: f64 = 1e9;

/// Everything a strategy needs for one cycle.
pub struct AssignmentInput<'a> {
    pub vehicles: &'a [Vehicle],
    pub deliveries: &'a [DeliveryPoint],
    pub pickups: &'a [PickupPoint],
    pub matrix: &'a DistanceMatrix,
    pub weights: ScoringWeights,
    /// Stop cap per vehicle, `None` for unlimited.
    pub max_stops_per_vehicle: Option<usize>,
}

/// Weighted terms behind one assignment decision.
#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ScoreBreakdown {
    pub vehicle_id: VehicleId,
    pub delivery_id: DeliveryId,
    pub vehicle_to_pickup: f64,
    pub pickup_to_delivery: f64,
    pub cluster_density: f64,
    pub load_imbalance: f64,
    pub route_continuation: f64,
    pub total: f64,
}

/// Delivery partition produced by a strategy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Assignment {
    /// Deliveries per vehicle, in assignment order.
    pub by_vehicle: BTreeMap<VehicleId, Vec<DeliveryId>>,
    pub unassigned: Vec<DeliveryId>,
    pub breakdowns: Vec<ScoreBreakdown>,
}

impl Assignment {
    pub fn vehicles_used(&self) -> usize {
        self.by_vehicle.values().filter(|d| !d.is_empty()).count()
    }

    pub fn assigned_count(&self) -> usize {
        self.by_vehicle.values().map(Vec::len).sum()
    }

    pub fn vehicle_of(&self, delivery_id: &str) -> Option<&VehicleId> {
        self.by_vehicle
            .iter()
            .find(|(_, ds)| ds.iter().any(|d| d == delivery_id))
            .map(|(v, _)| v)
    }
}

/// Interchangeable assignment algorithm.
pub trait AssignmentStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn assign(&self, input: &AssignmentInput<'_>) -> Result<Assignment, DispatchError>;
}

/// Per-vehicle running totals while deliveries are placed.
#[derive(Debug, Clone)]
struct VehicleState {
    load: u32,
    stops: usize,
    lat_sum: f64,
    lon_sum: f64,
    last_pickup: Option<String>,
}

impl VehicleState {
    fn new(vehicle: &Vehicle) -> Self {
        Self {
            load: vehicle.load,
            stops: 0,
            lat_sum: 0.0,
            lon_sum: 0.0,
            last_pickup: None,
        }
    }

    fn centroid(&self) -> Option<Coordinate> {
        (self.stops > 0).then(|| {
            Coordinate::new(self.lat_sum / self.stops as f64, self.lon_sum / self.stops as f64)
        })
    }

    fn take(&mut self, delivery: &DeliveryPoint) {
        self.load = self.load.saturating_add(delivery.weight);
        self.stops += 1;
        self.lat_sum += delivery.location.latitude;
        self.lon_sum += delivery.location.longitude;
        if delivery.pickup_id.is_some() {
            self.last_pickup = delivery.pickup_id.clone();
        }
    }
}

/// Shared scoring over matrix indices resolved once per cycle.
struct Scorer<'a> {
    input: &'a AssignmentInput<'a>,
    vehicle_idx: Vec<usize>,
    delivery_idx: Vec<usize>,
    /// Matrix index of each delivery's pickup.
    origin_idx: Vec<Option<usize>>,
}

impl<'a> Scorer<'a> {
    fn new(input: &'a AssignmentInput<'a>) -> Result<Self, DispatchError> {
        let known: HashMap<&str, &PickupPoint> =
            input.pickups.iter().map(|p| (p.id.as_str(), p)).collect();

        let vehicle_idx = input
            .vehicles
            .iter()
            .map(|v| input.matrix.require(&PointRef::Vehicle(v.id.clone())))
            .collect::<Result<_, _>>()?;
        let delivery_idx = input
            .deliveries
            .iter()
            .map(|d| input.matrix.require(&PointRef::Delivery(d.id.clone())))
            .collect::<Result<_, _>>()?;
        let origin_idx = input
            .deliveries
            .iter()
            .map(|d| match &d.pickup_id {
                None => Ok(None),
                Some(pid) if known.contains_key(pid.as_str()) => {
                    input.matrix.require(&PointRef::Pickup(pid.clone())).map(Some)
                }
                Some(pid) => Err(DispatchError::NotFound {
                    kind: "pickup",
                    id: pid.clone(),
                }),
            })
            .collect::<Result<_, _>>()?;

        Ok(Self {
            input,
            vehicle_idx,
            delivery_idx,
            origin_idx,
        })
    }

    fn fits(&self, v: usize, state: &VehicleState, d: usize) -> bool {
        let vehicle = &self.input.vehicles[v];
        let delivery = &self.input.deliveries[d];
        vehicle.status != crate::domain::VehicleStatus::Offline
            && state.load.checked_add(delivery.weight).is_some_and(|l| l <= vehicle.capacity)
            && self
                .input
                .max_stops_per_vehicle
                .map_or(true, |cap| state.stops < cap)
    }

    fn score(&self, v: usize, state: &VehicleState, d: usize) -> ScoreBreakdown {
        let vehicle = &self.input.vehicles[v];
        let delivery = &self.input.deliveries[d];
        let w = &self.input.weights;
        let m = self.input.matrix;

        let (to_pickup_m, to_delivery_m) = match self.origin_idx[d] {
            Some(p) => (
                m.meters(self.vehicle_idx[v], p),
                m.meters(p, self.delivery_idx[d]),
            ),
            None => (0.0, m.meters(self.vehicle_idx[v], self.delivery_idx[d])),
        };

        let anchor = state.centroid().unwrap_or(vehicle.location);
        let spread = 1.0 + delivery.location.distance_meters(&anchor) / 1000.0;

        let load = if vehicle.capacity == 0 {
            1.0
        } else {
            (f64::from(state.load) + f64::from(delivery.weight)) / f64::from(vehicle.capacity)
        };

        let continuation = match (&state.last_pickup, &delivery.pickup_id) {
            _ if state.stops == 0 => 0.0,
            (Some(last), Some(this)) if last == this => 0.0,
            (None, None) => 0.0,
            _ => 1.0,
        };

        let terms = [
            w.vehicle_to_pickup * to_pickup_m / 1000.0,
            w.pickup_to_delivery * to_delivery_m / 1000.0,
            w.cluster_density * spread,
            w.load_imbalance * load,
            w.route_continuation * continuation,
        ];

        ScoreBreakdown {
            vehicle_id: vehicle.id.clone(),
            delivery_id: delivery.id.clone(),
            vehicle_to_pickup: terms[0],
            pickup_to_delivery: terms[1],
            cluster_density: terms[2],
            load_imbalance: terms[3],
            route_continuation: terms[4],
            total: terms.iter().sum(),
        }
    }

    /// Deliveries by descending priority, id breaking ties.
    fn priority_order(&self) -> Vec<usize> {
        let ds = self.input.deliveries;
        let mut order: Vec<usize> = (0..ds.len()).collect();
        order.sort_by(|&a, &b| ds[b].priority.cmp(&ds[a].priority).then_with(|| ds[a].id.cmp(&ds[b].id)));
        order
    }

    /// Vehicles by id.
    fn vehicle_order(&self) -> Vec<usize> {
        let vs = self.input.vehicles;
        let mut order: Vec<usize> = (0..vs.len()).collect();
        order.sort_by(|&a, &b| vs[a].id.cmp(&vs[b].id));
        order
    }
}

fn check_fleet(input: &AssignmentInput<'_>) -> Result<(), DispatchError> {
    if input.vehicles.is_empty() {
        return Err(DispatchError::NoCapacity {
            delivery_ids: input.deliveries.iter().map(|d| d.id.clone()).collect(),
            additional_capacity: input
                .deliveries
                .iter()
                .fold(0u32, |acc, d| acc.saturating_add(d.weight)),
        });
    }
    Ok(())
}

/// Greedy assignment in descending priority order.
///
/// Each delivery goes to the lowest-scoring vehicle that still has room;
/// equal scores go to the lowest vehicle id.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyAssigner;

impl AssignmentStrategy for GreedyAssigner {
    fn name(&self) -> &'static str {
        "greedy"
    }

    fn assign(&self, input: &AssignmentInput<'_>) -> Result<Assignment, DispatchError> {
        check_fleet(input)?;
        let scorer = Scorer::new(input)?;
        let vehicles = scorer.vehicle_order();
        let mut states: Vec<VehicleState> = input.vehicles.iter().map(VehicleState::new).collect();
        let mut result = Assignment::default();

        for d in scorer.priority_order() {
            let mut best: Option<(usize, ScoreBreakdown)> = None;
            for &v in &vehicles {
                if !scorer.fits(v, &states[v], d) {
                    continue;
                }
                let score = scorer.score(v, &states[v], d);
                if best.as_ref().map_or(true, |(_, b)| score.total < b.total) {
                    best = Some((v, score));
                }
            }

            let delivery = &input.deliveries[d];
            match best {
                Some((v, breakdown)) => {
                    states[v].take(delivery);
                    result
                        .by_vehicle
                        .entry(input.vehicles[v].id.clone())
                        .or_default()
                        .push(delivery.id.clone());
                    result.breakdowns.push(breakdown);
                }
                None => result.unassigned.push(delivery.id.clone()),
            }
        }

        debug!(
            strategy = self.name(),
            assigned = result.assigned_count(),
            unassigned = result.unassigned.len(),
            "Assignment complete"
        );
        Ok(result)
    }
}

/// Exhaustive branch-and-bound over small instances.
///
/// Minimises unassigned deliveries first, then the summed score. Scores
/// are evaluated incrementally in priority order, the same order the greedy
/// assigner uses, so both strategies price a partition identically.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExactAssigner;

struct Search<'s, 'a> {
    scorer: &'s Scorer<'a>,
    order: Vec<usize>,
    vehicles: Vec<usize>,
    best_cost: f64,
    best: Vec<Option<(usize, ScoreBreakdown)>>,
    current: Vec<Option<(usize, ScoreBreakdown)>>,
}

impl Search<'_, '_> {
    fn descend(&mut self, depth: usize, states: &[VehicleState], cost: f64) {
        if cost >= self.best_cost {
            return;
        }
        if depth == self.order.len() {
            self.best_cost = cost;
            self.best = self.current.clone();
            return;
        }

        let d = self.order[depth];
        for i in 0..self.vehicles.len() {
            let v = self.vehicles[i];
            if !self.scorer.fits(v, &states[v], d) {
                continue;
            }
            let score = self.scorer.score(v, &states[v], d);
            let next_cost = cost + score.total;
            let mut next = states.to_vec();
            next[v].take(&self.scorer.input.deliveries[d]);
            self.current.push(Some((v, score)));
            self.descend(depth + 1, &next, next_cost);
            self.current.pop();
        }

        self.current.push(None);
        self.descend(depth + 1, states, cost + UNASSIGNED_PENALTY);
        self.current.pop();
    }
}

impl AssignmentStrategy for ExactAssigner {
    fn name(&self) -> &'static str {
        "exact"
    }

    fn assign(&self, input: &AssignmentInput<'_>) -> Result<Assignment, DispatchError> {
        check_fleet(input)?;
        let scorer = Scorer::new(input)?;
        let states: Vec<VehicleState> = input.vehicles.iter().map(VehicleState::new).collect();

        let mut search = Search {
            order: scorer.priority_order(),
            vehicles: scorer.vehicle_order(),
            scorer: &scorer,
            best_cost: f64::INFINITY,
            best: Vec::new(),
            current: Vec::new(),
        };
        search.descend(0, &states, 0.0);

        let mut result = Assignment::default();
        for (&d, choice) in search.order.iter().zip(search.best) {
            let delivery = &input.deliveries[d];
            match choice {
                Some((v, breakdown)) => {
                    result
                        .by_vehicle
                        .entry(input.vehicles[v].id.clone())
                        .or_default()
                        .push(delivery.id.clone());
                    result.breakdowns.push(breakdown);
                }
                None => result.unassigned.push(delivery.id.clone()),
            }
        }

        debug!(
            strategy = self.name(),
            cost = search.best_cost,
            assigned = result.assigned_count(),
            "Assignment complete"
        );
        Ok(result)
    }
}

/// Picks a strategy by instance size.
#[derive(Clone)]
pub struct StrategySelector {
    exact_limit: usize,
    large_threshold: usize,
    external: Option<Arc<dyn AssignmentStrategy>>,
}

impl StrategySelector {
    pub fn new(settings: &SequencerSettings) -> Self {
        Self {
            exact_limit: settings.exact_assignment_limit,
            large_threshold: settings.large_batch_threshold,
            external: None,
        }
    }

    /// Registers the solver used above the large-batch threshold.
    pub fn with_external(mut self, solver: Arc<dyn AssignmentStrategy>) -> Self {
        self.external = Some(solver);
        self
    }

    /// ```
    /// use fleet_dispatch::clustering::StrategySelector;
    /// use fleet_dispatch::config::SequencerSettings;
    ///
    /// let selector = StrategySelector::new(&SequencerSettings::default());
    /// assert_eq!(selector.select(4).name(), "exact");
    /// assert_eq!(selector.select(40).name(), "greedy");
    /// // no external solver registered
    /// assert_eq!(selector.select(4_000).name(), "greedy");
    /// ```
    pub fn select(&self, deliveries: usize) -> &dyn AssignmentStrategy {
        if deliveries > self.large_threshold {
            if let Some(external) = &self.external {
                return external.as_ref();
            }
        }
        if deliveries <= self.exact_limit {
            &ExactAssigner
        } else {
            &GreedyAssigner
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distance::HaversineProvider;

    fn hub() -> PickupPoint {
        PickupPoint::new("hub", "Hub", Coordinate::new(24.70, 46.70))
    }

    fn matrix(vehicles: &[Vehicle], deliveries: &[DeliveryPoint], pickups: &[PickupPoint]) -> DistanceMatrix {
        let mut points: Vec<(PointRef, Coordinate)> = Vec::new();
        points.extend(vehicles.iter().map(|v| (PointRef::Vehicle(v.id.clone()), v.location)));
        points.extend(pickups.iter().map(|p| (PointRef::Pickup(p.id.clone()), p.location)));
        points.extend(deliveries.iter().map(|d| (PointRef::Delivery(d.id.clone()), d.location)));
        DistanceMatrix::haversine(&HaversineProvider::default(), &points)
    }

    fn input<'a>(
        vehicles: &'a [Vehicle],
        deliveries: &'a [DeliveryPoint],
        pickups: &'a [PickupPoint],
        matrix: &'a DistanceMatrix,
    ) -> AssignmentInput<'a> {
        AssignmentInput {
            vehicles,
            deliveries,
            pickups,
            matrix,
            weights: ScoringWeights::default(),
            max_stops_per_vehicle: None,
        }
    }

    fn west_east() -> (Vec<Vehicle>, Vec<DeliveryPoint>) {
        let vehicles = vec![
            Vehicle::new("east", 10, Coordinate::new(24.70, 46.80)),
            Vehicle::new("west", 10, Coordinate::new(24.70, 46.60)),
        ];
        let deliveries = vec![
            DeliveryPoint::new("d-east", Coordinate::new(24.71, 46.81)),
            DeliveryPoint::new("d-west", Coordinate::new(24.71, 46.59)),
        ];
        (vehicles, deliveries)
    }

    #[test]
    fn zero_vehicles_is_no_capacity() {
        let deliveries = vec![DeliveryPoint::new("d1", Coordinate::new(24.7, 46.7)).with_weight(7)];
        let m = matrix(&[], &deliveries, &[]);
        let err = GreedyAssigner.assign(&input(&[], &deliveries, &[], &m)).unwrap_err();
        assert_eq!(
            err,
            DispatchError::NoCapacity {
                delivery_ids: vec!["d1".into()],
                additional_capacity: 7
            }
        );
    }

    #[test]
    fn greedy_prefers_nearby_vehicle() {
        let (vehicles, deliveries) = west_east();
        let m = matrix(&vehicles, &deliveries, &[]);
        let result = GreedyAssigner.assign(&input(&vehicles, &deliveries, &[], &m)).unwrap();
        assert_eq!(result.vehicle_of("d-east").map(String::as_str), Some("east"));
        assert_eq!(result.vehicle_of("d-west").map(String::as_str), Some("west"));
        assert_eq!(result.breakdowns.len(), 2);
    }

    #[test]
    fn over_capacity_delivery_is_unassigned_not_dropped() {
        let vehicles = vec![Vehicle::new("v1", 10, Coordinate::new(24.7, 46.7))];
        let deliveries = vec![
            DeliveryPoint::new("big", Coordinate::new(24.71, 46.71)).with_weight(11),
            DeliveryPoint::new("small", Coordinate::new(24.72, 46.71)).with_weight(3),
        ];
        let m = matrix(&vehicles, &deliveries, &[]);
        let result = GreedyAssigner.assign(&input(&vehicles, &deliveries, &[], &m)).unwrap();
        assert_eq!(result.unassigned, vec!["big".to_string()]);
        assert_eq!(result.by_vehicle["v1"], vec!["small".to_string()]);
    }

    #[test]
    fn huge_weights_never_wrap_the_load() {
        let mut nearly_full = Vehicle::new("v1", u32::MAX, Coordinate::new(24.7, 46.7));
        nearly_full.load = u32::MAX - 1;
        let vehicles = vec![nearly_full];
        let deliveries = vec![
            DeliveryPoint::new("heavy", Coordinate::new(24.71, 46.71)).with_weight(5),
            DeliveryPoint::new("light", Coordinate::new(24.72, 46.71)).with_weight(1),
        ];
        let m = matrix(&vehicles, &deliveries, &[]);
        let result = GreedyAssigner.assign(&input(&vehicles, &deliveries, &[], &m)).unwrap();
        assert_eq!(result.unassigned, vec!["heavy".to_string()]);
        assert_eq!(result.by_vehicle["v1"], vec!["light".to_string()]);

        let err = GreedyAssigner.assign(&input(&[], &deliveries, &[], &m)).unwrap_err();
        assert!(matches!(err, DispatchError::NoCapacity { additional_capacity: 6, .. }));
        let maxed = vec![
            DeliveryPoint::new("a", Coordinate::new(24.71, 46.71)).with_weight(u32::MAX),
            DeliveryPoint::new("b", Coordinate::new(24.72, 46.71)).with_weight(u32::MAX),
        ];
        let err = GreedyAssigner.assign(&input(&[], &maxed, &[], &m)).unwrap_err();
        assert!(matches!(err, DispatchError::NoCapacity { additional_capacity: u32::MAX, .. }));
    }

    #[test]
    fn higher_priority_takes_the_last_slot() {
        let vehicles = vec![Vehicle::new("v1", 5, Coordinate::new(24.7, 46.7))];
        let deliveries = vec![
            DeliveryPoint::new("low", Coordinate::new(24.71, 46.71)).with_weight(5),
            DeliveryPoint::new("urgent", Coordinate::new(24.75, 46.75)).with_weight(5).with_priority(9),
        ];
        let m = matrix(&vehicles, &deliveries, &[]);
        let result = GreedyAssigner.assign(&input(&vehicles, &deliveries, &[], &m)).unwrap();
        assert_eq!(result.by_vehicle["v1"], vec!["urgent".to_string()]);
        assert_eq!(result.unassigned, vec!["low".to_string()]);
    }

    #[test]
    fn equal_scores_go_to_lowest_vehicle_id() {
        let here = Coordinate::new(24.7, 46.7);
        let vehicles = vec![Vehicle::new("b", 10, here), Vehicle::new("a", 10, here)];
        let deliveries = vec![DeliveryPoint::new("d1", Coordinate::new(24.72, 46.7))];
        let m = matrix(&vehicles, &deliveries, &[]);
        let result = GreedyAssigner.assign(&input(&vehicles, &deliveries, &[], &m)).unwrap();
        assert_eq!(result.vehicle_of("d1").map(String::as_str), Some("a"));
    }

    #[test]
    fn stop_cap_spreads_deliveries() {
        let here = Coordinate::new(24.7, 46.7);
        let vehicles = vec![Vehicle::new("a", 100, here), Vehicle::new("b", 100, here)];
        let deliveries: Vec<_> = (0..4)
            .map(|i| DeliveryPoint::new(format!("d{i}"), Coordinate::new(24.71 + i as f64 * 0.001, 46.7)))
            .collect();
        let m = matrix(&vehicles, &deliveries, &[]);
        let mut inp = input(&vehicles, &deliveries, &[], &m);
        inp.max_stops_per_vehicle = Some(2);
        let result = GreedyAssigner.assign(&inp).unwrap();
        assert_eq!(result.by_vehicle["a"].len(), 2);
        assert_eq!(result.by_vehicle["b"].len(), 2);
    }

    #[test]
    fn unknown_pickup_is_rejected() {
        let vehicles = vec![Vehicle::new("v1", 10, Coordinate::new(24.7, 46.7))];
        let deliveries = vec![DeliveryPoint::new("d1", Coordinate::new(24.71, 46.71)).with_pickup("nowhere")];
        let m = matrix(&vehicles, &deliveries, &[]);
        let err = GreedyAssigner.assign(&input(&vehicles, &deliveries, &[], &m)).unwrap_err();
        assert!(matches!(err, DispatchError::NotFound { kind: "pickup", .. }));
    }

    #[test]
    fn exact_never_scores_worse_than_greedy() {
        let pickups = vec![hub()];
        let vehicles = vec![
            Vehicle::new("v1", 6, Coordinate::new(24.70, 46.69)),
            Vehicle::new("v2", 6, Coordinate::new(24.74, 46.75)),
        ];
        let deliveries: Vec<_> = (0..5)
            .map(|i| {
                DeliveryPoint::new(format!("d{i}"), Coordinate::new(24.70 + i as f64 * 0.01, 46.70 + i as f64 * 0.012))
                    .with_pickup("hub")
                    .with_weight(2)
            })
            .collect();
        let m = matrix(&vehicles, &deliveries, &pickups);
        let inp = input(&vehicles, &deliveries, &pickups, &m);

        let greedy = GreedyAssigner.assign(&inp).unwrap();
        let exact = ExactAssigner.assign(&inp).unwrap();
        let total = |a: &Assignment| a.breakdowns.iter().map(|b| b.total).sum::<f64>();

        assert_eq!(exact.unassigned.len(), greedy.unassigned.len());
        assert!(total(&exact) <= total(&greedy) + 1e-9);
        assert_eq!(exact.assigned_count() + exact.unassigned.len(), deliveries.len());
    }

    struct Everything;

    impl AssignmentStrategy for Everything {
        fn name(&self) -> &'static str {
            "external"
        }

        fn assign(&self, input: &AssignmentInput<'_>) -> Result<Assignment, DispatchError> {
            GreedyAssigner.assign(input)
        }
    }

    #[test]
    fn selector_routes_large_batches_to_external_solver() {
        let settings = SequencerSettings {
            large_batch_threshold: 10,
            ..Default::default()
        };
        let selector = StrategySelector::new(&settings).with_external(Arc::new(Everything));
        assert_eq!(selector.select(11).name(), "external");
        assert_eq!(selector.select(10).name(), "greedy");
    }
}
