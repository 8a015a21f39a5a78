//! Dispatch engine: places queued orders onto vehicles.

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Engine;
use crate::domain::{Coordinate, DeliveryId, Order, OrderStatus, Route, RouteStatus, StopKind};
use crate::error::DispatchError;
use crate::planner::{AuditEntry, PlanRequest, PlanSource, Planner};
use crate::state::{FleetState, ReoptTrigger, VehicleLease};

/// Runs assignment, sequencing and SLA validation over the queue each cycle.
///
/// Fresh orders close to an active route are handed to the route
/// re-optimizer instead. Orders that cannot be placed go back to the queue
/// and count toward the backlog.
pub struct DispatchEngine {
    state: Arc<FleetState>,
    planner: Arc<Planner>,
    interval: Duration,
    proximity_m: f64,
    assignments_made: AtomicU64,
    cluster_insertions: AtomicU64,
    orders_backlogged: AtomicU64,
    backlog: AtomicU64,
}

impl DispatchEngine {
    pub fn new(state: Arc<FleetState>, planner: Arc<Planner>) -> Self {
        let config = planner.config();
        Self {
            interval: Duration::from_secs(config.engines.dispatch_interval_secs),
            proximity_m: config.batching.proximity_radius_m,
            state,
            planner,
            assignments_made: AtomicU64::new(0),
            cluster_insertions: AtomicU64::new(0),
            orders_backlogged: AtomicU64::new(0),
            backlog: AtomicU64::new(0),
        }
    }

    fn backlogged(&self, ids: &[DeliveryId]) {
        if ids.is_empty() {
            return;
        }
        self.state.return_to_queue(ids);
        self.orders_backlogged.fetch_add(ids.len() as u64, Ordering::Relaxed);
    }

    /// Hands first-attempt orders near an active route to the re-optimizer.
    fn insert_into_clusters(&self, queued: Vec<Order>) -> Vec<Order> {
        let snapshot = self.state.snapshot();
        let active: Vec<(&Route, Coordinate, u32)> = snapshot
            .open_routes()
            .filter(|r| r.status == RouteStatus::Active)
            .filter_map(|r| {
                let centroid = Coordinate::centroid(r.remaining_stops().iter().map(|s| &s.location))?;
                let vehicle = snapshot.vehicles.get(&r.vehicle_id)?;
                Some((r, centroid, vehicle.residual_capacity()))
            })
            .collect();
        if active.is_empty() {
            return queued;
        }

        let mut reserved: BTreeMap<&str, u32> = BTreeMap::new();
        let mut rest = Vec::with_capacity(queued.len());
        for order in queued {
            if order.failed_attempts > 0 {
                rest.push(order);
                continue;
            }
            let target = active
                .iter()
                .filter(|(route, _, residual)| {
                    let used = reserved.get(route.vehicle_id.as_str()).copied().unwrap_or(0);
                    residual.saturating_sub(used) >= order.delivery.weight
                        && carries_pickup(route, order.delivery.pickup_id.as_deref())
                })
                .map(|(route, centroid, _)| (route, centroid.distance_meters(&order.delivery.location)))
                .filter(|(_, meters)| *meters <= self.proximity_m)
                .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.vehicle_id.cmp(&b.0.vehicle_id)));

            match target {
                Some((route, meters)) => {
                    let used = reserved.entry(route.vehicle_id.as_str()).or_insert(0);
                    *used = used.saturating_add(order.delivery.weight);
                    self.state.mark_assigned(&[order.delivery.id.clone()], &route.vehicle_id);
                    self.state.push_trigger(ReoptTrigger::NewDeliveryInCluster {
                        vehicle_id: route.vehicle_id.clone(),
                        order_id: order.delivery.id.clone(),
                    });
                    self.cluster_insertions.fetch_add(1, Ordering::Relaxed);
                    debug!(order_id = %order.id(), vehicle_id = %route.vehicle_id, meters, "Order joins active cluster");
                }
                None => rest.push(order),
            }
        }
        rest
    }

    /// Leases vehicles that can take more work without disturbing a live route.
    fn lease_candidates(&self) -> Result<Vec<VehicleLease>, DispatchError> {
        let snapshot = self.state.snapshot();
        let mut leases = Vec::new();
        for vehicle in snapshot.vehicles.values().filter(|v| v.is_available()) {
            if snapshot.routes.get(&vehicle.id).is_some_and(|r| r.status != RouteStatus::Planned) {
                continue;
            }
            match self.state.try_lease(&vehicle.id) {
                Ok(lease) => leases.push(lease),
                Err(DispatchError::VehicleBusy(id)) => debug!(vehicle_id = %id, "Vehicle busy, skipped this cycle"),
                Err(e) => return Err(e),
            }
        }
        // The snapshot may be stale by the time the lease is held.
        leases.retain(|l| {
            l.vehicle().is_available() && l.route().map_or(true, |r| r.status == RouteStatus::Planned)
        });
        Ok(leases)
    }
}

fn carries_pickup(route: &Route, pickup_id: Option<&str>) -> bool {
    match pickup_id {
        None => true,
        Some(pid) => route
            .remaining_stops()
            .iter()
            .any(|s| s.kind == StopKind::Pickup && s.ref_id == pid),
    }
}

#[async_trait]
impl Engine for DispatchEngine {
    fn name(&self) -> &'static str {
        "dispatch"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_cycle(&self) -> Result<(), DispatchError> {
        let queued = self.state.orders_with_status(OrderStatus::Queued);
        let queued = self.insert_into_clusters(queued);
        if queued.is_empty() {
            self.backlog.store(self.state.backlog() as u64, Ordering::Relaxed);
            return Ok(());
        }
        let ids: Vec<DeliveryId> = queued.iter().map(|o| o.delivery.id.clone()).collect();

        let mut leases = self.lease_candidates()?;
        let pickup_ids: BTreeSet<&str> = queued
            .iter()
            .filter_map(|o| o.delivery.pickup_id.as_deref())
            .collect();
        let pickups = self
            .state
            .pickups()
            .into_iter()
            .filter(|p| pickup_ids.contains(p.id.as_str()))
            .collect();
        let request = PlanRequest::new(
            pickups,
            queued.into_iter().map(|o| o.delivery).collect(),
            leases.iter().map(|l| l.vehicle().clone()).collect(),
        )
        .starting_at(self.state.now());

        let outcome = match self.planner.plan(&request).await {
            Ok(outcome) => outcome,
            Err(e @ (DispatchError::NoCapacity { .. } | DispatchError::SlaUnachievable { .. })) => {
                warn!(orders = ids.len(), error = %e, "Dispatch cycle could not place orders");
                self.backlogged(&ids);
                self.backlog.store(self.state.backlog() as u64, Ordering::Relaxed);
                return Ok(());
            }
            Err(e) => {
                self.backlogged(&ids);
                return Err(e);
            }
        };

        let at = self.state.now();
        let mut audit = outcome.audit.clone();
        let mut assigned = 0usize;
        for route in outcome.routes {
            let Some(lease) = leases.iter_mut().find(|l| l.vehicle_id() == route.vehicle_id) else {
                continue;
            };
            let vehicle_id = route.vehicle_id.clone();
            let delivery_ids = route.delivery_ids();

            let route = match lease.route().filter(|r| !r.stops.is_empty()).cloned() {
                None => route,
                Some(existing) => match self.planner.merge_routes(lease.vehicle(), &existing, &route).await {
                    Ok(merged) if merged.is_compliant() => merged,
                    Ok(_) | Err(_) => {
                        info!(vehicle_id = %vehicle_id, orders = delivery_ids.len(), "Merge would breach SLA, orders stay queued");
                        audit.extend(delivery_ids.iter().map(|id| AuditEntry {
                            at,
                            delivery_id: id.clone(),
                            vehicle_id: Some(vehicle_id.clone()),
                            source: PlanSource::Fallback,
                            decision: "returned to queue: merge with planned route breaches SLA".into(),
                            breakdown: None,
                        }));
                        self.backlogged(&delivery_ids);
                        continue;
                    }
                },
            };

            self.state.commit_route(lease, route)?;
            let cancelled = self.state.mark_assigned(&delivery_ids, &vehicle_id);
            for order_id in &cancelled {
                info!(vehicle_id = %vehicle_id, order_id = %order_id, "Order cancelled during planning, removing its stop");
                self.state.push_trigger(ReoptTrigger::StopCancelled {
                    vehicle_id: vehicle_id.clone(),
                    order_id: order_id.clone(),
                });
            }
            assigned += delivery_ids.len() - cancelled.len();
        }

        self.backlogged(&outcome.unassigned_deliveries);
        self.state.record_audit(audit);
        self.assignments_made.fetch_add(assigned as u64, Ordering::Relaxed);
        self.backlog.store(self.state.backlog() as u64, Ordering::Relaxed);

        info!(
            assigned,
            unassigned = outcome.unassigned_deliveries.len(),
            source = ?outcome.source,
            "Dispatch cycle complete"
        );
        Ok(())
    }

    fn stats(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("assignments_made".to_string(), self.assignments_made.load(Ordering::Relaxed)),
            ("cluster_insertions".to_string(), self.cluster_insertions.load(Ordering::Relaxed)),
            ("orders_backlogged".to_string(), self.orders_backlogged.load(Ordering::Relaxed)),
            ("backlog".to_string(), self.backlog.load(Ordering::Relaxed)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DispatchConfig;
    use crate::distance::FixedDistanceProvider;
    use crate::domain::{DeliveryPoint, Vehicle, VehicleStatus};
    use chrono::{TimeZone, Utc};

    fn setup(vehicles: usize) -> (Arc<FleetState>, DispatchEngine) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()));
        let state = Arc::new(FleetState::new(clock));
        for i in 0..vehicles {
            state
                .add_vehicle(Vehicle::new(format!("v{i}"), 20, Coordinate::new(24.70, 46.60 + i as f64 * 0.01)))
                .unwrap();
        }
        let planner = Arc::new(Planner::new(
            DispatchConfig::default(),
            Arc::new(FixedDistanceProvider::minutes(10)),
        ));
        let engine = DispatchEngine::new(Arc::clone(&state), planner);
        (state, engine)
    }

    fn queue(state: &FleetState, n: usize) -> Vec<DeliveryId> {
        let ids: Vec<DeliveryId> = (0..n).map(|i| format!("d{i}")).collect();
        for (i, id) in ids.iter().enumerate() {
            state
                .submit_order(DeliveryPoint::new(id.clone(), Coordinate::new(24.72 + i as f64 * 0.002, 46.65)))
                .unwrap();
        }
        state.mark_queued(&ids);
        ids
    }

    #[tokio::test]
    async fn queued_orders_are_assigned_and_committed() {
        let (state, engine) = setup(2);
        queue(&state, 4);

        engine.run_cycle().await.unwrap();

        assert!(state.orders_with_status(OrderStatus::Queued).is_empty());
        assert_eq!(state.orders_with_status(OrderStatus::Assigned).len(), 4);
        let snap = state.snapshot();
        assert!(snap.routes.values().all(Route::is_compliant));
        assert!(snap.vehicles.values().any(|v| v.status == VehicleStatus::Assigned));
        assert_eq!(engine.stats()["assignments_made"], 4);
        assert_eq!(state.audit_log().len(), 4);
    }

    #[tokio::test]
    async fn no_capacity_backlogs_orders() {
        let (state, engine) = setup(0);
        queue(&state, 2);

        engine.run_cycle().await.unwrap();

        assert_eq!(state.backlog(), 2);
        assert_eq!(engine.stats()["backlog"], 2);
        assert_eq!(engine.stats()["assignments_made"], 0);
    }

    #[tokio::test]
    async fn later_orders_merge_into_planned_route() {
        let (state, engine) = setup(1);
        queue(&state, 2);
        engine.run_cycle().await.unwrap();
        let first = state.snapshot().routes["v0"].clone();

        state
            .submit_order(DeliveryPoint::new("late", Coordinate::new(24.73, 46.66)))
            .unwrap();
        state.mark_queued(&["late".to_string()]);
        engine.run_cycle().await.unwrap();

        let merged = state.snapshot().routes["v0"].clone();
        assert_eq!(merged.id, first.id);
        assert_eq!(merged.delivery_ids().len(), 3);
    }

    #[tokio::test]
    async fn busy_vehicle_is_skipped() {
        let (state, engine) = setup(1);
        queue(&state, 1);
        let _held = state.try_lease("v0").unwrap();

        engine.run_cycle().await.unwrap();

        assert_eq!(state.backlog(), 1);
        assert!(state.snapshot().routes.is_empty());
    }
}
