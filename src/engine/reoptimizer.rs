//! Route re-optimizer: revisits routes after traffic, cancellations and
//! cluster insertions. Completed stops are never moved.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::Engine;
use crate::domain::{DeliveryId, OrderStatus, Route, Stop, StopKind};
use crate::error::DispatchError;
use crate::planner::Planner;
use crate::sla;
use crate::state::{FleetState, ReoptTrigger, VehicleLease};

pub struct RouteReoptimizer {
    state: Arc<FleetState>,
    planner: Arc<Planner>,
    interval: Duration,
    reoptimizations: AtomicU64,
    stops_shed: AtomicU64,
    triggers_deferred: AtomicU64,
    insertions_rejected: AtomicU64,
}

impl RouteReoptimizer {
    pub fn new(state: Arc<FleetState>, planner: Arc<Planner>) -> Self {
        Self {
            interval: Duration::from_secs(planner.config().engines.reoptimizer_interval_secs),
            state,
            planner,
            reoptimizations: AtomicU64::new(0),
            stops_shed: AtomicU64::new(0),
            triggers_deferred: AtomicU64::new(0),
            insertions_rejected: AtomicU64::new(0),
        }
    }

    /// Applies the triggers for one leased vehicle and commits the result.
    async fn reoptimize(&self, lease: &mut VehicleLease, triggers: Vec<ReoptTrigger>) -> Result<(), DispatchError> {
        let inserted = cluster_insertions(&triggers);

        let Some(mut route) = lease.route().cloned() else {
            // Route finished before the trigger was handled.
            self.state.return_to_queue(&inserted);
            return Ok(());
        };

        let now = self.state.now();
        let mut factor = route.traffic_factor;
        for trigger in &triggers {
            match trigger {
                ReoptTrigger::TrafficIncident { factor: f, .. } => factor = *f,
                ReoptTrigger::StopCancelled { order_id, .. } => drop_open_delivery(&mut route, order_id),
                ReoptTrigger::NewDeliveryInCluster { .. } => {}
            }
        }

        let capacity = lease.vehicle().capacity;
        let mut overflow = Vec::new();
        for order_id in &inserted {
            let Some(order) = self.state.order(order_id) else {
                continue;
            };
            let ours = order.status == OrderStatus::Assigned
                && order.vehicle_id.as_deref() == Some(lease.vehicle_id());
            let present = route.stops.iter().any(|s| s.kind == StopKind::Delivery && &s.ref_id == order_id);
            if !ours || present {
                continue;
            }
            let d = &order.delivery;
            if d.weight > capacity.saturating_sub(route.load()) {
                overflow.push(d.id.clone());
                continue;
            }
            route.stops.push(Stop {
                kind: StopKind::Delivery,
                ref_id: d.id.clone(),
                location: d.location,
                arrival: now,
                service_minutes: d.service_minutes,
                priority: d.priority,
                weight: d.weight,
                completed_at: None,
            });
        }
        if !overflow.is_empty() {
            debug!(
                vehicle_id = %lease.vehicle_id(),
                returned = overflow.len(),
                "Cluster insertions exceed residual capacity, returned to the queue"
            );
            self.state.return_to_queue(&overflow);
            self.insertions_rejected.fetch_add(overflow.len() as u64, Ordering::Relaxed);
        }

        if !has_open_delivery(&route) {
            info!(vehicle_id = %lease.vehicle_id(), route_id = %route.id, "No deliveries left, route closed");
            self.state.clear_route(lease);
            return Ok(());
        }

        let location = lease.vehicle().location;
        let from = route.anchor_time().max(now);
        let mut next = self.planner.resequence(&route, location, from, factor).await?;

        let mut shed = Vec::new();
        while !next.is_compliant() {
            let Some(id) = sla::lowest_priority(&next) else {
                break;
            };
            drop_open_delivery(&mut next, &id);
            shed.push(id);
            if !has_open_delivery(&next) {
                break;
            }
            next = self.planner.resequence(&next, location, from, factor).await?;
        }

        if !shed.is_empty() {
            warn!(
                vehicle_id = %lease.vehicle_id(),
                route_id = %next.id,
                shed = shed.len(),
                "Route repaired by returning lowest-priority deliveries to the queue"
            );
            self.state.return_to_queue(&shed);
            self.stops_shed.fetch_add(shed.len() as u64, Ordering::Relaxed);
        }

        if has_open_delivery(&next) {
            self.state.commit_route(lease, next)?;
        } else {
            self.state.clear_route(lease);
        }
        self.reoptimizations.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

fn cluster_insertions(triggers: &[ReoptTrigger]) -> Vec<DeliveryId> {
    triggers
        .iter()
        .filter_map(|t| match t {
            ReoptTrigger::NewDeliveryInCluster { order_id, .. } => Some(order_id.clone()),
            _ => None,
        })
        .collect()
}

fn drop_open_delivery(route: &mut Route, delivery_id: &str) {
    route
        .stops
        .retain(|s| s.is_completed() || s.kind != StopKind::Delivery || s.ref_id != delivery_id);
}

fn has_open_delivery(route: &Route) -> bool {
    route
        .remaining_stops()
        .iter()
        .any(|s| s.kind == StopKind::Delivery)
}

#[async_trait]
impl Engine for RouteReoptimizer {
    fn name(&self) -> &'static str {
        "route-reoptimizer"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_cycle(&self) -> Result<(), DispatchError> {
        let mut by_vehicle: BTreeMap<String, Vec<ReoptTrigger>> = BTreeMap::new();
        for trigger in self.state.drain_triggers() {
            by_vehicle.entry(trigger.vehicle_id().to_string()).or_default().push(trigger);
        }
        if by_vehicle.is_empty() {
            return Ok(());
        }

        for (vehicle_id, triggers) in by_vehicle {
            let mut lease = match self.state.try_lease(&vehicle_id) {
                Ok(lease) => lease,
                Err(DispatchError::VehicleBusy(_)) => {
                    debug!(vehicle_id = %vehicle_id, "Vehicle busy, triggers deferred");
                    self.triggers_deferred.fetch_add(triggers.len() as u64, Ordering::Relaxed);
                    for t in triggers {
                        self.state.push_trigger(t);
                    }
                    continue;
                }
                Err(e) => {
                    warn!(vehicle_id = %vehicle_id, error = %e, "Dropping triggers for unknown vehicle");
                    self.state.return_to_queue(&cluster_insertions(&triggers));
                    continue;
                }
            };
            self.reoptimize(&mut lease, triggers).await?;
        }
        Ok(())
    }

    fn stats(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("reoptimizations".to_string(), self.reoptimizations.load(Ordering::Relaxed)),
            ("stops_shed".to_string(), self.stops_shed.load(Ordering::Relaxed)),
            ("triggers_deferred".to_string(), self.triggers_deferred.load(Ordering::Relaxed)),
            ("insertions_rejected".to_string(), self.insertions_rejected.load(Ordering::Relaxed)),
        ])
    }

    /// Pending cluster insertions go back to dispatch; other triggers wait for a restart.
    async fn on_stop(&self) {
        let (inserted, kept): (Vec<_>, Vec<_>) = self
            .state
            .drain_triggers()
            .into_iter()
            .partition(|t| matches!(t, ReoptTrigger::NewDeliveryInCluster { .. }));
        for t in kept {
            self.state.push_trigger(t);
        }
        if !inserted.is_empty() {
            info!(returned = inserted.len(), "Pending cluster insertions returned to the queue");
            self.state.return_to_queue(&cluster_insertions(&inserted));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::DispatchConfig;
    use crate::distance::FixedDistanceProvider;
    use crate::domain::{Coordinate, DeliveryPoint, Vehicle};
    use chrono::{DateTime, Duration as Minutes, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        state: Arc<FleetState>,
        engine: RouteReoptimizer,
    }

    /// One vehicle with a committed route over `n` deliveries, 10 minute legs.
    async fn fixture(n: usize) -> Fixture {
        let clock = Arc::new(ManualClock::new(t0()));
        let state = Arc::new(FleetState::new(clock.clone()));
        state
            .add_vehicle(Vehicle::new("v1", 50, Coordinate::new(24.70, 46.60)))
            .unwrap();
        let planner = Arc::new(Planner::new(
            DispatchConfig::default(),
            Arc::new(FixedDistanceProvider::minutes(10)),
        ));

        let ids: Vec<String> = (0..n).map(|i| format!("d{i}")).collect();
        let deliveries: Vec<DeliveryPoint> = ids
            .iter()
            .enumerate()
            .map(|(i, id)| {
                DeliveryPoint::new(id.clone(), Coordinate::new(24.72 + i as f64 * 0.01, 46.65))
                    .with_priority(i as u32)
            })
            .collect();
        for d in &deliveries {
            state.submit_order(d.clone()).unwrap();
        }
        state.mark_queued(&ids);
        state.mark_assigned(&ids, "v1");

        let vehicle = state.snapshot().vehicles["v1"].clone();
        let outcome = planner
            .plan(&crate::planner::PlanRequest::new(Vec::new(), deliveries, vec![vehicle]).starting_at(t0()))
            .await
            .unwrap();
        {
            let mut lease = state.try_lease("v1").unwrap();
            state.commit_route(&mut lease, outcome.routes[0].clone()).unwrap();
        }
        let engine = RouteReoptimizer::new(Arc::clone(&state), planner);
        Fixture { clock, state, engine }
    }

    #[tokio::test]
    async fn cancelled_stop_is_removed_and_completed_prefix_kept() {
        let f = fixture(3).await;
        f.clock.set(t0() + Minutes::minutes(11));
        let done = f.state.complete_next_stop("v1").await.unwrap();

        let victim = f.state.snapshot().routes["v1"].remaining_stops()[1].ref_id.clone();
        f.state.cancel_order(&victim).unwrap();
        f.engine.run_cycle().await.unwrap();

        let route = f.state.snapshot().routes["v1"].clone();
        assert_eq!(route.stops[0].ref_id, done.ref_id);
        assert!(route.stops[0].is_completed());
        assert_eq!(route.delivery_ids().len(), 2);
        assert!(!route.delivery_ids().contains(&victim));
        assert_eq!(f.engine.stats()["reoptimizations"], 1);
    }

    #[tokio::test]
    async fn heavy_traffic_sheds_lowest_priority_delivery() {
        let f = fixture(3).await;
        // 3 legs of 10 min at factor 9 plus service: about 280 min, over the window.
        f.state.report_traffic("v1", 9.0).unwrap();
        f.engine.run_cycle().await.unwrap();

        let route = f.state.snapshot().routes["v1"].clone();
        assert!(route.is_compliant());
        assert!(!route.delivery_ids().contains(&"d0".to_string()));
        assert_eq!(f.state.order("d0").unwrap().status, OrderStatus::Queued);
        assert!(f.engine.stats()["stops_shed"] >= 1);
    }

    #[tokio::test]
    async fn cluster_insertion_adds_stop() {
        let f = fixture(2).await;
        f.state
            .submit_order(DeliveryPoint::new("near", Coordinate::new(24.725, 46.65)))
            .unwrap();
        f.state.mark_queued(&["near".to_string()]);
        f.state.mark_assigned(&["near".to_string()], "v1");
        f.state.push_trigger(ReoptTrigger::NewDeliveryInCluster {
            vehicle_id: "v1".into(),
            order_id: "near".into(),
        });

        f.engine.run_cycle().await.unwrap();
        let route = f.state.snapshot().routes["v1"].clone();
        assert!(route.delivery_ids().contains(&"near".to_string()));
        assert_eq!(route.delivery_ids().len(), 3);
        assert!(route.is_compliant());
    }

    fn queue_insertion(state: &FleetState, delivery: DeliveryPoint, vehicle_id: &str) {
        let id = delivery.id.clone();
        state.submit_order(delivery).unwrap();
        state.mark_queued(&[id.clone()]);
        state.mark_assigned(&[id.clone()], vehicle_id);
        state.push_trigger(ReoptTrigger::NewDeliveryInCluster {
            vehicle_id: vehicle_id.into(),
            order_id: id,
        });
    }

    #[tokio::test]
    async fn insertion_beyond_residual_capacity_goes_back_to_queue() {
        let f = fixture(2).await;
        // 2 units on board, 48 free.
        queue_insertion(&f.state, DeliveryPoint::new("small", Coordinate::new(24.725, 46.65)).with_weight(30), "v1");
        queue_insertion(&f.state, DeliveryPoint::new("big", Coordinate::new(24.726, 46.65)).with_weight(30), "v1");

        f.engine.run_cycle().await.unwrap();

        let snapshot = f.state.snapshot();
        let route = &snapshot.routes["v1"];
        assert!(route.delivery_ids().contains(&"small".to_string()));
        assert!(!route.delivery_ids().contains(&"big".to_string()));
        assert_eq!(route.load(), 32);
        assert_eq!(snapshot.vehicles["v1"].load, 32);
        let big = f.state.order("big").unwrap();
        assert_eq!(big.status, OrderStatus::Queued);
        assert_eq!(big.vehicle_id, None);
        assert_eq!(f.engine.stats()["insertions_rejected"], 1);
    }

    #[tokio::test]
    async fn insertion_for_unknown_vehicle_is_requeued() {
        let f = fixture(1).await;
        queue_insertion(&f.state, DeliveryPoint::new("lost", Coordinate::new(24.725, 46.65)), "ghost");

        f.engine.run_cycle().await.unwrap();

        let order = f.state.order("lost").unwrap();
        assert_eq!(order.status, OrderStatus::Queued);
        assert_eq!(order.failed_attempts, 1);
    }

    #[tokio::test]
    async fn stopping_returns_pending_insertions_and_keeps_other_triggers() {
        let f = fixture(2).await;
        queue_insertion(&f.state, DeliveryPoint::new("near", Coordinate::new(24.725, 46.65)), "v1");
        f.state.report_traffic("v1", 1.5).unwrap();

        f.engine.on_stop().await;

        assert_eq!(f.state.order("near").unwrap().status, OrderStatus::Queued);
        let pending = f.state.drain_triggers();
        assert_eq!(pending.len(), 1);
        assert!(matches!(pending[0], ReoptTrigger::TrafficIncident { .. }));
    }

    #[tokio::test]
    async fn busy_vehicle_defers_triggers() {
        let f = fixture(2).await;
        f.state.report_traffic("v1", 1.5).unwrap();
        let held = f.state.try_lease("v1").unwrap();
        f.engine.run_cycle().await.unwrap();
        assert_eq!(f.engine.stats()["triggers_deferred"], 1);
        drop(held);

        f.engine.run_cycle().await.unwrap();
        assert_eq!(f.state.snapshot().routes["v1"].traffic_factor, 1.5);
    }
}
