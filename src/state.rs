//! Shared fleet state.
//!
//! Vehicles live in per-vehicle slots guarded by async mutexes. Holding a
//! [`VehicleLease`] is the only way to change a vehicle or its route, so two
//! engines can never rewrite the same route at once. Every route write goes
//! through [`FleetState::commit_route`], which applies the SLA gate.
//!
//! Readers use [`FleetState::snapshot`], an `Arc` swapped on each commit;
//! status reads never wait for a planning cycle.

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::alerts::{Alert, AlertBook, RiskNotice};
use crate::clock::Clock;
use crate::domain::{
    DeliveryId, DeliveryPoint, Order, OrderStatus, PickupId, PickupPoint, Route, RouteStatus,
    Stop, StopKind, Vehicle, VehicleId, VehicleStatus,
};
use crate::error::DispatchError;
use crate::planner::AuditEntry;
use crate::sla::{self, ComplianceReport, DeliveryRecord, SlaStatus};

/// A vehicle and the route it owns.
#[derive(Debug, Clone)]
pub struct VehicleSlot {
    pub vehicle: Vehicle,
    pub route: Option<Route>,
}

/// Exclusive ownership of one vehicle for the length of a cycle.
pub struct VehicleLease {
    guard: OwnedMutexGuard<VehicleSlot>,
}

impl VehicleLease {
    pub fn vehicle(&self) -> &Vehicle {
        &self.guard.vehicle
    }

    pub fn route(&self) -> Option<&Route> {
        self.guard.route.as_ref()
    }

    pub fn vehicle_id(&self) -> &str {
        &self.guard.vehicle.id
    }
}

/// Read-only copy of vehicles and routes.
#[derive(Debug, Clone, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FleetSnapshot {
    pub vehicles: BTreeMap<VehicleId, Vehicle>,
    pub routes: BTreeMap<VehicleId, Route>,
    /// Bumped on every published change.
    pub version: u64,
}

impl FleetSnapshot {
    pub fn open_routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values().filter(|r| r.is_open())
    }
}

/// Event that makes the route re-optimizer revisit a vehicle.
#[derive(Debug, Clone, PartialEq)]
pub enum ReoptTrigger {
    TrafficIncident { vehicle_id: VehicleId, factor: f64 },
    StopCancelled { vehicle_id: VehicleId, order_id: DeliveryId },
    NewDeliveryInCluster { vehicle_id: VehicleId, order_id: DeliveryId },
}

impl ReoptTrigger {
    pub fn vehicle_id(&self) -> &str {
        match self {
            ReoptTrigger::TrafficIncident { vehicle_id, .. }
            | ReoptTrigger::StopCancelled { vehicle_id, .. }
            | ReoptTrigger::NewDeliveryInCluster { vehicle_id, .. } => vehicle_id,
        }
    }
}

/// Single source of truth shared by engines and the API.
pub struct FleetState {
    slots: RwLock<BTreeMap<VehicleId, Arc<AsyncMutex<VehicleSlot>>>>,
    snapshot: RwLock<Arc<FleetSnapshot>>,
    pickups: RwLock<BTreeMap<PickupId, PickupPoint>>,
    orders: Mutex<BTreeMap<DeliveryId, Order>>,
    alerts: Mutex<AlertBook>,
    audit: Mutex<Vec<AuditEntry>>,
    triggers: Mutex<VecDeque<ReoptTrigger>>,
    history: Mutex<Vec<DeliveryRecord>>,
    clock: Arc<dyn Clock>,
    lease_timeout: Duration,
}

impl FleetState {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: RwLock::new(BTreeMap::new()),
            snapshot: RwLock::new(Arc::new(FleetSnapshot::default())),
            pickups: RwLock::new(BTreeMap::new()),
            orders: Mutex::new(BTreeMap::new()),
            alerts: Mutex::new(AlertBook::new()),
            audit: Mutex::new(Vec::new()),
            triggers: Mutex::new(VecDeque::new()),
            history: Mutex::new(Vec::new()),
            clock,
            lease_timeout: Duration::from_millis(250),
        }
    }

    /// How long driver events wait for a vehicle held by an engine.
    pub fn with_lease_timeout(mut self, timeout: Duration) -> Self {
        self.lease_timeout = timeout;
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    // ------------------------------------------------------------------
    // Vehicles and routes
    // ------------------------------------------------------------------

    pub fn add_vehicle(&self, vehicle: Vehicle) -> Result<(), DispatchError> {
        let slot = VehicleSlot {
            vehicle,
            route: None,
        };
        {
            let mut slots = self.slots.write();
            if slots.contains_key(&slot.vehicle.id) {
                return Err(DispatchError::InvalidRequest(format!(
                    "vehicle {} already registered",
                    slot.vehicle.id
                )));
            }
            slots.insert(slot.vehicle.id.clone(), Arc::new(AsyncMutex::new(slot.clone())));
        }
        self.publish(&slot);
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        Arc::clone(&self.snapshot.read())
    }

    fn slot(&self, vehicle_id: &str) -> Result<Arc<AsyncMutex<VehicleSlot>>, DispatchError> {
        self.slots
            .read()
            .get(vehicle_id)
            .cloned()
            .ok_or_else(|| DispatchError::NotFound {
                kind: "vehicle",
                id: vehicle_id.to_string(),
            })
    }

    /// Leases a vehicle without waiting.
    pub fn try_lease(&self, vehicle_id: &str) -> Result<VehicleLease, DispatchError> {
        let slot = self.slot(vehicle_id)?;
        slot.try_lock_owned()
            .map(|guard| VehicleLease { guard })
            .map_err(|_| DispatchError::VehicleBusy(vehicle_id.to_string()))
    }

    /// Leases a vehicle, waiting at most `timeout`.
    pub async fn lease(&self, vehicle_id: &str, timeout: Duration) -> Result<VehicleLease, DispatchError> {
        let slot = self.slot(vehicle_id)?;
        tokio::time::timeout(timeout, slot.lock_owned())
            .await
            .map(|guard| VehicleLease { guard })
            .map_err(|_| DispatchError::VehicleBusy(vehicle_id.to_string()))
    }

    /// Writes `route` to the leased vehicle after the SLA gate.
    pub fn commit_route(&self, lease: &mut VehicleLease, route: Route) -> Result<(), DispatchError> {
        if route.vehicle_id != lease.vehicle_id() {
            return Err(DispatchError::InvariantViolation {
                route_id: route.id.clone(),
                detail: format!(
                    "route for {} committed under lease of {}",
                    route.vehicle_id,
                    lease.vehicle_id()
                ),
            });
        }
        sla::ensure_committable(&route)?;
        let load = route.load();
        if load > lease.vehicle().capacity {
            return Err(DispatchError::InvariantViolation {
                route_id: route.id.clone(),
                detail: format!("load {load} exceeds capacity {}", lease.vehicle().capacity),
            });
        }

        let slot = &mut *lease.guard;
        slot.vehicle.load = load;
        if slot.vehicle.status != VehicleStatus::Offline {
            slot.vehicle.status = match route.status {
                RouteStatus::Active => VehicleStatus::EnRoute,
                _ => VehicleStatus::Assigned,
            };
        }
        debug!(vehicle_id = %slot.vehicle.id, route_id = %route.id, stops = route.stops.len(), "Route committed");
        slot.route = Some(route);
        self.publish(slot);
        Ok(())
    }

    /// Drops the leased vehicle's route and frees the vehicle.
    pub fn clear_route(&self, lease: &mut VehicleLease) {
        let slot = &mut *lease.guard;
        slot.route = None;
        slot.vehicle.load = 0;
        if slot.vehicle.status != VehicleStatus::Offline {
            slot.vehicle.status = VehicleStatus::Idle;
        }
        self.publish(slot);
    }

    fn publish(&self, slot: &VehicleSlot) {
        let mut current = self.snapshot.write();
        let next = Arc::make_mut(&mut current);
        next.vehicles.insert(slot.vehicle.id.clone(), slot.vehicle.clone());
        match &slot.route {
            Some(route) => {
                next.routes.insert(slot.vehicle.id.clone(), route.clone());
            }
            None => {
                next.routes.remove(&slot.vehicle.id);
            }
        }
        next.version += 1;
    }

    // ------------------------------------------------------------------
    // Pickups and orders
    // ------------------------------------------------------------------

    pub fn add_pickup(&self, pickup: PickupPoint) {
        self.pickups.write().insert(pickup.id.clone(), pickup);
    }

    pub fn pickups(&self) -> Vec<PickupPoint> {
        self.pickups.read().values().cloned().collect()
    }

    pub fn pickup(&self, id: &str) -> Option<PickupPoint> {
        self.pickups.read().get(id).cloned()
    }

    /// Accepts a new order as `pending`.
    pub fn submit_order(&self, delivery: DeliveryPoint) -> Result<Order, DispatchError> {
        if delivery.service_minutes < 0 {
            return Err(DispatchError::InvalidRequest(format!(
                "order {} has negative service minutes",
                delivery.id
            )));
        }
        if let Some(pid) = &delivery.pickup_id {
            if self.pickup(pid).is_none() {
                return Err(DispatchError::NotFound {
                    kind: "pickup",
                    id: pid.clone(),
                });
            }
        }
        let mut orders = self.orders.lock();
        if orders.contains_key(&delivery.id) {
            return Err(DispatchError::InvalidRequest(format!(
                "order {} already exists",
                delivery.id
            )));
        }
        let order = Order::new(delivery, self.clock.now());
        info!(order_id = %order.id(), priority = order.delivery.priority, "Order received");
        orders.insert(order.delivery.id.clone(), order.clone());
        Ok(order)
    }

    pub fn order(&self, id: &str) -> Option<Order> {
        self.orders.lock().get(id).cloned()
    }

    /// Orders in `status`, most urgent and oldest first.
    pub fn orders_with_status(&self, status: OrderStatus) -> Vec<Order> {
        let mut out: Vec<Order> = self
            .orders
            .lock()
            .values()
            .filter(|o| o.status == status)
            .cloned()
            .collect();
        out.sort_by(|a, b| {
            b.delivery
                .priority
                .cmp(&a.delivery.priority)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.id().cmp(b.id()))
        });
        out
    }

    /// Tags pending orders with their batch.
    pub fn assign_batch(&self, ids: &[DeliveryId], batch_id: Uuid) {
        let mut orders = self.orders.lock();
        for id in ids {
            if let Some(o) = orders.get_mut(id) {
                if o.status == OrderStatus::Pending {
                    o.batch_id = Some(batch_id);
                }
            }
        }
    }

    /// Releases pending orders to dispatch.
    pub fn mark_queued(&self, ids: &[DeliveryId]) -> usize {
        let mut orders = self.orders.lock();
        let mut n = 0;
        for id in ids {
            if let Some(o) = orders.get_mut(id) {
                if o.status == OrderStatus::Pending {
                    o.status = OrderStatus::Queued;
                    n += 1;
                }
            }
        }
        n
    }

    /// Binds orders to a vehicle. Returns the ids that were cancelled in the
    /// meantime and so must not stay on its route.
    pub fn mark_assigned(&self, ids: &[DeliveryId], vehicle_id: &str) -> Vec<DeliveryId> {
        let mut orders = self.orders.lock();
        let mut cancelled = Vec::new();
        for id in ids {
            if let Some(o) = orders.get_mut(id) {
                match o.status {
                    OrderStatus::Queued | OrderStatus::Assigned => {
                        o.status = OrderStatus::Assigned;
                        o.vehicle_id = Some(vehicle_id.to_string());
                    }
                    OrderStatus::Cancelled => cancelled.push(id.clone()),
                    _ => {}
                }
            }
        }
        cancelled
    }

    /// Puts orders back in the dispatch queue after a failed placement.
    pub fn return_to_queue(&self, ids: &[DeliveryId]) {
        let mut orders = self.orders.lock();
        for id in ids {
            if let Some(o) = orders.get_mut(id) {
                if matches!(o.status, OrderStatus::Queued | OrderStatus::Assigned) {
                    o.status = OrderStatus::Queued;
                    o.vehicle_id = None;
                    o.failed_attempts += 1;
                }
            }
        }
    }

    /// Queued orders that already failed at least one dispatch cycle.
    pub fn backlog(&self) -> usize {
        self.orders
            .lock()
            .values()
            .filter(|o| o.status == OrderStatus::Queued && o.failed_attempts > 0)
            .count()
    }

    // ------------------------------------------------------------------
    // Alerts, audit, triggers, history
    // ------------------------------------------------------------------

    pub fn raise_risk(&self, notice: RiskNotice) -> Option<Alert> {
        let at = self.clock.now();
        self.alerts.lock().raise_risk(notice, at)
    }

    pub fn has_open_risk(&self, route_id: &str) -> bool {
        self.alerts.lock().has_open_risk(route_id)
    }

    pub fn raise_invariant(&self, route_id: Option<String>, message: String) -> Alert {
        let at = self.clock.now();
        let alert = self.alerts.lock().raise_invariant(route_id, message, at);
        error!(alert_id = %alert.id, route_id = ?alert.route_id, message = %alert.message, "Invariant violation, operators alerted");
        alert
    }

    pub fn list_alerts(&self, resolved: Option<bool>) -> Vec<Alert> {
        self.alerts.lock().list(resolved)
    }

    pub fn resolve_alert(&self, id: Uuid, resolved_by: &str) -> Result<Alert, DispatchError> {
        let at = self.clock.now();
        self.alerts.lock().resolve(id, resolved_by, at)
    }

    pub fn record_audit(&self, entries: impl IntoIterator<Item = AuditEntry>) {
        self.audit.lock().extend(entries);
    }

    pub fn audit_log(&self) -> Vec<AuditEntry> {
        self.audit.lock().clone()
    }

    pub fn push_trigger(&self, trigger: ReoptTrigger) {
        debug!(?trigger, "Re-optimisation trigger queued");
        self.triggers.lock().push_back(trigger);
    }

    pub fn drain_triggers(&self) -> Vec<ReoptTrigger> {
        self.triggers.lock().drain(..).collect()
    }

    pub fn delivery_history(&self) -> Vec<DeliveryRecord> {
        self.history.lock().clone()
    }

    pub fn compliance(&self) -> ComplianceReport {
        sla::compliance(self.history.lock().iter())
    }

    pub fn sla_status(&self, risk_margin_minutes: i64) -> SlaStatus {
        let snapshot = self.snapshot();
        sla::sla_status(snapshot.open_routes(), self.clock.now(), risk_margin_minutes)
    }

    // ------------------------------------------------------------------
    // Driver events
    // ------------------------------------------------------------------

    /// Marks the vehicle's next open stop done at the current time.
    pub async fn complete_next_stop(&self, vehicle_id: &str) -> Result<Stop, DispatchError> {
        let mut lease = self.lease(vehicle_id, self.lease_timeout).await?;
        let at = self.clock.now();
        let slot = &mut *lease.guard;
        let route = slot.route.as_mut().ok_or_else(|| DispatchError::NotFound {
            kind: "route for vehicle",
            id: vehicle_id.to_string(),
        })?;

        let done = route.completed_count();
        let Some(stop) = route.stops.get_mut(done) else {
            return Err(DispatchError::NotFound {
                kind: "open stop for vehicle",
                id: vehicle_id.to_string(),
            });
        };
        stop.completed_at = Some(at);
        let stop = stop.clone();
        route.status = RouteStatus::Active;
        slot.vehicle.location = stop.location;

        let mut delivered = false;
        if stop.kind == StopKind::Delivery {
            slot.vehicle.load = slot.vehicle.load.saturating_sub(stop.weight);
            delivered = match self.orders.lock().get_mut(&stop.ref_id) {
                Some(order) if order.status == OrderStatus::Cancelled => {
                    warn!(vehicle_id, order_id = %stop.ref_id, "Stop passed for a cancelled order");
                    false
                }
                Some(order) => {
                    order.status = OrderStatus::Delivered;
                    true
                }
                None => true,
            };
        }
        if delivered {
            self.history.lock().push(DeliveryRecord {
                delivery_id: stop.ref_id.clone(),
                route_id: route.id.clone(),
                delivered_at: at,
                deadline: route.deadline,
            });
        }

        if route.stops.iter().all(Stop::is_completed) {
            info!(vehicle_id, route_id = %route.id, "Route completed");
            slot.route = None;
            slot.vehicle.load = 0;
            if slot.vehicle.status != VehicleStatus::Offline {
                slot.vehicle.status = VehicleStatus::Idle;
            }
        } else if slot.vehicle.status != VehicleStatus::Offline {
            slot.vehicle.status = VehicleStatus::EnRoute;
        }
        self.publish(slot);
        Ok(stop)
    }

    /// Cancels an order; an assigned stop is handed to the re-optimizer.
    pub fn cancel_order(&self, order_id: &str) -> Result<Order, DispatchError> {
        let order = {
            let mut orders = self.orders.lock();
            let order = orders.get_mut(order_id).ok_or_else(|| DispatchError::NotFound {
                kind: "order",
                id: order_id.to_string(),
            })?;
            if order.status == OrderStatus::Delivered {
                return Err(DispatchError::InvalidRequest(format!(
                    "order {order_id} already delivered"
                )));
            }
            let was = order.status;
            order.status = OrderStatus::Cancelled;
            (order.clone(), was)
        };
        let (order, was) = order;
        if was == OrderStatus::Assigned {
            if let Some(vehicle_id) = &order.vehicle_id {
                self.push_trigger(ReoptTrigger::StopCancelled {
                    vehicle_id: vehicle_id.clone(),
                    order_id: order_id.to_string(),
                });
            }
        }
        info!(order_id, previous = ?was, "Order cancelled");
        Ok(order)
    }

    /// Reports a travel-time multiplier for a vehicle's remaining legs.
    pub fn report_traffic(&self, vehicle_id: &str, factor: f64) -> Result<(), DispatchError> {
        if !factor.is_finite() || factor < 1.0 {
            return Err(DispatchError::InvalidRequest(
                "traffic factor must be at least 1.0".into(),
            ));
        }
        if !self.snapshot().routes.contains_key(vehicle_id) {
            return Err(DispatchError::NotFound {
                kind: "route for vehicle",
                id: vehicle_id.to_string(),
            });
        }
        self.push_trigger(ReoptTrigger::TrafficIncident {
            vehicle_id: vehicle_id.to_string(),
            factor,
        });
        Ok(())
    }

    pub async fn set_vehicle_status(&self, vehicle_id: &str, status: VehicleStatus) -> Result<Vehicle, DispatchError> {
        let mut lease = self.lease(vehicle_id, self.lease_timeout).await?;
        let slot = &mut *lease.guard;
        slot.vehicle.status = status;
        self.publish(slot);
        info!(vehicle_id, ?status, "Vehicle status changed");
        Ok(slot.vehicle.clone())
    }
}
