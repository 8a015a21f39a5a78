//! Domain model for fleet dispatch.
//!
//! # Overview
//!
//! - [`Coordinate`]s with haversine distance
//! - [`PickupPoint`]s and [`DeliveryPoint`]s supplied per request
//! - [`Vehicle`]s with capacity, position and status
//! - [`Route`]s of ordered [`Stop`]s with an SLA deadline
//! - [`Order`]s tracking a delivery through the automation engines
//!
//! # Invariant
//!
//! A route in state `planned` or `active` never has a stop arriving after
//! its deadline. [`Route::is_compliant`] checks it; only the SLA gate in
//! [`crate::sla`] may hand a route to the fleet state.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub type VehicleId = String;
pub type DeliveryId = String;
pub type PickupId = String;

/// Earth radius in meters for haversine calculation.
const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A geographic point.
///
/// # Examples
///
/// ```
/// use fleet_dispatch::domain::Coordinate;
///
/// let riyadh = Coordinate::new(24.7136, 46.6753);
/// let nearby = Coordinate::new(24.7236, 46.6853);
///
/// let meters = riyadh.distance_meters(&nearby);
/// assert!(meters > 1_400.0 && meters < 1_500.0);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Coordinate {
    /// Latitude in degrees (-90 to 90).
    pub latitude: f64,
    /// Longitude in degrees (-180 to 180).
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Great-circle distance in meters.
    pub fn distance_meters(&self, other: &Coordinate) -> f64 {
        if self == other {
            return 0.0;
        }

        let lat1 = self.latitude.to_radians();
        let lat2 = other.latitude.to_radians();
        let dlat = lat2 - lat1;
        let dlon = (other.longitude - self.longitude).to_radians();

        let a = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();

        EARTH_RADIUS_M * c
    }

    /// Mean of a set of points, `None` when empty.
    pub fn centroid<'a>(points: impl IntoIterator<Item = &'a Coordinate>) -> Option<Coordinate> {
        let (mut lat, mut lon, mut n) = (0.0, 0.0, 0usize);
        for p in points {
            lat += p.latitude;
            lon += p.longitude;
            n += 1;
        }
        (n > 0).then(|| Coordinate::new(lat / n as f64, lon / n as f64))
    }
}

/// Where parcels are collected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct PickupPoint {
    pub id: PickupId,
    pub location: Coordinate,
    pub name: String,
}

impl PickupPoint {
    pub fn new(id: impl Into<String>, name: impl Into<String>, location: Coordinate) -> Self {
        Self {
            id: id.into(),
            location,
            name: name.into(),
        }
    }
}

/// A drop-off to be served within the SLA.
///
/// # Examples
///
/// ```
/// use fleet_dispatch::domain::{Coordinate, DeliveryPoint};
///
/// let d = DeliveryPoint::new("d1", Coordinate::new(24.71, 46.67))
///     .with_priority(3)
///     .with_weight(10)
///     .with_pickup("hub");
///
/// assert_eq!(d.priority, 3);
/// assert_eq!(d.pickup_id.as_deref(), Some("hub"));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryPoint {
    pub id: DeliveryId,
    pub location: Coordinate,
    /// Higher is more urgent.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub pickup_id: Option<PickupId>,
    /// Estimated minutes spent at the stop.
    #[serde(default = "default_service_minutes")]
    pub service_minutes: i64,
    /// Load units consumed on the vehicle.
    #[serde(default = "default_weight")]
    pub weight: u32,
}

fn default_service_minutes() -> i64 {
    5
}

fn default_weight() -> u32 {
    1
}

impl DeliveryPoint {
    pub fn new(id: impl Into<String>, location: Coordinate) -> Self {
        Self {
            id: id.into(),
            location,
            priority: 0,
            pickup_id: None,
            service_minutes: default_service_minutes(),
            weight: default_weight(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_pickup(mut self, pickup_id: impl Into<String>) -> Self {
        self.pickup_id = Some(pickup_id.into());
        self
    }

    pub fn with_service_minutes(mut self, minutes: i64) -> Self {
        self.service_minutes = minutes;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = weight;
        self
    }
}

/// Vehicle availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum VehicleStatus {
    Idle,
    Assigned,
    EnRoute,
    Offline,
}

/// A delivery vehicle.
///
/// # Examples
///
/// ```
/// use fleet_dispatch::domain::{Coordinate, Vehicle, VehicleStatus};
///
/// let v = Vehicle::new("v1", 100, Coordinate::new(24.71, 46.67)).with_load(40);
/// assert_eq!(v.residual_capacity(), 60);
/// assert_eq!(v.status, VehicleStatus::Idle);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Vehicle {
    pub id: VehicleId,
    /// Maximum load units.
    pub capacity: u32,
    /// Current position.
    pub location: Coordinate,
    #[serde(default = "default_status")]
    pub status: VehicleStatus,
    /// Load already committed to the vehicle.
    #[serde(default)]
    pub load: u32,
}

fn default_status() -> VehicleStatus {
    VehicleStatus::Idle
}

impl Vehicle {
    pub fn new(id: impl Into<String>, capacity: u32, location: Coordinate) -> Self {
        Self {
            id: id.into(),
            capacity,
            location,
            status: VehicleStatus::Idle,
            load: 0,
        }
    }

    pub fn with_load(mut self, load: u32) -> Self {
        self.load = load;
        self
    }

    pub fn with_status(mut self, status: VehicleStatus) -> Self {
        self.status = status;
        self
    }

    #[inline]
    pub fn residual_capacity(&self) -> u32 {
        self.capacity.saturating_sub(self.load)
    }

    /// Offline vehicles and full vehicles cannot take work.
    #[inline]
    pub fn is_available(&self) -> bool {
        self.status != VehicleStatus::Offline && self.residual_capacity() > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum StopKind {
    Pickup,
    Delivery,
}

/// One stop of a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Stop {
    pub kind: StopKind,
    /// Pickup or delivery id.
    pub ref_id: String,
    pub location: Coordinate,
    /// Estimated arrival.
    pub arrival: DateTime<Utc>,
    pub service_minutes: i64,
    /// Priority of the delivery (0 for pickups).
    #[serde(default)]
    pub priority: u32,
    /// Load units dropped here (0 for pickups).
    #[serde(default)]
    pub weight: u32,
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Stop {
    #[inline]
    pub fn departure(&self) -> DateTime<Utc> {
        self.arrival + Duration::minutes(self.service_minutes)
    }

    #[inline]
    pub fn is_completed(&self) -> bool {
        self.completed_at.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RouteStatus {
    Planned,
    Active,
    Completed,
}

/// An ordered stop sequence for one vehicle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Route {
    pub id: String,
    pub vehicle_id: VehicleId,
    pub stops: Vec<Stop>,
    /// Pickup completion time the timeline is walked from.
    pub started_at: DateTime<Utc>,
    /// `started_at` plus the SLA window.
    pub deadline: DateTime<Utc>,
    pub distance_meters: f64,
    pub duration_minutes: i64,
    pub status: RouteStatus,
    /// Multiplier on planned travel time after a traffic report.
    #[serde(default = "default_traffic_factor")]
    pub traffic_factor: f64,
}

fn default_traffic_factor() -> f64 {
    1.0
}

impl Route {
    /// Creates an empty planned route.
    pub fn new(vehicle_id: impl Into<String>, started_at: DateTime<Utc>, deadline: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            vehicle_id: vehicle_id.into(),
            stops: Vec::new(),
            started_at,
            deadline,
            distance_meters: 0.0,
            duration_minutes: 0,
            status: RouteStatus::Planned,
            traffic_factor: default_traffic_factor(),
        }
    }

    /// Latest estimated arrival over all stops.
    pub fn last_arrival(&self) -> Option<DateTime<Utc>> {
        self.stops.iter().map(|s| s.arrival).max()
    }

    /// Seconds the latest arrival lies past the deadline, 0 if compliant.
    ///
    /// # Examples
    ///
    /// ```
    /// use chrono::{Duration, TimeZone, Utc};
    /// use fleet_dispatch::domain::{Coordinate, Route, Stop, StopKind};
    ///
    /// let start = Utc.with_ymd_and_hms(2025, 1, 5, 8, 0, 0).unwrap();
    /// let mut route = Route::new("v1", start, start + Duration::minutes(60));
    /// route.stops.push(Stop {
    ///     kind: StopKind::Delivery,
    ///     ref_id: "d1".into(),
    ///     location: Coordinate::new(0.0, 0.0),
    ///     arrival: start + Duration::minutes(75),
    ///     service_minutes: 5,
    ///     priority: 0,
    ///     weight: 1,
    ///     completed_at: None,
    /// });
    ///
    /// assert_eq!(route.overrun_seconds(), 15 * 60);
    /// assert!(!route.is_compliant());
    /// ```
    pub fn overrun_seconds(&self) -> i64 {
        self.last_arrival()
            .map_or(0, |arrival| (arrival - self.deadline).num_seconds().max(0))
    }

    /// `max(stop.arrival) <= deadline`.
    #[inline]
    pub fn is_compliant(&self) -> bool {
        self.overrun_seconds() == 0
    }

    /// Minutes between the latest arrival and the deadline (negative when late).
    pub fn slack_minutes(&self) -> i64 {
        self.last_arrival()
            .map_or((self.deadline - self.started_at).num_minutes(), |arrival| {
                (self.deadline - arrival).num_minutes()
            })
    }

    pub fn completed_count(&self) -> usize {
        self.stops.iter().take_while(|s| s.is_completed()).count()
    }

    pub fn remaining_stops(&self) -> &[Stop] {
        &self.stops[self.completed_count()..]
    }

    /// Departure from the last completed stop, or the route start.
    pub fn anchor_time(&self) -> DateTime<Utc> {
        let done = self.completed_count();
        if done == 0 {
            self.started_at
        } else {
            self.stops[done - 1].departure()
        }
    }

    /// Planned minutes from the anchor to the last remaining arrival.
    pub fn remaining_minutes(&self) -> i64 {
        match self.remaining_stops().last() {
            Some(last) => (last.arrival - self.anchor_time()).num_minutes().max(0),
            None => 0,
        }
    }

    /// Deliveries on the route, in sequence order.
    pub fn delivery_ids(&self) -> Vec<DeliveryId> {
        self.stops
            .iter()
            .filter(|s| s.kind == StopKind::Delivery)
            .map(|s| s.ref_id.clone())
            .collect()
    }

    /// Load still on board (uncompleted deliveries).
    pub fn load(&self) -> u32 {
        self.stops
            .iter()
            .filter(|s| s.kind == StopKind::Delivery && !s.is_completed())
            .fold(0u32, |acc, s| acc.saturating_add(s.weight))
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, RouteStatus::Planned | RouteStatus::Active)
    }

    /// JSON dump for fatal logs.
    pub fn dump(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{self:?}"))
    }
}

/// Lifecycle of an order inside the fleet state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Waiting for the batching engine.
    Pending,
    /// Released to dispatch (or backlogged after a failed cycle).
    Queued,
    Assigned,
    Delivered,
    Cancelled,
}

/// A delivery tracked across engine cycles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub delivery: DeliveryPoint,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<VehicleId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<Uuid>,
    /// Dispatch cycles that failed to place this order.
    #[serde(default)]
    pub failed_attempts: u32,
}

impl Order {
    pub fn new(delivery: DeliveryPoint, created_at: DateTime<Utc>) -> Self {
        Self {
            delivery,
            status: OrderStatus::Pending,
            created_at,
            vehicle_id: None,
            batch_id: None,
            failed_attempts: 0,
        }
    }

    #[inline]
    pub fn id(&self) -> &str {
        &self.delivery.id
    }
}
