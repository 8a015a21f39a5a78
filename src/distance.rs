//! Point-to-point travel distance and duration.
//!
//! The road network is an external collaborator behind [`DistanceProvider`].
//! [`CachingDistanceProvider`] memoises answers per coordinate pair, bounds
//! every call with a timeout and substitutes a [`HaversineProvider`] estimate
//! when the provider is slow or down. Estimates are flagged so a plan can
//! report how many legs were not road-routed.

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::RwLock;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use utoipa::ToSchema;

use crate::config::ProviderSettings;
use crate::domain::{Coordinate, DeliveryId, PickupId, VehicleId};
use crate::error::DispatchError;

/// Distance and travel time of one leg.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, ToSchema)]
pub struct DistanceEstimate {
    pub meters: f64,
    pub seconds: i64,
    /// `true` when derived from straight-line distance instead of roads.
    pub estimated: bool,
}

impl DistanceEstimate {
    pub const ZERO: DistanceEstimate = DistanceEstimate {
        meters: 0.0,
        seconds: 0,
        estimated: false,
    };
}

/// Source of point-to-point travel estimates.
#[async_trait]
pub trait DistanceProvider: Send + Sync {
    async fn distance_duration(
        &self,
        from: Coordinate,
        to: Coordinate,
    ) -> Result<DistanceEstimate, DispatchError>;

    /// Name used in logs and timeout errors.
    fn name(&self) -> &str {
        "distance provider"
    }
}

/// Straight-line estimate at a conservative urban speed.
///
/// # Examples
///
/// ```
/// use fleet_dispatch::distance::HaversineProvider;
/// use fleet_dispatch::domain::Coordinate;
///
/// let provider = HaversineProvider::new(40.0, 1.0);
/// let leg = provider.estimate(Coordinate::new(0.0, 0.0), Coordinate::new(0.0, 0.01));
///
/// assert!(leg.estimated);
/// // ~1.1 km at 40 km/h is about 100 seconds
/// assert!((90..=110).contains(&leg.seconds));
/// ```
#[derive(Debug, Clone, Copy)]
pub struct HaversineProvider {
    speed_mps: f64,
    road_factor: f64,
}

impl HaversineProvider {
    pub fn new(speed_kmph: f64, road_factor: f64) -> Self {
        Self {
            speed_mps: speed_kmph * 1000.0 / 3600.0,
            road_factor,
        }
    }

    pub fn from_settings(settings: &ProviderSettings) -> Self {
        Self::new(settings.fallback_speed_kmph, settings.road_factor)
    }

    pub fn estimate(&self, from: Coordinate, to: Coordinate) -> DistanceEstimate {
        let meters = from.distance_meters(&to) * self.road_factor;
        DistanceEstimate {
            meters,
            seconds: (meters / self.speed_mps).round() as i64,
            estimated: true,
        }
    }
}

impl Default for HaversineProvider {
    fn default() -> Self {
        Self::from_settings(&ProviderSettings::default())
    }
}

#[async_trait]
impl DistanceProvider for HaversineProvider {
    async fn distance_duration(
        &self,
        from: Coordinate,
        to: Coordinate,
    ) -> Result<DistanceEstimate, DispatchError> {
        Ok(self.estimate(from, to))
    }

    fn name(&self) -> &str {
        "haversine"
    }
}

/// Real distances with a constant travel time per leg.
///
/// Used for deterministic fixtures where stop timing must be exact.
#[derive(Debug, Clone, Copy)]
pub struct FixedDistanceProvider {
    pub seconds_per_leg: i64,
}

impl FixedDistanceProvider {
    pub fn minutes(minutes: i64) -> Self {
        Self {
            seconds_per_leg: minutes * 60,
        }
    }
}

#[async_trait]
impl DistanceProvider for FixedDistanceProvider {
    async fn distance_duration(
        &self,
        from: Coordinate,
        to: Coordinate,
    ) -> Result<DistanceEstimate, DispatchError> {
        if from == to {
            return Ok(DistanceEstimate::ZERO);
        }
        Ok(DistanceEstimate {
            meters: from.distance_meters(&to),
            seconds: self.seconds_per_leg,
            estimated: false,
        })
    }

    fn name(&self) -> &str {
        "fixed"
    }
}

/// Coordinates rounded to 7 decimals.
type CoordKey = (i64, i64);

fn coord_key(c: &Coordinate) -> CoordKey {
    (
        (c.latitude * 1e7).round() as i64,
        (c.longitude * 1e7).round() as i64,
    )
}

/// Timeout, cache and straight-line fallback around any provider.
pub struct CachingDistanceProvider {
    inner: Arc<dyn DistanceProvider>,
    fallback: HaversineProvider,
    timeout: Duration,
    cache: RwLock<HashMap<(CoordKey, CoordKey), DistanceEstimate>>,
}

impl CachingDistanceProvider {
    pub fn new(inner: Arc<dyn DistanceProvider>, settings: &ProviderSettings) -> Self {
        Self {
            inner,
            fallback: HaversineProvider::from_settings(settings),
            timeout: settings.distance_timeout(),
            cache: RwLock::new(HashMap::new()),
        }
    }

    pub fn cached_pairs(&self) -> usize {
        self.cache.read().len()
    }

    async fn fetch(&self, from: Coordinate, to: Coordinate) -> Result<DistanceEstimate, DispatchError> {
        match tokio::time::timeout(self.timeout, self.inner.distance_duration(from, to)).await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::ProviderTimeout {
                service: self.inner.name().to_string(),
                timeout_ms: self.timeout.as_millis() as u64,
            }),
        }
    }
}

#[async_trait]
impl DistanceProvider for CachingDistanceProvider {
    async fn distance_duration(
        &self,
        from: Coordinate,
        to: Coordinate,
    ) -> Result<DistanceEstimate, DispatchError> {
        let key = (coord_key(&from), coord_key(&to));

        let cached = self.cache.read().get(&key).copied();
        if let Some(hit) = cached {
            return Ok(hit);
        }

        match self.fetch(from, to).await {
            Ok(leg) => {
                // Another task may have filled the slot while we were waiting.
                let mut cache = self.cache.write();
                Ok(*cache.entry(key).or_insert(leg))
            }
            Err(e) => {
                warn!(provider = self.inner.name(), error = %e, "Falling back to straight-line estimate");
                Ok(self.fallback.estimate(from, to))
            }
        }
    }

    fn name(&self) -> &str {
        self.inner.name()
    }
}

/// Identity of a planning point.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PointRef {
    Vehicle(VehicleId),
    Pickup(PickupId),
    Delivery(DeliveryId),
}

/// Square travel matrix over the points of one planning cycle.
#[derive(Debug, Clone)]
pub struct DistanceMatrix {
    index: HashMap<PointRef, usize>,
    meters: Vec<Vec<f64>>,
    seconds: Vec<Vec<i64>>,
    estimated_legs: usize,
}

impl DistanceMatrix {
    /// Queries every ordered pair through `provider` concurrently.
    ///
    /// Duplicate refs keep their first coordinate.
    pub async fn build(
        provider: &dyn DistanceProvider,
        points: &[(PointRef, Coordinate)],
    ) -> Result<Self, DispatchError> {
        let (index, coords) = dedup(points);
        let n = coords.len();

        let legs = join_all((0..n).flat_map(|i| (0..n).map(move |j| (i, j))).map(|(i, j)| {
            let (from, to) = (coords[i], coords[j]);
            async move {
                if i == j {
                    Ok(DistanceEstimate::ZERO)
                } else {
                    provider.distance_duration(from, to).await
                }
            }
        }))
        .await;

        let mut matrix = Self::empty(index, n);
        for (k, leg) in legs.into_iter().enumerate() {
            let leg = leg?;
            matrix.set(k / n, k % n, leg);
        }
        debug!(points = n, estimated = matrix.estimated_legs, "Distance matrix built");
        Ok(matrix)
    }

    /// Straight-line matrix computed in parallel, used for large batches.
    pub fn haversine(provider: &HaversineProvider, points: &[(PointRef, Coordinate)]) -> Self {
        let (index, coords) = dedup(points);
        let n = coords.len();

        let rows: Vec<Vec<DistanceEstimate>> = (0..n)
            .into_par_iter()
            .map(|i| {
                (0..n)
                    .map(|j| {
                        if i == j {
                            DistanceEstimate::ZERO
                        } else {
                            provider.estimate(coords[i], coords[j])
                        }
                    })
                    .collect()
            })
            .collect();

        let mut matrix = Self::empty(index, n);
        for (i, row) in rows.into_iter().enumerate() {
            for (j, leg) in row.into_iter().enumerate() {
                matrix.set(i, j, leg);
            }
        }
        matrix
    }

    fn empty(index: HashMap<PointRef, usize>, n: usize) -> Self {
        Self {
            index,
            meters: vec![vec![0.0; n]; n],
            seconds: vec![vec![0; n]; n],
            estimated_legs: 0,
        }
    }

    fn set(&mut self, i: usize, j: usize, leg: DistanceEstimate) {
        self.meters[i][j] = leg.meters;
        self.seconds[i][j] = leg.seconds;
        if leg.estimated {
            self.estimated_legs += 1;
        }
    }

    pub fn len(&self) -> usize {
        self.meters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    /// Legs answered by the straight-line fallback.
    pub fn estimated_legs(&self) -> usize {
        self.estimated_legs
    }

    pub fn index_of(&self, point: &PointRef) -> Option<usize> {
        self.index.get(point).copied()
    }

    /// Like [`index_of`](Self::index_of) but fails for unknown points.
    pub fn require(&self, point: &PointRef) -> Result<usize, DispatchError> {
        self.index_of(point).ok_or_else(|| DispatchError::NotFound {
            kind: "planning point",
            id: format!("{point:?}"),
        })
    }

    #[inline]
    pub fn meters(&self, from: usize, to: usize) -> f64 {
        self.meters[from][to]
    }

    #[inline]
    pub fn seconds(&self, from: usize, to: usize) -> i64 {
        self.seconds[from][to]
    }

    /// Travel seconds with a traffic delay factor applied.
    #[inline]
    pub fn seconds_with_traffic(&self, from: usize, to: usize, factor: f64) -> i64 {
        (self.seconds[from][to] as f64 * factor.max(1.0)).round() as i64
    }
}

fn dedup(points: &[(PointRef, Coordinate)]) -> (HashMap<PointRef, usize>, Vec<Coordinate>) {
    let mut index = HashMap::with_capacity(points.len());
    let mut coords = Vec::with_capacity(points.len());
    for (point, coord) in points {
        if !index.contains_key(point) {
            index.insert(point.clone(), coords.len());
            coords.push(*coord);
        }
    }
    (index, coords)
}
