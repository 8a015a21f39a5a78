//! Demo data generator around the Riyadh hub.
//!
//! Deterministic for a given seed:
//! - Pickup hubs at fixed districts
//! - Vehicles starting at the hubs with capacity 60-120
//! - Deliveries within roughly 5 km of their hub, weighted priorities:
//!   standard (60%), express (30%), urgent (10%)

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::domain::{Coordinate, DeliveryPoint, PickupPoint, Vehicle};
use crate::error::DispatchError;
use crate::planner::PlanRequest;
use crate::state::FleetState;

/// Riyadh city centre, the default depot.
pub const RIYADH_DEPOT: Coordinate = Coordinate {
    latitude: 24.7136,
    longitude: 46.6753,
};

/// Vehicle names using phonetic alphabet.
const VEHICLE_NAMES: [&str; 10] = [
    "Alpha", "Bravo", "Charlie", "Delta", "Echo",
    "Foxtrot", "Golf", "Hotel", "India", "Juliet",
];

struct HubData {
    id: &'static str,
    name: &'static str,
    lat: f64,
    lng: f64,
}

const RIYADH_HUBS: &[HubData] = &[
    HubData { id: "hub-central", name: "Central Hub", lat: 24.7136, lng: 46.6753 },
    HubData { id: "hub-olaya", name: "Olaya Hub", lat: 24.6948, lng: 46.6853 },
    HubData { id: "hub-malaz", name: "Al Malaz Hub", lat: 24.6662, lng: 46.7281 },
    HubData { id: "hub-kafd", name: "Financial District Hub", lat: 24.7640, lng: 46.6402 },
];

/// Delivery urgency tier.
#[derive(Clone, Copy)]
enum Tier {
    Standard,
    Express,
    Urgent,
}

impl Tier {
    fn priority(self) -> u32 {
        match self {
            Tier::Standard => 0,
            Tier::Express => 2,
            Tier::Urgent => 5,
        }
    }

    /// Weighted random selection: 60% standard, 30% express, 10% urgent.
    fn random(rng: &mut StdRng) -> Self {
        let r: u32 = rng.gen_range(1..=100);
        if r <= 60 {
            Tier::Standard
        } else if r <= 90 {
            Tier::Express
        } else {
            Tier::Urgent
        }
    }
}

/// A generated fleet with its open orders.
#[derive(Debug, Clone)]
pub struct DemoData {
    pub pickups: Vec<PickupPoint>,
    pub vehicles: Vec<Vehicle>,
    pub deliveries: Vec<DeliveryPoint>,
}

impl DemoData {
    pub fn plan_request(&self) -> PlanRequest {
        PlanRequest::new(self.pickups.clone(), self.deliveries.clone(), self.vehicles.clone())
    }

    /// Registers pickups and vehicles and submits every delivery as an order.
    pub fn load_into(&self, state: &FleetState) -> Result<(), DispatchError> {
        for pickup in &self.pickups {
            state.add_pickup(pickup.clone());
        }
        for vehicle in &self.vehicles {
            state.add_vehicle(vehicle.clone())?;
        }
        for delivery in &self.deliveries {
            state.submit_order(delivery.clone())?;
        }
        Ok(())
    }
}

/// Default demo: 6 vehicles and 40 deliveries.
///
/// ```
/// use fleet_dispatch::demo_data::generate_riyadh;
///
/// let demo = generate_riyadh();
/// assert_eq!(demo.vehicles.len(), 6);
/// assert_eq!(demo.deliveries.len(), 40);
/// assert!(demo.deliveries.iter().all(|d| d.pickup_id.is_some()));
/// ```
pub fn generate_riyadh() -> DemoData {
    generate(42, 6, 40)
}

/// Generates a seeded dataset over the Riyadh hubs.
pub fn generate(seed: u64, vehicle_count: usize, delivery_count: usize) -> DemoData {
    let mut rng = StdRng::seed_from_u64(seed);

    let pickups: Vec<PickupPoint> = RIYADH_HUBS
        .iter()
        .map(|h| PickupPoint::new(h.id, h.name, Coordinate::new(h.lat, h.lng)))
        .collect();

    let vehicles = (0..vehicle_count)
        .map(|i| {
            let hub = &pickups[i % pickups.len()];
            let name = VEHICLE_NAMES[i % VEHICLE_NAMES.len()];
            let id = if i < VEHICLE_NAMES.len() {
                name.to_string()
            } else {
                format!("{}-{}", name, i / VEHICLE_NAMES.len())
            };
            Vehicle::new(id, rng.gen_range(6..=12) * 10, hub.location)
        })
        .collect();

    let deliveries = (0..delivery_count)
        .map(|i| {
            let hub = &pickups[rng.gen_range(0..pickups.len())];
            let location = Coordinate::new(
                hub.location.latitude + rng.gen_range(-0.045..0.045),
                hub.location.longitude + rng.gen_range(-0.045..0.045),
            );
            DeliveryPoint::new(format!("ORD-{:04}", i + 1), location)
                .with_pickup(hub.id.clone())
                .with_priority(Tier::random(&mut rng).priority())
                .with_weight(rng.gen_range(1..=10))
                .with_service_minutes(rng.gen_range(3..=8))
        })
        .collect();

    DemoData {
        pickups,
        vehicles,
        deliveries,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use std::sync::Arc;

    #[test]
    fn same_seed_same_data() {
        let a = generate(7, 3, 10);
        let b = generate(7, 3, 10);
        assert_eq!(a.deliveries, b.deliveries);
        assert_eq!(a.vehicles, b.vehicles);
    }

    #[test]
    fn deliveries_stay_near_their_hub() {
        let demo = generate_riyadh();
        for d in &demo.deliveries {
            let hub = demo
                .pickups
                .iter()
                .find(|p| Some(&p.id) == d.pickup_id.as_ref())
                .unwrap();
            assert!(hub.location.distance_meters(&d.location) < 7_500.0);
        }
        assert!(RIYADH_DEPOT.distance_meters(&demo.pickups[0].location) < 1.0);
    }

    #[test]
    fn loads_into_fleet_state() {
        let demo = generate(1, 2, 5);
        let state = FleetState::new(Arc::new(SystemClock));
        demo.load_into(&state).unwrap();
        assert_eq!(state.snapshot().vehicles.len(), 2);
        assert_eq!(state.pickups().len(), RIYADH_HUBS.len());
        assert!(demo.load_into(&state).is_err());
    }
}
