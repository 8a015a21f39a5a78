//! Batching engine: groups new orders before dispatch sees them.

use async_trait::async_trait;
use chrono::Duration as Span;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

use super::Engine;
use crate::config::{BatchingSettings, DispatchConfig};
use crate::domain::{Coordinate, Order, OrderStatus, PickupId};
use crate::error::DispatchError;
use crate::state::FleetState;

/// Open batch of pending orders.
#[derive(Debug)]
struct Batch {
    pickup_id: Option<PickupId>,
    members: Vec<Order>,
}

impl Batch {
    fn centroid(&self) -> Option<Coordinate> {
        Coordinate::centroid(self.members.iter().map(|o| &o.delivery.location))
    }
}

/// Orders join a batch with the same pickup whose centroid lies within the
/// proximity radius. A batch is released when full or when its oldest
/// order reaches the age limit, whichever comes first.
pub struct BatchingEngine {
    state: Arc<FleetState>,
    settings: BatchingSettings,
    interval: Duration,
    batches_formed: AtomicU64,
    batches_released: AtomicU64,
    orders_released: AtomicU64,
}

impl BatchingEngine {
    pub fn new(state: Arc<FleetState>, config: &DispatchConfig) -> Self {
        Self {
            state,
            settings: config.batching,
            interval: Duration::from_secs(config.engines.batching_interval_secs),
            batches_formed: AtomicU64::new(0),
            batches_released: AtomicU64::new(0),
            orders_released: AtomicU64::new(0),
        }
    }

    fn place(&self, batches: &mut BTreeMap<Uuid, Batch>, order: Order) {
        let location = order.delivery.location;
        let target = batches
            .iter()
            .filter(|(_, b)| b.pickup_id == order.delivery.pickup_id && b.members.len() < self.settings.max_batch_size)
            .filter_map(|(id, b)| Some((*id, b.centroid()?.distance_meters(&location))))
            .filter(|(_, meters)| *meters <= self.settings.proximity_radius_m)
            .min_by(|a, b| a.1.total_cmp(&b.1).then_with(|| a.0.cmp(&b.0)));

        let batch_id = match target {
            Some((id, _)) => id,
            None => {
                self.batches_formed.fetch_add(1, Ordering::Relaxed);
                let id = Uuid::new_v4();
                batches.insert(
                    id,
                    Batch {
                        pickup_id: order.delivery.pickup_id.clone(),
                        members: Vec::new(),
                    },
                );
                id
            }
        };
        self.state.assign_batch(&[order.delivery.id.clone()], batch_id);
        debug!(order_id = %order.id(), %batch_id, "Order batched");
        if let Some(batch) = batches.get_mut(&batch_id) {
            batch.members.push(order);
        }
    }
}

#[async_trait]
impl Engine for BatchingEngine {
    fn name(&self) -> &'static str {
        "batching"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_cycle(&self) -> Result<(), DispatchError> {
        let mut batches: BTreeMap<Uuid, Batch> = BTreeMap::new();
        let mut fresh = Vec::new();
        for order in self.state.orders_with_status(OrderStatus::Pending) {
            let Some(id) = order.batch_id else {
                fresh.push(order);
                continue;
            };
            let pickup_id = order.delivery.pickup_id.clone();
            batches
                .entry(id)
                .or_insert_with(|| Batch {
                    pickup_id,
                    members: Vec::new(),
                })
                .members
                .push(order);
        }
        fresh.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id().cmp(b.id())));
        for order in fresh {
            self.place(&mut batches, order);
        }

        let now = self.state.now();
        let max_age = Span::seconds(self.settings.max_batch_age_secs);
        for (batch_id, batch) in &batches {
            let Some(oldest) = batch.members.iter().map(|o| o.created_at).min() else {
                continue;
            };
            let full = batch.members.len() >= self.settings.max_batch_size;
            let aged = now - oldest >= max_age;
            if !(full || aged) {
                continue;
            }
            let ids: Vec<String> = batch.members.iter().map(|o| o.delivery.id.clone()).collect();
            let released = self.state.mark_queued(&ids);
            self.batches_released.fetch_add(1, Ordering::Relaxed);
            self.orders_released.fetch_add(released as u64, Ordering::Relaxed);
            info!(%batch_id, orders = released, full, aged, pickup_id = ?batch.pickup_id, "Batch released to dispatch");
        }
        Ok(())
    }

    fn stats(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("batches_formed".to_string(), self.batches_formed.load(Ordering::Relaxed)),
            ("batches_released".to_string(), self.batches_released.load(Ordering::Relaxed)),
            ("orders_released".to_string(), self.orders_released.load(Ordering::Relaxed)),
        ])
    }
}
