//! Escalation engine: raises SLA alerts for routes projected to breach.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::Engine;
use crate::alerts::RiskNotice;
use crate::config::DispatchConfig;
use crate::domain::StopKind;
use crate::error::DispatchError;
use crate::sla;
use crate::state::FleetState;

/// Scans open routes from the snapshot; never leases a vehicle.
pub struct EscalationEngine {
    state: Arc<FleetState>,
    risk_margin_minutes: i64,
    interval: Duration,
    alerts_raised: AtomicU64,
    routes_scanned: AtomicU64,
    at_risk: AtomicU64,
}

impl EscalationEngine {
    pub fn new(state: Arc<FleetState>, config: &DispatchConfig) -> Self {
        Self {
            state,
            risk_margin_minutes: config.sla.risk_margin_minutes,
            interval: Duration::from_secs(config.engines.escalation_interval_secs),
            alerts_raised: AtomicU64::new(0),
            routes_scanned: AtomicU64::new(0),
            at_risk: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl Engine for EscalationEngine {
    fn name(&self) -> &'static str {
        "escalation"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn run_cycle(&self) -> Result<(), DispatchError> {
        let snapshot = self.state.snapshot();
        let now = self.state.now();
        let mut scanned = 0u64;
        let mut at_risk = 0u64;

        for route in snapshot.open_routes() {
            let remaining = route.remaining_stops();
            if remaining.is_empty() {
                continue;
            }
            scanned += 1;

            let projection = sla::project(route, now);
            if projection.minutes_to_breach >= self.risk_margin_minutes {
                continue;
            }
            at_risk += 1;

            let notice = RiskNotice {
                route_id: route.id.clone(),
                vehicle_id: route.vehicle_id.clone(),
                order_id: remaining
                    .iter()
                    .find(|s| s.kind == StopKind::Delivery)
                    .map(|s| s.ref_id.clone()),
                minutes_to_breach: projection.minutes_to_breach,
            };
            match self.state.raise_risk(notice) {
                Some(_) => {
                    self.alerts_raised.fetch_add(1, Ordering::Relaxed);
                }
                None => debug!(route_id = %route.id, "Risk already alerted"),
            }
        }

        self.routes_scanned.fetch_add(scanned, Ordering::Relaxed);
        self.at_risk.store(at_risk, Ordering::Relaxed);
        Ok(())
    }

    fn stats(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("alerts_raised".to_string(), self.alerts_raised.load(Ordering::Relaxed)),
            ("routes_scanned".to_string(), self.routes_scanned.load(Ordering::Relaxed)),
            ("at_risk".to_string(), self.at_risk.load(Ordering::Relaxed)),
        ])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::domain::{Coordinate, Route, Stop, Vehicle};
    use chrono::{DateTime, Duration as Minutes, TimeZone, Utc};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 8, 0, 0).unwrap()
    }

    fn stop(id: &str, minute: i64) -> Stop {
        Stop {
            kind: StopKind::Delivery,
            ref_id: id.into(),
            location: Coordinate::new(24.71, 46.68),
            arrival: t0() + Minutes::minutes(minute),
            service_minutes: 5,
            priority: 0,
            weight: 1,
            completed_at: None,
        }
    }

    fn setup() -> (Arc<ManualClock>, Arc<FleetState>, EscalationEngine) {
        let clock = Arc::new(ManualClock::new(t0()));
        let state = Arc::new(FleetState::new(clock.clone()));
        state
            .add_vehicle(Vehicle::new("v1", 10, Coordinate::new(24.70, 46.67)))
            .unwrap();
        let mut route = Route::new("v1", t0(), t0() + Minutes::minutes(240));
        route.stops = vec![stop("a", 60), stop("b", 80)];
        let mut lease = state.try_lease("v1").unwrap();
        state.commit_route(&mut lease, route).unwrap();
        drop(lease);
        let engine = EscalationEngine::new(Arc::clone(&state), &DispatchConfig::default());
        (clock, state, engine)
    }

    #[tokio::test]
    async fn healthy_route_raises_nothing() {
        let (_, state, engine) = setup();
        engine.run_cycle().await.unwrap();
        assert!(state.list_alerts(None).is_empty());
        assert_eq!(engine.stats()["routes_scanned"], 1);
    }

    #[tokio::test]
    async fn risk_inside_margin_is_alerted_once() {
        let (clock, state, engine) = setup();
        // 80 planned minutes remain; at +150 completion lands at +230.
        clock.set(t0() + Minutes::minutes(150));
        engine.run_cycle().await.unwrap();
        engine.run_cycle().await.unwrap();

        let alerts = state.list_alerts(Some(false));
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].minutes_to_breach, Some(10));
        assert_eq!(alerts[0].order_id.as_deref(), Some("a"));
        assert_eq!(alerts[0].severity, crate::alerts::Severity::Low);
        assert_eq!(engine.stats()["alerts_raised"], 1);
    }
}
