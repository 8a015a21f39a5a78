//! Error taxonomy for planning and engine cycles.
//!
//! Business conditions (`NoCapacity`, `SlaUnachievable`) are surfaced to the
//! caller with the capacity that would resolve them. `SlaViolation` and
//! `ProviderTimeout` are recovered inside the planner and only appear in
//! logs. `InvariantViolation` is a logic defect and halts the offending cycle.

use serde::Serialize;
use thiserror::Error;
use utoipa::ToSchema;

/// Errors produced by the dispatch core.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum DispatchError {
    /// No vehicle can take the listed deliveries.
    #[error("no vehicle capacity for {} deliveries (need {additional_capacity} more units)", .delivery_ids.len())]
    NoCapacity {
        /// Deliveries that could not be placed.
        delivery_ids: Vec<String>,
        /// Load units that would have to be added to the fleet.
        additional_capacity: u32,
    },

    /// A proposed route breaches its deadline.
    #[error("route for vehicle {vehicle_id} arrives {overrun_minutes} min after its deadline")]
    SlaViolation {
        vehicle_id: String,
        overrun_minutes: i64,
    },

    /// The deterministic fallback cannot meet the SLA with every vehicle.
    #[error("SLA unachievable: {required_vehicles} vehicles required, {available_vehicles} available")]
    SlaUnachievable {
        required_vehicles: usize,
        available_vehicles: usize,
    },

    /// The distance provider or advisor did not answer in time.
    #[error("{service} did not respond within {timeout_ms} ms")]
    ProviderTimeout { service: String, timeout_ms: u64 },

    /// A route reached the commit gate while violating its deadline.
    #[error("invariant violated for route {route_id}: {detail}")]
    InvariantViolation { route_id: String, detail: String },

    /// Configuration rejected at load time.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Malformed planning input.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown entity.
    #[error("{kind} {id} not found")]
    NotFound { kind: &'static str, id: String },

    /// The vehicle is owned by another planning cycle.
    #[error("vehicle {0} is leased by another cycle")]
    VehicleBusy(String),
}

/// Machine-readable failure kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    NoCapacity,
    SlaViolation,
    SlaUnachievable,
    ProviderTimeout,
    InvariantViolation,
    InvalidConfig,
    InvalidRequest,
    NotFound,
    VehicleBusy,
}

/// Structured user-visible failure.
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FailureReport {
    pub kind: FailureKind,
    pub reason: String,
    /// Load units (for `NoCapacity`) or vehicles (for `SlaUnachievable`)
    /// that would resolve the failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub additional_capacity: Option<u32>,
}

impl DispatchError {
    /// Returns the failure kind.
    ///
    /// ```
    /// use fleet_dispatch::error::{DispatchError, FailureKind};
    ///
    /// let err = DispatchError::VehicleBusy("v1".into());
    /// assert_eq!(err.kind(), FailureKind::VehicleBusy);
    /// ```
    pub fn kind(&self) -> FailureKind {
        match self {
            DispatchError::NoCapacity { .. } => FailureKind::NoCapacity,
            DispatchError::SlaViolation { .. } => FailureKind::SlaViolation,
            DispatchError::SlaUnachievable { .. } => FailureKind::SlaUnachievable,
            DispatchError::ProviderTimeout { .. } => FailureKind::ProviderTimeout,
            DispatchError::InvariantViolation { .. } => FailureKind::InvariantViolation,
            DispatchError::InvalidConfig(_) => FailureKind::InvalidConfig,
            DispatchError::InvalidRequest(_) => FailureKind::InvalidRequest,
            DispatchError::NotFound { .. } => FailureKind::NotFound,
            DispatchError::VehicleBusy(_) => FailureKind::VehicleBusy,
        }
    }

    /// Builds the structured report shown to callers.
    pub fn report(&self) -> FailureReport {
        let additional_capacity = match self {
            DispatchError::NoCapacity {
                additional_capacity,
                ..
            } => Some(*additional_capacity),
            DispatchError::SlaUnachievable {
                required_vehicles,
                available_vehicles,
            } => Some(required_vehicles.saturating_sub(*available_vehicles) as u32),
            _ => None,
        };
        FailureReport {
            kind: self.kind(),
            reason: self.to_string(),
            additional_capacity,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sla_unachievable_reports_vehicle_shortfall() {
        let err = DispatchError::SlaUnachievable {
            required_vehicles: 5,
            available_vehicles: 3,
        };
        let report = err.report();
        assert_eq!(report.kind, FailureKind::SlaUnachievable);
        assert_eq!(report.additional_capacity, Some(2));
        assert!(report.reason.contains("5 vehicles required"));
    }

    #[test]
    fn no_capacity_reports_missing_units() {
        let err = DispatchError::NoCapacity {
            delivery_ids: vec!["d1".into(), "d2".into()],
            additional_capacity: 30,
        };
        let report = err.report();
        assert_eq!(report.additional_capacity, Some(30));
        assert!(report.reason.contains("2 deliveries"));
    }

    #[test]
    fn timeouts_carry_no_capacity_hint() {
        let err = DispatchError::ProviderTimeout {
            service: "advisor".into(),
            timeout_ms: 500,
        };
        assert!(err.report().additional_capacity.is_none());
    }
}
