//! External optimization advisor.
//!
//! An advisor proposes a delivery partition; it is never trusted. Every
//! proposal goes through [`crate::sla::validate_proposal`] and is either
//! accepted whole or discarded.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::domain::{DeliveryId, DeliveryPoint, PickupPoint, Vehicle, VehicleId};
use crate::error::DispatchError;

/// A suggested delivery partition.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Proposal {
    pub by_vehicle: BTreeMap<VehicleId, Vec<DeliveryId>>,
    #[serde(default)]
    pub rationale: Option<String>,
}

/// Source of non-authoritative assignment suggestions.
#[async_trait]
pub trait OptimizationAdvisor: Send + Sync {
    fn name(&self) -> &str {
        "advisor"
    }

    /// Returns `Ok(None)` when the advisor has nothing to offer.
    async fn suggest(
        &self,
        pickups: &[PickupPoint],
        deliveries: &[DeliveryPoint],
        vehicles: &[Vehicle],
        sla_minutes: i64,
    ) -> Result<Option<Proposal>, DispatchError>;
}

/// Asks `advisor` for a proposal, giving up after `timeout`.
///
/// Every failure mode collapses to `None`; the caller then plans
/// deterministically.
pub async fn consult(
    advisor: &dyn OptimizationAdvisor,
    timeout: Duration,
    pickups: &[PickupPoint],
    deliveries: &[DeliveryPoint],
    vehicles: &[Vehicle],
    sla_minutes: i64,
) -> Option<Proposal> {
    let call = advisor.suggest(pickups, deliveries, vehicles, sla_minutes);
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Some(proposal))) => {
            info!(
                advisor = advisor.name(),
                vehicles = proposal.by_vehicle.len(),
                "Advisor returned a proposal"
            );
            Some(proposal)
        }
        Ok(Ok(None)) => {
            info!(advisor = advisor.name(), "Advisor unavailable");
            None
        }
        Ok(Err(e)) => {
            warn!(advisor = advisor.name(), error = %e, "Advisor failed");
            None
        }
        Err(_) => {
            let e = DispatchError::ProviderTimeout {
                service: advisor.name().to_string(),
                timeout_ms: timeout.as_millis() as u64,
            };
            warn!(advisor = advisor.name(), error = %e, "Advisor timed out");
            None
        }
    }
}
