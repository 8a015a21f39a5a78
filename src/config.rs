//! Engine configuration.
//!
//! All tunables live here, including the heuristic per-stop travel estimate
//! used by the SLA fallback. Load with [`DispatchConfig::load_from_env`] or
//! build from [`Default`] and adjust fields in code.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::DispatchError;

/// Environment variable pointing at a JSON config file.
pub const CONFIG_ENV: &str = "FLEET_DISPATCH_CONFIG";

/// Tolerance for the scoring weight sum.
const WEIGHT_EPSILON: f64 = 1e-6;

/// Weights of the composite (vehicle, delivery) assignment score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ScoringWeights {
    pub vehicle_to_pickup: f64,
    pub pickup_to_delivery: f64,
    pub cluster_density: f64,
    pub load_imbalance: f64,
    pub route_continuation: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            vehicle_to_pickup: 0.35,
            pickup_to_delivery: 0.25,
            cluster_density: 0.2,
            load_imbalance: 0.1,
            route_continuation: 0.1,
        }
    }
}

impl ScoringWeights {
    /// Rejects negative weights and sums outside 1.0 ± epsilon.
    ///
    /// ```
    /// use fleet_dispatch::config::ScoringWeights;
    ///
    /// assert!(ScoringWeights::default().validate().is_ok());
    ///
    /// let skewed = ScoringWeights { vehicle_to_pickup: 0.9, ..Default::default() };
    /// assert!(skewed.validate().is_err());
    /// ```
    pub fn validate(&self) -> Result<(), DispatchError> {
        let weights = self.as_array();
        if weights.iter().any(|w| *w < 0.0 || !w.is_finite()) {
            return Err(DispatchError::InvalidConfig(
                "scoring weights must be finite and non-negative".into(),
            ));
        }
        let sum: f64 = weights.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_EPSILON {
            return Err(DispatchError::InvalidConfig(format!(
                "scoring weights must sum to 1.0, got {sum:.6}"
            )));
        }
        Ok(())
    }

    fn as_array(&self) -> [f64; 5] {
        [
            self.vehicle_to_pickup,
            self.pickup_to_delivery,
            self.cluster_density,
            self.load_imbalance,
            self.route_continuation,
        ]
    }
}

/// Service-level settings shared by the allocator and escalation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SlaSettings {
    /// Maximum minutes from pickup to final delivery.
    pub window_minutes: i64,
    /// Per-stop service time used by the fallback formula.
    pub service_minutes_per_stop: i64,
    /// Conservative travel time per stop used by the fallback formula.
    ///
    /// Tuned heuristic; validate against observed data before relying on it.
    pub avg_travel_minutes_per_stop: i64,
    /// Routes with less slack than this are reported as at risk.
    pub risk_margin_minutes: i64,
}

impl Default for SlaSettings {
    fn default() -> Self {
        Self {
            window_minutes: 240,
            service_minutes_per_stop: 5,
            avg_travel_minutes_per_stop: 10,
            risk_margin_minutes: 15,
        }
    }
}

/// Route sequencer bounds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SequencerSettings {
    /// Maximum improving 2-opt moves per route.
    pub max_iterations: usize,
    /// Instances with at most this many deliveries use the exact assigner.
    pub exact_assignment_limit: usize,
    /// Instances above this size go to the external solver when present.
    pub large_batch_threshold: usize,
}

impl Default for SequencerSettings {
    fn default() -> Self {
        Self {
            max_iterations: 1_000,
            exact_assignment_limit: 6,
            large_batch_threshold: 500,
        }
    }
}

/// External provider settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProviderSettings {
    pub distance_timeout_ms: u64,
    pub advisor_timeout_ms: u64,
    /// Speed assumed by the straight-line estimate.
    pub fallback_speed_kmph: f64,
    /// Multiplier from straight-line to road distance.
    pub road_factor: f64,
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            distance_timeout_ms: 2_000,
            advisor_timeout_ms: 10_000,
            fallback_speed_kmph: 40.0,
            road_factor: 1.3,
        }
    }
}

impl ProviderSettings {
    pub fn distance_timeout(&self) -> Duration {
        Duration::from_millis(self.distance_timeout_ms)
    }

    pub fn advisor_timeout(&self) -> Duration {
        Duration::from_millis(self.advisor_timeout_ms)
    }
}

/// Cycle intervals of the automation engines, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EngineSettings {
    pub dispatch_interval_secs: u64,
    pub reoptimizer_interval_secs: u64,
    pub batching_interval_secs: u64,
    pub escalation_interval_secs: u64,
    /// How long `stop` waits for an in-flight cycle.
    pub stop_timeout_secs: u64,
    /// How long a cycle waits for a vehicle lease before skipping it.
    pub lease_timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: 30,
            reoptimizer_interval_secs: 45,
            batching_interval_secs: 30,
            escalation_interval_secs: 60,
            stop_timeout_secs: 30,
            lease_timeout_ms: 250,
        }
    }
}

/// Batching thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BatchingSettings {
    /// Release a batch once it holds this many orders.
    pub max_batch_size: usize,
    /// Release a batch once its oldest order is this old.
    pub max_batch_age_secs: i64,
    /// Orders farther than this from a batch centroid start a new batch.
    pub proximity_radius_m: f64,
}

impl Default for BatchingSettings {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            max_batch_age_secs: 120,
            proximity_radius_m: 3_000.0,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DispatchConfig {
    pub weights: ScoringWeights,
    pub sla: SlaSettings,
    pub sequencer: SequencerSettings,
    pub providers: ProviderSettings,
    pub engines: EngineSettings,
    pub batching: BatchingSettings,
}

impl DispatchConfig {
    /// Validates all sections.
    pub fn validate(&self) -> Result<(), DispatchError> {
        self.weights.validate()?;

        let sla = &self.sla;
        if sla.window_minutes <= 0 {
            return Err(DispatchError::InvalidConfig(
                "SLA window must be positive".into(),
            ));
        }
        if sla.service_minutes_per_stop < 0 || sla.avg_travel_minutes_per_stop < 0 {
            return Err(DispatchError::InvalidConfig(
                "per-stop minutes must not be negative".into(),
            ));
        }
        if sla.service_minutes_per_stop + sla.avg_travel_minutes_per_stop == 0 {
            return Err(DispatchError::InvalidConfig(
                "service plus travel minutes per stop must be positive".into(),
            ));
        }
        if sla.service_minutes_per_stop >= sla.window_minutes {
            return Err(DispatchError::InvalidConfig(
                "service time per stop must be shorter than the SLA window".into(),
            ));
        }
        if self.providers.fallback_speed_kmph <= 0.0 || self.providers.road_factor < 1.0 {
            return Err(DispatchError::InvalidConfig(
                "fallback speed must be positive and road factor at least 1.0".into(),
            ));
        }

        let e = &self.engines;
        let intervals = [
            e.dispatch_interval_secs,
            e.reoptimizer_interval_secs,
            e.batching_interval_secs,
            e.escalation_interval_secs,
        ];
        if intervals.contains(&0) {
            return Err(DispatchError::InvalidConfig(
                "engine intervals must be at least one second".into(),
            ));
        }
        if self.batching.max_batch_size == 0 {
            return Err(DispatchError::InvalidConfig(
                "batch size threshold must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Parses and validates a JSON document. Missing fields take defaults.
    ///
    /// ```
    /// use fleet_dispatch::config::DispatchConfig;
    ///
    /// let config = DispatchConfig::from_json(r#"{"sla": {"windowMinutes": 180}}"#).unwrap();
    /// assert_eq!(config.sla.window_minutes, 180);
    /// assert_eq!(config.sla.service_minutes_per_stop, 5);
    /// ```
    pub fn from_json(json: &str) -> Result<Self, DispatchError> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| DispatchError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads a JSON config file.
    pub fn load(path: &Path) -> Result<Self, DispatchError> {
        let data = std::fs::read_to_string(path)
            .map_err(|e| DispatchError::InvalidConfig(format!("{}: {e}", path.display())))?;
        Self::from_json(&data)
    }

    /// Loads from [`CONFIG_ENV`] if set, defaults otherwise.
    pub fn load_from_env() -> Result<Self, DispatchError> {
        match std::env::var_os(CONFIG_ENV) {
            Some(path) => {
                info!(path = ?path, "Loading dispatch configuration");
                Self::load(Path::new(&path))
            }
            None => {
                let config = Self::default();
                config.validate()?;
                Ok(config)
            }
        }
    }
}
