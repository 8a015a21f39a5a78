//! Operator alerts.
//!
//! Escalation raises at most one open SLA alert per route; an operator
//! resolves it. Invariant violations raise critical alerts unconditionally.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::DispatchError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Severity for a projected slack in minutes.
    ///
    /// ```
    /// use fleet_dispatch::alerts::Severity;
    ///
    /// assert_eq!(Severity::from_minutes_to_breach(-10), Severity::Critical);
    /// assert_eq!(Severity::from_minutes_to_breach(0), Severity::Critical);
    /// assert_eq!(Severity::from_minutes_to_breach(4), Severity::High);
    /// assert_eq!(Severity::from_minutes_to_breach(9), Severity::Medium);
    /// assert_eq!(Severity::from_minutes_to_breach(12), Severity::Low);
    /// ```
    pub fn from_minutes_to_breach(minutes: i64) -> Self {
        match minutes {
            m if m <= 0 => Severity::Critical,
            m if m < 5 => Severity::High,
            m if m < 10 => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    SlaRisk,
    InvariantViolation,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: Uuid,
    pub kind: AlertKind,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub route_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vehicle_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<String>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub minutes_to_breach: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
}

impl Alert {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}

/// Everything escalation knows about an at-risk route.
#[derive(Debug, Clone)]
pub struct RiskNotice {
    pub route_id: String,
    pub vehicle_id: String,
    /// Next undelivered order on the route.
    pub order_id: Option<String>,
    pub minutes_to_breach: i64,
}

/// In-memory alert feed.
#[derive(Debug, Default)]
pub struct AlertBook {
    alerts: Vec<Alert>,
}

impl AlertBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_open_risk(&self, route_id: &str) -> bool {
        self.alerts.iter().any(|a| {
            a.is_open() && a.kind == AlertKind::SlaRisk && a.route_id.as_deref() == Some(route_id)
        })
    }

    /// Raises an SLA alert unless one is already open for the route.
    pub fn raise_risk(&mut self, notice: RiskNotice, at: DateTime<Utc>) -> Option<Alert> {
        if self.has_open_risk(&notice.route_id) {
            return None;
        }
        let severity = Severity::from_minutes_to_breach(notice.minutes_to_breach);
        let message = if notice.minutes_to_breach < 0 {
            format!(
                "Route projected {} min past its SLA deadline",
                -notice.minutes_to_breach
            )
        } else {
            format!(
                "Route projected {} min before its SLA deadline",
                notice.minutes_to_breach
            )
        };
        let alert = Alert {
            id: Uuid::new_v4(),
            kind: AlertKind::SlaRisk,
            severity,
            route_id: Some(notice.route_id),
            vehicle_id: Some(notice.vehicle_id),
            order_id: notice.order_id,
            message,
            minutes_to_breach: Some(notice.minutes_to_breach),
            created_at: at,
            resolved_at: None,
            resolved_by: None,
        };
        warn!(
            alert_id = %alert.id,
            severity = ?alert.severity,
            route_id = ?alert.route_id,
            minutes_to_breach = notice.minutes_to_breach,
            "SLA alert raised"
        );
        self.alerts.push(alert.clone());
        Some(alert)
    }

    /// Raises a critical alert for a logic defect.
    pub fn raise_invariant(&mut self, route_id: Option<String>, message: String, at: DateTime<Utc>) -> Alert {
        let alert = Alert {
            id: Uuid::new_v4(),
            kind: AlertKind::InvariantViolation,
            severity: Severity::Critical,
            route_id,
            vehicle_id: None,
            order_id: None,
            message,
            minutes_to_breach: None,
            created_at: at,
            resolved_at: None,
            resolved_by: None,
        };
        self.alerts.push(alert.clone());
        alert
    }

    /// Alerts filtered by resolution, newest first.
    pub fn list(&self, resolved: Option<bool>) -> Vec<Alert> {
        let mut out: Vec<Alert> = self
            .alerts
            .iter()
            .filter(|a| resolved.map_or(true, |r| r != a.is_open()))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Marks an alert resolved; resolving twice keeps the first resolution.
    pub fn resolve(&mut self, id: Uuid, by: &str, at: DateTime<Utc>) -> Result<Alert, DispatchError> {
        let alert = self
            .alerts
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or_else(|| DispatchError::NotFound {
                kind: "alert",
                id: id.to_string(),
            })?;
        if alert.is_open() {
            alert.resolved_at = Some(at);
            alert.resolved_by = Some(by.to_string());
            info!(alert_id = %id, resolved_by = by, "Alert resolved");
        }
        Ok(alert.clone())
    }

    pub fn open_count(&self) -> usize {
        self.alerts.iter().filter(|a| a.is_open()).count()
    }
}
