//! # Shared Types
//!
//! Small types shared across components that don't belong to any one
//! module: health reporting used by `server.rs`'s `/health` route and
//! by each component's own `health_check()`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Health check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Unknown,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Degraded => write!(f, "degraded"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Unknown => write!(f, "unknown"),
        }
    }
}

/// Component health information aggregated into the `/health` response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub component: String,
    pub status: HealthStatus,
    pub last_check: DateTime<Utc>,
    pub response_time_ms: u64,
    pub details: HashMap<String, String>,
}

impl ComponentHealth {
    pub fn healthy(component: impl Into<String>, response_time_ms: u64) -> Self {
        Self {
            component: component.into(),
            status: HealthStatus::Healthy,
            last_check: Utc::now(),
            response_time_ms,
            details: HashMap::new(),
        }
    }

    pub fn unhealthy(component: impl Into<String>, reason: impl Into<String>) -> Self {
        let mut details = HashMap::new();
        details.insert("reason".to_string(), reason.into());
        Self {
            component: component.into(),
            status: HealthStatus::Unhealthy,
            last_check: Utc::now(),
            response_time_ms: 0,
            details,
        }
    }
}
