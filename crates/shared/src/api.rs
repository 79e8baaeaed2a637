//! Shared API response types used by the server and its consumers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Overall system status derived from the individual component checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SystemStatus {
    Healthy,
    /// Running on the in-memory fallback; lockouts are enforced per instance only.
    Degraded,
    Unhealthy,
}

/// Result of a single component probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

/// Liveness and latency of one dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    /// Round-trip time of the probe, absent when it timed out.
    pub latency_ms: Option<u64>,
    /// Redacted failure reason.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
}

impl ComponentHealth {
    pub fn is_up(&self) -> bool {
        self.status == ComponentStatus::Up
    }
}

/// Point-in-time health of the remote store and the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: SystemStatus,
    pub remote_store: ComponentHealth,
    pub database: ComponentHealth,
    pub fallback_mode: bool,
    pub timestamp: DateTime<Utc>,
}

/// Returned after recording a failed login attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptResult {
    pub is_locked: bool,
    pub attempts_remaining: u32,
}

impl AttemptResult {
    pub fn locked() -> Self {
        Self {
            is_locked: true,
            attempts_remaining: 0,
        }
    }
}

/// Lockout state of a single account, for admin views.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockoutStatus {
    pub locked: bool,
    pub remaining_seconds: u64,
    pub failed_attempts: u32,
}

/// Outcome of a best-effort realtime publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishResult {
    pub published: bool,
    pub fallback_mode: bool,
}

impl PublishResult {
    /// Nothing was sent; the remote store is unavailable.
    pub fn degraded() -> Self {
        Self {
            published: false,
            fallback_mode: true,
        }
    }
}
