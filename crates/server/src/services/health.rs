//! System health for monitoring.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use shared::api::{ComponentHealth, ComponentStatus, HealthSnapshot, SystemStatus};
use tokio::time::Instant;

use crate::fallback::FallbackCoordinator;
use crate::redact::redact_credentials;
use crate::repos::DatabaseProbe;
use crate::stores::StoreProbe;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub struct HealthAggregator {
    store: Arc<dyn StoreProbe>,
    database: Arc<dyn DatabaseProbe>,
    fallback: Arc<FallbackCoordinator>,
    timeout: Duration,
}

impl HealthAggregator {
    pub fn new(
        store: Arc<dyn StoreProbe>,
        database: Arc<dyn DatabaseProbe>,
        fallback: Arc<FallbackCoordinator>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            database,
            fallback,
            timeout,
        }
    }

    /// Probe Redis and the database concurrently, each bounded by the
    /// configured timeout.
    pub async fn perform_health_check(&self) -> HealthSnapshot {
        let (remote_store, database) = tokio::join!(
            check(self.store.ping(), self.timeout),
            check(self.database.ping(), self.timeout),
        );
        let fallback_mode = self.fallback.is_in_fallback_mode();
        let status = derive_status(&remote_store, &database, fallback_mode);

        if status != SystemStatus::Healthy {
            tracing::warn!(
                status = ?status,
                remote_store = ?remote_store.status,
                database = ?database.status,
                fallback_mode,
                "health check not healthy"
            );
        }

        HealthSnapshot {
            status,
            remote_store,
            database,
            fallback_mode,
            timestamp: Utc::now(),
        }
    }
}

/// The database has no fallback, so losing it is fatal. Losing Redis, or
/// running in fallback mode while it recovers, only degrades.
pub fn derive_status(
    remote_store: &ComponentHealth,
    database: &ComponentHealth,
    fallback_mode: bool,
) -> SystemStatus {
    if !database.is_up() {
        SystemStatus::Unhealthy
    } else if !remote_store.is_up() || fallback_mode {
        SystemStatus::Degraded
    } else {
        SystemStatus::Healthy
    }
}

async fn check<F>(probe: F, timeout: Duration) -> ComponentHealth
where
    F: Future<Output = Result<()>>,
{
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, probe).await;
    let latency_ms = Some(started.elapsed().as_millis() as u64);

    let (status, latency_ms, error) = match outcome {
        Ok(Ok(())) => (ComponentStatus::Up, latency_ms, None),
        Ok(Err(e)) => (
            ComponentStatus::Down,
            latency_ms,
            Some(redact_credentials(&format!("{:#}", e)).into_owned()),
        ),
        Err(_) => (
            ComponentStatus::Down,
            None,
            Some(format!("timed out after {}ms", timeout.as_millis())),
        ),
    };

    ComponentHealth {
        status,
        latency_ms,
        error,
        checked_at: Utc::now(),
    }
}
