use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::{
    config::Config,
    connection::{ConnectionManager, ConnectionState, RedisSettings},
    fallback::FallbackCoordinator,
    repos::DatabaseProbe,
    services::{HealthAggregator, LockoutPolicy, LockoutService, NotificationGateway},
    stores::{RedisBackend, RedisProbe, TtlStore},
};

#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Config,
    /// Degraded-mode flag shared by every component.
    pub fallback: Arc<FallbackCoordinator>,
    /// Shared Redis connection.
    pub connection: Arc<ConnectionManager>,
    /// Per-process store used while Redis is unavailable.
    pub memory: Arc<TtlStore>,
    pub lockout: Arc<LockoutService>,
    pub notifications: Arc<NotificationGateway>,
    pub health: Arc<HealthAggregator>,
}

impl AppState {
    /// Wire the resilience layer. Nothing is contacted yet; call
    /// [`start`](Self::start) to connect and begin background work.
    pub fn build(config: Config, database: Arc<dyn DatabaseProbe>) -> Result<Self> {
        let settings = RedisSettings::from_config(&config);
        let probe_client = settings
            .build_client()
            .context("failed to build Redis client")?;
        let store_probe = Arc::new(RedisProbe::new(
            probe_client,
            settings.connect_timeout,
        ));

        let fallback = FallbackCoordinator::new(
            store_probe.clone(),
            Duration::from_secs(config.fallback_probe_interval_secs.max(1)),
        );
        let connection = ConnectionManager::new(settings, Arc::clone(&fallback));
        let remote = Arc::new(RedisBackend::new(Arc::clone(&connection)));
        let memory = Arc::new(TtlStore::new());

        let lockout = LockoutService::new(
            remote.clone(),
            memory.clone(),
            Arc::clone(&fallback),
            LockoutPolicy::from_config(&config),
        );
        let notifications = NotificationGateway::new(remote, Arc::clone(&fallback));
        let health = HealthAggregator::new(
            store_probe,
            database,
            Arc::clone(&fallback),
            Duration::from_millis(config.health_timeout_ms),
        );

        Ok(Self {
            config,
            fallback,
            connection,
            memory,
            lockout: Arc::new(lockout),
            notifications: Arc::new(notifications),
            health: Arc::new(health),
        })
    }

    /// Start the sweep and connect to Redis in the background.
    pub fn start(&self) {
        self.memory
            .start_sweep(Duration::from_secs(self.config.memory_sweep_interval_secs.max(1)));

        // Handles are dropped on purpose: these observers live as long as
        // the process.
        let _ = self.connection.on_connection_change(|state| match state {
            ConnectionState::Connected => tracing::info!("redis connected"),
            other => tracing::warn!(state = ?other, "redis connection lost"),
        });
        let _ = self
            .fallback
            .on_fallback_activated(|| tracing::warn!("fallback mode activated, using in-memory store"));
        let _ = self
            .fallback
            .on_fallback_deactivated(|| tracing::info!("fallback mode deactivated, redis restored"));

        let connection = Arc::clone(&self.connection);
        tokio::spawn(async move { connection.connect().await });
    }

    /// Stop the probe loop, then the retry loop, then the sweep.
    pub async fn shutdown(&self) {
        self.fallback.shutdown();
        self.connection.shutdown().await;
        self.memory.destroy();
        tracing::info!("resilience layer stopped");
    }
}
