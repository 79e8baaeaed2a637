//! Connection management for the remote store.
//!
//! [`ConnectionManager`] owns the single multiplexed Redis connection of the
//! process. It tracks the connection state, reconnects with a growing but
//! capped delay, and hands control to the [`FallbackCoordinator`]
//! when Redis stays unreachable.
//!
//! ## State transitions
//!
//! ```text
//! disconnected ─connect()─▶ connecting ─ok─▶ connected
//!                               │                 │
//!                               └─err─▶ error ◀───┘ (operation failure)
//!                                         │
//!                                   retry loop (min(n * base, 30s))
//!                                         │
//!                        n >= max_retries ▶ activate fallback
//! ```
//!
//! Observers registered with [`ConnectionManager::on_connection_change`] are
//! only notified when the state crosses between connected and not
//! connected.

mod tls;

pub use tls::{TlsOptions, build_client, is_tls_certificate_error, is_tls_connection};

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use anyhow::{Result, anyhow};
use redis::aio::MultiplexedConnection;
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::fallback::FallbackCoordinator;
use crate::observer::{Observers, Subscription};
use crate::redact::redact_credentials;

/// Upper bound for the delay between reconnect attempts.
pub const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Lower bound for the configured retry base; a zero base would spin.
pub const MIN_RETRY_BASE: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == ConnectionState::Connected
    }
}

/// Connection settings derived from [`Config`].
#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub url: String,
    pub tls: TlsOptions,
    pub retry_base: Duration,
    pub max_retries: u32,
    pub connect_timeout: Duration,
}

impl RedisSettings {
    pub fn from_config(config: &Config) -> Self {
        let reject_unauthorized = config.redis_tls_reject_unauthorized.unwrap_or(true);
        if !reject_unauthorized && config.is_production() && is_tls_connection(&config.redis_url)
        {
            tracing::warn!(
                "REDIS_TLS_REJECT_UNAUTHORIZED=false in production; server certificates will not be verified"
            );
        }

        Self {
            url: config.redis_url.clone(),
            tls: TlsOptions {
                reject_unauthorized,
                ca_cert: config.redis_tls_ca_cert.clone(),
                client_cert: config.redis_tls_client_cert.clone(),
                client_key: config.redis_tls_client_key.clone(),
            },
            retry_base: Duration::from_millis(config.redis_retry_base_ms).max(MIN_RETRY_BASE),
            max_retries: config.redis_max_retries,
            connect_timeout: Duration::from_millis(config.redis_connect_timeout_ms),
        }
    }

    pub fn build_client(&self) -> Result<redis::Client> {
        build_client(&self.url, &self.tls)
    }
}

/// Delay before reconnect attempt `attempt` (1-based): `min(attempt * base, 30s)`.
pub fn retry_delay(attempt: u32, base: Duration) -> Duration {
    base.saturating_mul(attempt.max(1)).min(MAX_RETRY_DELAY)
}

/// Outcome of [`ConnectionManager::execute_with_fallback`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FallbackOutcome<T> {
    pub success: bool,
    pub result: Option<T>,
    pub used_fallback: bool,
}

impl<T> FallbackOutcome<T> {
    fn succeeded(result: T) -> Self {
        Self {
            success: true,
            result: Some(result),
            used_fallback: false,
        }
    }

    fn fell_back() -> Self {
        Self {
            success: false,
            result: None,
            used_fallback: true,
        }
    }
}

struct Status {
    state: ConnectionState,
    last_error: Option<String>,
}

pub struct ConnectionManager {
    me: Weak<ConnectionManager>,
    settings: RedisSettings,
    fallback: Arc<FallbackCoordinator>,
    client: OnceCell<redis::Client>,
    connection: tokio::sync::Mutex<Option<MultiplexedConnection>>,
    status: Mutex<Status>,
    observers: Observers<ConnectionState>,
    retry: Mutex<Option<CancellationToken>>,
    fallback_subscription: Mutex<Option<Subscription>>,
}

impl ConnectionManager {
    pub fn new(settings: RedisSettings, fallback: Arc<FallbackCoordinator>) -> Arc<Self> {
        let manager = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            settings,
            fallback: Arc::clone(&fallback),
            client: OnceCell::new(),
            connection: tokio::sync::Mutex::new(None),
            status: Mutex::new(Status {
                state: ConnectionState::Disconnected,
                last_error: None,
            }),
            observers: Observers::new(),
            retry: Mutex::new(None),
            fallback_subscription: Mutex::new(None),
        });

        // Whoever ends degraded mode, the retry timer is no longer needed.
        let weak = Arc::downgrade(&manager);
        let subscription = fallback.on_fallback_deactivated(move || {
            if let Some(manager) = weak.upgrade() {
                manager.stop_retry();
            }
        });
        *lock(&manager.fallback_subscription) = Some(subscription);

        manager
    }

    /// The Redis client, built on first use.
    pub async fn get_client(&self) -> Result<redis::Client> {
        self.client
            .get_or_try_init(|| async { self.settings.build_client() })
            .await
            .cloned()
    }

    /// Establish the initial connection. On failure the retry loop takes over.
    pub async fn connect(&self) {
        match self.connection().await {
            Ok(_) => tracing::info!("connected to Redis"),
            Err(_) => self.start_retry(),
        }
    }

    /// The shared connection, connecting first if necessary.
    pub async fn connection(&self) -> Result<MultiplexedConnection> {
        let mut cached = self.connection.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }

        let client = match self.get_client().await {
            Ok(client) => client,
            Err(e) => {
                self.record_error(&e);
                return Err(e);
            }
        };

        self.set_state(ConnectionState::Connecting);
        let connected = tokio::time::timeout(
            self.settings.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await;

        match connected {
            Ok(Ok(conn)) => {
                *cached = Some(conn.clone());
                drop(cached);
                self.mark_connected();
                Ok(conn)
            }
            Ok(Err(e)) => {
                let err = anyhow::Error::from(e);
                self.record_error(&err);
                Err(err)
            }
            Err(_) => {
                let err = anyhow!(
                    "connection timed out after {}ms",
                    self.settings.connect_timeout.as_millis()
                );
                self.record_error(&err);
                Err(err)
            }
        }
    }

    /// Register a callback for connected/not-connected transitions.
    pub fn on_connection_change<F>(&self, callback: F) -> Subscription
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        self.observers.subscribe(move |state: &ConnectionState| callback(*state))
    }

    /// Run `op` against Redis, switching to fallback mode instead of failing.
    ///
    /// While fallback mode is active the operation is not attempted.
    pub async fn execute_with_fallback<T, F, Fut>(&self, op: F) -> FallbackOutcome<T>
    where
        F: FnOnce(MultiplexedConnection) -> Fut,
        Fut: Future<Output = redis::RedisResult<T>>,
    {
        if self.fallback.is_in_fallback_mode() {
            return FallbackOutcome::fell_back();
        }

        let conn = match self.connection().await {
            Ok(conn) => conn,
            Err(_) => {
                self.enter_fallback().await;
                return FallbackOutcome::fell_back();
            }
        };

        match op(conn).await {
            Ok(result) => FallbackOutcome::succeeded(result),
            Err(e) => {
                self.handle_failure(&anyhow::Error::from(e)).await;
                FallbackOutcome::fell_back()
            }
        }
    }

    /// Report an unexpected Redis failure: log it (redacted), drop the
    /// connection, activate fallback mode and start reconnecting.
    pub async fn handle_failure(&self, err: &anyhow::Error) {
        self.record_error(err);
        self.enter_fallback().await;
    }

    /// Drop the connection, activate fallback mode and start reconnecting.
    /// The failure is expected to have been recorded already.
    pub async fn enter_fallback(&self) {
        self.connection.lock().await.take();
        self.fallback.activate_fallback();
        self.start_retry();
    }

    pub fn state(&self) -> ConnectionState {
        lock(&self.status).state
    }

    /// The most recent error, with credentials redacted.
    pub fn last_error(&self) -> Option<String> {
        lock(&self.status).last_error.clone()
    }

    pub fn is_retrying(&self) -> bool {
        lock(&self.retry)
            .as_ref()
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Stop reconnecting and drop the connection.
    pub async fn shutdown(&self) {
        self.stop_retry();
        if let Some(subscription) = lock(&self.fallback_subscription).take() {
            subscription.unsubscribe();
        }
        self.connection.lock().await.take();
        self.set_state(ConnectionState::Disconnected);
    }

    fn start_retry(&self) {
        let mut retry = lock(&self.retry);
        if retry.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!("no async runtime available, Redis reconnect loop not started");
            return;
        };

        let token = CancellationToken::new();
        *retry = Some(token.clone());
        runtime.spawn(async move { manager.retry_loop(token).await });
    }

    fn stop_retry(&self) {
        if let Some(token) = lock(&self.retry).take() {
            token.cancel();
            tracing::debug!("Redis reconnect loop stopped");
        }
    }

    async fn retry_loop(&self, token: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            attempt = attempt.saturating_add(1);
            let delay = retry_delay(attempt, self.settings.retry_base);
            tracing::debug!(attempt, delay_ms = delay.as_millis() as u64, "reconnecting to Redis");

            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = self.connection() => result,
            };

            match result {
                Ok(_) => {
                    tracing::info!(attempt, "Redis connection re-established");
                    return;
                }
                Err(_) if attempt >= self.settings.max_retries => {
                    if self.fallback.activate_fallback() {
                        tracing::warn!(
                            attempts = attempt,
                            "Redis unreachable after retries, using in-memory fallback"
                        );
                    }
                }
                Err(_) => {}
            }
        }
    }

    fn mark_connected(&self) {
        lock(&self.status).last_error = None;
        self.set_state(ConnectionState::Connected);
        self.stop_retry();
        if self.fallback.is_in_fallback_mode() {
            self.fallback.deactivate_fallback();
        }
    }

    fn record_error(&self, err: &anyhow::Error) {
        let message = redact_credentials(&format!("{:#}", err)).into_owned();

        if is_tls_certificate_error(&message) {
            tracing::error!(
                error = %message,
                "Redis TLS certificate verification failed; check REDIS_TLS_CA_CERT and the server certificate"
            );
            sentry::capture_message(
                &format!("Redis TLS certificate error: {}", message),
                sentry::Level::Warning,
            );
        } else {
            tracing::warn!(error = %message, "Redis connection error");
        }

        lock(&self.status).last_error = Some(message);
        self.set_state(ConnectionState::Error);
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = {
            let mut status = lock(&self.status);
            std::mem::replace(&mut status.state, next)
        };

        if previous != next {
            tracing::debug!(from = ?previous, to = ?next, "Redis connection state changed");
        }
        if previous.is_connected() != next.is_connected() {
            self.observers.notify(&next);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
