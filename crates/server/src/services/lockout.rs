//! Failed-login tracking and account lockout.
//!
//! Each account (keyed by lowercased email) has at most one of:
//!
//! - an attempt counter, expiring one attempt window after the first failure
//! - a lockout marker, expiring after the lockout duration
//!
//! Reaching the threshold writes the marker and deletes the counter. Every
//! operation runs against Redis unless fallback mode is active or Redis
//! fails, in which case it runs against the in-memory store with the same
//! observable results.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::Utc;
use shared::api::{AttemptResult, LockoutStatus};

use crate::config::Config;
use crate::fallback::FallbackCoordinator;
use crate::redact::redact_credentials;
use crate::stores::KvBackend;

pub const MAX_FAILED_ATTEMPTS: u32 = 5;
pub const ATTEMPT_WINDOW: Duration = Duration::from_secs(15 * 60);
pub const LOCKOUT_DURATION: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockoutPolicy {
    pub max_attempts: u32,
    pub attempt_window: Duration,
    pub lockout_duration: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: MAX_FAILED_ATTEMPTS,
            attempt_window: ATTEMPT_WINDOW,
            lockout_duration: LOCKOUT_DURATION,
        }
    }
}

impl LockoutPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.lockout_max_attempts.max(1),
            attempt_window: Duration::from_secs(config.lockout_window_secs.max(1)),
            lockout_duration: Duration::from_secs(config.lockout_duration_secs.max(1)),
        }
    }
}

/// Canonical form of an email used in store keys.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

fn attempts_key(email: &str) -> String {
    format!("lockout:attempts:{}", email)
}

fn lock_key(email: &str) -> String {
    format!("lockout:locked:{}", email)
}

enum Recorded {
    AlreadyLocked,
    NowLocked,
    Counted { remaining: u32 },
}

pub struct LockoutService {
    remote: Arc<dyn KvBackend>,
    local: Arc<dyn KvBackend>,
    fallback: Arc<FallbackCoordinator>,
    policy: LockoutPolicy,
}

impl LockoutService {
    pub fn new(
        remote: Arc<dyn KvBackend>,
        local: Arc<dyn KvBackend>,
        fallback: Arc<FallbackCoordinator>,
        policy: LockoutPolicy,
    ) -> Self {
        Self {
            remote,
            local,
            fallback,
            policy,
        }
    }

    /// Count a failed login and lock the account once the threshold is hit.
    pub async fn record_failed_attempt(&self, email: &str, ip: Option<&str>) -> AttemptResult {
        let email = normalize_email(email);
        let policy = self.policy;

        let recorded = self
            .with_backend("record_failed_attempt", |backend| {
                let email = email.clone();
                async move { record_on(backend.as_ref(), &email, policy).await }
            })
            .await;

        match recorded {
            Ok(Recorded::AlreadyLocked) => {
                tracing::debug!(email = %email, ip = ?ip, "failed login on locked account");
                AttemptResult::locked()
            }
            Ok(Recorded::NowLocked) => {
                tracing::warn!(
                    email = %email,
                    ip = ?ip,
                    lockout_secs = policy.lockout_duration.as_secs(),
                    "account locked after repeated failed logins"
                );
                AttemptResult::locked()
            }
            Ok(Recorded::Counted { remaining }) => {
                tracing::debug!(email = %email, ip = ?ip, remaining, "failed login recorded");
                AttemptResult {
                    is_locked: false,
                    attempts_remaining: remaining,
                }
            }
            Err(e) => {
                log_unavailable("record_failed_attempt", &e);
                AttemptResult {
                    is_locked: false,
                    attempts_remaining: policy.max_attempts,
                }
            }
        }
    }

    pub async fn is_locked(&self, email: &str) -> bool {
        let key = lock_key(&normalize_email(email));

        self.with_backend("is_locked", |backend| {
            let key = key.clone();
            async move { backend.exists(&key).await }
        })
        .await
        .unwrap_or_else(|e| {
            log_unavailable("is_locked", &e);
            false
        })
    }

    /// Seconds until the lockout ends, 0 when the account is not locked.
    pub async fn get_remaining_lockout_time(&self, email: &str) -> u64 {
        let key = lock_key(&normalize_email(email));

        self.with_backend("get_remaining_lockout_time", |backend| {
            let key = key.clone();
            async move { backend.ttl(&key).await }
        })
        .await
        .map(|ttl| ttl.max(0) as u64)
        .unwrap_or_else(|e| {
            log_unavailable("get_remaining_lockout_time", &e);
            0
        })
    }

    pub async fn get_failed_attempt_count(&self, email: &str) -> u32 {
        let key = attempts_key(&normalize_email(email));
        let max = self.policy.max_attempts;

        self.with_backend("get_failed_attempt_count", |backend| {
            let key = key.clone();
            async move { Ok(parse_count(backend.get(&key).await?, max)) }
        })
        .await
        .unwrap_or_else(|e| {
            log_unavailable("get_failed_attempt_count", &e);
            0
        })
    }

    /// Forget failed attempts, e.g. after a successful login.
    pub async fn clear_attempts(&self, email: &str) {
        let key = attempts_key(&normalize_email(email));

        let cleared = self
            .with_backend("clear_attempts", |backend| {
                let key = key.clone();
                async move { backend.del(&key).await }
            })
            .await;

        if let Err(e) = cleared {
            log_unavailable("clear_attempts", &e);
        }
    }

    /// Lift a lockout and reset the attempt counter.
    pub async fn unlock_account(&self, email: &str) {
        let email = normalize_email(email);

        let unlocked = self
            .with_backend("unlock_account", |backend| {
                let email = email.clone();
                async move {
                    let was_locked = backend.del(&lock_key(&email)).await?;
                    backend.del(&attempts_key(&email)).await?;
                    Ok(was_locked)
                }
            })
            .await;

        match unlocked {
            Ok(true) => tracing::info!(email = %email, "account unlocked"),
            Ok(false) => {}
            Err(e) => log_unavailable("unlock_account", &e),
        }
    }

    /// Lock state, remaining time and attempt count in one read.
    pub async fn status(&self, email: &str) -> LockoutStatus {
        let email = normalize_email(email);
        let max = self.policy.max_attempts;

        self.with_backend("status", |backend| {
            let email = email.clone();
            async move {
                let ttl = backend.ttl(&lock_key(&email)).await?;
                let attempts = backend.get(&attempts_key(&email)).await?;
                Ok(LockoutStatus {
                    locked: ttl != -2,
                    remaining_seconds: ttl.max(0) as u64,
                    failed_attempts: parse_count(attempts, max),
                })
            }
        })
        .await
        .unwrap_or_else(|e| {
            log_unavailable("status", &e);
            LockoutStatus {
                locked: false,
                remaining_seconds: 0,
                failed_attempts: 0,
            }
        })
    }

    /// Run `op` on Redis when it is usable, otherwise (or when it fails) on
    /// the in-memory store.
    async fn with_backend<T, F, Fut>(&self, operation: &'static str, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn KvBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(remote) = self.usable_remote(operation).await {
            match op(remote).await {
                Ok(value) => return Ok(value),
                Err(e) => {
                    tracing::warn!(
                        operation,
                        error = %redact_credentials(&format!("{:#}", e)),
                        "remote store failed, retrying on in-memory store"
                    );
                    self.fallback.activate_fallback();
                }
            }
        }

        op(Arc::clone(&self.local)).await
    }

    async fn usable_remote(&self, operation: &'static str) -> Option<Arc<dyn KvBackend>> {
        if self.fallback.is_in_fallback_mode() {
            return None;
        }

        match self.remote.ping().await {
            Ok(()) => Some(Arc::clone(&self.remote)),
            Err(e) => {
                tracing::warn!(
                    operation,
                    error = %redact_credentials(&format!("{:#}", e)),
                    "remote store ping failed, using in-memory store"
                );
                self.fallback.activate_fallback();
                None
            }
        }
    }
}

async fn record_on(backend: &dyn KvBackend, email: &str, policy: LockoutPolicy) -> Result<Recorded> {
    let lock_key = lock_key(email);
    if backend.exists(&lock_key).await? {
        return Ok(Recorded::AlreadyLocked);
    }

    let attempts_key = attempts_key(email);
    let max = i64::from(policy.max_attempts);
    let count = backend.incr(&attempts_key).await?;

    // Only the first failure starts the window.
    if count == 1 {
        backend
            .expire(&attempts_key, policy.attempt_window.as_secs())
            .await?;
    }

    if count >= max {
        let locked_at = Utc::now().timestamp().to_string();
        backend
            .set(&lock_key, &locked_at, Some(policy.lockout_duration.as_secs()))
            .await?;
        backend.del(&attempts_key).await?;
        return Ok(Recorded::NowLocked);
    }

    // A concurrent attempt may have locked the account after our first
    // check; its counter delete could then predate our increment.
    if backend.exists(&lock_key).await? {
        backend.del(&attempts_key).await?;
        return Ok(Recorded::AlreadyLocked);
    }

    Ok(Recorded::Counted {
        remaining: (max - count).clamp(0, max) as u32,
    })
}

fn parse_count(value: Option<String>, max: u32) -> u32 {
    value
        .and_then(|v| v.parse::<i64>().ok())
        .map(|count| count.clamp(0, i64::from(max)) as u32)
        .unwrap_or(0)
}

fn log_unavailable(operation: &'static str, err: &anyhow::Error) {
    tracing::error!(
        operation,
        error = %redact_credentials(&format!("{:#}", err)),
        "lockout store unavailable"
    );
}
