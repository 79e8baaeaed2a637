use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::redact::redact_credentials;

#[derive(Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database_url: String,
    /// `redis://` or `rediss://` (TLS).
    pub redis_url: String,
    /// Set to "production" for JSON logging, anything else for human-readable.
    #[serde(default)]
    pub env: String,
    /// Sentry DSN for error tracking
    #[serde(default)]
    pub sentry_dsn: Option<String>,

    /// PEM file with the CA that signed the Redis server certificate.
    #[serde(default)]
    pub redis_tls_ca_cert: Option<PathBuf>,
    /// PEM client certificate for mutual TLS.
    #[serde(default)]
    pub redis_tls_client_cert: Option<PathBuf>,
    /// PEM client key for mutual TLS.
    #[serde(default)]
    pub redis_tls_client_key: Option<PathBuf>,
    /// Verify the server certificate. Unset means verify.
    #[serde(default)]
    pub redis_tls_reject_unauthorized: Option<bool>,

    #[serde(default = "default_retry_base_ms")]
    pub redis_retry_base_ms: u64,
    /// Consecutive failed reconnects before switching to the in-memory store.
    #[serde(default = "default_max_retries")]
    pub redis_max_retries: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub redis_connect_timeout_ms: u64,
    #[serde(default = "default_probe_interval_secs")]
    pub fallback_probe_interval_secs: u64,
    #[serde(default = "default_sweep_interval_secs")]
    pub memory_sweep_interval_secs: u64,
    #[serde(default = "default_health_timeout_ms")]
    pub health_timeout_ms: u64,

    #[serde(default = "default_lockout_max_attempts")]
    pub lockout_max_attempts: u32,
    #[serde(default = "default_lockout_window_secs")]
    pub lockout_window_secs: u64,
    #[serde(default = "default_lockout_duration_secs")]
    pub lockout_duration_secs: u64,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    3000
}

fn default_retry_base_ms() -> u64 {
    1000
}

fn default_max_retries() -> u32 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    5000
}

fn default_probe_interval_secs() -> u64 {
    30
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_health_timeout_ms() -> u64 {
    5000
}

fn default_lockout_max_attempts() -> u32 {
    5
}

fn default_lockout_window_secs() -> u64 {
    15 * 60
}

fn default_lockout_duration_secs() -> u64 {
    30 * 60
}

impl Config {
    pub fn is_production(&self) -> bool {
        self.env == "production"
    }
}

// Connection URLs may embed passwords; keep them out of debug logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database_url", &redact_credentials(&self.database_url))
            .field("redis_url", &redact_credentials(&self.redis_url))
            .field("env", &self.env)
            .field("sentry_dsn", &self.sentry_dsn.as_ref().map(|_| "<set>"))
            .field("redis_tls_ca_cert", &self.redis_tls_ca_cert)
            .field("redis_tls_client_cert", &self.redis_tls_client_cert)
            .field("redis_tls_client_key", &self.redis_tls_client_key)
            .field(
                "redis_tls_reject_unauthorized",
                &self.redis_tls_reject_unauthorized,
            )
            .field("redis_retry_base_ms", &self.redis_retry_base_ms)
            .field("redis_max_retries", &self.redis_max_retries)
            .field("redis_connect_timeout_ms", &self.redis_connect_timeout_ms)
            .field(
                "fallback_probe_interval_secs",
                &self.fallback_probe_interval_secs,
            )
            .field("memory_sweep_interval_secs", &self.memory_sweep_interval_secs)
            .field("health_timeout_ms", &self.health_timeout_ms)
            .field("lockout_max_attempts", &self.lockout_max_attempts)
            .field("lockout_window_secs", &self.lockout_window_secs)
            .field("lockout_duration_secs", &self.lockout_duration_secs)
            .finish()
    }
}
