//! Backend contracts shared by the remote store and the in-memory fallback.

use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::BoxStream;

/// Key/value operations the lockout service needs, with Redis semantics.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait KvBackend: Send + Sync {
    /// Short label for logs ("redis", "memory").
    fn name(&self) -> &'static str;

    /// Verify the backend answers.
    async fn ping(&self) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, replacing any previous value and expiry.
    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()>;

    /// Increment a counter, creating it at 1 if absent. Keeps the existing expiry.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Set a key's expiry. Returns false if the key does not exist.
    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool>;

    /// Returns true if the key existed.
    async fn del(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// Remaining lifetime in seconds: -2 if missing, -1 if it has no expiry.
    async fn ttl(&self, key: &str) -> Result<i64>;
}

/// Liveness check against the remote store, independent of the shared
/// connection so it can run while that connection is being rebuilt.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StoreProbe: Send + Sync {
    async fn ping(&self) -> Result<()>;
}

/// Publish/subscribe transport for realtime notifications.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PubSubTransport: Send + Sync {
    /// Returns the number of subscribers that received the message.
    async fn publish(&self, channel: &str, message: &str) -> Result<u64>;

    /// Subscribe to a channel. The stream ends when the connection drops.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}
