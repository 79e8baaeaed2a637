//! Redis implementations of the store contracts.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures_util::StreamExt;
use futures_util::stream::BoxStream;
use redis::FromRedisValue;

use super::kv::{KvBackend, PubSubTransport, StoreProbe};
use crate::connection::ConnectionManager;

/// Redis-backed [`KvBackend`] running over the shared connection.
///
/// Any failure is reported to the [`ConnectionManager`], which switches the
/// process to fallback mode and starts reconnecting.
#[derive(Clone)]
pub struct RedisBackend {
    connection: Arc<ConnectionManager>,
}

impl RedisBackend {
    pub fn new(connection: Arc<ConnectionManager>) -> Self {
        Self { connection }
    }

    async fn query<T: FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = match self.connection.connection().await {
            Ok(conn) => conn,
            Err(e) => {
                self.connection.enter_fallback().await;
                return Err(e);
            }
        };

        match cmd.query_async(&mut conn).await {
            Ok(value) => Ok(value),
            Err(e) => {
                let err = anyhow::Error::from(e);
                self.connection.handle_failure(&err).await;
                Err(err)
            }
        }
    }
}

#[async_trait]
impl KvBackend for RedisBackend {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn ping(&self) -> Result<()> {
        let pong: String = self.query(&redis::cmd("PING")).await?;
        if pong != "PONG" {
            return Err(anyhow!("unexpected PING reply: {}", pong));
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.query(redis::cmd("GET").arg(key)).await
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<()> {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl_secs {
            cmd.arg("EX").arg(ttl);
        }
        self.query(&cmd).await
    }

    async fn incr(&self, key: &str) -> Result<i64> {
        self.query(redis::cmd("INCR").arg(key)).await
    }

    async fn expire(&self, key: &str, ttl_secs: u64) -> Result<bool> {
        let updated: i64 = self.query(redis::cmd("EXPIRE").arg(key).arg(ttl_secs)).await?;
        Ok(updated == 1)
    }

    async fn del(&self, key: &str) -> Result<bool> {
        let deleted: i64 = self.query(redis::cmd("DEL").arg(key)).await?;
        Ok(deleted > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let count: i64 = self.query(redis::cmd("EXISTS").arg(key)).await?;
        Ok(count > 0)
    }

    async fn ttl(&self, key: &str) -> Result<i64> {
        self.query(redis::cmd("TTL").arg(key)).await
    }
}

#[async_trait]
impl PubSubTransport for RedisBackend {
    async fn publish(&self, channel: &str, message: &str) -> Result<u64> {
        let receivers: i64 = self
            .query(redis::cmd("PUBLISH").arg(channel).arg(message))
            .await?;
        Ok(receivers.max(0) as u64)
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        // SUBSCRIBE needs a dedicated connection; the multiplexed one is shared.
        let client = self.connection.get_client().await?;
        let mut pubsub = client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let messages = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!(channel = %msg.get_channel_name(), error = %e, "dropping undecodable message");
                    None
                }
            }
        });

        Ok(messages.boxed())
    }
}

/// Opens a fresh connection per ping, bounded by `timeout`.
#[derive(Clone)]
pub struct RedisProbe {
    client: redis::Client,
    timeout: Duration,
}

impl RedisProbe {
    pub fn new(client: redis::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }
}

#[async_trait]
impl StoreProbe for RedisProbe {
    async fn ping(&self) -> Result<()> {
        let ping = async {
            let mut conn = self.client.get_multiplexed_async_connection().await?;
            let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<_, anyhow::Error>(pong)
        };

        let pong = tokio::time::timeout(self.timeout, ping)
            .await
            .map_err(|_| anyhow!("Redis ping timed out after {}ms", self.timeout.as_millis()))??;

        if pong != "PONG" {
            return Err(anyhow!("unexpected PING reply: {}", pong));
        }
        Ok(())
    }
}
