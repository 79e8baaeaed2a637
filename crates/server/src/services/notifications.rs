//! Best-effort realtime notifications over Redis pub/sub.
//!
//! Publishing is a side channel: a failed publish is logged and reported in
//! the returned [`PublishResult`], never raised, so the operation that
//! triggered it (a task move, a comment) always completes.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::StreamExt;
use serde::Serialize;
use serde::de::DeserializeOwned;
use shared::api::PublishResult;
use shared::events::{BoardEvent, BoardMessage, UserNotification, board_channel, user_channel};
use tokio_util::sync::CancellationToken;

use crate::fallback::FallbackCoordinator;
use crate::observer::Subscription;
use crate::redact::redact_credentials;
use crate::stores::PubSubTransport;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);

pub struct NotificationGateway {
    transport: Arc<dyn PubSubTransport>,
    fallback: Arc<FallbackCoordinator>,
}

impl NotificationGateway {
    pub fn new(transport: Arc<dyn PubSubTransport>, fallback: Arc<FallbackCoordinator>) -> Self {
        Self {
            transport,
            fallback,
        }
    }

    pub async fn publish(&self, channel: &str, message: &str) -> PublishResult {
        if self.fallback.is_in_fallback_mode() {
            tracing::debug!(channel, "fallback mode active, skipping publish");
            return PublishResult::degraded();
        }

        match self.transport.publish(channel, message).await {
            Ok(receivers) => {
                tracing::debug!(channel, receivers, "published");
                PublishResult {
                    published: true,
                    fallback_mode: false,
                }
            }
            Err(e) => {
                tracing::warn!(
                    channel,
                    error = %redact_credentials(&format!("{:#}", e)),
                    "publish failed, continuing without realtime delivery"
                );
                PublishResult::degraded()
            }
        }
    }

    /// Serialize `payload` as JSON and publish it.
    pub async fn publish_json<T: Serialize>(&self, channel: &str, payload: &T) -> PublishResult {
        match serde_json::to_string(payload) {
            Ok(message) => self.publish(channel, &message).await,
            Err(e) => {
                tracing::error!(channel, error = %e, "failed to serialize notification");
                PublishResult {
                    published: false,
                    fallback_mode: self.fallback.is_in_fallback_mode(),
                }
            }
        }
    }

    pub async fn publish_board_event(
        &self,
        board_id: &str,
        actor_id: Option<&str>,
        event: BoardEvent,
    ) -> PublishResult {
        let message = BoardMessage {
            board_id: board_id.to_string(),
            actor_id: actor_id.map(str::to_string),
            event,
            sent_at: Utc::now(),
        };
        self.publish_json(&board_channel(board_id), &message).await
    }

    pub async fn publish_user_notification(
        &self,
        user_id: &str,
        notification: &UserNotification,
    ) -> PublishResult {
        self.publish_json(&user_channel(user_id), notification).await
    }

    /// Deliver every message on `channel` to `handler` until the returned
    /// handle is unsubscribed.
    ///
    /// The subscription lives in a background task that resubscribes with
    /// capped exponential backoff whenever the stream ends or the subscribe
    /// call fails. No attempts are made while fallback mode is active; the
    /// task checks again every second and the backoff starts over.
    pub fn subscribe<F>(&self, channel: &str, handler: F) -> Subscription
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(channel, "no async runtime, subscription not started");
            return Subscription::inert();
        };

        let token = CancellationToken::new();
        let cancelled = token.clone();
        let transport = Arc::clone(&self.transport);
        let fallback = Arc::clone(&self.fallback);
        let channel = channel.to_string();

        runtime.spawn(async move {
            let mut backoff = INITIAL_BACKOFF;

            loop {
                if fallback.is_in_fallback_mode() {
                    // Check again at the base rate until fallback ends.
                    backoff = INITIAL_BACKOFF;
                } else {
                    let subscribed = tokio::select! {
                        _ = cancelled.cancelled() => return,
                        subscribed = transport.subscribe(&channel) => subscribed,
                    };

                    match subscribed {
                        Ok(mut messages) => {
                            tracing::info!(channel = %channel, "subscribed");
                            backoff = INITIAL_BACKOFF;

                            loop {
                                let next = tokio::select! {
                                    _ = cancelled.cancelled() => return,
                                    next = messages.next() => next,
                                };
                                let Some(payload) = next else { break };
                                deliver(&channel, &handler, payload);
                            }

                            tracing::warn!(channel = %channel, "subscription stream ended, resubscribing");
                        }
                        Err(e) => {
                            tracing::warn!(
                                channel = %channel,
                                error = %redact_credentials(&format!("{:#}", e)),
                                backoff_secs = backoff.as_secs(),
                                "subscribe failed, retrying"
                            );
                        }
                    }
                }

                tokio::select! {
                    _ = cancelled.cancelled() => return,
                    _ = tokio::time::sleep(backoff) => {}
                }
                if !fallback.is_in_fallback_mode() {
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        });

        Subscription::new(move || token.cancel())
    }

    /// Like [`subscribe`](Self::subscribe) but decodes JSON payloads,
    /// dropping messages that do not parse.
    pub fn subscribe_json<T, F>(&self, channel: &str, handler: F) -> Subscription
    where
        T: DeserializeOwned + 'static,
        F: Fn(T) + Send + Sync + 'static,
    {
        let name = channel.to_string();
        self.subscribe(channel, move |payload| {
            match serde_json::from_str::<T>(&payload) {
                Ok(message) => handler(message),
                Err(e) => tracing::warn!(channel = %name, error = %e, "dropping malformed message"),
            }
        })
    }

    pub fn subscribe_board<F>(&self, board_id: &str, handler: F) -> Subscription
    where
        F: Fn(BoardMessage) + Send + Sync + 'static,
    {
        self.subscribe_json(&board_channel(board_id), handler)
    }

    pub fn subscribe_user<F>(&self, user_id: &str, handler: F) -> Subscription
    where
        F: Fn(UserNotification) + Send + Sync + 'static,
    {
        self.subscribe_json(&user_channel(user_id), handler)
    }
}

fn deliver<F: Fn(String)>(channel: &str, handler: &F, payload: String) {
    if catch_unwind(AssertUnwindSafe(|| handler(payload))).is_err() {
        tracing::error!(channel, "notification handler panicked");
    }
}
