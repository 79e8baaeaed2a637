//! Resilience layer for Redis-backed login lockout and realtime
//! notifications.
//!
//! Redis is the shared store for cross-instance coordination. When it
//! becomes unreachable the [`fallback::FallbackCoordinator`] switches every
//! component to the per-process [`stores::TtlStore`] until a background
//! probe sees Redis answer again.

pub mod config;
pub mod connection;
pub mod fallback;
pub mod handlers;
pub mod observer;
pub mod redact;
pub mod repos;
pub mod services;
pub mod state;
pub mod stores;
#[cfg(test)]
mod test_utils;
