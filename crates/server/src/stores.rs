//! Key/value stores.
//!
//! Two implementations share the [`KvBackend`] contract:
//!
//! - **remote** - Redis, the shared store used for cross-instance coordination
//! - **memory** - the per-process [`TtlStore`] used while Redis is unreachable
//!
//! ## Key Patterns
//!
//! ```text
//! lockout:attempts:{email}   → failed attempt counter (attempt window TTL)
//! lockout:locked:{email}     → lockout marker (lockout duration TTL)
//! board:{board_id}           → pub/sub channel for board events
//! user:{user_id}             → pub/sub channel for user notifications
//! ```

mod kv;
mod memory;
mod remote;

pub use kv::{KvBackend, PubSubTransport, StoreProbe};
pub use memory::TtlStore;
pub use remote::{RedisBackend, RedisProbe};

#[cfg(test)]
pub use kv::{MockKvBackend, MockPubSubTransport, MockStoreProbe};
