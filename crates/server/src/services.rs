//! Services used by authentication, realtime and monitoring collaborators.
//!
//! ## Services
//!
//! - **lockout** - failed-login counting and account lockout
//! - **notifications** - best-effort realtime publish/subscribe
//! - **health** - combined Redis and database health
//!
//! Lockout and notifications hide every remote-store failure from their
//! callers; they degrade to the in-memory store or a reported no-op.
//!
//! ```ignore
//! let result = state.lockout.record_failed_attempt(&email, Some(ip)).await;
//! if result.is_locked {
//!     return Err(AppError::TooManyRequests);
//! }
//!
//! state.notifications.publish_board_event(&board_id, Some(&user_id), event).await;
//! ```

mod health;
mod lockout;
mod notifications;

pub use health::{DEFAULT_TIMEOUT, HealthAggregator, derive_status};
pub use lockout::{
    ATTEMPT_WINDOW, LOCKOUT_DURATION, LockoutPolicy, LockoutService, MAX_FAILED_ATTEMPTS,
    normalize_email,
};
pub use notifications::NotificationGateway;
