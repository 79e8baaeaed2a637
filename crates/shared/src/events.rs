//! Realtime event payloads published on named channels.
//!
//! ## Channels
//!
//! ```text
//! board:{board_id}   → BoardEvent JSON (task and column changes)
//! user:{user_id}     → UserNotification JSON
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub fn board_channel(board_id: &str) -> String {
    format!("board:{}", board_id)
}

pub fn user_channel(user_id: &str) -> String {
    format!("user:{}", user_id)
}

/// Change on a board that connected clients should reflect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BoardEvent {
    TaskCreated {
        task_id: String,
        column_id: String,
    },
    TaskUpdated {
        task_id: String,
    },
    TaskMoved {
        task_id: String,
        from_column_id: String,
        to_column_id: String,
        position: u32,
    },
    TaskDeleted {
        task_id: String,
    },
    ColumnCreated {
        column_id: String,
    },
    ColumnUpdated {
        column_id: String,
    },
    ColumnDeleted {
        column_id: String,
    },
    MemberAdded {
        user_id: String,
    },
    MemberRemoved {
        user_id: String,
    },
}

/// Envelope carried on a board channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoardMessage {
    pub board_id: String,
    /// User whose action produced the event, so their own client can skip it.
    pub actor_id: Option<String>,
    pub event: BoardEvent,
    pub sent_at: DateTime<Utc>,
}

/// Direct notification for a single user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNotification {
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub sent_at: DateTime<Utc>,
}
