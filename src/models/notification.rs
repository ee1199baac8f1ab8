use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    NewOrder,
    NewBidReceived,
    BidAccepted,
    BidRejected,
    BidCancelled,
    OrderStatusChanged,
    OrderCancelled,
    OrderCompleted,
    ChatMessage,
}

#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    pub user_id: Uuid,
    pub kind: NotificationKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(user_id: Uuid, kind: NotificationKind, payload: Value) -> Self {
        Self {
            user_id,
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}
