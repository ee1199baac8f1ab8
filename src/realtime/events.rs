//! Frames exchanged over real-time connections. Outbound frames are
//! `{"type": ..., "data": {...}}`; inbound frames carry their fields next to
//! `type`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::bid::{Bid, BidStatus};
use crate::models::location::{LocationSample, LocationUpdate};
use crate::models::message::Message;
use crate::models::notification::{Notification, NotificationKind};
use crate::models::order::{Order, OrderStatus};
use crate::models::user::Role;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ServerEvent {
    ChatMessage(ChatMessageEvent),
    ChatHistory(ChatMessageEvent),
    UserConnected(PresenceEvent),
    UserDisconnected(PresenceEvent),
    LocationUpdate(LocationEvent),
    AdminLocationUpdate(LocationEvent),
    LocationReceived {
        location_id: Uuid,
        timestamp: DateTime<Utc>,
    },
    BidStatusChanged(BidStatusEvent),
    OrderStatusChanged(OrderStatusEvent),
    Notification(Notification),
    AdminNotification(AdminNotice),
    SystemMessage {
        message: String,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    Error {
        message: String,
    },
}

/// Addressed to the admin group as a whole, so it names no recipient.
#[derive(Debug, Clone, Serialize)]
pub struct AdminNotice {
    pub kind: NotificationKind,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl AdminNotice {
    pub fn new(kind: NotificationKind, payload: Value) -> Self {
        Self {
            kind,
            payload,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessageEvent {
    pub id: Uuid,
    pub order_id: Uuid,
    pub sender_id: Uuid,
    pub content: String,
    pub is_read: bool,
    pub timestamp: DateTime<Utc>,
}

impl From<&Message> for ChatMessageEvent {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id,
            order_id: message.order_id,
            sender_id: message.sender_id,
            content: message.content.clone(),
            is_read: message.is_read,
            timestamp: message.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PresenceEvent {
    pub user_id: Uuid,
    pub role: Role,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LocationEvent {
    pub driver_id: Uuid,
    pub order_id: Option<Uuid>,
    pub lat: f64,
    pub lng: f64,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub heading: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl From<&LocationUpdate> for LocationEvent {
    fn from(update: &LocationUpdate) -> Self {
        Self {
            driver_id: update.driver_id,
            order_id: update.order_id,
            lat: update.lat,
            lng: update.lng,
            accuracy: update.accuracy,
            speed: update.speed,
            heading: update.heading,
            timestamp: update.timestamp,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BidStatusEvent {
    pub bid_id: Uuid,
    pub order_id: Uuid,
    pub driver_id: Uuid,
    pub old_status: BidStatus,
    pub new_status: BidStatus,
}

impl BidStatusEvent {
    pub fn new(bid: &Bid, old_status: BidStatus) -> Self {
        Self {
            bid_id: bid.id,
            order_id: bid.order_id,
            driver_id: bid.driver_id,
            old_status,
            new_status: bid.status,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderStatusEvent {
    pub order_id: Uuid,
    pub order_number: String,
    pub driver_id: Option<Uuid>,
    pub old_status: OrderStatus,
    pub new_status: OrderStatus,
}

impl OrderStatusEvent {
    pub fn new(order: &Order, old_status: OrderStatus) -> Self {
        Self {
            order_id: order.id,
            order_number: order.order_number.clone(),
            driver_id: order.driver_id,
            old_status,
            new_status: order.status,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    ChatMessage { content: String },
    LocationUpdate(LocationSample),
    Ping,
}
