use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::auth::Identity;
use crate::engine::notify::NotificationDispatcher;
use crate::error::AppError;
use crate::models::message::Message;
use crate::models::notification::{Notification, NotificationKind};
use crate::models::order::Order;
use crate::models::user::Role;
use crate::realtime::events::{ChatMessageEvent, PresenceEvent, ServerEvent};
use crate::realtime::registry::{ConnectionId, ConnectionRegistry};
use crate::store::{DomainStore, OrderFilter};

pub const MAX_MESSAGE_CHARS: usize = 1000;
const PREVIEW_CHARS: usize = 100;
const MAX_PAGE: usize = 100;

#[derive(Debug, Clone, Serialize)]
pub struct UnreadOrder {
    pub order_id: Uuid,
    pub order_number: String,
    pub unread_count: usize,
    pub last_message: Option<Message>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnreadSummary {
    pub user_id: Uuid,
    pub total_unread: usize,
    pub orders_with_unread: Vec<UnreadOrder>,
}

pub struct ChatService {
    store: Arc<dyn DomainStore>,
    registry: Arc<ConnectionRegistry>,
    notifier: Arc<dyn NotificationDispatcher>,
    history_limit: usize,
}

impl ChatService {
    pub fn new(
        store: Arc<dyn DomainStore>,
        registry: Arc<ConnectionRegistry>,
        notifier: Arc<dyn NotificationDispatcher>,
        history_limit: usize,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            history_limit,
        }
    }

    /// The order's client, its assigned driver and admins may use the room.
    pub fn authorize(&self, actor: Identity, order_id: Uuid) -> Result<Order, AppError> {
        let order = self
            .store
            .get_order(order_id)?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))?;
        if actor.is_admin() || order.is_participant(actor.user_id) {
            Ok(order)
        } else {
            Err(AppError::Forbidden("not a party to this chat".to_string()))
        }
    }

    pub fn post_message(
        &self,
        actor: Identity,
        order_id: Uuid,
        content: &str,
    ) -> Result<Message, AppError> {
        let content = content.trim();
        let length = content.chars().count();
        if length == 0 || length > MAX_MESSAGE_CHARS {
            return Err(AppError::Validation(format!(
                "message must be 1 to {MAX_MESSAGE_CHARS} characters"
            )));
        }
        let order = self.authorize(actor, order_id)?;

        let message = Message {
            id: Uuid::new_v4(),
            order_id,
            sender_id: actor.user_id,
            content: content.to_string(),
            is_read: false,
            timestamp: Utc::now(),
        };
        self.store.append_message(message.clone())?;

        let delivery = self.registry.broadcast_to_room(
            order_id,
            &ServerEvent::ChatMessage(ChatMessageEvent::from(&message)),
            None,
        );
        debug!(
            order_id = %order_id,
            sender_id = %actor.user_id,
            delivered = delivery.delivered,
            "chat message posted"
        );

        let preview: String = message.content.chars().take(PREVIEW_CHARS).collect();
        let counterparts = std::iter::once(order.client_id).chain(order.driver_id);
        for user_id in counterparts.filter(|user_id| *user_id != actor.user_id) {
            self.notifier.dispatch(Notification::new(
                user_id,
                NotificationKind::ChatMessage,
                json!({
                    "order_id": order_id,
                    "order_number": order.order_number,
                    "message_id": message.id,
                    "sender_id": actor.user_id,
                    "preview": preview,
                }),
            ));
        }
        Ok(message)
    }

    /// A page of the room, oldest first. Reading it marks the other side's
    /// messages as read.
    pub fn history(
        &self,
        actor: Identity,
        order_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, AppError> {
        self.authorize(actor, order_id)?;
        self.store.mark_messages_read(order_id, actor.user_id)?;
        Ok(self
            .store
            .messages_for_order(order_id, offset, limit.clamp(1, MAX_PAGE))?)
    }

    pub fn mark_read(&self, actor: Identity, order_id: Uuid) -> Result<usize, AppError> {
        self.authorize(actor, order_id)?;
        Ok(self.store.mark_messages_read(order_id, actor.user_id)?)
    }

    /// Puts `conn` in the room, replays recent history to it alone and tells
    /// everyone else who arrived.
    pub fn join(&self, actor: Identity, order_id: Uuid, conn: ConnectionId) -> Result<(), AppError> {
        self.authorize(actor, order_id)?;
        if !self.registry.join_chat_room(order_id, conn) {
            return Err(AppError::InvalidState("connection is closed".to_string()));
        }

        // The replay never fills the queue: one slot stays free for live
        // frames arriving before the writer drains it.
        let replay = self
            .history_limit
            .min(self.registry.headroom(conn).saturating_sub(1));
        for message in self.store.recent_messages(order_id, replay)? {
            let replay = ServerEvent::ChatHistory(ChatMessageEvent::from(&message));
            if self.registry.send_to_connection(conn, &replay).is_err() {
                return Err(AppError::InvalidState(
                    "connection dropped during history replay".to_string(),
                ));
            }
        }

        self.registry.broadcast_to_room(
            order_id,
            &ServerEvent::UserConnected(PresenceEvent {
                user_id: actor.user_id,
                role: actor.role,
                timestamp: Utc::now(),
            }),
            Some(actor.user_id),
        );
        info!(order_id = %order_id, user_id = %actor.user_id, connection_id = %conn, "joined chat room");
        Ok(())
    }

    /// Unread messages across the rooms of the caller's own orders. Admins
    /// are not a party to any room, so their summary is always empty.
    pub fn unread_summary(&self, actor: Identity) -> Result<UnreadSummary, AppError> {
        let filter = match actor.role {
            Role::Client => OrderFilter {
                client_id: Some(actor.user_id),
                ..OrderFilter::default()
            },
            Role::Driver => OrderFilter {
                driver_id: Some(actor.user_id),
                ..OrderFilter::default()
            },
            Role::Admin => {
                return Ok(UnreadSummary {
                    user_id: actor.user_id,
                    total_unread: 0,
                    orders_with_unread: Vec::new(),
                });
            }
        };

        let mut orders_with_unread = Vec::new();
        for order in self.store.find_orders(&filter)? {
            let unread_count = self.store.unread_count(order.id, actor.user_id)?;
            if unread_count == 0 {
                continue;
            }
            orders_with_unread.push(UnreadOrder {
                order_id: order.id,
                order_number: order.order_number,
                unread_count,
                last_message: self.store.recent_messages(order.id, 1)?.pop(),
            });
        }

        Ok(UnreadSummary {
            user_id: actor.user_id,
            total_unread: orders_with_unread.iter().map(|o| o.unread_count).sum(),
            orders_with_unread,
        })
    }

    pub fn leave(&self, actor: Identity, order_id: Uuid, conn: ConnectionId) {
        self.registry.leave_chat_room(order_id, conn);
        self.registry.broadcast_to_room(
            order_id,
            &ServerEvent::UserDisconnected(PresenceEvent {
                user_id: actor.user_id,
                role: actor.role,
                timestamp: Utc::now(),
            }),
            Some(actor.user_id),
        );
        info!(order_id = %order_id, user_id = %actor.user_id, connection_id = %conn, "left chat room");
    }
}
