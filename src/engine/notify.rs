use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::models::notification::Notification;
use crate::observability::metrics::Metrics;
use crate::realtime::events::ServerEvent;
use crate::realtime::registry::ConnectionRegistry;

/// Fire-and-forget delivery of user notifications. Failures stay on the
/// dispatcher's side and never reach the caller.
pub trait NotificationDispatcher: Send + Sync {
    fn dispatch(&self, notification: Notification);
}

/// Hands notifications to the background worker over a bounded queue.
pub struct QueuedDispatcher {
    tx: mpsc::Sender<Notification>,
    metrics: Metrics,
}

impl QueuedDispatcher {
    pub fn new(queue_size: usize, metrics: Metrics) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        (Self { tx, metrics }, rx)
    }
}

impl NotificationDispatcher for QueuedDispatcher {
    fn dispatch(&self, notification: Notification) {
        let user_id = notification.user_id;
        match self.tx.try_send(notification) {
            Ok(()) => self.metrics.notifications_in_queue.inc(),
            Err(TrySendError::Full(dropped)) => {
                warn!(user_id = %user_id, kind = ?dropped.kind, "notification queue full; dropping");
            }
            Err(TrySendError::Closed(_)) => {
                warn!(user_id = %user_id, "notification worker is gone; dropping");
            }
        }
    }
}

pub async fn run_notification_worker(
    registry: Arc<ConnectionRegistry>,
    metrics: Metrics,
    mut rx: mpsc::Receiver<Notification>,
) {
    info!("notification worker started");

    while let Some(notification) = rx.recv().await {
        metrics.notifications_in_queue.dec();

        let user_id = notification.user_id;
        let kind = notification.kind;
        let delivery = registry.send_to_user(user_id, &ServerEvent::Notification(notification));
        debug!(
            user_id = %user_id,
            kind = ?kind,
            delivered = delivery.delivered,
            "notification delivered"
        );
    }

    warn!("notification worker stopped: queue channel closed");
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};
    use uuid::Uuid;

    use super::{run_notification_worker, NotificationDispatcher, QueuedDispatcher};
    use crate::models::notification::{Notification, NotificationKind};
    use crate::observability::metrics::Metrics;
    use crate::realtime::connection::channel;
    use crate::realtime::registry::ConnectionRegistry;

    #[test]
    fn full_queue_drops_without_blocking() {
        let (dispatcher, mut rx) = QueuedDispatcher::new(1, Metrics::new());
        let user = Uuid::new_v4();

        dispatcher.dispatch(Notification::new(user, NotificationKind::NewOrder, json!({})));
        dispatcher.dispatch(Notification::new(user, NotificationKind::BidAccepted, json!({})));

        assert_eq!(rx.try_recv().unwrap().kind, NotificationKind::NewOrder);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn worker_delivers_to_live_connections() {
        let metrics = Metrics::new();
        let registry = Arc::new(ConnectionRegistry::new(5, metrics.clone()));
        let user = Uuid::new_v4();
        let (sink, mut conn) = channel(8);
        registry.register(user, Arc::new(sink));

        let (dispatcher, rx) = QueuedDispatcher::new(8, metrics.clone());
        dispatcher.dispatch(Notification::new(
            user,
            NotificationKind::BidAccepted,
            json!({ "bid_id": Uuid::nil() }),
        ));
        drop(dispatcher);

        run_notification_worker(registry, metrics.clone(), rx).await;

        let frame: Value = serde_json::from_str(&conn.next().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "notification");
        assert_eq!(frame["data"]["kind"], "bid_accepted");
        assert_eq!(metrics.notifications_in_queue.get(), 0);
    }
}
