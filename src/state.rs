use std::sync::Arc;

use tokio::sync::mpsc;

use crate::auth::{Authenticator, StaticTokenAuthenticator};
use crate::config::Config;
use crate::engine::board::OrderBoard;
use crate::engine::chat::ChatService;
use crate::engine::lifecycle::LifecycleEngine;
use crate::engine::notify::{NotificationDispatcher, QueuedDispatcher};
use crate::engine::tracking::LocationPipeline;
use crate::models::notification::Notification;
use crate::observability::metrics::Metrics;
use crate::realtime::registry::ConnectionRegistry;
use crate::store::{DomainStore, MemoryStore};

pub struct AppState {
    pub store: Arc<dyn DomainStore>,
    pub registry: Arc<ConnectionRegistry>,
    pub lifecycle: LifecycleEngine,
    pub tracking: LocationPipeline,
    pub chat: ChatService,
    pub board: OrderBoard,
    pub auth: Arc<dyn Authenticator>,
    pub metrics: Metrics,
    pub connection_queue_size: usize,
}

impl AppState {
    /// In-memory store, tokens from `AUTH_TOKENS`.
    pub fn new(config: &Config) -> (Self, mpsc::Receiver<Notification>) {
        let auth = StaticTokenAuthenticator::new(config.auth_tokens.iter().cloned());
        Self::with_backends(config, Arc::new(MemoryStore::new()), Arc::new(auth))
    }

    pub fn with_backends(
        config: &Config,
        store: Arc<dyn DomainStore>,
        auth: Arc<dyn Authenticator>,
    ) -> (Self, mpsc::Receiver<Notification>) {
        let metrics = Metrics::new();
        let registry = Arc::new(ConnectionRegistry::new(
            config.max_connections_per_user,
            metrics.clone(),
        ));
        let (dispatcher, notification_rx) =
            QueuedDispatcher::new(config.notification_queue_size, metrics.clone());
        let notifier: Arc<dyn NotificationDispatcher> = Arc::new(dispatcher);

        (
            Self {
                lifecycle: LifecycleEngine::new(
                    store.clone(),
                    registry.clone(),
                    notifier.clone(),
                    metrics.clone(),
                ),
                tracking: LocationPipeline::new(store.clone(), registry.clone(), metrics.clone()),
                chat: ChatService::new(
                    store.clone(),
                    registry.clone(),
                    notifier,
                    config.chat_history_limit,
                ),
                board: OrderBoard::new(store.clone()),
                store,
                registry,
                auth,
                metrics,
                connection_queue_size: config.connection_queue_size,
            },
            notification_rx,
        )
    }
}
