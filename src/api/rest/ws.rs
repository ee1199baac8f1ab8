use std::pin::pin;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use chrono::Utc;
use futures::future::ready;
use futures::{SinkExt, Stream, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{verify_bearer, Identity};
use crate::engine::tracking::IngestOutcome;
use crate::error::AppError;
use crate::models::user::Role;
use crate::realtime::connection::{channel, FrameSink};
use crate::realtime::events::{ClientFrame, ServerEvent};
use crate::realtime::registry::ConnectionId;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/ws/chat/:order_id", get(chat_socket))
        .route("/ws/track/driver", get(driver_socket))
        .route("/ws/track/subscribe/:driver_id", get(tracking_socket))
        .route("/ws/notifications", get(notification_socket))
}

#[derive(Deserialize)]
pub struct TokenQuery {
    pub token: Option<String>,
}

/// What a websocket connection is for; fixed at upgrade time.
#[derive(Debug, Clone, Copy)]
pub enum Session {
    Chat(Uuid),
    DriverStream,
    Tracking(Uuid),
    Notifications,
}

/// Browsers cannot set headers on an upgrade, so `?token=` wins over the
/// bearer header.
pub fn authenticate(
    state: &AppState,
    query: &TokenQuery,
    headers: &HeaderMap,
) -> Result<Identity, AppError> {
    match query.token.as_deref() {
        Some(token) => state.auth.authenticate(token),
        None => verify_bearer(headers, state.auth.as_ref()),
    }
}

async fn chat_socket(
    State(state): State<Arc<AppState>>,
    Path(order_id): Path<Uuid>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let identity = authenticate(&state, &query, &headers)?;
    state.chat.authorize(identity, order_id)?;
    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, state, identity, Session::Chat(order_id))
    }))
}

async fn driver_socket(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let identity = authenticate(&state, &query, &headers)?;
    if identity.role != Role::Driver {
        return Err(AppError::Forbidden(
            "only drivers can stream locations".to_string(),
        ));
    }
    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, state, identity, Session::DriverStream)
    }))
}

async fn tracking_socket(
    State(state): State<Arc<AppState>>,
    Path(driver_id): Path<Uuid>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let identity = authenticate(&state, &query, &headers)?;
    state.tracking.authorize_subscription(identity, driver_id)?;
    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, state, identity, Session::Tracking(driver_id))
    }))
}

async fn notification_socket(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Result<Response, AppError> {
    let identity = authenticate(&state, &query, &headers)?;
    Ok(ws.on_upgrade(move |socket| {
        handle_socket(socket, state, identity, Session::Notifications)
    }))
}

async fn handle_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    identity: Identity,
    session: Session,
) {
    let (sink, mut outbound) = channel(state.connection_queue_size);
    let (mut sender, receiver) = socket.split();

    // The writer drains the queue before anything is queued into it.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.next().await {
            if sender.send(Message::Text(frame.as_ref().into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    });

    let inbound = receiver
        .take_while(|message| {
            ready(matches!(message, Ok(message) if !matches!(message, Message::Close(_))))
        })
        .filter_map(|message| {
            ready(match message {
                Ok(Message::Text(text)) => Some(text),
                _ => None,
            })
        });
    let mut session_task = tokio::spawn(run_session(
        state,
        identity,
        session,
        Arc::new(sink),
        inbound,
    ));

    tokio::select! {
        _ = &mut send_task => session_task.abort(),
        _ = &mut session_task => send_task.abort(),
    }
}

/// Drives one connection from registration to teardown. `inbound` yields
/// the peer's text frames and ends when the peer goes away; `sink` is the
/// queue some writer drains towards the peer.
pub async fn run_session<I>(
    state: Arc<AppState>,
    identity: Identity,
    session: Session,
    sink: Arc<dyn FrameSink>,
    inbound: I,
) where
    I: Stream<Item = String> + Send,
{
    let conn = state.registry.register(identity.user_id, sink);
    if let Err(err) = attach(&state, identity, session, conn) {
        warn!(user_id = %identity.user_id, ?session, error = %err, "could not attach websocket");
        reply(&state, conn, error_event(err.to_string()));
        state.registry.unregister(conn);
        return;
    }
    info!(user_id = %identity.user_id, connection_id = %conn, ?session, "websocket client connected");

    // Runs on every exit, including the task being aborted.
    let teardown = Teardown {
        state,
        identity,
        session,
        conn,
    };

    let mut inbound = pin!(inbound);
    while let Some(text) = inbound.next().await {
        if !teardown.state.registry.is_registered(conn) {
            debug!(connection_id = %conn, "connection evicted; ending session");
            break;
        }
        handle_frame(&teardown.state, identity, session, conn, &text);
    }
}

struct Teardown {
    state: Arc<AppState>,
    identity: Identity,
    session: Session,
    conn: ConnectionId,
}

impl Drop for Teardown {
    fn drop(&mut self) {
        detach(&self.state, self.identity, self.session, self.conn);
        self.state.registry.unregister(self.conn);
        info!(user_id = %self.identity.user_id, connection_id = %self.conn, "websocket client disconnected");
    }
}

fn attach(
    state: &AppState,
    identity: Identity,
    session: Session,
    conn: ConnectionId,
) -> Result<(), AppError> {
    match session {
        Session::Chat(order_id) => state.chat.join(identity, order_id, conn),
        Session::DriverStream => {
            state.tracking.stream_opened(identity.user_id);
            Ok(())
        }
        Session::Tracking(driver_id) => state
            .tracking
            .subscribe(identity, driver_id, conn)
            .map(|_| ()),
        Session::Notifications if identity.is_admin() => {
            state.registry.join_admin_group(conn);
            Ok(())
        }
        Session::Notifications => Ok(()),
    }
}

fn detach(state: &AppState, identity: Identity, session: Session, conn: ConnectionId) {
    match session {
        Session::Chat(order_id) => state.chat.leave(identity, order_id, conn),
        Session::DriverStream => {
            if let Err(err) = state.tracking.stream_closed(identity.user_id) {
                warn!(driver_id = %identity.user_id, error = %err, "could not mark driver offline");
            }
        }
        Session::Tracking(driver_id) => {
            state.tracking.unsubscribe(identity, driver_id, conn);
        }
        Session::Notifications if identity.is_admin() => {
            state.registry.leave_admin_group(conn);
        }
        Session::Notifications => {}
    }
}

fn handle_frame(
    state: &AppState,
    identity: Identity,
    session: Session,
    conn: ConnectionId,
    text: &str,
) {
    let frame = match serde_json::from_str::<ClientFrame>(text) {
        Ok(frame) => frame,
        Err(err) => {
            reply(state, conn, error_event(format!("malformed frame: {err}")));
            return;
        }
    };

    match (frame, session) {
        (ClientFrame::Ping, _) => reply(
            state,
            conn,
            ServerEvent::Pong {
                timestamp: Utc::now(),
            },
        ),
        (ClientFrame::ChatMessage { content }, Session::Chat(order_id)) => {
            if let Err(err) = state.chat.post_message(identity, order_id, &content) {
                reply(state, conn, error_event(err.to_string()));
            }
        }
        (ClientFrame::LocationUpdate(sample), Session::DriverStream) => {
            let event = match state.tracking.ingest_location(identity.user_id, sample) {
                Ok(IngestOutcome::Accepted(update)) => ServerEvent::LocationReceived {
                    location_id: update.id,
                    timestamp: update.timestamp,
                },
                Ok(IngestOutcome::Rejected(rejection)) => error_event(rejection.to_string()),
                Err(err) => error_event(err.to_string()),
            };
            reply(state, conn, event);
        }
        (frame, session) => {
            debug!(?frame, ?session, "frame not valid on this channel");
            reply(
                state,
                conn,
                error_event("frame type not supported on this channel".to_string()),
            );
        }
    }
}

fn error_event(message: String) -> ServerEvent {
    ServerEvent::Error { message }
}

fn reply(state: &AppState, conn: ConnectionId, event: ServerEvent) {
    if let Err(err) = state.registry.send_to_connection(conn, &event) {
        debug!(connection_id = %conn, error = %err, "reply not delivered");
    }
}
