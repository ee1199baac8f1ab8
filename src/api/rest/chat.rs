use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::verify_bearer;
use crate::engine::chat::UnreadSummary;
use crate::error::AppError;
use crate::models::message::Message;
use crate::state::AppState;

const DEFAULT_PAGE: usize = 50;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders/:id/messages", get(history).post(post_message))
        .route("/orders/:id/messages/read", post(mark_read))
        .route("/chat/unread-count", get(unread_count))
}

#[derive(Deserialize)]
pub struct PostMessageRequest {
    pub content: String,
}

#[derive(Deserialize)]
pub struct PageQuery {
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct MarkReadResponse {
    pub updated: usize,
}

async fn history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Result<Json<Vec<Message>>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    let messages = state.chat.history(
        actor,
        order_id,
        page.offset.unwrap_or(0),
        page.limit.unwrap_or(DEFAULT_PAGE),
    )?;
    Ok(Json(messages))
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<PostMessageRequest>,
) -> Result<(StatusCode, Json<Message>), AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    let message = state.chat.post_message(actor, order_id, &payload.content)?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> Result<Json<MarkReadResponse>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    let updated = state.chat.mark_read(actor, order_id)?;
    Ok(Json(MarkReadResponse { updated }))
}

async fn unread_count(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<UnreadSummary>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.chat.unread_summary(actor)?))
}
