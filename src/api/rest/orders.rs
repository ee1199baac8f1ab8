use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::verify_bearer;
use crate::engine::board::{OrderQuery, OrderTracking};
use crate::engine::lifecycle::{OrderDraft, QuoteRequest};
use crate::error::AppError;
use crate::geo::pricing::Quote;
use crate::models::location::LocationUpdate;
use crate::models::order::{Order, OrderStatus};
use crate::state::AppState;
use crate::store::CancellationRecord;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", post(create_order).get(my_orders))
        .route("/orders/available", get(available_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/track", get(track_order))
        .route("/orders/:id/publish", post(publish_order))
        .route("/orders/:id/cancel", post(cancel_order))
        .route("/orders/:id/advance", post(advance_order))
        .route("/orders/:id/complete", post(complete_order))
        .route("/orders/:id/settle", post(settle_order))
        .route("/orders/:id/route", get(route_history))
        .route("/quote", post(quote))
        .route("/track/driver/:driver_id/locations", get(driver_locations))
}

#[derive(Deserialize)]
pub struct AdvanceRequest {
    pub status: OrderStatus,
}

#[derive(Deserialize)]
pub struct HistoryQuery {
    pub hours: Option<i64>,
    pub limit: Option<usize>,
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(payload): Json<OrderDraft>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    let order = state.lifecycle.create_order(actor, payload)?;
    Ok((StatusCode::CREATED, Json(order)))
}

async fn my_orders(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<OrderQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.board.my_orders(actor, &query)?))
}

async fn available_orders(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<OrderQuery>,
) -> Result<Json<Vec<Order>>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.board.available_orders(actor, &query)?))
}

/// Public by order number; a presented token must still be valid.
async fn track_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_number): Path<String>,
) -> Result<Json<OrderTracking>, AppError> {
    let viewer = if headers.contains_key(header::AUTHORIZATION) {
        Some(verify_bearer(&headers, state.auth.as_ref())?)
    } else {
        None
    };
    Ok(Json(state.board.track_by_number(viewer, &order_number)?))
}

async fn get_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.lifecycle.get_order(actor, id)?))
}

async fn publish_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.lifecycle.publish_order(actor, id)?))
}

async fn cancel_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<CancellationRecord>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.lifecycle.cancel_order(actor, id)?))
}

async fn advance_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    Json(payload): Json<AdvanceRequest>,
) -> Result<Json<Order>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.lifecycle.advance_order(actor, id, payload.status)?))
}

async fn complete_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.lifecycle.complete_order(actor, id)?))
}

async fn settle_order(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Order>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.lifecycle.settle_order(actor, id)?))
}

async fn route_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<LocationUpdate>>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.tracking.route_history(actor, id)?))
}

async fn quote(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<QuoteRequest>,
) -> Result<Json<Quote>, AppError> {
    Ok(Json(state.lifecycle.quote(payload)?))
}

async fn driver_locations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(driver_id): Path<Uuid>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<LocationUpdate>>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.tracking.driver_locations(
        actor,
        driver_id,
        query.hours,
        query.limit,
    )?))
}
