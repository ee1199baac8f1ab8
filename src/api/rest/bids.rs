use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Json;
use axum::Router;
use serde::Deserialize;
use uuid::Uuid;

use crate::auth::verify_bearer;
use crate::engine::board::BidStats;
use crate::engine::scoring::RankedBid;
use crate::error::AppError;
use crate::models::bid::Bid;
use crate::state::AppState;
use crate::store::AcceptanceRecord;

const DEFAULT_RANKED: usize = 5;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders/:id/bids", post(place_bid).get(list_bids))
        .route("/orders/:id/bids/ranked", get(ranked_bids))
        .route("/bids/mine", get(my_bids))
        .route("/bids/stats/my", get(bid_stats))
        .route("/bids/:id/accept", post(accept_bid))
        .route("/bids/:id/reject", post(reject_bid))
        .route("/bids/:id/cancel", post(cancel_bid))
}

#[derive(Deserialize)]
pub struct PlaceBidRequest {
    pub proposed_price: f64,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Deserialize)]
pub struct RankQuery {
    pub limit: Option<usize>,
}

async fn place_bid(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
    Json(payload): Json<PlaceBidRequest>,
) -> Result<(StatusCode, Json<Bid>), AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    let bid = state
        .lifecycle
        .place_bid(actor, order_id, payload.proposed_price, payload.message)?;
    Ok((StatusCode::CREATED, Json(bid)))
}

async fn list_bids(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
) -> Result<Json<Vec<Bid>>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.lifecycle.list_bids(actor, order_id)?))
}

async fn ranked_bids(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(order_id): Path<Uuid>,
    Query(query): Query<RankQuery>,
) -> Result<Json<Vec<RankedBid>>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    let limit = query.limit.unwrap_or(DEFAULT_RANKED);
    Ok(Json(state.lifecycle.rank_bids(actor, order_id, limit)?))
}

async fn my_bids(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<Bid>>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.lifecycle.my_bids(actor)?))
}

async fn bid_stats(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<Json<BidStats>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.board.bid_stats(actor)?))
}

async fn accept_bid(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(bid_id): Path<Uuid>,
) -> Result<Json<AcceptanceRecord>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.lifecycle.accept_bid(actor, bid_id)?))
}

async fn reject_bid(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(bid_id): Path<Uuid>,
) -> Result<Json<Bid>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.lifecycle.reject_bid(actor, bid_id)?))
}

async fn cancel_bid(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(bid_id): Path<Uuid>,
) -> Result<Json<Bid>, AppError> {
    let actor = verify_bearer(&headers, state.auth.as_ref())?;
    Ok(Json(state.lifecycle.cancel_bid(actor, bid_id)?))
}
