use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use freight_exchange::api::rest::router;
use freight_exchange::auth::{Identity, StaticTokenAuthenticator};
use freight_exchange::config::Config;
use freight_exchange::models::driver::{DriverProfile, VerificationStatus};
use freight_exchange::models::notification::Notification;
use freight_exchange::models::user::{Role, User};
use freight_exchange::state::AppState;
use freight_exchange::store::{DomainStore, MemoryStore};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tower::ServiceExt;

const CLIENT: &str = "client-token";
const DRIVER_A: &str = "driver-a-token";
const DRIVER_B: &str = "driver-b-token";
const SMALL_TRUCK: &str = "small-truck-token";
const ADMIN: &str = "admin-token";

fn setup() -> (axum::Router, mpsc::Receiver<Notification>) {
    let store = Arc::new(MemoryStore::new());
    let auth = Arc::new(StaticTokenAuthenticator::default());

    for (token, role, capacity) in [
        (CLIENT, Role::Client, None),
        (DRIVER_A, Role::Driver, Some(20.0)),
        (DRIVER_B, Role::Driver, Some(20.0)),
        (SMALL_TRUCK, Role::Driver, Some(1.5)),
        (ADMIN, Role::Admin, None),
    ] {
        let user = User::new(role);
        let user_id = user.id;
        store.insert_user(user).unwrap();
        if let Some(max_weight) = capacity {
            let mut profile = DriverProfile::new(user_id, "T001XX", max_weight, 80.0);
            profile.verification = VerificationStatus::Verified;
            store.upsert_driver_profile(profile).unwrap();
        }
        auth.insert(token, Identity { user_id, role });
    }

    let (state, rx) = AppState::with_backends(&Config::default(), store, auth);
    (router(Arc::new(state)), rx)
}

fn json_request(method: &str, uri: &str, token: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("content-type", "application/json")
        .header("authorization", format!("Bearer {token}"))
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

fn post_request(uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("authorization", format!("Bearer {token}"))
        .body(Body::empty())
        .unwrap()
}

fn get_request(uri: &str, token: Option<&str>) -> Request<Body> {
    let mut builder = Request::builder().method("GET").uri(uri);
    if let Some(token) = token {
        builder = builder.header("authorization", format!("Bearer {token}"));
    }
    builder.body(Body::empty()).unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_string(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

fn order_body(weight: f64) -> Value {
    json!({
        "pickup_address": "Moscow, Leningradsky 39",
        "pickup": { "lat": 55.7558, "lng": 37.6173 },
        "dropoff_address": "Saint Petersburg, Nevsky 28",
        "dropoff": { "lat": 59.9343, "lng": 30.3351 },
        "cargo": {
            "description": "boxed electronics",
            "kind": "general",
            "weight": weight,
            "volume": 30.0
        },
        "desired_price": 95.0
    })
}

async fn searching_order(app: &axum::Router, weight: f64) -> String {
    let response = app
        .clone()
        .oneshot(json_request("POST", "/orders", CLIENT, order_body(weight)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let order = body_json(response).await;
    assert_eq!(order["status"], "draft");
    let id = order["id"].as_str().unwrap().to_string();

    let response = app
        .clone()
        .oneshot(post_request(&format!("/orders/{id}/publish"), CLIENT))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "searching");
    id
}

async fn place_bid(app: &axum::Router, order_id: &str, token: &str, price: f64) -> axum::response::Response {
    app.clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/bids"),
            token,
            json!({ "proposed_price": price }),
        ))
        .await
        .unwrap()
}

#[tokio::test]
async fn health_returns_ok() {
    let (app, _rx) = setup();
    let response = app.oneshot(get_request("/health", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let body = body_json(response).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["connections"]["total_connections"], 0);
    assert_eq!(body["store"]["users"], 5);
    assert_eq!(body["store"]["drivers"], 3);
    assert_eq!(body["store"]["orders"], 0);
}

#[tokio::test]
async fn metrics_returns_prometheus_format() {
    let (app, _rx) = setup();
    let response = app.oneshot(get_request("/metrics", None)).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);

    let content_type = response
        .headers()
        .get("content-type")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(content_type.contains("text/plain"));

    let body = body_string(response).await;
    assert!(body.contains("connections_active"));
    assert!(body.contains("notifications_in_queue"));
}

#[tokio::test]
async fn missing_or_unknown_token_is_unauthorized() {
    let (app, _rx) = setup();
    let response = app
        .clone()
        .oneshot(get_request("/bids/mine", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .oneshot(get_request("/bids/mine", Some("forged")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn accepting_a_bid_settles_the_order() {
    let (app, _rx) = setup();
    let order_id = searching_order(&app, 5.0).await;

    let response = place_bid(&app, &order_id, DRIVER_A, 100.0).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let bid_a = body_json(response).await;

    let response = place_bid(&app, &order_id, DRIVER_B, 90.0).await;
    assert_eq!(response.status(), StatusCode::CREATED);
    let bid_b = body_json(response).await;
    assert_eq!(bid_b["status"], "pending");

    let response = app
        .clone()
        .oneshot(post_request(
            &format!("/bids/{}/accept", bid_b["id"].as_str().unwrap()),
            CLIENT,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let record = body_json(response).await;
    assert_eq!(record["accepted"]["status"], "accepted");
    assert_eq!(record["rejected"][0]["id"], bid_a["id"]);
    assert_eq!(record["rejected"][0]["status"], "rejected");
    assert_eq!(record["order"]["status"], "driver_assigned");
    assert_eq!(record["order"]["driver_id"], bid_b["driver_id"]);
    assert_eq!(record["order"]["final_price"], 90.0);
    assert_eq!(record["order"]["platform_fee"], 4.5);
    assert_eq!(record["order"]["order_amount"], 85.5);

    let response = app
        .oneshot(post_request(
            &format!("/bids/{}/accept", bid_a["id"].as_str().unwrap()),
            CLIENT,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn refused_bids_carry_a_reason() {
    let (app, _rx) = setup();
    let order_id = searching_order(&app, 5.0).await;

    let response = place_bid(&app, &order_id, SMALL_TRUCK, 50.0).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body_json(response).await["reason"], "over_capacity");

    assert_eq!(
        place_bid(&app, &order_id, DRIVER_A, 100.0).await.status(),
        StatusCode::CREATED
    );
    let response = place_bid(&app, &order_id, DRIVER_A, 80.0).await;
    assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY);
    let body = body_json(response).await;
    assert_eq!(body["reason"], "duplicate");
    assert!(body["error"].as_str().unwrap().contains("active bid"));

    let response = app
        .oneshot(get_request("/bids/mine", Some(DRIVER_A)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn drivers_cannot_create_orders() {
    let (app, _rx) = setup();
    let response = app
        .oneshot(json_request("POST", "/orders", DRIVER_A, order_body(5.0)))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn malformed_order_is_bad_request() {
    let (app, _rx) = setup();
    let mut body = order_body(5.0);
    body["pickup"]["lat"] = json!(123.0);

    let response = app
        .oneshot(json_request("POST", "/orders", CLIENT, body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn cancel_rejects_open_bids() {
    let (app, _rx) = setup();
    let order_id = searching_order(&app, 5.0).await;
    place_bid(&app, &order_id, DRIVER_A, 100.0).await;

    let response = app
        .clone()
        .oneshot(post_request(&format!("/orders/{order_id}/cancel"), CLIENT))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let record = body_json(response).await;
    assert_eq!(record["order"]["status"], "cancelled");
    assert_eq!(record["rejected"][0]["status"], "rejected");

    let response = app
        .oneshot(post_request(&format!("/orders/{order_id}/cancel"), ADMIN))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);
}

#[tokio::test]
async fn chat_history_is_visible_to_both_parties() {
    let (app, _rx) = setup();
    let order_id = searching_order(&app, 5.0).await;
    let bid = body_json(place_bid(&app, &order_id, DRIVER_A, 100.0).await).await;
    app.clone()
        .oneshot(post_request(
            &format!("/bids/{}/accept", bid["id"].as_str().unwrap()),
            CLIENT,
        ))
        .await
        .unwrap();

    let response = app
        .clone()
        .oneshot(json_request(
            "POST",
            &format!("/orders/{order_id}/messages"),
            CLIENT,
            json!({ "content": "  gate 4, after 9am  " }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(body_json(response).await["content"], "gate 4, after 9am");

    let response = app
        .clone()
        .oneshot(get_request(
            &format!("/orders/{order_id}/messages"),
            Some(DRIVER_A),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let page = body_json(response).await;
    assert_eq!(page.as_array().unwrap().len(), 1);
    assert_eq!(page[0]["is_read"], true);

    let response = app
        .oneshot(get_request(
            &format!("/orders/{order_id}/messages"),
            Some(DRIVER_B),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn quote_applies_the_minimum_price() {
    let (app, _rx) = setup();
    let response = app
        .oneshot(json_request(
            "POST",
            "/quote",
            CLIENT,
            json!({
                "pickup": { "lat": 55.75, "lng": 37.61 },
                "dropoff": { "lat": 55.76, "lng": 37.62 },
                "weight": 1.0,
                "volume": 2.0
            }),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let quote = body_json(response).await;
    assert_eq!(quote["final_price"], 500.0);
    assert_eq!(quote["platform_fee"], 25.0);
    assert_eq!(quote["order_amount"], 475.0);
}

async fn accept(app: &axum::Router, bid: &Value) {
    let response = app
        .clone()
        .oneshot(post_request(
            &format!("/bids/{}/accept", bid["id"].as_str().unwrap()),
            CLIENT,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

async fn get_json(app: &axum::Router, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(get_request(uri, token)).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn available_orders_match_the_vehicle() {
    let (app, _rx) = setup();
    let order_id = searching_order(&app, 5.0).await;

    let (status, orders) = get_json(&app, "/orders/available", Some(DRIVER_A)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(orders.as_array().unwrap().len(), 1);
    assert_eq!(orders[0]["id"], order_id.as_str());

    let (status, orders) = get_json(&app, "/orders/available", Some(SMALL_TRUCK)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(orders.as_array().unwrap().is_empty());

    let (status, orders) = get_json(&app, "/orders/available?min_price=500", Some(DRIVER_A)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(orders.as_array().unwrap().is_empty());

    let (status, _) = get_json(&app, "/orders/available", Some(CLIENT)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn own_orders_depend_on_the_role() {
    let (app, _rx) = setup();
    let assigned = searching_order(&app, 5.0).await;
    searching_order(&app, 5.0).await;
    let bid = body_json(place_bid(&app, &assigned, DRIVER_A, 100.0).await).await;
    accept(&app, &bid).await;

    let (status, orders) = get_json(&app, "/orders", Some(CLIENT)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(orders.as_array().unwrap().len(), 2);

    let (_, orders) = get_json(&app, "/orders?status=searching", Some(CLIENT)).await;
    assert_eq!(orders.as_array().unwrap().len(), 1);

    let (_, orders) = get_json(&app, "/orders", Some(DRIVER_A)).await;
    assert_eq!(orders.as_array().unwrap().len(), 1);
    assert_eq!(orders[0]["id"], assigned.as_str());

    let (_, orders) = get_json(&app, "/orders", Some(DRIVER_B)).await;
    assert!(orders.as_array().unwrap().is_empty());

    let (_, orders) = get_json(&app, "/orders?limit=1", Some(ADMIN)).await;
    assert_eq!(orders.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn tracking_by_number_hides_details_from_strangers() {
    let (app, _rx) = setup();
    let order_id = searching_order(&app, 5.0).await;
    let bid = body_json(place_bid(&app, &order_id, DRIVER_A, 100.0).await).await;
    accept(&app, &bid).await;
    let (_, order) = get_json(&app, &format!("/orders/{order_id}"), Some(CLIENT)).await;
    let uri = format!("/orders/{}/track", order["order_number"].as_str().unwrap());

    let (status, public) = get_json(&app, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(public["status"], "driver_assigned");
    assert_eq!(public["cargo_type"], "general");
    assert!(public.get("client_id").is_none());
    assert!(public.get("final_price").is_none());

    let (_, stranger) = get_json(&app, &uri, Some(DRIVER_B)).await;
    assert!(stranger.get("client_id").is_none());

    let (_, driver) = get_json(&app, &uri, Some(DRIVER_A)).await;
    assert_eq!(driver["client_id"], order["client_id"]);
    assert_eq!(driver["final_price"], 100.0);

    let (status, _) = get_json(&app, &uri, Some("forged-token")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = get_json(&app, "/orders/ORD-00000000-XXXX/track", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn bid_stats_reflect_outcomes() {
    let (app, _rx) = setup();
    let order_id = searching_order(&app, 5.0).await;
    let winning = body_json(place_bid(&app, &order_id, DRIVER_A, 100.0).await).await;
    place_bid(&app, &order_id, DRIVER_B, 120.0).await;
    accept(&app, &winning).await;

    let (status, stats) = get_json(&app, "/bids/stats/my", Some(DRIVER_A)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(stats["total_bids"], 1);
    assert_eq!(stats["accepted_bids"], 1);
    assert_eq!(stats["success_rate"], 100.0);
    assert_eq!(stats["total_earnings"], 100.0);

    let (_, stats) = get_json(&app, "/bids/stats/my", Some(DRIVER_B)).await;
    assert_eq!(stats["rejected_bids"], 1);
    assert_eq!(stats["success_rate"], 0.0);

    let (status, _) = get_json(&app, "/bids/stats/my", Some(CLIENT)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn unread_count_covers_the_callers_orders() {
    let (app, _rx) = setup();
    let order_id = searching_order(&app, 5.0).await;
    let bid = body_json(place_bid(&app, &order_id, DRIVER_A, 100.0).await).await;
    accept(&app, &bid).await;
    for content in ["loading bay 2", "call on arrival"] {
        let response = app
            .clone()
            .oneshot(json_request(
                "POST",
                &format!("/orders/{order_id}/messages"),
                CLIENT,
                json!({ "content": content }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
    }

    let (status, summary) = get_json(&app, "/chat/unread-count", Some(DRIVER_A)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["total_unread"], 2);
    assert_eq!(summary["orders_with_unread"][0]["order_id"], order_id.as_str());
    assert_eq!(summary["orders_with_unread"][0]["last_message"]["content"], "call on arrival");

    let (_, summary) = get_json(&app, "/chat/unread-count", Some(CLIENT)).await;
    assert_eq!(summary["total_unread"], 0);

    get_json(&app, &format!("/orders/{order_id}/messages"), Some(DRIVER_A)).await;
    let (_, summary) = get_json(&app, "/chat/unread-count", Some(DRIVER_A)).await;
    assert_eq!(summary["total_unread"], 0);
}

#[tokio::test]
async fn driver_location_history_is_restricted() {
    let (app, _rx) = setup();
    let order_id = searching_order(&app, 5.0).await;
    let bid = body_json(place_bid(&app, &order_id, DRIVER_A, 100.0).await).await;
    accept(&app, &bid).await;
    let uri = format!(
        "/track/driver/{}/locations?hours=2&limit=10",
        bid["driver_id"].as_str().unwrap()
    );

    let (status, history) = get_json(&app, &uri, Some(CLIENT)).await;
    assert_eq!(status, StatusCode::OK);
    assert!(history.as_array().unwrap().is_empty());

    let (status, _) = get_json(&app, &uri, Some(DRIVER_A)).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = get_json(&app, &uri, Some(DRIVER_B)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}
