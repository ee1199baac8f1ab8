use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::engine::notify::NotificationDispatcher;
use crate::engine::scoring::{rank_bids, RankedBid};
use crate::error::{AppError, BidRejection, StoreError};
use crate::geo::pricing::{self, settle, Quote};
use crate::geo::{route_distance_km, GeoPoint};
use crate::models::bid::{Bid, BidStatus};
use crate::models::notification::{Notification, NotificationKind};
use crate::models::order::{Cargo, Order, OrderStatus};
use crate::models::user::Role;
use crate::observability::metrics::Metrics;
use crate::realtime::events::{AdminNotice, BidStatusEvent, OrderStatusEvent, ServerEvent};
use crate::realtime::registry::ConnectionRegistry;
use crate::store::{AcceptBidWrite, AcceptanceRecord, CancellationRecord, DomainStore};

const ORDER_NUMBER_ATTEMPTS: usize = 8;
const MAX_BID_MESSAGE_CHARS: usize = 500;

#[derive(Debug, Clone, Deserialize)]
pub struct OrderDraft {
    pub pickup_address: String,
    pub pickup: GeoPoint,
    pub dropoff_address: String,
    pub dropoff: GeoPoint,
    pub cargo: Cargo,
    pub desired_price: f64,
    #[serde(default)]
    pub pickup_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct QuoteRequest {
    pub pickup: GeoPoint,
    pub dropoff: GeoPoint,
    pub weight: f64,
    pub volume: f64,
}

/// Owns every legal Order and Bid transition. Each successful transition is
/// pushed to the order's chat room and to the parties' notification feeds
/// before the call returns.
pub struct LifecycleEngine {
    store: Arc<dyn DomainStore>,
    registry: Arc<ConnectionRegistry>,
    notifier: Arc<dyn NotificationDispatcher>,
    metrics: Metrics,
}

impl LifecycleEngine {
    pub fn new(
        store: Arc<dyn DomainStore>,
        registry: Arc<ConnectionRegistry>,
        notifier: Arc<dyn NotificationDispatcher>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            metrics,
        }
    }

    pub fn create_order(&self, actor: Identity, draft: OrderDraft) -> Result<Order, AppError> {
        if actor.role != Role::Client {
            return Err(AppError::Forbidden("only clients can create orders".to_string()));
        }
        validate_draft(&draft)?;

        let now = Utc::now();
        let order = Order {
            id: Uuid::new_v4(),
            order_number: String::new(),
            client_id: actor.user_id,
            driver_id: None,
            status: OrderStatus::Draft,
            pickup_address: draft.pickup_address.trim().to_string(),
            pickup: draft.pickup,
            dropoff_address: draft.dropoff_address.trim().to_string(),
            dropoff: draft.dropoff,
            distance_km: route_distance_km(&draft.pickup, &draft.dropoff),
            cargo: draft.cargo,
            desired_price: draft.desired_price,
            settlement: None,
            pickup_date: draft.pickup_date,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let order = self.insert_with_unique_number(order, generate_order_number)?;
        info!(
            order_id = %order.id,
            order_number = %order.order_number,
            client_id = %order.client_id,
            distance_km = order.distance_km,
            "order created"
        );
        Ok(order)
    }

    fn insert_with_unique_number(
        &self,
        mut order: Order,
        mut next_number: impl FnMut() -> String,
    ) -> Result<Order, AppError> {
        for attempt in 1..=ORDER_NUMBER_ATTEMPTS {
            order.order_number = next_number();
            match self.store.insert_order(order.clone()) {
                Ok(()) => return Ok(order),
                Err(StoreError::Duplicate(_)) => {
                    debug!(attempt, order_number = %order.order_number, "order number taken; retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(AppError::Internal(
            "could not allocate a unique order number".to_string(),
        ))
    }

    pub fn publish_order(&self, actor: Identity, order_id: Uuid) -> Result<Order, AppError> {
        let order = self.load_order(order_id)?;
        ensure_owner_or_admin(actor, &order)?;
        if order.status != OrderStatus::Draft {
            return Err(AppError::InvalidState(format!(
                "only draft orders can be published; order is {}",
                order.status
            )));
        }

        let order = self.store.transition_order(
            order_id,
            OrderStatus::Draft,
            OrderStatus::Searching,
            Utc::now(),
        )?;
        self.announce_transition(&order, OrderStatus::Draft, actor.user_id);

        let notice = AdminNotice::new(
            NotificationKind::NewOrder,
            json!({
                "order_id": order.id,
                "order_number": order.order_number,
                "client_id": order.client_id,
                "published_by": actor.user_id,
                "distance_km": order.distance_km,
                "desired_price": order.desired_price,
            }),
        );
        self.registry
            .broadcast_admins(&ServerEvent::AdminNotification(notice));
        Ok(order)
    }

    pub fn place_bid(
        &self,
        actor: Identity,
        order_id: Uuid,
        proposed_price: f64,
        message: Option<String>,
    ) -> Result<Bid, AppError> {
        if actor.role != Role::Driver {
            return Err(AppError::Forbidden("only drivers can bid".to_string()));
        }
        if !(proposed_price.is_finite() && proposed_price > 0.0) {
            return Err(AppError::Validation("proposed price must be positive".to_string()));
        }
        let message = message
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty());
        if message
            .as_ref()
            .is_some_and(|text| text.chars().count() > MAX_BID_MESSAGE_CHARS)
        {
            return Err(AppError::Validation(format!(
                "bid message exceeds {MAX_BID_MESSAGE_CHARS} characters"
            )));
        }

        let order = self.load_order(order_id)?;
        let result = self
            .check_bid(actor, &order)
            .and_then(|()| {
                let now = Utc::now();
                let bid = Bid {
                    id: Uuid::new_v4(),
                    order_id,
                    driver_id: actor.user_id,
                    proposed_price,
                    message,
                    status: BidStatus::Pending,
                    created_at: now,
                    updated_at: now,
                };
                self.store
                    .insert_bid(bid.clone())
                    .map(|()| bid)
                    .map_err(|err| match err {
                        StoreError::Duplicate(_) => AppError::BidRejected(BidRejection::Duplicate),
                        StoreError::Conflict(_) => {
                            AppError::BidRejected(BidRejection::OrderNotOpen)
                        }
                        other => other.into(),
                    })
            });

        match &result {
            Ok(bid) => {
                self.metrics.bids_total.with_label_values(&["placed"]).inc();
                info!(
                    bid_id = %bid.id,
                    order_id = %order_id,
                    driver_id = %actor.user_id,
                    proposed_price,
                    "bid placed"
                );
                self.notifier.dispatch(Notification::new(
                    order.client_id,
                    NotificationKind::NewBidReceived,
                    json!({
                        "bid_id": bid.id,
                        "order_id": order_id,
                        "order_number": order.order_number,
                        "proposed_price": proposed_price,
                    }),
                ));
            }
            Err(AppError::BidRejected(reason)) => {
                self.metrics
                    .bids_total
                    .with_label_values(&[reason.code()])
                    .inc();
                info!(order_id = %order_id, driver_id = %actor.user_id, reason = reason.code(), "bid refused");
            }
            Err(_) => {}
        }
        result
    }

    fn check_bid(&self, actor: Identity, order: &Order) -> Result<(), AppError> {
        if order.status != OrderStatus::Searching {
            return Err(AppError::BidRejected(BidRejection::OrderNotOpen));
        }
        if order.client_id == actor.user_id {
            return Err(AppError::BidRejected(BidRejection::OwnOrder));
        }

        let profile = match self.store.get_driver_profile(actor.user_id)? {
            Some(profile) if profile.is_verified() => profile,
            _ => return Err(AppError::BidRejected(BidRejection::Unverified)),
        };

        let holds_live_bid = self
            .store
            .bids_for_order(order.id)?
            .iter()
            .any(|bid| bid.driver_id == actor.user_id && bid.status != BidStatus::Cancelled);
        if holds_live_bid {
            return Err(AppError::BidRejected(BidRejection::Duplicate));
        }

        if !profile.can_carry(order.cargo.weight, order.cargo.volume) {
            return Err(AppError::BidRejected(BidRejection::OverCapacity {
                required_weight: order.cargo.weight,
                required_volume: order.cargo.volume,
                max_weight: profile.max_weight,
                max_volume: profile.max_volume,
            }));
        }
        Ok(())
    }

    /// Accepts one pending bid. Sibling rejection, driver assignment and the
    /// settlement amounts land in the same store write; a concurrent accept
    /// on the same order loses with `InvalidState`.
    pub fn accept_bid(&self, actor: Identity, bid_id: Uuid) -> Result<AcceptanceRecord, AppError> {
        let started = Instant::now();
        let result = self.try_accept(actor, bid_id);

        let outcome = if result.is_ok() { "accepted" } else { "error" };
        self.metrics
            .acceptance_latency_seconds
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());

        let record = result?;
        info!(
            order_id = %record.order.id,
            bid_id = %record.accepted.id,
            driver_id = %record.accepted.driver_id,
            final_price = record.accepted.proposed_price,
            rejected = record.rejected.len(),
            "bid accepted"
        );

        self.announce_transition(&record.order, OrderStatus::Searching, actor.user_id);
        self.announce_bid(&record.accepted, BidStatus::Pending);
        self.notifier.dispatch(Notification::new(
            record.accepted.driver_id,
            NotificationKind::BidAccepted,
            json!({
                "bid_id": record.accepted.id,
                "order_id": record.order.id,
                "order_number": record.order.order_number,
                "final_price": record.accepted.proposed_price,
            }),
        ));
        for rejected in &record.rejected {
            self.announce_bid(rejected, BidStatus::Pending);
            self.notify_bid_rejected(rejected, &record.order);
        }
        Ok(record)
    }

    fn try_accept(&self, actor: Identity, bid_id: Uuid) -> Result<AcceptanceRecord, AppError> {
        let bid = self.load_bid(bid_id)?;
        let order = self.load_order(bid.order_id)?;
        ensure_owner_or_admin(actor, &order)?;

        if bid.status != BidStatus::Pending {
            return Err(AppError::InvalidState(format!(
                "bid is {} and can no longer be accepted",
                bid.status
            )));
        }
        if order.status != OrderStatus::Searching {
            return Err(AppError::InvalidState(format!(
                "order is {} and no longer accepts bids",
                order.status
            )));
        }

        let record = self.store.commit_acceptance(AcceptBidWrite {
            order_id: order.id,
            bid_id,
            settlement: settle(bid.proposed_price),
            at: Utc::now(),
        })?;
        Ok(record)
    }

    pub fn reject_bid(&self, actor: Identity, bid_id: Uuid) -> Result<Bid, AppError> {
        let bid = self.load_bid(bid_id)?;
        let order = self.load_order(bid.order_id)?;
        ensure_owner_or_admin(actor, &order)?;

        let bid = self.move_pending_bid(&bid, BidStatus::Rejected)?;
        info!(bid_id = %bid.id, order_id = %order.id, "bid rejected");

        self.announce_bid(&bid, BidStatus::Pending);
        self.notify_bid_rejected(&bid, &order);
        Ok(bid)
    }

    pub fn cancel_bid(&self, actor: Identity, bid_id: Uuid) -> Result<Bid, AppError> {
        let bid = self.load_bid(bid_id)?;
        if bid.driver_id != actor.user_id {
            return Err(AppError::Forbidden(
                "only the bidding driver can cancel a bid".to_string(),
            ));
        }
        let order = self.load_order(bid.order_id)?;

        let bid = self.move_pending_bid(&bid, BidStatus::Cancelled)?;
        info!(bid_id = %bid.id, order_id = %order.id, "bid cancelled");

        self.announce_bid(&bid, BidStatus::Pending);
        self.notifier.dispatch(Notification::new(
            order.client_id,
            NotificationKind::BidCancelled,
            json!({ "bid_id": bid.id, "order_id": order.id, "order_number": order.order_number }),
        ));
        Ok(bid)
    }

    fn move_pending_bid(&self, bid: &Bid, to: BidStatus) -> Result<Bid, AppError> {
        if bid.status != BidStatus::Pending {
            return Err(AppError::InvalidState(format!(
                "bid is {} and can no longer be changed",
                bid.status
            )));
        }
        Ok(self
            .store
            .update_bid_status(bid.id, BidStatus::Pending, to, Utc::now())?)
    }

    pub fn cancel_order(
        &self,
        actor: Identity,
        order_id: Uuid,
    ) -> Result<CancellationRecord, AppError> {
        let order = self.load_order(order_id)?;
        ensure_owner_or_admin(actor, &order)?;
        if !order.status.is_cancellable() {
            return Err(AppError::InvalidState(format!(
                "order is {} and cannot be cancelled",
                order.status
            )));
        }

        let record = self.store.cancel_order(order_id, Utc::now())?;
        info!(
            order_id = %order_id,
            previous_status = %record.previous_status,
            rejected = record.rejected.len(),
            "order cancelled"
        );

        self.announce_transition(&record.order, record.previous_status, actor.user_id);
        for rejected in &record.rejected {
            self.announce_bid(rejected, BidStatus::Pending);
            self.notify_bid_rejected(rejected, &record.order);
        }
        Ok(record)
    }

    /// Pickup, departure and arrival: `driver_assigned → loading → en_route
    /// → unloading`.
    pub fn advance_order(
        &self,
        actor: Identity,
        order_id: Uuid,
        next: OrderStatus,
    ) -> Result<Order, AppError> {
        if !matches!(
            next,
            OrderStatus::Loading | OrderStatus::EnRoute | OrderStatus::Unloading
        ) {
            return Err(AppError::Validation(format!(
                "{next} is not reachable through advance"
            )));
        }

        let order = self.load_order(order_id)?;
        ensure_driver_or_admin(actor, &order)?;
        if !order.status.can_transition_to(next) {
            return Err(AppError::InvalidState(format!(
                "cannot move order from {} to {next}",
                order.status
            )));
        }

        let previous = order.status;
        let order = self
            .store
            .transition_order(order_id, previous, next, Utc::now())?;
        self.announce_transition(&order, previous, actor.user_id);
        Ok(order)
    }

    pub fn complete_order(&self, actor: Identity, order_id: Uuid) -> Result<Order, AppError> {
        let order = self.load_order(order_id)?;
        ensure_driver_or_admin(actor, &order)?;
        if !matches!(order.status, OrderStatus::EnRoute | OrderStatus::Unloading) {
            return Err(AppError::InvalidState(format!(
                "order is {} and cannot be completed",
                order.status
            )));
        }

        let previous = order.status;
        let order = self.store.complete_order(order_id, Utc::now())?;
        self.announce_transition(&order, previous, actor.user_id);
        Ok(order)
    }

    pub fn settle_order(&self, actor: Identity, order_id: Uuid) -> Result<Order, AppError> {
        if !actor.is_admin() {
            return Err(AppError::Forbidden("only admins settle payments".to_string()));
        }
        let order = self.load_order(order_id)?;
        if order.status != OrderStatus::Completed {
            return Err(AppError::InvalidState(format!(
                "order is {} and cannot be settled",
                order.status
            )));
        }

        let order = self.store.transition_order(
            order_id,
            OrderStatus::Completed,
            OrderStatus::Paid,
            Utc::now(),
        )?;
        self.announce_transition(&order, OrderStatus::Completed, actor.user_id);
        Ok(order)
    }

    /// Participants and admins always; drivers may also look at orders that
    /// are open for bidding.
    pub fn get_order(&self, actor: Identity, order_id: Uuid) -> Result<Order, AppError> {
        let order = self.load_order(order_id)?;
        let open_to_driver = actor.role == Role::Driver && order.status == OrderStatus::Searching;
        if actor.is_admin() || order.is_participant(actor.user_id) || open_to_driver {
            Ok(order)
        } else {
            Err(AppError::Forbidden("not a party to this order".to_string()))
        }
    }

    pub fn list_bids(&self, actor: Identity, order_id: Uuid) -> Result<Vec<Bid>, AppError> {
        let order = self.load_order(order_id)?;
        let bids = self.store.bids_for_order(order_id)?;

        if actor.is_admin() || order.client_id == actor.user_id {
            Ok(bids)
        } else if actor.role == Role::Driver {
            Ok(bids
                .into_iter()
                .filter(|bid| bid.driver_id == actor.user_id)
                .collect())
        } else {
            Err(AppError::Forbidden("not a party to this order".to_string()))
        }
    }

    pub fn my_bids(&self, actor: Identity) -> Result<Vec<Bid>, AppError> {
        if actor.role != Role::Driver {
            return Err(AppError::Forbidden("only drivers have bids".to_string()));
        }
        Ok(self.store.bids_for_driver(actor.user_id)?)
    }

    pub fn rank_bids(
        &self,
        actor: Identity,
        order_id: Uuid,
        limit: usize,
    ) -> Result<Vec<RankedBid>, AppError> {
        let order = self.load_order(order_id)?;
        ensure_owner_or_admin(actor, &order)?;

        let mut candidates = Vec::new();
        for bid in self.store.bids_for_order(order_id)? {
            if bid.status != BidStatus::Pending {
                continue;
            }
            let rating = self
                .store
                .get_user(bid.driver_id)?
                .map(|driver| driver.rating)
                .unwrap_or(0.0);
            candidates.push((bid, rating));
        }
        Ok(rank_bids(candidates, limit))
    }

    pub fn quote(&self, request: QuoteRequest) -> Result<Quote, AppError> {
        if !request.pickup.is_valid() || !request.dropoff.is_valid() {
            return Err(AppError::Validation("coordinates out of range".to_string()));
        }
        if !(request.weight.is_finite() && request.weight >= 0.0)
            || !(request.volume.is_finite() && request.volume >= 0.0)
        {
            return Err(AppError::Validation(
                "weight and volume must be non-negative".to_string(),
            ));
        }
        let distance_km = route_distance_km(&request.pickup, &request.dropoff);
        Ok(pricing::quote(distance_km, request.weight, request.volume))
    }

    fn load_order(&self, order_id: Uuid) -> Result<Order, AppError> {
        self.store
            .get_order(order_id)?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))
    }

    fn load_bid(&self, bid_id: Uuid) -> Result<Bid, AppError> {
        self.store
            .get_bid(bid_id)?
            .ok_or_else(|| AppError::NotFound(format!("bid {bid_id}")))
    }

    fn announce_transition(&self, order: &Order, previous: OrderStatus, actor_id: Uuid) {
        self.metrics
            .order_transitions_total
            .with_label_values(&[order.status.as_str()])
            .inc();
        info!(
            order_id = %order.id,
            from = %previous,
            to = %order.status,
            "order status changed"
        );

        let event = OrderStatusEvent::new(order, previous);
        let delivery = self.registry.broadcast_to_room(
            order.id,
            &ServerEvent::OrderStatusChanged(event.clone()),
            None,
        );
        if delivery.dropped > 0 {
            warn!(order_id = %order.id, dropped = delivery.dropped, "status change missed some room members");
        }

        let kind = match order.status {
            OrderStatus::Cancelled => NotificationKind::OrderCancelled,
            OrderStatus::Completed => NotificationKind::OrderCompleted,
            _ => NotificationKind::OrderStatusChanged,
        };
        let parties = std::iter::once(order.client_id).chain(order.driver_id);
        for user_id in parties.filter(|user_id| *user_id != actor_id) {
            self.notifier.dispatch(Notification::new(
                user_id,
                kind,
                json!({
                    "order_id": event.order_id,
                    "order_number": event.order_number,
                    "old_status": event.old_status,
                    "new_status": event.new_status,
                }),
            ));
        }
    }

    fn announce_bid(&self, bid: &Bid, previous: BidStatus) {
        self.registry.broadcast_to_room(
            bid.order_id,
            &ServerEvent::BidStatusChanged(BidStatusEvent::new(bid, previous)),
            None,
        );
    }

    fn notify_bid_rejected(&self, bid: &Bid, order: &Order) {
        self.notifier.dispatch(Notification::new(
            bid.driver_id,
            NotificationKind::BidRejected,
            json!({
                "bid_id": bid.id,
                "order_id": order.id,
                "order_number": order.order_number,
            }),
        ));
    }
}

fn ensure_owner_or_admin(actor: Identity, order: &Order) -> Result<(), AppError> {
    if actor.is_admin() || order.client_id == actor.user_id {
        Ok(())
    } else {
        Err(AppError::Forbidden("only the order's client can do this".to_string()))
    }
}

fn ensure_driver_or_admin(actor: Identity, order: &Order) -> Result<(), AppError> {
    if actor.is_admin() || order.driver_id == Some(actor.user_id) {
        Ok(())
    } else {
        Err(AppError::Forbidden(
            "only the assigned driver can do this".to_string(),
        ))
    }
}

fn validate_draft(draft: &OrderDraft) -> Result<(), AppError> {
    fn min_chars(field: &str, value: &str, min: usize) -> Result<(), AppError> {
        if value.trim().chars().count() < min {
            return Err(AppError::Validation(format!(
                "{field} must be at least {min} characters"
            )));
        }
        Ok(())
    }
    fn positive(field: &str, value: f64) -> Result<(), AppError> {
        if !(value.is_finite() && value > 0.0) {
            return Err(AppError::Validation(format!("{field} must be positive")));
        }
        Ok(())
    }

    if !draft.pickup.is_valid() {
        return Err(AppError::Validation("pickup coordinates out of range".to_string()));
    }
    if !draft.dropoff.is_valid() {
        return Err(AppError::Validation("dropoff coordinates out of range".to_string()));
    }
    min_chars("pickup_address", &draft.pickup_address, 3)?;
    min_chars("dropoff_address", &draft.dropoff_address, 3)?;
    min_chars("cargo description", &draft.cargo.description, 5)?;
    min_chars("cargo kind", &draft.cargo.kind, 2)?;
    positive("cargo weight", draft.cargo.weight)?;
    positive("cargo volume", draft.cargo.volume)?;
    positive("desired_price", draft.desired_price)?;
    Ok(())
}

/// `CP`, two uppercase letters, six digits.
fn generate_order_number() -> String {
    let mut rng = OsRng;
    let letters: String = (0..2)
        .map(|_| char::from(b'A' + (rng.next_u32() % 26) as u8))
        .collect();
    format!("CP{letters}{:06}", rng.next_u32() % 1_000_000)
}
