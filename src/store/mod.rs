//! Persistence contract consumed by the lifecycle engine, the chat service
//! and the location pipeline.
//!
//! Any backend works as long as it honours the atomicity notes on the
//! order-scoped writes: every write that touches an order's bids runs under
//! that order's row lock, so bid placement, acceptance, rejection and
//! cancellation on the same order are totally ordered.

pub mod memory;

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::StoreError;
use crate::geo::pricing::Settlement;
use crate::models::bid::{Bid, BidStatus};
use crate::models::driver::DriverProfile;
use crate::models::location::LocationUpdate;
use crate::models::message::Message;
use crate::models::order::{Order, OrderStatus};
use crate::models::user::User;

pub use memory::MemoryStore;

/// The writes that make up one bid acceptance.
#[derive(Debug, Clone, Copy)]
pub struct AcceptBidWrite {
    pub order_id: Uuid,
    pub bid_id: Uuid,
    pub settlement: Settlement,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptanceRecord {
    pub order: Order,
    pub accepted: Bid,
    /// Sibling bids that were still pending and got rejected in the same unit.
    pub rejected: Vec<Bid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CancellationRecord {
    pub order: Order,
    pub previous_status: OrderStatus,
    pub rejected: Vec<Bid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserRemoval {
    pub bids_removed: usize,
    pub locations_removed: usize,
}

/// Conjunctive order filter; unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct OrderFilter {
    pub client_id: Option<Uuid>,
    pub driver_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub cargo_kind: Option<String>,
    /// Cargo must not be heavier than this.
    pub max_weight: Option<f64>,
    pub max_volume: Option<f64>,
}

impl OrderFilter {
    pub fn matches(&self, order: &Order) -> bool {
        self.client_id.is_none_or(|id| order.client_id == id)
            && self.driver_id.is_none_or(|id| order.driver_id == Some(id))
            && self.status.is_none_or(|status| order.status == status)
            && self.min_price.is_none_or(|min| order.desired_price >= min)
            && self.max_price.is_none_or(|max| order.desired_price <= max)
            && self
                .cargo_kind
                .as_deref()
                .is_none_or(|kind| order.cargo.kind == kind)
            && self.max_weight.is_none_or(|max| order.cargo.weight <= max)
            && self.max_volume.is_none_or(|max| order.cargo.volume <= max)
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct StoreCounts {
    pub users: usize,
    pub drivers: usize,
    pub orders: usize,
    pub bids: usize,
}

pub trait DomainStore: Send + Sync {
    // ── Users ─────────────────────────────────────────────────────────────

    fn insert_user(&self, user: User) -> Result<(), StoreError>;

    fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;

    /// Folds a review score into the user's running-average rating.
    fn apply_rating(&self, user_id: Uuid, score: u8) -> Result<User, StoreError>;

    /// Deletes a user together with their driver profile, every bid they
    /// placed and their location history.
    fn delete_user_cascade(&self, user_id: Uuid) -> Result<UserRemoval, StoreError>;

    // ── Driver profiles ───────────────────────────────────────────────────

    fn upsert_driver_profile(&self, profile: DriverProfile) -> Result<(), StoreError>;

    fn get_driver_profile(&self, driver_id: Uuid) -> Result<Option<DriverProfile>, StoreError>;

    /// Overwrites the live position and marks the driver online.
    fn record_position(
        &self,
        driver_id: Uuid,
        lat: f64,
        lng: f64,
        at: DateTime<Utc>,
    ) -> Result<DriverProfile, StoreError>;

    fn set_online(&self, driver_id: Uuid, online: bool) -> Result<(), StoreError>;

    // ── Orders ────────────────────────────────────────────────────────────

    /// Fails with `Duplicate` if the order number is already taken.
    fn insert_order(&self, order: Order) -> Result<(), StoreError>;

    fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError>;

    fn get_order_by_number(&self, number: &str) -> Result<Option<Order>, StoreError>;

    /// Compare-and-set on the order status. `Conflict` if the order is no
    /// longer in `from`.
    fn transition_order(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<Order, StoreError>;

    /// Cancels the order and rejects every pending bid on it, as one unit.
    fn cancel_order(&self, order_id: Uuid, at: DateTime<Utc>)
    -> Result<CancellationRecord, StoreError>;

    /// Completes the order and bumps the assigned driver's totals, as one unit.
    fn complete_order(&self, order_id: Uuid, at: DateTime<Utc>) -> Result<Order, StoreError>;

    /// Most recently updated in-flight order assigned to the driver.
    fn active_order_for_driver(&self, driver_id: Uuid) -> Result<Option<Order>, StoreError>;

    fn orders_for_client(&self, client_id: Uuid) -> Result<Vec<Order>, StoreError>;

    /// Every order matching `filter`, newest first.
    fn find_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError>;

    // ── Bids ──────────────────────────────────────────────────────────────

    /// Stores a pending bid. Under the order lock it re-checks that the
    /// order is still searching (`Conflict`) and that the driver holds no
    /// other non-cancelled bid on it (`Duplicate`).
    fn insert_bid(&self, bid: Bid) -> Result<(), StoreError>;

    fn get_bid(&self, id: Uuid) -> Result<Option<Bid>, StoreError>;

    fn bids_for_order(&self, order_id: Uuid) -> Result<Vec<Bid>, StoreError>;

    fn bids_for_driver(&self, driver_id: Uuid) -> Result<Vec<Bid>, StoreError>;

    /// Compare-and-set on a single bid's status.
    fn update_bid_status(
        &self,
        bid_id: Uuid,
        from: BidStatus,
        to: BidStatus,
        at: DateTime<Utc>,
    ) -> Result<Bid, StoreError>;

    /// Accepts one bid, rejects its pending siblings and assigns the driver
    /// with the settlement amounts, all or nothing. `Conflict` when the bid
    /// is no longer pending or the order is no longer searching.
    fn commit_acceptance(&self, write: AcceptBidWrite) -> Result<AcceptanceRecord, StoreError>;

    // ── Messages ──────────────────────────────────────────────────────────

    fn append_message(&self, message: Message) -> Result<(), StoreError>;

    /// Oldest first.
    fn messages_for_order(
        &self,
        order_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError>;

    /// The newest `limit` messages, oldest first.
    fn recent_messages(&self, order_id: Uuid, limit: usize) -> Result<Vec<Message>, StoreError>;

    /// Flags every message in the room not sent by `reader` as read.
    fn mark_messages_read(&self, order_id: Uuid, reader: Uuid) -> Result<usize, StoreError>;

    /// Messages in the room not sent by `reader` and not yet read.
    fn unread_count(&self, order_id: Uuid, reader: Uuid) -> Result<usize, StoreError>;

    // ── Locations ─────────────────────────────────────────────────────────

    fn append_location(&self, update: LocationUpdate) -> Result<(), StoreError>;

    fn latest_location(&self, driver_id: Uuid) -> Result<Option<LocationUpdate>, StoreError>;

    /// Oldest first.
    fn locations_for_order(&self, order_id: Uuid) -> Result<Vec<LocationUpdate>, StoreError>;

    /// The driver's samples taken at or after `since`, newest first, at most
    /// `limit` of them.
    fn locations_for_driver(
        &self,
        driver_id: Uuid,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LocationUpdate>, StoreError>;

    fn counts(&self) -> StoreCounts;
}
