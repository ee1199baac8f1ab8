use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

use crate::error::StoreError;
use crate::models::bid::{Bid, BidStatus};
use crate::models::driver::DriverProfile;
use crate::models::location::LocationUpdate;
use crate::models::message::Message;
use crate::models::order::{Order, OrderStatus};
use crate::models::user::User;
use crate::store::{
    AcceptBidWrite, AcceptanceRecord, CancellationRecord, DomainStore, OrderFilter, StoreCounts,
    UserRemoval,
};

/// In-process store on sharded maps.
///
/// Lock order is `order_numbers → orders → bids → profiles`. An order-scoped
/// write holds the order's entry guard for its whole duration; no method
/// takes an `orders` guard while holding a guard on a later map.
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    profiles: DashMap<Uuid, DriverProfile>,
    orders: DashMap<Uuid, Order>,
    order_numbers: DashMap<String, Uuid>,
    bids: DashMap<Uuid, Bid>,
    messages: DashMap<Uuid, Vec<Message>>,
    locations: DashMap<Uuid, Vec<LocationUpdate>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caller must hold the order's guard.
    fn reject_pending_bids(&self, order_id: Uuid, at: DateTime<Utc>) -> Vec<Bid> {
        let pending: Vec<Uuid> = self
            .bids
            .iter()
            .filter(|entry| entry.order_id == order_id && entry.status == BidStatus::Pending)
            .map(|entry| entry.id)
            .collect();

        pending
            .into_iter()
            .filter_map(|id| {
                let mut bid = self.bids.get_mut(&id)?;
                bid.status = BidStatus::Rejected;
                bid.updated_at = at;
                Some(bid.value().clone())
            })
            .collect()
    }
}

fn not_found(kind: &str, id: Uuid) -> StoreError {
    StoreError::NotFound(format!("{kind} {id}"))
}

impl DomainStore for MemoryStore {
    fn insert_user(&self, user: User) -> Result<(), StoreError> {
        match self.users.entry(user.id) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!("user {}", user.id))),
            Entry::Vacant(slot) => {
                slot.insert(user);
                Ok(())
            }
        }
    }

    fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|entry| entry.value().clone()))
    }

    fn apply_rating(&self, user_id: Uuid, score: u8) -> Result<User, StoreError> {
        let mut user = self
            .users
            .get_mut(&user_id)
            .ok_or_else(|| not_found("user", user_id))?;
        user.apply_rating(score);
        Ok(user.value().clone())
    }

    fn delete_user_cascade(&self, user_id: Uuid) -> Result<UserRemoval, StoreError> {
        self.users
            .remove(&user_id)
            .ok_or_else(|| not_found("user", user_id))?;
        self.profiles.remove(&user_id);

        let owned_bids: Vec<(Uuid, Uuid)> = self
            .bids
            .iter()
            .filter(|entry| entry.driver_id == user_id)
            .map(|entry| (entry.id, entry.order_id))
            .collect();

        let mut bids_removed = 0;
        for (bid_id, order_id) in owned_bids {
            // Serialize with in-flight writes on the same order.
            let _order = self.orders.get(&order_id);
            if self.bids.remove(&bid_id).is_some() {
                bids_removed += 1;
            }
        }

        let locations_removed = self
            .locations
            .remove(&user_id)
            .map(|(_, history)| history.len())
            .unwrap_or(0);

        Ok(UserRemoval {
            bids_removed,
            locations_removed,
        })
    }

    fn upsert_driver_profile(&self, profile: DriverProfile) -> Result<(), StoreError> {
        if !self.users.contains_key(&profile.user_id) {
            return Err(not_found("user", profile.user_id));
        }
        self.profiles.insert(profile.user_id, profile);
        Ok(())
    }

    fn get_driver_profile(&self, driver_id: Uuid) -> Result<Option<DriverProfile>, StoreError> {
        Ok(self.profiles.get(&driver_id).map(|entry| entry.value().clone()))
    }

    fn record_position(
        &self,
        driver_id: Uuid,
        lat: f64,
        lng: f64,
        at: DateTime<Utc>,
    ) -> Result<DriverProfile, StoreError> {
        let mut profile = self
            .profiles
            .get_mut(&driver_id)
            .ok_or_else(|| not_found("driver profile", driver_id))?;
        profile.current_lat = Some(lat);
        profile.current_lng = Some(lng);
        profile.is_online = true;
        profile.updated_at = at;
        Ok(profile.value().clone())
    }

    fn set_online(&self, driver_id: Uuid, online: bool) -> Result<(), StoreError> {
        let mut profile = self
            .profiles
            .get_mut(&driver_id)
            .ok_or_else(|| not_found("driver profile", driver_id))?;
        profile.is_online = online;
        profile.updated_at = Utc::now();
        Ok(())
    }

    fn insert_order(&self, order: Order) -> Result<(), StoreError> {
        match self.order_numbers.entry(order.order_number.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate(format!(
                "order number {}",
                order.order_number
            ))),
            Entry::Vacant(slot) => {
                slot.insert(order.id);
                self.orders.insert(order.id, order);
                Ok(())
            }
        }
    }

    fn get_order(&self, id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self.orders.get(&id).map(|entry| entry.value().clone()))
    }

    fn get_order_by_number(&self, number: &str) -> Result<Option<Order>, StoreError> {
        let Some(id) = self.order_numbers.get(number).map(|entry| *entry.value()) else {
            return Ok(None);
        };
        self.get_order(id)
    }

    fn transition_order(
        &self,
        order_id: Uuid,
        from: OrderStatus,
        to: OrderStatus,
        at: DateTime<Utc>,
    ) -> Result<Order, StoreError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| not_found("order", order_id))?;

        if order.status != from {
            return Err(StoreError::Conflict(format!(
                "order is {}, expected {from}",
                order.status
            )));
        }

        order.status = to;
        order.updated_at = at;
        Ok(order.value().clone())
    }

    fn cancel_order(
        &self,
        order_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<CancellationRecord, StoreError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| not_found("order", order_id))?;

        if !order.status.is_cancellable() {
            return Err(StoreError::Conflict(format!(
                "order is {} and can no longer be cancelled",
                order.status
            )));
        }

        let previous_status = order.status;
        let rejected = self.reject_pending_bids(order_id, at);
        order.status = OrderStatus::Cancelled;
        order.updated_at = at;

        Ok(CancellationRecord {
            order: order.value().clone(),
            previous_status,
            rejected,
        })
    }

    fn complete_order(&self, order_id: Uuid, at: DateTime<Utc>) -> Result<Order, StoreError> {
        let mut order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| not_found("order", order_id))?;

        if !order.status.can_transition_to(OrderStatus::Completed) {
            return Err(StoreError::Conflict(format!(
                "order is {} and cannot be completed",
                order.status
            )));
        }

        order.status = OrderStatus::Completed;
        order.completed_at = Some(at);
        order.updated_at = at;

        if let Some(driver_id) = order.driver_id {
            if let Some(mut profile) = self.profiles.get_mut(&driver_id) {
                profile.total_orders = profile.total_orders.saturating_add(1);
                profile.total_distance_km += order.distance_km;
                profile.updated_at = at;
            }
        }

        Ok(order.value().clone())
    }

    fn active_order_for_driver(&self, driver_id: Uuid) -> Result<Option<Order>, StoreError> {
        Ok(self
            .orders
            .iter()
            .filter(|entry| entry.driver_id == Some(driver_id) && entry.status.is_in_flight())
            .map(|entry| entry.value().clone())
            .max_by_key(|order| order.updated_at))
    }

    fn orders_for_client(&self, client_id: Uuid) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| entry.client_id == client_id)
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by_key(|order| std::cmp::Reverse(order.created_at));
        Ok(orders)
    }

    fn find_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, StoreError> {
        let mut orders: Vec<Order> = self
            .orders
            .iter()
            .filter(|entry| filter.matches(entry.value()))
            .map(|entry| entry.value().clone())
            .collect();
        orders.sort_by_key(|order| std::cmp::Reverse(order.created_at));
        Ok(orders)
    }

    fn insert_bid(&self, bid: Bid) -> Result<(), StoreError> {
        let order = self
            .orders
            .get_mut(&bid.order_id)
            .ok_or_else(|| not_found("order", bid.order_id))?;

        if order.status != OrderStatus::Searching {
            return Err(StoreError::Conflict(format!(
                "order is {} and not open for bidding",
                order.status
            )));
        }

        let duplicate = self.bids.iter().any(|entry| {
            entry.order_id == bid.order_id
                && entry.driver_id == bid.driver_id
                && entry.status != BidStatus::Cancelled
        });
        if duplicate {
            return Err(StoreError::Duplicate(format!(
                "bid by driver {} on order {}",
                bid.driver_id, bid.order_id
            )));
        }

        self.bids.insert(bid.id, bid);
        drop(order);
        Ok(())
    }

    fn get_bid(&self, id: Uuid) -> Result<Option<Bid>, StoreError> {
        Ok(self.bids.get(&id).map(|entry| entry.value().clone()))
    }

    fn bids_for_order(&self, order_id: Uuid) -> Result<Vec<Bid>, StoreError> {
        // Shared guard: never observe half of an acceptance.
        let _order = self
            .orders
            .get(&order_id)
            .ok_or_else(|| not_found("order", order_id))?;

        let mut bids: Vec<Bid> = self
            .bids
            .iter()
            .filter(|entry| entry.order_id == order_id)
            .map(|entry| entry.value().clone())
            .collect();
        bids.sort_by_key(|bid| bid.created_at);
        Ok(bids)
    }

    fn bids_for_driver(&self, driver_id: Uuid) -> Result<Vec<Bid>, StoreError> {
        let mut bids: Vec<Bid> = self
            .bids
            .iter()
            .filter(|entry| entry.driver_id == driver_id)
            .map(|entry| entry.value().clone())
            .collect();
        bids.sort_by_key(|bid| std::cmp::Reverse(bid.created_at));
        Ok(bids)
    }

    fn update_bid_status(
        &self,
        bid_id: Uuid,
        from: BidStatus,
        to: BidStatus,
        at: DateTime<Utc>,
    ) -> Result<Bid, StoreError> {
        let order_id = self
            .bids
            .get(&bid_id)
            .map(|entry| entry.order_id)
            .ok_or_else(|| not_found("bid", bid_id))?;

        let _order = self
            .orders
            .get_mut(&order_id)
            .ok_or_else(|| not_found("order", order_id))?;

        let mut bid = self
            .bids
            .get_mut(&bid_id)
            .ok_or_else(|| not_found("bid", bid_id))?;

        if bid.status != from {
            return Err(StoreError::Conflict(format!(
                "bid is {}, expected {from}",
                bid.status
            )));
        }

        bid.status = to;
        bid.updated_at = at;
        Ok(bid.value().clone())
    }

    fn commit_acceptance(&self, write: AcceptBidWrite) -> Result<AcceptanceRecord, StoreError> {
        let mut order = self
            .orders
            .get_mut(&write.order_id)
            .ok_or_else(|| not_found("order", write.order_id))?;

        if order.status != OrderStatus::Searching {
            return Err(StoreError::Conflict(format!(
                "order is {} and no longer accepts bids",
                order.status
            )));
        }

        // All checks happen before the first write; nothing below can fail.
        let accepted = {
            let mut bid = self
                .bids
                .get_mut(&write.bid_id)
                .ok_or_else(|| not_found("bid", write.bid_id))?;

            if bid.order_id != write.order_id {
                return Err(StoreError::Conflict(format!(
                    "bid {} belongs to another order",
                    write.bid_id
                )));
            }
            if bid.status != BidStatus::Pending {
                return Err(StoreError::Conflict(format!(
                    "bid is {} and can no longer be accepted",
                    bid.status
                )));
            }

            bid.status = BidStatus::Accepted;
            bid.updated_at = write.at;
            bid.value().clone()
        };

        let rejected = self.reject_pending_bids(write.order_id, write.at);

        order.driver_id = Some(accepted.driver_id);
        order.status = OrderStatus::DriverAssigned;
        order.settlement = Some(write.settlement);
        order.updated_at = write.at;

        Ok(AcceptanceRecord {
            order: order.value().clone(),
            accepted,
            rejected,
        })
    }

    fn append_message(&self, message: Message) -> Result<(), StoreError> {
        if !self.orders.contains_key(&message.order_id) {
            return Err(not_found("order", message.order_id));
        }
        self.messages
            .entry(message.order_id)
            .or_default()
            .push(message);
        Ok(())
    }

    fn messages_for_order(
        &self,
        order_id: Uuid,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .messages
            .get(&order_id)
            .map(|room| room.iter().skip(offset).take(limit).cloned().collect())
            .unwrap_or_default())
    }

    fn recent_messages(&self, order_id: Uuid, limit: usize) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .messages
            .get(&order_id)
            .map(|room| {
                let start = room.len().saturating_sub(limit);
                room[start..].to_vec()
            })
            .unwrap_or_default())
    }

    fn mark_messages_read(&self, order_id: Uuid, reader: Uuid) -> Result<usize, StoreError> {
        let Some(mut room) = self.messages.get_mut(&order_id) else {
            return Ok(0);
        };

        let mut updated = 0;
        for message in room.iter_mut() {
            if message.sender_id != reader && !message.is_read {
                message.is_read = true;
                updated += 1;
            }
        }
        Ok(updated)
    }

    fn unread_count(&self, order_id: Uuid, reader: Uuid) -> Result<usize, StoreError> {
        Ok(self
            .messages
            .get(&order_id)
            .map(|room| {
                room.iter()
                    .filter(|message| message.sender_id != reader && !message.is_read)
                    .count()
            })
            .unwrap_or(0))
    }

    fn append_location(&self, update: LocationUpdate) -> Result<(), StoreError> {
        self.locations
            .entry(update.driver_id)
            .or_default()
            .push(update);
        Ok(())
    }

    fn latest_location(&self, driver_id: Uuid) -> Result<Option<LocationUpdate>, StoreError> {
        Ok(self
            .locations
            .get(&driver_id)
            .and_then(|history| history.last().cloned()))
    }

    fn locations_for_order(&self, order_id: Uuid) -> Result<Vec<LocationUpdate>, StoreError> {
        let mut route: Vec<LocationUpdate> = self
            .locations
            .iter()
            .flat_map(|history| {
                history
                    .iter()
                    .filter(|update| update.order_id == Some(order_id))
                    .cloned()
                    .collect::<Vec<_>>()
            })
            .collect();
        route.sort_by_key(|update| update.timestamp);
        Ok(route)
    }

    fn locations_for_driver(
        &self,
        driver_id: Uuid,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<LocationUpdate>, StoreError> {
        Ok(self
            .locations
            .get(&driver_id)
            .map(|history| {
                history
                    .iter()
                    .rev()
                    .take_while(|update| update.timestamp >= since)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn counts(&self) -> StoreCounts {
        StoreCounts {
            users: self.users.len(),
            drivers: self.profiles.len(),
            orders: self.orders.len(),
            bids: self.bids.len(),
        }
    }
}
