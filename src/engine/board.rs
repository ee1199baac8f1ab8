use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::AppError;
use crate::geo::pricing::round2;
use crate::models::bid::{Bid, BidStatus};
use crate::models::order::{Order, OrderStatus};
use crate::models::user::Role;
use crate::store::{DomainStore, OrderFilter};

const DEFAULT_PAGE: usize = 100;
const MAX_PAGE: usize = 1000;

/// Listing parameters shared by the order queries.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OrderQuery {
    pub status: Option<OrderStatus>,
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub cargo_type: Option<String>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl OrderQuery {
    fn filter(&self) -> OrderFilter {
        OrderFilter {
            status: self.status,
            min_price: self.min_price,
            max_price: self.max_price,
            cargo_kind: self.cargo_type.clone(),
            ..OrderFilter::default()
        }
    }

    fn page(&self, orders: Vec<Order>) -> Vec<Order> {
        let limit = self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
        orders.into_iter().skip(self.offset).take(limit).collect()
    }
}

/// What anyone holding an order number may see.
#[derive(Debug, Clone, Serialize)]
pub struct OrderTracking {
    pub order_number: String,
    pub status: OrderStatus,
    pub pickup_address: String,
    pub dropoff_address: String,
    pub cargo_type: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub details: Option<TrackingDetails>,
}

/// Added for admins and the order's participants.
#[derive(Debug, Clone, Serialize)]
pub struct TrackingDetails {
    pub client_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub final_price: Option<f64>,
    pub distance_km: f64,
    pub pickup_date: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BidStats {
    pub total_bids: usize,
    pub accepted_bids: usize,
    pub pending_bids: usize,
    pub rejected_bids: usize,
    pub cancelled_bids: usize,
    /// Percentage of bids that were accepted.
    pub success_rate: f64,
    pub avg_accepted_price: f64,
    pub total_earnings: f64,
}

impl BidStats {
    pub fn from_bids(bids: &[Bid]) -> Self {
        let count = |status| bids.iter().filter(|bid| bid.status == status).count();
        let accepted: Vec<f64> = bids
            .iter()
            .filter(|bid| bid.status == BidStatus::Accepted)
            .map(|bid| bid.proposed_price)
            .collect();

        let total_earnings: f64 = accepted.iter().sum();
        let success_rate = if bids.is_empty() {
            0.0
        } else {
            accepted.len() as f64 / bids.len() as f64 * 100.0
        };
        let avg_accepted_price = if accepted.is_empty() {
            0.0
        } else {
            total_earnings / accepted.len() as f64
        };

        Self {
            total_bids: bids.len(),
            accepted_bids: accepted.len(),
            pending_bids: count(BidStatus::Pending),
            rejected_bids: count(BidStatus::Rejected),
            cancelled_bids: count(BidStatus::Cancelled),
            success_rate: round2(success_rate),
            avg_accepted_price: round2(avg_accepted_price),
            total_earnings: round2(total_earnings),
        }
    }
}

/// Read side of the marketplace: listings, public tracking and driver stats.
pub struct OrderBoard {
    store: Arc<dyn DomainStore>,
}

impl OrderBoard {
    pub fn new(store: Arc<dyn DomainStore>) -> Self {
        Self { store }
    }

    pub fn my_orders(&self, actor: Identity, query: &OrderQuery) -> Result<Vec<Order>, AppError> {
        let mut filter = query.filter();
        match actor.role {
            Role::Client => filter.client_id = Some(actor.user_id),
            Role::Driver => filter.driver_id = Some(actor.user_id),
            Role::Admin => {}
        }
        Ok(query.page(self.store.find_orders(&filter)?))
    }

    /// Searching orders the calling driver's vehicle can carry.
    pub fn available_orders(
        &self,
        actor: Identity,
        query: &OrderQuery,
    ) -> Result<Vec<Order>, AppError> {
        if actor.role != Role::Driver {
            return Err(AppError::Forbidden(
                "only drivers can browse available orders".to_string(),
            ));
        }
        let profile = self
            .store
            .get_driver_profile(actor.user_id)?
            .filter(|profile| profile.is_verified())
            .ok_or_else(|| AppError::Forbidden("driver profile is not verified".to_string()))?;

        if query.status.is_some_and(|status| status != OrderStatus::Searching) {
            return Ok(Vec::new());
        }

        let filter = OrderFilter {
            status: Some(OrderStatus::Searching),
            max_weight: Some(profile.max_weight),
            max_volume: Some(profile.max_volume),
            ..query.filter()
        };
        let orders = query.page(self.store.find_orders(&filter)?);
        debug!(driver_id = %actor.user_id, found = orders.len(), "available orders listed");
        Ok(orders)
    }

    /// Anonymous viewers get the public view; admins and participants also
    /// see parties, price and dates.
    pub fn track_by_number(
        &self,
        viewer: Option<Identity>,
        order_number: &str,
    ) -> Result<OrderTracking, AppError> {
        let order = self
            .store
            .get_order_by_number(order_number)?
            .ok_or_else(|| AppError::NotFound(format!("order {order_number}")))?;

        let privileged =
            viewer.is_some_and(|viewer| viewer.is_admin() || order.is_participant(viewer.user_id));
        let details = privileged.then(|| TrackingDetails {
            client_id: order.client_id,
            driver_id: order.driver_id,
            final_price: order.settlement.map(|settlement| settlement.final_price),
            distance_km: order.distance_km,
            pickup_date: order.pickup_date,
            completed_at: order.completed_at,
        });

        Ok(OrderTracking {
            order_number: order.order_number,
            status: order.status,
            pickup_address: order.pickup_address,
            dropoff_address: order.dropoff_address,
            cargo_type: order.cargo.kind,
            created_at: order.created_at,
            updated_at: order.updated_at,
            details,
        })
    }

    pub fn bid_stats(&self, actor: Identity) -> Result<BidStats, AppError> {
        if actor.role != Role::Driver {
            return Err(AppError::Forbidden("only drivers have bids".to_string()));
        }
        Ok(BidStats::from_bids(&self.store.bids_for_driver(actor.user_id)?))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use uuid::Uuid;

    use super::{BidStats, OrderBoard, OrderQuery};
    use crate::auth::Identity;
    use crate::error::AppError;
    use crate::geo::pricing::settle;
    use crate::geo::GeoPoint;
    use crate::models::bid::{Bid, BidStatus};
    use crate::models::driver::{DriverProfile, VerificationStatus};
    use crate::models::order::{Cargo, Order, OrderStatus};
    use crate::models::user::Role;
    use crate::store::{DomainStore, MemoryStore};

    struct Harness {
        board: OrderBoard,
        store: Arc<MemoryStore>,
        client: Identity,
    }

    fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        Harness {
            board: OrderBoard::new(store.clone()),
            store,
            client: identity(Role::Client),
        }
    }

    fn identity(role: Role) -> Identity {
        Identity {
            user_id: Uuid::new_v4(),
            role,
        }
    }

    impl Harness {
        fn driver(&self, max_weight: f64, verified: bool) -> Identity {
            let driver = identity(Role::Driver);
            let mut profile = DriverProfile::new(driver.user_id, "A123BC", max_weight, 80.0);
            if verified {
                profile.verification = VerificationStatus::Verified;
            }
            self.store.upsert_driver_profile(profile).unwrap();
            driver
        }

        fn order(&self, number: &str, status: OrderStatus, weight: f64, price: f64) -> Order {
            let order = self.unsaved(number, status, weight, price);
            self.store.insert_order(order.clone()).unwrap();
            order
        }

        fn unsaved(&self, number: &str, status: OrderStatus, weight: f64, price: f64) -> Order {
            let now = Utc::now();
            Order {
                id: Uuid::new_v4(),
                order_number: number.to_string(),
                client_id: self.client.user_id,
                driver_id: None,
                status,
                pickup_address: "Moscow, Tverskaya 1".to_string(),
                pickup: GeoPoint { lat: 55.7558, lng: 37.6173 },
                dropoff_address: "Tver, Sovetskaya 5".to_string(),
                dropoff: GeoPoint { lat: 56.8587, lng: 35.9176 },
                distance_km: 161.0,
                cargo: Cargo {
                    description: "palletized goods".to_string(),
                    kind: "general".to_string(),
                    weight,
                    volume: 20.0,
                },
                desired_price: price,
                settlement: None,
                pickup_date: None,
                created_at: now,
                updated_at: now,
                completed_at: None,
            }
        }
    }

    fn bid(status: BidStatus, price: f64) -> Bid {
        let now = Utc::now();
        Bid {
            id: Uuid::new_v4(),
            order_id: Uuid::new_v4(),
            driver_id: Uuid::new_v4(),
            proposed_price: price,
            message: None,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn available_orders_fit_the_vehicle() {
        let h = harness();
        let light = h.order("ORD-1", OrderStatus::Searching, 5.0, 100.0);
        h.order("ORD-2", OrderStatus::Searching, 30.0, 100.0);
        h.order("ORD-3", OrderStatus::Draft, 5.0, 100.0);
        let driver = h.driver(20.0, true);

        let found = h.board.available_orders(driver, &OrderQuery::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, light.id);

        let query = OrderQuery {
            status: Some(OrderStatus::Draft),
            ..OrderQuery::default()
        };
        assert!(h.board.available_orders(driver, &query).unwrap().is_empty());
    }

    #[test]
    fn available_orders_need_a_verified_driver() {
        let h = harness();
        h.order("ORD-1", OrderStatus::Searching, 5.0, 100.0);
        let pending = h.driver(20.0, false);

        assert!(matches!(
            h.board.available_orders(pending, &OrderQuery::default()),
            Err(AppError::Forbidden(_))
        ));
        assert!(matches!(
            h.board.available_orders(h.client, &OrderQuery::default()),
            Err(AppError::Forbidden(_))
        ));
    }

    #[test]
    fn my_orders_follow_the_role_and_page() {
        let h = harness();
        let driver = h.driver(20.0, true);
        let mut assigned = h.unsaved("ORD-1", OrderStatus::Searching, 5.0, 80.0);
        assigned.driver_id = Some(driver.user_id);
        assigned.status = OrderStatus::DriverAssigned;
        h.store.insert_order(assigned.clone()).unwrap();
        h.order("ORD-2", OrderStatus::Searching, 5.0, 150.0);
        h.order("ORD-3", OrderStatus::Searching, 5.0, 200.0);

        let mine = h.board.my_orders(h.client, &OrderQuery::default()).unwrap();
        assert_eq!(mine.len(), 3);

        let driving = h.board.my_orders(driver, &OrderQuery::default()).unwrap();
        assert_eq!(driving.len(), 1);
        assert_eq!(driving[0].id, assigned.id);

        let cheap = OrderQuery {
            max_price: Some(160.0),
            limit: Some(1),
            ..OrderQuery::default()
        };
        assert_eq!(h.board.my_orders(h.client, &cheap).unwrap().len(), 1);

        let past_the_end = OrderQuery {
            offset: 3,
            ..OrderQuery::default()
        };
        assert!(h.board.my_orders(h.client, &past_the_end).unwrap().is_empty());

        let admin = identity(Role::Admin);
        assert_eq!(h.board.my_orders(admin, &OrderQuery::default()).unwrap().len(), 3);
    }

    #[test]
    fn tracking_details_only_for_participants() {
        let h = harness();
        let mut order = h.unsaved("ORD-7", OrderStatus::Searching, 5.0, 100.0);
        order.settlement = Some(settle(90.0));
        h.store.insert_order(order).unwrap();

        let public = h.board.track_by_number(None, "ORD-7").unwrap();
        assert!(public.details.is_none());
        let json = serde_json::to_value(&public).unwrap();
        assert_eq!(json["cargo_type"], "general");
        assert!(json.get("client_id").is_none());

        let stranger = identity(Role::Client);
        assert!(h.board.track_by_number(Some(stranger), "ORD-7").unwrap().details.is_none());

        let owned = h.board.track_by_number(Some(h.client), "ORD-7").unwrap();
        let json = serde_json::to_value(&owned).unwrap();
        assert_eq!(json["client_id"], h.client.user_id.to_string());
        assert_eq!(json["final_price"], 90.0);

        assert!(matches!(
            h.board.track_by_number(None, "ORD-404"),
            Err(AppError::NotFound(_))
        ));
    }

    #[test]
    fn bid_stats_summarize_outcomes() {
        let stats = BidStats::from_bids(&[
            bid(BidStatus::Accepted, 100.0),
            bid(BidStatus::Accepted, 50.5),
            bid(BidStatus::Rejected, 70.0),
            bid(BidStatus::Pending, 90.0),
            bid(BidStatus::Cancelled, 60.0),
            bid(BidStatus::Rejected, 80.0),
        ]);

        assert_eq!(stats.total_bids, 6);
        assert_eq!(stats.accepted_bids, 2);
        assert_eq!(stats.rejected_bids, 2);
        assert_eq!(stats.pending_bids, 1);
        assert_eq!(stats.cancelled_bids, 1);
        assert_eq!(stats.success_rate, 33.33);
        assert_eq!(stats.avg_accepted_price, 75.25);
        assert_eq!(stats.total_earnings, 150.5);

        let empty = BidStats::from_bids(&[]);
        assert_eq!(empty.success_rate, 0.0);
        assert_eq!(empty.avg_accepted_price, 0.0);
    }

    #[test]
    fn bid_stats_are_for_drivers() {
        let h = harness();
        let driver = h.driver(20.0, true);
        assert_eq!(h.board.bid_stats(driver).unwrap().total_bids, 0);
        assert!(matches!(h.board.bid_stats(h.client), Err(AppError::Forbidden(_))));
    }
}
