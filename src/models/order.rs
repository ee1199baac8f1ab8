use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo::pricing::Settlement;
use crate::geo::GeoPoint;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    Searching,
    DriverAssigned,
    Loading,
    EnRoute,
    Unloading,
    Completed,
    Paid,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Draft => "draft",
            OrderStatus::Searching => "searching",
            OrderStatus::DriverAssigned => "driver_assigned",
            OrderStatus::Loading => "loading",
            OrderStatus::EnRoute => "en_route",
            OrderStatus::Unloading => "unloading",
            OrderStatus::Completed => "completed",
            OrderStatus::Paid => "paid",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Completed | OrderStatus::Paid | OrderStatus::Cancelled
        )
    }

    /// A driver is attached and the cargo is somewhere between pickup and drop-off.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            OrderStatus::DriverAssigned
                | OrderStatus::Loading
                | OrderStatus::EnRoute
                | OrderStatus::Unloading
        )
    }

    pub fn is_cancellable(&self) -> bool {
        matches!(
            self,
            OrderStatus::Searching
                | OrderStatus::DriverAssigned
                | OrderStatus::Loading
                | OrderStatus::EnRoute
        )
    }

    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        match (self, next) {
            (Draft, Searching)
            | (Searching, DriverAssigned)
            | (DriverAssigned, Loading)
            | (Loading, EnRoute)
            | (EnRoute, Unloading)
            | (EnRoute, Completed)
            | (Unloading, Completed)
            | (Completed, Paid) => true,
            (from, Cancelled) => from.is_cancellable(),
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cargo {
    pub description: String,
    pub kind: String,
    /// Tonnes.
    pub weight: f64,
    /// Cubic metres.
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: Uuid,
    pub order_number: String,
    pub client_id: Uuid,
    pub driver_id: Option<Uuid>,
    pub status: OrderStatus,
    pub pickup_address: String,
    pub pickup: GeoPoint,
    pub dropoff_address: String,
    pub dropoff: GeoPoint,
    pub distance_km: f64,
    pub cargo: Cargo,
    pub desired_price: f64,
    #[serde(flatten)]
    pub settlement: Option<Settlement>,
    pub pickup_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Order {
    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.client_id == user_id || self.driver_id == Some(user_id)
    }
}
