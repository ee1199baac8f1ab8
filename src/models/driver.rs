use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Pending,
    Verified,
    Rejected,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverProfile {
    pub user_id: Uuid,
    pub vehicle_number: String,
    /// Tonnes.
    pub max_weight: f64,
    /// Cubic metres.
    pub max_volume: f64,
    pub verification: VerificationStatus,
    pub current_lat: Option<f64>,
    pub current_lng: Option<f64>,
    pub is_online: bool,
    pub total_orders: u32,
    pub total_distance_km: f64,
    pub updated_at: DateTime<Utc>,
}

impl DriverProfile {
    pub fn new(user_id: Uuid, vehicle_number: impl Into<String>, max_weight: f64, max_volume: f64) -> Self {
        Self {
            user_id,
            vehicle_number: vehicle_number.into(),
            max_weight,
            max_volume,
            verification: VerificationStatus::Pending,
            current_lat: None,
            current_lng: None,
            is_online: false,
            total_orders: 0,
            total_distance_km: 0.0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verification == VerificationStatus::Verified
    }

    pub fn can_carry(&self, weight: f64, volume: f64) -> bool {
        weight <= self.max_weight && volume <= self.max_volume
    }
}
