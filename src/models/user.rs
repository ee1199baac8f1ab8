use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    Driver,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Driver => "driver",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(Role::Client),
            "driver" => Ok(Role::Driver),
            "admin" => Ok(Role::Admin),
            other => Err(format!("unknown role: {other}, expected client/driver/admin")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: Uuid,
    pub role: Role,
    pub full_name: Option<String>,
    pub is_active: bool,
    pub rating: f64,
    pub rating_count: u32,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(role: Role) -> Self {
        Self {
            id: Uuid::new_v4(),
            role,
            full_name: None,
            is_active: true,
            rating: 0.0,
            rating_count: 0,
            created_at: Utc::now(),
        }
    }

    /// Folds one more review score into the running average.
    pub fn apply_rating(&mut self, score: u8) {
        let score = f64::from(score.clamp(1, 5));
        let count = f64::from(self.rating_count);
        self.rating = ((self.rating * count + score) / (count + 1.0) * 10.0).round() / 10.0;
        self.rating_count = self.rating_count.saturating_add(1);
    }
}

#[cfg(test)]
mod tests {
    use super::{Role, User};

    #[test]
    fn running_average_matches_full_recompute() {
        let mut user = User::new(Role::Driver);
        for score in [5, 4, 3] {
            user.apply_rating(score);
        }
        assert_eq!(user.rating_count, 3);
        assert_eq!(user.rating, 4.0);
    }

    #[test]
    fn first_rating_is_taken_verbatim() {
        let mut user = User::new(Role::Driver);
        user.apply_rating(4);
        assert_eq!(user.rating, 4.0);
    }
}
