//! Bearer-token resolution. Credential issuing lives elsewhere; this side
//! only turns a presented token into a trusted `(user id, role)` pair.

use axum::http::HeaderMap;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::models::user::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub user_id: Uuid,
    pub role: Role,
}

impl Identity {
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

pub trait Authenticator: Send + Sync {
    fn authenticate(&self, token: &str) -> Result<Identity, AppError>;
}

/// Token table held in memory, seeded from configuration.
#[derive(Default)]
pub struct StaticTokenAuthenticator {
    tokens: DashMap<String, Identity>,
}

impl StaticTokenAuthenticator {
    pub fn new(tokens: impl IntoIterator<Item = (String, Identity)>) -> Self {
        Self {
            tokens: tokens.into_iter().collect(),
        }
    }

    pub fn insert(&self, token: impl Into<String>, identity: Identity) {
        self.tokens.insert(token.into(), identity);
    }

    pub fn revoke(&self, token: &str) -> bool {
        self.tokens.remove(token).is_some()
    }
}

impl Authenticator for StaticTokenAuthenticator {
    fn authenticate(&self, token: &str) -> Result<Identity, AppError> {
        self.tokens
            .get(token)
            .map(|entry| *entry.value())
            .ok_or(AppError::Unauthenticated)
    }
}

/// Pulls the `Authorization: Bearer …` header and resolves it.
pub fn verify_bearer(headers: &HeaderMap, auth: &dyn Authenticator) -> Result<Identity, AppError> {
    let token = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AppError::Unauthenticated)?;

    auth.authenticate(token)
}
