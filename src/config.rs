use std::env;

use uuid::Uuid;

use crate::auth::Identity;
use crate::error::AppError;
use crate::models::user::Role;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub log_level: String,
    pub max_connections_per_user: usize,
    pub connection_queue_size: usize,
    pub notification_queue_size: usize,
    pub chat_history_limit: usize,
    pub auth_tokens: Vec<(String, Identity)>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            http_port: 3000,
            log_level: "info".to_string(),
            max_connections_per_user: 5,
            connection_queue_size: 64,
            notification_queue_size: 1024,
            chat_history_limit: 50,
            auth_tokens: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self, AppError> {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();

        let max_connections_per_user =
            parse_or_default("MAX_CONNECTIONS_PER_USER", defaults.max_connections_per_user)?;
        if max_connections_per_user == 0 {
            return Err(AppError::Internal(
                "MAX_CONNECTIONS_PER_USER must be > 0".to_string(),
            ));
        }

        let auth_tokens = match env::var("AUTH_TOKENS") {
            Ok(raw) => parse_auth_tokens(&raw)?,
            Err(_) => Vec::new(),
        };

        Ok(Self {
            http_port: parse_or_default("HTTP_PORT", defaults.http_port)?,
            log_level: env::var("LOG_LEVEL").unwrap_or(defaults.log_level),
            max_connections_per_user,
            connection_queue_size: parse_or_default(
                "CONNECTION_QUEUE_SIZE",
                defaults.connection_queue_size,
            )?,
            notification_queue_size: parse_or_default(
                "NOTIFICATION_QUEUE_SIZE",
                defaults.notification_queue_size,
            )?,
            chat_history_limit: parse_or_default("CHAT_HISTORY_LIMIT", defaults.chat_history_limit)?,
            auth_tokens,
        })
    }
}

fn parse_or_default<T>(key: &str, default: T) -> Result<T, AppError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|err| AppError::Internal(format!("invalid {key}: {err}"))),
        Err(_) => Ok(default),
    }
}

/// Parses `token:user_uuid:role` triples separated by commas.
pub fn parse_auth_tokens(raw: &str) -> Result<Vec<(String, Identity)>, AppError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            let (Some(token), Some(user), Some(role)) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(AppError::Internal(format!(
                    "invalid AUTH_TOKENS entry: {entry}"
                )));
            };

            let user_id = Uuid::parse_str(user)
                .map_err(|err| AppError::Internal(format!("invalid AUTH_TOKENS user id: {err}")))?;
            let role = role
                .parse::<Role>()
                .map_err(|err| AppError::Internal(format!("invalid AUTH_TOKENS role: {err}")))?;

            Ok((token.to_string(), Identity { user_id, role }))
        })
        .collect()
}
