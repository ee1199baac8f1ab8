use std::sync::Arc;

use chrono::{Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::AppError;
use crate::geo::{valid_latitude, valid_longitude};
use crate::models::location::{LocationSample, LocationUpdate};
use crate::models::user::Role;
use crate::observability::metrics::Metrics;
use crate::realtime::events::{LocationEvent, ServerEvent};
use crate::realtime::registry::{ConnectionId, ConnectionRegistry};
use crate::store::DomainStore;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum LocationRejection {
    LatitudeOutOfRange { lat: f64 },
    LongitudeOutOfRange { lng: f64 },
}

impl std::fmt::Display for LocationRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LocationRejection::LatitudeOutOfRange { lat } => {
                write!(f, "latitude {lat} is outside [-90, 90]")
            }
            LocationRejection::LongitudeOutOfRange { lng } => {
                write!(f, "longitude {lng} is outside [-180, 180]")
            }
        }
    }
}

#[derive(Debug, Clone)]
pub enum IngestOutcome {
    Accepted(LocationUpdate),
    Rejected(LocationRejection),
}

/// What a tracking connection ends up attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// Every driver's samples, as `admin_location_update`.
    AdminGroup,
    Driver(Uuid),
}

pub const DEFAULT_HISTORY_HOURS: i64 = 24;
pub const MAX_HISTORY_HOURS: i64 = 168;
pub const DEFAULT_HISTORY_LIMIT: usize = 100;
pub const MAX_HISTORY_LIMIT: usize = 1000;

/// The only writer of a driver's live position.
pub struct LocationPipeline {
    store: Arc<dyn DomainStore>,
    registry: Arc<ConnectionRegistry>,
    metrics: Metrics,
    /// Open location streams per driver.
    streams: DashMap<Uuid, usize>,
}

impl LocationPipeline {
    pub fn new(
        store: Arc<dyn DomainStore>,
        registry: Arc<ConnectionRegistry>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            registry,
            metrics,
            streams: DashMap::new(),
        }
    }

    /// Out-of-range samples come back as `Rejected` and leave no trace.
    pub fn ingest_location(
        &self,
        driver_id: Uuid,
        sample: LocationSample,
    ) -> Result<IngestOutcome, AppError> {
        if let Some(rejection) = check_sample(&sample) {
            self.metrics
                .location_samples_total
                .with_label_values(&["rejected"])
                .inc();
            warn!(driver_id = %driver_id, %rejection, "location sample rejected");
            return Ok(IngestOutcome::Rejected(rejection));
        }

        let now = Utc::now();
        let order_id = self
            .store
            .active_order_for_driver(driver_id)?
            .map(|order| order.id);

        self.store
            .record_position(driver_id, sample.lat, sample.lng, now)?;

        let update = LocationUpdate {
            id: Uuid::new_v4(),
            driver_id,
            order_id,
            lat: sample.lat,
            lng: sample.lng,
            accuracy: sample.accuracy,
            speed: sample.speed,
            heading: sample.heading,
            timestamp: now,
        };
        self.store.append_location(update.clone())?;

        let delivery = self
            .registry
            .publish_driver_location(driver_id, &LocationEvent::from(&update));
        self.metrics
            .location_samples_total
            .with_label_values(&["accepted"])
            .inc();
        debug!(
            driver_id = %driver_id,
            order_id = ?order_id,
            delivered = delivery.delivered,
            "location sample published"
        );

        Ok(IngestOutcome::Accepted(update))
    }

    pub fn driver_offline(&self, driver_id: Uuid) -> Result<(), AppError> {
        self.store.set_online(driver_id, false)?;
        info!(driver_id = %driver_id, "driver went offline");
        Ok(())
    }

    /// Counts one more live location stream for the driver and returns how
    /// many are open.
    pub fn stream_opened(&self, driver_id: Uuid) -> usize {
        let mut open = self.streams.entry(driver_id).or_insert(0);
        *open += 1;
        debug!(driver_id = %driver_id, open = *open, "location stream opened");
        *open
    }

    /// Closes one of the driver's streams. The driver goes offline only when
    /// the last one closes; returns whether that happened.
    pub fn stream_closed(&self, driver_id: Uuid) -> Result<bool, AppError> {
        let Entry::Occupied(mut open) = self.streams.entry(driver_id) else {
            return Ok(false);
        };
        let remaining = open.get().saturating_sub(1);
        if remaining > 0 {
            *open.get_mut() = remaining;
            debug!(driver_id = %driver_id, open = remaining, "location stream closed");
            return Ok(false);
        }

        // The entry stays locked until the flag is written, so a stream
        // opening concurrently is counted after the driver went offline.
        let offline = self.driver_offline(driver_id);
        open.remove();
        offline.map(|()| true)
    }

    pub fn authorize_subscription(
        &self,
        actor: Identity,
        driver_id: Uuid,
    ) -> Result<SubscriptionScope, AppError> {
        match actor.role {
            Role::Admin => Ok(SubscriptionScope::AdminGroup),
            Role::Client => {
                if self.client_tracks(actor.user_id, driver_id)? {
                    Ok(SubscriptionScope::Driver(driver_id))
                } else {
                    Err(AppError::Forbidden(
                        "driver is not assigned to any of your active orders".to_string(),
                    ))
                }
            }
            Role::Driver => Err(AppError::Forbidden(
                "drivers cannot track other drivers".to_string(),
            )),
        }
    }

    /// Authorizes and attaches `conn`, then replays the driver's last known
    /// position to that connection only.
    pub fn subscribe(
        &self,
        actor: Identity,
        driver_id: Uuid,
        conn: ConnectionId,
    ) -> Result<SubscriptionScope, AppError> {
        let scope = self.authorize_subscription(actor, driver_id)?;
        let attached = match scope {
            SubscriptionScope::AdminGroup => self.registry.join_admin_group(conn),
            SubscriptionScope::Driver(driver_id) => {
                self.registry.subscribe_to_driver(driver_id, conn)
            }
        };
        if !attached {
            return Err(AppError::InvalidState("connection is closed".to_string()));
        }

        if let Some(latest) = self.store.latest_location(driver_id)? {
            let event = LocationEvent::from(&latest);
            let event = match scope {
                SubscriptionScope::AdminGroup => ServerEvent::AdminLocationUpdate(event),
                SubscriptionScope::Driver(_) => ServerEvent::LocationUpdate(event),
            };
            if let Err(err) = self.registry.send_to_connection(conn, &event) {
                debug!(connection_id = %conn, error = %err, "could not replay latest location");
            }
        }

        info!(user_id = %actor.user_id, driver_id = %driver_id, ?scope, "tracking subscription opened");
        Ok(scope)
    }

    /// Detaches a connection that `subscribe` attached.
    pub fn unsubscribe(&self, actor: Identity, driver_id: Uuid, conn: ConnectionId) -> bool {
        let detached = if actor.is_admin() {
            self.registry.leave_admin_group(conn)
        } else {
            self.registry.unsubscribe_from_driver(driver_id, conn)
        };
        if detached {
            debug!(user_id = %actor.user_id, driver_id = %driver_id, "tracking subscription closed");
        }
        detached
    }

    /// The driver's recent samples, newest first. Admins read anyone, drivers
    /// only themselves, clients only a driver on one of their active orders.
    pub fn driver_locations(
        &self,
        actor: Identity,
        driver_id: Uuid,
        hours: Option<i64>,
        limit: Option<usize>,
    ) -> Result<Vec<LocationUpdate>, AppError> {
        match actor.role {
            Role::Admin => {}
            Role::Driver if actor.user_id == driver_id => {}
            Role::Driver => {
                return Err(AppError::Forbidden(
                    "drivers can only read their own history".to_string(),
                ));
            }
            Role::Client => {
                if !self.client_tracks(actor.user_id, driver_id)? {
                    return Err(AppError::Forbidden(
                        "driver is not assigned to any of your active orders".to_string(),
                    ));
                }
            }
        }

        let hours = hours
            .unwrap_or(DEFAULT_HISTORY_HOURS)
            .clamp(1, MAX_HISTORY_HOURS);
        let limit = limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT);
        let since = Utc::now() - Duration::hours(hours);
        Ok(self.store.locations_for_driver(driver_id, since, limit)?)
    }

    pub fn latest_location(&self, driver_id: Uuid) -> Result<Option<LocationUpdate>, AppError> {
        Ok(self.store.latest_location(driver_id)?)
    }

    pub fn route_history(
        &self,
        actor: Identity,
        order_id: Uuid,
    ) -> Result<Vec<LocationUpdate>, AppError> {
        let order = self
            .store
            .get_order(order_id)?
            .ok_or_else(|| AppError::NotFound(format!("order {order_id}")))?;
        if !actor.is_admin() && !order.is_participant(actor.user_id) {
            return Err(AppError::Forbidden("not a party to this order".to_string()));
        }
        Ok(self.store.locations_for_order(order_id)?)
    }
}

impl LocationPipeline {
    fn client_tracks(&self, client_id: Uuid, driver_id: Uuid) -> Result<bool, AppError> {
        Ok(self
            .store
            .orders_for_client(client_id)?
            .iter()
            .any(|order| order.driver_id == Some(driver_id) && order.status.is_in_flight()))
    }
}

fn check_sample(sample: &LocationSample) -> Option<LocationRejection> {
    if !valid_latitude(sample.lat) {
        return Some(LocationRejection::LatitudeOutOfRange { lat: sample.lat });
    }
    if !valid_longitude(sample.lng) {
        return Some(LocationRejection::LongitudeOutOfRange { lng: sample.lng });
    }
    None
}
