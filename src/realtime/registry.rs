use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ConnectionError;
use crate::observability::metrics::Metrics;
use crate::realtime::connection::{Frame, FrameSink};
use crate::realtime::events::{LocationEvent, ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Clone)]
struct Member {
    id: ConnectionId,
    user_id: Uuid,
    sink: Arc<dyn FrameSink>,
}

struct ConnectionEntry {
    member: Member,
    opened_at: DateTime<Utc>,
    rooms: HashSet<Uuid>,
    tracking: HashSet<Uuid>,
    admin: bool,
}

/// Outcome of one fan-out.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub delivered: usize,
    pub dropped: usize,
}

impl Delivery {
    fn merge(self, other: Delivery) -> Delivery {
        Delivery {
            delivered: self.delivered + other.delivered,
            dropped: self.dropped + other.dropped,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct ConnectionStats {
    pub users_connected: usize,
    pub total_connections: usize,
    pub active_chats: usize,
    pub tracked_drivers: usize,
    pub admins_connected: usize,
}

/// Process-wide table of live connections and the groups they belong to.
///
/// Every map is guarded by its own shard locks, held only for the membership
/// update itself. Fan-out snapshots the recipients first and sends with no
/// lock held. Lock order is `connections → users/rooms/tracking/admins`.
pub struct ConnectionRegistry {
    max_per_user: usize,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    users: DashMap<Uuid, VecDeque<ConnectionId>>,
    rooms: DashMap<Uuid, Vec<Member>>,
    tracking: DashMap<Uuid, Vec<Member>>,
    admins: DashMap<ConnectionId, Member>,
    metrics: Metrics,
}

impl ConnectionRegistry {
    pub fn new(max_per_user: usize, metrics: Metrics) -> Self {
        Self {
            max_per_user: max_per_user.max(1),
            connections: DashMap::new(),
            users: DashMap::new(),
            rooms: DashMap::new(),
            tracking: DashMap::new(),
            admins: DashMap::new(),
            metrics,
        }
    }

    /// Admits a new connection for `user_id`. When the user is already at
    /// the cap, their oldest connections are closed and dropped first.
    pub fn register(&self, user_id: Uuid, sink: Arc<dyn FrameSink>) -> ConnectionId {
        let id = ConnectionId::new();
        self.connections.insert(
            id,
            ConnectionEntry {
                member: Member { id, user_id, sink },
                opened_at: Utc::now(),
                rooms: HashSet::new(),
                tracking: HashSet::new(),
                admin: false,
            },
        );
        self.metrics.connections_active.inc();

        let evicted = {
            let mut owned = self.users.entry(user_id).or_default();
            owned.push_back(id);

            let mut evicted = Vec::new();
            while owned.len() > self.max_per_user {
                match owned.pop_front() {
                    Some(oldest) => evicted.push(oldest),
                    None => break,
                }
            }
            evicted
        };

        for oldest in evicted {
            info!(user_id = %user_id, connection_id = %oldest, "connection cap reached; evicting oldest");
            self.unregister(oldest);
        }

        debug!(user_id = %user_id, connection_id = %id, "connection registered");
        id
    }

    /// Removes the connection from every group it joined and closes it.
    /// Returns `false` if it was already gone.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let Some((_, entry)) = self.connections.remove(&id) else {
            return false;
        };

        entry.member.sink.close();
        self.metrics.connections_active.dec();

        if let Entry::Occupied(mut owned) = self.users.entry(entry.member.user_id) {
            owned.get_mut().retain(|other| *other != id);
            if owned.get().is_empty() {
                owned.remove();
            }
        }
        for order_id in &entry.rooms {
            remove_member(&self.rooms, *order_id, id);
        }
        for driver_id in &entry.tracking {
            remove_member(&self.tracking, *driver_id, id);
        }
        if entry.admin {
            self.admins.remove(&id);
        }

        let lifetime = Utc::now() - entry.opened_at;
        debug!(
            user_id = %entry.member.user_id,
            connection_id = %id,
            lifetime_secs = lifetime.num_seconds(),
            "connection unregistered"
        );
        true
    }

    pub fn join_chat_room(&self, order_id: Uuid, id: ConnectionId) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        if entry.rooms.insert(order_id) {
            let member = entry.member.clone();
            self.rooms.entry(order_id).or_default().push(member);
        }
        true
    }

    pub fn leave_chat_room(&self, order_id: Uuid, id: ConnectionId) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        if !entry.rooms.remove(&order_id) {
            return false;
        }
        remove_member(&self.rooms, order_id, id);
        true
    }

    pub fn subscribe_to_driver(&self, driver_id: Uuid, id: ConnectionId) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        if entry.tracking.insert(driver_id) {
            let member = entry.member.clone();
            self.tracking.entry(driver_id).or_default().push(member);
        }
        true
    }

    pub fn unsubscribe_from_driver(&self, driver_id: Uuid, id: ConnectionId) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        if !entry.tracking.remove(&driver_id) {
            return false;
        }
        remove_member(&self.tracking, driver_id, id);
        true
    }

    pub fn join_admin_group(&self, id: ConnectionId) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        entry.admin = true;
        self.admins.insert(id, entry.member.clone());
        true
    }

    pub fn leave_admin_group(&self, id: ConnectionId) -> bool {
        let Some(mut entry) = self.connections.get_mut(&id) else {
            return false;
        };
        entry.admin = false;
        self.admins.remove(&id).is_some()
    }

    /// Delivers to everyone in the order's room except `exclude_user`.
    /// An absent room is a no-op.
    pub fn broadcast_to_room(
        &self,
        order_id: Uuid,
        event: &ServerEvent,
        exclude_user: Option<Uuid>,
    ) -> Delivery {
        let recipients: Vec<Member> = match self.rooms.get(&order_id) {
            Some(room) => room
                .iter()
                .filter(|member| Some(member.user_id) != exclude_user)
                .cloned()
                .collect(),
            None => return Delivery::default(),
        };
        self.fan_out(recipients, event)
    }

    /// Sends a location sample to the driver's subscribers and to every
    /// connection in the admin group.
    pub fn publish_driver_location(&self, driver_id: Uuid, location: &LocationEvent) -> Delivery {
        let subscribers: Vec<Member> = self
            .tracking
            .get(&driver_id)
            .map(|members| members.value().clone())
            .unwrap_or_default();

        let to_subscribers =
            self.fan_out(subscribers, &ServerEvent::LocationUpdate(location.clone()));
        let to_admins = self.fan_out(
            self.admin_members(),
            &ServerEvent::AdminLocationUpdate(location.clone()),
        );
        to_subscribers.merge(to_admins)
    }

    /// Delivers to every live connection of the user.
    pub fn send_to_user(&self, user_id: Uuid, event: &ServerEvent) -> Delivery {
        let ids: Vec<ConnectionId> = self
            .users
            .get(&user_id)
            .map(|owned| owned.iter().copied().collect())
            .unwrap_or_default();

        let recipients = ids
            .into_iter()
            .filter_map(|id| self.connections.get(&id).map(|entry| entry.member.clone()))
            .collect();
        self.fan_out(recipients, event)
    }

    pub fn broadcast_admins(&self, event: &ServerEvent) -> Delivery {
        self.fan_out(self.admin_members(), event)
    }

    /// `system_message` to the listed users, or to every connected user.
    pub fn broadcast_system(&self, message: &str, users: Option<&[Uuid]>) -> Delivery {
        let event = ServerEvent::SystemMessage {
            message: message.to_string(),
            timestamp: Utc::now(),
        };
        let targets: Vec<Uuid> = match users {
            Some(users) => users.to_vec(),
            None => self.users.iter().map(|entry| *entry.key()).collect(),
        };

        targets
            .into_iter()
            .map(|user_id| self.send_to_user(user_id, &event))
            .fold(Delivery::default(), Delivery::merge)
    }

    /// Direct reply on one connection, queued behind anything already
    /// broadcast to it. A failed send drops the connection.
    pub fn send_to_connection(
        &self,
        id: ConnectionId,
        event: &ServerEvent,
    ) -> Result<(), ConnectionError> {
        let member = self
            .connections
            .get(&id)
            .map(|entry| entry.member.clone())
            .ok_or(ConnectionError::Closed)?;
        let frame = encode(event).ok_or(ConnectionError::Closed)?;

        member.sink.try_send(frame).inspect_err(|err| {
            warn!(connection_id = %id, error = %err, "direct send failed; dropping connection");
            self.unregister(id);
        })
    }

    /// Free slots in the connection's outbound queue; 0 once it is gone.
    pub fn headroom(&self, id: ConnectionId) -> usize {
        self.connections
            .get(&id)
            .map(|entry| entry.member.sink.headroom())
            .unwrap_or(0)
    }

    pub fn connections_for_user(&self, user_id: Uuid) -> Vec<ConnectionId> {
        self.users
            .get(&user_id)
            .map(|owned| owned.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn room_size(&self, order_id: Uuid) -> usize {
        self.rooms.get(&order_id).map(|room| room.len()).unwrap_or(0)
    }

    pub fn has_room(&self, order_id: Uuid) -> bool {
        self.rooms.contains_key(&order_id)
    }

    pub fn subscriber_count(&self, driver_id: Uuid) -> usize {
        self.tracking
            .get(&driver_id)
            .map(|members| members.len())
            .unwrap_or(0)
    }

    pub fn is_registered(&self, id: ConnectionId) -> bool {
        self.connections.contains_key(&id)
    }

    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            users_connected: self.users.len(),
            total_connections: self.connections.len(),
            active_chats: self.rooms.len(),
            tracked_drivers: self.tracking.len(),
            admins_connected: self.admins.len(),
        }
    }

    /// Closes and forgets every connection.
    pub fn shutdown(&self) {
        let ids: Vec<ConnectionId> = self.connections.iter().map(|entry| *entry.key()).collect();
        let count = ids.len();
        for id in ids {
            self.unregister(id);
        }
        info!(connections = count, "connection registry shut down");
    }

    fn admin_members(&self) -> Vec<Member> {
        self.admins.iter().map(|entry| entry.value().clone()).collect()
    }

    fn fan_out(&self, recipients: Vec<Member>, event: &ServerEvent) -> Delivery {
        if recipients.is_empty() {
            return Delivery::default();
        }
        let Some(frame) = encode(event) else {
            return Delivery::default();
        };

        let mut delivery = Delivery::default();
        let mut dead = Vec::new();

        for member in recipients {
            match member.sink.try_send(Frame::clone(&frame)) {
                Ok(()) => delivery.delivered += 1,
                Err(err) => {
                    warn!(
                        connection_id = %member.id,
                        user_id = %member.user_id,
                        error = %err,
                        "send failed; dropping connection"
                    );
                    delivery.dropped += 1;
                    dead.push(member.id);
                }
            }
        }

        for id in dead {
            self.unregister(id);
        }

        self.metrics
            .fanout_frames_total
            .with_label_values(&["delivered"])
            .inc_by(delivery.delivered as u64);
        self.metrics
            .fanout_frames_total
            .with_label_values(&["dropped"])
            .inc_by(delivery.dropped as u64);

        delivery
    }
}

fn encode(event: &ServerEvent) -> Option<Frame> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Frame::from(json)),
        Err(err) => {
            warn!(error = %err, "failed to serialize outbound event");
            None
        }
    }
}

fn remove_member(groups: &DashMap<Uuid, Vec<Member>>, key: Uuid, id: ConnectionId) {
    if let Entry::Occupied(mut group) = groups.entry(key) {
        group.get_mut().retain(|member| member.id != id);
        if group.get().is_empty() {
            group.remove();
        }
    }
}
