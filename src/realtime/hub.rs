//! Per-booking rooms of live connections.
//!
//! `connections` and `rooms` are separate maps and no code path holds a guard
//! on both at once. Fan-out clones the member senders, drops every guard and
//! only then pushes events, so a slow client never blocks a room.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{Identity, TokenVerifier};
use crate::error::AppError;
use crate::models::booking::Booking;
use crate::models::location::GeoPoint;
use crate::observability::metrics::Metrics;
use crate::realtime::protocol::{ClientEvent, ServerEvent};
use crate::store::RecordStore;
use crate::tracking::LocationStore;

pub type ConnectionId = Uuid;

struct ConnectionEntry {
    identity: Identity,
    tx: mpsc::Sender<ServerEvent>,
    rooms: HashSet<Uuid>,
}

/// Handle returned to the transport after a successful handshake.
pub struct Connection {
    pub id: ConnectionId,
    pub identity: Identity,
    pub events: mpsc::Receiver<ServerEvent>,
}

pub struct BroadcastHub {
    store: Arc<dyn RecordStore>,
    locations: LocationStore,
    tokens: Arc<TokenVerifier>,
    connections: DashMap<ConnectionId, ConnectionEntry>,
    rooms: DashMap<Uuid, HashSet<ConnectionId>>,
    buffer_size: usize,
    metrics: Metrics,
}

impl BroadcastHub {
    pub fn new(
        store: Arc<dyn RecordStore>,
        locations: LocationStore,
        tokens: Arc<TokenVerifier>,
        buffer_size: usize,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            locations,
            tokens,
            connections: DashMap::new(),
            rooms: DashMap::new(),
            buffer_size: buffer_size.max(1),
            metrics,
        }
    }

    /// Handshake: resolves the token and registers a new connection.
    pub fn connect(&self, token: &str) -> Result<Connection, AppError> {
        let identity = self.tokens.verify(token)?;
        Ok(self.register(identity))
    }

    pub fn register(&self, identity: Identity) -> Connection {
        let (tx, events) = mpsc::channel(self.buffer_size);
        let id = Uuid::new_v4();

        self.connections.insert(
            id,
            ConnectionEntry {
                identity,
                tx,
                rooms: HashSet::new(),
            },
        );
        self.metrics.realtime_connections.inc();
        info!(connection_id = %id, user_id = %identity.user_id, "realtime client connected");

        Connection {
            id,
            identity,
            events,
        }
    }

    /// Applies one inbound event. Failures are reported to this connection only.
    pub async fn handle(&self, connection_id: ConnectionId, event: ClientEvent) {
        let (booking_id, result) = match event {
            ClientEvent::Subscribe { booking_id } => {
                (booking_id, self.subscribe(connection_id, booking_id).await)
            }
            ClientEvent::Unsubscribe { booking_id } => {
                self.unsubscribe(connection_id, booking_id);
                self.send_to(connection_id, ServerEvent::Unsubscribed { booking_id });
                (booking_id, Ok(()))
            }
            ClientEvent::UpdatePosition {
                booking_id,
                location,
            } => (
                booking_id,
                self.publish_position(connection_id, booking_id, location)
                    .await
                    .map(|_| ()),
            ),
        };

        if let Err(err) = result {
            self.send_error(connection_id, Some(booking_id), &err);
        }
    }

    pub async fn subscribe(
        &self,
        connection_id: ConnectionId,
        booking_id: Uuid,
    ) -> Result<(), AppError> {
        let identity = self.identity(connection_id)?;
        let booking = self.load_booking(booking_id).await?;

        if !booking.is_participant(identity.user_id) {
            warn!(
                connection_id = %connection_id,
                user_id = %identity.user_id,
                booking_id = %booking_id,
                "subscribe rejected"
            );
            return Err(AppError::Unauthorized(format!(
                "not a participant of booking {booking_id}"
            )));
        }

        self.rooms.entry(booking_id).or_default().insert(connection_id);

        let still_connected = match self.connections.get_mut(&connection_id) {
            Some(mut entry) => {
                entry.rooms.insert(booking_id);
                true
            }
            None => false,
        };
        if !still_connected {
            self.leave_room(connection_id, booking_id);
            return Err(AppError::NotFound(format!(
                "connection {connection_id} closed"
            )));
        }

        self.metrics.realtime_rooms.set(self.rooms.len() as i64);
        self.send_to(connection_id, ServerEvent::Subscribed { booking_id });
        debug!(connection_id = %connection_id, booking_id = %booking_id, "subscribed");
        Ok(())
    }

    /// No-op when the connection is not a member.
    pub fn unsubscribe(&self, connection_id: ConnectionId, booking_id: Uuid) {
        if let Some(mut entry) = self.connections.get_mut(&connection_id) {
            entry.rooms.remove(&booking_id);
        }
        self.leave_room(connection_id, booking_id);
        debug!(connection_id = %connection_id, booking_id = %booking_id, "unsubscribed");
    }

    /// Publishes on behalf of a live connection.
    pub async fn publish_position(
        &self,
        connection_id: ConnectionId,
        booking_id: Uuid,
        location: GeoPoint,
    ) -> Result<usize, AppError> {
        let identity = self.identity(connection_id)?;
        self.publish_as(identity, booking_id, location).await
    }

    /// Records the assigned driver's position and relays it to the booking's room.
    /// Returns how many subscribers the event was handed to.
    pub async fn publish_as(
        &self,
        identity: Identity,
        booking_id: Uuid,
        location: GeoPoint,
    ) -> Result<usize, AppError> {
        if !location.is_valid() {
            return Err(AppError::Validation(
                "location coordinates are out of range".to_string(),
            ));
        }

        let booking = self.load_booking(booking_id).await?;
        if booking.driver_id() != Some(identity.user_id) {
            warn!(
                user_id = %identity.user_id,
                booking_id = %booking_id,
                "position update rejected"
            );
            return Err(AppError::Unauthorized(format!(
                "only the assigned driver may publish positions for booking {booking_id}"
            )));
        }

        self.locations.record_position(booking_id, location).await?;
        self.metrics.position_updates_total.inc();

        Ok(self.relay(
            booking_id,
            ServerEvent::PositionUpdated {
                booking_id,
                location,
            },
        ))
    }

    /// Removes the connection from every room it joined.
    pub fn disconnect(&self, connection_id: ConnectionId) {
        let Some((_, entry)) = self.connections.remove(&connection_id) else {
            return;
        };

        for booking_id in &entry.rooms {
            self.leave_room(connection_id, *booking_id);
        }

        self.metrics.realtime_connections.dec();
        info!(
            connection_id = %connection_id,
            rooms = entry.rooms.len(),
            "realtime client disconnected"
        );
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_size(&self, booking_id: Uuid) -> usize {
        self.rooms.get(&booking_id).map_or(0, |members| members.len())
    }

    pub fn is_member(&self, connection_id: ConnectionId, booking_id: Uuid) -> bool {
        self.rooms
            .get(&booking_id)
            .is_some_and(|members| members.contains(&connection_id))
    }

    fn relay(&self, booking_id: Uuid, event: ServerEvent) -> usize {
        let members: Vec<ConnectionId> = match self.rooms.get(&booking_id) {
            Some(members) => members.iter().copied().collect(),
            None => return 0,
        };

        let senders: Vec<(ConnectionId, mpsc::Sender<ServerEvent>)> = members
            .into_iter()
            .filter_map(|id| self.connections.get(&id).map(|entry| (id, entry.tx.clone())))
            .collect();

        let mut delivered = 0;
        for (connection_id, tx) in senders {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(connection_id = %connection_id, booking_id = %booking_id, "subscriber lagging; event dropped");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(connection_id = %connection_id, "subscriber channel closed");
                }
            }
        }

        delivered
    }

    fn leave_room(&self, connection_id: ConnectionId, booking_id: Uuid) {
        if let Some(mut members) = self.rooms.get_mut(&booking_id) {
            members.remove(&connection_id);
        }
        self.rooms
            .remove_if(&booking_id, |_, members| members.is_empty());
        self.metrics.realtime_rooms.set(self.rooms.len() as i64);
    }

    fn identity(&self, connection_id: ConnectionId) -> Result<Identity, AppError> {
        self.connections
            .get(&connection_id)
            .map(|entry| entry.identity)
            .ok_or_else(|| AppError::NotFound(format!("connection {connection_id} not found")))
    }

    async fn load_booking(&self, booking_id: Uuid) -> Result<Booking, AppError> {
        self.store
            .get_booking(booking_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("booking {booking_id} not found")))
    }

    fn send_to(&self, connection_id: ConnectionId, event: ServerEvent) {
        let tx = match self.connections.get(&connection_id) {
            Some(entry) => entry.tx.clone(),
            None => return,
        };
        if tx.try_send(event).is_err() {
            debug!(connection_id = %connection_id, "dropped direct event");
        }
    }

    fn send_error(&self, connection_id: ConnectionId, booking_id: Option<Uuid>, err: &AppError) {
        self.send_to(
            connection_id,
            ServerEvent::Error {
                booking_id,
                code: err.code().to_string(),
                reason: err.to_string(),
            },
        );
    }

    /// Reports a malformed inbound frame back to its sender.
    pub fn reject_frame(&self, connection_id: ConnectionId, reason: String) {
        self.send_error(connection_id, None, &AppError::Validation(reason));
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use chrono::Utc;
    use uuid::Uuid;

    use super::BroadcastHub;
    use crate::auth::{Identity, TokenVerifier};
    use crate::cache::MemoryCache;
    use crate::models::booking::{Booking, BookingStatus, Reservation};
    use crate::models::location::{GeoPoint, Place};
    use crate::models::user::Role;
    use crate::models::vehicle::VehicleClass;
    use crate::observability::metrics::Metrics;
    use crate::realtime::protocol::{ClientEvent, ServerEvent};
    use crate::store::{MemoryStore, RecordStore};
    use crate::tracking::LocationStore;

    struct Fixture {
        hub: BroadcastHub,
        locations: LocationStore,
        booking_id: Uuid,
        rider: Identity,
        driver: Identity,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let rider = Identity {
            user_id: Uuid::new_v4(),
            role: Role::Rider,
        };
        let driver = Identity {
            user_id: Uuid::new_v4(),
            role: Role::Driver,
        };

        let place = Place {
            address: "depot".to_string(),
            coordinates: GeoPoint { lat: 0.0, lng: 0.0 },
        };
        let booking = Booking {
            id: Uuid::new_v4(),
            rider_id: rider.user_id,
            reservation: Some(Reservation {
                driver_id: driver.user_id,
                vehicle_id: Uuid::new_v4(),
            }),
            pickup: place.clone(),
            dropoff: place,
            vehicle_class: VehicleClass::Sedan,
            distance_km: 0.0,
            price: 5.0,
            status: BookingStatus::Assigned,
            scheduled_time: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        let booking_id = booking.id;
        store.insert_booking(booking).await.unwrap();

        let locations = LocationStore::new(Arc::new(MemoryCache::new()), Duration::from_secs(3600));
        let hub = BroadcastHub::new(
            store,
            locations.clone(),
            Arc::new(TokenVerifier::new("test")),
            8,
            Metrics::new(),
        );

        Fixture {
            hub,
            locations,
            booking_id,
            rider,
            driver,
        }
    }

    #[tokio::test]
    async fn stranger_is_refused_and_room_untouched() {
        let f = fixture().await;
        let stranger = f.hub.register(Identity {
            user_id: Uuid::new_v4(),
            role: Role::Rider,
        });
        let mut stranger_events = stranger.events;

        f.hub
            .handle(stranger.id, ClientEvent::Subscribe { booking_id: f.booking_id })
            .await;

        assert!(!f.hub.is_member(stranger.id, f.booking_id));
        assert_eq!(f.hub.room_count(), 0);
        match stranger_events.try_recv().unwrap() {
            ServerEvent::Error { code, .. } => assert_eq!(code, "unauthorized"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_booking_reports_not_found() {
        let f = fixture().await;
        let mut conn = f.hub.register(f.rider);

        f.hub
            .handle(conn.id, ClientEvent::Subscribe { booking_id: Uuid::new_v4() })
            .await;

        match conn.events.try_recv().unwrap() {
            ServerEvent::Error { code, .. } => assert_eq!(code, "not_found"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn driver_publish_reaches_every_subscriber_and_is_stored() {
        let f = fixture().await;
        let mut rider = f.hub.register(f.rider);
        let mut driver = f.hub.register(f.driver);

        f.hub.subscribe(rider.id, f.booking_id).await.unwrap();
        f.hub.subscribe(driver.id, f.booking_id).await.unwrap();
        assert_eq!(f.hub.room_size(f.booking_id), 2);
        assert!(matches!(rider.events.try_recv(), Ok(ServerEvent::Subscribed { .. })));
        assert!(matches!(driver.events.try_recv(), Ok(ServerEvent::Subscribed { .. })));

        let point = GeoPoint { lat: 0.002, lng: 0.003 };
        let delivered = f
            .hub
            .publish_position(driver.id, f.booking_id, point)
            .await
            .unwrap();
        assert_eq!(delivered, 2);

        let expected = ServerEvent::PositionUpdated {
            booking_id: f.booking_id,
            location: point,
        };
        assert_eq!(rider.events.try_recv().unwrap(), expected);
        assert_eq!(driver.events.try_recv().unwrap(), expected);
        assert_eq!(f.locations.read_position(f.booking_id).await.unwrap(), Some(point));
    }

    #[tokio::test]
    async fn rider_cannot_publish() {
        let f = fixture().await;
        let rider = f.hub.register(f.rider);
        f.hub.subscribe(rider.id, f.booking_id).await.unwrap();

        let result = f
            .hub
            .publish_position(rider.id, f.booking_id, GeoPoint { lat: 1.0, lng: 1.0 })
            .await;

        assert!(result.is_err());
        assert_eq!(f.locations.read_position(f.booking_id).await.unwrap(), None);
        assert!(f.hub.is_member(rider.id, f.booking_id));
    }

    #[tokio::test]
    async fn successive_publishes_arrive_in_order() {
        let f = fixture().await;
        let mut rider = f.hub.register(f.rider);
        let driver = f.hub.register(f.driver);
        f.hub.subscribe(rider.id, f.booking_id).await.unwrap();
        let _ = rider.events.try_recv();

        for step in 1..=5 {
            let point = GeoPoint { lat: 0.001 * step as f64, lng: 0.0 };
            f.hub
                .handle(driver.id, ClientEvent::UpdatePosition { booking_id: f.booking_id, location: point })
                .await;
        }

        for step in 1..=5 {
            match rider.events.try_recv().unwrap() {
                ServerEvent::PositionUpdated { location, .. } => {
                    assert_eq!(location.lat, 0.001 * step as f64)
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn disconnect_discards_empty_rooms() {
        let f = fixture().await;
        let rider = f.hub.register(f.rider);
        f.hub.subscribe(rider.id, f.booking_id).await.unwrap();
        assert_eq!(f.hub.room_count(), 1);

        f.hub.disconnect(rider.id);

        assert_eq!(f.hub.room_count(), 0);
        assert_eq!(f.hub.connection_count(), 0);
    }

    #[tokio::test]
    async fn unsubscribe_is_noop_for_non_members() {
        let f = fixture().await;
        let rider = f.hub.register(f.rider);
        let driver = f.hub.register(f.driver);
        f.hub.subscribe(driver.id, f.booking_id).await.unwrap();

        f.hub.unsubscribe(rider.id, f.booking_id);
        assert_eq!(f.hub.room_size(f.booking_id), 1);

        f.hub.unsubscribe(driver.id, f.booking_id);
        assert_eq!(f.hub.room_count(), 0);
    }

    #[tokio::test]
    async fn handshake_rejects_bad_token() {
        let f = fixture().await;
        assert!(f.hub.connect("not-a-token").is_err());
        assert_eq!(f.hub.connection_count(), 0);
    }
}
