use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ride_dispatch::auth::Identity;
use ride_dispatch::cache::MemoryCache;
use ride_dispatch::config::DispatchConfig;
use ride_dispatch::engine::dispatcher::run_dispatcher;
use ride_dispatch::engine::lifecycle::{Actor, NewBooking};
use ride_dispatch::engine::queue::enqueue_booking;
use ride_dispatch::models::booking::BookingStatus;
use ride_dispatch::models::location::{GeoPoint, Place};
use ride_dispatch::models::user::{Role, User};
use ride_dispatch::models::vehicle::{Vehicle, VehicleClass};
use ride_dispatch::realtime::{ClientEvent, Connection, ServerEvent};
use ride_dispatch::state::{AppState, StateOptions};
use ride_dispatch::store::MemoryStore;
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

fn setup(sweep_interval: Duration) -> (Arc<AppState>, mpsc::Receiver<Uuid>) {
    let options = StateOptions {
        dispatch: DispatchConfig {
            demand_factor: Some(0.0),
            sweep_interval,
            ..DispatchConfig::default()
        },
        ..StateOptions::default()
    };
    let (state, rx) = AppState::new(
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryCache::new()),
        options,
    );
    (Arc::new(state), rx)
}

async fn add_user(state: &AppState, role: Role, location: Option<GeoPoint>) -> Uuid {
    let id = Uuid::new_v4();
    state
        .store
        .insert_user(User {
            id,
            name: format!("{role:?}"),
            role,
            is_available: role == Role::Driver,
            current_location: location,
            rating: Some(4.5),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
    id
}

async fn add_driver(state: &AppState, location: GeoPoint) -> Uuid {
    let driver = add_user(state, Role::Driver, Some(location)).await;
    state
        .store
        .insert_vehicle(Vehicle {
            id: Uuid::new_v4(),
            driver_id: driver,
            class: VehicleClass::Sedan,
            plate: "KA-01-1234".to_string(),
            is_available: true,
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
    driver
}

fn ride(rider_id: Uuid) -> NewBooking {
    NewBooking {
        rider_id,
        pickup: Place {
            address: "Depot".to_string(),
            coordinates: GeoPoint { lat: 0.0, lng: 0.0 },
        },
        dropoff: Place {
            address: "Harbour".to_string(),
            coordinates: GeoPoint { lat: 0.0, lng: 1.0 },
        },
        vehicle_class: VehicleClass::Sedan,
        driver_id: None,
        vehicle_id: None,
        price: None,
        scheduled_time: None,
    }
}

fn connect(state: &AppState, user_id: Uuid, role: Role) -> Connection {
    let token = state
        .tokens
        .issue(Identity { user_id, role }, chrono::Duration::minutes(5))
        .unwrap();
    state.hub.connect(&token).unwrap()
}

async fn next_event(connection: &mut Connection) -> ServerEvent {
    timeout(Duration::from_secs(1), connection.events.recv())
        .await
        .expect("event within a second")
        .expect("channel open")
}

#[tokio::test]
async fn rider_follows_driver_until_completion() {
    let (state, _rx) = setup(Duration::from_secs(60));
    let rider = add_user(&state, Role::Rider, None).await;
    let driver = add_driver(&state, GeoPoint { lat: 0.0, lng: 0.01 }).await;

    let view = state.bookings.create_booking(ride(rider)).await.unwrap();
    let booking_id = view.booking.id;
    assert_eq!(view.booking.status, BookingStatus::Assigned);
    assert_eq!(view.booking.driver_id(), Some(driver));
    assert!((view.booking.price - 171.5).abs() < 0.5);

    let mut rider_conn = connect(&state, rider, Role::Rider);
    let mut driver_conn = connect(&state, driver, Role::Driver);

    state
        .hub
        .handle(rider_conn.id, ClientEvent::Subscribe { booking_id })
        .await;
    assert_eq!(
        next_event(&mut rider_conn).await,
        ServerEvent::Subscribed { booking_id }
    );

    let position = GeoPoint {
        lat: 0.0,
        lng: 0.005,
    };
    state
        .hub
        .handle(
            driver_conn.id,
            ClientEvent::UpdatePosition {
                booking_id,
                location: position,
            },
        )
        .await;

    assert_eq!(
        next_event(&mut rider_conn).await,
        ServerEvent::PositionUpdated {
            booking_id,
            location: position
        }
    );
    assert!(driver_conn.events.try_recv().is_err());
    assert_eq!(
        state.locations.read_position(booking_id).await.unwrap(),
        Some(position)
    );

    let as_driver = Actor::User(Identity {
        user_id: driver,
        role: Role::Driver,
    });
    for next in [
        BookingStatus::EnRoute,
        BookingStatus::GoodsCollected,
        BookingStatus::Completed,
    ] {
        state
            .bookings
            .update_status(booking_id, next, as_driver)
            .await
            .unwrap();
    }

    let driver_record = state.store.get_user(driver).await.unwrap().unwrap();
    assert!(driver_record.is_available);

    state.hub.disconnect(rider_conn.id);
    state.hub.disconnect(driver_conn.id);
    assert_eq!(state.hub.room_count(), 0);
    assert_eq!(state.hub.connection_count(), 0);
}

#[tokio::test]
async fn rider_publish_is_reported_back_as_error() {
    let (state, _rx) = setup(Duration::from_secs(60));
    let rider = add_user(&state, Role::Rider, None).await;
    add_driver(&state, GeoPoint { lat: 0.0, lng: 0.01 }).await;
    let view = state.bookings.create_booking(ride(rider)).await.unwrap();
    let booking_id = view.booking.id;

    let mut rider_conn = connect(&state, rider, Role::Rider);
    state
        .hub
        .handle(
            rider_conn.id,
            ClientEvent::UpdatePosition {
                booking_id,
                location: GeoPoint { lat: 1.0, lng: 1.0 },
            },
        )
        .await;

    match next_event(&mut rider_conn).await {
        ServerEvent::Error {
            booking_id: Some(id),
            code,
            ..
        } => {
            assert_eq!(id, booking_id);
            assert_eq!(code, "unauthorized");
        }
        other => panic!("expected error event, got {other:?}"),
    }
    assert_eq!(state.locations.read_position(booking_id).await.unwrap(), None);
}

#[tokio::test]
async fn dispatcher_matches_queued_booking_once_a_driver_appears() {
    let (state, rx) = setup(Duration::from_millis(50));
    tokio::spawn(run_dispatcher(state.clone(), rx));

    let rider = add_user(&state, Role::Rider, None).await;
    let view = state.bookings.create_booking(ride(rider)).await.unwrap();
    assert_eq!(view.booking.status, BookingStatus::Pending);
    enqueue_booking(&state, view.booking.id).await.unwrap();

    let driver = add_driver(&state, GeoPoint { lat: 0.01, lng: 0.0 }).await;

    let assigned = timeout(Duration::from_secs(2), async {
        loop {
            let booking = state
                .store
                .get_booking(view.booking.id)
                .await
                .unwrap()
                .unwrap();
            if booking.status == BookingStatus::Assigned {
                return booking;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("dispatcher assigned the booking");

    assert_eq!(assigned.driver_id(), Some(driver));
}
