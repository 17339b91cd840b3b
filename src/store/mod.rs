//! Durable records: users, vehicles and bookings.
//!
//! The store is the single source of truth for availability. Every method
//! that changes availability or booking status is a conditional write so
//! concurrent callers cannot both win. Reservations remember the booking
//! that holds them, so a release can only undo its own reservation.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::models::booking::{Booking, BookingStatus, Reservation};
use crate::models::location::GeoPoint;
use crate::models::user::User;
use crate::models::vehicle::Vehicle;

pub use memory::MemoryStore;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Clone)]
pub struct NearbyDriver {
    pub driver: User,
    pub distance_km: f64,
}

/// Result of a compare-and-swap on a booking.
#[derive(Debug, Clone)]
pub enum SwapOutcome {
    Applied(Booking),
    /// The stored booking no longer matched the expected state; carries the current record.
    Stale(Booking),
    Missing,
}

/// Result of a driver toggling their own availability.
#[derive(Debug, Clone)]
pub enum AvailabilityChange {
    Updated(User),
    /// Refused: the driver is reserved by this booking.
    Reserved { booking_id: Uuid },
    Missing,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StoreCounts {
    pub users: usize,
    pub vehicles: usize,
    pub bookings: usize,
}

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn insert_user(&self, user: User) -> Result<(), StoreError>;
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError>;
    async fn update_driver_location(
        &self,
        id: Uuid,
        location: GeoPoint,
    ) -> Result<Option<User>, StoreError>;
    /// Going available is refused while a booking holds the driver.
    async fn set_driver_availability(
        &self,
        id: Uuid,
        is_available: bool,
    ) -> Result<AvailabilityChange, StoreError>;
    async fn available_drivers(&self) -> Result<Vec<User>, StoreError>;
    /// Available drivers within `radius_km` of `point`, nearest first.
    async fn drivers_near(
        &self,
        point: GeoPoint,
        radius_km: f64,
    ) -> Result<Vec<NearbyDriver>, StoreError>;

    async fn insert_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError>;
    async fn get_vehicle(&self, id: Uuid) -> Result<Option<Vehicle>, StoreError>;
    async fn vehicles_for_driver(&self, driver_id: Uuid) -> Result<Vec<Vehicle>, StoreError>;

    /// Marks driver and vehicle unavailable and held by `holder` iff both are
    /// currently available. Returns false without changing anything when
    /// either is taken.
    async fn reserve(&self, reservation: Reservation, holder: Uuid) -> Result<bool, StoreError>;
    /// Makes available again whichever of driver and vehicle is still held by
    /// `released_by`. Anything held by another booking, or not held at all, is
    /// left alone, so repeating a release is harmless.
    async fn release(&self, reservation: Reservation, released_by: Uuid)
    -> Result<(), StoreError>;

    async fn insert_booking(&self, booking: Booking) -> Result<(), StoreError>;
    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError>;
    async fn list_bookings(&self) -> Result<Vec<Booking>, StoreError>;
    async fn delete_booking(&self, id: Uuid) -> Result<bool, StoreError>;
    /// Moves a booking to `next` only if its stored status is still `expected`.
    async fn transition_booking(
        &self,
        id: Uuid,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<SwapOutcome, StoreError>;
    /// Attaches a reservation to a pending, unmatched booking and marks it assigned.
    async fn assign_booking(
        &self,
        id: Uuid,
        reservation: Reservation,
    ) -> Result<SwapOutcome, StoreError>;

    async fn counts(&self) -> Result<StoreCounts, StoreError>;
}
