use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use uuid::Uuid;

use crate::geo::haversine_km;
use crate::models::booking::{Booking, BookingStatus, Reservation};
use crate::models::location::GeoPoint;
use crate::models::user::User;
use crate::models::vehicle::Vehicle;
use crate::store::{
    AvailabilityChange, NearbyDriver, RecordStore, StoreCounts, StoreError, SwapOutcome,
};

/// In-process record store.
///
/// Lock order is always users, then vehicles, then the hold maps. Booking
/// entries are locked on their own and never while a user or vehicle guard
/// is held. A hold entry only changes while its driver or vehicle guard is
/// held, so it always agrees with `is_available`.
#[derive(Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    vehicles: DashMap<Uuid, Vehicle>,
    bookings: DashMap<Uuid, Booking>,
    /// Driver id to the booking currently holding them.
    driver_holds: DashMap<Uuid, Uuid>,
    vehicle_holds: DashMap<Uuid, Uuid>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn insert_user(&self, user: User) -> Result<(), StoreError> {
        self.users.insert(user.id, user);
        Ok(())
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&id).map(|entry| entry.value().clone()))
    }

    async fn update_driver_location(
        &self,
        id: Uuid,
        location: GeoPoint,
    ) -> Result<Option<User>, StoreError> {
        let Some(mut user) = self.users.get_mut(&id) else {
            return Ok(None);
        };
        if !user.is_driver() {
            return Ok(None);
        }

        user.current_location = Some(location);
        user.updated_at = Utc::now();
        Ok(Some(user.clone()))
    }

    async fn set_driver_availability(
        &self,
        id: Uuid,
        is_available: bool,
    ) -> Result<AvailabilityChange, StoreError> {
        let Some(mut user) = self.users.get_mut(&id) else {
            return Ok(AvailabilityChange::Missing);
        };
        if !user.is_driver() {
            return Ok(AvailabilityChange::Missing);
        }
        if is_available {
            if let Some(booking_id) = self.driver_holds.get(&id).map(|hold| *hold) {
                return Ok(AvailabilityChange::Reserved { booking_id });
            }
        }

        user.is_available = is_available;
        user.updated_at = Utc::now();
        Ok(AvailabilityChange::Updated(user.clone()))
    }

    async fn available_drivers(&self) -> Result<Vec<User>, StoreError> {
        Ok(self
            .users
            .iter()
            .filter(|entry| entry.is_driver() && entry.is_available)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn drivers_near(
        &self,
        point: GeoPoint,
        radius_km: f64,
    ) -> Result<Vec<NearbyDriver>, StoreError> {
        let mut nearby: Vec<NearbyDriver> = self
            .users
            .iter()
            .filter_map(|entry| {
                let driver = entry.value();
                if !driver.is_driver() || !driver.is_available {
                    return None;
                }

                let distance_km = haversine_km(&driver.current_location?, &point);
                (distance_km <= radius_km).then(|| NearbyDriver {
                    driver: driver.clone(),
                    distance_km,
                })
            })
            .collect();

        nearby.sort_by(|a, b| a.distance_km.total_cmp(&b.distance_km));
        Ok(nearby)
    }

    async fn insert_vehicle(&self, vehicle: Vehicle) -> Result<(), StoreError> {
        self.vehicles.insert(vehicle.id, vehicle);
        Ok(())
    }

    async fn get_vehicle(&self, id: Uuid) -> Result<Option<Vehicle>, StoreError> {
        Ok(self.vehicles.get(&id).map(|entry| entry.value().clone()))
    }

    async fn vehicles_for_driver(&self, driver_id: Uuid) -> Result<Vec<Vehicle>, StoreError> {
        Ok(self
            .vehicles
            .iter()
            .filter(|entry| entry.driver_id == driver_id)
            .map(|entry| entry.value().clone())
            .collect())
    }

    async fn reserve(&self, reservation: Reservation, holder: Uuid) -> Result<bool, StoreError> {
        let Some(mut driver) = self.users.get_mut(&reservation.driver_id) else {
            return Ok(false);
        };
        let Some(mut vehicle) = self.vehicles.get_mut(&reservation.vehicle_id) else {
            return Ok(false);
        };

        if !driver.is_available
            || !vehicle.is_available
            || vehicle.driver_id != reservation.driver_id
        {
            return Ok(false);
        }

        let now = Utc::now();
        driver.is_available = false;
        driver.updated_at = now;
        vehicle.is_available = false;
        vehicle.updated_at = now;
        self.driver_holds.insert(reservation.driver_id, holder);
        self.vehicle_holds.insert(reservation.vehicle_id, holder);
        Ok(true)
    }

    async fn release(
        &self,
        reservation: Reservation,
        released_by: Uuid,
    ) -> Result<(), StoreError> {
        let now = Utc::now();

        if let Some(mut driver) = self.users.get_mut(&reservation.driver_id) {
            let released = self
                .driver_holds
                .remove_if(&reservation.driver_id, |_, holder| *holder == released_by)
                .is_some();
            if released {
                driver.is_available = true;
                driver.updated_at = now;
            }
        }
        if let Some(mut vehicle) = self.vehicles.get_mut(&reservation.vehicle_id) {
            let released = self
                .vehicle_holds
                .remove_if(&reservation.vehicle_id, |_, holder| *holder == released_by)
                .is_some();
            if released {
                vehicle.is_available = true;
                vehicle.updated_at = now;
            }
        }

        Ok(())
    }

    async fn insert_booking(&self, booking: Booking) -> Result<(), StoreError> {
        self.bookings.insert(booking.id, booking);
        Ok(())
    }

    async fn get_booking(&self, id: Uuid) -> Result<Option<Booking>, StoreError> {
        Ok(self.bookings.get(&id).map(|entry| entry.value().clone()))
    }

    async fn list_bookings(&self) -> Result<Vec<Booking>, StoreError> {
        let mut bookings: Vec<Booking> = self
            .bookings
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        bookings.sort_by_key(|booking| booking.created_at);
        Ok(bookings)
    }

    async fn delete_booking(&self, id: Uuid) -> Result<bool, StoreError> {
        Ok(self.bookings.remove(&id).is_some())
    }

    async fn transition_booking(
        &self,
        id: Uuid,
        expected: BookingStatus,
        next: BookingStatus,
    ) -> Result<SwapOutcome, StoreError> {
        let Some(mut booking) = self.bookings.get_mut(&id) else {
            return Ok(SwapOutcome::Missing);
        };
        if booking.status != expected {
            return Ok(SwapOutcome::Stale(booking.clone()));
        }

        booking.status = next;
        booking.updated_at = Utc::now();
        Ok(SwapOutcome::Applied(booking.clone()))
    }

    async fn assign_booking(
        &self,
        id: Uuid,
        reservation: Reservation,
    ) -> Result<SwapOutcome, StoreError> {
        let Some(mut booking) = self.bookings.get_mut(&id) else {
            return Ok(SwapOutcome::Missing);
        };
        if !booking.awaits_match() {
            return Ok(SwapOutcome::Stale(booking.clone()));
        }

        booking.reservation = Some(reservation);
        booking.status = BookingStatus::Assigned;
        booking.updated_at = Utc::now();
        Ok(SwapOutcome::Applied(booking.clone()))
    }

    async fn counts(&self) -> Result<StoreCounts, StoreError> {
        Ok(StoreCounts {
            users: self.users.len(),
            vehicles: self.vehicles.len(),
            bookings: self.bookings.len(),
        })
    }
}
