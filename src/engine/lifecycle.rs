//! Booking creation, matching and status transitions.
//!
//! Availability changes go through the store's conditional writes
//! (`reserve`, `assign_booking`, `transition_booking`), so no lock is held
//! here while waiting on I/O.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::Identity;
use crate::config::DispatchConfig;
use crate::engine::matcher::DispatchMatcher;
use crate::engine::pricing::{PricingEngine, derived_demand_factor};
use crate::engine::scoring::Candidate;
use crate::error::AppError;
use crate::geo::haversine_km;
use crate::models::booking::{Booking, BookingStatus, BookingView, Reservation, UserSummary};
use crate::models::location::Place;
use crate::models::user::Role;
use crate::models::vehicle::VehicleClass;
use crate::observability::metrics::Metrics;
use crate::store::{RecordStore, SwapOutcome};

/// Extra match attempts after losing a reservation race.
const RESERVATION_RETRIES: usize = 1;

/// Who is asking for a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Actor {
    User(Identity),
    /// The background dispatcher.
    System,
}

#[derive(Debug, Clone)]
pub struct NewBooking {
    pub rider_id: Uuid,
    pub pickup: Place,
    pub dropoff: Place,
    pub vehicle_class: VehicleClass,
    pub driver_id: Option<Uuid>,
    pub vehicle_id: Option<Uuid>,
    pub price: Option<f64>,
    pub scheduled_time: Option<DateTime<Utc>>,
}

pub struct BookingManager {
    store: Arc<dyn RecordStore>,
    matcher: DispatchMatcher,
    pricing: PricingEngine,
    config: DispatchConfig,
    metrics: Metrics,
}

impl BookingManager {
    pub fn new(
        store: Arc<dyn RecordStore>,
        pricing: PricingEngine,
        config: DispatchConfig,
        metrics: Metrics,
    ) -> Self {
        Self {
            matcher: DispatchMatcher::new(store.clone()),
            store,
            pricing,
            config,
            metrics,
        }
    }

    pub async fn create_booking(&self, request: NewBooking) -> Result<BookingView, AppError> {
        validate_place("pickup", &request.pickup)?;
        validate_place("dropoff", &request.dropoff)?;
        if let Some(price) = request.price {
            if !price.is_finite() || price < 0.0 {
                return Err(AppError::Validation(format!(
                    "price must be a non-negative number, got {price}"
                )));
            }
        }

        if self.store.get_user(request.rider_id).await?.is_none() {
            return Err(AppError::InvalidRider(format!(
                "rider {} does not exist",
                request.rider_id
            )));
        }

        let now = Utc::now();
        if let Some(at) = request.scheduled_time {
            if at <= now {
                return Err(AppError::InvalidSchedule(format!(
                    "scheduled time {at} is not in the future"
                )));
            }
            if request.driver_id.is_some() || request.vehicle_id.is_some() {
                return Err(AppError::Validation(
                    "scheduled bookings are matched when they become due".to_string(),
                ));
            }
        }

        let manual = match (request.driver_id, request.vehicle_id) {
            (Some(driver_id), vehicle_id) => Some(
                self.resolve_manual(driver_id, vehicle_id, request.vehicle_class)
                    .await?,
            ),
            (None, Some(_)) => {
                return Err(AppError::Validation(
                    "vehicle_id requires driver_id".to_string(),
                ));
            }
            (None, None) => None,
        };

        let booking_id = Uuid::new_v4();
        let distance_km = haversine_km(&request.pickup.coordinates, &request.dropoff.coordinates);
        let price = match request.price {
            Some(price) => price,
            None => {
                let demand = self.demand_factor().await?;
                self.pricing
                    .quote(distance_km, request.vehicle_class, demand)?
            }
        };

        let reservation = if request.scheduled_time.is_some() {
            None
        } else if let Some(reservation) = manual {
            if !self.store.reserve(reservation, booking_id).await? {
                self.metrics.reservation_conflicts_total.inc();
                return Err(AppError::Conflict(format!(
                    "driver {} or vehicle {} was reserved by another booking",
                    reservation.driver_id, reservation.vehicle_id
                )));
            }
            Some(reservation)
        } else {
            self.reserve_best(&request.pickup, request.vehicle_class, booking_id)
                .await?
                .map(|candidate| reservation_of(&candidate))
        };

        let status = match (request.scheduled_time, reservation) {
            (Some(_), _) => BookingStatus::Scheduled,
            (None, Some(_)) => BookingStatus::Assigned,
            (None, None) => BookingStatus::Pending,
        };

        let booking = Booking {
            id: booking_id,
            rider_id: request.rider_id,
            reservation,
            pickup: request.pickup,
            dropoff: request.dropoff,
            vehicle_class: request.vehicle_class,
            distance_km,
            price,
            status,
            scheduled_time: request.scheduled_time,
            created_at: now,
            updated_at: now,
        };

        if let Err(err) = self.store.insert_booking(booking.clone()).await {
            if let Some(reservation) = reservation {
                self.release_quietly(reservation, booking.id).await;
            }
            return Err(err.into());
        }

        self.metrics
            .bookings_total
            .with_label_values(&[status.as_str()])
            .inc();
        info!(
            booking_id = %booking.id,
            rider_id = %booking.rider_id,
            driver_id = ?booking.driver_id(),
            status = status.as_str(),
            price = booking.price,
            "booking created"
        );

        self.view(booking).await
    }

    /// Runs matching for a pending booking that has no driver yet.
    pub async fn assign_pending(&self, booking_id: Uuid, actor: Actor) -> Result<BookingView, AppError> {
        let booking = self.load(booking_id).await?;
        authorize(&booking, BookingStatus::Assigned, actor)?;

        if booking.status != BookingStatus::Pending {
            return Err(AppError::InvalidTransition {
                from: booking.status,
                to: BookingStatus::Assigned,
            });
        }
        if booking.reservation.is_some() {
            return Err(AppError::Conflict(format!(
                "booking {booking_id} already has a driver"
            )));
        }

        let Some(candidate) = self
            .reserve_best(&booking.pickup, booking.vehicle_class, booking_id)
            .await?
        else {
            return Err(AppError::NoMatch);
        };
        let reservation = reservation_of(&candidate);

        match self.store.assign_booking(booking_id, reservation).await {
            Ok(SwapOutcome::Applied(updated)) => {
                self.metrics
                    .booking_transitions_total
                    .with_label_values(&[BookingStatus::Assigned.as_str()])
                    .inc();
                info!(
                    booking_id = %booking_id,
                    driver_id = %reservation.driver_id,
                    vehicle_id = %reservation.vehicle_id,
                    "pending booking assigned"
                );
                self.view(updated).await
            }
            Ok(SwapOutcome::Stale(current)) => {
                self.release_quietly(reservation, booking_id).await;
                Err(AppError::Conflict(format!(
                    "booking {booking_id} changed concurrently and is now {}",
                    current.status.as_str()
                )))
            }
            Ok(SwapOutcome::Missing) => {
                self.release_quietly(reservation, booking_id).await;
                Err(AppError::NotFound(format!("booking {booking_id} not found")))
            }
            Err(err) => {
                self.release_quietly(reservation, booking_id).await;
                Err(err.into())
            }
        }
    }

    pub async fn update_status(
        &self,
        booking_id: Uuid,
        next: BookingStatus,
        actor: Actor,
    ) -> Result<BookingView, AppError> {
        if next == BookingStatus::Assigned {
            return self.assign_pending(booking_id, actor).await;
        }

        let booking = self.load(booking_id).await?;
        authorize(&booking, next, actor)?;

        if !booking.status.can_transition_to(next) {
            return Err(AppError::InvalidTransition {
                from: booking.status,
                to: next,
            });
        }

        let updated = match self
            .store
            .transition_booking(booking_id, booking.status, next)
            .await?
        {
            SwapOutcome::Applied(updated) => updated,
            SwapOutcome::Stale(current) => {
                return Err(AppError::Conflict(format!(
                    "booking {booking_id} changed concurrently and is now {}",
                    current.status.as_str()
                )));
            }
            SwapOutcome::Missing => {
                return Err(AppError::NotFound(format!("booking {booking_id} not found")));
            }
        };

        self.metrics
            .booking_transitions_total
            .with_label_values(&[next.as_str()])
            .inc();
        info!(
            booking_id = %booking_id,
            from = booking.status.as_str(),
            to = next.as_str(),
            "booking status changed"
        );

        if next.is_terminal() {
            self.release_held(&updated).await?;
        }

        self.view(updated).await
    }

    /// Cancelling an already-cancelled booking succeeds without changing it.
    pub async fn cancel_booking(&self, booking_id: Uuid, actor: Actor) -> Result<BookingView, AppError> {
        let booking = self.load(booking_id).await?;
        if booking.status == BookingStatus::Cancelled {
            authorize(&booking, BookingStatus::Cancelled, actor)?;
            self.release_held(&booking).await?;
            return self.view(booking).await;
        }

        match self
            .update_status(booking_id, BookingStatus::Cancelled, actor)
            .await
        {
            Err(AppError::Conflict(reason)) => {
                let current = self.load(booking_id).await?;
                if current.status == BookingStatus::Cancelled {
                    debug!(booking_id = %booking_id, "booking was cancelled concurrently");
                    self.view(current).await
                } else {
                    Err(AppError::Conflict(reason))
                }
            }
            other => other,
        }
    }

    /// Removes a finished booking. Active bookings must be cancelled first.
    pub async fn delete_booking(&self, booking_id: Uuid, actor: Actor) -> Result<(), AppError> {
        let booking = self.load(booking_id).await?;
        if let Actor::User(identity) = actor {
            if !identity.is_admin() && identity.user_id != booking.rider_id {
                return Err(AppError::Unauthorized(
                    "only the rider or an administrator may delete a booking".to_string(),
                ));
            }
        }

        if !booking.status.is_terminal() {
            return Err(AppError::Conflict(format!(
                "booking {booking_id} is {} and must be completed or cancelled before deletion",
                booking.status.as_str()
            )));
        }

        self.release_held(&booking).await?;

        if !self.store.delete_booking(booking_id).await? {
            return Err(AppError::NotFound(format!("booking {booking_id} not found")));
        }

        info!(booking_id = %booking_id, "booking deleted");
        Ok(())
    }

    pub async fn get_booking(&self, booking_id: Uuid, actor: Actor) -> Result<BookingView, AppError> {
        let booking = self.load(booking_id).await?;
        ensure_can_view(&booking, actor)?;
        self.view(booking).await
    }

    pub async fn list_bookings(&self, actor: Actor) -> Result<Vec<BookingView>, AppError> {
        let bookings = self.store.list_bookings().await?;
        let mut views = Vec::new();

        for booking in bookings {
            if ensure_can_view(&booking, actor).is_ok() {
                views.push(self.view(booking).await?);
            }
        }

        Ok(views)
    }

    /// Loads a booking the actor is allowed to see, without resolving participants.
    pub async fn booking_for(&self, booking_id: Uuid, actor: Actor) -> Result<Booking, AppError> {
        let booking = self.load(booking_id).await?;
        ensure_can_view(&booking, actor)?;
        Ok(booking)
    }

    /// Moves scheduled bookings whose time has come into `pending`.
    pub async fn activate_due(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, AppError> {
        let due: Vec<Uuid> = self
            .store
            .list_bookings()
            .await?
            .into_iter()
            .filter(|booking| {
                booking.status == BookingStatus::Scheduled
                    && booking.scheduled_time.is_some_and(|at| at <= now)
            })
            .map(|booking| booking.id)
            .collect();

        let mut activated = Vec::with_capacity(due.len());
        for booking_id in due {
            match self
                .update_status(booking_id, BookingStatus::Pending, Actor::System)
                .await
            {
                Ok(_) => activated.push(booking_id),
                Err(AppError::Conflict(_) | AppError::InvalidTransition { .. } | AppError::NotFound(_)) => {
                    debug!(booking_id = %booking_id, "scheduled booking changed before activation");
                }
                Err(err) => return Err(err),
            }
        }

        Ok(activated)
    }

    /// Retries releases that failed after a booking became terminal.
    pub async fn release_finished(&self) -> Result<(), AppError> {
        for booking in self.store.list_bookings().await? {
            if booking.status.is_terminal() {
                self.release_held(&booking).await?;
            }
        }
        Ok(())
    }

    pub async fn unmatched_bookings(&self) -> Result<Vec<Uuid>, AppError> {
        Ok(self
            .store
            .list_bookings()
            .await?
            .into_iter()
            .filter(Booking::awaits_match)
            .map(|booking| booking.id)
            .collect())
    }

    pub async fn demand_factor(&self) -> Result<f64, AppError> {
        if let Some(fixed) = self.config.demand_factor {
            return Ok(fixed);
        }

        let pending = self.unmatched_bookings().await?.len();
        let available = self.store.available_drivers().await?.len();
        Ok(derived_demand_factor(pending, available))
    }

    pub async fn view(&self, booking: Booking) -> Result<BookingView, AppError> {
        let rider = self
            .store
            .get_user(booking.rider_id)
            .await?
            .map(|user| UserSummary::from(&user));

        let (driver, vehicle) = match booking.reservation {
            Some(reservation) => (
                self.store
                    .get_user(reservation.driver_id)
                    .await?
                    .map(|user| UserSummary::from(&user)),
                self.store.get_vehicle(reservation.vehicle_id).await?,
            ),
            None => (None, None),
        };

        Ok(BookingView {
            booking,
            rider,
            driver,
            vehicle,
        })
    }

    async fn load(&self, booking_id: Uuid) -> Result<Booking, AppError> {
        self.store
            .get_booking(booking_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("booking {booking_id} not found")))
    }

    async fn resolve_manual(
        &self,
        driver_id: Uuid,
        vehicle_id: Option<Uuid>,
        class: VehicleClass,
    ) -> Result<Reservation, AppError> {
        let driver = self
            .store
            .get_user(driver_id)
            .await?
            .filter(|user| user.is_driver())
            .ok_or_else(|| AppError::InvalidDriver(format!("driver {driver_id} does not exist")))?;

        if !driver.is_available {
            return Err(AppError::InvalidDriver(format!(
                "driver {driver_id} is not available"
            )));
        }

        let vehicle = match vehicle_id {
            Some(vehicle_id) => {
                let vehicle = self
                    .store
                    .get_vehicle(vehicle_id)
                    .await?
                    .filter(|vehicle| vehicle.driver_id == driver_id)
                    .ok_or_else(|| {
                        AppError::InvalidVehicle(format!(
                            "vehicle {vehicle_id} does not belong to driver {driver_id}"
                        ))
                    })?;
                if !vehicle.is_available {
                    return Err(AppError::InvalidVehicle(format!(
                        "vehicle {vehicle_id} is not available"
                    )));
                }
                vehicle
            }
            None => self
                .store
                .vehicles_for_driver(driver_id)
                .await?
                .into_iter()
                .filter(|vehicle| vehicle.class == class && vehicle.is_available)
                .min_by_key(|vehicle| vehicle.id)
                .ok_or_else(|| {
                    AppError::InvalidVehicle(format!(
                        "driver {driver_id} has no available {class:?} vehicle"
                    ))
                })?,
        };

        Ok(Reservation {
            driver_id,
            vehicle_id: vehicle.id,
        })
    }

    /// Frees whatever this booking still holds. The store ignores driver and
    /// vehicle records that were already released or re-reserved elsewhere.
    async fn release_held(&self, booking: &Booking) -> Result<(), AppError> {
        let Some(reservation) = booking.reservation else {
            return Ok(());
        };

        self.store
            .release(reservation, booking.id)
            .await
            .inspect_err(|err| {
                warn!(
                    booking_id = %booking.id,
                    driver_id = %reservation.driver_id,
                    error = %err,
                    "release failed; will be retried"
                )
            })?;
        debug!(
            booking_id = %booking.id,
            driver_id = %reservation.driver_id,
            vehicle_id = %reservation.vehicle_id,
            "reservation released"
        );
        Ok(())
    }

    /// Matches and reserves, retrying once with the losing driver excluded.
    async fn reserve_best(
        &self,
        pickup: &Place,
        class: VehicleClass,
        holder: Uuid,
    ) -> Result<Option<Candidate>, AppError> {
        let start = Instant::now();
        let mut excluded = HashSet::new();

        for attempt in 0..=RESERVATION_RETRIES {
            let found = self
                .matcher
                .find_match(pickup.coordinates, class, self.config.match_radius_km, &excluded)
                .await;

            let candidate = match found {
                Ok(Some(candidate)) => candidate,
                Ok(None) => {
                    self.observe_match(start, "no_match");
                    return Ok(None);
                }
                Err(err) => {
                    self.observe_match(start, "error");
                    return Err(err);
                }
            };

            if self.store.reserve(reservation_of(&candidate), holder).await? {
                self.observe_match(start, "reserved");
                return Ok(Some(candidate));
            }

            self.metrics.reservation_conflicts_total.inc();
            warn!(
                attempt,
                driver_id = %candidate.driver_id,
                "reservation lost to a concurrent booking"
            );
            excluded.insert(candidate.driver_id);
        }

        self.observe_match(start, "conflict");
        Ok(None)
    }

    fn observe_match(&self, start: Instant, outcome: &str) {
        self.metrics
            .match_latency_seconds
            .with_label_values(&[outcome])
            .observe(start.elapsed().as_secs_f64());
    }

    async fn release_quietly(&self, reservation: Reservation, booking_id: Uuid) {
        if let Err(err) = self.store.release(reservation, booking_id).await {
            warn!(
                booking_id = %booking_id,
                driver_id = %reservation.driver_id,
                error = %err,
                "failed to roll back reservation"
            );
        }
    }
}

fn reservation_of(candidate: &Candidate) -> Reservation {
    Reservation {
        driver_id: candidate.driver_id,
        vehicle_id: candidate.vehicle_id,
    }
}

fn validate_place(field: &str, place: &Place) -> Result<(), AppError> {
    if place.address.trim().is_empty() {
        return Err(AppError::Validation(format!("{field} address cannot be empty")));
    }
    if !place.coordinates.is_valid() {
        return Err(AppError::Validation(format!(
            "{field} coordinates are out of range"
        )));
    }
    Ok(())
}

fn ensure_can_view(booking: &Booking, actor: Actor) -> Result<(), AppError> {
    match actor {
        Actor::System => Ok(()),
        Actor::User(identity) if identity.is_admin() || booking.is_participant(identity.user_id) => {
            Ok(())
        }
        Actor::User(_) => Err(AppError::Unauthorized(format!(
            "not a participant of booking {}",
            booking.id
        ))),
    }
}

/// Drivers move the ride forward, riders may cancel or activate, admins may do anything.
fn authorize(booking: &Booking, next: BookingStatus, actor: Actor) -> Result<(), AppError> {
    let identity = match actor {
        Actor::System => return Ok(()),
        Actor::User(identity) if identity.role == Role::Admin => return Ok(()),
        Actor::User(identity) => identity,
    };

    let is_rider = identity.user_id == booking.rider_id;
    let is_driver = booking.driver_id() == Some(identity.user_id);

    let allowed = match next {
        BookingStatus::Cancelled => is_rider || is_driver,
        BookingStatus::Pending | BookingStatus::Assigned => is_rider,
        BookingStatus::EnRoute | BookingStatus::GoodsCollected | BookingStatus::Completed => {
            is_driver
        }
        BookingStatus::Scheduled => false,
    };

    if allowed {
        Ok(())
    } else {
        Err(AppError::Unauthorized(format!(
            "user {} may not move booking {} to {}",
            identity.user_id,
            booking.id,
            next.as_str()
        )))
    }
}
