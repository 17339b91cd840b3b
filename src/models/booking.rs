use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::location::Place;
use crate::models::user::{Role, User};
use crate::models::vehicle::{Vehicle, VehicleClass};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Scheduled,
    Assigned,
    EnRoute,
    GoodsCollected,
    Completed,
    Cancelled,
}

impl BookingStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, BookingStatus::Completed | BookingStatus::Cancelled)
    }

    /// Statuses during which the reserved driver and vehicle must stay unavailable.
    pub fn holds_reservation(self) -> bool {
        matches!(
            self,
            BookingStatus::Assigned | BookingStatus::EnRoute | BookingStatus::GoodsCollected
        )
    }

    pub fn can_transition_to(self, next: BookingStatus) -> bool {
        use BookingStatus::*;

        matches!(
            (self, next),
            (Pending, Assigned)
                | (Pending, Cancelled)
                | (Scheduled, Pending)
                | (Scheduled, Cancelled)
                | (Assigned, EnRoute)
                | (Assigned, Cancelled)
                | (EnRoute, GoodsCollected)
                | (EnRoute, Cancelled)
                | (GoodsCollected, Completed)
                | (GoodsCollected, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Scheduled => "scheduled",
            BookingStatus::Assigned => "assigned",
            BookingStatus::EnRoute => "en_route",
            BookingStatus::GoodsCollected => "goods_collected",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

/// The driver and vehicle committed to a booking. They are always set together.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct Reservation {
    pub driver_id: Uuid,
    pub vehicle_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub rider_id: Uuid,
    pub reservation: Option<Reservation>,
    pub pickup: Place,
    pub dropoff: Place,
    pub vehicle_class: VehicleClass,
    pub distance_km: f64,
    pub price: f64,
    pub status: BookingStatus,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Booking {
    pub fn driver_id(&self) -> Option<Uuid> {
        self.reservation.map(|r| r.driver_id)
    }

    pub fn vehicle_id(&self) -> Option<Uuid> {
        self.reservation.map(|r| r.vehicle_id)
    }

    pub fn is_participant(&self, user_id: Uuid) -> bool {
        self.rider_id == user_id || self.driver_id() == Some(user_id)
    }

    /// Pending bookings that still need a driver.
    pub fn awaits_match(&self) -> bool {
        self.status == BookingStatus::Pending && self.reservation.is_none()
    }
}

/// Public projection of a user, without availability internals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserSummary {
    pub id: Uuid,
    pub name: String,
    pub role: Role,
    pub rating: Option<f64>,
}

impl From<&User> for UserSummary {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            name: user.name.clone(),
            role: user.role,
            rating: user.rating,
        }
    }
}

/// Read model returned by the API: the booking plus its resolved participants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingView {
    #[serde(flatten)]
    pub booking: Booking,
    pub rider: Option<UserSummary>,
    pub driver: Option<UserSummary>,
    pub vehicle: Option<Vehicle>,
}

#[cfg(test)]
mod tests {
    use super::BookingStatus::{self, *};

    const ALL: [BookingStatus; 7] = [
        Pending,
        Scheduled,
        Assigned,
        EnRoute,
        GoodsCollected,
        Completed,
        Cancelled,
    ];

    #[test]
    fn pending_cannot_jump_to_completed() {
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(EnRoute));
    }

    #[test]
    fn every_non_terminal_state_can_be_cancelled() {
        for status in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(status.can_transition_to(Cancelled), "{status:?}");
        }
    }

    #[test]
    fn terminal_states_have_no_outgoing_edges() {
        for next in ALL {
            assert!(!Completed.can_transition_to(next));
            assert!(!Cancelled.can_transition_to(next));
        }
    }

    #[test]
    fn happy_path_is_legal_step_by_step() {
        let path = [Pending, Assigned, EnRoute, GoodsCollected, Completed];
        for pair in path.windows(2) {
            assert!(pair[0].can_transition_to(pair[1]), "{:?}", pair);
        }
        assert!(Scheduled.can_transition_to(Pending));
        assert!(!Scheduled.can_transition_to(Assigned));
    }

    #[test]
    fn only_active_ride_states_hold_a_reservation() {
        let holding: Vec<_> = ALL.into_iter().filter(|s| s.holds_reservation()).collect();
        assert_eq!(holding, vec![Assigned, EnRoute, GoodsCollected]);
    }
}
