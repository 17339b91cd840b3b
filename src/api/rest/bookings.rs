use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

use crate::auth::Identity;
use crate::engine::lifecycle::{Actor, NewBooking};
use crate::engine::queue::enqueue_booking;
use crate::error::AppError;
use crate::models::booking::{BookingStatus, BookingView};
use crate::models::location::{GeoPoint, Place};
use crate::models::vehicle::VehicleClass;
use crate::state::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/bookings", post(create_booking).get(list_bookings))
        .route("/bookings/:id", get(get_booking).delete(delete_booking))
        .route("/bookings/:id/status", put(update_status))
        .route("/bookings/:id/cancel", post(cancel_booking))
        .route("/bookings/:id/match", post(match_booking))
        .route("/bookings/:id/tracking", post(start_tracking))
        .route(
            "/bookings/:id/location",
            get(get_location).put(update_location),
        )
}

#[derive(Deserialize)]
pub struct CreateBookingRequest {
    /// Defaults to the caller.
    pub rider_id: Option<Uuid>,
    pub pickup: Place,
    pub dropoff: Place,
    pub vehicle_class: VehicleClass,
    pub driver_id: Option<Uuid>,
    pub vehicle_id: Option<Uuid>,
    pub price: Option<f64>,
    pub scheduled_time: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
pub struct UpdateStatusRequest {
    pub status: BookingStatus,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PositionSource {
    Live,
    Pickup,
}

#[derive(Serialize)]
pub struct LocationResponse {
    pub booking_id: Uuid,
    pub location: GeoPoint,
    pub source: PositionSource,
}

#[derive(Serialize)]
pub struct PublishResponse {
    pub booking_id: Uuid,
    pub delivered: usize,
}

async fn create_booking(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Json(payload): Json<CreateBookingRequest>,
) -> Result<(StatusCode, Json<BookingView>), AppError> {
    let rider_id = payload.rider_id.unwrap_or(identity.user_id);
    if rider_id != identity.user_id && !identity.is_admin() {
        return Err(AppError::Unauthorized(
            "cannot create bookings for another rider".to_string(),
        ));
    }

    let view = state
        .bookings
        .create_booking(NewBooking {
            rider_id,
            pickup: payload.pickup,
            dropoff: payload.dropoff,
            vehicle_class: payload.vehicle_class,
            driver_id: payload.driver_id,
            vehicle_id: payload.vehicle_id,
            price: payload.price,
            scheduled_time: payload.scheduled_time,
        })
        .await?;

    if view.booking.awaits_match() {
        if let Err(err) = enqueue_booking(&state, view.booking.id).await {
            warn!(booking_id = %view.booking.id, error = %err, "failed to queue booking for matching");
        }
    }

    Ok((StatusCode::CREATED, Json(view)))
}

async fn list_bookings(
    State(state): State<Arc<AppState>>,
    identity: Identity,
) -> Result<Json<Vec<BookingView>>, AppError> {
    Ok(Json(state.bookings.list_bookings(Actor::User(identity)).await?))
}

async fn get_booking(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<BookingView>, AppError> {
    Ok(Json(state.bookings.get_booking(id, Actor::User(identity)).await?))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateStatusRequest>,
) -> Result<Json<BookingView>, AppError> {
    let view = state
        .bookings
        .update_status(id, payload.status, Actor::User(identity))
        .await?;
    Ok(Json(view))
}

async fn cancel_booking(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<BookingView>, AppError> {
    Ok(Json(
        state
            .bookings
            .cancel_booking(id, Actor::User(identity))
            .await?,
    ))
}

async fn match_booking(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<BookingView>, AppError> {
    Ok(Json(
        state
            .bookings
            .assign_pending(id, Actor::User(identity))
            .await?,
    ))
}

async fn delete_booking(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, AppError> {
    state
        .bookings
        .delete_booking(id, Actor::User(identity))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Seeds the live position with the pickup point unless one is already known.
async fn start_tracking(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<LocationResponse>, AppError> {
    let booking = state.bookings.booking_for(id, Actor::User(identity)).await?;

    if let Some(location) = state.locations.read_position(id).await? {
        return Ok(Json(LocationResponse {
            booking_id: id,
            location,
            source: PositionSource::Live,
        }));
    }

    state
        .locations
        .record_position(id, booking.pickup.coordinates)
        .await?;

    Ok(Json(LocationResponse {
        booking_id: id,
        location: booking.pickup.coordinates,
        source: PositionSource::Pickup,
    }))
}

/// Last known position; falls back to the pickup point when nothing live is available.
async fn get_location(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
) -> Result<Json<LocationResponse>, AppError> {
    let booking = state.bookings.booking_for(id, Actor::User(identity)).await?;

    let live = match state.locations.read_position(id).await {
        Ok(position) => position,
        Err(err @ AppError::StoreUnavailable(_)) => {
            warn!(booking_id = %id, error = %err, "serving pickup as placeholder position");
            None
        }
        Err(err) => return Err(err),
    };

    let response = match live {
        Some(location) => LocationResponse {
            booking_id: id,
            location,
            source: PositionSource::Live,
        },
        None => LocationResponse {
            booking_id: id,
            location: booking.pickup.coordinates,
            source: PositionSource::Pickup,
        },
    };

    Ok(Json(response))
}

async fn update_location(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(payload): Json<GeoPoint>,
) -> Result<Json<PublishResponse>, AppError> {
    let delivered = state.hub.publish_as(identity, id, payload).await?;
    Ok(Json(PublishResponse {
        booking_id: id,
        delivered,
    }))
}
