use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{get, post, put};
use chrono::Utc;
use serde::Deserialize;
use tracing::info;
use uuid::Uuid;

use crate::auth::Identity;
use crate::error::AppError;
use crate::models::location::GeoPoint;
use crate::models::user::{Role, User};
use crate::models::vehicle::{Vehicle, VehicleClass};
use crate::state::AppState;
use crate::store::AvailabilityChange;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/users", post(create_user))
        .route("/vehicles", post(create_vehicle))
        .route("/drivers/available", get(list_available_drivers))
        .route("/drivers/:id/location", put(update_driver_location))
        .route("/drivers/:id/availability", put(update_driver_availability))
}

#[derive(Deserialize)]
pub struct CreateUserRequest {
    pub name: String,
    pub role: Role,
    pub location: Option<GeoPoint>,
    pub rating: Option<f64>,
}

#[derive(Deserialize)]
pub struct CreateVehicleRequest {
    pub driver_id: Uuid,
    pub class: VehicleClass,
    pub plate: String,
}

#[derive(Deserialize)]
pub struct UpdateAvailabilityRequest {
    pub is_available: bool,
}

/// Riders may sign up on their own; drivers and admins are registered by an admin.
async fn create_user(
    State(state): State<Arc<AppState>>,
    identity: Option<Identity>,
    Json(payload): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), AppError> {
    if payload.role != Role::Rider {
        match identity {
            Some(identity) if identity.is_admin() => {}
            Some(identity) => {
                return Err(AppError::Unauthorized(format!(
                    "user {} may not register {:?} accounts",
                    identity.user_id, payload.role
                )));
            }
            None => {
                return Err(AppError::AuthenticationFailed(
                    "registering drivers or admins requires an admin token".to_string(),
                ));
            }
        }
    }
    if payload.name.trim().is_empty() {
        return Err(AppError::Validation("name cannot be empty".to_string()));
    }
    if let Some(location) = payload.location {
        if !location.is_valid() {
            return Err(AppError::Validation(
                "location coordinates are out of range".to_string(),
            ));
        }
    }

    let user = User {
        id: Uuid::new_v4(),
        name: payload.name,
        role: payload.role,
        is_available: payload.role == Role::Driver,
        current_location: payload.location,
        rating: payload.rating.map(|rating| rating.clamp(0.0, 5.0)),
        updated_at: Utc::now(),
    };

    state.store.insert_user(user.clone()).await?;
    info!(user_id = %user.id, role = ?user.role, "user registered");
    Ok((StatusCode::CREATED, Json(user)))
}

async fn create_vehicle(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateVehicleRequest>,
) -> Result<(StatusCode, Json<Vehicle>), AppError> {
    if payload.plate.trim().is_empty() {
        return Err(AppError::Validation("plate cannot be empty".to_string()));
    }

    state
        .store
        .get_user(payload.driver_id)
        .await?
        .filter(User::is_driver)
        .ok_or_else(|| {
            AppError::InvalidDriver(format!("driver {} does not exist", payload.driver_id))
        })?;

    let vehicle = Vehicle {
        id: Uuid::new_v4(),
        driver_id: payload.driver_id,
        class: payload.class,
        plate: payload.plate,
        is_available: true,
        updated_at: Utc::now(),
    };

    state.store.insert_vehicle(vehicle.clone()).await?;
    info!(vehicle_id = %vehicle.id, driver_id = %vehicle.driver_id, "vehicle registered");
    Ok((StatusCode::CREATED, Json(vehicle)))
}

async fn list_available_drivers(
    State(state): State<Arc<AppState>>,
    _identity: Identity,
) -> Result<Json<Vec<User>>, AppError> {
    Ok(Json(state.store.available_drivers().await?))
}

async fn update_driver_location(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(payload): Json<GeoPoint>,
) -> Result<Json<User>, AppError> {
    ensure_self_or_admin(identity, id)?;
    if !payload.is_valid() {
        return Err(AppError::Validation(
            "location coordinates are out of range".to_string(),
        ));
    }

    let driver = state
        .store
        .update_driver_location(id, payload)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("driver {id} not found")))?;

    Ok(Json(driver))
}

async fn update_driver_availability(
    State(state): State<Arc<AppState>>,
    identity: Identity,
    Path(id): Path<Uuid>,
    Json(payload): Json<UpdateAvailabilityRequest>,
) -> Result<Json<User>, AppError> {
    ensure_self_or_admin(identity, id)?;

    let driver = match state
        .store
        .set_driver_availability(id, payload.is_available)
        .await?
    {
        AvailabilityChange::Updated(driver) => driver,
        AvailabilityChange::Reserved { booking_id } => {
            return Err(AppError::Conflict(format!(
                "driver {id} is committed to booking {booking_id}"
            )));
        }
        AvailabilityChange::Missing => {
            return Err(AppError::NotFound(format!("driver {id} not found")));
        }
    };

    info!(driver_id = %id, is_available = driver.is_available, "driver availability changed");
    Ok(Json(driver))
}

fn ensure_self_or_admin(identity: Identity, driver_id: Uuid) -> Result<(), AppError> {
    if identity.user_id == driver_id || identity.is_admin() {
        Ok(())
    } else {
        Err(AppError::Unauthorized(format!(
            "cannot act on behalf of driver {driver_id}"
        )))
    }
}
