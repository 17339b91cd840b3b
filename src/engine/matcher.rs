use std::collections::HashSet;
use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use crate::engine::scoring::{Candidate, compute_score, rank};
use crate::error::AppError;
use crate::models::location::GeoPoint;
use crate::models::vehicle::VehicleClass;
use crate::store::RecordStore;

pub const DEFAULT_RADIUS_KM: f64 = 10.0;

/// Read-only driver selection. Reserving the winner is the caller's job.
#[derive(Clone)]
pub struct DispatchMatcher {
    store: Arc<dyn RecordStore>,
}

impl DispatchMatcher {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Every eligible driver within `radius_km`, best first.
    pub async fn candidates(
        &self,
        pickup: GeoPoint,
        class: VehicleClass,
        radius_km: f64,
        excluded: &HashSet<Uuid>,
    ) -> Result<Vec<Candidate>, AppError> {
        if !radius_km.is_finite() || radius_km <= 0.0 {
            return Err(AppError::Validation(format!(
                "search radius must be positive, got {radius_km}"
            )));
        }

        let nearby = self.store.drivers_near(pickup, radius_km).await?;
        let mut candidates = Vec::with_capacity(nearby.len());

        for entry in nearby {
            if excluded.contains(&entry.driver.id) {
                continue;
            }

            let vehicle_id = self
                .store
                .vehicles_for_driver(entry.driver.id)
                .await?
                .into_iter()
                .filter(|vehicle| vehicle.class == class && vehicle.is_available)
                .map(|vehicle| vehicle.id)
                .min();

            let Some(vehicle_id) = vehicle_id else {
                continue;
            };

            let breakdown = compute_score(entry.distance_km, entry.driver.rating);
            candidates.push(Candidate {
                driver_id: entry.driver.id,
                vehicle_id,
                distance_km: entry.distance_km,
                score: breakdown.total(),
                breakdown,
            });
        }

        candidates.sort_by(rank);
        Ok(candidates)
    }

    pub async fn find_match(
        &self,
        pickup: GeoPoint,
        class: VehicleClass,
        radius_km: f64,
        excluded: &HashSet<Uuid>,
    ) -> Result<Option<Candidate>, AppError> {
        let best = self
            .candidates(pickup, class, radius_km, excluded)
            .await?
            .into_iter()
            .next();

        match &best {
            Some(candidate) => debug!(
                driver_id = %candidate.driver_id,
                vehicle_id = %candidate.vehicle_id,
                distance_km = candidate.distance_km,
                score = candidate.score,
                "match found"
            ),
            None => debug!(lat = pickup.lat, lng = pickup.lng, ?class, "no eligible driver"),
        }

        Ok(best)
    }
}
