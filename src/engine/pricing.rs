use std::collections::HashMap;

use crate::error::AppError;
use crate::models::vehicle::VehicleClass;

pub const BASE_PRICE: f64 = 5.0;
pub const MAX_DEMAND_FACTOR: f64 = 100.0;

/// Per-kilometre rate table plus flat base fare.
#[derive(Debug, Clone)]
pub struct PricingEngine {
    base_price: f64,
    per_km_rates: HashMap<VehicleClass, f64>,
}

impl Default for PricingEngine {
    fn default() -> Self {
        Self {
            base_price: BASE_PRICE,
            per_km_rates: HashMap::from([
                (VehicleClass::Sedan, 1.5),
                (VehicleClass::Suv, 2.0),
                (VehicleClass::Van, 2.5),
                (VehicleClass::Truck, 3.0),
            ]),
        }
    }
}

impl PricingEngine {
    pub fn with_rates(base_price: f64, per_km_rates: HashMap<VehicleClass, f64>) -> Self {
        Self {
            base_price,
            per_km_rates,
        }
    }

    /// Classes missing from the table are charged at the sedan rate.
    pub fn per_km_rate(&self, class: VehicleClass) -> f64 {
        self.per_km_rates
            .get(&class)
            .or_else(|| self.per_km_rates.get(&VehicleClass::Sedan))
            .copied()
            .unwrap_or(1.5)
    }

    /// `demand_factor` is clamped to [0, 100]; the result is rounded to cents.
    pub fn quote(
        &self,
        distance_km: f64,
        class: VehicleClass,
        demand_factor: f64,
    ) -> Result<f64, AppError> {
        if !distance_km.is_finite() || distance_km < 0.0 {
            return Err(AppError::Validation(format!(
                "distance must be a non-negative number, got {distance_km}"
            )));
        }

        let demand = if demand_factor.is_finite() {
            demand_factor.clamp(0.0, MAX_DEMAND_FACTOR)
        } else {
            0.0
        };

        let raw = (self.base_price + distance_km * self.per_km_rate(class)) * (1.0 + demand / 100.0);
        Ok(round_to_cents(raw))
    }
}

/// Demand derived from unmatched pending bookings versus idle drivers.
pub fn derived_demand_factor(pending: usize, available_drivers: usize) -> f64 {
    if pending <= available_drivers {
        return 0.0;
    }

    let excess = (pending - available_drivers) as f64;
    let supply = available_drivers.max(1) as f64;
    (excess / supply * 100.0).clamp(0.0, MAX_DEMAND_FACTOR)
}

fn round_to_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::{PricingEngine, derived_demand_factor};
    use crate::error::AppError;
    use crate::models::vehicle::VehicleClass;

    #[test]
    fn sedan_without_demand() {
        let engine = PricingEngine::default();
        assert_eq!(engine.quote(10.0, VehicleClass::Sedan, 0.0).unwrap(), 20.0);
    }

    #[test]
    fn demand_scales_the_whole_fare() {
        let engine = PricingEngine::default();
        assert_eq!(engine.quote(10.0, VehicleClass::Sedan, 50.0).unwrap(), 30.0);
        assert_eq!(engine.quote(10.0, VehicleClass::Suv, 50.0).unwrap(), 37.5);
        assert_eq!(engine.quote(10.0, VehicleClass::Truck, 100.0).unwrap(), 70.0);
    }

    #[test]
    fn quote_is_rounded_to_cents() {
        let engine = PricingEngine::default();
        let price = engine.quote(3.333, VehicleClass::Van, 7.0).unwrap();
        assert_eq!(price, 14.27);
    }

    #[test]
    fn demand_outside_range_is_clamped() {
        let engine = PricingEngine::default();
        let capped = engine.quote(10.0, VehicleClass::Sedan, 250.0).unwrap();
        let floored = engine.quote(10.0, VehicleClass::Sedan, -20.0).unwrap();
        assert_eq!(capped, 40.0);
        assert_eq!(floored, 20.0);
    }

    #[test]
    fn negative_distance_is_rejected() {
        let engine = PricingEngine::default();
        let result = engine.quote(-1.0, VehicleClass::Sedan, 0.0);
        assert!(matches!(result, Err(AppError::Validation(_))));
    }

    #[test]
    fn missing_rate_falls_back_to_sedan() {
        let engine = PricingEngine::with_rates(5.0, HashMap::from([(VehicleClass::Sedan, 1.5)]));
        assert_eq!(engine.quote(10.0, VehicleClass::Truck, 0.0).unwrap(), 20.0);
    }

    #[test]
    fn quote_is_deterministic() {
        let engine = PricingEngine::default();
        let first = engine.quote(42.7, VehicleClass::Suv, 12.5).unwrap();
        for _ in 0..10 {
            assert_eq!(engine.quote(42.7, VehicleClass::Suv, 12.5).unwrap(), first);
        }
    }

    #[test]
    fn derived_demand_tracks_excess_requests() {
        assert_eq!(derived_demand_factor(0, 3), 0.0);
        assert_eq!(derived_demand_factor(3, 3), 0.0);
        assert_eq!(derived_demand_factor(3, 2), 50.0);
        assert_eq!(derived_demand_factor(5, 0), 100.0);
        assert_eq!(derived_demand_factor(40, 4), 100.0);
    }
}
