use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

const DISTANCE_WEIGHT: f64 = 50.0;
const RATING_WEIGHT: f64 = 10.0;
const MAX_RATING: f64 = 5.0;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoreBreakdown {
    pub distance_score: f64,
    pub rating_score: f64,
}

impl ScoreBreakdown {
    pub fn total(&self) -> f64 {
        self.distance_score + self.rating_score
    }
}

/// A driver that passed eligibility filtering, with the vehicle they would use.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub driver_id: Uuid,
    pub vehicle_id: Uuid,
    pub distance_km: f64,
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

pub fn compute_score(distance_km: f64, rating: Option<f64>) -> ScoreBreakdown {
    ScoreBreakdown {
        distance_score: distance_score(distance_km),
        rating_score: rating_score(rating.unwrap_or(0.0)),
    }
}

/// Higher score first, then shorter distance, then lower driver id.
pub fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.distance_km.total_cmp(&b.distance_km))
        .then_with(|| a.driver_id.cmp(&b.driver_id))
}

fn distance_score(distance_km: f64) -> f64 {
    DISTANCE_WEIGHT / (1.0 + distance_km.max(0.0))
}

fn rating_score(rating: f64) -> f64 {
    if !rating.is_finite() {
        return 0.0;
    }
    rating.clamp(0.0, MAX_RATING) * RATING_WEIGHT
}

#[cfg(test)]
mod tests {
    use std::cmp::Ordering;

    use uuid::Uuid;

    use super::{Candidate, compute_score, rank};

    fn candidate(seed: u128, distance_km: f64, rating: Option<f64>) -> Candidate {
        let breakdown = compute_score(distance_km, rating);
        Candidate {
            driver_id: Uuid::from_u128(seed),
            vehicle_id: Uuid::from_u128(seed + 1000),
            distance_km,
            score: breakdown.total(),
            breakdown,
        }
    }

    #[test]
    fn components_are_bounded() {
        let best = compute_score(0.0, Some(5.0));
        assert_eq!(best.distance_score, 50.0);
        assert_eq!(best.rating_score, 50.0);

        let out_of_range = compute_score(-3.0, Some(9.0));
        assert_eq!(out_of_range.distance_score, 50.0);
        assert_eq!(out_of_range.rating_score, 50.0);
    }

    #[test]
    fn missing_rating_counts_as_zero() {
        let breakdown = compute_score(1.0, None);
        assert_eq!(breakdown.rating_score, 0.0);
        assert_eq!(breakdown.total(), 25.0);
    }

    #[test]
    fn closer_driver_wins_when_ratings_match() {
        let near = candidate(1, 0.5, Some(4.5));
        let far = candidate(2, 8.0, Some(4.5));
        assert_eq!(rank(&near, &far), Ordering::Less);
    }

    #[test]
    fn rating_can_outweigh_distance() {
        let near_low = candidate(1, 0.0, Some(1.0));
        let far_high = candidate(2, 4.0, Some(5.0));
        assert!(far_high.score > near_low.score);
        assert_eq!(rank(&far_high, &near_low), Ordering::Less);
    }

    #[test]
    fn equal_scores_fall_back_to_driver_id() {
        let a = candidate(1, 2.0, Some(3.0));
        let b = candidate(2, 2.0, Some(3.0));
        assert_eq!(rank(&a, &b), Ordering::Less);
        assert_eq!(rank(&b, &a), Ordering::Greater);
    }
}
