//! Additive opportunity scoring.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CityProfile, NormalizedListing};

pub const MAX_SCORE: u32 = 100;
pub const PRIORITY_ZONE_POINTS: u32 = 20;

/// Per-component points behind a score. Every component is non-negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoreBreakdown {
    pub price_tier: u32,
    pub priority_zone: u32,
    pub rooms: u32,
    pub parking: u32,
    pub area: u32,
    pub price_sweet_spot: u32,
    pub city_potential: u32,
}

impl ScoreBreakdown {
    pub fn compute(listing: &NormalizedListing, profile: &CityProfile) -> Self {
        Self {
            price_tier: price_tier_points(listing.price_per_area, profile),
            priority_zone: priority_zone_points(&listing.neighborhood, profile),
            rooms: match listing.rooms {
                0 => 0,
                1 => 5,
                2 => 10,
                _ => 15,
            },
            parking: match listing.parking_spaces {
                0 => 0,
                1 => 5,
                _ => 10,
            },
            area: profile
                .area_bands
                .bands()
                .iter()
                .find(|(threshold, _)| listing.area >= *threshold)
                .map(|(_, points)| *points)
                .unwrap_or(0),
            price_sweet_spot: sweet_spot_points(listing.price, profile),
            city_potential: profile.potential_tier_bonus,
        }
    }

    /// Sum of all components, truncated at [`MAX_SCORE`].
    pub fn total(&self) -> u32 {
        [
            self.price_tier,
            self.priority_zone,
            self.rooms,
            self.parking,
            self.area,
            self.price_sweet_spot,
            self.city_potential,
        ]
        .into_iter()
        .fold(0u32, u32::saturating_add)
        .min(MAX_SCORE)
    }
}

/// Score a listing against its city profile. Pure and deterministic.
pub fn score_listing(listing: &NormalizedListing, profile: &CityProfile) -> u32 {
    ScoreBreakdown::compute(listing, profile).total()
}

fn price_tier_points(price_per_area: f64, profile: &CityProfile) -> u32 {
    if price_per_area <= 0.0 || profile.max_price_per_area <= 0.0 {
        return 0;
    }
    profile
        .scoring_variant
        .price_tiers()
        .iter()
        .find(|tier| price_per_area <= tier.ceiling_fraction * profile.max_price_per_area)
        .map(|tier| tier.points)
        .unwrap_or(0)
}

fn priority_zone_points(neighborhood: &str, profile: &CityProfile) -> u32 {
    let neighborhood = neighborhood.to_lowercase();
    let hit = profile
        .priority_zones
        .iter()
        .any(|zone| !zone.trim().is_empty() && neighborhood.contains(&zone.to_lowercase()));
    if hit {
        PRIORITY_ZONE_POINTS
    } else {
        0
    }
}

fn sweet_spot_points(price: f64, profile: &CityProfile) -> u32 {
    let Some(spot) = profile.price_sweet_spot else {
        return 0;
    };
    if price >= spot.min && price <= spot.max {
        spot.bonus
    } else if price > 0.0 && price <= spot.extended_max {
        spot.extended_bonus
    } else {
        0
    }
}

/// Score band used in the potential category label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PotentialBand {
    Basic,
    Medium,
    High,
    Exceptional,
}

impl PotentialBand {
    pub fn from_score(score: u32) -> Self {
        match score {
            s if s >= 80 => PotentialBand::Exceptional,
            s if s >= 70 => PotentialBand::High,
            s if s >= 60 => PotentialBand::Medium,
            _ => PotentialBand::Basic,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PotentialBand::Basic => "basic",
            PotentialBand::Medium => "medium",
            PotentialBand::High => "high",
            PotentialBand::Exceptional => "exceptional",
        }
    }
}

impl fmt::Display for PotentialBand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `<city tier label> - <band>`; the bare band when the profile has no label.
pub fn potential_category(profile: &CityProfile, score: u32) -> String {
    let band = PotentialBand::from_score(score);
    let label = profile.potential_label.trim();
    if label.is_empty() {
        band.to_string()
    } else {
        format!("{label} - {band}")
    }
}
