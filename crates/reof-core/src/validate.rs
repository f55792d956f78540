//! Accept/reject gate applied after scoring.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{CityProfile, NormalizedListing};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum RejectionReason {
    NonPositivePrice,
    PriceAboveCeiling { price: f64, ceiling: f64 },
    EmptyTitle,
    TitleTooShort { len: usize, min: usize },
    PricePerAreaAboveMax { price_per_area: f64, max: f64 },
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RejectionReason::NonPositivePrice => f.write_str("price is not positive"),
            RejectionReason::PriceAboveCeiling { price, ceiling } => {
                write!(f, "price {price:.2} above ceiling {ceiling:.2}")
            }
            RejectionReason::EmptyTitle => f.write_str("title is empty"),
            RejectionReason::TitleTooShort { len, min } => {
                write!(f, "title has {len} chars, minimum is {min}")
            }
            RejectionReason::PricePerAreaAboveMax {
                price_per_area,
                max,
            } => write!(f, "price per area {price_per_area:.2} above max {max:.2}"),
        }
    }
}

/// Validation result. Reasons are diagnostics only; callers branch on [`is_accepted`].
///
/// [`is_accepted`]: ValidationOutcome::is_accepted
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub reasons: Vec<RejectionReason>,
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        self.reasons.is_empty()
    }
}

pub fn validate(listing: &NormalizedListing, profile: &CityProfile) -> ValidationOutcome {
    let mut reasons = Vec::new();

    if listing.price <= 0.0 || !listing.price.is_finite() {
        reasons.push(RejectionReason::NonPositivePrice);
    } else if listing.price > profile.max_price {
        reasons.push(RejectionReason::PriceAboveCeiling {
            price: listing.price,
            ceiling: profile.max_price,
        });
    }

    let title_len = listing.title.trim().chars().count();
    if title_len == 0 {
        reasons.push(RejectionReason::EmptyTitle);
    } else if title_len < profile.min_title_len {
        reasons.push(RejectionReason::TitleTooShort {
            len: title_len,
            min: profile.min_title_len,
        });
    }

    if listing.area > 0.0 && listing.price_per_area > profile.max_price_per_area {
        reasons.push(RejectionReason::PricePerAreaAboveMax {
            price_per_area: listing.price_per_area,
            max: profile.max_price_per_area,
        });
    }

    ValidationOutcome { reasons }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{listing, senador_canedo};

    #[test]
    fn accepts_reference_listing() {
        let outcome = validate(&listing(280_000.0, 150.0), &senador_canedo());
        assert!(outcome.is_accepted(), "{:?}", outcome.reasons);
    }

    #[test]
    fn zero_price_is_always_rejected() {
        let profile = senador_canedo();
        for area in [0.0, 1.0, 150.0, 10_000.0] {
            let outcome = validate(&listing(0.0, area), &profile);
            assert!(!outcome.is_accepted());
            assert!(outcome.reasons.contains(&RejectionReason::NonPositivePrice));
        }
        let mut negative = listing(-10.0, 100.0);
        negative.price_per_area = 0.0;
        assert!(!validate(&negative, &profile).is_accepted());
    }

    #[test]
    fn price_per_area_above_max_is_rejected() {
        let profile = senador_canedo();
        let outcome = validate(&listing(500_000.0, 100.0), &profile);
        assert_eq!(
            outcome.reasons,
            vec![RejectionReason::PricePerAreaAboveMax {
                price_per_area: 5000.0,
                max: 2400.0
            }]
        );
    }

    #[test]
    fn unknown_area_skips_price_per_area_check() {
        let outcome = validate(&listing(280_000.0, 0.0), &senador_canedo());
        assert!(outcome.is_accepted());
    }

    #[test]
    fn rejects_commercial_prices_and_short_titles() {
        let profile = senador_canedo();
        let outcome = validate(&listing(3_500_000.0, 5_000.0), &profile);
        assert!(matches!(
            outcome.reasons.as_slice(),
            [RejectionReason::PriceAboveCeiling { .. }]
        ));

        let mut short = listing(280_000.0, 150.0);
        short.title = "Casa".to_string();
        assert_eq!(
            validate(&short, &profile).reasons,
            vec![RejectionReason::TitleTooShort { len: 4, min: 10 }]
        );

        short.title = "   ".to_string();
        assert_eq!(validate(&short, &profile).reasons, vec![RejectionReason::EmptyTitle]);
    }
}
