//! Core domain model for REOF: listings, city profiles, opportunities and scan runs.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod aggregate;
pub mod normalize;
pub mod scoring;
pub mod validate;

pub use aggregate::{order_for_report, summarize, CitySummary, GlobalSummary, Summary};
pub use normalize::{normalize, parse_count, parse_decimal, resolve_neighborhood};
pub use scoring::{potential_category, score_listing, PotentialBand, ScoreBreakdown};
pub use validate::{validate, RejectionReason, ValidationOutcome};

pub const CRATE_NAME: &str = "reof-core";

/// Unstructured text captured from one listing unit on a page. Fields may be empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawFieldBundle {
    pub title: String,
    pub price: String,
    pub area: String,
    pub rooms: String,
    pub bathrooms: String,
    pub parking: String,
    pub address: String,
    pub link: String,
    pub reference: String,
}

/// Grouping/decimal separators used by a market's numeric text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumberLocale {
    pub grouping: char,
    pub decimal: char,
}

impl NumberLocale {
    pub const PT_BR: NumberLocale = NumberLocale {
        grouping: '.',
        decimal: ',',
    };
    pub const EN_US: NumberLocale = NumberLocale {
        grouping: ',',
        decimal: '.',
    };
}

impl Default for NumberLocale {
    fn default() -> Self {
        Self::PT_BR
    }
}

/// One price-per-area tier: listings at or below `ceiling_fraction * max_price_per_area`
/// earn `points`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriceTier {
    pub ceiling_fraction: f64,
    pub points: u32,
}

const STANDARD_TIERS: [PriceTier; 5] = [
    PriceTier { ceiling_fraction: 0.5, points: 35 },
    PriceTier { ceiling_fraction: 0.6, points: 30 },
    PriceTier { ceiling_fraction: 0.7, points: 25 },
    PriceTier { ceiling_fraction: 0.8, points: 20 },
    PriceTier { ceiling_fraction: 1.0, points: 10 },
];

const CONSERVATIVE_TIERS: [PriceTier; 5] = [
    PriceTier { ceiling_fraction: 0.5, points: 35 },
    PriceTier { ceiling_fraction: 0.6, points: 30 },
    PriceTier { ceiling_fraction: 0.7, points: 25 },
    PriceTier { ceiling_fraction: 0.8, points: 15 },
    PriceTier { ceiling_fraction: 1.0, points: 10 },
];

/// Fixed price-per-area tier table pinned by each city profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoringVariant {
    #[default]
    Standard,
    Conservative,
}

impl ScoringVariant {
    /// Tiers ordered from cheapest to most expensive.
    pub fn price_tiers(self) -> &'static [PriceTier] {
        match self {
            ScoringVariant::Standard => &STANDARD_TIERS,
            ScoringVariant::Conservative => &CONSERVATIVE_TIERS,
        }
    }
}

/// Area thresholds (largest first) and the points each one earns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AreaBandSet {
    #[default]
    Default,
    /// Emerging markets where typical units are larger.
    Emerging,
}

impl AreaBandSet {
    pub fn bands(self) -> &'static [(f64, u32)] {
        match self {
            AreaBandSet::Default => &[(200.0, 15), (100.0, 10), (50.0, 5)],
            AreaBandSet::Emerging => &[(300.0, 15), (200.0, 10), (150.0, 5)],
        }
    }
}

/// Absolute price band considered attractive for a city.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSweetSpot {
    pub min: f64,
    pub max: f64,
    pub bonus: u32,
    #[serde(default)]
    pub extended_max: f64,
    #[serde(default)]
    pub extended_bonus: u32,
}

fn default_max_price() -> f64 {
    3_000_000.0
}

fn default_min_title_len() -> usize {
    10
}

fn default_priority() -> u32 {
    u32::MAX
}

/// Static per-city configuration governing scoring and filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CityProfile {
    #[serde(default)]
    pub slug: String,
    #[serde(rename = "name")]
    pub city: String,
    pub state: String,
    pub minimum_score: u32,
    pub max_price_per_area: f64,
    #[serde(default)]
    pub priority_zones: Vec<String>,
    #[serde(default)]
    pub potential_label: String,
    #[serde(default)]
    pub potential_tier_bonus: u32,
    #[serde(default = "default_priority")]
    pub priority: u32,
    #[serde(default)]
    pub scoring_variant: ScoringVariant,
    #[serde(default)]
    pub area_bands: AreaBandSet,
    #[serde(default)]
    pub price_sweet_spot: Option<PriceSweetSpot>,
    #[serde(default = "default_max_price")]
    pub max_price: f64,
    #[serde(default = "default_min_title_len")]
    pub min_title_len: usize,
    #[serde(default)]
    pub number_locale: NumberLocale,
}

impl CityProfile {
    pub fn new(city: impl Into<String>, state: impl Into<String>) -> Self {
        let city = city.into();
        Self {
            slug: slugify(&city),
            city,
            state: state.into(),
            minimum_score: 50,
            max_price_per_area: 2400.0,
            priority_zones: Vec::new(),
            potential_label: String::new(),
            potential_tier_bonus: 0,
            priority: default_priority(),
            scoring_variant: ScoringVariant::default(),
            area_bands: AreaBandSet::default(),
            price_sweet_spot: None,
            max_price: default_max_price(),
            min_title_len: default_min_title_len(),
            number_locale: NumberLocale::default(),
        }
    }
}

/// Read-only set of city profiles loaded once per process.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CityRegistry {
    profiles: Vec<CityProfile>,
}

impl CityRegistry {
    pub fn new(mut profiles: Vec<CityProfile>) -> Self {
        profiles.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.city.cmp(&b.city)));
        Self { profiles }
    }

    pub fn profiles(&self) -> &[CityProfile] {
        &self.profiles
    }

    pub fn get(&self, slug: &str) -> Option<&CityProfile> {
        self.profiles.iter().find(|p| p.slug == slug)
    }

    pub fn by_name(&self, city: &str) -> Option<&CityProfile> {
        self.profiles
            .iter()
            .find(|p| p.city.eq_ignore_ascii_case(city) || p.slug == city)
    }

    /// Report ordering rank; unknown cities sort last.
    pub fn priority_of(&self, city: &str) -> u32 {
        self.by_name(city).map(|p| p.priority).unwrap_or(u32::MAX)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Typed projection of a [`RawFieldBundle`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub title: String,
    pub price: f64,
    pub area: f64,
    pub price_per_area: f64,
    pub rooms: u32,
    pub bathrooms: u32,
    pub parking_spaces: u32,
    pub neighborhood: String,
    pub address: String,
    pub source_url: String,
    pub reference: Option<String>,
}

/// Identity used to deduplicate persisted opportunities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NaturalKey {
    Reference {
        reference: String,
        source: String,
        city: String,
    },
    Listing {
        title: String,
        price_cents: i64,
        source: String,
        city: String,
    },
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NaturalKey::Reference {
                reference,
                source,
                city,
            } => write!(f, "ref|{source}|{city}|{reference}"),
            NaturalKey::Listing {
                title,
                price_cents,
                source,
                city,
            } => write!(f, "listing|{source}|{city}|{title}|{price_cents}"),
        }
    }
}

/// A listing that passed validation and met its city's minimum score.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Opportunity {
    pub id: Uuid,
    #[serde(flatten)]
    pub listing: NormalizedListing,
    pub score: u32,
    pub source: String,
    pub city: String,
    pub state: String,
    pub potential_category: String,
    pub discovered_at: DateTime<Utc>,
}

impl Opportunity {
    pub fn new(
        listing: NormalizedListing,
        score: u32,
        source: impl Into<String>,
        profile: &CityProfile,
        discovered_at: DateTime<Utc>,
    ) -> Self {
        let score = score.min(100);
        Self {
            id: Uuid::new_v4(),
            potential_category: potential_category(profile, score),
            listing,
            score,
            source: source.into(),
            city: profile.city.clone(),
            state: profile.state.clone(),
            discovered_at,
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        match self.listing.reference.as_deref().map(str::trim) {
            Some(reference) if !reference.is_empty() => NaturalKey::Reference {
                reference: reference.to_string(),
                source: self.source.clone(),
                city: self.city.clone(),
            },
            _ => NaturalKey::Listing {
                title: self.listing.title.clone(),
                price_cents: (self.listing.price * 100.0).round() as i64,
                source: self.source.clone(),
                city: self.city.clone(),
            },
        }
    }
}

/// Outcome recorded on a scan run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanStatus {
    Success,
    Error(String),
}

impl ScanStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ScanStatus::Success)
    }
}

impl fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanStatus::Success => f.write_str("success"),
            ScanStatus::Error(detail) => write!(f, "error:{detail}"),
        }
    }
}

impl From<ScanStatus> for String {
    fn from(value: ScanStatus) -> Self {
        value.to_string()
    }
}

impl From<String> for ScanStatus {
    fn from(value: String) -> Self {
        match value.strip_prefix("error:") {
            Some(detail) => ScanStatus::Error(detail.to_string()),
            None => ScanStatus::Success,
        }
    }
}

impl Serialize for ScanStatus {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ScanStatus {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        String::deserialize(deserializer).map(ScanStatus::from)
    }
}

/// Immutable audit record of one extraction pass over one source for one city.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanRun {
    pub id: Uuid,
    pub run_id: Uuid,
    pub source: String,
    pub city: String,
    pub total_candidates: usize,
    pub opportunities_found: usize,
    pub duration_seconds: f64,
    pub status: ScanStatus,
    pub timestamp: DateTime<Utc>,
}

/// Lowercase ASCII slug used for URLs and fixture paths ("Lucas do Rio Verde" -> "lucas-do-rio-verde").
pub fn slugify(input: &str) -> String {
    input
        .trim()
        .chars()
        .map(fold_accent)
        .map(|c| c.to_ascii_lowercase())
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect::<String>()
        .split('-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("-")
}

fn fold_accent(c: char) -> char {
    match c {
        'á' | 'à' | 'â' | 'ã' | 'ä' | 'Á' | 'À' | 'Â' | 'Ã' | 'Ä' => 'a',
        'é' | 'è' | 'ê' | 'ë' | 'É' | 'È' | 'Ê' | 'Ë' => 'e',
        'í' | 'ì' | 'î' | 'ï' | 'Í' | 'Ì' | 'Î' | 'Ï' => 'i',
        'ó' | 'ò' | 'ô' | 'õ' | 'ö' | 'Ó' | 'Ò' | 'Ô' | 'Õ' | 'Ö' => 'o',
        'ú' | 'ù' | 'û' | 'ü' | 'Ú' | 'Ù' | 'Û' | 'Ü' => 'u',
        'ç' | 'Ç' => 'c',
        other => other,
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn slugify_folds_accents_and_spaces() {
        assert_eq!(slugify("Lucas do Rio Verde"), "lucas-do-rio-verde");
        assert_eq!(slugify("  São Félix  "), "sao-felix");
    }

    #[test]
    fn natural_key_prefers_source_reference() {
        let profile = senador_canedo();
        let mut listing = listing(280_000.0, 150.0);
        let without_ref = Opportunity::new(listing.clone(), 80, "62imoveis", &profile, Utc::now());
        assert!(matches!(
            without_ref.natural_key(),
            NaturalKey::Listing { price_cents: 28_000_000, .. }
        ));

        listing.reference = Some("154".to_string());
        let with_ref = Opportunity::new(listing, 80, "62imoveis", &profile, Utc::now());
        assert_eq!(with_ref.natural_key().to_string(), "ref|62imoveis|Senador Canedo|154");
    }

    #[test]
    fn blank_reference_falls_back_to_listing_key() {
        let profile = senador_canedo();
        let mut listing = listing(280_000.0, 150.0);
        listing.reference = Some("   ".to_string());
        let opp = Opportunity::new(listing, 80, "62imoveis", &profile, Utc::now());
        assert!(matches!(opp.natural_key(), NaturalKey::Listing { .. }));
    }

    #[test]
    fn scan_status_round_trips_through_strings() {
        let status = ScanStatus::Error("http status 503 for https://x".to_string());
        let json = serde_json::to_string(&status).unwrap();
        assert_eq!(json, "\"error:http status 503 for https://x\"");
        let back: ScanStatus = serde_json::from_str(&json).unwrap();
        assert_eq!(back, status);
        assert_eq!(ScanStatus::Success.to_string(), "success");
    }

    #[test]
    fn registry_orders_by_priority_and_ranks_unknown_last() {
        let mut lucas = CityProfile::new("Lucas do Rio Verde", "MT");
        lucas.priority = 1;
        let registry = CityRegistry::new(vec![senador_canedo(), lucas]);
        assert_eq!(registry.profiles()[0].slug, "lucas-do-rio-verde");
        assert_eq!(registry.priority_of("Senador Canedo"), 6);
        assert_eq!(registry.priority_of("Goiânia"), u32::MAX);
        assert!(registry.get("senador-canedo").is_some());
    }
}
