//! Per-source marker tables and their compiled form.

use regex::Regex;
use reof_core::NumberLocale;
use scraper::Selector;
use serde::{Deserialize, Serialize};

use crate::AdapterError;

fn default_card_selector() -> String {
    r#"div[class*="card"], article[class*="listing"], div[class*="result"], article[class*="property"]"#
        .to_string()
}

fn default_listing_link_pattern() -> String {
    "/imovel/".to_string()
}

fn default_reference_pattern() -> Option<String> {
    Some(r"(?i)\bref(?:er[êe]ncia)?\s*[:.#]?\s*(\d+)".to_string())
}

fn default_currency_marker() -> String {
    "R$".to_string()
}

fn default_min_plausible_price() -> f64 {
    50_000.0
}

fn default_max_plausible_price() -> f64 {
    3_000_000.0
}

fn default_min_context_chars() -> usize {
    100
}

fn default_max_ancestor_depth() -> usize {
    5
}

fn default_max_cards_per_page() -> usize {
    50
}

/// Source-specific structural hints for the field extractor, as written in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionMarkers {
    #[serde(default = "default_card_selector")]
    pub card_selector: String,
    #[serde(default)]
    pub title_selector: Option<String>,
    #[serde(default)]
    pub price_selector: Option<String>,
    #[serde(default)]
    pub area_selector: Option<String>,
    #[serde(default)]
    pub address_selector: Option<String>,
    #[serde(default)]
    pub rooms_selector: Option<String>,
    #[serde(default)]
    pub bathrooms_selector: Option<String>,
    #[serde(default)]
    pub parking_selector: Option<String>,
    /// Regex matched against `href` values of listing links.
    #[serde(default = "default_listing_link_pattern")]
    pub listing_link_pattern: String,
    /// Regex whose first capture group is the source-native listing reference.
    #[serde(default = "default_reference_pattern")]
    pub reference_pattern: Option<String>,
    #[serde(default = "default_currency_marker")]
    pub currency_marker: String,
    #[serde(default = "default_min_plausible_price")]
    pub min_plausible_price: f64,
    #[serde(default = "default_max_plausible_price")]
    pub max_plausible_price: f64,
    #[serde(default = "default_min_context_chars")]
    pub min_context_chars: usize,
    #[serde(default = "default_max_ancestor_depth")]
    pub max_ancestor_depth: usize,
    #[serde(default = "default_max_cards_per_page")]
    pub max_cards_per_page: usize,
    #[serde(default)]
    pub number_locale: NumberLocale,
}

impl Default for ExtractionMarkers {
    fn default() -> Self {
        Self {
            card_selector: default_card_selector(),
            title_selector: None,
            price_selector: None,
            area_selector: None,
            address_selector: None,
            rooms_selector: None,
            bathrooms_selector: None,
            parking_selector: None,
            listing_link_pattern: default_listing_link_pattern(),
            reference_pattern: default_reference_pattern(),
            currency_marker: default_currency_marker(),
            min_plausible_price: default_min_plausible_price(),
            max_plausible_price: default_max_plausible_price(),
            min_context_chars: default_min_context_chars(),
            max_ancestor_depth: default_max_ancestor_depth(),
            max_cards_per_page: default_max_cards_per_page(),
            number_locale: NumberLocale::default(),
        }
    }
}

/// Role-specific sub-selectors applied inside a structured card.
#[derive(Debug, Clone, Default)]
pub struct FieldSelectors {
    pub title: Option<Selector>,
    pub price: Option<Selector>,
    pub area: Option<Selector>,
    pub address: Option<Selector>,
    pub rooms: Option<Selector>,
    pub bathrooms: Option<Selector>,
    pub parking: Option<Selector>,
}

/// Marker table with every selector and pattern parsed once.
#[derive(Debug, Clone)]
pub struct CompiledMarkers {
    pub card: Selector,
    pub fields: FieldSelectors,
    pub anchor: Selector,
    pub listing_link: Regex,
    pub reference: Option<Regex>,
    /// Currency marker followed by a digit/separator run.
    pub price_text: Regex,
    pub currency_marker: String,
    pub min_plausible_price: f64,
    pub max_plausible_price: f64,
    pub min_context_chars: usize,
    pub max_ancestor_depth: usize,
    pub max_cards_per_page: usize,
    pub locale: NumberLocale,
}

impl ExtractionMarkers {
    pub fn compile(&self) -> Result<CompiledMarkers, AdapterError> {
        if self.currency_marker.trim().is_empty() {
            return Err(AdapterError::Message("currency_marker must not be empty".to_string()));
        }
        if self.min_plausible_price > self.max_plausible_price {
            return Err(AdapterError::Message(format!(
                "plausible price window is inverted ({} > {})",
                self.min_plausible_price, self.max_plausible_price
            )));
        }

        let price_text = format!(r"{}\s*\d[\d.,]*", regex::escape(self.currency_marker.trim()));
        Ok(CompiledMarkers {
            card: parse_selector("card_selector", &self.card_selector)?,
            fields: FieldSelectors {
                title: parse_optional_selector("title_selector", &self.title_selector)?,
                price: parse_optional_selector("price_selector", &self.price_selector)?,
                area: parse_optional_selector("area_selector", &self.area_selector)?,
                address: parse_optional_selector("address_selector", &self.address_selector)?,
                rooms: parse_optional_selector("rooms_selector", &self.rooms_selector)?,
                bathrooms: parse_optional_selector("bathrooms_selector", &self.bathrooms_selector)?,
                parking: parse_optional_selector("parking_selector", &self.parking_selector)?,
            },
            anchor: parse_selector("anchor", "a[href]")?,
            listing_link: parse_pattern("listing_link_pattern", &self.listing_link_pattern)?,
            reference: self
                .reference_pattern
                .as_deref()
                .filter(|p| !p.trim().is_empty())
                .map(|p| parse_pattern("reference_pattern", p))
                .transpose()?,
            price_text: parse_pattern("currency_marker", &price_text)?,
            currency_marker: self.currency_marker.trim().to_string(),
            min_plausible_price: self.min_plausible_price,
            max_plausible_price: self.max_plausible_price,
            min_context_chars: self.min_context_chars,
            max_ancestor_depth: self.max_ancestor_depth.max(1),
            max_cards_per_page: self.max_cards_per_page.max(1),
            locale: self.number_locale,
        })
    }
}

impl CompiledMarkers {
    pub fn is_plausible_price(&self, price: f64) -> bool {
        price >= self.min_plausible_price && price <= self.max_plausible_price
    }
}

fn parse_selector(field: &'static str, selector: &str) -> Result<Selector, AdapterError> {
    Selector::parse(selector).map_err(|e| AdapterError::Selector {
        field,
        selector: selector.to_string(),
        message: e.to_string(),
    })
}

fn parse_optional_selector(
    field: &'static str,
    selector: &Option<String>,
) -> Result<Option<Selector>, AdapterError> {
    selector
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| parse_selector(field, s))
        .transpose()
}

fn parse_pattern(field: &'static str, pattern: &str) -> Result<Regex, AdapterError> {
    Regex::new(pattern).map_err(|source| AdapterError::Pattern {
        field,
        pattern: pattern.to_string(),
        source,
    })
}
