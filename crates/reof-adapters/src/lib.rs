//! Source adapter contracts + marker-table driven listing extraction.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reof_core::{slugify, CityProfile};
use reof_storage::{FetchError, FixtureFetcher, PageFetcher};
use scraper::Html;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use url::Url;
use uuid::Uuid;

pub mod extract;
pub mod markers;

pub use extract::{extract_page, ExtractionOutcome, StrategyKind};
pub use markers::{CompiledMarkers, ExtractionMarkers};

pub const CRATE_NAME: &str = "reof-adapters";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    #[default]
    Live,
    Fixture,
}

fn default_true() -> bool {
    true
}

fn default_pages() -> u32 {
    1
}

fn default_politeness_delay_ms() -> u64 {
    3_000
}

/// One portal as configured in `sources.yaml`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterDescriptor {
    pub source_id: String,
    pub display_name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub mode: SourceMode,
    /// Supports `{state}` (lowercase UF) and `{city}` (city slug).
    pub listing_url_template: String,
    #[serde(default = "default_pages")]
    pub pages: u32,
    /// Query parameter carrying the page number for pages after the first.
    #[serde(default)]
    pub page_param: Option<String>,
    #[serde(default)]
    pub covers_states: Vec<String>,
    /// Optional allow-list of city slugs; empty means every city in a covered state.
    #[serde(default)]
    pub cities: Vec<String>,
    #[serde(default = "default_politeness_delay_ms")]
    pub politeness_delay_ms: u64,
    #[serde(default)]
    pub markers: ExtractionMarkers,
}

/// Top-level shape of `sources.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcesFile {
    pub sources: Vec<AdapterDescriptor>,
}

impl AdapterDescriptor {
    pub fn covers(&self, profile: &CityProfile) -> bool {
        let state_ok = self.covers_states.is_empty()
            || self
                .covers_states
                .iter()
                .any(|s| s.trim().eq_ignore_ascii_case(profile.state.trim()));
        let city_ok = self.cities.is_empty()
            || self
                .cities
                .iter()
                .any(|c| slugify(c) == profile.slug || c.eq_ignore_ascii_case(&profile.city));
        state_ok && city_ok
    }

    /// Live portal URL for one result page (1-based).
    pub fn live_url(&self, profile: &CityProfile, page: u32) -> Result<Url, AdapterError> {
        let raw = self
            .listing_url_template
            .replace("{state}", &profile.state.trim().to_ascii_lowercase())
            .replace("{city}", &city_slug(profile));
        let mut url = Url::parse(&raw).map_err(|source| AdapterError::Url {
            url: raw.clone(),
            source,
        })?;
        if page > 1 {
            let param = self.page_param.as_deref().unwrap_or("pagina");
            url.query_pairs_mut().append_pair(param, &page.to_string());
        }
        Ok(url)
    }

    /// URLs to fetch for one city, in page order.
    pub fn page_urls(&self, profile: &CityProfile) -> Result<Vec<String>, AdapterError> {
        (1..=self.pages.max(1))
            .map(|page| match self.mode {
                SourceMode::Live => self.live_url(profile, page).map(String::from),
                SourceMode::Fixture => Ok(fixture_url(&self.source_id, profile, page)),
            })
            .collect()
    }
}

fn city_slug(profile: &CityProfile) -> String {
    if profile.slug.is_empty() {
        slugify(&profile.city)
    } else {
        profile.slug.clone()
    }
}

fn fixture_url(source_id: &str, profile: &CityProfile, page: u32) -> String {
    let slug = city_slug(profile);
    let file = if page <= 1 {
        format!("{slug}.html")
    } else {
        format!("{slug}-p{page}.html")
    };
    FixtureFetcher::fixture_url(source_id, &file)
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("invalid selector `{selector}` for {field}: {message}")]
    Selector {
        field: &'static str,
        selector: String,
        message: String,
    },
    #[error("invalid pattern `{pattern}` for {field}: {source}")]
    Pattern {
        field: &'static str,
        pattern: String,
        #[source]
        source: regex::Error,
    },
    #[error("invalid listing url `{url}`: {source}")]
    Url {
        url: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("{0}")]
    Message(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn descriptor(&self) -> &AdapterDescriptor;

    fn covers(&self, profile: &CityProfile) -> bool {
        self.descriptor().covers(profile)
    }

    fn listing_urls(&self, profile: &CityProfile) -> Result<Vec<String>, AdapterError>;

    async fn fetch_listing(
        &self,
        fetcher: &dyn PageFetcher,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<FetchedPage, AdapterError>;

    /// Never fails: malformed markup only means fewer bundles.
    fn parse_listing(&self, page: &FetchedPage, profile: &CityProfile) -> ExtractionOutcome;
}

/// Adapter driven entirely by a descriptor's marker table.
#[derive(Debug, Clone)]
pub struct MarkerTableAdapter {
    descriptor: AdapterDescriptor,
    markers: CompiledMarkers,
}

impl MarkerTableAdapter {
    pub fn new(descriptor: AdapterDescriptor) -> Result<Self, AdapterError> {
        let markers = descriptor.markers.compile()?;
        Ok(Self {
            descriptor,
            markers,
        })
    }

    pub fn markers(&self) -> &CompiledMarkers {
        &self.markers
    }

    /// Relative links resolve against the fetched page when it is a web URL, otherwise
    /// against the live listing URL the page stands in for.
    fn base_url(&self, page: &FetchedPage, profile: &CityProfile) -> Option<Url> {
        Url::parse(&page.url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .or_else(|| self.descriptor.live_url(profile, 1).ok())
    }
}

#[async_trait]
impl SourceAdapter for MarkerTableAdapter {
    fn source_id(&self) -> &str {
        &self.descriptor.source_id
    }

    fn descriptor(&self) -> &AdapterDescriptor {
        &self.descriptor
    }

    fn listing_urls(&self, profile: &CityProfile) -> Result<Vec<String>, AdapterError> {
        self.descriptor.page_urls(profile)
    }

    async fn fetch_listing(
        &self,
        fetcher: &dyn PageFetcher,
        ctx: &AdapterContext,
        url: &str,
    ) -> Result<FetchedPage, AdapterError> {
        let response = fetcher.fetch(ctx.run_id, self.source_id(), url).await?;
        debug!(
            source_id = self.source_id(),
            url,
            bytes = response.body.len(),
            "listing page fetched"
        );
        Ok(FetchedPage {
            url: response.final_url,
            body: response.body,
            fetched_at: ctx.fetched_at,
        })
    }

    fn parse_listing(&self, page: &FetchedPage, profile: &CityProfile) -> ExtractionOutcome {
        let html = String::from_utf8_lossy(&page.body);
        let document = Html::parse_document(&html);
        let base = self.base_url(page, profile);
        let outcome = extract_page(&document, base.as_ref(), profile, &self.markers);
        info!(
            source_id = self.source_id(),
            city = %profile.city,
            url = %page.url,
            strategy = outcome.strategy.map(StrategyKind::as_str).unwrap_or("none"),
            bundles = outcome.bundles.len(),
            "listing page parsed"
        );
        outcome
    }
}

/// Compile every enabled descriptor, keeping the ones that fail as errors for the caller.
pub fn build_adapters(
    descriptors: &[AdapterDescriptor],
) -> (Vec<MarkerTableAdapter>, Vec<(String, AdapterError)>) {
    let mut adapters = Vec::new();
    let mut failures = Vec::new();
    for descriptor in descriptors.iter().filter(|d| d.enabled) {
        match MarkerTableAdapter::new(descriptor.clone()) {
            Ok(adapter) => adapters.push(adapter),
            Err(err) => failures.push((descriptor.source_id.clone(), err)),
        }
    }
    (adapters, failures)
}
