//! Read-side summaries over persisted opportunities and scan runs.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{CityRegistry, Opportunity, ScanRun};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CitySummary {
    pub city: String,
    pub state: String,
    pub priority: u32,
    pub opportunities: usize,
    pub mean_score: f64,
    pub mean_price: f64,
    pub min_price: f64,
    pub max_price: f64,
    /// Price-per-area statistics only cover listings with a known area.
    pub mean_price_per_area: f64,
    pub min_price_per_area: f64,
    pub max_price_per_area: f64,
    pub by_source: BTreeMap<String, usize>,
    pub scan_runs: usize,
    pub failed_scan_runs: usize,
    pub last_scan_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GlobalSummary {
    pub total_opportunities: usize,
    pub cities: usize,
    pub sources: usize,
    pub mean_score: f64,
    pub scan_runs: usize,
    pub failed_scan_runs: usize,
    pub total_candidates: usize,
    pub by_source: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub cities: Vec<CitySummary>,
    pub global: GlobalSummary,
}

impl Summary {
    pub fn city(&self, city: &str) -> Option<&CitySummary> {
        self.cities.iter().find(|c| c.city.eq_ignore_ascii_case(city))
    }
}

/// Build per-city and global statistics. Cities appear in report priority order; cities
/// with scan runs but no opportunities are still listed.
pub fn summarize(
    opportunities: &[Opportunity],
    scan_runs: &[ScanRun],
    registry: &CityRegistry,
) -> Summary {
    let mut per_city: BTreeMap<String, CitySummary> = BTreeMap::new();

    let mut by_city: BTreeMap<&str, Vec<&Opportunity>> = BTreeMap::new();
    for opp in opportunities {
        by_city.entry(opp.city.as_str()).or_default().push(opp);
    }
    for (city, opps) in &by_city {
        let entry = per_city
            .entry(city.to_string())
            .or_insert_with(|| empty_city(city, registry));
        entry.state = opps[0].state.clone();
        fill_opportunity_stats(entry, opps);
    }

    for run in scan_runs {
        let entry = per_city
            .entry(run.city.clone())
            .or_insert_with(|| empty_city(&run.city, registry));
        entry.scan_runs += 1;
        if !run.status.is_success() {
            entry.failed_scan_runs += 1;
        }
        if entry.last_scan_at.map_or(true, |last| run.timestamp > last) {
            entry.last_scan_at = Some(run.timestamp);
        }
    }

    let mut cities = per_city.into_values().collect::<Vec<_>>();
    cities.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.city.cmp(&b.city)));

    let mut by_source: BTreeMap<String, usize> = BTreeMap::new();
    for opp in opportunities {
        *by_source.entry(opp.source.clone()).or_default() += 1;
    }
    for run in scan_runs {
        by_source.entry(run.source.clone()).or_default();
    }

    let global = GlobalSummary {
        total_opportunities: opportunities.len(),
        cities: cities.iter().filter(|c| c.opportunities > 0).count(),
        sources: by_source.values().filter(|count| **count > 0).count(),
        mean_score: mean(opportunities.iter().map(|o| f64::from(o.score))),
        scan_runs: scan_runs.len(),
        failed_scan_runs: scan_runs.iter().filter(|r| !r.status.is_success()).count(),
        total_candidates: scan_runs.iter().map(|r| r.total_candidates).sum(),
        by_source,
    };

    Summary { cities, global }
}

/// Sort opportunities by city priority, then score descending, then newest first.
pub fn order_for_report(opportunities: &mut [Opportunity], registry: &CityRegistry) {
    opportunities.sort_by(|a, b| {
        registry
            .priority_of(&a.city)
            .cmp(&registry.priority_of(&b.city))
            .then_with(|| a.city.cmp(&b.city))
            .then_with(|| b.score.cmp(&a.score))
            .then_with(|| b.discovered_at.cmp(&a.discovered_at))
    });
}

fn empty_city(city: &str, registry: &CityRegistry) -> CitySummary {
    let profile = registry.by_name(city);
    CitySummary {
        city: city.to_string(),
        state: profile.map(|p| p.state.clone()).unwrap_or_default(),
        priority: registry.priority_of(city),
        ..CitySummary::default()
    }
}

fn fill_opportunity_stats(summary: &mut CitySummary, opps: &[&Opportunity]) {
    summary.opportunities = opps.len();
    summary.mean_score = mean(opps.iter().map(|o| f64::from(o.score)));

    let prices = opps.iter().map(|o| o.listing.price).collect::<Vec<_>>();
    summary.mean_price = mean(prices.iter().copied());
    summary.min_price = min_of(&prices);
    summary.max_price = max_of(&prices);

    let ppa = opps
        .iter()
        .map(|o| o.listing.price_per_area)
        .filter(|v| *v > 0.0)
        .collect::<Vec<_>>();
    summary.mean_price_per_area = mean(ppa.iter().copied());
    summary.min_price_per_area = min_of(&ppa);
    summary.max_price_per_area = max_of(&ppa);

    for opp in opps {
        *summary.by_source.entry(opp.source.clone()).or_default() += 1;
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, count) = values.fold((0.0, 0usize), |(s, c), v| (s + v, c + 1));
    if count == 0 {
        0.0
    } else {
        ((sum / count as f64) * 100.0).round() / 100.0
    }
}

fn min_of(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .min_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .unwrap_or(0.0)
}

fn max_of(values: &[f64]) -> f64 {
    values
        .iter()
        .copied()
        .max_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal))
        .unwrap_or(0.0)
}
