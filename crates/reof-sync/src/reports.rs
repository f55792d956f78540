//! Per-run report artifacts: markdown brief, JSON delta, Parquet snapshots and their manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Float64Array, RecordBatch, StringArray, UInt32Array, UInt64Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use chrono::{DateTime, Utc};
use parquet::arrow::ArrowWriter;
use reof_core::{order_for_report, summarize, CityRegistry, Opportunity, ScanRun};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

pub const DAILY_BRIEF: &str = "daily_brief.md";
pub const DELTA_JSON: &str = "opportunities_delta.json";
const TOP_PER_CITY: usize = 5;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub store_backend: String,
    pub refresh_policy: String,
    pub scans: usize,
    pub failed_scans: usize,
}

/// Contents of `opportunities_delta.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunDelta {
    pub run: RunRecord,
    pub scan_runs: Vec<ScanRun>,
    pub new_opportunities: Vec<Opportunity>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub run_id: Uuid,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

/// Write every artifact for one run into `reports_dir` and return the manifest path.
///
/// `stored` is the full store content after the run; the brief and the opportunities
/// snapshot describe it, while the delta only carries what this run changed.
pub async fn write_run_reports(
    reports_dir: &Path,
    delta: &RunDelta,
    stored: &[Opportunity],
    history: &[ScanRun],
    registry: &CityRegistry,
) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let brief = render_daily_brief(delta, stored, history, registry);
    fs::write(reports_dir.join(DAILY_BRIEF), brief)
        .await
        .context("writing daily_brief.md")?;

    let delta_json = serde_json::to_vec_pretty(delta).context("serializing opportunities delta")?;
    fs::write(reports_dir.join(DELTA_JSON), delta_json)
        .await
        .context("writing opportunities_delta.json")?;

    export_parquet_snapshots(reports_dir, delta.run.run_id, stored, &delta.scan_runs).await
}

pub fn render_daily_brief(
    delta: &RunDelta,
    stored: &[Opportunity],
    history: &[ScanRun],
    registry: &CityRegistry,
) -> String {
    let summary = summarize(stored, history, registry);
    let mut ordered = stored.to_vec();
    order_for_report(&mut ordered, registry);

    let mut lines = vec![
        "# REOF Daily Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", delta.run.run_id),
        format!("- Started: {}", delta.run.started_at),
        format!("- Finished: {}", delta.run.finished_at),
        format!(
            "- Scans: {} ({} failed)",
            delta.run.scans, delta.run.failed_scans
        ),
        format!("- New opportunities: {}", delta.new_opportunities.len()),
        format!(
            "- Stored opportunities: {} (mean score {:.2})",
            summary.global.total_opportunities, summary.global.mean_score
        ),
        String::new(),
        "## Cities".to_string(),
        String::new(),
        "| City | Opportunities | Mean score | Price/m² (min / mean / max) |".to_string(),
        "|---|---|---|---|".to_string(),
    ];
    for city in &summary.cities {
        lines.push(format!(
            "| {} ({}) | {} | {:.2} | {:.2} / {:.2} / {:.2} |",
            city.city,
            city.state,
            city.opportunities,
            city.mean_score,
            city.min_price_per_area,
            city.mean_price_per_area,
            city.max_price_per_area
        ));
    }

    lines.push(String::new());
    lines.push("## Top Opportunities".to_string());
    for city in summary.cities.iter().filter(|c| c.opportunities > 0) {
        lines.push(String::new());
        lines.push(format!("### {}", city.city));
        for opp in ordered
            .iter()
            .filter(|o| o.city == city.city)
            .take(TOP_PER_CITY)
        {
            lines.push(format!(
                "- **{}** [{}] {} - R$ {:.2}, {:.0} m², {} ({})",
                opp.score,
                opp.potential_category,
                opp.listing.title,
                opp.listing.price,
                opp.listing.area,
                opp.listing.neighborhood,
                opp.source
            ));
        }
    }

    let failed = delta
        .scan_runs
        .iter()
        .filter(|r| !r.status.is_success())
        .collect::<Vec<_>>();
    if !failed.is_empty() {
        lines.push(String::new());
        lines.push("## Failed Scans".to_string());
        for run in failed {
            lines.push(format!("- {} / {}: {}", run.source, run.city, run.status));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

async fn export_parquet_snapshots(
    reports_dir: &Path,
    run_id: Uuid,
    stored: &[Opportunity],
    scan_runs: &[ScanRun],
) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let opportunities_path = snapshot_dir.join("opportunities.parquet");
    let scan_runs_path = snapshot_dir.join("scan_runs.parquet");
    write_opportunities_parquet(&opportunities_path, stored)?;
    write_scan_runs_parquet(&scan_runs_path, scan_runs)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        run_id,
        files: vec![
            manifest_entry("opportunities", reports_dir, &opportunities_path, stored.len())?,
            manifest_entry("scan_runs", reports_dir, &scan_runs_path, scan_runs.len())?,
        ],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn strings<'a>(values: impl Iterator<Item = &'a str>) -> StringArray {
    StringArray::from(values.map(Some).collect::<Vec<_>>())
}

fn write_opportunities_parquet(path: &Path, stored: &[Opportunity]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("natural_key", DataType::Utf8, false),
        ArrowField::new("city", DataType::Utf8, false),
        ArrowField::new("state", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("price", DataType::Float64, false),
        ArrowField::new("area", DataType::Float64, false),
        ArrowField::new("price_per_area", DataType::Float64, false),
        ArrowField::new("rooms", DataType::UInt32, false),
        ArrowField::new("bathrooms", DataType::UInt32, false),
        ArrowField::new("parking_spaces", DataType::UInt32, false),
        ArrowField::new("neighborhood", DataType::Utf8, false),
        ArrowField::new("source_url", DataType::Utf8, false),
        ArrowField::new("reference", DataType::Utf8, true),
        ArrowField::new("score", DataType::UInt32, false),
        ArrowField::new("potential_category", DataType::Utf8, false),
        ArrowField::new("discovered_at", DataType::Utf8, false),
    ]));

    let ids = stored.iter().map(|o| o.id.to_string()).collect::<Vec<_>>();
    let keys = stored
        .iter()
        .map(|o| o.natural_key().to_string())
        .collect::<Vec<_>>();
    let discovered = stored
        .iter()
        .map(|o| o.discovered_at.to_rfc3339())
        .collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(ids.iter().map(String::as_str))),
            Arc::new(strings(keys.iter().map(String::as_str))),
            Arc::new(strings(stored.iter().map(|o| o.city.as_str()))),
            Arc::new(strings(stored.iter().map(|o| o.state.as_str()))),
            Arc::new(strings(stored.iter().map(|o| o.source.as_str()))),
            Arc::new(strings(stored.iter().map(|o| o.listing.title.as_str()))),
            Arc::new(Float64Array::from(
                stored.iter().map(|o| o.listing.price).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                stored.iter().map(|o| o.listing.area).collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                stored
                    .iter()
                    .map(|o| o.listing.price_per_area)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                stored.iter().map(|o| o.listing.rooms).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                stored.iter().map(|o| o.listing.bathrooms).collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                stored
                    .iter()
                    .map(|o| o.listing.parking_spaces)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(strings(stored.iter().map(|o| o.listing.neighborhood.as_str()))),
            Arc::new(strings(stored.iter().map(|o| o.listing.source_url.as_str()))),
            Arc::new(StringArray::from(
                stored
                    .iter()
                    .map(|o| o.listing.reference.as_deref())
                    .collect::<Vec<_>>(),
            )),
            Arc::new(UInt32Array::from(
                stored.iter().map(|o| o.score).collect::<Vec<_>>(),
            )),
            Arc::new(strings(stored.iter().map(|o| o.potential_category.as_str()))),
            Arc::new(strings(discovered.iter().map(String::as_str))),
        ],
    )
    .context("building opportunities record batch")?;
    write_parquet(path, batch)
}

fn write_scan_runs_parquet(path: &Path, runs: &[ScanRun]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("run_id", DataType::Utf8, false),
        ArrowField::new("source", DataType::Utf8, false),
        ArrowField::new("city", DataType::Utf8, false),
        ArrowField::new("total_candidates", DataType::UInt64, false),
        ArrowField::new("opportunities_found", DataType::UInt64, false),
        ArrowField::new("duration_seconds", DataType::Float64, false),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("scanned_at", DataType::Utf8, false),
    ]));

    let ids = runs.iter().map(|r| r.id.to_string()).collect::<Vec<_>>();
    let run_ids = runs.iter().map(|r| r.run_id.to_string()).collect::<Vec<_>>();
    let statuses = runs.iter().map(|r| r.status.to_string()).collect::<Vec<_>>();
    let scanned = runs
        .iter()
        .map(|r| r.timestamp.to_rfc3339())
        .collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(strings(ids.iter().map(String::as_str))),
            Arc::new(strings(run_ids.iter().map(String::as_str))),
            Arc::new(strings(runs.iter().map(|r| r.source.as_str()))),
            Arc::new(strings(runs.iter().map(|r| r.city.as_str()))),
            Arc::new(UInt64Array::from(
                runs.iter()
                    .map(|r| r.total_candidates as u64)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(UInt64Array::from(
                runs.iter()
                    .map(|r| r.opportunities_found as u64)
                    .collect::<Vec<_>>(),
            )),
            Arc::new(Float64Array::from(
                runs.iter().map(|r| r.duration_seconds).collect::<Vec<_>>(),
            )),
            Arc::new(strings(statuses.iter().map(String::as_str))),
            Arc::new(strings(scanned.iter().map(String::as_str))),
        ],
    )
    .context("building scan_runs record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(
    name: &str,
    reports_dir: &Path,
    path: &Path,
    rows: usize,
) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    let sha256 = hex::encode(hasher.finalize());
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256,
        bytes: bytes.len() as u64,
        rows,
    })
}

/// Markdown digest of the latest `runs` run directories under `reports_root`, newest first.
pub fn report_runs(reports_root: &Path, runs: usize) -> Result<String> {
    let entries = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?;

    let mut deltas = Vec::new();
    for entry in entries.filter_map(|entry| entry.ok()) {
        if !entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false) {
            continue;
        }
        let delta_path = entry.path().join(DELTA_JSON);
        if !delta_path.exists() {
            continue;
        }
        let delta: RunDelta = serde_json::from_str(
            &std::fs::read_to_string(&delta_path)
                .with_context(|| format!("reading {}", delta_path.display()))?,
        )
        .with_context(|| format!("parsing {}", delta_path.display()))?;
        deltas.push((entry.path(), delta));
    }
    deltas.sort_by(|a, b| b.1.run.started_at.cmp(&a.1.run.started_at));

    let mut lines = vec!["# REOF Run Report".to_string(), String::new()];
    if deltas.is_empty() {
        lines.push(format!("No runs found under `{}`.", reports_root.display()));
    }
    for (dir, delta) in deltas.into_iter().take(runs.max(1)) {
        let candidates = delta
            .scan_runs
            .iter()
            .map(|r| r.total_candidates)
            .sum::<usize>();
        let found = delta
            .scan_runs
            .iter()
            .map(|r| r.opportunities_found)
            .sum::<usize>();
        lines.push(format!("## Run `{}`", delta.run.run_id));
        lines.push(format!("- started: {}", delta.run.started_at));
        lines.push(format!(
            "- scans: {} ({} failed)",
            delta.run.scans, delta.run.failed_scans
        ));
        lines.push(format!("- candidates: {candidates}"));
        lines.push(format!("- opportunities found: {found}"));
        lines.push(format!("- newly stored: {}", delta.new_opportunities.len()));
        lines.push(format!(
            "- store: {} ({})",
            delta.run.store_backend, delta.run.refresh_policy
        ));
        let manifest_path = dir.join("snapshots").join("manifest.json");
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(format!("- daily brief: `{}`", dir.join(DAILY_BRIEF).display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}
