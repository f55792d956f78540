//! Scan orchestration: configuration loading, per-(source, city) scans, the deduplicating
//! persister, run reports and the cron scheduler.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use reof_adapters::{
    build_adapters, AdapterContext, AdapterDescriptor, AdapterError, MarkerTableAdapter,
    SourceAdapter, SourceMode, SourcesFile,
};
use reof_core::{
    normalize, score_listing, validate, CityProfile, CityRegistry, Opportunity, RawFieldBundle,
    RejectionReason, ScanRun, ScanStatus,
};
use reof_storage::{
    FetchError, FixtureFetcher, HttpClientConfig, HttpFetcher, MemoryStore, OpportunityStore,
    PageFetcher, PgStore, RefreshPolicy, RoutingFetcher, UpsertOutcome,
};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod reports;

pub use reports::{report_runs, RunDelta, RunRecord};

pub const CRATE_NAME: &str = "reof-sync";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_parallel_scans: usize,
    pub refresh_policy: RefreshPolicy,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
    pub web_port: u16,
    /// Read every source from `fixtures/` regardless of its configured mode.
    pub force_fixtures: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            workspace_root: PathBuf::from("."),
            user_agent: "reof-bot/0.1".to_string(),
            http_timeout_secs: 30,
            max_parallel_scans: 4,
            refresh_policy: RefreshPolicy::default(),
            scheduler_enabled: false,
            sync_cron_1: "0 0 6 * * *".to_string(),
            sync_cron_2: "0 0 18 * * *".to_string(),
            web_port: 8000,
            force_fixtures: false,
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let refresh_policy = match std::env::var("REOF_REFRESH_POLICY") {
            Ok(raw) => raw
                .parse::<RefreshPolicy>()
                .context("parsing REOF_REFRESH_POLICY")?,
            Err(_) => defaults.refresh_policy,
        };
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .ok()
                .filter(|v| !v.trim().is_empty()),
            workspace_root: std::env::var("REOF_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            user_agent: std::env::var("REOF_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("REOF_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            max_parallel_scans: env_parse("REOF_MAX_PARALLEL_SCANS", defaults.max_parallel_scans)
                .max(1),
            refresh_policy,
            scheduler_enabled: env_flag("REOF_SCHEDULER_ENABLED"),
            sync_cron_1: std::env::var("SYNC_CRON_1").unwrap_or(defaults.sync_cron_1),
            sync_cron_2: std::env::var("SYNC_CRON_2").unwrap_or(defaults.sync_cron_2),
            web_port: env_parse("REOF_WEB_PORT", defaults.web_port),
            force_fixtures: env_flag("REOF_FORCE_FIXTURES"),
        })
    }

    pub fn cities_path(&self) -> PathBuf {
        self.workspace_root.join("cities.yaml")
    }

    pub fn sources_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn fixtures_dir(&self) -> PathBuf {
        self.workspace_root.join("fixtures")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

#[derive(Debug, Deserialize)]
struct CitiesFile {
    cities: BTreeMap<String, CityProfile>,
}

/// Parse `cities.yaml`; map keys become profile slugs.
pub fn parse_city_registry(text: &str) -> Result<CityRegistry> {
    let file: CitiesFile = serde_yaml::from_str(text).context("parsing cities.yaml")?;
    let profiles = file
        .cities
        .into_iter()
        .map(|(slug, mut profile)| {
            profile.slug = slug;
            profile
        })
        .collect();
    Ok(CityRegistry::new(profiles))
}

pub fn load_city_registry(path: &Path) -> Result<CityRegistry> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    parse_city_registry(&text).with_context(|| format!("loading {}", path.display()))
}

pub fn load_sources(path: &Path) -> Result<Vec<AdapterDescriptor>> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    let file: SourcesFile =
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
    Ok(file.sources)
}

/// Pick the persisted store: PostgreSQL when `DATABASE_URL` is set, memory otherwise.
pub async fn open_store(config: &SyncConfig) -> Result<Arc<dyn OpportunityStore>> {
    match &config.database_url {
        Some(url) => {
            let store = PgStore::connect(url)
                .await
                .context("connecting to DATABASE_URL")?;
            store.migrate().await.context("applying migrations")?;
            Ok(Arc::new(store))
        }
        None => {
            warn!("DATABASE_URL not set; opportunities are kept in memory for this process");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// What happened to one raw bundle on its way to becoming an opportunity.
#[derive(Debug, Clone, PartialEq)]
pub enum BundleVerdict {
    Qualified(Opportunity),
    Rejected(Vec<RejectionReason>),
    BelowMinimum { score: u32, minimum: u32 },
}

/// Normalize, score and validate one bundle against its city profile.
pub fn evaluate_bundle(
    bundle: &RawFieldBundle,
    profile: &CityProfile,
    source_id: &str,
    discovered_at: DateTime<Utc>,
) -> BundleVerdict {
    let listing = normalize(bundle, profile);
    let score = score_listing(&listing, profile);
    let outcome = validate(&listing, profile);
    if !outcome.is_accepted() {
        return BundleVerdict::Rejected(outcome.reasons);
    }
    if score < profile.minimum_score {
        return BundleVerdict::BelowMinimum {
            score,
            minimum: profile.minimum_score,
        };
    }
    BundleVerdict::Qualified(Opportunity::new(
        listing,
        score,
        source_id,
        profile,
        discovered_at,
    ))
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistReport {
    pub inserted: Vec<Opportunity>,
    pub refreshed: usize,
    pub skipped: usize,
    pub failed: usize,
    pub run_recorded: bool,
}

/// Upserts qualifying opportunities by natural key and appends the scan run.
pub struct DedupPersister<'a> {
    store: &'a dyn OpportunityStore,
    policy: RefreshPolicy,
}

impl<'a> DedupPersister<'a> {
    pub fn new(store: &'a dyn OpportunityStore, policy: RefreshPolicy) -> Self {
        Self { store, policy }
    }

    /// Per-record store failures are logged and counted; the scan run is always appended.
    pub async fn persist(&self, candidates: &[Opportunity], run: &ScanRun) -> PersistReport {
        let mut report = PersistReport::default();
        for opportunity in candidates {
            match self.store.upsert(opportunity, self.policy).await {
                Ok(UpsertOutcome::Inserted) => report.inserted.push(opportunity.clone()),
                Ok(UpsertOutcome::Refreshed) => report.refreshed += 1,
                Ok(UpsertOutcome::Skipped) => report.skipped += 1,
                Err(err) => {
                    warn!(
                        error = %err,
                        key = %opportunity.natural_key(),
                        source = %opportunity.source,
                        city = %opportunity.city,
                        "failed to persist opportunity"
                    );
                    report.failed += 1;
                }
            }
        }
        match self.store.append_scan_run(run).await {
            Ok(()) => report.run_recorded = true,
            Err(err) => warn!(error = %err, source = %run.source, city = %run.city, "failed to record scan run"),
        }
        report
    }
}

/// Outcome of one (source, city) scan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanReport {
    pub run: ScanRun,
    pub persisted: PersistReport,
}

struct Collected {
    total_candidates: usize,
    qualified: Vec<Opportunity>,
}

/// Fetch every result page, extract, evaluate, then persist.
///
/// A page after the first answering 404 ends pagination. Any other fetch failure marks the
/// run as failed and nothing from the partial scan is persisted.
pub async fn scan_source_city(
    adapter: &dyn SourceAdapter,
    profile: &CityProfile,
    fetcher: &dyn PageFetcher,
    store: &dyn OpportunityStore,
    run_id: Uuid,
    policy: RefreshPolicy,
) -> ScanReport {
    let started = Instant::now();
    let ctx = AdapterContext {
        run_id,
        fetched_at: Utc::now(),
    };

    let (status, collected) = match collect(adapter, profile, fetcher, &ctx).await {
        Ok(collected) => (ScanStatus::Success, collected),
        Err(err) => {
            warn!(error = %err, source_id = adapter.source_id(), city = %profile.city, "scan failed");
            (
                ScanStatus::Error(err.to_string()),
                Collected {
                    total_candidates: 0,
                    qualified: Vec::new(),
                },
            )
        }
    };

    let run = ScanRun {
        id: Uuid::new_v4(),
        run_id,
        source: adapter.source_id().to_string(),
        city: profile.city.clone(),
        total_candidates: collected.total_candidates,
        opportunities_found: collected.qualified.len(),
        duration_seconds: started.elapsed().as_secs_f64(),
        status,
        timestamp: Utc::now(),
    };
    let persisted = DedupPersister::new(store, policy)
        .persist(&collected.qualified, &run)
        .await;
    info!(
        source_id = %run.source,
        city = %run.city,
        candidates = run.total_candidates,
        found = run.opportunities_found,
        inserted = persisted.inserted.len(),
        skipped = persisted.skipped,
        status = %run.status,
        "scan finished"
    );
    ScanReport { run, persisted }
}

async fn collect(
    adapter: &dyn SourceAdapter,
    profile: &CityProfile,
    fetcher: &dyn PageFetcher,
    ctx: &AdapterContext,
) -> Result<Collected, AdapterError> {
    let descriptor = adapter.descriptor();
    let delay = match descriptor.mode {
        SourceMode::Live => Duration::from_millis(descriptor.politeness_delay_ms),
        SourceMode::Fixture => Duration::ZERO,
    };

    let mut collected = Collected {
        total_candidates: 0,
        qualified: Vec::new(),
    };
    for (index, url) in adapter.listing_urls(profile)?.iter().enumerate() {
        if index > 0 && !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let page = match adapter.fetch_listing(fetcher, ctx, url).await {
            Ok(page) => page,
            Err(AdapterError::Fetch(FetchError::HttpStatus { status: 404, .. })) if index > 0 => {
                debug!(url = %url, "no further result pages");
                break;
            }
            Err(err) => return Err(err),
        };

        let outcome = adapter.parse_listing(&page, profile);
        if outcome.bundles.is_empty() {
            if index > 0 {
                break;
            }
            continue;
        }
        collected.total_candidates += outcome.bundles.len();
        for bundle in &outcome.bundles {
            match evaluate_bundle(bundle, profile, adapter.source_id(), ctx.fetched_at) {
                BundleVerdict::Qualified(opportunity) => collected.qualified.push(opportunity),
                BundleVerdict::Rejected(reasons) => debug!(
                    title = %bundle.title,
                    reasons = ?reasons.iter().map(ToString::to_string).collect::<Vec<_>>(),
                    "listing rejected"
                ),
                BundleVerdict::BelowMinimum { score, minimum } => {
                    debug!(title = %bundle.title, score, minimum, "listing below minimum score")
                }
            }
        }
    }
    Ok(collected)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub scans: usize,
    pub failed_scans: usize,
    pub total_candidates: usize,
    pub opportunities_found: usize,
    pub inserted: usize,
    pub refreshed: usize,
    pub skipped: usize,
    pub persist_failures: usize,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

pub struct SyncPipeline {
    config: SyncConfig,
    registry: Arc<CityRegistry>,
    adapters: Vec<Arc<MarkerTableAdapter>>,
    fetcher: Arc<dyn PageFetcher>,
    fixtures: FixtureFetcher,
    store: Arc<dyn OpportunityStore>,
}

impl SyncPipeline {
    /// Descriptors whose marker tables fail to compile are logged and left out.
    pub fn new(
        config: SyncConfig,
        registry: CityRegistry,
        mut descriptors: Vec<AdapterDescriptor>,
        fetcher: Arc<dyn PageFetcher>,
        store: Arc<dyn OpportunityStore>,
    ) -> Self {
        if config.force_fixtures {
            for descriptor in &mut descriptors {
                descriptor.mode = SourceMode::Fixture;
            }
        }
        let (adapters, failures) = build_adapters(&descriptors);
        for (source_id, err) in failures {
            error!(source_id = %source_id, error = %err, "source disabled: invalid marker table");
        }
        for descriptor in descriptors.iter().filter(|d| d.enabled) {
            for city in &descriptor.cities {
                if registry.by_name(city).is_none() {
                    warn!(source_id = %descriptor.source_id, city = %city, "source lists unknown city; skipped");
                }
            }
        }
        let fixtures = FixtureFetcher::new(config.fixtures_dir());
        Self {
            registry: Arc::new(registry),
            adapters: adapters.into_iter().map(Arc::new).collect(),
            fetcher,
            fixtures,
            store,
            config,
        }
    }

    /// Load `cities.yaml`/`sources.yaml`, open the store and build the fetcher.
    pub async fn from_config(config: SyncConfig) -> Result<Self> {
        let registry = load_city_registry(&config.cities_path())?;
        let descriptors = load_sources(&config.sources_path())?;
        let store = open_store(&config).await?;
        Self::with_store(config, registry, descriptors, store)
    }

    pub fn with_store(
        config: SyncConfig,
        registry: CityRegistry,
        descriptors: Vec<AdapterDescriptor>,
        store: Arc<dyn OpportunityStore>,
    ) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?;
        let fetcher = RoutingFetcher::new(Arc::new(http), FixtureFetcher::new(config.fixtures_dir()));
        Ok(Self::new(
            config,
            registry,
            descriptors,
            Arc::new(fetcher),
            store,
        ))
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<CityRegistry> {
        self.registry.clone()
    }

    pub fn store(&self) -> Arc<dyn OpportunityStore> {
        self.store.clone()
    }

    /// Every (source, city) pair to scan, in city priority order.
    ///
    /// Fixture-mode pairs without a first-page fixture are left out.
    pub fn plan(&self) -> Vec<(Arc<MarkerTableAdapter>, CityProfile)> {
        let mut plan = Vec::new();
        for profile in self.registry.profiles() {
            for adapter in &self.adapters {
                if !adapter.covers(profile) {
                    continue;
                }
                if adapter.descriptor().mode == SourceMode::Fixture {
                    let first = adapter
                        .listing_urls(profile)
                        .ok()
                        .and_then(|urls| urls.into_iter().next());
                    let present = first
                        .map(|url| self.fixtures.resolve(adapter.source_id(), &url).exists())
                        .unwrap_or(false);
                    if !present {
                        debug!(source_id = adapter.source_id(), city = %profile.city, "no fixture; pair skipped");
                        continue;
                    }
                }
                plan.push((adapter.clone(), profile.clone()));
            }
        }
        plan
    }

    /// Scan every planned pair with at most `max_parallel_scans` in flight.
    pub async fn scan_all(&self, run_id: Uuid) -> Vec<ScanReport> {
        let limit = Arc::new(Semaphore::new(self.config.max_parallel_scans.max(1)));
        let mut tasks = JoinSet::new();
        for (adapter, profile) in self.plan() {
            let limit = limit.clone();
            let fetcher = self.fetcher.clone();
            let store = self.store.clone();
            let policy = self.config.refresh_policy;
            let span = info_span!("scan", source_id = adapter.source_id(), city = %profile.city, %run_id);
            tasks.spawn(
                async move {
                    let _permit = limit.acquire_owned().await.ok();
                    scan_source_city(
                        adapter.as_ref(),
                        &profile,
                        fetcher.as_ref(),
                        store.as_ref(),
                        run_id,
                        policy,
                    )
                    .await
                }
                .instrument(span),
            );
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => reports.push(report),
                Err(err) => error!(error = %err, "scan task aborted"),
            }
        }
        reports.sort_by(|a, b| {
            self.registry
                .priority_of(&a.run.city)
                .cmp(&self.registry.priority_of(&b.run.city))
                .then_with(|| a.run.source.cmp(&b.run.source))
        });
        reports
    }

    /// One full sync: scan everything, then write `reports/<run_id>/`.
    pub async fn run_once(&self) -> Result<SyncRunSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, store = self.store.backend(), policy = %self.config.refresh_policy, "sync run started");

        let reports = self.scan_all(run_id).await;
        let finished_at = Utc::now();

        let scan_runs = reports.iter().map(|r| r.run.clone()).collect::<Vec<_>>();
        let new_opportunities = reports
            .iter()
            .flat_map(|r| r.persisted.inserted.iter().cloned())
            .collect::<Vec<_>>();
        let failed_scans = scan_runs.iter().filter(|r| !r.status.is_success()).count();
        let delta = RunDelta {
            run: RunRecord {
                run_id,
                started_at,
                finished_at,
                store_backend: self.store.backend().to_string(),
                refresh_policy: self.config.refresh_policy.to_string(),
                scans: scan_runs.len(),
                failed_scans,
            },
            scan_runs,
            new_opportunities,
        };

        let stored = self
            .store
            .list_all()
            .await
            .context("listing stored opportunities for reports")?;
        let history = self
            .store
            .list_scan_runs(None)
            .await
            .context("listing scan runs for reports")?;
        let reports_dir = self.config.reports_dir().join(run_id.to_string());
        let manifest_path =
            reports::write_run_reports(&reports_dir, &delta, &stored, &history, &self.registry)
                .await?;

        let summary = SyncRunSummary {
            run_id,
            started_at,
            finished_at,
            scans: reports.len(),
            failed_scans,
            total_candidates: reports.iter().map(|r| r.run.total_candidates).sum(),
            opportunities_found: reports.iter().map(|r| r.run.opportunities_found).sum(),
            inserted: delta.new_opportunities.len(),
            refreshed: reports.iter().map(|r| r.persisted.refreshed).sum(),
            skipped: reports.iter().map(|r| r.persisted.skipped).sum(),
            persist_failures: reports.iter().map(|r| r.persisted.failed).sum(),
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: manifest_path.display().to_string(),
        };
        info!(
            %run_id,
            scans = summary.scans,
            failed = summary.failed_scans,
            inserted = summary.inserted,
            "sync run finished"
        );
        Ok(summary)
    }

    /// Two cron jobs running [`SyncPipeline::run_once`]; `None` when scheduling is disabled.
    pub async fn build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = self.clone();
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = pipeline.clone();
                Box::pin(async move {
                    match pipeline.run_once().await {
                        Ok(summary) => info!(run_id = %summary.run_id, inserted = summary.inserted, "scheduled sync finished"),
                        Err(err) => error!(error = %err, "scheduled sync failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

pub async fn run_sync_once_from_env(force_fixtures: bool) -> Result<SyncRunSummary> {
    let mut config = SyncConfig::from_env()?;
    config.force_fixtures |= force_fixtures;
    let pipeline = SyncPipeline::from_config(config).await?;
    pipeline.run_once().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use reof_adapters::ExtractionMarkers;
    use reof_storage::{FetchedResponse, StoreError};
    use tempfile::tempdir;

    fn workspace_root() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..")
    }

    fn workspace_config(reports_root: &Path) -> (SyncConfig, CityRegistry, Vec<AdapterDescriptor>) {
        let root = workspace_root();
        let registry = load_city_registry(&root.join("cities.yaml")).expect("cities.yaml");
        let descriptors = load_sources(&root.join("sources.yaml")).expect("sources.yaml");
        let config = SyncConfig {
            workspace_root: reports_root.to_path_buf(),
            force_fixtures: true,
            ..SyncConfig::default()
        };
        (config, registry, descriptors)
    }

    fn fixture_pipeline(reports_root: &Path, store: Arc<dyn OpportunityStore>) -> SyncPipeline {
        let (config, registry, descriptors) = workspace_config(reports_root);
        let fetcher = Arc::new(FixtureFetcher::new(workspace_root().join("fixtures")));
        let mut pipeline = SyncPipeline::new(config, registry, descriptors, fetcher, store);
        pipeline.fixtures = FixtureFetcher::new(workspace_root().join("fixtures"));
        pipeline
    }

    #[test]
    fn city_registry_takes_slugs_from_keys_and_sorts_by_priority() {
        let registry = parse_city_registry(
            r#"
cities:
  sinop:
    name: Sinop
    state: MT
    priority: 3
    minimum_score: 45
    max_price_per_area: 1500
  lucas-do-rio-verde:
    name: Lucas do Rio Verde
    state: MT
    priority: 1
    minimum_score: 40
    max_price_per_area: 800
    scoring_variant: conservative
    area_bands: emerging
"#,
        )
        .expect("registry");
        let slugs = registry
            .profiles()
            .iter()
            .map(|p| p.slug.as_str())
            .collect::<Vec<_>>();
        assert_eq!(slugs, vec!["lucas-do-rio-verde", "sinop"]);
        assert_eq!(registry.priority_of("Sinop"), 3);
    }

    #[test]
    fn shipped_city_file_covers_six_cities() {
        let registry = load_city_registry(&workspace_root().join("cities.yaml")).expect("cities.yaml");
        assert_eq!(registry.len(), 6);
        assert_eq!(registry.profiles()[0].city, "Lucas do Rio Verde");
        assert_eq!(registry.profiles()[5].city, "Senador Canedo");
    }

    #[test]
    fn bundles_are_filtered_by_validation_then_minimum_score() {
        let mut profile = CityProfile::new("Senador Canedo", "GO");
        profile.priority_zones = vec!["Jardim Europa".to_string()];
        let at = Utc::now();

        let good = RawFieldBundle {
            title: "Casa 3 quartos no Jardim Europa".to_string(),
            price: "R$ 280.000".to_string(),
            area: "150 m²".to_string(),
            rooms: "3 quartos".to_string(),
            parking: "2 vagas".to_string(),
            ..RawFieldBundle::default()
        };
        // ppa 1866.67 -> 20, zone 20, rooms 15, parking 10, area 10
        match evaluate_bundle(&good, &profile, "62imoveis", at) {
            BundleVerdict::Qualified(opp) => {
                assert_eq!(opp.score, 75);
                assert_eq!(opp.source, "62imoveis");
                assert_eq!(opp.discovered_at, at);
            }
            other => panic!("expected qualified, got {other:?}"),
        }

        let free = RawFieldBundle {
            price: "Consulte".to_string(),
            ..good.clone()
        };
        assert!(matches!(
            evaluate_bundle(&free, &profile, "62imoveis", at),
            BundleVerdict::Rejected(reasons) if reasons.contains(&RejectionReason::NonPositivePrice)
        ));

        let bare = RawFieldBundle {
            title: "Casa no Setor Oeste".to_string(),
            price: "R$ 300.000".to_string(),
            ..RawFieldBundle::default()
        };
        assert_eq!(
            evaluate_bundle(&bare, &profile, "62imoveis", at),
            BundleVerdict::BelowMinimum { score: 0, minimum: 50 }
        );
    }

    #[tokio::test]
    async fn fixture_scans_persist_and_rescans_do_not_duplicate() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let pipeline = fixture_pipeline(dir.path(), store.clone());

        let planned = pipeline
            .plan()
            .iter()
            .map(|(a, p)| format!("{}:{}", a.source_id(), p.slug))
            .collect::<Vec<_>>();
        assert_eq!(
            planned,
            vec![
                "vivareal:lucas-do-rio-verde",
                "imovelweb:sinop",
                "62imoveis:senador-canedo"
            ]
        );

        let first = pipeline.scan_all(Uuid::new_v4()).await;
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|r| r.run.status.is_success()));
        let counts = first
            .iter()
            .map(|r| (r.run.source.as_str(), r.run.total_candidates, r.run.opportunities_found))
            .collect::<Vec<_>>();
        assert_eq!(
            counts,
            vec![("vivareal", 2, 2), ("imovelweb", 3, 1), ("62imoveis", 4, 2)]
        );
        assert_eq!(store.opportunity_count().await, 5);

        let second = pipeline.scan_all(Uuid::new_v4()).await;
        assert!(second.iter().all(|r| r.persisted.inserted.is_empty()));
        assert_eq!(second.iter().map(|r| r.persisted.skipped).sum::<usize>(), 5);
        assert_eq!(store.opportunity_count().await, 5);
        assert_eq!(store.scan_run_count().await, 6);
    }

    #[tokio::test]
    async fn fixture_scores_match_city_profiles() {
        let dir = tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let pipeline = fixture_pipeline(dir.path(), store.clone());
        pipeline.scan_all(Uuid::new_v4()).await;

        let canedo = store.list_by_city("Senador Canedo").await.expect("list");
        let scores = canedo.iter().map(|o| o.score).collect::<Vec<_>>();
        assert_eq!(scores, vec![85, 80]);
        assert_eq!(canedo[0].potential_category, "consolidated - exceptional");
        assert_eq!(canedo[0].listing.reference.as_deref(), Some("154"));

        let lucas = store.list_by_city("Lucas do Rio Verde").await.expect("list");
        assert_eq!(lucas.iter().map(|o| o.score).collect::<Vec<_>>(), vec![90, 85]);
        assert_eq!(lucas[0].listing.neighborhood, "Cidade Nova");
    }

    #[tokio::test]
    async fn run_once_writes_reports_and_manifest() {
        let dir = tempdir().expect("tempdir");
        let pipeline = fixture_pipeline(dir.path(), Arc::new(MemoryStore::new()));
        let summary = pipeline.run_once().await.expect("run");

        assert_eq!(summary.scans, 3);
        assert_eq!(summary.failed_scans, 0);
        assert_eq!(summary.total_candidates, 9);
        assert_eq!(summary.inserted, 5);

        let run_dir = PathBuf::from(&summary.reports_dir);
        let brief = std::fs::read_to_string(run_dir.join("daily_brief.md")).expect("brief");
        assert!(brief.contains("# REOF Daily Brief"));
        let lucas = brief.find("### Lucas do Rio Verde").expect("lucas section");
        let canedo = brief.find("### Senador Canedo").expect("canedo section");
        assert!(lucas < canedo);

        let manifest: reports::ParquetManifest = serde_json::from_str(
            &std::fs::read_to_string(&summary.parquet_manifest).expect("manifest"),
        )
        .expect("manifest json");
        assert_eq!(manifest.files.len(), 2);
        assert_eq!(manifest.files[0].rows, 5);
        assert_eq!(manifest.files[1].rows, 3);
        assert!(manifest.files.iter().all(|f| f.sha256.len() == 64 && f.bytes > 0));

        let digest = report_runs(&dir.path().join("reports"), 5).expect("report");
        assert!(digest.contains(&summary.run_id.to_string()));
        assert!(digest.contains("- candidates: 9"));
    }

    struct DownFetcher;

    #[async_trait]
    impl PageFetcher for DownFetcher {
        async fn fetch(
            &self,
            _run_id: Uuid,
            _source_id: &str,
            url: &str,
        ) -> Result<FetchedResponse, FetchError> {
            Err(FetchError::HttpStatus {
                status: 503,
                url: url.to_string(),
            })
        }
    }

    fn live_adapter() -> MarkerTableAdapter {
        MarkerTableAdapter::new(AdapterDescriptor {
            source_id: "62imoveis".to_string(),
            display_name: "62 Imóveis".to_string(),
            enabled: true,
            mode: SourceMode::Live,
            listing_url_template: "https://www.62imoveis.com.br/venda/{state}/{city}/{city}/imoveis"
                .to_string(),
            pages: 1,
            page_param: None,
            covers_states: vec!["GO".to_string()],
            cities: Vec::new(),
            politeness_delay_ms: 0,
            markers: ExtractionMarkers::default(),
        })
        .expect("adapter")
    }

    #[tokio::test]
    async fn transport_failure_records_error_run_and_persists_nothing() {
        let store = MemoryStore::new();
        let report = scan_source_city(
            &live_adapter(),
            &CityProfile::new("Senador Canedo", "GO"),
            &DownFetcher,
            &store,
            Uuid::new_v4(),
            RefreshPolicy::SkipIfPresent,
        )
        .await;

        assert!(matches!(&report.run.status, ScanStatus::Error(detail) if detail.contains("503")));
        assert_eq!(report.run.total_candidates, 0);
        assert!(report.persisted.run_recorded);
        assert_eq!(store.opportunity_count().await, 0);
        assert_eq!(store.scan_run_count().await, 1);
    }

    struct BrokenStore;

    #[async_trait]
    impl OpportunityStore for BrokenStore {
        fn backend(&self) -> &'static str {
            "broken"
        }

        async fn upsert(
            &self,
            opportunity: &Opportunity,
            _policy: RefreshPolicy,
        ) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::InvalidRow {
                key: opportunity.natural_key().to_string(),
                detail: "disk full".to_string(),
            })
        }

        async fn list_all(&self) -> Result<Vec<Opportunity>, StoreError> {
            Ok(Vec::new())
        }

        async fn list_by_city(&self, _city: &str) -> Result<Vec<Opportunity>, StoreError> {
            Ok(Vec::new())
        }

        async fn append_scan_run(&self, _run: &ScanRun) -> Result<(), StoreError> {
            Ok(())
        }

        async fn list_scan_runs(&self, _limit: Option<usize>) -> Result<Vec<ScanRun>, StoreError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn persistence_errors_are_skipped_per_record() {
        let profile = CityProfile::new("Senador Canedo", "GO");
        let listing = normalize(
            &RawFieldBundle {
                title: "Casa 3 quartos no Jardim Europa".to_string(),
                price: "R$ 280.000".to_string(),
                area: "150 m²".to_string(),
                ..RawFieldBundle::default()
            },
            &profile,
        );
        let candidates = vec![
            Opportunity::new(listing.clone(), 70, "62imoveis", &profile, Utc::now()),
            Opportunity::new(listing, 70, "vivareal", &profile, Utc::now()),
        ];
        let run = ScanRun {
            id: Uuid::new_v4(),
            run_id: Uuid::new_v4(),
            source: "62imoveis".to_string(),
            city: profile.city.clone(),
            total_candidates: 2,
            opportunities_found: 2,
            duration_seconds: 0.1,
            status: ScanStatus::Success,
            timestamp: Utc::now(),
        };

        let report = DedupPersister::new(&BrokenStore, RefreshPolicy::SkipIfPresent)
            .persist(&candidates, &run)
            .await;
        assert_eq!(report.failed, 2);
        assert!(report.inserted.is_empty());
        assert!(report.run_recorded);
    }
}
