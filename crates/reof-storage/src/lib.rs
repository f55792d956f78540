//! Fetch boundary and persisted opportunity store for REOF.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reof_core::{Opportunity, ScanRun};
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

mod pg;

pub use pg::PgStore;

pub const CRATE_NAME: &str = "reof-storage";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    /// Listing portals get one in-flight request per source unless configured otherwise.
    pub per_source_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
            per_source_concurrency: 1,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("reading fixture {path}: {source}")]
    Fixture {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("fetch limiter closed")]
    LimiterClosed,
}

/// Anything that can turn a listing URL into page bytes.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_source_limit: config.per_source_concurrency.max(1),
            per_source: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            let can_retry = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        debug!(status = status.as_u16(), bytes = body.len(), "fetched page");
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if can_retry && classify_status(status) == RetryDisposition::Retryable {
                        warn!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if can_retry && classify_reqwest_error(&err) == RetryDisposition::Retryable {
                        warn!(error = %err, attempt, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;
        let per_source = self.per_source_semaphore(source_id).await;
        let _source = per_source
            .acquire()
            .await
            .map_err(|_| FetchError::LimiterClosed)?;

        self.fetch_with_retries(url)
            .instrument(info_span!("http_fetch", %run_id, source_id, url))
            .await
    }
}

pub const FIXTURE_SCHEME: &str = "fixture://";

/// Serves `fixture://<source_id>/<file>` URLs from `<root>/<source_id>/<file>`.
///
/// A missing file answers like an HTTP 404 so offline runs fail the same way live ones do.
#[derive(Debug, Clone)]
pub struct FixtureFetcher {
    root: PathBuf,
}

impl FixtureFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn fixture_url(source_id: &str, file_name: &str) -> String {
        format!("{FIXTURE_SCHEME}{source_id}/{file_name}")
    }

    pub fn resolve(&self, source_id: &str, url: &str) -> PathBuf {
        let relative = url
            .strip_prefix(FIXTURE_SCHEME)
            .map(str::to_string)
            .unwrap_or_else(|| format!("{source_id}/{url}"));
        let cleaned = relative
            .split('/')
            .filter(|part| !part.is_empty() && *part != "." && *part != "..")
            .collect::<PathBuf>();
        self.root.join(cleaned)
    }
}

#[async_trait]
impl PageFetcher for FixtureFetcher {
    async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let path = self.resolve(source_id, url);
        let span = info_span!("http_fetch", %run_id, source_id, url, fixture = %path.display());
        async move {
            match tokio::fs::read(&path).await {
                Ok(body) => {
                    debug!(bytes = body.len(), "read fixture page");
                    Ok(FetchedResponse {
                        status: StatusCode::OK,
                        final_url: url.to_string(),
                        body,
                    })
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    Err(FetchError::HttpStatus {
                        status: StatusCode::NOT_FOUND.as_u16(),
                        url: url.to_string(),
                    })
                }
                Err(source) => Err(FetchError::Fixture { path, source }),
            }
        }
        .instrument(span)
        .await
    }
}

/// Sends `fixture://` URLs to a [`FixtureFetcher`] and everything else to the live fetcher.
pub struct RoutingFetcher {
    live: Arc<dyn PageFetcher>,
    fixtures: FixtureFetcher,
}

impl RoutingFetcher {
    pub fn new(live: Arc<dyn PageFetcher>, fixtures: FixtureFetcher) -> Self {
        Self { live, fixtures }
    }

    pub fn fixtures(&self) -> &FixtureFetcher {
        &self.fixtures
    }
}

#[async_trait]
impl PageFetcher for RoutingFetcher {
    async fn fetch(
        &self,
        run_id: Uuid,
        source_id: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        if url.starts_with(FIXTURE_SCHEME) {
            self.fixtures.fetch(run_id, source_id, url).await
        } else {
            self.live.fetch(run_id, source_id, url).await
        }
    }
}

/// What to do when an opportunity's natural key is already stored.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RefreshPolicy {
    /// Insert if absent, leave existing records untouched.
    #[default]
    SkipIfPresent,
    /// Overwrite mutable listing fields and score; `discovered_at` and `id` are kept.
    RefreshMutable,
}

impl FromStr for RefreshPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "skip" | "skip_if_present" => Ok(RefreshPolicy::SkipIfPresent),
            "refresh" | "refresh_mutable" => Ok(RefreshPolicy::RefreshMutable),
            other => anyhow::bail!("unknown refresh policy `{other}` (expected skip|refresh)"),
        }
    }
}

impl fmt::Display for RefreshPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefreshPolicy::SkipIfPresent => f.write_str("skip"),
            RefreshPolicy::RefreshMutable => f.write_str("refresh"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Skipped,
    Refreshed,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("stored row `{key}` is invalid: {detail}")]
    InvalidRow { key: String, detail: String },
}

/// Persisted store boundary: upsert by natural key, read by city, append-only scan log.
#[async_trait]
pub trait OpportunityStore: Send + Sync {
    fn backend(&self) -> &'static str;

    async fn upsert(
        &self,
        opportunity: &Opportunity,
        policy: RefreshPolicy,
    ) -> Result<UpsertOutcome, StoreError>;

    async fn list_all(&self) -> Result<Vec<Opportunity>, StoreError>;

    async fn list_by_city(&self, city: &str) -> Result<Vec<Opportunity>, StoreError>;

    async fn append_scan_run(&self, run: &ScanRun) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_scan_runs(&self, limit: Option<usize>) -> Result<Vec<ScanRun>, StoreError>;
}

/// In-process store for tests and runs without `DATABASE_URL`. Data is lost on exit.
#[derive(Debug, Default)]
pub struct MemoryStore {
    opportunities: RwLock<HashMap<String, Opportunity>>,
    scan_runs: RwLock<Vec<ScanRun>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn opportunity_count(&self) -> usize {
        self.opportunities.read().await.len()
    }

    pub async fn scan_run_count(&self) -> usize {
        self.scan_runs.read().await.len()
    }
}

#[async_trait]
impl OpportunityStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn upsert(
        &self,
        opportunity: &Opportunity,
        policy: RefreshPolicy,
    ) -> Result<UpsertOutcome, StoreError> {
        let key = opportunity.natural_key().to_string();
        let mut map = self.opportunities.write().await;
        match map.get_mut(&key) {
            None => {
                map.insert(key, opportunity.clone());
                Ok(UpsertOutcome::Inserted)
            }
            Some(_) if policy == RefreshPolicy::SkipIfPresent => Ok(UpsertOutcome::Skipped),
            Some(existing) => {
                let id = existing.id;
                let discovered_at = existing.discovered_at;
                *existing = Opportunity {
                    id,
                    discovered_at,
                    ..opportunity.clone()
                };
                Ok(UpsertOutcome::Refreshed)
            }
        }
    }

    async fn list_all(&self) -> Result<Vec<Opportunity>, StoreError> {
        let mut all = self
            .opportunities
            .read()
            .await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        all.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.discovered_at.cmp(&b.discovered_at)));
        Ok(all)
    }

    async fn list_by_city(&self, city: &str) -> Result<Vec<Opportunity>, StoreError> {
        let mut all = self.list_all().await?;
        all.retain(|o| o.city.eq_ignore_ascii_case(city));
        Ok(all)
    }

    async fn append_scan_run(&self, run: &ScanRun) -> Result<(), StoreError> {
        self.scan_runs.write().await.push(run.clone());
        Ok(())
    }

    async fn list_scan_runs(&self, limit: Option<usize>) -> Result<Vec<ScanRun>, StoreError> {
        let mut runs = self.scan_runs.read().await.clone();
        runs.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            runs.truncate(limit);
        }
        Ok(runs)
    }
}
