//! Aggregation pipeline: normalization, deduplication, and run orchestration.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use jobagg_adapters::{adapter_for_source, SourceAdapter};
use jobagg_core::{
    AggregationRun, Listing, QueryAttempt, RawCandidate, DEFAULT_COMPANY, DEFAULT_LOCATION,
    DEFAULT_POSTED_LABEL,
};
use jobagg_storage::{HttpClientConfig, HttpFetcher, ListingStore, SqliteListingStore, DEFAULT_USER_AGENT};
use serde::Deserialize;
use thiserror::Error;
use tokio::fs;
use tokio::time::Instant;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobagg-sync";

/// Pseudo source id under which store failures are recorded.
pub const STORE_SOURCE_ID: &str = "store";

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    #[serde(default)]
    pub queries: Vec<String>,
    #[serde(default)]
    pub search_origin: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct SupplementsFile {
    #[serde(default)]
    supplements: Vec<serde_yaml::Value>,
}

/// Hand-authored listing for a site that has no live adapter. Every field is
/// optional here; the normalizer decides what is usable.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SupplementEntry {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub source_name: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub posted_label: Option<String>,
}

impl SupplementEntry {
    fn into_raw(self) -> RawCandidate {
        RawCandidate {
            title: self.title,
            company: self.company,
            location: self.location,
            source_name: self.source_name,
            detail_url: self.url,
            posted_label: self.posted_label,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AggregatorSettings {
    pub database_url: String,
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub request_delay_ms: u64,
    pub run_timeout_secs: Option<u64>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl AggregatorSettings {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://jobs.db".to_string()),
            workspace_root: std::env::var("JOBAGG_WORKSPACE_ROOT")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from(".")),
            user_agent: std::env::var("JOBAGG_USER_AGENT")
                .unwrap_or_else(|_| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs: std::env::var("JOBAGG_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(10),
            request_delay_ms: std::env::var("JOBAGG_REQUEST_DELAY_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(2_000),
            run_timeout_secs: std::env::var("JOBAGG_RUN_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            scheduler_enabled: std::env::var("JOBAGG_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: std::env::var("JOBAGG_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 */6 * * *".to_string()),
        }
    }
}

pub fn parse_source_registry(yaml: &str) -> Result<SourceRegistry> {
    serde_yaml::from_str(yaml).context("parsing source registry")
}

/// Parse the supplements file. Only a broken document is an error; an entry
/// with the wrong shape is logged and skipped.
pub fn parse_supplements(yaml: &str) -> Result<Vec<SupplementEntry>> {
    let file: SupplementsFile = serde_yaml::from_str(yaml).context("parsing supplements")?;
    Ok(file
        .supplements
        .into_iter()
        .enumerate()
        .filter_map(|(index, value)| match serde_yaml::from_value::<SupplementEntry>(value) {
            Ok(entry) => Some(entry),
            Err(err) => {
                warn!(index, error = %err, "skipping malformed supplement entry");
                None
            }
        })
        .collect())
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Manually driven clock for tests.
#[derive(Debug)]
pub struct FixedClock {
    now: StdMutex<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: StdMutex::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(|e| e.into_inner()) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Hands out `scraped_at` stamps that never go backwards within a run, even
/// if the wall clock does.
pub struct RunClock {
    clock: Arc<dyn Clock>,
    last: Option<DateTime<Utc>>,
}

impl RunClock {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock, last: None }
    }

    pub fn stamp(&mut self) -> DateTime<Utc> {
        let now = self.clock.now();
        let stamp = match self.last {
            Some(last) if last > now => last,
            _ => now,
        };
        self.last = Some(stamp);
        stamp
    }
}

/// What the normalizer knows about the source a candidate came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceIdentity {
    pub source_id: String,
    pub source_name: String,
    pub base_origin: Option<Url>,
    pub default_location: Option<String>,
}

impl SourceIdentity {
    pub fn from_adapter(adapter: &dyn SourceAdapter) -> Self {
        let base_origin = match Url::parse(adapter.base_origin()) {
            Ok(url) => Some(url),
            Err(err) => {
                warn!(
                    source_id = adapter.source_id(),
                    origin = adapter.base_origin(),
                    error = %err,
                    "adapter origin is not a valid url; relative links will be rejected"
                );
                None
            }
        };
        Self {
            source_id: adapter.source_id().to_string(),
            source_name: adapter.source_name().to_string(),
            base_origin,
            default_location: adapter.default_location().map(ToString::to_string),
        }
    }

    /// Identity for curated entries: no origin, so urls must be absolute.
    pub fn supplement(source_name: &str) -> Self {
        Self {
            source_id: "supplement".to_string(),
            source_name: source_name.to_string(),
            base_origin: None,
            default_location: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("candidate has neither title nor url")]
    NoIdentity,
    #[error("candidate has no title")]
    MissingTitle,
    #[error("candidate has no url")]
    MissingUrl,
    #[error("url {url:?} cannot be resolved to an absolute http(s) url")]
    UnresolvableUrl { url: String },
    #[error("candidate has no source name")]
    MissingSourceName,
}

fn clean(value: Option<String>) -> Option<String> {
    let value = value?;
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else if trimmed.len() == value.len() {
        Some(value)
    } else {
        Some(trimmed.to_string())
    }
}

/// Resolve `raw` to an absolute http(s) url, joining relative paths onto
/// `base` when one is known.
pub fn resolve_listing_url(raw: &str, base: Option<&Url>) -> Result<String, Rejection> {
    let unresolvable = || Rejection::UnresolvableUrl {
        url: raw.to_string(),
    };
    let parsed = match Url::parse(raw) {
        Ok(url) => url,
        Err(url::ParseError::RelativeUrlWithoutBase) => {
            base.ok_or_else(unresolvable)?.join(raw).map_err(|_| unresolvable())?
        }
        Err(_) => return Err(unresolvable()),
    };
    if !matches!(parsed.scheme(), "http" | "https") || parsed.host_str().is_none() {
        return Err(unresolvable());
    }
    Ok(parsed.to_string())
}

/// Maps raw candidates onto the canonical [`Listing`] shape.
#[derive(Debug, Clone)]
pub struct Normalizer {
    pub default_company: String,
    pub fallback_location: String,
    pub default_posted_label: String,
}

impl Default for Normalizer {
    fn default() -> Self {
        Self {
            default_company: DEFAULT_COMPANY.to_string(),
            fallback_location: DEFAULT_LOCATION.to_string(),
            default_posted_label: DEFAULT_POSTED_LABEL.to_string(),
        }
    }
}

impl Normalizer {
    pub fn normalize(
        &self,
        raw: RawCandidate,
        source: &SourceIdentity,
        scraped_at: DateTime<Utc>,
    ) -> Result<Listing, Rejection> {
        let title = clean(raw.title);
        let url = clean(raw.detail_url);
        let (title, url) = match (title, url) {
            (None, None) => return Err(Rejection::NoIdentity),
            (None, Some(_)) => return Err(Rejection::MissingTitle),
            (Some(_), None) => return Err(Rejection::MissingUrl),
            (Some(title), Some(url)) => (title, url),
        };
        let url = resolve_listing_url(&url, source.base_origin.as_ref())?;

        let source_name = clean(raw.source_name)
            .or_else(|| clean(Some(source.source_name.clone())))
            .ok_or(Rejection::MissingSourceName)?;
        let location = clean(raw.location)
            .or_else(|| source.default_location.clone())
            .unwrap_or_else(|| self.fallback_location.clone());

        Ok(Listing {
            title,
            company: clean(raw.company).unwrap_or_else(|| self.default_company.clone()),
            location,
            source_name,
            url,
            posted_label: clean(raw.posted_label)
                .unwrap_or_else(|| self.default_posted_label.clone()),
            scraped_at,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupOutcome {
    pub fresh: Vec<Listing>,
    pub duplicates: usize,
}

/// Exact-url deduplication against the store and within the batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct Deduplicator;

impl Deduplicator {
    /// Keep, in input order, listings whose url is neither already stored
    /// nor repeated earlier in `batch`.
    pub fn filter_new(&self, batch: Vec<Listing>, existing_urls: &HashSet<String>) -> DedupOutcome {
        let mut seen = HashSet::with_capacity(batch.len());
        let mut fresh = Vec::with_capacity(batch.len());
        let mut duplicates = 0usize;
        for listing in batch {
            if existing_urls.contains(&listing.url) || !seen.insert(listing.url.clone()) {
                duplicates += 1;
                continue;
            }
            fresh.push(listing);
        }
        DedupOutcome { fresh, duplicates }
    }
}

/// Earliest time the next query may be dispatched to one source.
#[derive(Debug, Clone)]
pub struct SourceCooldown {
    delay: Duration,
    next_dispatch_at: Option<Instant>,
}

impl SourceCooldown {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            next_dispatch_at: None,
        }
    }

    pub fn next_dispatch_at(&self) -> Option<Instant> {
        self.next_dispatch_at
    }

    /// Wait until the source may be queried again. Returns `false` if the
    /// run was cancelled while waiting.
    pub async fn wait_turn(&self, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            return false;
        }
        let Some(at) = self.next_dispatch_at else {
            return true;
        };
        tokio::select! {
            biased;
            _ = cancel.cancelled() => false,
            _ = tokio::time::sleep_until(at) => true,
        }
    }

    /// Start the cooldown window after a request to the source finished.
    pub fn mark_completed(&mut self) {
        self.next_dispatch_at = Some(Instant::now() + self.delay);
    }
}

#[derive(Clone)]
pub struct AggregationConfig {
    pub sources: Vec<Arc<dyn SourceAdapter>>,
    pub queries_by_source: BTreeMap<String, Vec<String>>,
    pub per_request_delay: Duration,
    pub static_supplements: Vec<Listing>,
    pub run_timeout: Option<Duration>,
}

impl AggregationConfig {
    pub fn new(sources: Vec<Arc<dyn SourceAdapter>>) -> Self {
        Self {
            sources,
            queries_by_source: BTreeMap::new(),
            per_request_delay: Duration::from_secs(2),
            static_supplements: Vec::new(),
            run_timeout: None,
        }
    }

    pub fn with_queries<I, S>(mut self, source_id: &str, queries: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.queries_by_source.insert(
            source_id.to_string(),
            queries.into_iter().map(Into::into).collect(),
        );
        self
    }
}

#[derive(Debug, Default)]
struct SourceHarvest {
    attempted: Vec<String>,
    skipped: Vec<String>,
    failures: Vec<(String, String)>,
    candidates: Vec<RawCandidate>,
}

async fn harvest_source(
    adapter: Arc<dyn SourceAdapter>,
    queries: Vec<String>,
    delay: Duration,
    cancel: CancellationToken,
) -> SourceHarvest {
    let mut harvest = SourceHarvest::default();
    let mut cooldown = SourceCooldown::new(delay);

    for query in queries {
        if !cooldown.wait_turn(&cancel).await {
            harvest.skipped.push(query);
            continue;
        }

        harvest.attempted.push(query.clone());
        let result = adapter.fetch(&query, &cancel).await;
        cooldown.mark_completed();
        match result {
            Ok(candidates) => {
                info!(
                    source_id = adapter.source_id(),
                    query = %query,
                    candidates = candidates.len(),
                    "query fetched"
                );
                harvest.candidates.extend(candidates);
            }
            Err(err) => {
                warn!(
                    source_id = adapter.source_id(),
                    query = %query,
                    error = %err,
                    "source unavailable; continuing"
                );
                harvest.failures.push((query, err.reason()));
            }
        }
    }
    harvest
}

/// Drives one aggregation run across every configured source.
pub struct AggregationOrchestrator {
    store: Arc<dyn ListingStore>,
    clock: Arc<dyn Clock>,
    normalizer: Normalizer,
    dedup: Deduplicator,
}

impl AggregationOrchestrator {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            normalizer: Normalizer::default(),
            dedup: Deduplicator,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(&self) -> &Arc<dyn ListingStore> {
        &self.store
    }

    pub async fn run(&self, config: &AggregationConfig) -> AggregationRun {
        self.run_with_cancel(config, CancellationToken::new()).await
    }

    /// Run the pipeline. Never fails: every problem ends up in the returned
    /// summary. Cancelling `cancel` (or `config.run_timeout` elapsing) aborts
    /// in-flight fetches and skips remaining queries; whatever was collected
    /// is still deduplicated and persisted.
    pub async fn run_with_cancel(
        &self,
        config: &AggregationConfig,
        cancel: CancellationToken,
    ) -> AggregationRun {
        // The run deadline must not cancel the caller's token.
        let cancel = cancel.child_token();
        let mut run = AggregationRun::new(Uuid::new_v4(), self.clock.now());
        let mut stamps = RunClock::new(self.clock.clone());
        info!(run_id = %run.run_id, sources = config.sources.len(), "aggregation run started");

        let deadline = config.run_timeout.map(|timeout| {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                warn!(?timeout, "run deadline reached; cancelling");
                cancel.cancel();
            })
        });

        for (source_id, _) in config
            .queries_by_source
            .iter()
            .filter(|(id, _)| !config.sources.iter().any(|s| s.source_id() == id.as_str()))
        {
            warn!(source_id = %source_id, "queries configured for a source with no adapter");
        }

        let mut tasks = Vec::with_capacity(config.sources.len());
        for adapter in &config.sources {
            let queries = config
                .queries_by_source
                .get(adapter.source_id())
                .cloned()
                .unwrap_or_default();
            let identity = SourceIdentity::from_adapter(adapter.as_ref());
            let task = tokio::spawn(harvest_source(
                adapter.clone(),
                queries,
                config.per_request_delay,
                cancel.clone(),
            ));
            tasks.push((identity, task));
        }

        let mut batch = Vec::new();
        for (identity, task) in tasks {
            let harvest = match task.await {
                Ok(harvest) => harvest,
                Err(err) => {
                    error!(source_id = %identity.source_id, error = %err, "source task aborted");
                    run.record_failure(&identity.source_id, None, format!("source task aborted: {err}"));
                    continue;
                }
            };

            run.queries_attempted
                .extend(harvest.attempted.into_iter().map(|query| QueryAttempt {
                    source_id: identity.source_id.clone(),
                    query,
                }));
            run.queries_skipped
                .extend(harvest.skipped.into_iter().map(|query| QueryAttempt {
                    source_id: identity.source_id.clone(),
                    query,
                }));
            for (query, reason) in harvest.failures {
                run.record_failure(&identity.source_id, Some(&query), reason);
            }

            run.candidates_seen += harvest.candidates.len();
            for raw in harvest.candidates {
                match self.normalizer.normalize(raw, &identity, stamps.stamp()) {
                    Ok(listing) => batch.push(listing),
                    Err(rejection) => {
                        run.rejected_candidates += 1;
                        debug!(source_id = %identity.source_id, %rejection, "candidate rejected");
                    }
                }
            }
        }

        if let Some(deadline) = deadline {
            deadline.abort();
        }
        run.cancelled = cancel.is_cancelled();

        for supplement in &config.static_supplements {
            batch.push(Listing {
                scraped_at: stamps.stamp(),
                ..supplement.clone()
            });
            run.supplements_added += 1;
        }

        self.persist(&mut run, batch).await;

        run.finished_at = self.clock.now().max(run.started_at);
        info!(
            run_id = %run.run_id,
            candidates = run.candidates_seen,
            rejected = run.rejected_candidates,
            duplicates = run.duplicate_listings,
            stored = run.newly_persisted,
            failures = run.failures.len(),
            cancelled = run.cancelled,
            "aggregation run finished"
        );
        run
    }

    async fn persist(&self, run: &mut AggregationRun, batch: Vec<Listing>) {
        let existing = match self.store.list_existing_urls().await {
            Ok(urls) => urls,
            Err(err) => {
                // The store's own uniqueness constraint still holds.
                warn!(error = %err, "could not load stored urls; relying on insert constraint");
                run.record_failure(STORE_SOURCE_ID, None, format!("listing stored urls: {err}"));
                HashSet::new()
            }
        };

        let outcome = self.dedup.filter_new(batch, &existing);
        run.duplicate_listings += outcome.duplicates;

        let mut insert_errors = 0usize;
        let mut first_error = None;
        for listing in &outcome.fresh {
            match self.store.insert_if_absent(listing).await {
                Ok(true) => run.newly_persisted += 1,
                Ok(false) => run.duplicate_listings += 1,
                Err(err) => {
                    insert_errors += 1;
                    first_error.get_or_insert_with(|| err.to_string());
                }
            }
        }
        if let Some(first) = first_error {
            error!(insert_errors, first_error = %first, "listing inserts failed");
            run.record_failure(
                STORE_SOURCE_ID,
                None,
                format!("{insert_errors} insert(s) failed; first error: {first}"),
            );
        }
    }
}

/// Everything needed to run aggregation from the workspace configuration:
/// source registry, supplements, the HTTP client and the listing store.
pub struct AggregationPipeline {
    settings: AggregatorSettings,
    http: Arc<HttpFetcher>,
    orchestrator: AggregationOrchestrator,
}

impl AggregationPipeline {
    pub fn new(settings: AggregatorSettings, store: Arc<dyn ListingStore>) -> Result<Self> {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(settings.http_timeout_secs),
            user_agent: Some(settings.user_agent.clone()),
            ..Default::default()
        })?;
        Ok(Self {
            settings,
            http: Arc::new(http),
            orchestrator: AggregationOrchestrator::new(store),
        })
    }

    pub async fn from_settings(settings: AggregatorSettings) -> Result<Self> {
        let store = SqliteListingStore::connect(&settings.database_url)
            .await
            .with_context(|| format!("opening listing store {}", settings.database_url))?;
        Self::new(settings, Arc::new(store))
    }

    pub fn store(&self) -> Arc<dyn ListingStore> {
        self.orchestrator.store().clone()
    }

    pub fn settings(&self) -> &AggregatorSettings {
        &self.settings
    }

    pub async fn build_config(&self) -> Result<AggregationConfig> {
        let registry = self.load_source_registry().await?;
        let mut config = AggregationConfig::new(Vec::new());
        config.per_request_delay = Duration::from_millis(self.settings.request_delay_ms);
        config.run_timeout = self.settings.run_timeout_secs.map(Duration::from_secs);

        for source in registry.sources.into_iter().filter(|s| s.enabled) {
            let Some(adapter) = adapter_for_source(&source.source_id, self.http.clone()) else {
                warn!(source_id = %source.source_id, "no adapter registered; skipping");
                continue;
            };
            let adapter = match &source.search_origin {
                Some(origin) => adapter.with_search_origin(origin.clone()),
                None => adapter,
            };
            info!(
                source_id = %source.source_id,
                display_name = %source.display_name,
                queries = source.queries.len(),
                "source enabled"
            );
            config.queries_by_source.insert(source.source_id.clone(), source.queries);
            config.sources.push(Arc::new(adapter));
        }

        config.static_supplements = self.load_supplements().await?;
        Ok(config)
    }

    pub async fn run_once(&self) -> Result<AggregationRun> {
        self.run_once_with_cancel(CancellationToken::new()).await
    }

    pub async fn run_once_with_cancel(&self, cancel: CancellationToken) -> Result<AggregationRun> {
        let config = self.build_config().await?;
        Ok(self.orchestrator.run_with_cancel(&config, cancel).await)
    }

    /// Cron-driven runs, when enabled in settings.
    pub async fn maybe_build_scheduler(self: Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.settings.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = self.settings.sync_cron.clone();
        let pipeline = self.clone();
        let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
            let pipeline = pipeline.clone();
            Box::pin(async move {
                match pipeline.run_once().await {
                    Ok(run) => info!(
                        run_id = %run.run_id,
                        stored = run.newly_persisted,
                        "scheduled aggregation finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled aggregation could not start"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }

    async fn load_source_registry(&self) -> Result<SourceRegistry> {
        let path = self.settings.workspace_root.join("sources.yaml");
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        parse_source_registry(&text).with_context(|| format!("in {}", path.display()))
    }

    async fn load_supplements(&self) -> Result<Vec<Listing>> {
        let path = self.settings.workspace_root.join("supplements.yaml");
        if !fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let entries = parse_supplements(&text).with_context(|| format!("in {}", path.display()))?;
        Ok(supplements_to_listings(
            entries,
            &self.orchestrator.normalizer,
            Utc::now(),
            &path,
        ))
    }
}

/// Validate curated entries through the normalizer; invalid ones are logged
/// and dropped.
pub fn supplements_to_listings(
    entries: Vec<SupplementEntry>,
    normalizer: &Normalizer,
    now: DateTime<Utc>,
    origin: &Path,
) -> Vec<Listing> {
    entries
        .into_iter()
        .filter_map(|entry| {
            let identity = SourceIdentity::supplement(entry.source_name.as_deref().unwrap_or_default());
            match normalizer.normalize(entry.into_raw(), &identity, now) {
                Ok(listing) => Some(listing),
                Err(rejection) => {
                    warn!(file = %origin.display(), %rejection, "dropping invalid supplement");
                    None
                }
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use jobagg_storage::MemoryListingStore;

    fn at(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, 8, minute, 0).single().unwrap()
    }

    fn indeed() -> SourceIdentity {
        SourceIdentity {
            source_id: "indeed-ca".into(),
            source_name: "Indeed".into(),
            base_origin: Some(Url::parse("https://ca.indeed.com").unwrap()),
            default_location: Some("Canada".into()),
        }
    }

    fn listing(url: &str) -> Listing {
        Listing {
            title: "Security Guard".into(),
            company: "N/A".into(),
            location: "Canada".into(),
            source_name: "Indeed".into(),
            url: url.into(),
            posted_label: "Recently".into(),
            scraped_at: at(0),
        }
    }

    #[test]
    fn title_and_url_only_candidate_gets_defaults() {
        let raw = RawCandidate::with_title_and_url("Warehouse Associate", "/viewjob?jk=abc");
        let listing = Normalizer::default().normalize(raw, &indeed(), at(5)).unwrap();
        assert_eq!(listing.company, "N/A");
        assert_eq!(listing.location, "Canada");
        assert_eq!(listing.posted_label, "Recently");
        assert_eq!(listing.source_name, "Indeed");
        assert_eq!(listing.url, "https://ca.indeed.com/viewjob?jk=abc");
        assert_eq!(listing.scraped_at, at(5));
    }

    #[test]
    fn location_falls_back_to_unknown_without_source_default() {
        let mut source = indeed();
        source.default_location = None;
        let raw = RawCandidate::with_title_and_url("Picker", "https://ca.indeed.com/viewjob?jk=1");
        let listing = Normalizer::default().normalize(raw, &source, at(0)).unwrap();
        assert_eq!(listing.location, "Unknown");
    }

    #[test]
    fn blank_fields_count_as_absent() {
        let raw = RawCandidate {
            title: Some("  Night Security Officer ".into()),
            company: Some("   ".into()),
            location: Some("".into()),
            source_name: None,
            detail_url: Some(" /viewjob?jk=9 ".into()),
            posted_label: Some("\n".into()),
        };
        let listing = Normalizer::default().normalize(raw, &indeed(), at(0)).unwrap();
        assert_eq!(listing.title, "Night Security Officer");
        assert_eq!(listing.company, "N/A");
        assert_eq!(listing.location, "Canada");
        assert_eq!(listing.posted_label, "Recently");
    }

    #[test]
    fn identity_less_candidates_are_rejected() {
        let normalizer = Normalizer::default();
        let blank = RawCandidate {
            title: Some(" ".into()),
            company: Some("Amazon".into()),
            ..RawCandidate::default()
        };
        assert_eq!(
            normalizer.normalize(blank, &indeed(), at(0)),
            Err(Rejection::NoIdentity)
        );

        let no_url = RawCandidate {
            title: Some("Security supervisor".into()),
            ..RawCandidate::default()
        };
        assert_eq!(
            normalizer.normalize(no_url, &indeed(), at(0)),
            Err(Rejection::MissingUrl)
        );

        let no_title = RawCandidate {
            detail_url: Some("/viewjob?jk=2".into()),
            ..RawCandidate::default()
        };
        assert_eq!(
            normalizer.normalize(no_title, &indeed(), at(0)),
            Err(Rejection::MissingTitle)
        );
    }

    #[test]
    fn relative_urls_need_a_known_origin() {
        assert_eq!(
            resolve_listing_url("/spl/forklift", None),
            Err(Rejection::UnresolvableUrl {
                url: "/spl/forklift".into()
            })
        );
        assert!(matches!(
            resolve_listing_url("mailto:jobs@example.ca", None),
            Err(Rejection::UnresolvableUrl { .. })
        ));
        assert!(matches!(
            resolve_listing_url("http://[broken", None),
            Err(Rejection::UnresolvableUrl { .. })
        ));
        let base = Url::parse("https://www.eluta.ca").unwrap();
        assert_eq!(
            resolve_listing_url("/spl/forklift", Some(&base)).unwrap(),
            "https://www.eluta.ca/spl/forklift"
        );
        assert_eq!(
            resolve_listing_url("https://careers.example.ca/jobs/8812", Some(&base)).unwrap(),
            "https://careers.example.ca/jobs/8812"
        );
    }

    #[test]
    fn dedup_collapses_within_batch_and_against_store() {
        let existing = HashSet::from(["https://ca.indeed.com/viewjob?jk=old".to_string()]);
        let batch = vec![
            listing("https://ca.indeed.com/viewjob?jk=a"),
            listing("https://ca.indeed.com/viewjob?jk=old"),
            listing("https://www.eluta.ca/spl/b"),
            Listing {
                title: "Same url, other query".into(),
                ..listing("https://ca.indeed.com/viewjob?jk=a")
            },
        ];
        let outcome = Deduplicator.filter_new(batch, &existing);
        assert_eq!(outcome.duplicates, 2);
        assert_eq!(
            outcome.fresh.iter().map(|l| l.url.as_str()).collect::<Vec<_>>(),
            vec!["https://ca.indeed.com/viewjob?jk=a", "https://www.eluta.ca/spl/b"]
        );
        assert_eq!(outcome.fresh[0].title, "Security Guard");
    }

    #[test]
    fn same_title_different_urls_are_both_kept() {
        let batch = vec![
            listing("https://ca.indeed.com/viewjob?jk=1"),
            Listing {
                source_name: "Eluta".into(),
                ..listing("https://www.eluta.ca/spl/1")
            },
        ];
        let outcome = Deduplicator.filter_new(batch, &HashSet::new());
        assert_eq!(outcome.fresh.len(), 2);
        assert_eq!(outcome.duplicates, 0);
    }

    #[test]
    fn run_clock_never_goes_backwards() {
        let clock = Arc::new(FixedClock::new(at(10)));
        let mut stamps = RunClock::new(clock.clone());
        assert_eq!(stamps.stamp(), at(10));
        clock.set(at(3));
        assert_eq!(stamps.stamp(), at(10));
        clock.advance(chrono::Duration::minutes(20));
        assert_eq!(stamps.stamp(), at(23));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_spaces_dispatches() {
        let cancel = CancellationToken::new();
        let mut cooldown = SourceCooldown::new(Duration::from_secs(2));
        let start = Instant::now();
        assert!(cooldown.wait_turn(&cancel).await);
        assert_eq!(Instant::now(), start);

        cooldown.mark_completed();
        assert_eq!(cooldown.next_dispatch_at(), Some(start + Duration::from_secs(2)));
        assert!(cooldown.wait_turn(&cancel).await);
        assert!(Instant::now() >= start + Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn cooldown_wait_is_cancellable() {
        let cancel = CancellationToken::new();
        let mut cooldown = SourceCooldown::new(Duration::from_secs(600));
        cooldown.mark_completed();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });
        let start = Instant::now();
        assert!(!cooldown.wait_turn(&cancel).await);
        assert!(Instant::now() < start + Duration::from_secs(600));
    }

    #[test]
    fn source_registry_yaml_parses_with_defaults() {
        let registry = parse_source_registry(
            r#"
sources:
  - source_id: indeed-ca
    display_name: Indeed Canada
    enabled: true
    queries: ["warehouse associate", "security", "part time"]
  - source_id: eluta-ca
    display_name: Eluta
    enabled: false
    search_origin: http://127.0.0.1:8089
"#,
        )
        .unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.sources[0].queries.len(), 3);
        assert!(registry.sources[0].search_origin.is_none());
        assert!(!registry.sources[1].enabled);
        assert!(registry.sources[1].queries.is_empty());
    }

    #[test]
    fn supplements_are_validated_through_the_normalizer() {
        let entries = parse_supplements(
            r#"
supplements:
  - title: Warehouse Associate - Part Time
    company: Amazon
    location: Toronto, ON
    source_name: Amazon Jobs
    url: https://www.amazon.jobs/en/search?base_query=warehouse&loc_query=Canada
    posted_label: 1 day ago
  - title: Broken entry
    source_name: Nowhere
    url: /relative/only
"#,
        )
        .unwrap();
        let listings = supplements_to_listings(
            entries,
            &Normalizer::default(),
            at(0),
            Path::new("supplements.yaml"),
        );
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].source_name, "Amazon Jobs");
        assert_eq!(listings[0].posted_label, "1 day ago");
    }

    #[test]
    fn malformed_supplement_entries_do_not_sink_the_file() {
        let entries = parse_supplements(
            r#"
supplements:
  - company: Walmart Canada
    source_name: Walmart Careers
    url: https://careers.walmart.ca/search-jobs/security/Canada
  - title: Warehouse Team Member
    url: https://jobs.loblaw.ca/search-jobs/warehouse/Canada
  - just a string
  - title: [not, a, title]
    source_name: LinkedIn
    url: https://www.linkedin.com/jobs/search/
  - title: Security Officer - Part Time
    source_name: Google Jobs
    url: https://www.google.com/search?q=security+jobs+canada+part+time
"#,
        )
        .unwrap();
        assert_eq!(entries.len(), 3);

        let listings = supplements_to_listings(
            entries,
            &Normalizer::default(),
            at(0),
            Path::new("supplements.yaml"),
        );
        assert_eq!(listings.len(), 1);
        assert_eq!(listings[0].source_name, "Google Jobs");
        assert_eq!(listings[0].company, "N/A");
    }

    #[test]
    fn supplements_document_that_is_not_yaml_is_an_error() {
        assert!(parse_supplements("supplements: [unterminated").is_err());
    }

    #[tokio::test]
    async fn store_failures_never_fail_the_run() {
        struct BrokenStore;

        #[async_trait::async_trait]
        impl ListingStore for BrokenStore {
            async fn list_existing_urls(&self) -> Result<HashSet<String>, jobagg_storage::StoreError> {
                Err(anyhow::anyhow!("disk unavailable").into())
            }
            async fn insert_if_absent(&self, _listing: &Listing) -> Result<bool, jobagg_storage::StoreError> {
                Err(anyhow::anyhow!("disk unavailable").into())
            }
            async fn query_recent(&self, _limit: usize) -> Result<Vec<Listing>, jobagg_storage::StoreError> {
                Ok(Vec::new())
            }
            async fn count_all(&self) -> Result<u64, jobagg_storage::StoreError> {
                Ok(0)
            }
            async fn count_by_source(&self) -> Result<BTreeMap<String, u64>, jobagg_storage::StoreError> {
                Ok(BTreeMap::new())
            }
        }

        let mut config = AggregationConfig::new(Vec::new());
        config.static_supplements = vec![listing("https://careers.walmart.ca/search-jobs/security/Canada")];
        let run = AggregationOrchestrator::new(Arc::new(BrokenStore)).run(&config).await;
        assert_eq!(run.newly_persisted, 0);
        assert_eq!(run.failure_counts_by_source().get(STORE_SOURCE_ID), Some(&2));
    }

    #[tokio::test]
    async fn supplements_are_restamped_with_the_run_clock() {
        let store = Arc::new(MemoryListingStore::new());
        let clock = Arc::new(FixedClock::new(at(30)));
        let orchestrator = AggregationOrchestrator::new(store.clone()).with_clock(clock);
        let mut config = AggregationConfig::new(Vec::new());
        config.static_supplements = vec![listing("https://jobs.loblaw.ca/search-jobs/warehouse/Canada")];

        let run = orchestrator.run(&config).await;
        assert_eq!(run.supplements_added, 1);
        assert_eq!(run.newly_persisted, 1);
        let stored = store.query_recent(10).await.unwrap();
        assert_eq!(stored[0].scraped_at, at(30));
    }
}
