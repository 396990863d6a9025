//! Listing persistence + HTTP fetch utilities for the aggregator.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use jobagg_core::Listing;
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "jobagg-storage";

pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_source_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: Some(DEFAULT_USER_AGENT.to_string()),
            global_concurrency: 8,
            per_source_concurrency: 1,
        }
    }
}

/// Shared HTTP client. Every request is a single attempt bounded by the
/// configured timeout; callers decide what a failure means.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_source_limit: usize,
    per_source: Mutex<HashMap<String, Arc<Semaphore>>>,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetch cancelled for {url}")]
    Cancelled { url: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
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
        })
    }

    async fn per_source_semaphore(&self, source_id: &str) -> Arc<Semaphore> {
        let mut map = self.per_source.lock().await;
        map.entry(source_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_source_limit)))
            .clone()
    }

    /// GET `url` once and return the decoded body of a 2xx response.
    ///
    /// Cancellation wins over an in-flight request: the request future is
    /// dropped and `FetchError::Cancelled` is returned.
    pub async fn fetch_text(
        &self,
        source_id: &str,
        url: &str,
        cancel: &CancellationToken,
    ) -> Result<FetchedResponse, FetchError> {
        let cancelled = || FetchError::Cancelled {
            url: url.to_string(),
        };

        let span = info_span!("http_fetch", source_id, url);
        let request = async {
            let _global = self
                .global_limit
                .acquire()
                .await
                .map_err(|_| cancelled())?;
            let per_source = self.per_source_semaphore(source_id).await;
            let _source = per_source.acquire().await.map_err(|_| cancelled())?;

            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.text().await?;
            debug!(status = status.as_u16(), bytes = body.len(), "fetched page");
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span);

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled()),
            result = request => result,
        }
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid stored value in column {column}: {message}")]
    Decode { column: &'static str, message: String },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Durable collection of listings with a uniqueness constraint on `url`.
///
/// `insert_if_absent` must enforce uniqueness itself so that concurrent
/// writers never both persist the same url.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn list_existing_urls(&self) -> Result<HashSet<String>, StoreError>;

    /// Returns `true` when the listing was newly inserted, `false` when a
    /// listing with the same url already exists.
    async fn insert_if_absent(&self, listing: &Listing) -> Result<bool, StoreError>;

    /// Most recently scraped first; ties resolve to the later insert first.
    async fn query_recent(&self, limit: usize) -> Result<Vec<Listing>, StoreError>;

    async fn count_all(&self) -> Result<u64, StoreError>;

    async fn count_by_source(&self) -> Result<BTreeMap<String, u64>, StoreError>;
}

/// SQLite-backed listing store.
#[derive(Debug, Clone)]
pub struct SqliteListingStore {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct ListingRow {
    title: String,
    company: String,
    location: String,
    source_name: String,
    url: String,
    posted_label: String,
    scraped_at: String,
}

impl ListingRow {
    fn into_listing(self) -> Result<Listing, StoreError> {
        let scraped_at = DateTime::parse_from_rfc3339(&self.scraped_at)
            .map_err(|e| StoreError::Decode {
                column: "scraped_at",
                message: e.to_string(),
            })?
            .with_timezone(&Utc);
        Ok(Listing {
            title: self.title,
            company: self.company,
            location: self.location,
            source_name: self.source_name,
            url: self.url,
            posted_label: self.posted_label,
            scraped_at,
        })
    }
}

fn encode_timestamp(ts: DateTime<Utc>) -> String {
    // Fixed-width UTC text sorts chronologically.
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

impl SqliteListingStore {
    /// Open (creating if missing) the database at `database_url`, e.g.
    /// `sqlite://jobs.db` or `sqlite::memory:`.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        // Each in-memory connection is its own database.
        let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn in_memory() -> Result<Self, StoreError> {
        Self::connect("sqlite::memory:").await
    }

    async fn run_migrations(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                company TEXT NOT NULL,
                location TEXT NOT NULL,
                source_name TEXT NOT NULL,
                url TEXT NOT NULL UNIQUE,
                posted_label TEXT NOT NULL,
                scraped_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_scraped_at ON listings(scraped_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_listings_source_name ON listings(source_name)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ListingStore for SqliteListingStore {
    async fn list_existing_urls(&self) -> Result<HashSet<String>, StoreError> {
        let urls: Vec<(String,)> = sqlx::query_as("SELECT url FROM listings")
            .fetch_all(&self.pool)
            .await?;
        Ok(urls.into_iter().map(|(url,)| url).collect())
    }

    async fn insert_if_absent(&self, listing: &Listing) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO listings
                (title, company, location, source_name, url, posted_label, scraped_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&listing.title)
        .bind(&listing.company)
        .bind(&listing.location)
        .bind(&listing.source_name)
        .bind(&listing.url)
        .bind(&listing.posted_label)
        .bind(encode_timestamp(listing.scraped_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn query_recent(&self, limit: usize) -> Result<Vec<Listing>, StoreError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows: Vec<ListingRow> = sqlx::query_as(
            r#"
            SELECT title, company, location, source_name, url, posted_label, scraped_at
              FROM listings
             ORDER BY scraped_at DESC, id DESC
             LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(ListingRow::into_listing).collect()
    }

    async fn count_all(&self) -> Result<u64, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM listings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    async fn count_by_source(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT source_name, COUNT(*) FROM listings GROUP BY source_name",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(source, count)| (source, count.max(0) as u64))
            .collect())
    }
}

/// In-process listing store; the mutex is the single-writer point.
#[derive(Debug, Default)]
pub struct MemoryListingStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    urls: HashSet<String>,
    rows: Vec<Listing>,
}

impl MemoryListingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ListingStore for MemoryListingStore {
    async fn list_existing_urls(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.state.lock().await.urls.clone())
    }

    async fn insert_if_absent(&self, listing: &Listing) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        if !state.urls.insert(listing.url.clone()) {
            return Ok(false);
        }
        state.rows.push(listing.clone());
        Ok(true)
    }

    async fn query_recent(&self, limit: usize) -> Result<Vec<Listing>, StoreError> {
        let state = self.state.lock().await;
        let mut indexed = state.rows.iter().enumerate().collect::<Vec<_>>();
        indexed.sort_by(|(ia, a), (ib, b)| b.scraped_at.cmp(&a.scraped_at).then(ib.cmp(ia)));
        Ok(indexed
            .into_iter()
            .take(limit)
            .map(|(_, listing)| listing.clone())
            .collect())
    }

    async fn count_all(&self) -> Result<u64, StoreError> {
        Ok(self.state.lock().await.rows.len() as u64)
    }

    async fn count_by_source(&self) -> Result<BTreeMap<String, u64>, StoreError> {
        let state = self.state.lock().await;
        let mut counts = BTreeMap::new();
        for listing in &state.rows {
            *counts.entry(listing.source_name.clone()).or_default() += 1;
        }
        Ok(counts)
    }
}
