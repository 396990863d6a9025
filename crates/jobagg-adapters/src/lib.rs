//! Source adapter contract + selector-profile driven HTML search adapters.

use std::sync::Arc;

use async_trait::async_trait;
use jobagg_core::RawCandidate;
use jobagg_storage::{FetchError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::form_urlencoded;

pub const CRATE_NAME: &str = "jobagg-adapters";

/// Listing blocks taken from one results page.
pub const MAX_CARDS_PER_PAGE: usize = 10;

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{source_id} unavailable for query {query:?}: {reason}")]
    SourceUnavailable {
        source_id: String,
        query: String,
        reason: String,
    },
    #[error("{source_id} was given an empty query")]
    EmptyQuery { source_id: String },
}

impl AdapterError {
    pub fn reason(&self) -> String {
        match self {
            AdapterError::SourceUnavailable { reason, .. } => reason.clone(),
            AdapterError::EmptyQuery { .. } => "empty query".to_string(),
        }
    }
}

/// One external job site. Each call to `fetch` issues exactly one request
/// and never retries.
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Stable configuration key, e.g. `indeed-ca`.
    fn source_id(&self) -> &str;

    /// Human-readable origin recorded on every listing, e.g. `Indeed`.
    fn source_name(&self) -> &str;

    /// Origin that relative listing links resolve against.
    fn base_origin(&self) -> &str;

    fn default_location(&self) -> Option<&str> {
        None
    }

    async fn fetch(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawCandidate>, AdapterError>;
}

/// CSS selectors describing one site's search results markup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiteProfile {
    pub source_id: &'static str,
    pub source_name: &'static str,
    pub origin: &'static str,
    /// Path + query template; `{query}` is replaced by the encoded term.
    pub search_path: &'static str,
    pub card: &'static str,
    pub title: &'static str,
    pub link: Option<&'static str>,
    pub company: Option<&'static str>,
    pub location: Option<&'static str>,
    pub posted: Option<&'static str>,
    pub default_location: Option<&'static str>,
}

pub const INDEED_CA: SiteProfile = SiteProfile {
    source_id: "indeed-ca",
    source_name: "Indeed",
    origin: "https://ca.indeed.com",
    search_path: "/jobs?q={query}&l=Canada",
    card: "div.job_seen_beacon",
    title: "h2.jobTitle",
    link: Some("h2.jobTitle a[href]"),
    company: Some(r#"span[data-testid="company-name"]"#),
    location: Some(r#"div[data-testid="text-location"]"#),
    posted: Some("span.date"),
    default_location: Some("Canada"),
};

pub const JOB_BANK_CA: SiteProfile = SiteProfile {
    source_id: "job-bank-ca",
    source_name: "Job Bank Canada",
    origin: "https://www.jobbank.gc.ca",
    search_path: "/jobsearch/jobsearch?searchstring={query}",
    card: "article.resultJobItem",
    title: "a.resultJobItem-title",
    link: Some("a.resultJobItem-title[href]"),
    company: Some("span.resultJobItem-employer"),
    location: Some("span.resultJobItem-location"),
    posted: None,
    default_location: Some("Canada"),
};

pub const ELUTA_CA: SiteProfile = SiteProfile {
    source_id: "eluta-ca",
    source_name: "Eluta",
    origin: "https://www.eluta.ca",
    search_path: "/search?q={query}",
    card: "div.job-item",
    title: "a.job-title",
    link: Some("a.job-title[href]"),
    company: Some("span.company"),
    location: None,
    posted: None,
    default_location: Some("Canada"),
};

pub static SITE_PROFILES: [SiteProfile; 3] = [INDEED_CA, JOB_BANK_CA, ELUTA_CA];

pub fn profile_for_source(source_id: &str) -> Option<&'static SiteProfile> {
    SITE_PROFILES.iter().find(|p| p.source_id == source_id)
}

/// Encode a search term the way the sites expect: spaces become `+`.
pub fn encode_query(query: &str) -> String {
    form_urlencoded::byte_serialize(query.trim().as_bytes()).collect()
}

fn text_or_none(value: String) -> Option<String> {
    let collapsed = value.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.is_empty() {
        None
    } else {
        Some(collapsed)
    }
}

fn compile(selector: &str) -> Option<Selector> {
    match Selector::parse(selector) {
        Ok(sel) => Some(sel),
        Err(err) => {
            warn!(selector, error = %err, "unparseable selector; field left empty");
            None
        }
    }
}

fn first_text(card: &ElementRef<'_>, selector: Option<&Selector>) -> Option<String> {
    card.select(selector?)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>()))
}

fn first_attr(card: &ElementRef<'_>, selector: Option<&Selector>, attr: &str) -> Option<String> {
    card.select(selector?)
        .next()
        .and_then(|n| n.value().attr(attr))
        .and_then(|s| text_or_none(s.to_string()))
}

struct CompiledProfile {
    card: Option<Selector>,
    title: Option<Selector>,
    link: Option<Selector>,
    company: Option<Selector>,
    location: Option<Selector>,
    posted: Option<Selector>,
}

impl CompiledProfile {
    fn new(profile: &SiteProfile) -> Self {
        Self {
            card: compile(profile.card),
            title: compile(profile.title),
            link: profile.link.and_then(compile),
            company: profile.company.and_then(compile),
            location: profile.location.and_then(compile),
            posted: profile.posted.and_then(compile),
        }
    }
}

/// Extract up to [`MAX_CARDS_PER_PAGE`] candidates from a results page.
///
/// Blocks are mapped independently: missing sub-elements leave fields
/// absent, and a block without a recoverable title is skipped. A page whose
/// shape doesn't match the profile yields an empty vector, never an error.
pub fn extract_candidates(profile: &SiteProfile, html: &str) -> Vec<RawCandidate> {
    let compiled = CompiledProfile::new(profile);
    let Some(card_selector) = &compiled.card else {
        return Vec::new();
    };

    let document = Html::parse_document(html);
    let cards = document
        .select(card_selector)
        .take(MAX_CARDS_PER_PAGE)
        .collect::<Vec<_>>();
    if cards.is_empty() {
        warn!(
            source_id = profile.source_id,
            card = profile.card,
            "no listing blocks matched; document shape may have changed"
        );
        return Vec::new();
    }

    let mut out = Vec::with_capacity(cards.len());
    let mut skipped = 0usize;
    for card in &cards {
        let Some(title) = first_text(card, compiled.title.as_ref()) else {
            skipped += 1;
            continue;
        };
        out.push(RawCandidate {
            title: Some(title),
            company: first_text(card, compiled.company.as_ref()),
            location: first_text(card, compiled.location.as_ref()),
            source_name: Some(profile.source_name.to_string()),
            detail_url: first_attr(card, compiled.link.as_ref(), "href"),
            posted_label: first_text(card, compiled.posted.as_ref()),
        });
    }
    if skipped > 0 {
        debug!(
            source_id = profile.source_id,
            skipped, "skipped listing blocks without a title"
        );
    }
    out
}

/// Live adapter for a site described by a [`SiteProfile`].
#[derive(Debug, Clone)]
pub struct HtmlSearchAdapter {
    profile: &'static SiteProfile,
    http: Arc<HttpFetcher>,
    search_origin: String,
}

impl HtmlSearchAdapter {
    pub fn new(profile: &'static SiteProfile, http: Arc<HttpFetcher>) -> Self {
        Self {
            profile,
            http,
            search_origin: profile.origin.to_string(),
        }
    }

    /// Send searches to a different origin (a mirror or a local test
    /// endpoint). Relative links still resolve against the site's origin.
    pub fn with_search_origin(mut self, origin: impl Into<String>) -> Self {
        self.search_origin = origin.into().trim_end_matches('/').to_string();
        self
    }

    pub fn search_url(&self, query: &str) -> String {
        format!(
            "{}{}",
            self.search_origin,
            self.profile
                .search_path
                .replace("{query}", &encode_query(query))
        )
    }
}

#[async_trait]
impl SourceAdapter for HtmlSearchAdapter {
    fn source_id(&self) -> &str {
        self.profile.source_id
    }

    fn source_name(&self) -> &str {
        self.profile.source_name
    }

    fn base_origin(&self) -> &str {
        self.profile.origin
    }

    fn default_location(&self) -> Option<&str> {
        self.profile.default_location
    }

    async fn fetch(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<RawCandidate>, AdapterError> {
        if query.trim().is_empty() {
            return Err(AdapterError::EmptyQuery {
                source_id: self.profile.source_id.to_string(),
            });
        }

        let url = self.search_url(query);
        let page = self
            .http
            .fetch_text(self.profile.source_id, &url, cancel)
            .await
            .map_err(|err| AdapterError::SourceUnavailable {
                source_id: self.profile.source_id.to_string(),
                query: query.to_string(),
                reason: describe_fetch_error(&err),
            })?;

        Ok(extract_candidates(self.profile, &page.body))
    }
}

fn describe_fetch_error(err: &FetchError) -> String {
    if err.is_timeout() {
        "request timed out".to_string()
    } else {
        err.to_string()
    }
}

pub fn indeed_ca_adapter(http: Arc<HttpFetcher>) -> HtmlSearchAdapter {
    HtmlSearchAdapter::new(&INDEED_CA, http)
}

pub fn job_bank_adapter(http: Arc<HttpFetcher>) -> HtmlSearchAdapter {
    HtmlSearchAdapter::new(&JOB_BANK_CA, http)
}

pub fn eluta_adapter(http: Arc<HttpFetcher>) -> HtmlSearchAdapter {
    HtmlSearchAdapter::new(&ELUTA_CA, http)
}

pub fn adapter_for_source(
    source_id: &str,
    http: Arc<HttpFetcher>,
) -> Option<HtmlSearchAdapter> {
    profile_for_source(source_id).map(|profile| HtmlSearchAdapter::new(profile, http))
}
