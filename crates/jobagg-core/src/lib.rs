//! Core domain model for the job listing aggregator.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobagg-core";

pub const DEFAULT_COMPANY: &str = "N/A";
pub const DEFAULT_LOCATION: &str = "Unknown";
pub const DEFAULT_POSTED_LABEL: &str = "Recently";

/// Loosely structured listing block as pulled off a search results page.
///
/// Every field is optional; adapters fill in whatever the markup yields and
/// leave the rest for the normalizer to default or reject.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RawCandidate {
    pub title: Option<String>,
    pub company: Option<String>,
    pub location: Option<String>,
    pub source_name: Option<String>,
    pub detail_url: Option<String>,
    pub posted_label: Option<String>,
}

impl RawCandidate {
    pub fn with_title_and_url(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            detail_url: Some(url.into()),
            ..Self::default()
        }
    }
}

/// Canonical persisted job listing. `url` is the identity key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listing {
    pub title: String,
    pub company: String,
    pub location: String,
    pub source_name: String,
    pub url: String,
    pub posted_label: String,
    pub scraped_at: DateTime<Utc>,
}

/// One (source, query) pair the orchestrator dispatched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryAttempt {
    pub source_id: String,
    pub query: String,
}

/// A recorded failure for a (source, query) pair, or for the store itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFailure {
    pub source_id: String,
    pub query: Option<String>,
    pub reason: String,
}

/// Summary of one aggregation run. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregationRun {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub queries_attempted: Vec<QueryAttempt>,
    /// Queries never dispatched because the run was cancelled first.
    pub queries_skipped: Vec<QueryAttempt>,
    pub failures: Vec<SourceFailure>,
    pub candidates_seen: usize,
    pub rejected_candidates: usize,
    pub duplicate_listings: usize,
    pub supplements_added: usize,
    pub newly_persisted: usize,
    pub cancelled: bool,
}

impl AggregationRun {
    pub fn new(run_id: Uuid, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id,
            started_at,
            finished_at: started_at,
            queries_attempted: Vec::new(),
            queries_skipped: Vec::new(),
            failures: Vec::new(),
            candidates_seen: 0,
            rejected_candidates: 0,
            duplicate_listings: 0,
            supplements_added: 0,
            newly_persisted: 0,
            cancelled: false,
        }
    }

    pub fn record_failure(
        &mut self,
        source_id: impl Into<String>,
        query: Option<&str>,
        reason: impl Into<String>,
    ) {
        self.failures.push(SourceFailure {
            source_id: source_id.into(),
            query: query.map(ToString::to_string),
            reason: reason.into(),
        });
    }

    /// Failure counts keyed by source id, so a systematically broken adapter
    /// stands out from one that merely returned few results.
    pub fn failure_counts_by_source(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for failure in &self.failures {
            *counts.entry(failure.source_id.clone()).or_default() += 1;
        }
        counts
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.cancelled
    }
}
