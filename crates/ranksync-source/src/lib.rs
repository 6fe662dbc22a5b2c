//! Ranking source contracts plus HTTP and fixture-bundle implementations.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ranksync_core::{deserialize_external_id, AthleteDetail, Category, RankedSummary};
use ranksync_storage::{FetchError, HttpFetcher, RetryDisposition, Retryable};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "ranksync-source";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("athlete {0} is not known to the source")]
    NotFound(String),
    #[error("no ranking published for category {0}")]
    UnknownCategory(String),
    #[error("requested athlete {requested} but the source returned {returned}")]
    IdMismatch { requested: String, returned: String },
}

impl Retryable for SourceError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            SourceError::Fetch(err) => err.disposition(),
            SourceError::NotFound(_)
            | SourceError::UnknownCategory(_)
            | SourceError::IdMismatch { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Upstream that publishes ranked lists and per-athlete detail.
///
/// Each call is a single attempt; callers wrap it in their own retry policy.
#[async_trait]
pub trait RankingSource: Send + Sync {
    fn source_id(&self) -> &str;

    /// At most `limit` summaries ordered by rank ascending.
    async fn fetch_summaries(
        &self,
        category: &Category,
        limit: usize,
    ) -> Result<Vec<RankedSummary>, SourceError>;

    async fn fetch_detail(&self, external_id: &str) -> Result<AthleteDetail, SourceError>;
}

/// One ranking row as published by the source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryEntry {
    #[serde(alias = "worldAthleticsId", deserialize_with = "deserialize_external_id")]
    pub id: String,
    pub rank: i32,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SummaryPayload {
    List(Vec<SummaryEntry>),
    Envelope { rankings: Vec<SummaryEntry> },
}

impl SummaryPayload {
    fn into_entries(self) -> Vec<SummaryEntry> {
        match self {
            SummaryPayload::List(entries) | SummaryPayload::Envelope { rankings: entries } => {
                entries
            }
        }
    }
}

/// Order entries by rank, keep the best rank for a repeated id, and cut at `limit`.
pub fn summaries_from_entries(
    category: &Category,
    mut entries: Vec<SummaryEntry>,
    limit: usize,
) -> Vec<RankedSummary> {
    entries.sort_by(|a, b| a.rank.cmp(&b.rank).then_with(|| a.id.cmp(&b.id)));
    let mut seen = std::collections::HashSet::new();
    entries
        .into_iter()
        .filter(|entry| !entry.id.is_empty() && seen.insert(entry.id.clone()))
        .take(limit)
        .map(|entry| RankedSummary {
            external_id: entry.id,
            rank: entry.rank,
            category_id: category.category_id.clone(),
        })
        .collect()
}

/// JSON-over-HTTP ranking API:
/// `GET {base}/rankings/{event}/{gender}?limit=N` and `GET {base}/athletes/{id}`.
#[derive(Debug, Clone)]
pub struct HttpRankingSource {
    http: HttpFetcher,
    base_url: String,
}

impl HttpRankingSource {
    pub fn new(http: HttpFetcher, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { http, base_url }
    }

    pub fn summaries_url(&self, category: &Category, limit: usize) -> String {
        format!(
            "{}/rankings/{}/{}?limit={limit}",
            self.base_url, category.event, category.gender
        )
    }

    pub fn detail_url(&self, external_id: &str) -> String {
        format!("{}/athletes/{external_id}", self.base_url)
    }
}

#[async_trait]
impl RankingSource for HttpRankingSource {
    fn source_id(&self) -> &str {
        "http"
    }

    async fn fetch_summaries(
        &self,
        category: &Category,
        limit: usize,
    ) -> Result<Vec<RankedSummary>, SourceError> {
        let payload: SummaryPayload = self
            .http
            .get_json(&self.summaries_url(category, limit))
            .await?;
        Ok(summaries_from_entries(category, payload.into_entries(), limit))
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<AthleteDetail, SourceError> {
        match self.http.get_json(&self.detail_url(external_id)).await {
            Ok(detail) => Ok(detail),
            Err(FetchError::HttpStatus { status: 404, .. }) => {
                Err(SourceError::NotFound(external_id.to_string()))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Captured ranking list and athlete payloads for one category.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureBundle {
    pub category_id: String,
    pub captured_at: DateTime<Utc>,
    pub rankings: Vec<SummaryEntry>,
    #[serde(default)]
    pub athletes: BTreeMap<String, AthleteDetail>,
}

pub fn load_fixture_bundle(path: &Path) -> Result<FixtureBundle> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading fixture bundle {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("parsing fixture bundle {}", path.display()))
}

pub fn bundle_path(fixtures_dir: &Path, category_id: &str) -> PathBuf {
    fixtures_dir.join(category_id).join("bundle.json")
}

/// Offline source serving `fixtures/<category_id>/bundle.json` files.
#[derive(Debug, Clone, Default)]
pub struct FixtureRankingSource {
    bundles: HashMap<String, FixtureBundle>,
    athletes: HashMap<String, AthleteDetail>,
}

impl FixtureRankingSource {
    /// Load the bundle of every enabled category.
    pub fn load(fixtures_dir: &Path, categories: &[Category]) -> Result<Self> {
        let mut source = Self::default();
        for category in categories.iter().filter(|c| c.enabled) {
            let bundle = load_fixture_bundle(&bundle_path(fixtures_dir, &category.category_id))?;
            if bundle.category_id != category.category_id {
                anyhow::bail!(
                    "fixture bundle for {} declares category {}",
                    category.category_id,
                    bundle.category_id
                );
            }
            source = source.with_bundle(bundle);
        }
        Ok(source)
    }

    pub fn with_bundle(mut self, bundle: FixtureBundle) -> Self {
        for (key, detail) in &bundle.athletes {
            let id = if detail.id.is_empty() { key } else { &detail.id };
            self.athletes.insert(id.clone(), detail.clone());
        }
        self.bundles.insert(bundle.category_id.clone(), bundle);
        self
    }

    pub fn bundle(&self, category_id: &str) -> Option<&FixtureBundle> {
        self.bundles.get(category_id)
    }
}

#[async_trait]
impl RankingSource for FixtureRankingSource {
    fn source_id(&self) -> &str {
        "fixtures"
    }

    async fn fetch_summaries(
        &self,
        category: &Category,
        limit: usize,
    ) -> Result<Vec<RankedSummary>, SourceError> {
        let bundle = self
            .bundles
            .get(&category.category_id)
            .ok_or_else(|| SourceError::UnknownCategory(category.category_id.clone()))?;
        Ok(summaries_from_entries(category, bundle.rankings.clone(), limit))
    }

    async fn fetch_detail(&self, external_id: &str) -> Result<AthleteDetail, SourceError> {
        self.athletes
            .get(external_id)
            .cloned()
            .ok_or_else(|| SourceError::NotFound(external_id.to_string()))
    }
}
