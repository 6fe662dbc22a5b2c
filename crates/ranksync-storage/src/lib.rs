//! Persistence, HTTP fetch and retry utilities for ranking sync.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ranksync_core::{AthleteWrite, Category, SnapshotRow};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::{Acquire, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "ranksync-storage";

/// Write `bytes` to `path` through a temp file in the same directory and an
/// atomic rename, replacing any previous content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(dir)
        .await
        .with_context(|| format!("creating directory {}", dir.display()))?;

    let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

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

/// Errors that know whether another attempt could succeed.
pub trait Retryable {
    fn disposition(&self) -> RetryDisposition;
}

/// Exponential backoff: attempt `n` (0-based) waits `initial_backoff * multiplier^n`,
/// capped at `max_backoff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    pub multiplier: u32,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_secs(2),
            multiplier: 2,
            max_backoff: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = u32::try_from(attempt_index)
            .ok()
            .and_then(|exp| self.multiplier.checked_pow(exp))
            .unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }

    /// Same shape with no waiting, for callers that must not sleep.
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            initial_backoff: Duration::ZERO,
            multiplier: 1,
            max_backoff: Duration::ZERO,
        }
    }
}

/// Run `attempt` until it succeeds, returns a non-retryable error, or the
/// policy's attempt budget is spent. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    mut attempt: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempts_made = 0usize;
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                attempts_made += 1;
                if err.disposition() == RetryDisposition::NonRetryable {
                    warn!(operation, attempt = attempts_made, error = %err, "non-retryable failure");
                    return Err(err);
                }
                if attempts_made >= max_attempts {
                    warn!(operation, attempts = attempts_made, error = %err, "retries exhausted");
                    return Err(err);
                }
                let delay = policy.delay_for_attempt(attempts_made - 1);
                warn!(
                    operation,
                    attempt = attempts_made,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "attempt failed, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            global_concurrency: 8,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl Retryable for FetchError {
    fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Decode { .. } => RetryDisposition::NonRetryable,
        }
    }
}

/// Single-attempt JSON client; retries belong to the call site's [`RetryPolicy`].
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
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
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let span = info_span!("http_fetch", method = "GET", url);
        async {
            let resp = self.client.get(url).send().await?;
            decode_response(resp).await
        }
        .instrument(span)
        .await
    }

    pub async fn post_json<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        body: &B,
    ) -> Result<T, FetchError> {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let span = info_span!("http_fetch", method = "POST", url);
        async {
            let mut request = self.client.post(url).json(body);
            for (name, value) in headers {
                request = request.header(*name, value.as_str());
            }
            let resp = request.send().await?;
            decode_response(resp).await
        }
        .instrument(span)
        .await
    }
}

async fn decode_response<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, FetchError> {
    let status = resp.status();
    let final_url = resp.url().to_string();
    if !status.is_success() {
        return Err(FetchError::HttpStatus {
            status: status.as_u16(),
            url: final_url,
        });
    }
    let body = resp.bytes().await?;
    serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
        url: final_url,
        source,
    })
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database connection lost: {0}")]
    Connection(#[source] sqlx::Error),
    #[error("database statement failed: {0}")]
    Statement(#[source] sqlx::Error),
    #[error("running migrations: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

impl StoreError {
    fn from_sqlx(err: sqlx::Error) -> Self {
        if is_item_level(&err) {
            StoreError::Statement(err)
        } else {
            StoreError::Connection(err)
        }
    }
}

/// Errors confined to one statement; the connection and transaction stay usable.
pub fn is_item_level(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(_) | sqlx::Error::Encode(_))
}

/// Result of one conditional upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
    Rejected(String),
}

impl UpsertOutcome {
    /// True when the row was materially written.
    pub fn is_write(&self) -> bool {
        matches!(self, UpsertOutcome::Inserted | UpsertOutcome::Updated)
    }
}

#[async_trait]
pub trait AthleteStore: Send + Sync {
    /// Persisted state for the given ids only; unknown ids are absent from the map.
    async fn load_snapshot(
        &self,
        external_ids: &[String],
    ) -> Result<HashMap<String, SnapshotRow>, StoreError>;

    /// Conditionally upsert one batch and commit it as a unit. Per-row
    /// statement failures come back as [`UpsertOutcome::Rejected`]; an `Err`
    /// means nothing from this batch was committed.
    async fn commit_batch(&self, rows: &[AthleteWrite]) -> Result<Vec<UpsertOutcome>, StoreError>;

    /// Clear the "currently ranked" marker for tracked rows of `category`
    /// missing from `current_ids`. Returns the number of rows cleared.
    async fn mark_dropped(&self, category: &Category, current_ids: &[String])
        -> Result<u64, StoreError>;

    /// Number of rows [`AthleteStore::mark_dropped`] would clear.
    async fn count_droppable(
        &self,
        category: &Category,
        current_ids: &[String],
    ) -> Result<u64, StoreError>;

    /// Set the marker again on rows of `category` present in `current_ids`
    /// whose marker was cleared earlier. Rank and hash are left alone.
    async fn restore_markers(
        &self,
        category: &Category,
        current_ids: &[String],
        seen_at: DateTime<Utc>,
    ) -> Result<u64, StoreError>;
}

const SNAPSHOT_SQL: &str = r"
    SELECT external_id, content_hash, rank, last_fetched_at, last_seen_at
    FROM athletes
    WHERE external_id = ANY($1)
";

const UPSERT_SQL: &str = r"
    INSERT INTO athletes (
        external_id, category_id, gender, ranking_source, rank, content_hash,
        name, country, date_of_birth, personal_best, season_best, headshot_url,
        sponsor, age, raw_json, last_fetched_at, last_seen_at, updated_at
    ) VALUES (
        $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $16, $16
    )
    ON CONFLICT (external_id) DO UPDATE SET
        category_id = EXCLUDED.category_id,
        gender = EXCLUDED.gender,
        ranking_source = EXCLUDED.ranking_source,
        rank = EXCLUDED.rank,
        content_hash = EXCLUDED.content_hash,
        name = EXCLUDED.name,
        country = EXCLUDED.country,
        date_of_birth = EXCLUDED.date_of_birth,
        personal_best = EXCLUDED.personal_best,
        season_best = EXCLUDED.season_best,
        headshot_url = EXCLUDED.headshot_url,
        sponsor = EXCLUDED.sponsor,
        age = EXCLUDED.age,
        raw_json = EXCLUDED.raw_json,
        last_fetched_at = EXCLUDED.last_fetched_at,
        last_seen_at = EXCLUDED.last_seen_at,
        updated_at = EXCLUDED.updated_at
    WHERE athletes.content_hash IS DISTINCT FROM EXCLUDED.content_hash
       OR athletes.rank IS DISTINCT FROM EXCLUDED.rank
    RETURNING (xmax = 0) AS inserted
";

const DROPPABLE_FILTER: &str = r"
    WHERE category_id = $1
      AND external_id <> ALL($2)
      AND last_seen_at IS NOT NULL
      AND rank IS NOT NULL
      AND rank <= $3
";

#[derive(Debug, Clone)]
pub struct PgAthleteStore {
    pool: PgPool,
}

impl PgAthleteStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(30))
            .connect(database_url)
            .await
            .map_err(StoreError::Connection)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }
}

async fn upsert_athlete(
    conn: &mut PgConnection,
    row: &AthleteWrite,
) -> Result<UpsertOutcome, sqlx::Error> {
    let returned = sqlx::query(UPSERT_SQL)
        .bind(&row.external_id)
        .bind(&row.category_id)
        .bind(&row.gender)
        .bind(&row.ranking_source)
        .bind(row.rank)
        .bind(&row.content_hash)
        .bind(&row.name)
        .bind(&row.country)
        .bind(&row.date_of_birth)
        .bind(&row.personal_best)
        .bind(&row.season_best)
        .bind(&row.headshot_url)
        .bind(&row.sponsor)
        .bind(row.age)
        .bind(sqlx::types::Json(&row.raw_json))
        .bind(row.fetched_at)
        .fetch_optional(&mut *conn)
        .await?;

    // no row back means the WHERE guard skipped the update
    let Some(returned) = returned else {
        return Ok(UpsertOutcome::Unchanged);
    };
    let inserted: bool = returned.try_get("inserted")?;
    Ok(if inserted {
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Updated
    })
}

#[async_trait]
impl AthleteStore for PgAthleteStore {
    async fn load_snapshot(
        &self,
        external_ids: &[String],
    ) -> Result<HashMap<String, SnapshotRow>, StoreError> {
        if external_ids.is_empty() {
            return Ok(HashMap::new());
        }
        let rows = sqlx::query(SNAPSHOT_SQL)
            .bind(external_ids)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;

        let mut snapshot = HashMap::with_capacity(rows.len());
        for row in rows {
            let external_id: String = row.try_get("external_id").map_err(StoreError::Statement)?;
            snapshot.insert(
                external_id,
                SnapshotRow {
                    content_hash: row.try_get("content_hash").map_err(StoreError::Statement)?,
                    rank: row.try_get("rank").map_err(StoreError::Statement)?,
                    last_fetched_at: row.try_get("last_fetched_at").map_err(StoreError::Statement)?,
                    last_seen_at: row.try_get("last_seen_at").map_err(StoreError::Statement)?,
                },
            );
        }
        Ok(snapshot)
    }

    async fn commit_batch(&self, rows: &[AthleteWrite]) -> Result<Vec<UpsertOutcome>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::Connection)?;
        let mut outcomes = Vec::with_capacity(rows.len());

        for row in rows {
            // per-row savepoint so one rejected row does not poison the batch
            let mut savepoint = Acquire::begin(&mut tx)
                .await
                .map_err(StoreError::Connection)?;
            match upsert_athlete(&mut savepoint, row).await {
                Ok(outcome) => {
                    savepoint.commit().await.map_err(StoreError::Connection)?;
                    debug!(external_id = %row.external_id, ?outcome, "upsert applied");
                    outcomes.push(outcome);
                }
                Err(err) if is_item_level(&err) => {
                    warn!(external_id = %row.external_id, error = %err, "upsert rejected");
                    savepoint.rollback().await.map_err(StoreError::Connection)?;
                    outcomes.push(UpsertOutcome::Rejected(err.to_string()));
                }
                Err(err) => return Err(StoreError::Connection(err)),
            }
        }

        tx.commit().await.map_err(StoreError::Connection)?;
        Ok(outcomes)
    }

    async fn mark_dropped(
        &self,
        category: &Category,
        current_ids: &[String],
    ) -> Result<u64, StoreError> {
        let sql = format!(
            "UPDATE athletes SET last_seen_at = NULL, updated_at = NOW() {DROPPABLE_FILTER}"
        );
        let result = sqlx::query(&sql)
            .bind(&category.category_id)
            .bind(current_ids)
            .bind(category.tracked_window())
            .execute(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        Ok(result.rows_affected())
    }

    async fn count_droppable(
        &self,
        category: &Category,
        current_ids: &[String],
    ) -> Result<u64, StoreError> {
        let sql = format!("SELECT COUNT(*) AS droppable FROM athletes {DROPPABLE_FILTER}");
        let row = sqlx::query(&sql)
            .bind(&category.category_id)
            .bind(current_ids)
            .bind(category.tracked_window())
            .fetch_one(&self.pool)
            .await
            .map_err(StoreError::from_sqlx)?;
        let count: i64 = row.try_get("droppable").map_err(StoreError::Statement)?;
        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn restore_markers(
        &self,
        category: &Category,
        current_ids: &[String],
        seen_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let result = sqlx::query(
            r"
            UPDATE athletes SET last_seen_at = $3, updated_at = $3
            WHERE category_id = $1
              AND external_id = ANY($2)
              AND last_seen_at IS NULL
            ",
        )
        .bind(&category.category_id)
        .bind(current_ids)
        .bind(seen_at)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from_sqlx)?;
        Ok(result.rows_affected())
    }
}

/// Row kept by [`MemoryAthleteStore`].
#[derive(Debug, Clone, PartialEq)]
pub struct StoredAthlete {
    pub external_id: String,
    pub category_id: String,
    pub snapshot: SnapshotRow,
    pub last_write: Option<AthleteWrite>,
}

impl StoredAthlete {
    pub fn new(
        external_id: impl Into<String>,
        category_id: impl Into<String>,
        snapshot: SnapshotRow,
    ) -> Self {
        Self {
            external_id: external_id.into(),
            category_id: category_id.into(),
            snapshot,
            last_write: None,
        }
    }
}

/// In-process store with the same conditional-write rules as the Postgres
/// store. Backs fixture runs and the pipeline tests.
#[derive(Debug, Default)]
pub struct MemoryAthleteStore {
    rows: Mutex<HashMap<String, StoredAthlete>>,
}

impl MemoryAthleteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: impl IntoIterator<Item = StoredAthlete>) -> Self {
        Self {
            rows: Mutex::new(
                rows.into_iter()
                    .map(|row| (row.external_id.clone(), row))
                    .collect(),
            ),
        }
    }

    pub async fn get(&self, external_id: &str) -> Option<StoredAthlete> {
        self.rows.lock().await.get(external_id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    fn is_droppable(row: &StoredAthlete, category: &Category, current: &HashSet<&str>) -> bool {
        row.category_id == category.category_id
            && !current.contains(row.external_id.as_str())
            && row.snapshot.last_seen_at.is_some()
            && row
                .snapshot
                .rank
                .is_some_and(|rank| rank <= category.tracked_window())
    }
}

#[async_trait]
impl AthleteStore for MemoryAthleteStore {
    async fn load_snapshot(
        &self,
        external_ids: &[String],
    ) -> Result<HashMap<String, SnapshotRow>, StoreError> {
        let rows = self.rows.lock().await;
        Ok(external_ids
            .iter()
            .filter_map(|id| rows.get(id).map(|row| (id.clone(), row.snapshot.clone())))
            .collect())
    }

    async fn commit_batch(&self, rows: &[AthleteWrite]) -> Result<Vec<UpsertOutcome>, StoreError> {
        let mut stored = self.rows.lock().await;
        let mut outcomes = Vec::with_capacity(rows.len());
        for write in rows {
            let fresh = SnapshotRow {
                content_hash: Some(write.content_hash.clone()),
                rank: Some(write.rank),
                last_fetched_at: Some(write.fetched_at),
                last_seen_at: Some(write.fetched_at),
            };
            let outcome = match stored.get_mut(&write.external_id) {
                None => {
                    let mut row =
                        StoredAthlete::new(&write.external_id, &write.category_id, fresh);
                    row.last_write = Some(write.clone());
                    stored.insert(write.external_id.clone(), row);
                    UpsertOutcome::Inserted
                }
                Some(row)
                    if row.snapshot.content_hash.as_deref() != Some(write.content_hash.as_str())
                        || row.snapshot.rank != Some(write.rank) =>
                {
                    row.category_id = write.category_id.clone();
                    row.snapshot = fresh;
                    row.last_write = Some(write.clone());
                    UpsertOutcome::Updated
                }
                Some(_) => UpsertOutcome::Unchanged,
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    async fn mark_dropped(
        &self,
        category: &Category,
        current_ids: &[String],
    ) -> Result<u64, StoreError> {
        let current: HashSet<&str> = current_ids.iter().map(String::as_str).collect();
        let mut rows = self.rows.lock().await;
        let mut cleared = 0u64;
        for row in rows.values_mut() {
            if Self::is_droppable(row, category, &current) {
                row.snapshot.last_seen_at = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn count_droppable(
        &self,
        category: &Category,
        current_ids: &[String],
    ) -> Result<u64, StoreError> {
        let current: HashSet<&str> = current_ids.iter().map(String::as_str).collect();
        let rows = self.rows.lock().await;
        Ok(rows
            .values()
            .filter(|row| Self::is_droppable(row, category, &current))
            .count() as u64)
    }

    async fn restore_markers(
        &self,
        category: &Category,
        current_ids: &[String],
        seen_at: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut rows = self.rows.lock().await;
        let mut restored = 0u64;
        for id in current_ids {
            if let Some(row) = rows.get_mut(id) {
                if row.category_id == category.category_id && row.snapshot.last_seen_at.is_none() {
                    row.snapshot.last_seen_at = Some(seen_at);
                    restored += 1;
                }
            }
        }
        Ok(restored)
    }
}
