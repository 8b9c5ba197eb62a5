//! HTTP fetch stack, debug page snapshots and catalog persistence for
//! Mirador.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::info_span;
use uuid::Uuid;

use mirador_core::{
    KeywordRecord, ListingRecord, MatchResultRecord, Portal, SearchFilters, SearchHandle,
    SearchRecord,
};

pub const CRATE_NAME: &str = "mirador-storage";

/// Environment-driven storage settings.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub database_url: Option<String>,
    pub snapshot_dir: PathBuf,
    /// Token-bucket request budget; rate limiting is off unless both knobs
    /// are set.
    pub rate_capacity: Option<u32>,
    pub rate_refill_ms: Option<u64>,
}

impl StorageConfig {
    pub fn from_env() -> Self {
        let database_url = std::env::var("MIRADOR_DATABASE_URL")
            .or_else(|_| std::env::var("DATABASE_URL"))
            .ok()
            .filter(|v| !v.trim().is_empty());
        let snapshot_dir = std::env::var("MIRADOR_SNAPSHOT_DIR")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("snapshots"));
        Self {
            database_url,
            snapshot_dir,
            rate_capacity: std::env::var("MIRADOR_RATE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok()),
            rate_refill_ms: std::env::var("MIRADOR_RATE_REFILL_MS")
                .ok()
                .and_then(|v| v.parse().ok()),
        }
    }

    pub fn token_bucket(&self) -> Option<TokenBucketConfig> {
        match (self.rate_capacity, self.rate_refill_ms) {
            (Some(capacity), Some(refill_ms)) if capacity > 0 => Some(TokenBucketConfig {
                capacity,
                refill_every: Duration::from_millis(refill_ms),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Hash-addressed store for raw page captures taken when extraction fails.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(
        &self,
        captured_at: DateTime<Utc>,
        portal_tag: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = captured_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(portal_tag)
            .join(format!("{content_hash}.html"))
    }

    /// Store page bytes immutably using a hash-addressed path and atomic
    /// temp-file rename.
    pub async fn store_page(
        &self,
        captured_at: DateTime<Utc>,
        portal_tag: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.snapshot_relative_path(captured_at, portal_tag, &content_hash);
        let absolute_path = self.root.join(&relative_path);

        if let Some(parent) = absolute_path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating snapshot directory {}", parent.display()))?;
        }

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: true,
            });
        }

        let temp_name = format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len());
        let temp_path = absolute_path
            .parent()
            .expect("snapshot path always has parent")
            .join(temp_name);

        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(StoredSnapshot {
                content_hash,
                relative_path,
                absolute_path,
                byte_size: bytes.len(),
                deduplicated: false,
            }),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(StoredSnapshot {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    deduplicated: true,
                })
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "atomically renaming temp snapshot {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
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

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_portal_concurrency: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 16,
            per_portal_concurrency: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_portal_limit: usize,
    per_portal: Mutex<HashMap<String, Arc<Semaphore>>>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_portal_limit: config.per_portal_concurrency.max(1),
            per_portal: Mutex::new(HashMap::new()),
            token_bucket,
            backoff: config.backoff,
        })
    }

    async fn per_portal_semaphore(&self, portal_tag: &str) -> Arc<Semaphore> {
        let mut map = self.per_portal.lock().await;
        map.entry(portal_tag.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_portal_limit)))
            .clone()
    }

    /// Quick reachability probe against a portal's base URL.
    pub async fn probe(&self, url: &str, timeout: Duration) -> bool {
        matches!(
            self.client.get(url).timeout(timeout).send().await,
            Ok(resp) if !resp.status().is_server_error()
        )
    }

    pub async fn fetch_bytes(
        &self,
        portal_tag: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.expect("semaphore not closed");
        let per_portal = self.per_portal_semaphore(portal_tag).await;
        let _portal = per_portal.acquire().await.expect("semaphore not closed");

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", portal_tag, url);
        let _guard = span.enter();

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let disposition = classify_status(status);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    let disposition = classify_reqwest_error(&err);
                    if disposition == RetryDisposition::Retryable && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

/// Cached per-(keyword, listing) verdict so refreshes skip re-evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeywordVerdict {
    pub matches: bool,
    pub matched_variant: Option<String>,
    pub rule: Option<String>,
}

/// Aggregate counters for the analytics surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SearchStats {
    pub searches: u64,
    pub saved_searches: u64,
    pub keywords: u64,
    pub listings: u64,
    pub match_results: u64,
    pub positive_match_results: u64,
}

/// Persistence seam for searches, keywords, listings and verdicts.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn create_search(&self, record: &SearchRecord) -> anyhow::Result<()>;
    async fn get_search(&self, id: SearchHandle) -> anyhow::Result<Option<SearchRecord>>;
    async fn saved_searches(&self) -> anyhow::Result<Vec<SearchRecord>>;
    async fn set_search_saved(&self, id: SearchHandle, saved: bool) -> anyhow::Result<()>;
    async fn touch_last_refresh(&self, id: SearchHandle, at: DateTime<Utc>) -> anyhow::Result<()>;

    async fn get_or_create_keyword(&self, record: &KeywordRecord) -> anyhow::Result<()>;
    async fn link_search_keyword(
        &self,
        search_id: SearchHandle,
        canonical_text: &str,
    ) -> anyhow::Result<()>;
    async fn keywords_for_search(&self, search_id: SearchHandle)
        -> anyhow::Result<Vec<KeywordRecord>>;

    /// Upsert with merge semantics: last non-empty wins per field.
    async fn upsert_listing(&self, record: &ListingRecord) -> anyhow::Result<()>;
    /// Subset of `urls` that already exist in the catalog.
    async fn known_urls(&self, urls: &[String]) -> anyhow::Result<BTreeSet<String>>;
    async fn listings_by_urls(&self, urls: &[String]) -> anyhow::Result<Vec<ListingRecord>>;

    /// Insert with `seen_count = 1`, or update verdict/timestamp and bump
    /// `seen_count` when the (search, listing) pair exists.
    async fn upsert_match_result(
        &self,
        search_id: SearchHandle,
        canonical_url: &str,
        matches: bool,
        at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()>;
    async fn match_results_for_search(
        &self,
        search_id: SearchHandle,
    ) -> anyhow::Result<Vec<MatchResultRecord>>;

    async fn keyword_verdict(
        &self,
        canonical_text: &str,
        canonical_url: &str,
    ) -> anyhow::Result<Option<KeywordVerdict>>;
    async fn record_keyword_verdict(
        &self,
        canonical_text: &str,
        canonical_url: &str,
        verdict: &KeywordVerdict,
    ) -> anyhow::Result<()>;

    async fn stats(&self) -> anyhow::Result<SearchStats>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    searches: BTreeMap<SearchHandle, SearchRecord>,
    keywords: BTreeMap<String, KeywordRecord>,
    search_keywords: BTreeMap<SearchHandle, Vec<String>>,
    listings: BTreeMap<String, ListingRecord>,
    match_results: BTreeMap<(SearchHandle, String), MatchResultRecord>,
    keyword_listings: BTreeMap<(String, String), KeywordVerdict>,
}

/// In-memory catalog; the production trait surface over plain maps, used by
/// tests and keyword-less demo runs.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: std::sync::Mutex<MemoryInner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }
}

fn merge_listing(existing: &mut ListingRecord, incoming: &ListingRecord) {
    if let Some(title) = &incoming.title {
        if !title.trim().is_empty() {
            existing.title = Some(title.clone());
        }
    }
    if !incoming.description.trim().is_empty() {
        existing.description = incoming.description.clone();
    }
    existing.attributes.merge_from(&incoming.attributes);
}

#[async_trait]
impl CatalogStore for MemoryCatalog {
    async fn create_search(&self, record: &SearchRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("catalog mutex poisoned");
        inner.searches.insert(record.id, record.clone());
        Ok(())
    }

    async fn get_search(&self, id: SearchHandle) -> anyhow::Result<Option<SearchRecord>> {
        let inner = self.inner.lock().expect("catalog mutex poisoned");
        Ok(inner.searches.get(&id).cloned())
    }

    async fn saved_searches(&self) -> anyhow::Result<Vec<SearchRecord>> {
        let inner = self.inner.lock().expect("catalog mutex poisoned");
        Ok(inner
            .searches
            .values()
            .filter(|s| s.is_saved)
            .cloned()
            .collect())
    }

    async fn set_search_saved(&self, id: SearchHandle, saved: bool) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("catalog mutex poisoned");
        if let Some(search) = inner.searches.get_mut(&id) {
            search.is_saved = saved;
        }
        Ok(())
    }

    async fn touch_last_refresh(&self, id: SearchHandle, at: DateTime<Utc>) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("catalog mutex poisoned");
        if let Some(search) = inner.searches.get_mut(&id) {
            search.last_refresh_at = Some(at);
        }
        Ok(())
    }

    async fn get_or_create_keyword(&self, record: &KeywordRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("catalog mutex poisoned");
        inner
            .keywords
            .entry(record.canonical_text.clone())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn link_search_keyword(
        &self,
        search_id: SearchHandle,
        canonical_text: &str,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("catalog mutex poisoned");
        let linked = inner.search_keywords.entry(search_id).or_default();
        if !linked.iter().any(|t| t == canonical_text) {
            linked.push(canonical_text.to_string());
        }
        Ok(())
    }

    async fn keywords_for_search(
        &self,
        search_id: SearchHandle,
    ) -> anyhow::Result<Vec<KeywordRecord>> {
        let inner = self.inner.lock().expect("catalog mutex poisoned");
        let linked = inner.search_keywords.get(&search_id).cloned().unwrap_or_default();
        Ok(linked
            .iter()
            .filter_map(|text| inner.keywords.get(text).cloned())
            .collect())
    }

    async fn upsert_listing(&self, record: &ListingRecord) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("catalog mutex poisoned");
        match inner.listings.get_mut(&record.canonical_url) {
            Some(existing) => merge_listing(existing, record),
            None => {
                inner
                    .listings
                    .insert(record.canonical_url.clone(), record.clone());
            }
        }
        Ok(())
    }

    async fn known_urls(&self, urls: &[String]) -> anyhow::Result<BTreeSet<String>> {
        let inner = self.inner.lock().expect("catalog mutex poisoned");
        Ok(urls
            .iter()
            .filter(|u| inner.listings.contains_key(*u))
            .cloned()
            .collect())
    }

    async fn listings_by_urls(&self, urls: &[String]) -> anyhow::Result<Vec<ListingRecord>> {
        let inner = self.inner.lock().expect("catalog mutex poisoned");
        Ok(urls
            .iter()
            .filter_map(|u| inner.listings.get(u).cloned())
            .collect())
    }

    async fn upsert_match_result(
        &self,
        search_id: SearchHandle,
        canonical_url: &str,
        matches: bool,
        at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("catalog mutex poisoned");
        let key = (search_id, canonical_url.to_string());
        match inner.match_results.get_mut(&key) {
            Some(existing) => {
                existing.matches = matches;
                existing.last_seen_at = at;
                existing.seen_count = existing.seen_count.saturating_add(1);
                existing.metadata = metadata;
            }
            None => {
                inner.match_results.insert(
                    key,
                    MatchResultRecord {
                        search_id,
                        canonical_url: canonical_url.to_string(),
                        matches,
                        last_seen_at: at,
                        seen_count: 1,
                        metadata,
                    },
                );
            }
        }
        Ok(())
    }

    async fn match_results_for_search(
        &self,
        search_id: SearchHandle,
    ) -> anyhow::Result<Vec<MatchResultRecord>> {
        let inner = self.inner.lock().expect("catalog mutex poisoned");
        Ok(inner
            .match_results
            .values()
            .filter(|r| r.search_id == search_id)
            .cloned()
            .collect())
    }

    async fn keyword_verdict(
        &self,
        canonical_text: &str,
        canonical_url: &str,
    ) -> anyhow::Result<Option<KeywordVerdict>> {
        let inner = self.inner.lock().expect("catalog mutex poisoned");
        Ok(inner
            .keyword_listings
            .get(&(canonical_text.to_string(), canonical_url.to_string()))
            .cloned())
    }

    async fn record_keyword_verdict(
        &self,
        canonical_text: &str,
        canonical_url: &str,
        verdict: &KeywordVerdict,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().expect("catalog mutex poisoned");
        inner.keyword_listings.insert(
            (canonical_text.to_string(), canonical_url.to_string()),
            verdict.clone(),
        );
        Ok(())
    }

    async fn stats(&self) -> anyhow::Result<SearchStats> {
        let inner = self.inner.lock().expect("catalog mutex poisoned");
        Ok(SearchStats {
            searches: inner.searches.len() as u64,
            saved_searches: inner.searches.values().filter(|s| s.is_saved).count() as u64,
            keywords: inner.keywords.len() as u64,
            listings: inner.listings.len() as u64,
            match_results: inner.match_results.len() as u64,
            positive_match_results: inner.match_results.values().filter(|r| r.matches).count()
                as u64,
        })
    }
}

fn portal_tag(portal: Portal) -> &'static str {
    match portal {
        Portal::MercadoLibre => "mercado_libre",
        Portal::InfoCasas => "info_casas",
    }
}

fn portal_from_tag(tag: &str) -> anyhow::Result<Portal> {
    match tag {
        "mercado_libre" => Ok(Portal::MercadoLibre),
        "info_casas" => Ok(Portal::InfoCasas),
        other => anyhow::bail!("unknown portal tag {other:?}"),
    }
}

/// Postgres-backed catalog with `ON CONFLICT` upserts.
#[derive(Debug, Clone)]
pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(8)
            .connect(database_url)
            .await
            .context("connecting to catalog database")?;
        let catalog = Self { pool };
        catalog.ensure_schema().await?;
        Ok(catalog)
    }

    pub async fn ensure_schema(&self) -> anyhow::Result<()> {
        for statement in [
            r#"
            CREATE TABLE IF NOT EXISTS searches (
                id UUID PRIMARY KEY,
                name TEXT,
                original_text TEXT NOT NULL,
                filters_json JSONB NOT NULL,
                is_saved BOOLEAN NOT NULL DEFAULT FALSE,
                created_at TIMESTAMPTZ NOT NULL,
                last_refresh_at TIMESTAMPTZ
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS keywords (
                canonical_text TEXT PRIMARY KEY,
                language TEXT NOT NULL,
                variants_json JSONB NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS search_keywords (
                search_id UUID NOT NULL REFERENCES searches(id),
                canonical_text TEXT NOT NULL REFERENCES keywords(canonical_text),
                PRIMARY KEY (search_id, canonical_text)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                canonical_url TEXT PRIMARY KEY,
                portal TEXT NOT NULL,
                title TEXT,
                description TEXT NOT NULL,
                attributes_json JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS match_results (
                search_id UUID NOT NULL,
                canonical_url TEXT NOT NULL,
                matches BOOLEAN NOT NULL,
                last_seen_at TIMESTAMPTZ NOT NULL,
                seen_count INTEGER NOT NULL,
                metadata_json JSONB NOT NULL,
                PRIMARY KEY (search_id, canonical_url)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS keyword_listings (
                canonical_text TEXT NOT NULL,
                canonical_url TEXT NOT NULL,
                matches BOOLEAN NOT NULL,
                matched_variant TEXT,
                rule TEXT,
                PRIMARY KEY (canonical_text, canonical_url)
            )
            "#,
        ] {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("bootstrapping catalog schema")?;
        }
        Ok(())
    }

    fn row_to_search(row: &sqlx::postgres::PgRow) -> anyhow::Result<SearchRecord> {
        let filters_json: serde_json::Value = row.try_get("filters_json")?;
        let (filters, _unknown) = SearchFilters::from_json(&filters_json);
        Ok(SearchRecord {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            original_text: row.try_get("original_text")?,
            filters,
            is_saved: row.try_get("is_saved")?,
            created_at: row.try_get("created_at")?,
            last_refresh_at: row.try_get("last_refresh_at")?,
        })
    }

    fn row_to_listing(row: &sqlx::postgres::PgRow) -> anyhow::Result<ListingRecord> {
        let portal: String = row.try_get("portal")?;
        let attributes_json: serde_json::Value = row.try_get("attributes_json")?;
        Ok(ListingRecord {
            canonical_url: row.try_get("canonical_url")?,
            portal: portal_from_tag(&portal)?,
            title: row.try_get("title")?,
            description: row.try_get("description")?,
            attributes: serde_json::from_value(attributes_json)
                .context("decoding listing attributes")?,
        })
    }
}

#[async_trait]
impl CatalogStore for PgCatalog {
    async fn create_search(&self, record: &SearchRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO searches (id, name, original_text, filters_json, is_saved, created_at, last_refresh_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                original_text = EXCLUDED.original_text,
                filters_json = EXCLUDED.filters_json,
                is_saved = EXCLUDED.is_saved
            "#,
        )
        .bind(record.id)
        .bind(&record.name)
        .bind(&record.original_text)
        .bind(serde_json::to_value(&record.filters).context("encoding filters")?)
        .bind(record.is_saved)
        .bind(record.created_at)
        .bind(record.last_refresh_at)
        .execute(&self.pool)
        .await
        .context("inserting search")?;
        Ok(())
    }

    async fn get_search(&self, id: SearchHandle) -> anyhow::Result<Option<SearchRecord>> {
        let row = sqlx::query("SELECT * FROM searches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("loading search")?;
        row.as_ref().map(Self::row_to_search).transpose()
    }

    async fn saved_searches(&self) -> anyhow::Result<Vec<SearchRecord>> {
        let rows = sqlx::query("SELECT * FROM searches WHERE is_saved ORDER BY created_at")
            .fetch_all(&self.pool)
            .await
            .context("loading saved searches")?;
        rows.iter().map(Self::row_to_search).collect()
    }

    async fn set_search_saved(&self, id: SearchHandle, saved: bool) -> anyhow::Result<()> {
        sqlx::query("UPDATE searches SET is_saved = $2 WHERE id = $1")
            .bind(id)
            .bind(saved)
            .execute(&self.pool)
            .await
            .context("updating is_saved")?;
        Ok(())
    }

    async fn touch_last_refresh(&self, id: SearchHandle, at: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("UPDATE searches SET last_refresh_at = $2 WHERE id = $1")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .context("updating last_refresh_at")?;
        Ok(())
    }

    async fn get_or_create_keyword(&self, record: &KeywordRecord) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO keywords (canonical_text, language, variants_json)
            VALUES ($1, $2, $3)
            ON CONFLICT (canonical_text) DO NOTHING
            "#,
        )
        .bind(&record.canonical_text)
        .bind(&record.language)
        .bind(serde_json::to_value(&record.variants).context("encoding variants")?)
        .execute(&self.pool)
        .await
        .context("inserting keyword")?;
        Ok(())
    }

    async fn link_search_keyword(
        &self,
        search_id: SearchHandle,
        canonical_text: &str,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO search_keywords (search_id, canonical_text)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(search_id)
        .bind(canonical_text)
        .execute(&self.pool)
        .await
        .context("linking search keyword")?;
        Ok(())
    }

    async fn keywords_for_search(
        &self,
        search_id: SearchHandle,
    ) -> anyhow::Result<Vec<KeywordRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT k.canonical_text, k.language, k.variants_json
              FROM keywords k
              JOIN search_keywords sk ON sk.canonical_text = k.canonical_text
             WHERE sk.search_id = $1
             ORDER BY k.canonical_text
            "#,
        )
        .bind(search_id)
        .fetch_all(&self.pool)
        .await
        .context("loading search keywords")?;

        rows.iter()
            .map(|row| {
                let variants_json: serde_json::Value = row.try_get("variants_json")?;
                Ok(KeywordRecord {
                    canonical_text: row.try_get("canonical_text")?,
                    language: row.try_get("language")?,
                    variants: serde_json::from_value(variants_json)
                        .context("decoding keyword variants")?,
                })
            })
            .collect()
    }

    async fn upsert_listing(&self, record: &ListingRecord) -> anyhow::Result<()> {
        // Read-merge-write in one transaction under a per-URL advisory lock;
        // concurrent writers for the same URL merge in sequence.
        let mut tx = self.pool.begin().await.context("starting listing upsert")?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(&record.canonical_url)
            .execute(&mut *tx)
            .await
            .context("locking listing url")?;

        let existing = sqlx::query("SELECT * FROM listings WHERE canonical_url = $1")
            .bind(&record.canonical_url)
            .fetch_optional(&mut *tx)
            .await
            .context("loading listing for merge")?;

        // Merge happens in Rust so the policy matches the in-memory catalog.
        let merged = match existing {
            Some(row) => {
                let mut current = Self::row_to_listing(&row)?;
                merge_listing(&mut current, record);
                current
            }
            None => record.clone(),
        };

        sqlx::query(
            r#"
            INSERT INTO listings (canonical_url, portal, title, description, attributes_json, updated_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            ON CONFLICT (canonical_url) DO UPDATE SET
                title = EXCLUDED.title,
                description = EXCLUDED.description,
                attributes_json = EXCLUDED.attributes_json,
                updated_at = NOW()
            "#,
        )
        .bind(&merged.canonical_url)
        .bind(portal_tag(merged.portal))
        .bind(&merged.title)
        .bind(&merged.description)
        .bind(serde_json::to_value(&merged.attributes).context("encoding attributes")?)
        .execute(&mut *tx)
        .await
        .context("upserting listing")?;
        tx.commit().await.context("committing listing upsert")?;
        Ok(())
    }

    async fn known_urls(&self, urls: &[String]) -> anyhow::Result<BTreeSet<String>> {
        if urls.is_empty() {
            return Ok(BTreeSet::new());
        }
        let rows = sqlx::query("SELECT canonical_url FROM listings WHERE canonical_url = ANY($1)")
            .bind(urls)
            .fetch_all(&self.pool)
            .await
            .context("checking known urls")?;
        rows.iter()
            .map(|row| Ok(row.try_get::<String, _>("canonical_url")?))
            .collect()
    }

    async fn listings_by_urls(&self, urls: &[String]) -> anyhow::Result<Vec<ListingRecord>> {
        if urls.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query("SELECT * FROM listings WHERE canonical_url = ANY($1)")
            .bind(urls)
            .fetch_all(&self.pool)
            .await
            .context("loading listings")?;
        rows.iter().map(Self::row_to_listing).collect()
    }

    async fn upsert_match_result(
        &self,
        search_id: SearchHandle,
        canonical_url: &str,
        matches: bool,
        at: DateTime<Utc>,
        metadata: serde_json::Value,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO match_results (search_id, canonical_url, matches, last_seen_at, seen_count, metadata_json)
            VALUES ($1, $2, $3, $4, 1, $5)
            ON CONFLICT (search_id, canonical_url) DO UPDATE SET
                matches = EXCLUDED.matches,
                last_seen_at = EXCLUDED.last_seen_at,
                seen_count = match_results.seen_count + 1,
                metadata_json = EXCLUDED.metadata_json
            "#,
        )
        .bind(search_id)
        .bind(canonical_url)
        .bind(matches)
        .bind(at)
        .bind(metadata)
        .execute(&self.pool)
        .await
        .context("upserting match result")?;
        Ok(())
    }

    async fn match_results_for_search(
        &self,
        search_id: SearchHandle,
    ) -> anyhow::Result<Vec<MatchResultRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM match_results WHERE search_id = $1 ORDER BY canonical_url",
        )
        .bind(search_id)
        .fetch_all(&self.pool)
        .await
        .context("loading match results")?;

        rows.iter()
            .map(|row| {
                let seen_count: i32 = row.try_get("seen_count")?;
                Ok(MatchResultRecord {
                    search_id: row.try_get("search_id")?,
                    canonical_url: row.try_get("canonical_url")?,
                    matches: row.try_get("matches")?,
                    last_seen_at: row.try_get("last_seen_at")?,
                    seen_count: seen_count.max(0) as u32,
                    metadata: row.try_get("metadata_json")?,
                })
            })
            .collect()
    }

    async fn keyword_verdict(
        &self,
        canonical_text: &str,
        canonical_url: &str,
    ) -> anyhow::Result<Option<KeywordVerdict>> {
        let row = sqlx::query(
            r#"
            SELECT matches, matched_variant, rule
              FROM keyword_listings
             WHERE canonical_text = $1 AND canonical_url = $2
            "#,
        )
        .bind(canonical_text)
        .bind(canonical_url)
        .fetch_optional(&self.pool)
        .await
        .context("loading keyword verdict")?;

        row.map(|row| {
            Ok(KeywordVerdict {
                matches: row.try_get("matches")?,
                matched_variant: row.try_get("matched_variant")?,
                rule: row.try_get("rule")?,
            })
        })
        .transpose()
    }

    async fn record_keyword_verdict(
        &self,
        canonical_text: &str,
        canonical_url: &str,
        verdict: &KeywordVerdict,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO keyword_listings (canonical_text, canonical_url, matches, matched_variant, rule)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (canonical_text, canonical_url) DO UPDATE SET
                matches = EXCLUDED.matches,
                matched_variant = EXCLUDED.matched_variant,
                rule = EXCLUDED.rule
            "#,
        )
        .bind(canonical_text)
        .bind(canonical_url)
        .bind(verdict.matches)
        .bind(&verdict.matched_variant)
        .bind(&verdict.rule)
        .execute(&self.pool)
        .await
        .context("recording keyword verdict")?;
        Ok(())
    }

    async fn stats(&self) -> anyhow::Result<SearchStats> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM searches) AS searches,
                (SELECT COUNT(*) FROM searches WHERE is_saved) AS saved_searches,
                (SELECT COUNT(*) FROM keywords) AS keywords,
                (SELECT COUNT(*) FROM listings) AS listings,
                (SELECT COUNT(*) FROM match_results) AS match_results,
                (SELECT COUNT(*) FROM match_results WHERE matches) AS positive_match_results
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .context("loading catalog stats")?;

        let get = |name: &str| -> anyhow::Result<u64> {
            let v: i64 = row.try_get(name)?;
            Ok(v.max(0) as u64)
        };
        Ok(SearchStats {
            searches: get("searches")?,
            saved_searches: get("saved_searches")?,
            keywords: get("keywords")?,
            listings: get("listings")?,
            match_results: get("match_results")?,
            positive_match_results: get("positive_match_results")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mirador_core::ListingAttributes;
    use tempfile::tempdir;

    fn listing(url: &str, title: Option<&str>, description: &str) -> ListingRecord {
        ListingRecord {
            canonical_url: url.to_string(),
            portal: Portal::MercadoLibre,
            title: title.map(str::to_string),
            description: description.to_string(),
            attributes: ListingAttributes::default(),
        }
    }

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn atomic_writes_deduplicate_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let store = SnapshotStore::new(dir.path());
        let captured_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_page(captured_at, "mercado_libre", b"<html>same</html>")
            .await
            .expect("first store");
        let second = store
            .store_page(captured_at, "mercado_libre", b"<html>same</html>")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.content_hash, second.content_hash);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.absolute_path.exists());
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn listing_upsert_merges_nonempty_fields() {
        let catalog = MemoryCatalog::new();
        catalog
            .upsert_listing(&listing("https://x.uy/MLU-1", Some("Apto Pocitos"), "Con terraza"))
            .await
            .unwrap();
        // Second sighting without a title must not erase the stored one.
        catalog
            .upsert_listing(&listing("https://x.uy/MLU-1", None, ""))
            .await
            .unwrap();

        let stored = catalog
            .listings_by_urls(&["https://x.uy/MLU-1".to_string()])
            .await
            .unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title.as_deref(), Some("Apto Pocitos"));
        assert_eq!(stored[0].description, "Con terraza");
    }

    #[tokio::test]
    async fn concurrent_upserts_keep_nonempty_fields() {
        let catalog = Arc::new(MemoryCatalog::new());
        let url = "https://x.uy/MLU-7";
        let title_writer = {
            let catalog = catalog.clone();
            tokio::spawn(async move {
                catalog
                    .upsert_listing(&listing(url, Some("Con patio"), ""))
                    .await
            })
        };
        let description_writer = {
            let catalog = catalog.clone();
            tokio::spawn(async move {
                catalog
                    .upsert_listing(&listing(url, None, "Dos dormitorios"))
                    .await
            })
        };
        title_writer.await.unwrap().unwrap();
        description_writer.await.unwrap().unwrap();

        // Whichever writer lands second, both non-empty fields survive.
        let stored = catalog.listings_by_urls(&[url.to_string()]).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].title.as_deref(), Some("Con patio"));
        assert_eq!(stored[0].description, "Dos dormitorios");
    }

    #[test]
    fn token_bucket_config_requires_both_knobs() {
        let mut config = StorageConfig {
            database_url: None,
            snapshot_dir: PathBuf::from("snapshots"),
            rate_capacity: Some(3),
            rate_refill_ms: None,
        };
        assert!(config.token_bucket().is_none());

        config.rate_refill_ms = Some(500);
        let bucket = config.token_bucket().expect("both knobs set");
        assert_eq!(bucket.capacity, 3);
        assert_eq!(bucket.refill_every, Duration::from_millis(500));

        config.rate_capacity = Some(0);
        assert!(config.token_bucket().is_none());
    }

    #[tokio::test]
    async fn token_bucket_blocks_until_refill() {
        let bucket = SimpleTokenBucket::new(2, Duration::from_millis(40));
        let start = Instant::now();
        bucket.take().await;
        bucket.take().await;
        assert!(start.elapsed() < Duration::from_millis(30));
        // Capacity exhausted; the third take waits for a refill.
        bucket.take().await;
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn match_result_upsert_bumps_seen_count() {
        let catalog = MemoryCatalog::new();
        let search_id = Uuid::new_v4();
        let at = Utc::now();
        catalog
            .upsert_match_result(search_id, "https://x.uy/MLU-1", true, at, serde_json::json!({}))
            .await
            .unwrap();
        catalog
            .upsert_match_result(search_id, "https://x.uy/MLU-1", false, at, serde_json::json!({}))
            .await
            .unwrap();

        let results = catalog.match_results_for_search(search_id).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].seen_count, 2);
        assert!(!results[0].matches);
    }

    #[tokio::test]
    async fn known_urls_returns_only_the_stored_subset() {
        let catalog = MemoryCatalog::new();
        catalog
            .upsert_listing(&listing("https://x.uy/MLU-1", Some("a"), "d"))
            .await
            .unwrap();

        let known = catalog
            .known_urls(&[
                "https://x.uy/MLU-1".to_string(),
                "https://x.uy/MLU-2".to_string(),
            ])
            .await
            .unwrap();
        assert!(known.contains("https://x.uy/MLU-1"));
        assert!(!known.contains("https://x.uy/MLU-2"));
    }

    #[tokio::test]
    async fn keyword_verdict_cache_round_trips() {
        let catalog = MemoryCatalog::new();
        let verdict = KeywordVerdict {
            matches: true,
            matched_variant: Some("terraza".into()),
            rule: Some("exact".into()),
        };
        catalog
            .record_keyword_verdict("terraza", "https://x.uy/MLU-1", &verdict)
            .await
            .unwrap();
        let loaded = catalog
            .keyword_verdict("terraza", "https://x.uy/MLU-1")
            .await
            .unwrap();
        assert_eq!(loaded, Some(verdict));
        assert_eq!(
            catalog.keyword_verdict("terraza", "https://x.uy/MLU-2").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn unsaving_a_search_preserves_its_match_results() {
        let catalog = MemoryCatalog::new();
        let search = SearchRecord {
            id: Uuid::new_v4(),
            name: Some("pocitos".into()),
            original_text: "apto terraza".into(),
            filters: SearchFilters::default(),
            is_saved: true,
            created_at: Utc::now(),
            last_refresh_at: None,
        };
        catalog.create_search(&search).await.unwrap();
        catalog
            .upsert_match_result(
                search.id,
                "https://x.uy/MLU-1",
                true,
                Utc::now(),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        catalog.set_search_saved(search.id, false).await.unwrap();
        let stored = catalog.get_search(search.id).await.unwrap().unwrap();
        assert!(!stored.is_saved);
        assert!(catalog.saved_searches().await.unwrap().is_empty());
        assert_eq!(
            catalog.match_results_for_search(search.id).await.unwrap().len(),
            1
        );

        // Restoring flips the bit back without touching anything else.
        catalog.set_search_saved(search.id, true).await.unwrap();
        let restored = catalog.get_search(search.id).await.unwrap().unwrap();
        assert!(restored.is_saved);
        assert_eq!(restored.name.as_deref(), Some("pocitos"));
    }

    #[tokio::test]
    async fn stats_count_saved_and_positive() {
        let catalog = MemoryCatalog::new();
        let search = SearchRecord {
            id: Uuid::new_v4(),
            name: None,
            original_text: "apto pocitos".into(),
            filters: SearchFilters::default(),
            is_saved: true,
            created_at: Utc::now(),
            last_refresh_at: None,
        };
        catalog.create_search(&search).await.unwrap();
        catalog
            .upsert_listing(&listing("https://x.uy/MLU-1", Some("a"), "d"))
            .await
            .unwrap();
        catalog
            .upsert_match_result(
                search.id,
                "https://x.uy/MLU-1",
                true,
                Utc::now(),
                serde_json::json!({}),
            )
            .await
            .unwrap();

        let stats = catalog.stats().await.unwrap();
        assert_eq!(stats.searches, 1);
        assert_eq!(stats.saved_searches, 1);
        assert_eq!(stats.listings, 1);
        assert_eq!(stats.positive_match_results, 1);
    }
}
