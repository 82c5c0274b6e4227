//! Snapshot cache, snapshot export and HTTP fetch utilities.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use cpw_core::{DiffResult, GameRecord, PriceChange};
use reqwest::header::ACCEPT;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

pub use reqwest::Url;

pub const CRATE_NAME: &str = "cpw-storage";

pub const CATALOG_KEY: &str = "catalog";

/// One committed snapshot. Handed out behind an `Arc` and never mutated;
/// a later refresh replaces the whole entry.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub snapshot: Vec<GameRecord>,
    pub diff: DiffResult,
    pub fetched_at: DateTime<Utc>,
    pub ttl: Duration,
    pub source_id: String,
    /// False when pagination stopped on a safety bound rather than at the end of the listing.
    pub complete: bool,
}

impl CacheEntry {
    pub fn expires_at(&self) -> DateTime<Utc> {
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);
        self.fetched_at
            .checked_add_signed(ttl)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.fetched_at).to_std().unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
pub struct SnapshotCommit {
    pub snapshot: Vec<GameRecord>,
    pub diff: DiffResult,
    pub source_id: String,
    pub complete: bool,
}

#[derive(Debug)]
pub struct CacheStore {
    ttl: Duration,
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
}

impl CacheStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn get(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.read().await.get(key).cloned()
    }

    pub async fn set(&self, key: &str, commit: SnapshotCommit) -> Arc<CacheEntry> {
        self.set_at(key, commit, Utc::now()).await
    }

    pub async fn set_at(
        &self,
        key: &str,
        commit: SnapshotCommit,
        fetched_at: DateTime<Utc>,
    ) -> Arc<CacheEntry> {
        let entry = Arc::new(CacheEntry {
            snapshot: commit.snapshot,
            diff: commit.diff,
            fetched_at,
            ttl: self.ttl,
            source_id: commit.source_id,
            complete: commit.complete,
        });
        let previous = self
            .entries
            .write()
            .await
            .insert(key.to_string(), Arc::clone(&entry));
        debug!(
            key,
            records = entry.snapshot.len(),
            replaced = previous.is_some(),
            "cache entry committed"
        );
        entry
    }

    pub fn is_expired(&self, entry: &CacheEntry) -> bool {
        entry.is_expired_at(Utc::now())
    }

    pub async fn invalidate(&self, key: &str) -> Option<Arc<CacheEntry>> {
        self.entries.write().await.remove(key)
    }
}

#[derive(Debug, Clone)]
pub struct ExportedSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotDocument<'a> {
    key: &'a str,
    fetched_at: DateTime<Utc>,
    source: &'a str,
    complete: bool,
    total: usize,
    games: &'a [GameRecord],
    new_games: &'a [GameRecord],
    price_changes: &'a [PriceChange],
}

#[derive(Debug, Clone)]
pub struct SnapshotExporter {
    root: PathBuf,
}

impl SnapshotExporter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn snapshot_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        key: &str,
        content_hash: &str,
    ) -> PathBuf {
        let stamp = fetched_at.format("%Y%m%d_%H%M%S").to_string();
        PathBuf::from(stamp)
            .join(key)
            .join(format!("{content_hash}.json"))
    }

    pub async fn export(&self, key: &str, entry: &CacheEntry) -> anyhow::Result<ExportedSnapshot> {
        let document = SnapshotDocument {
            key,
            fetched_at: entry.fetched_at,
            source: &entry.source_id,
            complete: entry.complete,
            total: entry.snapshot.len(),
            games: &entry.snapshot,
            new_games: &entry.diff.new_records,
            price_changes: &entry.diff.price_changes,
        };
        let bytes = serde_json::to_vec_pretty(&document).context("serializing snapshot")?;
        self.store_bytes(entry.fetched_at, key, &bytes).await
    }

    /// Store bytes immutably using a hash-addressed path and atomic temp-file rename.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        key: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ExportedSnapshot> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.snapshot_relative_path(fetched_at, key, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .with_context(|| format!("snapshot path {} has no parent", absolute_path.display()))?
            .to_path_buf();

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        let exported = |deduplicated| ExportedSnapshot {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            return Ok(exported(true));
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
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
            Ok(()) => Ok(exported(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(exported(true))
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
    if err.is_timeout() || err.is_connect() || err.is_request() || err.is_body() {
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
    pub max_idle_per_host: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_idle_per_host: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub final_url: Url,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .pool_max_idle_per_host(config.max_idle_per_host);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    /// GET `url`, retrying timeouts, connect failures, 5xx and 429 with capped backoff.
    pub async fn fetch_bytes(
        &self,
        source_id: &str,
        url: &Url,
        accept: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", source_id, url = %url);
        async {
            let mut attempt = 0usize;
            loop {
                let err = match self.client.get(url.clone()).header(ACCEPT, accept).send().await {
                    Ok(resp) => {
                        let status = resp.status();
                        let final_url = resp.url().clone();
                        if status.is_success() {
                            match resp.bytes().await {
                                Ok(body) => {
                                    return Ok(FetchedResponse {
                                        final_url,
                                        body: body.to_vec(),
                                    })
                                }
                                Err(err) => FetchError::Request(err),
                            }
                        } else {
                            FetchError::HttpStatus {
                                status: status.as_u16(),
                                url: final_url.to_string(),
                            }
                        }
                    }
                    Err(err) => FetchError::Request(err),
                };

                if err.disposition() == RetryDisposition::NonRetryable
                    || attempt >= self.backoff.max_retries
                {
                    return Err(err);
                }
                let delay = self.backoff.delay_for_attempt(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, error = %err, "retrying fetch");
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use cpw_core::RawItem;
    use tempfile::tempdir;

    fn record(id: &str, price: &str) -> GameRecord {
        GameRecord {
            id: id.to_string(),
            name: format!("Game {id}"),
            price: price.to_string(),
            link: "#".to_string(),
            synthetic_id: false,
        }
    }

    fn commit(records: Vec<GameRecord>) -> SnapshotCommit {
        SnapshotCommit {
            snapshot: records,
            diff: DiffResult::default(),
            source_id: "reco".to_string(),
            complete: true,
        }
    }

    fn at(h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).single().unwrap()
    }

    #[tokio::test]
    async fn set_replaces_entry_wholesale() {
        let store = CacheStore::new(Duration::from_secs(60));
        assert!(store.get(CATALOG_KEY).await.is_none());

        let first = store.set(CATALOG_KEY, commit(vec![record("1", "10"), record("2", "5")])).await;
        let second = store.set(CATALOG_KEY, commit(vec![record("3", "7")])).await;

        let current = store.get(CATALOG_KEY).await.unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert_eq!(current.snapshot, vec![record("3", "7")]);
        // Readers holding the old entry keep a consistent view.
        assert_eq!(first.snapshot.len(), 2);
    }

    #[tokio::test]
    async fn keys_are_independent() {
        let store = CacheStore::new(Duration::from_secs(60));
        store.set("a", commit(vec![record("1", "10")])).await;
        assert!(store.get("b").await.is_none());
        assert!(store.invalidate("a").await.is_some());
        assert!(store.get("a").await.is_none());
    }

    #[tokio::test]
    async fn expiry_follows_ttl_without_deleting() {
        let store = CacheStore::new(Duration::from_secs(3600));
        let entry = store.set_at(CATALOG_KEY, commit(vec![record("1", "10")]), at(10)).await;

        assert_eq!(entry.expires_at(), at(11));
        assert!(!entry.is_expired_at(at(10)));
        assert!(entry.is_expired_at(at(11)));
        assert!(store.is_expired(&entry));
        assert_eq!(entry.age_at(at(12)), Duration::from_secs(7200));
        assert!(store.get(CATALOG_KEY).await.is_some());
    }

    #[test]
    fn snapshot_hashing_is_stable() {
        let hash = SnapshotExporter::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn export_writes_json_and_deduplicates_by_hash_path() {
        let dir = tempdir().expect("tempdir");
        let exporter = SnapshotExporter::new(dir.path());
        let store = CacheStore::new(Duration::from_secs(60));
        let raw = RawItem::with_id("9P1");
        let game = cpw_core::normalize(&raw, || unreachable!());
        let entry = store.set_at(CATALOG_KEY, commit(vec![game]), at(8)).await;

        let first = exporter.export(CATALOG_KEY, &entry).await.expect("first export");
        let second = exporter.export(CATALOG_KEY, &entry).await.expect("second export");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("20260301_080000/catalog"));

        let text = std::fs::read_to_string(&first.absolute_path).expect("read export");
        let value: serde_json::Value = serde_json::from_str(&text).expect("parse export");
        assert_eq!(value["total"], 1);
        assert_eq!(value["source"], "reco");
        assert_eq!(value["games"][0]["id"], "9P1");
        assert!(value["newGames"].as_array().unwrap().is_empty());
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

    #[test]
    fn status_errors_classify_by_code() {
        let server = FetchError::HttpStatus {
            status: 503,
            url: "https://example.test".into(),
        };
        let throttled = FetchError::HttpStatus {
            status: 429,
            url: "https://example.test".into(),
        };
        let missing = FetchError::HttpStatus {
            status: 404,
            url: "https://example.test".into(),
        };
        assert_eq!(server.disposition(), RetryDisposition::Retryable);
        assert_eq!(throttled.disposition(), RetryDisposition::Retryable);
        assert_eq!(missing.disposition(), RetryDisposition::NonRetryable);
    }
}
