//! Persistence collaborators + HTTP fetch utilities for the importer.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use kef_core::{FailedImport, FailureReason, RawRow, RecordKey, ResponseRecord, HEADER_ROW};
use reqwest::StatusCode;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kef-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("cursor cannot move backwards from {current} to {requested}")]
    CursorRegression { current: u32, requested: u32 },
    #[error("cursor must be at least 1, got {0}")]
    InvalidCursor(u32),
    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error on {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("database error: {0}")]
    Database(String),
}

/// Persisted "last attempted row" watermark.
#[async_trait]
pub trait CursorStore: Send + Sync {
    /// Current cursor, [`HEADER_ROW`] when nothing has been processed.
    async fn get(&self) -> Result<u32, StoreError>;
    /// Monotonic move; rejects `to < current`.
    async fn advance(&self, to: u32) -> Result<u32, StoreError>;
    /// Manual override; rejects `to < 1` but may move backwards.
    async fn set(&self, to: u32) -> Result<u32, StoreError>;
}

/// Storage for rows that were seen but not imported, keyed by row number.
#[async_trait]
pub trait FailureStore: Send + Sync {
    /// Insert, or bump the retry count of an existing entry for the same row.
    async fn record(
        &self,
        raw: &RawRow,
        reason: FailureReason,
    ) -> Result<FailedImport, StoreError>;
    async fn find(&self, row_number: u32) -> Result<Option<FailedImport>, StoreError>;
    /// Entries ordered by row number.
    async fn list(&self) -> Result<Vec<FailedImport>, StoreError>;
    async fn remove(&self, row_number: u32) -> Result<bool, StoreError>;
    async fn clear(&self) -> Result<usize, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// Destination for decoded responses. Inserts are idempotent on [`RecordKey`].
#[async_trait]
pub trait ResponseStore: Send + Sync {
    async fn insert(&self, record: &ResponseRecord) -> Result<InsertOutcome, StoreError>;
    async fn count(&self) -> Result<usize, StoreError>;
}

/// Write JSON via a uniquely named temp file and an atomic rename.
pub async fn write_json_atomic<T: Serialize + ?Sized>(
    path: &Path,
    value: &T,
) -> Result<(), StoreError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| StoreError::Serialization {
        path: path.to_path_buf(),
        source,
    })?;
    let io_err = |path: &Path| {
        let path = path.to_path_buf();
        move |source: std::io::Error| StoreError::Io { path, source }
    };

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent).await.map_err(io_err(&parent))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(io_err(&temp_path))?;
    file.write_all(&bytes).await.map_err(io_err(&temp_path))?;
    file.flush().await.map_err(io_err(&temp_path))?;
    file.sync_all().await.map_err(io_err(&temp_path))?;
    drop(file);

    if let Err(source) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        });
    }
    Ok(())
}

/// Read JSON written by [`write_json_atomic`]; a missing file yields `None`.
pub async fn read_json_if_exists<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, StoreError> {
    match fs::read(path).await {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StoreError::Serialization {
                path: path.to_path_buf(),
                source,
            }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(StoreError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ImportState {
    cursor: Option<u32>,
    #[serde(default)]
    failures: Vec<FailedImport>,
}

#[derive(Debug, Default)]
struct LoadedState {
    cursor: Option<u32>,
    failures: BTreeMap<u32, FailedImport>,
}

impl LoadedState {
    fn snapshot(&self) -> ImportState {
        ImportState {
            cursor: self.cursor,
            failures: self.failures.values().cloned().collect(),
        }
    }
}

/// Cursor + failure ledger persistence, either in memory or as one JSON file.
///
/// Every mutation is written through before the call returns; the lock is held
/// across the write so file contents always follow mutation order.
#[derive(Debug)]
pub struct ImportStateStore {
    path: Option<PathBuf>,
    state: Mutex<LoadedState>,
}

impl ImportStateStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(LoadedState::default()),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let stored: ImportState = read_json_if_exists(&path).await?.unwrap_or_default();
        let failures = stored
            .failures
            .into_iter()
            .map(|f| (f.row_number, f))
            .collect();
        debug!(path = %path.display(), cursor = ?stored.cursor, "opened import state");
        Ok(Self {
            path: Some(path),
            state: Mutex::new(LoadedState {
                cursor: stored.cursor,
                failures,
            }),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, state: &LoadedState) -> Result<(), StoreError> {
        match &self.path {
            Some(path) => write_json_atomic(path, &state.snapshot()).await,
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CursorStore for ImportStateStore {
    async fn get(&self) -> Result<u32, StoreError> {
        Ok(self.state.lock().await.cursor.unwrap_or(HEADER_ROW))
    }

    async fn advance(&self, to: u32) -> Result<u32, StoreError> {
        let mut state = self.state.lock().await;
        let current = state.cursor.unwrap_or(HEADER_ROW);
        if to < current {
            return Err(StoreError::CursorRegression {
                current,
                requested: to,
            });
        }
        if to == current && state.cursor.is_some() {
            return Ok(current);
        }
        let previous = state.cursor.replace(to);
        if let Err(err) = self.persist(&state).await {
            state.cursor = previous;
            return Err(err);
        }
        Ok(to)
    }

    async fn set(&self, to: u32) -> Result<u32, StoreError> {
        if to < HEADER_ROW {
            return Err(StoreError::InvalidCursor(to));
        }
        let mut state = self.state.lock().await;
        let previous = state.cursor.replace(to);
        if let Err(err) = self.persist(&state).await {
            state.cursor = previous;
            return Err(err);
        }
        Ok(to)
    }
}

#[async_trait]
impl FailureStore for ImportStateStore {
    async fn record(
        &self,
        raw: &RawRow,
        reason: FailureReason,
    ) -> Result<FailedImport, StoreError> {
        let now = Utc::now();
        let mut state = self.state.lock().await;
        let previous = state.failures.get(&raw.row_number).cloned();
        let entry = match &previous {
            Some(existing) => FailedImport {
                raw: raw.clone(),
                reason,
                retry_count: existing.retry_count + 1,
                last_failed_at: now,
                ..existing.clone()
            },
            None => FailedImport {
                row_number: raw.row_number,
                raw: raw.clone(),
                reason,
                retry_count: 0,
                first_failed_at: now,
                last_failed_at: now,
            },
        };
        state.failures.insert(raw.row_number, entry.clone());
        if let Err(err) = self.persist(&state).await {
            match previous {
                Some(p) => state.failures.insert(raw.row_number, p),
                None => state.failures.remove(&raw.row_number),
            };
            return Err(err);
        }
        Ok(entry)
    }

    async fn find(&self, row_number: u32) -> Result<Option<FailedImport>, StoreError> {
        Ok(self.state.lock().await.failures.get(&row_number).cloned())
    }

    async fn list(&self) -> Result<Vec<FailedImport>, StoreError> {
        Ok(self.state.lock().await.failures.values().cloned().collect())
    }

    async fn remove(&self, row_number: u32) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let Some(removed) = state.failures.remove(&row_number) else {
            return Ok(false);
        };
        if let Err(err) = self.persist(&state).await {
            state.failures.insert(row_number, removed);
            return Err(err);
        }
        Ok(true)
    }

    async fn clear(&self) -> Result<usize, StoreError> {
        let mut state = self.state.lock().await;
        let removed = std::mem::take(&mut state.failures);
        if let Err(err) = self.persist(&state).await {
            state.failures = removed;
            return Err(err);
        }
        Ok(removed.len())
    }
}

/// Response store keyed by [`RecordKey`], in memory or backed by a JSON file.
#[derive(Debug)]
pub struct LocalResponseStore {
    path: Option<PathBuf>,
    records: Mutex<BTreeMap<RecordKey, ResponseRecord>>,
}

impl LocalResponseStore {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Mutex::new(BTreeMap::new()),
        }
    }

    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let stored: Vec<ResponseRecord> = read_json_if_exists(&path).await?.unwrap_or_default();
        let records = stored.into_iter().map(|r| (r.key(), r)).collect();
        Ok(Self {
            path: Some(path),
            records: Mutex::new(records),
        })
    }
}

#[async_trait]
impl ResponseStore for LocalResponseStore {
    async fn insert(&self, record: &ResponseRecord) -> Result<InsertOutcome, StoreError> {
        let mut records = self.records.lock().await;
        let key = record.key();
        if records.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        records.insert(key.clone(), record.clone());
        if let Some(path) = &self.path {
            let all = records.values().collect::<Vec<_>>();
            if let Err(err) = write_json_atomic(path, &all).await {
                records.remove(&key);
                return Err(err);
            }
        }
        Ok(InsertOutcome::Inserted)
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.records.lock().await.len())
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
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("failed to build http client: {0}")]
    Client(String),
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

/// Thin reqwest wrapper with a per-request timeout and bounded retries.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    timeout: Duration,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| FetchError::Client(err.to_string()))?;
        Ok(Self {
            client,
            timeout: config.timeout,
            backoff: config.backoff,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub async fn fetch_text(&self, run_id: Uuid, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch", %run_id, url);
        self.fetch_text_inner(url).instrument(span).await
    }

    async fn fetch_text_inner(&self, url: &str) -> Result<String, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return Ok(resp.text().await?);
                    }

                    let final_url = resp.url().to_string();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(%status, attempt, "retrying sheet fetch");
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
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(error = %err, attempt, "retrying sheet fetch");
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
