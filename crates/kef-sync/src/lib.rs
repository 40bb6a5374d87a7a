//! Incremental sheet import: cycle controller, failure ledger and scheduler.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kef_adapters::{
    decode_row, ColumnLayout, CsvFileSheetReader, CsvHttpSheetReader, FetchContext,
    ScoreVocabulary, SheetError, SheetReader,
};
use kef_core::{CycleReport, FailedImport, FailureReason, RawRow, ResponseRecord, HEADER_ROW};
use kef_storage::{
    CursorStore, FailureStore, HttpClientConfig, HttpFetcher, ImportStateStore, InsertOutcome,
    LocalResponseStore, ResponseStore, StoreError,
};
use serde::Serialize;
use sqlx::PgPool;
use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kef-sync";

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("transport error: {0}")]
    Transport(#[from] SheetError),
    #[error("persistence error: {0}")]
    Persistence(#[from] StoreError),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("no failed import recorded for row {0}")]
    UnknownFailure(u32),
    #[error("scheduler error: {0}")]
    Scheduler(String),
}

#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub database_url: Option<String>,
    pub state_path: PathBuf,
    pub responses_path: PathBuf,
    pub sheet_url: Option<String>,
    pub sheet_csv_path: Option<PathBuf>,
    pub poll_interval_secs: u64,
    pub scheduler_enabled: bool,
    pub http_timeout_secs: u64,
    pub fetch_timeout_secs: u64,
    pub user_agent: String,
    pub vocabulary_path: PathBuf,
    pub layout: ColumnLayout,
    pub workspace_root: PathBuf,
}

fn env_number<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let defaults = ColumnLayout::default();
        Self {
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            state_path: std::env::var("KEF_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/import_state.json")),
            responses_path: std::env::var("KEF_RESPONSES_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/responses.json")),
            sheet_url: std::env::var("KEF_SHEET_URL").ok().filter(|v| !v.is_empty()),
            sheet_csv_path: std::env::var("KEF_SHEET_CSV_PATH").ok().map(PathBuf::from),
            poll_interval_secs: env_number("KEF_POLL_INTERVAL_SECS", 300),
            scheduler_enabled: std::env::var("KEF_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            http_timeout_secs: env_number("KEF_HTTP_TIMEOUT_SECS", 30),
            fetch_timeout_secs: env_number("KEF_FETCH_TIMEOUT_SECS", 30),
            user_agent: std::env::var("KEF_USER_AGENT")
                .unwrap_or_else(|_| "kef-importer/0.1".to_string()),
            vocabulary_path: std::env::var("KEF_VOCABULARY_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("rules/vocabulary.yaml")),
            layout: ColumnLayout {
                timestamp: env_number("KEF_COLUMN_TIMESTAMP", defaults.timestamp),
                student: env_number("KEF_COLUMN_STUDENT", defaults.student),
                response: env_number("KEF_COLUMN_RESPONSE", defaults.response),
                question_index: env_number("KEF_COLUMN_QUESTION", defaults.question_index),
            },
            workspace_root: PathBuf::from("."),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Vocabulary from `vocabulary_path`, or the built-in table when the file is absent.
    pub fn load_vocabulary(&self) -> Result<ScoreVocabulary> {
        let path = self.workspace_root.join(&self.vocabulary_path);
        if !path.exists() {
            warn!(path = %path.display(), "vocabulary file missing; using built-in phrases");
            return Ok(ScoreVocabulary::default());
        }
        ScoreVocabulary::from_yaml_file(&path)
    }
}

/// Append/update/purge access to failed rows.
#[derive(Clone)]
pub struct FailureLedger {
    store: Arc<dyn FailureStore>,
}

impl FailureLedger {
    pub fn new(store: Arc<dyn FailureStore>) -> Self {
        Self { store }
    }

    pub async fn record(&self, raw: &RawRow, reason: FailureReason) -> Result<FailedImport, StoreError> {
        let entry = self.store.record(raw, reason).await?;
        warn!(
            row = entry.row_number,
            retry_count = entry.retry_count,
            reason = %entry.reason,
            "row recorded in failure ledger"
        );
        Ok(entry)
    }

    pub async fn list_pending(&self) -> Result<Vec<FailedImport>, StoreError> {
        self.store.list().await
    }

    pub async fn find(&self, row_number: u32) -> Result<Option<FailedImport>, StoreError> {
        self.store.find(row_number).await
    }

    pub async fn purge(&self, row_number: u32) -> Result<(), ImportError> {
        if self.store.remove(row_number).await? {
            info!(row = row_number, "purged failed import");
            Ok(())
        } else {
            Err(ImportError::UnknownFailure(row_number))
        }
    }

    pub async fn purge_all(&self) -> Result<usize, StoreError> {
        let removed = self.store.clear().await?;
        info!(removed, "purged all failed imports");
        Ok(removed)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PipelineStatus {
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RetryOutcome {
    Resolved { record: ResponseRecord, outcome: InsertOutcome },
    StillFailing { failure: FailedImport },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RetryAllSummary {
    pub attempted: usize,
    pub resolved: usize,
    pub still_failing: usize,
}

/// One-writer import cycle over a sheet reader, response store, cursor and ledger.
pub struct ImportPipeline {
    reader: Arc<dyn SheetReader>,
    responses: Arc<dyn ResponseStore>,
    cursor: Arc<dyn CursorStore>,
    ledger: FailureLedger,
    vocabulary: RwLock<ScoreVocabulary>,
    layout: ColumnLayout,
    fetch_timeout: Duration,
    cycle_guard: Mutex<()>,
    status: Mutex<PipelineStatus>,
}

impl ImportPipeline {
    pub fn new(
        reader: Arc<dyn SheetReader>,
        responses: Arc<dyn ResponseStore>,
        cursor: Arc<dyn CursorStore>,
        failures: Arc<dyn FailureStore>,
    ) -> Self {
        Self {
            reader,
            responses,
            cursor,
            ledger: FailureLedger::new(failures),
            vocabulary: RwLock::new(ScoreVocabulary::default()),
            layout: ColumnLayout::default(),
            fetch_timeout: Duration::from_secs(30),
            cycle_guard: Mutex::new(()),
            status: Mutex::new(PipelineStatus::default()),
        }
    }

    pub fn with_vocabulary(mut self, vocabulary: ScoreVocabulary) -> Self {
        self.vocabulary = RwLock::new(vocabulary);
        self
    }

    pub fn with_layout(mut self, layout: ColumnLayout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn ledger(&self) -> &FailureLedger {
        &self.ledger
    }

    pub async fn status(&self) -> PipelineStatus {
        self.status.lock().await.clone()
    }

    pub async fn cursor(&self) -> Result<u32, ImportError> {
        Ok(self.cursor.get().await?)
    }

    pub async fn set_vocabulary(&self, vocabulary: ScoreVocabulary) {
        info!(entries = vocabulary.len(), "vocabulary replaced");
        *self.vocabulary.write().await = vocabulary;
    }

    /// Run a cycle, waiting for any in-flight one to finish first.
    pub async fn run_once(&self) -> Result<CycleReport, ImportError> {
        let _guard = self.cycle_guard.lock().await;
        self.run_locked().await
    }

    /// Run a cycle unless one is already in flight; `None` means skipped.
    pub async fn try_run_once(&self) -> Option<Result<CycleReport, ImportError>> {
        let _guard = self.cycle_guard.try_lock().ok()?;
        Some(self.run_locked().await)
    }

    /// Manual cursor override. Serialized with cycles so it never lands mid-batch.
    pub async fn set_cursor(&self, row_number: u32) -> Result<u32, ImportError> {
        if row_number < HEADER_ROW {
            return Err(ImportError::Validation(format!(
                "cursor must be at least {HEADER_ROW}, got {row_number}"
            )));
        }
        let _guard = self.cycle_guard.lock().await;
        let previous = self.cursor.get().await?;
        let current = self.cursor.set(row_number).await?;
        info!(previous, current, "cursor overridden");
        Ok(current)
    }

    /// Re-decode a ledger entry from its stored snapshot and write it.
    ///
    /// Independent of the cycle guard; never touches the cursor.
    pub async fn retry_failure(&self, row_number: u32) -> Result<RetryOutcome, ImportError> {
        let Some(entry) = self.ledger.find(row_number).await? else {
            return Err(ImportError::UnknownFailure(row_number));
        };
        let vocabulary = self.vocabulary.read().await.clone();
        match self.import_row(&entry.raw, &vocabulary).await {
            Ok((record, outcome)) => {
                self.ledger.store.remove(row_number).await?;
                info!(row = row_number, ?outcome, "failed import resolved");
                Ok(RetryOutcome::Resolved { record, outcome })
            }
            Err(reason) => {
                let failure = self.ledger.record(&entry.raw, reason).await?;
                Ok(RetryOutcome::StillFailing { failure })
            }
        }
    }

    pub async fn retry_all_failures(&self) -> Result<RetryAllSummary, ImportError> {
        let pending = self.ledger.list_pending().await?;
        let mut summary = RetryAllSummary {
            attempted: pending.len(),
            ..Default::default()
        };
        for entry in pending {
            match self.retry_failure(entry.row_number).await {
                Ok(RetryOutcome::Resolved { .. }) => summary.resolved += 1,
                Ok(RetryOutcome::StillFailing { .. }) => summary.still_failing += 1,
                // purged concurrently
                Err(ImportError::UnknownFailure(_)) => summary.attempted -= 1,
                Err(err) => return Err(err),
            }
        }
        Ok(summary)
    }

    async fn run_locked(&self) -> Result<CycleReport, ImportError> {
        let ctx = FetchContext::new();
        let started_at = Utc::now();
        let span = info_span!("import_cycle", run_id = %ctx.run_id);
        let result = self.execute_cycle(&ctx, started_at).instrument(span).await;

        let mut status = self.status.lock().await;
        status.last_attempt_at = Some(started_at);
        match &result {
            Ok(report) => {
                status.last_report = Some(report.clone());
                status.last_error = None;
            }
            Err(err) => {
                warn!(run_id = %ctx.run_id, error = %err, "import cycle aborted; cursor unchanged");
                status.last_error = Some(err.to_string());
            }
        }
        result
    }

    async fn execute_cycle(
        &self,
        ctx: &FetchContext,
        started_at: DateTime<Utc>,
    ) -> Result<CycleReport, ImportError> {
        let previous_cursor = self.cursor.get().await?;

        let fetched = tokio::time::timeout(
            self.fetch_timeout,
            self.reader.fetch_rows_after(ctx, previous_cursor),
        )
        .await
        .map_err(|_| SheetError::Timeout(self.fetch_timeout))??;

        let floor = previous_cursor.max(HEADER_ROW);
        let mut rows = fetched
            .into_iter()
            .filter(|r| r.row_number > floor)
            .collect::<Vec<_>>();
        rows.sort_by_key(|r| r.row_number);
        rows.dedup_by_key(|r| r.row_number);

        let vocabulary = self.vocabulary.read().await.clone();
        let mut report = CycleReport {
            run_id: ctx.run_id,
            started_at,
            finished_at: started_at,
            previous_cursor,
            fetched: rows.len(),
            imported: 0,
            failed: 0,
            skipped: 0,
            new_cursor: previous_cursor,
        };

        for row in &rows {
            report.new_cursor = report.new_cursor.max(row.row_number);
            if row.is_blank() {
                debug!(row = row.row_number, "skipping blank row");
                report.skipped += 1;
                continue;
            }
            match self.import_row(row, &vocabulary).await {
                Ok((_, outcome)) => {
                    debug!(row = row.row_number, ?outcome, "row imported");
                    // A replayed row that now decodes clears its old ledger entry.
                    if self.ledger.store.remove(row.row_number).await? {
                        info!(row = row.row_number, "failed import resolved by replay");
                    }
                    report.imported += 1;
                }
                Err(reason) => {
                    self.ledger.record(row, reason).await?;
                    report.failed += 1;
                }
            }
        }

        // Everything for the batch is durable; only now move the watermark.
        if report.new_cursor > previous_cursor {
            self.cursor.advance(report.new_cursor).await?;
        }
        report.finished_at = Utc::now();

        info!(
            fetched = report.fetched,
            imported = report.imported,
            failed = report.failed,
            skipped = report.skipped,
            previous_cursor,
            new_cursor = report.new_cursor,
            "import cycle complete"
        );
        Ok(report)
    }

    async fn import_row(
        &self,
        row: &RawRow,
        vocabulary: &ScoreVocabulary,
    ) -> Result<(ResponseRecord, InsertOutcome), FailureReason> {
        let record = decode_row(row, &self.layout, vocabulary)?;
        let outcome = self
            .responses
            .insert(&record)
            .await
            .map_err(|err| FailureReason::Persistence {
                message: err.to_string(),
            })?;
        Ok((record, outcome))
    }

    async fn hold_cycle(&self) -> MutexGuard<'_, ()> {
        self.cycle_guard.lock().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Stopped,
    Running,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub state: SchedulerState,
    pub interval_secs: Option<u64>,
    pub started_at: Option<DateTime<Utc>>,
    pub next_run_estimate: Option<DateTime<Utc>>,
    pub last_report: Option<CycleReport>,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
}

struct RunningSchedule {
    scheduler: JobScheduler,
    job_id: Uuid,
    interval: Duration,
    started_at: DateTime<Utc>,
}

/// Fixed-interval runner for [`ImportPipeline::try_run_once`].
pub struct Scheduler {
    pipeline: Arc<ImportPipeline>,
    running: Mutex<Option<RunningSchedule>>,
    next_run: Arc<Mutex<Option<DateTime<Utc>>>>,
}

fn scheduler_error(err: impl std::fmt::Display) -> ImportError {
    ImportError::Scheduler(err.to_string())
}

impl Scheduler {
    pub fn new(pipeline: Arc<ImportPipeline>) -> Self {
        Self {
            pipeline,
            running: Mutex::new(None),
            next_run: Arc::new(Mutex::new(None)),
        }
    }

    /// Start ticking every `interval`. Already running is a no-op.
    pub async fn start(&self, interval: Duration) -> Result<SchedulerStatus, ImportError> {
        if interval < Duration::from_secs(1) {
            return Err(ImportError::Validation(
                "poll interval must be at least one second".to_string(),
            ));
        }
        let period = chrono::Duration::from_std(interval)
            .map_err(|_| ImportError::Validation(format!("poll interval {interval:?} out of range")))?;

        let mut running = self.running.lock().await;
        if let Some(existing) = running.as_ref() {
            info!(interval_secs = existing.interval.as_secs(), "scheduler already running");
            let status = self.snapshot(Some(existing)).await;
            return Ok(status);
        }

        let scheduler = JobScheduler::new().await.map_err(scheduler_error)?;
        let pipeline = self.pipeline.clone();
        let next_run = self.next_run.clone();
        let job = Job::new_repeated_async(interval, move |_job_id, _sched| {
            let pipeline = pipeline.clone();
            let next_run = next_run.clone();
            Box::pin(async move {
                *next_run.lock().await = Some(Utc::now() + period);
                match pipeline.try_run_once().await {
                    None => warn!("previous import cycle still in flight; tick skipped"),
                    Some(Ok(report)) => debug!(run_id = %report.run_id, "scheduled import cycle finished"),
                    Some(Err(err)) => warn!(error = %err, "scheduled import cycle failed"),
                }
            })
        })
        .map_err(scheduler_error)?;
        let job_id = scheduler.add(job).await.map_err(scheduler_error)?;
        scheduler.start().await.map_err(scheduler_error)?;

        let started_at = Utc::now();
        *self.next_run.lock().await = Some(started_at + period);
        info!(interval_secs = interval.as_secs(), "import scheduler started");

        *running = Some(RunningSchedule {
            scheduler,
            job_id,
            interval,
            started_at,
        });
        let status = self.snapshot(running.as_ref()).await;
        Ok(status)
    }

    /// Cancel future ticks; an in-flight cycle finishes before this returns.
    pub async fn stop(&self) -> Result<SchedulerStatus, ImportError> {
        let taken = self.running.lock().await.take();
        if let Some(mut schedule) = taken {
            let _cycle = self.pipeline.hold_cycle().await;
            if let Err(err) = schedule.scheduler.remove(&schedule.job_id).await {
                warn!(error = %err, "removing import job failed");
            }
            if let Err(err) = schedule.scheduler.shutdown().await {
                warn!(error = %err, "scheduler shutdown reported an error");
            }
            *self.next_run.lock().await = None;
            info!("import scheduler stopped");
        }
        Ok(self.snapshot(None).await)
    }

    pub async fn status(&self) -> SchedulerStatus {
        let running = self.running.lock().await;
        self.snapshot(running.as_ref()).await
    }

    async fn snapshot(&self, running: Option<&RunningSchedule>) -> SchedulerStatus {
        let pipeline = self.pipeline.status().await;
        let next_run_estimate = match running {
            Some(_) => *self.next_run.lock().await,
            None => None,
        };
        SchedulerStatus {
            state: if running.is_some() {
                SchedulerState::Running
            } else {
                SchedulerState::Stopped
            },
            interval_secs: running.map(|r| r.interval.as_secs()),
            started_at: running.map(|r| r.started_at),
            next_run_estimate,
            last_report: pipeline.last_report,
            last_error: pipeline.last_error,
            last_attempt_at: pipeline.last_attempt_at,
        }
    }
}

/// Control surface handed to the host application.
pub struct ImportService {
    pipeline: Arc<ImportPipeline>,
    scheduler: Scheduler,
}

impl ImportService {
    pub fn new(pipeline: Arc<ImportPipeline>) -> Self {
        Self {
            scheduler: Scheduler::new(pipeline.clone()),
            pipeline,
        }
    }

    pub fn pipeline(&self) -> &Arc<ImportPipeline> {
        &self.pipeline
    }

    pub async fn start(&self, interval: Duration) -> Result<SchedulerStatus, ImportError> {
        self.scheduler.start(interval).await
    }

    pub async fn stop(&self) -> Result<SchedulerStatus, ImportError> {
        self.scheduler.stop().await
    }

    pub async fn status(&self) -> SchedulerStatus {
        self.scheduler.status().await
    }

    pub async fn run_once(&self) -> Result<CycleReport, ImportError> {
        self.pipeline.run_once().await
    }

    pub async fn list_failures(&self) -> Result<Vec<FailedImport>, ImportError> {
        Ok(self.pipeline.ledger().list_pending().await?)
    }

    pub async fn retry_failure(&self, row_number: u32) -> Result<RetryOutcome, ImportError> {
        self.pipeline.retry_failure(row_number).await
    }

    pub async fn retry_all_failures(&self) -> Result<RetryAllSummary, ImportError> {
        self.pipeline.retry_all_failures().await
    }

    pub async fn purge_failure(&self, row_number: u32) -> Result<(), ImportError> {
        self.pipeline.ledger().purge(row_number).await
    }

    pub async fn purge_all_failures(&self) -> Result<usize, ImportError> {
        Ok(self.pipeline.ledger().purge_all().await?)
    }

    pub async fn set_cursor(&self, row_number: u32) -> Result<u32, ImportError> {
        self.pipeline.set_cursor(row_number).await
    }

    pub async fn cursor(&self) -> Result<u32, ImportError> {
        self.pipeline.cursor().await
    }

    pub async fn set_vocabulary(&self, vocabulary: ScoreVocabulary) {
        self.pipeline.set_vocabulary(vocabulary).await
    }
}

const RESPONSES_TABLE_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS assessment_responses (
    student        TEXT             NOT NULL,
    question_index BIGINT           NOT NULL,
    source_row     BIGINT           NOT NULL,
    score          TEXT             NOT NULL,
    score_value    DOUBLE PRECISION,
    recorded_at    TIMESTAMP        NOT NULL,
    imported_at    TIMESTAMPTZ      NOT NULL DEFAULT now(),
    PRIMARY KEY (student, question_index, source_row)
)
"#;

/// Postgres-backed response store; the primary key is the record key.
#[derive(Debug, Clone)]
pub struct PgResponseStore {
    pool: PgPool,
}

fn db_error(err: sqlx::Error) -> StoreError {
    StoreError::Database(err.to_string())
}

impl PgResponseStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(db_error)?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::query(RESPONSES_TABLE_DDL)
            .execute(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(())
    }
}

#[async_trait]
impl ResponseStore for PgResponseStore {
    async fn insert(&self, record: &ResponseRecord) -> Result<InsertOutcome, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO assessment_responses
                (student, question_index, source_row, score, score_value, recorded_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (student, question_index, source_row) DO NOTHING
            "#,
        )
        .bind(&record.student)
        .bind(i64::from(record.question_index))
        .bind(i64::from(record.source_row))
        .bind(record.score.as_str())
        .bind(record.score.value())
        .bind(record.recorded_at)
        .execute(&self.pool)
        .await
        .map_err(db_error)?;

        Ok(if result.rows_affected() == 0 {
            InsertOutcome::Duplicate
        } else {
            InsertOutcome::Inserted
        })
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assessment_responses")
            .fetch_one(&self.pool)
            .await
            .map_err(db_error)?;
        Ok(count.max(0) as usize)
    }
}

/// Wire collaborators from [`ImportConfig`]: sheet reader, stores and vocabulary.
pub async fn build_service(config: &ImportConfig) -> Result<ImportService> {
    let reader: Arc<dyn SheetReader> = match (&config.sheet_csv_path, &config.sheet_url) {
        (Some(path), _) => Arc::new(CsvFileSheetReader::new(config.workspace_root.join(path))),
        (None, Some(url)) => {
            let http = HttpFetcher::new(HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
                ..Default::default()
            })
            .context("building http client")?;
            let reader = CsvHttpSheetReader::new(http, url);
            info!(csv_url = reader.csv_url(), "reading sheet export");
            Arc::new(reader)
        }
        (None, None) => anyhow::bail!("set KEF_SHEET_URL or KEF_SHEET_CSV_PATH"),
    };

    let responses: Arc<dyn ResponseStore> = match &config.database_url {
        Some(url) => {
            let store = PgResponseStore::connect(url)
                .await
                .context("connecting response database")?;
            store.migrate().await.context("creating responses table")?;
            Arc::new(store)
        }
        None => Arc::new(
            LocalResponseStore::open(config.workspace_root.join(&config.responses_path))
                .await
                .context("opening local response store")?,
        ),
    };

    let state = Arc::new(
        ImportStateStore::open(config.workspace_root.join(&config.state_path))
            .await
            .context("opening import state")?,
    );
    info!(path = ?state.path(), cursor = state.get().await?, "import state loaded");

    let pipeline = ImportPipeline::new(reader, responses, state.clone(), state)
        .with_vocabulary(config.load_vocabulary()?)
        .with_layout(config.layout)
        .with_fetch_timeout(Duration::from_secs(config.fetch_timeout_secs));
    Ok(ImportService::new(Arc::new(pipeline)))
}

pub async fn run_import_once_from_env() -> Result<CycleReport> {
    let config = ImportConfig::from_env();
    let service = build_service(&config).await?;
    Ok(service.run_once().await?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use kef_core::{DecodeError, Score};

    struct StaticSheet {
        rows: std::sync::Mutex<Vec<RawRow>>,
        unreachable: AtomicBool,
        delay: Duration,
    }

    impl StaticSheet {
        fn new(rows: Vec<RawRow>) -> Self {
            Self {
                rows: std::sync::Mutex::new(rows),
                unreachable: AtomicBool::new(false),
                delay: Duration::ZERO,
            }
        }

        fn slow(rows: Vec<RawRow>, delay: Duration) -> Self {
            Self {
                delay,
                ..Self::new(rows)
            }
        }

        fn push(&self, row: RawRow) {
            self.rows.lock().unwrap().push(row);
        }
    }

    #[async_trait]
    impl SheetReader for StaticSheet {
        async fn fetch_rows_after(
            &self,
            _ctx: &FetchContext,
            after: u32,
        ) -> Result<Vec<RawRow>, SheetError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.unreachable.load(Ordering::SeqCst) {
                return Err(SheetError::Unreachable("connection refused".into()));
            }
            let rows = self.rows.lock().unwrap();
            Ok(rows.iter().filter(|r| r.row_number > after).cloned().collect())
        }
    }

    /// Fails every insert for the named student.
    struct RejectingStore {
        inner: LocalResponseStore,
        reject_student: String,
    }

    #[async_trait]
    impl ResponseStore for RejectingStore {
        async fn insert(&self, record: &ResponseRecord) -> Result<InsertOutcome, StoreError> {
            if record.student == self.reject_student {
                return Err(StoreError::Database("connection reset".into()));
            }
            self.inner.insert(record).await
        }

        async fn count(&self) -> Result<usize, StoreError> {
            self.inner.count().await
        }
    }

    fn sheet_row(n: u32, student: &str, text: &str, question: u32) -> RawRow {
        RawRow::new(
            n,
            vec![
                "7/1/2025 10:15:12".to_string(),
                student.to_string(),
                text.to_string(),
                question.to_string(),
            ],
        )
    }

    fn scenario_rows() -> Vec<RawRow> {
        vec![
            sheet_row(2, "Ana", "achieved", 1),
            sheet_row(3, "Ana", "partially achieved", 2),
            sheet_row(4, "Ana", "sort of", 3),
            sheet_row(5, "Ivo", "not achieved", 1),
        ]
    }

    struct Harness {
        sheet: Arc<StaticSheet>,
        responses: Arc<LocalResponseStore>,
        state: Arc<ImportStateStore>,
        pipeline: Arc<ImportPipeline>,
    }

    fn harness(sheet: StaticSheet) -> Harness {
        let sheet = Arc::new(sheet);
        let responses = Arc::new(LocalResponseStore::in_memory());
        let state = Arc::new(ImportStateStore::in_memory());
        let pipeline = Arc::new(
            ImportPipeline::new(sheet.clone(), responses.clone(), state.clone(), state.clone())
                .with_fetch_timeout(Duration::from_secs(5)),
        );
        Harness {
            sheet,
            responses,
            state,
            pipeline,
        }
    }

    #[tokio::test]
    async fn unknown_text_is_ledgered_and_cursor_still_advances() {
        let h = harness(StaticSheet::new(scenario_rows()));

        let report = h.pipeline.run_once().await.expect("cycle");
        assert_eq!(report.previous_cursor, 1);
        assert_eq!(report.fetched, 4);
        assert_eq!(report.imported, 3);
        assert_eq!(report.failed, 1);
        assert_eq!(report.new_cursor, 5);
        assert_eq!(h.state.get().await.unwrap(), 5);

        let failures = h.pipeline.ledger().list_pending().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].row_number, 4);
        assert_eq!(
            failures[0].reason,
            FailureReason::from(DecodeError::UnknownResponseText {
                text: "sort of".into()
            })
        );
        assert_eq!(h.responses.count().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn cursor_moves_by_number_of_fetched_rows() {
        for start in [1u32, 3, 10] {
            for n in [0u32, 1, 4] {
                let rows = (1..=n)
                    .map(|i| {
                        let text = if i % 2 == 0 { "garbled" } else { "achieved" };
                        sheet_row(start + i, "Ana", text, i)
                    })
                    .collect();
                let h = harness(StaticSheet::new(rows));
                h.state.set(start).await.unwrap();

                let report = h.pipeline.run_once().await.expect("cycle");
                assert_eq!(report.fetched, n as usize);
                assert_eq!(report.new_cursor, start + n);
                assert_eq!(report.imported + report.failed, n as usize);
            }
        }
    }

    #[tokio::test]
    async fn second_run_without_new_rows_changes_nothing() {
        let h = harness(StaticSheet::new(scenario_rows()));
        h.pipeline.run_once().await.expect("first");
        let failures_before = h.pipeline.ledger().list_pending().await.unwrap();

        let report = h.pipeline.run_once().await.expect("second");
        assert_eq!((report.fetched, report.imported, report.failed), (0, 0, 0));
        assert_eq!(report.new_cursor, 5);
        assert_eq!(h.responses.count().await.unwrap(), 3);
        assert_eq!(h.pipeline.ledger().list_pending().await.unwrap(), failures_before);
    }

    #[tokio::test]
    async fn replaying_a_batch_creates_no_duplicates() {
        let h = harness(StaticSheet::new(scenario_rows()));
        h.pipeline.run_once().await.expect("first");

        // Simulates a crash after writes but before the cursor moved.
        h.pipeline.set_cursor(1).await.expect("rewind");
        let replay = h.pipeline.run_once().await.expect("replay");

        assert_eq!(replay.imported, 3);
        assert_eq!(replay.new_cursor, 5);
        assert_eq!(h.responses.count().await.unwrap(), 3);
        let failures = h.pipeline.ledger().list_pending().await.unwrap();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].retry_count, 1);
    }

    #[tokio::test]
    async fn unreachable_sheet_aborts_without_moving_cursor() {
        let h = harness(StaticSheet::new(scenario_rows()));
        h.pipeline.run_once().await.expect("first");
        h.sheet.push(sheet_row(6, "Ivo", "achieved", 2));
        h.sheet.unreachable.store(true, Ordering::SeqCst);

        let err = h.pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, ImportError::Transport(SheetError::Unreachable(_))));
        assert_eq!(h.state.get().await.unwrap(), 5);

        let status = h.pipeline.status().await;
        assert_eq!(status.last_report.as_ref().map(|r| r.new_cursor), Some(5));
        assert!(status.last_error.unwrap().contains("unreachable"));

        h.sheet.unreachable.store(false, Ordering::SeqCst);
        let report = h.pipeline.run_once().await.expect("recovered");
        assert_eq!(report.imported, 1);
        assert_eq!(report.new_cursor, 6);
        assert!(h.pipeline.status().await.last_error.is_none());
    }

    #[tokio::test]
    async fn slow_sheet_times_out_as_transport_failure() {
        let sheet = StaticSheet::slow(scenario_rows(), Duration::from_secs(10));
        let h = harness(sheet);
        let pipeline = ImportPipeline::new(
            h.sheet.clone(),
            h.responses.clone(),
            h.state.clone(),
            h.state.clone(),
        )
        .with_fetch_timeout(Duration::from_millis(20));

        let err = pipeline.run_once().await.unwrap_err();
        assert!(matches!(err, ImportError::Transport(SheetError::Timeout(_))));
        assert_eq!(h.state.get().await.unwrap(), 1);
        assert_eq!(h.responses.count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn retry_after_vocabulary_update_resolves_entry() {
        let h = harness(StaticSheet::new(scenario_rows()));
        h.pipeline.run_once().await.expect("cycle");

        let still = h.pipeline.retry_failure(4).await.expect("retry");
        match still {
            RetryOutcome::StillFailing { failure } => assert_eq!(failure.retry_count, 1),
            other => panic!("expected failure, got {other:?}"),
        }

        let mut vocab = ScoreVocabulary::default();
        vocab.entries.push(kef_adapters::VocabularyEntry {
            phrase: "sort of".into(),
            score: Score::Partial,
        });
        h.pipeline.set_vocabulary(vocab).await;

        let resolved = h.pipeline.retry_failure(4).await.expect("retry");
        match resolved {
            RetryOutcome::Resolved { record, outcome } => {
                assert_eq!(record.source_row, 4);
                assert_eq!(record.score, Score::Partial);
                assert_eq!(outcome, InsertOutcome::Inserted);
            }
            other => panic!("expected resolution, got {other:?}"),
        }
        assert!(h.pipeline.ledger().list_pending().await.unwrap().is_empty());
        assert_eq!(h.responses.count().await.unwrap(), 4);
        assert_eq!(h.state.get().await.unwrap(), 5);
    }

    #[tokio::test]
    async fn retry_all_reports_resolved_and_remaining() {
        let mut rows = scenario_rows();
        rows.push(sheet_row(6, "Ivo", "no idea", 2));
        let h = harness(StaticSheet::new(rows));
        h.pipeline.run_once().await.expect("cycle");

        h.pipeline
            .set_vocabulary(ScoreVocabulary::from_pairs([
                ("sort of", Score::Partial),
                ("achieved", Score::Achieved),
            ]))
            .await;
        let summary = h.pipeline.retry_all_failures().await.expect("retry all");
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.resolved, 1);
        assert_eq!(summary.still_failing, 1);
        let remaining = h.pipeline.ledger().list_pending().await.unwrap();
        assert_eq!(remaining.iter().map(|f| f.row_number).collect::<Vec<_>>(), vec![6]);
    }

    #[tokio::test]
    async fn validation_errors_leave_state_alone() {
        let h = harness(StaticSheet::new(scenario_rows()));
        h.pipeline.run_once().await.expect("cycle");

        assert!(matches!(
            h.pipeline.set_cursor(0).await,
            Err(ImportError::Validation(_))
        ));
        assert_eq!(h.state.get().await.unwrap(), 5);
        assert!(matches!(
            h.pipeline.retry_failure(99).await,
            Err(ImportError::UnknownFailure(99))
        ));
        assert!(matches!(
            h.pipeline.ledger().purge(99).await,
            Err(ImportError::UnknownFailure(99))
        ));
        assert_eq!(h.pipeline.ledger().list_pending().await.unwrap().len(), 1);

        h.pipeline.ledger().purge(4).await.expect("purge");
        assert!(h.pipeline.ledger().list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn store_write_failures_are_ledgered_not_dropped() {
        let sheet = Arc::new(StaticSheet::new(scenario_rows()));
        let state = Arc::new(ImportStateStore::in_memory());
        let responses = Arc::new(RejectingStore {
            inner: LocalResponseStore::in_memory(),
            reject_student: "Ivo".into(),
        });
        let pipeline = ImportPipeline::new(sheet, responses.clone(), state.clone(), state.clone());

        let report = pipeline.run_once().await.expect("cycle");
        assert_eq!((report.imported, report.failed, report.new_cursor), (2, 2, 5));
        let row5 = state.find(5).await.unwrap().expect("row 5 ledgered");
        assert!(matches!(row5.reason, FailureReason::Persistence { .. }));
    }

    #[tokio::test]
    async fn blank_rows_are_skipped_but_advance_cursor() {
        let rows = vec![
            sheet_row(2, "Ana", "achieved", 1),
            RawRow::new(3, vec![String::new(), " ".into(), String::new(), String::new()]),
            sheet_row(4, "Ana", "achieved", 2),
        ];
        let h = harness(StaticSheet::new(rows));
        let report = h.pipeline.run_once().await.expect("cycle");
        assert_eq!((report.fetched, report.imported, report.skipped), (3, 2, 1));
        assert_eq!(report.new_cursor, 4);
        assert!(h.pipeline.ledger().list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn header_row_is_never_imported() {
        let rows = vec![
            RawRow::new(1, vec!["Timestamp".into(), "Student".into(), "Response".into(), "Q".into()]),
            sheet_row(2, "Ana", "achieved", 1),
        ];
        let h = harness(StaticSheet::new(rows));
        let report = h.pipeline.run_once().await.expect("cycle");
        assert_eq!((report.fetched, report.imported, report.failed), (1, 1, 0));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn scheduled_ticks_skip_while_cycle_in_flight() {
        let h = harness(StaticSheet::slow(scenario_rows(), Duration::from_millis(300)));
        let pipeline = h.pipeline.clone();
        let in_flight = tokio::spawn(async move { pipeline.run_once().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(h.pipeline.try_run_once().await.is_none());
        in_flight.await.expect("join").expect("cycle");
        assert_eq!(h.responses.count().await.unwrap(), 3);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn start_then_stop_reports_stopped_without_a_cycle() {
        let h = harness(StaticSheet::new(scenario_rows()));
        let service = ImportService::new(h.pipeline.clone());

        let running = service.start(Duration::from_secs(300)).await.expect("start");
        assert_eq!(running.state, SchedulerState::Running);
        assert_eq!(running.interval_secs, Some(300));
        assert!(running.next_run_estimate.is_some());

        let again = service.start(Duration::from_secs(60)).await.expect("restart no-op");
        assert_eq!(again.interval_secs, Some(300));
        assert_eq!(again.started_at, running.started_at);

        let stopped = service.stop().await.expect("stop");
        assert_eq!(stopped.state, SchedulerState::Stopped);
        assert!(stopped.last_report.is_none());
        assert!(stopped.next_run_estimate.is_none());
        assert_eq!(h.state.get().await.unwrap(), 1);

        let stopped_again = service.stop().await.expect("stop twice");
        assert_eq!(stopped_again.state, SchedulerState::Stopped);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn stop_waits_for_in_flight_cycle() {
        let h = harness(StaticSheet::slow(scenario_rows(), Duration::from_millis(300)));
        let service = Arc::new(ImportService::new(h.pipeline.clone()));
        service.start(Duration::from_secs(300)).await.expect("start");

        let runner = service.clone();
        let in_flight = tokio::spawn(async move { runner.run_once().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopped = service.stop().await.expect("stop");
        assert_eq!(stopped.state, SchedulerState::Stopped);
        assert_eq!(stopped.last_report.map(|r| r.new_cursor), Some(5));
        in_flight.await.expect("join").expect("cycle");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_answers_while_stop_waits_for_cycle() {
        let h = harness(StaticSheet::slow(scenario_rows(), Duration::from_millis(400)));
        let service = Arc::new(ImportService::new(h.pipeline.clone()));
        service.start(Duration::from_secs(300)).await.expect("start");

        let runner = service.clone();
        let in_flight = tokio::spawn(async move { runner.run_once().await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let stopper = service.clone();
        let stopping = tokio::spawn(async move { stopper.stop().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let status = tokio::time::timeout(Duration::from_millis(150), service.status())
            .await
            .expect("status must not wait for the cycle");
        assert_eq!(status.state, SchedulerState::Stopped);
        assert!(!stopping.is_finished());

        stopping.await.expect("join").expect("stop");
        in_flight.await.expect("join").expect("cycle");
    }

    #[tokio::test]
    async fn replay_after_vocabulary_fix_clears_ledger_entry() {
        let h = harness(StaticSheet::new(scenario_rows()));
        h.pipeline.run_once().await.expect("first");
        assert_eq!(h.pipeline.ledger().list_pending().await.unwrap().len(), 1);

        let mut vocab = ScoreVocabulary::default();
        vocab.entries.push(kef_adapters::VocabularyEntry {
            phrase: "sort of".into(),
            score: Score::Partial,
        });
        h.pipeline.set_vocabulary(vocab).await;
        h.pipeline.set_cursor(1).await.expect("rewind");

        let replay = h.pipeline.run_once().await.expect("replay");
        assert_eq!((replay.imported, replay.failed), (4, 0));
        assert_eq!(h.responses.count().await.unwrap(), 4);
        assert!(h.pipeline.ledger().list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let h = harness(StaticSheet::new(vec![]));
        let service = ImportService::new(h.pipeline);
        assert!(matches!(
            service.start(Duration::ZERO).await,
            Err(ImportError::Validation(_))
        ));
        assert_eq!(service.status().await.state, SchedulerState::Stopped);
    }
}
