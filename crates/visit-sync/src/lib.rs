//! Batch ETL orchestration: source discovery, URL extraction, duplicate filtering and load.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use csv::{ReaderBuilder, Trim};
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler, JobSchedulerError};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use visit_core::{VisitRecord, VISITS_TABLE};
use visit_storage::{
    connect, insert_batch, DatabaseConfig, PgVisitStore, StorageError, VisitSession, VisitStore,
};

pub const URL_COLUMN: &str = "url";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub extension: String,
    pub schedule_cron: String,
    pub database: DatabaseConfig,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            data_dir: lookup("DATA_DIRECTORY")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("data")),
            extension: lookup("SOURCE_EXTENSION").unwrap_or_else(|| "csv".to_string()),
            schedule_cron: lookup("ETL_SCHEDULE_CRON").unwrap_or_else(|| "0 0 * * * *".to_string()),
            database: DatabaseConfig::from_lookup(&lookup),
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceReadError {
    #[error("reading {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} is empty", path.display())]
    Empty { path: PathBuf },
    #[error("{} has no `url` column", path.display())]
    MissingUrlColumn { path: PathBuf },
    #[error("error parsing {}: {source}", path.display())]
    Malformed {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
    #[error("{} line {line}: found {found} fields, header has {expected}", path.display())]
    ExtraFields {
        path: PathBuf,
        line: u64,
        found: usize,
        expected: usize,
    },
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("listing source directory {}: {source}", dir.display())]
    Discover {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("scheduler: {0}")]
    Scheduler(#[from] JobSchedulerError),
}

/// Records extracted from one source file, in file order.
#[derive(Debug, Clone)]
pub struct SourceBatch {
    pub path: PathBuf,
    pub records: Vec<VisitRecord>,
    /// Rows dropped for a missing url or a parameter that failed to parse.
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Loaded,
    NoNewRecords,
    NothingToProcess,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source_files: usize,
    pub skipped_files: usize,
    pub extracted_records: usize,
    pub rejected_records: usize,
    pub already_present: usize,
    pub inserted: u64,
    pub outcome: RunOutcome,
}

#[derive(Debug)]
pub enum RunStatus {
    Completed(RunSummary),
    /// No database handle could be obtained; nothing was attempted.
    Unavailable,
    Failed,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Completed(_))
    }

    pub fn summary(&self) -> Option<&RunSummary> {
        match self {
            RunStatus::Completed(summary) => Some(summary),
            _ => None,
        }
    }
}

/// Source files in `dir` whose extension matches, sorted by path.
pub async fn discover_source_files(dir: &Path, extension: &str) -> Result<Vec<PathBuf>, SyncError> {
    let discover_err = |source| SyncError::Discover {
        dir: dir.to_path_buf(),
        source,
    };
    let extension = extension.trim_start_matches('.');

    let mut entries = fs::read_dir(dir).await.map_err(discover_err)?;
    let mut files = Vec::new();
    while let Some(entry) = entries.next_entry().await.map_err(discover_err)? {
        let path = entry.path();
        let matches_extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(extension));
        if !matches_extension {
            continue;
        }
        if fs::metadata(&path).await.map(|m| m.is_file()).unwrap_or(false) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

pub async fn extract_source_file(path: &Path) -> Result<SourceBatch, SourceReadError> {
    let bytes = fs::read(path).await.map_err(|source| SourceReadError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_source_csv(path, &bytes)
}

/// Parse CSV bytes with a `url` column into visit records.
pub fn parse_source_csv(path: &Path, bytes: &[u8]) -> Result<SourceBatch, SourceReadError> {
    let malformed = |source| SourceReadError::Malformed {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(Trim::All)
        .from_reader(bytes);

    let headers = reader.headers().map_err(malformed)?.clone();
    if headers.is_empty() {
        return Err(SourceReadError::Empty {
            path: path.to_path_buf(),
        });
    }
    let url_idx = headers
        .iter()
        .position(|h| h == URL_COLUMN)
        .ok_or_else(|| SourceReadError::MissingUrlColumn {
            path: path.to_path_buf(),
        })?;

    let mut records = Vec::new();
    let mut rejected = 0usize;
    let mut rows = 0usize;
    for row in reader.records() {
        let row = row.map_err(malformed)?;
        rows += 1;
        let line = row.position().map(|p| p.line()).unwrap_or_default();
        if row.len() > headers.len() {
            return Err(SourceReadError::ExtraFields {
                path: path.to_path_buf(),
                line,
                found: row.len(),
                expected: headers.len(),
            });
        }

        let Some(url) = row.get(url_idx).filter(|u| !u.is_empty()) else {
            rejected += 1;
            warn!(path = %path.display(), line, "row has no url; skipped");
            continue;
        };
        match VisitRecord::parse(url) {
            Ok(record) => records.push(record),
            Err(err) => {
                rejected += 1;
                error!(path = %path.display(), line, %err, "rejected row");
            }
        }
    }

    if rows == 0 {
        return Err(SourceReadError::Empty {
            path: path.to_path_buf(),
        });
    }

    Ok(SourceBatch {
        path: path.to_path_buf(),
        records,
        rejected,
    })
}

#[derive(Debug, Clone)]
pub struct EtlPipeline {
    data_dir: PathBuf,
    extension: String,
}

impl EtlPipeline {
    pub fn new(data_dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            data_dir: data_dir.into(),
            extension: extension.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.data_dir.clone(), config.extension.clone())
    }

    /// One full run. Writes happen in a single session that is committed only at the end;
    /// any storage error aborts the run and the session is rolled back on drop.
    pub async fn run_once<S: VisitStore>(&self, store: &S) -> Result<RunSummary, SyncError> {
        let run_id = Uuid::new_v4();
        self.execute(store, run_id)
            .instrument(info_span!("etl_run", %run_id))
            .await
    }

    async fn execute<S: VisitStore>(&self, store: &S, run_id: Uuid) -> Result<RunSummary, SyncError> {
        let started_at = Utc::now();

        store.ensure_table().await?;
        info!("table '{VISITS_TABLE}' ready");

        let files = discover_source_files(&self.data_dir, &self.extension).await?;
        info!(dir = %self.data_dir.display(), files = files.len(), "discovered source files");

        let mut combined = Vec::new();
        let mut skipped_files = 0usize;
        let mut rejected_records = 0usize;
        for path in &files {
            match extract_source_file(path).await {
                Ok(batch) => {
                    info!(
                        path = %batch.path.display(),
                        records = batch.records.len(),
                        rejected = batch.rejected,
                        "read source file"
                    );
                    rejected_records += batch.rejected;
                    combined.extend(batch.records);
                }
                Err(err) => {
                    skipped_files += 1;
                    warn!(%err, "skipping source file");
                }
            }
        }

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: started_at,
            source_files: files.len(),
            skipped_files,
            extracted_records: combined.len(),
            rejected_records,
            already_present: 0,
            inserted: 0,
            outcome: RunOutcome::NothingToProcess,
        };

        if combined.is_empty() {
            warn!(
                "No {} records found in {}. Nothing to process.",
                self.extension,
                self.data_dir.display()
            );
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        let mut session = store.begin().await?;

        info!(candidates = combined.len(), "checking if records already exist");
        let mut fresh = Vec::new();
        for record in combined {
            if session.exists(&record).await? {
                summary.already_present += 1;
            } else {
                fresh.push(record);
            }
        }

        if fresh.is_empty() {
            info!("no new records to insert");
            summary.outcome = RunOutcome::NoNewRecords;
        } else {
            info!(count = fresh.len(), "inserting new records");
            summary.inserted = insert_batch(&mut session, &fresh).await?;
            summary.outcome = RunOutcome::Loaded;
        }

        session.commit().await?;
        info!("changes committed");

        summary.finished_at = Utc::now();
        Ok(summary)
    }

    /// Recurring runs on `cron` sharing `store`. A tick that fires while the previous run is
    /// still going is skipped.
    pub async fn build_scheduler<S>(self, store: S, cron: &str) -> Result<JobScheduler, SyncError>
    where
        S: VisitStore + Clone + 'static,
        S::Session: 'static,
    {
        let sched = JobScheduler::new().await?;
        let running = Arc::new(Mutex::new(()));
        let job = Job::new_async(cron, move |_uuid, _lock| {
            let pipeline = self.clone();
            let store = store.clone();
            let running = running.clone();
            Box::pin(async move {
                run_tick(pipeline, store, &running).await;
            })
        })?;
        sched.add(job).await?;
        info!(cron, "scheduled recurring runs");
        Ok(sched)
    }
}

/// One scheduled tick. Returns `None` without running when `running` is already held.
pub async fn run_tick<S>(pipeline: EtlPipeline, store: S, running: &Mutex<()>) -> Option<RunStatus>
where
    S: VisitStore + 'static,
    S::Session: 'static,
{
    let Ok(_guard) = running.try_lock() else {
        warn!("previous run still in progress; tick skipped");
        return None;
    };
    Some(run_with_store(pipeline, store).await)
}

/// Run against `store`, logging every failure instead of returning it. A panic inside the run
/// is contained and reported as [`RunStatus::Failed`].
pub async fn run_with_store<S>(pipeline: EtlPipeline, store: S) -> RunStatus
where
    S: VisitStore + 'static,
    S::Session: 'static,
{
    let handle = tokio::spawn(async move { pipeline.run_once(&store).await });
    match handle.await {
        Ok(Ok(summary)) => {
            info!(
                run_id = %summary.run_id,
                outcome = ?summary.outcome,
                inserted = summary.inserted,
                already_present = summary.already_present,
                "run complete"
            );
            RunStatus::Completed(summary)
        }
        Ok(Err(err)) => {
            error!(error = %err, "run aborted");
            RunStatus::Failed
        }
        Err(err) => {
            error!(error = %err, "unexpected error; run aborted");
            RunStatus::Failed
        }
    }
}

/// Top-level entry: acquire the pool, run once, never propagate an error.
pub async fn run_guarded(config: SyncConfig) -> RunStatus {
    let pool = match connect(&config.database).await {
        Ok(Some(pool)) => pool,
        Ok(None) => {
            warn!("no database handle available; nothing loaded");
            return RunStatus::Unavailable;
        }
        Err(err) => {
            error!(error = %err, "cannot proceed without a database handle");
            return RunStatus::Unavailable;
        }
    };
    info!("connected to database");
    let pipeline = EtlPipeline::from_config(&config);
    let status = run_with_store(pipeline, PgVisitStore::new(pool.clone())).await;
    pool.close().await;
    status
}
