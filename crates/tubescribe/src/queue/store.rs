//! `JobStore` — the sole reader/writer of job records.
//!
//! Encapsulates every status transition rule on top of the raw
//! repository. Safe under concurrent callers: each operation is one
//! atomic step against the shared `Database` handle.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::job_repo::{self, JobRow};
use crate::db::{Database, DatabaseError};
use crate::queue::job::{Job, JobStatus, NewJob, OutputLocations};

/// Errors from job store operations.
///
/// "Job not found" is NOT an error: read and update operations return
/// `Ok(None)` for a missing id so callers can tell "already gone" from
/// an actual storage fault.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A job with this id already exists.
    #[error("a job with id '{0}' already exists")]
    DuplicateId(String),

    /// A stored record no longer round-trips through the typed model.
    #[error("corrupt job record '{id}': {reason}")]
    Corrupt { id: String, reason: String },

    /// The underlying database failed.
    #[error(transparent)]
    Database(#[from] DatabaseError),
}

/// Durable job record store backed by SQLite.
///
/// Cloning is cheap; clones share the same database handle.
#[derive(Clone)]
pub struct JobStore {
    db: Database,
}

impl JobStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Opens an in-memory store, for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    /// Inserts a new job in `pending` at progress 0 with a zero retry
    /// count. The caller supplies the (unique) id.
    pub fn create(&self, id: &str, new_job: NewJob) -> Result<Job, StoreError> {
        let row = JobRow {
            id: id.to_string(),
            subject_id: new_job.subject_id,
            subject_title: new_job.subject_title,
            group_id: new_job.group_id,
            parent_id: new_job.parent_id,
            status: JobStatus::Pending.as_str().to_string(),
            progress: 0.0,
            created_at: Utc::now().to_rfc3339(),
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            output_locations: None,
            extra: new_job.extra.map(|v| v.to_string()),
        };

        match job_repo::insert(&self.db, &row) {
            Ok(()) => {}
            Err(e) if is_unique_violation(&e) => {
                return Err(StoreError::DuplicateId(id.to_string()))
            }
            Err(e) => return Err(e.into()),
        }

        log::info!("Created job {}", id);
        self.require(id)
    }

    /// Reads a job by id. `Ok(None)` means the id is unknown.
    pub fn read(&self, id: &str) -> Result<Option<Job>, StoreError> {
        job_repo::find_by_id(&self.db, id)?
            .map(row_to_job)
            .transpose()
    }

    /// Lists all jobs, optionally restricted to one status. The order
    /// is stable for a given snapshot (creation time, then id).
    pub fn list(&self, status: Option<JobStatus>) -> Result<Vec<Job>, StoreError> {
        job_repo::list(&self.db, status.map(|s| s.as_str()))?
            .into_iter()
            .map(row_to_job)
            .collect()
    }

    /// All `pending` jobs in FIFO order; the worker's poll source.
    pub fn list_pending(&self) -> Result<Vec<Job>, StoreError> {
        self.list(Some(JobStatus::Pending))
    }

    /// Counts jobs with the given status.
    pub fn count_by_status(&self, status: JobStatus) -> Result<u64, StoreError> {
        Ok(job_repo::count_by_status(&self.db, status.as_str())?)
    }

    /// Applies a status transition with its status-specific side
    /// effects:
    ///
    /// - `Processing` with progress > 0 stamps `started_at`
    /// - `Completed` forces progress to 100 and stamps `completed_at`
    /// - `Failed` stores `error_message` and increments `retry_count`;
    ///   progress is left untouched
    /// - any other transition (notably re-queue to `Pending`) writes
    ///   status and progress as given
    ///
    /// Returns the updated record, or `Ok(None)` for an unknown id.
    pub fn update_status(
        &self,
        id: &str,
        status: JobStatus,
        progress: f64,
        error_message: Option<&str>,
    ) -> Result<Option<Job>, StoreError> {
        let now = Utc::now().to_rfc3339();
        let changed =
            job_repo::update_status(&self.db, id, status.as_str(), progress, error_message, &now)?;
        if changed == 0 {
            return Ok(None);
        }

        log::info!("Updated job {}: status={}, progress={}%", id, status, progress);
        self.read(id)
    }

    /// Marks a job `Failed` with a terminal error message, WITHOUT the
    /// `retry_count` increment of a normal failed transition. Used when
    /// the retry budget is already exhausted, so the counter reflects
    /// only actual failed attempts.
    pub fn fail_permanently(
        &self,
        id: &str,
        error_message: &str,
    ) -> Result<Option<Job>, StoreError> {
        let changed = job_repo::mark_failed_terminal(&self.db, id, error_message)?;
        if changed == 0 {
            return Ok(None);
        }

        log::warn!("Job {} permanently failed: {}", id, error_message);
        self.read(id)
    }

    /// Merges the `Some` fields of `patch` into the stored output
    /// locations; absent fields keep their previous value (or stay
    /// null). Returns `Ok(None)` for an unknown id.
    pub fn update_output_locations(
        &self,
        id: &str,
        patch: &OutputLocations,
    ) -> Result<Option<Job>, StoreError> {
        let patch_json = serde_json::json!({
            "transcript_md": patch.transcript_md,
            "transcript_json": patch.transcript_json,
            "metadata": patch.metadata,
        });

        let changed = job_repo::merge_output_locations(&self.db, id, &patch_json)?;
        if changed == 0 {
            return Ok(None);
        }
        self.read(id)
    }

    /// Reclaims jobs left in `processing` by a prior crash. Must run
    /// once at startup, before the worker begins polling — it is the
    /// only mechanism that frees orphaned jobs.
    ///
    /// Jobs under the retry limit go back to `pending` (progress 0,
    /// error cleared) and their ids are returned; the rest are marked
    /// permanently failed and not returned. Running the sweep twice in
    /// a row returns an empty list the second time.
    pub fn recover_orphaned(&self, max_retries: u32) -> Result<Vec<String>, StoreError> {
        let recovered = job_repo::recover_orphaned(&self.db, max_retries)?;
        if !recovered.is_empty() {
            log::info!("Recovered {} orphaned job(s) from crash", recovered.len());
        }
        Ok(recovered)
    }

    fn require(&self, id: &str) -> Result<Job, StoreError> {
        self.read(id)?.ok_or_else(|| StoreError::Corrupt {
            id: id.to_string(),
            reason: "record missing immediately after write".to_string(),
        })
    }
}

fn is_unique_violation(err: &DatabaseError) -> bool {
    matches!(
        err,
        DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
            if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn row_to_job(row: JobRow) -> Result<Job, StoreError> {
    let status = JobStatus::parse(&row.status).ok_or_else(|| StoreError::Corrupt {
        id: row.id.clone(),
        reason: format!("unknown status '{}'", row.status),
    })?;

    let created_at = parse_timestamp(&row.id, "created_at", &row.created_at)?;
    let started_at = row
        .started_at
        .as_deref()
        .map(|s| parse_timestamp(&row.id, "started_at", s))
        .transpose()?;
    let completed_at = row
        .completed_at
        .as_deref()
        .map(|s| parse_timestamp(&row.id, "completed_at", s))
        .transpose()?;

    let output_locations = row
        .output_locations
        .as_deref()
        .map(|s| {
            serde_json::from_str::<OutputLocations>(s).map_err(|e| StoreError::Corrupt {
                id: row.id.clone(),
                reason: format!("bad output_locations JSON: {}", e),
            })
        })
        .transpose()?;

    let extra = row
        .extra
        .as_deref()
        .map(|s| {
            serde_json::from_str::<serde_json::Value>(s).map_err(|e| StoreError::Corrupt {
                id: row.id.clone(),
                reason: format!("bad extra JSON: {}", e),
            })
        })
        .transpose()?;

    Ok(Job {
        id: row.id,
        subject_id: row.subject_id,
        subject_title: row.subject_title,
        group_id: row.group_id,
        parent_id: row.parent_id,
        status,
        progress: row.progress,
        created_at,
        started_at,
        completed_at,
        error_message: row.error_message,
        retry_count: row.retry_count,
        output_locations,
        extra,
    })
}

fn parse_timestamp(id: &str, field: &str, value: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt {
            id: id.to_string(),
            reason: format!("bad {} timestamp '{}': {}", field, value, e),
        })
}
