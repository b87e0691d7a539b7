//! Job repository — CRUD and status transitions for the `jobs` table.
//!
//! This layer speaks raw rows (strings and REALs); the typed API with
//! the status state machine lives in `queue::store`.

use rusqlite::{params, OptionalExtension, Row};

use super::{Database, DatabaseError};

/// A raw job row from the database.
#[derive(Debug, Clone)]
pub struct JobRow {
    pub id: String,
    pub subject_id: String,
    pub subject_title: Option<String>,
    pub group_id: Option<String>,
    pub parent_id: Option<String>,
    pub status: String,
    pub progress: f64,
    pub created_at: String,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
    pub error_message: Option<String>,
    pub retry_count: u32,
    pub output_locations: Option<String>,
    pub extra: Option<String>,
}

impl JobRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            subject_id: row.get("subject_id")?,
            subject_title: row.get("subject_title")?,
            group_id: row.get("group_id")?,
            parent_id: row.get("parent_id")?,
            status: row.get("status")?,
            progress: row.get("progress")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            completed_at: row.get("completed_at")?,
            error_message: row.get("error_message")?,
            retry_count: row.get("retry_count")?,
            output_locations: row.get("output_locations")?,
            extra: row.get("extra")?,
        })
    }
}

/// Inserts a new job row. Fails with a constraint violation if the id
/// already exists.
pub fn insert(db: &Database, job: &JobRow) -> Result<(), DatabaseError> {
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (id, subject_id, subject_title, group_id, parent_id, status,
             progress, created_at, started_at, completed_at, error_message, retry_count,
             output_locations, extra)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
            params![
                job.id,
                job.subject_id,
                job.subject_title,
                job.group_id,
                job.parent_id,
                job.status,
                job.progress,
                job.created_at,
                job.started_at,
                job.completed_at,
                job.error_message,
                job.retry_count,
                job.output_locations,
                job.extra,
            ],
        )?;
        Ok(())
    })
}

/// Finds a job by its ID.
pub fn find_by_id(db: &Database, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let row = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], |r| {
                JobRow::from_row(r)
            })
            .optional()?;
        Ok(row)
    })
}

/// Lists jobs, optionally restricted to one status.
///
/// Rows come back ordered by creation time (ties broken by id), which
/// is what gives the worker its FIFO pending selection.
pub fn list(db: &Database, status: Option<&str>) -> Result<Vec<JobRow>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt = match status {
            Some(_) => conn.prepare(
                "SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at ASC, id ASC",
            )?,
            None => conn.prepare("SELECT * FROM jobs ORDER BY created_at ASC, id ASC")?,
        };

        let rows: Vec<JobRow> = match status {
            Some(s) => stmt
                .query_map(params![s], JobRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?,
            None => stmt
                .query_map([], JobRow::from_row)?
                .collect::<Result<Vec<_>, _>>()?,
        };

        Ok(rows)
    })
}

/// Counts jobs with the given status.
pub fn count_by_status(db: &Database, status: &str) -> Result<u64, DatabaseError> {
    db.with_conn(|conn| {
        let count: u64 = conn.query_row(
            "SELECT COUNT(*) FROM jobs WHERE status = ?1",
            params![status],
            |r| r.get(0),
        )?;
        Ok(count)
    })
}

/// Applies a status transition with its status-specific side effects.
///
/// - `processing` with progress > 0 also stamps `started_at`
/// - `completed` forces progress to 100 and stamps `completed_at`
/// - `failed` stores the error message and increments `retry_count`
/// - anything else writes status and progress verbatim
///
/// Returns the number of rows updated (0 means the id is unknown).
pub fn update_status(
    db: &Database,
    id: &str,
    status: &str,
    progress: f64,
    error_message: Option<&str>,
    now: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = if status == "processing" && progress > 0.0 {
            conn.execute(
                "UPDATE jobs SET status = ?2, progress = ?3, started_at = ?4 WHERE id = ?1",
                params![id, status, progress, now],
            )?
        } else if status == "completed" {
            conn.execute(
                "UPDATE jobs SET status = ?2, progress = 100.0, completed_at = ?3 WHERE id = ?1",
                params![id, status, now],
            )?
        } else if status == "failed" {
            conn.execute(
                "UPDATE jobs SET status = ?2, error_message = ?3,
                 retry_count = retry_count + 1 WHERE id = ?1",
                params![id, status, error_message],
            )?
        } else {
            conn.execute(
                "UPDATE jobs SET status = ?2, progress = ?3 WHERE id = ?1",
                params![id, status, progress],
            )?
        };
        Ok(changed)
    })
}

/// Marks a job failed with an error message WITHOUT touching
/// `retry_count`. Used for the permanently-exhausted retry path, where
/// the prior failed transitions already accumulated the count.
pub fn mark_failed_terminal(
    db: &Database,
    id: &str,
    error_message: &str,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let changed = conn.execute(
            "UPDATE jobs SET status = 'failed', error_message = ?2 WHERE id = ?1",
            params![id, error_message],
        )?;
        Ok(changed)
    })
}

/// Merges a JSON object patch into the stored `output_locations` column.
///
/// Only non-null entries of the patch are applied; absent or null
/// fields keep whatever is already stored. The read-merge-write happens
/// inside one connection lock, so it is atomic with respect to other
/// repository calls.
pub fn merge_output_locations(
    db: &Database,
    id: &str,
    patch: &serde_json::Value,
) -> Result<usize, DatabaseError> {
    db.with_conn(|conn| {
        let stored: Option<Option<String>> = conn
            .query_row(
                "SELECT output_locations FROM jobs WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()?;

        let Some(stored) = stored else {
            return Ok(0);
        };

        let mut merged = stored
            .as_deref()
            .and_then(|s| serde_json::from_str::<serde_json::Value>(s).ok())
            .filter(|v| v.is_object())
            .unwrap_or_else(|| serde_json::json!({}));

        if let (Some(target), Some(source)) = (merged.as_object_mut(), patch.as_object()) {
            for (key, value) in source {
                if !value.is_null() {
                    target.insert(key.clone(), value.clone());
                }
            }
        }

        let changed = conn.execute(
            "UPDATE jobs SET output_locations = ?2 WHERE id = ?1",
            params![id, merged.to_string()],
        )?;
        Ok(changed)
    })
}

/// Sweeps jobs stuck in `processing` after an unclean shutdown.
///
/// Jobs at or over the retry limit are marked permanently failed and
/// NOT returned; the rest are reset to `pending` with progress 0 and a
/// cleared error, and their ids are returned. The whole sweep runs
/// under one connection lock.
pub fn recover_orphaned(db: &Database, max_retries: u32) -> Result<Vec<String>, DatabaseError> {
    db.with_conn(|conn| {
        let mut stmt =
            conn.prepare("SELECT id, retry_count FROM jobs WHERE status = 'processing'")?;
        let orphaned: Vec<(String, u32)> = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut recovered = Vec::new();

        for (id, retry_count) in orphaned {
            if retry_count >= max_retries {
                conn.execute(
                    "UPDATE jobs SET status = 'failed',
                     error_message = 'Max retries exceeded after worker crash'
                     WHERE id = ?1",
                    params![id],
                )?;
                log::warn!(
                    "Job {} marked permanently failed (exceeded max retries: {}/{})",
                    id,
                    retry_count,
                    max_retries
                );
            } else {
                conn.execute(
                    "UPDATE jobs SET status = 'pending', progress = 0.0, error_message = NULL
                     WHERE id = ?1",
                    params![id],
                )?;
                log::info!(
                    "Recovered orphaned job {} (retry {}/{})",
                    id,
                    retry_count + 1,
                    max_retries
                );
                recovered.push(id);
            }
        }

        Ok(recovered)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Database {
        Database::open_in_memory().expect("Failed to create test database")
    }

    fn sample_job(id: &str) -> JobRow {
        JobRow {
            id: id.to_string(),
            subject_id: "dQw4w9WgXcQ".to_string(),
            subject_title: Some("Test video".to_string()),
            group_id: None,
            parent_id: None,
            status: "pending".to_string(),
            progress: 0.0,
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            output_locations: None,
            extra: None,
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = test_db();
        insert(&db, &sample_job("job-1")).unwrap();

        let found = find_by_id(&db, "job-1").unwrap().unwrap();
        assert_eq!(found.subject_id, "dQw4w9WgXcQ");
        assert_eq!(found.status, "pending");
        assert_eq!(found.retry_count, 0);
    }

    #[test]
    fn test_find_nonexistent() {
        let db = test_db();
        assert!(find_by_id(&db, "nope").unwrap().is_none());
    }

    #[test]
    fn test_insert_duplicate_id_fails() {
        let db = test_db();
        insert(&db, &sample_job("dup")).unwrap();
        assert!(insert(&db, &sample_job("dup")).is_err());
    }

    #[test]
    fn test_list_orders_by_created_at() {
        let db = test_db();
        for (i, id) in ["c", "a", "b"].iter().enumerate() {
            let mut job = sample_job(id);
            // Reverse insertion order relative to timestamps.
            job.created_at = format!("2026-01-0{}T00:00:00+00:00", 3 - i);
            insert(&db, &job).unwrap();
        }

        let rows = list(&db, None).unwrap();
        let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_list_with_status_filter() {
        let db = test_db();
        insert(&db, &sample_job("p1")).unwrap();
        let mut done = sample_job("d1");
        done.status = "completed".to_string();
        insert(&db, &done).unwrap();

        let rows = list(&db, Some("pending")).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, "p1");
    }

    #[test]
    fn test_count_by_status() {
        let db = test_db();
        insert(&db, &sample_job("c1")).unwrap();
        insert(&db, &sample_job("c2")).unwrap();

        assert_eq!(count_by_status(&db, "pending").unwrap(), 2);
        assert_eq!(count_by_status(&db, "failed").unwrap(), 0);
    }

    #[test]
    fn test_update_status_failed_increments_retry_count() {
        let db = test_db();
        insert(&db, &sample_job("f1")).unwrap();

        update_status(&db, "f1", "failed", 0.0, Some("boom"), "2026-01-02T00:00:00+00:00")
            .unwrap();
        update_status(&db, "f1", "failed", 0.0, Some("boom again"), "2026-01-02T00:01:00+00:00")
            .unwrap();

        let row = find_by_id(&db, "f1").unwrap().unwrap();
        assert_eq!(row.retry_count, 2);
        assert_eq!(row.error_message.as_deref(), Some("boom again"));
    }

    #[test]
    fn test_update_status_unknown_id_returns_zero() {
        let db = test_db();
        let changed =
            update_status(&db, "ghost", "processing", 10.0, None, "2026-01-01T00:00:00+00:00")
                .unwrap();
        assert_eq!(changed, 0);
    }

    #[test]
    fn test_merge_output_locations_keeps_existing_fields() {
        let db = test_db();
        insert(&db, &sample_job("m1")).unwrap();

        merge_output_locations(&db, "m1", &serde_json::json!({ "transcript_md": "/out/a.md" }))
            .unwrap();
        merge_output_locations(
            &db,
            "m1",
            &serde_json::json!({ "metadata": "/out/metadata.json", "transcript_json": null }),
        )
        .unwrap();

        let row = find_by_id(&db, "m1").unwrap().unwrap();
        let stored: serde_json::Value =
            serde_json::from_str(row.output_locations.as_deref().unwrap()).unwrap();
        assert_eq!(stored["transcript_md"], "/out/a.md");
        assert_eq!(stored["metadata"], "/out/metadata.json");
        assert!(stored.get("transcript_json").is_none());
    }

    #[test]
    fn test_recover_orphaned_resets_and_fails() {
        let db = test_db();

        let mut stuck = sample_job("stuck");
        stuck.status = "processing".to_string();
        stuck.progress = 40.0;
        insert(&db, &stuck).unwrap();

        let mut exhausted = sample_job("exhausted");
        exhausted.status = "processing".to_string();
        exhausted.retry_count = 3;
        insert(&db, &exhausted).unwrap();

        let recovered = recover_orphaned(&db, 3).unwrap();
        assert_eq!(recovered, vec!["stuck".to_string()]);

        let stuck = find_by_id(&db, "stuck").unwrap().unwrap();
        assert_eq!(stuck.status, "pending");
        assert_eq!(stuck.progress, 0.0);
        assert!(stuck.error_message.is_none());

        let exhausted = find_by_id(&db, "exhausted").unwrap().unwrap();
        assert_eq!(exhausted.status, "failed");
        assert_eq!(exhausted.retry_count, 3);
        assert!(exhausted
            .error_message
            .as_deref()
            .unwrap()
            .contains("Max retries exceeded"));
    }
}
