//! Typed job records and the status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Status of a job in the queue.
///
/// Lifecycle: `Pending -> Processing -> {Completed | Failed}`, with
/// `Failed -> Pending` on retry. `Completed` and a `Failed` job at the
/// retry limit are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    /// The database representation of this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    /// Parses a database status string. Returns `None` for anything
    /// outside the state machine.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(JobStatus::Pending),
            "processing" => Some(JobStatus::Processing),
            "completed" => Some(JobStatus::Completed),
            "failed" => Some(JobStatus::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Paths of the artifacts produced by a successful job.
///
/// All fields are optional so a subset can be reported; merging a
/// partial record leaves the other fields as previously stored.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct OutputLocations {
    /// Markdown transcript, the primary output.
    #[serde(default)]
    pub transcript_md: Option<String>,
    /// JSON transcript sitting next to the markdown one.
    #[serde(default)]
    pub transcript_json: Option<String>,
    /// Metadata file in the output directory.
    #[serde(default)]
    pub metadata: Option<String>,
}

impl OutputLocations {
    /// Overlays the `Some` fields of `patch` onto `self`.
    pub fn merge(&mut self, patch: &OutputLocations) {
        if patch.transcript_md.is_some() {
            self.transcript_md = patch.transcript_md.clone();
        }
        if patch.transcript_json.is_some() {
            self.transcript_json = patch.transcript_json.clone();
        }
        if patch.metadata.is_some() {
            self.metadata = patch.metadata.clone();
        }
    }
}

/// One unit of submitted work, tracked through the status state
/// machine until a terminal outcome. The full record is what observers
/// receive on every change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, assigned at creation, the sole lookup key.
    pub id: String,
    /// Identifier of the content to process; semantics belong to the
    /// external processor.
    pub subject_id: String,
    pub subject_title: Option<String>,
    pub group_id: Option<String>,
    pub parent_id: Option<String>,
    pub status: JobStatus,
    /// Percentage in [0, 100], monotonic within one attempt.
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Incremented once per failed attempt, never decremented.
    pub retry_count: u32,
    pub output_locations: Option<OutputLocations>,
    /// Opaque payload supplied at creation, round-tripped verbatim.
    pub extra: Option<serde_json::Value>,
}

impl Job {
    /// Returns true once the job has reached `Completed` or `Failed`.
    pub fn is_finished(&self) -> bool {
        matches!(self.status, JobStatus::Completed | JobStatus::Failed)
    }
}

/// Parameters for creating a job. The store fills in status, progress,
/// counters and timestamps.
#[derive(Debug, Clone, Default)]
pub struct NewJob {
    pub subject_id: String,
    pub subject_title: Option<String>,
    pub group_id: Option<String>,
    pub parent_id: Option<String>,
    pub extra: Option<serde_json::Value>,
}

impl NewJob {
    pub fn new(subject_id: impl Into<String>) -> Self {
        Self {
            subject_id: subject_id.into(),
            ..Default::default()
        }
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.subject_title = Some(title.into());
        self
    }

    pub fn with_group(mut self, group_id: impl Into<String>) -> Self {
        self.group_id = Some(group_id.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }

    pub fn with_extra(mut self, extra: serde_json::Value) -> Self {
        self.extra = Some(extra);
        self
    }
}

/// Generates a fresh job id. Callers own id generation; this is the
/// conventional choice.
pub fn generate_job_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_str() {
        for status in [
            JobStatus::Pending,
            JobStatus::Processing,
            JobStatus::Completed,
            JobStatus::Failed,
        ] {
            assert_eq!(JobStatus::parse(status.as_str()), Some(status));
        }
    }

    #[test]
    fn test_status_parse_rejects_unknown() {
        assert_eq!(JobStatus::parse("superseded"), None);
        assert_eq!(JobStatus::parse(""), None);
    }

    #[test]
    fn test_output_locations_merge_partial() {
        let mut locations = OutputLocations {
            transcript_md: Some("/out/a.md".to_string()),
            transcript_json: None,
            metadata: None,
        };

        locations.merge(&OutputLocations {
            transcript_md: None,
            transcript_json: Some("/out/a.json".to_string()),
            metadata: None,
        });

        assert_eq!(locations.transcript_md.as_deref(), Some("/out/a.md"));
        assert_eq!(locations.transcript_json.as_deref(), Some("/out/a.json"));
        assert!(locations.metadata.is_none());
    }

    #[test]
    fn test_new_job_builder() {
        let new_job = NewJob::new("vid-1")
            .with_title("A title")
            .with_group("playlist-9")
            .with_extra(serde_json::json!({ "requested_by": "cli" }));

        assert_eq!(new_job.subject_id, "vid-1");
        assert_eq!(new_job.subject_title.as_deref(), Some("A title"));
        assert_eq!(new_job.group_id.as_deref(), Some("playlist-9"));
        assert!(new_job.parent_id.is_none());
        assert_eq!(new_job.extra.unwrap()["requested_by"], "cli");
    }

    #[test]
    fn test_generate_job_id_is_unique() {
        assert_ne!(generate_job_id(), generate_job_id());
    }
}
