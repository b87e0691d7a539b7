//! The external processor boundary.
//!
//! The actual content work — fetching the video, running the
//! transcription engine — lives behind this trait and is opaque to the
//! queue core. The worker treats `process` as a blocking, possibly
//! slow call and runs it on the blocking thread pool.

/// Outcome of one processor invocation.
///
/// Success and failure are ordinary values here, not errors: the
/// worker's retry policy decides what happens next. Thrown-style
/// errors are reserved for truly unexpected faults.
#[derive(Debug, Clone)]
pub enum ProcessOutcome {
    /// The subject was processed; paths of the produced artifacts.
    Success {
        /// Primary transcript output (markdown), if produced.
        transcript_path: Option<String>,
        /// Directory that holds the remaining artifacts.
        output_dir: Option<String>,
    },
    /// Processing failed; the message ends up on the job record.
    Error { message: String },
}

impl ProcessOutcome {
    pub fn success(transcript_path: impl Into<String>, output_dir: impl Into<String>) -> Self {
        Self::Success {
            transcript_path: Some(transcript_path.into()),
            output_dir: Some(output_dir.into()),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error {
            message: message.into(),
        }
    }
}

/// Pluggable content processor consumed by the worker.
pub trait Processor: Send + Sync {
    /// Processes one subject to completion. Blocking.
    fn process(&self, subject_id: &str) -> ProcessOutcome;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_constructor() {
        let outcome = ProcessOutcome::success("/out/v.md", "/out");
        match outcome {
            ProcessOutcome::Success {
                transcript_path,
                output_dir,
            } => {
                assert_eq!(transcript_path.as_deref(), Some("/out/v.md"));
                assert_eq!(output_dir.as_deref(), Some("/out"));
            }
            ProcessOutcome::Error { .. } => panic!("expected success"),
        }
    }

    #[test]
    fn test_error_constructor() {
        match ProcessOutcome::error("no audio track") {
            ProcessOutcome::Error { message } => assert_eq!(message, "no audio track"),
            ProcessOutcome::Success { .. } => panic!("expected error"),
        }
    }
}
