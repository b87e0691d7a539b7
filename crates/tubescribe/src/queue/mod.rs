//! Durable job queue: typed records, the status state machine, and the
//! store that owns every transition rule.

pub mod job;
pub mod store;

pub use job::{generate_job_id, Job, JobStatus, NewJob, OutputLocations};
pub use store::{JobStore, StoreError};
