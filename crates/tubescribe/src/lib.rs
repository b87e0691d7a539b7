//! tubescribe — durable video transcription job queue.
//!
//! Three tightly coupled parts: the persistent [`JobStore`] with its
//! status state machine and crash-recovery sweep, the background
//! [`Worker`] that claims, executes, retries and finalizes jobs one at
//! a time, and the [`BroadcastHub`] that fans state changes out to
//! live observers. The actual content work lives behind the
//! [`Processor`] trait; transports (HTTP, WebSocket, CLI) sit outside
//! this crate and talk to the store and the hub directly.
//!
//! Startup contract: call [`JobStore::recover_orphaned`] once before
//! [`Worker::start`], so jobs orphaned by a prior crash are reclaimed.

pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod processor;
pub mod queue;
pub mod worker;

pub use broadcast::{BroadcastHub, ConnectionError, ObserverConnection, QueueEvent};
pub use config::Settings;
pub use error::{ConfigError, Result, TubescribeError};
pub use processor::{ProcessOutcome, Processor};
pub use queue::{generate_job_id, Job, JobStatus, JobStore, NewJob, OutputLocations, StoreError};
pub use worker::{Worker, WorkerOptions};
