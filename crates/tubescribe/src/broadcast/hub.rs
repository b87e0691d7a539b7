//! Observer connection tracking and best-effort event fan-out.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::queue::job::Job;

/// An observer connection operation failed (handshake or send).
#[derive(Error, Debug)]
#[error("observer connection error: {0}")]
pub struct ConnectionError(pub String);

impl ConnectionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Event delivered to every live observer whenever a job record
/// changes, plus periodic heartbeats so clients can detect a silently
/// dead connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    /// A job record changed; carries the full persisted record.
    JobUpdate { job: Job },
    /// Periodic keepalive, sent on an externally-owned timer.
    Heartbeat,
}

/// One observing client. The transport layer (WebSocket, SSE, a test
/// stub) implements this; the hub only ever performs the opening
/// handshake and sends events.
#[async_trait]
pub trait ObserverConnection: Send + Sync {
    /// Performs the connection's opening handshake.
    async fn accept(&self) -> Result<(), ConnectionError>;

    /// Delivers one event to the client.
    async fn send(&self, event: &QueueEvent) -> Result<(), ConnectionError>;
}

/// Tracks live observer connections and fans events out to all of
/// them, tolerating individual delivery failures.
///
/// Connections that fail a send are pruned lazily inside `broadcast`;
/// there is no separate liveness checker.
#[derive(Default)]
pub struct BroadcastHub {
    connections: Mutex<Vec<Arc<dyn ObserverConnection>>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accepts the connection's handshake and adds it to the live set.
    pub async fn attach(&self, connection: Arc<dyn ObserverConnection>) -> Result<(), ConnectionError> {
        connection.accept().await?;

        let mut connections = self.connections.lock().await;
        connections.push(connection);
        log::info!("Observer connected. Total connections: {}", connections.len());
        Ok(())
    }

    /// Removes the connection from the live set if present. Detaching
    /// twice, or detaching an unknown connection, is a no-op.
    pub async fn detach(&self, connection: &Arc<dyn ObserverConnection>) {
        let mut connections = self.connections.lock().await;
        let before = connections.len();
        connections.retain(|c| !same_connection(c, connection));
        if connections.len() < before {
            log::info!(
                "Observer disconnected. Total connections: {}",
                connections.len()
            );
        }
    }

    /// Delivers the event to every live connection. A connection whose
    /// send fails is removed from the live set and not retried;
    /// delivery to the others still proceeds. Zero connections is a
    /// no-op.
    pub async fn broadcast(&self, event: &QueueEvent) {
        // Snapshot so attach/detach can interleave with the sends.
        let snapshot: Vec<Arc<dyn ObserverConnection>> =
            self.connections.lock().await.clone();
        if snapshot.is_empty() {
            return;
        }

        let mut dead = Vec::new();
        for connection in &snapshot {
            if let Err(e) = connection.send(event).await {
                log::error!("Failed to send to observer: {}", e);
                dead.push(Arc::clone(connection));
            }
        }

        if !dead.is_empty() {
            let mut connections = self.connections.lock().await;
            connections.retain(|c| !dead.iter().any(|d| same_connection(c, d)));
            log::info!(
                "Pruned {} dead observer(s). Total connections: {}",
                dead.len(),
                connections.len()
            );
        }
    }

    /// Broadcasts a heartbeat. The caller owns the timer.
    pub async fn heartbeat(&self) {
        self.broadcast(&QueueEvent::Heartbeat).await;
    }

    /// Number of currently live connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }
}

/// Identity comparison for trait-object connections, ignoring vtables.
fn same_connection(a: &Arc<dyn ObserverConnection>, b: &Arc<dyn ObserverConnection>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex as StdMutex;

    use crate::queue::job::{Job, JobStatus};

    /// Records every event it receives; can be told to fail sends.
    struct TestConnection {
        received: StdMutex<Vec<QueueEvent>>,
        fail_sends: AtomicBool,
    }

    impl TestConnection {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                received: StdMutex::new(Vec::new()),
                fail_sends: AtomicBool::new(false),
            })
        }

        fn failing() -> Arc<Self> {
            let conn = Self::new();
            conn.fail_sends.store(true, Ordering::Relaxed);
            conn
        }

        fn received_count(&self) -> usize {
            self.received.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ObserverConnection for TestConnection {
        async fn accept(&self) -> Result<(), ConnectionError> {
            Ok(())
        }

        async fn send(&self, event: &QueueEvent) -> Result<(), ConnectionError> {
            if self.fail_sends.load(Ordering::Relaxed) {
                return Err(ConnectionError::new("socket closed"));
            }
            self.received.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn sample_job(id: &str) -> Job {
        Job {
            id: id.to_string(),
            subject_id: "vid-1".to_string(),
            subject_title: None,
            group_id: None,
            parent_id: None,
            status: JobStatus::Processing,
            progress: 30.0,
            created_at: chrono::Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            retry_count: 0,
            output_locations: None,
            extra: None,
        }
    }

    #[tokio::test]
    async fn test_attach_and_detach() {
        let hub = BroadcastHub::new();
        let conn = TestConnection::new();
        let as_trait: Arc<dyn ObserverConnection> = conn.clone();

        hub.attach(as_trait.clone()).await.unwrap();
        assert_eq!(hub.connection_count().await, 1);

        hub.detach(&as_trait).await;
        assert_eq!(hub.connection_count().await, 0);

        // Detaching again is a no-op.
        hub.detach(&as_trait).await;
        assert_eq!(hub.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_broadcast_with_no_connections_is_noop() {
        let hub = BroadcastHub::new();
        hub.broadcast(&QueueEvent::JobUpdate {
            job: sample_job("j1"),
        })
        .await;
    }

    #[tokio::test]
    async fn test_broadcast_delivers_to_all() {
        let hub = BroadcastHub::new();
        let a = TestConnection::new();
        let b = TestConnection::new();
        hub.attach(a.clone()).await.unwrap();
        hub.attach(b.clone()).await.unwrap();

        hub.broadcast(&QueueEvent::JobUpdate {
            job: sample_job("j1"),
        })
        .await;

        assert_eq!(a.received_count(), 1);
        assert_eq!(b.received_count(), 1);
    }

    #[tokio::test]
    async fn test_failing_connection_is_pruned_others_still_receive() {
        let hub = BroadcastHub::new();
        let good1 = TestConnection::new();
        let bad = TestConnection::failing();
        let good2 = TestConnection::new();
        hub.attach(good1.clone()).await.unwrap();
        hub.attach(bad.clone()).await.unwrap();
        hub.attach(good2.clone()).await.unwrap();

        hub.broadcast(&QueueEvent::JobUpdate {
            job: sample_job("j1"),
        })
        .await;

        assert_eq!(good1.received_count(), 1);
        assert_eq!(good2.received_count(), 1);
        assert_eq!(bad.received_count(), 0);
        assert_eq!(hub.connection_count().await, 2);

        // The pruned connection gets nothing on the next broadcast.
        hub.broadcast(&QueueEvent::Heartbeat).await;
        assert_eq!(good1.received_count(), 2);
        assert_eq!(bad.received_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_wire_shape() {
        let payload = serde_json::to_value(&QueueEvent::Heartbeat).unwrap();
        assert_eq!(payload, serde_json::json!({ "type": "heartbeat" }));
    }

    #[tokio::test]
    async fn test_job_update_wire_shape() {
        let payload = serde_json::to_value(&QueueEvent::JobUpdate {
            job: sample_job("j1"),
        })
        .unwrap();
        assert_eq!(payload["type"], "job_update");
        assert_eq!(payload["job"]["id"], "j1");
        assert_eq!(payload["job"]["status"], "processing");
    }
}
