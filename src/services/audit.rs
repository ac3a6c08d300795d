use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::models::audit::AuditRecord;

/// Persistence collaborator for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn persist(&self, record: AuditRecord) -> Result<()>;
}

/// Emits every record as a structured `tracing` event on the `audit` target.
#[derive(Debug, Default)]
pub struct TracingAuditSink;

#[async_trait]
impl AuditSink for TracingAuditSink {
    async fn persist(&self, record: AuditRecord) -> Result<()> {
        let details = sonic_rs::to_string(&record.details)?;
        tracing::info!(
            target: "audit",
            event_type = %record.event_type,
            session_id = record.session_id.as_deref().unwrap_or("-"),
            user_id = record.user_id.as_deref().unwrap_or("-"),
            clients = %record.client_ids.join(","),
            result = %record.result,
            at = %record.at.to_rfc3339(),
            details = %details,
            "audit"
        );
        Ok(())
    }
}

/// Keeps records in memory. Useful for inspection and tests.
#[derive(Debug, Default, Clone)]
pub struct MemoryAuditSink {
    records: Arc<Mutex<Vec<AuditRecord>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn records(&self) -> Vec<AuditRecord> {
        self.records.lock().await.clone()
    }

    /// Event types in arrival order.
    pub async fn event_types(&self) -> Vec<String> {
        self.records
            .lock()
            .await
            .iter()
            .map(|r| r.event_type.clone())
            .collect()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn persist(&self, record: AuditRecord) -> Result<()> {
        self.records.lock().await.push(record);
        Ok(())
    }
}

enum AuditCommand {
    Record(AuditRecord),
    Flush(oneshot::Sender<()>),
}

/// Fire-and-forget front of the audit sink.
///
/// Recording never waits: when the queue is full the record is dropped with a warning.
#[derive(Clone)]
pub struct AuditRecorder {
    tx: mpsc::Sender<AuditCommand>,
}

impl AuditRecorder {
    /// Spawns the drain task feeding `sink`.
    ///
    /// # Arguments
    ///
    /// * `sink` - Where records end up.
    /// * `capacity` - Queue depth.
    /// * `shutdown_token` - Stops the drain task after the queue is emptied.
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize, shutdown_token: CancellationToken) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditCommand>(capacity.max(1));

        tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    command = rx.recv() => command,
                    _ = shutdown_token.cancelled() => {
                        rx.close();
                        rx.recv().await
                    }
                };
                match command {
                    Some(AuditCommand::Record(record)) => {
                        let event_type = record.event_type.clone();
                        if let Err(e) = sink.persist(record).await {
                            tracing::error!(event_type = %event_type, "❌ Failed to persist audit record: {}", e);
                        }
                    }
                    Some(AuditCommand::Flush(done)) => {
                        let _ = done.send(());
                    }
                    None => break,
                }
            }
            tracing::debug!("Audit recorder stopped");
        });

        Self { tx }
    }

    /// Queues a record without waiting.
    pub fn record(&self, record: AuditRecord) {
        match self.tx.try_send(AuditCommand::Record(record)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(AuditCommand::Record(record))) => {
                tracing::warn!(event_type = %record.event_type, "⚠️ Audit queue full, record dropped");
            }
            Err(_) => {
                tracing::debug!("Audit recorder closed, record dropped");
            }
        }
    }

    /// Waits until every record queued before this call has been persisted.
    pub async fn flush(&self) {
        let (done, wait) = oneshot::channel();
        if self.tx.send(AuditCommand::Flush(done)).await.is_ok() {
            let _ = wait.await;
        }
    }
}
