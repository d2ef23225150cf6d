//! Fire-and-forget front end over an [`AuditSink`].

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::models::{AuditFilter, AuditLogEntry, AuditPage};
use super::sink::AuditSink;
use crate::error::Result;
use crate::telemetry::AuditMetrics;

#[derive(Clone)]
enum Delivery {
    /// Entries are queued and written by a background task.
    Channel(mpsc::Sender<AuditLogEntry>),
    /// Entries are written before `record` returns.
    Inline,
}

/// Records audit entries without ever failing the caller.
///
/// Write errors, a full queue and a stopped writer are all logged and counted
/// in `keystone_audit_dropped_total`; none of them reach the caller.
#[derive(Clone)]
pub struct AuditLogger {
    sink: Arc<dyn AuditSink>,
    delivery: Delivery,
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("sink", &self.sink.name())
            .field("queued", &matches!(self.delivery, Delivery::Channel(_)))
            .finish()
    }
}

impl AuditLogger {
    /// Queue entries onto a channel of `buffer` slots drained by a spawned
    /// writer. Must be called inside a Tokio runtime.
    pub fn spawn(sink: Arc<dyn AuditSink>, buffer: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<AuditLogEntry>(buffer.max(1));
        let writer = sink.clone();
        tokio::spawn(async move {
            while let Some(entry) = rx.recv().await {
                if let Err(e) = writer.append(&entry).await {
                    AuditMetrics::dropped("sink_error");
                    warn!(target: "audit", operation = %entry.operation, error = %e, "Audit write failed");
                }
            }
            debug!(target: "audit", "Audit writer stopped");
        });

        Self {
            sink,
            delivery: Delivery::Channel(tx),
        }
    }

    /// Write each entry before returning.
    pub fn inline(sink: Arc<dyn AuditSink>) -> Self {
        Self {
            sink,
            delivery: Delivery::Inline,
        }
    }

    pub fn sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    pub async fn record(&self, entry: AuditLogEntry) {
        match &self.delivery {
            Delivery::Channel(tx) => match tx.try_send(entry) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(entry)) => {
                    AuditMetrics::dropped("queue_full");
                    warn!(target: "audit", operation = %entry.operation, "Audit queue full; entry dropped");
                }
                Err(mpsc::error::TrySendError::Closed(entry)) => {
                    AuditMetrics::dropped("closed");
                    warn!(target: "audit", operation = %entry.operation, "Audit writer stopped; entry dropped");
                }
            },
            Delivery::Inline => {
                if let Err(e) = self.sink.append(&entry).await {
                    AuditMetrics::dropped("sink_error");
                    warn!(target: "audit", operation = %entry.operation, error = %e, "Audit write failed");
                }
            }
        }
    }

    pub async fn query(&self, filter: &AuditFilter, limit: u32, offset: u32) -> Result<AuditPage> {
        self.sink.query(filter, limit, offset).await
    }
}
