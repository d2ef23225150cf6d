//! Audit sink collaborator.

use async_trait::async_trait;
use parking_lot::RwLock;

use super::models::{AuditFilter, AuditLogEntry, AuditPage};
use crate::error::Result;

/// Durable, append-only store of audit entries.
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, entry: &AuditLogEntry) -> Result<()>;

    /// Entries matching `filter`, newest first.
    async fn query(&self, filter: &AuditFilter, limit: u32, offset: u32) -> Result<AuditPage>;

    fn name(&self) -> &'static str;
}

/// Process-local sink.
#[derive(Debug, Default)]
pub struct InMemoryAuditSink {
    entries: RwLock<Vec<AuditLogEntry>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Everything appended so far, oldest first.
    pub fn snapshot(&self) -> Vec<AuditLogEntry> {
        self.entries.read().clone()
    }
}

#[async_trait]
impl AuditSink for InMemoryAuditSink {
    async fn append(&self, entry: &AuditLogEntry) -> Result<()> {
        self.entries.write().push(entry.clone());
        Ok(())
    }

    async fn query(&self, filter: &AuditFilter, limit: u32, offset: u32) -> Result<AuditPage> {
        let entries = self.entries.read();
        let matching: Vec<&AuditLogEntry> = entries.iter().rev().filter(|e| filter.matches(e)).collect();

        Ok(AuditPage {
            total: matching.len() as u64,
            entries: matching
                .into_iter()
                .skip(offset as usize)
                .take(limit as usize)
                .cloned()
                .collect(),
        })
    }

    fn name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditOperation;

    #[tokio::test]
    async fn test_query_pages_newest_first() {
        let sink = InMemoryAuditSink::new();
        for i in 0..5 {
            sink.append(&AuditLogEntry::new(AuditOperation::Grant, format!("admin-{}", i)))
                .await
                .unwrap();
        }
        sink.append(&AuditLogEntry::new(AuditOperation::Check, "u1")).await.unwrap();

        let filter = AuditFilter {
            operation: Some(AuditOperation::Grant),
            ..Default::default()
        };
        let page = sink.query(&filter, 2, 1).await.unwrap();

        assert_eq!(page.total, 5);
        assert_eq!(page.entries.len(), 2);
        assert_eq!(page.entries[0].performed_by, "admin-3");
        assert_eq!(page.entries[1].performed_by, "admin-2");
    }
}
