//! Append-only audit trail of administrative changes and, optionally, of
//! every permission decision.
//!
//! ```rust,ignore
//! use keystone_core::audit::{AuditLogEntry, AuditLogger, AuditOperation, InMemoryAuditSink};
//!
//! let audit = AuditLogger::spawn(Arc::new(InMemoryAuditSink::new()), 1024);
//! audit.record(AuditLogEntry::new(AuditOperation::Grant, "admin-1").subject(&subject)).await;
//! ```

mod logger;
mod models;
mod sink;

pub use logger::AuditLogger;
pub use models::{AuditFilter, AuditLogEntry, AuditOperation, AuditPage, AuditResult};
pub use sink::{AuditSink, InMemoryAuditSink};
