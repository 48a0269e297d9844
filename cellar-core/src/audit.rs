//! Audit log entries and the sink contract they are written through.

use serde_derive::{Deserialize, Serialize};

use crate::error::CResult;
use crate::model::Version;
use crate::policy::Action;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: u64,
    /// RFC3339 timestamp, rendered by the caller (a facade always has a
    /// clock; `cellar-core` itself stays clock-agnostic in its tests).
    pub time: String,
    pub principal: String,
    pub action: Action,
    pub secret: Option<String>,
    pub secret_version: Option<Version>,
    pub authorized: bool,
}

/// The audit-log sink contract: `write_entries` appends JSON-lines;
/// `sync`/`close` are optional extensions a concrete sink may implement.
pub trait AuditSink: Send + Sync {
    fn write_entries(&self, entries: &[AuditEntry]) -> CResult<()>;

    fn sync(&self) -> CResult<()> {
        Ok(())
    }

    fn close(&self) -> CResult<()> {
        Ok(())
    }
}

/// An in-memory sink, useful for facade tests that assert on audit-before-
/// effect ordering without standing up a file.
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: std::sync::Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().unwrap().clone()
    }
}

impl AuditSink for MemoryAuditSink {
    fn write_entries(&self, entries: &[AuditEntry]) -> CResult<()> {
        self.entries.lock().unwrap().extend_from_slice(entries);
        Ok(())
    }
}

/// An audit sink that always fails, used to exercise the "audit failure
/// prevents the mutation" contract.
pub struct FailingAuditSink;

impl AuditSink for FailingAuditSink {
    fn write_entries(&self, _entries: &[AuditEntry]) -> CResult<()> {
        Err(crate::error::Error::internal("audit sink unavailable"))
    }
}
