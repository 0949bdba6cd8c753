// compliance-ledger-rs/src/lib.rs
// Metrics & audit recorder for the constitutional validation pipeline.
//
// - Append-only audit log, one record per validation event
// - Records participate in a SHA-256 hash chain for tamper detection
// - Compliance counters owned by a single-writer actor
// - Public API:
//     * MetricsRecorder::record / task_completed
//     * MetricsRecorder::snapshot / audit_trail

use error_handling::{Error, ErrorKind, ServiceError};
use shared_types::Severity;

pub mod audit;
pub mod recorder;

pub use audit::{verify_chain, AuditEvent, AuditLog, AuditRecord, GENESIS_HASH};
pub use recorder::{ComplianceTargets, MetricsRecorder, TaskResolution};

/// Errors produced by the ledger.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("audit log line {line} is unreadable: {reason}")]
    Corrupt { line: usize, reason: String },

    #[error("audit chain broken at sequence {sequence}: {reason}")]
    ChainBroken { sequence: u64, reason: String },

    #[error("metrics recorder is not running")]
    RecorderClosed,
}

impl ServiceError for LedgerError {
    fn to_error(&self) -> Error {
        let kind = match self {
            LedgerError::Serde(_) => ErrorKind::Serialization,
            LedgerError::RecorderClosed => ErrorKind::Internal,
            _ => ErrorKind::Storage,
        };
        Error::new(kind, self.to_string())
            .service("compliance-ledger")
            .severity(self.severity())
    }

    fn is_transient(&self) -> bool {
        matches!(self, LedgerError::Io(_))
    }

    fn severity(&self) -> Severity {
        match self {
            LedgerError::ChainBroken { .. } | LedgerError::Corrupt { .. } => Severity::Critical,
            _ => Severity::High,
        }
    }
}

impl From<LedgerError> for Error {
    fn from(err: LedgerError) -> Self {
        err.to_error()
    }
}
