// compliance-ledger-rs/src/audit.rs
// Append-only audit log. Each record participates in a SHA-256 hash chain;
// the optional NDJSON file is verified when it is reopened.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use shared_types::{Decision, GuardianVerdict, Phase};
use tracing::{debug, info};

use crate::LedgerError;

/// `prev_hash` of the first record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A validation event before it is sequenced and chained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub task_id: String,
    pub phase: Phase,
    pub decision: Decision,
    pub violated_policy_ids: Vec<String>,
    pub iteration: u32,
}

impl AuditEvent {
    pub fn from_verdict(task_id: impl Into<String>, iteration: u32, verdict: &GuardianVerdict) -> Self {
        Self {
            task_id: task_id.into(),
            phase: verdict.phase,
            decision: verdict.decision,
            violated_policy_ids: verdict.violated_policy_ids(),
            iteration,
        }
    }
}

/// One immutable line of the audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub task_id: String,
    pub phase: Phase,
    pub decision: Decision,
    pub violated_policy_ids: Vec<String>,
    pub iteration: u32,
    pub prev_hash: String,
    pub hash: String,
}

/// Every field except `hash`, in a fixed order.
#[derive(Serialize)]
struct ChainedFields<'a> {
    sequence: u64,
    timestamp: &'a DateTime<Utc>,
    task_id: &'a str,
    phase: Phase,
    decision: Decision,
    violated_policy_ids: &'a [String],
    iteration: u32,
    prev_hash: &'a str,
}

impl AuditRecord {
    fn chained(sequence: u64, prev_hash: String, event: AuditEvent) -> Result<Self, LedgerError> {
        let mut record = Self {
            sequence,
            timestamp: Utc::now(),
            task_id: event.task_id,
            phase: event.phase,
            decision: event.decision,
            violated_policy_ids: event.violated_policy_ids,
            iteration: event.iteration,
            prev_hash,
            hash: String::new(),
        };
        record.hash = record.compute_hash()?;
        Ok(record)
    }

    /// SHA-256 over the record's fields, hex encoded.
    pub fn compute_hash(&self) -> Result<String, LedgerError> {
        let fields = ChainedFields {
            sequence: self.sequence,
            timestamp: &self.timestamp,
            task_id: &self.task_id,
            phase: self.phase,
            decision: self.decision,
            violated_policy_ids: &self.violated_policy_ids,
            iteration: self.iteration,
            prev_hash: &self.prev_hash,
        };
        let mut hasher = Sha256::new();
        hasher.update(serde_json::to_vec(&fields)?);
        Ok(hex(&hasher.finalize()))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Running position in a chain: the next expected sequence and the hash it
/// must link to.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ChainCursor {
    next_sequence: u64,
    head: String,
}

impl ChainCursor {
    fn genesis() -> Self {
        Self {
            next_sequence: 0,
            head: GENESIS_HASH.to_string(),
        }
    }

    /// Checks `record` against the cursor and advances past it.
    fn accept(&mut self, record: &AuditRecord) -> Result<(), LedgerError> {
        let sequence = self.next_sequence;
        if record.sequence != sequence {
            return Err(LedgerError::ChainBroken {
                sequence: record.sequence,
                reason: format!("expected sequence {sequence}"),
            });
        }
        if record.prev_hash != self.head {
            return Err(LedgerError::ChainBroken {
                sequence,
                reason: "prev_hash does not match the preceding record".to_string(),
            });
        }
        if record.compute_hash()? != record.hash {
            return Err(LedgerError::ChainBroken {
                sequence,
                reason: "record hash mismatch; possible tampering".to_string(),
            });
        }
        self.head = record.hash.clone();
        self.next_sequence += 1;
        Ok(())
    }
}

/// Checks sequence continuity, `prev_hash` linkage and every record hash.
pub fn verify_chain(records: &[AuditRecord]) -> Result<(), LedgerError> {
    let mut cursor = ChainCursor::genesis();
    records.iter().try_for_each(|record| cursor.accept(record))
}

#[derive(Debug)]
enum Store {
    Memory(Vec<AuditRecord>),
    /// Only the chain head stays in memory; reads stream the file.
    File { file: File, path: PathBuf },
}

/// Audit log owned by the recorder actor.
#[derive(Debug)]
pub struct AuditLog {
    store: Store,
    cursor: ChainCursor,
}

impl AuditLog {
    pub fn in_memory() -> Self {
        Self {
            store: Store::Memory(Vec::new()),
            cursor: ChainCursor::genesis(),
        }
    }

    /// Opens (or creates) a durable log, verifying the existing chain.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let mut cursor = ChainCursor::genesis();
        if path.exists() {
            scan(&path, |record| cursor.accept(&record))?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), records = cursor.next_sequence, "audit log opened");

        Ok(Self {
            store: Store::File { file, path },
            cursor,
        })
    }

    /// Sequences, chains and persists `event`. The chain head only advances
    /// once the line is written.
    pub fn append(&mut self, event: AuditEvent) -> Result<AuditRecord, LedgerError> {
        let record = AuditRecord::chained(self.cursor.next_sequence, self.cursor.head.clone(), event)?;

        match &mut self.store {
            Store::Memory(records) => records.push(record.clone()),
            Store::File { file, .. } => {
                let mut line = serde_json::to_vec(&record)?;
                line.push(b'\n');
                file.write_all(&line)?;
                file.flush()?;
            }
        }

        self.cursor.head = record.hash.clone();
        self.cursor.next_sequence += 1;
        debug!(sequence = record.sequence, task_id = %record.task_id, "audit record appended");
        Ok(record)
    }

    /// Hash of the last record, or the genesis hash.
    pub fn head(&self) -> &str {
        &self.cursor.head
    }

    /// Every record, in sequence order. A durable log is re-read and
    /// re-verified.
    pub fn records(&self) -> Result<Vec<AuditRecord>, LedgerError> {
        self.collect(|_| true)
    }

    pub fn records_for(&self, task_id: &str) -> Result<Vec<AuditRecord>, LedgerError> {
        self.collect(|record| record.task_id == task_id)
    }

    fn collect(&self, keep: impl Fn(&AuditRecord) -> bool) -> Result<Vec<AuditRecord>, LedgerError> {
        match &self.store {
            Store::Memory(records) => Ok(records.iter().filter(|r| keep(r)).cloned().collect()),
            Store::File { path, .. } => {
                let mut cursor = ChainCursor::genesis();
                let mut out = Vec::new();
                scan(path, |record| {
                    cursor.accept(&record)?;
                    if keep(&record) {
                        out.push(record);
                    }
                    Ok(())
                })?;
                Ok(out)
            }
        }
    }

    pub fn len(&self) -> u64 {
        self.cursor.next_sequence
    }

    pub fn is_empty(&self) -> bool {
        self.cursor.next_sequence == 0
    }

    pub fn path(&self) -> Option<&Path> {
        match &self.store {
            Store::Memory(_) => None,
            Store::File { path, .. } => Some(path),
        }
    }
}

/// Streams the NDJSON records of `path` into `visit`, one line at a time.
fn scan(
    path: &Path,
    mut visit: impl FnMut(AuditRecord) -> Result<(), LedgerError>,
) -> Result<(), LedgerError> {
    let reader = BufReader::new(File::open(path)?);
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line).map_err(|e| LedgerError::Corrupt {
            line: index + 1,
            reason: e.to_string(),
        })?;
        visit(record)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::PolicyCheckResult;
    use shared_types::Severity;

    fn event(task_id: &str, iteration: u32) -> AuditEvent {
        let verdict = GuardianVerdict::new(
            Phase::Post,
            Decision::Rejected,
            vec![PolicyCheckResult::fail("completeness", Severity::High, "TODO marker")],
        );
        AuditEvent::from_verdict(task_id, iteration, &verdict)
    }

    #[test]
    fn records_are_sequenced_and_chained() {
        let mut log = AuditLog::in_memory();
        let first = log.append(event("a", 0)).unwrap();
        let second = log.append(event("a", 1)).unwrap();

        assert_eq!(first.sequence, 0);
        assert_eq!(first.prev_hash, GENESIS_HASH);
        assert_eq!(second.prev_hash, first.hash);
        assert_eq!(first.violated_policy_ids, vec!["completeness".to_string()]);
        assert_eq!(first.hash.len(), 64);
        verify_chain(&log.records().unwrap()).unwrap();
    }

    #[test]
    fn reopened_file_continues_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit").join("audit.ndjson");

        let head = {
            let mut log = AuditLog::open(&path).unwrap();
            log.append(event("a", 0)).unwrap();
            log.append(event("b", 0)).unwrap();
            log.head().to_string()
        };

        let mut log = AuditLog::open(&path).unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log.head(), head);
        let third = log.append(event("a", 1)).unwrap();
        assert_eq!(third.sequence, 2);
        assert_eq!(third.prev_hash, head);
        assert_eq!(log.records_for("a").unwrap().len(), 2);
        verify_chain(&log.records().unwrap()).unwrap();
    }

    #[test]
    fn durable_log_reads_trail_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        let mut log = AuditLog::open(&path).unwrap();
        for i in 0..3 {
            log.append(event("a", i)).unwrap();
            log.append(event("b", i)).unwrap();
        }

        let trail = log.records_for("b").unwrap();
        assert_eq!(trail.len(), 3);
        assert_eq!(trail.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![1, 3, 5]);

        // Edits made behind the log's back surface on the next read.
        let original = fs::read_to_string(&path).unwrap();
        fs::write(&path, original.replacen("\"REJECTED\"", "\"APPROVED\"", 1)).unwrap();
        assert!(matches!(
            log.records_for("b"),
            Err(LedgerError::ChainBroken { sequence: 0, .. })
        ));
    }

    #[test]
    fn tampered_file_fails_verification() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        {
            let mut log = AuditLog::open(&path).unwrap();
            log.append(event("a", 0)).unwrap();
            log.append(event("a", 1)).unwrap();
        }

        let original = fs::read_to_string(&path).unwrap();
        fs::write(&path, original.replacen("\"REJECTED\"", "\"APPROVED\"", 1)).unwrap();

        let err = AuditLog::open(&path).unwrap_err();
        assert!(matches!(err, LedgerError::ChainBroken { sequence: 0, .. }));
    }

    #[test]
    fn dropped_record_breaks_linkage() {
        let mut log = AuditLog::in_memory();
        for i in 0..3 {
            log.append(event("a", i)).unwrap();
        }
        let mut records = log.records().unwrap();
        records.remove(1);
        assert!(verify_chain(&records).is_err());
    }

    #[test]
    fn garbage_line_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.ndjson");
        fs::write(&path, "not json\n").unwrap();
        let err = AuditLog::open(&path).unwrap_err();
        assert!(matches!(err, LedgerError::Corrupt { line: 1, .. }));
    }
}
