// self-correct-rs/src/escalation.rs
// Hand-off of unresolved tasks to human review.
//
// Implementation notes:
// - The durable queue is two append-only NDJSON files: tickets and
//   acknowledgements.
// - Delivery is at-least-once: `pending` returns every ticket until it is
//   acknowledged.
// - The engine writes through `OutboxQueue`, which holds any ticket the
//   backing queue refuses and redelivers it on the next queue operation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use error_handling::{log_structured_error, Error, ErrorKind, ServiceError};
use serde::{Deserialize, Serialize};
use shared_types::config::EscalationConfig;
use shared_types::{EscalationTicket, Severity};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl ServiceError for QueueError {
    fn to_error(&self) -> Error {
        let kind = match self {
            QueueError::Io(_) => ErrorKind::Storage,
            QueueError::Serde(_) => ErrorKind::Serialization,
        };
        let err = Error::new(kind, self.to_string())
            .service("escalation-queue")
            .severity(self.severity());
        if self.is_transient() {
            err.transient()
        } else {
            err
        }
    }

    fn is_transient(&self) -> bool {
        matches!(self, QueueError::Io(_))
    }

    fn severity(&self) -> Severity {
        Severity::High
    }
}

#[async_trait]
pub trait EscalationQueue: Send + Sync {
    async fn enqueue(&self, ticket: &EscalationTicket) -> Result<(), QueueError>;

    /// Unacknowledged tickets, oldest first.
    async fn pending(&self) -> Result<Vec<EscalationTicket>, QueueError>;

    /// Marks a ticket as handled. Returns false when the ticket is unknown
    /// or was already acknowledged.
    async fn acknowledge(&self, ticket_id: &str) -> Result<bool, QueueError>;
}

/// Queue selected by configuration: durable when a path is set.
pub fn queue_from_config(config: &EscalationConfig) -> Arc<dyn EscalationQueue> {
    match &config.queue_path {
        Some(path) => Arc::new(FileEscalationQueue::new(path)),
        None => Arc::new(InMemoryEscalationQueue::default()),
    }
}

#[derive(Debug, Default)]
pub struct InMemoryEscalationQueue {
    inner: Mutex<MemoryQueue>,
}

#[derive(Debug, Default)]
struct MemoryQueue {
    tickets: Vec<EscalationTicket>,
    acknowledged: HashSet<String>,
}

#[async_trait]
impl EscalationQueue for InMemoryEscalationQueue {
    async fn enqueue(&self, ticket: &EscalationTicket) -> Result<(), QueueError> {
        self.inner.lock().await.tickets.push(ticket.clone());
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<EscalationTicket>, QueueError> {
        let inner = self.inner.lock().await;
        Ok(unacknowledged(inner.tickets.iter().cloned(), &inner.acknowledged))
    }

    async fn acknowledge(&self, ticket_id: &str) -> Result<bool, QueueError> {
        let mut inner = self.inner.lock().await;
        let known = inner.tickets.iter().any(|t| t.ticket_id == ticket_id);
        Ok(known && inner.acknowledged.insert(ticket_id.to_string()))
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Acknowledgement {
    ticket_id: String,
    acknowledged_at: DateTime<Utc>,
}

/// NDJSON ticket log plus a sibling `*.acks.ndjson` acknowledgement log.
#[derive(Debug)]
pub struct FileEscalationQueue {
    tickets_path: PathBuf,
    acks_path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileEscalationQueue {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let tickets_path = path.into();
        let acks_path = tickets_path.with_extension("acks.ndjson");
        Self {
            tickets_path,
            acks_path,
            write_lock: Mutex::new(()),
        }
    }

    pub fn tickets_path(&self) -> &Path {
        &self.tickets_path
    }

    pub fn acks_path(&self) -> &Path {
        &self.acks_path
    }

    async fn append_line<T: Serialize>(path: &Path, value: &T) -> Result<(), QueueError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        let mut line = serde_json::to_vec(value)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn read_lines<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<Vec<T>, QueueError> {
        let buf = match fs::read_to_string(path).await {
            Ok(buf) => buf,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut out = Vec::new();
        for line in buf.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str(line) {
                Ok(value) => out.push(value),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable queue line")
                }
            }
        }
        Ok(out)
    }

    async fn acknowledged(&self) -> Result<HashSet<String>, QueueError> {
        let acks: Vec<Acknowledgement> = Self::read_lines(&self.acks_path).await?;
        Ok(acks.into_iter().map(|a| a.ticket_id).collect())
    }
}

#[async_trait]
impl EscalationQueue for FileEscalationQueue {
    async fn enqueue(&self, ticket: &EscalationTicket) -> Result<(), QueueError> {
        let _guard = self.write_lock.lock().await;
        Self::append_line(&self.tickets_path, ticket).await?;
        debug!(ticket_id = %ticket.ticket_id, task_id = %ticket.task_id, "escalation ticket written");
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<EscalationTicket>, QueueError> {
        let tickets: Vec<EscalationTicket> = Self::read_lines(&self.tickets_path).await?;
        let acknowledged = self.acknowledged().await?;
        Ok(unacknowledged(tickets.into_iter(), &acknowledged))
    }

    async fn acknowledge(&self, ticket_id: &str) -> Result<bool, QueueError> {
        let _guard = self.write_lock.lock().await;
        let tickets: Vec<EscalationTicket> = Self::read_lines(&self.tickets_path).await?;
        if !tickets.iter().any(|t| t.ticket_id == ticket_id) {
            return Ok(false);
        }
        if self.acknowledged().await?.contains(ticket_id) {
            return Ok(false);
        }
        Self::append_line(
            &self.acks_path,
            &Acknowledgement {
                ticket_id: ticket_id.to_string(),
                acknowledged_at: Utc::now(),
            },
        )
        .await?;
        Ok(true)
    }
}

/// Write-through wrapper that never loses a ticket: a ticket the backing
/// queue refuses is held in memory, reported by `pending`, and retried on
/// every later `enqueue` or `pending` call.
pub struct OutboxQueue {
    inner: Arc<dyn EscalationQueue>,
    outbox: Mutex<Vec<EscalationTicket>>,
}

impl OutboxQueue {
    pub fn new(inner: Arc<dyn EscalationQueue>) -> Self {
        Self {
            inner,
            outbox: Mutex::new(Vec::new()),
        }
    }

    /// Tickets still waiting for the backing queue.
    pub async fn held(&self) -> usize {
        self.outbox.lock().await.len()
    }

    /// Retries every held ticket in order; returns how many were delivered.
    pub async fn flush(&self) -> usize {
        let mut outbox = self.outbox.lock().await;
        if outbox.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for ticket in std::mem::take(&mut *outbox) {
            match self.inner.enqueue(&ticket).await {
                Ok(()) => delivered += 1,
                Err(err) => {
                    debug!(ticket_id = %ticket.ticket_id, error = %err, "escalation still held");
                    outbox.push(ticket);
                }
            }
        }

        if delivered > 0 {
            info!(delivered, held = outbox.len(), "held escalation tickets delivered");
        }
        metrics::gauge!("constitution_escalation_outbox", outbox.len() as f64);
        delivered
    }
}

#[async_trait]
impl EscalationQueue for OutboxQueue {
    async fn enqueue(&self, ticket: &EscalationTicket) -> Result<(), QueueError> {
        self.flush().await;
        if let Err(err) = self.inner.enqueue(ticket).await {
            log_structured_error(&err.to_error().task(ticket.task_id.clone()));
            warn!(ticket_id = %ticket.ticket_id, "escalation held until the queue recovers");
            let mut outbox = self.outbox.lock().await;
            outbox.push(ticket.clone());
            metrics::gauge!("constitution_escalation_outbox", outbox.len() as f64);
        }
        Ok(())
    }

    async fn pending(&self) -> Result<Vec<EscalationTicket>, QueueError> {
        self.flush().await;
        let delivered = self.inner.pending().await?;
        let outbox = self.outbox.lock().await;

        let mut tickets = unacknowledged(
            delivered.into_iter().chain(outbox.iter().cloned()),
            &HashSet::new(),
        );
        tickets.sort_by_key(|t| t.created_at);
        Ok(tickets)
    }

    async fn acknowledge(&self, ticket_id: &str) -> Result<bool, QueueError> {
        {
            let mut outbox = self.outbox.lock().await;
            if let Some(position) = outbox.iter().position(|t| t.ticket_id == ticket_id) {
                outbox.remove(position);
                return Ok(true);
            }
        }
        self.inner.acknowledge(ticket_id).await
    }
}

/// Drops acknowledged tickets and repeated deliveries of the same ticket.
fn unacknowledged(
    tickets: impl Iterator<Item = EscalationTicket>,
    acknowledged: &HashSet<String>,
) -> Vec<EscalationTicket> {
    let mut seen = HashSet::new();
    tickets
        .filter(|t| !acknowledged.contains(&t.ticket_id))
        .filter(|t| seen.insert(t.ticket_id.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::EscalationReason;

    fn ticket(task_id: &str) -> EscalationTicket {
        EscalationTicket::new(task_id, EscalationReason::RestrictedWindow, Vec::new())
    }

    #[tokio::test]
    async fn in_memory_queue_redelivers_until_acknowledged() {
        let queue = InMemoryEscalationQueue::default();
        let first = ticket("a");
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&ticket("b")).await.unwrap();

        assert_eq!(queue.pending().await.unwrap().len(), 2);
        assert_eq!(queue.pending().await.unwrap().len(), 2);

        assert!(queue.acknowledge(&first.ticket_id).await.unwrap());
        assert!(!queue.acknowledge(&first.ticket_id).await.unwrap());
        assert!(!queue.acknowledge("missing").await.unwrap());

        let pending = queue.pending().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].task_id, "b");
    }

    #[tokio::test]
    async fn file_queue_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue").join("escalations.ndjson");
        let first = ticket("a");
        let second = ticket("b");

        {
            let queue = FileEscalationQueue::new(&path);
            queue.enqueue(&first).await.unwrap();
            queue.enqueue(&second).await.unwrap();
            // A retried hand-off writes the same ticket twice.
            queue.enqueue(&second).await.unwrap();
            assert!(queue.acknowledge(&first.ticket_id).await.unwrap());
            assert!(queue.acks_path().ends_with("escalations.acks.ndjson"));
        }

        let reopened = FileEscalationQueue::new(&path);
        let pending = reopened.pending().await.unwrap();
        assert_eq!(pending, vec![second.clone()]);
        assert!(!reopened.acknowledge(&first.ticket_id).await.unwrap());
        assert!(reopened.acknowledge(&second.ticket_id).await.unwrap());
        assert!(reopened.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_files_mean_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = FileEscalationQueue::new(dir.path().join("none.ndjson"));
        assert!(queue.pending().await.unwrap().is_empty());
    }

    /// Refuses the first `failures` enqueues, then stores tickets in memory.
    struct Flaky {
        failures: std::sync::atomic::AtomicUsize,
        store: InMemoryEscalationQueue,
    }

    impl Flaky {
        fn failing(failures: usize) -> Arc<Self> {
            Arc::new(Self {
                failures: std::sync::atomic::AtomicUsize::new(failures),
                store: InMemoryEscalationQueue::default(),
            })
        }
    }

    #[async_trait]
    impl EscalationQueue for Flaky {
        async fn enqueue(&self, ticket: &EscalationTicket) -> Result<(), QueueError> {
            use std::sync::atomic::Ordering;
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(QueueError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.store.enqueue(ticket).await
        }

        async fn pending(&self) -> Result<Vec<EscalationTicket>, QueueError> {
            self.store.pending().await
        }

        async fn acknowledge(&self, ticket_id: &str) -> Result<bool, QueueError> {
            self.store.acknowledge(ticket_id).await
        }
    }

    #[tokio::test]
    async fn outbox_holds_refused_ticket_until_delivered() {
        let backing = Flaky::failing(1);
        let queue = OutboxQueue::new(backing.clone());
        let refused = ticket("a");

        queue.enqueue(&refused).await.unwrap();
        assert_eq!(queue.held().await, 1);
        assert!(backing.store.pending().await.unwrap().is_empty());

        // The next operation redelivers it to the backing queue.
        let pending = queue.pending().await.unwrap();
        assert_eq!(pending, vec![refused.clone()]);
        assert_eq!(queue.held().await, 0);
        assert_eq!(backing.store.pending().await.unwrap(), vec![refused.clone()]);

        assert!(queue.acknowledge(&refused.ticket_id).await.unwrap());
        assert!(queue.pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn held_ticket_can_be_acknowledged() {
        let queue = OutboxQueue::new(Flaky::failing(usize::MAX));
        let first = ticket("a");
        let second = ticket("b");
        queue.enqueue(&first).await.unwrap();
        queue.enqueue(&second).await.unwrap();

        assert_eq!(queue.pending().await.unwrap(), vec![first.clone(), second.clone()]);
        assert!(queue.acknowledge(&first.ticket_id).await.unwrap());
        assert_eq!(queue.pending().await.unwrap(), vec![second]);
        assert_eq!(queue.held().await, 1);
    }

    #[test]
    fn config_selects_backend() {
        let queue = queue_from_config(&EscalationConfig::default());
        let pending = tokio_test::block_on(queue.pending()).unwrap();
        assert!(pending.is_empty());
    }
}
