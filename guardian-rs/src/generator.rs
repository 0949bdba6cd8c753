// guardian-rs/src/generator.rs
// The external generative backend and its cost side-channel.

use std::sync::Arc;

use async_trait::async_trait;
use error_handling::{Error, ErrorKind, ServiceError};
use shared_types::{Severity, Task};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GeneratorError {
    #[error("generator backend error: {0}")]
    Backend(String),

    #[error("generator unavailable: {0}")]
    Unavailable(String),

    #[error("generator returned unusable output: {0}")]
    InvalidOutput(String),
}

impl ServiceError for GeneratorError {
    fn to_error(&self) -> Error {
        let err = Error::new(ErrorKind::GeneratorFailure, self.to_string())
            .service("generator")
            .severity(self.severity());
        if self.is_transient() {
            err.transient()
        } else {
            err
        }
    }

    fn is_transient(&self) -> bool {
        !matches!(self, GeneratorError::InvalidOutput(_))
    }

    fn severity(&self) -> Severity {
        Severity::High
    }
}

/// Produces artifact content for a task.
///
/// Calls may be slow or fail; the guardian cancels them on timeout or when
/// the reported cost crosses the ceiling. `task.refinements` carries the
/// feedback of earlier failed attempts.
#[async_trait]
pub trait Generator: Send + Sync {
    fn generator_id(&self) -> &str;

    async fn generate(
        &self,
        task: &Task,
        iteration: u32,
        cost: CostReporter,
    ) -> Result<String, GeneratorError>;
}

/// Incremental cost signal from a running generation.
#[derive(Debug, Clone)]
pub struct CostReporter {
    spent: Arc<watch::Sender<f64>>,
}

impl CostReporter {
    /// A reporter and the receiver the runtime monitor watches.
    pub fn channel() -> (Self, watch::Receiver<f64>) {
        let (spent, rx) = watch::channel(0.0);
        (
            Self {
                spent: Arc::new(spent),
            },
            rx,
        )
    }

    /// Adds `amount` to the running total.
    pub fn report(&self, amount: f64) {
        self.spent.send_modify(|spent| *spent += amount);
    }

    pub fn spent(&self) -> f64 {
        *self.spent.borrow()
    }
}
