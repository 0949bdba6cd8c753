//! # Standardized Error Types
//!
//! Error taxonomy shared by every stage of the constitutional pipeline.
//! Policy findings are not errors: they travel as `PolicyCheckResult`
//! values. `Error` covers the failures that stop a component from
//! producing such a value.

use std::error::Error as StdError;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shared_types::{ConfigError, Severity};
use uuid::Uuid;

/// A type alias for Result with the error type defaulting to our Error
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Categorizes different kinds of errors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Invalid or unreadable configuration
    Configuration,
    /// A generated artifact or intended action violated a principle
    PolicyViolation,
    /// The generator failed, timed out or exceeded its cost ceiling
    GeneratorFailure,
    /// Rate limit or circuit breaker denied the call
    ResourceExhausted,
    /// The correction loop ran out of iterations
    IterationBoundExceeded,
    /// A policy check raised instead of returning a result
    InternalCheckFailure,
    /// Audit log or escalation queue persistence failed
    Storage,
    /// Input/output error
    IO,
    /// Encoding or decoding failed
    Serialization,
    /// Internal component failure (closed channel, poisoned state)
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "Configuration Error"),
            ErrorKind::PolicyViolation => write!(f, "Policy Violation"),
            ErrorKind::GeneratorFailure => write!(f, "Generator Failure"),
            ErrorKind::ResourceExhausted => write!(f, "Resource Exhausted"),
            ErrorKind::IterationBoundExceeded => write!(f, "Iteration Bound Exceeded"),
            ErrorKind::InternalCheckFailure => write!(f, "Internal Check Failure"),
            ErrorKind::Storage => write!(f, "Storage Error"),
            ErrorKind::IO => write!(f, "I/O Error"),
            ErrorKind::Serialization => write!(f, "Serialization Error"),
            ErrorKind::Internal => write!(f, "Internal Error"),
        }
    }
}

/// Core error type of the pipeline.
///
/// `Clone` drops the opaque `cause`; every structured field is kept.
#[derive(Debug, Serialize, Deserialize)]
pub struct Error {
    pub id: Uuid,
    pub kind: ErrorKind,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    /// Component where the error originated
    pub service: Option<String>,
    /// Task being processed when the error occurred
    pub task_id: Option<String>,
    pub code: Option<String>,
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
    #[serde(skip)]
    pub cause: Option<Box<dyn StdError + Send + Sync>>,
    /// Whether the operation might succeed on retry
    pub transient: bool,
}

impl Clone for Error {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            kind: self.kind.clone(),
            message: self.message.clone(),
            timestamp: self.timestamp,
            severity: self.severity,
            service: self.service.clone(),
            task_id: self.task_id.clone(),
            code: self.code.clone(),
            context: self.context.clone(),
            cause: None,
            transient: self.transient,
        }
    }
}

impl Error {
    /// Creates a new error with the specified kind and message
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            message: message.into(),
            timestamp: Utc::now(),
            severity: Severity::High,
            service: None,
            task_id: None,
            code: None,
            context: serde_json::Map::new(),
            cause: None,
            transient: false,
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn service<S: Into<String>>(mut self, service: S) -> Self {
        self.service = Some(service.into());
        self
    }

    pub fn task<S: Into<String>>(mut self, task_id: S) -> Self {
        self.task_id = Some(task_id.into());
        self
    }

    pub fn code<S: Into<String>>(mut self, code: S) -> Self {
        self.code = Some(code.into());
        self
    }

    /// Adds context information to the error
    pub fn context<K, V>(mut self, key: K, value: V) -> Self
    where
        K: Into<String>,
        V: Serialize,
    {
        if let Ok(value) = serde_json::to_value(value) {
            self.context.insert(key.into(), value);
        }
        self
    }

    /// Chains this error with its cause
    pub fn cause<E>(mut self, cause: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Marks this error as transient (can be retried)
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.kind, self.message)?;

        if let Some(code) = &self.code {
            write!(f, " (Code: {})", code)?;
        }

        if let Some(service) = &self.service {
            write!(f, " [Service: {}]", service)?;
        }

        if let Some(task_id) = &self.task_id {
            write!(f, " [Task: {}]", task_id)?;
        }

        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.cause
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Self::new(ErrorKind::IO, err.to_string()).cause(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Serialization, format!("JSON error: {}", err)).cause(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Self::new(ErrorKind::Configuration, err.to_string())
            .severity(Severity::Critical)
            .cause(err)
    }
}

/// Implemented by component error types so they can be lifted into `Error`.
pub trait ServiceError: StdError + Send + Sync + 'static {
    fn to_error(&self) -> Error;

    /// Returns true if this error is transient and might succeed on retry
    fn is_transient(&self) -> bool;

    fn severity(&self) -> Severity;
}
