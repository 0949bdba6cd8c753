//! # Error Handling Framework
//!
//! Error taxonomy and logging setup for the constitutional validation
//! pipeline.
//!
//! ## Features
//!
//! - One `Error` type with a closed `ErrorKind` taxonomy
//! - `ServiceError` for lifting component errors into `Error`
//! - Structured logging with JSON or text output and optional rolling files
//!

pub mod logging;
pub mod types;

pub use logging::{init_logging, log_structured_error};
pub use types::{Error, ErrorKind, Result, ServiceError};
