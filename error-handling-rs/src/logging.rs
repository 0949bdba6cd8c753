//! # Structured Logging
//!
//! Global `tracing` subscriber setup plus severity-aware error logging.

use std::sync::atomic::{AtomicBool, Ordering};

use once_cell::sync::OnceCell;
use shared_types::config::LoggingConfig;
use shared_types::Severity;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, EnvFilter, Registry};

use crate::types::{Error, ErrorKind, Result};

// Flag to track if logging has been initialized
static LOGGING_INITIALIZED: AtomicBool = AtomicBool::new(false);

// Keeps the non-blocking file writer flushing for the life of the process.
static FILE_GUARD: OnceCell<WorkerGuard> = OnceCell::new();

/// Builds the filter directive for a configured level.
///
/// `RUST_LOG` wins when set.
pub fn filter_directive(config: &LoggingConfig) -> String {
    format!("{},hyper=warn,h2=warn", config.level.trim().to_ascii_lowercase())
}

/// Initializes the structured logging system. Calling it twice is a no-op.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    if LOGGING_INITIALIZED.load(Ordering::SeqCst) {
        return Ok(());
    }

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(filter_directive(config)))
        .map_err(|e| {
            Error::new(ErrorKind::Configuration, format!("Invalid log level: {}", e))
                .service(config.service_name.clone())
        })?;

    let json_layer = config.json_format.then(|| {
        fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_target(true)
            .with_span_list(true)
    });
    let text_layer = (!config.json_format).then(|| {
        fmt::layer()
            .with_target(true)
            .with_thread_ids(true)
            .with_thread_names(true)
    });

    let file_layer = match (config.file_output, config.log_dir.as_deref()) {
        (true, Some(log_dir)) => {
            let file_appender = RollingFileAppender::new(
                Rotation::DAILY,
                log_dir,
                format!("{}.log", config.service_name),
            );
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            let _ = FILE_GUARD.set(guard);
            Some(
                fmt::layer()
                    .json()
                    .with_writer(non_blocking)
                    .with_ansi(false),
            )
        }
        _ => None,
    };

    let subscriber = Registry::default()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer);

    tracing::subscriber::set_global_default(subscriber).map_err(|e| {
        Error::new(
            ErrorKind::Configuration,
            format!("Failed to set global subscriber: {}", e),
        )
    })?;

    LOGGING_INITIALIZED.store(true, Ordering::SeqCst);

    tracing::info!(
        service = %config.service_name,
        level = %config.level,
        json = %config.json_format,
        "Structured logging initialized"
    );

    Ok(())
}

/// Logs an error at the level matching its severity and counts it.
pub fn log_structured_error(error: &Error) {
    use tracing::{error, info, warn};

    let task_id = error.task_id.as_deref().unwrap_or("none");
    let service = error.service.as_deref().unwrap_or("unknown");

    metrics::increment_counter!(
        "constitution_errors_total",
        "kind" => error.kind.to_string(),
        "severity" => error.severity.to_string()
    );

    match error.severity {
        Severity::Critical => {
            error!(
                error_id = %error.id,
                error_kind = %error.kind,
                task_id = %task_id,
                service = %service,
                message = %error.message,
                code = ?error.code,
                severity = %error.severity,
                transient = %error.transient,
                context = ?error.context,
                "Critical error occurred"
            );
        }
        Severity::High => {
            error!(
                error_id = %error.id,
                error_kind = %error.kind,
                task_id = %task_id,
                service = %service,
                message = %error.message,
                code = ?error.code,
                severity = %error.severity,
                "Error occurred"
            );
        }
        Severity::Medium => {
            warn!(
                error_id = %error.id,
                error_kind = %error.kind,
                task_id = %task_id,
                service = %service,
                message = %error.message,
                code = ?error.code,
                "Warning occurred"
            );
        }
        Severity::Low => {
            info!(
                error_id = %error.id,
                error_kind = %error.kind,
                task_id = %task_id,
                service = %service,
                message = %error.message,
                "Recoverable error"
            );
        }
    }
}
