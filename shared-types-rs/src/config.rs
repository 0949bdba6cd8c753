// shared-types-rs/src/config.rs
// Centralized configuration loader for the constitutional pipeline.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveTime;

use crate::verdict::{EnforcementMode, Severity};

static CONSTITUTION_CONFIG: OnceCell<Arc<ConstitutionConfig>> = OnceCell::new();

/// Environment variable naming the TOML file to load.
pub const CONFIG_PATH_ENV: &str = "CONSTITUTION_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "./config/constitution.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    FileNotFound(String),

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("Configuration not initialized")]
    NotInitialized,

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ConstitutionConfig {
    pub guardian: GuardianConfig,
    pub correction: CorrectionConfig,
    pub policies: PolicyConfig,
    pub resource_guard: ResourceGuardConfig,
    pub metrics: MetricsConfig,
    pub escalation: EscalationConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct GuardianConfig {
    pub mode: EnforcementMode,
    /// Wall-clock limit for a single generator call.
    pub generation_timeout_ms: u64,
    /// Per-task cost ceiling enforced at PRE and RUNTIME.
    pub cost_ceiling: f64,
    /// UTC windows during which autonomous retry is disabled.
    pub restricted_windows: Vec<OperatingWindowConfig>,
    /// Patterns (regex) of destructive actions refused at PRE.
    pub impact_patterns: Vec<String>,
}

impl Default for GuardianConfig {
    fn default() -> Self {
        Self {
            mode: EnforcementMode::Balanced,
            generation_timeout_ms: 120_000,
            cost_ceiling: 10.0,
            restricted_windows: Vec::new(),
            impact_patterns: vec![
                r"rm\s+-rf\s+/".to_string(),
                r"(?i)\bdrop\s+(table|database)\b".to_string(),
                r"(?i)\bmkfs(\.\w+)?\b".to_string(),
                r"(?i)\bformat\s+c:".to_string(),
            ],
        }
    }
}

impl GuardianConfig {
    pub fn generation_timeout(&self) -> Duration {
        Duration::from_millis(self.generation_timeout_ms)
    }
}

/// A daily UTC window given as `HH:MM` bounds. `end < start` wraps midnight.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OperatingWindowConfig {
    pub start: String,
    pub end: String,
}

impl OperatingWindowConfig {
    pub fn parse_bounds(&self) -> Result<(NaiveTime, NaiveTime), ConfigError> {
        let parse = |value: &str| {
            NaiveTime::parse_from_str(value.trim(), "%H:%M").map_err(|e| {
                ConfigError::InvalidValue(format!("restricted window bound '{value}': {e}"))
            })
        };
        Ok((parse(&self.start)?, parse(&self.end)?))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CorrectionConfig {
    /// Upper bound on generation attempts per task.
    pub max_iterations: u32,
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self { max_iterations: 2 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PolicyConfig {
    /// Literal tokens that mark an artifact as incomplete.
    pub incomplete_markers: Vec<String>,
    /// Regex patterns that mark an artifact as incomplete.
    pub incomplete_patterns: Vec<String>,
    pub completeness_severity: Severity,
    pub detect_empty_units: bool,
    /// Regexes whose first capture group names an external reference.
    pub reference_patterns: Vec<String>,
    /// Allowed ratio between declared and requested units.
    pub scope_multiplier: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            incomplete_markers: vec![
                "TODO".to_string(),
                "FIXME".to_string(),
                "XXX".to_string(),
                "todo!()".to_string(),
                "unimplemented!()".to_string(),
                "NotImplementedError".to_string(),
                "<placeholder>".to_string(),
            ],
            incomplete_patterns: vec![
                r"(?i)\bplaceholder\b".to_string(),
                r"(?i)implementation\s+goes\s+here".to_string(),
                r"(?i)rest\s+of\s+(the\s+)?(code|implementation)".to_string(),
            ],
            completeness_severity: Severity::High,
            detect_empty_units: true,
            reference_patterns: vec![
                r"(?m)^\s*use\s+([A-Za-z_][A-Za-z0-9_]*)(?:::|;)".to_string(),
                r"(?m)^\s*import\s+([A-Za-z_][A-Za-z0-9_.]*)".to_string(),
                r"(?m)^\s*from\s+([A-Za-z_][A-Za-z0-9_.]*)\s+import\b".to_string(),
                r#"require\(\s*['"]([^'"]+)['"]\s*\)"#.to_string(),
            ],
            scope_multiplier: 2.0,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct ResourceGuardConfig {
    pub rate_limit: RateLimitSettings,
    pub circuit_breaker: CircuitBreakerSettings,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitSettings {
    pub max_requests: u32,
    pub window_seconds: u64,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            max_requests: 60,
            window_seconds: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CircuitBreakerSettings {
    /// Consecutive failures that open the circuit.
    pub failure_threshold: u32,
    /// Rolling window in which the consecutive failures must occur.
    pub failure_window_secs: u64,
    /// Base cool-down before the first half-open probe.
    pub cooldown_secs: u64,
    /// Consecutive probe successes that close the circuit.
    pub success_threshold: u32,
    /// Cap for the exponential cool-down after failed probes.
    pub max_cooldown_secs: u64,
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window_secs: 60,
            cooldown_secs: 30,
            success_threshold: 1,
            max_cooldown_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub compliance_target: f64,
    pub first_pass_target: f64,
    /// Durable audit log; in-memory only when absent.
    pub audit_log_path: Option<PathBuf>,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            compliance_target: 0.95,
            first_pass_target: 0.80,
            audit_log_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct EscalationConfig {
    /// Durable ticket queue; in-memory only when absent.
    pub queue_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The log level to use (trace, debug, info, warn, error)
    pub level: String,
    pub service_name: String,
    pub json_format: bool,
    pub file_output: bool,
    pub log_dir: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            service_name: "constitution-service".to_string(),
            json_format: false,
            file_output: false,
            log_dir: None,
        }
    }
}

impl ConstitutionConfig {
    /// Load configuration from the file named by `CONSTITUTION_CONFIG`, then
    /// apply environment overrides and validate.
    ///
    /// A missing file falls back to defaults; a malformed file is an error.
    pub fn load() -> Result<ConstitutionConfig, ConfigError> {
        let config_path =
            env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(&config_path);

        let mut config = if path.exists() {
            Self::load_from(&path)?
        } else {
            tracing::warn!(path = %config_path, "configuration file not found; using defaults");
            ConstitutionConfig::default()
        };

        config.apply_env_overrides_from(|name| env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file without applying overrides.
    pub fn load_from(path: &Path) -> Result<ConstitutionConfig, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let contents = fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn from_toml_str(contents: &str) -> Result<ConstitutionConfig, ConfigError> {
        toml::from_str(contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply `CONSTITUTION_*` overrides through the given variable lookup.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("CONSTITUTION_MAX_ITERATIONS") {
            self.correction.max_iterations = value.trim().parse().map_err(|_| {
                ConfigError::InvalidValue(format!("CONSTITUTION_MAX_ITERATIONS={value}"))
            })?;
        }
        if let Some(value) = lookup("CONSTITUTION_ENFORCEMENT_MODE") {
            self.guardian.mode = value.parse().map_err(ConfigError::InvalidValue)?;
        }
        if let Some(value) = lookup("CONSTITUTION_AUDIT_LOG") {
            self.metrics.audit_log_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("CONSTITUTION_ESCALATION_QUEUE") {
            self.escalation.queue_path = Some(PathBuf::from(value));
        }
        if let Some(value) = lookup("CONSTITUTION_LOG_LEVEL") {
            self.logging.level = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidValue(msg.to_string()));

        if self.correction.max_iterations == 0 {
            return invalid("correction.max_iterations must be at least 1");
        }
        if self.guardian.generation_timeout_ms == 0 {
            return invalid("guardian.generation_timeout_ms must be positive");
        }
        if !(self.guardian.cost_ceiling > 0.0) {
            return invalid("guardian.cost_ceiling must be positive");
        }
        for window in &self.guardian.restricted_windows {
            window.parse_bounds()?;
        }
        if self.policies.scope_multiplier < 1.0 {
            return invalid("policies.scope_multiplier must be >= 1.0");
        }
        let rate = &self.resource_guard.rate_limit;
        if rate.max_requests == 0 || rate.window_seconds == 0 {
            return invalid("resource_guard.rate_limit requires max_requests and window_seconds >= 1");
        }
        let breaker = &self.resource_guard.circuit_breaker;
        if breaker.failure_threshold == 0 || breaker.success_threshold == 0 {
            return invalid("resource_guard.circuit_breaker thresholds must be >= 1");
        }
        if breaker.max_cooldown_secs < breaker.cooldown_secs {
            return invalid("resource_guard.circuit_breaker.max_cooldown_secs must be >= cooldown_secs");
        }
        for target in [self.metrics.compliance_target, self.metrics.first_pass_target] {
            if !(0.0..=1.0).contains(&target) {
                return invalid("metrics targets must lie in [0, 1]");
            }
        }
        Ok(())
    }
}

/// Initialise the process-wide configuration.
pub fn init_config(config: ConstitutionConfig) -> Result<Arc<ConstitutionConfig>, ConfigError> {
    config.validate()?;
    let config_arc = Arc::new(config);
    CONSTITUTION_CONFIG
        .set(Arc::clone(&config_arc))
        .map_err(|_| ConfigError::InvalidValue("Config already initialized".to_string()))?;
    Ok(config_arc)
}

/// Get the global configuration instance
pub fn get_config() -> Result<Arc<ConstitutionConfig>, ConfigError> {
    CONSTITUTION_CONFIG
        .get()
        .map(Arc::clone)
        .ok_or(ConfigError::NotInitialized)
}
