//! Policy Engine
//!
//! An ordered registry of single-capability checks. The same registry type
//! serves the PRE phase (subject: the pending `Task`) and the POST phase
//! (subject: the generated `Artifact`).

pub mod checks;
pub mod registry;

use error_handling::{Error, ErrorKind, ServiceError};
use shared_types::config::{GuardianConfig, PolicyConfig};
use shared_types::{Artifact, Severity, Task};
use std::sync::Arc;
use thiserror::Error as ThisError;

pub use checks::claim_verification::{ClaimCheck, ClaimVerificationCheck, FactSource, StaticFactSource};
pub use checks::completeness::CompletenessCheck;
pub use checks::external_reference::{AllowListResolver, ExternalReferenceCheck, ExternalReferenceResolver};
pub use checks::impact::ImpactCheck;
pub use checks::resource_efficiency::ResourceEfficiencyCheck;
pub use checks::scope::ScopeCheck;
pub use registry::{EvaluationContext, PolicyCheck, PolicyRegistry};

/// Error raised by a check instead of a result. The registry turns it into
/// a CRITICAL failure for the raising principle.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum CheckError {
    #[error("reference resolver failed: {0}")]
    Resolver(String),

    #[error("fact source failed: {0}")]
    FactSource(String),

    #[error("check failed: {0}")]
    Internal(String),
}

impl ServiceError for CheckError {
    fn to_error(&self) -> Error {
        Error::new(ErrorKind::InternalCheckFailure, self.to_string())
            .service("policy-engine")
            .severity(self.severity())
    }

    fn is_transient(&self) -> bool {
        matches!(self, CheckError::Resolver(_) | CheckError::FactSource(_))
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }
}

/// Error raised while building a registry.
#[derive(Debug, ThisError)]
pub enum PolicyError {
    #[error("principle already registered: {0}")]
    DuplicatePrinciple(String),

    #[error("invalid pattern for {principle}: {source}")]
    InvalidPattern {
        principle: String,
        #[source]
        source: regex::Error,
    },
}

impl ServiceError for PolicyError {
    fn to_error(&self) -> Error {
        Error::new(ErrorKind::Configuration, self.to_string())
            .service("policy-engine")
            .severity(self.severity())
    }

    fn is_transient(&self) -> bool {
        false
    }

    fn severity(&self) -> Severity {
        Severity::Critical
    }
}

impl From<PolicyError> for Error {
    fn from(err: PolicyError) -> Self {
        err.to_error()
    }
}

/// Priorities of the built-in checks. Higher runs first.
pub mod priority {
    pub const IMPACT: i32 = 100;
    pub const RESOURCE_EFFICIENCY: i32 = 90;
    pub const COMPLETENESS: i32 = 80;
    pub const EXTERNAL_REFERENCE: i32 = 70;
    pub const CLAIM_VERIFICATION: i32 = 60;
    pub const SCOPE: i32 = 50;
}

/// PRE registry: impact then resource efficiency.
pub fn pre_registry(config: &GuardianConfig) -> Result<PolicyRegistry<Task>, PolicyError> {
    let mut registry = PolicyRegistry::new();
    registry.register(Arc::new(ImpactCheck::new(&config.impact_patterns)?), priority::IMPACT)?;
    registry.register(
        Arc::new(ResourceEfficiencyCheck::new()),
        priority::RESOURCE_EFFICIENCY,
    )?;
    Ok(registry)
}

/// POST registry with the built-in artifact checks. Claim verification is
/// registered only when a fact source is supplied.
pub fn post_registry(
    config: &PolicyConfig,
    resolver: Arc<dyn ExternalReferenceResolver>,
    facts: Option<Arc<dyn FactSource>>,
) -> Result<PolicyRegistry<Artifact>, PolicyError> {
    let mut registry = PolicyRegistry::new();
    registry.register(
        Arc::new(CompletenessCheck::from_config(config)?),
        priority::COMPLETENESS,
    )?;
    registry.register(
        Arc::new(ExternalReferenceCheck::new(&config.reference_patterns, resolver)?),
        priority::EXTERNAL_REFERENCE,
    )?;
    if let Some(facts) = facts {
        registry.register(
            Arc::new(ClaimVerificationCheck::new(facts)),
            priority::CLAIM_VERIFICATION,
        )?;
    }
    registry.register(
        Arc::new(ScopeCheck::new(config.scope_multiplier)),
        priority::SCOPE,
    )?;
    Ok(registry)
}

pub(crate) fn compile_patterns(
    principle: &str,
    patterns: &[String],
) -> Result<Vec<regex::Regex>, PolicyError> {
    patterns
        .iter()
        .map(|p| {
            regex::Regex::new(p).map_err(|source| PolicyError::InvalidPattern {
                principle: principle.to_string(),
                source,
            })
        })
        .collect()
}
