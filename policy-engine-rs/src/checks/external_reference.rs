//! Every external reference in an artifact must resolve.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use shared_types::{Artifact, PolicyCheckResult, Severity};

use crate::registry::{EvaluationContext, PolicyCheck};
use crate::{compile_patterns, CheckError, PolicyError};

pub const PRINCIPLE_ID: &str = "external_reference";

/// Answers whether a referenced module, crate or package exists.
pub trait ExternalReferenceResolver: Send + Sync {
    fn resolves(&self, reference: &str) -> Result<bool, CheckError>;
}

/// Resolver backed by a fixed set of known names. A dotted or pathed
/// reference resolves when its root segment is known.
#[derive(Debug, Clone, Default)]
pub struct AllowListResolver {
    known: HashSet<String>,
}

impl AllowListResolver {
    pub fn new<I, S>(known: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            known: known.into_iter().map(Into::into).collect(),
        }
    }

    /// Standard-library roots of the common target languages.
    pub fn with_std_roots() -> Self {
        Self::new([
            "std", "core", "alloc", "crate", "self", "super", "os", "sys", "re", "json", "typing",
            "collections", "pathlib", "fs", "path", "http", "util",
        ])
    }

    pub fn allow(mut self, name: impl Into<String>) -> Self {
        self.known.insert(name.into());
        self
    }
}

impl ExternalReferenceResolver for AllowListResolver {
    fn resolves(&self, reference: &str) -> Result<bool, CheckError> {
        let root = reference
            .split(|c| c == '.' || c == ':' || c == '/')
            .next()
            .unwrap_or(reference);
        Ok(self.known.contains(reference) || self.known.contains(root))
    }
}

pub struct ExternalReferenceCheck {
    patterns: Vec<Regex>,
    resolver: Arc<dyn ExternalReferenceResolver>,
}

impl ExternalReferenceCheck {
    pub fn new(patterns: &[String], resolver: Arc<dyn ExternalReferenceResolver>) -> Result<Self, PolicyError> {
        Ok(Self {
            patterns: compile_patterns(PRINCIPLE_ID, patterns)?,
            resolver,
        })
    }

    /// Distinct references in first-seen order.
    pub fn extract(&self, content: &str) -> Vec<String> {
        let mut seen = HashSet::new();
        let mut references = Vec::new();
        for pattern in &self.patterns {
            for caps in pattern.captures_iter(content) {
                if let Some(m) = caps.get(1) {
                    let reference = m.as_str().to_string();
                    if seen.insert(reference.clone()) {
                        references.push(reference);
                    }
                }
            }
        }
        references
    }
}

impl PolicyCheck<Artifact> for ExternalReferenceCheck {
    fn principle_id(&self) -> &str {
        PRINCIPLE_ID
    }

    fn evaluate(&self, artifact: &Artifact, _ctx: &EvaluationContext) -> Result<PolicyCheckResult, CheckError> {
        let mut unresolved = Vec::new();
        for reference in self.extract(&artifact.content) {
            if !self.resolver.resolves(&reference)? {
                unresolved.push(reference);
            }
        }

        if unresolved.is_empty() {
            Ok(PolicyCheckResult::pass(PRINCIPLE_ID))
        } else {
            Ok(PolicyCheckResult::fail(
                PRINCIPLE_ID,
                Severity::High,
                format!("unresolved external references: {}", unresolved.join(", ")),
            ))
        }
    }
}
