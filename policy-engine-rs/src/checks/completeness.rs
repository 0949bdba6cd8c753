//! Flags artifacts that still carry placeholders or empty executable units.

use once_cell::sync::Lazy;
use regex::Regex;
use shared_types::config::PolicyConfig;
use shared_types::{Artifact, PolicyCheckResult, Severity};

use crate::registry::{EvaluationContext, PolicyCheck};
use crate::{compile_patterns, CheckError, PolicyError};

pub const PRINCIPLE_ID: &str = "completeness";

static EMPTY_RUST_FN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bfn\s+(\w+)\s*(?:<[^>{}]*>)?\s*\([^)]*\)\s*(?:->\s*[^{;]+?)?\s*\{\s*\}")
        .expect("static regex")
});

static EMPTY_JS_FN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\bfunction\s*(\w*)\s*\([^)]*\)\s*\{\s*\}").expect("static regex")
});

static PY_DEF: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^def\s+(\w+)\s*\(.*\)\s*(?:->\s*[^:]+)?:\s*(.*)$").expect("static regex")
});

pub struct CompletenessCheck {
    markers: Vec<String>,
    patterns: Vec<Regex>,
    severity: Severity,
    detect_empty_units: bool,
}

impl CompletenessCheck {
    pub fn new(
        markers: Vec<String>,
        patterns: &[String],
        severity: Severity,
        detect_empty_units: bool,
    ) -> Result<Self, PolicyError> {
        Ok(Self {
            markers,
            patterns: compile_patterns(PRINCIPLE_ID, patterns)?,
            severity,
            detect_empty_units,
        })
    }

    pub fn from_config(config: &PolicyConfig) -> Result<Self, PolicyError> {
        Self::new(
            config.incomplete_markers.clone(),
            &config.incomplete_patterns,
            config.completeness_severity,
            config.detect_empty_units,
        )
    }

    fn findings(&self, content: &str) -> Vec<String> {
        let mut findings = Vec::new();

        for marker in &self.markers {
            if content.contains(marker.as_str()) {
                findings.push(format!("incomplete marker '{marker}'"));
            }
        }
        for pattern in &self.patterns {
            if let Some(m) = pattern.find(content) {
                findings.push(format!("placeholder text '{}'", m.as_str().trim()));
            }
        }
        if self.detect_empty_units {
            for name in empty_units(content) {
                findings.push(format!("empty body in `{name}`"));
            }
        }
        findings
    }
}

/// Names of functions whose body is structurally empty.
pub fn empty_units(content: &str) -> Vec<String> {
    let mut names: Vec<String> = EMPTY_RUST_FN
        .captures_iter(content)
        .chain(EMPTY_JS_FN.captures_iter(content))
        .map(|caps| {
            caps.get(1)
                .map(|m| m.as_str())
                .filter(|name| !name.is_empty())
                .unwrap_or("<anonymous>")
                .to_string()
        })
        .collect();
    names.extend(empty_python_defs(content));
    names
}

fn is_placeholder_stmt(line: &str) -> bool {
    matches!(line, "pass" | "..." | "pass;")
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

/// Python `def`s whose body consists only of `pass` / `...` (docstrings and
/// comments do not count as a body).
fn empty_python_defs(content: &str) -> Vec<String> {
    let lines: Vec<&str> = content.lines().collect();
    let mut names = Vec::new();

    for (i, line) in lines.iter().enumerate() {
        let trimmed = line.trim();
        let caps = match PY_DEF.captures(trimmed) {
            Some(caps) => caps,
            None => continue,
        };
        let name = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
        let inline = caps.get(2).map(|m| m.as_str().trim()).unwrap_or_default();

        if !inline.is_empty() && !inline.starts_with('#') {
            if is_placeholder_stmt(inline) {
                names.push(name.to_string());
            }
            continue;
        }

        let def_indent = indent_of(line);
        let mut body = lines[i + 1..]
            .iter()
            .filter(|l| !l.trim().is_empty())
            .take_while(|l| indent_of(l) > def_indent)
            .map(|l| l.trim())
            .filter(|l| !l.starts_with('#'))
            .filter(|l| !(l.starts_with("\"\"\"") || l.starts_with("'''")))
            .peekable();

        if body.peek().is_some() && body.all(is_placeholder_stmt) {
            names.push(name.to_string());
        }
    }
    names
}

impl PolicyCheck<Artifact> for CompletenessCheck {
    fn principle_id(&self) -> &str {
        PRINCIPLE_ID
    }

    fn evaluate(&self, artifact: &Artifact, _ctx: &EvaluationContext) -> Result<PolicyCheckResult, CheckError> {
        let findings = self.findings(&artifact.content);
        if findings.is_empty() {
            return Ok(PolicyCheckResult::pass(PRINCIPLE_ID));
        }
        Ok(PolicyCheckResult::fail(
            PRINCIPLE_ID,
            self.severity,
            format!("artifact is incomplete: {}", findings.join("; ")),
        ))
    }
}
