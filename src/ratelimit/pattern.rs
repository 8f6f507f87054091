//! Endpoint glob matching.
//!
//! Patterns use `*` as a wildcard for any run of characters, including `/`.
//! Each pattern compiles once to an anchored regular expression.

use regex::Regex;

use crate::error::{Result, WardenError};

/// A compiled endpoint glob.
#[derive(Debug, Clone)]
pub struct EndpointPattern {
    source: String,
    regex: Regex,
}

impl EndpointPattern {
    /// Compile a glob such as `/api/v1/invoices/*`.
    pub fn compile(glob: &str) -> Result<Self> {
        let body: Vec<String> = glob.split('*').map(regex::escape).collect();
        let anchored = format!("^{}$", body.join(".*"));
        let regex = Regex::new(&anchored).map_err(|e| {
            WardenError::InvalidConfiguration(format!("invalid endpoint pattern '{}': {}", glob, e))
        })?;
        Ok(Self {
            source: glob.to_string(),
            regex,
        })
    }

    /// The glob this pattern was compiled from.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    pub fn matches(&self, endpoint: &str) -> bool {
        self.regex.is_match(endpoint)
    }
}

/// Include/exclude patterns of one rule.
#[derive(Debug, Clone, Default)]
pub struct EndpointFilter {
    include: Vec<EndpointPattern>,
    exclude: Vec<EndpointPattern>,
}

impl EndpointFilter {
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        Ok(Self {
            include: compile_all(include)?,
            exclude: compile_all(exclude)?,
        })
    }

    /// Whether the endpoint hits one of the exclusion patterns.
    pub fn excludes(&self, endpoint: &str) -> bool {
        self.exclude.iter().any(|p| p.matches(endpoint))
    }

    /// Exclusion always wins; an empty include list applies everywhere.
    pub fn applies_to(&self, endpoint: &str) -> bool {
        if self.excludes(endpoint) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|p| p.matches(endpoint))
    }
}

fn compile_all(patterns: &[String]) -> Result<Vec<EndpointPattern>> {
    patterns.iter().map(|p| EndpointPattern::compile(p)).collect()
}
