//! Header override plus ordered path rules

use regex::Regex;
use thiserror::Error;
use tracing::{debug, trace};
use tunnelgate_proto::TARGET_HEADER;

use crate::TargetResolver;

/// Router errors
#[derive(Debug, Error)]
pub enum RouterError {
    #[error("Invalid pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },
}

/// One `(pattern, target)` pair
#[derive(Debug, Clone)]
pub struct ProxyRule {
    pattern: Regex,
    target: String,
}

impl ProxyRule {
    pub fn new(pattern: &str, target: impl Into<String>) -> Result<Self, RouterError> {
        let compiled = Regex::new(pattern).map_err(|e| RouterError::InvalidPattern {
            pattern: pattern.to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            pattern: compiled,
            target: target.into(),
        })
    }

    pub fn pattern(&self) -> &str {
        self.pattern.as_str()
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    /// Unanchored: the pattern may match anywhere in the path
    pub fn matches(&self, path: &str) -> bool {
        self.pattern.is_match(path)
    }
}

/// Ordered rule list, evaluated first match wins
#[derive(Debug, Clone, Default)]
pub struct ProxyRules {
    rules: Vec<ProxyRule>,
}

impl ProxyRules {
    pub fn new(rules: Vec<ProxyRule>) -> Self {
        Self { rules }
    }

    /// Compile `(pattern, target)` pairs, failing on the first bad pattern
    pub fn from_pairs<I, P, T>(pairs: I) -> Result<Self, RouterError>
    where
        I: IntoIterator<Item = (P, T)>,
        P: AsRef<str>,
        T: Into<String>,
    {
        let rules = pairs
            .into_iter()
            .map(|(pattern, target)| ProxyRule::new(pattern.as_ref(), target))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Target of the first rule matching `path`
    pub fn match_path(&self, path: &str) -> Option<&str> {
        self.rules
            .iter()
            .find(|rule| rule.matches(path))
            .map(ProxyRule::target)
    }
}

impl TargetResolver for ProxyRules {
    fn resolve(&self, parts: &http::request::Parts) -> Option<String> {
        let explicit = parts
            .headers
            .get(TARGET_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty());

        if let Some(target) = explicit {
            trace!(target = %target, "Target taken from request header");
            return Some(target.to_string());
        }

        let path = parts.uri.path();
        match self.match_path(path) {
            Some(target) => {
                trace!(path = %path, target = %target, "Target matched by rule");
                Some(target.to_string())
            }
            None => {
                debug!(path = %path, "No target for request");
                None
            }
        }
    }
}
