use crate::models::MethodFilter;
use regex::Regex;
use std::collections::BTreeMap;

/// Compiled form of an instance's `pathPattern` plus its method filter.
#[derive(Debug, Clone)]
pub struct Route {
    method: MethodFilter,
    pattern: String,
    regex: Option<Regex>,
    params: Vec<String>,
}

/// Captures of a successful route match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMatch {
    pub params: BTreeMap<String, String>,
}

impl Route {
    pub fn compile(method: MethodFilter, pattern: &str) -> Result<Self, String> {
        if !pattern.starts_with('/') {
            return Err(format!("path pattern {pattern:?} must start with '/'"));
        }

        // Plain paths are compared literally, no regex needed
        if !pattern.contains(':') && !pattern.contains('*') {
            return Ok(Self {
                method,
                pattern: pattern.to_string(),
                regex: None,
                params: Vec::new(),
            });
        }

        // 1. Replace :param with a named segment capture
        // 2. Replace * with .*
        // 3. Wrap with ^ and $
        let mut regex_str = String::from("^");
        let mut params = Vec::new();
        for (i, segment) in pattern.split('/').enumerate() {
            if i > 0 {
                regex_str.push('/');
            }
            if let Some(name) = segment.strip_prefix(':') {
                if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(format!("invalid parameter name {segment:?} in {pattern:?}"));
                }
                if params.iter().any(|p| p == name) {
                    return Err(format!("duplicate parameter {name:?} in {pattern:?}"));
                }
                regex_str.push_str(&format!("(?P<{name}>[^/]+)"));
                params.push(name.to_string());
            } else if segment == "*" {
                regex_str.push_str(".*");
            } else if segment.contains('*') {
                // Mid-segment wildcard like "books*"
                let parts: Vec<String> = segment.split('*').map(regex::escape).collect();
                regex_str.push_str(&parts.join("[^/]*"));
            } else {
                regex_str.push_str(&regex::escape(segment));
            }
        }
        regex_str.push('$');

        let regex = Regex::new(&regex_str)
            .map_err(|e| format!("path pattern {pattern:?} does not compile: {e}"))?;
        Ok(Self {
            method,
            pattern: pattern.to_string(),
            regex: Some(regex),
            params,
        })
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Matches method and path, returning the path parameters on success.
    pub fn matches(&self, method: &str, path: &str) -> Option<RouteMatch> {
        if !self.method.allows(method) {
            tracing::trace!("Method mismatch: expected {}, got {}", self.method, method);
            return None;
        }

        let Some(ref regex) = self.regex else {
            if self.pattern == path {
                return Some(RouteMatch::default());
            }
            tracing::trace!("Path mismatch: expected {}, got {}", self.pattern, path);
            return None;
        };

        let Some(caps) = regex.captures(path) else {
            tracing::trace!("Path mismatch: expected {}, got {}", self.pattern, path);
            return None;
        };
        let params = self
            .params
            .iter()
            .filter_map(|name| caps.name(name).map(|m| (name.clone(), m.as_str().to_string())))
            .collect();
        Some(RouteMatch { params })
    }
}
