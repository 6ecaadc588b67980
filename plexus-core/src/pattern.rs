//! Route-pattern compilation and matching.
//!
//! This module turns route-path strings into anchored, matchable patterns
//! with named parameters. A pattern is compiled once at registration time
//! and is immutable afterwards, so concurrent matching needs no locking.
//!
//! # Grammar
//!
//! A route string is split on `/` and each segment is one of:
//!
//! | Segment | Meaning |
//! |---------|---------|
//! | `users` | literal, must match exactly |
//! | `:name` | required parameter, any non-empty non-slash component |
//! | `(:name)` | optional parameter, absent components yield no entry |
//! | `(:name){regex}` | optional parameter whose value must satisfy `regex` |
//! | `*` | catch-all, matches the remainder; always terminal |
//!
//! A bare `*` route catches everything from the root. If a string pattern
//! produces zero named parameters, a trailing optional parameter named `id`
//! is appended, so `/users` also matches `/users/42` with `id = "42"`.
//!
//! Matching is anchored at both ends of the path and is case-sensitive,
//! byte-for-byte on path components.
//!
//! # Examples
//!
//! ```
//! use plexus_core::pattern::CompiledPattern;
//!
//! let pattern = CompiledPattern::compile("/path/:required/(:optional)").unwrap();
//!
//! let params = pattern.match_path("/path/foo/bar").unwrap();
//! assert_eq!(params["required"], "foo");
//! assert_eq!(params["optional"], "bar");
//!
//! let params = pattern.match_path("/path/foo").unwrap();
//! assert_eq!(params.get("optional"), None);
//!
//! assert!(pattern.match_path("/path").is_none());
//! ```

use crate::error::{Error, Result};
use regex::Regex;
use std::collections::HashMap;

/// Extracted parameter values, keyed by declared parameter name.
///
/// Values are raw path components with the leading slash stripped.
pub type ParamSet = HashMap<String, String>;

/// The parameter key under which a catch-all segment captures the path
/// remainder.
pub const CATCH_ALL: &str = "*";

/// A compiled route pattern: an anchored matcher plus the ordered list of
/// parameter slots it fills.
///
/// Immutable after compilation. Slot order follows left-to-right first
/// occurrence in the route string.
pub struct CompiledPattern {
    regex: Regex,
    /// Capture-group name paired with the declared parameter name, in slot
    /// order.
    params: Vec<(String, String)>,
    source: String,
}

impl CompiledPattern {
    /// Compiles a route-path string into a matchable pattern.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidPattern`] when a segment looks like a
    /// parameter but cannot be tokenized, or when an inline `{regex}`
    /// constraint fails to compile.
    pub fn compile(path: &str) -> Result<Self> {
        let mut pattern = String::from("^");
        let mut params: Vec<(String, String)> = Vec::new();
        let mut slot = 0usize;
        let mut catch_all = false;

        for segment in path.trim_matches('/').split('/').filter(|s| !s.is_empty()) {
            if segment == "*" {
                slot += 1;
                let group = format!("p{slot}");
                pattern.push_str(&format!("(?P<{group}>.*)"));
                params.push((group, CATCH_ALL.to_string()));
                // Catch-all is terminal: remaining segments are not compiled.
                catch_all = true;
                break;
            } else if let Some(name) = required_param(segment) {
                slot += 1;
                let group = format!("p{slot}");
                pattern.push_str(&format!("(?P<{group}>/[^/]+)"));
                params.push((group, name.to_string()));
            } else if let Some(name) = optional_param(segment) {
                slot += 1;
                let group = format!("p{slot}");
                pattern.push_str(&format!("(?P<{group}>/[^/]*)?"));
                params.push((group, name.to_string()));
            } else if let Some((name, constraint)) = constrained_param(segment) {
                slot += 1;
                let group = format!("p{slot}");
                Regex::new(constraint)
                    .map_err(|e| Error::invalid_pattern(path, format!("bad constraint: {e}")))?;
                pattern.push_str(&format!("(?P<{group}>/(?:{constraint}))?"));
                params.push((group, name.to_string()));
            } else if segment.starts_with(':') || segment.starts_with("(:") {
                return Err(Error::invalid_pattern(path, "unrecognized parameter syntax"));
            } else {
                pattern.push('/');
                pattern.push_str(&regex::escape(segment));
            }
        }

        // Single-resource compatibility rule: a pattern with no extracted
        // parameters gains a trailing optional `id`.
        if params.is_empty() && !catch_all {
            slot += 1;
            let group = format!("p{slot}");
            pattern.push_str(&format!("(?P<{group}>/[^/]*)?"));
            params.push((group, "id".to_string()));
        }

        pattern.push('$');
        let regex = Regex::new(&pattern)
            .map_err(|e| Error::invalid_pattern(path, format!("compilation failed: {e}")))?;

        Ok(Self {
            regex,
            params,
            source: path.to_string(),
        })
    }

    /// Wraps a raw regular expression as a pattern, bypassing the string
    /// grammar. No parameters are extracted; the whole path must match.
    pub fn from_regex(regex: Regex) -> Self {
        let source = regex.as_str().to_string();
        Self {
            regex,
            params: Vec::new(),
            source,
        }
    }

    /// Matches a request path against this pattern.
    ///
    /// Returns the extracted parameters on a whole-path match, or `None`.
    /// Absent optional segments contribute no entry. The catch-all slot, if
    /// present, is always filled (possibly with an empty remainder) under
    /// the [`CATCH_ALL`] key.
    pub fn match_path(&self, path: &str) -> Option<ParamSet> {
        let caps = self.regex.captures(path)?;
        let mut set = ParamSet::new();
        for (group, name) in &self.params {
            if let Some(m) = caps.name(group) {
                let raw = m.as_str();
                let value = raw.strip_prefix('/').unwrap_or(raw);
                if value.is_empty() && name != CATCH_ALL {
                    // Empty placeholder: the optional segment is absent.
                    continue;
                }
                set.insert(name.clone(), value.to_string());
            }
        }
        Some(set)
    }

    /// Returns the text a rewrite route substitutes back into the path: the
    /// last filled capture of the match, falling back to the whole match
    /// for raw-regex patterns.
    ///
    /// Slash normalization of the returned value is the router's concern.
    pub fn rewrite_target(&self, path: &str) -> Option<String> {
        let caps = self.regex.captures(path)?;
        for (group, _) in self.params.iter().rev() {
            if let Some(m) = caps.name(group) {
                return Some(m.as_str().to_string());
            }
        }
        for i in (1..caps.len()).rev() {
            if let Some(m) = caps.get(i) {
                return Some(m.as_str().to_string());
            }
        }
        caps.get(0).map(|m| m.as_str().to_string())
    }

    /// The declared parameter names, in slot order.
    pub fn param_names(&self) -> Vec<&str> {
        self.params.iter().map(|(_, name)| name.as_str()).collect()
    }

    /// The route string (or raw regex) this pattern was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }
}

impl std::fmt::Debug for CompiledPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledPattern")
            .field("source", &self.source)
            .field("params", &self.param_names())
            .finish()
    }
}

fn is_param_name(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// `:name`
fn required_param(segment: &str) -> Option<&str> {
    segment.strip_prefix(':').filter(|name| is_param_name(name))
}

/// `(:name)`
fn optional_param(segment: &str) -> Option<&str> {
    segment
        .strip_prefix("(:")
        .and_then(|s| s.strip_suffix(')'))
        .filter(|name| is_param_name(name))
}

/// `(:name){regex}`
fn constrained_param(segment: &str) -> Option<(&str, &str)> {
    let rest = segment.strip_prefix("(:")?;
    let split = rest.find("){")?;
    let name = &rest[..split];
    let constraint = rest[split + 2..].strip_suffix('}')?;
    if is_param_name(name) {
        Some((name, constraint))
    } else {
        None
    }
}
