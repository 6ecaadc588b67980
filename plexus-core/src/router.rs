//! Ordered route resolution with first-match-wins and rewrite semantics.
//!
//! The router holds a sequence of compiled route entries. The order of
//! registration is the order of precedence, permanently: earlier entries
//! are always tried first, and entries are never mutated or reordered
//! after insertion. Resolution is read-only, so concurrent calls need no
//! locking.
//!
//! # Rewrite routes
//!
//! An entry registered with [`Target::Rewrite`] has no terminal handler.
//! When it matches, the effective path is replaced by the matched
//! remainder and scanning continues over the remaining entries. A rewrite
//! never terminates resolution, and the transformed path is local to one
//! [`Router::resolve`] call. Parameters a rewrite extracts are carried
//! into the final parameter set (the terminal entry wins on name
//! conflicts).
//!
//! Rewrite slash normalization: the substituted path always begins with a
//! single `/`; an empty remainder rewrites to `/`.
//!
//! # Examples
//!
//! ```
//! use plexus_core::router::{Router, Target};
//! use plexus_core::handler::route_handler;
//!
//! let users = route_handler(|_params, _ctx| async move { Ok(None) });
//!
//! let mut router = Router::new();
//! router.add("/users/:id", Target::Request(users)).unwrap();
//!
//! let (_target, params) = router.resolve("/users/42").unwrap();
//! assert_eq!(params["id"], "42");
//! ```

use crate::error::{Error, Result};
use crate::handler::{RouteHandler, SocketMount};
use crate::pattern::{CompiledPattern, ParamSet};
use regex::Regex;
use std::sync::Arc;
use tracing::debug;

/// What a matched route entry dispatches to.
#[derive(Clone)]
pub enum Target {
    /// A request handler; terminal.
    Request(Arc<dyn RouteHandler>),
    /// A socket handler mount; terminal.
    Socket(Arc<SocketMount>),
    /// A pure rewrite: the matched remainder is substituted into the path
    /// and scanning continues.
    Rewrite,
}

/// A compiled pattern paired with its dispatch target, held in declared
/// order.
pub struct RouteEntry {
    pattern: CompiledPattern,
    target: Target,
}

impl RouteEntry {
    /// The pattern this entry matches.
    pub fn pattern(&self) -> &CompiledPattern {
        &self.pattern
    }
}

/// An ordered sequence of route entries.
///
/// Immutable after startup registration; owned exclusively by the server
/// context.
#[derive(Default)]
pub struct Router {
    entries: Vec<RouteEntry>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Compiles `path` and appends an entry. Registration order is
    /// precedence order.
    ///
    /// Fails with [`Error::InvalidPattern`] on unrecognized route syntax;
    /// a broken route is never installed.
    pub fn add(&mut self, path: &str, target: Target) -> Result<()> {
        let pattern = CompiledPattern::compile(path)?;
        self.entries.push(RouteEntry { pattern, target });
        Ok(())
    }

    /// Appends an entry matching a raw regular expression, bypassing the
    /// route-string grammar.
    pub fn add_regex(&mut self, regex: Regex, target: Target) {
        let pattern = CompiledPattern::from_regex(regex);
        self.entries.push(RouteEntry { pattern, target });
    }

    /// Resolves a request path to the first matching non-rewrite target.
    ///
    /// Entries are scanned in insertion order. A matching rewrite entry
    /// transforms the effective path and continues the scan; the first
    /// matching terminal entry wins, even if later entries would also
    /// match. Fails with [`Error::NoRoute`] when nothing matches.
    pub fn resolve(&self, path: &str) -> Result<(Target, ParamSet)> {
        let mut effective = path.to_string();
        let mut carried = ParamSet::new();

        for entry in &self.entries {
            let Some(params) = entry.pattern.match_path(&effective) else {
                continue;
            };
            match &entry.target {
                Target::Rewrite => {
                    let rewritten = normalize_rewrite(entry.pattern.rewrite_target(&effective));
                    debug!(
                        "Rewrite '{}': '{}' -> '{}'",
                        entry.pattern.source(),
                        effective,
                        rewritten
                    );
                    carried.extend(params);
                    effective = rewritten;
                }
                target => {
                    carried.extend(params);
                    return Ok((target.clone(), carried));
                }
            }
        }
        Err(Error::NoRoute(path.to_string()))
    }

    /// Number of registered entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn normalize_rewrite(target: Option<String>) -> String {
    match target {
        None => "/".to_string(),
        Some(t) if t.is_empty() => "/".to_string(),
        Some(t) if t.starts_with('/') => t,
        Some(t) => format!("/{t}"),
    }
}
