//! Route table and first-match router.
//!
//! The table holds the compiled rules in declaration order and supports
//! atomic hot-swap: lookups snapshot the active sequence once and never
//! observe a partially replaced table.

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::error::{ProxyError, Result};
use crate::rule::{FactRecord, Rule};

/// Ordered rule sequence with atomic replacement.
#[derive(Debug)]
pub struct RouteTable {
    rules: RwLock<Arc<Vec<Rule>>>,
}

impl RouteTable {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Atomically swap the active rule sequence.
    pub fn replace(&self, rules: Vec<Rule>) {
        *self.rules.write() = Arc::new(rules);
    }

    /// A shared handle to the currently active sequence.
    ///
    /// Snapshots outlive concurrent replacements.
    pub fn snapshot(&self) -> Arc<Vec<Rule>> {
        self.rules.read().clone()
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Evaluates the route table against fact records.
#[derive(Debug)]
pub struct Router {
    table: RouteTable,
}

impl Router {
    pub fn new(rules: Vec<Rule>) -> Self {
        Self {
            table: RouteTable::new(rules),
        }
    }

    /// Replace the active rules.
    pub fn replace(&self, rules: Vec<Rule>) {
        self.table.replace(rules);
    }

    pub fn table(&self) -> &RouteTable {
        &self.table
    }

    /// Find the backend target for a request.
    ///
    /// Rules are evaluated in declaration order; the first rule that yields a
    /// target wins. A rule that errors is skipped. HTTP targets are
    /// normalized to an absolute http/https URL; a matched target that cannot
    /// be normalized is treated like a rule error and skipped.
    pub fn find(&self, fact: &FactRecord) -> Result<String> {
        let rules = self.table.snapshot();
        for rule in rules.iter() {
            match rule.evaluate(fact) {
                Ok(Some(target)) => {
                    if fact.http {
                        match normalize_http_target(&target) {
                            Ok(url) => return Ok(url.to_string()),
                            Err(e) => {
                                debug!(rule = rule.source(), error = %e, "Skipping rule with unusable target");
                                continue;
                            }
                        }
                    }
                    return Ok(target);
                }
                Ok(None) => continue,
                Err(e) => {
                    debug!(rule = rule.source(), error = %e, "Rule evaluation failed, skipping");
                    continue;
                }
            }
        }
        Err(ProxyError::NoRoute {
            host: fact.host.clone(),
            path: fact.path.clone(),
        })
    }
}

/// Normalize an HTTP routing target to an absolute http/https URL.
///
/// A target with no scheme gets `http://` prepended. Unknown hierarchical
/// schemes (e.g. `httpx://`) are rejected rather than sniffed by substring.
fn normalize_http_target(target: &str) -> Result<Url> {
    let url = match Url::parse(target) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => url,
        // "localhost:3000" parses as scheme "localhost" with an opaque path
        Ok(url) if url.cannot_be_a_base() => reparse_with_http(target)?,
        Ok(url) => {
            return Err(ProxyError::RuleEval(format!(
                "unsupported target scheme '{}': {target}",
                url.scheme()
            )))
        }
        Err(url::ParseError::RelativeUrlWithoutBase) => reparse_with_http(target)?,
        Err(e) => {
            return Err(ProxyError::RuleEval(format!(
                "unparseable target '{target}': {e}"
            )))
        }
    };
    if url.host_str().map(str::is_empty).unwrap_or(true) {
        return Err(ProxyError::RuleEval(format!(
            "target has no authority: {target}"
        )));
    }
    Ok(url)
}

fn reparse_with_http(target: &str) -> Result<Url> {
    Url::parse(&format!("http://{target}"))
        .map_err(|e| ProxyError::RuleEval(format!("unparseable target '{target}': {e}")))
}
