//! Compiled routing rules and the per-request fact record.
//!
//! A rule is an arrow expression of the form `predicate => value`. Both sides
//! are Rhai expressions, compiled once at construction time. The predicate is
//! evaluated against a [`FactRecord`] and must yield a boolean; when it holds,
//! the value expression is evaluated and must yield the target string.
//!
//! The variables bound during evaluation are `http` and `grpc` (booleans),
//! `host` and `path` (strings, host with any port stripped) and `headers`
//! (a map from lowercase header name to its first value). Example:
//!
//! ```text
//! http && host.contains("localhost") => "http://127.0.0.1:3000"
//! ```
//!
//! A rule whose evaluation errors (a missing header key, a type mismatch) is
//! indistinguishable from a non-match at routing time: the router skips it
//! and continues down the table. Use `"name" in headers` to guard lookups.

use once_cell::sync::Lazy;
use rhai::{Engine, Map, Scope, AST};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{ProxyError, Result};

/// Shared expression engine with resource limits applied.
static ENGINE: Lazy<Engine> = Lazy::new(|| {
    let mut engine = Engine::new();
    engine.set_max_expr_depths(64, 32);
    engine.set_max_operations(100_000);
    engine.set_max_string_size(64 * 1024);
    engine.set_max_array_size(1_000);
    engine.set_max_map_size(1_000);
    engine
});

/// Per-request observables supplied to rule evaluation.
///
/// Invariant: exactly one of `http` and `grpc` is true.
#[derive(Debug, Clone)]
pub struct FactRecord {
    pub http: bool,
    pub grpc: bool,
    pub host: String,
    pub path: String,
    pub headers: HashMap<String, String>,
}

impl FactRecord {
    /// Build the fact record for an HTTP request.
    pub fn http(host: &str, path: &str, headers: HashMap<String, String>) -> Self {
        Self {
            http: true,
            grpc: false,
            host: strip_port(host).to_string(),
            path: path.to_string(),
            headers,
        }
    }

    /// Build the fact record for a gRPC call.
    pub fn grpc(authority: &str, full_method: &str, headers: HashMap<String, String>) -> Self {
        Self {
            http: false,
            grpc: true,
            host: strip_port(authority).to_string(),
            path: full_method.to_string(),
            headers,
        }
    }

    /// Build the evaluation scope exposing the fact variables.
    fn scope(&self) -> Scope<'static> {
        let mut scope = Scope::new();
        scope.push_constant("http", self.http);
        scope.push_constant("grpc", self.grpc);
        scope.push_constant("host", self.host.clone());
        scope.push_constant("path", self.path.clone());
        let mut headers = Map::new();
        for (name, value) in &self.headers {
            headers.insert(name.as_str().into(), value.clone().into());
        }
        scope.push_constant("headers", headers);
        scope
    }
}

/// Remove a trailing `:port` from an authority.
fn strip_port(host: &str) -> &str {
    host.split(':').next().unwrap_or(host)
}

/// A compiled arrow rule.
#[derive(Clone)]
pub struct Rule {
    source: String,
    predicate: AST,
    value: AST,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule").field("source", &self.source).finish()
    }
}

impl Rule {
    /// Compile a rule from its source expression.
    pub fn new(source: &str) -> Result<Self> {
        let (predicate_src, value_src) = split_arrow(source)
            .ok_or_else(|| ProxyError::BadRule(format!("missing `=>` in rule: {source}")))?;
        let predicate = ENGINE
            .compile_expression(predicate_src.trim())
            .map_err(|e| ProxyError::BadRule(format!("{source}: {e}")))?;
        let value = ENGINE
            .compile_expression(value_src.trim())
            .map_err(|e| ProxyError::BadRule(format!("{source}: {e}")))?;
        Ok(Self {
            source: source.to_string(),
            predicate,
            value,
        })
    }

    /// The source expression this rule was compiled from.
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluate the rule against a fact record.
    ///
    /// Returns `Ok(None)` when the predicate does not hold, `Ok(Some(target))`
    /// when it does, and an error when either expression fails to evaluate.
    pub fn evaluate(&self, fact: &FactRecord) -> Result<Option<String>> {
        let mut scope = fact.scope();
        let hit = ENGINE
            .eval_ast_with_scope::<bool>(&mut scope, &self.predicate)
            .map_err(|e| ProxyError::RuleEval(format!("{}: {e}", self.source)))?;
        if !hit {
            return Ok(None);
        }
        let target = ENGINE
            .eval_ast_with_scope::<String>(&mut scope, &self.value)
            .map_err(|e| ProxyError::RuleEval(format!("{}: {e}", self.source)))?;
        Ok(Some(target))
    }
}

/// Split a rule source at the first `=>` outside a string literal.
fn split_arrow(source: &str) -> Option<(&str, &str)> {
    let bytes = source.as_bytes();
    let mut in_string = false;
    let mut escaped = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
        } else if b == b'"' {
            in_string = true;
        } else if b == b'=' && bytes.get(i + 1) == Some(&b'>') {
            return Some((&source[..i], &source[i + 2..]));
        }
        i += 1;
    }
    None
}

/// Decides whether the ACME manager may issue a certificate for a hostname.
#[derive(Clone)]
pub struct HostPolicy {
    kind: PolicyKind,
}

#[derive(Clone)]
enum PolicyKind {
    Allowed(Arc<Vec<String>>),
    Expression { source: String, ast: Arc<AST> },
    Custom(Arc<dyn Fn(&str) -> bool + Send + Sync>),
}

impl fmt::Debug for HostPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            PolicyKind::Allowed(hosts) => f.debug_tuple("AllowedHosts").field(hosts).finish(),
            PolicyKind::Expression { source, .. } => {
                f.debug_tuple("Expression").field(source).finish()
            }
            PolicyKind::Custom(_) => f.write_str("Custom"),
        }
    }
}

impl HostPolicy {
    /// Allow exactly the listed hostnames.
    pub fn allowed_hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            kind: PolicyKind::Allowed(Arc::new(hosts.into_iter().map(Into::into).collect())),
        }
    }

    /// Allow hosts for which the given Rhai expression evaluates to true.
    ///
    /// The expression sees a single string variable `host`, e.g.
    /// `host.ends_with(".example.com")`.
    pub fn expression(source: &str) -> Result<Self> {
        let ast = ENGINE
            .compile_expression(source.trim())
            .map_err(|e| ProxyError::BadRule(format!("{source}: {e}")))?;
        Ok(Self {
            kind: PolicyKind::Expression {
                source: source.to_string(),
                ast: Arc::new(ast),
            },
        })
    }

    /// Allow hosts for which the given function returns true.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        Self {
            kind: PolicyKind::Custom(Arc::new(f)),
        }
    }

    /// Check whether issuance is allowed for `host`.
    pub fn check(&self, host: &str) -> Result<()> {
        let allowed = match &self.kind {
            PolicyKind::Allowed(hosts) => hosts.iter().any(|h| h.eq_ignore_ascii_case(host)),
            PolicyKind::Expression { ast, .. } => {
                let mut scope = Scope::new();
                scope.push_constant("host", host.to_string());
                // an erroring policy expression refuses issuance
                ENGINE
                    .eval_ast_with_scope::<bool>(&mut scope, ast)
                    .unwrap_or(false)
            }
            PolicyKind::Custom(f) => f(host),
        };
        if allowed {
            Ok(())
        } else {
            Err(ProxyError::ForbiddenHost(host.to_string()))
        }
    }
}
