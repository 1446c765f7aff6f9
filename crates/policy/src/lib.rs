//! dlm_policy
//!
//! `PolicyGate` runs a predicate over already-resolved tool arguments
//! immediately before the tool executes (spec.md §4.4). Installed once at
//! mediator-construction time; never sees a `key:<id>` token.
//!
//! `allowlist` and `scalar_threshold` are grounded directly in
//! `original_source/benchmarks/banking/policy.py`'s `banking_security_policy`
//! (the `TRUSTED_IBANS` allowlist and the `$2000` transfer limit) and
//! `benchmarks/slack/policy.py`'s `TRUSTED_DOMAINS` allowlist on
//! `post_message.channel`.

use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyDecision {
    Allow,
    Deny(String),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("policy violation: {0}")]
pub struct PolicyViolation(pub String);

type Predicate = Box<dyn Fn(&str, &Value) -> PolicyDecision + Send + Sync>;

/// A pluggable predicate `(tool_name, resolved_args) -> allow | deny(reason)`.
/// `all` composes multiple gates, short-circuiting on the first denial —
/// the Rust equivalent of the Python reference's one `if tool.name == ...`
/// chain per benchmark, expressed as composable data instead.
pub struct PolicyGate {
    predicate: Predicate,
}

impl PolicyGate {
    pub fn new<F>(predicate: F) -> Self
    where
        F: Fn(&str, &Value) -> PolicyDecision + Send + Sync + 'static,
    {
        Self { predicate: Box::new(predicate) }
    }

    /// Always allows every call. Useful as a default/no-op gate.
    pub fn allow_all() -> Self {
        Self::new(|_, _| PolicyDecision::Allow)
    }

    /// Deny unless the named field's resolved value is in `allowed_values`,
    /// for the named tool. Calls to other tools are untouched (`Allow`).
    /// Mirrors `banking_security_policy`'s `TRUSTED_IBANS` check and
    /// `slack_security_policy`'s `TRUSTED_DOMAINS` check.
    pub fn allowlist(tool: impl Into<String>, field: impl Into<String>, allowed_values: Vec<String>) -> Self {
        let tool = tool.into();
        let field = field.into();
        Self::new(move |tool_name, args| {
            if tool_name != tool {
                return PolicyDecision::Allow;
            }
            let Some(value) = args.get(&field).and_then(Value::as_str) else {
                return PolicyDecision::Allow;
            };
            if allowed_values.iter().any(|v| v == value) {
                PolicyDecision::Allow
            } else {
                PolicyDecision::Deny(format!(
                    "{field} \"{value}\" is not in the trusted allowlist for {tool_name}"
                ))
            }
        })
    }

    /// Deny if the named field's resolved numeric value exceeds `max`, for
    /// the named tool. Mirrors `banking_security_policy`'s `$2000` limit.
    pub fn scalar_threshold(tool: impl Into<String>, field: impl Into<String>, max: f64) -> Self {
        let tool = tool.into();
        let field = field.into();
        Self::new(move |tool_name, args| {
            if tool_name != tool {
                return PolicyDecision::Allow;
            }
            let Some(value) = args.get(&field).and_then(Value::as_f64) else {
                return PolicyDecision::Allow;
            };
            if value > max {
                PolicyDecision::Deny(format!("{field} {value} exceeds limit of {max} for {tool_name}"))
            } else {
                PolicyDecision::Allow
            }
        })
    }

    /// Compose gates; the first denial short-circuits the rest.
    pub fn all(gates: Vec<PolicyGate>) -> Self {
        Self::new(move |tool_name, args| {
            for gate in &gates {
                if let PolicyDecision::Deny(reason) = gate.check(tool_name, args) {
                    return PolicyDecision::Deny(reason);
                }
            }
            PolicyDecision::Allow
        })
    }

    pub fn check(&self, tool_name: &str, resolved_args: &Value) -> PolicyDecision {
        (self.predicate)(tool_name, resolved_args)
    }

    /// Convenience wrapper returning `Result` instead of `PolicyDecision`,
    /// for callers (the CLI trace runner) that want `?`-propagation.
    pub fn enforce(&self, tool_name: &str, resolved_args: &Value) -> Result<(), PolicyViolation> {
        match self.check(tool_name, resolved_args) {
            PolicyDecision::Allow => Ok(()),
            PolicyDecision::Deny(reason) => Err(PolicyViolation(reason)),
        }
    }
}
