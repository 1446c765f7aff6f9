//! dlm_mediator
//!
//! The interceptor at the tool boundary: `before_tool` resolves `key:<id>`
//! tokens out of argument trees before a tool (or the Q-LLM) sees them,
//! `after_tool` sanitizes raw tool results back into keys before the planner
//! sees them, and `resolve_final` performs the end-of-turn key resolution
//! over the planner's natural-language answer. `before_agent`/`after_agent`
//! are the host-framework hook names spec.md §6.4 gives to session-start and
//! final-response-rewrite respectively; `after_agent` is a thin wrapper over
//! `resolve_final`.
//!
//! Grounded in `original_source/src/adk_dual_llm/security/handle_plugin.py`'s
//! `before_model_callback`/`after_model_callback` hook shape (the Python
//! stub leaves the bodies as TODOs; the resolve/sanitize logic below is this
//! crate's own, built to the invariants the stub's docstrings describe) and
//! in `pie_redaction::RedactionEngine`'s style of a single struct owning one
//! pass over a JSON tree plus an explicit error enum.

use dlm_registry::{Key, KeyRegistry, RegistryError};
use regex::Regex;
use serde_json::{Map, Value};
use std::sync::{Arc, LazyLock};
use thiserror::Error;

pub use dlm_protocol::QLLM_TOOL_NAME;

/// Anchored key-token pattern used by `FinalResolver`. Ids are UUIDv4
/// canonical text, a fixed-length hex/hyphen class, so this cannot
/// over-consume adjacent alphanumeric text the way a looser
/// `[A-Za-z0-9\-]+` class would.
static FINAL_KEY_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"key:[0-9a-fA-F]{8}-(?:[0-9a-fA-F]{4}-){3}[0-9a-fA-F]{12}")
        .expect("static pattern is valid")
});

#[derive(Debug, Error)]
pub enum MediatorError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// A structural (non-fatal) event a host framework may want to audit,
/// surfaced from `before_tool`/`resolve_final` instead of being dropped
/// silently. Per spec.md §7 these never abort the call; they exist so a
/// caller that keeps an audit trail has something to build a
/// `KeyResolutionFailed`/`MalformedQllmRequest` event from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MediationDiagnostic {
    /// A `key:<id>` token was encountered but is not bound in the registry;
    /// the token was left as literal text.
    UnknownKey { token: String },
    /// The `qllm_remote` `request` field did not parse as JSON; the
    /// unresolved string was forwarded as-is.
    MalformedQllmRequest,
}

/// Per-invocation lifecycle, modeled purely for documentation/logging. The
/// hooks below are plain synchronous functions; no `InvocationState` value is
/// threaded through calls — the core mediation logic itself is synchronous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvocationState {
    Idle,
    Resolving,
    PolicyCheck,
    Executing,
    Validating,
    Storing,
    PolicyFail,
    SchemaFail,
}

/// Owns a shared `KeyRegistry` and exposes the four hook entry points a host
/// agent framework calls. Cheap to clone: the registry is reference-counted.
#[derive(Clone)]
pub struct Mediator {
    registry: Arc<KeyRegistry>,
}

impl Mediator {
    pub fn new(registry: Arc<KeyRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<KeyRegistry> {
        &self.registry
    }

    /// Resolve every `key:<id>` string leaf in `args` in place. Unknown keys
    /// are left as literal text: non-fatal, since tools may legitimately
    /// carry user text that resembles a key.
    ///
    /// For `qllm_remote`, the `request` field is additionally expected to be
    /// a JSON document serialized as a string; after the first-pass walk
    /// resolves top-level arguments it is parsed, resolved a second time, and
    /// re-serialized so keys embedded inside the payload are expanded too.
    /// A parse failure here is non-fatal: the unresolved string is forwarded
    /// unchanged, and a `MalformedQllmRequest` diagnostic is returned so a
    /// caller that audits can log it (spec.md §7: "Visible to: logs").
    ///
    /// Every unknown-key encountered along the way is likewise returned as a
    /// `MediationDiagnostic::UnknownKey` rather than dropped; resolution
    /// itself still proceeds (the token is left as literal text).
    pub fn before_tool(
        &self,
        tool_name: &str,
        args: &mut Value,
    ) -> Result<Vec<MediationDiagnostic>, MediatorError> {
        let mut diagnostics = Vec::new();
        self.resolve_tree(args, &mut diagnostics)?;

        if tool_name == QLLM_TOOL_NAME {
            if let Some(Value::String(request)) = args.get_mut("request") {
                match serde_json::from_str::<Value>(request) {
                    Ok(mut parsed) => {
                        self.resolve_tree(&mut parsed, &mut diagnostics)?;
                        *request = serde_json::to_string(&parsed).unwrap_or_else(|_| request.clone());
                    }
                    Err(_) => {
                        diagnostics.push(MediationDiagnostic::MalformedQllmRequest);
                    }
                }
            }
        }

        Ok(diagnostics)
    }

    fn resolve_tree(&self, value: &mut Value, diagnostics: &mut Vec<MediationDiagnostic>) -> Result<(), MediatorError> {
        match value {
            Value::Object(map) => {
                for v in map.values_mut() {
                    self.resolve_tree(v, diagnostics)?;
                }
            }
            Value::Array(items) => {
                for v in items.iter_mut() {
                    self.resolve_tree(v, diagnostics)?;
                }
            }
            Value::String(s) => {
                if let Some(key) = Key::parse_exact(s) {
                    match self.registry.resolve(key) {
                        Ok(resolved) => *value = resolved,
                        Err(RegistryError::UnknownKey(_)) => {
                            // left as literal string, per spec.md §4.2.1
                            diagnostics.push(MediationDiagnostic::UnknownKey { token: s.clone() });
                        }
                        Err(other) => return Err(other.into()),
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Shallow-sanitize a tool result into keys (spec.md §4.2.2):
    /// - `null` passes through, no entry created.
    /// - a string that parses as JSON (optionally Markdown-fenced) is
    ///   treated as that parsed structure.
    /// - an object gets one key per top-level field.
    /// - anything else (scalar, array) gets a single key under `"output"`.
    pub fn after_tool(&self, tool_name: &str, result: Value) -> Result<Value, MediatorError> {
        if result.is_null() {
            return Ok(Value::Null);
        }

        let structural = match result {
            Value::String(s) => {
                let unfenced = strip_markdown_fence(&s);
                serde_json::from_str::<Value>(&unfenced).unwrap_or(Value::String(s))
            }
            other => other,
        };

        match structural {
            Value::Object(map) => {
                let mut out = Map::with_capacity(map.len());
                for (field, field_value) in map {
                    let type_hint = format!("tool:{tool_name}:{field}");
                    let key = self.registry.create(field_value, type_hint)?;
                    out.insert(field, Value::String(key.to_string()));
                }
                Ok(Value::Object(out))
            }
            other => {
                let type_hint = format!("tool:{tool_name}");
                let key = self.registry.create(other, type_hint)?;
                let mut out = Map::with_capacity(1);
                out.insert("output".to_string(), Value::String(key.to_string()));
                Ok(Value::Object(out))
            }
        }
    }

    /// FinalResolver (spec.md §4.5): scan `text` for `key:<id>` tokens and
    /// replace each with its resolved value. Objects/arrays render as
    /// compact JSON, scalars as their textual form, unknown keys are left
    /// as-is. Idempotent on text with no key tokens.
    ///
    /// Returns `(rewritten_text, unresolved_tokens, resolved_count)`: every
    /// unknown key hit here is a `MediationDiagnostic::UnknownKey` with
    /// `site = "final_resolution"` once a caller turns it into an audit
    /// event, distinct from the `"argument_resolution"` site `before_tool`
    /// diagnostics come from.
    pub fn resolve_final(
        &self,
        text: &str,
    ) -> Result<(String, Vec<MediationDiagnostic>, usize), MediatorError> {
        let mut err: Option<RegistryError> = None;
        let mut diagnostics = Vec::new();
        let mut resolved_count = 0usize;
        let out = FINAL_KEY_PATTERN.replace_all(text, |caps: &regex::Captures| {
            let matched = &caps[0];
            let Some(key) = Key::parse_exact(matched) else {
                return matched.to_string();
            };
            match self.registry.resolve(key) {
                Ok(value) => {
                    resolved_count += 1;
                    render_scalar_or_json(&value)
                }
                Err(RegistryError::UnknownKey(_)) => {
                    diagnostics.push(MediationDiagnostic::UnknownKey { token: matched.to_string() });
                    matched.to_string()
                }
                Err(other) => {
                    err = Some(other);
                    matched.to_string()
                }
            }
        });
        if let Some(e) = err {
            return Err(e.into());
        }
        Ok((out.into_owned(), diagnostics, resolved_count))
    }

    /// Host-framework hook (spec.md §6.4): called once at the start of a
    /// session, before any tool call. The mediator carries no state beyond
    /// the registry it was constructed with, so this is a no-op placeholder
    /// — the entry point exists so the external interface matches spec.md
    /// §6.4's four hooks exactly; a host framework wiring its own
    /// session-scoped logging/tracing has somewhere to call into.
    pub fn before_agent(&self, _session: &str) {}

    /// Host-framework hook (spec.md §6.4): invoked once per agent turn after
    /// the planner has produced its final natural-language response. Thin
    /// wrapper over `resolve_final` — this is the entry point a host
    /// framework actually calls; `resolve_final` is kept public for callers
    /// that only want the FinalResolver pass without the hook's identity.
    pub fn after_agent(
        &self,
        _session: &str,
        final_text: &str,
    ) -> Result<(String, Vec<MediationDiagnostic>, usize), MediatorError> {
        self.resolve_final(final_text)
    }
}

fn render_scalar_or_json(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn strip_markdown_fence(s: &str) -> String {
    let trimmed = s.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.trim_start_matches('\n');
    rest.strip_suffix("```").unwrap_or(rest).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mediator() -> Mediator {
        Mediator::new(Arc::new(KeyRegistry::new()))
    }

    #[test]
    fn before_tool_resolves_known_key_in_place() {
        let m = mediator();
        let key = m.registry().create(Value::from("CH9300762011623852957"), "tool:get_account").unwrap();
        let mut args = serde_json::json!({ "recipient": key.to_string(), "amount": 500 });
        m.before_tool("send_money", &mut args).unwrap();
        assert_eq!(args["recipient"], Value::from("CH9300762011623852957"));
        assert_eq!(args["amount"], Value::from(500));
    }

    #[test]
    fn before_tool_leaves_unknown_key_as_literal() {
        let m = mediator();
        let mut args = serde_json::json!({ "note": "key:00000000-0000-4000-8000-000000000000" });
        let diagnostics = m.before_tool("send_money", &mut args).unwrap();
        assert_eq!(args["note"], Value::from("key:00000000-0000-4000-8000-000000000000"));
        assert_eq!(
            diagnostics,
            vec![MediationDiagnostic::UnknownKey {
                token: "key:00000000-0000-4000-8000-000000000000".to_string()
            }]
        );
    }

    #[test]
    fn before_tool_ignores_mid_word_key_substring() {
        let m = mediator();
        let mut args = serde_json::json!({ "note": "mykey:not-a-real-key-at-all" });
        m.before_tool("send_money", &mut args).unwrap();
        assert_eq!(args["note"], Value::from("mykey:not-a-real-key-at-all"));
    }

    #[test]
    fn qllm_remote_resolves_keys_nested_inside_request_payload() {
        let m = mediator();
        let key = m.registry().create(Value::from("raw email body text"), "tool:fetch_email:body").unwrap();
        let inner = serde_json::json!({ "source": key.to_string(), "text": key.to_string() });
        let mut args = serde_json::json!({
            "request": serde_json::to_string(&inner).unwrap(),
            "source": "inbox",
            "format": { "summary": "string" },
        });
        m.before_tool(QLLM_TOOL_NAME, &mut args).unwrap();
        let request: Value = serde_json::from_str(args["request"].as_str().unwrap()).unwrap();
        assert_eq!(request["text"], Value::from("raw email body text"));
    }

    #[test]
    fn qllm_remote_malformed_request_is_forwarded_unresolved() {
        let m = mediator();
        let mut args = serde_json::json!({
            "request": "{not valid json",
            "source": "inbox",
            "format": {},
        });
        let diagnostics = m.before_tool(QLLM_TOOL_NAME, &mut args).unwrap();
        assert_eq!(args["request"], Value::from("{not valid json"));
        assert_eq!(diagnostics, vec![MediationDiagnostic::MalformedQllmRequest]);
    }

    #[test]
    fn after_tool_null_result_creates_no_entry() {
        let m = mediator();
        let out = m.after_tool("get_balance", Value::Null).unwrap();
        assert!(out.is_null());
        assert_eq!(m.registry().len().unwrap(), 0);
    }

    #[test]
    fn after_tool_empty_object_sanitizes_to_empty_object() {
        let m = mediator();
        let out = m.after_tool("list_things", serde_json::json!({})).unwrap();
        assert_eq!(out, serde_json::json!({}));
        assert_eq!(m.registry().len().unwrap(), 0);
    }

    #[test]
    fn after_tool_object_gets_one_key_per_field() {
        let m = mediator();
        let out = m
            .after_tool("get_profile", serde_json::json!({ "name": "Ana", "balance": 1810.0 }))
            .unwrap();
        let name_key = Key::parse_exact(out["name"].as_str().unwrap()).unwrap();
        let balance_key = Key::parse_exact(out["balance"].as_str().unwrap()).unwrap();
        assert_eq!(m.registry().resolve(name_key).unwrap(), Value::from("Ana"));
        assert_eq!(m.registry().resolve(balance_key).unwrap(), Value::from(1810.0));
    }

    #[test]
    fn after_tool_scalar_gets_single_output_key() {
        let m = mediator();
        let out = m.after_tool("get_balance", Value::from(1810.0)).unwrap();
        let key = Key::parse_exact(out["output"].as_str().unwrap()).unwrap();
        assert_eq!(m.registry().resolve(key).unwrap(), Value::from(1810.0));
    }

    #[test]
    fn after_tool_parses_json_string_result_before_sanitizing() {
        let m = mediator();
        let out = m
            .after_tool("search", Value::String("```json\n{\"hits\": 3}\n```".to_string()))
            .unwrap();
        let key = Key::parse_exact(out["hits"].as_str().unwrap()).unwrap();
        assert_eq!(m.registry().resolve(key).unwrap(), Value::from(3));
    }

    #[test]
    fn after_tool_does_not_recurse_into_nested_objects() {
        let m = mediator();
        let out = m
            .after_tool("get_profile", serde_json::json!({ "address": { "city": "Zurich" } }))
            .unwrap();
        let key = Key::parse_exact(out["address"].as_str().unwrap()).unwrap();
        assert_eq!(
            m.registry().resolve(key).unwrap(),
            serde_json::json!({ "city": "Zurich" })
        );
    }

    #[test]
    fn resolve_final_replaces_scalar_and_object_keys() {
        let m = mediator();
        let temp_key = m.registry().create(Value::from(18.0), "tool:weather:temperature").unwrap();
        let cond_key = m.registry().create(Value::from("cloudy"), "tool:weather:condition").unwrap();
        let text = format!(
            "The temperature in Paris is {temp_key} degrees, condition {cond_key}."
        );
        let (out, diagnostics, resolved_count) = m.resolve_final(&text).unwrap();
        assert_eq!(out, "The temperature in Paris is 18.0 degrees, condition cloudy.");
        assert!(diagnostics.is_empty());
        assert_eq!(resolved_count, 2);
    }

    #[test]
    fn resolve_final_is_identity_on_text_without_keys() {
        let m = mediator();
        let text = "Nothing to resolve here.";
        let (out, diagnostics, resolved_count) = m.resolve_final(text).unwrap();
        assert_eq!(out, text);
        assert!(diagnostics.is_empty());
        assert_eq!(resolved_count, 0);
    }

    #[test]
    fn resolve_final_leaves_unknown_key_token_visible() {
        let m = mediator();
        let text = "Stale reference: key:00000000-0000-4000-8000-000000000000";
        let (out, diagnostics, resolved_count) = m.resolve_final(text).unwrap();
        assert_eq!(out, text);
        assert_eq!(
            diagnostics,
            vec![MediationDiagnostic::UnknownKey {
                token: "key:00000000-0000-4000-8000-000000000000".to_string()
            }]
        );
        assert_eq!(resolved_count, 0);
    }

    #[test]
    fn before_agent_is_a_harmless_no_op() {
        let m = mediator();
        m.before_agent("session-1");
    }

    #[test]
    fn after_agent_delegates_to_resolve_final() {
        let m = mediator();
        let key = m.registry().create(Value::from(18.0), "tool:weather:temperature").unwrap();
        let text = format!("It is {key} degrees.");
        let (out, diagnostics, resolved_count) = m.after_agent("session-1", &text).unwrap();
        assert_eq!(out, "It is 18.0 degrees.");
        assert!(diagnostics.is_empty());
        assert_eq!(resolved_count, 1);
    }
}
