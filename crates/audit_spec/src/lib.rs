//! dlm_audit_spec
//!
//! Strongly-typed audit events for the key/handle mediation pipeline.
//! Mirrors the mediator's data flow:
//! - KeyCreated / KeyResolutionFailed
//! - ToolInvocationResolved / ToolInvocationSanitized
//! - PolicyDecided
//! - QllmResponseValidated / QllmResponseRejected
//! - FinalResolutionPerformed
//! NOTE: schema_version increments are per-event, not global.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KeyId(pub Uuid);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub r#type: String, // "artifact_ref"
    pub hash: String,   // sha256:...
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RiskClass {
    Read,
    Write,
    Exec,
    Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyCreated {
    pub schema_version: u8,
    pub session_id: SessionId,
    pub ts: f64,
    pub key: KeyId,
    pub type_hint: String,
    /// sha256 of the canonical JSON of the stored value, never the value itself.
    pub value_hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyResolutionFailed {
    pub schema_version: u8,
    pub session_id: SessionId,
    pub ts: f64,
    /// Raw token text that looked like a key but was not found.
    pub token: String,
    /// Where the lookup happened: "argument_resolution" or "final_resolution".
    pub site: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationResolved {
    pub schema_version: u8,
    pub session_id: SessionId,
    pub ts: f64,
    pub tool_name: String,
    pub args_hash: String, // sha256 of canonical JSON of resolved args
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInvocationSanitized {
    pub schema_version: u8,
    pub session_id: SessionId,
    pub ts: f64,
    pub tool_name: String,
    pub result_hash: String, // sha256 of canonical JSON of the raw result
    pub keys_issued: Vec<KeyId>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyVerdict {
    Allow,
    Deny,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecided {
    pub schema_version: u8,
    pub session_id: SessionId,
    pub ts: f64,
    pub tool_name: String,
    pub verdict: PolicyVerdict,
    pub risk_class: RiskClass,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QllmResponseValidated {
    pub schema_version: u8,
    pub session_id: SessionId,
    pub ts: f64,
    pub fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QllmResponseRejected {
    pub schema_version: u8,
    pub session_id: SessionId,
    pub ts: f64,
    pub failing_fields: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalResolutionPerformed {
    pub schema_version: u8,
    pub session_id: SessionId,
    pub ts: f64,
    pub keys_resolved: u32,
    pub keys_unresolved: u32,
}

/// The `qllm_remote` `request` field did not parse as JSON on a
/// `before_tool` pass; the unresolved string was forwarded to the tool
/// as-is. spec.md §7 marks this error "Visible to: logs" — this is the
/// event that fulfills that row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MalformedQllmRequest {
    pub schema_version: u8,
    pub session_id: SessionId,
    pub ts: f64,
    pub tool_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type")]
pub enum AuditEvent {
    KeyCreated(KeyCreated),
    KeyResolutionFailed(KeyResolutionFailed),
    ToolInvocationResolved(ToolInvocationResolved),
    ToolInvocationSanitized(ToolInvocationSanitized),
    PolicyDecided(PolicyDecided),
    QllmResponseValidated(QllmResponseValidated),
    QllmResponseRejected(QllmResponseRejected),
    FinalResolutionPerformed(FinalResolutionPerformed),
    MalformedQllmRequest(MalformedQllmRequest),
}
