//! dlm_registry
//!
//! KeyRegistry: the sole owner of every raw value the mediation layer has
//! ever seen. Mints opaque `key:<uuid>` tokens, binds each to exactly one
//! `{value, type_hint}` record, and resolves tokens back to values.
//!
//! Grounded on `original_source/src/adk_dual_llm/security/handle_manager.py`
//! (`HandleManager.create_handle`/`resolve_handle`/`clear`), generalized to
//! UUIDv4 ids (128-bit, collision-negligible) behind a mutex so a registry
//! can be shared across hook call sites the way
//! `pie_redaction::RedactionEngine` is shared across CLI invocations.

use dlm_common::{canonical_json_bytes, sha256_bytes, CanonError};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

/// An opaque identifier for a registry entry. Always minted internally via
/// `Uuid::new_v4`; there is no public constructor that accepts a
/// caller-supplied id, so an id can never itself contain `:` without a
/// runtime check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key(Uuid);

/// Exact text of the anchored key token, fixed-length hex/hyphen groups.
/// Because ids are canonical UUID text, the `FinalResolver` regex cannot
/// ambiguously over-consume adjacent punctuation-free text the way a looser
/// `[A-Za-z0-9\-]+` class could.
pub const KEY_TOKEN_PREFIX: &str = "key:";

impl Key {
    fn new() -> Self {
        Key(Uuid::new_v4())
    }

    pub fn id(&self) -> Uuid {
        self.0
    }

    /// Parse a string that is *exactly* a key token (no surrounding text).
    /// Used by the Mediator when resolving a string leaf: detection is on
    /// string-equality to the `key:<id>` form, never a substring match.
    pub fn parse_exact(s: &str) -> Option<Key> {
        let rest = s.strip_prefix(KEY_TOKEN_PREFIX)?;
        let id = Uuid::parse_str(rest).ok()?;
        Some(Key(id))
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", KEY_TOKEN_PREFIX, self.0)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown key: {0}")]
    UnknownKey(Key),
    #[error("canonical json error: {0}")]
    Canon(#[from] CanonError),
    #[error("registry lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone)]
struct Entry {
    value: serde_json::Value,
    type_hint: String,
}

/// Per-session registry. `create` and `resolve` are the boundary every raw
/// value must cross: total coverage at the boundary is the whole point of
/// this type. Safe to share across threads via `Arc<KeyRegistry>` — a
/// simple per-registry mutex suffices since within a session tool calls are
/// issued sequentially by construction.
pub struct KeyRegistry {
    entries: Mutex<HashMap<Key, Entry>>,
}

impl Default for KeyRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyRegistry {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Allocate a fresh key bound to `value`, tagged with a free-form
    /// `type_hint` of the form `tool:<tool_name>[:<field>]`. Never fails in
    /// normal operation; a poisoned lock is the one fatal path, since the
    /// no-raw-to-planner invariant can no longer be upheld once the
    /// registry itself is inconsistent.
    pub fn create(
        &self,
        value: serde_json::Value,
        type_hint: impl Into<String>,
    ) -> Result<Key, RegistryError> {
        let key = Key::new();
        let mut guard = self.entries.lock().map_err(|_| RegistryError::Poisoned)?;
        guard.insert(key, Entry { value, type_hint: type_hint.into() });
        Ok(key)
    }

    /// Resolve a key to its bound value. Idempotent for the session's
    /// lifetime: the same key always resolves to the same value until
    /// `clear()`.
    pub fn resolve(&self, key: Key) -> Result<serde_json::Value, RegistryError> {
        let guard = self.entries.lock().map_err(|_| RegistryError::Poisoned)?;
        guard
            .get(&key)
            .map(|e| e.value.clone())
            .ok_or(RegistryError::UnknownKey(key))
    }

    /// Type hint recorded at creation, for diagnostics/audit only.
    pub fn type_hint(&self, key: Key) -> Result<String, RegistryError> {
        let guard = self.entries.lock().map_err(|_| RegistryError::Poisoned)?;
        guard
            .get(&key)
            .map(|e| e.type_hint.clone())
            .ok_or(RegistryError::UnknownKey(key))
    }

    /// Drop all entries atomically. Used on session end or explicit reset;
    /// there is no deletion of individual entries during a session.
    pub fn clear(&self) -> Result<(), RegistryError> {
        let mut guard = self.entries.lock().map_err(|_| RegistryError::Poisoned)?;
        guard.clear();
        Ok(())
    }

    pub fn len(&self) -> Result<usize, RegistryError> {
        Ok(self.entries.lock().map_err(|_| RegistryError::Poisoned)?.len())
    }

    pub fn is_empty(&self) -> Result<bool, RegistryError> {
        Ok(self.len()? == 0)
    }

    /// sha256 of the canonical JSON of a value about to be stored. Used only
    /// by callers that want to audit *that* a value was stored without
    /// recording the value itself.
    pub fn hash_value(value: &serde_json::Value) -> Result<String, RegistryError> {
        let bytes = canonical_json_bytes(value)?;
        Ok(sha256_bytes(&bytes))
    }

    /// Snapshot every entry as `{key_text: {value, type_hint}}`, for the CLI
    /// `run-trace --dump-registry` / `resolve-final --registry-dump` demo
    /// path (ambient, not part of the core invariants).
    pub fn dump(&self) -> Result<serde_json::Value, RegistryError> {
        let guard = self.entries.lock().map_err(|_| RegistryError::Poisoned)?;
        let mut out = serde_json::Map::new();
        for (k, e) in guard.iter() {
            out.insert(
                k.to_string(),
                serde_json::json!({ "value": e.value, "type_hint": e.type_hint }),
            );
        }
        Ok(serde_json::Value::Object(out))
    }

    /// Load a registry from a previously-dumped snapshot (see `dump`).
    pub fn load(dump: &serde_json::Value) -> Result<Self, RegistryError> {
        let registry = Self::new();
        if let Some(obj) = dump.as_object() {
            let mut guard = registry.entries.lock().map_err(|_| RegistryError::Poisoned)?;
            for (k, v) in obj.iter() {
                let Some(key) = Key::parse_exact(k) else { continue };
                let value = v.get("value").cloned().unwrap_or(serde_json::Value::Null);
                let type_hint = v
                    .get("type_hint")
                    .and_then(|t| t.as_str())
                    .unwrap_or_default()
                    .to_string();
                guard.insert(key, Entry { value, type_hint });
            }
        }
        Ok(registry)
    }
}

/// A `{value, type_hint}` pair is any JSON-expressible datum; this impl lets
/// call sites build a `serde_json::Value` for `create` from any `Serialize`
/// type without an intermediate allocation at every call site.
pub fn to_value<T: Serialize>(v: &T) -> Result<serde_json::Value, RegistryError> {
    Ok(serde_json::to_value(v).map_err(|e| RegistryError::Canon(CanonError::Json(e)))?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_resolution_is_idempotent() {
        let reg = KeyRegistry::new();
        let key = reg.create(serde_json::json!(1810.0), "tool:get_balance").unwrap();
        assert_eq!(reg.resolve(key).unwrap(), serde_json::json!(1810.0));
        // resolving again returns the same value for the session's lifetime
        assert_eq!(reg.resolve(key).unwrap(), serde_json::json!(1810.0));
    }

    #[test]
    fn unknown_key_fails_to_resolve() {
        let reg = KeyRegistry::new();
        let other = KeyRegistry::new();
        let key = other.create(serde_json::json!("x"), "tool:t").unwrap();
        let err = reg.resolve(key).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownKey(_)));
    }

    #[test]
    fn clear_drops_all_entries() {
        let reg = KeyRegistry::new();
        let key = reg.create(serde_json::json!("secret"), "tool:t").unwrap();
        reg.clear().unwrap();
        assert!(reg.resolve(key).is_err());
        assert!(reg.is_empty().unwrap());
    }

    #[test]
    fn key_token_round_trips_through_display_and_parse() {
        let reg = KeyRegistry::new();
        let key = reg.create(serde_json::json!(42), "tool:t").unwrap();
        let text = key.to_string();
        assert!(text.starts_with(KEY_TOKEN_PREFIX));
        let parsed = Key::parse_exact(&text).unwrap();
        assert_eq!(parsed, key);
    }

    #[test]
    fn parse_exact_rejects_substrings_and_garbage() {
        assert!(Key::parse_exact("not a key").is_none());
        assert!(Key::parse_exact("key:not-a-uuid").is_none());
        // a key token embedded mid-word must not parse as a bare match
        let reg = KeyRegistry::new();
        let key = reg.create(serde_json::json!(1), "tool:t").unwrap();
        let embedded = format!("prefix-{}-suffix", key);
        assert!(Key::parse_exact(&embedded).is_none());
    }

    #[test]
    fn dump_and_load_preserve_entries() {
        let reg = KeyRegistry::new();
        let key = reg.create(serde_json::json!({"a": 1}), "tool:t:field").unwrap();
        let dump = reg.dump().unwrap();
        let reloaded = KeyRegistry::load(&dump).unwrap();
        assert_eq!(reloaded.resolve(key).unwrap(), serde_json::json!({"a": 1}));
        assert_eq!(reloaded.type_hint(key).unwrap(), "tool:t:field");
    }
}
