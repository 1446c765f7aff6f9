//! dlm_audit_log
//!
//! Append-only JSONL audit log with hash chaining.
//! - Each record includes: event, prev_hash, hash
//! - Hash is computed over canonical JSON of (event + prev_hash)
//! - Verifier replays and checks integrity end-to-end

use dlm_audit_spec::AuditEvent;
use dlm_common::sha256_canonical_json;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuditLogError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("canonical json error: {0}")]
    Canon(#[from] dlm_common::CanonError),
    #[error("hash mismatch at line {line}: expected {expected}, got {got}")]
    HashMismatch { line: usize, expected: String, got: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub prev_hash: String, // sha256:... or "sha256:00..00" for genesis
    pub hash: String,      // sha256:...
    pub event: AuditEvent,
}

#[derive(Debug, Clone, Serialize)]
struct HashPayload<'a> {
    prev_hash: &'a str,
    event: &'a AuditEvent,
}

pub fn genesis_hash() -> String {
    "sha256:0000000000000000000000000000000000000000000000000000000000000000".to_string()
}

pub fn compute_record_hash(prev_hash: &str, event: &AuditEvent) -> Result<String, AuditLogError> {
    let payload = HashPayload { prev_hash, event };
    Ok(sha256_canonical_json(&payload)?)
}

/// Appends events to a session's audit log. Not part of the mediation core
/// (spec.md §1 scopes the core to key/handle mediation), but every fatal or
/// semantic event the core raises is recorded here so a session's history
/// can be replayed and verified end to end.
pub struct AuditAppender {
    file: File,
    last_hash: String,
}

impl AuditAppender {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditLogError> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file, last_hash: genesis_hash() })
    }

    pub fn with_last_hash(mut self, last_hash: String) -> Self {
        self.last_hash = last_hash;
        self
    }

    pub fn append(&mut self, event: AuditEvent) -> Result<AuditRecord, AuditLogError> {
        let prev_hash = self.last_hash.clone();
        let hash = compute_record_hash(&prev_hash, &event)?;
        let record = AuditRecord { prev_hash, hash: hash.clone(), event };
        let line = serde_json::to_string(&record)?;
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()?;
        self.last_hash = hash;
        Ok(record)
    }
}

pub fn verify_log(path: impl AsRef<Path>) -> Result<String, AuditLogError> {
    let f = File::open(path)?;
    let reader = BufReader::new(f);
    let mut expected_prev = genesis_hash();

    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(&line)?;
        if rec.prev_hash != expected_prev {
            return Err(AuditLogError::HashMismatch {
                line: line_no,
                expected: expected_prev,
                got: rec.prev_hash,
            });
        }
        let computed = compute_record_hash(&rec.prev_hash, &rec.event)?;
        if computed != rec.hash {
            return Err(AuditLogError::HashMismatch {
                line: line_no,
                expected: computed,
                got: rec.hash,
            });
        }
        expected_prev = rec.hash;
    }

    Ok(expected_prev)
}

#[cfg(test)]
mod tests {
    use super::*;
    use dlm_audit_spec::*;
    use std::fs;

    #[test]
    fn hash_chain_verifies() {
        let tmp = std::env::temp_dir().join("dlm_audit_test.jsonl");
        let _ = fs::remove_file(&tmp);

        let mut app = AuditAppender::open(&tmp).unwrap();

        let e1 = AuditEvent::KeyCreated(KeyCreated {
            schema_version: 1,
            session_id: SessionId("s1".into()),
            ts: 1.0,
            key: KeyId(uuid::Uuid::new_v4()),
            type_hint: "tool:get_balance".into(),
            value_hash: "sha256:abc".into(),
        });
        app.append(e1).unwrap();

        let e2 = AuditEvent::PolicyDecided(PolicyDecided {
            schema_version: 1,
            session_id: SessionId("s1".into()),
            ts: 2.0,
            tool_name: "send_money".into(),
            verdict: PolicyVerdict::Deny,
            risk_class: RiskClass::Network,
            reason: Some("recipient not allowlisted".into()),
        });
        app.append(e2).unwrap();

        let last = verify_log(&tmp).unwrap();
        assert!(last.starts_with("sha256:"));
    }

    #[test]
    fn tampered_line_fails_verification() {
        let tmp = std::env::temp_dir().join("dlm_audit_tamper_test.jsonl");
        let _ = fs::remove_file(&tmp);

        let mut app = AuditAppender::open(&tmp).unwrap();
        app.append(AuditEvent::KeyResolutionFailed(KeyResolutionFailed {
            schema_version: 1,
            session_id: SessionId("s1".into()),
            ts: 1.0,
            token: "key:deadbeef".into(),
            site: "argument_resolution".into(),
        }))
        .unwrap();

        let mut contents = fs::read_to_string(&tmp).unwrap();
        contents = contents.replace("argument_resolution", "final_resolution");
        fs::write(&tmp, contents).unwrap();

        assert!(verify_log(&tmp).is_err());
    }
}
