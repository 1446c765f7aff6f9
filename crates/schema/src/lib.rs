//! dlm_schema
//!
//! Validates a Q-LLM response object against the `format` map declared in
//! the `qllm_remote` request that produced it. Triggered only for Q-LLM
//! responses (spec.md §4.3); ordinary tool results never pass through here.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// The closed set of type tags a `format` field may declare (spec.md §4.3).
/// Several spellings alias the same runtime check, mirroring how the Python
/// reference's benchmark schemas mix `"float"`/`"number"` and
/// `"bool"`/`"boolean"` interchangeably across `benchmarks/*/policy.py`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeTag {
    #[serde(alias = "integer")]
    Int,
    #[serde(alias = "number")]
    Float,
    #[serde(alias = "str")]
    String,
    #[serde(alias = "boolean")]
    Bool,
    Object,
    #[serde(alias = "list")]
    Array,
}

impl TypeTag {
    fn matches(&self, value: &serde_json::Value) -> bool {
        if value.is_null() {
            // null always accepted: represents unextractable data (spec.md §4.3)
            return true;
        }
        match self {
            TypeTag::Int => value.is_i64() || value.is_u64(),
            // `number` accepts either integer or floating-point
            TypeTag::Float => value.is_number(),
            TypeTag::String => value.is_string(),
            TypeTag::Bool => value.is_boolean(),
            TypeTag::Object => value.is_object(),
            TypeTag::Array => value.is_array(),
        }
    }
}

pub type Format = BTreeMap<String, TypeTag>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaViolation {
    /// Every failing field, not just the first, so the planner can
    /// self-correct in one round-trip (spec.md §7).
    pub missing_fields: Vec<String>,
    pub type_mismatches: Vec<String>,
}

impl std::fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "schema violation: missing={:?} type_mismatches={:?}",
            self.missing_fields, self.type_mismatches
        )
    }
}

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("{0}")]
    Violation(SchemaViolation),
    #[error("response is not a JSON object after parsing")]
    NotAnObject,
}

/// Validate `response` against `format`. If `response` is a JSON string,
/// one parse attempt is made first (spec.md §4.3); if the parsed value is
/// not an object, validation fails with `SchemaError::NotAnObject`.
/// Extra fields beyond those declared are permitted.
pub fn validate(response: &serde_json::Value, format: &Format) -> Result<(), SchemaError> {
    let parsed;
    let object = match response {
        serde_json::Value::String(s) => {
            parsed = serde_json::from_str::<serde_json::Value>(s).map_err(|_| SchemaError::NotAnObject)?;
            parsed.as_object().ok_or(SchemaError::NotAnObject)?
        }
        serde_json::Value::Object(map) => map,
        _ => return Err(SchemaError::NotAnObject),
    };

    let mut missing_fields = Vec::new();
    let mut type_mismatches = Vec::new();

    for (field, tag) in format {
        match object.get(field) {
            None => missing_fields.push(field.clone()),
            Some(value) => {
                if !tag.matches(value) {
                    type_mismatches.push(field.clone());
                }
            }
        }
    }

    if missing_fields.is_empty() && type_mismatches.is_empty() {
        Ok(())
    } else {
        Err(SchemaError::Violation(SchemaViolation { missing_fields, type_mismatches }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn format(pairs: &[(&str, TypeTag)]) -> Format {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn accepts_matching_object() {
        let fmt = format(&[("temperature", TypeTag::Float), ("condition", TypeTag::String)]);
        let response = json!({ "temperature": 18.0, "condition": "cloudy" });
        assert!(validate(&response, &fmt).is_ok());
    }

    #[test]
    fn number_tag_accepts_integer_value() {
        let fmt = format(&[("temperature", TypeTag::Float)]);
        let response = json!({ "temperature": 18 });
        assert!(validate(&response, &fmt).is_ok());
    }

    #[test]
    fn rejects_wrong_type_and_names_the_field() {
        let fmt = format(&[("temperature", TypeTag::Float), ("condition", TypeTag::String)]);
        let response = json!({ "temperature": "hot", "condition": "sunny" });
        let err = validate(&response, &fmt).unwrap_err();
        match err {
            SchemaError::Violation(v) => {
                assert_eq!(v.type_mismatches, vec!["temperature".to_string()]);
                assert!(v.missing_fields.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn null_is_always_accepted() {
        let fmt = format(&[("condition", TypeTag::String)]);
        let response = json!({ "condition": null });
        assert!(validate(&response, &fmt).is_ok());
    }

    #[test]
    fn missing_field_is_reported() {
        let fmt = format(&[("temperature", TypeTag::Float)]);
        let response = json!({});
        let err = validate(&response, &fmt).unwrap_err();
        match err {
            SchemaError::Violation(v) => assert_eq!(v.missing_fields, vec!["temperature".to_string()]),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn extra_fields_are_permitted() {
        let fmt = format(&[("temperature", TypeTag::Float)]);
        let response = json!({ "temperature": 18.0, "humidity": 40 });
        assert!(validate(&response, &fmt).is_ok());
    }

    #[test]
    fn string_response_is_parsed_before_validating() {
        let fmt = format(&[("temperature", TypeTag::Float)]);
        let response = json!(r#"{"temperature": 18.0}"#);
        assert!(validate(&response, &fmt).is_ok());
    }

    #[test]
    fn non_object_after_parse_is_rejected() {
        let fmt = format(&[("temperature", TypeTag::Float)]);
        let response = json!("[1, 2, 3]");
        assert!(matches!(validate(&response, &fmt), Err(SchemaError::NotAnObject)));
    }

    #[test]
    fn type_tag_aliases_deserialize_to_the_same_variant() {
        let a: TypeTag = serde_json::from_str("\"number\"").unwrap();
        let b: TypeTag = serde_json::from_str("\"float\"").unwrap();
        assert_eq!(a, b);
        let c: TypeTag = serde_json::from_str("\"boolean\"").unwrap();
        let d: TypeTag = serde_json::from_str("\"bool\"").unwrap();
        assert_eq!(c, d);
    }
}
