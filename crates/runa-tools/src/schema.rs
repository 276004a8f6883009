// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde_json::Value;

/// Validate tool arguments against the tool's declared JSON Schema.
///
/// Pure function of `(schema, args)` — no registry or reflection involved.
/// Returns every violation joined into one message so the model sees the
/// full shape of what it got wrong in a single synthesized result.
pub fn validate_args(schema: &Value, args: &Value) -> Result<(), String> {
    let validator = jsonschema::validator_for(schema)
        .map_err(|e| format!("invalid parameter schema: {e}"))?;
    let errors: Vec<String> = validator.iter_errors(args).map(|e| e.to_string()).collect();
    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors.join("; "))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "value": {"type": "string"},
                "count": {"type": "integer", "minimum": 0}
            },
            "required": ["value"]
        })
    }

    #[test]
    fn valid_args_pass() {
        assert!(validate_args(&schema(), &json!({"value": "ping", "count": 2})).is_ok());
    }

    #[test]
    fn missing_required_field_fails() {
        let err = validate_args(&schema(), &json!({"count": 1})).unwrap_err();
        assert!(err.contains("value"), "error should name the field: {err}");
    }

    #[test]
    fn wrong_type_fails() {
        assert!(validate_args(&schema(), &json!({"value": 42})).is_err());
    }

    #[test]
    fn multiple_violations_are_joined() {
        let err = validate_args(&schema(), &json!({"value": 1, "count": -3})).unwrap_err();
        assert!(err.contains(';'), "expected joined violations: {err}");
    }

    #[test]
    fn bad_schema_is_reported_not_panicked() {
        let bad = json!({"type": "definitely-not-a-type"});
        let err = validate_args(&bad, &json!({})).unwrap_err();
        assert!(err.contains("invalid parameter schema"));
    }

    #[test]
    fn empty_object_schema_accepts_anything() {
        assert!(validate_args(&json!({"type": "object"}), &json!({"extra": true})).is_ok());
    }
}
