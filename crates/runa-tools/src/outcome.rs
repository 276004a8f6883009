// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The result of executing (or refusing) a tool call.
///
/// `value` is the JSON the model sees in the paired `tool_result` block; the
/// `{ok, data}` / `{ok, error}` convention keeps success and failure shapes
/// uniform across built-in, user, and remote tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub value: Value,
    pub is_error: bool,
}

impl ToolOutcome {
    pub fn ok(data: Value) -> Self {
        Self {
            value: json!({"ok": true, "data": data}),
            is_error: false,
        }
    }

    pub fn err(message: impl Into<String>) -> Self {
        Self {
            value: json!({"ok": false, "error": message.into()}),
            is_error: true,
        }
    }

    /// Schema validation failure — carries the `_validationError` marker so
    /// consumers can distinguish it from runtime failures.
    pub fn validation_err(message: impl Into<String>) -> Self {
        Self {
            value: json!({"ok": false, "error": message.into(), "_validationError": true}),
            is_error: true,
        }
    }

    pub fn timeout() -> Self {
        Self {
            value: json!({"ok": false, "error": "timeout"}),
            is_error: true,
        }
    }

    /// Synthetic outcome for calls interrupted by a crash and sealed on
    /// resume.
    pub fn sealed() -> Self {
        Self {
            value: json!({"ok": false, "error": "sealed on resume"}),
            is_error: true,
        }
    }

    /// The `tool_result` block content the model sees.
    pub fn render(&self) -> String {
        self.value.to_string()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ok_outcome_wraps_data() {
        let o = ToolOutcome::ok(json!({"echo": "ping"}));
        assert!(!o.is_error);
        assert_eq!(o.value["ok"], true);
        assert_eq!(o.value["data"]["echo"], "ping");
    }

    #[test]
    fn err_outcome_carries_message() {
        let o = ToolOutcome::err("boom");
        assert!(o.is_error);
        assert_eq!(o.value["ok"], false);
        assert_eq!(o.value["error"], "boom");
    }

    #[test]
    fn validation_err_is_marked() {
        let o = ToolOutcome::validation_err("missing field");
        assert_eq!(o.value["_validationError"], true);
        assert!(o.is_error);
    }

    #[test]
    fn timeout_outcome_shape() {
        let o = ToolOutcome::timeout();
        assert_eq!(o.value["error"], "timeout");
        assert!(o.is_error);
    }

    #[test]
    fn render_is_single_line_json() {
        let o = ToolOutcome::ok(json!({"n": 1}));
        let rendered = o.render();
        assert!(!rendered.contains('\n'));
        let back: Value = serde_json::from_str(&rendered).unwrap();
        assert_eq!(back["data"]["n"], 1);
    }
}
