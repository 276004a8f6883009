// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

use runa_model::ToolSchema;

/// Where a tool came from.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum ToolSource {
    #[default]
    Builtin,
    User,
    Remote {
        server: String,
        transport: String,
    },
}

/// Declarative description of a tool: identity, parameter schema, and the
/// metadata the permission engine and batch scheduler consult.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the arguments object.
    pub parameters: Value,
    #[serde(flatten)]
    pub source: ToolSource,
    /// Whether this tool mutates external state.  Denied outright in
    /// read-only mode.
    #[serde(default)]
    pub mutates: bool,
    /// Whether this tool may run in parallel with others in one batch.
    #[serde(default)]
    pub concurrent: bool,
    /// Whether this tool is available in plan mode.
    #[serde(default)]
    pub planning: bool,
    /// Execution timeout in milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

impl ToolDescriptor {
    pub fn new(name: impl Into<String>, description: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            parameters,
            source: ToolSource::Builtin,
            mutates: false,
            concurrent: false,
            planning: false,
            timeout_ms: None,
        }
    }

    /// Export in the shape providers expect.
    pub fn to_schema(&self) -> ToolSchema {
        ToolSchema {
            name: self.name.clone(),
            description: self.description.clone(),
            parameters: self.parameters.clone(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn descriptor_defaults_are_conservative() {
        let d = ToolDescriptor::new("t", "a tool", json!({"type": "object"}));
        assert!(!d.mutates);
        assert!(!d.concurrent);
        assert!(!d.planning);
        assert_eq!(d.source, ToolSource::Builtin);
    }

    #[test]
    fn remote_source_roundtrips() {
        let mut d = ToolDescriptor::new("r", "remote", json!({"type": "object"}));
        d.source = ToolSource::Remote {
            server: "docs".into(),
            transport: "stdio".into(),
        };
        let v = serde_json::to_value(&d).unwrap();
        assert_eq!(v["source"], "remote");
        assert_eq!(v["server"], "docs");
        let back: ToolDescriptor = serde_json::from_value(v).unwrap();
        assert_eq!(back, d);
    }

    #[test]
    fn to_schema_carries_parameters() {
        let params = json!({"type": "object", "properties": {"x": {"type": "string"}}});
        let d = ToolDescriptor::new("t", "desc", params.clone());
        let schema = d.to_schema();
        assert_eq!(schema.name, "t");
        assert_eq!(schema.parameters, params);
    }
}
