// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::sync::Arc;

use runa_model::ToolSchema;

use crate::{descriptor::ToolDescriptor, ToolInstance};

/// Central registry holding all available tools.
///
/// Read-only after the registration phase; concurrent reads from the agent
/// loop and delegated sub-agents require no lock.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn ToolInstance>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    pub fn register(&mut self, tool: impl ToolInstance + 'static) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn ToolInstance>) {
        self.tools
            .insert(tool.descriptor().name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ToolInstance>> {
        self.tools.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Descriptors for all registered tools, name-sorted for stable export.
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        let mut descriptors: Vec<ToolDescriptor> = self
            .tools
            .values()
            .map(|t| t.descriptor().clone())
            .collect();
        descriptors.sort_by(|a, b| a.name.cmp(&b.name));
        descriptors
    }

    /// Provider-shaped schemas, optionally restricted to a tool allow-list.
    pub fn schemas(&self, allow: Option<&[String]>) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .filter(|t| match allow {
                Some(names) => names.iter().any(|n| n == &t.descriptor().name),
                None => true,
            })
            .map(|t| t.descriptor().to_schema())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{ToolBuilder, ToolOutcome};

    fn echo_tool(name: &str) -> crate::BuiltTool {
        ToolBuilder::new(name)
            .description("echoes its input")
            .handler(|args, _ctx| async move { Ok(ToolOutcome::ok(args)) })
            .build()
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_tool("echo"));
        assert!(reg.get("echo").is_some());
        assert!(reg.get("missing").is_none());
    }

    #[test]
    fn names_are_sorted() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_tool("b"));
        reg.register(echo_tool("a"));
        assert_eq!(reg.names(), vec!["a", "b"]);
    }

    #[test]
    fn schemas_respect_allow_list() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_tool("keep"));
        reg.register(echo_tool("drop"));
        let allow = vec!["keep".to_string()];
        let schemas = reg.schemas(Some(&allow));
        assert_eq!(schemas.len(), 1);
        assert_eq!(schemas[0].name, "keep");
    }

    #[test]
    fn registering_same_name_twice_overwrites() {
        let mut reg = ToolRegistry::new();
        reg.register(echo_tool("t"));
        reg.register(
            ToolBuilder::new("t")
                .description("second")
                .parameters(json!({"type": "object"}))
                .build(),
        );
        assert_eq!(reg.names().len(), 1);
        assert_eq!(reg.get("t").unwrap().descriptor().description, "second");
    }
}
