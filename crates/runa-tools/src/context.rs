// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use runa_sandbox::Sandbox;

use crate::todo::Todo;

/// Runtime services a tool may reach back into while executing.
///
/// Implemented by the owning agent; the tool crate only sees this seam so
/// tools stay independent of the orchestrator.
#[async_trait]
pub trait ToolHost: Send + Sync {
    async fn todos(&self) -> Vec<Todo>;
    async fn set_todos(&self, todos: Vec<Todo>) -> anyhow::Result<Vec<Todo>>;

    /// Publish a `monitor: tool_custom_event` scoped to the running call.
    fn emit_custom(&self, call_id: &str, event_type: &str, data: Value);
}

/// Host that ignores everything.  Used by tests and by remote-tool listing,
/// where no agent is attached yet.
#[derive(Default)]
pub struct NoopHost;

#[async_trait]
impl ToolHost for NoopHost {
    async fn todos(&self) -> Vec<Todo> {
        Vec::new()
    }

    async fn set_todos(&self, todos: Vec<Todo>) -> anyhow::Result<Vec<Todo>> {
        Ok(todos)
    }

    fn emit_custom(&self, _call_id: &str, _event_type: &str, _data: Value) {}
}

/// Execution context handed to [`crate::ToolInstance::exec`].
#[derive(Clone)]
pub struct ToolContext {
    pub host: Arc<dyn ToolHost>,
    pub sandbox: Option<Arc<dyn Sandbox>>,
    /// Id of the call being executed; scopes custom events.
    pub call_id: String,
}

impl ToolContext {
    pub fn new(host: Arc<dyn ToolHost>, sandbox: Option<Arc<dyn Sandbox>>, call_id: impl Into<String>) -> Self {
        Self {
            host,
            sandbox,
            call_id: call_id.into(),
        }
    }

    /// Scoped custom-event publisher for the running call.
    pub fn emit(&self, event_type: &str, data: Value) {
        self.host.emit_custom(&self.call_id, event_type, data);
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
