// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod builder;
mod context;
mod descriptor;
mod outcome;
mod record;
mod registry;
mod remote;
mod schema;
mod todo;

pub use builder::{
    BuiltTool, PostToolAction, PostToolHook, PreToolDecision, PreToolHook, ToolBuilder, ToolHooks,
};
pub use context::{NoopHost, ToolContext, ToolHost};
pub use descriptor::{ToolDescriptor, ToolSource};
pub use outcome::ToolOutcome;
pub use record::{StateTransitionError, ToolCallRecord, ToolCallState};
pub use registry::ToolRegistry;
pub use remote::{wrap_remote_server, RemoteTool, RemoteToolSpec, RemoteTransport};
pub use schema::validate_args;
pub use todo::{Todo, TodoStatus};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Opaque identifier assigned by the model (forwarded verbatim).
    pub id: String,
    pub name: String,
    /// Parsed JSON arguments.
    pub args: Value,
}

/// Trait every tool — built-in, user-defined, or remote-wrapped — implements.
#[async_trait]
pub trait ToolInstance: Send + Sync {
    fn descriptor(&self) -> &ToolDescriptor;

    /// Tool-level hooks run around `exec` by the orchestrator.  Defaults to
    /// an empty chain.
    fn hooks(&self) -> &ToolHooks {
        static EMPTY: std::sync::OnceLock<ToolHooks> = std::sync::OnceLock::new();
        EMPTY.get_or_init(ToolHooks::default)
    }

    /// Execute the tool.  A returned `Err` is surfaced as a `tool_runtime`
    /// error with a synthesized outcome; ordinary failures should be
    /// expressed through [`ToolOutcome::err`].
    async fn exec(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutcome>;
}
