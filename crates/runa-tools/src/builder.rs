// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::{
    context::ToolContext, descriptor::ToolDescriptor, outcome::ToolOutcome, ToolCall, ToolInstance,
};

/// What a `preToolUse` hook decided.
pub enum PreToolDecision {
    Continue,
    /// Short-circuit the call with this outcome; the tool never executes.
    Skip(ToolOutcome),
}

/// What a `postToolUse` hook decided.
pub enum PostToolAction {
    Keep,
    /// Rewrite the outcome the model will see.
    Replace(ToolOutcome),
}

pub type PreToolHook =
    Arc<dyn Fn(ToolCall) -> BoxFuture<'static, anyhow::Result<PreToolDecision>> + Send + Sync>;
pub type PostToolHook = Arc<
    dyn Fn(ToolCall, ToolOutcome) -> BoxFuture<'static, anyhow::Result<PostToolAction>>
        + Send
        + Sync,
>;

/// Ordered hook chains attached to a single tool.
#[derive(Default, Clone)]
pub struct ToolHooks {
    pub pre_tool_use: Vec<PreToolHook>,
    pub post_tool_use: Vec<PostToolHook>,
}

type Handler = Arc<
    dyn Fn(Value, ToolContext) -> BoxFuture<'static, anyhow::Result<ToolOutcome>> + Send + Sync,
>;

/// Declarative tool construction.
///
/// ```
/// use runa_tools::{ToolBuilder, ToolInstance, ToolOutcome};
/// use serde_json::json;
///
/// let tool = ToolBuilder::new("always_ok")
///     .description("Echoes its input back")
///     .parameters(json!({
///         "type": "object",
///         "properties": {"value": {"type": "string"}},
///         "required": ["value"]
///     }))
///     .handler(|args, _ctx| async move {
///         Ok(ToolOutcome::ok(json!({"echo": args["value"]})))
///     })
///     .build();
/// assert_eq!(tool.descriptor().name, "always_ok");
/// ```
pub struct ToolBuilder {
    descriptor: ToolDescriptor,
    hooks: ToolHooks,
    handler: Option<Handler>,
}

impl ToolBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            descriptor: ToolDescriptor::new(name, "", serde_json::json!({"type": "object"})),
            hooks: ToolHooks::default(),
            handler: None,
        }
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.descriptor.description = description.into();
        self
    }

    /// JSON Schema for the arguments object.
    pub fn parameters(mut self, schema: Value) -> Self {
        self.descriptor.parameters = schema;
        self
    }

    pub fn mutates(mut self, mutates: bool) -> Self {
        self.descriptor.mutates = mutates;
        self
    }

    pub fn concurrent(mut self, concurrent: bool) -> Self {
        self.descriptor.concurrent = concurrent;
        self
    }

    pub fn planning(mut self, planning: bool) -> Self {
        self.descriptor.planning = planning;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.descriptor.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn pre_tool_use<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ToolCall) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<PreToolDecision>> + Send + 'static,
    {
        self.hooks
            .pre_tool_use
            .push(Arc::new(move |call| Box::pin(hook(call))));
        self
    }

    pub fn post_tool_use<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(ToolCall, ToolOutcome) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<PostToolAction>> + Send + 'static,
    {
        self.hooks
            .post_tool_use
            .push(Arc::new(move |call, outcome| Box::pin(hook(call, outcome))));
        self
    }

    pub fn handler<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Value, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<ToolOutcome>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |args, ctx| Box::pin(handler(args, ctx))));
        self
    }

    pub fn build(self) -> BuiltTool {
        BuiltTool {
            descriptor: self.descriptor,
            hooks: self.hooks,
            handler: self.handler,
        }
    }
}

/// A tool assembled by [`ToolBuilder`].
pub struct BuiltTool {
    descriptor: ToolDescriptor,
    hooks: ToolHooks,
    handler: Option<Handler>,
}

#[async_trait]
impl ToolInstance for BuiltTool {
    fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    fn hooks(&self) -> &ToolHooks {
        &self.hooks
    }

    async fn exec(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<ToolOutcome> {
        match &self.handler {
            Some(handler) => handler(args, ctx.clone()).await,
            None => Ok(ToolOutcome::err(format!(
                "tool {} has no handler",
                self.descriptor.name
            ))),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
