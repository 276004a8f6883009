// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! runa — a durable, event-driven runtime for LLM tool-use agents.
//!
//! The runtime drives a conversation between a model provider and a set of
//! executable tools while persisting every message, event, and tool call,
//! so a crash or restart can resume work without re-running side-effecting
//! tools.  This crate re-exports the public API; the implementation lives
//! in the member crates (`runa-core`, `runa-store`, `runa-events`, ...).

pub use runa_config::{
    AgentId, AgentOptions, PermissionConfig, PermissionMode, ReasoningTransport, RuntimeOptions,
    SandboxKind, SandboxOptions, SubagentOptions, TimeoutPolicy, TodoOptions,
};
pub use runa_core::{
    Agent, AgentConfig, AgentDeps, AgentError, AgentStatus, ChatReply, ChatStatus, Decision,
    DelegateRequest, HookFlow, HookSet, InboxItem, InboxKind, PostModelAction, ResumeStrategy,
    ScheduleTick, Scheduler, SystemClock, Template, TemplateBuilder, TemplateRegistry, TimeBridge,
    VirtualClock,
};
pub use runa_events::{AgentEvent, Channel, EventBus, EventEnvelope, Subscription};
pub use runa_model::{
    Block, ChunkStream, Completion, Delta, MediaSource, Message, ModelProvider, ModelRequest,
    ProviderError, Role, ScriptedProvider, StreamChunk, ToolSchema, Usage,
};
pub use runa_room::{AgentPool, PoolError, Room, RoomError, RoomMessage};
pub use runa_sandbox::{
    EditPatch, ExecResult, FileChange, FileChangeKind, LocalSandbox, Sandbox, SandboxError,
};
pub use runa_store::{Snapshot, Store, StoreError, StoreMeta};
pub use runa_tools::{
    validate_args, wrap_remote_server, BuiltTool, RemoteTool, RemoteToolSpec, RemoteTransport,
    Todo, TodoStatus, ToolBuilder, ToolCall, ToolCallRecord, ToolCallState, ToolContext,
    ToolDescriptor, ToolHost, ToolInstance, ToolOutcome, ToolRegistry, ToolSource,
};
