// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod agent;
mod context;
mod error;
mod hooks;
mod inbox;
mod permission;
mod resume;
mod scheduler;
mod template;
mod todos;
mod toolrun;
mod turn;


pub use agent::{
    Agent, AgentConfig, AgentDeps, AgentStatus, ChatReply, ChatStatus, DelegateRequest, Deregister,
};
pub use error::{AgentError, ErrorKind};
pub use hooks::{
    HookFlow, HookSet, MessagesChangedHook, PostModelAction, PostModelHook, PreModelHook,
};
pub use inbox::{InboxItem, InboxKind};
pub use permission::{Decision, PermissionEngine};
pub use resume::ResumeStrategy;
pub use scheduler::{
    ScheduleCallback, ScheduleTick, Scheduler, SystemClock, TaskId, TimeBridge, VirtualClock,
};
pub use template::{Template, TemplateBuilder, TemplateRegistry};
pub use todos::TodoService;
