// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// Used for config fields that should be enabled unless the user explicitly
/// sets them to `false`.  `#[serde(default)]` on a `bool` always falls back
/// to `bool::default()` (i.e. `false`), so a named function is required.
fn default_true() -> bool {
    true
}

fn default_max_tool_rounds() -> u32 {
    10
}

fn default_subagent_depth() -> u32 {
    3
}

fn default_tool_result_byte_cap() -> usize {
    30_000
}

/// Opaque printable identifier for a single agent.  Stable across restarts;
/// doubles as the store directory name, so it must not contain path
/// separators.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AgentId(String);

impl AgentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for AgentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AgentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for AgentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// How tool calls are gated before execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    /// Every tool is permitted.
    #[default]
    Auto,
    /// Tools whose descriptor reports `mutates = true` are denied with a
    /// synthetic "read-only mode" result.
    ReadOnly,
    /// Tools listed in `require_approval_tools` suspend until a decision
    /// arrives via `decide()`.
    Approval,
    /// Only planning-marked tools run; everything else queues without
    /// executing until promoted by a decision.
    Plan,
}

/// What happens when an approval wait exceeds `decision_timeout_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeoutPolicy {
    /// End the turn with `status: paused`; the pending call ids are returned
    /// so the caller can decide later.
    #[default]
    Pause,
    Allow,
    Deny,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PermissionConfig {
    #[serde(default)]
    pub mode: PermissionMode,
    /// Tool names that require an explicit decision in `Approval` mode.
    #[serde(default)]
    pub require_approval_tools: Vec<String>,
    /// How long a suspended tool waits for `decide()`.  `None` waits
    /// indefinitely.
    #[serde(default)]
    pub decision_timeout_ms: Option<u64>,
    #[serde(default)]
    pub on_timeout: TimeoutPolicy,
}

/// Todo-list runtime behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Inject a todo-state reminder every N completed model turns.
    #[serde(default)]
    pub remind_interval_steps: Option<u32>,
    /// Inject a todo-state reminder before the first model turn of a chat.
    #[serde(default)]
    pub reminder_on_start: bool,
}

impl Default for TodoOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            remind_interval_steps: None,
            reminder_on_start: false,
        }
    }
}

/// Sub-agent delegation limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubagentOptions {
    /// Template ids a `delegate_task` call may reference.  Empty means any
    /// registered template.
    #[serde(default)]
    pub templates: Vec<String>,
    /// Maximum delegation nesting depth.
    #[serde(default = "default_subagent_depth")]
    pub depth: u32,
}

impl Default for SubagentOptions {
    fn default() -> Self {
        Self {
            templates: Vec::new(),
            depth: default_subagent_depth(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeOptions {
    #[serde(default)]
    pub todo: TodoOptions,
    #[serde(default)]
    pub subagents: SubagentOptions,
}

/// Where reasoning (thinking) blocks travel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningTransport {
    /// Reasoning blocks are kept in history and sent back to the provider.
    #[default]
    Provider,
    /// Kept in history for consumers but stripped from provider requests.
    Internal,
    /// Dropped entirely.
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SandboxKind {
    #[default]
    Local,
    Container,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxOptions {
    #[serde(default)]
    pub kind: SandboxKind,
    /// Working directory root.  `None` means the process working directory.
    #[serde(default)]
    pub work_dir: Option<std::path::PathBuf>,
    /// Reject any path that escapes `work_dir`.
    #[serde(default = "default_true")]
    pub enforce_boundary: bool,
    /// Emit `file_changed` notifications for sandbox mutations.
    #[serde(default = "default_true")]
    pub watch_files: bool,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            kind: SandboxKind::Local,
            work_dir: None,
            enforce_boundary: true,
            watch_files: true,
        }
    }
}

/// Per-agent orchestration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentOptions {
    /// Maximum model→tool rounds inside a single chat turn.
    #[serde(default = "default_max_tool_rounds")]
    pub max_tool_rounds: u32,
    /// Wall-clock bound for an entire chat turn.
    #[serde(default)]
    pub turn_timeout_ms: Option<u64>,
    /// Stream `think_chunk_*` progress events to subscribers.
    #[serde(default = "default_true")]
    pub expose_thinking: bool,
    /// Keep reasoning blocks in the durable message history.
    #[serde(default)]
    pub retain_thinking: bool,
    #[serde(default)]
    pub reasoning_transport: ReasoningTransport,
    #[serde(default)]
    pub sandbox: SandboxOptions,
    /// Tool result content larger than this is head/tail-truncated before
    /// entering history.
    #[serde(default = "default_tool_result_byte_cap")]
    pub tool_result_byte_cap: usize,
    /// Character budget for history before keep-recent compaction fires.
    /// `None` disables compaction.
    #[serde(default)]
    pub history_char_budget: Option<usize>,
    /// Messages preserved verbatim at the tail when compaction fires.
    #[serde(default = "default_compaction_keep_recent")]
    pub compaction_keep_recent: usize,
}

fn default_compaction_keep_recent() -> usize {
    8
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            max_tool_rounds: default_max_tool_rounds(),
            turn_timeout_ms: None,
            expose_thinking: true,
            retain_thinking: false,
            reasoning_transport: ReasoningTransport::default(),
            sandbox: SandboxOptions::default(),
            tool_result_byte_cap: default_tool_result_byte_cap(),
            history_char_budget: None,
            compaction_keep_recent: default_compaction_keep_recent(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agent_id_display_roundtrip() {
        let id = AgentId::new("agent-7");
        assert_eq!(id.to_string(), "agent-7");
        assert_eq!(id.as_str(), "agent-7");
    }

    #[test]
    fn agent_id_serializes_transparently() {
        let id = AgentId::new("a1");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"a1\"");
        let back: AgentId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn permission_mode_defaults_to_auto() {
        assert_eq!(PermissionMode::default(), PermissionMode::Auto);
        let cfg = PermissionConfig::default();
        assert_eq!(cfg.mode, PermissionMode::Auto);
        assert!(cfg.require_approval_tools.is_empty());
    }

    #[test]
    fn permission_mode_uses_camel_case_wire_names() {
        let json = serde_json::to_string(&PermissionMode::ReadOnly).unwrap();
        assert_eq!(json, "\"readOnly\"");
    }

    #[test]
    fn agent_options_defaults() {
        let opts = AgentOptions::default();
        assert_eq!(opts.max_tool_rounds, 10);
        assert!(opts.turn_timeout_ms.is_none());
        assert!(opts.expose_thinking);
        assert!(!opts.retain_thinking);
        assert_eq!(opts.reasoning_transport, ReasoningTransport::Provider);
    }

    #[test]
    fn todo_options_enabled_by_default() {
        let opts: TodoOptions = serde_json::from_str("{}").unwrap();
        assert!(opts.enabled);
        assert!(opts.remind_interval_steps.is_none());
    }

    #[test]
    fn subagent_depth_defaults_to_three() {
        let opts: SubagentOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.depth, 3);
    }

    #[test]
    fn sandbox_boundary_enforced_by_default() {
        let opts = SandboxOptions::default();
        assert!(opts.enforce_boundary);
        assert_eq!(opts.kind, SandboxKind::Local);
    }
}
