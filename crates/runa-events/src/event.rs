// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use runa_tools::Todo;

/// The three logical event channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Ordered per-turn streaming output.
    Progress,
    /// Permission prompts, decisions, fork/room signals.
    Control,
    /// Lifecycle, errors, tool metadata, todos, file changes.
    Monitor,
}

impl Channel {
    pub const ALL: [Channel; 3] = [Channel::Progress, Channel::Control, Channel::Monitor];

    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Progress => "progress",
            Channel::Control => "control",
            Channel::Monitor => "monitor",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The call summary carried by a permission prompt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PermissionCallInfo {
    pub id: String,
    pub name: String,
    pub args: Value,
}

/// Every event the runtime publishes, across all three channels.
///
/// The wire tag matches the event name subscribers filter on; see
/// [`AgentEvent::channel`] for the channel an event travels on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    // ── progress ─────────────────────────────────────────────────────────────
    TextChunkStart,
    TextChunk { text: String },
    TextChunkEnd,
    ThinkChunkStart,
    ThinkChunk { text: String },
    ThinkChunkEnd,
    #[serde(rename = "tool:announce")]
    ToolAnnounce { id: String, name: String },
    #[serde(rename = "tool:start")]
    ToolStart {
        id: String,
        name: String,
        args: Value,
        phase: String,
    },
    #[serde(rename = "tool:error")]
    ToolError { id: String, message: String },
    #[serde(rename = "tool:end")]
    ToolEnd {
        id: String,
        name: String,
        outcome: Value,
        is_error: bool,
    },
    Done {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    // ── control ──────────────────────────────────────────────────────────────
    PermissionRequired { call: PermissionCallInfo },
    PermissionDecided {
        id: String,
        decision: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        note: Option<String>,
    },
    AgentHalted { reason: String },
    ForkCreated { child: String },
    MentionRouted { room: String, from: String },

    // ── monitor ──────────────────────────────────────────────────────────────
    MessagesChanged { count: usize },
    Lifecycle { state: String },
    Error {
        kind: String,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<Value>,
    },
    ToolExecuted { call_id: String, duration_ms: u64 },
    TodoUpdated { todos: Vec<Todo> },
    FileChanged { path: String, kind: String },
    ToolCustomEvent {
        call_id: String,
        name: String,
        data: Value,
    },
    SubscriberLag { dropped: u64 },
    SnapshotTaken { id: String, seq: u64 },
    AgentResumed {
        strategy: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        sealed: Vec<String>,
    },
}

impl AgentEvent {
    /// The channel this event travels on.
    pub fn channel(&self) -> Channel {
        use AgentEvent::*;
        match self {
            TextChunkStart | TextChunk { .. } | TextChunkEnd | ThinkChunkStart
            | ThinkChunk { .. } | ThinkChunkEnd | ToolAnnounce { .. } | ToolStart { .. }
            | ToolError { .. } | ToolEnd { .. } | Done { .. } => Channel::Progress,
            PermissionRequired { .. } | PermissionDecided { .. } | AgentHalted { .. }
            | ForkCreated { .. } | MentionRouted { .. } => Channel::Control,
            MessagesChanged { .. } | Lifecycle { .. } | Error { .. } | ToolExecuted { .. }
            | TodoUpdated { .. } | FileChanged { .. } | ToolCustomEvent { .. }
            | SubscriberLag { .. } | SnapshotTaken { .. } | AgentResumed { .. } => Channel::Monitor,
        }
    }

    /// The wire tag, used by `on(event_type, handler)` filtering.
    pub fn type_name(&self) -> &'static str {
        use AgentEvent::*;
        match self {
            TextChunkStart => "text_chunk_start",
            TextChunk { .. } => "text_chunk",
            TextChunkEnd => "text_chunk_end",
            ThinkChunkStart => "think_chunk_start",
            ThinkChunk { .. } => "think_chunk",
            ThinkChunkEnd => "think_chunk_end",
            ToolAnnounce { .. } => "tool:announce",
            ToolStart { .. } => "tool:start",
            ToolError { .. } => "tool:error",
            ToolEnd { .. } => "tool:end",
            Done { .. } => "done",
            PermissionRequired { .. } => "permission_required",
            PermissionDecided { .. } => "permission_decided",
            AgentHalted { .. } => "agent_halted",
            ForkCreated { .. } => "fork_created",
            MentionRouted { .. } => "mention_routed",
            MessagesChanged { .. } => "messages_changed",
            Lifecycle { .. } => "lifecycle",
            Error { .. } => "error",
            ToolExecuted { .. } => "tool_executed",
            TodoUpdated { .. } => "todo_updated",
            FileChanged { .. } => "file_changed",
            ToolCustomEvent { .. } => "tool_custom_event",
            SubscriberLag { .. } => "subscriber_lag",
            SnapshotTaken { .. } => "snapshot_taken",
            AgentResumed { .. } => "agent_resumed",
        }
    }
}

/// A durably logged, sequence-stamped event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub seq: u64,
    pub agent_id: String,
    pub channel: Channel,
    pub timestamp: DateTime<Utc>,
    pub event: AgentEvent,
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn progress_events_map_to_progress_channel() {
        assert_eq!(AgentEvent::TextChunkStart.channel(), Channel::Progress);
        assert_eq!(AgentEvent::Done { error: None }.channel(), Channel::Progress);
    }

    #[test]
    fn permission_events_map_to_control_channel() {
        let e = AgentEvent::PermissionRequired {
            call: PermissionCallInfo {
                id: "c1".into(),
                name: "fs_write".into(),
                args: json!({}),
            },
        };
        assert_eq!(e.channel(), Channel::Control);
    }

    #[test]
    fn tool_events_use_colon_names() {
        let e = AgentEvent::ToolStart {
            id: "c1".into(),
            name: "grep".into(),
            args: json!({}),
            phase: "permitted".into(),
        };
        assert_eq!(e.type_name(), "tool:start");
        let v = serde_json::to_value(&e).unwrap();
        assert_eq!(v["type"], "tool:start");
    }

    #[test]
    fn type_name_matches_serde_tag() {
        let events = vec![
            AgentEvent::TextChunk { text: "x".into() },
            AgentEvent::Done { error: None },
            AgentEvent::PermissionDecided {
                id: "c".into(),
                decision: "deny".into(),
                note: None,
            },
            AgentEvent::MessagesChanged { count: 1 },
            AgentEvent::SubscriberLag { dropped: 3 },
            AgentEvent::AgentResumed {
                strategy: "crash".into(),
                sealed: vec!["c1".into()],
            },
        ];
        for e in events {
            let v = serde_json::to_value(&e).unwrap();
            assert_eq!(v["type"], e.type_name(), "tag mismatch for {e:?}");
        }
    }

    #[test]
    fn envelope_roundtrips_as_single_line_json() {
        let env = EventEnvelope {
            seq: 7,
            agent_id: "a1".into(),
            channel: Channel::Monitor,
            timestamp: Utc::now(),
            event: AgentEvent::Lifecycle {
                state: "created".into(),
            },
        };
        let line = serde_json::to_string(&env).unwrap();
        assert!(!line.contains('\n'));
        let back: EventEnvelope = serde_json::from_str(&line).unwrap();
        assert_eq!(back, env);
    }
}
