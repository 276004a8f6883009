// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use runa_model::Message;
use runa_tools::{Todo, ToolCallRecord};

/// Immutable full-state dump of one agent.
///
/// Portable JSON; `last_seq` is the replay bookmark — events with a greater
/// sequence number post-date this snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub agent_id: String,
    pub snapshot_id: String,
    pub created_at: DateTime<Utc>,
    /// Template id the agent was created from.
    pub template: String,
    pub messages: Vec<Message>,
    pub todos: Vec<Todo>,
    pub tool_records: Vec<ToolCallRecord>,
    pub last_seq: u64,
    /// Call ids awaiting a permission decision when the snapshot was taken.
    #[serde(default)]
    pub pending_permissions: Vec<String>,
}

/// Fast-path resume state, rewritten at clean points.
///
/// When this file is missing or fails its checksum, resume falls back to the
/// newest readable snapshot plus event replay.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreMeta {
    pub template: String,
    /// Last persisted sequence number per channel.
    #[serde(default)]
    pub bookmarks: HashMap<String, u64>,
    /// Tool call ids that were non-terminal at the last meta write.
    #[serde(default)]
    pub in_flight: Vec<String>,
    #[serde(default)]
    pub todos: Vec<Todo>,
}

impl StoreMeta {
    /// The max bookmark across channels.
    pub fn last_seq(&self) -> u64 {
        self.bookmarks.values().copied().max().unwrap_or(0)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_last_seq_is_max_across_channels() {
        let mut meta = StoreMeta::default();
        meta.bookmarks.insert("progress".into(), 12);
        meta.bookmarks.insert("monitor".into(), 40);
        meta.bookmarks.insert("control".into(), 7);
        assert_eq!(meta.last_seq(), 40);
    }

    #[test]
    fn empty_meta_last_seq_is_zero() {
        assert_eq!(StoreMeta::default().last_seq(), 0);
    }

    #[test]
    fn snapshot_roundtrips() {
        let snap = Snapshot {
            agent_id: "a1".into(),
            snapshot_id: "s1".into(),
            created_at: Utc::now(),
            template: "coder".into(),
            messages: vec![Message::user("hi")],
            todos: vec![],
            tool_records: vec![],
            last_seq: 9,
            pending_permissions: vec!["c3".into()],
        };
        let json = serde_json::to_string(&snap).unwrap();
        let back: Snapshot = serde_json::from_str(&json).unwrap();
        assert_eq!(back, snap);
    }
}
