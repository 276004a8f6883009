// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where binary media content lives: inline base64 or a remote URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MediaSource {
    Base64 { base64: String },
    Url { url: String },
}

/// A single content block inside a [`Message`].
///
/// Serialization is a discriminated union on `type`, so every block
/// round-trips through JSON exactly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Block {
    Text {
        text: String,
    },
    Image {
        mime: String,
        #[serde(flatten)]
        source: MediaSource,
    },
    File {
        mime: String,
        #[serde(flatten)]
        source: MediaSource,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        filename: Option<String>,
    },
    Audio {
        mime: String,
        #[serde(flatten)]
        source: MediaSource,
    },
    Video {
        mime: String,
        #[serde(flatten)]
        source: MediaSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        is_error: bool,
    },
    Reasoning {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        signature: Option<String>,
    },
    SystemReminder {
        kind: String,
        text: String,
    },
}

impl Block {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn tool_use(id: impl Into<String>, name: impl Into<String>, input: Value) -> Self {
        Self::ToolUse {
            id: id.into(),
            name: name.into(),
            input,
        }
    }

    pub fn tool_result(tool_use_id: impl Into<String>, content: impl Into<String>, is_error: bool) -> Self {
        Self::ToolResult {
            tool_use_id: tool_use_id.into(),
            content: content.into(),
            is_error,
        }
    }

    pub fn reminder(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self::SystemReminder {
            kind: kind.into(),
            text: text.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// A single message in the conversation history.
///
/// Content is always a block list; plain-text convenience constructors wrap
/// the string in a single [`Block::Text`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<Block>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl Message {
    pub fn new(role: Role, content: Vec<Block>) -> Self {
        Self {
            role,
            content,
            metadata: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Block::text(text)])
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self::new(Role::Assistant, vec![Block::text(text)])
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Role::System, vec![Block::text(text)])
    }

    /// A user message carrying tool results back to the model.
    pub fn tool_results(blocks: Vec<Block>) -> Self {
        Self::new(Role::User, blocks)
    }

    /// A user message wrapping reminder text in a `system_reminder` block so
    /// it is never mistaken for user intent.
    pub fn reminder(kind: impl Into<String>, text: impl Into<String>) -> Self {
        Self::new(Role::User, vec![Block::reminder(kind, text)])
    }

    /// The concatenated plain text of all `Text` blocks.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                Block::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Ids of all `tool_use` blocks in this message.
    pub fn tool_use_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                Block::ToolUse { id, .. } => Some(id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Ids referenced by `tool_result` blocks in this message.
    pub fn tool_result_ids(&self) -> Vec<&str> {
        self.content
            .iter()
            .filter_map(|b| match b {
                Block::ToolResult { tool_use_id, .. } => Some(tool_use_id.as_str()),
                _ => None,
            })
            .collect()
    }

    /// Approximate token count used for context budgeting.
    ///
    /// Text uses the 4-chars-per-token heuristic; media blocks use a flat
    /// estimate since their payload never reaches the tokenizer verbatim.
    pub fn approx_tokens(&self) -> usize {
        self.content
            .iter()
            .map(|b| match b {
                Block::Text { text } | Block::Reasoning { text, .. } => text.len() / 4,
                Block::SystemReminder { text, .. } => text.len() / 4,
                Block::ToolUse { input, .. } => input.to_string().len() / 4,
                Block::ToolResult { content, .. } => content.len() / 4,
                Block::Image { .. } => 765,
                Block::File { .. } | Block::Audio { .. } | Block::Video { .. } => 512,
            })
            .sum()
    }

    /// Character footprint used by the compaction budget.
    pub fn char_len(&self) -> usize {
        self.content
            .iter()
            .map(|b| match b {
                Block::Text { text } | Block::Reasoning { text, .. } => text.len(),
                Block::SystemReminder { text, .. } => text.len(),
                Block::ToolUse { input, .. } => input.to_string().len(),
                Block::ToolResult { content, .. } => content.len(),
                _ => 64,
            })
            .sum()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn text_message_has_single_text_block() {
        let m = Message::user("hello");
        assert_eq!(m.role, Role::User);
        assert_eq!(m.content.len(), 1);
        assert_eq!(m.text(), "hello");
    }

    #[test]
    fn block_serde_is_tagged_on_type() {
        let b = Block::text("hi");
        let v = serde_json::to_value(&b).unwrap();
        assert_eq!(v["type"], "text");
        assert_eq!(v["text"], "hi");
    }

    #[test]
    fn every_block_variant_roundtrips() {
        let blocks = vec![
            Block::text("t"),
            Block::Image {
                mime: "image/png".into(),
                source: MediaSource::Base64 { base64: "aGk=".into() },
            },
            Block::File {
                mime: "text/plain".into(),
                source: MediaSource::Url { url: "https://x/f.txt".into() },
                filename: Some("f.txt".into()),
            },
            Block::Audio {
                mime: "audio/wav".into(),
                source: MediaSource::Base64 { base64: "AA==".into() },
            },
            Block::Video {
                mime: "video/mp4".into(),
                source: MediaSource::Url { url: "https://x/v.mp4".into() },
            },
            Block::tool_use("c1", "grep", json!({"pattern": "x"})),
            Block::tool_result("c1", "3 matches", false),
            Block::Reasoning {
                text: "thinking".into(),
                signature: None,
            },
            Block::reminder("todo", "2 items pending"),
        ];
        for b in blocks {
            let json = serde_json::to_string(&b).unwrap();
            let back: Block = serde_json::from_str(&json).unwrap();
            assert_eq!(back, b, "block did not roundtrip: {json}");
        }
    }

    #[test]
    fn tool_result_error_flag_omitted_when_false() {
        let v = serde_json::to_value(Block::tool_result("c1", "ok", false)).unwrap();
        assert!(v.get("is_error").is_none());
        let v = serde_json::to_value(Block::tool_result("c1", "bad", true)).unwrap();
        assert_eq!(v["is_error"], true);
    }

    #[test]
    fn tool_use_and_result_ids_extracted() {
        let m = Message::new(
            Role::Assistant,
            vec![
                Block::text("calling"),
                Block::tool_use("a", "t1", json!({})),
                Block::tool_use("b", "t2", json!({})),
            ],
        );
        assert_eq!(m.tool_use_ids(), vec!["a", "b"]);

        let r = Message::tool_results(vec![
            Block::tool_result("a", "", false),
            Block::tool_result("b", "", true),
        ]);
        assert_eq!(r.tool_result_ids(), vec!["a", "b"]);
    }

    #[test]
    fn reminder_wraps_in_system_reminder_block() {
        let m = Message::reminder("schedule", "tick");
        assert_eq!(m.role, Role::User);
        assert!(matches!(
            &m.content[0],
            Block::SystemReminder { kind, text } if kind == "schedule" && text == "tick"
        ));
    }

    #[test]
    fn approx_tokens_counts_text() {
        let m = Message::user("12345678"); // 8 chars → 2 tokens
        assert_eq!(m.approx_tokens(), 2);
    }

    #[test]
    fn message_serde_roundtrip_preserves_metadata() {
        let mut m = Message::assistant("done");
        m.metadata = Some(json!({"turn": 3}));
        let json = serde_json::to_string(&m).unwrap();
        let back: Message = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }
}
