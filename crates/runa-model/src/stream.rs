// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::{Block, Message};

/// Token accounting reported by the provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// A tool descriptor in the shape providers expect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSchema {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// A completion request.  Providers translate this into their wire format.
#[derive(Debug, Clone, Default)]
pub struct ModelRequest {
    pub messages: Vec<Message>,
    pub system: Option<String>,
    pub tools: Vec<ToolSchema>,
    pub temperature: Option<f32>,
    pub max_tokens: Option<u32>,
    pub extra_headers: Vec<(String, String)>,
    pub extra_body: Option<Value>,
    /// Whether the caller may include image/file/audio/video blocks.
    pub multimodal: bool,
}

/// A non-streaming completion result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Completion {
    pub content: Vec<Block>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

/// Incremental change inside a content block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Delta {
    TextDelta { text: String },
    InputJsonDelta { partial_json: String },
    ThinkingDelta { text: String },
}

/// One chunk of a streamed model response.
///
/// The orchestrator consumes these lazily and fans them out as progress
/// events while accumulating the assistant message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamChunk {
    MessageStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    ContentBlockStart {
        index: u32,
        content_block: Block,
    },
    ContentBlockDelta {
        index: u32,
        delta: Delta,
    },
    ContentBlockStop {
        index: u32,
    },
    MessageDelta {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
    },
    MessageStop,
}

impl StreamChunk {
    /// Convenience for scripting a plain text response as chunks.
    pub fn text_sequence(text: impl Into<String>) -> Vec<StreamChunk> {
        vec![
            StreamChunk::MessageStart { usage: None },
            StreamChunk::ContentBlockStart {
                index: 0,
                content_block: Block::text(""),
            },
            StreamChunk::ContentBlockDelta {
                index: 0,
                delta: Delta::TextDelta { text: text.into() },
            },
            StreamChunk::ContentBlockStop { index: 0 },
            StreamChunk::MessageStop,
        ]
    }

    /// Convenience for scripting a single tool call as chunks.  The input
    /// JSON arrives through an `input_json_delta` exactly like a real
    /// provider stream.
    pub fn tool_use_sequence(
        id: impl Into<String>,
        name: impl Into<String>,
        args_json: impl Into<String>,
    ) -> Vec<StreamChunk> {
        vec![
            StreamChunk::MessageStart { usage: None },
            StreamChunk::ContentBlockStart {
                index: 0,
                content_block: Block::ToolUse {
                    id: id.into(),
                    name: name.into(),
                    input: Value::Object(Default::default()),
                },
            },
            StreamChunk::ContentBlockDelta {
                index: 0,
                delta: Delta::InputJsonDelta {
                    partial_json: args_json.into(),
                },
            },
            StreamChunk::ContentBlockStop { index: 0 },
            StreamChunk::MessageStop,
        ]
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
