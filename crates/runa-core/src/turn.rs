// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Translation of the provider chunk stream into progress events and an
//! accumulated assistant message.

use std::collections::BTreeMap;

use futures::StreamExt;
use serde_json::Value;
use tracing::warn;

use runa_events::AgentEvent;
use runa_model::{Block, ChunkStream, Delta, StreamChunk};
use runa_tools::ToolCall;

/// The accumulated result of one streamed model turn.
pub(crate) struct TurnOutput {
    /// Content blocks in stream order (text, reasoning, tool_use).
    pub blocks: Vec<Block>,
    /// Concatenated text content.
    pub text: String,
    /// Tool calls ready for the lifecycle, in emitted order.
    pub tool_calls: Vec<ToolCall>,
}

enum Accum {
    Text(String),
    Thinking {
        buf: String,
        signature: Option<String>,
    },
    ToolUse {
        id: String,
        name: String,
        initial: Value,
        json_buf: String,
    },
}

/// Drain the chunk stream, fanning out progress events through `emit` while
/// accumulating blocks.  `emit` failures (persistence) propagate — an event
/// that cannot be logged must not be silently streamed.
pub(crate) async fn consume_stream(
    mut stream: ChunkStream,
    expose_thinking: bool,
    emit: &(dyn Fn(AgentEvent) -> anyhow::Result<u64> + Send + Sync),
) -> anyhow::Result<TurnOutput> {
    let mut accums: BTreeMap<u32, Accum> = BTreeMap::new();

    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        match chunk {
            StreamChunk::MessageStart { .. } | StreamChunk::MessageDelta { .. } => {}
            StreamChunk::ContentBlockStart {
                index,
                content_block,
            } => match content_block {
                Block::Text { text } => {
                    emit(AgentEvent::TextChunkStart)?;
                    if !text.is_empty() {
                        emit(AgentEvent::TextChunk { text: text.clone() })?;
                    }
                    accums.insert(index, Accum::Text(text));
                }
                Block::Reasoning { text, signature } => {
                    if expose_thinking {
                        emit(AgentEvent::ThinkChunkStart)?;
                        if !text.is_empty() {
                            emit(AgentEvent::ThinkChunk { text: text.clone() })?;
                        }
                    }
                    accums.insert(index, Accum::Thinking { buf: text, signature });
                }
                Block::ToolUse { id, name, input } => {
                    emit(AgentEvent::ToolAnnounce {
                        id: id.clone(),
                        name: name.clone(),
                    })?;
                    accums.insert(
                        index,
                        Accum::ToolUse {
                            id,
                            name,
                            initial: input,
                            json_buf: String::new(),
                        },
                    );
                }
                other => {
                    warn!(?other, "unexpected content block in model stream; ignoring");
                }
            },
            StreamChunk::ContentBlockDelta { index, delta } => {
                match (accums.get_mut(&index), delta) {
                    (Some(Accum::Text(buf)), Delta::TextDelta { text }) => {
                        buf.push_str(&text);
                        emit(AgentEvent::TextChunk { text })?;
                    }
                    (Some(Accum::Thinking { buf, .. }), Delta::ThinkingDelta { text }) => {
                        buf.push_str(&text);
                        if expose_thinking {
                            emit(AgentEvent::ThinkChunk { text })?;
                        }
                    }
                    (Some(Accum::ToolUse { json_buf, .. }), Delta::InputJsonDelta { partial_json }) => {
                        json_buf.push_str(&partial_json);
                    }
                    (slot, delta) => {
                        warn!(index, present = slot.is_some(), ?delta, "mismatched stream delta");
                    }
                }
            }
            StreamChunk::ContentBlockStop { index } => match accums.get(&index) {
                Some(Accum::Text(_)) => {
                    emit(AgentEvent::TextChunkEnd)?;
                }
                Some(Accum::Thinking { .. }) => {
                    if expose_thinking {
                        emit(AgentEvent::ThinkChunkEnd)?;
                    }
                }
                _ => {}
            },
            StreamChunk::MessageStop => break,
        }
    }

    let mut blocks = Vec::with_capacity(accums.len());
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut synthetic = 0usize;

    for (_, accum) in accums {
        match accum {
            Accum::Text(buf) => {
                if !buf.is_empty() {
                    text.push_str(&buf);
                    blocks.push(Block::Text { text: buf });
                }
            }
            Accum::Thinking { buf, signature } => {
                if !buf.is_empty() {
                    blocks.push(Block::Reasoning {
                        text: buf,
                        signature,
                    });
                }
            }
            Accum::ToolUse {
                mut id,
                name,
                initial,
                json_buf,
            } => {
                // A tool call without a name cannot be dispatched; storing it
                // would corrupt the history sent back to the provider.
                if name.is_empty() {
                    warn!(tool_call_id = %id, "dropping tool call with empty name");
                    continue;
                }
                if id.is_empty() {
                    id = format!("tc_synthetic_{synthetic}");
                    synthetic += 1;
                    warn!(tool_name = %name, tool_call_id = %id, "tool call had empty id; generated synthetic id");
                }
                let args = finalize_args(&name, &id, initial, &json_buf);
                blocks.push(Block::ToolUse {
                    id: id.clone(),
                    name: name.clone(),
                    input: args.clone(),
                });
                tool_calls.push(ToolCall { id, name, args });
            }
        }
    }

    Ok(TurnOutput {
        blocks,
        text,
        tool_calls,
    })
}

/// Resolve streamed tool arguments to a JSON object.
///
/// Providers require tool_use input to be an object; `null` or garbage here
/// would 400 the *next* request, so empty and unparseable buffers degrade to
/// `{}` with a warning.
fn finalize_args(name: &str, id: &str, initial: Value, json_buf: &str) -> Value {
    if json_buf.is_empty() {
        return match initial {
            Value::Object(map) if !map.is_empty() => Value::Object(map),
            _ => Value::Object(Default::default()),
        };
    }
    match serde_json::from_str(json_buf) {
        Ok(value @ Value::Object(_)) => value,
        Ok(other) => {
            warn!(tool_name = %name, tool_call_id = %id, ?other, "non-object tool arguments; substituting {{}}");
            Value::Object(Default::default())
        }
        Err(e) => {
            warn!(tool_name = %name, tool_call_id = %id, error = %e, "invalid JSON tool arguments; substituting {{}}");
            Value::Object(Default::default())
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use futures::stream;
    use serde_json::json;

    use super::*;

    fn chunk_stream(chunks: Vec<StreamChunk>) -> ChunkStream {
        Box::pin(stream::iter(chunks.into_iter().map(Ok)))
    }

    async fn run(chunks: Vec<StreamChunk>) -> (TurnOutput, Vec<AgentEvent>) {
        let events = Mutex::new(Vec::new());
        let output = consume_stream(chunk_stream(chunks), true, &|e| {
            events.lock().unwrap().push(e);
            Ok(0)
        })
        .await
        .unwrap();
        (output, events.into_inner().unwrap())
    }

    #[tokio::test]
    async fn text_chunks_emit_start_delta_end() {
        let (output, events) = run(StreamChunk::text_sequence("Hello")).await;
        let names: Vec<&str> = events.iter().map(|e| e.type_name()).collect();
        assert_eq!(names, vec!["text_chunk_start", "text_chunk", "text_chunk_end"]);
        assert_eq!(output.text, "Hello");
        assert!(output.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn tool_use_accumulates_partial_json() {
        let chunks = vec![
            StreamChunk::MessageStart { usage: None },
            StreamChunk::ContentBlockStart {
                index: 0,
                content_block: Block::tool_use("c1", "grep", json!({})),
            },
            StreamChunk::ContentBlockDelta {
                index: 0,
                delta: Delta::InputJsonDelta {
                    partial_json: "{\"pattern\":".into(),
                },
            },
            StreamChunk::ContentBlockDelta {
                index: 0,
                delta: Delta::InputJsonDelta {
                    partial_json: "\"x\"}".into(),
                },
            },
            StreamChunk::ContentBlockStop { index: 0 },
            StreamChunk::MessageStop,
        ];
        let (output, events) = run(chunks).await;
        assert_eq!(output.tool_calls.len(), 1);
        assert_eq!(output.tool_calls[0].args, json!({"pattern": "x"}));
        assert!(events.iter().any(|e| e.type_name() == "tool:announce"));
    }

    #[tokio::test]
    async fn invalid_args_degrade_to_empty_object() {
        let chunks = StreamChunk::tool_use_sequence("c1", "grep", "{not json");
        let (output, _) = run(chunks).await;
        assert_eq!(output.tool_calls[0].args, json!({}));
    }

    #[tokio::test]
    async fn empty_name_tool_call_is_dropped() {
        let chunks = StreamChunk::tool_use_sequence("c1", "", "{}");
        let (output, _) = run(chunks).await;
        assert!(output.tool_calls.is_empty());
        assert!(output.blocks.is_empty());
    }

    #[tokio::test]
    async fn empty_id_gets_synthetic_id() {
        let chunks = StreamChunk::tool_use_sequence("", "grep", "{}");
        let (output, _) = run(chunks).await;
        assert_eq!(output.tool_calls[0].id, "tc_synthetic_0");
    }

    #[tokio::test]
    async fn thinking_suppressed_when_not_exposed() {
        let chunks = vec![
            StreamChunk::MessageStart { usage: None },
            StreamChunk::ContentBlockStart {
                index: 0,
                content_block: Block::Reasoning {
                    text: String::new(),
                    signature: None,
                },
            },
            StreamChunk::ContentBlockDelta {
                index: 0,
                delta: Delta::ThinkingDelta {
                    text: "mull it over".into(),
                },
            },
            StreamChunk::ContentBlockStop { index: 0 },
            StreamChunk::MessageStop,
        ];
        let events = Mutex::new(Vec::new());
        let output = consume_stream(chunk_stream(chunks), false, &|e| {
            events.lock().unwrap().push(e);
            Ok(0)
        })
        .await
        .unwrap();
        assert!(events.into_inner().unwrap().is_empty());
        // The block is still accumulated; retention is the caller's call.
        assert!(matches!(output.blocks[0], Block::Reasoning { .. }));
    }

    #[tokio::test]
    async fn interleaved_parallel_tool_calls_keep_index_order() {
        let chunks = vec![
            StreamChunk::MessageStart { usage: None },
            StreamChunk::ContentBlockStart {
                index: 0,
                content_block: Block::tool_use("a", "first", json!({})),
            },
            StreamChunk::ContentBlockStart {
                index: 1,
                content_block: Block::tool_use("b", "second", json!({})),
            },
            StreamChunk::ContentBlockDelta {
                index: 1,
                delta: Delta::InputJsonDelta {
                    partial_json: "{\"n\":2}".into(),
                },
            },
            StreamChunk::ContentBlockDelta {
                index: 0,
                delta: Delta::InputJsonDelta {
                    partial_json: "{\"n\":1}".into(),
                },
            },
            StreamChunk::ContentBlockStop { index: 0 },
            StreamChunk::ContentBlockStop { index: 1 },
            StreamChunk::MessageStop,
        ];
        let (output, _) = run(chunks).await;
        let names: Vec<&str> = output.tool_calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["first", "second"]);
        assert_eq!(output.tool_calls[0].args["n"], 1);
    }
}
