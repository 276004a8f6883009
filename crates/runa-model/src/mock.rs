// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::stream;

use crate::{
    provider::{ChunkStream, ModelProvider, ProviderError},
    stream::{Completion, ModelRequest, StreamChunk},
    Block,
};

/// A pre-scripted provider.  Each `stream`/`complete` call pops the next
/// chunk script from the front of the queue, so tests can specify exact
/// event sequences — including tool calls — without network access.
pub struct ScriptedProvider {
    scripts: Mutex<Vec<Vec<StreamChunk>>>,
    /// Errors returned before any script is served; used to exercise the
    /// orchestrator's retry path.
    prelude_errors: Mutex<Vec<ProviderError>>,
    /// The last [`ModelRequest`] seen, so tests can inspect what was sent.
    pub last_request: Arc<Mutex<Option<ModelRequest>>>,
}

impl ScriptedProvider {
    /// Build a provider from an ordered list of per-call chunk scripts.
    pub fn new(scripts: Vec<Vec<StreamChunk>>) -> Self {
        Self {
            scripts: Mutex::new(scripts),
            prelude_errors: Mutex::new(Vec::new()),
            last_request: Arc::new(Mutex::new(None)),
        }
    }

    /// Convenience: provider that always answers with a single text reply.
    pub fn always_text(reply: impl Into<String>) -> Self {
        Self::new(vec![StreamChunk::text_sequence(reply)])
    }

    /// Convenience: a tool call on the first request, text on the second.
    pub fn tool_then_text(
        tool_id: impl Into<String>,
        tool_name: impl Into<String>,
        args_json: impl Into<String>,
        final_text: impl Into<String>,
    ) -> Self {
        Self::new(vec![
            StreamChunk::tool_use_sequence(tool_id, tool_name, args_json),
            StreamChunk::text_sequence(final_text),
        ])
    }

    /// Fail the next `n` calls with the given constructor before serving
    /// scripts.  `ProviderError` is not `Clone`, so a constructor is taken.
    pub fn failing_first(mut self, err: ProviderError) -> Self {
        self.prelude_errors.get_mut().unwrap().push(err);
        self
    }

    fn next_script(&self) -> Result<Vec<StreamChunk>, ProviderError> {
        if let Some(err) = self.prelude_errors.lock().unwrap().pop() {
            return Err(err);
        }
        let mut scripts = self.scripts.lock().unwrap();
        if scripts.is_empty() {
            // Fallback when all scripts are consumed, so a test that makes
            // one extra round fails visibly rather than hanging.
            Ok(StreamChunk::text_sequence("[no more scripts]"))
        } else {
            Ok(scripts.remove(0))
        }
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted-mock"
    }

    async fn complete(&self, req: ModelRequest) -> Result<Completion, ProviderError> {
        *self.last_request.lock().unwrap() = Some(req);
        let chunks = self.next_script()?;
        let mut content: Vec<Block> = Vec::new();
        let mut text = String::new();
        for chunk in chunks {
            match chunk {
                StreamChunk::ContentBlockStart { content_block, .. } => {
                    if !matches!(content_block, Block::Text { .. }) {
                        content.push(content_block);
                    }
                }
                StreamChunk::ContentBlockDelta { delta, .. } => {
                    if let crate::stream::Delta::TextDelta { text: t } = delta {
                        text.push_str(&t);
                    }
                }
                _ => {}
            }
        }
        if !text.is_empty() {
            content.insert(0, Block::text(text));
        }
        Ok(Completion {
            content,
            usage: None,
        })
    }

    async fn stream(&self, req: ModelRequest) -> Result<ChunkStream, ProviderError> {
        *self.last_request.lock().unwrap() = Some(req);
        let chunks = self.next_script()?;
        let wrapped: Vec<Result<StreamChunk, ProviderError>> = chunks.into_iter().map(Ok).collect();
        Ok(Box::pin(stream::iter(wrapped)))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use futures::StreamExt;

    use super::*;
    use crate::Message;

    fn req() -> ModelRequest {
        ModelRequest {
            messages: vec![Message::user("hi")],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn scripted_stream_replays_chunks_in_order() {
        let p = ScriptedProvider::always_text("hello");
        let mut s = p.stream(req()).await.unwrap();
        let mut chunks = Vec::new();
        while let Some(c) = s.next().await {
            chunks.push(c.unwrap());
        }
        assert!(matches!(chunks.first(), Some(StreamChunk::MessageStart { .. })));
        assert!(matches!(chunks.last(), Some(StreamChunk::MessageStop)));
    }

    #[tokio::test]
    async fn last_request_is_captured() {
        let p = ScriptedProvider::always_text("x");
        let _ = p.stream(req()).await.unwrap();
        let captured = p.last_request.lock().unwrap();
        assert_eq!(captured.as_ref().unwrap().messages[0].text(), "hi");
    }

    #[tokio::test]
    async fn failing_first_yields_error_then_script() {
        let p = ScriptedProvider::always_text("ok").failing_first(ProviderError::Timeout);
        assert!(p.stream(req()).await.is_err());
        assert!(p.stream(req()).await.is_ok());
    }

    #[tokio::test]
    async fn exhausted_scripts_fall_back_to_sentinel_text() {
        let p = ScriptedProvider::new(vec![]);
        let mut s = p.stream(req()).await.unwrap();
        let mut text = String::new();
        while let Some(Ok(c)) = s.next().await {
            if let StreamChunk::ContentBlockDelta {
                delta: crate::stream::Delta::TextDelta { text: t },
                ..
            } = c
            {
                text.push_str(&t);
            }
        }
        assert!(text.contains("no more scripts"));
    }

    #[tokio::test]
    async fn complete_collapses_script_into_blocks() {
        let p = ScriptedProvider::tool_then_text("c1", "t", "{}", "done");
        let first = p.complete(req()).await.unwrap();
        assert!(first
            .content
            .iter()
            .any(|b| matches!(b, Block::ToolUse { name, .. } if name == "t")));
        let second = p.complete(req()).await.unwrap();
        assert!(second
            .content
            .iter()
            .any(|b| matches!(b, Block::Text { text } if text == "done")));
    }
}
