// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::stream::{Completion, ModelRequest, StreamChunk};

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderError>> + Send>>;

/// Errors surfaced by a model provider.
///
/// Transport-shaped failures are retried once by the orchestrator; anything
/// else propagates as a `provider_error`.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("request timed out")]
    Timeout,
    #[error("rate limited")]
    RateLimited,
    #[error("server error (status {0})")]
    Server(u16),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("{0}")]
    Other(String),
}

impl ProviderError {
    /// Whether the orchestrator should retry this request once.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout | Self::RateLimited | Self::Transport(_) => true,
            Self::Server(status) => *status >= 500,
            Self::Protocol(_) | Self::Other(_) => false,
        }
    }
}

/// The model-provider capability.
///
/// Wire adapters (OpenAI / Anthropic / Gemini-style) implement this trait
/// outside the runtime; the orchestrator only depends on the chunk protocol.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Human-readable provider name for diagnostics.
    fn name(&self) -> &str;

    /// One-shot completion.
    async fn complete(&self, req: ModelRequest) -> Result<Completion, ProviderError>;

    /// Streaming completion: a lazy sequence of [`StreamChunk`]s.
    async fn stream(&self, req: ModelRequest) -> Result<ChunkStream, ProviderError>;
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
