// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod message;
mod mock;
mod provider;
mod stream;

pub use message::{Block, MediaSource, Message, Role};
pub use mock::ScriptedProvider;
pub use provider::{ChunkStream, ModelProvider, ProviderError};
pub use stream::{Completion, Delta, ModelRequest, StreamChunk, ToolSchema, Usage};
