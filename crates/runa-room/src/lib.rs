// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod pool;
mod room;

pub use pool::{AgentPool, PoolError};
pub use room::{Room, RoomError, RoomMessage};
