// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

use runa_events::AgentEvent;

/// Error taxonomy surfaced as `monitor: error{kind, message, detail}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ProviderError,
    ToolValidation,
    ToolRuntime,
    ToolTimeout,
    PermissionDenied,
    HookError,
    SandboxViolation,
    PersistenceError,
    ResumeCorruption,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ProviderError => "provider_error",
            Self::ToolValidation => "tool_validation",
            Self::ToolRuntime => "tool_runtime",
            Self::ToolTimeout => "tool_timeout",
            Self::PermissionDenied => "permission_denied",
            Self::HookError => "hook_error",
            Self::SandboxViolation => "sandbox_violation",
            Self::PersistenceError => "persistence_error",
            Self::ResumeCorruption => "resume_corruption",
        }
    }

    pub fn event(self, message: impl Into<String>, detail: Option<Value>) -> AgentEvent {
        AgentEvent::Error {
            kind: self.as_str().to_string(),
            message: message.into(),
            detail,
        }
    }
}

/// Errors returned from the agent's public surface.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("agent is gone")]
    Gone,
    #[error("resume corruption: {0}")]
    ResumeCorruption(String),
    #[error("pool at capacity ({0})")]
    PoolAtCapacity(usize),
    #[error(transparent)]
    Store(#[from] runa_store::StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_use_spec_wire_names() {
        assert_eq!(ErrorKind::ProviderError.as_str(), "provider_error");
        assert_eq!(ErrorKind::ToolTimeout.as_str(), "tool_timeout");
        assert_eq!(ErrorKind::ResumeCorruption.as_str(), "resume_corruption");
    }

    #[test]
    fn event_carries_kind_and_message() {
        let ev = ErrorKind::HookError.event("pre_model hook threw", None);
        match ev {
            AgentEvent::Error { kind, message, .. } => {
                assert_eq!(kind, "hook_error");
                assert!(message.contains("pre_model"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
