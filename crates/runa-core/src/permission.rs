// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::debug;

use runa_config::{PermissionConfig, PermissionMode, TimeoutPolicy};
use runa_tools::ToolDescriptor;

/// A decision taken for one tool call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Deny => "deny",
        }
    }
}

/// First-pass gate for a tool call, before any waiting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Gate {
    Permitted,
    Denied { reason: String },
    /// Emit a permission prompt and suspend until `decide()`.
    NeedsApproval,
    /// Plan mode: queue without executing; no prompt is emitted.
    Queued,
}

/// Outcome of waiting for a decision.
pub enum WaitOutcome {
    Decided(Decision, Option<String>),
    TimedOut(TimeoutPolicy),
}

/// Mode selection plus the decision queue for suspended tool calls.
///
/// Shared between the orchestrator (which evaluates and waits) and the
/// public handle (whose `decide()` resolves waiters from any task).
pub struct PermissionEngine {
    config: PermissionConfig,
    waiters: Mutex<HashMap<String, oneshot::Sender<(Decision, Option<String>)>>>,
    decisions: Mutex<HashMap<String, (Decision, Option<String>)>>,
}

impl PermissionEngine {
    pub fn new(config: PermissionConfig) -> Self {
        Self {
            config,
            waiters: Mutex::new(HashMap::new()),
            decisions: Mutex::new(HashMap::new()),
        }
    }

    pub fn mode(&self) -> PermissionMode {
        self.config.mode
    }

    /// Evaluate a call against the configured mode.
    pub fn evaluate(&self, descriptor: &ToolDescriptor) -> Gate {
        match self.config.mode {
            PermissionMode::Auto => Gate::Permitted,
            PermissionMode::ReadOnly => {
                if descriptor.mutates {
                    Gate::Denied {
                        reason: "read-only mode".to_string(),
                    }
                } else {
                    Gate::Permitted
                }
            }
            PermissionMode::Approval => {
                if self
                    .config
                    .require_approval_tools
                    .iter()
                    .any(|n| n == &descriptor.name)
                {
                    Gate::NeedsApproval
                } else {
                    Gate::Permitted
                }
            }
            PermissionMode::Plan => {
                if descriptor.planning {
                    Gate::Permitted
                } else {
                    Gate::Queued
                }
            }
        }
    }

    /// Record a decision and resolve the waiter, exactly once.
    ///
    /// Returns the decision when newly applied; `None` on a repeat call so
    /// the caller emits no further events (idempotence).
    pub fn decide(
        &self,
        call_id: &str,
        decision: Decision,
        note: Option<String>,
    ) -> Option<(Decision, Option<String>)> {
        {
            let mut decisions = self.decisions.lock().unwrap();
            if decisions.contains_key(call_id) {
                debug!(call_id, "repeated decision ignored");
                return None;
            }
            decisions.insert(call_id.to_string(), (decision, note.clone()));
        }
        if let Some(waiter) = self.waiters.lock().unwrap().remove(call_id) {
            let _ = waiter.send((decision, note.clone()));
        }
        Some((decision, note))
    }

    /// A decision already taken for this call, if any.
    pub fn decision_for(&self, call_id: &str) -> Option<(Decision, Option<String>)> {
        self.decisions.lock().unwrap().get(call_id).cloned()
    }

    /// Suspend until `decide()` resolves this call, honoring the configured
    /// timeout policy.
    pub async fn wait(&self, call_id: &str) -> WaitOutcome {
        // A decision may have landed before the wait was registered.
        if let Some((decision, note)) = self.decision_for(call_id) {
            return WaitOutcome::Decided(decision, note);
        }
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().unwrap().insert(call_id.to_string(), tx);
        // Re-check for a decide() that raced the registration.
        if let Some((decision, note)) = self.decision_for(call_id) {
            self.waiters.lock().unwrap().remove(call_id);
            return WaitOutcome::Decided(decision, note);
        }

        match self.config.decision_timeout_ms {
            None => match rx.await {
                Ok((decision, note)) => WaitOutcome::Decided(decision, note),
                Err(_) => WaitOutcome::TimedOut(self.config.on_timeout),
            },
            Some(ms) => match tokio::time::timeout(Duration::from_millis(ms), rx).await {
                Ok(Ok((decision, note))) => WaitOutcome::Decided(decision, note),
                _ => {
                    self.waiters.lock().unwrap().remove(call_id);
                    WaitOutcome::TimedOut(self.config.on_timeout)
                }
            },
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
