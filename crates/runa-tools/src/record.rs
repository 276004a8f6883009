// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::outcome::ToolOutcome;

/// Lifecycle state of a tool call.
///
/// ```text
/// Pending → Permitted → Running → Completed
///        → Denied → Completed
/// Permitted → Errored → Completed        (argument validation failure)
/// Running → Errored → Completed
/// {Pending, Permitted, Running} → Sealed (crash resume only; terminal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ToolCallState {
    Pending,
    Permitted,
    Running,
    Denied,
    Errored,
    Completed,
    Sealed,
}

impl ToolCallState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Sealed)
    }

    fn can_advance_to(self, next: ToolCallState) -> bool {
        use ToolCallState::*;
        matches!(
            (self, next),
            (Pending, Permitted)
                | (Pending, Denied)
                | (Pending, Sealed)
                | (Permitted, Running)
                | (Permitted, Denied)
                | (Permitted, Errored)
                | (Permitted, Sealed)
                | (Running, Completed)
                | (Running, Errored)
                | (Running, Sealed)
                | (Denied, Completed)
                | (Errored, Completed)
        )
    }
}

#[derive(Debug, thiserror::Error)]
#[error("illegal tool-call state transition {from:?} → {to:?} (call {call_id})")]
pub struct StateTransitionError {
    pub call_id: String,
    pub from: ToolCallState,
    pub to: ToolCallState,
}

/// Durable record of a single tool call.
///
/// Persisted last-writer-wins under `tools/<callId>.json`; once the state is
/// terminal the outcome is immutable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub name: String,
    pub args: Value,
    pub state: ToolCallState,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ToolOutcome>,
}

impl ToolCallRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
            state: ToolCallState::Pending,
            created_at: Utc::now(),
            completed_at: None,
            outcome: None,
        }
    }

    /// Advance along the state machine; back-transitions and transitions out
    /// of a terminal state are rejected.
    pub fn advance(&mut self, next: ToolCallState) -> Result<(), StateTransitionError> {
        if !self.state.can_advance_to(next) {
            return Err(StateTransitionError {
                call_id: self.id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Record the outcome.  Ignored with a warning if the record already
    /// holds a terminal outcome — terminal outcomes are immutable.
    pub fn set_outcome(&mut self, outcome: ToolOutcome) {
        if self.state.is_terminal() && self.outcome.is_some() {
            tracing::warn!(call_id = %self.id, "ignoring outcome write to terminal record");
            return;
        }
        self.outcome = Some(outcome);
    }

    /// Seal an interrupted call: terminal, synthetic error outcome.
    pub fn seal(&mut self) -> Result<(), StateTransitionError> {
        self.advance(ToolCallState::Sealed)?;
        self.outcome = Some(ToolOutcome::sealed());
        Ok(())
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record() -> ToolCallRecord {
        ToolCallRecord::new("c1", "grep", json!({"pattern": "x"}))
    }

    #[test]
    fn happy_path_walks_full_dag() {
        let mut r = record();
        r.advance(ToolCallState::Permitted).unwrap();
        r.advance(ToolCallState::Running).unwrap();
        r.advance(ToolCallState::Completed).unwrap();
        assert!(r.state.is_terminal());
        assert!(r.completed_at.is_some());
    }

    #[test]
    fn deny_path_reaches_completed() {
        let mut r = record();
        r.advance(ToolCallState::Denied).unwrap();
        r.advance(ToolCallState::Completed).unwrap();
        assert!(r.state.is_terminal());
    }

    #[test]
    fn errored_path_from_running() {
        let mut r = record();
        r.advance(ToolCallState::Permitted).unwrap();
        r.advance(ToolCallState::Running).unwrap();
        r.advance(ToolCallState::Errored).unwrap();
        r.advance(ToolCallState::Completed).unwrap();
    }

    #[test]
    fn validation_failure_errors_from_permitted() {
        let mut r = record();
        r.advance(ToolCallState::Permitted).unwrap();
        r.advance(ToolCallState::Errored).unwrap();
        r.advance(ToolCallState::Completed).unwrap();
    }

    #[test]
    fn back_transition_is_rejected() {
        let mut r = record();
        r.advance(ToolCallState::Permitted).unwrap();
        r.advance(ToolCallState::Running).unwrap();
        let err = r.advance(ToolCallState::Pending).unwrap_err();
        assert_eq!(err.from, ToolCallState::Running);
    }

    #[test]
    fn terminal_state_rejects_further_transitions() {
        let mut r = record();
        r.seal().unwrap();
        assert!(r.advance(ToolCallState::Completed).is_err());
        assert!(r.advance(ToolCallState::Running).is_err());
    }

    #[test]
    fn seal_only_from_non_terminal_states() {
        let mut r = record();
        r.advance(ToolCallState::Permitted).unwrap();
        r.advance(ToolCallState::Running).unwrap();
        r.seal().unwrap();
        assert_eq!(r.state, ToolCallState::Sealed);
        assert!(r.outcome.as_ref().unwrap().is_error);

        let mut done = record();
        done.advance(ToolCallState::Permitted).unwrap();
        done.advance(ToolCallState::Running).unwrap();
        done.advance(ToolCallState::Completed).unwrap();
        assert!(done.seal().is_err());
    }

    #[test]
    fn terminal_outcome_is_immutable() {
        let mut r = record();
        r.advance(ToolCallState::Permitted).unwrap();
        r.advance(ToolCallState::Running).unwrap();
        r.set_outcome(ToolOutcome::ok(json!({"n": 1})));
        r.advance(ToolCallState::Completed).unwrap();
        r.set_outcome(ToolOutcome::err("overwrite attempt"));
        assert!(!r.outcome.as_ref().unwrap().is_error);
    }

    #[test]
    fn record_serde_roundtrip() {
        let mut r = record();
        r.advance(ToolCallState::Permitted).unwrap();
        r.advance(ToolCallState::Running).unwrap();
        r.set_outcome(ToolOutcome::ok(json!({"hit": true})));
        r.advance(ToolCallState::Completed).unwrap();
        let json = serde_json::to_string(&r).unwrap();
        let back: ToolCallRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, r);
    }

    #[test]
    fn state_wire_names_are_screaming_snake() {
        let v = serde_json::to_value(ToolCallState::Sealed).unwrap();
        assert_eq!(v, "SEALED");
    }
}
