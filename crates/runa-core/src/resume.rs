// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! State reconstruction after restart, and the sealing of interrupted
//! tool calls.

use std::collections::HashSet;

use tracing::{info, warn};

use runa_config::AgentId;
use runa_model::{Block, Message};
use runa_store::{Snapshot, Store};
use runa_tools::{Todo, ToolCallRecord};

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeStrategy {
    /// Strict: refuses to load a log with non-terminal tool records.
    Manual,
    /// Seal every non-terminal record and append synthetic results so the
    /// model sees a consistent history.
    Crash,
    /// Discard unfinished turns back to the last clean model boundary.
    Truncate,
}

impl ResumeStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Crash => "crash",
            Self::Truncate => "truncate",
        }
    }
}

/// Durable state reconstructed for a resuming agent.
pub(crate) struct LoadedState {
    pub messages: Vec<Message>,
    pub todos: Vec<Todo>,
    pub last_seq: u64,
    /// Call ids sealed by the crash strategy, in record order.
    pub sealed: Vec<String>,
}

/// Load, verify, and repair durable state according to the strategy.
///
/// The message log and tool record files are authoritative; `meta.json`
/// supplies todos and, when absent or checksum-failed, the newest readable
/// snapshot stands in for it.
pub(crate) fn load_for_resume(
    store: &Store,
    agent: &AgentId,
    strategy: ResumeStrategy,
) -> Result<LoadedState, AgentError> {
    let meta = store.load_meta(agent)?;
    let snapshot = match meta {
        Some(_) => None,
        None => store.latest_snapshot(agent)?,
    };
    let todos = match (&meta, &snapshot) {
        (Some(meta), _) => meta.todos.clone(),
        (None, Some(snapshot)) => snapshot.todos.clone(),
        (None, None) => Vec::new(),
    };

    let mut messages = store.load_messages(agent)?;
    let records = store.load_tool_call_records(agent)?;
    let non_terminal: Vec<&ToolCallRecord> =
        records.iter().filter(|r| !r.state.is_terminal()).collect();

    let mut sealed = Vec::new();
    match strategy {
        ResumeStrategy::Manual => {
            if !non_terminal.is_empty() {
                return Err(AgentError::ResumeCorruption(format!(
                    "{} tool record(s) are non-terminal; resume with the crash strategy",
                    non_terminal.len()
                )));
            }
            if !unpaired_tool_uses(&messages).is_empty() {
                return Err(AgentError::ResumeCorruption(
                    "message log has unpaired tool_use blocks".to_string(),
                ));
            }
        }
        ResumeStrategy::Crash => {
            let unpaired = unpaired_tool_uses(&messages);
            let mut seal_blocks = Vec::new();
            for record in non_terminal {
                let mut record = record.clone();
                if let Err(e) = record.seal() {
                    warn!(call_id = %record.id, error = %e, "could not seal record");
                    continue;
                }
                store.save_tool_record(agent, &record)?;
                if unpaired.contains(record.id.as_str()) {
                    seal_blocks.push(Block::tool_result(
                        &record.id,
                        record
                            .outcome
                            .as_ref()
                            .map(|o| o.render())
                            .unwrap_or_default(),
                        true,
                    ));
                }
                sealed.push(record.id.clone());
            }
            // Unpaired tool_use blocks with no record at all (the crash hit
            // between the assistant append and record creation) still need a
            // placeholder so the history is consistent.
            let recorded: HashSet<&str> = sealed.iter().map(|s| s.as_str()).collect();
            for id in &unpaired {
                if !recorded.contains(id.as_str()) {
                    seal_blocks.push(Block::tool_result(id, "sealed on resume", true));
                }
            }
            if !seal_blocks.is_empty() {
                let message = Message::tool_results(seal_blocks);
                store.append_message(agent, &message)?;
                messages.push(message);
            }
            info!(agent = %agent, sealed = sealed.len(), "crash resume sealed in-flight calls");
        }
        ResumeStrategy::Truncate => {
            let clean_len = clean_prefix_len(&messages);
            if clean_len < messages.len() {
                messages.truncate(clean_len);
                store.replace_messages(agent, &messages)?;
                info!(agent = %agent, kept = clean_len, "truncate resume dropped unfinished turns");
            }
            for record in non_terminal {
                store.remove_tool_record(agent, &record.id)?;
            }
        }
    }

    let last_seq = store.last_seq(agent)?;
    Ok(LoadedState {
        messages,
        todos,
        last_seq,
        sealed,
    })
}

/// Seed a fresh agent id from a snapshot (fork).
///
/// Terminal tool records are copied; non-terminal ones are sealed in the
/// child, with synthetic results appended so the child's first model call
/// sees a consistent history.  Events are not copied — the child starts at
/// sequence zero.
pub(crate) fn seed_from_snapshot(
    store: &Store,
    child: &AgentId,
    snapshot: &Snapshot,
) -> Result<Vec<String>, AgentError> {
    for message in &snapshot.messages {
        store.append_message(child, message)?;
    }

    let unpaired = unpaired_tool_uses(&snapshot.messages);
    let mut sealed = Vec::new();
    let mut seal_blocks = Vec::new();
    for record in &snapshot.tool_records {
        let mut record = record.clone();
        if !record.state.is_terminal() {
            if record.seal().is_err() {
                continue;
            }
            if unpaired.contains(record.id.as_str()) {
                seal_blocks.push(Block::tool_result(
                    &record.id,
                    record
                        .outcome
                        .as_ref()
                        .map(|o| o.render())
                        .unwrap_or_default(),
                    true,
                ));
            }
            sealed.push(record.id.clone());
        }
        store.save_tool_record(child, &record)?;
    }
    if !seal_blocks.is_empty() {
        store.append_message(child, &Message::tool_results(seal_blocks))?;
    }

    let meta = runa_store::StoreMeta {
        template: snapshot.template.clone(),
        todos: snapshot.todos.clone(),
        ..Default::default()
    };
    store.save_meta(child, &meta)?;
    Ok(sealed)
}

/// Ids of `tool_use` blocks with no later `tool_result` pairing.
fn unpaired_tool_uses(messages: &[Message]) -> HashSet<String> {
    let mut open: HashSet<String> = HashSet::new();
    for message in messages {
        for id in message.tool_use_ids() {
            open.insert(id.to_string());
        }
        for id in message.tool_result_ids() {
            open.remove(id);
        }
    }
    open
}

/// Length of the longest message prefix in which every `tool_use` is
/// paired — the last clean model boundary.
fn clean_prefix_len(messages: &[Message]) -> usize {
    let mut len = messages.len();
    while len > 0 {
        if unpaired_tool_uses(&messages[..len]).is_empty() {
            return len;
        }
        len -= 1;
    }
    0
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use runa_model::Role;
    use serde_json::json;

    use super::*;

    #[test]
    fn unpaired_detection() {
        let messages = vec![
            Message::new(
                Role::Assistant,
                vec![
                    Block::tool_use("a", "t", json!({})),
                    Block::tool_use("b", "t", json!({})),
                ],
            ),
            Message::tool_results(vec![Block::tool_result("a", "", false)]),
        ];
        let open = unpaired_tool_uses(&messages);
        assert_eq!(open.len(), 1);
        assert!(open.contains("b"));
    }

    #[test]
    fn clean_prefix_stops_before_unpaired_use() {
        let messages = vec![
            Message::user("hi"),
            Message::assistant("hello"),
            Message::new(Role::Assistant, vec![Block::tool_use("a", "t", json!({}))]),
        ];
        assert_eq!(clean_prefix_len(&messages), 2);
    }

    #[test]
    fn fully_clean_log_keeps_everything() {
        let messages = vec![
            Message::new(Role::Assistant, vec![Block::tool_use("a", "t", json!({}))]),
            Message::tool_results(vec![Block::tool_result("a", "ok", false)]),
            Message::assistant("done"),
        ];
        assert_eq!(clean_prefix_len(&messages), 3);
    }
}
