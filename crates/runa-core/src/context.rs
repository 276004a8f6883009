// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! History windowing and reminder injection.
//!
//! The durable message log is append-only and never rewritten for context
//! reasons; compaction produces a bounded *view* of history for the next
//! provider request.  Old messages are elided oldest-first, never splitting
//! a tool-use/tool-result pair, and the elision is marked with a single
//! `system_reminder` block so the model knows earlier turns exist.

use runa_model::{Block, Message, Role};

/// Marker kind for the elision reminder.
const ELIDED_KIND: &str = "context";

/// Produce the request view of `messages` under `budget_chars`.
///
/// Returns a borrowed-from-nothing owned list: either the full history
/// (within budget) or `[elision marker, recent tail...]` with at least
/// `keep_recent` messages preserved verbatim.
pub fn windowed(messages: &[Message], budget_chars: usize, keep_recent: usize) -> Vec<Message> {
    let total: usize = messages.iter().map(|m| m.char_len()).sum();
    if total <= budget_chars {
        return messages.to_vec();
    }

    let keep_recent = keep_recent.max(1).min(messages.len());
    let mut start = messages.len() - keep_recent;

    // Shrink the elided range until the first kept message does not carry
    // tool results whose tool_use lives in an elided message.
    while start > 0 && !messages[start].tool_result_ids().is_empty() {
        start -= 1;
    }

    if start == 0 {
        return messages.to_vec();
    }

    let elided = start;
    let mut view = Vec::with_capacity(messages.len() - start + 1);
    view.push(Message::new(
        Role::User,
        vec![Block::reminder(
            ELIDED_KIND,
            format!("{elided} earlier messages elided to fit the context window"),
        )],
    ));
    view.extend_from_slice(&messages[start..]);
    view
}

/// The reminder message injected by the todo runtime.
pub fn todo_reminder(summary: impl Into<String>) -> Message {
    Message::reminder("todo", summary)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn long_text(n: usize) -> String {
        "x".repeat(n)
    }

    #[test]
    fn under_budget_returns_full_history() {
        let messages = vec![Message::user("hi"), Message::assistant("hello")];
        let view = windowed(&messages, 10_000, 2);
        assert_eq!(view.len(), 2);
    }

    #[test]
    fn over_budget_keeps_recent_tail_with_marker() {
        let messages: Vec<Message> = (0..10)
            .map(|i| Message::user(format!("{i}: {}", long_text(100))))
            .collect();
        let view = windowed(&messages, 300, 2);
        assert!(matches!(
            &view[0].content[0],
            Block::SystemReminder { kind, .. } if kind == "context"
        ));
        assert_eq!(view.len(), 3); // marker + 2 recent
        assert!(view[2].text().starts_with("9:"));
    }

    #[test]
    fn never_splits_a_tool_pair() {
        let mut messages = vec![Message::user(long_text(500))];
        messages.push(Message::new(
            Role::Assistant,
            vec![Block::tool_use("c1", "grep", json!({}))],
        ));
        messages.push(Message::tool_results(vec![Block::tool_result(
            "c1", "found", false,
        )]));
        messages.push(Message::assistant("done"));
        // keep_recent = 2 would start the window at the tool_results message;
        // the walk must pull the paired tool_use in as well.
        let view = windowed(&messages, 100, 2);
        let first_kept = view
            .iter()
            .find(|m| !matches!(m.content.first(), Some(Block::SystemReminder { .. })))
            .unwrap();
        assert!(
            !first_kept.tool_use_ids().is_empty(),
            "window must begin at the tool_use, not its result"
        );
    }

    #[test]
    fn todo_reminder_is_system_reminder() {
        let message = todo_reminder("2 pending");
        assert!(matches!(
            &message.content[0],
            Block::SystemReminder { kind, text } if kind == "todo" && text == "2 pending"
        ));
    }
}
