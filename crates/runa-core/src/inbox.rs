// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::collections::VecDeque;
use std::sync::Mutex;

use runa_model::Message;
use serde_json::json;

/// Kind of a queued inbox item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxKind {
    /// Ordinary user input.
    User,
    /// Scheduler or runtime reminder; wrapped in a `system_reminder` block
    /// so it is never recorded as user intent.
    Reminder,
    /// Routed from a room member.
    Mention { room: String, from: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboxItem {
    pub kind: InboxKind,
    pub text: String,
}

impl InboxItem {
    /// Render as the user message appended at the next turn boundary.
    pub fn into_message(self) -> Message {
        match self.kind {
            InboxKind::User => Message::user(self.text),
            InboxKind::Reminder => Message::reminder("reminder", self.text),
            InboxKind::Mention { room, from } => {
                let mut message = Message::user(self.text);
                message.metadata = Some(json!({"kind": "mention", "room": room, "from": from}));
                message
            }
        }
    }
}

/// Ordered inbox, independent of the model loop.
///
/// `send()` enqueues without blocking; the orchestrator drains queued items
/// into user messages when the loop is idle at a turn boundary.
#[derive(Default)]
pub struct Inbox {
    queue: Mutex<VecDeque<InboxItem>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: InboxItem) {
        self.queue.lock().unwrap().push_back(item);
    }

    pub fn drain(&self) -> Vec<InboxItem> {
        self.queue.lock().unwrap().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Non-destructive view, for tests and status inspection.
    pub fn peek_all(&self) -> Vec<InboxItem> {
        self.queue.lock().unwrap().iter().cloned().collect()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use runa_model::Block;

    use super::*;

    #[test]
    fn drain_preserves_fifo_order() {
        let inbox = Inbox::new();
        inbox.push(InboxItem {
            kind: InboxKind::User,
            text: "first".into(),
        });
        inbox.push(InboxItem {
            kind: InboxKind::User,
            text: "second".into(),
        });
        let drained = inbox.drain();
        assert_eq!(drained[0].text, "first");
        assert_eq!(drained[1].text, "second");
        assert!(inbox.is_empty());
    }

    #[test]
    fn reminder_renders_as_system_reminder_block() {
        let item = InboxItem {
            kind: InboxKind::Reminder,
            text: "tick".into(),
        };
        let message = item.into_message();
        assert!(matches!(
            &message.content[0],
            Block::SystemReminder { text, .. } if text == "tick"
        ));
    }

    #[test]
    fn mention_carries_room_metadata() {
        let item = InboxItem {
            kind: InboxKind::Mention {
                room: "standup".into(),
                from: "planner".into(),
            },
            text: "hello @dev".into(),
        };
        let message = item.into_message();
        let meta = message.metadata.unwrap();
        assert_eq!(meta["kind"], "mention");
        assert_eq!(meta["from"], "planner");
    }
}
