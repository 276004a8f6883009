// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

/// A structured todo item tracked by the runtime.
///
/// The todo service (not message content) enforces at-most-one item in
/// `in_progress` at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Todo {
    pub id: String,
    pub title: String,
    pub status: TodoStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Todo {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            status: TodoStatus::Pending,
            created_at: now,
            updated_at: now,
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_todo_starts_pending() {
        let t = Todo::new("1", "write tests");
        assert_eq!(t.status, TodoStatus::Pending);
        assert_eq!(t.created_at, t.updated_at);
    }

    #[test]
    fn status_wire_names() {
        let v = serde_json::to_value(TodoStatus::InProgress).unwrap();
        assert_eq!(v, "in_progress");
    }
}
