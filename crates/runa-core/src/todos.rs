// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::sync::Mutex;

use chrono::Utc;
use tracing::warn;

use runa_tools::{Todo, TodoStatus};

/// The agent's todo list.
///
/// Enforces the at-most-one `in_progress` invariant at the service level:
/// starting one item demotes any other running item back to `pending`.
#[derive(Default)]
pub struct TodoService {
    items: Mutex<Vec<Todo>>,
}

impl TodoService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&self, todos: Vec<Todo>) {
        *self.items.lock().unwrap() = normalize(todos);
    }

    pub fn list(&self) -> Vec<Todo> {
        self.items.lock().unwrap().clone()
    }

    /// Replace the whole list.  Returns the normalized result.
    pub fn set(&self, todos: Vec<Todo>) -> Vec<Todo> {
        let normalized = normalize(todos);
        *self.items.lock().unwrap() = normalized.clone();
        normalized
    }

    /// Update one item's status and/or title.  Unknown ids are an error.
    pub fn update(
        &self,
        id: &str,
        status: Option<TodoStatus>,
        title: Option<String>,
    ) -> anyhow::Result<Vec<Todo>> {
        let mut items = self.items.lock().unwrap();
        if !items.iter().any(|t| t.id == id) {
            anyhow::bail!("unknown todo: {id}");
        }
        for todo in items.iter_mut() {
            if todo.id == id {
                if let Some(status) = status {
                    todo.status = status;
                }
                if let Some(ref title) = title {
                    todo.title = title.clone();
                }
                todo.updated_at = Utc::now();
            } else if status == Some(TodoStatus::InProgress)
                && todo.status == TodoStatus::InProgress
            {
                // Single-runner invariant: demote the previously running item.
                todo.status = TodoStatus::Pending;
                todo.updated_at = Utc::now();
            }
        }
        Ok(items.clone())
    }

    pub fn delete(&self, id: &str) -> anyhow::Result<Vec<Todo>> {
        let mut items = self.items.lock().unwrap();
        let before = items.len();
        items.retain(|t| t.id != id);
        if items.len() == before {
            anyhow::bail!("unknown todo: {id}");
        }
        Ok(items.clone())
    }

    /// One-line state summary used for reminder injection.
    pub fn summary(&self) -> String {
        let items = self.items.lock().unwrap();
        if items.is_empty() {
            return "Todo list is empty.".to_string();
        }
        let running = items
            .iter()
            .find(|t| t.status == TodoStatus::InProgress)
            .map(|t| t.title.as_str());
        let pending = items
            .iter()
            .filter(|t| t.status == TodoStatus::Pending)
            .count();
        let done = items
            .iter()
            .filter(|t| t.status == TodoStatus::Completed)
            .count();
        match running {
            Some(title) => format!(
                "Todos: {pending} pending, {done} completed; in progress: {title}"
            ),
            None => format!("Todos: {pending} pending, {done} completed; nothing in progress"),
        }
    }
}

/// Keep the first `in_progress` item, demote the rest.
fn normalize(mut todos: Vec<Todo>) -> Vec<Todo> {
    let mut seen_running = false;
    for todo in todos.iter_mut() {
        if todo.status == TodoStatus::InProgress {
            if seen_running {
                warn!(id = %todo.id, "demoting extra in_progress todo");
                todo.status = TodoStatus::Pending;
                todo.updated_at = Utc::now();
            }
            seen_running = true;
        }
    }
    todos
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn todo(id: &str, status: TodoStatus) -> Todo {
        let mut t = Todo::new(id, format!("task {id}"));
        t.status = status;
        t
    }

    #[test]
    fn set_demotes_extra_in_progress() {
        let service = TodoService::new();
        let result = service.set(vec![
            todo("1", TodoStatus::InProgress),
            todo("2", TodoStatus::InProgress),
        ]);
        let running = result
            .iter()
            .filter(|t| t.status == TodoStatus::InProgress)
            .count();
        assert_eq!(running, 1);
        assert_eq!(result[0].status, TodoStatus::InProgress);
        assert_eq!(result[1].status, TodoStatus::Pending);
    }

    #[test]
    fn starting_an_item_demotes_the_previous_runner() {
        let service = TodoService::new();
        service.set(vec![
            todo("1", TodoStatus::InProgress),
            todo("2", TodoStatus::Pending),
        ]);
        let result = service
            .update("2", Some(TodoStatus::InProgress), None)
            .unwrap();
        assert_eq!(result[0].status, TodoStatus::Pending);
        assert_eq!(result[1].status, TodoStatus::InProgress);
    }

    #[test]
    fn update_unknown_id_errors() {
        let service = TodoService::new();
        assert!(service.update("nope", Some(TodoStatus::Completed), None).is_err());
    }

    #[test]
    fn delete_removes_item() {
        let service = TodoService::new();
        service.set(vec![todo("1", TodoStatus::Pending)]);
        let result = service.delete("1").unwrap();
        assert!(result.is_empty());
        assert!(service.delete("1").is_err());
    }

    #[test]
    fn summary_names_the_running_item() {
        let service = TodoService::new();
        service.set(vec![
            todo("1", TodoStatus::Completed),
            todo("2", TodoStatus::InProgress),
            todo("3", TodoStatus::Pending),
        ]);
        let summary = service.summary();
        assert!(summary.contains("task 2"));
        assert!(summary.contains("1 pending"));
    }
}
