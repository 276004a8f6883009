// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::BTreeMap;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use runa_config::AgentId;
use runa_core::InboxKind;
use runa_events::AgentEvent;

use crate::pool::AgentPool;

#[derive(Debug, thiserror::Error)]
pub enum RoomError {
    #[error("unknown alias: {0}")]
    UnknownAlias(String),
    #[error("alias already joined: {0}")]
    AliasTaken(String),
}

/// One transcript entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessage {
    pub sender: String,
    pub text: String,
    pub at: DateTime<Utc>,
}

/// Named rendezvous where agents exchange mention-routed messages.
///
/// Members are held as alias → [`AgentId`] and resolved through the pool at
/// delivery time, never as owning references.  A say with `@alias` mentions
/// delivers one `mention` inbox item to each mentioned member (sender
/// excluded); a say without mentions broadcasts to every other member.
pub struct Room {
    name: String,
    pool: AgentPool,
    members: Mutex<BTreeMap<String, AgentId>>,
    transcript: Mutex<Vec<RoomMessage>>,
}

impl Room {
    pub fn new(name: impl Into<String>, pool: AgentPool) -> Self {
        Self {
            name: name.into(),
            pool,
            members: Mutex::new(BTreeMap::new()),
            transcript: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn join(&self, alias: impl Into<String>, agent_id: AgentId) -> Result<(), RoomError> {
        let alias = alias.into();
        let mut members = self.members.lock().unwrap();
        if members.contains_key(&alias) {
            return Err(RoomError::AliasTaken(alias));
        }
        debug!(room = %self.name, alias = %alias, agent = %agent_id, "member joined");
        members.insert(alias, agent_id);
        Ok(())
    }

    pub fn leave(&self, alias: &str) {
        self.members.lock().unwrap().remove(alias);
    }

    pub fn members(&self) -> Vec<(String, AgentId)> {
        self.members
            .lock()
            .unwrap()
            .iter()
            .map(|(alias, id)| (alias.clone(), id.clone()))
            .collect()
    }

    pub fn transcript(&self) -> Vec<RoomMessage> {
        self.transcript.lock().unwrap().clone()
    }

    /// Append to the transcript and route to the other members' inboxes.
    ///
    /// Returns the aliases the message was delivered to.
    pub fn say(&self, sender_alias: &str, text: &str) -> Result<Vec<String>, RoomError> {
        let members = self.members.lock().unwrap().clone();
        if !members.contains_key(sender_alias) {
            return Err(RoomError::UnknownAlias(sender_alias.to_string()));
        }

        self.transcript.lock().unwrap().push(RoomMessage {
            sender: sender_alias.to_string(),
            text: text.to_string(),
            at: Utc::now(),
        });

        let mentioned = parse_mentions(text);
        let targets: Vec<&String> = if mentioned.is_empty() {
            members.keys().filter(|alias| *alias != sender_alias).collect()
        } else {
            members
                .keys()
                .filter(|alias| *alias != sender_alias && mentioned.iter().any(|m| m == *alias))
                .collect()
        };

        let mut delivered = Vec::new();
        for alias in targets {
            let Some(agent_id) = members.get(alias) else {
                continue;
            };
            let Some(agent) = self.pool.get(agent_id) else {
                debug!(room = %self.name, alias = %alias, "member not live; skipping delivery");
                continue;
            };
            agent.send_kind(
                text,
                InboxKind::Mention {
                    room: self.name.clone(),
                    from: sender_alias.to_string(),
                },
            );
            let _ = agent.emit_signal(AgentEvent::MentionRouted {
                room: self.name.clone(),
                from: sender_alias.to_string(),
            });
            delivered.push(alias.clone());
        }
        Ok(delivered)
    }
}

/// Extract `@alias` tokens.
fn parse_mentions(text: &str) -> Vec<String> {
    // Alias charset mirrors what join() accepts in practice; compiled per
    // call because say() is nowhere near hot.
    let re = Regex::new(r"@([A-Za-z0-9_-]+)").expect("static mention pattern");
    re.captures_iter(text)
        .map(|caps| caps[1].to_string())
        .collect()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use runa_core::{AgentConfig, AgentDeps, InboxKind, Template};
    use runa_model::ScriptedProvider;
    use runa_store::Store;
    use runa_tools::ToolRegistry;

    use super::*;

    #[test]
    fn mention_parsing() {
        assert_eq!(parse_mentions("hello @dev and @ops-1"), vec!["dev", "ops-1"]);
        assert!(parse_mentions("no mentions here").is_empty());
    }

    fn pool_with(tmp: &tempfile::TempDir, ids: &[&str]) -> AgentPool {
        let pool = AgentPool::new(8);
        for id in ids {
            let deps = AgentDeps::new(
                Arc::new(ScriptedProvider::always_text("ok")),
                Arc::new(ToolRegistry::new()),
                Arc::new(Store::open(tmp.path()).unwrap()),
            );
            pool.create(AgentConfig::new(*id, Template::builder("t").build()), deps)
                .unwrap();
        }
        pool
    }

    #[tokio::test]
    async fn mention_reaches_only_the_target() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool_with(&tmp, &["p1", "d1"]);
        let room = Room::new("standup", pool.clone());
        room.join("planner", AgentId::new("p1")).unwrap();
        room.join("dev", AgentId::new("d1")).unwrap();

        let delivered = room.say("planner", "hello @dev").unwrap();
        assert_eq!(delivered, vec!["dev".to_string()]);

        let dev = pool.get(&AgentId::new("d1")).unwrap();
        let inbox = dev.peek_inbox();
        assert_eq!(inbox.len(), 1);
        assert_eq!(inbox[0].text, "hello @dev");
        assert!(matches!(
            &inbox[0].kind,
            InboxKind::Mention { from, .. } if from == "planner"
        ));

        // No self-delivery.
        let planner = pool.get(&AgentId::new("p1")).unwrap();
        assert!(planner.peek_inbox().is_empty());

        assert_eq!(room.transcript().len(), 1);
        assert_eq!(room.transcript()[0].sender, "planner");
    }

    #[tokio::test]
    async fn say_without_mentions_broadcasts() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool_with(&tmp, &["p1", "d1", "o1"]);
        let room = Room::new("all-hands", pool.clone());
        room.join("planner", AgentId::new("p1")).unwrap();
        room.join("dev", AgentId::new("d1")).unwrap();
        room.join("ops", AgentId::new("o1")).unwrap();

        let mut delivered = room.say("planner", "standup time").unwrap();
        delivered.sort();
        assert_eq!(delivered, vec!["dev".to_string(), "ops".to_string()]);
    }

    #[tokio::test]
    async fn unknown_sender_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool_with(&tmp, &[]);
        let room = Room::new("empty", pool);
        assert!(matches!(
            room.say("ghost", "boo"),
            Err(RoomError::UnknownAlias(_))
        ));
    }

    #[tokio::test]
    async fn duplicate_alias_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let pool = pool_with(&tmp, &["p1"]);
        let room = Room::new("r", pool);
        room.join("planner", AgentId::new("p1")).unwrap();
        assert!(matches!(
            room.join("planner", AgentId::new("p1")),
            Err(RoomError::AliasTaken(_))
        ));
    }
}
