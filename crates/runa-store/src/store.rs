// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::{de::DeserializeOwned, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use runa_config::AgentId;
use runa_events::{Channel, EventEnvelope, EventSink};
use runa_model::Message;
use runa_tools::ToolCallRecord;

use crate::snapshot::{Snapshot, StoreMeta};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    #[error("store corruption: {0}")]
    Corrupt(String),
    #[error("not found: {0}")]
    NotFound(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// On-disk wrapper for `meta.json`: the meta body plus an integrity digest
/// over its serialized form.
#[derive(serde::Serialize, serde::Deserialize)]
struct MetaFile {
    meta: StoreMeta,
    checksum: String,
}

fn meta_checksum(meta: &StoreMeta) -> Result<String, StoreError> {
    let body = serde_json::to_vec(meta)?;
    let mut hasher = Sha256::new();
    hasher.update(&body);
    Ok(hex::encode(hasher.finalize()))
}

/// Durable per-agent store.
///
/// Layout under `<root>/<agentId>/`:
///
/// ```text
/// messages.log            append-only JSONL of full messages
/// events/<channel>.log    JSONL envelopes with monotonic seq
/// tools/<callId>.json     last-writer-wins tool call records
/// snapshots/<id>.json     immutable full-state dumps
/// meta.json               bookmarks, in-flight call ids, todos
/// ```
///
/// All non-append writes use the two-phase `write(tmp) → fsync → rename`
/// discipline; appends are serialized per file and fsynced per line.
/// Thread-safe: every operation takes `&self`.
pub struct Store {
    root: PathBuf,
    locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl Store {
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| StoreError::io(&root, e))?;
        Ok(Self {
            root,
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn agent_dir(&self, agent: &AgentId) -> PathBuf {
        self.root.join(agent.as_str())
    }

    fn messages_path(&self, agent: &AgentId) -> PathBuf {
        self.agent_dir(agent).join("messages.log")
    }

    fn events_path(&self, agent: &AgentId, channel: Channel) -> PathBuf {
        self.agent_dir(agent)
            .join("events")
            .join(format!("{channel}.log"))
    }

    fn tool_path(&self, agent: &AgentId, call_id: &str) -> PathBuf {
        self.agent_dir(agent).join("tools").join(format!("{call_id}.json"))
    }

    fn snapshot_path(&self, agent: &AgentId, snapshot_id: &str) -> PathBuf {
        self.agent_dir(agent)
            .join("snapshots")
            .join(format!("{snapshot_id}.json"))
    }

    fn meta_path(&self, agent: &AgentId) -> PathBuf {
        self.agent_dir(agent).join("meta.json")
    }

    fn file_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap();
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Two-phase write: tmp file, fsync, atomic rename.
    fn write_atomic(&self, path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp).map_err(|e| StoreError::io(&tmp, e))?;
            file.write_all(bytes).map_err(|e| StoreError::io(&tmp, e))?;
            file.sync_all().map_err(|e| StoreError::io(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
        Ok(())
    }

    /// Append one JSON line, serialized per file, synced before returning.
    fn append_line<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), StoreError> {
        let lock = self.file_lock(path);
        let _guard = lock.lock().unwrap();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }
        let mut line = serde_json::to_string(value)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| StoreError::io(path, e))?;
        file.write_all(line.as_bytes())
            .map_err(|e| StoreError::io(path, e))?;
        file.sync_data().map_err(|e| StoreError::io(path, e))?;
        Ok(())
    }

    /// Read a JSONL file.  A torn trailing line (interrupted append) is
    /// skipped with a warning; torn lines elsewhere are corruption.
    fn read_lines<T: DeserializeOwned>(&self, path: &Path) -> Result<Vec<T>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = File::open(path).map_err(|e| StoreError::io(path, e))?;
        let reader = BufReader::new(file);
        let raw: Vec<String> = reader
            .lines()
            .collect::<Result<_, _>>()
            .map_err(|e| StoreError::io(path, e))?;
        let mut out = Vec::with_capacity(raw.len());
        let last = raw.len().saturating_sub(1);
        for (i, line) in raw.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(value) => out.push(value),
                Err(e) if i == last => {
                    warn!(path = %path.display(), error = %e, "skipping torn trailing line");
                }
                Err(e) => {
                    return Err(StoreError::Corrupt(format!(
                        "{}:{}: {e}",
                        path.display(),
                        i + 1
                    )));
                }
            }
        }
        Ok(out)
    }

    // ── Messages ─────────────────────────────────────────────────────────────

    pub fn append_message(&self, agent: &AgentId, message: &Message) -> Result<(), StoreError> {
        self.append_line(&self.messages_path(agent), message)
    }

    pub fn load_messages(&self, agent: &AgentId) -> Result<Vec<Message>, StoreError> {
        self.read_lines(&self.messages_path(agent))
    }

    /// Rewrite the whole message log.  Used by truncate-resume.
    pub fn replace_messages(&self, agent: &AgentId, messages: &[Message]) -> Result<(), StoreError> {
        let mut body = String::new();
        for message in messages {
            body.push_str(&serde_json::to_string(message)?);
            body.push('\n');
        }
        let path = self.messages_path(agent);
        let lock = self.file_lock(&path);
        let _guard = lock.lock().unwrap();
        self.write_atomic(&path, body.as_bytes())
    }

    // ── Events ───────────────────────────────────────────────────────────────

    pub fn append_event_envelope(&self, envelope: &EventEnvelope) -> Result<(), StoreError> {
        let agent = AgentId::new(envelope.agent_id.clone());
        self.append_line(&self.events_path(&agent, envelope.channel), envelope)
    }

    /// Read envelopes, optionally restricted by channel set and bookmark.
    /// The merged result is ordered by `seq`.
    pub fn read_events(
        &self,
        agent: &AgentId,
        channels: Option<&[Channel]>,
        since: Option<u64>,
    ) -> Result<Vec<EventEnvelope>, StoreError> {
        let wanted: Vec<Channel> = match channels {
            Some(cs) => cs.to_vec(),
            None => Channel::ALL.to_vec(),
        };
        let mut merged: Vec<EventEnvelope> = Vec::new();
        for channel in wanted {
            let mut envelopes: Vec<EventEnvelope> =
                self.read_lines(&self.events_path(agent, channel))?;
            if let Some(since) = since {
                envelopes.retain(|e| e.seq > since);
            }
            merged.extend(envelopes);
        }
        merged.sort_by_key(|e| e.seq);
        Ok(merged)
    }

    /// The max persisted sequence number across all channels.
    pub fn last_seq(&self, agent: &AgentId) -> Result<u64, StoreError> {
        Ok(self
            .read_events(agent, None, None)?
            .last()
            .map(|e| e.seq)
            .unwrap_or(0))
    }

    /// Drop replayable envelopes at or below `older_than_seq`.
    pub fn compact_events(&self, agent: &AgentId, older_than_seq: u64) -> Result<(), StoreError> {
        for channel in Channel::ALL {
            let path = self.events_path(agent, channel);
            let envelopes: Vec<EventEnvelope> = self.read_lines(&path)?;
            if envelopes.is_empty() {
                continue;
            }
            let kept: Vec<&EventEnvelope> =
                envelopes.iter().filter(|e| e.seq > older_than_seq).collect();
            if kept.len() == envelopes.len() {
                continue;
            }
            let mut body = String::new();
            for envelope in &kept {
                body.push_str(&serde_json::to_string(envelope)?);
                body.push('\n');
            }
            let lock = self.file_lock(&path);
            let _guard = lock.lock().unwrap();
            self.write_atomic(&path, body.as_bytes())?;
            debug!(
                channel = %channel,
                dropped = envelopes.len() - kept.len(),
                "compacted event log"
            );
        }
        Ok(())
    }

    // ── Tool call records ────────────────────────────────────────────────────

    pub fn save_tool_record(
        &self,
        agent: &AgentId,
        record: &ToolCallRecord,
    ) -> Result<(), StoreError> {
        let body = serde_json::to_vec(record)?;
        self.write_atomic(&self.tool_path(agent, &record.id), &body)
    }

    pub fn load_tool_call_records(&self, agent: &AgentId) -> Result<Vec<ToolCallRecord>, StoreError> {
        let dir = self.agent_dir(agent).join("tools");
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut records = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
            match serde_json::from_slice::<ToolCallRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => {
                    return Err(StoreError::Corrupt(format!("{}: {e}", path.display())));
                }
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(records)
    }

    pub fn remove_tool_record(&self, agent: &AgentId, call_id: &str) -> Result<(), StoreError> {
        let path = self.tool_path(agent, call_id);
        if path.exists() {
            fs::remove_file(&path).map_err(|e| StoreError::io(&path, e))?;
        }
        Ok(())
    }

    // ── Snapshots ────────────────────────────────────────────────────────────

    /// Write an immutable snapshot.  Refuses to overwrite an existing id.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
        let agent = AgentId::new(snapshot.agent_id.clone());
        let path = self.snapshot_path(&agent, &snapshot.snapshot_id);
        if path.exists() {
            return Err(StoreError::Corrupt(format!(
                "snapshot {} already exists",
                snapshot.snapshot_id
            )));
        }
        let body = serde_json::to_vec_pretty(snapshot)?;
        self.write_atomic(&path, &body)
    }

    pub fn load_snapshot(&self, agent: &AgentId, snapshot_id: &str) -> Result<Snapshot, StoreError> {
        let path = self.snapshot_path(agent, snapshot_id);
        if !path.exists() {
            return Err(StoreError::NotFound(format!("snapshot {snapshot_id}")));
        }
        let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// The newest readable snapshot, by creation time.  Unreadable snapshot
    /// files are skipped with a warning.
    pub fn latest_snapshot(&self, agent: &AgentId) -> Result<Option<Snapshot>, StoreError> {
        let dir = self.agent_dir(agent).join("snapshots");
        if !dir.exists() {
            return Ok(None);
        }
        let mut newest: Option<Snapshot> = None;
        let entries = fs::read_dir(&dir).map_err(|e| StoreError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| StoreError::io(&dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
            match serde_json::from_slice::<Snapshot>(&bytes) {
                Ok(snapshot) => {
                    if newest
                        .as_ref()
                        .map(|n| snapshot.created_at > n.created_at)
                        .unwrap_or(true)
                    {
                        newest = Some(snapshot);
                    }
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "skipping unreadable snapshot");
                }
            }
        }
        Ok(newest)
    }

    // ── Meta ─────────────────────────────────────────────────────────────────

    pub fn save_meta(&self, agent: &AgentId, meta: &StoreMeta) -> Result<(), StoreError> {
        let file = MetaFile {
            checksum: meta_checksum(meta)?,
            meta: meta.clone(),
        };
        let body = serde_json::to_vec_pretty(&file)?;
        self.write_atomic(&self.meta_path(agent), &body)
    }

    /// Load and verify `meta.json`.  `Ok(None)` when the file is missing,
    /// unparseable, or fails its checksum — callers then fall back to the
    /// newest snapshot plus event replay.
    pub fn load_meta(&self, agent: &AgentId) -> Result<Option<StoreMeta>, StoreError> {
        let path = self.meta_path(agent);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| StoreError::io(&path, e))?;
        let file: MetaFile = match serde_json::from_slice(&bytes) {
            Ok(f) => f,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "meta.json unreadable");
                return Ok(None);
            }
        };
        let expected = meta_checksum(&file.meta)?;
        if expected != file.checksum {
            warn!(path = %path.display(), "meta.json checksum mismatch");
            return Ok(None);
        }
        Ok(Some(file.meta))
    }
}

impl EventSink for Store {
    fn append_event(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        Ok(self.append_event_envelope(envelope)?)
    }

    fn read_back(
        &self,
        agent_id: &str,
        channels: Option<&[Channel]>,
        since: Option<u64>,
    ) -> anyhow::Result<Vec<EventEnvelope>> {
        Ok(self.read_events(&AgentId::new(agent_id), channels, since)?)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
