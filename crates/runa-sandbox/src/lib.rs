// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod local;

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use runa_config::SandboxKind;

pub use local::LocalSandbox;

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A path escaped the sandbox working directory.
    #[error("sandbox boundary violation: {0}")]
    Violation(String),
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeKind {
    Created,
    Modified,
    Removed,
}

/// Notification produced when a sandbox mutation touches a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: FileChangeKind,
}

/// A textual find/replace patch applied by [`Sandbox::edit`].
///
/// `find` must occur exactly once in the file; ambiguous or missing matches
/// are errors so an edit never lands somewhere unintended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EditPatch {
    pub find: String,
    pub replace: String,
}

/// Result of [`Sandbox::exec`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecResult {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

pub type FileChangeStream = Pin<Box<dyn Stream<Item = FileChange> + Send>>;

/// The sandbox capability.
///
/// Backends (local filesystem, container) implement this trait; the runtime
/// only relies on the operations below plus the file-change notifications.
/// All write paths are serialized per-path by the implementation.
#[async_trait]
pub trait Sandbox: Send + Sync {
    fn kind(&self) -> SandboxKind;
    fn work_dir(&self) -> &Path;

    async fn read(&self, path: &Path) -> Result<Vec<u8>, SandboxError>;
    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), SandboxError>;
    async fn edit(&self, path: &Path, patch: &EditPatch) -> Result<(), SandboxError>;
    async fn exec(
        &self,
        command: &str,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecResult, SandboxError>;

    /// Subscribe to file-change notifications for this sandbox.
    fn watch(&self) -> FileChangeStream;

    /// Release resources.  Durable agent state is unaffected.
    async fn dispose(&self);
}
