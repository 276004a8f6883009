// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, Mutex};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use runa_config::{SandboxKind, SandboxOptions};

use crate::{
    EditPatch, ExecResult, FileChange, FileChangeKind, FileChangeStream, Sandbox, SandboxError,
};

/// Local-filesystem sandbox.
///
/// Paths are resolved against `work_dir`; with `enforce_boundary` any path
/// whose normalized form escapes the root is rejected before touching the
/// filesystem.  File writes are serialized per-path so concurrent tools in
/// one batch cannot interleave partial content.
pub struct LocalSandbox {
    work_dir: PathBuf,
    enforce_boundary: bool,
    watch_files: bool,
    changes: broadcast::Sender<FileChange>,
    write_locks: Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>,
}

impl LocalSandbox {
    pub fn new(opts: &SandboxOptions) -> Result<Self, SandboxError> {
        let work_dir = match &opts.work_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        std::fs::create_dir_all(&work_dir)?;
        let work_dir = work_dir.canonicalize()?;
        let (changes, _) = broadcast::channel(256);
        Ok(Self {
            work_dir,
            enforce_boundary: opts.enforce_boundary,
            watch_files: opts.watch_files,
            changes,
            write_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Resolve a tool-supplied path against the work dir.
    ///
    /// Normalization is purely lexical (no symlink traversal) so it also
    /// covers paths that do not exist yet.  `..` components that would climb
    /// above the root are the violation this guards against.
    fn resolve(&self, path: &Path) -> Result<PathBuf, SandboxError> {
        let joined = if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.work_dir.join(path)
        };
        let mut normalized = PathBuf::new();
        for comp in joined.components() {
            match comp {
                Component::ParentDir => {
                    if !normalized.pop() {
                        return Err(SandboxError::Violation(format!(
                            "path escapes work dir: {}",
                            path.display()
                        )));
                    }
                }
                Component::CurDir => {}
                other => normalized.push(other),
            }
        }
        if self.enforce_boundary && !normalized.starts_with(&self.work_dir) {
            return Err(SandboxError::Violation(format!(
                "path escapes work dir: {}",
                path.display()
            )));
        }
        Ok(normalized)
    }

    async fn path_lock(&self, path: &Path) -> Arc<Mutex<()>> {
        let mut locks = self.write_locks.lock().await;
        locks
            .entry(path.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn notify(&self, path: &Path, kind: FileChangeKind) {
        if !self.watch_files {
            return;
        }
        // Send only fails when nobody is subscribed, which is fine.
        let _ = self.changes.send(FileChange {
            path: path.to_path_buf(),
            kind,
        });
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Local
    }

    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>, SandboxError> {
        let resolved = self.resolve(path)?;
        Ok(tokio::fs::read(&resolved).await?)
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<(), SandboxError> {
        let resolved = self.resolve(path)?;
        let lock = self.path_lock(&resolved).await;
        let _guard = lock.lock().await;
        let existed = resolved.exists();
        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&resolved, bytes).await?;
        debug!(path = %resolved.display(), bytes = bytes.len(), "sandbox write");
        self.notify(
            &resolved,
            if existed {
                FileChangeKind::Modified
            } else {
                FileChangeKind::Created
            },
        );
        Ok(())
    }

    async fn edit(&self, path: &Path, patch: &EditPatch) -> Result<(), SandboxError> {
        let resolved = self.resolve(path)?;
        let lock = self.path_lock(&resolved).await;
        let _guard = lock.lock().await;
        let content = tokio::fs::read_to_string(&resolved).await?;
        let occurrences = content.matches(&patch.find).count();
        if occurrences == 0 {
            return Err(SandboxError::Other(format!(
                "edit target not found in {}",
                resolved.display()
            )));
        }
        if occurrences > 1 {
            return Err(SandboxError::Other(format!(
                "edit target is ambiguous ({occurrences} matches) in {}",
                resolved.display()
            )));
        }
        let updated = content.replacen(&patch.find, &patch.replace, 1);
        tokio::fs::write(&resolved, updated).await?;
        self.notify(&resolved, FileChangeKind::Modified);
        Ok(())
    }

    async fn exec(
        &self,
        command: &str,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> Result<ExecResult, SandboxError> {
        let child = tokio::process::Command::new(command)
            .args(argv)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let wait = async {
            let output = child.wait_with_output().await?;
            Ok::<ExecResult, SandboxError>(ExecResult {
                status: output.status.code().unwrap_or(-1),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        };

        match timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(command, ?limit, "sandbox exec timed out");
                    Err(SandboxError::Timeout(limit))
                }
            },
            None => wait.await,
        }
    }

    fn watch(&self) -> FileChangeStream {
        let rx = self.changes.subscribe();
        Box::pin(BroadcastStream::new(rx).filter_map(|item| item.ok()))
    }

    async fn dispose(&self) {
        // Nothing held beyond the broadcast channel; dropping subscribers
        // ends their streams.
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_stream::StreamExt;

    fn sandbox_in(dir: &Path) -> LocalSandbox {
        LocalSandbox::new(&SandboxOptions {
            work_dir: Some(dir.to_path_buf()),
            ..Default::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let sb = sandbox_in(tmp.path());
        sb.write(Path::new("a/b.txt"), b"hello").await.unwrap();
        let data = sb.read(Path::new("a/b.txt")).await.unwrap();
        assert_eq!(data, b"hello");
    }

    #[tokio::test]
    async fn parent_escape_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let sb = sandbox_in(tmp.path());
        let err = sb.write(Path::new("../evil.txt"), b"x").await.unwrap_err();
        assert!(matches!(err, SandboxError::Violation(_)));
    }

    #[tokio::test]
    async fn absolute_path_outside_root_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let sb = sandbox_in(tmp.path());
        let err = sb.read(Path::new("/etc/hostname")).await.unwrap_err();
        assert!(matches!(err, SandboxError::Violation(_)));
    }

    #[tokio::test]
    async fn boundary_can_be_disabled() {
        let tmp = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let sb = LocalSandbox::new(&SandboxOptions {
            work_dir: Some(tmp.path().to_path_buf()),
            enforce_boundary: false,
            ..Default::default()
        })
        .unwrap();
        let target = outside.path().join("ok.txt");
        sb.write(&target, b"fine").await.unwrap();
        assert!(target.exists());
    }

    #[tokio::test]
    async fn edit_replaces_unique_match() {
        let tmp = tempfile::tempdir().unwrap();
        let sb = sandbox_in(tmp.path());
        sb.write(Path::new("f.txt"), b"alpha beta gamma").await.unwrap();
        sb.edit(
            Path::new("f.txt"),
            &EditPatch {
                find: "beta".into(),
                replace: "BETA".into(),
            },
        )
        .await
        .unwrap();
        let data = sb.read(Path::new("f.txt")).await.unwrap();
        assert_eq!(String::from_utf8(data).unwrap(), "alpha BETA gamma");
    }

    #[tokio::test]
    async fn edit_rejects_ambiguous_match() {
        let tmp = tempfile::tempdir().unwrap();
        let sb = sandbox_in(tmp.path());
        sb.write(Path::new("f.txt"), b"x x").await.unwrap();
        let err = sb
            .edit(
                Path::new("f.txt"),
                &EditPatch {
                    find: "x".into(),
                    replace: "y".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Other(_)));
    }

    #[tokio::test]
    async fn watch_reports_created_then_modified() {
        let tmp = tempfile::tempdir().unwrap();
        let sb = sandbox_in(tmp.path());
        let mut watch = sb.watch();
        sb.write(Path::new("w.txt"), b"1").await.unwrap();
        sb.write(Path::new("w.txt"), b"2").await.unwrap();
        let first = watch.next().await.unwrap();
        assert_eq!(first.kind, FileChangeKind::Created);
        let second = watch.next().await.unwrap();
        assert_eq!(second.kind, FileChangeKind::Modified);
    }

    #[tokio::test]
    async fn exec_captures_output() {
        let tmp = tempfile::tempdir().unwrap();
        let sb = sandbox_in(tmp.path());
        let result = sb
            .exec("echo", &["hello".to_string()], Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(result.status, 0);
        assert!(result.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn exec_times_out() {
        let tmp = tempfile::tempdir().unwrap();
        let sb = sandbox_in(tmp.path());
        let err = sb
            .exec("sleep", &["5".to_string()], Some(Duration::from_millis(50)))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Timeout(_)));
    }
}
