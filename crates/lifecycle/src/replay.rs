//! Contract with the external collaborator that replays a recorded interaction plan.

use crate::error::{LifecycleError, Result};
use async_trait::async_trait;
use reaper_analysis::{samples_from_v8, CoverageSample, ScriptFilter};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::sync::watch;

/// What to replay and against which files
#[derive(Debug, Clone)]
pub struct ReplayRequest {
    pub patch_id: String,

    /// Opaque interaction plan recorded at scan time
    pub plan: String,

    pub root: PathBuf,

    /// Patched files, relative to `root`
    pub files: Vec<String>,
}

impl ReplayRequest {
    /// Session id the replay's coverage is recorded under
    pub fn session_id(&self) -> String {
        format!("replay-{}", self.patch_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ReplayOutcome {
    pub samples: Vec<CoverageSample>,

    /// Failures the replay itself observed (console errors, failed steps), in order
    pub failures: Vec<String>,
}

#[async_trait]
pub trait Replayer: Send + Sync {
    async fn replay(&self, request: &ReplayRequest) -> Result<ReplayOutcome>;
}

/// Runs an external command: `program [args..] <plan> <file>..` in the project root.
///
/// Stdout carries a precise-coverage JSON payload; every non-empty stderr line is a
/// failure, as is a non-zero exit. The child is killed if the replay is abandoned.
#[derive(Debug, Clone)]
pub struct CommandReplayer {
    program: String,
    args: Vec<String>,
    filter: ScriptFilter,
}

impl CommandReplayer {
    pub fn new(program: impl Into<String>, args: Vec<String>, filter: ScriptFilter) -> Self {
        Self {
            program: program.into(),
            args,
            filter,
        }
    }
}

#[async_trait]
impl Replayer for CommandReplayer {
    async fn replay(&self, request: &ReplayRequest) -> Result<ReplayOutcome> {
        log::debug!(
            "replaying plan for patch {} via {}",
            request.patch_id,
            self.program
        );
        let output = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .arg(&request.plan)
            .args(&request.files)
            .current_dir(&request.root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|err| LifecycleError::replay(format!("spawn {}: {err}", self.program)))?;

        let mut failures: Vec<String> = String::from_utf8_lossy(&output.stderr)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        if !output.status.success() {
            failures.push(format!("replay command exited with {}", output.status));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let samples = if stdout.trim().is_empty() {
            failures.push("replay produced no coverage".to_string());
            Vec::new()
        } else {
            samples_from_v8(&stdout, &request.session_id(), &self.filter)
                .map_err(|err| LifecycleError::replay(err.to_string()))?
        };

        Ok(ReplayOutcome { samples, failures })
    }
}

/// Caller side of a verification cancel switch
#[derive(Debug)]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

/// Observed by a running verification; cloning shares the same switch
#[derive(Debug, Clone)]
pub struct CancelToken {
    rx: watch::Receiver<bool>,
}

impl CancelHandle {
    pub fn new() -> (Self, CancelToken) {
        let (tx, rx) = watch::channel(false);
        (Self { tx }, CancelToken { rx })
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }
}

impl CancelToken {
    /// A token nobody can cancel
    pub fn never() -> Self {
        let (_, token) = CancelHandle::new();
        token
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancelled; never resolves if the handle is dropped first
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_cancel_token_fires() {
        let (handle, mut token) = CancelHandle::new();
        assert!(!token.is_cancelled());
        let waiter = tokio::spawn(async move {
            token.cancelled().await;
        });
        handle.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancel observed")
            .expect("join");
    }

    #[tokio::test]
    async fn test_never_token_stays_pending() {
        let mut token = CancelToken::never();
        let waited = tokio::time::timeout(Duration::from_millis(20), token.cancelled()).await;
        assert!(waited.is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_replayer_reads_stdout_and_stderr() {
        let dir = tempfile::tempdir().expect("tempdir");
        let script = r#"echo '[{"url":"app.js","functions":[{"ranges":[{"startOffset":0,"endOffset":5,"count":1}]}]}]'; echo 'console error: boom' >&2"#;
        let replayer = CommandReplayer::new(
            "sh",
            vec!["-c".into(), script.into(), "replay".into()],
            ScriptFilter::default(),
        );
        let request = ReplayRequest {
            patch_id: "patch-1".into(),
            plan: "plan.json".into(),
            root: dir.path().to_path_buf(),
            files: vec!["app.js".into()],
        };

        let outcome = replayer.replay(&request).await.expect("replay");
        assert_eq!(outcome.samples.len(), 1);
        assert_eq!(outcome.samples[0].session_id, "replay-patch-1");
        assert_eq!(outcome.samples[0].file, "app.js");
        assert_eq!(outcome.failures, vec!["console error: boom".to_string()]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_replayer_nonzero_exit_is_failure() {
        let dir = tempfile::tempdir().expect("tempdir");
        let replayer = CommandReplayer::new(
            "sh",
            vec!["-c".into(), "echo '[]'; exit 3".into(), "replay".into()],
            ScriptFilter::default(),
        );
        let request = ReplayRequest {
            patch_id: "p".into(),
            plan: "plan.json".into(),
            root: dir.path().to_path_buf(),
            files: Vec::new(),
        };
        let outcome = replayer.replay(&request).await.expect("replay");
        assert!(outcome.samples.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.failures[0].starts_with("replay command exited with"));
    }
}
