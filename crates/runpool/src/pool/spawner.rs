//! Process spawning collaborator.
//!
//! The pool never builds OS commands itself; it hands a [`SpawnRequest`] to a
//! [`ProcessSpawner`] and tracks the returned [`Child`]. Exit and error events
//! are observed through the child handle (`Child::wait`).

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};

use super::config::KillSignal;
use super::types::IoMode;

/// Everything a spawner needs to start one child process.
#[derive(Debug, Clone, Copy)]
pub struct SpawnRequest<'a> {
    pub command: &'a str,
    pub args: &'a [String],
    /// Timeout the pool will enforce; informational for the spawner.
    pub timeout: Option<Duration>,
    /// Signal the pool will use on timeout; informational for the spawner.
    pub kill_signal: KillSignal,
    pub io_mode: IoMode,
    pub working_directory: Option<&'a Path>,
    pub environment: &'a HashMap<String, String>,
}

/// Creates OS processes on behalf of the pool.
///
/// Implementations must return a child whose `id()` is available and should
/// set `kill_on_drop` so that abandoned executions do not leak processes.
///
/// `spawn` runs while the pool's registry lock is held. It must not call back
/// into the pool (`active_process_count`, `metrics`, `execute`, ...): the lock
/// is not reentrant and such a call deadlocks. It should also return quickly,
/// since every other registry operation waits on it.
pub trait ProcessSpawner: Send + Sync + 'static {
    fn spawn(&self, request: &SpawnRequest<'_>) -> std::io::Result<Child>;
}

/// Default spawner backed by `tokio::process::Command`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandSpawner;

impl ProcessSpawner for CommandSpawner {
    fn spawn(&self, request: &SpawnRequest<'_>) -> std::io::Result<Child> {
        let mut cmd = Command::new(request.command);
        cmd.args(request.args)
            .envs(request.environment)
            .kill_on_drop(true);

        if let Some(dir) = request.working_directory {
            cmd.current_dir(dir);
        }

        match request.io_mode {
            IoMode::Inherit => {
                cmd.stdin(Stdio::inherit())
                    .stdout(Stdio::inherit())
                    .stderr(Stdio::inherit());
            }
            IoMode::Captured => {
                cmd.stdin(Stdio::null())
                    .stdout(Stdio::piped())
                    .stderr(Stdio::piped());
            }
        }

        cmd.spawn()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn request<'a>(
        command: &'a str,
        args: &'a [String],
        env: &'a HashMap<String, String>,
    ) -> SpawnRequest<'a> {
        SpawnRequest {
            command,
            args,
            timeout: None,
            kill_signal: KillSignal::TERM,
            io_mode: IoMode::Captured,
            working_directory: None,
            environment: env,
        }
    }

    #[tokio::test]
    async fn captured_mode_pipes_output_and_env() {
        let args = vec!["-c".to_string(), "printf \"$GREETING\"".to_string()];
        let env = HashMap::from([("GREETING".to_string(), "hello".to_string())]);
        let child = CommandSpawner.spawn(&request("sh", &args, &env)).unwrap();
        assert!(child.id().is_some());
        let output = child.wait_with_output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello");
    }

    #[tokio::test]
    async fn missing_binary_fails_to_spawn() {
        let env = HashMap::new();
        let err = CommandSpawner
            .spawn(&request("/definitely/not/a/binary", &[], &env))
            .unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn working_directory_is_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let args = vec!["-c".to_string(), "pwd".to_string()];
        let env = HashMap::new();
        let mut req = request("sh", &args, &env);
        req.working_directory = Some(dir.path());
        let output = CommandSpawner
            .spawn(&req)
            .unwrap()
            .wait_with_output()
            .await
            .unwrap();
        let reported = std::path::PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());
        assert_eq!(
            reported.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }
}
