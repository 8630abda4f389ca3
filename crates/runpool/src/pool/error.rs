//! Errors surfaced by [`ProcessPool`](super::ProcessPool) executions.

/// Errors from process pool operations.
///
/// A non-zero exit code is not an error: it is reported through
/// [`ProcessResult::exit_code`](super::ProcessResult::exit_code).
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Shutdown has begun; nothing was spawned.
    #[error("Process pool is shutting down")]
    ShuttingDown,

    #[error("Failed to spawn `{command}`: {reason}")]
    SpawnFailed { command: String, reason: String },

    #[error("`{command}` (pid {pid}) timed out after {timeout_ms} ms")]
    TimedOut {
        command: String,
        pid: u32,
        timeout_ms: u64,
    },

    /// The process was force-killed while running (e.g. `force_kill_all`).
    #[error("`{command}` (pid {pid}) was force-killed")]
    Killed { command: String, pid: u32 },

    #[error("Failed to wait for pid {pid}: {source}")]
    Wait {
        pid: u32,
        #[source]
        source: std::io::Error,
    },
}

impl PoolError {
    /// True for the timeout-kill outcome.
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::TimedOut { .. })
    }
}
