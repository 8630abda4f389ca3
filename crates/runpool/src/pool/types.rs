//! Request and result types exchanged with pool callers.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the child's standard streams are wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Child shares the caller's stdin/stdout/stderr.
    #[default]
    Inherit,
    /// stdout/stderr are collected into the [`ProcessResult`]; stdin is null.
    Captured,
}

/// Per-call overrides for [`ProcessPool::execute`](super::ProcessPool::execute).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecuteOptions {
    /// Overrides the pool's default timeout. `Some(Duration::ZERO)` disables
    /// the timeout for this call.
    #[serde(rename = "timeout_ms", with = "timeout_ms")]
    pub timeout: Option<Duration>,
    pub io_mode: IoMode,
    pub working_directory: Option<PathBuf>,
    /// Extra variables layered over the inherited environment.
    pub environment: HashMap<String, String>,
}

impl ExecuteOptions {
    #[must_use]
    pub const fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn captured(mut self) -> Self {
        self.io_mode = IoMode::Captured;
        self
    }

    #[must_use]
    pub fn working_directory(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.environment.insert(key.into(), value.into());
        self
    }

    /// Resolve the timeout to arm, given the pool default.
    pub(crate) fn effective_timeout(&self, default: Option<Duration>) -> Option<Duration> {
        self.timeout.or(default).filter(|t| !t.is_zero())
    }
}

/// One entry of an [`execute_many`](super::ProcessPool::execute_many) batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchCommand {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub options: ExecuteOptions,
}

impl BatchCommand {
    pub fn new<I, S>(command: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            command: command.into(),
            args: args.into_iter().map(Into::into).collect(),
            options: ExecuteOptions::default(),
        }
    }

    #[must_use]
    pub fn with_options(mut self, options: ExecuteOptions) -> Self {
        self.options = options;
        self
    }
}

/// Outcome of one execution, handed to exactly one caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessResult {
    /// OS process id; `0` for results synthesized without a process.
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    /// Exit code, absent when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    /// Signal that terminated the process, if any.
    pub signal: Option<i32>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    /// Pool-level failure description for synthesized batch results.
    pub error: Option<String>,
    pub duration_ms: u64,
}

/// Exit code used for batch entries that failed without a process result.
pub const SYNTHETIC_FAILURE_CODE: i32 = -1;

impl ProcessResult {
    /// True when the process exited normally with status 0.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.error.is_none()
    }

    /// Build the placeholder result for a batch entry whose execution failed.
    pub fn synthesized_failure(command: &BatchCommand, error: &str) -> Self {
        Self {
            pid: 0,
            command: command.command.clone(),
            args: command.args.clone(),
            exit_code: Some(SYNTHETIC_FAILURE_CODE),
            signal: None,
            stdout: None,
            stderr: Some(error.to_string()),
            error: Some(error.to_string()),
            duration_ms: 0,
        }
    }
}

/// Registry entry as seen from outside the pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveProcessInfo {
    pub pid: u32,
    pub command: String,
    pub args: Vec<String>,
    pub elapsed_ms: u64,
    pub timeout_armed: bool,
}

/// Saturating conversion used for every duration reported in milliseconds.
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Serde adapter: `timeout_ms` as signed milliseconds, `<= 0` disabling.
mod timeout_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    #[allow(clippy::ref_option)]
    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_u64(super::duration_ms(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw = Option::<i64>::deserialize(d)?;
        Ok(raw.map(|ms| {
            u64::try_from(ms)
                .map(Duration::from_millis)
                .unwrap_or(Duration::ZERO)
        }))
    }
}
