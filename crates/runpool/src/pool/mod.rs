//! Concurrency-bounded pool of external processes.
//!
//! [`ProcessPool`] composes four parts:
//!
//! - [`AdmissionGate`]: FIFO semaphore bounding how many executions run.
//! - [`ProcessRegistry`]: live pid table with per-execution timeout timers.
//! - [`MetricsAggregator`]: execution counters and running averages.
//! - [`ShutdownCoordinator`]: `Running -> Draining -> Terminated`.
//!
//! An execution flows: admission -> spawn + register (+ arm timeout) ->
//! first terminal event (exit, timeout, force-kill) -> deregister ->
//! metrics -> result.

pub mod admission;
pub mod config;
pub mod error;
pub mod metrics;
pub mod registry;
pub mod shutdown;
pub mod signal;
pub mod spawner;
pub mod types;

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::future::join_all;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Child;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use admission::AdmissionGate;
pub use config::{KillSignal, ProcessPoolConfig};
pub use error::PoolError;
pub use metrics::{MetricsAggregator, ProcessMetrics};
pub use registry::ProcessRegistry;
pub use shutdown::{DEFAULT_SHUTDOWN_TIMEOUT, PoolState, ShutdownCoordinator, ShutdownSignal};
pub use spawner::{CommandSpawner, ProcessSpawner, SpawnRequest};
pub use types::{ActiveProcessInfo, BatchCommand, ExecuteOptions, IoMode, ProcessResult};

use metrics::Completion;
use registry::{CompletionGate, RegisterError, Registration, Termination};
use types::duration_ms;

/// How long a timed-out or killed child gets to exit before SIGKILL.
const REAP_GRACE_PERIOD: Duration = Duration::from_secs(5);

/// Upper bound on collecting captured output after the process exited.
/// Grandchildren that inherited the pipes can keep them open indefinitely.
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

struct PoolInner {
    config: ProcessPoolConfig,
    spawner: Box<dyn ProcessSpawner>,
    admission: AdmissionGate,
    registry: Arc<ProcessRegistry>,
    metrics: MetricsAggregator,
    shutdown: ShutdownCoordinator,
}

/// Process pool handle. Clones share the same pool.
#[derive(Clone)]
pub struct ProcessPool {
    inner: Arc<PoolInner>,
}

impl std::fmt::Debug for ProcessPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessPool")
            .field("config", &self.inner.config)
            .field("state", &self.inner.shutdown.state())
            .field("active", &self.inner.registry.len())
            .finish_non_exhaustive()
    }
}

impl Default for ProcessPool {
    fn default() -> Self {
        Self::new(ProcessPoolConfig::default())
    }
}

impl ProcessPool {
    /// Create a pool that spawns through [`CommandSpawner`].
    pub fn new(config: ProcessPoolConfig) -> Self {
        Self::with_spawner(config, CommandSpawner)
    }

    /// Create a pool with a custom process spawner.
    pub fn with_spawner(config: ProcessPoolConfig, spawner: impl ProcessSpawner) -> Self {
        let max_concurrent = config.max_concurrent.clamp(1, Semaphore::MAX_PERMITS);
        if max_concurrent != config.max_concurrent {
            warn!(
                requested = config.max_concurrent,
                max_concurrent, "max_concurrent out of range, clamped"
            );
        }
        let config = ProcessPoolConfig {
            max_concurrent,
            ..config
        };
        info!(
            max_concurrent = config.max_concurrent,
            default_timeout_ms = config.default_timeout.map(duration_ms),
            kill_signal = %config.kill_signal,
            enable_metrics = config.enable_metrics,
            "ProcessPool created"
        );
        Self {
            inner: Arc::new(PoolInner {
                admission: AdmissionGate::new(config.max_concurrent),
                registry: Arc::new(ProcessRegistry::new()),
                metrics: MetricsAggregator::new(config.enable_metrics),
                shutdown: ShutdownCoordinator::new(),
                spawner: Box::new(spawner),
                config,
            }),
        }
    }

    pub fn config(&self) -> &ProcessPoolConfig {
        &self.inner.config
    }

    /// Run one command to completion.
    ///
    /// Waits for an admission slot if the pool is saturated. Fails fast with
    /// [`PoolError::ShuttingDown`] once shutdown has begun. A non-zero exit
    /// code is a normal result, not an error.
    pub async fn execute<I, S>(
        &self,
        command: impl Into<String>,
        args: I,
        options: ExecuteOptions,
    ) -> Result<ProcessResult, PoolError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let command = command.into();
        let args: Vec<String> = args.into_iter().map(Into::into).collect();
        let inner = &self.inner;

        if !inner.shutdown.is_accepting() {
            return Err(PoolError::ShuttingDown);
        }
        let _permit = inner
            .admission
            .acquire()
            .await
            .map_err(|_| PoolError::ShuttingDown)?;
        if !inner.shutdown.is_accepting() {
            return Err(PoolError::ShuttingDown);
        }
        inner.metrics.record_admission();

        let timeout = options.effective_timeout(inner.config.default_timeout);
        let gate = Arc::new(CompletionGate::new());
        let started_at = Instant::now();
        let request = SpawnRequest {
            command: &command,
            args: &args,
            timeout,
            kill_signal: inner.config.kill_signal,
            io_mode: options.io_mode,
            working_directory: options.working_directory.as_deref(),
            environment: &options.environment,
        };

        let spawned = inner.registry.register_spawn(
            || inner.shutdown.is_accepting(),
            || inner.spawner.spawn(&request),
            Registration {
                command: command.clone(),
                args: args.clone(),
                started_at,
                timeout,
                kill_signal: inner.config.kill_signal,
                gate: Arc::clone(&gate),
            },
        );
        let (mut child, active) = match spawned {
            Ok(spawned) => spawned,
            Err(RegisterError::Rejected) => {
                // Admitted but drained before spawning: nothing ran.
                inner
                    .metrics
                    .record_completion(Completion::Failed, started_at.elapsed());
                return Err(PoolError::ShuttingDown);
            }
            Err(RegisterError::Spawn(e)) => {
                warn!(command = %command, error = %e, "Failed to spawn process");
                inner
                    .metrics
                    .record_completion(Completion::Failed, started_at.elapsed());
                return Err(PoolError::SpawnFailed {
                    command,
                    reason: e.to_string(),
                });
            }
        };
        if active >= inner.config.max_concurrent {
            inner.metrics.mark_max_concurrent_reached();
        }

        let pid = child.id().unwrap_or_default();
        debug!(
            pid,
            command = %command,
            args = ?args,
            timeout_ms = timeout.map(duration_ms),
            active,
            "Process spawned"
        );

        let mut guard = ExecutionGuard {
            inner: Arc::clone(inner),
            pid,
            gate: Arc::clone(&gate),
            started_at,
            recorded: false,
        };
        let output = CapturedOutput::start(&mut child);

        let waited = tokio::select! {
            status = child.wait() => Some(status),
            () = gate.preempted() => None,
        };

        if let Some(status) = waited
            && gate.try_settle(Termination::Exited)
        {
            inner.registry.remove(pid, &gate);
            let duration = started_at.elapsed();
            guard.recorded = true;
            return match status {
                Ok(status) => {
                    inner
                        .metrics
                        .record_completion(Completion::Completed, duration);
                    let (stdout, stderr) = output.collect().await;
                    let result = ProcessResult {
                        pid,
                        command,
                        args,
                        exit_code: status.code(),
                        signal: exit_signal(status),
                        stdout,
                        stderr,
                        error: None,
                        duration_ms: duration_ms(duration),
                    };
                    debug!(
                        pid,
                        exit_code = ?result.exit_code,
                        signal = ?result.signal,
                        duration_ms = result.duration_ms,
                        "Process exited"
                    );
                    Ok(result)
                }
                Err(source) => {
                    warn!(pid, error = %source, "Failed waiting for process");
                    inner.metrics.record_completion(Completion::Failed, duration);
                    Err(PoolError::Wait { pid, source })
                }
            };
        }

        // Lost the race: the timer or force-kill settled the gate and already
        // removed the record and signalled the process.
        let duration = started_at.elapsed();
        guard.recorded = true;
        inner.metrics.record_completion(Completion::Failed, duration);
        drop(output);
        reap_in_background(child, pid);

        match gate.outcome() {
            Some(Termination::TimedOut) => Err(PoolError::TimedOut {
                command,
                pid,
                timeout_ms: timeout.map(duration_ms).unwrap_or_default(),
            }),
            _ => Err(PoolError::Killed { command, pid }),
        }
    }

    /// Run every command concurrently, bounded by the same admission gate.
    ///
    /// Never fails as a whole: an entry whose execution errored yields a
    /// synthesized result carrying the error text. Output order matches
    /// input order.
    pub async fn execute_many(&self, commands: Vec<BatchCommand>) -> Vec<ProcessResult> {
        let runs = commands.iter().map(|cmd| async move {
            match self
                .execute(cmd.command.clone(), cmd.args.clone(), cmd.options.clone())
                .await
            {
                Ok(result) => result,
                Err(e) => {
                    debug!(command = %cmd.command, error = %e, "Batch entry failed");
                    ProcessResult::synthesized_failure(cmd, &e.to_string())
                }
            }
        });
        join_all(runs).await
    }

    /// Snapshot of the counters.
    pub fn metrics(&self) -> ProcessMetrics {
        self.inner.metrics.snapshot(self.inner.registry.len())
    }

    pub fn active_process_count(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn is_at_capacity(&self) -> bool {
        self.active_process_count() >= self.inner.config.max_concurrent
    }

    /// Free admission slots right now.
    pub fn available_slots(&self) -> usize {
        self.inner.admission.available()
    }

    /// Registered processes, oldest first.
    pub fn active_processes(&self) -> Vec<ActiveProcessInfo> {
        self.inner.registry.snapshot()
    }

    pub fn state(&self) -> PoolState {
        self.inner.shutdown.state()
    }

    /// Stop admitting, signal active processes, and force-kill whatever is
    /// still running after `timeout`.
    ///
    /// Idempotent: later calls do not start a second drain or re-signal
    /// anything; they return a signal observing the first one.
    ///
    /// Must be called within a Tokio runtime.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownSignal {
        let signal = self.inner.shutdown.signal();
        if self.inner.shutdown.begin_drain() {
            self.inner.admission.close();
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                shutdown::drain(&inner.registry, inner.config.kill_signal, timeout).await;
                inner.shutdown.mark_terminated();
                info!("Process pool terminated");
            });
        } else {
            debug!(state = ?self.state(), "Shutdown already in progress");
        }
        signal
    }

    /// Immediately SIGKILL every registered process, disarm their timeouts
    /// and empty the registry. Does not change the pool state.
    pub fn force_kill_all(&self) {
        let killed = self.inner.registry.force_kill_all();
        if killed > 0 {
            warn!(killed, "Force-killed all active processes");
        }
    }
}

/// Settles and accounts an execution whose future was dropped mid-flight.
struct ExecutionGuard {
    inner: Arc<PoolInner>,
    pid: u32,
    gate: Arc<CompletionGate>,
    started_at: Instant,
    recorded: bool,
}

impl Drop for ExecutionGuard {
    fn drop(&mut self) {
        if self.recorded {
            return;
        }
        if self.gate.try_settle(Termination::Abandoned) {
            self.inner.registry.remove(self.pid, &self.gate);
        }
        self.inner
            .metrics
            .record_completion(Completion::Failed, self.started_at.elapsed());
        // The child handle is dropped alongside and killed (kill_on_drop).
        debug!(pid = self.pid, "Execution abandoned by caller");
    }
}

/// Background readers for captured stdout/stderr.
struct CapturedOutput {
    stdout: Option<JoinHandle<String>>,
    stderr: Option<JoinHandle<String>>,
}

impl CapturedOutput {
    fn start(child: &mut Child) -> Self {
        Self {
            stdout: child.stdout.take().map(spawn_reader),
            stderr: child.stderr.take().map(spawn_reader),
        }
    }

    async fn collect(mut self) -> (Option<String>, Option<String>) {
        let (stdout, stderr) = (self.stdout.take(), self.stderr.take());
        (join_reader(stdout).await, join_reader(stderr).await)
    }
}

impl Drop for CapturedOutput {
    /// Abort readers that were never collected.
    fn drop(&mut self) {
        for reader in [&self.stdout, &self.stderr].into_iter().flatten() {
            reader.abort();
        }
    }
}

fn spawn_reader<R>(mut stream: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = Vec::new();
        if let Err(e) = stream.read_to_end(&mut buf).await {
            debug!(error = %e, "Captured stream read ended with error");
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

async fn join_reader(handle: Option<JoinHandle<String>>) -> Option<String> {
    let mut handle = handle?;
    match tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, &mut handle).await {
        Ok(Ok(text)) => Some(text),
        Ok(Err(e)) => {
            warn!(error = %e, "Captured output reader failed");
            Some(String::new())
        }
        Err(_) => {
            warn!("Captured output still open after process exit, truncating");
            handle.abort();
            Some(String::new())
        }
    }
}

/// Wait for a signalled child in the background; SIGKILL it if it outlives
/// the grace period.
fn reap_in_background(mut child: Child, pid: u32) {
    tokio::spawn(async move {
        match tokio::time::timeout(REAP_GRACE_PERIOD, child.wait()).await {
            Ok(Ok(status)) => debug!(pid, ?status, "Reaped terminated process"),
            Ok(Err(e)) => warn!(pid, error = %e, "Error reaping terminated process"),
            Err(_) => {
                warn!(pid, "Grace period expired, sending SIGKILL");
                if let Err(e) = child.kill().await {
                    warn!(pid, error = %e, "Failed to SIGKILL process");
                }
            }
        }
    });
}

#[cfg(unix)]
fn exit_signal(status: std::process::ExitStatus) -> Option<i32> {
    use std::os::unix::process::ExitStatusExt;
    status.signal()
}

#[cfg(not(unix))]
fn exit_signal(_status: std::process::ExitStatus) -> Option<i32> {
    None
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn captured_execution_returns_output() {
        let pool = ProcessPool::default();
        let result = pool
            .execute(
                "sh",
                sh("echo out; echo err >&2; exit 3"),
                ExecuteOptions::default().captured(),
            )
            .await
            .unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert_eq!(result.stdout.as_deref(), Some("out\n"));
        assert_eq!(result.stderr.as_deref(), Some("err\n"));
        assert!(result.pid > 0);
        assert_eq!(result.command, "sh");

        let metrics = pool.metrics();
        assert_eq!(metrics.completed_processes, 1);
        assert_eq!(metrics.failed_processes, 0);
    }

    #[tokio::test]
    async fn inherited_execution_has_no_captured_output() {
        let pool = ProcessPool::default();
        let result = pool
            .execute("true", Vec::<String>::new(), ExecuteOptions::default())
            .await
            .unwrap();
        assert!(result.success());
        assert!(result.stdout.is_none() && result.stderr.is_none());
    }

    #[tokio::test]
    async fn spawn_failure_is_counted_as_failed() {
        let pool = ProcessPool::default();
        let err = pool
            .execute(
                "/no/such/program",
                Vec::<String>::new(),
                ExecuteOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PoolError::SpawnFailed { .. }));
        let metrics = pool.metrics();
        assert_eq!(metrics.total_executions, 1);
        assert_eq!(metrics.failed_processes, 1);
        assert_eq!(pool.active_process_count(), 0);
        assert_eq!(pool.available_slots(), pool.config().max_concurrent);
    }

    #[tokio::test]
    async fn environment_and_working_directory_apply() {
        let dir = tempfile::TempDir::new().unwrap();
        let pool = ProcessPool::default();
        let result = pool
            .execute(
                "sh",
                sh("printf '%s' \"$RUNPOOL_TEST\"; pwd >&2"),
                ExecuteOptions::default()
                    .captured()
                    .env("RUNPOOL_TEST", "value")
                    .working_directory(dir.path()),
            )
            .await
            .unwrap();
        assert_eq!(result.stdout.as_deref(), Some("value"));
        let cwd = std::path::PathBuf::from(result.stderr.unwrap().trim());
        assert_eq!(
            cwd.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[tokio::test]
    async fn dropped_execution_is_deregistered() {
        let pool = ProcessPool::default();
        let fut = pool.execute("sleep", ["30"], ExecuteOptions::default());
        // Poll long enough to spawn, then drop the future.
        let _ = tokio::time::timeout(Duration::from_millis(100), fut).await;
        assert_eq!(pool.active_process_count(), 0);
        let metrics = pool.metrics();
        assert_eq!(metrics.total_executions, 1);
        assert_eq!(metrics.failed_processes, 1);
    }

    #[tokio::test]
    async fn dropped_output_aborts_readers() {
        // The background sleep inherits the pipes and keeps them open.
        let mut child = tokio::process::Command::new("sh")
            .args(["-c", "sleep 30 & exit 0"])
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .unwrap();
        let output = CapturedOutput::start(&mut child);
        let readers = [
            output.stdout.as_ref().unwrap().abort_handle(),
            output.stderr.as_ref().unwrap().abort_handle(),
        ];
        child.wait().await.unwrap();
        assert!(readers.iter().all(|r| !r.is_finished()));

        drop(output);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(readers.iter().all(tokio::task::AbortHandle::is_finished));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_capture_with_lingering_grandchild_returns_promptly() {
        let pool = ProcessPool::default();
        let started = Instant::now();
        let err = pool
            .execute(
                "sh",
                sh("sleep 30 & wait"),
                ExecuteOptions::default()
                    .captured()
                    .timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn active_processes_lists_running_executions() {
        let pool = ProcessPool::default();
        assert!(pool.active_processes().is_empty());

        let running = {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.execute("sleep", ["30"], ExecuteOptions::default())
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        let active = pool.active_processes();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].command, "sleep");
        assert_eq!(active[0].args, vec!["30".to_string()]);
        assert!(active[0].pid > 0);
        assert!(active[0].timeout_armed);

        pool.force_kill_all();
        assert!(matches!(
            running.await.unwrap(),
            Err(PoolError::Killed { .. })
        ));
        assert!(pool.active_processes().is_empty());
    }

    #[tokio::test]
    async fn zero_capacity_is_clamped_to_one() {
        let pool = ProcessPool::new(ProcessPoolConfig {
            max_concurrent: 0,
            ..ProcessPoolConfig::default()
        });
        assert_eq!(pool.config().max_concurrent, 1);
        assert_eq!(pool.available_slots(), 1);
    }

    #[tokio::test]
    async fn oversized_capacity_is_clamped_to_semaphore_limit() {
        let pool = ProcessPool::new(ProcessPoolConfig::default().with_max_concurrent(usize::MAX));
        assert_eq!(pool.config().max_concurrent, Semaphore::MAX_PERMITS);
        assert_eq!(pool.available_slots(), Semaphore::MAX_PERMITS);
        let result = pool
            .execute("true", Vec::<String>::new(), ExecuteOptions::default())
            .await
            .unwrap();
        assert!(result.success());
    }
}
