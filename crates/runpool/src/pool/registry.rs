//! Active process registry.
//!
//! The registry is the only mutable state shared between executions. It maps
//! a live pid to its [`ActiveProcessRecord`] and is mutated only by spawn
//! (insert), the winning completion observer (remove) and shutdown/force-kill
//! (bulk remove).
//!
//! Each execution owns a [`CompletionGate`]: natural exit, the timeout timer,
//! force-kill and caller abandonment all race to settle it, and only the
//! winner deregisters the record.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::process::Child;
use tokio::sync::Notify;
use tokio::task::AbortHandle;
use tracing::{debug, warn};

use super::config::KillSignal;
use super::signal;
use super::types::{ActiveProcessInfo, duration_ms};

/// How an execution ended. Exactly one is recorded per execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Termination {
    /// The process exited (or failed to be waited on) on its own.
    Exited = 1,
    /// The armed timeout fired first.
    TimedOut = 2,
    /// `force_kill_all` reached it first.
    ForceKilled = 3,
    /// The caller dropped the in-flight execution.
    Abandoned = 4,
}

impl Termination {
    const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Exited),
            2 => Some(Self::TimedOut),
            3 => Some(Self::ForceKilled),
            4 => Some(Self::Abandoned),
            _ => None,
        }
    }
}

const PENDING: u8 = 0;

/// Single-winner completion gate for one execution.
#[derive(Debug, Default)]
pub struct CompletionGate {
    state: AtomicU8,
    preempted: Notify,
}

impl CompletionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to settle the execution. Returns `true` only for the first caller.
    pub fn try_settle(&self, outcome: Termination) -> bool {
        self.state
            .compare_exchange(PENDING, outcome as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn outcome(&self) -> Option<Termination> {
        Termination::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn is_settled(&self) -> bool {
        self.outcome().is_some()
    }

    /// Wake the execution after settling it from outside (timer, force-kill).
    fn wake(&self) {
        self.preempted.notify_one();
    }

    /// Resolves once another party settled the gate and woke the execution.
    pub async fn preempted(&self) {
        self.preempted.notified().await;
    }
}

/// Bookkeeping for one running, pool-managed process.
#[derive(Debug)]
pub struct ActiveProcessRecord {
    pub pid: u32,
    pub started_at: Instant,
    pub command: String,
    pub args: Vec<String>,
    timeout: Option<AbortHandle>,
    gate: Arc<CompletionGate>,
}

impl ActiveProcessRecord {
    fn disarm(&self) {
        if let Some(timer) = &self.timeout {
            timer.abort();
        }
    }

    fn info(&self, now: Instant) -> ActiveProcessInfo {
        ActiveProcessInfo {
            pid: self.pid,
            command: self.command.clone(),
            args: self.args.clone(),
            elapsed_ms: duration_ms(now.saturating_duration_since(self.started_at)),
            timeout_armed: self.timeout.is_some(),
        }
    }
}

/// What the caller registers alongside a spawn.
#[derive(Debug)]
pub struct Registration {
    pub command: String,
    pub args: Vec<String>,
    pub started_at: Instant,
    pub timeout: Option<Duration>,
    pub kill_signal: KillSignal,
    pub gate: Arc<CompletionGate>,
}

/// Failure of [`ProcessRegistry::register_spawn`].
#[derive(Debug)]
pub enum RegisterError {
    /// The admission check run under the registry lock said no.
    Rejected,
    Spawn(std::io::Error),
}

/// Live table of pool-managed processes, keyed by pid.
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    records: Mutex<HashMap<u32, ActiveProcessRecord>>,
    drained: Notify,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Spawn a process and register it under one lock acquisition, so no
    /// spawned process ever exists outside the registry.
    ///
    /// `admit` is evaluated under the lock first; returning `false` aborts
    /// without spawning. When `registration.timeout` is set, a timer is armed
    /// before the lock is released.
    ///
    /// Returns the child and the registry size right after insertion.
    pub fn register_spawn(
        self: &Arc<Self>,
        admit: impl FnOnce() -> bool,
        spawn: impl FnOnce() -> std::io::Result<Child>,
        registration: Registration,
    ) -> Result<(Child, usize), RegisterError> {
        let mut records = self.records.lock();
        if !admit() {
            return Err(RegisterError::Rejected);
        }
        let child = spawn().map_err(RegisterError::Spawn)?;
        let pid = child.id().ok_or_else(|| {
            RegisterError::Spawn(std::io::Error::other("spawned process has no pid"))
        })?;

        let timeout = registration.timeout.map(|after| {
            self.arm_timeout(
                pid,
                Arc::clone(&registration.gate),
                after,
                registration.kill_signal,
            )
        });
        let record = ActiveProcessRecord {
            pid,
            started_at: registration.started_at,
            command: registration.command,
            args: registration.args,
            timeout,
            gate: registration.gate,
        };

        // A pid can be recycled between a reaped child's exit and its
        // deregistration; the displaced record's process is already gone.
        if let Some(stale) = records.insert(pid, record) {
            debug!(pid, command = %stale.command, "Displacing stale registry entry");
            stale.disarm();
        }
        Ok((child, records.len()))
    }

    /// Deregister `pid` if it still belongs to the execution owning `gate`,
    /// disarming its timer.
    pub fn remove(&self, pid: u32, gate: &Arc<CompletionGate>) -> Option<ActiveProcessRecord> {
        let (removed, now_empty) = {
            let mut records = self.records.lock();
            let owned = records
                .get(&pid)
                .is_some_and(|record| Arc::ptr_eq(&record.gate, gate));
            let removed = if owned { records.remove(&pid) } else { None };
            (removed, records.is_empty())
        };
        if let Some(record) = &removed {
            record.disarm();
        }
        if now_empty {
            self.drained.notify_waiters();
        }
        removed
    }

    fn arm_timeout(
        self: &Arc<Self>,
        pid: u32,
        gate: Arc<CompletionGate>,
        after: Duration,
        kill_signal: KillSignal,
    ) -> AbortHandle {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if !gate.try_settle(Termination::TimedOut) {
                return;
            }
            // Removing the record aborts this task's own handle; that only
            // takes effect at the next await point, and there is none below.
            let command = registry
                .remove(pid, &gate)
                .map(|record| record.command)
                .unwrap_or_default();
            warn!(
                pid,
                command = %command,
                timeout_ms = duration_ms(after),
                signal = %kill_signal,
                "Process timed out, terminating"
            );
            if let Err(e) = signal::deliver(pid, kill_signal) {
                warn!(pid, error = %e, "Failed to signal timed-out process");
            }
            gate.wake();
        })
        .abort_handle()
    }

    /// Send `kill_signal` to every registered process that is still pending.
    ///
    /// Returns how many processes were signalled.
    pub fn signal_all(&self, kill_signal: KillSignal) -> usize {
        let records = self.records.lock();
        let mut signalled = 0;
        for record in records.values().filter(|r| !r.gate.is_settled()) {
            match signal::deliver(record.pid, kill_signal) {
                Ok(()) => signalled += 1,
                Err(e) => {
                    warn!(pid = record.pid, signal = %kill_signal, error = %e, "Failed to signal process");
                }
            }
        }
        signalled
    }

    /// SIGKILL every registered process, disarm every timer and empty the
    /// registry without waiting. Kill failures are logged, never raised.
    ///
    /// Returns how many records were removed.
    pub fn force_kill_all(&self) -> usize {
        let records: Vec<ActiveProcessRecord> = {
            let mut map = self.records.lock();
            map.drain().map(|(_, record)| record).collect()
        };
        self.drained.notify_waiters();

        for record in &records {
            record.disarm();
            if !record.gate.try_settle(Termination::ForceKilled) {
                // Its own completion path already won; the pid may be reaped.
                continue;
            }
            if let Err(e) = signal::deliver(record.pid, KillSignal::KILL) {
                warn!(pid = record.pid, command = %record.command, error = %e, "Failed to force-kill process");
            } else {
                debug!(pid = record.pid, command = %record.command, "Force-killed process");
            }
            record.gate.wake();
        }
        records.len()
    }

    /// Resolves once the registry is empty.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.records.lock().is_empty() {
                return;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.records.lock().contains_key(&pid)
    }

    /// Snapshot of every registered process, oldest first.
    pub fn snapshot(&self) -> Vec<ActiveProcessInfo> {
        let now = Instant::now();
        let mut infos: Vec<ActiveProcessInfo> =
            self.records.lock().values().map(|r| r.info(now)).collect();
        infos.sort_by(|a, b| b.elapsed_ms.cmp(&a.elapsed_ms).then(a.pid.cmp(&b.pid)));
        infos
    }
}
