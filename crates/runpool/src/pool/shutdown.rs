//! Shutdown coordinator: `Running -> Draining -> Terminated`.
//!
//! The state lives in a watch channel. The `Running -> Draining` edge is
//! taken at most once; every `shutdown` call returns a [`ShutdownSignal`]
//! observing the same drain.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{info, warn};

use super::config::KillSignal;
use super::registry::ProcessRegistry;

/// Default bound on the graceful phase of shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration =
    Duration::from_millis(runpool_core::config::DEFAULT_SHUTDOWN_TIMEOUT_MS);

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolState {
    /// Accepting new work.
    Running,
    /// No new admissions; waiting for active processes to exit.
    Draining,
    /// Every process has exited or was force-killed.
    Terminated,
}

/// Completion signal of a shutdown, resolved when the pool is terminated.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    rx: watch::Receiver<PoolState>,
}

impl ShutdownSignal {
    /// Wait until the pool reaches [`PoolState::Terminated`].
    pub async fn wait(mut self) {
        // The sender lives as long as the pool; if it is gone, so are we.
        let _ = self.rx.wait_for(|s| *s == PoolState::Terminated).await;
    }

    pub fn is_terminated(&self) -> bool {
        *self.rx.borrow() == PoolState::Terminated
    }
}

/// Owns the pool's lifecycle state.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    state: watch::Sender<PoolState>,
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (state, _) = watch::channel(PoolState::Running);
        Self { state }
    }

    pub fn state(&self) -> PoolState {
        *self.state.borrow()
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == PoolState::Running
    }

    /// Take the `Running -> Draining` edge. Returns `false` if shutdown had
    /// already begun.
    pub fn begin_drain(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == PoolState::Running {
                *state = PoolState::Draining;
                true
            } else {
                false
            }
        })
    }

    pub fn mark_terminated(&self) {
        self.state.send_replace(PoolState::Terminated);
    }

    pub fn signal(&self) -> ShutdownSignal {
        ShutdownSignal {
            rx: self.state.subscribe(),
        }
    }
}

/// Graceful-then-forceful drain of the registry.
///
/// Signals every active process with `kill_signal`, waits up to `timeout`
/// for the registry to empty, then force-kills whatever is left.
pub async fn drain(registry: &ProcessRegistry, kill_signal: KillSignal, timeout: Duration) {
    let active = registry.len();
    let signalled = registry.signal_all(kill_signal);
    info!(
        active,
        signalled,
        signal = %kill_signal,
        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        "Draining process pool"
    );

    if tokio::time::timeout(timeout, registry.wait_empty())
        .await
        .is_err()
    {
        let killed = registry.force_kill_all();
        warn!(killed, "Shutdown timeout elapsed, force-killed remaining processes");
    }
}
