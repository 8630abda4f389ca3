//! Pool configuration, fixed at construction time.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use nix::sys::signal::Signal;
use runpool_core::config::{DEFAULT_MAX_CONCURRENT, DEFAULT_TIMEOUT_MS, PoolSettings};

/// A named termination signal.
///
/// Accepts `"SIGTERM"`, `"TERM"` and `"sigterm"` alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillSignal(Signal);

impl KillSignal {
    pub const TERM: Self = Self(Signal::SIGTERM);
    pub const KILL: Self = Self(Signal::SIGKILL);
    pub const INT: Self = Self(Signal::SIGINT);

    pub const fn signal(self) -> Signal {
        self.0
    }

    pub fn name(self) -> &'static str {
        self.0.as_str()
    }
}

impl Default for KillSignal {
    fn default() -> Self {
        Self::TERM
    }
}

impl From<Signal> for KillSignal {
    fn from(signal: Signal) -> Self {
        Self(signal)
    }
}

impl FromStr for KillSignal {
    type Err = runpool_core::Error;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        let upper = name.trim().to_ascii_uppercase();
        let full = if upper.starts_with("SIG") {
            upper
        } else {
            format!("SIG{upper}")
        };
        Signal::from_str(&full)
            .map(Self)
            .map_err(|_| runpool_core::Error::InvalidSignal(name.to_string()))
    }
}

impl fmt::Display for KillSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Immutable configuration of a [`ProcessPool`](super::ProcessPool).
#[derive(Debug, Clone)]
pub struct ProcessPoolConfig {
    /// Maximum number of registered processes at any instant.
    pub max_concurrent: usize,
    /// Timeout applied when a call does not override it. `None` disables it.
    pub default_timeout: Option<Duration>,
    /// Signal used for timeouts and the graceful phase of shutdown.
    pub kill_signal: KillSignal,
    /// Whether the metrics aggregator records executions.
    pub enable_metrics: bool,
}

impl Default for ProcessPoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_timeout: timeout_from_millis(DEFAULT_TIMEOUT_MS),
            kill_signal: KillSignal::default(),
            enable_metrics: true,
        }
    }
}

impl ProcessPoolConfig {
    /// Set the concurrency bound; zero falls back to the default.
    #[must_use]
    pub const fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = if max_concurrent == 0 {
            DEFAULT_MAX_CONCURRENT
        } else {
            max_concurrent
        };
        self
    }

    /// Set the default timeout in milliseconds; zero or negative disables it.
    #[must_use]
    pub fn with_default_timeout_ms(mut self, timeout_ms: i64) -> Self {
        self.default_timeout = timeout_from_millis(timeout_ms);
        self
    }

    #[must_use]
    pub const fn with_kill_signal(mut self, kill_signal: KillSignal) -> Self {
        self.kill_signal = kill_signal;
        self
    }

    #[must_use]
    pub const fn with_metrics(mut self, enable_metrics: bool) -> Self {
        self.enable_metrics = enable_metrics;
        self
    }
}

impl TryFrom<&PoolSettings> for ProcessPoolConfig {
    type Error = runpool_core::Error;

    fn try_from(settings: &PoolSettings) -> Result<Self, Self::Error> {
        Ok(Self::default()
            .with_max_concurrent(settings.max_concurrent)
            .with_default_timeout_ms(settings.default_timeout_ms)
            .with_kill_signal(settings.kill_signal.parse()?)
            .with_metrics(settings.enable_metrics))
    }
}

/// Convert a millisecond timeout where `<= 0` means "no timeout".
pub fn timeout_from_millis(timeout_ms: i64) -> Option<Duration> {
    u64::try_from(timeout_ms)
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn signal_names_parse_loosely() {
        assert_eq!("SIGTERM".parse::<KillSignal>().unwrap(), KillSignal::TERM);
        assert_eq!("term".parse::<KillSignal>().unwrap(), KillSignal::TERM);
        assert_eq!(" sigkill ".parse::<KillSignal>().unwrap(), KillSignal::KILL);
        assert_eq!("INT".parse::<KillSignal>().unwrap(), KillSignal::INT);
    }

    #[test]
    fn unknown_signal_is_rejected() {
        let err = "SIGBOGUS".parse::<KillSignal>().unwrap_err();
        assert!(matches!(err, runpool_core::Error::InvalidSignal(ref n) if n == "SIGBOGUS"));
    }

    #[test]
    fn non_positive_timeouts_disable() {
        assert_eq!(timeout_from_millis(0), None);
        assert_eq!(timeout_from_millis(-250), None);
        assert_eq!(timeout_from_millis(50), Some(Duration::from_millis(50)));
    }

    #[test]
    fn zero_concurrency_uses_default() {
        let config = ProcessPoolConfig::default().with_max_concurrent(0);
        assert_eq!(config.max_concurrent, DEFAULT_MAX_CONCURRENT);
    }

    #[test]
    fn settings_convert_to_pool_config() {
        let settings = PoolSettings {
            max_concurrent: 3,
            default_timeout_ms: -1,
            kill_signal: "SIGINT".to_string(),
            enable_metrics: false,
            shutdown_timeout_ms: 1_000,
        };
        let config = ProcessPoolConfig::try_from(&settings).unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.default_timeout, None);
        assert_eq!(config.kill_signal, KillSignal::INT);
        assert!(!config.enable_metrics);
    }

    #[test]
    fn display_uses_canonical_name() {
        assert_eq!(KillSignal::TERM.to_string(), "SIGTERM");
    }
}
