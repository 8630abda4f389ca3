//! Configuration resolution for runpool.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (~/.config/runpool/settings.json)
//! 3. Project config (.runpool/settings.json)
//! 4. Environment variables
//! 5. CLI arguments (highest priority, applied by the binary)

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default number of processes allowed to run at once.
pub const DEFAULT_MAX_CONCURRENT: usize = 5;

/// Default per-execution timeout (5 minutes).
pub const DEFAULT_TIMEOUT_MS: i64 = 300_000;

/// Default bound on the graceful phase of shutdown.
pub const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 10_000;

/// Complete runpool configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub pool: PoolSettings,
    #[serde(default)]
    pub log: LogSettings,
}

/// Process pool settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Maximum number of concurrently running processes (0 = default).
    pub max_concurrent: usize,
    /// Per-execution timeout in milliseconds. Zero or negative disables it.
    pub default_timeout_ms: i64,
    /// Signal sent on timeout and at the start of a graceful shutdown.
    pub kill_signal: String,
    /// Whether execution counters are recorded.
    pub enable_metrics: bool,
    /// How long shutdown waits before force-killing stragglers.
    pub shutdown_timeout_ms: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            max_concurrent: DEFAULT_MAX_CONCURRENT,
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
            kill_signal: "SIGTERM".to_string(),
            enable_metrics: true,
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();

    if let Some(global_path) = global_config_path()
        && global_path.exists()
    {
        layers.push(global_path);
    }

    if let Some(dir) = project_dir {
        let project_path = project_config_path(dir);
        if project_path.exists() {
            layers.push(project_path);
        }
    }

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Merge the given config files, in order, over the built-in defaults.
///
/// Files may be partial: only the keys they contain override earlier layers.
pub fn load_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in paths {
        let overlay = load_config_file(path)?;
        merge_values(&mut merged, overlay);
    }
    serde_json::from_value(merged).map_err(|e| Error::Config(format!("Invalid configuration: {e}")))
}

/// Path of the project-local settings file under `dir`.
pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".runpool").join("settings.json")
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .ok()
            .map(|h| PathBuf::from(h).join(".runpool").join("settings.json"))
    }
    #[cfg(target_os = "macos")]
    {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join("Library/Application Support/runpool/settings.json"))
    }
    #[cfg(target_os = "linux")]
    {
        std::env::var("XDG_CONFIG_HOME")
            .ok()
            .map(PathBuf::from)
            .or_else(|| dirs::home_dir().map(|h| h.join(".config")))
            .map(|p| p.join("runpool").join("settings.json"))
    }
    #[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
    {
        None
    }
}

fn load_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    let value: Value = serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })?;
    if !value.is_object() {
        return Err(Error::Config(format!(
            "Config file {} must contain a JSON object",
            path.display()
        )));
    }
    Ok(value)
}

/// Recursively merge `overlay` into `base`; objects merge key by key,
/// everything else is replaced.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(slot) => merge_values(slot, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (slot, value) => *slot = value,
    }
}

/// Apply `RUNPOOL_*` overrides read through `lookup`.
///
/// Unparseable numeric or boolean values are ignored.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(n) = lookup("RUNPOOL_MAX_CONCURRENT").and_then(|v| v.parse().ok()) {
        config.pool.max_concurrent = n;
    }
    if let Some(n) = lookup("RUNPOOL_DEFAULT_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.pool.default_timeout_ms = n;
    }
    if let Some(val) = lookup("RUNPOOL_KILL_SIGNAL") {
        config.pool.kill_signal = val;
    }
    if let Some(b) = lookup("RUNPOOL_ENABLE_METRICS").and_then(|v| parse_bool(&v)) {
        config.pool.enable_metrics = b;
    }
    if let Some(n) = lookup("RUNPOOL_SHUTDOWN_TIMEOUT_MS").and_then(|v| v.parse().ok()) {
        config.pool.shutdown_timeout_ms = n;
    }
    if let Some(val) = lookup("RUNPOOL_LOG_LEVEL") {
        config.log.level = val;
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_matches_pool_defaults() {
        let config = Config::default();
        assert_eq!(config.pool.max_concurrent, 5);
        assert_eq!(config.pool.default_timeout_ms, 300_000);
        assert_eq!(config.pool.kill_signal, "SIGTERM");
        assert!(config.pool.enable_metrics);
        assert_eq!(config.pool.shutdown_timeout_ms, 10_000);
    }

    #[test]
    fn partial_layers_only_override_present_keys() {
        let dir = tempfile::TempDir::new().unwrap();
        let global = dir.path().join("global.json");
        let project = dir.path().join("project.json");
        std::fs::write(&global, r#"{"pool":{"max_concurrent":8,"kill_signal":"SIGINT"}}"#)
            .unwrap();
        std::fs::write(&project, r#"{"pool":{"default_timeout_ms":0},"log":{"json":true}}"#)
            .unwrap();

        let config = load_layers(&[global, project]).unwrap();
        assert_eq!(config.pool.max_concurrent, 8);
        assert_eq!(config.pool.kill_signal, "SIGINT");
        assert_eq!(config.pool.default_timeout_ms, 0);
        assert!(config.log.json);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn malformed_file_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("bad.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(load_layers(&[path]), Err(Error::Config(_))));
    }

    #[test]
    fn non_object_file_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("array.json");
        std::fs::write(&path, "[1, 2]").unwrap();
        assert!(matches!(load_layers(&[path]), Err(Error::Config(_))));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("RUNPOOL_MAX_CONCURRENT", "2"),
            ("RUNPOOL_DEFAULT_TIMEOUT_MS", "-1"),
            ("RUNPOOL_ENABLE_METRICS", "off"),
            ("RUNPOOL_SHUTDOWN_TIMEOUT_MS", "soon"),
            ("RUNPOOL_LOG_LEVEL", "debug"),
        ]);
        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| (*v).to_string()));

        assert_eq!(config.pool.max_concurrent, 2);
        assert_eq!(config.pool.default_timeout_ms, -1);
        assert!(!config.pool.enable_metrics);
        assert_eq!(config.pool.shutdown_timeout_ms, 10_000);
        assert_eq!(config.log.level, "debug");
    }

    #[test]
    fn project_path_is_under_dot_runpool() {
        let path = project_config_path(Path::new("/work"));
        assert_eq!(path, PathBuf::from("/work/.runpool/settings.json"));
    }
}
