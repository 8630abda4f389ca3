//! `runpool`
//!
//! Runs external commands through a concurrency-bounded process pool, one at
//! a time (`run`) or as a JSON batch (`batch`).

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tokio::io::AsyncReadExt as _;
use tracing::{error, info};

use runpool::pool::{
    BatchCommand, ExecuteOptions, PoolError, ProcessPool, ProcessPoolConfig, ProcessResult,
};
use runpool_core::config::{Config, load_config};

/// Exit status when interrupted by Ctrl+C / SIGTERM.
const EXIT_INTERRUPTED: u8 = 130;
/// Exit status for a timed-out command, as coreutils `timeout` uses.
const EXIT_TIMED_OUT: u8 = 124;
/// Exit status when the command could not be started.
const EXIT_SPAWN_FAILED: u8 = 127;

#[derive(Parser, Debug)]
#[command(name = "runpool")]
#[command(version, about = "Run external commands through a bounded process pool")]
struct Args {
    /// Maximum number of commands running at once
    #[arg(long, global = true)]
    max_concurrent: Option<usize>,

    /// Default per-command timeout in milliseconds (0 or negative disables)
    #[arg(long, global = true, allow_negative_numbers = true)]
    default_timeout_ms: Option<i64>,

    /// Signal sent on timeout and at the start of shutdown (e.g. SIGTERM)
    #[arg(long, global = true)]
    kill_signal: Option<String>,

    /// Disable execution metrics
    #[arg(long, global = true)]
    no_metrics: bool,

    /// Milliseconds to wait for graceful shutdown before SIGKILL
    #[arg(long, global = true)]
    shutdown_timeout_ms: Option<u64>,

    /// Log level filter (e.g. "info", "debug", "warn")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Output logs as JSON (for structured log aggregation)
    #[arg(long, global = true, env = "RUNPOOL_LOG_JSON")]
    log_json: bool,

    /// Print the pool metrics as JSON to stderr when done
    #[arg(long, global = true)]
    print_metrics: bool,

    /// Directory whose `.runpool/settings.json` is loaded (default: cwd)
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// OpenTelemetry OTLP endpoint for traces and metrics export
    /// (e.g. `http://localhost:4317`). Requires the `metrics` feature.
    #[cfg(feature = "metrics")]
    #[arg(long, global = true, env = "RUNPOOL_METRICS_ENDPOINT")]
    metrics_endpoint: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a single command and exit with its status
    Run {
        /// Capture stdout/stderr and replay them after exit
        #[arg(long)]
        capture: bool,

        /// Working directory for the command
        #[arg(long)]
        cwd: Option<PathBuf>,

        /// Extra environment variable (KEY=VALUE), repeatable
        #[arg(long = "env", value_parser = parse_env_pair)]
        env: Vec<(String, String)>,

        /// Timeout for this command in milliseconds (0 disables)
        #[arg(long, allow_negative_numbers = true)]
        timeout_ms: Option<i64>,

        /// Program followed by its arguments
        #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
    /// Run a JSON array of commands concurrently and print the results
    Batch {
        /// Path to the batch file, or `-` for stdin
        file: PathBuf,
    },
}

impl Args {
    /// Apply CLI flags, the highest-priority config layer.
    fn apply(&self, config: &mut Config) {
        if let Some(n) = self.max_concurrent {
            config.pool.max_concurrent = n;
        }
        if let Some(ms) = self.default_timeout_ms {
            config.pool.default_timeout_ms = ms;
        }
        if let Some(signal) = &self.kill_signal {
            config.pool.kill_signal.clone_from(signal);
        }
        if self.no_metrics {
            config.pool.enable_metrics = false;
        }
        if let Some(ms) = self.shutdown_timeout_ms {
            config.pool.shutdown_timeout_ms = ms;
        }
        if let Some(level) = &self.log_level {
            config.log.level.clone_from(level);
        }
        if self.log_json {
            config.log.json = true;
        }
    }
}

fn parse_env_pair(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected KEY=VALUE, got `{raw}`")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let project_dir = match &args.project_dir {
        Some(dir) => dir.clone(),
        None => std::env::current_dir().context("Cannot determine current directory")?,
    };
    let mut config = load_config(Some(&project_dir))?;
    args.apply(&mut config);

    let log_filter = runpool_core::tracing_init::default_filter("runpool", &config.log.level);
    #[cfg(feature = "metrics")]
    let metrics_guard = runpool_core::metrics::init_tracing_with_metrics(
        &log_filter,
        config.log.json,
        args.metrics_endpoint.as_deref(),
    );
    #[cfg(not(feature = "metrics"))]
    runpool_core::tracing_init::init_tracing(&log_filter, config.log.json);

    let pool = ProcessPool::new(ProcessPoolConfig::try_from(&config.pool)?);
    let shutdown_timeout = Duration::from_millis(config.pool.shutdown_timeout_ms);

    #[cfg(feature = "metrics")]
    let _gauges = metrics_guard
        .as_ref()
        .map(|guard| runpool::telemetry::register_pool_gauges(&guard.meter(), &pool));

    let work = dispatch(&pool, args.command);
    tokio::pin!(work);
    let code = tokio::select! {
        code = &mut work => code?,
        () = shutdown_requested() => {
            info!("Shutdown requested, draining process pool");
            // In-flight work stays polled while the pool drains it.
            let ((), outcome) = tokio::join!(pool.shutdown(shutdown_timeout).wait(), &mut work);
            if let Err(e) = outcome {
                error!(error = %e, "Interrupted command failed");
            }
            ExitCode::from(EXIT_INTERRUPTED)
        }
    };

    if args.print_metrics {
        let metrics = serde_json::to_string_pretty(&pool.metrics())?;
        writeln!(std::io::stderr(), "{metrics}")?;
    }

    #[cfg(feature = "metrics")]
    if let Some(guard) = metrics_guard
        && let Err(e) = guard.shutdown()
    {
        error!(error = %e, "Failed to flush telemetry");
    }

    Ok(code)
}

async fn dispatch(pool: &ProcessPool, command: Command) -> anyhow::Result<ExitCode> {
    match command {
        Command::Run {
            capture,
            cwd,
            env,
            timeout_ms,
            argv,
        } => {
            let mut options = ExecuteOptions::default();
            if capture {
                options = options.captured();
            }
            if let Some(dir) = cwd {
                options = options.working_directory(dir);
            }
            if let Some(ms) = timeout_ms {
                options = options.timeout(Duration::from_millis(u64::try_from(ms).unwrap_or(0)));
            }
            options.environment.extend(env);

            let mut argv = argv.into_iter();
            let program = argv.next().context("A program to run is required")?;
            run_one(pool, program, argv.collect(), options).await
        }
        Command::Batch { file } => run_batch(pool, &file).await,
    }
}

async fn run_one(
    pool: &ProcessPool,
    program: String,
    args: Vec<String>,
    options: ExecuteOptions,
) -> anyhow::Result<ExitCode> {
    match pool.execute(program, args, options).await {
        Ok(result) => {
            replay_output(&result)?;
            Ok(exit_code_for(&result))
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            writeln!(std::io::stderr(), "runpool: {e}")?;
            Ok(ExitCode::from(match e {
                PoolError::TimedOut { .. } => EXIT_TIMED_OUT,
                PoolError::SpawnFailed { .. } => EXIT_SPAWN_FAILED,
                PoolError::ShuttingDown => EXIT_INTERRUPTED,
                PoolError::Killed { .. } | PoolError::Wait { .. } => 1,
            }))
        }
    }
}

async fn run_batch(pool: &ProcessPool, file: &Path) -> anyhow::Result<ExitCode> {
    let raw = if file.as_os_str() == "-" {
        let mut raw = String::new();
        tokio::io::stdin().read_to_string(&mut raw).await?;
        raw
    } else {
        tokio::fs::read_to_string(file)
            .await
            .with_context(|| format!("Failed to read batch file {}", file.display()))?
    };
    let commands: Vec<BatchCommand> =
        serde_json::from_str(&raw).context("Batch file must be a JSON array of commands")?;
    info!(commands = commands.len(), "Running batch");

    let results = pool.execute_many(commands).await;
    let all_ok = results.iter().all(ProcessResult::success);

    let mut stdout = std::io::stdout().lock();
    serde_json::to_writer_pretty(&mut stdout, &results)?;
    writeln!(stdout)?;

    Ok(if all_ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn replay_output(result: &ProcessResult) -> std::io::Result<()> {
    if let Some(out) = &result.stdout {
        std::io::stdout().lock().write_all(out.as_bytes())?;
    }
    if let Some(err) = &result.stderr {
        std::io::stderr().lock().write_all(err.as_bytes())?;
    }
    Ok(())
}

/// Mirror the child's status the way a shell would.
fn exit_code_for(result: &ProcessResult) -> ExitCode {
    match (result.exit_code, result.signal) {
        (Some(code), _) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        (None, Some(signal)) => ExitCode::from(u8::try_from(128 + signal).unwrap_or(1)),
        (None, None) => ExitCode::FAILURE,
    }
}

async fn shutdown_requested() {
    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C shutdown signal"),
        () = sigterm => info!("Received SIGTERM shutdown signal"),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn env_pairs_parse() {
        assert_eq!(
            parse_env_pair("A=b=c").unwrap(),
            ("A".to_string(), "b=c".to_string())
        );
        assert_eq!(parse_env_pair("EMPTY=").unwrap().1, "");
        assert!(parse_env_pair("=x").is_err());
        assert!(parse_env_pair("novalue").is_err());
    }

    #[test]
    fn cli_flags_override_config() {
        let args = Args::parse_from([
            "runpool",
            "--max-concurrent",
            "2",
            "--default-timeout-ms",
            "-1",
            "--no-metrics",
            "run",
            "--",
            "echo",
            "hi",
        ]);
        let mut config = Config::default();
        args.apply(&mut config);
        assert_eq!(config.pool.max_concurrent, 2);
        assert_eq!(config.pool.default_timeout_ms, -1);
        assert!(!config.pool.enable_metrics);
        match args.command {
            Command::Run { argv, .. } => assert_eq!(argv, vec!["echo", "hi"]),
            Command::Batch { .. } => unreachable!("parsed as run"),
        }
    }

    #[test]
    fn signal_exit_maps_to_shell_convention() {
        let result = ProcessResult {
            pid: 1,
            command: "x".to_string(),
            args: Vec::new(),
            exit_code: None,
            signal: Some(15),
            stdout: None,
            stderr: None,
            error: None,
            duration_ms: 0,
        };
        assert_eq!(exit_code_for(&result), ExitCode::from(143));
    }
}
