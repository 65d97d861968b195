//! corral batch runner
//!
//! Reads newline-delimited command lines (file or stdin), runs each one
//! through the weighted process pool via `sh -c`, and exits nonzero when
//! any job failed. Ctrl-C / SIGTERM cancel the batch cooperatively.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::Context as _;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};

use corral_core::Settings;
use corral_core::config::PoolSettings;
use corral_core::tracing_init::init_tracing;
use corral_pool::{JobSpec, PoolConfig, ProcessPool, StdioTarget, SubmitError};

#[derive(Parser, Debug)]
#[command(name = "corral")]
#[command(version, about = "corral - run command batches through a weighted process pool")]
struct Args {
    /// File with one command line per job; reads stdin when absent.
    input: Option<PathBuf>,

    /// JSON settings file (CLI flags take precedence).
    #[arg(long, env = "CORRAL_CONFIG")]
    config: Option<PathBuf>,

    /// Total weight budget (0 = half the CPU cores).
    #[arg(long, env = "CORRAL_CAPACITY")]
    capacity: Option<u32>,

    /// CPU cap percent per job (0 disables throttling).
    #[arg(long, env = "CORRAL_CPU_LIMIT")]
    cpu_limit: Option<u32>,

    /// Scheduler poll interval in milliseconds (clamped to 10..=500).
    #[arg(long, env = "CORRAL_POLL_INTERVAL_MS")]
    poll_interval_ms: Option<u64>,

    /// Maximum number of jobs waiting to start.
    #[arg(long, env = "CORRAL_QUEUE_DEPTH")]
    queue_depth: Option<usize>,

    /// Weight reserved by each job.
    #[arg(long, default_value_t = 1, env = "CORRAL_WEIGHT")]
    weight: u32,

    /// Treat jobs as single-threaded for CPU-cap scaling.
    #[arg(long, env = "CORRAL_SINGLE_THREADED")]
    single_threaded: bool,

    /// Pass job stdout/stderr through instead of discarding it.
    #[arg(long, env = "CORRAL_INHERIT_STDIO")]
    inherit_stdio: bool,

    /// Log level filter (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "CORRAL_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "CORRAL_LOG_JSON")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let args = Args::parse();

    let level = &args.log_level;
    let log_filter = format!("corral={level},corral_cli={level},corral_pool={level},corral_core={level}");
    init_tracing(&log_filter, args.log_json);

    let settings = Settings::load_or_default(args.config.as_deref())?;
    let pool_config = build_pool_config(&args, &settings.pool);

    let commands = read_commands(args.input.as_deref())?;
    if commands.is_empty() {
        warn!("no commands to run");
        return Ok(ExitCode::SUCCESS);
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        jobs = commands.len(),
        "Starting corral batch"
    );

    // Shutdown channel: signals flip it, the pool polls it.
    let (cancel_tx, cancel_rx) = watch::channel(false);
    let pool = ProcessPool::new(pool_config, cancel_rx);
    tokio::spawn(watch_signals(cancel_tx));

    let poll = Duration::from_millis(50);
    for command in commands {
        let spec = build_spec(&command, &args);
        submit_with_backpressure(&pool, spec, poll).await?;
    }

    pool.close();
    while !pool.wait_all(Duration::from_secs(60)).await {
        info!(
            reserved = pool.reserved(),
            active = pool.active_count().await,
            "still waiting for jobs"
        );
    }

    let codes = pool.returncodes();
    let failed = codes.iter().filter(|code| **code != 0).count();
    let killed = usize::try_from(pool.submitted())
        .unwrap_or(usize::MAX)
        .saturating_sub(codes.len());
    info!(
        jobs = codes.len(),
        failed,
        killed,
        "batch complete"
    );

    Ok(if failed > 0 || killed > 0 {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

/// Flip the cancellation channel on Ctrl-C or SIGTERM.
async fn watch_signals(cancel_tx: watch::Sender<bool>) {
    #[cfg(unix)]
    {
        let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(stream) => stream,
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Received Ctrl+C, cancelling batch");
                    cancel_tx.send_replace(true);
                }
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("Received Ctrl+C, cancelling batch"),
            _ = sigterm.recv() => info!("Received SIGTERM, cancelling batch"),
        }
        cancel_tx.send_replace(true);
    }
    #[cfg(not(unix))]
    {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Received Ctrl+C, cancelling batch");
            cancel_tx.send_replace(true);
        }
    }
}

/// Merge settings-file values under CLI flags.
fn build_pool_config(args: &Args, settings: &PoolSettings) -> PoolConfig {
    PoolConfig {
        capacity: args.capacity.unwrap_or(settings.capacity),
        cpu_limit_percent: args.cpu_limit.unwrap_or(settings.cpu_limit_percent),
        poll_interval: Duration::from_millis(
            args.poll_interval_ms.unwrap_or(settings.poll_interval_ms),
        ),
        queue_depth: args.queue_depth.unwrap_or(settings.queue_depth),
    }
}

fn build_spec(command: &str, args: &Args) -> JobSpec {
    let stdio = if args.inherit_stdio {
        StdioTarget::Inherit
    } else {
        StdioTarget::Discard
    };
    JobSpec::shell(command)
        .weight(args.weight)
        .single_threaded(args.single_threaded)
        .stdout(stdio.clone())
        .stderr(stdio)
}

/// Submit, waiting out transient queue-full conditions. Any other submit
/// failure aborts the batch setup.
async fn submit_with_backpressure(
    pool: &ProcessPool,
    spec: JobSpec,
    poll: Duration,
) -> anyhow::Result<()> {
    loop {
        match pool.submit(spec.clone()) {
            Ok(_) => return Ok(()),
            Err(SubmitError::QueueFull { .. }) => {
                tokio::time::sleep(poll).await;
            }
            Err(e) => return Err(e).context("cannot submit job"),
        }
    }
}

/// Read one command per line, skipping blanks and `#` comments.
fn read_commands(input: Option<&Path>) -> anyhow::Result<Vec<String>> {
    let raw = match input {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("cannot read {}", path.display()))?,
        None => std::io::read_to_string(std::io::stdin()).context("cannot read stdin")?,
    };
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(ToString::to_string)
        .collect())
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write as _;

    fn args_from(argv: &[&str]) -> Args {
        Args::try_parse_from(argv).unwrap()
    }

    #[test]
    fn cli_flags_override_settings_file() {
        let args = args_from(&["corral", "--capacity", "8", "--cpu-limit", "50"]);
        let settings = PoolSettings {
            capacity: 2,
            cpu_limit_percent: 90,
            poll_interval_ms: 200,
            queue_depth: 32,
        };

        let config = build_pool_config(&args, &settings);
        assert_eq!(config.capacity, 8);
        assert_eq!(config.cpu_limit_percent, 50);
        // Unset flags fall through to the settings file.
        assert_eq!(config.poll_interval, Duration::from_millis(200));
        assert_eq!(config.queue_depth, 32);
    }

    #[test]
    fn settings_defaults_apply_without_flags() {
        let args = args_from(&["corral"]);
        let config = build_pool_config(&args, &PoolSettings::default());
        assert_eq!(config.capacity, 0); // auto
        assert_eq!(config.cpu_limit_percent, 75);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
    }

    #[test]
    fn spec_uses_shell_and_weight() {
        let args = args_from(&["corral", "--weight", "3", "--single-threaded"]);
        let spec = build_spec("ffmpeg -i in.ts out.mkv", &args);
        assert_eq!(spec.argv[..2], ["sh".to_string(), "-c".to_string()]);
        assert_eq!(spec.argv[2], "ffmpeg -i in.ts out.mkv");
        assert_eq!(spec.weight, 3);
        assert!(spec.single_threaded);
        assert_eq!(spec.stdout, StdioTarget::Discard);
    }

    #[test]
    fn inherit_stdio_flag_switches_targets() {
        let args = args_from(&["corral", "--inherit-stdio"]);
        let spec = build_spec("true", &args);
        assert_eq!(spec.stdout, StdioTarget::Inherit);
        assert_eq!(spec.stderr, StdioTarget::Inherit);
    }

    #[test]
    fn read_commands_skips_blanks_and_comments() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# transcode batch").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "  ffmpeg -i a.ts a.mkv  ").unwrap();
        writeln!(file, "comskip rec.ts").unwrap();

        let commands = read_commands(Some(file.path())).unwrap();
        assert_eq!(commands, vec!["ffmpeg -i a.ts a.mkv", "comskip rec.ts"]);
    }

    #[test]
    fn read_commands_missing_file_errors() {
        assert!(read_commands(Some(Path::new("/nonexistent/batch.txt"))).is_err());
    }
}
