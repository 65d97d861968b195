//! CPU-limiter sidecar detection and spawning.
//!
//! Throttling uses an external percentage-based utility (`cpulimit`) run as
//! a sidecar process attached to the job's pid. The helper is looked up on
//! PATH exactly once when the pool is constructed; absence degrades to
//! unthrottled execution with a single logged warning.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tracing::debug;

/// Helper binary throttling a target pid to a CPU percentage.
const LIMITER_BIN: &str = "cpulimit";

/// Handle to a detected CPU-limiter helper.
#[derive(Debug, Clone)]
pub struct CpuLimiter {
    bin: PathBuf,
}

impl CpuLimiter {
    /// Look up the default limiter binary on PATH.
    pub fn detect() -> Option<Self> {
        Self::detect_named(LIMITER_BIN)
    }

    /// Look up a specific limiter binary on PATH.
    pub fn detect_named(bin: &str) -> Option<Self> {
        match which::which(bin) {
            Ok(path) => {
                debug!(limiter = %path.display(), "CPU limiter available");
                Some(Self { bin: path })
            }
            Err(_) => None,
        }
    }

    /// Resolved path of the helper binary.
    pub fn path(&self) -> &std::path::Path {
        &self.bin
    }

    /// Spawn the sidecar throttling `pid` to `percent`.
    ///
    /// `-z` makes the helper exit on its own once the target is gone, so a
    /// crashed job never leaves a stray limiter behind.
    pub fn spawn(&self, pid: u32, percent: u32) -> std::io::Result<Child> {
        Command::new(&self.bin)
            .arg("-p")
            .arg(pid.to_string())
            .arg("-l")
            .arg(percent.to_string())
            .arg("-z")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
    }
}

/// Effective cap for one job.
///
/// Multi-threaded tools are assumed to use roughly one core per reserved
/// slot, so the cap scales with weight; single-threaded tools get the base
/// cap unscaled.
pub const fn effective_percent(base: u32, weight: u32, single_threaded: bool) -> u32 {
    if single_threaded {
        base
    } else {
        base.saturating_mul(weight)
    }
}
