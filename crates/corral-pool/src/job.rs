//! Job descriptions and lifecycle states.

use std::path::PathBuf;

/// Sentinel return code reported by handles for killed jobs.
///
/// Killed jobs do not contribute to [`crate::ProcessPool::returncodes`];
/// this value is only visible through [`crate::JobHandle::returncode`].
pub const KILLED_EXIT_CODE: i32 = -1;

/// Sentinel return code recorded when the job's process could not be
/// spawned at all (missing executable, permissions). Matches the shell
/// convention for "command not found" and is recorded in the pool's
/// return-code list so all-zero aggregation fails.
pub const SPAWN_FAILED_EXIT_CODE: i32 = 127;

/// Where a job's stdout or stderr goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum StdioTarget {
    /// Inherit the pool process's own stream.
    Inherit,
    /// Silence the stream.
    #[default]
    Discard,
    /// Write to a file, creating parent directories first. If the directory
    /// cannot be created the stream falls back to [`StdioTarget::Discard`]
    /// with a logged warning.
    File(PathBuf),
}

/// Immutable description of one external process invocation.
///
/// Built once by the caller and handed to
/// [`crate::ProcessPool::submit`]; the pool never mutates it.
#[derive(Debug, Clone)]
pub struct JobSpec {
    /// Program followed by its arguments.
    pub argv: Vec<String>,
    /// Destination for the child's stdout.
    pub stdout: StdioTarget,
    /// Destination for the child's stderr.
    pub stderr: StdioTarget,
    /// Working directory for the child, if different from the pool's.
    pub working_dir: Option<PathBuf>,
    /// Extra environment variables for the child.
    pub env: Vec<(String, String)>,
    /// Slots this job reserves while running. Minimum 1.
    pub weight: u32,
    /// Single-threaded tools get the unscaled CPU cap even at weight > 1.
    pub single_threaded: bool,
    /// Per-job CPU cap percent, overriding the pool default.
    pub cpu_limit_percent: Option<u32>,
}

impl JobSpec {
    /// Describe a job running `program` with no arguments yet.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            argv: vec![program.into()],
            stdout: StdioTarget::default(),
            stderr: StdioTarget::default(),
            working_dir: None,
            env: Vec::new(),
            weight: 1,
            single_threaded: false,
            cpu_limit_percent: None,
        }
    }

    /// Describe a job running a shell command line via `sh -c`.
    pub fn shell(command: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(command)
    }

    /// Append one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.argv.push(arg.into());
        self
    }

    /// Append several arguments.
    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.argv.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the stdout destination.
    #[must_use]
    pub fn stdout(mut self, target: StdioTarget) -> Self {
        self.stdout = target;
        self
    }

    /// Set the stderr destination.
    #[must_use]
    pub fn stderr(mut self, target: StdioTarget) -> Self {
        self.stderr = target;
        self
    }

    /// Set the working directory.
    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add an environment override.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the job weight. Values below 1 clamp to 1.
    #[must_use]
    pub fn weight(mut self, weight: u32) -> Self {
        self.weight = weight.max(1);
        self
    }

    /// Mark the job as single-threaded for CPU-cap scaling.
    #[must_use]
    pub const fn single_threaded(mut self, yes: bool) -> Self {
        self.single_threaded = yes;
        self
    }

    /// Override the pool's default CPU cap for this job.
    #[must_use]
    pub const fn cpu_limit_percent(mut self, percent: u32) -> Self {
        self.cpu_limit_percent = Some(percent);
        self
    }
}

/// Lifecycle of a submitted job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Waiting in the FIFO queue or for slot capacity.
    Queued,
    /// Process spawned and not yet exited.
    Running,
    /// Process exited on its own with this code.
    Finished(i32),
    /// Terminated through cancellation (pool shutdown or handle kill),
    /// or never started because shutdown was already in progress.
    Killed,
    /// The OS could not create the process.
    SpawnFailed,
}

impl JobState {
    /// Whether the job can no longer change state.
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Finished(_) | Self::Killed | Self::SpawnFailed
        )
    }

    /// Return code for terminal states; `None` while the job is live.
    pub const fn returncode(self) -> Option<i32> {
        match self {
            Self::Finished(code) => Some(code),
            Self::Killed => Some(KILLED_EXIT_CODE),
            Self::SpawnFailed => Some(SPAWN_FAILED_EXIT_CODE),
            Self::Queued | Self::Running => None,
        }
    }
}
