//! One managed external process: spawn, sidecar attach, poll-based exit
//! monitoring, cooperative termination.
//!
//! Exit detection is plain `try_wait` polling — the job's tooling and the
//! CPU limiter are ordinary OS processes and no native child-exit event is
//! assumed. Cancellation is still observed early through the watch
//! channels, so the poll interval only bounds the worst case.

use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{Mutex, watch};
use tracing::{debug, error, info, warn};

use crate::job::{JobSpec, JobState, SPAWN_FAILED_EXIT_CODE, StdioTarget};
use crate::limiter::effective_percent;
use crate::pool::PoolShared;
use crate::slots::SlotPermit;

/// Floor for the post-terminate grace wait, so very fast poll intervals in
/// tests still give the child a chance to exit.
const MIN_GRACE: Duration = Duration::from_millis(100);

/// State shared between a job's handle, the dispatch loop, and its monitor
/// task.
#[derive(Debug)]
pub(crate) struct JobShared {
    pub(crate) seq: u64,
    pub(crate) state: watch::Sender<JobState>,
    pub(crate) kill: watch::Sender<bool>,
    pub(crate) child: Mutex<Option<Child>>,
}

impl JobShared {
    pub(crate) fn new(seq: u64) -> Arc<Self> {
        let (state, _) = watch::channel(JobState::Queued);
        let (kill, _) = watch::channel(false);
        Arc::new(Self {
            seq,
            state,
            kill,
            child: Mutex::new(None),
        })
    }

    pub(crate) fn set_state(&self, state: JobState) {
        self.state.send_replace(state);
    }
}

enum Outcome {
    Exited(std::process::ExitStatus),
    Cancelled,
}

/// Spawn the job's process and monitor it to a terminal state.
///
/// Holds `permit` for the lifetime of the process; every exit path drops it
/// before the job is retired from the active set.
pub(crate) async fn run(
    spec: JobSpec,
    shared: Arc<JobShared>,
    permit: SlotPermit,
    pool: Arc<PoolShared>,
) {
    let seq = shared.seq;
    let total = pool.submitted.load(Ordering::SeqCst);

    pool.active
        .write()
        .await
        .insert(seq, Arc::clone(&shared));

    let mut command = build_command(&spec, seq);
    let child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            error!(
                job = seq,
                submitted = total,
                program = %spec.argv[0],
                error = %e,
                "failed to spawn job process"
            );
            shared.set_state(JobState::SpawnFailed);
            drop(permit);
            pool.retire(seq, Some(SPAWN_FAILED_EXIT_CODE)).await;
            return;
        }
    };

    let pid = child.id();
    info!(job = seq, submitted = total, pid, "job started");
    shared.set_state(JobState::Running);

    let mut sidecar = spawn_sidecar(&spec, &permit, pid, &pool, seq);

    *shared.child.lock().await = Some(child);

    let poll = pool.config.poll_interval;
    let grace = poll.max(MIN_GRACE);
    let mut cancel_rx = pool.cancel_rx.clone();
    let mut kill_rx = shared.kill.subscribe();
    let mut cancel_live = true;

    let outcome = loop {
        let polled = {
            let mut guard = shared.child.lock().await;
            let Some(child) = guard.as_mut() else {
                break Outcome::Cancelled;
            };
            child.try_wait()
        };
        match polled {
            Ok(Some(status)) => break Outcome::Exited(status),
            Ok(None) => {}
            Err(e) => warn!(job = seq, error = %e, "failed to poll job process"),
        }

        if *cancel_rx.borrow() || *kill_rx.borrow() {
            break Outcome::Cancelled;
        }

        tokio::select! {
            () = tokio::time::sleep(poll) => {}
            res = cancel_rx.changed(), if cancel_live => {
                if res.is_err() {
                    // Cancellation source dropped without firing; fall back
                    // to pure interval polling.
                    cancel_live = false;
                }
            }
            _ = kill_rx.changed() => {}
        }
    };

    match outcome {
        Outcome::Exited(status) => {
            let code = exit_code(status);
            reap_sidecar(&mut sidecar, seq, grace).await;
            shared.child.lock().await.take();
            shared.set_state(JobState::Finished(code));
            if code == 0 {
                info!(job = seq, submitted = total, code, "job finished");
            } else {
                warn!(
                    job = seq,
                    submitted = total,
                    code,
                    "job finished with nonzero code"
                );
            }
            drop(permit);
            pool.retire(seq, Some(code)).await;
        }
        Outcome::Cancelled => {
            {
                let mut guard = shared.child.lock().await;
                if let Some(child) = guard.as_mut() {
                    terminate(child, seq);
                    if let Some(side) = sidecar.as_mut() {
                        terminate(side, seq);
                    }
                    if tokio::time::timeout(grace, child.wait()).await.is_err() {
                        warn!(job = seq, "job did not exit within grace period after terminate");
                    }
                }
                guard.take();
            }
            reap_sidecar(&mut sidecar, seq, grace).await;
            shared.set_state(JobState::Killed);
            info!(job = seq, submitted = total, "job killed");
            drop(permit);
            pool.retire(seq, None).await;
        }
    }
}

/// Spawn the CPU-limiter sidecar when a helper was detected and the
/// effective cap is nonzero. Failure is degraded throttling, never fatal.
fn spawn_sidecar(
    spec: &JobSpec,
    permit: &SlotPermit,
    pid: Option<u32>,
    pool: &PoolShared,
    seq: u64,
) -> Option<Child> {
    let limiter = pool.limiter.as_ref()?;
    let pid = pid?;
    let base = spec
        .cpu_limit_percent
        .unwrap_or(pool.config.cpu_limit_percent);
    let percent = effective_percent(base, permit.weight(), spec.single_threaded);
    if percent == 0 {
        return None;
    }
    match limiter.spawn(pid, percent) {
        Ok(side) => {
            debug!(job = seq, pid, percent, "CPU limiter sidecar attached");
            Some(side)
        }
        Err(e) => {
            warn!(
                job = seq,
                error = %e,
                "CPU limiter sidecar failed to start; job runs unthrottled"
            );
            None
        }
    }
}

/// Stop the sidecar and wait briefly for it to be reaped.
async fn reap_sidecar(sidecar: &mut Option<Child>, seq: u64, grace: Duration) {
    if let Some(mut side) = sidecar.take() {
        terminate(&mut side, seq);
        if tokio::time::timeout(grace, side.wait()).await.is_err() {
            debug!(job = seq, "CPU limiter sidecar did not exit within grace period");
        }
    }
}

fn build_command(spec: &JobSpec, seq: u64) -> Command {
    let mut command = Command::new(&spec.argv[0]);
    command.args(&spec.argv[1..]);
    if let Some(dir) = &spec.working_dir {
        command.current_dir(dir);
    }
    for (key, value) in &spec.env {
        command.env(key, value);
    }
    command.stdin(Stdio::null());
    command.stdout(resolve_stdio(&spec.stdout, seq, "stdout"));
    command.stderr(resolve_stdio(&spec.stderr, seq, "stderr"));
    command
}

/// Turn a [`StdioTarget`] into a concrete `Stdio`, creating parent
/// directories for file targets. Directory or file failures fall back to
/// discarding the stream.
fn resolve_stdio(target: &StdioTarget, seq: u64, stream: &str) -> Stdio {
    match target {
        StdioTarget::Inherit => Stdio::inherit(),
        StdioTarget::Discard => Stdio::null(),
        StdioTarget::File(path) => {
            if let Some(parent) = path.parent()
                && !parent.as_os_str().is_empty()
                && let Err(e) = std::fs::create_dir_all(parent)
            {
                warn!(
                    job = seq,
                    stream,
                    dir = %parent.display(),
                    error = %e,
                    "cannot create output directory; discarding stream"
                );
                return Stdio::null();
            }
            match std::fs::File::create(path) {
                Ok(file) => Stdio::from(file),
                Err(e) => {
                    warn!(
                        job = seq,
                        stream,
                        path = %path.display(),
                        error = %e,
                        "cannot open output file; discarding stream"
                    );
                    Stdio::null()
                }
            }
        }
    }
}

/// Send the single cooperative terminate signal. No escalation follows; a
/// job that ignores it is left to finish on its own.
#[cfg(unix)]
fn terminate(child: &mut Child, seq: u64) {
    if let Some(pid) = child.id() {
        // SAFETY: pid comes from our own Child handle; kill(2) with SIGTERM
        // is safe to call on an owned subprocess.
        #[allow(unsafe_code)]
        #[allow(clippy::cast_possible_wrap)]
        let ret = unsafe { libc::kill(pid as i32, libc::SIGTERM) };
        if ret != 0 {
            let err = std::io::Error::last_os_error();
            warn!(job = seq, pid, error = %err, "failed to send SIGTERM");
        }
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child, seq: u64) {
    if let Err(e) = child.start_kill() {
        warn!(job = seq, error = %e, "failed to kill job process");
    }
}

#[cfg(unix)]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // Signal-terminated children report the shell convention 128+signal so
    // they stay distinct from the killed-job sentinel.
    status
        .code()
        .unwrap_or_else(|| status.signal().map_or(-1, |sig| 128 + sig))
}

#[cfg(not(unix))]
fn exit_code(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn file_target_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("logs").join("job.out");

        let _stdio = resolve_stdio(&StdioTarget::File(path.clone()), 1, "stdout");

        assert!(path.parent().unwrap().is_dir());
        assert!(path.is_file());
    }

    #[test]
    fn unwritable_file_target_falls_back_to_discard() {
        let dir = tempfile::tempdir().unwrap();
        // A regular file where a directory is needed forces the fallback.
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"x").unwrap();
        let path = blocker.join("sub").join("job.out");

        let _stdio = resolve_stdio(&StdioTarget::File(path), 1, "stderr");
        // No panic and no stray file is the contract; the stream is silenced.
        assert!(blocker.is_file());
    }

    #[test]
    fn job_shared_state_transitions() {
        let shared = JobShared::new(3);
        assert_eq!(*shared.state.borrow(), JobState::Queued);
        shared.set_state(JobState::Running);
        assert_eq!(*shared.state.borrow(), JobState::Running);
        shared.set_state(JobState::Finished(0));
        assert!(shared.state.borrow().is_terminal());
    }
}
