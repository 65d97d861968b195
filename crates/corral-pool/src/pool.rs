//! FIFO process pool: queueing, dispatch, per-job handles, and return-code
//! aggregation.
//!
//! One dispatch task per pool pulls specs strictly in submission order and
//! reserves their weight from the [`SlotPool`] before starting them; each
//! started job gets its own monitor task, so a slow job never blocks the
//! dispatch of independent work once slots free up. The pool polls an
//! application-owned cancellation watch channel and never installs signal
//! handlers of its own.

use std::collections::HashMap;
use std::sync::PoisonError;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::process::Child;
use tokio::sync::{Notify, RwLock, mpsc, watch};
use tracing::{debug, info, warn};

use crate::job::{JobSpec, JobState};
use crate::limiter::CpuLimiter;
use crate::process::{self, JobShared};
use crate::slots::{AcquireError, SlotPool};

/// Lower clamp for the scheduler poll interval.
pub const MIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Upper clamp for the scheduler poll interval, also the default.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Default CPU cap percent applied through the limiter sidecar.
const DEFAULT_CPU_LIMIT_PERCENT: u32 = 75;

/// Default bound on the pending-job queue.
const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Total weight budget. 0 means auto: half the CPU cores, minimum 1.
    pub capacity: u32,
    /// Default CPU cap percent per job; 0 disables throttling.
    pub cpu_limit_percent: u32,
    /// Scheduler poll interval, clamped to
    /// [`MIN_POLL_INTERVAL`]..=[`MAX_POLL_INTERVAL`].
    pub poll_interval: Duration,
    /// Maximum number of jobs waiting to start.
    pub queue_depth: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 0,
            cpu_limit_percent: DEFAULT_CPU_LIMIT_PERCENT,
            poll_interval: MAX_POLL_INTERVAL,
            queue_depth: DEFAULT_QUEUE_DEPTH,
        }
    }
}

impl PoolConfig {
    /// Resolve auto values and clamp out-of-range ones.
    fn normalized(mut self) -> Self {
        if self.capacity == 0 {
            let half = num_cpus::get() / 2;
            self.capacity = u32::try_from(half.max(1)).unwrap_or(1);
        }
        self.poll_interval = self
            .poll_interval
            .clamp(MIN_POLL_INTERVAL, MAX_POLL_INTERVAL);
        if self.queue_depth == 0 {
            self.queue_depth = 1;
        }
        self
    }
}

/// Errors from [`ProcessPool::submit`].
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The pool has been closed; no further jobs are accepted.
    #[error("pool is closed")]
    Closed,

    /// The job asks for more weight than the pool will ever have. Rejected
    /// up front instead of deadlocking the queue head.
    #[error("job weight {weight} exceeds pool capacity {capacity}")]
    Oversized { weight: u32, capacity: u32 },

    /// The pending queue is at its configured depth.
    #[error("job queue is full ({depth} pending)")]
    QueueFull { depth: usize },

    /// The spec has no program to run.
    #[error("job command is empty")]
    EmptyCommand,
}

struct QueuedJob {
    spec: JobSpec,
    shared: Arc<JobShared>,
}

/// State shared by the pool handle, the dispatch task, and job monitors.
pub(crate) struct PoolShared {
    pub(crate) config: PoolConfig,
    pub(crate) slots: SlotPool,
    pub(crate) limiter: Option<CpuLimiter>,
    pub(crate) cancel_rx: watch::Receiver<bool>,
    pub(crate) closed: AtomicBool,
    pub(crate) submitted: AtomicU64,
    pub(crate) queued: AtomicUsize,
    pub(crate) active: RwLock<HashMap<u64, Arc<JobShared>>>,
    returncodes: Mutex<Vec<i32>>,
    pub(crate) idle: Notify,
}

impl PoolShared {
    fn lock_codes(&self) -> MutexGuard<'_, Vec<i32>> {
        self.returncodes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove a terminal job from the active set, recording its code if it
    /// counts toward aggregation, and wake idle waiters.
    pub(crate) async fn retire(&self, seq: u64, code: Option<i32>) {
        if let Some(code) = code {
            self.lock_codes().push(code);
        }
        self.active.write().await.remove(&seq);
        self.idle.notify_waiters();
    }
}

/// Bounded-concurrency pool of external processes.
pub struct ProcessPool {
    shared: Arc<PoolShared>,
    queue_tx: mpsc::Sender<QueuedJob>,
}

impl ProcessPool {
    /// Create a pool and start its dispatch task.
    ///
    /// `cancel_rx` is the application-owned shutdown indicator; when it
    /// turns `true`, running jobs are terminated and queued jobs are
    /// retired without starting. The CPU-limiter helper is looked up once
    /// here; absence logs a warning and disables throttling, but the pool
    /// still works.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(config: PoolConfig, cancel_rx: watch::Receiver<bool>) -> Self {
        let config = config.normalized();

        let limiter = if config.cpu_limit_percent == 0 {
            None
        } else {
            let detected = CpuLimiter::detect();
            if detected.is_none() {
                warn!("CPU limiter helper not found on PATH; jobs run unthrottled");
            }
            detected
        };

        info!(
            capacity = config.capacity,
            cpu_limit_percent = config.cpu_limit_percent,
            poll_interval_ms = u64::try_from(config.poll_interval.as_millis()).unwrap_or(u64::MAX),
            queue_depth = config.queue_depth,
            throttling = limiter.is_some(),
            "process pool created"
        );

        let (queue_tx, queue_rx) = mpsc::channel(config.queue_depth);
        let shared = Arc::new(PoolShared {
            slots: SlotPool::new(config.capacity),
            config,
            limiter,
            cancel_rx,
            closed: AtomicBool::new(false),
            submitted: AtomicU64::new(0),
            queued: AtomicUsize::new(0),
            active: RwLock::new(HashMap::new()),
            returncodes: Mutex::new(Vec::new()),
            idle: Notify::new(),
        });

        tokio::spawn(dispatch_loop(queue_rx, Arc::clone(&shared)));

        Self { shared, queue_tx }
    }

    /// Total weight budget.
    pub fn capacity(&self) -> u32 {
        self.shared.slots.capacity()
    }

    /// Weight currently reserved by running jobs.
    pub fn reserved(&self) -> u32 {
        self.shared.slots.reserved()
    }

    /// Number of jobs submitted over the pool's lifetime.
    pub fn submitted(&self) -> u64 {
        self.shared.submitted.load(Ordering::SeqCst)
    }

    /// Number of jobs currently running.
    pub async fn active_count(&self) -> usize {
        self.shared.active.read().await.len()
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// Enqueue a job in FIFO order.
    ///
    /// Rejects jobs when the pool is closed, when the spec names no
    /// program, when its weight can never fit the capacity, or when the
    /// pending queue is at its configured depth.
    pub fn submit(&self, spec: JobSpec) -> Result<JobHandle, SubmitError> {
        if self.is_closed() {
            return Err(SubmitError::Closed);
        }
        if spec.argv.is_empty() {
            return Err(SubmitError::EmptyCommand);
        }
        let capacity = self.shared.slots.capacity();
        if spec.weight > capacity {
            return Err(SubmitError::Oversized {
                weight: spec.weight,
                capacity,
            });
        }

        let permit = self.queue_tx.try_reserve().map_err(|e| match e {
            mpsc::error::TrySendError::Full(()) => SubmitError::QueueFull {
                depth: self.shared.config.queue_depth,
            },
            mpsc::error::TrySendError::Closed(()) => SubmitError::Closed,
        })?;

        let seq = self.shared.submitted.fetch_add(1, Ordering::SeqCst) + 1;
        let shared = JobShared::new(seq);
        let handle = JobHandle {
            state_rx: shared.state.subscribe(),
            shared: Arc::clone(&shared),
        };
        self.shared.queued.fetch_add(1, Ordering::SeqCst);
        permit.send(QueuedJob { spec, shared });
        info!(job = seq, submitted = seq, "job queued");
        Ok(handle)
    }

    /// Completion-ordered return codes of jobs that ran (or failed to
    /// spawn). Killed jobs are excluded; their handles report the
    /// [`crate::KILLED_EXIT_CODE`] sentinel instead.
    pub fn returncodes(&self) -> Vec<i32> {
        self.shared.lock_codes().clone()
    }

    /// Stop accepting new jobs. Idempotent; already-queued jobs drain
    /// normally and the dispatch task exits once everything is done.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            info!("pool closed; queued jobs will drain");
        }
    }

    /// Request cancellation of every active job. Used when an external
    /// shutdown signal fires ahead of the cancellation token, or for a
    /// targeted abort of in-flight work.
    pub async fn kill_all(&self) {
        let active = self.shared.active.read().await;
        info!(active = active.len(), "killing all active jobs");
        for shared in active.values() {
            shared.kill.send_replace(true);
        }
    }

    /// Wait until no job is queued, active, or holding weight, or until
    /// `timeout` elapses. Returns whether the pool drained.
    pub async fn wait_all(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.shared.idle.notified();
            if self.is_idle().await {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.is_idle().await;
            }
        }
    }

    async fn is_idle(&self) -> bool {
        self.shared.queued.load(Ordering::SeqCst) == 0
            && self.shared.active.read().await.is_empty()
            && self.shared.slots.reserved() == 0
    }
}

/// Single background worker pulling the queue head in FIFO order.
async fn dispatch_loop(mut queue_rx: mpsc::Receiver<QueuedJob>, shared: Arc<PoolShared>) {
    let poll = shared.config.poll_interval;
    loop {
        let job = match tokio::time::timeout(poll, queue_rx.recv()).await {
            Ok(Some(job)) => job,
            // Pool handle dropped with nothing left to read.
            Ok(None) => break,
            Err(_) => {
                if shared.closed.load(Ordering::SeqCst)
                    && shared.queued.load(Ordering::SeqCst) == 0
                    && shared.active.read().await.is_empty()
                {
                    break;
                }
                continue;
            }
        };

        // Head-of-queue job: keep retrying its reservation, never skipping
        // ahead to a smaller spec further back. Head-of-line blocking is
        // the cost of strict FIFO start order.
        let permit = loop {
            if *shared.cancel_rx.borrow() || *job.shared.kill.borrow() {
                break None;
            }
            match shared.slots.acquire(job.spec.weight, poll).await {
                Ok(permit) => break Some(permit),
                Err(AcquireError::Timeout { .. }) => {}
                // Oversized is rejected at submit; Closed cannot happen
                // while the pool owns the slots.
                Err(e) => {
                    warn!(job = job.shared.seq, error = %e, "cannot reserve slots");
                    break None;
                }
            }
        };

        shared.queued.fetch_sub(1, Ordering::SeqCst);
        match permit {
            Some(permit) => {
                tokio::spawn(process::run(
                    job.spec,
                    job.shared,
                    permit,
                    Arc::clone(&shared),
                ));
            }
            None => {
                job.shared.set_state(JobState::Killed);
                info!(
                    job = job.shared.seq,
                    submitted = shared.submitted.load(Ordering::SeqCst),
                    "job cancelled before start"
                );
                shared.idle.notify_waiters();
            }
        }
    }
    debug!("dispatch loop exited");
}

/// Handle to one submitted job.
#[derive(Clone, Debug)]
pub struct JobHandle {
    shared: Arc<JobShared>,
    state_rx: watch::Receiver<JobState>,
}

impl JobHandle {
    /// Pool-assigned sequence number (1-based submission order).
    pub fn seq(&self) -> u64 {
        self.shared.seq
    }

    /// Current lifecycle state.
    pub fn state(&self) -> JobState {
        *self.state_rx.borrow()
    }

    /// Return code once terminal: the process exit code, or the killed /
    /// spawn-failed sentinels. `None` while the job is live.
    pub fn returncode(&self) -> Option<i32> {
        self.state().returncode()
    }

    /// Request cancellation of this job only.
    pub fn kill(&self) {
        self.shared.kill.send_replace(true);
    }

    /// Wait until the job is terminal or `timeout` elapses. Returns whether
    /// a terminal state was reached.
    pub async fn wait(&self, timeout: Duration) -> bool {
        let mut rx = self.state_rx.clone();
        matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| s.is_terminal())).await,
            Ok(Ok(_))
        )
    }

    /// Run `f` against the live child process, e.g. to attach a progress
    /// reader to its stderr pipe. Returns `None` once the process is gone.
    ///
    /// Meant for callers running a single job at a time; the closure holds
    /// the job's internal lock, so keep it short.
    pub async fn with_child<F, R>(&self, f: F) -> Option<R>
    where
        F: FnOnce(&mut Child) -> R,
    {
        let mut guard = self.shared.child.lock().await;
        guard.as_mut().map(f)
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn cancel_token() -> (watch::Sender<bool>, watch::Receiver<bool>) {
        watch::channel(false)
    }

    #[test]
    fn config_auto_capacity_is_at_least_one() {
        let config = PoolConfig::default().normalized();
        assert!(config.capacity >= 1);
    }

    #[test]
    fn config_clamps_poll_interval() {
        let low = PoolConfig {
            poll_interval: Duration::from_millis(1),
            ..PoolConfig::default()
        }
        .normalized();
        assert_eq!(low.poll_interval, MIN_POLL_INTERVAL);

        let high = PoolConfig {
            poll_interval: Duration::from_secs(5),
            ..PoolConfig::default()
        }
        .normalized();
        assert_eq!(high.poll_interval, MAX_POLL_INTERVAL);
    }

    #[test]
    fn config_zero_queue_depth_clamps() {
        let config = PoolConfig {
            queue_depth: 0,
            ..PoolConfig::default()
        }
        .normalized();
        assert_eq!(config.queue_depth, 1);
    }

    #[tokio::test]
    async fn oversized_submit_rejected_without_hanging() {
        let (_tx, rx) = cancel_token();
        let pool = ProcessPool::new(
            PoolConfig {
                capacity: 2,
                cpu_limit_percent: 0,
                ..PoolConfig::default()
            },
            rx,
        );

        let err = pool
            .submit(JobSpec::shell("true").weight(5))
            .expect_err("oversized weight must be rejected");
        assert!(matches!(
            err,
            SubmitError::Oversized {
                weight: 5,
                capacity: 2
            }
        ));
        assert_eq!(pool.submitted(), 0);
    }

    #[tokio::test]
    async fn submit_after_close_rejected() {
        let (_tx, rx) = cancel_token();
        let pool = ProcessPool::new(
            PoolConfig {
                capacity: 1,
                cpu_limit_percent: 0,
                ..PoolConfig::default()
            },
            rx,
        );

        pool.close();
        pool.close(); // idempotent
        assert!(pool.is_closed());
        assert!(matches!(
            pool.submit(JobSpec::shell("true")),
            Err(SubmitError::Closed)
        ));
    }

    #[tokio::test]
    async fn empty_command_rejected() {
        let (_tx, rx) = cancel_token();
        let pool = ProcessPool::new(PoolConfig::default(), rx);

        let mut spec = JobSpec::new("x");
        spec.argv.clear();
        assert!(matches!(
            pool.submit(spec),
            Err(SubmitError::EmptyCommand)
        ));
    }

    #[tokio::test]
    async fn fresh_pool_is_idle() {
        let (_tx, rx) = cancel_token();
        let pool = ProcessPool::new(PoolConfig::default(), rx);

        assert!(pool.wait_all(Duration::from_millis(50)).await);
        assert_eq!(pool.reserved(), 0);
        assert_eq!(pool.active_count().await, 0);
        assert!(pool.returncodes().is_empty());
    }
}
