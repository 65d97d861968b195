//! corral Pool Library
//!
//! A bounded-concurrency pool for external helper processes (transcoders,
//! commercial detectors, format converters). Jobs reserve a configurable
//! number of weight units from a shared budget, run as plain OS processes
//! optionally throttled by a CPU-limiter sidecar, and are cancelled
//! cooperatively through a watch channel owned by the surrounding
//! application.
//!
//! - [`SlotPool`]: weighted counting semaphore bounding total concurrent
//!   resource consumption.
//! - [`JobSpec`]: immutable description of one external process invocation.
//! - [`ProcessPool`]: FIFO queue, dispatch loop, per-job handles, and
//!   return-code aggregation.

pub mod job;
pub mod limiter;
pub mod pool;
pub mod slots;

mod process;

pub use job::{JobSpec, JobState, StdioTarget, KILLED_EXIT_CODE, SPAWN_FAILED_EXIT_CODE};
pub use limiter::CpuLimiter;
pub use pool::{JobHandle, PoolConfig, ProcessPool, SubmitError};
pub use slots::{AcquireError, SlotPermit, SlotPool};
