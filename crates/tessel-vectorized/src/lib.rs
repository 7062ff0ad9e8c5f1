//! Multi-threaded vectorized pipeline executor.
//!
//! Takes one or more *pipeline functions* — each operating on chunks of
//! matrix-shaped inputs — and executes them in parallel across a pool of CPU
//! (and optionally accelerator) workers: inputs are split into row chunks by
//! the load partitioner, distributed through task queues (with work stealing
//! between per-worker queues), and per-chunk outputs are combined into the
//! final result matrices.
//!
//! The entry point is [`PipelineExecutor`]; the lower layers (queues,
//! partitioner, workers, sink, combiners) are public so embedders and tests
//! can compose them directly.

pub mod accel;
pub mod combine;
pub mod executor;
pub mod partition;
pub mod queue;
pub mod sink;
pub mod task;
pub mod worker;

pub use accel::{AccelContext, HostStagingAccel};
pub use executor::{PipelineDesc, PipelineExecutor, RunStats};
pub use partition::LoadPartitioner;
pub use queue::TaskQueue;
pub use sink::{OutputSink, TaskResult};
pub use task::{PipelineContext, PipelineFn, Task};
pub use worker::{WorkerConfig, WorkerRole};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a worker panicked while holding it.
pub(crate) fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
