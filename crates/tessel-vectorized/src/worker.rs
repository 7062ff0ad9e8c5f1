//! Worker threads: pop a task, invoke the pipeline function, sink the result.
//!
//! All variants share the same loop — pop from the home queue, exit on EOF,
//! otherwise execute — and differ only in which queue is home, which peers
//! they may steal from, and whether the task's inputs must be made resident
//! on an accelerator first. A worker that finds its home queue empty tries
//! one full round of steals (order set by the steal policy) and then blocks
//! on its home queue for work or EOF.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Instant;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use tessel_common::{
    CombineKind, DenseMatrix, MatrixValue, PipelineError, Result, SplitKind, StealPolicy,
    TesselError, ValueType,
};

use crate::queue::{Polled, Popped, TaskQueue};
use crate::sink::{OutputSink, TaskResult};
use crate::task::{PipelineContext, PipelineFn, Task};

/// Role of a worker thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerRole {
    Cpu,
    Accelerator,
}

/// Per-worker activity counters, shared with the scheduler.
#[derive(Debug, Default)]
pub struct WorkerCounters {
    pub tasks: AtomicUsize,
    pub steals: AtomicUsize,
}

/// Run-wide state shared by every worker of one pipeline.
pub struct WorkerContext<T: ValueType> {
    pub funcs: Vec<PipelineFn<T>>,
    pub splits: Vec<SplitKind>,
    pub combines: Vec<CombineKind>,
    pub out_rows: Vec<Option<usize>>,
    pub out_cols: Vec<Option<usize>>,
    pub sink: Arc<OutputSink<T>>,
    pub pipeline_ctx: Arc<PipelineContext<T>>,
}

/// Static description of one worker thread.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub id: usize,
    pub role: WorkerRole,
    /// Index of the home queue within the queue vector.
    pub home_queue: usize,
    /// Hardware thread to pin to before the first pop, when set.
    pub pin_to: Option<usize>,
    pub steal_policy: StealPolicy,
    /// Queues this worker may steal from. Empty disables stealing, as in the
    /// single-queue and per-device-type layouts.
    pub steal_targets: Vec<usize>,
    /// Socket index of each queue, parallel to the queue vector.
    pub queue_sockets: Vec<usize>,
    /// This worker's socket index.
    pub socket: usize,
}

/// Spawn one worker thread over the given queues.
pub fn spawn_worker<T: ValueType>(
    cfg: WorkerConfig,
    queues: Arc<Vec<Arc<TaskQueue<T>>>>,
    ctx: Arc<WorkerContext<T>>,
    counters: Arc<WorkerCounters>,
) -> Result<JoinHandle<Result<()>>> {
    let name = format!("tessel-worker-{}", cfg.id);
    std::thread::Builder::new()
        .name(name)
        .spawn(move || worker_loop(cfg, queues, ctx, counters))
        .map_err(TesselError::Io)
}

fn worker_loop<T: ValueType>(
    cfg: WorkerConfig,
    queues: Arc<Vec<Arc<TaskQueue<T>>>>,
    ctx: Arc<WorkerContext<T>>,
    counters: Arc<WorkerCounters>,
) -> Result<()> {
    if let Some(hw_thread) = cfg.pin_to {
        pin_to_hw_thread(cfg.id, hw_thread);
    }
    let home = &queues[cfg.home_queue];
    let mut rng = StdRng::seed_from_u64(cfg.id as u64 + 1);

    loop {
        // Home first; on empty, one steal round, then block on home for work
        // or EOF. Once home is at EOF the worker keeps stealing until a full
        // round over the peers comes back empty.
        let popped = match home.try_pop() {
            Polled::Task(task) => Some(task),
            Polled::Eof => None,
            Polled::Empty => match steal_round(&cfg, &queues, &mut rng) {
                Some(task) => {
                    counters.steals.fetch_add(1, Ordering::Relaxed);
                    Some(task)
                }
                None => match home.pop() {
                    Popped::Task(task) => Some(task),
                    Popped::Eof => None,
                },
            },
        };
        let task = match popped {
            Some(task) => task,
            None => match steal_round(&cfg, &queues, &mut rng) {
                Some(task) => {
                    counters.steals.fetch_add(1, Ordering::Relaxed);
                    task
                }
                None => return Ok(()),
            },
        };

        if let Err(e) = run_task(&cfg, &task, &ctx) {
            log::warn!(
                "worker {} failed on rows {}..{}: {e}",
                cfg.id,
                task.row_range.start,
                task.row_range.end
            );
            // Drain the home queue without executing, then exit with the
            // first captured error; the scheduler propagates it after join.
            loop {
                match home.pop() {
                    Popped::Task(_) => {}
                    Popped::Eof => return Err(e),
                }
            }
        }
        counters.tasks.fetch_add(1, Ordering::Relaxed);
    }
}

/// One bounded round over the steal targets; order depends on the policy.
fn steal_round<T: ValueType>(
    cfg: &WorkerConfig,
    queues: &[Arc<TaskQueue<T>>],
    rng: &mut StdRng,
) -> Option<Task<T>> {
    let mut order: Vec<usize> =
        cfg.steal_targets.iter().copied().filter(|&q| q != cfg.home_queue).collect();
    match cfg.steal_policy {
        StealPolicy::Sequential => {}
        StealPolicy::LocalFirst => {
            order.sort_by_key(|&q| cfg.queue_sockets.get(q).copied().unwrap_or(0) != cfg.socket);
        }
        StealPolicy::Random => {
            for i in (1..order.len()).rev() {
                let j = rng.gen_range(0..=i);
                order.swap(i, j);
            }
        }
    }
    order.into_iter().find_map(|q| queues[q].steal())
}

fn run_task<T: ValueType>(
    cfg: &WorkerConfig,
    task: &Task<T>,
    ctx: &WorkerContext<T>,
) -> Result<()> {
    // Accelerator workers make the task's row-split inputs resident first.
    // The inputs are views of `task.row_range`, so that range names their
    // window within the shared buffer.
    if cfg.role == WorkerRole::Accelerator {
        if let Some(accel) = &ctx.pipeline_ctx.accel {
            for (input, split) in task.inputs.iter().zip(&ctx.splits) {
                if *split == SplitKind::Rows {
                    accel.prefetch_rows(input, task.row_range.clone())?;
                }
            }
        }
    }

    let mut slots: Vec<Option<MatrixValue<T>>> = Vec::with_capacity(ctx.combines.len());
    for (idx, combine) in ctx.combines.iter().enumerate() {
        if *combine == CombineKind::Add {
            // Summed outputs accumulate into a pre-zeroed buffer of final shape.
            match (ctx.out_rows[idx], ctx.out_cols[idx]) {
                (Some(rows), Some(cols)) => {
                    slots.push(Some(MatrixValue::Dense(DenseMatrix::zeroed(rows, cols)?)));
                }
                _ => {
                    return Err(PipelineError::CombineFailed {
                        index: idx,
                        reason: "summed outputs need known dimensions".into(),
                    }
                    .into())
                }
            }
        } else {
            slots.push(None);
        }
    }

    let func = ctx.funcs.get(task.func_idx).ok_or_else(|| {
        TesselError::Config(format!("pipeline function index {} out of range", task.func_idx))
    })?;
    let started = Instant::now();
    (func)(&mut slots, &task.inputs, task.row_range.clone(), &ctx.pipeline_ctx).map_err(|e| {
        PipelineError::FunctionFailed {
            func_idx: task.func_idx,
            start: task.row_range.start,
            end: task.row_range.end,
            reason: e.to_string(),
        }
    })?;
    log::trace!(
        "worker {}: rows {}..{} done in {:?}",
        cfg.id,
        task.row_range.start,
        task.row_range.end,
        started.elapsed()
    );

    ctx.sink.push(TaskResult { row_range: task.row_range.clone(), outputs: slots });
    Ok(())
}

#[cfg(target_os = "linux")]
fn pin_to_hw_thread(worker_id: usize, hw_thread: usize) {
    // SAFETY: cpu_set_t is a plain bitmask; zeroed is its empty value.
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(hw_thread, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            log::warn!("worker {worker_id}: failed to pin to hardware thread {hw_thread}");
        } else {
            log::debug!("worker {worker_id} pinned to hardware thread {hw_thread}");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn pin_to_hw_thread(worker_id: usize, _hw_thread: usize) {
    log::debug!("worker {worker_id}: cpu pinning not supported on this platform");
}
