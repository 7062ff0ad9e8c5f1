//! The scheduler facade.
//!
//! One `execute*` call runs one vectorized pipeline to completion: it scans
//! the row-split inputs for the work extent and memory footprint, allocates
//! the final outputs it can size up front, builds the queue layout, seeds
//! tasks through the load partitioner, spawns the workers, joins them, and
//! combines the per-task outputs. Worker threads live for exactly one call.

use std::ops::Range;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tessel_common::{
    CombineKind, DenseMatrix, ExecutorConfig, MatrixValue, OutputShape, PartitionStrategy,
    QueueLayout, QueueMode, Result, SplitKind, TesselError, ValueType,
};
use tessel_device_probe::Topology;

use crate::accel::AccelContext;
use crate::combine::combine_outputs;
use crate::locked;
use crate::partition::LoadPartitioner;
use crate::queue::TaskQueue;
use crate::sink::OutputSink;
use crate::task::{PipelineContext, PipelineFn, Task};
use crate::worker::{
    spawn_worker, WorkerConfig, WorkerContext, WorkerCounters, WorkerRole,
};

/// Everything describing one vectorized pipeline run.
///
/// `funcs[0]` is the CPU variant of the pipeline; `funcs[1]`, when present,
/// is the accelerator variant used by accelerator workers.
pub struct PipelineDesc<T: ValueType> {
    pub funcs: Vec<PipelineFn<T>>,
    pub inputs: Vec<MatrixValue<T>>,
    /// Per-input split, parallel to `inputs`.
    pub splits: Vec<SplitKind>,
    /// Per-output combine rule.
    pub combines: Vec<CombineKind>,
    /// Per-output storage layout.
    pub out_shapes: Vec<OutputShape>,
    /// Final output dimensions; `None` when not known up front.
    pub out_rows: Vec<Option<usize>>,
    pub out_cols: Vec<Option<usize>>,
    /// Scalar markers per output, carried for pipeline producers; the
    /// scheduler validates the length and otherwise leaves them alone.
    pub scalar_outputs: Vec<bool>,
}

/// Statistics of the most recent run.
#[derive(Debug, Clone, Default)]
pub struct RunStats {
    pub tasks_total: usize,
    /// Executed-task count per worker, indexed by worker id.
    pub tasks_per_worker: Vec<usize>,
    pub steals: usize,
    pub elapsed: Duration,
}

/// Multi-threaded pipeline executor.
///
/// Construction probes the topology once; each `execute*` call spawns and
/// joins its own worker threads.
pub struct PipelineExecutor<T: ValueType> {
    config: ExecutorConfig,
    topology: Topology,
    num_cpu_workers: usize,
    accel: Option<Arc<dyn AccelContext<T>>>,
    last_stats: Mutex<Option<RunStats>>,
}

impl<T: ValueType> PipelineExecutor<T> {
    pub fn new(config: ExecutorConfig) -> Self {
        let topology = tessel_device_probe::probe_path(&config.cpuinfo_path).unwrap_or_else(|e| {
            let fallback = Topology::fallback();
            log::warn!(
                "cpu topology unavailable ({e}); assuming one socket with {} hardware threads",
                fallback.hw_threads.len()
            );
            fallback
        });
        let num_cpu_workers = if config.num_threads > 0 {
            config.num_threads
        } else {
            std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
        };
        log::debug!(
            "executor: {num_cpu_workers} cpu workers over {} sockets, layout {:?}",
            topology.num_sockets(),
            config.queue_layout
        );
        Self { config, topology, num_cpu_workers, accel: None, last_stats: Mutex::new(None) }
    }

    /// Register an accelerator context; used when the configuration asks for
    /// accelerator execution.
    pub fn with_accelerator(mut self, accel: Arc<dyn AccelContext<T>>) -> Self {
        self.accel = Some(accel);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn num_cpu_workers(&self) -> usize {
        self.num_cpu_workers
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Statistics of the most recent completed run, if any.
    pub fn last_stats(&self) -> Option<RunStats> {
        locked(&self.last_stats).clone()
    }

    /// Run with the queue layout from the configuration.
    pub fn execute(
        &self,
        desc: &PipelineDesc<T>,
        outputs: &mut [Option<MatrixValue<T>>],
    ) -> Result<()> {
        self.run(desc, outputs, self.config.queue_layout)
    }

    /// One shared queue polled by every worker.
    pub fn execute_single_queue(
        &self,
        desc: &PipelineDesc<T>,
        outputs: &mut [Option<MatrixValue<T>>],
    ) -> Result<()> {
        self.run(desc, outputs, QueueLayout::Single)
    }

    /// One queue per worker, stealing enabled.
    pub fn execute_queue_per_cpu(
        &self,
        desc: &PipelineDesc<T>,
        outputs: &mut [Option<MatrixValue<T>>],
    ) -> Result<()> {
        self.run(desc, outputs, QueueLayout::PerCpu)
    }

    /// One queue per socket; stealing crosses sockets.
    pub fn execute_queue_per_group(
        &self,
        desc: &PipelineDesc<T>,
        outputs: &mut [Option<MatrixValue<T>>],
    ) -> Result<()> {
        self.run(desc, outputs, QueueLayout::PerGroup)
    }

    /// One queue per device class (CPU, accelerator).
    pub fn execute_queue_per_device_type(
        &self,
        desc: &PipelineDesc<T>,
        outputs: &mut [Option<MatrixValue<T>>],
    ) -> Result<()> {
        self.run(desc, outputs, QueueLayout::PerDeviceType)
    }

    // ── Run orchestration ───────────────────────────────────────────

    fn run(
        &self,
        desc: &PipelineDesc<T>,
        outputs: &mut [Option<MatrixValue<T>>],
        layout: QueueLayout,
    ) -> Result<()> {
        self.config.validate()?;
        let len = self.validate(desc, outputs)?;
        let started = Instant::now();

        let (_, mut mem_required) = self.input_properties(desc);
        mem_required += self.allocate_outputs(desc, outputs)?;

        let accel = self.effective_accel();
        if let Some(accel) = &accel {
            self.prefetch_inputs(desc, accel.as_ref(), mem_required)?;
        }

        let plan = self.plan(layout, accel.is_some(), desc.funcs.len());
        let queues: Arc<Vec<Arc<TaskQueue<T>>>> =
            Arc::new((0..plan.num_queues).map(|_| Arc::new(TaskQueue::new())).collect());

        let sink = Arc::new(OutputSink::new());
        let pipeline_ctx = Arc::new(PipelineContext { accel, verbose: self.config.verbose });
        let worker_ctx = Arc::new(WorkerContext {
            funcs: desc.funcs.clone(),
            splits: desc.splits.clone(),
            combines: desc.combines.clone(),
            out_rows: desc.out_rows.clone(),
            out_cols: desc.out_cols.clone(),
            sink: Arc::clone(&sink),
            pipeline_ctx,
        });

        let counters: Vec<Arc<WorkerCounters>> =
            plan.workers.iter().map(|_| Arc::new(WorkerCounters::default())).collect();

        let spawn_all = |handles: &mut Vec<_>| -> Result<()> {
            for (cfg, counter) in plan.workers.iter().zip(&counters) {
                handles.push(spawn_worker(
                    cfg.clone(),
                    Arc::clone(&queues),
                    Arc::clone(&worker_ctx),
                    Arc::clone(counter),
                )?);
            }
            Ok(())
        };

        let mut handles = Vec::with_capacity(plan.workers.len());
        let tasks_total;
        match self.config.queue_mode {
            QueueMode::StaticSeed => {
                tasks_total = self.seed_tasks(desc, len, &queues, &plan)?;
                for queue in queues.iter() {
                    queue.close();
                }
                spawn_all(&mut handles)?;
            }
            QueueMode::Dynamic => {
                spawn_all(&mut handles)?;
                tasks_total = self.seed_tasks(desc, len, &queues, &plan)?;
                for queue in queues.iter() {
                    queue.close();
                }
            }
        }

        let mut first_error: Option<TesselError> = None;
        for (id, handle) in handles.into_iter().enumerate() {
            match handle.join() {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(_) => {
                    first_error.get_or_insert(
                        tessel_common::SchedulerError::WorkerPanicked { id }.into(),
                    );
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let results = sink.drain();
        combine_outputs(outputs, &desc.combines, &results)?;

        let stats = RunStats {
            tasks_total,
            tasks_per_worker: counters.iter().map(|c| c.tasks.load(Ordering::Relaxed)).collect(),
            steals: counters.iter().map(|c| c.steals.load(Ordering::Relaxed)).sum(),
            elapsed: started.elapsed(),
        };
        let level = if self.config.verbose { log::Level::Info } else { log::Level::Debug };
        log::log!(
            level,
            "pipeline complete: {} tasks over {} workers ({} steals) in {:?}",
            stats.tasks_total,
            stats.tasks_per_worker.len(),
            stats.steals,
            stats.elapsed
        );
        *locked(&self.last_stats) = Some(stats);
        Ok(())
    }

    /// Validate the descriptor and return the work extent (the shared row
    /// count of the ROWS-split inputs).
    fn validate(
        &self,
        desc: &PipelineDesc<T>,
        outputs: &[Option<MatrixValue<T>>],
    ) -> Result<usize> {
        if desc.funcs.is_empty() {
            return Err(TesselError::Config("at least one pipeline function is required".into()));
        }
        if desc.inputs.len() != desc.splits.len() {
            return Err(TesselError::Config(format!(
                "{} inputs but {} split descriptors",
                desc.inputs.len(),
                desc.splits.len()
            )));
        }
        let num_outputs = desc.combines.len();
        if outputs.len() != num_outputs
            || desc.out_shapes.len() != num_outputs
            || desc.out_rows.len() != num_outputs
            || desc.out_cols.len() != num_outputs
            || desc.scalar_outputs.len() != num_outputs
        {
            return Err(TesselError::Config(
                "output slot, shape, combine, dimension, and scalar lists must have equal length"
                    .into(),
            ));
        }

        let mut len: Option<usize> = None;
        for (input, split) in desc.inputs.iter().zip(&desc.splits) {
            if *split == SplitKind::Rows {
                let rows = input.num_rows();
                match len {
                    None => len = Some(rows),
                    Some(prev) if prev != rows => {
                        return Err(TesselError::Config(format!(
                            "ROWS-split inputs disagree on row count ({prev} vs {rows})"
                        )));
                    }
                    Some(_) => {}
                }
            }
        }
        let len = len.ok_or_else(|| {
            TesselError::Config("at least one ROWS-split input is required".into())
        })?;
        if len == 0 {
            return Err(TesselError::Config("ROWS-split inputs are empty".into()));
        }

        for (idx, (shape, combine)) in desc.out_shapes.iter().zip(&desc.combines).enumerate() {
            if *shape == OutputShape::Csr
                && !matches!(combine, CombineKind::Rows | CombineKind::None)
            {
                return Err(TesselError::Config(format!(
                    "output {idx}: CSR outputs combine only by row concatenation ({combine:?} given)"
                )));
            }
            if *combine == CombineKind::Add
                && (desc.out_rows[idx].is_none() || desc.out_cols[idx].is_none())
            {
                return Err(TesselError::Config(format!(
                    "output {idx}: summed outputs need known dimensions"
                )));
            }
        }
        Ok(len)
    }

    /// Work extent and bytes the row-split inputs occupy; broadcasting means
    /// every input has to be checked.
    fn input_properties(&self, desc: &PipelineDesc<T>) -> (usize, usize) {
        let mut len = 0;
        let mut mem_required = 0;
        for (input, split) in desc.inputs.iter().zip(&desc.splits) {
            if *split == SplitKind::Rows {
                len = len.max(input.num_rows());
                mem_required += input.num_items() * std::mem::size_of::<T>();
            }
        }
        (len, mem_required)
    }

    /// Pre-allocate every dense output whose final dimensions are known,
    /// returning the bytes allocated. CSR finals are assembled by the
    /// combiner once the per-task nnz is known.
    fn allocate_outputs(
        &self,
        desc: &PipelineDesc<T>,
        outputs: &mut [Option<MatrixValue<T>>],
    ) -> Result<usize> {
        let mut mem_required = 0;
        for (idx, slot) in outputs.iter_mut().enumerate() {
            if slot.is_none() && desc.out_shapes[idx] == OutputShape::Dense {
                if let (Some(rows), Some(cols)) = (desc.out_rows[idx], desc.out_cols[idx]) {
                    let matrix = DenseMatrix::zeroed(rows, cols)?;
                    mem_required += matrix.buffer_size();
                    *slot = Some(MatrixValue::Dense(matrix));
                }
            }
        }
        Ok(mem_required)
    }

    /// The accelerator context to use for this run, if any. A configuration
    /// that asks for an accelerator without one registered falls back to
    /// CPU-only execution with a diagnostic.
    fn effective_accel(&self) -> Option<Arc<dyn AccelContext<T>>> {
        if !self.config.use_accelerator {
            return None;
        }
        match &self.accel {
            Some(accel) => Some(Arc::clone(accel)),
            None => {
                log::warn!("accelerator requested but not available, running CPU-only");
                None
            }
        }
    }

    /// Prefetch the row-split inputs to the device when the pipeline's
    /// buffers fit the budget.
    fn prefetch_inputs(
        &self,
        desc: &PipelineDesc<T>,
        accel: &dyn AccelContext<T>,
        mem_required: usize,
    ) -> Result<()> {
        let budget = accel.mem_budget().max(1);
        let buffer_usage = mem_required as f64 / budget as f64;
        log::debug!(
            "pipeline in/out buffer usage: {buffer_usage:.3} of {} ({})",
            budget,
            accel.device_info()
        );
        if buffer_usage < 1.0 {
            for (input, split) in desc.inputs.iter().zip(&desc.splits) {
                if *split == SplitKind::Rows {
                    accel.prefetch_rows(input, 0..input.num_rows())?;
                }
            }
        }
        Ok(())
    }

    // ── Queue/worker planning and seeding ───────────────────────────

    fn plan(&self, layout: QueueLayout, with_accel: bool, num_funcs: usize) -> RunPlan {
        let unique = &self.topology.unique_threads;
        let pin = |i: usize| -> Option<usize> {
            if self.config.pin_workers && !unique.is_empty() {
                Some(unique[i % unique.len()])
            } else {
                None
            }
        };
        let socket_of = |i: usize| -> usize {
            if unique.is_empty() {
                0
            } else {
                self.topology.socket_index_of(unique[i % unique.len()])
            }
        };

        match layout {
            QueueLayout::Single => {
                let workers = (0..self.num_cpu_workers)
                    .map(|i| WorkerConfig {
                        id: i,
                        role: WorkerRole::Cpu,
                        home_queue: 0,
                        pin_to: pin(i),
                        steal_policy: self.config.steal_policy,
                        steal_targets: Vec::new(),
                        queue_sockets: vec![0],
                        socket: 0,
                    })
                    .collect();
                RunPlan { num_queues: 1, workers, seed: SeedPlan::RoundRobin { queues: 1 } }
            }
            QueueLayout::PerCpu => {
                let num_queues = self.num_cpu_workers;
                let queue_sockets: Vec<usize> = (0..num_queues).map(socket_of).collect();
                let workers = (0..self.num_cpu_workers)
                    .map(|i| WorkerConfig {
                        id: i,
                        role: WorkerRole::Cpu,
                        home_queue: i,
                        pin_to: pin(i),
                        steal_policy: self.config.steal_policy,
                        steal_targets: (0..num_queues).filter(|&q| q != i).collect(),
                        queue_sockets: queue_sockets.clone(),
                        socket: socket_of(i),
                    })
                    .collect();
                RunPlan {
                    num_queues,
                    workers,
                    seed: SeedPlan::RoundRobin { queues: num_queues },
                }
            }
            QueueLayout::PerGroup => {
                let num_queues = self.topology.num_sockets().max(1);
                // Queue s belongs to socket s; LOCAL_FIRST degenerates to the
                // home socket, so stealing order is simply across sockets.
                let queue_sockets: Vec<usize> = (0..num_queues).collect();
                let workers = (0..self.num_cpu_workers)
                    .map(|i| {
                        let home = socket_of(i).min(num_queues - 1);
                        WorkerConfig {
                            id: i,
                            role: WorkerRole::Cpu,
                            home_queue: home,
                            pin_to: pin(i),
                            steal_policy: self.config.steal_policy,
                            steal_targets: (0..num_queues).filter(|&q| q != home).collect(),
                            queue_sockets: queue_sockets.clone(),
                            socket: socket_of(i),
                        }
                    })
                    .collect();
                RunPlan {
                    num_queues,
                    workers,
                    seed: SeedPlan::RoundRobin { queues: num_queues },
                }
            }
            QueueLayout::PerDeviceType => {
                let accel_queue = with_accel.then_some(1);
                let num_queues = if with_accel { 2 } else { 1 };
                // No stealing across device classes; each class drains its
                // own queue.
                let mut workers: Vec<WorkerConfig> = (0..self.num_cpu_workers)
                    .map(|i| WorkerConfig {
                        id: i,
                        role: WorkerRole::Cpu,
                        home_queue: 0,
                        pin_to: pin(i),
                        steal_policy: self.config.steal_policy,
                        steal_targets: Vec::new(),
                        queue_sockets: vec![0; num_queues],
                        socket: 0,
                    })
                    .collect();
                if with_accel {
                    workers.push(WorkerConfig {
                        id: self.num_cpu_workers,
                        role: WorkerRole::Accelerator,
                        home_queue: 1,
                        pin_to: None,
                        steal_policy: self.config.steal_policy,
                        steal_targets: Vec::new(),
                        queue_sockets: vec![0, 0],
                        socket: 0,
                    });
                }
                // The accelerator variant of the pipeline, when compiled.
                let accel_func = if num_funcs > 1 { 1 } else { 0 };
                RunPlan {
                    num_queues,
                    workers,
                    seed: SeedPlan::DeviceSplit { accel_queue, accel_func },
                }
            }
        }
    }

    fn seed_tasks(
        &self,
        desc: &PipelineDesc<T>,
        len: usize,
        queues: &[Arc<TaskQueue<T>>],
        plan: &RunPlan,
    ) -> Result<usize> {
        // A NONE combine means a single producing task, whatever the strategy.
        let single_task = desc.combines.contains(&CombineKind::None);
        let partitioner = if single_task {
            LoadPartitioner::new(PartitionStrategy::Static, len, 1, len)
        } else {
            // The per-worker batching hint floors the chunk size alongside
            // the configured minimum.
            LoadPartitioner::new(
                self.config.partition_strategy,
                len,
                plan.workers.len(),
                self.config.min_chunk.max(self.config.batch_size),
            )
        };

        let mut seeded = 0;
        for (i, range) in partitioner.enumerate() {
            let (queue_idx, func_idx) = match plan.seed {
                SeedPlan::RoundRobin { queues } => (i % queues, 0),
                SeedPlan::DeviceSplit { accel_queue, accel_func } => match accel_queue {
                    // Alternate chunks between the device classes.
                    Some(aq) if i % 2 == 1 => (aq, accel_func),
                    _ => (0, 0),
                },
            };
            queues[queue_idx].push(self.make_task(desc, &range, func_idx))?;
            seeded += 1;
        }
        Ok(seeded)
    }

    fn make_task(&self, desc: &PipelineDesc<T>, range: &Range<usize>, func_idx: usize) -> Task<T> {
        let inputs = desc
            .inputs
            .iter()
            .zip(&desc.splits)
            .map(|(input, split)| match split {
                SplitKind::Rows => input.view_rows(range.start, range.end),
                SplitKind::None => input.clone(),
            })
            .collect();
        Task { func_idx, row_range: range.clone(), inputs }
    }
}

/// Queue and worker layout for one run.
struct RunPlan {
    num_queues: usize,
    workers: Vec<WorkerConfig>,
    seed: SeedPlan,
}

/// Where the partitioner's chunks go.
enum SeedPlan {
    /// Chunk `i` lands on queue `i % queues`, CPU pipeline variant.
    RoundRobin { queues: usize },
    /// Chunks alternate between the CPU queue and the accelerator queue.
    DeviceSplit { accel_queue: Option<usize>, accel_func: usize },
}
