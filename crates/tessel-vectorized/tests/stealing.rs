//! Work-stealing progress, composed from the public queue/worker layers so a
//! skewed seeding can be forced.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tessel_common::datagen::gen_given_vals_dense;
use tessel_common::{CombineKind, MatrixValue, SplitKind, StealPolicy};
use tessel_vectorized::worker::{spawn_worker, WorkerContext, WorkerCounters};
use tessel_vectorized::{
    OutputSink, PipelineContext, PipelineFn, Task, TaskQueue, WorkerConfig, WorkerRole,
};

fn busy_identity() -> PipelineFn<i64> {
    Arc::new(|outputs, inputs, _range, _ctx| {
        // A little arithmetic so tasks take measurable time to execute.
        let x = inputs[0].as_dense().expect("dense input");
        let mut acc = 0i64;
        for _ in 0..200_000 {
            for v in x.values() {
                acc = acc.wrapping_add(*v);
            }
        }
        std::hint::black_box(acc);
        outputs[0] = Some(inputs[0].clone());
        Ok(())
    })
}

#[test]
fn all_workers_execute_when_one_queue_holds_everything() {
    const WORKERS: usize = 4;
    const TASKS: usize = 32;

    let input: MatrixValue<i64> =
        gen_given_vals_dense(TASKS, &(0..TASKS as i64 * 2).collect::<Vec<_>>()).into();

    // Every task lands on worker 0's queue; the other queues start empty.
    let queues: Arc<Vec<Arc<TaskQueue<i64>>>> =
        Arc::new((0..WORKERS).map(|_| Arc::new(TaskQueue::new())).collect());
    for i in 0..TASKS {
        queues[0]
            .push(Task {
                func_idx: 0,
                row_range: i..i + 1,
                inputs: vec![input.view_rows(i, i + 1)],
            })
            .unwrap();
    }
    for queue in queues.iter() {
        queue.close();
    }

    let ctx = Arc::new(WorkerContext {
        funcs: vec![busy_identity()],
        splits: vec![SplitKind::Rows],
        combines: vec![CombineKind::Rows],
        out_rows: vec![Some(TASKS)],
        out_cols: vec![Some(2)],
        sink: Arc::new(OutputSink::new()),
        pipeline_ctx: Arc::new(PipelineContext { accel: None, verbose: false }),
    });

    let counters: Vec<Arc<WorkerCounters>> =
        (0..WORKERS).map(|_| Arc::new(WorkerCounters::default())).collect();
    let handles: Vec<_> = (0..WORKERS)
        .map(|id| {
            spawn_worker(
                WorkerConfig {
                    id,
                    role: WorkerRole::Cpu,
                    home_queue: id,
                    pin_to: None,
                    steal_policy: StealPolicy::Sequential,
                    steal_targets: (0..WORKERS).filter(|&q| q != id).collect(),
                    queue_sockets: vec![0; WORKERS],
                    socket: 0,
                },
                Arc::clone(&queues),
                Arc::clone(&ctx),
                Arc::clone(&counters[id]),
            )
            .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker must not panic").unwrap();
    }

    let per_worker: Vec<usize> =
        counters.iter().map(|c| c.tasks.load(Ordering::Relaxed)).collect();
    assert_eq!(per_worker.iter().sum::<usize>(), TASKS);
    assert_eq!(ctx.sink.len(), TASKS);
    // With the only loaded queue being worker 0's, everyone else progressed
    // purely by stealing.
    for (id, &tasks) in per_worker.iter().enumerate() {
        assert!(tasks > 0, "worker {id} executed nothing: {per_worker:?}");
    }
    let steals: usize = counters.iter().map(|c| c.steals.load(Ordering::Relaxed)).sum();
    assert!(steals >= WORKERS - 1, "expected at least {} steals, saw {steals}", WORKERS - 1);
}

#[test]
fn random_policy_also_drains_everything() {
    const WORKERS: usize = 3;
    const TASKS: usize = 12;

    let input: MatrixValue<i64> =
        gen_given_vals_dense(TASKS, &(0..TASKS as i64).collect::<Vec<_>>()).into();
    let queues: Arc<Vec<Arc<TaskQueue<i64>>>> =
        Arc::new((0..WORKERS).map(|_| Arc::new(TaskQueue::new())).collect());
    for i in 0..TASKS {
        queues[0]
            .push(Task {
                func_idx: 0,
                row_range: i..i + 1,
                inputs: vec![input.view_rows(i, i + 1)],
            })
            .unwrap();
    }
    for queue in queues.iter() {
        queue.close();
    }

    let ctx = Arc::new(WorkerContext {
        funcs: vec![busy_identity()],
        splits: vec![SplitKind::Rows],
        combines: vec![CombineKind::Rows],
        out_rows: vec![Some(TASKS)],
        out_cols: vec![Some(1)],
        sink: Arc::new(OutputSink::new()),
        pipeline_ctx: Arc::new(PipelineContext { accel: None, verbose: false }),
    });
    let handles: Vec<_> = (0..WORKERS)
        .map(|id| {
            spawn_worker(
                WorkerConfig {
                    id,
                    role: WorkerRole::Cpu,
                    home_queue: id,
                    pin_to: None,
                    steal_policy: StealPolicy::Random,
                    steal_targets: (0..WORKERS).filter(|&q| q != id).collect(),
                    queue_sockets: vec![0; WORKERS],
                    socket: 0,
                },
                Arc::clone(&queues),
                Arc::clone(&ctx),
                Arc::new(WorkerCounters::default()),
            )
            .unwrap()
        })
        .collect();
    for handle in handles {
        handle.join().expect("worker must not panic").unwrap();
    }
    assert_eq!(ctx.sink.len(), TASKS);
}
