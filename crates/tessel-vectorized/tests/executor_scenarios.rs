//! End-to-end pipeline scenarios through the executor facade.

use std::sync::Arc;

use tessel_common::datagen::{gen_given_vals_csr, gen_given_vals_dense};
use tessel_common::{
    CombineKind, DenseMatrix, ExecutorConfig, MatrixValue, OutputShape, PartitionStrategy,
    QueueMode, Result, SplitKind, TesselError, ValueType,
};
use tessel_vectorized::{PipelineDesc, PipelineExecutor, PipelineFn};

/// Copies its single input into its single output.
fn identity_func<T: ValueType>() -> PipelineFn<T> {
    Arc::new(|outputs, inputs, _range, _ctx| {
        outputs[0] = Some(inputs[0].clone());
        Ok(())
    })
}

/// Unwraps the pre-zeroed dense slot an ADD-combined output provides.
fn dense_slot<'a, T: ValueType>(
    slot: &'a mut Option<MatrixValue<T>>,
) -> &'a mut DenseMatrix<T> {
    match slot.as_mut().expect("pre-zeroed dense slot") {
        MatrixValue::Dense(d) => d,
        MatrixValue::Csr(_) => panic!("dense slot expected"),
    }
}

fn desc_one_in_one_out<T: ValueType>(
    func: PipelineFn<T>,
    input: MatrixValue<T>,
    combine: CombineKind,
    shape: OutputShape,
    out_rows: Option<usize>,
    out_cols: Option<usize>,
) -> PipelineDesc<T> {
    PipelineDesc {
        funcs: vec![func],
        inputs: vec![input],
        splits: vec![SplitKind::Rows],
        combines: vec![combine],
        out_shapes: vec![shape],
        out_rows: vec![out_rows],
        out_cols: vec![out_cols],
        scalar_outputs: vec![false],
    }
}

fn config(threads: usize) -> ExecutorConfig {
    ExecutorConfig { num_threads: threads, ..Default::default() }
}

#[test]
fn dense_rows_identity_single_queue() {
    // 4x2 input, identity pipeline, 2 workers, 2 static chunks.
    let input = gen_given_vals_dense(4, &[1i64, 2, 3, 4, 5, 6, 7, 8]);
    let desc = desc_one_in_one_out(
        identity_func(),
        input.clone().into(),
        CombineKind::Rows,
        OutputShape::Dense,
        Some(4),
        Some(2),
    );
    let executor = PipelineExecutor::new(config(2));
    let mut outputs = vec![None];
    executor.execute_single_queue(&desc, &mut outputs).unwrap();

    let out = outputs[0].as_ref().unwrap().as_dense().unwrap();
    assert_eq!(out.values(), input.values());
    let stats = executor.last_stats().unwrap();
    assert_eq!(stats.tasks_total, 2);
}

#[test]
fn dense_add_combine_per_cpu_fac2() {
    // Two 6x3 inputs, element-wise-sum pipeline, 3 workers, FAC2, min_chunk 1.
    // Each task writes its chunk's sums at its global row range inside a
    // full-shape partial; the ranges are disjoint, so the summed partials
    // equal the element-wise sum irrespective of which worker ran which rows.
    let a: Vec<f64> = (0..18).map(f64::from).collect();
    let b: Vec<f64> = (0..18).map(|v| f64::from(v) * 10.0).collect();
    let expected: Vec<f64> = a.iter().zip(&b).map(|(x, y)| x + y).collect();

    let sum_inputs: PipelineFn<f64> = Arc::new(|outputs, inputs, range, _ctx| {
        let x = inputs[0].as_dense().expect("dense input");
        let y = inputs[1].as_dense().expect("dense input");
        let partial = dense_slot(&mut outputs[0]);
        let cols = partial.num_cols();
        let values = partial.values_mut();
        for r in 0..x.num_rows() {
            for c in 0..cols {
                values[(range.start + r) * cols + c] = x.get(r, c) + y.get(r, c);
            }
        }
        Ok(())
    });

    let desc = PipelineDesc {
        funcs: vec![sum_inputs],
        inputs: vec![gen_given_vals_dense(6, &a).into(), gen_given_vals_dense(6, &b).into()],
        splits: vec![SplitKind::Rows, SplitKind::Rows],
        combines: vec![CombineKind::Add],
        out_shapes: vec![OutputShape::Dense],
        out_rows: vec![Some(6)],
        out_cols: vec![Some(3)],
        scalar_outputs: vec![false],
    };
    let executor = PipelineExecutor::new(ExecutorConfig {
        num_threads: 3,
        partition_strategy: PartitionStrategy::Fac2,
        min_chunk: 1,
        ..Default::default()
    });
    let mut outputs = vec![None];
    executor.execute_queue_per_cpu(&desc, &mut outputs).unwrap();

    let out = outputs[0].as_ref().unwrap().as_dense().unwrap();
    assert_eq!(out.values(), expected.as_slice());
}

#[test]
fn csr_rows_identity_rebuilds_the_matrix() {
    // 5x4 CSR with nnz at (0,1),(1,0),(1,3),(3,2),(4,0),(4,1), values 1..6.
    #[rustfmt::skip]
    let vals = [
        0, 1, 0, 0,
        2, 0, 0, 3,
        0, 0, 0, 0,
        0, 0, 4, 0,
        5, 6, 0, 0,
    ];
    let input = gen_given_vals_csr(5, &vals);
    let desc = desc_one_in_one_out(
        identity_func(),
        input.into(),
        CombineKind::Rows,
        OutputShape::Csr,
        Some(5),
        Some(4),
    );
    let executor = PipelineExecutor::new(config(3));
    let mut outputs = vec![None];
    executor.execute_single_queue(&desc, &mut outputs).unwrap();

    let out = outputs[0].as_ref().unwrap().as_csr().unwrap();
    assert_eq!(out.values(), &[1, 2, 3, 4, 5, 6]);
    assert_eq!(out.col_idxs(), &[1, 0, 3, 2, 0, 1]);
    assert_eq!(out.row_offsets(), &[0, 1, 3, 3, 4, 6]);
}

#[test]
fn queue_layouts_agree_bitwise_for_deterministic_pipelines() {
    let values: Vec<f64> = (0..64).map(|v| f64::from(v) * 0.25).collect();
    let input = gen_given_vals_dense(16, &values);
    let scale: PipelineFn<f64> = Arc::new(|outputs, inputs, _range, _ctx| {
        let x = inputs[0].as_dense().expect("dense input");
        let scaled: Vec<f64> = x.values().iter().map(|v| v * 3.0 + 1.0).collect();
        outputs[0] =
            Some(MatrixValue::Dense(DenseMatrix::from_vec(x.num_rows(), x.num_cols(), scaled)));
        Ok(())
    });

    let run = |layout: fn(
        &PipelineExecutor<f64>,
        &PipelineDesc<f64>,
        &mut [Option<MatrixValue<f64>>],
    ) -> Result<()>|
     -> Vec<f64> {
        let desc = desc_one_in_one_out(
            scale.clone(),
            input.clone().into(),
            CombineKind::Rows,
            OutputShape::Dense,
            Some(16),
            Some(4),
        );
        let executor = PipelineExecutor::new(ExecutorConfig {
            num_threads: 4,
            partition_strategy: PartitionStrategy::Gss,
            ..Default::default()
        });
        let mut outputs = vec![None];
        layout(&executor, &desc, &mut outputs).unwrap();
        outputs[0].as_ref().unwrap().as_dense().unwrap().values().to_vec()
    };

    let single = run(PipelineExecutor::execute_single_queue);
    let per_cpu = run(PipelineExecutor::execute_queue_per_cpu);
    let per_group = run(PipelineExecutor::execute_queue_per_group);
    assert_eq!(single, per_cpu);
    assert_eq!(single, per_group);
}

#[test]
fn add_combine_agrees_across_layouts_within_float_tolerance() {
    let values: Vec<f64> = (0..40).map(|v| f64::from(v) * 0.1 + 0.3).collect();
    let input = gen_given_vals_dense(10, &values);
    // Column sums: each chunk accumulates its rows into a 1 x cols partial.
    let col_sum: PipelineFn<f64> = Arc::new(|outputs, inputs, _range, _ctx| {
        let x = inputs[0].as_dense().expect("dense input");
        let values = dense_slot(&mut outputs[0]).values_mut();
        for r in 0..x.num_rows() {
            for c in 0..x.num_cols() {
                values[c] += x.get(r, c);
            }
        }
        Ok(())
    });

    let run = |layout: fn(
        &PipelineExecutor<f64>,
        &PipelineDesc<f64>,
        &mut [Option<MatrixValue<f64>>],
    ) -> Result<()>|
     -> Vec<f64> {
        let desc = desc_one_in_one_out(
            col_sum.clone(),
            input.clone().into(),
            CombineKind::Add,
            OutputShape::Dense,
            Some(1),
            Some(4),
        );
        let executor = PipelineExecutor::new(ExecutorConfig {
            num_threads: 3,
            partition_strategy: PartitionStrategy::Gss,
            min_chunk: 2,
            ..Default::default()
        });
        let mut outputs = vec![None];
        layout(&executor, &desc, &mut outputs).unwrap();
        outputs[0].as_ref().unwrap().as_dense().unwrap().values().to_vec()
    };

    let single = run(PipelineExecutor::execute_single_queue);
    let per_cpu = run(PipelineExecutor::execute_queue_per_cpu);
    for (a, b) in single.iter().zip(&per_cpu) {
        let rel = (a - b).abs() / a.abs().max(1e-12);
        assert!(rel < 1e-12, "column sums diverged: {a} vs {b}");
    }
}

#[test]
fn dynamic_seeding_matches_static() {
    let input = gen_given_vals_dense(8, &(0..32).map(f64::from).collect::<Vec<_>>());
    let make_desc = || {
        desc_one_in_one_out(
            identity_func(),
            input.clone().into(),
            CombineKind::Rows,
            OutputShape::Dense,
            Some(8),
            Some(4),
        )
    };
    let static_exec = PipelineExecutor::new(config(2));
    let dynamic_exec = PipelineExecutor::new(ExecutorConfig {
        num_threads: 2,
        queue_mode: QueueMode::Dynamic,
        ..Default::default()
    });
    let mut static_out = vec![None];
    let mut dynamic_out = vec![None];
    static_exec.execute_single_queue(&make_desc(), &mut static_out).unwrap();
    dynamic_exec.execute_single_queue(&make_desc(), &mut dynamic_out).unwrap();
    assert_eq!(
        static_out[0].as_ref().unwrap().as_dense().unwrap().values(),
        dynamic_out[0].as_ref().unwrap().as_dense().unwrap().values()
    );
}

#[test]
fn pipeline_failure_propagates_first_error() {
    let input = gen_given_vals_dense(8, &[0i64; 16]);
    let failing: PipelineFn<i64> = Arc::new(|_outputs, _inputs, _range, _ctx| {
        Err(TesselError::Config("kernel rejected chunk".into()))
    });
    let desc = desc_one_in_one_out(
        failing,
        input.into(),
        CombineKind::Rows,
        OutputShape::Dense,
        Some(8),
        Some(2),
    );
    let executor = PipelineExecutor::new(config(2));
    let mut outputs = vec![None];
    let err = executor.execute_single_queue(&desc, &mut outputs).unwrap_err();
    assert!(err.to_string().contains("kernel rejected chunk"));
}

#[test]
fn mismatched_row_split_inputs_are_rejected() {
    let a = gen_given_vals_dense(4, &[0i64; 8]);
    let b = gen_given_vals_dense(6, &[0i64; 12]);
    let desc = PipelineDesc {
        funcs: vec![identity_func()],
        inputs: vec![a.into(), b.into()],
        splits: vec![SplitKind::Rows, SplitKind::Rows],
        combines: vec![CombineKind::Rows],
        out_shapes: vec![OutputShape::Dense],
        out_rows: vec![Some(4)],
        out_cols: vec![Some(2)],
        scalar_outputs: vec![false],
    };
    let executor = PipelineExecutor::new(config(2));
    let err = executor.execute_single_queue(&desc, &mut [None]).unwrap_err();
    assert!(err.to_string().contains("disagree"));
}

#[test]
fn csr_output_with_add_combine_is_rejected() {
    let input = gen_given_vals_dense(4, &[1i64; 8]);
    let desc = desc_one_in_one_out(
        identity_func(),
        input.into(),
        CombineKind::Add,
        OutputShape::Csr,
        Some(4),
        Some(2),
    );
    let executor = PipelineExecutor::new(config(2));
    let err = executor.execute_single_queue(&desc, &mut [None]).unwrap_err();
    assert!(err.to_string().contains("CSR"));
}

#[test]
fn per_group_layout_follows_an_injected_topology() {
    use std::io::Write;

    // Two sockets, two cores each; workers pin to one thread per core.
    let mut cpuinfo = tempfile::NamedTempFile::new().unwrap();
    for (processor, physical, core) in [(0, 0, 0), (1, 0, 1), (2, 1, 0), (3, 1, 1)] {
        writeln!(cpuinfo, "processor\t: {processor}").unwrap();
        writeln!(cpuinfo, "physical id\t: {physical}").unwrap();
        writeln!(cpuinfo, "core id\t\t: {core}").unwrap();
        writeln!(cpuinfo).unwrap();
    }
    cpuinfo.flush().unwrap();

    let input = gen_given_vals_dense(12, &(0..24).map(f64::from).collect::<Vec<_>>());
    let desc = desc_one_in_one_out(
        identity_func(),
        input.clone().into(),
        CombineKind::Rows,
        OutputShape::Dense,
        Some(12),
        Some(2),
    );
    let executor: PipelineExecutor<f64> = PipelineExecutor::new(ExecutorConfig {
        num_threads: 4,
        cpuinfo_path: cpuinfo.path().to_path_buf(),
        ..Default::default()
    });
    assert_eq!(executor.topology().num_sockets(), 2);
    assert_eq!(executor.topology().unique_threads, vec![0, 1, 2, 3]);

    let mut outputs = vec![None];
    executor.execute_queue_per_group(&desc, &mut outputs).unwrap();
    let out = outputs[0].as_ref().unwrap().as_dense().unwrap();
    assert_eq!(out.values(), input.values());
}

#[test]
fn broadcast_inputs_reach_every_task_unsplit() {
    // A ROWS-split 6x2 input plus a broadcast 1x2 bias added to every row.
    let input = gen_given_vals_dense(6, &(0..12).map(f64::from).collect::<Vec<_>>());
    let bias = gen_given_vals_dense(1, &[100.0f64, 200.0]);
    let add_bias: PipelineFn<f64> = Arc::new(|outputs, inputs, _range, _ctx| {
        let x = inputs[0].as_dense().expect("dense input");
        let bias = inputs[1].as_dense().expect("dense input");
        let mut values = x.values().to_vec();
        for r in 0..x.num_rows() {
            for c in 0..x.num_cols() {
                values[r * x.num_cols() + c] += bias.get(0, c);
            }
        }
        outputs[0] =
            Some(MatrixValue::Dense(DenseMatrix::from_vec(x.num_rows(), x.num_cols(), values)));
        Ok(())
    });
    let desc = PipelineDesc {
        funcs: vec![add_bias],
        inputs: vec![input.into(), bias.into()],
        splits: vec![SplitKind::Rows, SplitKind::None],
        combines: vec![CombineKind::Rows],
        out_shapes: vec![OutputShape::Dense],
        out_rows: vec![Some(6)],
        out_cols: vec![Some(2)],
        scalar_outputs: vec![false],
    };
    let executor = PipelineExecutor::new(config(3));
    let mut outputs = vec![None];
    executor.execute_queue_per_cpu(&desc, &mut outputs).unwrap();
    let out = outputs[0].as_ref().unwrap().as_dense().unwrap();
    assert_eq!(out.get(0, 0), 100.0);
    assert_eq!(out.get(5, 1), 211.0);
}
