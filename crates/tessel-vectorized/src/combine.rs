//! Combining per-task outputs into final matrices.
//!
//! Dense outputs support all four combine kinds; CSR outputs only row
//! concatenation and pass-through. Row/column concatenation validates that
//! the task ranges cover the output contiguously — a gap or overlap here
//! means the scheduler mis-partitioned and is fatal for the pipeline.

use std::ops::Range;

use rayon::prelude::*;

use tessel_common::{
    AllocationError, CombineKind, CsrMatrix, DenseMatrix, MatrixValue, PipelineError, Result,
    ValueType,
};

use crate::sink::TaskResult;

/// One output's partial from one task: the producing row range and the matrix.
type Part<'a, T> = (Range<usize>, &'a MatrixValue<T>);

/// Combine every output of a finished run.
///
/// `results` is the drained sink; `outputs[i]` holds the pre-allocated final
/// matrix where dimensions were known, and is filled in here otherwise.
pub fn combine_outputs<T: ValueType>(
    outputs: &mut [Option<MatrixValue<T>>],
    combines: &[CombineKind],
    results: &[TaskResult<T>],
) -> Result<()> {
    for (idx, combine) in combines.iter().enumerate() {
        let mut parts: Vec<Part<'_, T>> = Vec::with_capacity(results.len());
        for result in results {
            match &result.outputs[idx] {
                Some(m) => parts.push((result.row_range.clone(), m)),
                None => return Err(PipelineError::MissingOutput { index: idx }.into()),
            }
        }
        // Deterministic assembly regardless of execution order.
        parts.sort_by_key(|(range, _)| range.start);

        match combine {
            CombineKind::None => {
                outputs[idx] = Some(NoopCombiner::take(idx, &parts)?);
            }
            CombineKind::Add => combine_dense_add(outputs, idx, &parts)?,
            CombineKind::Rows => match parts.first() {
                Some((_, MatrixValue::Csr(_))) => {
                    outputs[idx] = Some(MatrixValue::Csr(CsrRowsCombiner::concat(idx, &parts)?));
                }
                _ => combine_dense_rows(outputs, idx, &parts)?,
            },
            CombineKind::Cols => combine_dense_cols(outputs, idx, &parts)?,
        }
    }
    Ok(())
}

/// Pass-through for NONE combines: the single producing task's output becomes
/// the final output.
pub struct NoopCombiner;

impl NoopCombiner {
    pub fn take<T: ValueType>(idx: usize, parts: &[Part<'_, T>]) -> Result<MatrixValue<T>> {
        match parts {
            [(_, only)] => Ok((*only).clone()),
            _ => Err(PipelineError::CombineFailed {
                index: idx,
                reason: format!("expected exactly one producing task, found {}", parts.len()),
            }
            .into()),
        }
    }
}

/// Validate that `parts` cover `0..expected_total` contiguously, in order.
fn check_coverage<T: ValueType>(
    idx: usize,
    parts: &[Part<'_, T>],
    expected_total: Option<usize>,
    what: &str,
) -> Result<usize> {
    let mut covered = 0;
    for (range, _) in parts {
        if range.start != covered {
            return Err(PipelineError::CombineFailed {
                index: idx,
                reason: format!(
                    "task {what} ranges leave a gap or overlap at {covered} (next is {}..{})",
                    range.start, range.end
                ),
            }
            .into());
        }
        covered = range.end;
    }
    if let Some(total) = expected_total {
        if covered != total {
            return Err(PipelineError::CombineFailed {
                index: idx,
                reason: format!("task {what} ranges cover 0..{covered}, output needs 0..{total}"),
            }
            .into());
        }
    }
    Ok(covered)
}

fn expect_dense<'a, T: ValueType>(idx: usize, m: &'a MatrixValue<T>) -> Result<&'a DenseMatrix<T>> {
    m.as_dense().ok_or_else(|| {
        PipelineError::CombineFailed { index: idx, reason: "expected a dense partial".into() }
            .into()
    })
}

fn combine_dense_rows<T: ValueType>(
    outputs: &mut [Option<MatrixValue<T>>],
    idx: usize,
    parts: &[Part<'_, T>],
) -> Result<()> {
    let total_rows = check_coverage(idx, parts, final_rows(&outputs[idx]), "row")?;
    let mut final_matrix = match outputs[idx].take() {
        Some(MatrixValue::Dense(m)) => m,
        Some(MatrixValue::Csr(_)) => {
            return Err(PipelineError::CombineFailed {
                index: idx,
                reason: "dense partials cannot fill a CSR output".into(),
            }
            .into())
        }
        // Dimensions were unknown up front; size the output from the partials.
        None => match parts.first() {
            Some((_, first)) => DenseMatrix::zeroed(total_rows, first.num_cols())?,
            None => return Err(AllocationError::UnknownDims { index: idx }.into()),
        },
    };

    let cols = final_matrix.num_cols();
    let values = final_matrix.values_mut();
    for (range, m) in parts {
        let partial = expect_dense(idx, m)?;
        if partial.num_rows() != range.len() || partial.num_cols() != cols {
            return Err(PipelineError::CombineFailed {
                index: idx,
                reason: format!(
                    "partial for rows {}..{} is {}x{}, expected {}x{cols}",
                    range.start,
                    range.end,
                    partial.num_rows(),
                    partial.num_cols(),
                    range.len()
                ),
            }
            .into());
        }
        values[range.start * cols..range.end * cols].copy_from_slice(partial.values());
    }
    outputs[idx] = Some(MatrixValue::Dense(final_matrix));
    Ok(())
}

fn combine_dense_cols<T: ValueType>(
    outputs: &mut [Option<MatrixValue<T>>],
    idx: usize,
    parts: &[Part<'_, T>],
) -> Result<()> {
    let total_cols = check_coverage(idx, parts, final_cols(&outputs[idx]), "column")?;
    let mut final_matrix = match outputs[idx].take() {
        Some(MatrixValue::Dense(m)) => m,
        Some(MatrixValue::Csr(_)) => {
            return Err(PipelineError::CombineFailed {
                index: idx,
                reason: "column concatenation is dense-only".into(),
            }
            .into())
        }
        None => match parts.first() {
            Some((_, first)) => DenseMatrix::zeroed(first.num_rows(), total_cols)?,
            None => return Err(AllocationError::UnknownDims { index: idx }.into()),
        },
    };

    let rows = final_matrix.num_rows();
    let cols = final_matrix.num_cols();
    let values = final_matrix.values_mut();
    for (range, m) in parts {
        let partial = expect_dense(idx, m)?;
        if partial.num_rows() != rows || partial.num_cols() != range.len() {
            return Err(PipelineError::CombineFailed {
                index: idx,
                reason: format!(
                    "partial for columns {}..{} is {}x{}, expected {rows}x{}",
                    range.start,
                    range.end,
                    partial.num_rows(),
                    partial.num_cols(),
                    range.len()
                ),
            }
            .into());
        }
        let width = range.len();
        for r in 0..rows {
            values[r * cols + range.start..r * cols + range.end]
                .copy_from_slice(&partial.row(r)[..width]);
        }
    }
    outputs[idx] = Some(MatrixValue::Dense(final_matrix));
    Ok(())
}

/// Element-wise sum of full-shape partials into the zero-initialized final
/// buffer. Summation is commutative here, so execution order never shows.
fn combine_dense_add<T: ValueType>(
    outputs: &mut [Option<MatrixValue<T>>],
    idx: usize,
    parts: &[Part<'_, T>],
) -> Result<()> {
    let mut final_matrix = match outputs[idx].take() {
        Some(MatrixValue::Dense(m)) => m,
        _ => {
            return Err(PipelineError::CombineFailed {
                index: idx,
                reason: "summed outputs need a pre-allocated dense buffer".into(),
            }
            .into())
        }
    };
    let rows = final_matrix.num_rows();
    let cols = final_matrix.num_cols();
    for (range, m) in parts {
        let partial = expect_dense(idx, m)?;
        if partial.num_rows() != rows || partial.num_cols() != cols {
            return Err(PipelineError::CombineFailed {
                index: idx,
                reason: format!(
                    "summed partial for rows {}..{} is {}x{}, expected the full {rows}x{cols}",
                    range.start,
                    range.end,
                    partial.num_rows(),
                    partial.num_cols()
                ),
            }
            .into());
        }
        final_matrix
            .values_mut()
            .par_chunks_mut(cols)
            .zip(partial.values().par_chunks(cols))
            .for_each(|(dst_row, src_row)| {
                for (dst, src) in dst_row.iter_mut().zip(src_row) {
                    *dst += *src;
                }
            });
    }
    outputs[idx] = Some(MatrixValue::Dense(final_matrix));
    Ok(())
}

/// Concatenates per-task CSR partials into one matrix: sizes the final value
/// and column-index arrays from the summed nnz, copies each task's slot, and
/// rebuilds the row offsets as the prefix sum of per-row nnz.
pub struct CsrRowsCombiner;

impl CsrRowsCombiner {
    pub fn concat<T: ValueType>(idx: usize, parts: &[Part<'_, T>]) -> Result<CsrMatrix<T>> {
        let total_rows = check_coverage(idx, parts, None, "row")?;
        let mut total_nnz = 0;
        let mut cols = None;
        for (range, m) in parts {
            let partial = m
                .as_csr()
                .ok_or_else(|| combine_err(idx, "expected a CSR partial for row concatenation"))?;
            if partial.num_rows() != range.len() || *cols.get_or_insert(partial.num_cols()) != partial.num_cols() {
                return Err(combine_err(
                    idx,
                    &format!(
                        "CSR partial for rows {}..{} is {}x{}",
                        range.start,
                        range.end,
                        partial.num_rows(),
                        partial.num_cols()
                    ),
                ));
            }
            total_nnz += partial.nnz();
        }
        let cols = cols.unwrap_or(0);

        let mut values = Vec::new();
        values.try_reserve_exact(total_nnz).map_err(|_| AllocationError::Reserve {
            what: "csr values",
            bytes: total_nnz * std::mem::size_of::<T>(),
        })?;
        let mut col_idxs = Vec::new();
        col_idxs.try_reserve_exact(total_nnz).map_err(|_| AllocationError::Reserve {
            what: "csr column indices",
            bytes: total_nnz * std::mem::size_of::<usize>(),
        })?;
        let mut row_offsets = Vec::with_capacity(total_rows + 1);
        row_offsets.push(0);

        for (_, m) in parts {
            let partial = m
                .as_csr()
                .ok_or_else(|| combine_err(idx, "expected a CSR partial for row concatenation"))?;
            values.extend_from_slice(partial.values());
            col_idxs.extend_from_slice(partial.col_idxs());
            for r in 0..partial.num_rows() {
                let prev = row_offsets[row_offsets.len() - 1];
                row_offsets.push(prev + partial.row_nnz(r));
            }
        }
        debug_assert_eq!(row_offsets[total_rows], total_nnz);

        CsrMatrix::from_raw(total_rows, cols, values, col_idxs, row_offsets)
    }
}

fn combine_err(idx: usize, reason: &str) -> tessel_common::TesselError {
    PipelineError::CombineFailed { index: idx, reason: reason.to_string() }.into()
}

fn final_rows<T: ValueType>(output: &Option<MatrixValue<T>>) -> Option<usize> {
    output.as_ref().map(MatrixValue::num_rows)
}

fn final_cols<T: ValueType>(output: &Option<MatrixValue<T>>) -> Option<usize> {
    output.as_ref().map(MatrixValue::num_cols)
}
