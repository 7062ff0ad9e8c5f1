//! The unit of scheduling: one pipeline invocation on one row slice.

use std::ops::Range;
use std::sync::Arc;

use tessel_common::{MatrixValue, Result, ValueType};

use crate::accel::AccelContext;

/// Immutable description of one chunk of pipeline work.
///
/// Inputs are pre-sliced by the scheduler at seed time: ROWS-split inputs are
/// zero-copy views of `row_range`, broadcast inputs are cheap clones of the
/// full handle. All ROWS-split inputs of one task share identical bounds.
#[derive(Debug, Clone)]
pub struct Task<T> {
    /// Index into the pipeline-function vector.
    pub func_idx: usize,
    /// Output row range this task is responsible for.
    pub row_range: Range<usize>,
    pub inputs: Vec<MatrixValue<T>>,
}

/// Shared state passed to every pipeline invocation.
pub struct PipelineContext<T: ValueType> {
    pub accel: Option<Arc<dyn AccelContext<T>>>,
    pub verbose: bool,
}

/// A compiled pipeline function.
///
/// Receives one slot per output, the task's input views, and the task's
/// output row range. For outputs that combine by concatenation the slot
/// starts empty and the function stores a fresh chunk-shaped matrix; for
/// element-wise-summed outputs the slot holds a pre-zeroed buffer of the
/// final shape that the function accumulates its chunk's contribution into —
/// the row range tells it where that contribution lands.
pub type PipelineFn<T> = Arc<
    dyn Fn(
            &mut [Option<MatrixValue<T>>],
            &[MatrixValue<T>],
            Range<usize>,
            &PipelineContext<T>,
        ) -> Result<()>
        + Send
        + Sync,
>;
