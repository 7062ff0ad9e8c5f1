//! Collection point for per-task pipeline outputs.
//!
//! Workers push one [`TaskResult`] per executed task; the scheduler drains
//! the sink after joining the workers, which establishes the happens-before
//! the combiners rely on.

use std::ops::Range;
use std::sync::Mutex;

use tessel_common::MatrixValue;

use crate::locked;

/// One task's outputs, tagged with the row range that produced them.
#[derive(Debug)]
pub struct TaskResult<T> {
    pub row_range: Range<usize>,
    /// One slot per pipeline output, in output order.
    pub outputs: Vec<Option<MatrixValue<T>>>,
}

/// Thread-safe sink for task results.
pub struct OutputSink<T> {
    results: Mutex<Vec<TaskResult<T>>>,
}

impl<T> OutputSink<T> {
    pub fn new() -> Self {
        Self { results: Mutex::new(Vec::new()) }
    }

    pub fn push(&self, result: TaskResult<T>) {
        locked(&self.results).push(result);
    }

    pub fn len(&self) -> usize {
        locked(&self.results).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take all collected results, leaving the sink empty.
    pub fn drain(&self) -> Vec<TaskResult<T>> {
        std::mem::take(&mut *locked(&self.results))
    }
}

impl<T> Default for OutputSink<T> {
    fn default() -> Self {
        Self::new()
    }
}
