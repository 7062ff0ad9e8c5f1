//! Shared value and descriptor types

use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::ops::AddAssign;

/// Element types that matrices may carry.
///
/// `Default::default()` must be the additive zero, which holds for every
/// numeric primitive this is implemented for.
pub trait ValueType:
    Copy + Default + Send + Sync + PartialEq + PartialOrd + Debug + AddAssign + 'static
{
}

impl ValueType for f32 {}
impl ValueType for f64 {}
impl ValueType for i8 {}
impl ValueType for i16 {}
impl ValueType for i32 {}
impl ValueType for i64 {}
impl ValueType for u8 {}
impl ValueType for u16 {}
impl ValueType for u32 {}
impl ValueType for u64 {}
impl ValueType for usize {}

/// How an input is divided across tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SplitKind {
    /// Partitioned into contiguous row ranges, one per task.
    Rows,
    /// Broadcast unchanged to every task.
    None,
}

/// How per-task outputs merge into the final output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CombineKind {
    /// Task outputs concatenate into disjoint row ranges of the final output.
    Rows,
    /// Task outputs concatenate into disjoint column ranges of the final output.
    Cols,
    /// Task outputs are element-wise summed into a zero-initialized final buffer.
    Add,
    /// Single producing task; its output becomes the final output.
    None,
}

/// Storage layout of a matrix output, carried at runtime so the scheduler can
/// select the matching allocation and combine discipline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputShape {
    Dense,
    Csr,
}
