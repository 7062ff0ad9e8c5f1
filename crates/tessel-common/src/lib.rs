//! Common types, traits, and utilities for the Tessel vectorized runtime
//!
//! This crate provides the foundational pieces used across the workspace:
//! the error hierarchy, executor configuration, the dense and sparse (CSR)
//! matrix data structures with row-view semantics, and small test-data
//! generators.

pub mod config;
pub mod datagen;
pub mod error;
pub mod math;
pub mod matrix;
pub mod types;

pub use config::{ExecutorConfig, PartitionStrategy, QueueLayout, QueueMode, StealPolicy};
pub use error::{
    AcceleratorError, AllocationError, PipelineError, Result, SchedulerError, TesselError,
    TopologyError,
};
pub use math::ceil_div;
pub use matrix::{CsrMatrix, DenseMatrix, MatrixValue};
pub use types::{CombineKind, OutputShape, SplitKind, ValueType};
