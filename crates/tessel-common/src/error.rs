//! Error types and handling

use thiserror::Error;

/// Main Tessel error type
#[derive(Error, Debug)]
pub enum TesselError {
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("allocation error: {0}")]
    Allocation(#[from] AllocationError),
    #[error("pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("accelerator error: {0}")]
    Accelerator(#[from] AcceleratorError),
    #[error("scheduler error: {0}")]
    Scheduler(#[from] SchedulerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("configuration error: {0}")]
    Config(String),
}

/// Topology-probe errors
#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("cpu info source not readable: {path}")]
    SourceUnavailable { path: String },
    #[error("cpu info stream contained no processor records")]
    NoProcessorRecords,
    #[error("malformed cpu info record: {line}")]
    MalformedRecord { line: String },
}

/// Output and task buffer allocation errors
#[derive(Error, Debug)]
pub enum AllocationError {
    #[error("failed to reserve {bytes} bytes for {what}")]
    Reserve { what: &'static str, bytes: usize },
    #[error("output {index} has unknown dimensions and cannot be pre-allocated")]
    UnknownDims { index: usize },
}

/// Pipeline-function and combine errors
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("pipeline function {func_idx} failed on rows {start}..{end}: {reason}")]
    FunctionFailed { func_idx: usize, start: usize, end: usize, reason: String },
    #[error("pipeline function left output {index} empty")]
    MissingOutput { index: usize },
    #[error("combine failed for output {index}: {reason}")]
    CombineFailed { index: usize, reason: String },
}

/// Accelerator errors
#[derive(Error, Debug)]
pub enum AcceleratorError {
    #[error("accelerator requested but not available")]
    Unavailable,
    #[error("prefetch of rows {start}..{end} failed: {reason}")]
    PrefetchFailed { start: usize, end: usize, reason: String },
    #[error("pipeline memory requirement {required} exceeds device budget {budget}")]
    BudgetExceeded { required: usize, budget: usize },
}

/// Scheduler and queue errors
#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("task queue is closed")]
    QueueClosed,
    #[error("worker {id} panicked")]
    WorkerPanicked { id: usize },
}

/// Result type alias used throughout the workspace
pub type Result<T> = std::result::Result<T, TesselError>;
