//! Process-level executor configuration

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use crate::error::{Result, TesselError};

/// How task queues are laid out across workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QueueLayout {
    /// One shared queue polled by every worker.
    #[default]
    Single,
    /// One queue per worker; stealing enabled.
    PerCpu,
    /// One queue per socket; workers poll their socket's queue.
    PerGroup,
    /// One queue per device class (CPU, accelerator).
    PerDeviceType,
}

impl FromStr for QueueLayout {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "single" => Ok(Self::Single),
            "per_cpu" | "per-cpu" | "percpu" => Ok(Self::PerCpu),
            "per_group" | "per-group" | "pergroup" => Ok(Self::PerGroup),
            "per_device_type" | "per-device-type" | "perdevicetype" => Ok(Self::PerDeviceType),
            other => Err(format!("unknown queue layout: {other}")),
        }
    }
}

/// Order in which a worker visits peer queues when its home queue is empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum StealPolicy {
    /// Peers in ascending queue order.
    #[default]
    Sequential,
    /// Peers on the same socket first, then remote ones.
    LocalFirst,
    /// Uniformly shuffled peer order.
    Random,
}

impl FromStr for StealPolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "seq" | "sequential" => Ok(Self::Sequential),
            "local" | "local_first" | "local-first" => Ok(Self::LocalFirst),
            "random" => Ok(Self::Random),
            other => Err(format!("unknown steal policy: {other}")),
        }
    }
}

/// When tasks enter the queues relative to worker start-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum QueueMode {
    /// All tasks are seeded and the queues closed before workers start.
    #[default]
    StaticSeed,
    /// Workers start first; the scheduler seeds incrementally, then closes.
    Dynamic,
}

/// Chunking strategy used by the load partitioner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PartitionStrategy {
    /// `num_workers` equal chunks; the last absorbs the remainder.
    #[default]
    Static,
    /// Every chunk is `min_chunk` rows.
    SelfScheduling,
    /// Guided self-scheduling: `ceil(remaining / num_workers)` per chunk.
    Gss,
    /// Factoring: rounds of `num_workers` chunks, each round halving.
    Fac2,
    /// Trapezoid self-scheduling: linearly decreasing chunk sizes.
    Tss,
}

impl FromStr for PartitionStrategy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, String> {
        match s.to_ascii_lowercase().as_str() {
            "static" => Ok(Self::Static),
            "ss" | "self_scheduling" | "self-scheduling" => Ok(Self::SelfScheduling),
            "gss" => Ok(Self::Gss),
            "fac2" => Ok(Self::Fac2),
            "tss" => Ok(Self::Tss),
            other => Err(format!("unknown partition strategy: {other}")),
        }
    }
}

/// Executor configuration.
///
/// `Default` gives a CPU-only, single-queue, statically partitioned setup;
/// [`ExecutorConfig::from_env`] additionally honours the `TESSEL_*`
/// environment overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Worker thread count; 0 selects the hardware concurrency.
    pub num_threads: usize,
    pub use_accelerator: bool,
    pub queue_layout: QueueLayout,
    pub steal_policy: StealPolicy,
    pub queue_mode: QueueMode,
    /// Pin each worker to one hardware thread before its first pop.
    pub pin_workers: bool,
    pub partition_strategy: PartitionStrategy,
    /// Lower bound on partitioner chunk sizes (the tail excepted).
    pub min_chunk: usize,
    /// Per-worker batching hint, forwarded to accelerator workers.
    pub batch_size: usize,
    /// Raise run summaries from debug to info level.
    pub verbose: bool,
    /// Topology source; override for tests.
    pub cpuinfo_path: PathBuf,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            num_threads: 0,
            use_accelerator: false,
            queue_layout: QueueLayout::default(),
            steal_policy: StealPolicy::default(),
            queue_mode: QueueMode::default(),
            pin_workers: false,
            partition_strategy: PartitionStrategy::default(),
            min_chunk: 1,
            batch_size: 1,
            verbose: false,
            cpuinfo_path: PathBuf::from("/proc/cpuinfo"),
        }
    }
}

impl ExecutorConfig {
    /// Defaults plus `TESSEL_*` environment overrides.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    /// Apply `TESSEL_*` environment overrides in place. Unparseable values
    /// are ignored with a warning rather than failing startup.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = env::var("TESSEL_NUM_THREADS") {
            match v.parse() {
                Ok(n) => self.num_threads = n,
                Err(_) => log::warn!("ignoring unparseable TESSEL_NUM_THREADS={v}"),
            }
        }
        if let Ok(v) = env::var("TESSEL_QUEUE_LAYOUT") {
            match v.parse() {
                Ok(l) => self.queue_layout = l,
                Err(e) => log::warn!("ignoring TESSEL_QUEUE_LAYOUT: {e}"),
            }
        }
        if let Ok(v) = env::var("TESSEL_STEAL_POLICY") {
            match v.parse() {
                Ok(p) => self.steal_policy = p,
                Err(e) => log::warn!("ignoring TESSEL_STEAL_POLICY: {e}"),
            }
        }
        if let Ok(v) = env::var("TESSEL_PARTITION") {
            match v.parse() {
                Ok(p) => self.partition_strategy = p,
                Err(e) => log::warn!("ignoring TESSEL_PARTITION: {e}"),
            }
        }
        if let Ok(v) = env::var("TESSEL_PIN_WORKERS") {
            self.pin_workers = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = env::var("TESSEL_VERBOSE") {
            self.verbose = v == "1" || v.eq_ignore_ascii_case("true");
        }
    }

    /// Reject configurations the executor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.min_chunk == 0 {
            return Err(TesselError::Config("min_chunk must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(TesselError::Config("batch_size must be at least 1".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn defaults_are_cpu_only_single_queue() {
        let c = ExecutorConfig::default();
        assert_eq!(c.num_threads, 0);
        assert!(!c.use_accelerator);
        assert_eq!(c.queue_layout, QueueLayout::Single);
        assert_eq!(c.partition_strategy, PartitionStrategy::Static);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn zero_min_chunk_is_rejected() {
        let c = ExecutorConfig { min_chunk: 0, ..Default::default() };
        assert!(c.validate().is_err());
    }

    #[test]
    fn layout_and_policy_parsing() {
        assert_eq!("per-cpu".parse::<QueueLayout>().unwrap(), QueueLayout::PerCpu);
        assert_eq!("PER_GROUP".parse::<QueueLayout>().unwrap(), QueueLayout::PerGroup);
        assert!("ring".parse::<QueueLayout>().is_err());
        assert_eq!("local_first".parse::<StealPolicy>().unwrap(), StealPolicy::LocalFirst);
        assert_eq!("gss".parse::<PartitionStrategy>().unwrap(), PartitionStrategy::Gss);
    }

    #[test]
    #[serial]
    fn env_overrides_apply_and_ignore_garbage() {
        std::env::set_var("TESSEL_NUM_THREADS", "3");
        std::env::set_var("TESSEL_QUEUE_LAYOUT", "per_cpu");
        std::env::set_var("TESSEL_PARTITION", "not-a-strategy");
        let c = ExecutorConfig::from_env();
        std::env::remove_var("TESSEL_NUM_THREADS");
        std::env::remove_var("TESSEL_QUEUE_LAYOUT");
        std::env::remove_var("TESSEL_PARTITION");
        assert_eq!(c.num_threads, 3);
        assert_eq!(c.queue_layout, QueueLayout::PerCpu);
        assert_eq!(c.partition_strategy, PartitionStrategy::Static);
    }
}
