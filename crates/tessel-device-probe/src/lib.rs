//! CPU topology and accelerator availability probing.
//!
//! The topology probe parses a `/proc/cpuinfo` style key–value record stream
//! and reports, per hardware thread, the socket (`physical id`) it lives on,
//! plus a deduplicated list with exactly one hardware thread per
//! `(socket, core)` pair — so the scheduler never pins two workers onto the
//! SMT siblings of one physical core. The source path is injectable for
//! tests; when it cannot be read the probe falls back to a flat single-socket
//! topology sized by [`std::thread::available_parallelism`].

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use tessel_common::{Result, TopologyError};

/// Default topology source on Linux.
pub const DEFAULT_CPUINFO_PATH: &str = "/proc/cpuinfo";

/// Hardware topology snapshot. Immutable after probing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    /// Hardware thread ids, in record order.
    pub hw_threads: Vec<usize>,
    /// Socket of each hardware thread, parallel to `hw_threads`.
    pub physical_ids: Vec<usize>,
    /// Core id within the socket, parallel to `hw_threads`.
    pub core_ids: Vec<usize>,
    /// One hardware thread per `(socket, core)` pair, in record order.
    pub unique_threads: Vec<usize>,
}

impl Topology {
    /// Flat fallback: one socket, one hardware thread per unit of available
    /// parallelism.
    pub fn fallback() -> Self {
        let n = std::thread::available_parallelism().map(|v| v.get()).unwrap_or(1);
        Self {
            hw_threads: (0..n).collect(),
            physical_ids: vec![0; n],
            core_ids: (0..n).collect(),
            unique_threads: (0..n).collect(),
        }
    }

    /// Distinct sockets, in first-seen order.
    pub fn socket_ids(&self) -> Vec<usize> {
        let mut seen = HashSet::new();
        self.physical_ids.iter().copied().filter(|id| seen.insert(*id)).collect()
    }

    pub fn num_sockets(&self) -> usize {
        self.socket_ids().len()
    }

    /// Index of `hw_thread`'s socket within [`Self::socket_ids`]. Unknown
    /// hardware threads map to socket index 0.
    pub fn socket_index_of(&self, hw_thread: usize) -> usize {
        let physical = self
            .hw_threads
            .iter()
            .position(|&t| t == hw_thread)
            .and_then(|pos| self.physical_ids.get(pos).copied())
            .unwrap_or(0);
        self.socket_ids().iter().position(|&s| s == physical).unwrap_or(0)
    }
}

/// Probe the default source, falling back to [`Topology::fallback`] with a
/// diagnostic when it is unavailable.
pub fn probe() -> Topology {
    probe_path(Path::new(DEFAULT_CPUINFO_PATH)).unwrap_or_else(|e| {
        let fallback = Topology::fallback();
        log::warn!(
            "cpu topology unavailable ({e}); assuming one socket with {} hardware threads",
            fallback.hw_threads.len()
        );
        fallback
    })
}

/// Probe a specific cpuinfo-format file.
pub fn probe_path(path: &Path) -> Result<Topology> {
    let file = File::open(path).map_err(|_| TopologyError::SourceUnavailable {
        path: path.display().to_string(),
    })?;
    probe_reader(BufReader::new(file))
}

/// Probe an already-opened cpuinfo-format stream.
///
/// A `processor` key starts a new record; `physical id` and `core id` keys
/// attach to the current record. Records missing `physical id` default to
/// socket 0; records missing `core id` count as their own core.
pub fn probe_reader<R: BufRead>(reader: R) -> Result<Topology> {
    struct Record {
        processor: usize,
        physical: Option<usize>,
        core: Option<usize>,
    }

    let mut records: Vec<Record> = Vec::new();
    for line in reader.lines() {
        let line = line?;
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        match key {
            "processor" => {
                let processor = parse_field(value, &line)?;
                records.push(Record { processor, physical: None, core: None });
            }
            "physical id" => {
                if let Some(rec) = records.last_mut() {
                    rec.physical = Some(parse_field(value, &line)?);
                }
            }
            "core id" => {
                if let Some(rec) = records.last_mut() {
                    rec.core = Some(parse_field(value, &line)?);
                }
            }
            _ => {}
        }
    }
    if records.is_empty() {
        return Err(TopologyError::NoProcessorRecords.into());
    }

    let mut topology = Topology {
        hw_threads: Vec::with_capacity(records.len()),
        physical_ids: Vec::with_capacity(records.len()),
        core_ids: Vec::with_capacity(records.len()),
        unique_threads: Vec::new(),
    };
    let mut seen_cores = HashSet::new();
    for rec in records {
        let physical = rec.physical.unwrap_or(0);
        let core = rec.core.unwrap_or(rec.processor);
        topology.hw_threads.push(rec.processor);
        topology.physical_ids.push(physical);
        topology.core_ids.push(core);
        if seen_cores.insert((physical, core)) {
            topology.unique_threads.push(rec.processor);
        }
    }
    Ok(topology)
}

fn parse_field(value: &str, line: &str) -> Result<usize> {
    value
        .parse()
        .map_err(|_| TopologyError::MalformedRecord { line: line.to_string() }.into())
}

/// Runtime accelerator availability.
///
/// There is no device binding compiled into this build, so availability is
/// driven by the `TESSEL_ACCEL_FAKE` override: any value other than `none`,
/// `0`, or empty reports an accelerator as present. This keeps
/// accelerator-path tests deterministic on machines without a device.
pub fn accel_available() -> bool {
    match std::env::var("TESSEL_ACCEL_FAKE") {
        Ok(v) => {
            let v = v.to_ascii_lowercase();
            !(v.is_empty() || v == "none" || v == "0")
        }
        Err(_) => false,
    }
}
