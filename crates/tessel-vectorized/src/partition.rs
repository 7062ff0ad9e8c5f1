//! Load partitioning: turning a row extent into a stream of chunks.
//!
//! Streams half-open intervals covering `[0, total_len)` exactly once, in
//! ascending order. Every strategy honours the `min_chunk` floor except for
//! the tail: once fewer than `min_chunk` rows remain they are issued as a
//! single final chunk.

use std::ops::Range;

use tessel_common::{ceil_div, PartitionStrategy};

/// Chunk-boundary generator for one pipeline run.
#[derive(Debug, Clone)]
pub struct LoadPartitioner {
    strategy: PartitionStrategy,
    total: usize,
    workers: usize,
    min_chunk: usize,
    next_start: usize,
    /// Chunks handed out so far.
    issued: usize,
    /// FAC2: chunk size for the current round.
    round_chunk: usize,
    /// TSS: first chunk size and per-step decrement.
    tss_first: usize,
    tss_delta: f64,
}

impl LoadPartitioner {
    /// A `num_workers` or `min_chunk` of zero is treated as one.
    pub fn new(
        strategy: PartitionStrategy,
        total_len: usize,
        num_workers: usize,
        min_chunk: usize,
    ) -> Self {
        let workers = num_workers.max(1);
        let min_chunk = min_chunk.max(1);
        let tss_first = ceil_div(total_len, 2 * workers).max(min_chunk);
        let tss_last = min_chunk;
        let tss_steps = ceil_div(2 * total_len, tss_first + tss_last).max(2);
        let tss_delta = (tss_first - tss_last) as f64 / (tss_steps - 1) as f64;
        Self {
            strategy,
            total: total_len,
            workers,
            min_chunk,
            next_start: 0,
            issued: 0,
            round_chunk: 0,
            tss_first,
            tss_delta,
        }
    }

    fn next_chunk_size(&mut self) -> usize {
        let remaining = self.total - self.next_start;
        if remaining <= self.min_chunk {
            // The remainder becomes a single final chunk.
            return remaining;
        }
        let raw = match self.strategy {
            PartitionStrategy::Static => {
                if self.issued + 1 >= self.workers {
                    remaining
                } else {
                    self.total / self.workers
                }
            }
            PartitionStrategy::SelfScheduling => self.min_chunk,
            PartitionStrategy::Gss => ceil_div(remaining, self.workers),
            PartitionStrategy::Fac2 => {
                if self.issued % self.workers == 0 {
                    self.round_chunk = ceil_div(remaining, 2 * self.workers);
                }
                self.round_chunk
            }
            PartitionStrategy::Tss => {
                let size = self.tss_first as f64 - self.issued as f64 * self.tss_delta;
                size.round() as usize
            }
        };
        raw.max(self.min_chunk).min(remaining)
    }
}

impl Iterator for LoadPartitioner {
    type Item = Range<usize>;

    fn next(&mut self) -> Option<Range<usize>> {
        if self.next_start >= self.total {
            return None;
        }
        let size = self.next_chunk_size().max(1);
        let start = self.next_start;
        let end = (start + size).min(self.total);
        self.next_start = end;
        self.issued += 1;
        Some(start..end)
    }
}
