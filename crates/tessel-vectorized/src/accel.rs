//! Accelerator context: a runtime capability, not a compile-time feature.
//!
//! The executor talks to a device through [`AccelContext`]; when no context
//! is registered (or the configuration does not ask for one) execution is
//! CPU-only. [`HostStagingAccel`] is the reference implementation: it stages
//! row ranges into a host-side residency map, which is enough for budget
//! accounting and for exercising the accelerator paths deterministically in
//! tests and on machines without a device.

use std::collections::HashMap;
use std::ops::Range;
use std::sync::Mutex;

use tessel_common::{AcceleratorError, MatrixValue, Result, ValueType};

use crate::locked;

/// Device-side services the executor needs from an accelerator.
pub trait AccelContext<T: ValueType>: Send + Sync {
    /// Bytes of device memory available for pipeline buffers.
    fn mem_budget(&self) -> usize;

    /// Ensure rows `rows` of the buffer behind `input` are resident in device
    /// memory.
    ///
    /// `rows` is the window within the underlying shared buffer (row-sliced
    /// views of one buffer share a storage identity, so the range is what
    /// tells two windows apart); `input` must be a view spanning exactly
    /// those rows, or the full matrix when `rows` is its full extent.
    fn prefetch_rows(&self, input: &MatrixValue<T>, rows: Range<usize>) -> Result<()>;

    /// Human-readable device description for logs.
    fn device_info(&self) -> String;
}

struct Residency {
    /// Staged row ranges per storage buffer.
    ranges: HashMap<usize, Vec<Range<usize>>>,
    staged_bytes: usize,
}

/// Host-staging accelerator: tracks residency and enforces the budget without
/// a real device behind it.
pub struct HostStagingAccel {
    budget: usize,
    residency: Mutex<Residency>,
}

impl HostStagingAccel {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            residency: Mutex::new(Residency { ranges: HashMap::new(), staged_bytes: 0 }),
        }
    }

    /// Budget sized from host memory: a quarter of physical RAM.
    pub fn with_host_budget() -> Self {
        let mut sys = sysinfo::System::new();
        sys.refresh_memory();
        let total = sys.total_memory() as usize;
        Self::new(total / 4)
    }

    /// Row ranges staged for the buffer identified by `storage_id`.
    pub fn staged_ranges(&self, storage_id: usize) -> Vec<Range<usize>> {
        locked(&self.residency).ranges.get(&storage_id).cloned().unwrap_or_default()
    }

    pub fn staged_bytes(&self) -> usize {
        locked(&self.residency).staged_bytes
    }
}

impl<T: ValueType> AccelContext<T> for HostStagingAccel {
    fn mem_budget(&self) -> usize {
        self.budget
    }

    fn prefetch_rows(&self, input: &MatrixValue<T>, rows: Range<usize>) -> Result<()> {
        if input.num_rows() != rows.len() {
            return Err(AcceleratorError::PrefetchFailed {
                start: rows.start,
                end: rows.end,
                reason: format!("view spans {} rows, not the requested window", input.num_rows()),
            }
            .into());
        }
        let bytes = input.buffer_size();
        let mut residency = locked(&self.residency);
        let already = residency
            .ranges
            .get(&input.storage_id())
            .map(|staged| staged.iter().any(|r| r.start <= rows.start && rows.end <= r.end))
            .unwrap_or(false);
        if already {
            return Ok(());
        }
        if residency.staged_bytes + bytes > self.budget {
            return Err(AcceleratorError::BudgetExceeded {
                required: residency.staged_bytes + bytes,
                budget: self.budget,
            }
            .into());
        }
        residency.staged_bytes += bytes;
        residency.ranges.entry(input.storage_id()).or_default().push(rows);
        Ok(())
    }

    fn device_info(&self) -> String {
        format!("host-staging accelerator (budget {} bytes)", self.budget)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessel_common::datagen::gen_given_vals_dense;

    #[test]
    fn prefetch_tracks_ranges_and_bytes() {
        let accel = HostStagingAccel::new(1 << 20);
        let m: MatrixValue<i64> = gen_given_vals_dense(4, &[1i64, 2, 3, 4, 5, 6, 7, 8]).into();
        AccelContext::prefetch_rows(&accel, &m.view_rows(0, 2), 0..2).unwrap();
        assert_eq!(accel.staged_ranges(m.storage_id()), vec![0..2]);
        assert_eq!(accel.staged_bytes(), 2 * 2 * std::mem::size_of::<i64>());

        // A covered sub-window is already resident; nothing new is staged.
        AccelContext::prefetch_rows(&accel, &m.view_rows(0, 1), 0..1).unwrap();
        assert_eq!(accel.staged_ranges(m.storage_id()).len(), 1);
    }

    #[test]
    fn equal_length_windows_of_one_buffer_stage_separately() {
        // Two distinct 2-row windows of the same buffer must both be staged
        // and both be accounted against the budget.
        let accel = HostStagingAccel::new(1 << 20);
        let m: MatrixValue<i64> = gen_given_vals_dense(4, &[1i64, 2, 3, 4, 5, 6, 7, 8]).into();
        AccelContext::prefetch_rows(&accel, &m.view_rows(0, 2), 0..2).unwrap();
        AccelContext::prefetch_rows(&accel, &m.view_rows(2, 4), 2..4).unwrap();
        assert_eq!(accel.staged_ranges(m.storage_id()), vec![0..2, 2..4]);
        assert_eq!(accel.staged_bytes(), 2 * 2 * 2 * std::mem::size_of::<i64>());
    }

    #[test]
    fn mismatched_view_and_window_is_rejected() {
        let accel = HostStagingAccel::new(1 << 20);
        let m: MatrixValue<i64> = gen_given_vals_dense(4, &[0i64; 8]).into();
        // The full matrix does not span a 2-row window.
        let err = AccelContext::prefetch_rows(&accel, &m, 0..2).unwrap_err();
        assert!(err.to_string().contains("window"));
        assert_eq!(accel.staged_bytes(), 0);
    }

    #[test]
    fn prefetch_beyond_budget_fails() {
        let accel = HostStagingAccel::new(8);
        let m: MatrixValue<i64> = gen_given_vals_dense(2, &[1i64, 2, 3, 4]).into();
        let err = AccelContext::prefetch_rows(&accel, &m, 0..2).unwrap_err();
        assert!(err.to_string().contains("budget"));
    }
}
