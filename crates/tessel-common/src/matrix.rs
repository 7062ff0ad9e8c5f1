//! Dense and sparse (CSR) matrix data structures with row-view semantics.
//!
//! Storage is `Arc`-shared so that `view_rows` is zero-copy: a view of a
//! split input hands workers a window into the same buffer the scheduler
//! holds. Mutation goes through `Arc::make_mut`, so final outputs — which are
//! uniquely owned — are written in place, while mutating a shared view
//! detaches it first.

use std::mem;
use std::sync::Arc;

use crate::error::{AllocationError, Result};
use crate::types::{OutputShape, ValueType};

// ── Dense ───────────────────────────────────────────────────────────

/// Row-major dense matrix of `rows × cols` elements.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseMatrix<T> {
    rows: usize,
    cols: usize,
    /// Element offset of this view's row 0 within `data`.
    offset: usize,
    data: Arc<Vec<T>>,
}

impl<T: ValueType> DenseMatrix<T> {
    /// Allocate a `rows × cols` matrix with every element at `T::default()`.
    pub fn zeroed(rows: usize, cols: usize) -> Result<Self> {
        let items = rows
            .checked_mul(cols)
            .ok_or(AllocationError::Reserve { what: "dense values", bytes: usize::MAX })?;
        let mut data = Vec::new();
        data.try_reserve_exact(items).map_err(|_| AllocationError::Reserve {
            what: "dense values",
            bytes: items * mem::size_of::<T>(),
        })?;
        data.resize(items, T::default());
        Ok(Self { rows, cols, offset: 0, data: Arc::new(data) })
    }

    /// Build from row-major values.
    ///
    /// # Panics
    /// If `values.len() != rows * cols`.
    pub fn from_vec(rows: usize, cols: usize, values: Vec<T>) -> Self {
        assert_eq!(values.len(), rows * cols, "value count must equal rows * cols");
        Self { rows, cols, offset: 0, data: Arc::new(values) }
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn num_cols(&self) -> usize {
        self.cols
    }

    pub fn num_items(&self) -> usize {
        self.rows * self.cols
    }

    /// Size of this view's value window in bytes.
    pub fn buffer_size(&self) -> usize {
        self.num_items() * mem::size_of::<T>()
    }

    /// Identity of the underlying storage; views share it with their parent.
    pub fn storage_id(&self) -> usize {
        Arc::as_ptr(&self.data) as usize
    }

    pub fn values(&self) -> &[T] {
        &self.data[self.offset..self.offset + self.num_items()]
    }

    /// Mutable access to the values. Clones the underlying storage first if it
    /// is shared with other views.
    pub fn values_mut(&mut self) -> &mut [T] {
        let start = self.offset;
        let len = self.rows * self.cols;
        let data = Arc::make_mut(&mut self.data);
        &mut data[start..start + len]
    }

    pub fn row(&self, r: usize) -> &[T] {
        let base = self.offset + r * self.cols;
        &self.data[base..base + self.cols]
    }

    pub fn get(&self, r: usize, c: usize) -> T {
        self.data[self.offset + r * self.cols + c]
    }

    /// Zero-copy view of rows `r0..r1`.
    ///
    /// # Panics
    /// If `r0 > r1` or `r1 > num_rows()`.
    pub fn view_rows(&self, r0: usize, r1: usize) -> Self {
        assert!(r0 <= r1 && r1 <= self.rows, "row view {r0}..{r1} out of range");
        Self {
            rows: r1 - r0,
            cols: self.cols,
            offset: self.offset + r0 * self.cols,
            data: Arc::clone(&self.data),
        }
    }
}

// ── Sparse (CSR) ────────────────────────────────────────────────────

/// Compressed sparse row matrix: value array, column-index array, and a
/// row-offset array of length `rows + 1`.
///
/// A view over a row range shares all three arrays and rebases through
/// `row_base`; its non-zero window is
/// `row_offsets[row_base] .. row_offsets[row_base + rows]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CsrMatrix<T> {
    rows: usize,
    cols: usize,
    /// First row of this view within `row_offsets`.
    row_base: usize,
    values: Arc<Vec<T>>,
    col_idxs: Arc<Vec<usize>>,
    row_offsets: Arc<Vec<usize>>,
}

impl<T: ValueType> CsrMatrix<T> {
    /// Build from the three raw arrays, validating their consistency.
    pub fn from_raw(
        rows: usize,
        cols: usize,
        values: Vec<T>,
        col_idxs: Vec<usize>,
        row_offsets: Vec<usize>,
    ) -> Result<Self> {
        let nnz = values.len();
        let consistent = row_offsets.len() == rows + 1
            && col_idxs.len() == nnz
            && row_offsets.first() == Some(&0)
            && row_offsets.last() == Some(&nnz)
            && row_offsets.windows(2).all(|w| w[0] <= w[1])
            && col_idxs.iter().all(|&c| c < cols);
        if !consistent {
            return Err(crate::error::TesselError::Config(format!(
                "inconsistent CSR arrays for a {rows}x{cols} matrix ({nnz} values, {} col indices, {} row offsets)",
                col_idxs.len(),
                row_offsets.len()
            )));
        }
        Ok(Self {
            rows,
            cols,
            row_base: 0,
            values: Arc::new(values),
            col_idxs: Arc::new(col_idxs),
            row_offsets: Arc::new(row_offsets),
        })
    }

    pub fn num_rows(&self) -> usize {
        self.rows
    }

    pub fn num_cols(&self) -> usize {
        self.cols
    }

    /// Number of stored non-zeros in this view.
    pub fn nnz(&self) -> usize {
        self.row_offsets[self.row_base + self.rows] - self.row_offsets[self.row_base]
    }

    /// Item count; for CSR this is the stored non-zero count.
    pub fn num_items(&self) -> usize {
        self.nnz()
    }

    /// Bytes held by this view's windows of the three arrays.
    pub fn buffer_size(&self) -> usize {
        self.nnz() * (mem::size_of::<T>() + mem::size_of::<usize>())
            + (self.rows + 1) * mem::size_of::<usize>()
    }

    pub fn storage_id(&self) -> usize {
        Arc::as_ptr(&self.values) as usize
    }

    /// Values of this view's non-zero window.
    pub fn values(&self) -> &[T] {
        let lo = self.row_offsets[self.row_base];
        let hi = self.row_offsets[self.row_base + self.rows];
        &self.values[lo..hi]
    }

    /// Column indices of this view's non-zero window.
    pub fn col_idxs(&self) -> &[usize] {
        let lo = self.row_offsets[self.row_base];
        let hi = self.row_offsets[self.row_base + self.rows];
        &self.col_idxs[lo..hi]
    }

    /// Row offsets of a full (non-view) matrix.
    ///
    /// # Panics
    /// If called on a row view; views rebase per row via [`Self::row_nnz`].
    pub fn row_offsets(&self) -> &[usize] {
        assert_eq!(self.row_base, 0, "row_offsets is only direct on a full matrix");
        assert_eq!(self.row_offsets.len(), self.rows + 1);
        &self.row_offsets
    }

    /// Stored non-zeros in row `r` of this view.
    pub fn row_nnz(&self, r: usize) -> usize {
        self.row_offsets[self.row_base + r + 1] - self.row_offsets[self.row_base + r]
    }

    /// Zero-copy view of rows `r0..r1`.
    ///
    /// # Panics
    /// If `r0 > r1` or `r1 > num_rows()`.
    pub fn view_rows(&self, r0: usize, r1: usize) -> Self {
        assert!(r0 <= r1 && r1 <= self.rows, "row view {r0}..{r1} out of range");
        Self {
            rows: r1 - r0,
            cols: self.cols,
            row_base: self.row_base + r0,
            values: Arc::clone(&self.values),
            col_idxs: Arc::clone(&self.col_idxs),
            row_offsets: Arc::clone(&self.row_offsets),
        }
    }
}

// ── Runtime shape tag ───────────────────────────────────────────────

/// A matrix value of either storage layout; the handle pipeline functions
/// accept as inputs and produce as outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum MatrixValue<T> {
    Dense(DenseMatrix<T>),
    Csr(CsrMatrix<T>),
}

impl<T: ValueType> MatrixValue<T> {
    pub fn num_rows(&self) -> usize {
        match self {
            Self::Dense(m) => m.num_rows(),
            Self::Csr(m) => m.num_rows(),
        }
    }

    pub fn num_cols(&self) -> usize {
        match self {
            Self::Dense(m) => m.num_cols(),
            Self::Csr(m) => m.num_cols(),
        }
    }

    pub fn num_items(&self) -> usize {
        match self {
            Self::Dense(m) => m.num_items(),
            Self::Csr(m) => m.num_items(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        match self {
            Self::Dense(m) => m.buffer_size(),
            Self::Csr(m) => m.buffer_size(),
        }
    }

    pub fn storage_id(&self) -> usize {
        match self {
            Self::Dense(m) => m.storage_id(),
            Self::Csr(m) => m.storage_id(),
        }
    }

    pub fn shape(&self) -> OutputShape {
        match self {
            Self::Dense(_) => OutputShape::Dense,
            Self::Csr(_) => OutputShape::Csr,
        }
    }

    pub fn view_rows(&self, r0: usize, r1: usize) -> Self {
        match self {
            Self::Dense(m) => Self::Dense(m.view_rows(r0, r1)),
            Self::Csr(m) => Self::Csr(m.view_rows(r0, r1)),
        }
    }

    pub fn as_dense(&self) -> Option<&DenseMatrix<T>> {
        match self {
            Self::Dense(m) => Some(m),
            Self::Csr(_) => None,
        }
    }

    pub fn as_csr(&self) -> Option<&CsrMatrix<T>> {
        match self {
            Self::Csr(m) => Some(m),
            Self::Dense(_) => None,
        }
    }
}

impl<T> From<DenseMatrix<T>> for MatrixValue<T> {
    fn from(m: DenseMatrix<T>) -> Self {
        Self::Dense(m)
    }
}

impl<T> From<CsrMatrix<T>> for MatrixValue<T> {
    fn from(m: CsrMatrix<T>) -> Self {
        Self::Csr(m)
    }
}
