//! Small data generators that populate a matrix from a value list.
//!
//! Meant for small matrices, mainly as a utility for tests and debugging:
//!
//! ```
//! use tessel_common::datagen::gen_given_vals_dense;
//!
//! // Generates the matrix  3 1 4
//! //                       1 5 9
//! let m = gen_given_vals_dense(2, &[3, 1, 4, 1, 5, 9]);
//! assert_eq!(m.num_cols(), 3);
//! ```

use crate::matrix::{CsrMatrix, DenseMatrix};
use crate::types::ValueType;

/// Dense `num_rows × (elements.len() / num_rows)` matrix from row-major values.
///
/// # Panics
/// If `num_rows` is 0 or does not divide `elements.len()`.
pub fn gen_given_vals_dense<T: ValueType>(num_rows: usize, elements: &[T]) -> DenseMatrix<T> {
    assert!(num_rows > 0, "num_rows must be positive");
    assert_eq!(elements.len() % num_rows, 0, "element count must be divisible by num_rows");
    let num_cols = elements.len() / num_rows;
    DenseMatrix::from_vec(num_rows, num_cols, elements.to_vec())
}

/// CSR matrix from the same row-major dense value list; zeros are dropped.
///
/// # Panics
/// If `num_rows` is 0 or does not divide `elements.len()`.
pub fn gen_given_vals_csr<T: ValueType>(num_rows: usize, elements: &[T]) -> CsrMatrix<T> {
    assert!(num_rows > 0, "num_rows must be positive");
    assert_eq!(elements.len() % num_rows, 0, "element count must be divisible by num_rows");
    let num_cols = elements.len() / num_rows;

    let mut values = Vec::new();
    let mut col_idxs = Vec::new();
    let mut row_offsets = Vec::with_capacity(num_rows + 1);
    row_offsets.push(0);
    for row in elements.chunks(num_cols) {
        for (col, &v) in row.iter().enumerate() {
            if v != T::default() {
                values.push(v);
                col_idxs.push(col);
            }
        }
        row_offsets.push(values.len());
    }
    CsrMatrix::from_raw(num_rows, num_cols, values, col_idxs, row_offsets)
        .expect("generator arrays are consistent by construction")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_from_values() {
        let m = gen_given_vals_dense(4, &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(m.num_rows(), 4);
        assert_eq!(m.num_cols(), 2);
        assert_eq!(m.row(2), &[5, 6]);
    }

    #[test]
    fn csr_drops_zeros_and_builds_offsets() {
        // 5x4 with non-zeros at (0,1),(1,0),(1,3),(3,2),(4,0),(4,1)
        #[rustfmt::skip]
        let vals = [
            0, 1, 0, 0,
            2, 0, 0, 3,
            0, 0, 0, 0,
            0, 0, 4, 0,
            5, 6, 0, 0,
        ];
        let m = gen_given_vals_csr(5, &vals);
        assert_eq!(m.nnz(), 6);
        assert_eq!(m.values(), &[1, 2, 3, 4, 5, 6]);
        assert_eq!(m.col_idxs(), &[1, 0, 3, 2, 0, 1]);
        assert_eq!(m.row_offsets(), &[0, 1, 3, 3, 4, 6]);
    }

    #[test]
    #[should_panic(expected = "divisible")]
    fn uneven_value_count_panics() {
        gen_given_vals_dense(3, &[1, 2, 3, 4]);
    }
}
