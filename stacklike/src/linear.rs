//! Dense row-major matrix, used for per-source × per-bin tables.

use std::ops::Index;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Matrix<T> {
    data: Vec<T>,
    rows: usize,
    cols: usize,
}
impl<T> Matrix<T> {
    /// Assembles a matrix from equal-length rows. With no rows, `cols` still fixes the width.
    pub fn from_rows(cols: usize, rows: impl IntoIterator<Item = Vec<T>>) -> Self {
        let mut data = vec![];
        let mut num_rows = 0;
        for row in rows {
            assert_eq!(cols, row.len(), "row {num_rows} has {} columns, expected {cols}", row.len());
            data.extend(row);
            num_rows += 1;
        }
        Self {
            data,
            rows: num_rows,
            cols,
        }
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn cols(&self) -> usize {
        self.cols
    }

    pub fn row_slice(&self, row: usize) -> &[T] {
        debug_assert!(self.validate_row_index(row));
        let row_start = row * self.cols;
        &self.data[row_start..(row_start + self.cols)]
    }

    /// All elements, row after row.
    pub fn flatten(&self) -> &[T] {
        &self.data
    }

    fn validate_row_index(&self, row: usize) -> bool {
        assert!(row < self.rows, "invalid row index {row} for a {}x{} matrix", self.rows, self.cols);
        true
    }

    fn validate_col_index(&self, col: usize) -> bool {
        assert!(col < self.cols, "invalid column index {col} for a {}x{} matrix", self.rows, self.cols);
        true
    }
}

impl<T> Index<(usize, usize)> for Matrix<T> {
    type Output = T;

    #[inline]
    fn index(&self, index: (usize, usize)) -> &Self::Output {
        let (row, col) = index;
        debug_assert!(self.validate_row_index(row));
        debug_assert!(self.validate_col_index(col));
        &self.data[row * self.cols + col]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counts() -> Matrix<f64> {
        Matrix::from_rows(3, vec![vec![100.0, 50.0, 10.0], vec![20.0, 15.0, 8.0]])
    }

    #[test]
    fn from_rows() {
        let matrix = counts();
        assert_eq!(2, matrix.rows());
        assert_eq!(3, matrix.cols());
        assert_eq!(&[20.0, 15.0, 8.0], matrix.row_slice(1));
        assert_eq!(50.0, matrix[(0, 1)]);
        assert_eq!(&[100.0, 50.0, 10.0, 20.0, 15.0, 8.0], matrix.flatten());
    }

    #[test]
    fn no_rows_keeps_width() {
        let matrix = Matrix::<f64>::from_rows(4, vec![]);
        assert_eq!(0, matrix.rows());
        assert_eq!(4, matrix.cols());
        assert!(matrix.flatten().is_empty());
    }

    #[test]
    #[should_panic = "row 1 has 1 columns, expected 2"]
    fn from_ragged_rows_panics() {
        Matrix::from_rows(2, vec![vec![1, 2], vec![3]]);
    }

    #[test]
    #[should_panic = "invalid row index 2 for a 2x3 matrix"]
    fn row_overflow_panics() {
        let matrix = counts();
        let _ = matrix[(matrix.rows(), 0)];
    }

    #[test]
    #[should_panic = "invalid column index 3 for a 2x3 matrix"]
    fn col_overflow_panics() {
        let matrix = counts();
        let _ = matrix[(0, matrix.cols())];
    }
}
