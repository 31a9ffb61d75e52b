//! Row and column equilibration.
//!
//! Computes diagonal scalings `R` and `C` so that every row and column of
//! `R A C` has its largest entry near one, and applies them only when the
//! matrix is badly scaled enough to need it. The factorization works on
//! `R A C`; a solve maps `b` and `x` through the same vectors.

use crate::scalar::Scalar;
use crate::sparse::CsrMatrix;

/// Scale ratio below which rows or columns get equilibrated.
const THRESHOLD: f64 = 0.1;

/// Diagonal scalings applied before factorization.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Scaling {
    /// `R`, when rows are scaled.
    pub rows: Option<Vec<f64>>,
    /// `C`, when columns are scaled.
    pub cols: Option<Vec<f64>>,
}

fn safe_range() -> (f64, f64) {
    let small = f64::MIN_POSITIVE / f64::EPSILON;
    (small, 1.0 / small)
}

/// `1 / max` for each entry, leaving empty lines unscaled. Also returns the
/// ratio between the smallest and largest nonzero maximum.
fn reciprocals(maxima: &[f64]) -> (Vec<f64>, f64) {
    let (small, big) = safe_range();
    let nonzero = maxima.iter().copied().filter(|&m| m > 0.0);
    let (lo, hi) = nonzero.fold((f64::INFINITY, 0.0f64), |(lo, hi), m| (lo.min(m), hi.max(m)));
    let ratio = if hi > 0.0 { lo.max(small) / hi.min(big) } else { 1.0 };
    let scales = maxima
        .iter()
        .map(|&m| if m > 0.0 { 1.0 / m.clamp(small, big) } else { 1.0 })
        .collect();
    (scales, ratio)
}

impl Scaling {
    pub fn none() -> Self {
        Self::default()
    }

    /// Equilibrate `a` if its rows or columns are badly scaled.
    pub fn compute<T: Scalar>(a: &CsrMatrix<T>) -> Self {
        let (small, big) = safe_range();
        let amax = a.max_abs();
        if amax == 0.0 {
            return Self::none();
        }

        let row_max: Vec<f64> = (0..a.nrows)
            .map(|i| {
                a.values[a.row_pointers[i]..a.row_pointers[i + 1]]
                    .iter()
                    .map(|v| v.abs_val())
                    .fold(0.0, f64::max)
            })
            .collect();
        let (r, row_ratio) = reciprocals(&row_max);
        let rows = (row_ratio < THRESHOLD || amax < small || amax > big).then_some(r);

        let mut col_max = vec![0.0f64; a.ncols];
        for i in 0..a.nrows {
            let ri = rows.as_ref().map_or(1.0, |r| r[i]);
            for idx in a.row_pointers[i]..a.row_pointers[i + 1] {
                let j = a.col_indices[idx];
                col_max[j] = col_max[j].max(a.values[idx].abs_val() * ri);
            }
        }
        let (c, col_ratio) = reciprocals(&col_max);

        let scaling = Self {
            rows,
            cols: (col_ratio < THRESHOLD).then_some(c),
        };
        if !scaling.is_identity() {
            tracing::debug!(
                row_ratio,
                col_ratio,
                rows = scaling.rows.is_some(),
                cols = scaling.cols.is_some(),
                "equilibrating matrix"
            );
        }
        scaling
    }

    pub fn is_identity(&self) -> bool {
        self.rows.is_none() && self.cols.is_none()
    }

    #[inline]
    pub fn row(&self, i: usize) -> f64 {
        self.rows.as_ref().map_or(1.0, |r| r[i])
    }

    #[inline]
    pub fn col(&self, j: usize) -> f64 {
        self.cols.as_ref().map_or(1.0, |c| c[j])
    }

    /// `R A C`.
    pub fn apply<T: Scalar>(&self, a: &CsrMatrix<T>) -> CsrMatrix<T> {
        let mut scaled = a.clone();
        if self.is_identity() {
            return scaled;
        }
        for i in 0..a.nrows {
            let ri = self.row(i);
            for idx in a.row_pointers[i]..a.row_pointers[i + 1] {
                let s = ri * self.col(a.col_indices[idx]);
                scaled.values[idx] = scaled.values[idx] * T::from_real(s);
            }
        }
        scaled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn well_scaled_matrix_is_left_alone() {
        let a = CsrMatrix::from_triplets(3, 3, &[(0, 0, 2.0), (1, 1, 3.0), (2, 2, 4.0), (0, 2, 1.0)]);
        let s = Scaling::compute(&a);
        assert!(s.is_identity());
        assert_eq!(s.apply(&a), a);
    }

    #[test]
    fn badly_scaled_rows_and_columns_are_equilibrated() {
        let a = CsrMatrix::from_triplets(
            3,
            3,
            &[(0, 0, 1e6), (0, 1, 2e6), (1, 1, 1e-3), (1, 2, 5e-4), (2, 0, 1.0), (2, 2, 1e4)],
        );
        let s = Scaling::compute(&a);
        assert!(s.rows.is_some());
        let scaled = s.apply(&a);
        for i in 0..3 {
            let m = scaled.values[scaled.row_pointers[i]..scaled.row_pointers[i + 1]]
                .iter()
                .fold(0.0f64, |m, v: &f64| m.max(v.abs()));
            assert!(m <= 1.0 + 1e-12, "row {i} max {m}");
        }
        assert_abs_diff_eq!(scaled.max_abs(), 1.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_rows_are_not_scaled() {
        let a = CsrMatrix::from_triplets(3, 3, &[(0, 0, 1e-8), (2, 2, 1e8)]);
        let s = Scaling::compute(&a);
        assert_eq!(s.row(1), 1.0);
        assert_eq!(s.col(1), 1.0);
        assert_abs_diff_eq!(s.row(0), 1e8, epsilon = 1e-3);
    }
}
