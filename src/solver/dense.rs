//! Dense block kernels.
//!
//! Column-major blocks and the LU/TRSM/GEMM/GEMV operations the block
//! factorization and the triangular solves are built from. Every function
//! here only touches its arguments, so all of them are reentrant.
//!
//! A zero diagonal entry of U is treated as "no contribution": the matching
//! solution component is set to zero instead of dividing by zero.

use crate::scalar::Scalar;

/// Dense column-major block.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseBlock<T> {
    pub nrows: usize,
    pub ncols: usize,
    pub data: Vec<T>,
}

impl<T: Scalar> DenseBlock<T> {
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self {
            nrows,
            ncols,
            data: vec![T::zero(); nrows * ncols],
        }
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        self.data[j * self.nrows + i]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, v: T) {
        self.data[j * self.nrows + i] = v;
    }

    #[inline]
    pub fn add(&mut self, i: usize, j: usize, v: T) {
        self.data[j * self.nrows + i] += v;
    }

    pub fn swap_rows(&mut self, a: usize, b: usize) {
        if a == b {
            return;
        }
        for j in 0..self.ncols {
            self.data.swap(j * self.nrows + a, j * self.nrows + b);
        }
    }

    /// Copy of row `i`.
    pub fn row(&self, i: usize) -> Vec<T> {
        (0..self.ncols).map(|j| self.get(i, j)).collect()
    }

    pub fn set_row(&mut self, i: usize, values: &[T]) {
        for (j, &v) in values.iter().enumerate().take(self.ncols) {
            self.set(i, j, v);
        }
    }

    /// Stack blocks of equal width on top of each other.
    pub fn stack(blocks: &[&DenseBlock<T>]) -> Self {
        let ncols = blocks.first().map_or(0, |b| b.ncols);
        let nrows = blocks.iter().map(|b| b.nrows).sum();
        let mut out = Self::zeros(nrows, ncols);
        let mut top = 0;
        for b in blocks {
            for j in 0..ncols {
                for i in 0..b.nrows {
                    out.set(top + i, j, b.get(i, j));
                }
            }
            top += b.nrows;
        }
        out
    }

    /// Rows `start..start + nrows` as a new block.
    pub fn rows(&self, start: usize, nrows: usize) -> Self {
        let mut out = Self::zeros(nrows, self.ncols);
        for j in 0..self.ncols {
            for i in 0..nrows {
                out.set(i, j, self.get(start + i, j));
            }
        }
        out
    }

    pub fn max_abs(&self) -> f64 {
        self.data.iter().map(|v| v.abs_val()).fold(0.0, f64::max)
    }
}

/// What happened while factoring one panel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PivotOutcome {
    /// `pivots[k]` is the panel row swapped with row k at step k.
    pub pivots: Vec<usize>,
    /// Steps whose pivot column was exactly zero.
    pub zero_pivots: Vec<usize>,
    /// Nonzero pivots lifted to the tiny-pivot floor.
    pub tiny_replaced: usize,
}

/// In-place LU of a tall panel (`nrows >= ncols`) with threshold partial
/// pivoting over every row of the panel.
///
/// The diagonal candidate is kept when `|a_kk| >= threshold * max_i |a_ik|`,
/// otherwise the largest entry is swapped in. When `tiny` is given, nonzero
/// pivots smaller than it are scaled up to magnitude `tiny`. On return the
/// top square holds L\U and the rows below hold the L multipliers.
pub fn lu_in_place<T: Scalar>(panel: &mut DenseBlock<T>, threshold: f64, tiny: Option<f64>) -> PivotOutcome {
    let (m, n) = (panel.nrows, panel.ncols);
    debug_assert!(m >= n, "panel must be at least as tall as it is wide");
    let mut outcome = PivotOutcome {
        pivots: Vec::with_capacity(n),
        ..Default::default()
    };

    for k in 0..n {
        let mut col_max = 0.0f64;
        let mut arg_max = k;
        for i in k..m {
            let v = panel.get(i, k).abs_val();
            if v > col_max {
                col_max = v;
                arg_max = i;
            }
        }
        let diag = panel.get(k, k).abs_val();
        let p = if col_max == 0.0 || (diag > 0.0 && diag >= threshold * col_max) {
            k
        } else {
            arg_max
        };
        panel.swap_rows(k, p);
        outcome.pivots.push(p);

        let mut pivot = panel.get(k, k);
        if pivot == T::zero() {
            outcome.zero_pivots.push(k);
            continue;
        }
        if let Some(floor) = tiny {
            let mag = pivot.abs_val();
            if mag < floor {
                pivot = pivot * T::from_real(floor / mag);
                panel.set(k, k, pivot);
                outcome.tiny_replaced += 1;
            }
        }

        for i in (k + 1)..m {
            let l = panel.get(i, k) / pivot;
            panel.set(i, k, l);
        }
        for j in (k + 1)..n {
            let u = panel.get(k, j);
            if u == T::zero() {
                continue;
            }
            for i in (k + 1)..m {
                let l = panel.get(i, k);
                panel.add(i, j, -(l * u));
            }
        }
    }
    outcome
}

/// B ← L⁻¹ B with L the unit lower triangle of `lu`.
pub fn solve_unit_lower_left<T: Scalar>(lu: &DenseBlock<T>, b: &mut DenseBlock<T>) {
    let n = lu.nrows;
    for c in 0..b.ncols {
        for k in 0..n {
            let xk = b.get(k, c);
            if xk == T::zero() {
                continue;
            }
            for i in (k + 1)..n {
                b.add(i, c, -(lu.get(i, k) * xk));
            }
        }
    }
}

/// C ← C − A B.
pub fn gemm_sub<T: Scalar>(c: &mut DenseBlock<T>, a: &DenseBlock<T>, b: &DenseBlock<T>) {
    debug_assert_eq!(a.ncols, b.nrows);
    for j in 0..b.ncols {
        for k in 0..a.ncols {
            let bkj = b.get(k, j);
            if bkj == T::zero() {
                continue;
            }
            for i in 0..a.nrows {
                c.add(i, j, -(a.get(i, k) * bkj));
            }
        }
    }
}

/// y ← L⁻¹ y, L unit lower.
pub fn lower_unit_solve<T: Scalar>(lu: &DenseBlock<T>, y: &mut [T]) {
    let n = lu.nrows;
    for k in 0..n {
        let yk = y[k];
        if yk == T::zero() {
            continue;
        }
        for i in (k + 1)..n {
            y[i] -= lu.get(i, k) * yk;
        }
    }
}

/// y ← U⁻¹ y.
pub fn upper_solve<T: Scalar>(lu: &DenseBlock<T>, y: &mut [T]) {
    let n = lu.nrows;
    for k in (0..n).rev() {
        let ukk = lu.get(k, k);
        y[k] = if ukk == T::zero() { T::zero() } else { y[k] / ukk };
        let yk = y[k];
        for i in 0..k {
            y[i] -= lu.get(i, k) * yk;
        }
    }
}

#[inline]
fn maybe_conj<T: Scalar>(v: T, conjugate: bool) -> T {
    if conjugate {
        v.conj()
    } else {
        v
    }
}

/// y ← U⁻ᵀ y (or U⁻ᴴ y).
pub fn upper_transpose_solve<T: Scalar>(lu: &DenseBlock<T>, y: &mut [T], conjugate: bool) {
    let n = lu.nrows;
    for j in 0..n {
        let mut s = y[j];
        for k in 0..j {
            s -= maybe_conj(lu.get(k, j), conjugate) * y[k];
        }
        let ujj = maybe_conj(lu.get(j, j), conjugate);
        y[j] = if ujj == T::zero() { T::zero() } else { s / ujj };
    }
}

/// y ← L⁻ᵀ y (or L⁻ᴴ y), L unit lower.
pub fn lower_unit_transpose_solve<T: Scalar>(lu: &DenseBlock<T>, y: &mut [T], conjugate: bool) {
    let n = lu.nrows;
    for j in (0..n).rev() {
        let mut s = y[j];
        for k in (j + 1)..n {
            s -= maybe_conj(lu.get(k, j), conjugate) * y[k];
        }
        y[j] = s;
    }
}

/// out ← out + A x.
pub fn gemv_add<T: Scalar>(out: &mut [T], a: &DenseBlock<T>, x: &[T]) {
    for (k, &xk) in x.iter().enumerate().take(a.ncols) {
        if xk == T::zero() {
            continue;
        }
        for i in 0..a.nrows {
            out[i] += a.get(i, k) * xk;
        }
    }
}

/// out ← out + Aᵀ x (or Aᴴ x).
pub fn gemv_transpose_add<T: Scalar>(out: &mut [T], a: &DenseBlock<T>, x: &[T], conjugate: bool) {
    for j in 0..a.ncols {
        let mut s = T::zero();
        for i in 0..a.nrows {
            s += maybe_conj(a.get(i, j), conjugate) * x[i];
        }
        out[j] += s;
    }
}
