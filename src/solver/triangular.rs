//! Block triangular solves against distributed factors.
//!
//! Sweeps the block partition in elimination order. At each block every
//! participant sums the products of the factor blocks it owns into a partial
//! vector, the partials are all-reduced, and the diagonal solve is repeated on
//! every participant against its replica of the diagonal block. The working
//! vectors therefore stay replicated throughout. The equilibration scalings
//! are applied to the right-hand side on the way in and to the solution on
//! the way out.

use super::dense::{self, DenseBlock};
use super::grid::ProcessGrid;
use super::numeric::BlockFactors;
use super::symbolic::SymbolicPlan;
use super::TransposeMode;
use crate::error::{Result, SolverError};
use crate::scalar::{decode_values, encode_values, Scalar};

/// Sum per-column partial vectors across the grid.
fn reduce_partials<T: Scalar>(grid: &ProcessGrid, partials: &mut [Vec<T>]) -> Result<()> {
    if grid.num_ranks() == 1 {
        return Ok(());
    }
    let mut words = Vec::new();
    for p in partials.iter() {
        encode_values(p, &mut words);
    }
    grid.comm().all_reduce_sum_vec(&mut words)?;
    let mut offset = 0;
    for p in partials.iter_mut() {
        let (vals, used) = decode_values::<T>(&words[offset..], p.len()).ok_or_else(|| {
            SolverError::Communication("reduction returned a short payload".into())
        })?;
        *p = vals;
        offset += used;
    }
    Ok(())
}

/// Owned blocks grouped by block column.
fn by_column<T>(
    blocks: &std::collections::BTreeMap<(usize, usize), DenseBlock<T>>,
    nb: usize,
) -> Vec<Vec<(usize, &DenseBlock<T>)>> {
    let mut cols: Vec<Vec<(usize, &DenseBlock<T>)>> = vec![Vec::new(); nb];
    for (&(i, j), blk) in blocks {
        cols[j].push((i, blk));
    }
    cols
}

/// Solve `op(A) X = B` for the columns of `rhs`.
///
/// Collective over the grid. `rhs` holds global-length columns; the result
/// has the same shape.
pub fn solve<T: Scalar>(
    factors: &BlockFactors<T>,
    plan: &SymbolicPlan,
    grid: &ProcessGrid,
    rhs: &[Vec<T>],
    mode: TransposeMode,
) -> Result<Vec<Vec<T>>> {
    let n = plan.n;
    if let Some(bad) = rhs.iter().find(|c| c.len() != n) {
        return Err(SolverError::DimensionMismatch {
            expected: n,
            actual: bad.len(),
        });
    }
    let _span = tracing::debug_span!("triangular_solve", n, nrhs = rhs.len(), ?mode).entered();

    match mode {
        TransposeMode::None => solve_plain(factors, plan, grid, rhs),
        TransposeMode::Transpose => solve_transposed(factors, plan, grid, rhs, false),
        TransposeMode::ConjugateTranspose => {
            solve_transposed(factors, plan, grid, rhs, T::KIND.is_complex())
        }
    }
}

/// `A x = b`: `x = C Q U⁻¹ L⁻¹ P R b`.
fn solve_plain<T: Scalar>(
    factors: &BlockFactors<T>,
    plan: &SymbolicPlan,
    grid: &ProcessGrid,
    rhs: &[Vec<T>],
) -> Result<Vec<Vec<T>>> {
    let p = &factors.partition;
    let nb = p.n_blocks();
    let scaling = &factors.scaling;
    let mut work: Vec<Vec<T>> = rhs
        .iter()
        .map(|b| {
            factors
                .rows
                .iter()
                .map(|&r| b[r] * T::from_real(scaling.row(r)))
                .collect()
        })
        .collect();

    for k in 0..nb {
        let mut partials = vec![vec![T::zero(); p.size(k)]; work.len()];
        for (&(_, j), blk) in factors.lower.range((k, 0)..(k, k)) {
            for (partial, y) in partials.iter_mut().zip(&work) {
                dense::gemv_add(partial, blk, &y[p.range(j)]);
            }
        }
        reduce_partials(grid, &mut partials)?;
        for (y, partial) in work.iter_mut().zip(&partials) {
            let seg = &mut y[p.range(k)];
            for (s, &q) in seg.iter_mut().zip(partial) {
                *s -= q;
            }
            dense::lower_unit_solve(&factors.diagonal[k], seg);
        }
    }

    for k in (0..nb).rev() {
        let mut partials = vec![vec![T::zero(); p.size(k)]; work.len()];
        for (&(_, j), blk) in factors.upper.range((k, k + 1)..(k + 1, 0)) {
            for (partial, y) in partials.iter_mut().zip(&work) {
                dense::gemv_add(partial, blk, &y[p.range(j)]);
            }
        }
        reduce_partials(grid, &mut partials)?;
        for (y, partial) in work.iter_mut().zip(&partials) {
            let seg = &mut y[p.range(k)];
            for (s, &q) in seg.iter_mut().zip(partial) {
                *s -= q;
            }
            dense::upper_solve(&factors.diagonal[k], seg);
        }
    }

    Ok(work
        .into_iter()
        .map(|z| {
            let mut x = vec![T::zero(); plan.n];
            for (new, &old) in plan.col_perm.iter().enumerate() {
                x[old] = z[new] * T::from_real(scaling.col(old));
            }
            x
        })
        .collect())
}

/// `Aᵀ x = b` (or `Aᴴ`): `x = R Pᵀ L⁻ᵀ U⁻ᵀ Qᵀ C b`.
fn solve_transposed<T: Scalar>(
    factors: &BlockFactors<T>,
    plan: &SymbolicPlan,
    grid: &ProcessGrid,
    rhs: &[Vec<T>],
    conjugate: bool,
) -> Result<Vec<Vec<T>>> {
    let p = &factors.partition;
    let nb = p.n_blocks();
    let upper_cols = by_column(&factors.upper, nb);
    let lower_cols = by_column(&factors.lower, nb);
    let scaling = &factors.scaling;
    let mut work: Vec<Vec<T>> = rhs
        .iter()
        .map(|b| {
            plan.col_perm
                .iter()
                .map(|&old| b[old] * T::from_real(scaling.col(old)))
                .collect()
        })
        .collect();

    for k in 0..nb {
        let mut partials = vec![vec![T::zero(); p.size(k)]; work.len()];
        for &(j, blk) in &upper_cols[k] {
            for (partial, y) in partials.iter_mut().zip(&work) {
                dense::gemv_transpose_add(partial, blk, &y[p.range(j)], conjugate);
            }
        }
        reduce_partials(grid, &mut partials)?;
        for (y, partial) in work.iter_mut().zip(&partials) {
            let seg = &mut y[p.range(k)];
            for (s, &q) in seg.iter_mut().zip(partial) {
                *s -= q;
            }
            dense::upper_transpose_solve(&factors.diagonal[k], seg, conjugate);
        }
    }

    for k in (0..nb).rev() {
        let mut partials = vec![vec![T::zero(); p.size(k)]; work.len()];
        for &(j, blk) in &lower_cols[k] {
            for (partial, y) in partials.iter_mut().zip(&work) {
                dense::gemv_transpose_add(partial, blk, &y[p.range(j)], conjugate);
            }
        }
        reduce_partials(grid, &mut partials)?;
        for (y, partial) in work.iter_mut().zip(&partials) {
            let seg = &mut y[p.range(k)];
            for (s, &q) in seg.iter_mut().zip(partial) {
                *s -= q;
            }
            dense::lower_unit_transpose_solve(&factors.diagonal[k], seg, conjugate);
        }
    }

    Ok(work
        .into_iter()
        .map(|w| {
            let mut x = vec![T::zero(); plan.n];
            for (pos, &r) in factors.rows.iter().enumerate() {
                x[r] = w[pos] * T::from_real(scaling.row(r));
            }
            x
        })
        .collect())
}
