//! Symbolic analysis for sparse LU factorization.
//!
//! Works on the sparsity pattern only:
//! - maximum transversal for a zero-free diagonal
//! - symmetric fill-reducing ordering
//! - symbolic elimination predicting the patterns of L and U
//! - block partition and block-level pattern for the numeric phase

use std::collections::BTreeSet;

use crate::error::{Result, SolverError};
use crate::scalar::Scalar;
use crate::sparse::CsrMatrix;

use super::ordering::{self, OrderingMethod};

/// Options for the symbolic phase.
#[derive(Debug, Clone)]
pub struct SymbolicOptions {
    pub ordering: OrderingMethod,
    /// Columns per factor block.
    pub block_size: usize,
    /// Fail with `StructuralSingularity` instead of deferring to the
    /// numeric phase.
    pub strict_structure: bool,
}

impl Default for SymbolicOptions {
    fn default() -> Self {
        Self {
            ordering: OrderingMethod::MinimumDegree,
            block_size: 64,
            strict_structure: false,
        }
    }
}

/// Contiguous partition of `0..n` into blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockPartition {
    /// `starts[b]..starts[b + 1]` is block b; `starts.last() == n`.
    pub starts: Vec<usize>,
}

impl BlockPartition {
    pub fn uniform(n: usize, block_size: usize) -> Self {
        let block_size = block_size.max(1);
        let mut starts: Vec<usize> = (0..n).step_by(block_size).collect();
        starts.push(n);
        Self { starts }
    }

    pub fn n_blocks(&self) -> usize {
        self.starts.len() - 1
    }

    pub fn start(&self, block: usize) -> usize {
        self.starts[block]
    }

    pub fn size(&self, block: usize) -> usize {
        self.starts[block + 1] - self.starts[block]
    }

    pub fn range(&self, block: usize) -> std::ops::Range<usize> {
        self.starts[block]..self.starts[block + 1]
    }

    pub fn block_of(&self, index: usize) -> usize {
        self.starts.partition_point(|&s| s <= index) - 1
    }
}

/// Result of symbolic analysis; reusable for any matrix with the same pattern.
#[derive(Debug, Clone)]
pub struct SymbolicPlan {
    pub n: usize,
    /// `row_perm[new] = old` row of the original matrix.
    pub row_perm: Vec<usize>,
    /// `col_perm[new] = old` column of the original matrix.
    pub col_perm: Vec<usize>,
    /// Predicted strictly-lower pattern of L, by column (rows > column).
    pub l_pattern: Vec<Vec<usize>>,
    /// Predicted upper pattern of U including the diagonal, by row.
    pub u_pattern: Vec<Vec<usize>>,
    pub nnz_a: usize,
    pub nnz_l: usize,
    pub nnz_u: usize,
    /// Original columns the transversal could not match.
    pub unmatched_columns: Vec<usize>,
    pub partition: BlockPartition,
    /// Block pattern assuming no row leaves its block row. Pivoting across
    /// block rows can add blocks beyond this prediction.
    ///
    /// Block column K: block rows I > K holding L blocks.
    pub block_lower: Vec<Vec<usize>>,
    /// Block row K: block columns J > K holding U blocks.
    pub block_upper: Vec<Vec<usize>>,
    row_pointers: Vec<usize>,
    col_indices: Vec<usize>,
}

impl SymbolicPlan {
    /// Entries of L and U that are zero in A.
    pub fn fill_count(&self) -> usize {
        (self.nnz_l + self.nnz_u).saturating_sub(self.nnz_a)
    }

    /// Whether this plan was built for the pattern of `a`.
    pub fn matches<T: Scalar>(&self, a: &CsrMatrix<T>) -> bool {
        a.nrows == self.n
            && a.ncols == self.n
            && a.row_pointers == self.row_pointers
            && a.col_indices == self.col_indices
    }

    /// Number of predicted blocks (diagonal + L + U).
    pub fn n_factor_blocks(&self) -> usize {
        self.partition.n_blocks()
            + self.block_lower.iter().map(Vec::len).sum::<usize>()
            + self.block_upper.iter().map(Vec::len).sum::<usize>()
    }
}

/// Run symbolic analysis on the pattern of a square matrix.
pub fn analyze<T: Scalar>(a: &CsrMatrix<T>, options: &SymbolicOptions) -> Result<SymbolicPlan> {
    if a.nrows != a.ncols {
        return Err(SolverError::MalformedInput(format!(
            "matrix must be square, got {}x{}",
            a.nrows, a.ncols
        )));
    }
    let n = a.nrows;
    let _span = tracing::debug_span!("symbolic_analysis", n, nnz = a.nnz()).entered();

    // Step 1: maximum transversal.
    let mut col_rows: Vec<Vec<usize>> = vec![Vec::new(); n];
    for row in 0..n {
        for &col in a.row_pattern(row) {
            col_rows[col].push(row);
        }
    }
    let matching = ordering::maximum_transversal(n, &col_rows);
    let unmatched_columns: Vec<usize> = (0..n).filter(|&j| matching[j].is_none()).collect();
    if let Some(&column) = unmatched_columns.first() {
        if options.strict_structure {
            return Err(SolverError::StructuralSingularity { column });
        }
        tracing::warn!(
            unmatched = unmatched_columns.len(),
            first = column,
            "matrix is structurally singular, deferring to numeric phase"
        );
    }
    let row_of_col = complete_matching(n, &matching);

    // Step 2: symmetric ordering of B + Bᵀ where B(j, :) = A(row_of_col[j], :).
    let mut old_row_to_b = vec![0usize; n];
    for (j, &r) in row_of_col.iter().enumerate() {
        old_row_to_b[r] = j;
    }
    let mut adjacency: Vec<Vec<usize>> = vec![Vec::new(); n];
    for row in 0..n {
        let b_row = old_row_to_b[row];
        for &col in a.row_pattern(row) {
            if col != b_row {
                adjacency[b_row].push(col);
                adjacency[col].push(b_row);
            }
        }
    }
    for nbrs in &mut adjacency {
        nbrs.sort_unstable();
        nbrs.dedup();
    }
    let q = ordering::compute_ordering(&options.ordering, &adjacency)?;

    let row_perm: Vec<usize> = q.iter().map(|&j| row_of_col[j]).collect();
    let col_perm = q;

    // Step 3: symbolic elimination on the permuted pattern.
    let mut row_inv = vec![0usize; n];
    for (new, &old) in row_perm.iter().enumerate() {
        row_inv[old] = new;
    }
    let mut col_inv = vec![0usize; n];
    for (new, &old) in col_perm.iter().enumerate() {
        col_inv[old] = new;
    }
    let mut rows: Vec<Vec<usize>> = vec![Vec::new(); n];
    for row in 0..n {
        let new_row = row_inv[row];
        rows[new_row].extend(a.row_pattern(row).iter().map(|&c| col_inv[c]));
        rows[new_row].push(new_row);
    }
    let (l_pattern, u_pattern) = symbolic_elimination(n, &rows);
    let nnz_l = l_pattern.iter().map(Vec::len).sum();
    let nnz_u = u_pattern.iter().map(Vec::len).sum();

    // Step 4: block quotient and its elimination.
    let partition = BlockPartition::uniform(n, options.block_size);
    let nb = partition.n_blocks();
    let mut block_rows: Vec<Vec<usize>> = vec![Vec::new(); nb];
    for (i, cols) in rows.iter().enumerate() {
        let bi = partition.block_of(i);
        block_rows[bi].extend(cols.iter().map(|&j| partition.block_of(j)));
    }
    let (block_lower, block_upper_incl) = symbolic_elimination(nb, &block_rows);
    let block_upper: Vec<Vec<usize>> = block_upper_incl
        .into_iter()
        .enumerate()
        .map(|(k, cols)| cols.into_iter().filter(|&j| j > k).collect())
        .collect();

    tracing::debug!(nnz_l, nnz_u, blocks = nb, "symbolic analysis complete");

    Ok(SymbolicPlan {
        n,
        row_perm,
        col_perm,
        l_pattern,
        u_pattern,
        nnz_a: a.nnz(),
        nnz_l,
        nnz_u,
        unmatched_columns,
        partition,
        block_lower,
        block_upper,
        row_pointers: a.row_pointers.clone(),
        col_indices: a.col_indices.clone(),
    })
}

/// Pair unmatched columns with unmatched rows in ascending order.
fn complete_matching(n: usize, matching: &[Option<usize>]) -> Vec<usize> {
    let mut row_used = vec![false; n];
    for r in matching.iter().flatten() {
        row_used[*r] = true;
    }
    let mut free_rows = (0..n).filter(|&r| !row_used[r]);
    matching
        .iter()
        .map(|m| match m {
            Some(r) => *r,
            None => free_rows.next().unwrap_or(0),
        })
        .collect()
}

/// Gaussian elimination on a pattern without pivoting.
///
/// `rows[i]` lists the columns of row i (duplicates allowed). Returns the
/// strictly-lower pattern by column and the upper pattern (with diagonal)
/// by row, both sorted.
pub fn symbolic_elimination(n: usize, rows: &[Vec<usize>]) -> (Vec<Vec<usize>>, Vec<Vec<usize>>) {
    let mut row_sets: Vec<BTreeSet<usize>> =
        rows.iter().map(|r| r.iter().copied().collect()).collect();
    let mut col_sets: Vec<BTreeSet<usize>> = vec![BTreeSet::new(); n];
    for (i, set) in row_sets.iter().enumerate() {
        for &j in set.range(..i) {
            col_sets[j].insert(i);
        }
    }

    for k in 0..n {
        let upper: Vec<usize> = row_sets[k].range(k + 1..).copied().collect();
        let lower: Vec<usize> = col_sets[k].iter().copied().collect();
        for &i in &lower {
            for &j in &upper {
                if row_sets[i].insert(j) && i > j {
                    col_sets[j].insert(i);
                }
            }
        }
    }

    let lower = col_sets.into_iter().map(|s| s.into_iter().collect()).collect();
    let upper = row_sets
        .iter()
        .enumerate()
        .map(|(k, s)| s.range(k..).copied().collect())
        .collect();
    (lower, upper)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arrow(n: usize) -> CsrMatrix<f64> {
        // Dense first row and column plus diagonal.
        let mut t = Vec::new();
        for i in 0..n {
            t.push((i, i, 4.0));
            if i > 0 {
                t.push((0, i, 1.0));
                t.push((i, 0, 1.0));
            }
        }
        CsrMatrix::from_triplets(n, n, &t)
    }

    #[test]
    fn elimination_predicts_fill() {
        // [[x, x, 0], [x, x, x]... ] arrow with hub first fills everything.
        let a = arrow(4);
        let plan = analyze(
            &a,
            &SymbolicOptions { ordering: OrderingMethod::Natural, ..Default::default() },
        )
        .unwrap();
        assert_eq!(plan.nnz_l, 6);
        assert_eq!(plan.nnz_u, 10);
        assert_eq!(plan.fill_count(), 16 - a.nnz());
    }

    #[test]
    fn minimum_degree_avoids_arrow_fill() {
        let a = arrow(6);
        let plan = analyze(&a, &SymbolicOptions::default()).unwrap();
        assert_eq!(plan.fill_count(), 0);
        assert_eq!(plan.nnz_l + plan.nnz_u, a.nnz());
    }

    #[test]
    fn analysis_is_deterministic() {
        let a = arrow(7);
        let p1 = analyze(&a, &SymbolicOptions::default()).unwrap();
        let p2 = analyze(&a, &SymbolicOptions::default()).unwrap();
        assert_eq!(p1.row_perm, p2.row_perm);
        assert_eq!(p1.col_perm, p2.col_perm);
        assert_eq!(p1.l_pattern, p2.l_pattern);
        assert_eq!(p1.u_pattern, p2.u_pattern);
    }

    #[test]
    fn transversal_moves_zero_diagonal() {
        // [[0, 1], [1, 0]]
        let a = CsrMatrix::from_triplets(2, 2, &[(0, 1, 1.0), (1, 0, 1.0)]);
        let plan = analyze(
            &a,
            &SymbolicOptions { ordering: OrderingMethod::Natural, ..Default::default() },
        )
        .unwrap();
        let b = a.permute(&plan.row_perm, &plan.col_perm);
        let dense = b.to_dense();
        assert_eq!(dense[0][0], 1.0);
        assert_eq!(dense[1][1], 1.0);
        assert!(plan.unmatched_columns.is_empty());
    }

    #[test]
    fn strict_mode_rejects_structural_singularity() {
        // Column 1 is empty.
        let a = CsrMatrix::from_triplets(2, 2, &[(0, 0, 1.0), (1, 0, 1.0)]);
        let strict = SymbolicOptions { strict_structure: true, ..Default::default() };
        let err = analyze(&a, &strict).unwrap_err();
        assert_eq!(err, SolverError::StructuralSingularity { column: 1 });

        let lenient = analyze(&a, &SymbolicOptions::default()).unwrap();
        assert_eq!(lenient.unmatched_columns, vec![1]);
    }

    #[test]
    fn block_pattern_covers_scalar_pattern() {
        let a = arrow(7);
        let plan = analyze(
            &a,
            &SymbolicOptions { ordering: OrderingMethod::Natural, block_size: 3, ..Default::default() },
        )
        .unwrap();
        assert_eq!(plan.partition.starts, vec![0, 3, 6, 7]);
        for (j, rows) in plan.l_pattern.iter().enumerate() {
            let bj = plan.partition.block_of(j);
            for &i in rows {
                let bi = plan.partition.block_of(i);
                assert!(bi == bj || plan.block_lower[bj].contains(&bi));
            }
        }
        for (i, cols) in plan.u_pattern.iter().enumerate() {
            let bi = plan.partition.block_of(i);
            for &j in cols {
                let bj = plan.partition.block_of(j);
                assert!(bi == bj || plan.block_upper[bi].contains(&bj));
            }
        }
    }

    #[test]
    fn plan_matches_only_same_pattern() {
        let a = arrow(4);
        let plan = analyze(&a, &SymbolicOptions::default()).unwrap();
        let mut scaled = a.clone();
        for v in &mut scaled.values {
            *v *= 3.0;
        }
        assert!(plan.matches(&scaled));
        assert!(!plan.matches(&arrow(5)));
        assert!(!plan.matches(&CsrMatrix::<f64>::new(4, 4)));
    }

    #[test]
    fn partition_lookup() {
        let p = BlockPartition::uniform(5, 2);
        assert_eq!(p.n_blocks(), 3);
        assert_eq!(p.block_of(0), 0);
        assert_eq!(p.block_of(3), 1);
        assert_eq!(p.block_of(4), 2);
        assert_eq!(p.size(2), 1);
        assert_eq!(BlockPartition::uniform(0, 4).n_blocks(), 0);
    }
}
