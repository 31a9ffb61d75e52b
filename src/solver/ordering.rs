//! Structural orderings used by symbolic analysis.
//!
//! A maximum transversal gives a row permutation with a zero-free diagonal;
//! a symmetric fill-reducing ordering is then chosen on the pattern of
//! B + Bᵀ. Both work on the sparsity pattern only.

use crate::error::{Result, SolverError};
use std::collections::BTreeSet;

/// Fill-reducing column ordering strategy.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum OrderingMethod {
    /// Keep the input order.
    Natural,
    /// Greedy minimum external degree on the symmetrized pattern.
    #[default]
    MinimumDegree,
    /// Caller-supplied permutation, `perm[new] = old`.
    Supplied(Vec<usize>),
}

/// Compute a maximum matching between columns and rows.
///
/// `col_rows[j]` lists the rows with a structural nonzero in column j.
/// Returns `row_of_col[j]`, `None` for columns left unmatched.
pub fn maximum_transversal(n: usize, col_rows: &[Vec<usize>]) -> Vec<Option<usize>> {
    let mut col_match: Vec<Option<usize>> = vec![None; n];
    let mut row_match: Vec<Option<usize>> = vec![None; n];

    // Cheap pass: take any free row.
    for (col, rows) in col_rows.iter().enumerate() {
        if let Some(&row) = rows.iter().find(|&&r| row_match[r].is_none()) {
            row_match[row] = Some(col);
            col_match[col] = Some(row);
        }
    }

    let mut visited = vec![usize::MAX; n];
    for col in 0..n {
        if col_match[col].is_none() {
            augment(col, col_rows, &mut row_match, &mut col_match, &mut visited);
        }
    }
    col_match
}

/// Depth-first search for an augmenting path starting at unmatched `root`.
fn augment(
    root: usize,
    col_rows: &[Vec<usize>],
    row_match: &mut [Option<usize>],
    col_match: &mut [Option<usize>],
    visited: &mut [usize],
) -> bool {
    // stack[k] = (column, next candidate position); via[k] is the row that
    // led from stack[k] to stack[k + 1].
    let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
    let mut via: Vec<usize> = Vec::new();

    while let Some(top) = stack.last_mut() {
        let (col, pos) = *top;
        if pos == col_rows[col].len() {
            stack.pop();
            via.pop();
            continue;
        }
        top.1 += 1;
        let row = col_rows[col][pos];
        if visited[row] == root {
            continue;
        }
        visited[row] = root;
        match row_match[row] {
            None => {
                row_match[row] = Some(col);
                col_match[col] = Some(row);
                for (k, &r) in via.iter().enumerate().rev() {
                    let c = stack[k].0;
                    row_match[r] = Some(c);
                    col_match[c] = Some(r);
                }
                return true;
            }
            Some(next_col) => {
                via.push(row);
                stack.push((next_col, 0));
            }
        }
    }
    false
}

/// Check that `perm` is a permutation of `0..n`.
pub fn validate_permutation(perm: &[usize], n: usize) -> Result<()> {
    if perm.len() != n {
        return Err(SolverError::MalformedInput(format!(
            "ordering has length {}, expected {}",
            perm.len(),
            n
        )));
    }
    let mut seen = vec![false; n];
    for &p in perm {
        if p >= n || seen[p] {
            return Err(SolverError::MalformedInput(format!(
                "ordering is not a permutation (entry {p})"
            )));
        }
        seen[p] = true;
    }
    Ok(())
}

/// Symmetric ordering `perm[new] = old` for the given adjacency lists.
///
/// `adjacency[i]` must be symmetric and may contain `i` itself.
pub fn compute_ordering(method: &OrderingMethod, adjacency: &[Vec<usize>]) -> Result<Vec<usize>> {
    let n = adjacency.len();
    match method {
        OrderingMethod::Natural => Ok((0..n).collect()),
        OrderingMethod::Supplied(perm) => {
            validate_permutation(perm, n)?;
            Ok(perm.clone())
        }
        OrderingMethod::MinimumDegree => Ok(minimum_degree(adjacency)),
    }
}

/// Greedy minimum degree on the elimination graph.
///
/// Eliminating a node turns its neighbourhood into a clique. Ties go to the
/// lowest index so the result is deterministic.
pub fn minimum_degree(adjacency: &[Vec<usize>]) -> Vec<usize> {
    let n = adjacency.len();
    let mut graph: Vec<BTreeSet<usize>> = adjacency
        .iter()
        .enumerate()
        .map(|(i, nbrs)| nbrs.iter().copied().filter(|&j| j != i).collect())
        .collect();

    let mut queue: BTreeSet<(usize, usize)> =
        graph.iter().enumerate().map(|(i, g)| (g.len(), i)).collect();
    let mut order = Vec::with_capacity(n);

    while let Some((_, node)) = queue.pop_first() {
        order.push(node);
        let neighbours = std::mem::take(&mut graph[node]);
        for &u in &neighbours {
            queue.remove(&(graph[u].len(), u));
            graph[u].remove(&node);
            for &w in &neighbours {
                if w != u {
                    graph[u].insert(w);
                }
            }
            queue.insert((graph[u].len(), u));
        }
    }
    order
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transversal_finds_perfect_matching() {
        // Pattern [[0, x], [x, x]]: column 0 only has row 1.
        let col_rows = vec![vec![1], vec![0, 1]];
        let m = maximum_transversal(2, &col_rows);
        assert_eq!(m, vec![Some(1), Some(0)]);
    }

    #[test]
    fn transversal_needs_augmenting_path() {
        // Cheap pass gives col0->row0, then col1 only has row0 and must
        // push col0 to row1.
        let col_rows = vec![vec![0, 1], vec![0]];
        let m = maximum_transversal(2, &col_rows);
        assert_eq!(m, vec![Some(1), Some(0)]);
    }

    #[test]
    fn transversal_reports_structural_singularity() {
        // Two columns that only touch row 0.
        let col_rows = vec![vec![0], vec![0], vec![2]];
        let m = maximum_transversal(3, &col_rows);
        assert_eq!(m.iter().filter(|c| c.is_none()).count(), 1);
        assert_eq!(m[2], Some(2));
    }

    #[test]
    fn minimum_degree_eliminates_arrow_tip_last() {
        // Arrow: node 0 connected to all others.
        let n = 5;
        let mut adj = vec![Vec::new(); n];
        for i in 1..n {
            adj[0].push(i);
            adj[i].push(0);
        }
        let order = minimum_degree(&adj);
        assert_eq!(order.len(), n);
        // The hub only becomes cheap once a single spoke is left.
        let hub_step = order.iter().position(|&v| v == 0).unwrap();
        assert!(hub_step >= n - 2, "hub eliminated at step {hub_step}");
    }

    #[test]
    fn supplied_ordering_is_validated() {
        let adj = vec![vec![0], vec![1], vec![2]];
        assert_eq!(
            compute_ordering(&OrderingMethod::Supplied(vec![2, 0, 1]), &adj).unwrap(),
            vec![2, 0, 1]
        );
        assert!(compute_ordering(&OrderingMethod::Supplied(vec![0, 0, 1]), &adj).is_err());
        assert!(compute_ordering(&OrderingMethod::Supplied(vec![0, 1]), &adj).is_err());
    }
}
