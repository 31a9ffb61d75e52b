//! Multi-participant factorizations over in-process thread groups.

use std::ops::Range;
use std::sync::Arc;

use approx::assert_abs_diff_eq;
use gridlu::{status, CsrMatrix, Session, ThreadComm};

fn test_matrix(n: usize) -> CsrMatrix<f64> {
    let mut t = Vec::new();
    for i in 0..n {
        let diag = if i % 5 == 2 { 0.1 } else { 4.0 + (i % 7) as f64 * 0.25 };
        t.push((i, i, diag));
        t.push((i, (i + 1) % n, -1.0));
        t.push(((i + 3) % n, i, 0.5 + (i % 3) as f64 * 0.1));
        t.push((i, (i + 9) % n, -0.3));
    }
    CsrMatrix::from_triplets(n, n, &t)
}

fn rows_of(rank: usize, size: usize, n: usize) -> Range<usize> {
    rank * n / size..(rank + 1) * n / size
}

/// 1-based CSR arrays for `rows` of `a`.
fn slice_rows(a: &CsrMatrix<f64>, rows: Range<usize>) -> (Vec<f64>, Vec<i64>, Vec<i64>) {
    let lo = a.row_pointers[rows.start];
    let hi = a.row_pointers[rows.end];
    let values = a.values[lo..hi].to_vec();
    let col_ind = a.col_indices[lo..hi].iter().map(|&c| c as i64 + 1).collect();
    let row_ptr = a.row_pointers[rows.start..=rows.end]
        .iter()
        .map(|&p| (p - lo) as i64 + 1)
        .collect();
    (values, row_ptr, col_ind)
}

/// Factor and solve on `ranks` threads arranged as `grid`; returns the
/// assembled solution for each transpose code.
fn solve_on_grid(a: &CsrMatrix<f64>, b: &[f64], ranks: usize, grid: (i64, i64)) -> Vec<Vec<f64>> {
    let n = a.nrows;
    let pieces = ThreadComm::run(ranks, |comm| {
        let rank = gridlu::CommunicationBackend::rank(&comm);
        let rows = rows_of(rank, ranks, n);
        let mut session = Session::<f64>::new(Arc::new(comm));
        session.options_mut().symbolic.block_size = 5;
        let (values, row_ptr, col_ind) = slice_rows(a, rows.clone());
        let (handle, code) = session.factor(
            n as i64,
            values.len() as i64,
            rows.start as i64 + 1,
            &values,
            &row_ptr,
            &col_ind,
            grid,
        );
        assert_eq!(code, status::SUCCESS);
        let handle = handle.unwrap();
        let local_b = vec![b[rows.clone()].to_vec()];
        let solutions: Vec<Vec<f64>> = [0, 1]
            .into_iter()
            .map(|trans| {
                let (x, code) = session.solve(handle, &local_b, trans);
                assert_eq!(code, status::SUCCESS);
                x.into_iter().next().unwrap()
            })
            .collect();
        assert_eq!(session.free(handle), status::SUCCESS);
        (rows, solutions)
    });

    let mut assembled = vec![vec![0.0; n]; 2];
    for (rows, solutions) in pieces {
        for (full, local) in assembled.iter_mut().zip(solutions) {
            full[rows.clone()].copy_from_slice(&local);
        }
    }
    assembled
}

#[test]
fn every_grid_shape_agrees_with_a_single_participant() {
    let a = test_matrix(37);
    let b: Vec<f64> = (0..37).map(|i| ((i * 7) % 11) as f64 - 5.0).collect();
    let reference = solve_on_grid(&a, &b, 1, (1, 1));

    let ax = a.spmv(&reference[0]);
    for (p, q) in ax.iter().zip(&b) {
        assert_abs_diff_eq!(*p, *q, epsilon = 1e-10);
    }
    let atx = a.spmv_transpose(&reference[1], false);
    for (p, q) in atx.iter().zip(&b) {
        assert_abs_diff_eq!(*p, *q, epsilon = 1e-10);
    }

    for (ranks, grid) in [(2, (1, 2)), (2, (2, 1)), (4, (2, 2))] {
        let got = solve_on_grid(&a, &b, ranks, grid);
        for (mode, (x, r)) in got.iter().zip(&reference).enumerate() {
            for (p, q) in x.iter().zip(r) {
                assert_abs_diff_eq!(*p, *q, epsilon = 1e-10);
            }
            assert_eq!(x.len(), 37, "mode {mode} on {grid:?}");
        }
    }
}

#[test]
fn participants_outside_the_grid_still_take_part() {
    let a = test_matrix(20);
    let b = vec![1.0; 20];
    let reference = solve_on_grid(&a, &b, 1, (1, 1));
    let got = solve_on_grid(&a, &b, 3, (1, 2));
    for (p, q) in got[0].iter().zip(&reference[0]) {
        assert_abs_diff_eq!(*p, *q, epsilon = 1e-10);
    }
}

#[test]
fn grid_larger_than_group_is_rejected_everywhere() {
    let codes = ThreadComm::run(2, |comm| {
        let rank = gridlu::CommunicationBackend::rank(&comm);
        let mut session = Session::<f64>::new(Arc::new(comm));
        let (h, code) = session.factor(2, 1, rank as i64 + 1, &[1.0], &[1, 2], &[rank as i64 + 1], (2, 2));
        assert!(h.is_none());
        code
    });
    assert_eq!(codes, vec![status::INVALID_GRID; 2]);
}

#[test]
fn one_bad_participant_fails_all() {
    let codes = ThreadComm::run(2, |comm| {
        let rank = gridlu::CommunicationBackend::rank(&comm);
        let mut session = Session::<f64>::new(Arc::new(comm));
        // Rank 1 declares a row pointer that overruns its values.
        let row_ptr: &[i64] = if rank == 0 { &[1, 2] } else { &[1, 3] };
        let (h, code) = session.factor(2, 1, rank as i64 + 1, &[2.0], row_ptr, &[rank as i64 + 1], (1, 2));
        assert!(h.is_none());
        assert_eq!(session.registry().live(), 0);
        code
    });
    assert_eq!(codes, vec![status::MALFORMED_INPUT; 2]);
}

#[test]
fn mismatched_local_rhs_fails_on_every_participant() {
    let a = test_matrix(10);
    let codes = ThreadComm::run(2, |comm| {
        let rank = gridlu::CommunicationBackend::rank(&comm);
        let rows = rows_of(rank, 2, 10);
        let mut session = Session::<f64>::new(Arc::new(comm));
        let (values, row_ptr, col_ind) = slice_rows(&a, rows.clone());
        let (h, _) = session.factor(
            10,
            values.len() as i64,
            rows.start as i64 + 1,
            &values,
            &row_ptr,
            &col_ind,
            (2, 1),
        );
        let h = h.unwrap();
        let len = if rank == 0 { rows.len() } else { rows.len() + 1 };
        let (x, code) = session.solve(h, &[vec![1.0; len]], 0);
        assert!(x.is_empty());
        // Still usable after the rejected call.
        let (_, ok) = session.solve(h, &[vec![1.0; rows.len()]], 0);
        (code, ok)
    });
    assert_eq!(
        codes,
        vec![
            (status::MALFORMED_INPUT, status::SUCCESS),
            (status::DIMENSION_MISMATCH, status::SUCCESS)
        ]
    );
}

#[test]
fn pivots_from_other_block_rows_on_every_grid() {
    // Chains of [[1,1,0],[1,1,1],[0,1,1]] that straddle the size-5 blocks.
    // Each chain leaves a zero on the diagonal once its first row is
    // eliminated.
    let n = 24;
    let mut t = Vec::new();
    let mut covered = vec![false; n];
    for start in [3, 8, 13, 18] {
        for (i, j) in [(0, 0), (0, 1), (1, 0), (1, 1), (1, 2), (2, 1), (2, 2)] {
            t.push((start + i, start + j, 1.0));
        }
        covered[start..start + 3].iter_mut().for_each(|c| *c = true);
    }
    for (i, _) in covered.iter().enumerate().filter(|(_, c)| !**c) {
        t.push((i, i, 2.0));
    }
    let a = CsrMatrix::from_triplets(n, n, &t);
    let x_true: Vec<f64> = (0..n).map(|i| (i % 5) as f64 - 2.0).collect();
    let b = a.spmv(&x_true);

    for (ranks, grid) in [(1, (1, 1)), (2, (1, 2)), (4, (2, 2))] {
        // The matrix is symmetric, so both transpose codes give x_true.
        for x in solve_on_grid(&a, &b, ranks, grid) {
            for (got, want) in x.iter().zip(&x_true) {
                assert_abs_diff_eq!(*got, *want, epsilon = 1e-12);
            }
        }
    }
}
