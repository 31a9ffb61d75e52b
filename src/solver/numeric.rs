//! Numeric block LU factorization over a 2-D block-cyclic process grid.
//!
//! Right-looking elimination on the block partition of a `SymbolicPlan`,
//! applied to the equilibrated matrix. Each block column is factored as one
//! tall panel, so threshold partial pivoting sees every remaining row of the
//! column and interchanges may cross block rows. Rows moved that way are
//! exchanged between owners, and blocks the symbolic pattern did not predict
//! are created as fill arrives. Diagonal blocks and the row order are
//! replicated on every participant; off-diagonal blocks live only on their
//! owner.

use std::collections::{BTreeMap, BTreeSet};

use rayon::prelude::*;

use super::dense::{self, DenseBlock};
use super::grid::ProcessGrid;
use super::scaling::Scaling;
use super::symbolic::{BlockPartition, SymbolicPlan};
use crate::error::{Phase, Result, SolverError};
use crate::scalar::{decode_values, encode_values, Scalar};
use crate::sparse::{check_coverage, Compression, CsrMatrix, SparseMatrixBlock};

/// Numeric knobs for one factorization.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NumericOptions {
    /// Diagonal candidate kept when `|a_kk| >= threshold * max_i |a_ik|`.
    pub pivot_threshold: f64,
    /// Lift nonzero pivots below `sqrt(eps) * ‖A‖₁` to that floor.
    pub replace_tiny_pivots: bool,
    /// Row and column equilibration before factoring.
    pub equilibrate: bool,
}

impl Default for NumericOptions {
    fn default() -> Self {
        Self {
            pivot_threshold: 1.0,
            replace_tiny_pivots: false,
            equilibrate: true,
        }
    }
}

/// This participant's share of the factors.
#[derive(Debug, Clone)]
pub struct BlockFactors<T> {
    pub partition: BlockPartition,
    /// Every factored diagonal block as packed L\U, replicated.
    pub diagonal: Vec<DenseBlock<T>>,
    /// Owned L blocks keyed by (block row, block column), row > column.
    pub lower: BTreeMap<(usize, usize), DenseBlock<T>>,
    /// Owned U blocks keyed by (block row, block column), row < column.
    pub upper: BTreeMap<(usize, usize), DenseBlock<T>>,
    /// `rows[i]` is the original row eliminated at position `i`.
    pub rows: Vec<usize>,
    pub scaling: Scaling,
    /// First exactly-zero pivot in elimination order, as a 0-based original
    /// column index.
    pub singular_position: Option<usize>,
    pub tiny_pivots: usize,
    /// Rows an interchange moved into another block row.
    pub cross_block_swaps: usize,
    /// max |U| / max |R A C|.
    pub pivot_growth: f64,
}

impl<T: Scalar> BlockFactors<T> {
    pub fn n_blocks(&self) -> usize {
        self.partition.n_blocks()
    }

    /// Number of off-diagonal blocks held by this participant.
    pub fn owned_blocks(&self) -> usize {
        self.lower.len() + self.upper.len()
    }
}

/// Assemble the global matrix from every participant's local block.
///
/// Collective. Every participant receives the same matrix, or the same error.
pub fn gather_global_matrix<T: Scalar>(
    block: &SparseMatrixBlock<T>,
    grid: &ProcessGrid,
) -> Result<CsrMatrix<T>> {
    let comm = grid.comm();
    if comm.num_ranks() == 1 {
        return block.to_global();
    }

    let compression = match block.compression() {
        Compression::Row => 0,
        Compression::Column => 1,
    };
    let meta = comm.all_gather_indices(&[
        block.n_global(),
        compression,
        block.local_offset(),
        block.n_local(),
        block.nnz(),
    ])?;
    let n = meta[0][0];
    let mut ranges = Vec::with_capacity(meta.len());
    for (rank, m) in meta.iter().enumerate() {
        if m.len() != 5 {
            return Err(SolverError::Communication(format!(
                "rank {rank} sent malformed block metadata"
            )));
        }
        if m[0] != n {
            return Err(SolverError::MalformedInput(format!(
                "rank {rank} declares dimension {} but rank 0 declares {n}",
                m[0]
            )));
        }
        if m[1] != compression {
            return Err(SolverError::MalformedInput(
                "participants mix row and column compressed blocks".into(),
            ));
        }
        ranges.push((m[2], m[3]));
    }
    check_coverage(&ranges, n)?;

    let triplets = block.global_triplets();
    let coords: Vec<usize> = triplets.iter().flat_map(|&(r, c, _)| [r, c]).collect();
    let mut words = Vec::new();
    let values: Vec<T> = triplets.iter().map(|t| t.2).collect();
    encode_values(&values, &mut words);

    let all_coords = comm.all_gather_indices(&coords)?;
    let all_words = comm.all_gather(&words)?;

    let total: usize = meta.iter().map(|m| m[4]).sum();
    let mut global = Vec::with_capacity(total);
    for (rank, (c, w)) in all_coords.iter().zip(&all_words).enumerate() {
        let count = meta[rank][4];
        let (vals, _) = decode_values::<T>(w, count)
            .filter(|_| c.len() == 2 * count)
            .ok_or_else(|| {
                SolverError::Communication(format!("rank {rank} sent a truncated matrix block"))
            })?;
        global.extend(c.chunks_exact(2).zip(vals).map(|(rc, v)| (rc[0], rc[1], v)));
    }
    Ok(CsrMatrix::from_triplets(n, n, &global))
}

/// Copy the entries of `b` falling into the blocks owned here. Owned
/// diagonal blocks always exist, even when structurally empty.
fn distribute<T: Scalar>(
    b: &CsrMatrix<T>,
    partition: &BlockPartition,
    grid: &ProcessGrid,
) -> BTreeMap<(usize, usize), DenseBlock<T>> {
    let mut work: BTreeMap<(usize, usize), DenseBlock<T>> = BTreeMap::new();
    for k in 0..partition.n_blocks() {
        if grid.owns(k, k) {
            work.insert((k, k), DenseBlock::zeros(partition.size(k), partition.size(k)));
        }
    }
    for row in 0..b.nrows {
        let bi = partition.block_of(row);
        let li = row - partition.start(bi);
        for idx in b.row_pointers[row]..b.row_pointers[row + 1] {
            let col = b.col_indices[idx];
            let bj = partition.block_of(col);
            if grid.owns(bi, bj) {
                work.entry((bi, bj))
                    .or_insert_with(|| DenseBlock::zeros(partition.size(bi), partition.size(bj)))
                    .add(li, col - partition.start(bj), b.values[idx]);
            }
        }
    }
    work
}

fn payload_error(what: &str) -> SolverError {
    SolverError::Communication(format!("malformed {what} payload"))
}

fn take<'a>(words: &'a [f64], cursor: &mut usize, count: usize) -> Result<&'a [f64]> {
    let slice = words
        .get(*cursor..*cursor + count)
        .ok_or_else(|| payload_error("panel"))?;
    *cursor += count;
    Ok(slice)
}

/// Share `(id, block)` pairs with every participant. Block `id` has shape
/// `shape(id)`.
fn share_blocks<T: Scalar>(
    blocks: Vec<(usize, DenseBlock<T>)>,
    grid: &ProcessGrid,
    shape: impl Fn(usize) -> Option<(usize, usize)>,
) -> Result<BTreeMap<usize, DenseBlock<T>>> {
    let mut ids = Vec::with_capacity(blocks.len());
    let mut words = Vec::new();
    for (id, blk) in &blocks {
        ids.push(*id);
        encode_values(&blk.data, &mut words);
    }
    let all_ids = grid.comm().all_gather_indices(&ids)?;
    let all_words = grid.comm().all_gather(&words)?;

    let mut shared = BTreeMap::new();
    for (ids, words) in all_ids.iter().zip(&all_words) {
        let mut offset = 0;
        for &id in ids {
            let (nrows, ncols) = shape(id).ok_or_else(|| payload_error("block"))?;
            let (data, used) = decode_values::<T>(words.get(offset..).unwrap_or_default(), nrows * ncols)
                .ok_or_else(|| payload_error("block"))?;
            offset += used;
            shared.insert(id, DenseBlock { nrows, ncols, data });
        }
    }
    Ok(shared)
}

/// One factored block column.
struct Panel<T> {
    diagonal: DenseBlock<T>,
    /// L blocks below the diagonal, by block row.
    lower: BTreeMap<usize, DenseBlock<T>>,
    /// Interchanges as pairs of elimination positions, in order.
    swaps: Vec<(usize, usize)>,
    zero_pivots: Vec<usize>,
    tiny_replaced: usize,
}

/// Factor block column `k`.
///
/// The column's blocks are gathered, the owner of the diagonal block
/// factors them stacked as one tall panel, so every row of the column is a
/// pivot candidate, and the result is broadcast.
fn factor_panel<T: Scalar>(
    k: usize,
    work: &mut BTreeMap<(usize, usize), DenseBlock<T>>,
    partition: &BlockPartition,
    grid: &ProcessGrid,
    options: &NumericOptions,
    tiny: Option<f64>,
) -> Result<Panel<T>> {
    let nb = partition.n_blocks();
    let width = partition.size(k);
    let keys: Vec<(usize, usize)> = work
        .keys()
        .filter(|&&(i, j)| j == k && i >= k)
        .copied()
        .collect();
    let owned: Vec<(usize, DenseBlock<T>)> = keys
        .into_iter()
        .filter_map(|key| work.remove(&key).map(|blk| (key.0, blk)))
        .collect();
    let mut column = share_blocks(owned, grid, |i| {
        (i >= k && i < nb).then(|| (partition.size(i), width))
    })?;
    column
        .entry(k)
        .or_insert_with(|| DenseBlock::zeros(width, width));

    let ids: Vec<usize> = column.keys().copied().collect();
    let height: usize = ids.iter().map(|&i| partition.size(i)).sum();
    let owner = grid.owner(k, k);
    let mut words = Vec::new();
    if grid.rank() == owner {
        let blocks: Vec<&DenseBlock<T>> = column.values().collect();
        let mut stacked = DenseBlock::stack(&blocks);
        let outcome = dense::lu_in_place(&mut stacked, options.pivot_threshold, tiny);
        words.extend(outcome.pivots.iter().map(|&p| p as f64));
        words.push(outcome.zero_pivots.len() as f64);
        words.extend(outcome.zero_pivots.iter().map(|&p| p as f64));
        words.push(outcome.tiny_replaced as f64);
        encode_values(&stacked.data, &mut words);
    }
    grid.comm().broadcast(owner, &mut words)?;

    let mut cursor = 0;
    let pivots: Vec<usize> = take(&words, &mut cursor, width)?
        .iter()
        .map(|&p| p as usize)
        .collect();
    let n_zero = take(&words, &mut cursor, 1)?[0] as usize;
    let zero_pivots: Vec<usize> = take(&words, &mut cursor, n_zero)?
        .iter()
        .map(|&p| p as usize)
        .collect();
    let tiny_replaced = take(&words, &mut cursor, 1)?[0] as usize;
    let (data, _) = decode_values::<T>(
        take(&words, &mut cursor, height * width * T::PARTS)?,
        height * width,
    )
    .ok_or_else(|| payload_error("panel"))?;
    if pivots.iter().any(|&p| p >= height) {
        return Err(payload_error("panel pivot"));
    }
    let stacked = DenseBlock {
        nrows: height,
        ncols: width,
        data,
    };

    let positions: Vec<usize> = ids.iter().flat_map(|&i| partition.range(i)).collect();
    let swaps = pivots
        .iter()
        .enumerate()
        .map(|(c, &q)| (positions[c], positions[q]))
        .collect();
    let mut lower = BTreeMap::new();
    let mut diagonal = None;
    let mut top = 0;
    for &i in &ids {
        let blk = stacked.rows(top, partition.size(i));
        top += partition.size(i);
        if i == k {
            diagonal = Some(blk);
        } else {
            lower.insert(i, blk);
        }
    }
    let diagonal = diagonal.ok_or_else(|| payload_error("panel"))?;
    Ok(Panel {
        diagonal,
        lower,
        swaps,
        zero_pivots,
        tiny_replaced,
    })
}

/// Carry the panel's row interchanges into every other block column.
///
/// Rows that move between block rows usually change owner, so each moved
/// row segment is shared and rewritten at its destination. Returns the
/// number of rows that changed block row.
fn exchange_rows<T: Scalar>(
    work: &mut BTreeMap<(usize, usize), DenseBlock<T>>,
    swaps: &[(usize, usize)],
    k: usize,
    partition: &BlockPartition,
    grid: &ProcessGrid,
) -> Result<usize> {
    // source[d]: position whose row ends up at position d.
    let mut source: BTreeMap<usize, usize> = BTreeMap::new();
    for &(a, b) in swaps {
        if a == b {
            continue;
        }
        let sa = source.get(&a).copied().unwrap_or(a);
        let sb = source.get(&b).copied().unwrap_or(b);
        source.insert(a, sb);
        source.insert(b, sa);
    }
    source.retain(|d, s| *d != *s);
    if source.is_empty() {
        return Ok(0);
    }
    let crossing = source
        .iter()
        .filter(|&(&d, &s)| partition.block_of(d) != partition.block_of(s))
        .count();

    let nb = partition.n_blocks();
    let touched: BTreeSet<usize> = source.keys().map(|&d| partition.block_of(d)).collect();
    let mut ids = Vec::new();
    let mut words = Vec::new();
    for &bi in &touched {
        let range = partition.range(bi);
        for (&(_, bj), blk) in work.range((bi, 0)..(bi + 1, 0)) {
            if bj == k {
                continue;
            }
            for &row in source.keys().filter(|&&r| range.contains(&r)) {
                ids.push(row);
                ids.push(bj);
                encode_values(&blk.row(row - range.start), &mut words);
            }
        }
    }
    let all_ids = grid.comm().all_gather_indices(&ids)?;
    let all_words = grid.comm().all_gather(&words)?;

    let mut incoming: BTreeMap<(usize, usize), Vec<T>> = BTreeMap::new();
    for (ids, words) in all_ids.iter().zip(&all_words) {
        let mut offset = 0;
        for pair in ids.chunks_exact(2) {
            let (row, bj) = (pair[0], pair[1]);
            if bj >= nb {
                return Err(payload_error("row exchange"));
            }
            let (vals, used) =
                decode_values::<T>(words.get(offset..).unwrap_or_default(), partition.size(bj))
                    .ok_or_else(|| payload_error("row exchange"))?;
            offset += used;
            incoming.insert((row, bj), vals);
        }
    }

    for (&dest, &src) in &source {
        let bi = partition.block_of(dest);
        let local = dest - partition.start(bi);
        let mut cols: BTreeSet<usize> = incoming
            .range((src, 0)..(src + 1, 0))
            .map(|(&(_, j), _)| j)
            .filter(|&j| grid.owns(bi, j))
            .collect();
        cols.extend(work.range((bi, 0)..(bi + 1, 0)).map(|(&(_, j), _)| j));
        for j in cols.into_iter().filter(|&j| j != k) {
            match incoming.get(&(src, j)) {
                Some(vals) => work
                    .entry((bi, j))
                    .or_insert_with(|| DenseBlock::zeros(partition.size(bi), partition.size(j)))
                    .set_row(local, vals),
                None => {
                    if let Some(blk) = work.get_mut(&(bi, j)) {
                        blk.set_row(local, &vec![T::zero(); partition.size(j)]);
                    }
                }
            }
        }
    }
    Ok(crossing)
}

/// Block LU of the equilibrated, permuted matrix described by `plan`.
///
/// Collective over the grid's communicator. Each block column is factored
/// as a tall panel with threshold partial pivoting over all of its rows, so
/// a zero pivot is only reported when the whole remaining column is zero.
/// Exactly-zero pivots are recorded in `singular_position`, not reported as
/// errors.
pub fn factorize<T: Scalar>(
    a: &CsrMatrix<T>,
    plan: &SymbolicPlan,
    grid: &ProcessGrid,
    options: &NumericOptions,
) -> Result<BlockFactors<T>> {
    if !plan.matches(a) {
        return Err(SolverError::MalformedInput(
            "symbolic plan was built for a different sparsity pattern".into(),
        ));
    }
    let partition = plan.partition.clone();
    let nb = partition.n_blocks();
    let _span = tracing::info_span!("numeric_factorization", n = plan.n, blocks = nb).entered();

    let scaling = if options.equilibrate {
        Scaling::compute(a)
    } else {
        Scaling::none()
    };
    let scaled = scaling.apply(a);
    let b = scaled.permute(&plan.row_perm, &plan.col_perm);
    let tiny = options
        .replace_tiny_pivots
        .then(|| T::epsilon().sqrt() * scaled.norm_one())
        .filter(|&floor| floor > 0.0);
    let mut work = distribute(&b, &partition, grid);

    let mut order: Vec<usize> = (0..plan.n).collect();
    let mut diagonal = Vec::with_capacity(nb);
    let mut singular_position = None;
    let mut tiny_pivots = 0;
    let mut cross_block_swaps = 0;

    for k in 0..nb {
        let panel = factor_panel(k, &mut work, &partition, grid, options, tiny)?;
        if panel
            .diagonal
            .data
            .iter()
            .chain(panel.lower.values().flat_map(|l| l.data.iter()))
            .any(|v| !v.is_finite_val())
        {
            return Err(SolverError::PhaseFailure {
                phase: Phase::Numeric,
                message: format!("non-finite entries in factored block column {k}"),
            });
        }
        if let Some(&local) = panel.zero_pivots.first() {
            let column = plan.col_perm[partition.start(k) + local];
            tracing::warn!(block = k, column, "exactly zero pivot");
            singular_position.get_or_insert(column);
        }
        if panel.tiny_replaced > 0 {
            tracing::warn!(block = k, replaced = panel.tiny_replaced, "tiny pivots replaced");
        }
        tiny_pivots += panel.tiny_replaced;

        for &(p, q) in &panel.swaps {
            order.swap(p, q);
        }
        let crossed = exchange_rows(&mut work, &panel.swaps, k, &partition, grid)?;
        cross_block_swaps += crossed;

        for (&i, blk) in &panel.lower {
            if grid.owns(i, k) {
                work.insert((i, k), blk.clone());
            }
        }
        let u_keys: Vec<(usize, usize)> = work
            .range((k, k + 1)..(k + 1, 0))
            .map(|(&key, _)| key)
            .collect();
        let mut u_owned = Vec::with_capacity(u_keys.len());
        for key in u_keys {
            if let Some(blk) = work.get_mut(&key) {
                dense::solve_unit_lower_left(&panel.diagonal, blk);
                u_owned.push((key.1, blk.clone()));
            }
        }
        let u_panel = share_blocks(u_owned, grid, |j| {
            (j > k && j < nb).then(|| (partition.size(k), partition.size(j)))
        })?;
        let l_panel = &panel.lower;

        for &i in l_panel.keys() {
            for &j in u_panel.keys() {
                if grid.owns(i, j) {
                    work.entry((i, j))
                        .or_insert_with(|| DenseBlock::zeros(partition.size(i), partition.size(j)));
                }
            }
        }
        work.par_iter_mut()
            .filter(|((i, j), _)| *i > k && *j > k)
            .for_each(|((i, j), c)| {
                if let (Some(l), Some(u)) = (l_panel.get(i), u_panel.get(j)) {
                    dense::gemm_sub(c, l, u);
                }
            });

        tracing::debug!(
            block = k,
            panel_l = l_panel.len(),
            panel_u = u_panel.len(),
            crossed,
            "block step complete"
        );
        diagonal.push(panel.diagonal);
    }

    let mut lower = BTreeMap::new();
    let mut upper = BTreeMap::new();
    for ((i, j), blk) in work {
        match i.cmp(&j) {
            std::cmp::Ordering::Greater => {
                lower.insert((i, j), blk);
            }
            std::cmp::Ordering::Less => {
                upper.insert((i, j), blk);
            }
            std::cmp::Ordering::Equal => {}
        }
    }

    let diag_u_max = diagonal
        .iter()
        .map(|d| {
            (0..d.ncols)
                .flat_map(|j| (0..=j).map(move |i| (i, j)))
                .map(|(i, j)| d.get(i, j).abs_val())
                .fold(0.0, f64::max)
        })
        .fold(0.0, f64::max);
    let owned_u_max = upper.values().map(DenseBlock::max_abs).fold(0.0, f64::max);
    let u_max = grid.comm().all_reduce_max(diag_u_max.max(owned_u_max))?;
    let a_max = scaled.max_abs();
    let pivot_growth = if a_max > 0.0 { u_max / a_max } else { 1.0 };
    let rows = order.iter().map(|&pos| plan.row_perm[pos]).collect();

    tracing::debug!(pivot_growth, tiny_pivots, cross_block_swaps, "numeric factorization complete");

    Ok(BlockFactors {
        partition,
        diagonal,
        lower,
        upper,
        rows,
        scaling,
        singular_position,
        tiny_pivots,
        cross_block_swaps,
        pivot_growth,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::comm::SingleProcessComm;
    use crate::solver::comm_thread::ThreadComm;
    use crate::solver::grid::GridShape;
    use crate::solver::ordering::OrderingMethod;
    use crate::solver::symbolic::{analyze, SymbolicOptions};
    use approx::assert_abs_diff_eq;
    use std::sync::Arc;

    fn single_grid() -> ProcessGrid {
        ProcessGrid::init(GridShape::single(), Arc::new(SingleProcessComm)).unwrap()
    }

    fn natural(block_size: usize) -> SymbolicOptions {
        SymbolicOptions {
            ordering: OrderingMethod::Natural,
            block_size,
            ..Default::default()
        }
    }

    /// Rebuild L·U from the blocks of a factorization. `lower` and `upper`
    /// may be merged from several participants.
    fn reconstruct(f: &BlockFactors<f64>, n: usize) -> Vec<Vec<f64>> {
        let p = &f.partition;
        let mut l = vec![vec![0.0; n]; n];
        let mut u = vec![vec![0.0; n]; n];
        for (k, d) in f.diagonal.iter().enumerate() {
            let s = p.start(k);
            for j in 0..d.ncols {
                for i in 0..d.nrows {
                    if i > j {
                        l[s + i][s + j] = d.get(i, j);
                    } else {
                        u[s + i][s + j] = d.get(i, j);
                    }
                }
                l[s + j][s + j] = 1.0;
            }
        }
        for (&(bi, bj), blk) in &f.lower {
            for i in 0..blk.nrows {
                for j in 0..blk.ncols {
                    l[p.start(bi) + i][p.start(bj) + j] = blk.get(i, j);
                }
            }
        }
        for (&(bi, bj), blk) in &f.upper {
            for i in 0..blk.nrows {
                for j in 0..blk.ncols {
                    u[p.start(bi) + i][p.start(bj) + j] = blk.get(i, j);
                }
            }
        }
        (0..n)
            .map(|i| (0..n).map(|j| (0..n).map(|k| l[i][k] * u[k][j]).sum()).collect())
            .collect()
    }

    /// Row `i` of the result is original row `rows[i]` of `R A C`, columns
    /// in elimination order.
    fn pivoted(a: &CsrMatrix<f64>, plan: &SymbolicPlan, f: &BlockFactors<f64>) -> Vec<Vec<f64>> {
        let scaled = f.scaling.apply(a).to_dense();
        f.rows
            .iter()
            .map(|&r| plan.col_perm.iter().map(|&c| scaled[r][c]).collect())
            .collect()
    }

    fn assert_factors_reproduce(a: &CsrMatrix<f64>, plan: &SymbolicPlan, f: &BlockFactors<f64>) {
        let n = a.nrows;
        let lu = reconstruct(f, n);
        let pb = pivoted(a, plan, f);
        for i in 0..n {
            for j in 0..n {
                assert_abs_diff_eq!(lu[i][j], pb[i][j], epsilon = 1e-12);
            }
        }
    }

    fn test_matrix() -> CsrMatrix<f64> {
        // Needs pivoting inside the first block.
        CsrMatrix::from_triplets(
            4,
            4,
            &[
                (0, 0, 1e-3),
                (0, 1, 2.0),
                (1, 0, 3.0),
                (1, 1, 1.0),
                (1, 3, 1.0),
                (2, 1, 1.0),
                (2, 2, 4.0),
                (3, 0, 1.0),
                (3, 3, 5.0),
            ],
        )
    }

    /// Unit diagonal except for `[[1,1,0],[1,1,1],[0,1,1]]` on the last
    /// three rows. Eliminating the first of those rows leaves a zero on the
    /// diagonal that only a row further down can fix.
    fn trailing_coupling(n: usize) -> CsrMatrix<f64> {
        let m = n - 3;
        let mut t: Vec<(usize, usize, f64)> = (0..m).map(|i| (i, i, 1.0)).collect();
        for (i, j) in [(0, 0), (0, 1), (1, 0), (1, 1), (1, 2), (2, 1), (2, 2)] {
            t.push((m + i, m + j, 1.0));
        }
        CsrMatrix::from_triplets(n, n, &t)
    }

    #[test]
    fn factors_reproduce_pivoted_matrix() {
        let a = test_matrix();
        let plan = analyze(&a, &natural(2)).unwrap();
        let f = factorize(&a, &plan, &single_grid(), &NumericOptions::default()).unwrap();
        assert!(f.singular_position.is_none());
        assert_factors_reproduce(&a, &plan, &f);
    }

    #[test]
    fn pivot_search_crosses_block_rows() {
        let a = trailing_coupling(65);
        let plan = analyze(&a, &natural(64)).unwrap();
        assert_eq!(plan.partition.n_blocks(), 2);
        let f = factorize(&a, &plan, &single_grid(), &NumericOptions::default()).unwrap();
        assert_eq!(f.singular_position, None);
        assert_eq!(f.cross_block_swaps, 2);
        assert_eq!(&f.rows[62..], &[62, 64, 63]);
        assert_factors_reproduce(&a, &plan, &f);
    }

    #[test]
    fn cross_block_rows_are_exchanged_between_owners() {
        let a = trailing_coupling(7);
        let plan = analyze(&a, &natural(2)).unwrap();
        let reference = factorize(&a, &plan, &single_grid(), &NumericOptions::default()).unwrap();
        assert_eq!(reference.singular_position, None);
        assert_factors_reproduce(&a, &plan, &reference);

        let parts = ThreadComm::run(4, |comm| {
            let grid = ProcessGrid::init(GridShape::new(2, 2), Arc::new(comm)).unwrap();
            factorize(&a, &plan, &grid, &NumericOptions::default()).unwrap()
        });
        let mut merged = parts[0].clone();
        for f in &parts {
            assert_eq!(f.rows, reference.rows);
            assert_eq!(f.singular_position, None);
            assert_eq!(f.cross_block_swaps, reference.cross_block_swaps);
            merged.lower.extend(f.lower.clone());
            merged.upper.extend(f.upper.clone());
        }
        assert_factors_reproduce(&a, &plan, &merged);
    }

    #[test]
    fn zero_pivot_is_flagged_not_fatal() {
        // Third row is a copy of the first: numerically singular.
        let a = CsrMatrix::from_triplets(
            3,
            3,
            &[
                (0, 0, 1.0),
                (0, 1, 1.0),
                (1, 1, 2.0),
                (2, 0, 1.0),
                (2, 1, 1.0),
                (2, 2, 0.0),
            ],
        );
        let plan = analyze(&a, &natural(4)).unwrap();
        let f = factorize(&a, &plan, &single_grid(), &NumericOptions::default()).unwrap();
        assert_eq!(f.singular_position, Some(2));
    }

    #[test]
    fn mismatched_plan_is_rejected() {
        let a = test_matrix();
        let plan = analyze(&a, &natural(2)).unwrap();
        let other = CsrMatrix::from_triplets(4, 4, &[(0, 0, 1.0), (1, 1, 1.0), (2, 2, 1.0), (3, 3, 1.0)]);
        let err = factorize(&other, &plan, &single_grid(), &NumericOptions::default()).unwrap_err();
        assert!(matches!(err, SolverError::MalformedInput(_)));
    }

    #[test]
    fn grid_factorization_matches_single_process() {
        let a = test_matrix();
        let plan = analyze(&a, &natural(1)).unwrap();
        let reference = factorize(&a, &plan, &single_grid(), &NumericOptions::default()).unwrap();

        let parts = ThreadComm::run(4, |comm| {
            let grid = ProcessGrid::init(GridShape::new(2, 2), Arc::new(comm)).unwrap();
            factorize(&a, &plan, &grid, &NumericOptions::default()).unwrap()
        });
        for f in &parts {
            assert_abs_diff_eq!(f.pivot_growth, reference.pivot_growth, epsilon = 1e-12);
            assert_eq!(f.rows, reference.rows);
            for (d, r) in f.diagonal.iter().zip(&reference.diagonal) {
                for (x, y) in d.data.iter().zip(&r.data) {
                    assert_abs_diff_eq!(*x, *y, epsilon = 1e-12);
                }
            }
        }
    }

    #[test]
    fn equilibration_is_recorded_and_can_be_disabled() {
        let a = CsrMatrix::from_triplets(2, 2, &[(0, 0, 1e8), (0, 1, 1e8), (1, 0, 1.0), (1, 1, 3.0)]);
        let plan = analyze(&a, &natural(2)).unwrap();
        let f = factorize(&a, &plan, &single_grid(), &NumericOptions::default()).unwrap();
        assert!(f.scaling.rows.is_some());
        assert_factors_reproduce(&a, &plan, &f);

        let opts = NumericOptions { equilibrate: false, ..Default::default() };
        let f = factorize(&a, &plan, &single_grid(), &opts).unwrap();
        assert!(f.scaling.is_identity());
        assert_factors_reproduce(&a, &plan, &f);
    }

    #[test]
    fn tiny_pivots_are_replaced_and_counted() {
        let a = CsrMatrix::from_triplets(2, 2, &[(0, 0, 1e-30), (1, 1, 1.0)]);
        let plan = analyze(&a, &natural(2)).unwrap();
        // Equilibration would rescale the tiny entry to one.
        let opts = NumericOptions {
            replace_tiny_pivots: true,
            equilibrate: false,
            ..Default::default()
        };
        let f = factorize(&a, &plan, &single_grid(), &opts).unwrap();
        assert_eq!(f.tiny_pivots, 1);
        assert!(f.diagonal[0].get(0, 0) > 1e-10);
    }

    #[test]
    fn gathered_matrix_is_identical_on_every_rank() {
        let a = test_matrix();
        let mats = ThreadComm::run(2, |comm| {
            let grid = ProcessGrid::init(GridShape::new(1, 2), Arc::new(comm)).unwrap();
            let rows = if grid.rank() == 0 { 0..3 } else { 3..4 };
            let mut ptr = vec![0];
            let mut idx = Vec::new();
            let mut val = Vec::new();
            for r in rows.clone() {
                for k in a.row_pointers[r]..a.row_pointers[r + 1] {
                    idx.push(a.col_indices[k]);
                    val.push(a.values[k]);
                }
                ptr.push(idx.len());
            }
            let block = SparseMatrixBlock::from_csr(4, rows.start, val, idx, ptr).unwrap();
            gather_global_matrix(&block, &grid).unwrap()
        });
        assert_eq!(mats[0], a);
        assert_eq!(mats[1], a);
    }

    #[test]
    fn gaps_between_blocks_are_malformed() {
        let errs = ThreadComm::run(2, |comm| {
            let grid = ProcessGrid::init(GridShape::new(1, 2), Arc::new(comm)).unwrap();
            // Both ranks claim row 0 of a 2x2 matrix.
            let block = SparseMatrixBlock::from_csr(2, 0, vec![1.0], vec![0], vec![0, 1]).unwrap();
            gather_global_matrix(&block, &grid).unwrap_err()
        });
        assert!(errs.iter().all(|e| matches!(e, SolverError::MalformedInput(_))));
    }
}
