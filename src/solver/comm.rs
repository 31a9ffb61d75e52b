//! Communication backend abstraction for the distributed factorization.
//!
//! Provides a trait for the collectives the block factorization and the
//! distributed solve need (broadcast, all-gather, reductions) and a no-op
//! single-process implementation.
//!
//! Collectives are synchronous: a call on one rank blocks until every rank of
//! the communicator has issued the matching call. Issuing collectives in a
//! different order on different ranks is a protocol violation that cannot be
//! detected locally. Implementations are not reentrant; `ProcessGrid`
//! serializes access.

use crate::error::{Result, SolverError};

/// Abstraction over inter-process communication for distributed solvers.
///
/// Implementations: `SingleProcessComm` (no-op), `ThreadComm` (in-process
/// threads), `MpiComm` (via mpi crate, `distributed` feature).
pub trait CommunicationBackend: Send + Sync {
    /// This process's rank.
    fn rank(&self) -> usize;

    /// Total number of ranks.
    fn num_ranks(&self) -> usize;

    /// Synchronization barrier.
    fn barrier(&self) -> Result<()>;

    /// Replace `data` on every rank with the contents held by `root`.
    fn broadcast(&self, root: usize, data: &mut Vec<f64>) -> Result<()>;

    /// Collect every rank's `local` payload, indexed by rank.
    fn all_gather(&self, local: &[f64]) -> Result<Vec<Vec<f64>>>;

    /// `all_gather` for index payloads.
    fn all_gather_indices(&self, local: &[usize]) -> Result<Vec<Vec<usize>>>;

    /// Element-wise sum of a vector across all ranks, in place.
    ///
    /// Contributions are added in rank order so every rank ends up with the
    /// same bits.
    fn all_reduce_sum_vec(&self, local: &mut [f64]) -> Result<()> {
        if self.num_ranks() == 1 {
            return Ok(());
        }
        let parts = self.all_gather(local)?;
        local.iter_mut().for_each(|v| *v = 0.0);
        for (rank, part) in parts.iter().enumerate() {
            if part.len() != local.len() {
                return Err(SolverError::Communication(format!(
                    "rank {rank} contributed {} values to a reduction of {}",
                    part.len(),
                    local.len()
                )));
            }
            for (acc, v) in local.iter_mut().zip(part) {
                *acc += v;
            }
        }
        Ok(())
    }

    /// Max of a local scalar across all ranks.
    fn all_reduce_max(&self, local: f64) -> Result<f64> {
        if self.num_ranks() == 1 {
            return Ok(local);
        }
        let parts = self.all_gather(&[local])?;
        Ok(parts.iter().flatten().copied().fold(f64::NEG_INFINITY, f64::max))
    }
}

/// No-op communication backend for single-process execution.
///
/// All operations pass through unchanged.
pub struct SingleProcessComm;

impl CommunicationBackend for SingleProcessComm {
    fn rank(&self) -> usize {
        0
    }

    fn num_ranks(&self) -> usize {
        1
    }

    fn barrier(&self) -> Result<()> {
        Ok(())
    }

    fn broadcast(&self, root: usize, _data: &mut Vec<f64>) -> Result<()> {
        if root != 0 {
            return Err(SolverError::Communication(format!(
                "broadcast root {root} does not exist in a single-process group"
            )));
        }
        Ok(())
    }

    fn all_gather(&self, local: &[f64]) -> Result<Vec<Vec<f64>>> {
        Ok(vec![local.to_vec()])
    }

    fn all_gather_indices(&self, local: &[usize]) -> Result<Vec<Vec<usize>>> {
        Ok(vec![local.to_vec()])
    }
}
