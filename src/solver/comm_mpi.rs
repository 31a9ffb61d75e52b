//! MPI communication backend for the distributed factorization.
//!
//! Requires the `distributed` feature flag and an MPI installation.
//! Implements `CommunicationBackend` using `mpi::traits::*` on the world
//! communicator.
//!
//! # Usage
//!
//! The caller must initialize MPI before constructing `MpiComm`:
//!
//! ```ignore
//! let universe = mpi::initialize().expect("MPI init failed");
//! let comm = MpiComm::new();
//! ```

use mpi::datatype::PartitionMut;
use mpi::topology::SimpleCommunicator;
use mpi::traits::*;
use mpi::Count;

use super::comm::CommunicationBackend;
use crate::error::{Result, SolverError};

/// MPI-based communication backend.
///
/// Wraps the MPI world communicator. Requires `mpi::initialize()` to have
/// been called before construction.
pub struct MpiComm;

impl MpiComm {
    /// Create a new MPI communication backend.
    pub fn new() -> Self {
        Self
    }
}

impl Default for MpiComm {
    fn default() -> Self {
        Self::new()
    }
}

/// Variable-length all-gather of plain-old-data values.
fn gather_varcount<V>(world: &SimpleCommunicator, local: &[V]) -> Result<Vec<Vec<V>>>
where
    V: Equivalence + Copy + Default,
{
    let size = world.size() as usize;
    let local_count = Count::try_from(local.len())
        .map_err(|_| SolverError::Communication("payload too large for MPI".into()))?;
    let mut counts = vec![0 as Count; size];
    world.all_gather_into(&local_count, &mut counts[..]);

    let displs: Vec<Count> = counts
        .iter()
        .scan(0 as Count, |acc, &c| {
            let d = *acc;
            *acc += c;
            Some(d)
        })
        .collect();
    let total: usize = counts.iter().map(|&c| c as usize).sum();

    let mut buf = vec![V::default(); total];
    {
        let mut partition = PartitionMut::new(&mut buf[..], &counts[..], &displs[..]);
        world.all_gather_varcount_into(local, &mut partition);
    }

    Ok(counts
        .iter()
        .zip(&displs)
        .map(|(&c, &d)| buf[d as usize..(d + c) as usize].to_vec())
        .collect())
}

impl CommunicationBackend for MpiComm {
    fn rank(&self) -> usize {
        let world = SimpleCommunicator::world();
        world.rank() as usize
    }

    fn num_ranks(&self) -> usize {
        let world = SimpleCommunicator::world();
        world.size() as usize
    }

    fn barrier(&self) -> Result<()> {
        let world = SimpleCommunicator::world();
        world.barrier();
        Ok(())
    }

    fn broadcast(&self, root: usize, data: &mut Vec<f64>) -> Result<()> {
        let world = SimpleCommunicator::world();
        if root >= world.size() as usize {
            return Err(SolverError::Communication(format!(
                "broadcast root {root} outside communicator of {}",
                world.size()
            )));
        }
        let root_process = world.process_at_rank(root as i32);
        let mut len = data.len() as u64;
        root_process.broadcast_into(&mut len);
        data.resize(len as usize, 0.0);
        root_process.broadcast_into(&mut data[..]);
        Ok(())
    }

    fn all_gather(&self, local: &[f64]) -> Result<Vec<Vec<f64>>> {
        let world = SimpleCommunicator::world();
        gather_varcount(&world, local)
    }

    fn all_gather_indices(&self, local: &[usize]) -> Result<Vec<Vec<usize>>> {
        let world = SimpleCommunicator::world();
        let wide: Vec<u64> = local.iter().map(|&i| i as u64).collect();
        let gathered = gather_varcount(&world, &wide)?;
        Ok(gathered
            .into_iter()
            .map(|part| part.into_iter().map(|i| i as usize).collect())
            .collect())
    }
}
