//! Logical 2-D process grid.
//!
//! Maps the first `nprow * npcol` ranks of a communicator onto a row-major
//! grid and assigns factor blocks to grid cells block-cyclically. Ranks
//! beyond the grid own nothing but still take part in every collective.

use std::sync::{Arc, Mutex, MutexGuard};

use super::comm::CommunicationBackend;
use crate::error::{Result, SolverError};

/// Requested grid dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridShape {
    pub nprow: usize,
    pub npcol: usize,
}

impl GridShape {
    pub fn new(nprow: usize, npcol: usize) -> Self {
        Self { nprow, npcol }
    }

    /// Degenerate 1×1 grid.
    pub fn single() -> Self {
        Self::new(1, 1)
    }

    pub fn size(&self) -> usize {
        self.nprow * self.npcol
    }
}

impl Default for GridShape {
    fn default() -> Self {
        Self::single()
    }
}

/// A process grid bound to a communication context.
///
/// The communicator is never mutated after creation. Collectives issued
/// through it must not interleave, so callers take `exclusive()` around any
/// sequence of collectives.
pub struct ProcessGrid {
    shape: GridShape,
    comm: Arc<dyn CommunicationBackend>,
    exclusive: Mutex<()>,
}

impl ProcessGrid {
    /// Validate the shape against the communicator and build the grid.
    pub fn init(shape: GridShape, comm: Arc<dyn CommunicationBackend>) -> Result<Self> {
        if shape.nprow == 0 || shape.npcol == 0 {
            return Err(SolverError::InvalidGrid(format!(
                "grid dimensions must be positive, got {}x{}",
                shape.nprow, shape.npcol
            )));
        }
        if shape.size() > comm.num_ranks() {
            return Err(SolverError::InvalidGrid(format!(
                "{}x{} grid needs {} processes, communicator has {}",
                shape.nprow,
                shape.npcol,
                shape.size(),
                comm.num_ranks()
            )));
        }
        tracing::debug!(
            nprow = shape.nprow,
            npcol = shape.npcol,
            rank = comm.rank(),
            "process grid initialized"
        );
        Ok(Self {
            shape,
            comm,
            exclusive: Mutex::new(()),
        })
    }

    pub fn shape(&self) -> GridShape {
        self.shape
    }

    pub fn rank(&self) -> usize {
        self.comm.rank()
    }

    pub fn num_ranks(&self) -> usize {
        self.comm.num_ranks()
    }

    pub fn comm(&self) -> &dyn CommunicationBackend {
        self.comm.as_ref()
    }

    /// Grid coordinates of this rank, `None` when it lies outside the grid.
    pub fn coords(&self) -> Option<(usize, usize)> {
        let rank = self.rank();
        (rank < self.shape.size()).then(|| (rank / self.shape.npcol, rank % self.shape.npcol))
    }

    /// Rank owning block (bi, bj) under the 2-D block-cyclic layout.
    pub fn owner(&self, bi: usize, bj: usize) -> usize {
        (bi % self.shape.nprow) * self.shape.npcol + (bj % self.shape.npcol)
    }

    pub fn owns(&self, bi: usize, bj: usize) -> bool {
        self.owner(bi, bj) == self.rank()
    }

    /// Make a locally detected failure collective.
    ///
    /// Every participant must call this with its own validation result before
    /// the first data collective. If any participant failed, all of them
    /// return an error: the failing ones their own, the rest a
    /// `MalformedInput` naming the lowest failing rank.
    pub fn agree<R>(&self, local: Result<R>) -> Result<R> {
        let comm = self.comm();
        let flag = if local.is_err() { (comm.num_ranks() - comm.rank()) as f64 } else { 0.0 };
        let worst = comm.all_reduce_max(flag)?;
        match local {
            Err(e) => Err(e),
            Ok(_) if worst > 0.0 => {
                let rank = comm.num_ranks() - worst as usize;
                Err(SolverError::MalformedInput(format!(
                    "participant {rank} rejected its input"
                )))
            }
            Ok(v) => Ok(v),
        }
    }

    /// Serialize collective sequences issued through this grid.
    pub fn exclusive(&self) -> Result<MutexGuard<'_, ()>> {
        self.exclusive
            .lock()
            .map_err(|_| SolverError::Communication("grid lock poisoned".into()))
    }
}

impl std::fmt::Debug for ProcessGrid {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessGrid")
            .field("shape", &self.shape())
            .field("rank", &self.rank())
            .finish()
    }
}

impl Drop for ProcessGrid {
    fn drop(&mut self) {
        tracing::debug!(rank = self.comm.rank(), "process grid released");
    }
}
