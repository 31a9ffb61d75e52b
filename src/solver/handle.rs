//! Factorization handles and their lifecycle.
//!
//! A `Registry` is a generational arena of factor sets. Callers hold
//! `FactorHandle` tokens, typed by scalar kind so a complex handle cannot be
//! passed to a real registry. Freeing a slot bumps its generation; any token
//! minted before that is stale and rejected with `UseAfterFree`. Every
//! registry also stamps its own id into the tokens it mints, so a token from
//! another registry is rejected the same way.
//!
//! ```text
//! Uninitialized --factor ok--> Ready --solve*--> Ready --free--> Destroyed
//!       |                                                          ^
//!       +--factor err--> Failed --------------free-----------------+
//! ```

use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::factor::{FactorSet, SolveReport};
use super::grid::ProcessGrid;
use super::symbolic::SymbolicPlan;
use super::{Capabilities, SolverOptions, TransposeMode};
use crate::error::{Result, SolverError};
use crate::scalar::Scalar;
use crate::sparse::SparseMatrixBlock;

static NEXT_REGISTRY: AtomicU64 = AtomicU64::new(1);

/// Opaque token naming one registry slot at one generation.
pub struct FactorHandle<T> {
    registry: u64,
    slot: u32,
    generation: u32,
    _kind: PhantomData<fn() -> T>,
}

impl<T> FactorHandle<T> {
    fn new(registry: u64, slot: usize, generation: u32) -> Self {
        Self {
            registry,
            slot: slot as u32,
            generation,
            _kind: PhantomData,
        }
    }

    pub fn slot(&self) -> u32 {
        self.slot
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }
}

impl<T> Clone for FactorHandle<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for FactorHandle<T> {}

impl<T> PartialEq for FactorHandle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.registry == other.registry
            && self.slot == other.slot
            && self.generation == other.generation
    }
}

impl<T> Eq for FactorHandle<T> {}

impl<T> Hash for FactorHandle<T> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.registry.hash(state);
        self.slot.hash(state);
        self.generation.hash(state);
    }
}

impl<T> fmt::Debug for FactorHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FactorHandle({}:{}#{})", self.registry, self.slot, self.generation)
    }
}

/// Externally visible lifecycle state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Uninitialized,
    Ready,
    Failed,
    Destroyed,
}

enum Slot<T> {
    Uninitialized,
    Ready(Box<FactorSet<T>>),
    Failed(SolverError),
    Destroyed,
}

impl<T> Slot<T> {
    fn state(&self) -> HandleState {
        match self {
            Slot::Uninitialized => HandleState::Uninitialized,
            Slot::Ready(_) => HandleState::Ready,
            Slot::Failed(_) => HandleState::Failed,
            Slot::Destroyed => HandleState::Destroyed,
        }
    }
}

struct Entry<T> {
    generation: u32,
    slot: Slot<T>,
}

/// Owner of every factorization created through it.
pub struct Registry<T> {
    id: u64,
    entries: Vec<Entry<T>>,
    free_slots: Vec<usize>,
    capabilities: Capabilities,
}

impl<T: Scalar> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Scalar> Registry<T> {
    pub fn new() -> Self {
        Self::with_capabilities(Capabilities::detect())
    }

    /// Registry that only offers the engines in `capabilities`.
    pub fn with_capabilities(capabilities: Capabilities) -> Self {
        Self {
            id: NEXT_REGISTRY.fetch_add(1, Ordering::Relaxed),
            entries: Vec::new(),
            free_slots: Vec::new(),
            capabilities,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities
    }

    /// Reserve an uninitialized handle.
    pub fn allocate(&mut self) -> FactorHandle<T> {
        if let Some(slot) = self.free_slots.pop() {
            let entry = &mut self.entries[slot];
            entry.slot = Slot::Uninitialized;
            return FactorHandle::new(self.id, slot, entry.generation);
        }
        self.entries.push(Entry {
            generation: 0,
            slot: Slot::Uninitialized,
        });
        FactorHandle::new(self.id, self.entries.len() - 1, 0)
    }

    fn entry(&self, handle: FactorHandle<T>) -> Result<&Entry<T>> {
        if handle.registry != self.id {
            return Err(SolverError::UseAfterFree(format!(
                "{handle:?} belongs to another registry"
            )));
        }
        let entry = self
            .entries
            .get(handle.slot as usize)
            .ok_or_else(|| SolverError::UseAfterFree(format!("{handle:?} was never issued")))?;
        if entry.generation != handle.generation || matches!(entry.slot, Slot::Destroyed) {
            return Err(SolverError::UseAfterFree(format!("{handle:?} has been freed")));
        }
        Ok(entry)
    }

    fn entry_mut(&mut self, handle: FactorHandle<T>) -> Result<&mut Entry<T>> {
        self.entry(handle)?;
        Ok(&mut self.entries[handle.slot as usize])
    }

    pub fn state(&self, handle: FactorHandle<T>) -> HandleState {
        self.entry(handle)
            .map(|e| e.slot.state())
            .unwrap_or(HandleState::Destroyed)
    }

    /// Factor into an uninitialized handle.
    ///
    /// On failure the handle moves to `Failed` and keeps the error; it can
    /// then only be freed.
    pub fn factor(
        &mut self,
        handle: FactorHandle<T>,
        block: &SparseMatrixBlock<T>,
        grid: ProcessGrid,
        options: &SolverOptions,
    ) -> Result<()> {
        self.factor_inner(handle, block, grid, options, None)
    }

    /// `factor` reusing the symbolic analysis of an earlier factorization.
    pub fn factor_with_plan(
        &mut self,
        handle: FactorHandle<T>,
        block: &SparseMatrixBlock<T>,
        grid: ProcessGrid,
        options: &SolverOptions,
        plan: Arc<SymbolicPlan>,
    ) -> Result<()> {
        self.factor_inner(handle, block, grid, options, Some(plan))
    }

    fn factor_inner(
        &mut self,
        handle: FactorHandle<T>,
        block: &SparseMatrixBlock<T>,
        grid: ProcessGrid,
        options: &SolverOptions,
        plan: Option<Arc<SymbolicPlan>>,
    ) -> Result<()> {
        let capabilities = self.capabilities;
        let entry = self.entry_mut(handle)?;
        if !matches!(entry.slot, Slot::Uninitialized) {
            return Err(SolverError::HandleNotReady(format!(
                "{handle:?} is {:?}, factorization needs a fresh handle",
                entry.slot.state()
            )));
        }
        let result = capabilities
            .require(options.backend)
            .and_then(|()| options.validate())
            .and_then(|()| FactorSet::build(block, grid, options, &capabilities, plan));
        match result {
            Ok(set) => {
                entry.slot = Slot::Ready(Box::new(set));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(?handle, error = %e, "factorization failed");
                entry.slot = Slot::Failed(e.clone());
                Err(e)
            }
        }
    }

    /// Allocate and factor in one step. No handle survives a failure.
    pub fn create(
        &mut self,
        block: &SparseMatrixBlock<T>,
        grid: ProcessGrid,
        options: &SolverOptions,
    ) -> Result<FactorHandle<T>> {
        let handle = self.allocate();
        match self.factor(handle, block, grid, options) {
            Ok(()) => Ok(handle),
            Err(e) => {
                self.release(handle.slot as usize);
                Err(e)
            }
        }
    }

    /// The factor set behind a ready handle.
    pub fn get(&self, handle: FactorHandle<T>) -> Result<&FactorSet<T>> {
        match &self.entry(handle)?.slot {
            Slot::Ready(set) => Ok(set.as_ref()),
            Slot::Failed(e) => Err(SolverError::HandleNotReady(format!(
                "{handle:?} failed to factor: {e}"
            ))),
            other => Err(SolverError::HandleNotReady(format!(
                "{handle:?} is {:?}",
                other.state()
            ))),
        }
    }

    /// The error a failed handle recorded.
    pub fn failure(&self, handle: FactorHandle<T>) -> Option<&SolverError> {
        match &self.entry(handle).ok()?.slot {
            Slot::Failed(e) => Some(e),
            _ => None,
        }
    }

    /// Symbolic plan of a ready handle, for `factor_with_plan`.
    pub fn plan(&self, handle: FactorHandle<T>) -> Result<Option<Arc<SymbolicPlan>>> {
        Ok(self.get(handle)?.plan())
    }

    /// Solve with global-length right-hand-side columns.
    pub fn solve(
        &self,
        handle: FactorHandle<T>,
        rhs: &[Vec<T>],
        mode: TransposeMode,
    ) -> Result<(Vec<Vec<T>>, SolveReport)> {
        self.get(handle)?.solve(rhs, mode)
    }

    /// Solve with this participant's rows of each column.
    pub fn solve_distributed(
        &self,
        handle: FactorHandle<T>,
        local_rhs: &[Vec<T>],
        mode: TransposeMode,
    ) -> Result<(Vec<Vec<T>>, SolveReport)> {
        self.get(handle)?.solve_distributed(local_rhs, mode)
    }

    /// Release the factors and grid behind a handle.
    pub fn free(&mut self, handle: FactorHandle<T>) -> Result<()> {
        self.entry(handle)?;
        self.release(handle.slot as usize);
        tracing::debug!(?handle, "handle freed");
        Ok(())
    }

    /// Drop a handle whose factorization the caller is abandoning. Handles
    /// this registry does not know are ignored.
    pub(crate) fn discard(&mut self, handle: FactorHandle<T>) {
        if self.entry(handle).is_ok() {
            self.release(handle.slot as usize);
        }
    }

    fn release(&mut self, slot: usize) {
        let entry = &mut self.entries[slot];
        entry.slot = Slot::Destroyed;
        entry.generation = entry.generation.wrapping_add(1);
        self.free_slots.push(slot);
    }

    /// Handles that are allocated and not yet freed.
    pub fn live(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| !matches!(e.slot, Slot::Destroyed))
            .count()
    }
}
