//! In-process communication backend: one thread per rank.
//!
//! Ranks exchange payloads through shared slots guarded by a mutex and two
//! barrier phases per collective (publish, then read). Lets multi-cell
//! process grids run without an MPI installation.

use std::sync::{Arc, Barrier, Mutex};

use super::comm::CommunicationBackend;
use crate::error::{Result, SolverError};

struct Exchange {
    barrier: Barrier,
    words: Mutex<Vec<Vec<f64>>>,
    indices: Mutex<Vec<Vec<usize>>>,
}

/// One rank of an in-process thread group.
pub struct ThreadComm {
    rank: usize,
    size: usize,
    exchange: Arc<Exchange>,
}

fn poisoned<E>(_: E) -> SolverError {
    SolverError::Communication("a participant panicked during an exchange".into())
}

impl ThreadComm {
    /// Create the `size` communicators of one group. Hand one to each thread.
    pub fn group(size: usize) -> Vec<ThreadComm> {
        let size = size.max(1);
        let exchange = Arc::new(Exchange {
            barrier: Barrier::new(size),
            words: Mutex::new(vec![Vec::new(); size]),
            indices: Mutex::new(vec![Vec::new(); size]),
        });
        (0..size)
            .map(|rank| ThreadComm {
                rank,
                size,
                exchange: Arc::clone(&exchange),
            })
            .collect()
    }

    /// Run `f` on `size` scoped threads, one per rank, and collect the
    /// results in rank order.
    pub fn run<F, R>(size: usize, f: F) -> Vec<R>
    where
        F: Fn(ThreadComm) -> R + Sync,
        R: Send,
    {
        let comms = ThreadComm::group(size);
        std::thread::scope(|scope| {
            let handles: Vec<_> = comms
                .into_iter()
                .map(|comm| {
                    let f = &f;
                    scope.spawn(move || f(comm))
                })
                .collect();
            handles
                .into_iter()
                .map(|h| match h.join() {
                    Ok(r) => r,
                    Err(panic) => std::panic::resume_unwind(panic),
                })
                .collect()
        })
    }
}

impl CommunicationBackend for ThreadComm {
    fn rank(&self) -> usize {
        self.rank
    }

    fn num_ranks(&self) -> usize {
        self.size
    }

    fn barrier(&self) -> Result<()> {
        self.exchange.barrier.wait();
        Ok(())
    }

    fn broadcast(&self, root: usize, data: &mut Vec<f64>) -> Result<()> {
        if root >= self.size {
            return Err(SolverError::Communication(format!(
                "broadcast root {root} outside group of {}",
                self.size
            )));
        }
        if self.rank == root {
            let mut slots = self.exchange.words.lock().map_err(poisoned)?;
            slots[root] = data.clone();
        }
        self.exchange.barrier.wait();
        if self.rank != root {
            let slots = self.exchange.words.lock().map_err(poisoned)?;
            *data = slots[root].clone();
        }
        self.exchange.barrier.wait();
        Ok(())
    }

    fn all_gather(&self, local: &[f64]) -> Result<Vec<Vec<f64>>> {
        {
            let mut slots = self.exchange.words.lock().map_err(poisoned)?;
            slots[self.rank] = local.to_vec();
        }
        self.exchange.barrier.wait();
        let gathered = self.exchange.words.lock().map_err(poisoned)?.clone();
        self.exchange.barrier.wait();
        Ok(gathered)
    }

    fn all_gather_indices(&self, local: &[usize]) -> Result<Vec<Vec<usize>>> {
        {
            let mut slots = self.exchange.indices.lock().map_err(poisoned)?;
            slots[self.rank] = local.to_vec();
        }
        self.exchange.barrier.wait();
        let gathered = self.exchange.indices.lock().map_err(poisoned)?.clone();
        self.exchange.barrier.wait();
        Ok(gathered)
    }
}
