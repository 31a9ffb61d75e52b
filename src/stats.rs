//! Per-factorization statistics: phase timings and factor counters.

use std::fmt::Write as _;
use std::time::{Duration, Instant};

/// Collects phase timings and counters for one factorization.
///
/// Filled in by the factorization pipeline and kept with the factors, so a
/// caller can inspect it for as long as the handle is alive.
#[derive(Debug, Clone)]
pub struct FactorStats {
    total_start: Instant,
    phases: Vec<(&'static str, Duration)>,
    pub n: usize,
    pub nnz_a: usize,
    pub nnz_l: usize,
    pub nnz_u: usize,
    pub fill: usize,
    pub blocks: usize,
    /// Off-diagonal blocks held by this participant.
    pub owned_blocks: usize,
    pub tiny_pivots: usize,
    /// Rows pivoting moved into another block row.
    pub cross_block_swaps: usize,
    pub equilibrated: bool,
    /// max |U| / max |A|.
    pub pivot_growth: f64,
}

impl Default for FactorStats {
    fn default() -> Self {
        Self::new()
    }
}

impl FactorStats {
    pub fn new() -> Self {
        Self {
            total_start: Instant::now(),
            phases: Vec::new(),
            n: 0,
            nnz_a: 0,
            nnz_l: 0,
            nnz_u: 0,
            fill: 0,
            blocks: 0,
            owned_blocks: 0,
            tiny_pivots: 0,
            cross_block_swaps: 0,
            equilibrated: false,
            pivot_growth: 1.0,
        }
    }

    /// Record a completed phase with its duration.
    pub fn add_phase(&mut self, name: &'static str, duration: Duration) {
        self.phases.push((name, duration));
    }

    /// Duration of the named phase, if it was recorded.
    pub fn phase(&self, name: &str) -> Option<Duration> {
        self.phases.iter().find(|(n, _)| *n == name).map(|(_, d)| *d)
    }

    pub fn phases(&self) -> &[(&'static str, Duration)] {
        &self.phases
    }

    /// `1 / pivot_growth`; small values flag an unstable factorization.
    pub fn reciprocal_pivot_growth(&self) -> f64 {
        if self.pivot_growth > 0.0 {
            1.0 / self.pivot_growth
        } else {
            f64::INFINITY
        }
    }

    /// Render the stats table.
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "=== gridlu factorization stats ===");
        for (name, dur) in &self.phases {
            let _ = writeln!(out, "  {:<24} {:>8.3}s", name, dur.as_secs_f64());
        }
        let _ = writeln!(out, "  Dimension:              {}", self.n);
        let _ = writeln!(
            out,
            "  Nonzeros:               A={}  L={}  U={}  fill={}",
            self.nnz_a, self.nnz_l, self.nnz_u, self.fill
        );
        let _ = writeln!(out, "  Blocks:                 {} (owned off-diagonal {})", self.blocks, self.owned_blocks);
        let _ = writeln!(out, "  Pivot growth:           {:.3e}", self.pivot_growth);
        if self.tiny_pivots > 0 {
            let _ = writeln!(out, "  Tiny pivots replaced:   {}", self.tiny_pivots);
        }
        if self.cross_block_swaps > 0 {
            let _ = writeln!(out, "  Rows moved across blocks: {}", self.cross_block_swaps);
        }
        if self.equilibrated {
            let _ = writeln!(out, "  Equilibrated:           yes");
        }
        let _ = writeln!(out, "  ─────────────────────────────────");
        let _ = write!(out, "  Total:                  {:>8.3}s", self.total_start.elapsed().as_secs_f64());
        out
    }

    /// Emit the counters as one tracing event.
    pub fn log(&self) {
        tracing::info!(
            n = self.n,
            nnz_l = self.nnz_l,
            nnz_u = self.nnz_u,
            fill = self.fill,
            blocks = self.blocks,
            tiny_pivots = self.tiny_pivots,
            cross_block_swaps = self.cross_block_swaps,
            equilibrated = self.equilibrated,
            pivot_growth = self.pivot_growth,
            "factorization stats"
        );
    }
}
