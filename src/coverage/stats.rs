use itertools::{Itertools, MinMaxResult};
use serde::{Deserialize, Serialize};

use crate::coverage::CoverageGrid;

pub const COVERED_THRESHOLD: f64 = 0.5;
pub const STRONG_THRESHOLD: f64 = 0.8;

/// Display summary of a grid.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoverageStatistics {
    pub total_points: usize,
    /// Cells with probability above 0.5.
    pub covered_points: usize,
    /// Cells with probability above 0.8.
    pub strong_points: usize,
    pub average_probability: f64,
    pub min_probability: f64,
    pub max_probability: f64,
}

impl CoverageStatistics {
    /// `None` for a grid with no computed cells.
    pub fn from_grid(grid: &CoverageGrid) -> Option<Self> {
        let probabilities: Vec<f64> = grid.cells().map(|p| p.probability).collect();

        let (min_probability, max_probability) = match probabilities.iter().copied().minmax() {
            MinMaxResult::NoElements => return None,
            MinMaxResult::OneElement(p) => (p, p),
            MinMaxResult::MinMax(lo, hi) => (lo, hi),
        };

        let total_points = probabilities.len();
        Some(Self {
            total_points,
            covered_points: probabilities.iter().filter(|p| **p > COVERED_THRESHOLD).count(),
            strong_points: probabilities.iter().filter(|p| **p > STRONG_THRESHOLD).count(),
            average_probability: probabilities.iter().sum::<f64>() / total_points as f64,
            min_probability,
            max_probability,
        })
    }

    pub fn covered_fraction(&self) -> f64 {
        if self.total_points == 0 {
            0.0
        } else {
            self.covered_points as f64 / self.total_points as f64
        }
    }
}
