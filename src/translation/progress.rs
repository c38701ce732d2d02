/*!
 * Progress aggregation over a session's chunks.
 */

use serde::{Deserialize, Serialize};

use crate::database::models::{ChunkRecord, ChunkStatus};

/// Snapshot of a session's chunk counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub completed: usize,
    pub failed: usize,
    /// Pending plus processing
    pub pending: usize,
    pub total: usize,
    /// Whole-number percentage; 0 only when nothing is completed and 100
    /// only when everything is
    pub percent: u8,
}

impl Progress {
    /// Aggregate a set of chunk statuses
    pub fn from_statuses<I>(statuses: I) -> Self
    where
        I: IntoIterator<Item = ChunkStatus>,
    {
        let mut progress = Progress::default();
        for status in statuses {
            progress.total += 1;
            match status {
                ChunkStatus::Completed => progress.completed += 1,
                ChunkStatus::Failed => progress.failed += 1,
                ChunkStatus::Pending | ChunkStatus::Processing => progress.pending += 1,
            }
        }
        progress.percent = Self::percent_of(progress.completed, progress.total);
        progress
    }

    /// Aggregate chunk records
    pub fn from_chunks(chunks: &[ChunkRecord]) -> Self {
        Self::from_statuses(chunks.iter().map(|c| c.status))
    }

    fn percent_of(completed: usize, total: usize) -> u8 {
        if total == 0 || completed == 0 {
            return 0;
        }
        if completed >= total {
            return 100;
        }
        let rounded = ((completed as f64 / total as f64) * 100.0).round() as u8;
        rounded.clamp(1, 99)
    }

    /// Whether every chunk is completed
    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

impl std::fmt::Display for Progress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}% ({}/{} completed, {} failed, {} pending)",
            self.percent, self.completed, self.total, self.failed, self.pending
        )
    }
}
