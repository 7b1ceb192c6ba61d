//! Manifest partitioning and per-batch bookkeeping.

use chrono::{DateTime, Local};
use std::ops::Range;
use std::time::Duration;

/// Split `len` manifest entries into contiguous, order-preserving ranges of
/// at most `batch_size` entries.
pub fn plan_batches(len: usize, batch_size: usize) -> Vec<Range<usize>> {
    let batch_size = batch_size.max(1);
    (0..len)
        .step_by(batch_size)
        .map(|start| start..(start + batch_size).min(len))
        .collect()
}

/// Outcome of one batch
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    /// 1-based batch number
    pub number: usize,

    /// Slice of the manifest this batch covered
    pub files: Range<usize>,

    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub success: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn size(&self) -> usize {
        self.files.len()
    }

    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time).to_std().unwrap_or_default()
    }
}

/// Aggregate result of importing a whole manifest
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub duration: Duration,
    pub batches: Vec<BatchReport>,
}

impl ImportSummary {
    /// Every manifest entry ended up in exactly one of the two counters.
    pub fn is_balanced(&self) -> bool {
        self.success + self.failed == self.total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_batches_covers_manifest_once() {
        for len in 0..25 {
            for batch_size in 1..8 {
                let batches = plan_batches(len, batch_size);
                assert_eq!(batches.len(), len.div_ceil(batch_size));

                let flattened: Vec<usize> = batches.iter().cloned().flatten().collect();
                assert_eq!(flattened, (0..len).collect::<Vec<_>>());
                assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= batch_size));
            }
        }
    }

    #[test]
    fn test_plan_batches_last_batch_is_short() {
        assert_eq!(plan_batches(7, 3), vec![0..3, 3..6, 6..7]);
    }

    #[test]
    fn test_plan_batches_zero_size_degrades_to_one() {
        assert_eq!(plan_batches(2, 0), vec![0..1, 1..2]);
    }

    #[test]
    fn test_summary_balance() {
        let summary = ImportSummary {
            total: 3,
            success: 2,
            failed: 1,
            ..Default::default()
        };
        assert!(summary.is_balanced());
    }
}
