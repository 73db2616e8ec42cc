use serde::Serialize;

use crate::decision::Thresholds;
use crate::error::LinkError;
use crate::model::DecisionCounts;

/// Decision counts for one candidate match threshold.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SweepRow {
    pub match_threshold: f64,
    pub possible_threshold: f64,
    #[serde(flatten)]
    pub counts: DecisionCounts,
}

impl SweepRow {
    pub fn total(&self) -> usize {
        self.counts.total()
    }
}

/// Re-decide every existing score under each candidate match threshold.
///
/// Rows come back in the order of `match_thresholds`. Inputs are not
/// modified; every row accounts for every score exactly once.
pub fn sweep(
    scores: &[f64],
    match_thresholds: &[f64],
    possible_threshold: f64,
) -> Result<Vec<SweepRow>, LinkError> {
    match_thresholds
        .iter()
        .map(|&match_threshold| {
            let thresholds = Thresholds::new(match_threshold, possible_threshold)?;
            let counts: DecisionCounts = scores.iter().map(|&s| thresholds.decide(s)).collect();
            Ok(SweepRow {
                match_threshold,
                possible_threshold,
                counts,
            })
        })
        .collect()
}
