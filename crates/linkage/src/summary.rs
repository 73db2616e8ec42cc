use crate::model::{DecisionCounts, LinkRow, LinkSummary};

/// Compute decision counts per classifier from result rows. A classifier
/// that produced no decisions (disabled) is reported as `None`.
pub fn compute_summary(
    rows: &[LinkRow],
    deterministic: bool,
    probabilistic: bool,
) -> LinkSummary {
    let deterministic = deterministic.then(|| {
        rows.iter()
            .filter_map(|r| r.decision)
            .collect::<DecisionCounts>()
    });
    let probabilistic = probabilistic.then(|| {
        rows.iter()
            .filter_map(|r| r.probabilistic_decision)
            .collect::<DecisionCounts>()
    });

    LinkSummary {
        total_pairs: rows.len(),
        deterministic,
        probabilistic,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CandidatePair, Decision, FeatureVector};

    fn row(decision: Option<Decision>, probabilistic: Option<Decision>) -> LinkRow {
        LinkRow {
            left_id: "1".into(),
            right_id: "10".into(),
            pair: CandidatePair::new(0, 0),
            features: FeatureVector::from_pairs([("sim_last", 1.0)]).unwrap(),
            score: decision.map(|_| 1.0),
            decision,
            probability: probabilistic.map(|_| 0.5),
            probabilistic_decision: probabilistic,
        }
    }

    #[test]
    fn summary_counts() {
        let rows = vec![
            row(Some(Decision::Match), Some(Decision::Match)),
            row(Some(Decision::Match), Some(Decision::NonMatch)),
            row(Some(Decision::Possible), Some(Decision::NonMatch)),
            row(Some(Decision::NonMatch), Some(Decision::NonMatch)),
        ];
        let summary = compute_summary(&rows, true, true);
        assert_eq!(summary.total_pairs, 4);
        let det = summary.deterministic.unwrap();
        assert_eq!(det.matches, 2);
        assert_eq!(det.possible, 1);
        assert_eq!(det.non_matches, 1);
        let prob = summary.probabilistic.unwrap();
        assert_eq!(prob.matches, 1);
        assert_eq!(prob.non_matches, 3);
    }

    #[test]
    fn disabled_classifier_is_absent() {
        let rows = vec![row(Some(Decision::Match), None)];
        let summary = compute_summary(&rows, true, false);
        assert!(summary.deterministic.is_some());
        assert!(summary.probabilistic.is_none());
    }
}
